//! Wall-clock accounting per tracer phase.

use std::time::{Duration, Instant};

use crate::counters::RayCountSnapshot;

/// Timed phases of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Total,
    GenPrimaryRays,
    Filter,
    Schedule,
    Adapter,
    Shuffle,
    Send,
    Vote,
    Composite,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Total,
        Phase::GenPrimaryRays,
        Phase::Filter,
        Phase::Schedule,
        Phase::Adapter,
        Phase::Shuffle,
        Phase::Send,
        Phase::Vote,
        Phase::Composite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Total => "total",
            Phase::GenPrimaryRays => "gen-primary",
            Phase::Filter => "filter",
            Phase::Schedule => "schedule",
            Phase::Adapter => "adapter",
            Phase::Shuffle => "shuffle",
            Phase::Send => "send",
            Phase::Vote => "vote",
            Phase::Composite => "composite",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Accumulated time per [`Phase`] across frames.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    times: [Duration; 9],
    frames: u32,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and charge its wall time to `phase`.
    pub fn time<T>(&mut self, phase: Phase, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.add(phase, start.elapsed());
        out
    }

    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        self.times[phase.index()] += elapsed;
    }

    pub fn get(&self, phase: Phase) -> Duration {
        self.times[phase.index()]
    }

    pub fn end_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Log per-phase averages and the frame's ray counts.
    pub fn log_summary(&self, rank: usize, counts: &RayCountSnapshot) {
        let frames = self.frames.max(1);
        let total = self.get(Phase::Total).as_secs_f64() * 1000.0 / frames as f64;

        log::info!(
            "rank {}: {} frame(s), {:.2} ms/frame; rays produced {} traced {} sent {} received {} dropped {} completed {} continued {}",
            rank,
            self.frames,
            total,
            counts.produced,
            counts.traced,
            counts.sent,
            counts.received,
            counts.dropped,
            counts.completed,
            counts.continued
        );
        for phase in Phase::ALL.iter().skip(1) {
            let ms = self.get(*phase).as_secs_f64() * 1000.0 / frames as f64;
            if ms > 0.0 {
                let percent = if total > 0.0 { ms * 100.0 / total } else { 0.0 };
                log::info!("rank {}:   {:<12} {:>9.3} ms ({:.1}%)", rank, phase.name(), ms, percent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_accumulates() {
        let mut profiler = Profiler::new();
        let value = profiler.time(Phase::Adapter, || {
            std::thread::sleep(Duration::from_millis(2));
            7
        });
        profiler.add(Phase::Adapter, Duration::from_millis(1));

        assert_eq!(value, 7);
        assert!(profiler.get(Phase::Adapter) >= Duration::from_millis(3));
        assert_eq!(profiler.get(Phase::Send), Duration::ZERO);
    }

    #[test]
    fn test_phase_indices_match_table() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }
}
