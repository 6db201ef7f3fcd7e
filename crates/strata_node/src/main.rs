//! Strata node: render the reference grid scene across ranks.
//!
//! In-process cluster:
//!     strata_node [--config render.json] [--ranks 4] [--output out.png]
//!
//! One rank of a TCP cluster (run once per address):
//!     strata_node --rank 1 --peers 10.0.0.1:7000,10.0.0.2:7000 [--config render.json]

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use strata_comm::{fatal, TcpTransport};
use strata_core::{Film, OwnershipTable, RenderOptions, Scene};
use strata_tracer::{run_local_cluster, Node, NodeReport, SphereAdapterFactory};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line arguments.
#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    output: Option<String>,
    ranks: Option<usize>,
    rank: Option<usize>,
    peers: Vec<SocketAddr>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        while let Some(flag) = args.next() {
            let mut value = || args.next().ok_or_else(|| anyhow!("{} needs a value", flag));
            match flag.as_str() {
                "--config" => parsed.config = Some(value()?),
                "--output" => parsed.output = Some(value()?),
                "--ranks" => parsed.ranks = Some(value()?.parse().context("--ranks")?),
                "--rank" => parsed.rank = Some(value()?.parse().context("--rank")?),
                "--peers" => {
                    parsed.peers = value()?
                        .split(',')
                        .map(|addr| addr.trim().parse().with_context(|| format!("peer address {}", addr)))
                        .collect::<Result<_>>()?
                }
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => bail!("unknown argument {}", other),
            }
        }
        if parsed.rank.is_some() && parsed.peers.is_empty() {
            bail!("--rank needs --peers");
        }
        Ok(parsed)
    }
}

fn print_usage() {
    eprintln!("Usage: strata_node [--config FILE] [--output PATH] [--ranks N]");
    eprintln!("       strata_node --rank R --peers ADDR,ADDR,... [--config FILE] [--output PATH]");
}

/// Write a composited frame; frames after the first get a numeric suffix.
fn save_frame(output: &str, frame: u32, frames: u32, film: &Film) -> Result<()> {
    let path = if frames > 1 {
        let path = Path::new(output);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("png");
        path.with_file_name(format!("{}_{:04}.{}", stem, frame, ext))
    } else {
        Path::new(output).to_path_buf()
    };

    let image = image::RgbaImage::from_raw(film.width, film.height, film.to_rgba())
        .ok_or_else(|| anyhow!("film size does not match {}x{}", film.width, film.height))?;
    image
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    log::info!("wrote frame {} to {}", frame, path.display());
    Ok(())
}

fn make_node(rank: usize, options: &RenderOptions, scene: &Arc<Scene>, ownership: &Arc<OwnershipTable>) -> Node {
    let factory = SphereAdapterFactory::new(Arc::clone(scene), options.seed);
    let node = Node::new(options.clone(), Arc::clone(scene), Arc::clone(ownership), Box::new(factory));
    if rank != 0 {
        return node;
    }

    let output = options.output.clone();
    let frames = options.num_frames;
    node.on_frame(move |frame, film| {
        if let Err(e) = save_frame(&output, frame, frames, film) {
            log::error!("{:#}", e);
        }
    })
}

fn log_report(report: &NodeReport) {
    for frame in &report.frames {
        log::info!(
            "rank {}: frame {}: {} iterations, {} produced, {} completed, {} dropped",
            report.rank,
            frame.frame,
            frame.iterations,
            frame.counts.produced,
            frame.counts.completed,
            frame.counts.dropped
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse(env::args().skip(1))?;
    let mut options = match &args.config {
        Some(path) => RenderOptions::from_json_file(path).with_context(|| format!("loading {}", path))?,
        None => RenderOptions::default(),
    };
    if let Some(output) = &args.output {
        options.output = output.clone();
    }

    let size = match args.rank {
        Some(_) => args.peers.len(),
        None => args.ranks.unwrap_or(1).max(1),
    };
    let scene = Arc::new(Scene::grid(options.domain_grid));
    let ownership = Arc::new(OwnershipTable::round_robin(scene.domain_count(), size));
    log::info!(
        "scene: {} domains over {} rank(s), {}x{} @ {} spp",
        scene.domain_count(),
        size,
        options.width,
        options.height,
        options.samples_per_pixel
    );

    let reports = match args.rank {
        Some(rank) => {
            let transport = TcpTransport::connect(rank, &args.peers, CONNECT_TIMEOUT)
                .with_context(|| format!("connecting rank {} to {} peers", rank, args.peers.len()))?;
            let report = make_node(rank, &options, &scene, &ownership)
                .run(transport)
                .unwrap_or_else(|e| fatal(&format!("rank {}", rank), &e));
            vec![report]
        }
        None => run_local_cluster(size, |rank| make_node(rank, &options, &scene, &ownership))
            .unwrap_or_else(|e| fatal("local cluster", &e)),
    };

    for report in &reports {
        log_report(report);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_local_cluster() {
        let args = parse(&["--ranks", "4", "--output", "out.png"]).unwrap();
        assert_eq!(args.ranks, Some(4));
        assert_eq!(args.output.as_deref(), Some("out.png"));
        assert!(args.rank.is_none());
    }

    #[test]
    fn test_parse_tcp_rank() {
        let args = parse(&["--rank", "1", "--peers", "127.0.0.1:7000, 127.0.0.1:7001"]).unwrap();
        assert_eq!(args.rank, Some(1));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.peers[1].port(), 7001);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--rank", "0"]).is_err());
        assert!(parse(&["--ranks"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--peers", "not-an-address"]).is_err());
    }

    #[test]
    fn test_save_frame_names() {
        let dir = env::temp_dir().join(format!("strata_node_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let output = dir.join("img.png");
        let film = Film::new(4, 2);

        save_frame(output.to_str().unwrap(), 3, 5, &film).unwrap();
        assert!(dir.join("img_0003.png").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
