//! Per-rank framebuffer.
//!
//! Each rank accumulates the radiance of rays that terminate locally into
//! its own film. Rank 0 sums every rank's contributions into the final
//! image once the frame is complete.

use strata_math::Vec3;

use crate::error::WireError;

/// Color type alias (RGB values typically 0-1)
pub type Color = Vec3;

const CONTRIBUTION_SIZE: usize = 16;

/// Linear RGB accumulation buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Film {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Color>,
}

impl Film {
    /// Create a new film filled with black.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Color::ZERO; (width * height) as usize],
        }
    }

    /// Framebuffer index of pixel (x, y).
    #[inline]
    pub fn index(&self, x: u32, y: u32) -> u32 {
        y * self.width + x
    }

    /// Get the pixel at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Color {
        self.pixels[self.index(x, y) as usize]
    }

    /// Add radiance to a pixel. Out-of-range indices are ignored.
    pub fn accumulate(&mut self, pixel: u32, color: Color) {
        if let Some(p) = self.pixels.get_mut(pixel as usize) {
            *p += color;
        }
    }

    /// Reset every pixel to black.
    pub fn clear(&mut self) {
        self.pixels.fill(Color::ZERO);
    }

    /// Pack every non-black pixel as `(index:u32, r:f32, g:f32, b:f32)` records.
    pub fn encode_contributions(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, c) in self.pixels.iter().enumerate() {
            if *c == Color::ZERO {
                continue;
            }
            out.extend_from_slice(&(i as u32).to_le_bytes());
            for v in c.to_array() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// Unpack records produced by [`Film::encode_contributions`].
    pub fn decode_contributions(bytes: &[u8]) -> Result<Vec<(u32, Color)>, WireError> {
        if bytes.len() % CONTRIBUTION_SIZE != 0 {
            return Err(WireError::Misaligned {
                actual: bytes.len(),
                record: CONTRIBUTION_SIZE,
            });
        }
        let word = |b: &[u8]| [b[0], b[1], b[2], b[3]];
        Ok(bytes
            .chunks_exact(CONTRIBUTION_SIZE)
            .map(|r| {
                let pixel = u32::from_le_bytes(word(&r[0..4]));
                let color = Color::new(
                    f32::from_le_bytes(word(&r[4..8])),
                    f32::from_le_bytes(word(&r[8..12])),
                    f32::from_le_bytes(word(&r[12..16])),
                );
                (pixel, color)
            })
            .collect())
    }

    /// Convert to RGBA bytes (for display or saving).
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((self.width * self.height * 4) as usize);
        for color in &self.pixels {
            bytes.extend_from_slice(&color_to_rgba(*color));
        }
        bytes
    }
}

/// Apply gamma correction (gamma = 2.0).
#[inline]
fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Convert a color to 8-bit RGBA.
pub fn color_to_rgba(color: Color) -> [u8; 4] {
    let to_byte = |c: f32| (255.0 * linear_to_gamma(c).clamp(0.0, 1.0)) as u8;
    [to_byte(color.x), to_byte(color.y), to_byte(color.z), 255]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_clear() {
        let mut film = Film::new(4, 2);
        let idx = film.index(3, 1);
        film.accumulate(idx, Color::new(0.25, 0.0, 0.0));
        film.accumulate(idx, Color::new(0.25, 0.0, 0.0));
        film.accumulate(99, Color::ONE);

        assert_eq!(film.get(3, 1), Color::new(0.5, 0.0, 0.0));
        film.clear();
        assert_eq!(film.get(3, 1), Color::ZERO);
    }

    #[test]
    fn test_contributions_skip_black_pixels() {
        let mut film = Film::new(8, 8);
        film.accumulate(5, Color::new(0.1, 0.2, 0.3));
        film.accumulate(40, Color::new(1.0, 0.0, 0.5));

        let bytes = film.encode_contributions();
        assert_eq!(bytes.len(), 2 * CONTRIBUTION_SIZE);

        let decoded = Film::decode_contributions(&bytes).unwrap();
        assert_eq!(decoded[0], (5, Color::new(0.1, 0.2, 0.3)));
        assert_eq!(decoded[1].0, 40);
        assert!(Film::decode_contributions(&bytes[..3]).is_err());
    }

    #[test]
    fn test_color_to_rgba() {
        assert_eq!(color_to_rgba(Color::ZERO), [0, 0, 0, 255]);
        assert_eq!(color_to_rgba(Color::ONE), [255, 255, 255, 255]);
        // 0.25 linear -> 0.5 gamma
        assert_eq!(color_to_rgba(Color::new(0.25, 0.0, 2.0))[0], 127);
    }
}
