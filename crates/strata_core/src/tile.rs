//! Image tiles handed to ranks for primary-ray generation.

use crate::error::WireError;

/// Wire size of a tile: four packed `i32`.
pub const TILE_WIRE_SIZE: usize = 16;

/// A rectangular region of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// X coordinate of the tile's top-left corner
    pub x: u32,
    /// Y coordinate of the tile's top-left corner
    pub y: u32,
    /// Width of the tile in pixels
    pub width: u32,
    /// Height of the tile in pixels
    pub height: u32,
}

impl Tile {
    /// Create a new tile.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Get the total number of pixels in this tile.
    pub fn pixel_count(&self) -> u32 {
        self.width * self.height
    }

    /// Iterate over `(x, y)` image coordinates covered by the tile, row-major.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.y..self.y + self.height)
            .flat_map(move |y| (self.x..self.x + self.width).map(move |x| (x, y)))
    }

    /// Split an image into `parts` horizontal bands, one per rank.
    ///
    /// Rows are spread as evenly as possible; when there are more parts than
    /// rows the trailing bands are empty (zero height) but still present, so
    /// every rank receives exactly one tile.
    pub fn partition_rows(width: u32, height: u32, parts: usize) -> Vec<Tile> {
        let parts = parts.max(1) as u32;
        let base = height / parts;
        let extra = height % parts;

        let mut tiles = Vec::with_capacity(parts as usize);
        let mut y = 0;
        for i in 0..parts {
            let h = base + u32::from(i < extra);
            tiles.push(Tile::new(0, y, width, h));
            y += h;
        }
        tiles
    }

    /// Pack as four little-endian `i32`: startX, startY, width, height.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TILE_WIRE_SIZE);
        for v in [self.x, self.y, self.width, self.height] {
            out.extend_from_slice(&(v as i32).to_le_bytes());
        }
        out
    }

    /// Unpack a tile; the payload must be exactly 16 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != TILE_WIRE_SIZE {
            return Err(WireError::Truncated {
                expected: TILE_WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        let field = |i: usize| {
            let b = &bytes[i * 4..i * 4 + 4];
            i32::from_le_bytes([b[0], b[1], b[2], b[3]]).max(0) as u32
        };
        Ok(Tile::new(field(0), field(1), field(2), field(3)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_exact_fit() {
        let tiles = Tile::partition_rows(64, 64, 4);
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().all(|t| t.height == 16));

        let total: u32 = tiles.iter().map(|t| t.pixel_count()).sum();
        assert_eq!(total, 64 * 64);
    }

    #[test]
    fn test_partition_uneven() {
        let tiles = Tile::partition_rows(10, 10, 3);
        assert_eq!(tiles.iter().map(|t| t.height).collect::<Vec<_>>(), vec![4, 3, 3]);
        assert_eq!(tiles[1].y, 4);
        assert_eq!(tiles[2].y, 7);
    }

    #[test]
    fn test_partition_more_parts_than_rows() {
        let tiles = Tile::partition_rows(8, 2, 4);
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[3].pixel_count(), 0);
    }

    #[test]
    fn test_wire_format() {
        let tile = Tile::new(1, 2, 3, 4);
        let bytes = tile.encode();

        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(Tile::decode(&bytes).unwrap(), tile);
        assert!(Tile::decode(&bytes[..12]).is_err());
    }

    #[test]
    fn test_pixels_iteration() {
        let tile = Tile::new(2, 3, 2, 2);
        let pixels: Vec<_> = tile.pixels().collect();
        assert_eq!(pixels, vec![(2, 3), (3, 3), (2, 4), (3, 4)]);
    }
}
