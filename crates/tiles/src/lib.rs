use std::sync::{Arc, OnceLock};

use pixels::blend::{BlankTileBehavior, blend_mask, blend_pixels};
use pixels::{BIT15, BlendMode, Pixel8, Pixel15, UPixel15};

pub const TILE_SIZE: u32 = 64;
pub const TILE_LENGTH: usize = (TILE_SIZE * TILE_SIZE) as usize;
const CHECKER_CELL: u32 = 8;

type TileBuf = [Pixel15; TILE_LENGTH];

/// Number of tiles needed to cover `pixels` pixels in one dimension.
pub const fn tile_count_round(pixels: u32) -> u32 {
    pixels.div_ceil(TILE_SIZE)
}

/// Immutable 64x64 pixel block with shared storage. Cloning bumps a
/// reference count; pixel data is never copied or mutated through this type.
#[derive(Debug, Clone)]
pub struct Tile {
    pixels: Arc<TileBuf>,
}

impl Tile {
    /// The canonical shared transparent tile.
    pub fn transparent() -> Tile {
        static BLANK: OnceLock<Tile> = OnceLock::new();
        BLANK
            .get_or_init(|| Tile {
                pixels: Arc::new([Pixel15::TRANSPARENT; TILE_LENGTH]),
            })
            .clone()
    }

    pub fn solid(color: UPixel15) -> Tile {
        let pixel = color.premultiply();
        if pixel.is_transparent() {
            return Tile::transparent();
        }
        Tile {
            pixels: Arc::new([pixel; TILE_LENGTH]),
        }
    }

    /// Two-color check pattern in 8x8 cells, used as the backdrop the
    /// renderer merges behind the canvas.
    pub fn checker(first: Pixel15, second: Pixel15) -> Tile {
        let mut pixels = [Pixel15::TRANSPARENT; TILE_LENGTH];
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                let cell = (x / CHECKER_CELL + y / CHECKER_CELL) % 2;
                pixels[(y * TILE_SIZE + x) as usize] = if cell == 0 { first } else { second };
            }
        }
        Tile {
            pixels: Arc::new(pixels),
        }
    }

    pub fn from_pixels8(source: &[Pixel8; TILE_LENGTH]) -> Tile {
        let mut pixels = [Pixel15::TRANSPARENT; TILE_LENGTH];
        pixels::pixels8_to_15(&mut pixels, source);
        Tile {
            pixels: Arc::new(pixels),
        }
    }

    pub fn pixels(&self) -> &TileBuf {
        &self.pixels
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> Pixel15 {
        debug_assert!(x < TILE_SIZE && y < TILE_SIZE);
        self.pixels[(y * TILE_SIZE + x) as usize]
    }

    /// Pointer identity, the unit of canvas diffing.
    pub fn same(left: &Tile, right: &Tile) -> bool {
        Arc::ptr_eq(&left.pixels, &right.pixels)
    }
}

/// Exclusively owned editable tile. Created blank or by taking over a
/// [`Tile`]; taking over a uniquely held tile is O(1), a shared one copies
/// its pixels once. `persist` is always O(1).
#[derive(Debug)]
pub struct TransientTile {
    pixels: Arc<TileBuf>,
}

impl TransientTile {
    pub fn new_blank() -> TransientTile {
        TransientTile {
            pixels: Arc::new([Pixel15::TRANSPARENT; TILE_LENGTH]),
        }
    }

    pub fn new_from(tile: Tile) -> TransientTile {
        TransientTile { pixels: tile.pixels }
    }

    pub fn pixels(&self) -> &TileBuf {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut TileBuf {
        Arc::make_mut(&mut self.pixels)
    }

    pub fn pixel_at_set(&mut self, x: u32, y: u32, pixel: Pixel15) {
        debug_assert!(x < TILE_SIZE && y < TILE_SIZE);
        #[cfg(debug_assertions)]
        pixel.debug_check();
        self.pixels_mut()[(y * TILE_SIZE + x) as usize] = pixel;
    }

    /// Blend `src` into this tile in place, honoring the mode's blank-tile
    /// behavior when `src` is absent.
    pub fn merge(&mut self, src: Option<&Tile>, opacity: u16, mode: BlendMode) {
        debug_assert!(opacity <= BIT15);
        match src {
            Some(tile) => blend_pixels(self.pixels_mut(), tile.pixels(), opacity, mode),
            None => {
                if mode.blank_tile_behavior() == BlankTileBehavior::Blend {
                    let blank = [Pixel15::TRANSPARENT; TILE_LENGTH];
                    blend_pixels(self.pixels_mut(), &blank, opacity, mode);
                }
            }
        }
    }

    /// Stamp a coverage mask with one color over the whole tile buffer.
    pub fn apply_mask(&mut self, color: UPixel15, mask: &[u16], opacity: u16, mode: BlendMode) {
        blend_mask(self.pixels_mut(), color, mask, opacity, mode);
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|pixel| pixel.is_transparent())
    }

    pub fn persist(self) -> Tile {
        Tile { pixels: self.pixels }
    }
}
