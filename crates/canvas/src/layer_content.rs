use std::sync::Arc;

use pixels::{BIT15, BlendMode, Pixel8, Pixel15, UPixel15};
use protocol::LayerId;
use tiles::{TILE_SIZE, Tile, TransientTile, tile_count_round};

use crate::layer_props::LayerProps;

/// A transient layer overlaid on its owner, used for indirect drawing and
/// previews until it is merged or discarded.
#[derive(Debug, Clone)]
pub struct Sublayer {
    pub content: Arc<LayerContent>,
    pub props: Arc<LayerProps>,
}

/// Pixel storage of one layer: a sparse tile grid sized to the canvas plus
/// an ordered sublayer stack. A missing tile is fully transparent.
#[derive(Debug, Clone)]
pub struct LayerContent {
    width: u32,
    height: u32,
    tiles: Vec<Option<Tile>>,
    sublayers: Vec<Sublayer>,
}

impl LayerContent {
    pub fn new(width: u32, height: u32) -> LayerContent {
        let tile_count = (tile_count_round(width) * tile_count_round(height)) as usize;
        LayerContent {
            width,
            height,
            tiles: vec![None; tile_count],
            sublayers: Vec::new(),
        }
    }

    pub fn new_solid(width: u32, height: u32, color: UPixel15) -> LayerContent {
        let mut content = LayerContent::new(width, height);
        if color.premultiply() != Pixel15::TRANSPARENT {
            let tile = Tile::solid(color);
            for slot in &mut content.tiles {
                *slot = Some(tile.clone());
            }
        }
        content
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tiles_x(&self) -> u32 {
        tile_count_round(self.width)
    }

    pub fn tiles_y(&self) -> u32 {
        tile_count_round(self.height)
    }

    fn tile_index(&self, tile_x: u32, tile_y: u32) -> usize {
        debug_assert!(tile_x < self.tiles_x() && tile_y < self.tiles_y());
        (tile_y * self.tiles_x() + tile_x) as usize
    }

    pub fn tile_at(&self, tile_x: u32, tile_y: u32) -> Option<&Tile> {
        self.tiles[self.tile_index(tile_x, tile_y)].as_ref()
    }

    pub fn tile_set(&mut self, tile_x: u32, tile_y: u32, tile: Option<Tile>) {
        let index = self.tile_index(tile_x, tile_y);
        self.tiles[index] = tile;
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> Pixel15 {
        debug_assert!(x < self.width && y < self.height);
        match self.tile_at(x / TILE_SIZE, y / TILE_SIZE) {
            Some(tile) => tile.pixel_at(x % TILE_SIZE, y % TILE_SIZE),
            None => Pixel15::TRANSPARENT,
        }
    }

    pub fn sublayers(&self) -> &[Sublayer] {
        &self.sublayers
    }

    pub fn is_blank(&self) -> bool {
        self.tiles.iter().all(Option::is_none) && self.sublayers.is_empty()
    }

    fn edit_tile(&mut self, tile_x: u32, tile_y: u32, edit: impl FnOnce(&mut TransientTile)) {
        let index = self.tile_index(tile_x, tile_y);
        let slot = &mut self.tiles[index];
        let mut transient = match slot.take() {
            Some(tile) => TransientTile::new_from(tile),
            None => TransientTile::new_blank(),
        };
        edit(&mut transient);
        *slot = Some(transient.persist());
    }

    pub fn pixel_at_set(&mut self, x: u32, y: u32, pixel: Pixel15) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.edit_tile(x / TILE_SIZE, y / TILE_SIZE, |tile| {
            tile.pixel_at_set(x % TILE_SIZE, y % TILE_SIZE, pixel);
        });
    }

    /// Fill a rectangle, clamped to the canvas, with one color.
    pub fn fill_rect(
        &mut self,
        mode: BlendMode,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        color: UPixel15,
    ) {
        let left = left.clamp(0, self.width as i32) as u32;
        let top = top.clamp(0, self.height as i32) as u32;
        let right = right.clamp(0, self.width as i32) as u32;
        let bottom = bottom.clamp(0, self.height as i32) as u32;
        if left >= right || top >= bottom {
            return;
        }

        let full_row = [BIT15; TILE_SIZE as usize];
        for tile_y in top / TILE_SIZE..=(bottom - 1) / TILE_SIZE {
            for tile_x in left / TILE_SIZE..=(right - 1) / TILE_SIZE {
                let x0 = left.max(tile_x * TILE_SIZE) % TILE_SIZE;
                let x1 = (right.min((tile_x + 1) * TILE_SIZE) - 1) % TILE_SIZE + 1;
                let y0 = top.max(tile_y * TILE_SIZE) % TILE_SIZE;
                let y1 = (bottom.min((tile_y + 1) * TILE_SIZE) - 1) % TILE_SIZE + 1;
                self.edit_tile(tile_x, tile_y, |tile| {
                    let pixels = tile.pixels_mut();
                    for y in y0..y1 {
                        let row_start = (y * TILE_SIZE + x0) as usize;
                        let row_end = (y * TILE_SIZE + x1) as usize;
                        pixels::blend::blend_mask(
                            &mut pixels[row_start..row_end],
                            color,
                            &full_row[..(x1 - x0) as usize],
                            BIT15,
                            mode,
                        );
                    }
                });
            }
        }
    }

    /// Blend 8-bit premultiplied BGRA rows at `(x, y)`, clamped to the
    /// canvas.
    pub fn put_image(&mut self, mode: BlendMode, x: i32, y: i32, width: u32, height: u32, image: &[Pixel8]) {
        debug_assert_eq!(image.len(), (width * height) as usize);
        let mut row15 = vec![Pixel15::TRANSPARENT; width as usize];
        for row in 0..height {
            let canvas_y = y + row as i32;
            if canvas_y < 0 || canvas_y >= self.height as i32 {
                continue;
            }
            let src_row = &image[(row * width) as usize..((row + 1) * width) as usize];
            pixels::pixels8_to_15(&mut row15[..src_row.len()], src_row);
            self.blend_row(mode, x, canvas_y as u32, &row15[..src_row.len()]);
        }
    }

    fn blend_row(&mut self, mode: BlendMode, x: i32, y: u32, source: &[Pixel15]) {
        let canvas_width = self.width as i32;
        let start = x.max(0);
        let end = (x + source.len() as i32).min(canvas_width);
        if start >= end {
            return;
        }
        let mut canvas_x = start as u32;
        while (canvas_x as i32) < end {
            let tile_x = canvas_x / TILE_SIZE;
            let tile_y = y / TILE_SIZE;
            let run_end = (((tile_x + 1) * TILE_SIZE) as i32).min(end) as u32;
            let run = (run_end - canvas_x) as usize;
            let src_offset = (canvas_x as i32 - x) as usize;
            let in_tile_x = canvas_x % TILE_SIZE;
            let in_tile_y = y % TILE_SIZE;
            self.edit_tile(tile_x, tile_y, |tile| {
                let row_start = (in_tile_y * TILE_SIZE + in_tile_x) as usize;
                pixels::blend::blend_pixels(
                    &mut tile.pixels_mut()[row_start..row_start + run],
                    &source[src_offset..src_offset + run],
                    BIT15,
                    mode,
                );
            });
            canvas_x = run_end;
        }
    }

    /// Stamp a coverage mask of `mask_width x mask_height` fix15 values with
    /// its top-left corner at `(left, top)`, clipped to the canvas.
    pub fn apply_mask_rect(
        &mut self,
        left: i32,
        top: i32,
        mask_width: u32,
        mask_height: u32,
        mask: &[u16],
        color: UPixel15,
        opacity: u16,
        mode: BlendMode,
    ) {
        debug_assert_eq!(mask.len(), (mask_width * mask_height) as usize);
        for mask_y in 0..mask_height {
            let canvas_y = top + mask_y as i32;
            if canvas_y < 0 || canvas_y >= self.height as i32 {
                continue;
            }
            let row = &mask[(mask_y * mask_width) as usize..((mask_y + 1) * mask_width) as usize];
            self.apply_mask_row(left, canvas_y as u32, row, color, opacity, mode);
        }
    }

    fn apply_mask_row(
        &mut self,
        left: i32,
        y: u32,
        row: &[u16],
        color: UPixel15,
        opacity: u16,
        mode: BlendMode,
    ) {
        let canvas_width = self.width as i32;
        let start = left.max(0);
        let end = (left + row.len() as i32).min(canvas_width);
        if start >= end {
            return;
        }
        let mut canvas_x = start as u32;
        while (canvas_x as i32) < end {
            let tile_x = canvas_x / TILE_SIZE;
            let tile_y = y / TILE_SIZE;
            let run_end = (((tile_x + 1) * TILE_SIZE) as i32).min(end) as u32;
            let run = (run_end - canvas_x) as usize;
            let mask_offset = (canvas_x as i32 - left) as usize;
            let in_tile_x = canvas_x % TILE_SIZE;
            let in_tile_y = y % TILE_SIZE;
            self.edit_tile(tile_x, tile_y, |tile| {
                let row_start = (in_tile_y * TILE_SIZE + in_tile_x) as usize;
                pixels::blend::blend_mask(
                    &mut tile.pixels_mut()[row_start..row_start + run],
                    color,
                    &row[mask_offset..mask_offset + run],
                    opacity,
                    mode,
                );
            });
            canvas_x = run_end;
        }
    }

    /// Look up a sublayer by props id, creating a blank one on demand, and
    /// hand out exclusive references to both halves.
    pub fn transient_sublayer(&mut self, id: LayerId) -> (&mut LayerContent, &mut LayerProps) {
        let position = match self.sublayers.iter().position(|sublayer| sublayer.props.id == id) {
            Some(position) => position,
            None => {
                self.sublayers.push(Sublayer {
                    content: Arc::new(LayerContent::new(self.width, self.height)),
                    props: Arc::new(LayerProps::new(id)),
                });
                self.sublayers.len() - 1
            }
        };
        let sublayer = &mut self.sublayers[position];
        (
            Arc::make_mut(&mut sublayer.content),
            Arc::make_mut(&mut sublayer.props),
        )
    }

    pub fn sublayer_insert(&mut self, content: Arc<LayerContent>, props: Arc<LayerProps>) {
        self.sublayers.push(Sublayer { content, props });
    }

    pub fn has_sublayer(&self, id: LayerId) -> bool {
        self.sublayers.iter().any(|sublayer| sublayer.props.id == id)
    }

    pub fn remove_sublayer(&mut self, id: LayerId) -> bool {
        let before = self.sublayers.len();
        self.sublayers.retain(|sublayer| sublayer.props.id != id);
        self.sublayers.len() != before
    }

    /// Blend the identified sublayer into this content and drop it.
    pub fn merge_sublayer(&mut self, id: LayerId) -> bool {
        let Some(position) = self
            .sublayers
            .iter()
            .position(|sublayer| sublayer.props.id == id)
        else {
            return false;
        };
        let sublayer = self.sublayers.remove(position);
        let opacity = sublayer.props.opacity;
        let mode = sublayer.props.blend_mode;
        for tile_y in 0..self.tiles_y() {
            for tile_x in 0..self.tiles_x() {
                let source = sublayer.content.tile_at(tile_x, tile_y).cloned();
                if source.is_none() && mode.blank_tile_behavior() == pixels::BlankTileBehavior::Skip
                {
                    continue;
                }
                self.edit_tile(tile_x, tile_y, |tile| {
                    tile.merge(source.as_ref(), opacity, mode);
                });
            }
        }
        true
    }

    pub fn merge_all_sublayers(&mut self) {
        while let Some(sublayer) = self.sublayers.first() {
            let id = sublayer.props.id;
            self.merge_sublayer(id);
        }
    }

    /// Blend another content's composited tiles into this one, used when a
    /// deleted layer merges downward.
    pub fn merge_content(&mut self, other: &LayerContent, opacity: u16, mode: BlendMode) {
        for tile_y in 0..self.tiles_y().min(other.tiles_y()) {
            for tile_x in 0..self.tiles_x().min(other.tiles_x()) {
                let source = other.tile_with_sublayers(tile_x, tile_y);
                if source.is_none() && mode.blank_tile_behavior() == pixels::BlankTileBehavior::Skip
                {
                    continue;
                }
                self.edit_tile(tile_x, tile_y, |tile| {
                    tile.merge(source.as_ref(), opacity, mode);
                });
            }
        }
    }

    /// The composited tile at a position: base pixels plus any visible
    /// sublayers. `None` means fully transparent.
    pub fn tile_with_sublayers(&self, tile_x: u32, tile_y: u32) -> Option<Tile> {
        let base = self.tile_at(tile_x, tile_y).cloned();
        let visible: Vec<&Sublayer> = self
            .sublayers
            .iter()
            .filter(|sublayer| sublayer.props.visible())
            .collect();
        if visible.is_empty() {
            return base;
        }
        let mut composite = match base {
            Some(tile) => TransientTile::new_from(tile),
            None => {
                if visible.iter().all(|sublayer| {
                    sublayer.content.tile_at(tile_x, tile_y).is_none()
                        && sublayer.props.blend_mode.blank_tile_behavior()
                            == pixels::BlankTileBehavior::Skip
                }) {
                    return None;
                }
                TransientTile::new_blank()
            }
        };
        for sublayer in visible {
            composite.merge(
                sublayer.content.tile_at(tile_x, tile_y),
                sublayer.props.opacity,
                sublayer.props.blend_mode,
            );
        }
        Some(composite.persist())
    }

    /// A copy grown (or shrunk, for negative amounts) by the given margins.
    /// The existing pixels land at `(left, top)` in the new content.
    pub fn resized(&self, top: i32, right: i32, bottom: i32, left: i32) -> LayerContent {
        let new_width = (self.width as i64 + left as i64 + right as i64).max(0) as u32;
        let new_height = (self.height as i64 + top as i64 + bottom as i64).max(0) as u32;
        let mut resized = LayerContent::new(new_width, new_height);

        if new_width > 0 && new_height > 0 {
            if left.rem_euclid(TILE_SIZE as i32) == 0 && top.rem_euclid(TILE_SIZE as i32) == 0 {
                self.copy_tiles_offset(&mut resized, left / TILE_SIZE as i32, top / TILE_SIZE as i32);
            } else {
                self.copy_pixels_offset(&mut resized, left, top);
            }
        }

        for sublayer in &self.sublayers {
            resized.sublayers.push(Sublayer {
                content: Arc::new(sublayer.content.resized(top, right, bottom, left)),
                props: sublayer.props.clone(),
            });
        }
        resized
    }

    fn copy_tiles_offset(&self, target: &mut LayerContent, tile_dx: i32, tile_dy: i32) {
        for tile_y in 0..self.tiles_y() {
            for tile_x in 0..self.tiles_x() {
                let target_x = tile_x as i32 + tile_dx;
                let target_y = tile_y as i32 + tile_dy;
                if target_x < 0
                    || target_y < 0
                    || target_x >= target.tiles_x() as i32
                    || target_y >= target.tiles_y() as i32
                {
                    continue;
                }
                target.tile_set(
                    target_x as u32,
                    target_y as u32,
                    self.tile_at(tile_x, tile_y).cloned(),
                );
            }
        }
    }

    fn copy_pixels_offset(&self, target: &mut LayerContent, dx: i32, dy: i32) {
        for y in 0..self.height {
            let target_y = y as i32 + dy;
            if target_y < 0 || target_y >= target.height as i32 {
                continue;
            }
            for x in 0..self.width {
                let target_x = x as i32 + dx;
                if target_x < 0 || target_x >= target.width as i32 {
                    continue;
                }
                let pixel = self.pixel_at(x, y);
                if pixel != Pixel15::TRANSPARENT {
                    target.pixel_at_set(target_x as u32, target_y as u32, pixel);
                }
            }
        }
    }
}
