use std::sync::Arc;

use tiles::Tile;

use crate::layer_content::LayerContent;
use crate::layer_list::{LayerList, LayerListEntry};
use crate::layer_props::{LayerProps, LayerPropsList};
use crate::state::CanvasState;

/// Accumulated difference between two canvas states: a bitset of changed
/// tile positions plus a flag for layer-props changes. The mask accumulates
/// across `check` calls until a render pass consumes it.
#[derive(Debug, Default)]
pub struct CanvasDiff {
    tiles_x: u32,
    tiles_y: u32,
    bits: Vec<u64>,
    layer_props_changed: bool,
}

impl CanvasDiff {
    pub fn new() -> CanvasDiff {
        CanvasDiff::default()
    }

    pub fn tiles_x(&self) -> u32 {
        self.tiles_x
    }

    pub fn tiles_y(&self) -> u32 {
        self.tiles_y
    }

    /// Record the differences from `prev` to `next`.
    pub fn check(&mut self, next: &CanvasState, prev: &CanvasState) {
        let resized = self.tiles_x != next.tiles_x() || self.tiles_y != next.tiles_y();
        if resized {
            self.tiles_x = next.tiles_x();
            self.tiles_y = next.tiles_y();
            let words = (self.tiles_x as usize * self.tiles_y as usize).div_ceil(64);
            self.bits = vec![0; words];
        }

        if !CanvasState::same_props(next, prev) {
            self.layer_props_changed = true;
        }

        if resized
            || next.width() != prev.width()
            || next.height() != prev.height()
            || !Tile::same(next.background(), prev.background())
        {
            self.mark_all();
            return;
        }

        self.diff_lists(next.layers(), prev.layers(), next.props(), prev.props());
    }

    fn diff_lists(
        &mut self,
        next: &LayerList,
        prev: &LayerList,
        next_props: &LayerPropsList,
        prev_props: &LayerPropsList,
    ) {
        if next.len() != prev.len()
            || next.len() != next_props.len()
            || prev.len() != prev_props.len()
        {
            self.mark_all();
            return;
        }
        for index in 0..next.len() {
            self.diff_entry(
                next.at(index),
                prev.at(index),
                next_props.at(index),
                prev_props.at(index),
            );
        }
    }

    fn diff_entry(
        &mut self,
        next: &LayerListEntry,
        prev: &LayerListEntry,
        next_props: &Arc<LayerProps>,
        prev_props: &Arc<LayerProps>,
    ) {
        let props_render_change = !Arc::ptr_eq(next_props, prev_props)
            && render_affecting_props_differ(next_props, prev_props);

        match (next, prev) {
            (LayerListEntry::Content(next_content), LayerListEntry::Content(prev_content)) => {
                if props_render_change {
                    self.mark_content_coverage(next_content);
                    self.mark_content_coverage(prev_content);
                    return;
                }
                if Arc::ptr_eq(next_content, prev_content) {
                    return;
                }
                self.diff_content(next_content, prev_content);
            }
            (LayerListEntry::Group(next_group), LayerListEntry::Group(prev_group)) => {
                if props_render_change {
                    self.mark_list_coverage(next_group.children());
                    self.mark_list_coverage(prev_group.children());
                    return;
                }
                if Arc::ptr_eq(next_group, prev_group) {
                    return;
                }
                let empty = LayerPropsList::new();
                let next_children = next_props.children.as_deref().unwrap_or(&empty);
                let prev_children = prev_props.children.as_deref().unwrap_or(&empty);
                self.diff_lists(
                    next_group.children(),
                    prev_group.children(),
                    next_children,
                    prev_children,
                );
            }
            _ => self.mark_all(),
        }
    }

    fn diff_content(&mut self, next: &LayerContent, prev: &LayerContent) {
        if next.tiles_x() != self.tiles_x || next.tiles_y() != self.tiles_y {
            self.mark_all();
            return;
        }
        let sublayers_same = next.sublayers().len() == prev.sublayers().len()
            && next
                .sublayers()
                .iter()
                .zip(prev.sublayers().iter())
                .all(|(next_sub, prev_sub)| {
                    Arc::ptr_eq(&next_sub.content, &prev_sub.content)
                        && Arc::ptr_eq(&next_sub.props, &prev_sub.props)
                });

        for tile_y in 0..self.tiles_y {
            for tile_x in 0..self.tiles_x {
                let changed = match (next.tile_at(tile_x, tile_y), prev.tile_at(tile_x, tile_y)) {
                    (Some(next_tile), Some(prev_tile)) => !Tile::same(next_tile, prev_tile),
                    (None, None) => false,
                    _ => true,
                };
                if changed {
                    self.mark(tile_x, tile_y);
                } else if !sublayers_same {
                    let covered = next
                        .sublayers()
                        .iter()
                        .chain(prev.sublayers().iter())
                        .any(|sublayer| sublayer.content.tile_at(tile_x, tile_y).is_some());
                    if covered {
                        self.mark(tile_x, tile_y);
                    }
                }
            }
        }
    }

    fn mark_content_coverage(&mut self, content: &LayerContent) {
        for tile_y in 0..self.tiles_y.min(content.tiles_y()) {
            for tile_x in 0..self.tiles_x.min(content.tiles_x()) {
                if content.tile_at(tile_x, tile_y).is_some()
                    || content
                        .sublayers()
                        .iter()
                        .any(|sublayer| sublayer.content.tile_at(tile_x, tile_y).is_some())
                {
                    self.mark(tile_x, tile_y);
                }
            }
        }
    }

    fn mark_list_coverage(&mut self, list: &LayerList) {
        for entry in list.entries() {
            match entry {
                LayerListEntry::Content(content) => self.mark_content_coverage(content),
                LayerListEntry::Group(group) => self.mark_list_coverage(group.children()),
            }
        }
    }

    pub fn mark(&mut self, tile_x: u32, tile_y: u32) {
        debug_assert!(tile_x < self.tiles_x && tile_y < self.tiles_y);
        let index = (tile_y * self.tiles_x + tile_x) as usize;
        self.bits[index / 64] |= 1 << (index % 64);
    }

    pub fn mark_all(&mut self) {
        let total = self.tiles_x as usize * self.tiles_y as usize;
        for (word_index, word) in self.bits.iter_mut().enumerate() {
            let bits_here = (total - word_index * 64).min(64);
            *word = if bits_here == 64 {
                u64::MAX
            } else {
                (1u64 << bits_here) - 1
            };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    /// Visit each changed tile position in row-major order.
    pub fn each_pos(&self, mut visit: impl FnMut(u32, u32)) {
        for (word_index, word) in self.bits.iter().enumerate() {
            let mut remaining = *word;
            while remaining != 0 {
                let bit = remaining.trailing_zeros() as usize;
                let index = word_index * 64 + bit;
                visit(
                    (index as u32) % self.tiles_x,
                    (index as u32) / self.tiles_x,
                );
                remaining &= remaining - 1;
            }
        }
    }

    /// Visit each changed tile and clear the mask.
    pub fn each_pos_reset(&mut self, visit: impl FnMut(u32, u32)) {
        self.each_pos(visit);
        self.reset_tiles();
    }

    pub fn reset_tiles(&mut self) {
        self.bits.fill(0);
    }

    /// Read and clear the layer-props-changed flag.
    pub fn layer_props_changed_reset(&mut self) -> bool {
        std::mem::replace(&mut self.layer_props_changed, false)
    }
}

fn render_affecting_props_differ(next: &LayerProps, prev: &LayerProps) -> bool {
    next.opacity != prev.opacity
        || next.hidden != prev.hidden
        || next.blend_mode != prev.blend_mode
        || next.isolated != prev.isolated
        || next.censored != prev.censored
}

#[cfg(test)]
mod tests {
    use pixels::{BIT15, BlendMode, UPixel15};

    use super::*;
    use crate::layer_props::LayerProps;
    use crate::state::{TransientCanvasState, blank_content_entry, push_layer};

    fn red() -> UPixel15 {
        UPixel15 {
            b: 0,
            g: 0,
            r: BIT15,
            a: BIT15,
        }
    }

    fn state_with_layer(width: u32, height: u32) -> CanvasState {
        let mut tcs = TransientCanvasState::new_init();
        tcs.set_width(width);
        tcs.set_height(height);
        let entry = blank_content_entry(&tcs);
        push_layer(&mut tcs, entry, LayerProps::new(0x100), None);
        tcs.persist()
    }

    fn changed_positions(diff: &CanvasDiff) -> Vec<(u32, u32)> {
        let mut positions = Vec::new();
        diff.each_pos(|x, y| positions.push((x, y)));
        positions
    }

    #[test]
    fn diff_of_a_state_with_itself_is_empty() {
        let state = state_with_layer(200, 200);
        let mut diff = CanvasDiff::new();
        diff.check(&state, &state);
        assert!(diff.is_empty());
        assert!(!diff.layer_props_changed_reset());
    }

    #[test]
    fn pixel_edit_marks_exactly_the_touched_tile() {
        let state = state_with_layer(200, 200);
        let mut tcs = TransientCanvasState::new(&state);
        tcs.layers_mut()
            .content_at_mut(0)
            .expect("content layer")
            .fill_rect(BlendMode::Replace, 70, 70, 80, 80, red());
        let edited = tcs.persist();

        let mut diff = CanvasDiff::new();
        diff.check(&edited, &state);
        assert_eq!(changed_positions(&diff), vec![(1, 1)]);
        assert!(
            !diff.layer_props_changed_reset(),
            "pixel edits leave props untouched"
        );
    }

    #[test]
    fn props_only_change_sets_flag_and_marks_covered_tiles() {
        let state = state_with_layer(128, 64);
        let mut tcs = TransientCanvasState::new(&state);
        tcs.layers_mut()
            .content_at_mut(0)
            .expect("content layer")
            .fill_rect(BlendMode::Replace, 0, 0, 64, 64, red());
        let painted = tcs.persist();

        let mut tcs = TransientCanvasState::new(&painted);
        tcs.props_mut().at_mut(0).hidden = true;
        let hidden = tcs.persist();

        let mut diff = CanvasDiff::new();
        diff.check(&hidden, &painted);
        assert!(diff.layer_props_changed_reset());
        assert_eq!(changed_positions(&diff), vec![(0, 0)]);
    }

    #[test]
    fn title_only_change_sets_flag_without_tile_churn() {
        let state = state_with_layer(64, 64);
        let mut tcs = TransientCanvasState::new(&state);
        tcs.props_mut().at_mut(0).title = "Inks".into();
        let retitled = tcs.persist();

        let mut diff = CanvasDiff::new();
        diff.check(&retitled, &state);
        assert!(diff.layer_props_changed_reset());
        assert!(diff.is_empty());
    }

    #[test]
    fn dimension_change_marks_everything() {
        let state = state_with_layer(64, 64);
        let mut tcs = TransientCanvasState::new(&state);
        tcs.resize(0, 64, 0, 0);
        let grown = tcs.persist();

        let mut diff = CanvasDiff::new();
        diff.check(&grown, &state);
        assert_eq!(changed_positions(&diff).len(), 2);
    }

    #[test]
    fn each_pos_reset_consumes_the_mask() {
        let state = state_with_layer(64, 64);
        let mut tcs = TransientCanvasState::new(&state);
        tcs.layers_mut()
            .content_at_mut(0)
            .expect("content layer")
            .pixel_at_set(0, 0, red().premultiply());
        let edited = tcs.persist();

        let mut diff = CanvasDiff::new();
        diff.check(&edited, &state);
        let mut visits = 0;
        diff.each_pos_reset(|_, _| visits += 1);
        assert_eq!(visits, 1);
        assert!(diff.is_empty());
    }
}
