//! Ephemeral previews overlaid on the canvas between ticks: a cut rectangle
//! that erases a region, or a captured run of dab commands. Previews never
//! enter the history; they re-render against whatever state the tick pulls.

use std::sync::{Arc, Mutex};

use canvas::{CanvasState, LayerContent, LayerProps, LayerRoutes, TransientCanvasState};
use pixels::{BIT15, BlendMode, Pixel15, channel_8_to_15};
use protocol::{LayerId, Message};
use tracing::warn;

/// Reserved props id for preview sublayers.
const PREVIEW_SUBLAYER_ID: LayerId = 0;

#[derive(Debug)]
pub enum Preview {
    Cut(CutPreview),
    Dabs(DabsPreview),
}

#[derive(Debug)]
pub struct CutPreview {
    pub layer_id: LayerId,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Per-pixel alpha mask, `width * height` bytes; full rectangle if absent.
    pub mask: Option<Vec<u8>>,
    pub initial_offset_x: i32,
    pub initial_offset_y: i32,
    /// Rendered erase content, rebuilt when the canvas size changes.
    cache: Mutex<Option<Arc<LayerContent>>>,
}

#[derive(Debug)]
pub struct DabsPreview {
    pub layer_id: LayerId,
    pub messages: Vec<Message>,
    pub initial_offset_x: i32,
    pub initial_offset_y: i32,
}

impl Preview {
    pub fn new_cut(
        layer_id: LayerId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        mask: Option<Vec<u8>>,
        initial_offset_x: i32,
        initial_offset_y: i32,
    ) -> Preview {
        debug_assert!(
            mask.as_ref()
                .is_none_or(|mask| mask.len() == (width * height) as usize)
        );
        Preview::Cut(CutPreview {
            layer_id,
            x,
            y,
            width,
            height,
            mask,
            initial_offset_x,
            initial_offset_y,
            cache: Mutex::new(None),
        })
    }

    pub fn new_dabs(
        layer_id: LayerId,
        messages: Vec<Message>,
        initial_offset_x: i32,
        initial_offset_y: i32,
    ) -> Preview {
        Preview::Dabs(DabsPreview {
            layer_id,
            messages,
            initial_offset_x,
            initial_offset_y,
        })
    }

    /// Produce a new persistent state with the preview applied, or hand the
    /// input back when the target layer is gone.
    pub fn render(&self, cs: &Arc<CanvasState>) -> Arc<CanvasState> {
        match self {
            Preview::Cut(cut) => cut.render(cs),
            Preview::Dabs(dabs) => dabs.render(cs),
        }
    }
}

impl CutPreview {
    fn render(&self, cs: &Arc<CanvasState>) -> Arc<CanvasState> {
        let routes = LayerRoutes::build(cs);
        let Some(route) = routes.search(self.layer_id) else {
            return cs.clone();
        };
        if route.is_group() {
            return cs.clone();
        }

        let offset_x = self.initial_offset_x - cs.offset_x();
        let offset_y = self.initial_offset_y - cs.offset_y();
        let erase_content = self.erase_content(cs, offset_x, offset_y);

        let mut erase_props = LayerProps::new(PREVIEW_SUBLAYER_ID);
        erase_props.blend_mode = BlendMode::Erase;

        let mut tcs = TransientCanvasState::new(cs);
        let content = route
            .entry_transient_content(&mut tcs)
            .expect("cut preview route resolved to content");
        content.sublayer_insert(erase_content, Arc::new(erase_props));
        Arc::new(tcs.persist())
    }

    fn erase_content(
        &self,
        cs: &CanvasState,
        offset_x: i32,
        offset_y: i32,
    ) -> Arc<LayerContent> {
        let mut cache = self.cache.lock().expect("cut preview cache lock poisoned");
        if let Some(cached) = cache.as_ref()
            && cached.width() == cs.width()
            && cached.height() == cs.height()
        {
            return cached.clone();
        }

        let mut content = LayerContent::new(cs.width(), cs.height());
        let left = self.x + offset_x;
        let top = self.y + offset_y;
        match &self.mask {
            Some(mask) => {
                for row in 0..self.height {
                    for column in 0..self.width {
                        let alpha = mask[(row * self.width + column) as usize];
                        if alpha == 0 {
                            continue;
                        }
                        let canvas_x = left + column as i32;
                        let canvas_y = top + row as i32;
                        if canvas_x < 0 || canvas_y < 0 {
                            continue;
                        }
                        content.pixel_at_set(
                            canvas_x as u32,
                            canvas_y as u32,
                            Pixel15 {
                                b: 0,
                                g: 0,
                                r: 0,
                                a: channel_8_to_15(alpha),
                            },
                        );
                    }
                }
            }
            None => {
                content.fill_rect(
                    BlendMode::Replace,
                    left,
                    top,
                    left + self.width as i32,
                    top + self.height as i32,
                    pixels::UPixel15 {
                        b: 0,
                        g: 0,
                        r: 0,
                        a: BIT15,
                    },
                );
            }
        }
        let content = Arc::new(content);
        *cache = Some(content.clone());
        content.clone()
    }
}

impl DabsPreview {
    fn render(&self, cs: &Arc<CanvasState>) -> Arc<CanvasState> {
        let routes = LayerRoutes::build(cs);
        let Some(route) = routes.search(self.layer_id) else {
            return cs.clone();
        };
        if route.is_group() {
            return cs.clone();
        }

        let offset_x = self.initial_offset_x - cs.offset_x();
        let offset_y = self.initial_offset_y - cs.offset_y();
        let mut tcs = TransientCanvasState::new(cs);
        for msg in &self.messages {
            if let Err(error) = paint::draw_dabs(&mut tcs, msg.context_id, msg, offset_x, offset_y)
            {
                warn!(%error, "dab preview message skipped");
            }
        }
        Arc::new(tcs.persist())
    }
}

#[cfg(test)]
mod tests {
    use canvas::LayerProps;
    use pixels::UPixel15;
    use protocol::{MessagePayload, PixelDab};

    use super::*;

    fn red() -> UPixel15 {
        UPixel15 {
            b: 0,
            g: 0,
            r: BIT15,
            a: BIT15,
        }
    }

    fn painted_state() -> Arc<CanvasState> {
        let mut tcs = TransientCanvasState::new_init();
        tcs.set_width(64);
        tcs.set_height(64);
        let entry = canvas::state::blank_content_entry(&tcs);
        canvas::state::push_layer(&mut tcs, entry, LayerProps::new(0x100), None);
        let routes = LayerRoutes::build(tcs.as_view());
        routes
            .search(0x100)
            .expect("layer route")
            .entry_transient_content(&mut tcs)
            .expect("content")
            .fill_rect(BlendMode::Replace, 0, 0, 64, 64, red());
        Arc::new(tcs.persist())
    }

    #[test]
    fn cut_preview_erases_the_rectangle_without_touching_the_source() {
        let state = painted_state();
        let preview = Preview::new_cut(0x100, 0, 0, 10, 10, None, 0, 0);
        let previewed = preview.render(&state);

        assert_eq!(previewed.flatten_pixel_at(5, 5), Pixel15::TRANSPARENT);
        assert_eq!(previewed.flatten_pixel_at(20, 20), red().premultiply());
        assert_eq!(state.flatten_pixel_at(5, 5), red().premultiply());
    }

    #[test]
    fn cut_preview_with_mask_erases_only_masked_pixels() {
        let state = painted_state();
        let mut mask = vec![0u8; 4];
        mask[0] = 255;
        let preview = Preview::new_cut(0x100, 0, 0, 2, 2, Some(mask), 0, 0);
        let previewed = preview.render(&state);

        assert_eq!(previewed.flatten_pixel_at(0, 0), Pixel15::TRANSPARENT);
        assert_eq!(previewed.flatten_pixel_at(1, 0), red().premultiply());
    }

    #[test]
    fn preview_on_missing_layer_returns_the_state_unchanged() {
        let state = painted_state();
        let preview = Preview::new_cut(0x999, 0, 0, 10, 10, None, 0, 0);
        let previewed = preview.render(&state);
        assert!(Arc::ptr_eq(&state, &previewed));
    }

    #[test]
    fn dabs_preview_draws_captured_messages() {
        let state = painted_state();
        let msg = Message::new(
            1,
            MessagePayload::DrawDabsPixel {
                layer_id: 0x100,
                x: 32,
                y: 32,
                color: 0xff00_ff00,
                blend_mode: BlendMode::Normal as u8,
                indirect: false,
                dabs: vec![PixelDab {
                    x: 0,
                    y: 0,
                    size: 4,
                    opacity: 0xff,
                }],
            },
        );
        let preview = Preview::new_dabs(0x100, vec![msg], 0, 0);
        let previewed = preview.render(&state);

        let green = UPixel15::from_argb8(0xff00_ff00).premultiply();
        assert_eq!(previewed.flatten_pixel_at(32, 32), green);
        assert_eq!(state.flatten_pixel_at(32, 32), red().premultiply());
    }

    #[test]
    fn preview_offsets_compensate_canvas_expansion() {
        let state = painted_state();
        // The canvas grew 64px on the left since the preview was anchored.
        let mut tcs = TransientCanvasState::new(&state);
        tcs.resize(0, 0, 0, 64);
        let grown = Arc::new(tcs.persist());

        let preview = Preview::new_cut(0x100, 0, 0, 10, 10, None, 0, 0);
        let previewed = preview.render(&grown);
        // The anchored origin follows the content to x=64.
        assert_eq!(previewed.flatten_pixel_at(64, 5), Pixel15::TRANSPARENT);
        assert_eq!(previewed.flatten_pixel_at(5, 5), Pixel15::TRANSPARENT,);
    }
}
