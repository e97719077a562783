use protocol::LayerId;

use crate::layer_props::LayerProps;
use crate::state::CanvasState;

/// Which layers a view shows. `Normal` follows the layer props; the other
/// modes restrict visibility on top of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Normal,
    /// Solo view of one layer (and its ancestors).
    Layer(LayerId),
    /// One timeline frame: the top-level layer at the frame's index.
    Frame(usize),
    /// Manually curated timelines are not specified yet; this mode resolves
    /// to nothing visible until they are.
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct ViewModeFilter {
    mode: ViewMode,
}

impl ViewModeFilter {
    pub fn new(mode: ViewMode) -> ViewModeFilter {
        ViewModeFilter { mode }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Decide visibility of a top-level node at `index` with `props`,
    /// given the state the filter is applied to.
    pub fn top_level_visible(&self, state: &CanvasState, index: usize, props: &LayerProps) -> bool {
        match self.mode {
            ViewMode::Normal => props.visible(),
            ViewMode::Layer(id) => {
                props.id == id || contains_layer(props, id)
            }
            ViewMode::Frame(frame) => {
                let _ = state;
                props.visible() && index == frame
            }
            ViewMode::Manual => false,
        }
    }
}

fn contains_layer(props: &LayerProps, id: LayerId) -> bool {
    match &props.children {
        Some(children) => children.find(id).is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::layer_props::LayerProps;
    use crate::state::{TransientCanvasState, blank_content_entry, push_layer};

    fn two_layer_state() -> CanvasState {
        let mut tcs = TransientCanvasState::new_init();
        tcs.set_width(64);
        tcs.set_height(64);
        let first = blank_content_entry(&tcs);
        push_layer(&mut tcs, first, LayerProps::new(0x100), None);
        let second = blank_content_entry(&tcs);
        push_layer(&mut tcs, second, LayerProps::new(0x101), None);
        tcs.persist()
    }

    #[test]
    fn normal_mode_follows_props_visibility() {
        let state = two_layer_state();
        let filter = ViewModeFilter::new(ViewMode::Normal);
        assert!(filter.top_level_visible(&state, 0, state.props().at(0)));

        let mut hidden = LayerProps::new(0x100);
        hidden.hidden = true;
        assert!(!filter.top_level_visible(&state, 0, &hidden));
    }

    #[test]
    fn layer_mode_solos_the_target() {
        let state = two_layer_state();
        let filter = ViewModeFilter::new(ViewMode::Layer(0x101));
        assert!(!filter.top_level_visible(&state, 0, state.props().at(0)));
        assert!(filter.top_level_visible(&state, 1, state.props().at(1)));
    }

    #[test]
    fn layer_mode_keeps_ancestors_of_the_target() {
        let mut group = LayerProps::new_group(0x200);
        group
            .children_mut()
            .push(Arc::new(LayerProps::new(0x201)));
        let state = two_layer_state();
        let filter = ViewModeFilter::new(ViewMode::Layer(0x201));
        assert!(filter.top_level_visible(&state, 0, &group));
    }

    #[test]
    fn frame_mode_shows_only_the_indexed_layer() {
        let state = two_layer_state();
        let filter = ViewModeFilter::new(ViewMode::Frame(1));
        assert!(!filter.top_level_visible(&state, 0, state.props().at(0)));
        assert!(filter.top_level_visible(&state, 1, state.props().at(1)));
    }

    #[test]
    fn manual_mode_shows_nothing() {
        let state = two_layer_state();
        let filter = ViewModeFilter::new(ViewMode::Manual);
        assert!(!filter.top_level_visible(&state, 0, state.props().at(0)));
        assert!(!filter.top_level_visible(&state, 1, state.props().at(1)));
    }
}
