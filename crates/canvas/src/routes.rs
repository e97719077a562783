use std::collections::HashMap;

use protocol::LayerId;
use smallvec::SmallVec;

use crate::layer_content::LayerContent;
use crate::layer_props::{LayerProps, LayerPropsList};
use crate::state::{CanvasState, TransientCanvasState};

pub type RoutePath = SmallVec<[usize; 4]>;

/// Path of one layer id: child indices from the root, leaf kind included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRoute {
    path: RoutePath,
    is_group: bool,
}

impl LayerRoute {
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    /// Read-only content lookup; `None` for group routes.
    pub fn content<'a>(&self, state: &'a CanvasState) -> Option<&'a LayerContent> {
        if self.is_group {
            return None;
        }
        let (parents, leaf) = self.split();
        let mut list = state.layers().as_ref();
        for &index in parents {
            list = list.at(index).as_group()?.children();
        }
        list.at(leaf).as_content().map(|content| content.as_ref())
    }

    /// Walk the stored path in a transient state, making every node on it
    /// transient on demand, and return the editable leaf content. `None` for
    /// group routes.
    pub fn entry_transient_content<'a>(
        &self,
        tcs: &'a mut TransientCanvasState,
    ) -> Option<&'a mut LayerContent> {
        if self.is_group {
            return None;
        }
        let (parents, leaf) = self.split();
        let mut list = tcs.layers_mut();
        for &index in parents {
            list = list.group_at_mut(index)?.children_mut();
        }
        list.content_at_mut(leaf)
    }

    /// Editable props leaf, making every node on the path transient.
    pub fn entry_transient_props<'a>(
        &self,
        tcs: &'a mut TransientCanvasState,
    ) -> &'a mut LayerProps {
        let (parents, leaf) = self.split();
        let mut list = tcs.props_mut();
        for &index in parents {
            list = list.at_mut(index).children_mut();
        }
        list.at_mut(leaf)
    }

    fn split(&self) -> (&[usize], usize) {
        let (last, parents) = self
            .path
            .split_last()
            .expect("layer route path cannot be empty");
        (parents, *last)
    }
}

/// Flattened index from layer id to tree position. Only valid for canvas
/// states whose layer-tree shape matches the one it was built from; rebuild
/// after any structural change.
#[derive(Debug, Default)]
pub struct LayerRoutes {
    map: HashMap<LayerId, LayerRoute>,
}

impl LayerRoutes {
    pub fn build(state: &CanvasState) -> LayerRoutes {
        let mut routes = LayerRoutes::default();
        let mut path = RoutePath::new();
        index_props_list(state.props(), &mut path, &mut routes.map);
        routes
    }

    pub fn search(&self, id: LayerId) -> Option<&LayerRoute> {
        self.map.get(&id)
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn index_props_list(
    props: &LayerPropsList,
    path: &mut RoutePath,
    map: &mut HashMap<LayerId, LayerRoute>,
) {
    for (index, entry) in props.entries().iter().enumerate() {
        path.push(index);
        let previous = map.insert(
            entry.id,
            LayerRoute {
                path: path.clone(),
                is_group: entry.is_group(),
            },
        );
        debug_assert!(previous.is_none(), "duplicate layer id {}", entry.id);
        if let Some(children) = &entry.children {
            index_props_list(children, path, map);
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pixels::{BIT15, BlendMode, UPixel15};

    use super::*;
    use crate::state::{blank_content_entry, blank_group_entry, push_layer};

    fn red() -> UPixel15 {
        UPixel15 {
            b: 0,
            g: 0,
            r: BIT15,
            a: BIT15,
        }
    }

    fn nested_state() -> CanvasState {
        let mut tcs = TransientCanvasState::new_init();
        tcs.set_width(64);
        tcs.set_height(64);

        let bottom = blank_content_entry(&tcs);
        push_layer(&mut tcs, bottom, LayerProps::new(0x100), None);

        let group = blank_group_entry(&tcs);
        push_layer(&mut tcs, group, LayerProps::new_group(0x200), None);

        let nested = blank_content_entry(&tcs);
        tcs.layers_mut()
            .group_at_mut(1)
            .expect("group entry")
            .children_mut()
            .push(nested.clone());
        tcs.props_mut()
            .at_mut(1)
            .children_mut()
            .push(Arc::new(LayerProps::new(0x201)));

        tcs.persist()
    }

    #[test]
    fn build_indexes_every_id_with_its_path() {
        let state = nested_state();
        let routes = LayerRoutes::build(&state);
        assert_eq!(routes.len(), 3);

        assert_eq!(routes.search(0x100).expect("flat layer").path(), &[0]);
        let group = routes.search(0x200).expect("group");
        assert!(group.is_group());
        assert_eq!(group.path(), &[1]);
        assert_eq!(routes.search(0x201).expect("nested layer").path(), &[1, 0]);
        assert!(routes.search(0x999).is_none());
    }

    #[test]
    fn transient_content_walk_edits_the_nested_leaf_only() {
        let state = nested_state();
        let routes = LayerRoutes::build(&state);
        let mut tcs = TransientCanvasState::new(&state);

        let content = routes
            .search(0x201)
            .expect("nested layer")
            .entry_transient_content(&mut tcs)
            .expect("content leaf");
        content.fill_rect(BlendMode::Replace, 0, 0, 4, 4, red());
        let edited = tcs.persist();

        assert_eq!(edited.flatten_pixel_at(0, 0), red().premultiply());
        assert_eq!(
            state.flatten_pixel_at(0, 0),
            pixels::Pixel15::TRANSPARENT,
            "source state shares no mutation"
        );
        // The untouched sibling is still structurally shared.
        assert!(Arc::ptr_eq(
            state.layers().at(0).as_content().expect("bottom layer"),
            edited.layers().at(0).as_content().expect("bottom layer"),
        ));
    }

    #[test]
    fn transient_props_walk_reaches_group_nodes() {
        let state = nested_state();
        let routes = LayerRoutes::build(&state);
        let mut tcs = TransientCanvasState::new(&state);

        let props = routes
            .search(0x200)
            .expect("group route")
            .entry_transient_props(&mut tcs);
        props.isolated = true;
        let edited = tcs.persist();
        assert!(edited.props().at(1).isolated);
        assert!(!state.props().at(1).isolated);
    }

    #[test]
    fn group_routes_resolve_no_content() {
        let state = nested_state();
        let routes = LayerRoutes::build(&state);
        assert!(routes.search(0x200).expect("group").content(&state).is_none());
        assert!(routes.search(0x100).expect("layer").content(&state).is_some());
    }

    #[test]
    fn rebuilt_routes_track_structural_changes() {
        let state = nested_state();
        let mut tcs = TransientCanvasState::new(&state);
        tcs.layers_mut().remove(0);
        tcs.props_mut().remove(0);
        let edited = tcs.persist();

        let routes = LayerRoutes::build(&edited);
        assert!(!routes.contains(0x100));
        assert_eq!(routes.search(0x201).expect("nested layer").path(), &[0, 0]);
    }
}
