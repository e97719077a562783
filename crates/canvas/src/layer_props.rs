use std::sync::Arc;

use pixels::{BIT15, BlendMode};
use protocol::LayerId;

/// Per-node properties of a layer or group. The props tree mirrors the layer
/// tree node for node; `children` is present exactly on group nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerProps {
    pub id: LayerId,
    pub title: String,
    /// Opacity in `[0, BIT15]`.
    pub opacity: u16,
    pub blend_mode: BlendMode,
    pub hidden: bool,
    pub isolated: bool,
    pub censored: bool,
    pub children: Option<Arc<LayerPropsList>>,
}

impl LayerProps {
    pub fn new(id: LayerId) -> LayerProps {
        LayerProps {
            id,
            title: String::new(),
            opacity: BIT15,
            blend_mode: BlendMode::Normal,
            hidden: false,
            isolated: false,
            censored: false,
            children: None,
        }
    }

    pub fn new_group(id: LayerId) -> LayerProps {
        LayerProps {
            children: Some(Arc::new(LayerPropsList::new())),
            ..LayerProps::new(id)
        }
    }

    pub fn is_group(&self) -> bool {
        self.children.is_some()
    }

    /// Effectively invisible nodes can be skipped during compositing.
    pub fn visible(&self) -> bool {
        !self.hidden && self.opacity > 0
    }

    pub fn children_mut(&mut self) -> &mut LayerPropsList {
        let children = self
            .children
            .as_mut()
            .expect("children_mut called on a non-group props node");
        Arc::make_mut(children)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerPropsList {
    entries: Vec<Arc<LayerProps>>,
}

impl LayerPropsList {
    pub fn new() -> LayerPropsList {
        LayerPropsList::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<LayerProps>] {
        &self.entries
    }

    pub fn at(&self, index: usize) -> &Arc<LayerProps> {
        &self.entries[index]
    }

    pub fn at_mut(&mut self, index: usize) -> &mut LayerProps {
        Arc::make_mut(&mut self.entries[index])
    }

    pub fn insert(&mut self, index: usize, props: Arc<LayerProps>) {
        self.entries.insert(index, props);
    }

    pub fn push(&mut self, props: Arc<LayerProps>) {
        self.entries.push(props);
    }

    pub fn remove(&mut self, index: usize) -> Arc<LayerProps> {
        self.entries.remove(index)
    }

    /// Reorder entries to `order`, which must be a permutation of the
    /// current indices.
    pub fn reorder(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.entries.len());
        let mut reordered = Vec::with_capacity(self.entries.len());
        for &index in order {
            reordered.push(self.entries[index].clone());
        }
        self.entries = reordered;
    }

    /// Depth-first search for a props node by layer id.
    pub fn find(&self, id: LayerId) -> Option<&Arc<LayerProps>> {
        for entry in &self.entries {
            if entry.id == id {
                return Some(entry);
            }
            if let Some(children) = &entry.children
                && let Some(found) = children.find(id)
            {
                return Some(found);
            }
        }
        None
    }

    /// Collect every id in the subtree, depth first.
    pub fn collect_ids(&self, out: &mut Vec<LayerId>) {
        for entry in &self.entries {
            out.push(entry.id);
            if let Some(children) = &entry.children {
                children.collect_ids(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_props_default_to_fully_opaque_normal() {
        let props = LayerProps::new(0x100);
        assert_eq!(props.opacity, BIT15);
        assert_eq!(props.blend_mode, BlendMode::Normal);
        assert!(props.visible());
        assert!(!props.is_group());
    }

    #[test]
    fn hidden_or_zero_opacity_nodes_are_invisible() {
        let mut props = LayerProps::new(0x100);
        props.hidden = true;
        assert!(!props.visible());
        props.hidden = false;
        props.opacity = 0;
        assert!(!props.visible());
    }

    #[test]
    fn find_descends_into_group_children() {
        let mut root = LayerPropsList::new();
        let mut group = LayerProps::new_group(0x200);
        group.children_mut().push(Arc::new(LayerProps::new(0x201)));
        root.push(Arc::new(group));
        root.push(Arc::new(LayerProps::new(0x100)));

        assert_eq!(root.find(0x201).expect("nested id").id, 0x201);
        assert_eq!(root.find(0x100).expect("top level id").id, 0x100);
        assert!(root.find(0x999).is_none());
    }

    #[test]
    fn reorder_applies_a_permutation() {
        let mut list = LayerPropsList::new();
        for id in [0x100, 0x101, 0x102] {
            list.push(Arc::new(LayerProps::new(id)));
        }
        list.reorder(&[2, 0, 1]);
        let ids: Vec<LayerId> = list.entries().iter().map(|props| props.id).collect();
        assert_eq!(ids, vec![0x102, 0x100, 0x101]);
    }

    #[test]
    fn collect_ids_walks_depth_first() {
        let mut root = LayerPropsList::new();
        let mut group = LayerProps::new_group(0x200);
        group.children_mut().push(Arc::new(LayerProps::new(0x201)));
        root.push(Arc::new(group));
        root.push(Arc::new(LayerProps::new(0x100)));

        let mut ids = Vec::new();
        root.collect_ids(&mut ids);
        assert_eq!(ids, vec![0x200, 0x201, 0x100]);
    }
}
