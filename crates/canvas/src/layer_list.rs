use std::sync::Arc;

use crate::layer_content::LayerContent;

/// One child of a layer list: pixel content or a nested group. The matching
/// properties live at the same index of the mirrored props list.
#[derive(Debug, Clone)]
pub enum LayerListEntry {
    Content(Arc<LayerContent>),
    Group(Arc<LayerGroup>),
}

impl LayerListEntry {
    pub fn is_group(&self) -> bool {
        matches!(self, LayerListEntry::Group(_))
    }

    pub fn as_content(&self) -> Option<&Arc<LayerContent>> {
        match self {
            LayerListEntry::Content(content) => Some(content),
            LayerListEntry::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<LayerGroup>> {
        match self {
            LayerListEntry::Group(group) => Some(group),
            LayerListEntry::Content(_) => None,
        }
    }
}

/// Ordered list of layers and groups, bottom first.
#[derive(Debug, Clone, Default)]
pub struct LayerList {
    entries: Vec<LayerListEntry>,
}

impl LayerList {
    pub fn new() -> LayerList {
        LayerList::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LayerListEntry] {
        &self.entries
    }

    pub fn at(&self, index: usize) -> &LayerListEntry {
        &self.entries[index]
    }

    pub fn at_mut(&mut self, index: usize) -> &mut LayerListEntry {
        &mut self.entries[index]
    }

    pub fn content_at_mut(&mut self, index: usize) -> Option<&mut LayerContent> {
        match &mut self.entries[index] {
            LayerListEntry::Content(content) => Some(Arc::make_mut(content)),
            LayerListEntry::Group(_) => None,
        }
    }

    pub fn group_at_mut(&mut self, index: usize) -> Option<&mut LayerGroup> {
        match &mut self.entries[index] {
            LayerListEntry::Group(group) => Some(Arc::make_mut(group)),
            LayerListEntry::Content(_) => None,
        }
    }

    pub fn insert(&mut self, index: usize, entry: LayerListEntry) {
        self.entries.insert(index, entry);
    }

    pub fn push(&mut self, entry: LayerListEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, index: usize) -> LayerListEntry {
        self.entries.remove(index)
    }

    /// Reorder entries to `order`, a permutation of the current indices.
    pub fn reorder(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.entries.len());
        let mut reordered = Vec::with_capacity(self.entries.len());
        for &index in order {
            reordered.push(self.entries[index].clone());
        }
        self.entries = reordered;
    }
}

/// A group node: an ordered sub-stack composited as one unit when its props
/// mark it isolated.
#[derive(Debug, Clone)]
pub struct LayerGroup {
    width: u32,
    height: u32,
    children: LayerList,
}

impl LayerGroup {
    pub fn new(width: u32, height: u32) -> LayerGroup {
        LayerGroup {
            width,
            height,
            children: LayerList::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn children(&self) -> &LayerList {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut LayerList {
        &mut self.children
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }
}
