use std::sync::{Arc, OnceLock};

use pixels::{BIT15, Pixel15, UPixel15};
use tiles::{Tile, TransientTile, tile_count_round};

use crate::annotations::{AnnotationList, DocumentMetadata};
use crate::layer_content::LayerContent;
use crate::layer_list::{LayerGroup, LayerList, LayerListEntry};
use crate::layer_props::{LayerProps, LayerPropsList};

/// Root persistent snapshot of the canvas. Cloning is cheap: all tree
/// members are shared behind reference counts and never mutated in place.
#[derive(Debug, Clone)]
pub struct CanvasState {
    width: u32,
    height: u32,
    offset_x: i32,
    offset_y: i32,
    background: Tile,
    layers: Arc<LayerList>,
    props: Arc<LayerPropsList>,
    annotations: Arc<AnnotationList>,
    metadata: Arc<DocumentMetadata>,
}

impl CanvasState {
    pub fn new() -> CanvasState {
        CanvasState {
            width: 0,
            height: 0,
            offset_x: 0,
            offset_y: 0,
            background: Tile::transparent(),
            layers: Arc::new(LayerList::new()),
            props: Arc::new(LayerPropsList::new()),
            annotations: Arc::new(AnnotationList::new()),
            metadata: Arc::new(DocumentMetadata::default()),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn offset_x(&self) -> i32 {
        self.offset_x
    }

    pub fn offset_y(&self) -> i32 {
        self.offset_y
    }

    pub fn tiles_x(&self) -> u32 {
        tile_count_round(self.width)
    }

    pub fn tiles_y(&self) -> u32 {
        tile_count_round(self.height)
    }

    pub fn background(&self) -> &Tile {
        &self.background
    }

    pub fn layers(&self) -> &Arc<LayerList> {
        &self.layers
    }

    pub fn props(&self) -> &Arc<LayerPropsList> {
        &self.props
    }

    pub fn annotations(&self) -> &Arc<AnnotationList> {
        &self.annotations
    }

    pub fn metadata(&self) -> &Arc<DocumentMetadata> {
        &self.metadata
    }

    pub fn same_props(left: &CanvasState, right: &CanvasState) -> bool {
        Arc::ptr_eq(&left.props, &right.props)
    }

    pub fn same_annotations(left: &CanvasState, right: &CanvasState) -> bool {
        Arc::ptr_eq(&left.annotations, &right.annotations)
    }

    pub fn same_metadata(left: &CanvasState, right: &CanvasState) -> bool {
        Arc::ptr_eq(&left.metadata, &right.metadata)
    }

    /// Composite one tile of the full canvas: background, then every layer
    /// bottom to top with its props applied.
    pub fn flatten_tile(&self, tile_x: u32, tile_y: u32, include_background: bool) -> TransientTile {
        let mut output = if include_background {
            TransientTile::new_from(self.background.clone())
        } else {
            TransientTile::new_blank()
        };
        flatten_list_onto(
            &mut output,
            &self.layers,
            &self.props,
            tile_x,
            tile_y,
            BIT15,
        );
        output
    }

    /// Composited canvas pixel, mostly for tests and small exports.
    pub fn flatten_pixel_at(&self, x: u32, y: u32) -> Pixel15 {
        debug_assert!(x < self.width && y < self.height);
        let tile = self.flatten_tile(x / tiles::TILE_SIZE, y / tiles::TILE_SIZE, true);
        tile.pixels()[((y % tiles::TILE_SIZE) * tiles::TILE_SIZE + (x % tiles::TILE_SIZE)) as usize]
    }
}

impl Default for CanvasState {
    fn default() -> Self {
        CanvasState::new()
    }
}

fn censor_tile() -> Tile {
    static CENSOR: OnceLock<Tile> = OnceLock::new();
    CENSOR
        .get_or_init(|| {
            Tile::solid(UPixel15 {
                b: BIT15 / 4,
                g: BIT15 / 4,
                r: BIT15 / 4,
                a: BIT15,
            })
        })
        .clone()
}

fn flatten_list_onto(
    output: &mut TransientTile,
    layers: &LayerList,
    props: &LayerPropsList,
    tile_x: u32,
    tile_y: u32,
    opacity_scale: u16,
) {
    debug_assert_eq!(layers.len(), props.len(), "props list must mirror layers");
    for (entry, entry_props) in layers.entries().iter().zip(props.entries().iter()) {
        if !entry_props.visible() {
            continue;
        }
        let opacity = pixels::blend::fix15_mul(entry_props.opacity, opacity_scale);
        if entry_props.censored {
            output.merge(Some(&censor_tile()), opacity, entry_props.blend_mode);
            continue;
        }
        match entry {
            LayerListEntry::Content(content) => {
                let tile = content.tile_with_sublayers(tile_x, tile_y);
                output.merge(tile.as_ref(), opacity, entry_props.blend_mode);
            }
            LayerListEntry::Group(group) => {
                let children_props = entry_props
                    .children
                    .as_ref()
                    .expect("group entry must carry a children props list");
                if entry_props.isolated {
                    let mut group_tile = TransientTile::new_blank();
                    flatten_list_onto(
                        &mut group_tile,
                        group.children(),
                        children_props,
                        tile_x,
                        tile_y,
                        BIT15,
                    );
                    let composited = group_tile.persist();
                    output.merge(Some(&composited), opacity, entry_props.blend_mode);
                } else {
                    flatten_list_onto(
                        output,
                        group.children(),
                        children_props,
                        tile_x,
                        tile_y,
                        opacity,
                    );
                }
            }
        }
    }
}

/// Exclusively owned editable canvas state. Created by cloning a persistent
/// state's top level only; children stay shared until a mutation path makes
/// them transient. `persist` is O(1).
#[derive(Debug)]
pub struct TransientCanvasState {
    state: CanvasState,
}

impl TransientCanvasState {
    pub fn new(from: &CanvasState) -> TransientCanvasState {
        TransientCanvasState {
            state: from.clone(),
        }
    }

    pub fn new_init() -> TransientCanvasState {
        TransientCanvasState {
            state: CanvasState::new(),
        }
    }

    pub fn as_view(&self) -> &CanvasState {
        &self.state
    }

    pub fn width(&self) -> u32 {
        self.state.width
    }

    pub fn height(&self) -> u32 {
        self.state.height
    }

    pub fn set_width(&mut self, width: u32) {
        self.state.width = width;
    }

    pub fn set_height(&mut self, height: u32) {
        self.state.height = height;
    }

    pub fn set_background(&mut self, background: Tile) {
        self.state.background = background;
    }

    pub fn layers_mut(&mut self) -> &mut LayerList {
        Arc::make_mut(&mut self.state.layers)
    }

    pub fn props_mut(&mut self) -> &mut LayerPropsList {
        Arc::make_mut(&mut self.state.props)
    }

    pub fn annotations_mut(&mut self) -> &mut AnnotationList {
        Arc::make_mut(&mut self.state.annotations)
    }

    pub fn metadata_mut(&mut self) -> &mut DocumentMetadata {
        Arc::make_mut(&mut self.state.metadata)
    }

    /// Swap in a prebuilt props list. The list must mirror the layer tree;
    /// this exists for visibility overrides that reuse a cached list to keep
    /// pointer identity stable.
    pub fn replace_props(&mut self, props: Arc<LayerPropsList>) {
        self.state.props = props;
    }

    /// Expand (or crop, for negative amounts) the canvas on each side. Every
    /// layer is repacked; the state offsets shift so coordinate anchors from
    /// before the resize can be compensated.
    pub fn resize(&mut self, top: i32, right: i32, bottom: i32, left: i32) {
        let new_width = (self.state.width as i64 + left as i64 + right as i64).max(0) as u32;
        let new_height = (self.state.height as i64 + top as i64 + bottom as i64).max(0) as u32;

        let layers = Arc::make_mut(&mut self.state.layers);
        resize_list(layers, top, right, bottom, left, new_width, new_height);

        self.state.width = new_width;
        self.state.height = new_height;
        self.state.offset_x -= left;
        self.state.offset_y -= top;
    }

    pub fn persist(self) -> CanvasState {
        #[cfg(debug_assertions)]
        debug_validate(&self.state);
        self.state
    }
}

fn resize_list(
    layers: &mut LayerList,
    top: i32,
    right: i32,
    bottom: i32,
    left: i32,
    new_width: u32,
    new_height: u32,
) {
    for index in 0..layers.len() {
        match layers.at_mut(index) {
            LayerListEntry::Content(content) => {
                let resized = content.resized(top, right, bottom, left);
                *content = Arc::new(resized);
            }
            LayerListEntry::Group(group) => {
                let group = Arc::make_mut(group);
                group.set_size(new_width, new_height);
                resize_list(
                    group.children_mut(),
                    top,
                    right,
                    bottom,
                    left,
                    new_width,
                    new_height,
                );
            }
        }
    }
}

#[cfg(debug_assertions)]
fn debug_validate(state: &CanvasState) {
    fn check_mirror(layers: &LayerList, props: &LayerPropsList) {
        assert_eq!(
            layers.len(),
            props.len(),
            "layer list and props list diverge in length"
        );
        for (entry, entry_props) in layers.entries().iter().zip(props.entries().iter()) {
            match entry {
                LayerListEntry::Group(group) => {
                    let children = entry_props
                        .children
                        .as_ref()
                        .expect("group entry missing children props");
                    check_mirror(group.children(), children);
                }
                LayerListEntry::Content(_) => {
                    assert!(
                        entry_props.children.is_none(),
                        "content entry carries children props"
                    );
                }
            }
        }
    }

    check_mirror(&state.layers, &state.props);

    let mut ids = Vec::new();
    state.props.collect_ids(&mut ids);
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(total, ids.len(), "duplicate layer id in canvas state");
}

/// Convenience used by paint ops and loaders to add a layer/props pair.
pub fn push_layer(
    tcs: &mut TransientCanvasState,
    entry: LayerListEntry,
    props: LayerProps,
    index: Option<usize>,
) {
    let position = index.unwrap_or(tcs.layers_mut().len());
    tcs.layers_mut().insert(position, entry);
    tcs.props_mut().insert(position, Arc::new(props));
}

/// Build an empty content layer entry sized to the canvas.
pub fn blank_content_entry(tcs: &TransientCanvasState) -> LayerListEntry {
    LayerListEntry::Content(Arc::new(LayerContent::new(tcs.width(), tcs.height())))
}

/// Build an empty group entry sized to the canvas.
pub fn blank_group_entry(tcs: &TransientCanvasState) -> LayerListEntry {
    LayerListEntry::Group(Arc::new(LayerGroup::new(tcs.width(), tcs.height())))
}
