//! Save-point consumers: a bounded queue of timestamped canvas snapshots
//! for session recovery, and rebuilding a canvas state into the command
//! stream that reproduces it.

use std::collections::VecDeque;
use std::sync::Arc;

use canvas::{CanvasState, LayerListEntry, LayerProps, LayerPropsList};
use pixels::channel_15_to_8;
use protocol::{
    ContextId, LayerId, Message, MessagePayload, layer_attr_flags, layer_create_flags,
};
use tiles::{TILE_SIZE, Tile};

use crate::callbacks::{PushMessage, SavePoint};

#[derive(Debug, Clone)]
pub struct Snapshot {
    timestamp_ms: i64,
    state: Arc<CanvasState>,
}

impl Snapshot {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn canvas_state(&self) -> &Arc<CanvasState> {
        &self.state
    }
}

/// Keeps the most recent snapshots captured from the save-point stream,
/// spaced at least `min_delay_ms` apart unless one was explicitly requested.
pub struct SnapshotQueue {
    max_count: usize,
    min_delay_ms: i64,
    timestamp: Box<dyn FnMut() -> i64 + Send>,
    entries: VecDeque<Snapshot>,
}

impl SnapshotQueue {
    pub fn new(
        max_count: usize,
        min_delay_ms: i64,
        timestamp: Box<dyn FnMut() -> i64 + Send>,
    ) -> SnapshotQueue {
        assert!(max_count > 0, "snapshot queue capacity must be nonzero");
        SnapshotQueue {
            max_count,
            min_delay_ms,
            timestamp,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }
}

impl SavePoint for SnapshotQueue {
    fn save_point(&mut self, state: &Arc<CanvasState>, snapshot_requested: bool) {
        let now = (self.timestamp)();
        let due = match self.entries.back() {
            Some(last) => now - last.timestamp_ms >= self.min_delay_ms,
            None => true,
        };
        if !snapshot_requested && !due {
            return;
        }
        self.entries.push_back(Snapshot {
            timestamp_ms: now,
            state: state.clone(),
        });
        while self.entries.len() > self.max_count {
            self.entries.pop_front();
        }
    }
}

/// Emit the command stream that rebuilds `state` from a blank canvas, used
/// when a session resets to a known image.
pub fn reset_image_build(state: &CanvasState, context_id: ContextId, push: &mut dyn PushMessage) {
    if state.width() == 0 || state.height() == 0 {
        return;
    }
    push.push_message(
        context_id,
        Message::new(
            context_id,
            MessagePayload::CanvasResize {
                top: 0,
                right: state.width() as i32,
                bottom: state.height() as i32,
                left: 0,
            },
        ),
    );

    build_layer_list(state, context_id, state.layers().entries(), state.props(), None, push);

    for annotation in state.annotations().entries() {
        push.push_message(
            context_id,
            Message::new(
                context_id,
                MessagePayload::AnnotationCreate {
                    annotation_id: annotation.id,
                    x: annotation.x,
                    y: annotation.y,
                    width: annotation.width,
                    height: annotation.height,
                },
            ),
        );
        if !annotation.text.is_empty() || annotation.background_color != 0 {
            push.push_message(
                context_id,
                Message::new(
                    context_id,
                    MessagePayload::AnnotationEdit {
                        annotation_id: annotation.id,
                        background_color: annotation.background_color,
                        flags: annotation.flags,
                        text: annotation.text.clone(),
                    },
                ),
            );
        }
    }
}

fn build_layer_list(
    state: &CanvasState,
    context_id: ContextId,
    entries: &[LayerListEntry],
    props: &LayerPropsList,
    parent: Option<LayerId>,
    push: &mut dyn PushMessage,
) {
    for (entry, entry_props) in entries.iter().zip(props.entries().iter()) {
        let is_group = entry.is_group();
        let mut flags = 0;
        if is_group {
            flags |= layer_create_flags::GROUP;
        }
        let source_id = match parent {
            Some(parent_id) => {
                flags |= layer_create_flags::INTO;
                parent_id
            }
            None => 0,
        };
        push.push_message(
            context_id,
            Message::new(
                context_id,
                MessagePayload::LayerCreate {
                    layer_id: entry_props.id,
                    source_id,
                    fill: 0,
                    flags,
                    title: entry_props.title.clone(),
                },
            ),
        );
        push_layer_attributes(context_id, entry_props, push);

        match entry {
            LayerListEntry::Group(group) => {
                let children = entry_props
                    .children
                    .as_ref()
                    .expect("group props carry children");
                build_layer_list(
                    state,
                    context_id,
                    group.children().entries(),
                    children,
                    Some(entry_props.id),
                    push,
                );
            }
            LayerListEntry::Content(content) => {
                push_content_tiles(state, context_id, entry_props.id, content, push);
            }
        }
    }
}

fn push_layer_attributes(context_id: ContextId, props: &LayerProps, push: &mut dyn PushMessage) {
    let mut flags = 0;
    if props.censored {
        flags |= layer_attr_flags::CENSORED;
    }
    if props.hidden {
        flags |= layer_attr_flags::HIDDEN;
    }
    if props.isolated {
        flags |= layer_attr_flags::ISOLATED;
    }
    push.push_message(
        context_id,
        Message::new(
            context_id,
            MessagePayload::LayerAttributes {
                layer_id: props.id,
                sublayer: 0,
                flags,
                opacity: channel_15_to_8(props.opacity),
                blend_mode: props.blend_mode as u8,
            },
        ),
    );
}

fn push_content_tiles(
    state: &CanvasState,
    context_id: ContextId,
    layer_id: LayerId,
    content: &canvas::LayerContent,
    push: &mut dyn PushMessage,
) {
    for tile_y in 0..content.tiles_y() {
        for tile_x in 0..content.tiles_x() {
            let Some(tile) = content.tile_at(tile_x, tile_y) else {
                continue;
            };
            let x = tile_x * TILE_SIZE;
            let y = tile_y * TILE_SIZE;
            let width = TILE_SIZE.min(state.width() - x);
            let height = TILE_SIZE.min(state.height() - y);
            push.push_message(
                context_id,
                Message::new(
                    context_id,
                    MessagePayload::PutImage {
                        layer_id,
                        blend_mode: pixels::BlendMode::Replace as u8,
                        x,
                        y,
                        width,
                        height,
                        image: tile_bytes(tile, width, height),
                    },
                ),
            );
        }
    }
}

fn tile_bytes(tile: &Tile, width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let pixel = tile.pixel_at(x, y).to_pixel8();
            bytes.extend_from_slice(&[pixel.b, pixel.g, pixel.r, pixel.a]);
        }
    }
    bytes
}
