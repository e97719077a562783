//! Capability interfaces the embedder supplies, one per callback family.

use std::sync::Arc;

use bitflags::bitflags;
use canvas::{AnnotationList, CanvasState, DocumentMetadata, LayerPropsList};
use protocol::{ContextId, LayerId, Message};

bitflags! {
    /// Which parts of the access-control state changed while filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AclChangeFlags: u8 {
        const USERS = 0x01;
        const LAYERS = 0x02;
        const FEATURES = 0x04;
    }
}

/// Outcome of delegated ACL evaluation for one remote message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AclResult {
    pub change_flags: AclChangeFlags,
    pub filtered: bool,
}

/// Access-control evaluation is the embedder's business; the engine only
/// forwards each remote message and honors the verdict.
pub trait AclFilter: Send {
    fn handle(&mut self, msg: &Message) -> AclResult;
}

/// An [`AclFilter`] that admits everything.
#[derive(Debug, Default)]
pub struct OpenAcl;

impl AclFilter for OpenAcl {
    fn handle(&mut self, _msg: &Message) -> AclResult {
        AclResult::default()
    }
}

/// Receives the persistent state after every accepted command, for the
/// embedder's snapshot machinery.
pub trait SavePoint: Send {
    fn save_point(&mut self, state: &Arc<CanvasState>, snapshot_requested: bool);
}

/// Sink for messages generated on the embedder's behalf, e.g. when a canvas
/// state is rebuilt into a command stream.
pub trait PushMessage {
    fn push_message(&mut self, user: ContextId, msg: Message);
}

/// Consolidated meta information emitted at the end of a `handle` call.
pub trait MetaSink {
    fn acls_changed(&mut self, flags: AclChangeFlags);
    fn laser_trail(&mut self, context_id: ContextId, persistence: u8, color: u32);
    fn move_pointer(&mut self, context_id: ContextId, x: i32, y: i32);
    fn default_layer_set(&mut self, layer_id: LayerId);
}

/// Per-tick change notifications for the GUI.
pub trait TickSink {
    fn catchup(&mut self, progress: u8);
    fn resized(&mut self, offset_x: i32, offset_y: i32, prev_width: u32, prev_height: u32);
    fn tile_changed(&mut self, tile_x: u32, tile_y: u32);
    fn layer_props_changed(&mut self, props: &Arc<LayerPropsList>);
    fn annotations_changed(&mut self, annotations: &Arc<AnnotationList>);
    fn document_metadata_changed(&mut self, metadata: &Arc<DocumentMetadata>);
    fn cursor_moved(&mut self, context_id: ContextId, layer_id: LayerId, x: i32, y: i32);
}

/// The render pass: an output-size notification followed by one callback
/// per re-composited tile.
pub trait RenderSink {
    fn render_size(&mut self, width: u32, height: u32);
    fn render_tile(&mut self, tile_x: u32, tile_y: u32, pixels: &[pixels::Pixel8]);
}
