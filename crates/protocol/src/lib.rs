//! Command records exchanged between clients and the paint engine.
//!
//! Every record is `{type, context_id, payload}`; wire types at or above
//! [`COMMAND_TYPE_START`] mutate the canvas, lower types are meta. Internal
//! messages exist only inside an engine process and have no wire type.

pub mod wire;

pub use wire::{MessageDecodeError, MessageEncodeError};

pub type ContextId = u8;
pub type LayerId = u16;
pub type AnnotationId = u16;

/// First wire type that is a canvas command rather than meta information.
pub const COMMAND_TYPE_START: u8 = 128;

/// Layer ids below this bound are reserved for sublayers and previews.
pub const RESERVED_LAYER_ID_END: LayerId = 0x100;

pub mod layer_create_flags {
    /// Create a group instead of a content layer.
    pub const GROUP: u8 = 0x01;
    /// Insert into the target layer (which must be a group) instead of above it.
    pub const INTO: u8 = 0x02;
}

pub mod layer_attr_flags {
    pub const CENSORED: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const ISOLATED: u8 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicDab {
    /// Quarter-pixel delta from the previous dab (or the origin).
    pub x: i8,
    pub y: i8,
    /// Diameter in 1/256 pixel steps.
    pub size: u16,
    pub hardness: u8,
    pub opacity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDab {
    /// Whole-pixel delta from the previous dab (or the origin).
    pub x: i8,
    pub y: i8,
    /// Diameter in whole pixels.
    pub size: u8,
    pub opacity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MyPaintDab {
    /// Quarter-pixel delta from the previous dab (or the origin).
    pub x: i8,
    pub y: i8,
    /// Diameter in 1/256 pixel steps.
    pub size: u16,
    pub hardness: u8,
    pub opacity: u8,
    pub angle: u8,
    pub aspect_ratio: u8,
}

/// Engine-internal control messages. These never appear on the wire; the
/// engine injects them into its own queues so they serialize with commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalMessage {
    Reset,
    SoftReset,
    Snapshot,
    Catchup { progress: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    // Meta (wire type < 128).
    Chat {
        text: String,
    },
    LaserTrail {
        persistence: u8,
        color: u32,
    },
    MovePointer {
        x: i32,
        y: i32,
    },
    DefaultLayer {
        layer_id: LayerId,
    },

    // Commands (wire type >= 128).
    UndoPoint,
    Undo {
        override_user: ContextId,
        redo: bool,
    },
    CanvasResize {
        top: i32,
        right: i32,
        bottom: i32,
        left: i32,
    },
    LayerCreate {
        layer_id: LayerId,
        source_id: LayerId,
        fill: u32,
        flags: u8,
        title: String,
    },
    LayerAttributes {
        layer_id: LayerId,
        sublayer: u8,
        flags: u8,
        opacity: u8,
        blend_mode: u8,
    },
    LayerRetitle {
        layer_id: LayerId,
        title: String,
    },
    LayerOrder {
        layer_ids: Vec<LayerId>,
    },
    LayerDelete {
        layer_id: LayerId,
        merge: bool,
    },
    PutImage {
        layer_id: LayerId,
        blend_mode: u8,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        /// Premultiplied 8-bit BGRA rows, `width * height * 4` bytes.
        image: Vec<u8>,
    },
    FillRect {
        layer_id: LayerId,
        blend_mode: u8,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        color: u32,
    },
    PenUp,
    DrawDabsClassic {
        layer_id: LayerId,
        /// Origin in quarter pixels.
        x: i32,
        y: i32,
        color: u32,
        blend_mode: u8,
        indirect: bool,
        dabs: Vec<ClassicDab>,
    },
    DrawDabsPixel {
        layer_id: LayerId,
        /// Origin in whole pixels.
        x: i32,
        y: i32,
        color: u32,
        blend_mode: u8,
        indirect: bool,
        dabs: Vec<PixelDab>,
    },
    DrawDabsPixelSquare {
        layer_id: LayerId,
        x: i32,
        y: i32,
        color: u32,
        blend_mode: u8,
        indirect: bool,
        dabs: Vec<PixelDab>,
    },
    DrawDabsMyPaint {
        layer_id: LayerId,
        /// Origin in quarter pixels.
        x: i32,
        y: i32,
        color: u32,
        lock_alpha: u8,
        dabs: Vec<MyPaintDab>,
    },
    AnnotationCreate {
        annotation_id: AnnotationId,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
    },
    AnnotationReshape {
        annotation_id: AnnotationId,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
    },
    AnnotationEdit {
        annotation_id: AnnotationId,
        background_color: u32,
        flags: u8,
        text: String,
    },
    AnnotationDelete {
        annotation_id: AnnotationId,
    },

    // Never on the wire.
    Internal(InternalMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub context_id: ContextId,
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(context_id: ContextId, payload: MessagePayload) -> Message {
        Message {
            context_id,
            payload,
        }
    }

    pub fn internal(payload: InternalMessage) -> Message {
        Message {
            context_id: 0,
            payload: MessagePayload::Internal(payload),
        }
    }

    /// Wire type of this message; internal messages have none.
    pub fn wire_type(&self) -> Option<u8> {
        wire::wire_type(&self.payload)
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.payload, MessagePayload::Internal(_))
    }

    pub fn is_command(&self) -> bool {
        self.wire_type()
            .is_some_and(|wire_type| wire_type >= COMMAND_TYPE_START)
    }

    /// True for messages the engine queues: canvas commands and internals.
    pub fn is_internal_or_command(&self) -> bool {
        self.is_internal() || self.is_command()
    }

    pub fn is_undo_point(&self) -> bool {
        matches!(self.payload, MessagePayload::UndoPoint)
    }

    /// Dab count for draw-dabs messages, `None` for everything else. This is
    /// what multidab batching keys on.
    pub fn dab_count(&self) -> Option<usize> {
        match &self.payload {
            MessagePayload::DrawDabsClassic { dabs, .. } => Some(dabs.len()),
            MessagePayload::DrawDabsPixel { dabs, .. }
            | MessagePayload::DrawDabsPixelSquare { dabs, .. } => Some(dabs.len()),
            MessagePayload::DrawDabsMyPaint { dabs, .. } => Some(dabs.len()),
            _ => None,
        }
    }
}
