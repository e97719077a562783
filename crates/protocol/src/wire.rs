//! Byte-exact framing: `{type: u8, context_id: u8, payload_len: u16 BE,
//! payload}`. Every command payload round-trips byte for byte.

use std::fmt;

use crate::{
    ClassicDab, Message, MessagePayload, MyPaintDab, PixelDab,
};

pub const HEADER_LENGTH: usize = 4;

const TYPE_CHAT: u8 = 32;
const TYPE_LASER_TRAIL: u8 = 33;
const TYPE_MOVE_POINTER: u8 = 34;
const TYPE_DEFAULT_LAYER: u8 = 35;

const TYPE_UNDO_POINT: u8 = 128;
const TYPE_UNDO: u8 = 129;
const TYPE_CANVAS_RESIZE: u8 = 130;
const TYPE_LAYER_CREATE: u8 = 131;
const TYPE_LAYER_ATTRIBUTES: u8 = 132;
const TYPE_LAYER_RETITLE: u8 = 133;
const TYPE_LAYER_ORDER: u8 = 134;
const TYPE_LAYER_DELETE: u8 = 135;
const TYPE_PUT_IMAGE: u8 = 136;
const TYPE_FILL_RECT: u8 = 137;
const TYPE_PEN_UP: u8 = 138;
const TYPE_DRAW_DABS_CLASSIC: u8 = 139;
const TYPE_DRAW_DABS_PIXEL: u8 = 140;
const TYPE_DRAW_DABS_PIXEL_SQUARE: u8 = 141;
const TYPE_DRAW_DABS_MYPAINT: u8 = 142;
const TYPE_ANNOTATION_CREATE: u8 = 143;
const TYPE_ANNOTATION_RESHAPE: u8 = 144;
const TYPE_ANNOTATION_EDIT: u8 = 145;
const TYPE_ANNOTATION_DELETE: u8 = 146;

const CLASSIC_DAB_LENGTH: usize = 6;
const PIXEL_DAB_LENGTH: usize = 4;
const MYPAINT_DAB_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEncodeError {
    /// Internal messages have no wire representation.
    InternalMessage,
    PayloadTooLong { length: usize },
}

impl fmt::Display for MessageEncodeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageEncodeError::InternalMessage => {
                write!(formatter, "internal messages cannot be serialized")
            }
            MessageEncodeError::PayloadTooLong { length } => {
                write!(formatter, "payload of {length} bytes exceeds the u16 frame limit")
            }
        }
    }
}

impl std::error::Error for MessageEncodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDecodeError {
    UnexpectedEnd,
    UnknownType { wire_type: u8 },
    TrailingGarbage { wire_type: u8 },
    PayloadMisaligned { wire_type: u8 },
    InvalidText,
}

impl fmt::Display for MessageDecodeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDecodeError::UnexpectedEnd => write!(formatter, "message frame truncated"),
            MessageDecodeError::UnknownType { wire_type } => {
                write!(formatter, "unknown message type {wire_type}")
            }
            MessageDecodeError::TrailingGarbage { wire_type } => {
                write!(formatter, "trailing bytes after payload of type {wire_type}")
            }
            MessageDecodeError::PayloadMisaligned { wire_type } => {
                write!(formatter, "payload of type {wire_type} has a misaligned length")
            }
            MessageDecodeError::InvalidText => write!(formatter, "payload text is not utf-8"),
        }
    }
}

impl std::error::Error for MessageDecodeError {}

pub(crate) fn wire_type(payload: &MessagePayload) -> Option<u8> {
    Some(match payload {
        MessagePayload::Chat { .. } => TYPE_CHAT,
        MessagePayload::LaserTrail { .. } => TYPE_LASER_TRAIL,
        MessagePayload::MovePointer { .. } => TYPE_MOVE_POINTER,
        MessagePayload::DefaultLayer { .. } => TYPE_DEFAULT_LAYER,
        MessagePayload::UndoPoint => TYPE_UNDO_POINT,
        MessagePayload::Undo { .. } => TYPE_UNDO,
        MessagePayload::CanvasResize { .. } => TYPE_CANVAS_RESIZE,
        MessagePayload::LayerCreate { .. } => TYPE_LAYER_CREATE,
        MessagePayload::LayerAttributes { .. } => TYPE_LAYER_ATTRIBUTES,
        MessagePayload::LayerRetitle { .. } => TYPE_LAYER_RETITLE,
        MessagePayload::LayerOrder { .. } => TYPE_LAYER_ORDER,
        MessagePayload::LayerDelete { .. } => TYPE_LAYER_DELETE,
        MessagePayload::PutImage { .. } => TYPE_PUT_IMAGE,
        MessagePayload::FillRect { .. } => TYPE_FILL_RECT,
        MessagePayload::PenUp => TYPE_PEN_UP,
        MessagePayload::DrawDabsClassic { .. } => TYPE_DRAW_DABS_CLASSIC,
        MessagePayload::DrawDabsPixel { .. } => TYPE_DRAW_DABS_PIXEL,
        MessagePayload::DrawDabsPixelSquare { .. } => TYPE_DRAW_DABS_PIXEL_SQUARE,
        MessagePayload::DrawDabsMyPaint { .. } => TYPE_DRAW_DABS_MYPAINT,
        MessagePayload::AnnotationCreate { .. } => TYPE_ANNOTATION_CREATE,
        MessagePayload::AnnotationReshape { .. } => TYPE_ANNOTATION_RESHAPE,
        MessagePayload::AnnotationEdit { .. } => TYPE_ANNOTATION_EDIT,
        MessagePayload::AnnotationDelete { .. } => TYPE_ANNOTATION_DELETE,
        MessagePayload::Internal(_) => return None,
    })
}

struct PayloadWriter {
    bytes: Vec<u8>,
}

impl PayloadWriter {
    fn new() -> PayloadWriter {
        PayloadWriter { bytes: Vec::new() }
    }

    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn i8(&mut self, value: i8) {
        self.bytes.push(value as u8);
    }

    fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
    }

    fn text(&mut self, value: &str) {
        self.bytes.extend_from_slice(value.as_bytes());
    }
}

struct PayloadReader<'a> {
    wire_type: u8,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(wire_type: u8, bytes: &'a [u8]) -> PayloadReader<'a> {
        PayloadReader {
            wire_type,
            bytes,
            pos: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], MessageDecodeError> {
        if self.remaining() < count {
            return Err(MessageDecodeError::UnexpectedEnd);
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MessageDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, MessageDecodeError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16, MessageDecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, MessageDecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, MessageDecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }

    fn rest_text(&mut self) -> Result<String, MessageDecodeError> {
        String::from_utf8(self.rest().to_vec()).map_err(|_| MessageDecodeError::InvalidText)
    }

    fn finish(self) -> Result<(), MessageDecodeError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(MessageDecodeError::TrailingGarbage {
                wire_type: self.wire_type,
            })
        }
    }
}

impl Message {
    /// Append the framed message to `out`.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), MessageEncodeError> {
        let wire_type = wire_type(&self.payload).ok_or(MessageEncodeError::InternalMessage)?;
        let payload = encode_payload(&self.payload);
        let length =
            u16::try_from(payload.len()).map_err(|_| MessageEncodeError::PayloadTooLong {
                length: payload.len(),
            })?;
        out.push(wire_type);
        out.push(self.context_id);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode one framed message, returning it and the bytes consumed.
    pub fn deserialize(bytes: &[u8]) -> Result<(Message, usize), MessageDecodeError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(MessageDecodeError::UnexpectedEnd);
        }
        let wire_type = bytes[0];
        let context_id = bytes[1];
        let length = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let end = HEADER_LENGTH + length;
        if bytes.len() < end {
            return Err(MessageDecodeError::UnexpectedEnd);
        }
        let payload = decode_payload(wire_type, &bytes[HEADER_LENGTH..end])?;
        Ok((Message::new(context_id, payload), end))
    }
}

fn encode_payload(payload: &MessagePayload) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    match payload {
        MessagePayload::Chat { text } => writer.text(text),
        MessagePayload::LaserTrail { persistence, color } => {
            writer.u8(*persistence);
            writer.u32(*color);
        }
        MessagePayload::MovePointer { x, y } => {
            writer.i32(*x);
            writer.i32(*y);
        }
        MessagePayload::DefaultLayer { layer_id } => writer.u16(*layer_id),
        MessagePayload::UndoPoint | MessagePayload::PenUp => {}
        MessagePayload::Undo {
            override_user,
            redo,
        } => {
            writer.u8(*override_user);
            writer.u8(u8::from(*redo));
        }
        MessagePayload::CanvasResize {
            top,
            right,
            bottom,
            left,
        } => {
            writer.i32(*top);
            writer.i32(*right);
            writer.i32(*bottom);
            writer.i32(*left);
        }
        MessagePayload::LayerCreate {
            layer_id,
            source_id,
            fill,
            flags,
            title,
        } => {
            writer.u16(*layer_id);
            writer.u16(*source_id);
            writer.u32(*fill);
            writer.u8(*flags);
            writer.text(title);
        }
        MessagePayload::LayerAttributes {
            layer_id,
            sublayer,
            flags,
            opacity,
            blend_mode,
        } => {
            writer.u16(*layer_id);
            writer.u8(*sublayer);
            writer.u8(*flags);
            writer.u8(*opacity);
            writer.u8(*blend_mode);
        }
        MessagePayload::LayerRetitle { layer_id, title } => {
            writer.u16(*layer_id);
            writer.text(title);
        }
        MessagePayload::LayerOrder { layer_ids } => {
            for layer_id in layer_ids {
                writer.u16(*layer_id);
            }
        }
        MessagePayload::LayerDelete { layer_id, merge } => {
            writer.u16(*layer_id);
            writer.u8(u8::from(*merge));
        }
        MessagePayload::PutImage {
            layer_id,
            blend_mode,
            x,
            y,
            width,
            height,
            image,
        } => {
            writer.u16(*layer_id);
            writer.u8(*blend_mode);
            writer.u32(*x);
            writer.u32(*y);
            writer.u32(*width);
            writer.u32(*height);
            writer.bytes(image);
        }
        MessagePayload::FillRect {
            layer_id,
            blend_mode,
            x,
            y,
            width,
            height,
            color,
        } => {
            writer.u16(*layer_id);
            writer.u8(*blend_mode);
            writer.u32(*x);
            writer.u32(*y);
            writer.u32(*width);
            writer.u32(*height);
            writer.u32(*color);
        }
        MessagePayload::DrawDabsClassic {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        } => {
            writer.u16(*layer_id);
            writer.i32(*x);
            writer.i32(*y);
            writer.u32(*color);
            writer.u8(*blend_mode);
            writer.u8(u8::from(*indirect));
            for dab in dabs {
                writer.i8(dab.x);
                writer.i8(dab.y);
                writer.u16(dab.size);
                writer.u8(dab.hardness);
                writer.u8(dab.opacity);
            }
        }
        MessagePayload::DrawDabsPixel {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        }
        | MessagePayload::DrawDabsPixelSquare {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        } => {
            writer.u16(*layer_id);
            writer.i32(*x);
            writer.i32(*y);
            writer.u32(*color);
            writer.u8(*blend_mode);
            writer.u8(u8::from(*indirect));
            for dab in dabs {
                writer.i8(dab.x);
                writer.i8(dab.y);
                writer.u8(dab.size);
                writer.u8(dab.opacity);
            }
        }
        MessagePayload::DrawDabsMyPaint {
            layer_id,
            x,
            y,
            color,
            lock_alpha,
            dabs,
        } => {
            writer.u16(*layer_id);
            writer.i32(*x);
            writer.i32(*y);
            writer.u32(*color);
            writer.u8(*lock_alpha);
            writer.u8(0);
            for dab in dabs {
                writer.i8(dab.x);
                writer.i8(dab.y);
                writer.u16(dab.size);
                writer.u8(dab.hardness);
                writer.u8(dab.opacity);
                writer.u8(dab.angle);
                writer.u8(dab.aspect_ratio);
            }
        }
        MessagePayload::AnnotationCreate {
            annotation_id,
            x,
            y,
            width,
            height,
        }
        | MessagePayload::AnnotationReshape {
            annotation_id,
            x,
            y,
            width,
            height,
        } => {
            writer.u16(*annotation_id);
            writer.i32(*x);
            writer.i32(*y);
            writer.u16(*width);
            writer.u16(*height);
        }
        MessagePayload::AnnotationEdit {
            annotation_id,
            background_color,
            flags,
            text,
        } => {
            writer.u16(*annotation_id);
            writer.u32(*background_color);
            writer.u8(*flags);
            writer.text(text);
        }
        MessagePayload::AnnotationDelete { annotation_id } => writer.u16(*annotation_id),
        MessagePayload::Internal(_) => {
            unreachable!("internal messages are rejected before payload encoding")
        }
    }
    writer.bytes
}

fn decode_payload(wire_type: u8, bytes: &[u8]) -> Result<MessagePayload, MessageDecodeError> {
    let mut reader = PayloadReader::new(wire_type, bytes);
    let payload = match wire_type {
        TYPE_CHAT => MessagePayload::Chat {
            text: reader.rest_text()?,
        },
        TYPE_LASER_TRAIL => MessagePayload::LaserTrail {
            persistence: reader.u8()?,
            color: reader.u32()?,
        },
        TYPE_MOVE_POINTER => MessagePayload::MovePointer {
            x: reader.i32()?,
            y: reader.i32()?,
        },
        TYPE_DEFAULT_LAYER => MessagePayload::DefaultLayer {
            layer_id: reader.u16()?,
        },
        TYPE_UNDO_POINT => MessagePayload::UndoPoint,
        TYPE_UNDO => MessagePayload::Undo {
            override_user: reader.u8()?,
            redo: reader.u8()? != 0,
        },
        TYPE_CANVAS_RESIZE => MessagePayload::CanvasResize {
            top: reader.i32()?,
            right: reader.i32()?,
            bottom: reader.i32()?,
            left: reader.i32()?,
        },
        TYPE_LAYER_CREATE => MessagePayload::LayerCreate {
            layer_id: reader.u16()?,
            source_id: reader.u16()?,
            fill: reader.u32()?,
            flags: reader.u8()?,
            title: reader.rest_text()?,
        },
        TYPE_LAYER_ATTRIBUTES => MessagePayload::LayerAttributes {
            layer_id: reader.u16()?,
            sublayer: reader.u8()?,
            flags: reader.u8()?,
            opacity: reader.u8()?,
            blend_mode: reader.u8()?,
        },
        TYPE_LAYER_RETITLE => MessagePayload::LayerRetitle {
            layer_id: reader.u16()?,
            title: reader.rest_text()?,
        },
        TYPE_LAYER_ORDER => {
            if reader.remaining() % 2 != 0 {
                return Err(MessageDecodeError::PayloadMisaligned { wire_type });
            }
            let mut layer_ids = Vec::with_capacity(reader.remaining() / 2);
            while reader.remaining() > 0 {
                layer_ids.push(reader.u16()?);
            }
            MessagePayload::LayerOrder { layer_ids }
        }
        TYPE_LAYER_DELETE => MessagePayload::LayerDelete {
            layer_id: reader.u16()?,
            merge: reader.u8()? != 0,
        },
        TYPE_PUT_IMAGE => MessagePayload::PutImage {
            layer_id: reader.u16()?,
            blend_mode: reader.u8()?,
            x: reader.u32()?,
            y: reader.u32()?,
            width: reader.u32()?,
            height: reader.u32()?,
            image: reader.rest().to_vec(),
        },
        TYPE_FILL_RECT => MessagePayload::FillRect {
            layer_id: reader.u16()?,
            blend_mode: reader.u8()?,
            x: reader.u32()?,
            y: reader.u32()?,
            width: reader.u32()?,
            height: reader.u32()?,
            color: reader.u32()?,
        },
        TYPE_PEN_UP => MessagePayload::PenUp,
        TYPE_DRAW_DABS_CLASSIC => {
            let layer_id = reader.u16()?;
            let x = reader.i32()?;
            let y = reader.i32()?;
            let color = reader.u32()?;
            let blend_mode = reader.u8()?;
            let indirect = reader.u8()? != 0;
            if reader.remaining() % CLASSIC_DAB_LENGTH != 0 {
                return Err(MessageDecodeError::PayloadMisaligned { wire_type });
            }
            let mut dabs = Vec::with_capacity(reader.remaining() / CLASSIC_DAB_LENGTH);
            while reader.remaining() > 0 {
                dabs.push(ClassicDab {
                    x: reader.i8()?,
                    y: reader.i8()?,
                    size: reader.u16()?,
                    hardness: reader.u8()?,
                    opacity: reader.u8()?,
                });
            }
            MessagePayload::DrawDabsClassic {
                layer_id,
                x,
                y,
                color,
                blend_mode,
                indirect,
                dabs,
            }
        }
        TYPE_DRAW_DABS_PIXEL | TYPE_DRAW_DABS_PIXEL_SQUARE => {
            let layer_id = reader.u16()?;
            let x = reader.i32()?;
            let y = reader.i32()?;
            let color = reader.u32()?;
            let blend_mode = reader.u8()?;
            let indirect = reader.u8()? != 0;
            if reader.remaining() % PIXEL_DAB_LENGTH != 0 {
                return Err(MessageDecodeError::PayloadMisaligned { wire_type });
            }
            let mut dabs = Vec::with_capacity(reader.remaining() / PIXEL_DAB_LENGTH);
            while reader.remaining() > 0 {
                dabs.push(PixelDab {
                    x: reader.i8()?,
                    y: reader.i8()?,
                    size: reader.u8()?,
                    opacity: reader.u8()?,
                });
            }
            if wire_type == TYPE_DRAW_DABS_PIXEL {
                MessagePayload::DrawDabsPixel {
                    layer_id,
                    x,
                    y,
                    color,
                    blend_mode,
                    indirect,
                    dabs,
                }
            } else {
                MessagePayload::DrawDabsPixelSquare {
                    layer_id,
                    x,
                    y,
                    color,
                    blend_mode,
                    indirect,
                    dabs,
                }
            }
        }
        TYPE_DRAW_DABS_MYPAINT => {
            let layer_id = reader.u16()?;
            let x = reader.i32()?;
            let y = reader.i32()?;
            let color = reader.u32()?;
            let lock_alpha = reader.u8()?;
            let _reserved = reader.u8()?;
            if reader.remaining() % MYPAINT_DAB_LENGTH != 0 {
                return Err(MessageDecodeError::PayloadMisaligned { wire_type });
            }
            let mut dabs = Vec::with_capacity(reader.remaining() / MYPAINT_DAB_LENGTH);
            while reader.remaining() > 0 {
                dabs.push(MyPaintDab {
                    x: reader.i8()?,
                    y: reader.i8()?,
                    size: reader.u16()?,
                    hardness: reader.u8()?,
                    opacity: reader.u8()?,
                    angle: reader.u8()?,
                    aspect_ratio: reader.u8()?,
                });
            }
            MessagePayload::DrawDabsMyPaint {
                layer_id,
                x,
                y,
                color,
                lock_alpha,
                dabs,
            }
        }
        TYPE_ANNOTATION_CREATE | TYPE_ANNOTATION_RESHAPE => {
            let annotation_id = reader.u16()?;
            let x = reader.i32()?;
            let y = reader.i32()?;
            let width = reader.u16()?;
            let height = reader.u16()?;
            if wire_type == TYPE_ANNOTATION_CREATE {
                MessagePayload::AnnotationCreate {
                    annotation_id,
                    x,
                    y,
                    width,
                    height,
                }
            } else {
                MessagePayload::AnnotationReshape {
                    annotation_id,
                    x,
                    y,
                    width,
                    height,
                }
            }
        }
        TYPE_ANNOTATION_EDIT => MessagePayload::AnnotationEdit {
            annotation_id: reader.u16()?,
            background_color: reader.u32()?,
            flags: reader.u8()?,
            text: reader.rest_text()?,
        },
        TYPE_ANNOTATION_DELETE => MessagePayload::AnnotationDelete {
            annotation_id: reader.u16()?,
        },
        wire_type => return Err(MessageDecodeError::UnknownType { wire_type }),
    };
    reader.finish()?;
    Ok(payload)
}
