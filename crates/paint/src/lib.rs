//! Applying command records to a transient canvas state. Each operation
//! validates against the current tree, then edits along one mutation path;
//! on error the caller discards the transient, leaving the persistent state
//! untouched.

pub mod brushes;

use std::fmt;
use std::sync::Arc;

use canvas::{
    Annotation, LayerContent, LayerList, LayerListEntry, LayerProps, LayerRoutes,
    TransientCanvasState,
};
use pixels::{BIT15, BlendMode, Pixel8, UPixel15, channel_8_to_15};
use protocol::{
    AnnotationId, ContextId, LayerId, Message, MessagePayload, RESERVED_LAYER_ID_END,
    layer_attr_flags, layer_create_flags,
};

use brushes::DabMask;

/// Largest canvas dimension a resize may produce.
pub const MAX_CANVAS_SIZE: u32 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintError {
    NotACanvasCommand,
    InvalidLayer { layer_id: LayerId },
    LayerExists { layer_id: LayerId },
    InvalidBlendMode { value: u8 },
    InvalidResize,
    BadLayerOrder,
    CannotMergeLayer { layer_id: LayerId },
    ImageSizeMismatch { expected: usize, actual: usize },
    EmptyRect,
    InvalidAnnotation { annotation_id: AnnotationId },
    AnnotationExists { annotation_id: AnnotationId },
}

impl fmt::Display for PaintError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaintError::NotACanvasCommand => {
                write!(formatter, "message is not a canvas command")
            }
            PaintError::InvalidLayer { layer_id } => {
                write!(formatter, "invalid layer id {layer_id:#x}")
            }
            PaintError::LayerExists { layer_id } => {
                write!(formatter, "layer id {layer_id:#x} already exists")
            }
            PaintError::InvalidBlendMode { value } => {
                write!(formatter, "invalid blend mode {value}")
            }
            PaintError::InvalidResize => write!(formatter, "resize outside canvas limits"),
            PaintError::BadLayerOrder => {
                write!(formatter, "layer order is not a permutation of the root stack")
            }
            PaintError::CannotMergeLayer { layer_id } => {
                write!(formatter, "layer {layer_id:#x} has nothing below to merge into")
            }
            PaintError::ImageSizeMismatch { expected, actual } => {
                write!(formatter, "image payload is {actual} bytes, expected {expected}")
            }
            PaintError::EmptyRect => write!(formatter, "rectangle has no area"),
            PaintError::InvalidAnnotation { annotation_id } => {
                write!(formatter, "invalid annotation id {annotation_id}")
            }
            PaintError::AnnotationExists { annotation_id } => {
                write!(formatter, "annotation id {annotation_id} already exists")
            }
        }
    }
}

impl std::error::Error for PaintError {}

/// Apply one command record. `UndoPoint` is a no-op at this level; undo
/// itself never reaches paint.
pub fn apply(tcs: &mut TransientCanvasState, msg: &Message) -> Result<(), PaintError> {
    let context_id = msg.context_id;
    match &msg.payload {
        MessagePayload::UndoPoint => Ok(()),
        MessagePayload::PenUp => {
            merge_indirect_sublayers(tcs.layers_mut(), LayerId::from(context_id));
            Ok(())
        }
        MessagePayload::CanvasResize {
            top,
            right,
            bottom,
            left,
        } => canvas_resize(tcs, *top, *right, *bottom, *left),
        MessagePayload::LayerCreate {
            layer_id,
            source_id,
            fill,
            flags,
            title,
        } => layer_create(tcs, *layer_id, *source_id, *fill, *flags, title),
        MessagePayload::LayerAttributes {
            layer_id,
            sublayer,
            flags,
            opacity,
            blend_mode,
        } => layer_attributes(tcs, *layer_id, *sublayer, *flags, *opacity, *blend_mode),
        MessagePayload::LayerRetitle { layer_id, title } => layer_retitle(tcs, *layer_id, title),
        MessagePayload::LayerOrder { layer_ids } => layer_order(tcs, layer_ids),
        MessagePayload::LayerDelete { layer_id, merge } => layer_delete(tcs, *layer_id, *merge),
        MessagePayload::PutImage {
            layer_id,
            blend_mode,
            x,
            y,
            width,
            height,
            image,
        } => put_image(tcs, *layer_id, *blend_mode, *x, *y, *width, *height, image),
        MessagePayload::FillRect {
            layer_id,
            blend_mode,
            x,
            y,
            width,
            height,
            color,
        } => fill_rect(tcs, *layer_id, *blend_mode, *x, *y, *width, *height, *color),
        MessagePayload::DrawDabsClassic { .. }
        | MessagePayload::DrawDabsPixel { .. }
        | MessagePayload::DrawDabsPixelSquare { .. }
        | MessagePayload::DrawDabsMyPaint { .. } => draw_dabs(tcs, context_id, msg, 0, 0),
        MessagePayload::AnnotationCreate {
            annotation_id,
            x,
            y,
            width,
            height,
        } => annotation_create(tcs, *annotation_id, *x, *y, *width, *height),
        MessagePayload::AnnotationReshape {
            annotation_id,
            x,
            y,
            width,
            height,
        } => annotation_reshape(tcs, *annotation_id, *x, *y, *width, *height),
        MessagePayload::AnnotationEdit {
            annotation_id,
            background_color,
            flags,
            text,
        } => annotation_edit(tcs, *annotation_id, *background_color, *flags, text),
        MessagePayload::AnnotationDelete { annotation_id } => {
            annotation_delete(tcs, *annotation_id)
        }
        MessagePayload::Undo { .. }
        | MessagePayload::Chat { .. }
        | MessagePayload::LaserTrail { .. }
        | MessagePayload::MovePointer { .. }
        | MessagePayload::DefaultLayer { .. }
        | MessagePayload::Internal(_) => Err(PaintError::NotACanvasCommand),
    }
}

fn blend_mode_for_layer(value: u8) -> Result<BlendMode, PaintError> {
    let mode = BlendMode::try_from(value).map_err(|_| PaintError::InvalidBlendMode { value })?;
    if mode.valid_for_layer() {
        Ok(mode)
    } else {
        Err(PaintError::InvalidBlendMode { value })
    }
}

fn blend_mode_for_brush(value: u8) -> Result<BlendMode, PaintError> {
    let mode = BlendMode::try_from(value).map_err(|_| PaintError::InvalidBlendMode { value })?;
    if mode.valid_for_brush() {
        Ok(mode)
    } else {
        Err(PaintError::InvalidBlendMode { value })
    }
}

fn merge_indirect_sublayers(list: &mut LayerList, sublayer_id: LayerId) {
    for index in 0..list.len() {
        match list.at_mut(index) {
            LayerListEntry::Content(content) => {
                if content.has_sublayer(sublayer_id) {
                    Arc::make_mut(content).merge_sublayer(sublayer_id);
                }
            }
            LayerListEntry::Group(group) => {
                merge_indirect_sublayers(Arc::make_mut(group).children_mut(), sublayer_id);
            }
        }
    }
}

fn canvas_resize(
    tcs: &mut TransientCanvasState,
    top: i32,
    right: i32,
    bottom: i32,
    left: i32,
) -> Result<(), PaintError> {
    let new_width = i64::from(tcs.width()) + i64::from(left) + i64::from(right);
    let new_height = i64::from(tcs.height()) + i64::from(top) + i64::from(bottom);
    if new_width < 1
        || new_height < 1
        || new_width > i64::from(MAX_CANVAS_SIZE)
        || new_height > i64::from(MAX_CANVAS_SIZE)
    {
        return Err(PaintError::InvalidResize);
    }
    tcs.resize(top, right, bottom, left);
    Ok(())
}

fn layer_create(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    source_id: LayerId,
    fill: u32,
    flags: u8,
    title: &str,
) -> Result<(), PaintError> {
    if layer_id < RESERVED_LAYER_ID_END {
        return Err(PaintError::InvalidLayer { layer_id });
    }
    let routes = LayerRoutes::build(tcs.as_view());
    if routes.contains(layer_id) {
        return Err(PaintError::LayerExists { layer_id });
    }

    let group = flags & layer_create_flags::GROUP != 0;
    let into = flags & layer_create_flags::INTO != 0;

    let entry = if group {
        LayerListEntry::Group(Arc::new(canvas::LayerGroup::new(tcs.width(), tcs.height())))
    } else if !into && source_id != 0 {
        let source = routes
            .search(source_id)
            .ok_or(PaintError::InvalidLayer { layer_id: source_id })?;
        let content = source
            .content(tcs.as_view())
            .ok_or(PaintError::InvalidLayer { layer_id: source_id })?;
        LayerListEntry::Content(Arc::new(content.clone()))
    } else if fill >> 24 != 0 {
        LayerListEntry::Content(Arc::new(LayerContent::new_solid(
            tcs.width(),
            tcs.height(),
            UPixel15::from_argb8(fill),
        )))
    } else {
        LayerListEntry::Content(Arc::new(LayerContent::new(tcs.width(), tcs.height())))
    };

    let mut props = if group {
        LayerProps::new_group(layer_id)
    } else {
        LayerProps::new(layer_id)
    };
    props.title = title.to_owned();

    if into {
        let target = routes
            .search(source_id)
            .ok_or(PaintError::InvalidLayer { layer_id: source_id })?;
        if !target.is_group() {
            return Err(PaintError::InvalidLayer { layer_id: source_id });
        }
        let path = target.path().to_vec();
        insert_into_group(tcs, &path, entry, props);
    } else {
        canvas::state::push_layer(tcs, entry, props, None);
    }
    Ok(())
}

fn insert_into_group(
    tcs: &mut TransientCanvasState,
    path: &[usize],
    entry: LayerListEntry,
    props: LayerProps,
) {
    {
        let mut list = tcs.layers_mut();
        for &index in &path[..path.len() - 1] {
            list = list
                .group_at_mut(index)
                .expect("route path must traverse groups")
                .children_mut();
        }
        list.group_at_mut(path[path.len() - 1])
            .expect("insertion target must be a group")
            .children_mut()
            .push(entry);
    }
    let mut props_list = tcs.props_mut();
    for &index in path {
        props_list = props_list.at_mut(index).children_mut();
    }
    props_list.push(Arc::new(props));
}

fn layer_attributes(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    sublayer: u8,
    flags: u8,
    opacity: u8,
    blend_mode: u8,
) -> Result<(), PaintError> {
    let mode = blend_mode_for_layer(blend_mode)?;
    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;

    if sublayer != 0 {
        let content = route
            .entry_transient_content(tcs)
            .ok_or(PaintError::InvalidLayer { layer_id })?;
        let (_, sublayer_props) = content.transient_sublayer(LayerId::from(sublayer));
        sublayer_props.opacity = channel_8_to_15(opacity);
        sublayer_props.blend_mode = mode;
        return Ok(());
    }

    let props = route.entry_transient_props(tcs);
    props.opacity = channel_8_to_15(opacity);
    props.blend_mode = mode;
    props.censored = flags & layer_attr_flags::CENSORED != 0;
    props.hidden = flags & layer_attr_flags::HIDDEN != 0;
    props.isolated = flags & layer_attr_flags::ISOLATED != 0;
    Ok(())
}

fn layer_retitle(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    title: &str,
) -> Result<(), PaintError> {
    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    route.entry_transient_props(tcs).title = title.to_owned();
    Ok(())
}

/// Reorder the root stack. The order lists ids bottom first and must be a
/// permutation of the current root entries.
fn layer_order(tcs: &mut TransientCanvasState, order: &[LayerId]) -> Result<(), PaintError> {
    let root_ids: Vec<LayerId> = tcs
        .as_view()
        .props()
        .entries()
        .iter()
        .map(|props| props.id)
        .collect();
    if order.len() != root_ids.len() {
        return Err(PaintError::BadLayerOrder);
    }
    let mut indices = Vec::with_capacity(order.len());
    for id in order {
        let position = root_ids
            .iter()
            .position(|root_id| root_id == id)
            .ok_or(PaintError::BadLayerOrder)?;
        if indices.contains(&position) {
            return Err(PaintError::BadLayerOrder);
        }
        indices.push(position);
    }
    tcs.layers_mut().reorder(&indices);
    tcs.props_mut().reorder(&indices);
    Ok(())
}

fn layer_delete(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    merge: bool,
) -> Result<(), PaintError> {
    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    let path = route.path().to_vec();
    let leaf = path[path.len() - 1];

    if merge {
        if leaf == 0 || route.is_group() {
            return Err(PaintError::CannotMergeLayer { layer_id });
        }
        let deleted = route
            .content(tcs.as_view())
            .ok_or(PaintError::CannotMergeLayer { layer_id })?
            .clone();
        let (opacity, mode) = {
            let props = route.entry_transient_props(tcs);
            (props.opacity, props.blend_mode)
        };
        let below = below_content_mut(tcs, &path)
            .ok_or(PaintError::CannotMergeLayer { layer_id })?;
        below.merge_content(&deleted, opacity, mode);
    }

    {
        let mut list = tcs.layers_mut();
        for &index in &path[..path.len() - 1] {
            list = list
                .group_at_mut(index)
                .expect("route path must traverse groups")
                .children_mut();
        }
        list.remove(leaf);
    }
    let mut props_list = tcs.props_mut();
    for &index in &path[..path.len() - 1] {
        props_list = props_list.at_mut(index).children_mut();
    }
    props_list.remove(leaf);
    Ok(())
}

fn below_content_mut<'a>(
    tcs: &'a mut TransientCanvasState,
    path: &[usize],
) -> Option<&'a mut LayerContent> {
    let mut list = tcs.layers_mut();
    for &index in &path[..path.len() - 1] {
        list = list.group_at_mut(index)?.children_mut();
    }
    list.content_at_mut(path[path.len() - 1] - 1)
}

#[allow(clippy::too_many_arguments)]
fn put_image(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    blend_mode: u8,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    image: &[u8],
) -> Result<(), PaintError> {
    let mode = blend_mode_for_layer(blend_mode).or_else(|_| {
        // Replace is the one direct-put extra over layer modes.
        if blend_mode == BlendMode::Replace as u8 {
            Ok(BlendMode::Replace)
        } else {
            Err(PaintError::InvalidBlendMode { value: blend_mode })
        }
    })?;
    if width == 0 || height == 0 {
        return Err(PaintError::EmptyRect);
    }
    let expected = (width * height * 4) as usize;
    if image.len() != expected {
        return Err(PaintError::ImageSizeMismatch {
            expected,
            actual: image.len(),
        });
    }

    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    let content = route
        .entry_transient_content(tcs)
        .ok_or(PaintError::InvalidLayer { layer_id })?;

    let pixels8: Vec<Pixel8> = image
        .chunks_exact(4)
        .map(|chunk| Pixel8 {
            b: chunk[0],
            g: chunk[1],
            r: chunk[2],
            a: chunk[3],
        })
        .collect();
    content.put_image(mode, x as i32, y as i32, width, height, &pixels8);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fill_rect(
    tcs: &mut TransientCanvasState,
    layer_id: LayerId,
    blend_mode: u8,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    color: u32,
) -> Result<(), PaintError> {
    let mode = BlendMode::try_from(blend_mode)
        .map_err(|_| PaintError::InvalidBlendMode { value: blend_mode })?;
    if width == 0 || height == 0 {
        return Err(PaintError::EmptyRect);
    }
    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    let content = route
        .entry_transient_content(tcs)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    content.fill_rect(
        mode,
        x as i32,
        y as i32,
        (x + width) as i32,
        (y + height) as i32,
        UPixel15::from_argb8(color),
    );
    Ok(())
}

/// Draw the dabs of one message with an extra canvas offset, shared between
/// command application (offset zero) and preview rendering.
pub fn draw_dabs(
    tcs: &mut TransientCanvasState,
    context_id: ContextId,
    msg: &Message,
    offset_x: i32,
    offset_y: i32,
) -> Result<(), PaintError> {
    match &msg.payload {
        MessagePayload::DrawDabsClassic {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        } => {
            let mode = blend_mode_for_brush(*blend_mode)?;
            let masks = classic_masks(*x + offset_x * 4, *y + offset_y * 4, dabs);
            stamp_dabs(tcs, context_id, *layer_id, *color, mode, *indirect, &masks)
        }
        MessagePayload::DrawDabsPixel {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        } => {
            let mode = blend_mode_for_brush(*blend_mode)?;
            let masks = pixel_masks(*x + offset_x, *y + offset_y, dabs, false);
            stamp_dabs(tcs, context_id, *layer_id, *color, mode, *indirect, &masks)
        }
        MessagePayload::DrawDabsPixelSquare {
            layer_id,
            x,
            y,
            color,
            blend_mode,
            indirect,
            dabs,
        } => {
            let mode = blend_mode_for_brush(*blend_mode)?;
            let masks = pixel_masks(*x + offset_x, *y + offset_y, dabs, true);
            stamp_dabs(tcs, context_id, *layer_id, *color, mode, *indirect, &masks)
        }
        MessagePayload::DrawDabsMyPaint {
            layer_id,
            x,
            y,
            color,
            lock_alpha,
            dabs,
        } => {
            // Lock-alpha strokes tint existing coverage instead of erasing.
            let mode = if *lock_alpha >= 128 {
                BlendMode::Recolor
            } else {
                BlendMode::NormalAndEraser
            };
            let masks = mypaint_masks(*x + offset_x * 4, *y + offset_y * 4, dabs);
            stamp_dabs(tcs, context_id, *layer_id, *color, mode, false, &masks)
        }
        _ => Err(PaintError::NotACanvasCommand),
    }
}

fn classic_masks(origin_x: i32, origin_y: i32, dabs: &[protocol::ClassicDab]) -> Vec<(DabMask, u8)> {
    let mut masks = Vec::with_capacity(dabs.len());
    let mut quarter_x = origin_x;
    let mut quarter_y = origin_y;
    for dab in dabs {
        quarter_x += i32::from(dab.x);
        quarter_y += i32::from(dab.y);
        if let Some(mask) =
            brushes::classic_dab_mask(quarter_x as f32 / 4.0, quarter_y as f32 / 4.0, dab)
        {
            masks.push((mask, dab.opacity));
        }
    }
    masks
}

fn pixel_masks(
    origin_x: i32,
    origin_y: i32,
    dabs: &[protocol::PixelDab],
    square: bool,
) -> Vec<(DabMask, u8)> {
    let mut masks = Vec::with_capacity(dabs.len());
    let mut x = origin_x;
    let mut y = origin_y;
    for dab in dabs {
        x += i32::from(dab.x);
        y += i32::from(dab.y);
        if let Some(mask) = brushes::pixel_dab_mask(x, y, dab, square) {
            masks.push((mask, dab.opacity));
        }
    }
    masks
}

fn mypaint_masks(origin_x: i32, origin_y: i32, dabs: &[protocol::MyPaintDab]) -> Vec<(DabMask, u8)> {
    let mut masks = Vec::with_capacity(dabs.len());
    let mut quarter_x = origin_x;
    let mut quarter_y = origin_y;
    for dab in dabs {
        quarter_x += i32::from(dab.x);
        quarter_y += i32::from(dab.y);
        if let Some(mask) =
            brushes::mypaint_dab_mask(quarter_x as f32 / 4.0, quarter_y as f32 / 4.0, dab)
        {
            masks.push((mask, dab.opacity));
        }
    }
    masks
}

fn stamp_dabs(
    tcs: &mut TransientCanvasState,
    context_id: ContextId,
    layer_id: LayerId,
    color: u32,
    mode: BlendMode,
    indirect: bool,
    masks: &[(DabMask, u8)],
) -> Result<(), PaintError> {
    let routes = LayerRoutes::build(tcs.as_view());
    let route = routes
        .search(layer_id)
        .ok_or(PaintError::InvalidLayer { layer_id })?;
    let content = route
        .entry_transient_content(tcs)
        .ok_or(PaintError::InvalidLayer { layer_id })?;

    let color15 = UPixel15::from_argb8(color);
    if indirect {
        // Indirect strokes accumulate at full strength in a per-user
        // sublayer; the stroke opacity and mode apply when it merges.
        let (sublayer, sublayer_props) = content.transient_sublayer(LayerId::from(context_id));
        sublayer_props.blend_mode = mode;
        sublayer_props.opacity = channel_8_to_15((color >> 24) as u8);
        let full_color = UPixel15 {
            a: BIT15,
            ..color15
        };
        for (mask, opacity) in masks {
            sublayer.apply_mask_rect(
                mask.left,
                mask.top,
                mask.width,
                mask.height,
                &mask.coverage,
                full_color,
                channel_8_to_15(*opacity),
                BlendMode::Normal,
            );
        }
    } else {
        for (mask, opacity) in masks {
            content.apply_mask_rect(
                mask.left,
                mask.top,
                mask.width,
                mask.height,
                &mask.coverage,
                color15,
                channel_8_to_15(*opacity),
                mode,
            );
        }
    }
    Ok(())
}

fn annotation_create(
    tcs: &mut TransientCanvasState,
    annotation_id: AnnotationId,
    x: i32,
    y: i32,
    width: u16,
    height: u16,
) -> Result<(), PaintError> {
    let inserted = tcs.annotations_mut().insert(Annotation {
        id: annotation_id,
        x,
        y,
        width,
        height,
        background_color: 0,
        flags: 0,
        text: String::new(),
    });
    if inserted {
        Ok(())
    } else {
        Err(PaintError::AnnotationExists { annotation_id })
    }
}

fn annotation_reshape(
    tcs: &mut TransientCanvasState,
    annotation_id: AnnotationId,
    x: i32,
    y: i32,
    width: u16,
    height: u16,
) -> Result<(), PaintError> {
    let updated = tcs.annotations_mut().update(annotation_id, |annotation| {
        annotation.x = x;
        annotation.y = y;
        annotation.width = width;
        annotation.height = height;
    });
    if updated {
        Ok(())
    } else {
        Err(PaintError::InvalidAnnotation { annotation_id })
    }
}

fn annotation_edit(
    tcs: &mut TransientCanvasState,
    annotation_id: AnnotationId,
    background_color: u32,
    flags: u8,
    text: &str,
) -> Result<(), PaintError> {
    let updated = tcs.annotations_mut().update(annotation_id, |annotation| {
        annotation.background_color = background_color;
        annotation.flags = flags;
        annotation.text = text.to_owned();
    });
    if updated {
        Ok(())
    } else {
        Err(PaintError::InvalidAnnotation { annotation_id })
    }
}

fn annotation_delete(
    tcs: &mut TransientCanvasState,
    annotation_id: AnnotationId,
) -> Result<(), PaintError> {
    if tcs.annotations_mut().remove(annotation_id) {
        Ok(())
    } else {
        Err(PaintError::InvalidAnnotation { annotation_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixels::Pixel15;
    use protocol::PixelDab;

    fn empty_canvas(width: u32, height: u32) -> TransientCanvasState {
        let mut tcs = TransientCanvasState::new_init();
        tcs.set_width(width);
        tcs.set_height(height);
        tcs
    }

    fn layer_create_msg(layer_id: LayerId) -> Message {
        Message::new(
            1,
            MessagePayload::LayerCreate {
                layer_id,
                source_id: 0,
                fill: 0,
                flags: 0,
                title: "Layer".into(),
            },
        )
    }

    #[test]
    fn fill_rect_scenario_paints_exact_extent() {
        let mut tcs = empty_canvas(100, 100);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::FillRect {
                    layer_id: 0x100,
                    blend_mode: BlendMode::Replace as u8,
                    x: 10,
                    y: 10,
                    width: 20,
                    height: 30,
                    color: 0xffff_0000,
                },
            ),
        )
        .expect("fill rect");
        let state = tcs.persist();

        let red = UPixel15::from_argb8(0xffff_0000).premultiply();
        assert_eq!(state.flatten_pixel_at(10, 10), red);
        assert_eq!(state.flatten_pixel_at(29, 39), red);
        assert_eq!(state.flatten_pixel_at(9, 10), Pixel15::TRANSPARENT);
        assert_eq!(state.flatten_pixel_at(30, 39), Pixel15::TRANSPARENT);
        assert_eq!(state.flatten_pixel_at(10, 40), Pixel15::TRANSPARENT);
    }

    #[test]
    fn commands_on_unknown_layers_fail_without_side_effects() {
        let mut tcs = empty_canvas(64, 64);
        let result = apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::FillRect {
                    layer_id: 0x999,
                    blend_mode: 1,
                    x: 0,
                    y: 0,
                    width: 10,
                    height: 10,
                    color: 0xffff_0000,
                },
            ),
        );
        assert_eq!(result, Err(PaintError::InvalidLayer { layer_id: 0x999 }));
    }

    #[test]
    fn layer_create_rejects_reserved_and_duplicate_ids() {
        let mut tcs = empty_canvas(64, 64);
        assert_eq!(
            apply(&mut tcs, &layer_create_msg(0x42)),
            Err(PaintError::InvalidLayer { layer_id: 0x42 })
        );
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        assert_eq!(
            apply(&mut tcs, &layer_create_msg(0x100)),
            Err(PaintError::LayerExists { layer_id: 0x100 })
        );
    }

    #[test]
    fn layer_create_into_group_nests_the_new_layer() {
        let mut tcs = empty_canvas(64, 64);
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::LayerCreate {
                    layer_id: 0x200,
                    source_id: 0,
                    fill: 0,
                    flags: layer_create_flags::GROUP,
                    title: "Group".into(),
                },
            ),
        )
        .expect("create group");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::LayerCreate {
                    layer_id: 0x201,
                    source_id: 0x200,
                    fill: 0,
                    flags: layer_create_flags::INTO,
                    title: "Nested".into(),
                },
            ),
        )
        .expect("create nested layer");

        let state = tcs.persist();
        let routes = LayerRoutes::build(&state);
        assert_eq!(routes.search(0x201).expect("nested route").path(), &[0, 0]);
    }

    #[test]
    fn pixel_dabs_draw_into_the_target_layer() {
        let mut tcs = empty_canvas(100, 100);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::DrawDabsPixel {
                    layer_id: 0x100,
                    x: 50,
                    y: 50,
                    color: 0xffff_0000,
                    blend_mode: BlendMode::Normal as u8,
                    indirect: false,
                    dabs: vec![PixelDab {
                        x: 0,
                        y: 0,
                        size: 8,
                        opacity: 0xff,
                    }],
                },
            ),
        )
        .expect("draw dabs");
        let state = tcs.persist();
        let red = UPixel15::from_argb8(0xffff_0000).premultiply();
        assert_eq!(state.flatten_pixel_at(50, 50), red);
        assert_eq!(state.flatten_pixel_at(70, 70), Pixel15::TRANSPARENT);
    }

    #[test]
    fn indirect_dabs_stay_in_a_sublayer_until_pen_up() {
        let mut tcs = empty_canvas(64, 64);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        apply(
            &mut tcs,
            &Message::new(
                5,
                MessagePayload::DrawDabsPixel {
                    layer_id: 0x100,
                    x: 10,
                    y: 10,
                    color: 0xffff_0000,
                    blend_mode: BlendMode::Normal as u8,
                    indirect: true,
                    dabs: vec![PixelDab {
                        x: 0,
                        y: 0,
                        size: 4,
                        opacity: 0xff,
                    }],
                },
            ),
        )
        .expect("draw indirect dabs");

        {
            let routes = LayerRoutes::build(tcs.as_view());
            let content = routes
                .search(0x100)
                .expect("layer route")
                .content(tcs.as_view())
                .expect("layer content");
            assert!(content.has_sublayer(5), "dabs must land in the sublayer");
            assert!(
                content.tile_at(0, 0).is_none(),
                "base pixels untouched before pen up"
            );
        }

        apply(&mut tcs, &Message::new(5, MessagePayload::PenUp)).expect("pen up");
        let state = tcs.persist();
        let routes = LayerRoutes::build(&state);
        let content = routes
            .search(0x100)
            .expect("layer route")
            .content(&state)
            .expect("layer content");
        assert!(!content.has_sublayer(5), "pen up merges the sublayer away");
        let red = UPixel15::from_argb8(0xffff_0000).premultiply();
        assert_eq!(state.flatten_pixel_at(10, 10), red);
    }

    #[test]
    fn pen_up_from_another_context_leaves_the_sublayer() {
        let mut tcs = empty_canvas(64, 64);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        apply(
            &mut tcs,
            &Message::new(
                5,
                MessagePayload::DrawDabsPixel {
                    layer_id: 0x100,
                    x: 10,
                    y: 10,
                    color: 0xffff_0000,
                    blend_mode: BlendMode::Normal as u8,
                    indirect: true,
                    dabs: vec![PixelDab {
                        x: 0,
                        y: 0,
                        size: 4,
                        opacity: 0xff,
                    }],
                },
            ),
        )
        .expect("draw indirect dabs");
        apply(&mut tcs, &Message::new(6, MessagePayload::PenUp)).expect("other pen up");

        let routes = LayerRoutes::build(tcs.as_view());
        let content = routes
            .search(0x100)
            .expect("layer route")
            .content(tcs.as_view())
            .expect("layer content");
        assert!(content.has_sublayer(5));
    }

    #[test]
    fn layer_order_applies_permutations_and_rejects_garbage() {
        let mut tcs = empty_canvas(64, 64);
        for layer_id in [0x100, 0x101, 0x102] {
            apply(&mut tcs, &layer_create_msg(layer_id)).expect("create layer");
        }
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::LayerOrder {
                    layer_ids: vec![0x102, 0x100, 0x101],
                },
            ),
        )
        .expect("reorder");
        let ids: Vec<LayerId> = tcs
            .as_view()
            .props()
            .entries()
            .iter()
            .map(|props| props.id)
            .collect();
        assert_eq!(ids, vec![0x102, 0x100, 0x101]);

        assert_eq!(
            apply(
                &mut tcs,
                &Message::new(
                    1,
                    MessagePayload::LayerOrder {
                        layer_ids: vec![0x102, 0x102, 0x101],
                    },
                ),
            ),
            Err(PaintError::BadLayerOrder)
        );
    }

    #[test]
    fn layer_delete_with_merge_flattens_downward() {
        let mut tcs = empty_canvas(64, 64);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create bottom");
        apply(&mut tcs, &layer_create_msg(0x101)).expect("create top");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::FillRect {
                    layer_id: 0x101,
                    blend_mode: BlendMode::Replace as u8,
                    x: 0,
                    y: 0,
                    width: 8,
                    height: 8,
                    color: 0xffff_0000,
                },
            ),
        )
        .expect("fill top");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::LayerDelete {
                    layer_id: 0x101,
                    merge: true,
                },
            ),
        )
        .expect("delete merged");

        let state = tcs.persist();
        let routes = LayerRoutes::build(&state);
        assert!(!routes.contains(0x101));
        let red = UPixel15::from_argb8(0xffff_0000).premultiply();
        assert_eq!(state.flatten_pixel_at(0, 0), red);
    }

    #[test]
    fn bottom_layer_cannot_merge_down() {
        let mut tcs = empty_canvas(64, 64);
        apply(&mut tcs, &layer_create_msg(0x100)).expect("create layer");
        assert_eq!(
            apply(
                &mut tcs,
                &Message::new(
                    1,
                    MessagePayload::LayerDelete {
                        layer_id: 0x100,
                        merge: true,
                    },
                ),
            ),
            Err(PaintError::CannotMergeLayer { layer_id: 0x100 })
        );
    }

    #[test]
    fn canvas_resize_validates_limits() {
        let mut tcs = empty_canvas(64, 64);
        assert_eq!(
            apply(
                &mut tcs,
                &Message::new(
                    1,
                    MessagePayload::CanvasResize {
                        top: 0,
                        right: -64,
                        bottom: 0,
                        left: 0,
                    },
                ),
            ),
            Err(PaintError::InvalidResize)
        );
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::CanvasResize {
                    top: 0,
                    right: 64,
                    bottom: 64,
                    left: 0,
                },
            ),
        )
        .expect("grow");
        assert_eq!(tcs.width(), 128);
        assert_eq!(tcs.height(), 128);
    }

    #[test]
    fn annotation_lifecycle_round_trips() {
        let mut tcs = empty_canvas(64, 64);
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::AnnotationCreate {
                    annotation_id: 7,
                    x: 1,
                    y: 2,
                    width: 30,
                    height: 20,
                },
            ),
        )
        .expect("create annotation");
        apply(
            &mut tcs,
            &Message::new(
                1,
                MessagePayload::AnnotationEdit {
                    annotation_id: 7,
                    background_color: 0x80ff_ffff,
                    flags: 0,
                    text: "hello".into(),
                },
            ),
        )
        .expect("edit annotation");

        let state = tcs.persist();
        let annotation = state.annotations().find(7).expect("annotation");
        assert_eq!(annotation.text, "hello");

        let mut tcs = TransientCanvasState::new(&state);
        apply(
            &mut tcs,
            &Message::new(1, MessagePayload::AnnotationDelete { annotation_id: 7 }),
        )
        .expect("delete annotation");
        assert!(tcs.persist().annotations().entries().is_empty());
    }

    #[test]
    fn meta_messages_are_not_paintable() {
        let mut tcs = empty_canvas(64, 64);
        assert_eq!(
            apply(
                &mut tcs,
                &Message::new(1, MessagePayload::Chat { text: "hi".into() }),
            ),
            Err(PaintError::NotACanvasCommand)
        );
    }
}
