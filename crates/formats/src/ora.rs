//! OpenRaster archives: a zip with a `mimetype` marker, a `stack.xml`
//! describing the layer tree top-first, and one PNG per layer.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use canvas::{
    CanvasState, LayerContent, LayerGroup, LayerList, LayerListEntry, LayerProps, LayerPropsList,
    TransientCanvasState,
};
use pixels::{BIT15, BlendMode, Pixel8};
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use tiles::{TILE_LENGTH, TILE_SIZE, Tile};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::pool::{DecodeJob, decode_all};
use crate::FormatError;

const ORA_MIMETYPE: &str = "image/openraster";
const FIRST_LAYER_ID: u16 = 0x100;

#[derive(Debug)]
struct OraNodeAttrs {
    name: String,
    src: Option<String>,
    x: i32,
    y: i32,
    opacity: f32,
    hidden: bool,
    composite_op: BlendMode,
    isolated: bool,
    censored: bool,
}

impl OraNodeAttrs {
    fn new() -> OraNodeAttrs {
        OraNodeAttrs {
            name: String::new(),
            src: None,
            x: 0,
            y: 0,
            opacity: 1.0,
            hidden: false,
            composite_op: BlendMode::Normal,
            isolated: false,
            censored: false,
        }
    }
}

#[derive(Debug)]
enum OraNode {
    Stack {
        attrs: OraNodeAttrs,
        children: Vec<OraNode>,
    },
    Layer {
        attrs: OraNodeAttrs,
    },
}

#[derive(Debug, Default)]
struct OraImage {
    width: u32,
    height: u32,
    xres: Option<i32>,
    yres: Option<i32>,
    framerate: Option<i32>,
    background_tile: Option<String>,
    /// Topmost layer first, as written in stack.xml.
    children: Vec<OraNode>,
}

pub(crate) fn load_ora(path: &Path) -> Result<CanvasState, FormatError> {
    let file = File::open(path).map_err(FormatError::Open)?;
    let mut archive =
        ZipArchive::new(file).map_err(|error| FormatError::Read(error.to_string()))?;

    let mimetype = read_entry_string(&mut archive, "mimetype")?;
    if mimetype.trim() != ORA_MIMETYPE {
        return Err(FormatError::BadMimetype);
    }

    let stack_xml = read_entry_string(&mut archive, "stack.xml")?;
    let image = parse_stack_xml(&stack_xml)?;
    if image.width == 0 || image.height == 0 {
        return Err(FormatError::Read("image dimensions missing or zero".into()));
    }
    build_state(image, &mut archive)
}

fn read_entry_string(
    archive: &mut ZipArchive<File>,
    name: &str,
) -> Result<String, FormatError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| FormatError::Read(format!("archive entry {name} missing")))?;
    let mut value = String::new();
    entry
        .read_to_string(&mut value)
        .map_err(|error| FormatError::Read(error.to_string()))?;
    Ok(value)
}

fn read_entry_bytes(archive: &mut ZipArchive<File>, name: &str) -> Option<Vec<u8>> {
    let mut entry = archive.by_name(name).ok()?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).ok()?;
    Some(bytes)
}

fn parse_stack_xml(xml: &str) -> Result<OraImage, FormatError> {
    let mut reader = Reader::from_str(xml);
    let mut image = OraImage::default();
    let mut saw_image = false;
    let mut stacks: Vec<(OraNodeAttrs, Vec<OraNode>)> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|error| FormatError::Read(format!("stack.xml: {error}")))?;
        match event {
            Event::Start(element) | Event::Empty(element) => {
                match element.name().as_ref() {
                    b"image" => {
                        saw_image = true;
                        parse_image_attrs(&element, &mut image)?;
                    }
                    b"stack" => {
                        let attrs = parse_node_attrs(&element)?;
                        stacks.push((attrs, Vec::new()));
                    }
                    b"layer" => {
                        let attrs = parse_node_attrs(&element)?;
                        let node = OraNode::Layer { attrs };
                        match stacks.last_mut() {
                            Some((_, children)) => children.push(node),
                            None => image.children.push(node),
                        }
                    }
                    _ => {}
                }
            }
            Event::End(element) => {
                if element.name().as_ref() == b"stack"
                    && let Some((attrs, children)) = stacks.pop()
                {
                    let node = OraNode::Stack { attrs, children };
                    match stacks.last_mut() {
                        Some((_, parent_children)) => parent_children.push(node),
                        None => {
                            // The outermost stack is the root container; its
                            // children become the image's children.
                            if let OraNode::Stack { children, .. } = node {
                                image.children = children;
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_image {
        return Err(FormatError::Read("stack.xml has no image element".into()));
    }
    Ok(image)
}

fn parse_image_attrs(element: &BytesStart<'_>, image: &mut OraImage) -> Result<(), FormatError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|error| FormatError::Read(format!("stack.xml: {error}")))?;
        let value = attr
            .unescape_value()
            .map_err(|error| FormatError::Read(format!("stack.xml: {error}")))?;
        match attr.key.as_ref() {
            b"w" => image.width = parse_strict_int(&value)?,
            b"h" => image.height = parse_strict_int(&value)?,
            b"xres" => image.xres = Some(parse_strict_int(&value)?),
            b"yres" => image.yres = Some(parse_strict_int(&value)?),
            b"drawpile:framerate" => image.framerate = Some(parse_strict_int(&value)?),
            b"mypaint:background-tile" => image.background_tile = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(())
}

fn parse_node_attrs(element: &BytesStart<'_>) -> Result<OraNodeAttrs, FormatError> {
    let mut attrs = OraNodeAttrs::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|error| FormatError::Read(format!("stack.xml: {error}")))?;
        let value = attr
            .unescape_value()
            .map_err(|error| FormatError::Read(format!("stack.xml: {error}")))?;
        match attr.key.as_ref() {
            b"name" => attrs.name = value.into_owned(),
            b"src" => attrs.src = Some(value.into_owned()),
            b"x" => attrs.x = parse_strict_int(&value)?,
            b"y" => attrs.y = parse_strict_int(&value)?,
            b"opacity" => attrs.opacity = parse_clamped_float(&value)?,
            b"visibility" => attrs.hidden = value.as_ref() == "hidden",
            b"composite-op" => attrs.composite_op = composite_op_to_mode(&value),
            b"isolation" => attrs.isolated = value.as_ref() == "isolate",
            b"drawpile:censored" => attrs.censored = value.as_ref() == "true",
            _ => {}
        }
    }
    Ok(attrs)
}

/// Integer attributes must be exactly a number; trailing garbage rejects.
fn parse_strict_int<T: std::str::FromStr>(value: &str) -> Result<T, FormatError> {
    value
        .parse()
        .map_err(|_| FormatError::Read(format!("invalid integer attribute {value:?}")))
}

/// Float attributes clamp to the declared `[0, 1]` range.
fn parse_clamped_float(value: &str) -> Result<f32, FormatError> {
    let parsed: f32 = value
        .parse()
        .map_err(|_| FormatError::Read(format!("invalid float attribute {value:?}")))?;
    Ok(parsed.clamp(0.0, 1.0))
}

fn composite_op_to_mode(value: &str) -> BlendMode {
    match value {
        "svg:src-over" => BlendMode::Normal,
        "svg:multiply" => BlendMode::Multiply,
        "svg:darken" => BlendMode::Darken,
        "svg:lighten" => BlendMode::Lighten,
        "svg:color-dodge" => BlendMode::Dodge,
        "svg:color-burn" => BlendMode::Burn,
        "svg:plus" => BlendMode::Add,
        "-dp-divide" => BlendMode::Divide,
        "-dp-subtract" => BlendMode::Subtract,
        "-dp-recolor" => BlendMode::Recolor,
        "-dp-behind" => BlendMode::Behind,
        "-dp-erase" => BlendMode::Erase,
        "-dp-color-erase" => BlendMode::ColorErase,
        "-dp-normal-and-eraser" => BlendMode::NormalAndEraser,
        other => {
            warn!(composite_op = other, "unknown composite-op, using src-over");
            BlendMode::Normal
        }
    }
}

fn mode_to_composite_op(mode: BlendMode) -> &'static str {
    match mode {
        BlendMode::Normal => "svg:src-over",
        BlendMode::Multiply => "svg:multiply",
        BlendMode::Darken => "svg:darken",
        BlendMode::Lighten => "svg:lighten",
        BlendMode::Dodge => "svg:color-dodge",
        BlendMode::Burn => "svg:color-burn",
        BlendMode::Add => "svg:plus",
        BlendMode::Divide => "-dp-divide",
        BlendMode::Subtract => "-dp-subtract",
        BlendMode::Recolor => "-dp-recolor",
        BlendMode::Behind => "-dp-behind",
        BlendMode::Erase => "-dp-erase",
        BlendMode::ColorErase => "-dp-color-erase",
        BlendMode::NormalAndEraser => "-dp-normal-and-eraser",
        BlendMode::Replace => "svg:src-over",
    }
}

fn build_state(
    image: OraImage,
    archive: &mut ZipArchive<File>,
) -> Result<CanvasState, FormatError> {
    let mut tcs = TransientCanvasState::new_init();
    tcs.set_width(image.width);
    tcs.set_height(image.height);
    {
        let metadata = tcs.metadata_mut();
        if let Some(xres) = image.xres {
            metadata.dpix = xres;
        }
        if let Some(yres) = image.yres {
            metadata.dpiy = yres;
        }
        if let Some(framerate) = image.framerate {
            metadata.framerate = framerate;
        }
    }

    if let Some(src) = &image.background_tile
        && let Some(tile) = load_background_tile(archive, src)
    {
        tcs.set_background(tile);
    }

    // Collect decode jobs depth first, reading the archive sequentially.
    let mut jobs: (Vec<Option<usize>>, Vec<DecodeJob>) = (Vec::new(), Vec::new());
    collect_decode_jobs(&image.children, &image, archive, &mut jobs);
    let (job_slots, decode_jobs) = jobs;
    let mut decoded = decode_all(decode_jobs);

    let mut next_layer_id = FIRST_LAYER_ID;
    let (layers, props) = build_lists(
        &image.children,
        &job_slots,
        &mut decoded,
        image.width,
        image.height,
        &mut next_layer_id,
    );
    *tcs.layers_mut() = layers;
    *tcs.props_mut() = props;
    Ok(tcs.persist())
}

/// Walk the tree collecting (per-layer job index, jobs). Layers without a
/// readable source get `None` and load empty with a warning.
fn collect_decode_jobs(
    children: &[OraNode],
    image: &OraImage,
    archive: &mut ZipArchive<File>,
    jobs: &mut (Vec<Option<usize>>, Vec<DecodeJob>),
) {
    for node in children {
        match node {
            OraNode::Stack { children, .. } => {
                collect_decode_jobs(children, image, archive, jobs);
            }
            OraNode::Layer { attrs } => {
                let slot = match &attrs.src {
                    Some(src) => match read_entry_bytes(archive, src) {
                        Some(png_bytes) => {
                            let index = jobs.1.len();
                            jobs.1.push(DecodeJob {
                                index,
                                png_bytes,
                                canvas_width: image.width,
                                canvas_height: image.height,
                                offset_x: attrs.x,
                                offset_y: attrs.y,
                            });
                            Some(index)
                        }
                        None => {
                            warn!(src, layer = attrs.name, "layer source missing from archive");
                            None
                        }
                    },
                    None => None,
                };
                jobs.0.push(slot);
            }
        }
    }
}

/// Build layer and props lists from the parsed tree. ORA lists the topmost
/// layer first; the canvas stores bottom first, so each level reverses.
fn build_lists(
    children: &[OraNode],
    job_slots: &[Option<usize>],
    decoded: &mut Vec<Result<LayerContent, FormatError>>,
    width: u32,
    height: u32,
    next_layer_id: &mut u16,
) -> (LayerList, LayerPropsList) {
    // Walk in document order to keep job slots aligned, then reverse.
    let mut layer_entries = Vec::new();
    let mut props_entries = Vec::new();
    let mut slot_cursor = 0usize;
    build_level(
        children,
        job_slots,
        &mut slot_cursor,
        decoded,
        width,
        height,
        next_layer_id,
        &mut layer_entries,
        &mut props_entries,
    );

    let mut layers = LayerList::new();
    let mut props = LayerPropsList::new();
    for (entry, entry_props) in layer_entries.into_iter().zip(props_entries).rev() {
        layers.push(entry);
        props.push(Arc::new(entry_props));
    }
    (layers, props)
}

#[allow(clippy::too_many_arguments)]
fn build_level(
    children: &[OraNode],
    job_slots: &[Option<usize>],
    slot_cursor: &mut usize,
    decoded: &mut Vec<Result<LayerContent, FormatError>>,
    width: u32,
    height: u32,
    next_layer_id: &mut u16,
    layer_entries: &mut Vec<LayerListEntry>,
    props_entries: &mut Vec<LayerProps>,
) {
    for node in children {
        match node {
            OraNode::Stack { attrs, children } => {
                let id = alloc_layer_id(next_layer_id);
                let mut group = LayerGroup::new(width, height);
                let mut child_layers = Vec::new();
                let mut child_props = Vec::new();
                build_level(
                    children,
                    job_slots,
                    slot_cursor,
                    decoded,
                    width,
                    height,
                    next_layer_id,
                    &mut child_layers,
                    &mut child_props,
                );
                let mut props_list = LayerPropsList::new();
                for (entry, entry_props) in child_layers.into_iter().zip(child_props).rev() {
                    group.children_mut().push(entry);
                    props_list.push(Arc::new(entry_props));
                }
                let mut props = node_props(attrs, id);
                props.children = Some(Arc::new(props_list));
                layer_entries.push(LayerListEntry::Group(Arc::new(group)));
                props_entries.push(props);
            }
            OraNode::Layer { attrs } => {
                let id = alloc_layer_id(next_layer_id);
                let slot = job_slots[*slot_cursor];
                *slot_cursor += 1;
                let content = match slot {
                    Some(index) => match std::mem::replace(
                        &mut decoded[index],
                        Err(FormatError::BadArguments),
                    ) {
                        Ok(content) => content,
                        Err(error) => {
                            warn!(%error, layer = attrs.name, "layer loads empty");
                            LayerContent::new(width, height)
                        }
                    },
                    None => LayerContent::new(width, height),
                };
                layer_entries.push(LayerListEntry::Content(Arc::new(content)));
                props_entries.push(node_props(attrs, id));
            }
        }
    }
}

fn alloc_layer_id(next_layer_id: &mut u16) -> u16 {
    let id = *next_layer_id;
    *next_layer_id = next_layer_id
        .checked_add(1)
        .expect("layer id space exhausted");
    id
}

fn node_props(attrs: &OraNodeAttrs, id: u16) -> LayerProps {
    let mut props = LayerProps::new(id);
    props.title = attrs.name.clone();
    props.opacity = (attrs.opacity * BIT15 as f32).round() as u16;
    props.blend_mode = attrs.composite_op;
    props.hidden = attrs.hidden;
    props.isolated = attrs.isolated;
    props.censored = attrs.censored;
    props
}

fn load_background_tile(archive: &mut ZipArchive<File>, src: &str) -> Option<Tile> {
    let bytes = read_entry_bytes(archive, src)?;
    let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
        .ok()?
        .to_rgba8();
    if image.dimensions() != (TILE_SIZE, TILE_SIZE) {
        warn!("background tile is not 64x64, ignoring");
        return None;
    }
    let premultiplied = crate::rgba8_to_premultiplied(image.as_raw());
    let pixels: [Pixel8; TILE_LENGTH] = premultiplied.try_into().ok()?;
    Some(Tile::from_pixels8(&pixels))
}

pub(crate) fn save_ora(state: &CanvasState, path: &Path) -> Result<(), FormatError> {
    let file = File::create(path).map_err(FormatError::Open)?;
    let mut writer = ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer
        .start_file("mimetype", stored)
        .and_then(|()| writer.write_all(ORA_MIMETYPE.as_bytes()).map_err(Into::into))
        .map_err(|error| FormatError::Write(error.to_string()))?;

    let mut xml = Vec::new();
    let mut layer_counter = 0usize;
    write_stack_xml(state, &mut xml, &mut layer_counter)?;

    // Layer images, numbered in the same depth-first top-first order the
    // stack.xml references them.
    let mut file_index = 0usize;
    write_layer_images(
        state.layers(),
        state,
        &mut writer,
        &deflated,
        &mut file_index,
    )?;

    if !Tile::same(state.background(), &Tile::transparent()) {
        let png = encode_tile_png(state.background())?;
        writer
            .start_file("data/background-tile.png", deflated)
            .and_then(|()| writer.write_all(&png).map_err(Into::into))
            .map_err(|error| FormatError::Write(error.to_string()))?;
    }

    writer
        .start_file("stack.xml", deflated)
        .and_then(|()| writer.write_all(&xml).map_err(Into::into))
        .map_err(|error| FormatError::Write(error.to_string()))?;

    writer
        .finish()
        .map_err(|error| FormatError::Write(error.to_string()))?;
    Ok(())
}

fn write_stack_xml(
    state: &CanvasState,
    out: &mut Vec<u8>,
    layer_counter: &mut usize,
) -> Result<(), FormatError> {
    let mut writer = quick_xml::Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    let mut image = BytesStart::new("image");
    image.push_attribute(("w", state.width().to_string().as_str()));
    image.push_attribute(("h", state.height().to_string().as_str()));
    image.push_attribute(("xres", state.metadata().dpix.to_string().as_str()));
    image.push_attribute(("yres", state.metadata().dpiy.to_string().as_str()));
    image.push_attribute((
        "drawpile:framerate",
        state.metadata().framerate.to_string().as_str(),
    ));
    if !Tile::same(state.background(), &Tile::transparent()) {
        image.push_attribute(("mypaint:background-tile", "data/background-tile.png"));
    }
    writer
        .write_event(Event::Start(image))
        .map_err(write_error)?;

    writer
        .write_event(Event::Start(BytesStart::new("stack")))
        .map_err(write_error)?;
    write_xml_level(&mut writer, state.layers(), state.props(), layer_counter)?;
    writer
        .write_event(Event::End(BytesEnd::new("stack")))
        .map_err(write_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("image")))
        .map_err(write_error)?;

    *out = writer.into_inner().into_inner();
    Ok(())
}

fn write_error(error: std::io::Error) -> FormatError {
    FormatError::Write(error.to_string())
}

fn write_xml_level(
    writer: &mut quick_xml::Writer<Cursor<Vec<u8>>>,
    layers: &LayerList,
    props: &LayerPropsList,
    layer_counter: &mut usize,
) -> Result<(), FormatError> {
    // stack.xml lists the topmost layer first.
    for index in (0..layers.len()).rev() {
        let entry = layers.at(index);
        let entry_props = props.at(index);
        match entry {
            LayerListEntry::Group(group) => {
                let mut stack = BytesStart::new("stack");
                push_common_attrs(&mut stack, entry_props);
                if entry_props.isolated {
                    stack.push_attribute(("isolation", "isolate"));
                }
                writer
                    .write_event(Event::Start(stack))
                    .map_err(write_error)?;
                let children = entry_props
                    .children
                    .as_ref()
                    .expect("group props carry children");
                write_xml_level(writer, group.children(), children, layer_counter)?;
                writer
                    .write_event(Event::End(BytesEnd::new("stack")))
                    .map_err(write_error)?;
            }
            LayerListEntry::Content(_) => {
                let mut layer = BytesStart::new("layer");
                push_common_attrs(&mut layer, entry_props);
                layer.push_attribute(("x", "0"));
                layer.push_attribute(("y", "0"));
                layer.push_attribute((
                    "src",
                    format!("data/layer-{layer_counter}.png").as_str(),
                ));
                *layer_counter += 1;
                writer
                    .write_event(Event::Empty(layer))
                    .map_err(write_error)?;
            }
        }
    }
    Ok(())
}

fn push_common_attrs(element: &mut BytesStart<'_>, props: &LayerProps) {
    element.push_attribute((
        "name",
        quick_xml::escape::escape(props.title.as_str()).as_ref(),
    ));
    element.push_attribute((
        "opacity",
        format!("{:.6}", f32::from(props.opacity) / f32::from(BIT15)).as_str(),
    ));
    element.push_attribute((
        "visibility",
        if props.hidden { "hidden" } else { "visible" },
    ));
    element.push_attribute(("composite-op", mode_to_composite_op(props.blend_mode)));
    if props.censored {
        element.push_attribute(("drawpile:censored", "true"));
    }
}

fn write_layer_images(
    layers: &LayerList,
    state: &CanvasState,
    writer: &mut ZipWriter<File>,
    options: &SimpleFileOptions,
    file_index: &mut usize,
) -> Result<(), FormatError> {
    for index in (0..layers.len()).rev() {
        match layers.at(index) {
            LayerListEntry::Group(group) => {
                write_layer_images(group.children(), state, writer, options, file_index)?;
            }
            LayerListEntry::Content(content) => {
                let png = encode_content_png(content, state.width(), state.height())?;
                writer
                    .start_file(format!("data/layer-{file_index}.png"), *options)
                    .and_then(|()| writer.write_all(&png).map_err(Into::into))
                    .map_err(|error| FormatError::Write(error.to_string()))?;
                *file_index += 1;
            }
        }
    }
    Ok(())
}

fn encode_content_png(
    content: &LayerContent,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, FormatError> {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let straight = content.pixel_at(x, y).unpremultiply();
            rgba.push(pixels::channel_15_to_8(straight.r));
            rgba.push(pixels::channel_15_to_8(straight.g));
            rgba.push(pixels::channel_15_to_8(straight.b));
            rgba.push(pixels::channel_15_to_8(straight.a));
        }
    }
    encode_rgba_png(rgba, width, height)
}

fn encode_tile_png(tile: &Tile) -> Result<Vec<u8>, FormatError> {
    let mut rgba = Vec::with_capacity(TILE_LENGTH * 4);
    for y in 0..TILE_SIZE {
        for x in 0..TILE_SIZE {
            let straight = tile.pixel_at(x, y).unpremultiply();
            rgba.push(pixels::channel_15_to_8(straight.r));
            rgba.push(pixels::channel_15_to_8(straight.g));
            rgba.push(pixels::channel_15_to_8(straight.b));
            rgba.push(pixels::channel_15_to_8(straight.a));
        }
    }
    encode_rgba_png(rgba, TILE_SIZE, TILE_SIZE)
}

fn encode_rgba_png(rgba: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, FormatError> {
    let image = image::RgbaImage::from_raw(width, height, rgba).ok_or(FormatError::Flatten)?;
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .map_err(|error| FormatError::Write(error.to_string()))?;
    Ok(bytes.into_inner())
}
