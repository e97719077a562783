//! Flat image import and export: a PNG becomes a single-layer canvas over a
//! white background, and a canvas flattens back down to a PNG.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use canvas::{CanvasState, LayerContent, LayerListEntry, LayerProps, TransientCanvasState};
use pixels::{BIT15, BlendMode, UPixel15};
use tiles::Tile;

use crate::FormatError;

const FLAT_IMAGE_LAYER_ID: u16 = 0x100;

pub(crate) fn load_flat_image(path: &Path, layer_title: &str) -> Result<CanvasState, FormatError> {
    let file = File::open(path).map_err(FormatError::Open)?;
    let image = image::load(std::io::BufReader::new(file), image::ImageFormat::Png)
        .map_err(|error| FormatError::Read(error.to_string()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(FormatError::Read("image has no pixels".into()));
    }
    let premultiplied = crate::rgba8_to_premultiplied(image.as_raw());

    let mut tcs = TransientCanvasState::new_init();
    tcs.set_width(width);
    tcs.set_height(height);
    tcs.set_background(Tile::solid(UPixel15 {
        b: BIT15,
        g: BIT15,
        r: BIT15,
        a: BIT15,
    }));

    let mut content = LayerContent::new(width, height);
    content.put_image(BlendMode::Replace, 0, 0, width, height, &premultiplied);

    let mut props = LayerProps::new(FLAT_IMAGE_LAYER_ID);
    props.title = layer_title.to_owned();
    canvas::state::push_layer(
        &mut tcs,
        LayerListEntry::Content(Arc::new(content)),
        props,
        None,
    );
    Ok(tcs.persist())
}

pub(crate) fn save_png(state: &CanvasState, path: &Path) -> Result<(), FormatError> {
    let rgba = crate::flatten_to_rgba8(state)?;
    let image = image::RgbaImage::from_raw(state.width(), state.height(), rgba)
        .ok_or(FormatError::Flatten)?;
    let file = File::create(path).map_err(FormatError::Open)?;
    image
        .write_to(&mut BufWriter::new(file), image::ImageFormat::Png)
        .map_err(|error| FormatError::Write(error.to_string()))
}
