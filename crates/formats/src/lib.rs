//! Canvas-state import and export: OpenRaster archives and flat PNGs,
//! dispatched by file suffix. Loaders produce a persistent canvas state;
//! savers consume one.

mod flat;
mod ora;
mod pool;

use std::path::Path;

use canvas::CanvasState;
use pixels::Pixel8;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad arguments")]
    BadArguments,
    #[error("unknown format")]
    UnknownFormat,
    #[error("file has no extension")]
    NoExtension,
    #[error("not an OpenRaster file")]
    BadMimetype,
    #[error("could not open file")]
    Open(#[source] std::io::Error),
    #[error("could not read input: {0}")]
    Read(String),
    #[error("could not write output: {0}")]
    Write(String),
    #[error("could not flatten canvas")]
    Flatten,
}

/// Title given to the single layer of a flat image import when the caller
/// does not override it.
pub const FLAT_IMAGE_LAYER_TITLE: &str = "Layer 1";

/// Load a canvas state from `path`, dispatching on the (case-insensitive)
/// file suffix.
pub fn load(
    path: &Path,
    flat_image_layer_title: Option<&str>,
) -> Result<CanvasState, FormatError> {
    match extension_of(path)? {
        Extension::Ora => ora::load_ora(path),
        Extension::Png => flat::load_flat_image(
            path,
            flat_image_layer_title.unwrap_or(FLAT_IMAGE_LAYER_TITLE),
        ),
    }
}

/// Save a canvas state to `path`, dispatching on the (case-insensitive)
/// file suffix. PNG output is the flattened image.
pub fn save(state: &CanvasState, path: &Path) -> Result<(), FormatError> {
    if state.width() == 0 || state.height() == 0 {
        return Err(FormatError::BadArguments);
    }
    match extension_of(path)? {
        Extension::Ora => ora::save_ora(state, path),
        Extension::Png => flat::save_png(state, path),
    }
}

enum Extension {
    Ora,
    Png,
}

fn extension_of(path: &Path) -> Result<Extension, FormatError> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .ok_or(FormatError::NoExtension)?;
    match extension.to_ascii_lowercase().as_str() {
        "ora" => Ok(Extension::Ora),
        "png" => Ok(Extension::Png),
        _ => Err(FormatError::UnknownFormat),
    }
}

/// Flatten a canvas into straight-alpha 8-bit RGBA rows.
pub fn flatten_to_rgba8(state: &CanvasState) -> Result<Vec<u8>, FormatError> {
    if state.width() == 0 || state.height() == 0 {
        return Err(FormatError::Flatten);
    }
    let width = state.width();
    let height = state.height();
    let mut rgba = vec![0u8; (width * height * 4) as usize];
    for tile_y in 0..state.tiles_y() {
        for tile_x in 0..state.tiles_x() {
            let tile = state.flatten_tile(tile_x, tile_y, true).persist();
            let base_x = tile_x * tiles::TILE_SIZE;
            let base_y = tile_y * tiles::TILE_SIZE;
            for y in 0..tiles::TILE_SIZE.min(height - base_y) {
                for x in 0..tiles::TILE_SIZE.min(width - base_x) {
                    let straight = tile.pixel_at(x, y).unpremultiply();
                    let offset = (((base_y + y) * width + base_x + x) * 4) as usize;
                    rgba[offset] = pixels::channel_15_to_8(straight.r);
                    rgba[offset + 1] = pixels::channel_15_to_8(straight.g);
                    rgba[offset + 2] = pixels::channel_15_to_8(straight.b);
                    rgba[offset + 3] = pixels::channel_15_to_8(straight.a);
                }
            }
        }
    }
    Ok(rgba)
}

/// Convert decoded straight-alpha RGBA rows into premultiplied pixels for
/// the layer-content put path.
pub(crate) fn rgba8_to_premultiplied(rgba: &[u8]) -> Vec<Pixel8> {
    rgba.chunks_exact(4)
        .map(|chunk| {
            let alpha = chunk[3];
            Pixel8 {
                b: premultiply_channel_8(chunk[2], alpha),
                g: premultiply_channel_8(chunk[1], alpha),
                r: premultiply_channel_8(chunk[0], alpha),
                a: alpha,
            }
        })
        .collect()
}

fn premultiply_channel_8(channel: u8, alpha: u8) -> u8 {
    ((u32::from(channel) * u32::from(alpha) + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn suffix_dispatch_is_case_insensitive() {
        assert!(matches!(
            extension_of(&PathBuf::from("drawing.ORA")),
            Ok(Extension::Ora)
        ));
        assert!(matches!(
            extension_of(&PathBuf::from("drawing.Png")),
            Ok(Extension::Png)
        ));
    }

    #[test]
    fn unknown_and_missing_extensions_are_distinct_errors() {
        assert!(matches!(
            extension_of(&PathBuf::from("drawing.xcf")),
            Err(FormatError::UnknownFormat)
        ));
        assert!(matches!(
            extension_of(&PathBuf::from("drawing")),
            Err(FormatError::NoExtension)
        ));
    }

    #[test]
    fn premultiplication_is_exact_at_the_endpoints() {
        let pixels = rgba8_to_premultiplied(&[255, 128, 0, 255, 255, 255, 255, 0]);
        assert_eq!(
            pixels[0],
            Pixel8 {
                b: 0,
                g: 128,
                r: 255,
                a: 255
            }
        );
        assert_eq!(pixels[1], Pixel8::TRANSPARENT);
    }
}
