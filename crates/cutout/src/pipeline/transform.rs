//! The per-image transform capability.
//!
//! Background removal itself lives outside this crate; anything that turns
//! image bytes into image bytes plugs in through [`Transform`].

use std::io::Cursor;
use std::path::Path;

use image::ImageFormat;

use crate::error::TransformError;

/// Extensions accepted by [`RgbaPngTransform`].
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png"];

pub trait Transform: Send + Sync {
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, TransformError>;

    /// Checks whether a stored file name is acceptable before its bytes are
    /// read. Accepts everything by default.
    fn supports(&self, _filename: &str) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Returns the input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransform;

impl Transform for PassthroughTransform {
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(input.to_vec())
    }
}

/// Decodes a JPEG or PNG, converts it to RGBA and re-encodes it as PNG.
///
/// This is the frame a background remover works in: it needs an alpha
/// channel to write into and PNG to carry it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RgbaPngTransform;

impl Transform for RgbaPngTransform {
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let _span = tracing::info_span!("transform.rgba_png").entered();

        let format =
            image::guess_format(input).map_err(|e| TransformError::Decode(e.to_string()))?;
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            return Err(TransformError::UnsupportedFormat {
                extension: format
                    .extensions_str()
                    .first()
                    .copied()
                    .unwrap_or("unknown")
                    .to_string(),
                allowed: allowed_list(),
            });
        }

        let decoded = image::load_from_memory_with_format(input, format)
            .map_err(|e| TransformError::Decode(e.to_string()))?;
        let rgba = image::DynamicImage::ImageRgba8(decoded.to_rgba8());

        let mut out = Cursor::new(Vec::new());
        rgba.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| TransformError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn supports(&self, filename: &str) -> Result<(), TransformError> {
        validate_extension(filename)
    }
}

/// Adapts a closure into a [`Transform`].
pub struct FnTransform<F>(pub F);

impl<F> Transform for FnTransform<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync,
{
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        (self.0)(input)
    }
}

/// Rejects file names whose extension is not jpg, jpeg or png (any case).
pub fn validate_extension(filename: &str) -> Result<(), TransformError> {
    let extension = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(TransformError::UnsupportedFormat {
            extension: format!(".{}", extension),
            allowed: allowed_list(),
        })
    }
}

/// MIME type of transform output, sniffed from its leading bytes.
///
/// Falls back to a guess from `filename` when the bytes are not a known
/// image format.
pub fn detect_media_type(output: &[u8], filename: &str) -> String {
    match image::guess_format(output) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => crate::jobs::record::guess_media_type(filename),
    }
}

fn allowed_list() -> String {
    ALLOWED_EXTENSIONS
        .iter()
        .map(|e| format!(".{}", e))
        .collect::<Vec<_>>()
        .join(", ")
}
