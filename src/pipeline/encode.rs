//! Page encoding for the vision API: `DynamicImage` → base64 PNG `ImageData`.
//!
//! PNG, because JPEG artefacts around glyph edges degrade recognition far
//! more than the extra bytes cost. Colour pages are reduced to 8-bit
//! greyscale first when asked: text recognition does not use colour and the
//! payload shrinks to roughly a third.

use crate::error::OcrError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page for a multimodal chat request.
///
/// `detail: "high"` makes tiling models look at the full-resolution image;
/// at `low` small print is unreadable.
pub fn encode_page(img: &DynamicImage, grayscale: bool) -> Result<ImageData, OcrError> {
    let mut buf = Vec::new();
    let write = if grayscale && img.color().has_color() {
        DynamicImage::ImageLuma8(img.to_luma8())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
    } else {
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
    };
    write.map_err(|e| OcrError::engine(format!("PNG encoding failed: {e}")))?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        width = img.width(),
        height = img.height(),
        bytes = b64.len(),
        "Encoded page image"
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
