//! Image encoding: `DynamicImage` → PNG bytes, and PNG → base64 payloads.
//!
//! PNG everywhere: the page bitmap sent to OCR must keep text edges crisp,
//! and crops are user-visible figures where JPEG artefacts show.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a bitmap as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} bitmap → {} PNG bytes", img.width(), img.height(), buf.len());
    Ok(buf)
}

/// Base64 of raw bytes, as embedded in JSON request bodies.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Wrap PNG bytes for a multimodal chat request.
///
/// `detail: "high"` keeps fine print legible to the vision model.
pub fn to_image_data(png: &[u8]) -> ImageData {
    ImageData::new(to_base64(png), "image/png").with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");

        let data = to_image_data(&png);
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }
}
