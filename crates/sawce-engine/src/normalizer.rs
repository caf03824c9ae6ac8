use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageResult, Rgb, RgbImage};
use sawce_contracts::error::AnalyzeError;
use tracing::warn;

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";
pub const MIN_IMAGE_DIM: u32 = 128;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: &'static str,
    pub data_url: String,
    pub byte_len: usize,
    pub transcoded: bool,
}

/// Turns uploaded bytes into a `data:image/jpeg;base64,...` URL.
///
/// Decodable images are flattened onto white, fitted within `max_dim` and
/// re-encoded as JPEG. Anything the decoder rejects is forwarded as-is.
pub fn normalize(raw: &[u8], max_dim: u32) -> Result<EncodedImage, AnalyzeError> {
    if raw.is_empty() {
        return Err(AnalyzeError::MissingImage);
    }
    let (bytes, transcoded) = match transcode_to_jpeg(raw, max_dim) {
        Ok(bytes) => (bytes, true),
        Err(err) => {
            warn!(error = %err, bytes = raw.len(), "image not decodable; forwarding original bytes");
            (raw.to_vec(), false)
        }
    };
    let encoded = BASE64.encode(&bytes);
    Ok(EncodedImage {
        media_type: JPEG_MEDIA_TYPE,
        data_url: format!("data:{JPEG_MEDIA_TYPE};base64,{encoded}"),
        byte_len: bytes.len(),
        transcoded,
    })
}

fn transcode_to_jpeg(raw: &[u8], max_dim: u32) -> ImageResult<Vec<u8>> {
    let dim = max_dim.max(MIN_IMAGE_DIM);
    let rgba = image::load_from_memory(raw)?.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }

    let fitted = if flattened.width() > dim || flattened.height() > dim {
        DynamicImage::ImageRgb8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8()
    } else {
        flattened
    };

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder.encode_image(&fitted)?;
    Ok(bytes)
}
