//! JPEG/PNG encode and decode for frame planes.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};

use crate::error::FrameError;
use crate::frame::EncodeType;

/// Encode a raw `width x height x channels` byte plane.
///
/// The level is interpreted per codec: JPEG quality 0-100, PNG compression
/// 0-9 (mapped onto the encoder's compression presets).
pub(crate) fn encode(
    bytes: &[u8],
    width: u32,
    height: u32,
    channels: u32,
    encode: EncodeType,
    level: i32,
) -> Result<Vec<u8>, FrameError> {
    let color = color_type(channels)?;
    let mut out = Vec::new();
    match encode {
        EncodeType::Jpeg => {
            let quality = level.clamp(1, 100) as u8;
            JpegEncoder::new_with_quality(&mut out, quality)
                .write_image(bytes, width, height, color)
                .map_err(|err| FrameError::EncodeFailed(err.to_string()))?;
        }
        EncodeType::Png => {
            let compression = match level {
                0..=2 => CompressionType::Fast,
                3..=6 => CompressionType::Default,
                _ => CompressionType::Best,
            };
            PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive)
                .write_image(bytes, width, height, color)
                .map_err(|err| FrameError::EncodeFailed(err.to_string()))?;
        }
        EncodeType::None => {
            return Err(FrameError::EncodeFailed(
                "plane has no encoding configured".to_string(),
            ));
        }
    }
    if out.is_empty() {
        return Err(FrameError::EncodeFailed("codec produced no bytes".to_string()));
    }
    Ok(out)
}

/// Decode an encoded payload as a color image.
///
/// Returns the raw bytes plus the decoded `(width, height, channels)`;
/// grayscale payloads are expanded to three channels, matching the
/// always-color decode policy.
pub(crate) fn decode(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32, u32), FrameError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| FrameError::DecodeFailed(err.to_string()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Ok((decoded.into_raw(), width, height, 3))
}

fn color_type(channels: u32) -> Result<ExtendedColorType, FrameError> {
    match channels {
        1 => Ok(ExtendedColorType::L8),
        3 => Ok(ExtendedColorType::Rgb8),
        4 => Ok(ExtendedColorType::Rgba8),
        other => Err(FrameError::EncodeFailed(format!(
            "unsupported channel count {other}"
        ))),
    }
}
