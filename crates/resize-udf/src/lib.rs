//! Sample native UDF: resizes the first plane to a configured
//! `width` x `height` and records the target size in the metadata.
//!
//! Built as a `cdylib`; drop the resulting `libresize_udf.so` on the
//! library search path and reference it from the pipeline config as
//! `{"type": "native", "name": "resize_udf", "width": ..., "height": ...}`.

use frame_core::Frame;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage, RgbaImage};
use udf_runtime::{NativeUdf, RuntimeError, UdfOutcome};

struct ResizeUdf {
    width: u32,
    height: u32,
}

impl ResizeUdf {
    fn from_config(config: &serde_json::Value) -> Result<Self, RuntimeError> {
        let width = required_dimension(config, "width")?;
        let height = required_dimension(config, "height")?;
        Ok(Self { width, height })
    }
}

fn required_dimension(config: &serde_json::Value, key: &str) -> Result<u32, RuntimeError> {
    config
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .map(|value| value as u32)
        .ok_or_else(|| RuntimeError::ConfigInvalid(format!(
            "resize UDF requires a positive integer {key:?}"
        )))
}

impl NativeUdf for ResizeUdf {
    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError> {
        let source_width = frame.width(0)?;
        let source_height = frame.height(0)?;
        let channels = frame.channels(0)?;
        let pixels = frame.data(0)?.to_vec();

        let resized: Vec<u8> = match channels {
            1 => {
                let img = GrayImage::from_raw(source_width, source_height, pixels)
                    .ok_or_else(|| process_error("plane does not match its dimensions"))?;
                imageops::resize(&img, self.width, self.height, FilterType::Triangle).into_raw()
            }
            3 => {
                let img = RgbImage::from_raw(source_width, source_height, pixels)
                    .ok_or_else(|| process_error("plane does not match its dimensions"))?;
                imageops::resize(&img, self.width, self.height, FilterType::Triangle).into_raw()
            }
            4 => {
                let img = RgbaImage::from_raw(source_width, source_height, pixels)
                    .ok_or_else(|| process_error("plane does not match its dimensions"))?;
                imageops::resize(&img, self.width, self.height, FilterType::Triangle).into_raw()
            }
            other => {
                return Err(process_error(format!(
                    "unsupported channel count {other}"
                )));
            }
        };

        frame.set_data(0, resized, self.width, self.height, channels)?;

        let meta = frame.meta_data_mut();
        let _ = meta.remove("resize_width");
        let _ = meta.remove("resize_height");
        let _ = meta.put("resize_width", self.width as i64);
        let _ = meta.put("resize_height", self.height as i64);

        Ok(UdfOutcome::Modified)
    }
}

fn process_error(reason: impl Into<String>) -> RuntimeError {
    RuntimeError::Process {
        name: "resize_udf".to_string(),
        reason: reason.into(),
    }
}

/// Entry factory resolved by the native UDF loader.
#[unsafe(no_mangle)]
pub fn initialize_udf(config: &serde_json::Value) -> Result<Box<dyn NativeUdf>, RuntimeError> {
    Ok(Box::new(ResizeUdf::from_config(config)?))
}
