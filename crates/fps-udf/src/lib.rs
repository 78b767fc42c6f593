//! Sample native UDF: counts the frames that pass through it and stamps
//! the most recent frames-per-second figure into each frame's metadata.
//!
//! Config keys: `key` (optional, default `"fps"`) names the metadata key
//! the measurement is written under.

use std::time::Instant;

use frame_core::Frame;
use tracing::debug;
use udf_runtime::{NativeUdf, RuntimeError, UdfOutcome};

const DEFAULT_KEY: &str = "fps";

struct FpsUdf {
    key: String,
    window_start: Option<Instant>,
    frame_count: u64,
    fps: u64,
}

impl FpsUdf {
    fn from_config(config: &serde_json::Value) -> Result<Self, RuntimeError> {
        let key = match config.get("key") {
            None => DEFAULT_KEY.to_string(),
            Some(value) => value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| {
                    RuntimeError::ConfigInvalid("fps UDF \"key\" must be a string".to_string())
                })?,
        };
        Ok(Self {
            key,
            window_start: None,
            frame_count: 0,
            fps: 0,
        })
    }
}

impl NativeUdf for FpsUdf {
    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError> {
        let now = Instant::now();
        let window_start = *self.window_start.get_or_insert(now);
        self.frame_count += 1;

        if now.duration_since(window_start).as_secs_f64() >= 1.0 {
            self.fps = self.frame_count;
            debug!(fps = self.fps, "measured frame rate");
            self.frame_count = 0;
            self.window_start = Some(now);
        }

        let meta = frame.meta_data_mut();
        let _ = meta.remove(&self.key);
        meta.put(self.key.clone(), self.fps as i64)
            .map_err(|err| RuntimeError::Process {
                name: "fps_udf".to_string(),
                reason: err.to_string(),
            })?;
        Ok(UdfOutcome::Pass)
    }
}

/// Entry factory resolved by the native UDF loader.
#[unsafe(no_mangle)]
pub fn initialize_udf(config: &serde_json::Value) -> Result<Box<dyn NativeUdf>, RuntimeError> {
    Ok(Box::new(FpsUdf::from_config(config)?))
}
