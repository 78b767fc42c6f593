//! Resolves a UDF config entry to a ready-to-run handle.

use tracing::debug;

use crate::config::{UdfConfig, UdfKind};
use crate::error::RuntimeError;
use crate::handle::UdfHandle;
use crate::native::NativeUdfHandle;

/// Build and initialize the handle described by `config`.
pub fn load_udf(config: &UdfConfig) -> Result<Box<dyn UdfHandle>, RuntimeError> {
    debug!(name = config.name.as_str(), kind = ?config.kind, "loading UDF");
    match config.kind {
        UdfKind::Native => Ok(Box::new(NativeUdfHandle::load(&config.name, &config.params)?)),
        #[cfg(feature = "python")]
        UdfKind::Python => Ok(Box::new(crate::python::PythonUdfHandle::load(
            &config.name,
            &config.params,
        )?)),
        #[cfg(not(feature = "python"))]
        UdfKind::Python => Err(RuntimeError::UdfLoadFailed {
            name: config.name.clone(),
            reason: "built without the `python` feature".to_string(),
        }),
    }
}
