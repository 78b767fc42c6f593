//! Native UDF handle: dynamically loaded shared objects.

use std::env;
use std::path::{Path, PathBuf};

use frame_core::Frame;
use libloading::{Library, Symbol};
use tracing::debug;

use crate::error::RuntimeError;
use crate::handle::{NativeUdf, UdfFactory, UdfHandle, UdfOutcome, UDF_ENTRY_SYMBOL};

/// Environment variable holding the colon-separated library search path.
const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// A UDF implemented in a shared object discovered on the library path.
///
/// The library exports [`UDF_ENTRY_SYMBOL`], a factory that builds the UDF
/// object from its config.
pub struct NativeUdfHandle {
    name: String,
    // Field order is load-bearing: the UDF object must drop before the
    // library that provides its code is unloaded.
    udf: Box<dyn NativeUdf>,
    _library: Library,
}

impl std::fmt::Debug for NativeUdfHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeUdfHandle")
            .field("name", &self.name)
            .finish()
    }
}

impl NativeUdfHandle {
    /// Search the library path for `lib<name>.<ext>`, load it, resolve the
    /// entry factory, and instantiate the UDF with `config`.
    pub fn load(name: &str, config: &serde_json::Value) -> Result<Self, RuntimeError> {
        let search_path = env::var(LIBRARY_PATH_VAR).map_err(|_| RuntimeError::UdfLoadFailed {
            name: name.to_string(),
            reason: format!("{LIBRARY_PATH_VAR} is not set"),
        })?;

        let path =
            resolve_library(name, &search_path).ok_or_else(|| RuntimeError::UdfLoadFailed {
                name: name.to_string(),
                reason: format!("no {} on {LIBRARY_PATH_VAR}", library_file_name(name)),
            })?;
        debug!(name, path = %path.display(), "loading native UDF");

        // SAFETY: loading and calling into the shared object is inherently
        // trusting its initialization code; the factory signature is the
        // published plugin contract.
        let library = unsafe { Library::new(&path) }.map_err(|err| RuntimeError::UdfLoadFailed {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        let udf = {
            let factory: Symbol<'_, UdfFactory> = unsafe { library.get(UDF_ENTRY_SYMBOL) }
                .map_err(|err| RuntimeError::UdfLoadFailed {
                    name: name.to_string(),
                    reason: format!("entry symbol missing: {err}"),
                })?;
            factory(config).map_err(|err| RuntimeError::UdfInitFailed {
                name: name.to_string(),
                reason: err.to_string(),
            })?
        };
        debug!(name, "native UDF initialized");

        Ok(Self {
            name: name.to_string(),
            udf,
            _library: library,
        })
    }
}

impl UdfHandle for NativeUdfHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError> {
        self.udf.process(frame)
    }
}

/// Platform file name for a UDF library, e.g. `libresize_udf.so`.
fn library_file_name(name: &str) -> String {
    format!(
        "{}{}.{}",
        env::consts::DLL_PREFIX,
        name,
        env::consts::DLL_EXTENSION
    )
}

/// Walk the colon-separated `search_path`; the first directory containing
/// the library wins.
fn resolve_library(name: &str, search_path: &str) -> Option<PathBuf> {
    let file_name = library_file_name(name);
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(&file_name))
        .find(|candidate| candidate.is_file())
}
