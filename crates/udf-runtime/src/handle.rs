//! The uniform contract over native and foreign processing stages.

use frame_core::Frame;

use crate::error::RuntimeError;

/// What a UDF asked the manager to do with the frame it processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfOutcome {
    /// Forward the frame unchanged.
    Pass,
    /// Forward the frame; its plane data was rewired in place. Only the
    /// foreign binding distinguishes this from [`UdfOutcome::Pass`].
    Modified,
    /// Discard the frame silently.
    Drop,
}

/// One stage in the UDF chain.
///
/// A handle is initialized exactly once (by its loader) and is not
/// required to be reentrant: the manager guarantees `process` runs at most
/// once at a time per handle.
pub trait UdfHandle: Send {
    fn name(&self) -> &str;

    /// Run the stage over `frame`. An `Err` is the stage's error return:
    /// the manager logs it and destroys the frame.
    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError>;
}

/// Contract implemented by UDF objects inside native shared objects.
pub trait NativeUdf: Send {
    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError>;
}

/// Factory signature exported by native UDF shared objects under
/// [`UDF_ENTRY_SYMBOL`]. Receives the UDF's config object verbatim.
pub type UdfFactory = fn(&serde_json::Value) -> Result<Box<dyn NativeUdf>, RuntimeError>;

/// Well-known entry symbol resolved from native UDF libraries.
pub const UDF_ENTRY_SYMBOL: &[u8] = b"initialize_udf";
