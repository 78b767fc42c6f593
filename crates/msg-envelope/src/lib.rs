//! Typed key-value message envelope used as the serialization unit between
//! pipeline stages and the downstream transport.
//!
//! An [`Envelope`] carries a JSON-shaped document of typed values plus zero
//! or more positional [`Blob`] payloads. Blobs hold their bytes behind a
//! shared-ownership backing so that large pixel buffers transfer between
//! owners without copying.

pub use blob::{Blob, BlobBacking};
pub use envelope::{ContentType, Envelope};
pub use error::EnvelopeError;
pub use value::{Object, Value};

mod blob;
mod envelope;
mod error;
mod value;
