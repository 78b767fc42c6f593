//! Frame container shared by every stage of the UDF pipeline.
//!
//! A [`Frame`] owns one or more image planes plus a metadata [`Envelope`]
//! kept in sync with the planes. Serializing a frame transfers ownership of
//! the pixel buffers into the envelope for the transport layer;
//! deserializing reverses the hand-off, decoding JPEG/PNG payloads on the
//! fly.
//!
//! The crate also provides the bounded [`FrameQueue`] used between the
//! ingest stage, the UDF manager, and the transport.

pub use error::FrameError;
pub use frame::{EncodeType, Frame, PixelBacking};
pub use queue::{FrameQueue, QueueFull};

pub use msg_envelope::Envelope;

mod codec;
mod error;
mod frame;
mod queue;
