//! The polymorphic frame container.
//!
//! A frame owns an ordered list of image planes plus the metadata envelope
//! describing them. Plane 0 is mirrored into the envelope's root keys;
//! planes 1..N are mirrored into objects inside the reserved
//! `additional_frames` array (element `i - 1` describes plane `i`).
//! Serialization consumes the frame and transfers every pixel buffer into
//! the envelope as a positional blob.

use std::fmt;

use msg_envelope::{Blob, BlobBacking, ContentType, Envelope, Object, Value};
use rand::Rng;
use tracing::{debug, warn};

use crate::codec;
use crate::error::FrameError;

const KEY_IMG_HANDLE: &str = "img_handle";
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_CHANNELS: &str = "channels";
const KEY_ENCODING_TYPE: &str = "encoding_type";
const KEY_ENCODING_LEVEL: &str = "encoding_level";
const KEY_ADDITIONAL_FRAMES: &str = "additional_frames";

/// Target encoding applied to a plane at serialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeType {
    None,
    Jpeg,
    Png,
}

impl EncodeType {
    /// Name used on the wire, `None` for unencoded planes.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            EncodeType::None => None,
            EncodeType::Jpeg => Some("jpeg"),
            EncodeType::Png => Some("png"),
        }
    }

    /// Parse a wire-format encoding name.
    pub fn from_wire(name: &str) -> Result<Self, FrameError> {
        match name {
            "jpeg" => Ok(EncodeType::Jpeg),
            "png" => Ok(EncodeType::Png),
            other => Err(FrameError::UnknownEncoding(other.to_string())),
        }
    }

    /// Whether `level` is in the valid range for this encoding
    /// (JPEG quality 0-100, PNG compression 0-9).
    pub fn level_valid(self, level: i32) -> bool {
        match self {
            EncodeType::None => true,
            EncodeType::Jpeg => (0..=100).contains(&level),
            EncodeType::Png => (0..=9).contains(&level),
        }
    }
}

/// Owning handle for the storage backing one image plane.
///
/// The implementation's `Drop` releases the storage; ownership guarantees
/// it runs exactly once, either when the plane is replaced or when the
/// serialized envelope is destroyed downstream. Implementations that wrap
/// foreign memory (interpreter-owned arrays, device buffers) release it
/// from their `Drop`.
pub trait PixelBacking: Send + Sync {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl PixelBacking for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// One image plane: its metadata record and the buffer behind it.
struct FrameData {
    img_handle: String,
    width: u32,
    height: u32,
    channels: u32,
    encode: EncodeType,
    encode_level: i32,
    backing: Box<dyn PixelBacking>,
}

/// Adapter handing a plane's storage to the envelope as blob backing.
struct PlaneBlob(Box<dyn PixelBacking>);

impl BlobBacking for PlaneBlob {
    fn as_bytes(&self) -> &[u8] {
        self.0.bytes()
    }
}

/// Ordered collection of image planes plus their metadata envelope.
///
/// Frames are deliberately neither `Clone` nor `Copy`: each frame is owned
/// by exactly one pipeline stage at a time. [`Frame::serialize`] consumes
/// the frame, so use-after-serialize cannot be expressed.
pub struct Frame {
    planes: Vec<FrameData>,
    meta: Envelope,
}

impl Frame {
    /// Create a frame with no planes yet; populate it with
    /// [`Frame::add_frame`].
    pub fn empty() -> Self {
        Self {
            planes: Vec::new(),
            meta: Envelope::new(ContentType::Json),
        }
    }

    /// Single-plane convenience constructor.
    pub fn new(
        backing: impl PixelBacking + 'static,
        width: u32,
        height: u32,
        channels: u32,
        encode: EncodeType,
        encode_level: i32,
    ) -> Result<Self, FrameError> {
        let mut frame = Frame::empty();
        frame.add_frame(backing, width, height, channels, encode, encode_level)?;
        Ok(frame)
    }

    /// Append a plane. The first plane populates the envelope's root keys;
    /// subsequent planes append an object to `additional_frames`. On error
    /// the frame is left unchanged.
    pub fn add_frame(
        &mut self,
        backing: impl PixelBacking + 'static,
        width: u32,
        height: u32,
        channels: u32,
        encode: EncodeType,
        encode_level: i32,
    ) -> Result<(), FrameError> {
        if !encode.level_valid(encode_level) {
            return Err(FrameError::InvalidEncodeLevel {
                encode,
                level: encode_level,
            });
        }
        let expected = (width * height * channels) as usize;
        let actual = backing.bytes().len();
        if expected != actual {
            return Err(FrameError::SizeMismatch { expected, actual });
        }

        let plane = FrameData {
            img_handle: generate_img_handle(),
            width,
            height,
            channels,
            encode,
            encode_level,
            backing: Box::new(backing),
        };

        if self.planes.is_empty() {
            write_plane_keys(self.meta.root_mut(), &plane)?;
        } else {
            let mut entry = Object::new();
            write_plane_keys(&mut entry, &plane)?;
            match self.meta.get_mut(KEY_ADDITIONAL_FRAMES) {
                Some(value) => {
                    let array = value.as_array_mut().ok_or(FrameError::Envelope(
                        msg_envelope::EnvelopeError::TypeMismatch {
                            key: KEY_ADDITIONAL_FRAMES.to_string(),
                            expected: "array",
                        },
                    ))?;
                    array.push(Value::Object(entry));
                }
                None => {
                    self.meta
                        .put(KEY_ADDITIONAL_FRAMES, Value::Array(vec![Value::Object(entry)]))?;
                }
            }
        }

        self.planes.push(plane);
        Ok(())
    }

    /// Deserialize a frame from an envelope received over the transport.
    ///
    /// Detaches every blob from the envelope. Planes carrying an
    /// `encoding_type` are decoded through the color decoder; a mismatch
    /// between the declared and decoded dimensions is tolerated, with the
    /// decoded dimensions winning.
    pub fn from_envelope(mut envelope: Envelope) -> Result<Self, FrameError> {
        let blobs = envelope.take_blobs();
        if blobs.is_empty() {
            return Err(FrameError::MissingBlob);
        }

        let mut descriptors = Vec::with_capacity(blobs.len());
        descriptors.push(read_plane_keys(envelope.root())?);
        if blobs.len() > 1 {
            let extras = envelope
                .get(KEY_ADDITIONAL_FRAMES)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    FrameError::Envelope(msg_envelope::EnvelopeError::NotFound(
                        KEY_ADDITIONAL_FRAMES.to_string(),
                    ))
                })?;
            for index in 1..blobs.len() {
                let entry = extras
                    .get(index - 1)
                    .and_then(Value::as_object)
                    .ok_or(FrameError::IndexOutOfRange(index))?;
                descriptors.push(read_plane_keys(entry)?);
            }
        }

        let mut frame = Frame {
            planes: Vec::with_capacity(blobs.len()),
            meta: envelope,
        };

        for (index, (blob, desc)) in blobs.into_iter().zip(descriptors).enumerate() {
            let plane = match desc.encoding {
                Some((encode, level)) => {
                    let (bytes, width, height, channels) = codec::decode(blob.as_bytes())?;
                    if width != desc.width || height != desc.height {
                        warn!(
                            index,
                            meta_width = desc.width,
                            meta_height = desc.height,
                            width,
                            height,
                            "decoded dimensions differ from frame metadata"
                        );
                    }
                    FrameData {
                        img_handle: desc.img_handle,
                        width,
                        height,
                        channels,
                        encode,
                        encode_level: level,
                        backing: Box::new(bytes),
                    }
                }
                None => {
                    let bytes = blob.into_bytes();
                    let expected = (desc.width * desc.height * desc.channels) as usize;
                    if bytes.len() != expected {
                        warn!(
                            index,
                            expected,
                            actual = bytes.len(),
                            "raw plane length differs from declared dimensions"
                        );
                    }
                    FrameData {
                        img_handle: desc.img_handle,
                        width: desc.width,
                        height: desc.height,
                        channels: desc.channels,
                        encode: EncodeType::None,
                        encode_level: 0,
                        backing: Box::new(bytes),
                    }
                }
            };
            let dims_changed =
                plane.width != desc.width || plane.height != desc.height || plane.channels != desc.channels;
            frame.planes.push(plane);
            if dims_changed {
                frame.rewrite_dims(index)?;
            }
        }

        Ok(frame)
    }

    pub fn frame_count(&self) -> usize {
        self.planes.len()
    }

    pub fn width(&self, index: usize) -> Result<u32, FrameError> {
        self.plane(index).map(|p| p.width)
    }

    pub fn height(&self, index: usize) -> Result<u32, FrameError> {
        self.plane(index).map(|p| p.height)
    }

    pub fn channels(&self, index: usize) -> Result<u32, FrameError> {
        self.plane(index).map(|p| p.channels)
    }

    pub fn encode_type(&self, index: usize) -> Result<EncodeType, FrameError> {
        self.plane(index).map(|p| p.encode)
    }

    pub fn encode_level(&self, index: usize) -> Result<i32, FrameError> {
        self.plane(index).map(|p| p.encode_level)
    }

    pub fn img_handle(&self, index: usize) -> Result<&str, FrameError> {
        self.plane(index).map(|p| p.img_handle.as_str())
    }

    pub fn data(&self, index: usize) -> Result<&[u8], FrameError> {
        self.plane(index).map(|p| p.backing.bytes())
    }

    pub fn data_mut(&mut self, index: usize) -> Result<&mut [u8], FrameError> {
        let plane = self
            .planes
            .get_mut(index)
            .ok_or(FrameError::IndexOutOfRange(index))?;
        Ok(plane.backing.bytes_mut())
    }

    /// The metadata envelope linked to this frame.
    pub fn meta_data(&self) -> &Envelope {
        &self.meta
    }

    /// Mutable access for UDFs adding their own keys.
    pub fn meta_data_mut(&mut self) -> &mut Envelope {
        &mut self.meta
    }

    /// Replace plane `index` with a new buffer, preserving its
    /// `img_handle` and encoding settings. The previous buffer is released
    /// only after the new one is fully wired in.
    pub fn set_data(
        &mut self,
        index: usize,
        backing: impl PixelBacking + 'static,
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<(), FrameError> {
        if index >= self.planes.len() {
            return Err(FrameError::IndexOutOfRange(index));
        }
        let expected = (width * height * channels) as usize;
        let actual = backing.bytes().len();
        if expected != actual {
            return Err(FrameError::SizeMismatch { expected, actual });
        }

        {
            let plane = &mut self.planes[index];
            plane.width = width;
            plane.height = height;
            plane.channels = channels;
            plane.backing = Box::new(backing);
        }
        self.rewrite_dims(index)
    }

    /// Update the target encoding for plane `index`. This records the
    /// intent on the plane and its metadata; the encode itself happens at
    /// serialization time.
    pub fn set_encoding(
        &mut self,
        encode: EncodeType,
        encode_level: i32,
        index: usize,
    ) -> Result<(), FrameError> {
        if !encode.level_valid(encode_level) {
            return Err(FrameError::InvalidEncodeLevel {
                encode,
                level: encode_level,
            });
        }
        if index >= self.planes.len() {
            return Err(FrameError::IndexOutOfRange(index));
        }

        {
            let object = self.plane_object_mut(index)?;
            let _ = object.remove(KEY_ENCODING_TYPE);
            let _ = object.remove(KEY_ENCODING_LEVEL);
            if let Some(name) = encode.wire_name() {
                object.put(KEY_ENCODING_TYPE, name)?;
                object.put(KEY_ENCODING_LEVEL, encode_level as i64)?;
            }
        }

        let plane = &mut self.planes[index];
        plane.encode = encode;
        plane.encode_level = encode_level;
        Ok(())
    }

    /// Serialize the frame, transferring every plane into the returned
    /// envelope as a positional blob.
    ///
    /// Planes with a configured encoding are encoded first; a codec failure
    /// aborts the serialization and releases the frame. Consuming `self`
    /// makes the operation one-shot: the pixel buffers now belong to the
    /// envelope and are released when the transport destroys it.
    pub fn serialize(mut self) -> Result<Envelope, FrameError> {
        for plane in &mut self.planes {
            if plane.encode == EncodeType::None {
                continue;
            }
            debug!(
                handle = plane.img_handle.as_str(),
                encode = ?plane.encode,
                level = plane.encode_level,
                "encoding plane"
            );
            let encoded = codec::encode(
                plane.backing.bytes(),
                plane.width,
                plane.height,
                plane.channels,
                plane.encode,
                plane.encode_level,
            )?;
            plane.backing = Box::new(encoded);
        }

        let mut envelope = self.meta;
        for plane in self.planes {
            envelope.put_blob(Blob::from_backing(PlaneBlob(plane.backing)));
        }
        Ok(envelope)
    }

    fn plane(&self, index: usize) -> Result<&FrameData, FrameError> {
        self.planes.get(index).ok_or(FrameError::IndexOutOfRange(index))
    }

    /// Rewrite the mirrored width/height/channels keys for plane `index`.
    fn rewrite_dims(&mut self, index: usize) -> Result<(), FrameError> {
        let (width, height, channels) = {
            let plane = self.plane(index)?;
            (plane.width, plane.height, plane.channels)
        };
        let object = self.plane_object_mut(index)?;
        let _ = object.remove(KEY_WIDTH);
        let _ = object.remove(KEY_HEIGHT);
        let _ = object.remove(KEY_CHANNELS);
        object.put(KEY_WIDTH, width as i64)?;
        object.put(KEY_HEIGHT, height as i64)?;
        object.put(KEY_CHANNELS, channels as i64)?;
        Ok(())
    }

    /// The metadata object describing plane `index`: the envelope root for
    /// plane 0, the matching `additional_frames` entry otherwise.
    fn plane_object_mut(&mut self, index: usize) -> Result<&mut Object, FrameError> {
        if index == 0 {
            return Ok(self.meta.root_mut());
        }
        self.meta
            .get_mut(KEY_ADDITIONAL_FRAMES)
            .and_then(Value::as_array_mut)
            .and_then(|array| array.get_mut(index - 1))
            .and_then(Value::as_object_mut)
            .ok_or(FrameError::IndexOutOfRange(index))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut planes = f.debug_list();
        for plane in &self.planes {
            planes.entry(&format_args!(
                "{} {}x{}x{} {:?}",
                plane.img_handle, plane.width, plane.height, plane.channels, plane.encode
            ));
        }
        planes.finish()
    }
}

/// Metadata describing one plane, as read back from the wire.
struct PlaneDescriptor {
    img_handle: String,
    width: u32,
    height: u32,
    channels: u32,
    encoding: Option<(EncodeType, i32)>,
}

fn read_plane_keys(object: &Object) -> Result<PlaneDescriptor, FrameError> {
    let width = object.get_int(KEY_WIDTH)? as u32;
    let height = object.get_int(KEY_HEIGHT)? as u32;
    let channels = object.get_int(KEY_CHANNELS)? as u32;
    let img_handle = match object.get(KEY_IMG_HANDLE) {
        Some(value) => value
            .as_str()
            .ok_or(FrameError::Envelope(
                msg_envelope::EnvelopeError::TypeMismatch {
                    key: KEY_IMG_HANDLE.to_string(),
                    expected: "string",
                },
            ))?
            .to_string(),
        // Envelopes from older producers omit the handle; mint one so the
        // plane stays addressable downstream.
        None => generate_img_handle(),
    };
    let encoding = match object.get(KEY_ENCODING_TYPE) {
        Some(value) => {
            let name = value.as_str().ok_or(FrameError::Envelope(
                msg_envelope::EnvelopeError::TypeMismatch {
                    key: KEY_ENCODING_TYPE.to_string(),
                    expected: "string",
                },
            ))?;
            let encode = EncodeType::from_wire(name)?;
            let level = object.get_int(KEY_ENCODING_LEVEL)? as i32;
            Some((encode, level))
        }
        None => None,
    };
    Ok(PlaneDescriptor {
        img_handle,
        width,
        height,
        channels,
        encoding,
    })
}

fn write_plane_keys(object: &mut Object, plane: &FrameData) -> Result<(), FrameError> {
    object.put(KEY_IMG_HANDLE, plane.img_handle.as_str())?;
    object.put(KEY_WIDTH, plane.width as i64)?;
    object.put(KEY_HEIGHT, plane.height as i64)?;
    object.put(KEY_CHANNELS, plane.channels as i64)?;
    if let Some(name) = plane.encode.wire_name() {
        object.put(KEY_ENCODING_TYPE, name)?;
        object.put(KEY_ENCODING_LEVEL, plane.encode_level as i64)?;
    }
    Ok(())
}

/// Ten lowercase hex digits; uniqueness is best-effort.
fn generate_img_handle() -> String {
    let bits: u64 = rand::rng().random();
    format!("{:010x}", bits & 0xff_ffff_ffff)
}
