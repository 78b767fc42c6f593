//! Shared-ownership byte payloads.

use std::fmt;
use std::sync::Arc;

/// Storage owning the bytes behind a [`Blob`].
///
/// The implementation's `Drop` is the blob's deleter: it runs exactly once,
/// when the last clone of the blob goes away. Anything that keeps foreign
/// memory alive (a decoded image, an interpreter-owned array) implements
/// this to tie that lifetime to the blob's.
pub trait BlobBacking: Send + Sync {
    fn as_bytes(&self) -> &[u8];
}

impl BlobBacking for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

enum BlobRepr {
    Owned(Vec<u8>),
    Backed(Box<dyn BlobBacking>),
}

/// Refcounted opaque byte payload.
///
/// Cloning a blob shares the underlying storage; the storage is released
/// when the final clone drops.
#[derive(Clone)]
pub struct Blob {
    repr: Arc<BlobRepr>,
}

impl Blob {
    /// Wrap an owned byte vector.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            repr: Arc::new(BlobRepr::Owned(bytes)),
        }
    }

    /// Wrap an arbitrary backing object.
    pub fn from_backing(backing: impl BlobBacking + 'static) -> Self {
        Self {
            repr: Arc::new(BlobRepr::Backed(Box::new(backing))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &*self.repr {
            BlobRepr::Owned(bytes) => bytes,
            BlobRepr::Backed(backing) => backing.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Number of live references to the underlying storage.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.repr)
    }

    /// Recover the bytes, avoiding a copy when this is the sole owner of an
    /// owned vector.
    pub fn into_bytes(self) -> Vec<u8> {
        match Arc::try_unwrap(self.repr) {
            Ok(BlobRepr::Owned(bytes)) => bytes,
            Ok(BlobRepr::Backed(backing)) => backing.as_bytes().to_vec(),
            Err(shared) => match &*shared {
                BlobRepr::Owned(bytes) => bytes.clone(),
                BlobRepr::Backed(backing) => backing.as_bytes().to_vec(),
            },
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
