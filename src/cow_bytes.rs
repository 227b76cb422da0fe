//! Copy-on-write byte containers used for keys, values and pivots.

use crate::size::Size;
use std::{borrow::Borrow, cmp, fmt, ops::Deref, sync::Arc};

/// Reference-counted byte buffer. Cloning is cheap; mutation copies when
/// the buffer is shared.
#[derive(Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CowBytes {
    pub(crate) inner: Arc<Vec<u8>>,
}

impl serde::Serialize for CowBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self)
    }
}

impl<'de> serde::Deserialize<'de> for CowBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = <Vec<u8> as serde::Deserialize>::deserialize(deserializer)?;
        Ok(CowBytes {
            inner: Arc::new(data),
        })
    }
}

impl fmt::Debug for CowBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", &**self)
    }
}

impl CowBytes {
    /// Builds a buffer by copying the bytes of `x`.
    pub fn from<T: AsRef<[u8]>>(x: T) -> Self {
        CowBytes {
            inner: Arc::new(x.as_ref().to_vec()),
        }
    }
}

impl Borrow<[u8]> for CowBytes {
    fn borrow(&self) -> &[u8] {
        self
    }
}

impl AsRef<[u8]> for CowBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Deref for CowBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl PartialEq<[u8]> for CowBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

impl Size for CowBytes {
    fn size(&self) -> usize {
        8 + self.inner.len()
    }
}

impl CowBytes {
    /// Returns a new, empty buffer.
    pub fn new() -> Self {
        CowBytes::default()
    }

    /// Returns the length of the byte buffer.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pushes a byte slice, copying the buffer if it is shared.
    pub fn push_slice(&mut self, v: &[u8]) {
        Arc::make_mut(&mut self.inner).extend_from_slice(v)
    }

    /// Returns a subslice view into this buffer without copying.
    pub fn slice(&self, pos: u32, len: u32) -> SlicedCowBytes {
        SlicedCowBytes::from(self.clone()).subslice(pos, len)
    }

    /// Consumes the buffer, returning the inner vector. Copies if shared.
    pub fn into_vec(self) -> Vec<u8> {
        match Arc::try_unwrap(self.inner) {
            Ok(v) => v,
            Err(this) => (*this).clone(),
        }
    }
}

/// A view into a [CowBytes] buffer. Used for values that alias a larger
/// deserialized region.
#[derive(Default, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SlicedCowBytes {
    pub(crate) data: CowBytes,
    pos: u32,
    len: u32,
}

impl PartialEq for SlicedCowBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for SlicedCowBytes {}

impl PartialOrd for SlicedCowBytes {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlicedCowBytes {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        (**self).cmp(&**other)
    }
}

impl From<CowBytes> for SlicedCowBytes {
    fn from(data: CowBytes) -> Self {
        SlicedCowBytes {
            pos: 0,
            len: data.len() as u32,
            data,
        }
    }
}

impl Deref for SlicedCowBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let start = self.pos as usize;
        let end = start + self.len as usize;
        &self.data[start..end]
    }
}

impl Borrow<[u8]> for SlicedCowBytes {
    fn borrow(&self) -> &[u8] {
        self
    }
}

impl AsRef<[u8]> for SlicedCowBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Size for SlicedCowBytes {
    fn size(&self) -> usize {
        8 + self.len as usize
    }
}

impl SlicedCowBytes {
    /// Returns the length of the view.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrows the view to `len` bytes starting at `pos`, relative to the
    /// current view.
    pub fn subslice(self, pos: u32, len: u32) -> Self {
        let pos = self.pos + pos;
        assert!(pos + len <= self.pos + self.len);
        SlicedCowBytes {
            data: self.data,
            pos,
            len,
        }
    }

    /// Copies the viewed bytes into an owned [CowBytes].
    pub fn to_cow(&self) -> CowBytes {
        CowBytes::from(&**self)
    }
}
