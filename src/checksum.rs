//! Checksums for on-disk data integrity.

use crate::size::StaticSize;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{error::Error, fmt, hash::Hasher, iter::once};
use twox_hash::XxHash64;

/// A checksum over a byte stream.
pub trait Checksum:
    Serialize + DeserializeOwned + Eq + fmt::Debug + Clone + Send + Sync + 'static
{
    type Builder: Builder<Self>;

    /// Verifies `data` against this checksum.
    fn verify(&self, data: &[u8]) -> Result<(), ChecksumError> {
        self.verify_buffer(once(data))
    }

    /// Verifies a sequence of byte chunks against this checksum.
    fn verify_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(
        &self,
        data: I,
    ) -> Result<(), ChecksumError>;

    /// Returns the builder for this checksum type.
    fn builder() -> Self::Builder;
}

/// Builds a new [Checksum] state.
pub trait Builder<C: Checksum>:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    type State: State<Checksum = C>;

    fn build(&self) -> Self::State;
}

/// Holds the state of a checksum computation.
pub trait State {
    type Checksum: Checksum;

    /// Ingests `data` into the state.
    fn ingest(&mut self, data: &[u8]);

    /// Finishes the computation.
    fn finish(self) -> Self::Checksum;
}

/// Returned on verification failure.
#[derive(Debug)]
pub struct ChecksumError;

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "checksum verification failed")
    }
}

impl Error for ChecksumError {
    fn description(&self) -> &str {
        "a checksum error occurred"
    }
}

/// XxHash64 checksum.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct XxHash(u64);

impl StaticSize for XxHash {
    fn static_size() -> usize {
        8
    }
}

impl XxHash {
    pub(crate) fn to_u64(self) -> u64 {
        self.0
    }
}

impl Checksum for XxHash {
    type Builder = XxHashBuilder;

    fn verify_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(
        &self,
        data: I,
    ) -> Result<(), ChecksumError> {
        let mut state = XxHashBuilder.build();
        for x in data {
            state.ingest(x.as_ref());
        }
        if state.finish() == *self {
            Ok(())
        } else {
            Err(ChecksumError)
        }
    }

    fn builder() -> Self::Builder {
        XxHashBuilder
    }
}

/// Builder for [XxHash].
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct XxHashBuilder;

impl Builder<XxHash> for XxHashBuilder {
    type State = XxHashState;

    fn build(&self) -> Self::State {
        XxHashState(XxHash64::with_seed(0))
    }
}

/// State of an XxHash computation.
pub struct XxHashState(XxHash64);

impl State for XxHashState {
    type Checksum = XxHash;

    fn ingest(&mut self, data: &[u8]) {
        self.0.write(data);
    }

    fn finish(self) -> XxHash {
        XxHash(self.0.finish())
    }
}

/// Checksums a single contiguous buffer.
pub fn checksum_of(data: &[u8]) -> XxHash {
    let mut state = XxHashBuilder.build();
    state.ingest(data);
    state.finish()
}
