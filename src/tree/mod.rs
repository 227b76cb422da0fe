//! The buffered repository tree.

use crate::cow_bytes::SlicedCowBytes;

pub mod header;
pub(crate) mod imp;

pub use imp::{Cursor, CursorOutcome, KeyRange, Stat64, Stats, Tree};

/// Outcome of an [UpdateAction] callback.
#[derive(Debug, Clone)]
pub enum UpdateResult {
    /// Replace the value.
    Set(SlicedCowBytes),
    /// Remove the key.
    Delete,
    /// Leave the entry untouched.
    Keep,
}

/// User callback invoked by `Update` and `UpdateBroadcastAll` messages
/// when they reach a leaf entry. The callback synthesizes an insert or
/// delete in place from the currently visible value and the extra bytes
/// carried by the message.
pub trait UpdateAction {
    fn update(&self, key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> UpdateResult;
}

/// Overwrites the value with the message's extra bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUpdateAction;

impl UpdateAction for DefaultUpdateAction {
    fn update(&self, _key: &[u8], _old: Option<&[u8]>, extra: &[u8]) -> UpdateResult {
        UpdateResult::Set(SlicedCowBytes::from(crate::cow_bytes::CowBytes::from(
            extra,
        )))
    }
}

impl<F> UpdateAction for F
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> UpdateResult,
{
    fn update(&self, key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> UpdateResult {
        self(key, old, extra)
    }
}
