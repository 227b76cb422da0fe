//! Traits for memory accounting.
//!
//! The cache attributes memory to every object it holds; nodes report
//! their in-memory footprint through [Size] and fixed-layout types
//! through [StaticSize].

/// A type whose in-memory size can be computed at runtime.
pub trait Size {
    /// Returns the current memory footprint in bytes. May be an estimate
    /// kept incrementally; must never undershoot the serialized size.
    fn size(&self) -> usize;

    /// Returns the exactly computed size, scanning contained data.
    /// `None` if the incremental estimate is always exact.
    fn actual_size(&self) -> Option<usize> {
        None
    }

    /// Verifies the incremental estimate against the exact computation.
    fn checked_size(&self) -> Result<usize, (usize, usize)> {
        match (self.size(), self.actual_size()) {
            (predicted, Some(actual)) if predicted == actual => Ok(actual),
            (predicted, Some(actual)) => Err((predicted, actual)),
            (predicted, None) => Ok(predicted),
        }
    }
}

/// A type with a size known at compile time.
pub trait StaticSize {
    /// Returns the size in bytes.
    fn static_size() -> usize;
}

impl<T: StaticSize> Size for T {
    fn size(&self) -> usize {
        T::static_size()
    }
}
