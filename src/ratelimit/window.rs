//! Fixed window arithmetic.

/// A fixed counting window.
///
/// Time is cut into consecutive buckets of `seconds` length starting at the
/// unix epoch. Bucket `n` owns `[n * seconds, (n + 1) * seconds)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedWindow {
    seconds: u64,
}

impl FixedWindow {
    /// Create a window of the given length.
    ///
    /// Returns `None` for a non-positive length, which callers treat as
    /// "throttling disabled".
    pub fn new(seconds: i64) -> Option<Self> {
        if seconds <= 0 {
            return None;
        }
        Some(Self {
            seconds: seconds as u64,
        })
    }

    /// Length of the window in seconds.
    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    /// The bucket number that owns `now`.
    pub fn bucket(&self, now: u64) -> u64 {
        now / self.seconds
    }

    /// Seconds left until the bucket owning `now` ends.
    pub fn reset_after(&self, now: u64) -> u64 {
        let end = (self.bucket(now) + 1).saturating_mul(self.seconds);
        end.saturating_sub(now)
    }
}
