//! Utility functions

use std::{
    fmt,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

/// File extension of per-input dependency artifacts.
pub const SWIFTDEPS_EXTENSION: &str = "swiftdeps";

/// File extension of binary module summaries.
pub const SWIFTMODULE_EXTENSION: &str = "swiftmodule";

/// A filesystem timestamp as an integer `(seconds, nanoseconds)` pair.
///
/// Modification times are compared as integers so that two reads of the same
/// file always agree; converting through floating point seconds loses the
/// nanosecond digits on some filesystems.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl TimePoint {
    pub const ZERO: Self = Self { seconds: 0, nanoseconds: 0 };

    /// A timestamp greater than any real file modification time.
    ///
    /// Used for files that cannot be statted, so that they always compare as
    /// newer than the previous build.
    pub const DISTANT_FUTURE: Self = Self { seconds: i64::MAX, nanoseconds: u32::MAX };

    pub const fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self { seconds, nanoseconds }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self { seconds: d.as_secs() as i64, nanoseconds: d.subsec_nanos() },
            // pre-epoch timestamps are clamped; nothing we schedule cares about
            // sub-second precision that far back
            Err(e) => Self { seconds: -(e.duration().as_secs() as i64), nanoseconds: 0 },
        }
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.seconds, self.nanoseconds)
    }
}

/// Returns the file extension of `path` as a `&str`, if any.
pub fn file_extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Returns `true` if `path` names a binary module summary.
pub fn is_module_summary_path(path: &str) -> bool {
    Path::new(path).extension().and_then(|e| e.to_str()) == Some(SWIFTMODULE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_point_orders_by_seconds_then_nanoseconds() {
        let a = TimePoint::new(10, 999_999_999);
        let b = TimePoint::new(11, 0);
        let c = TimePoint::new(11, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(c < TimePoint::DISTANT_FUTURE);
    }

    #[test]
    fn module_summary_paths() {
        assert!(is_module_summary_path("/lib/Foreign.swiftmodule"));
        assert!(!is_module_summary_path("/include/bridging.h"));
        assert!(!is_module_summary_path("a.swiftdeps"));
    }
}
