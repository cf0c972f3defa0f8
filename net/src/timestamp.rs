use std::fmt;
use std::time::{Duration, SystemTime};

/// Wall-clock instant at which a poll cycle observed readiness.
///
/// Handed to message callbacks as the receive time. Comparisons are exact;
/// formatting is microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(SystemTime::now())
    }

    /// Time elapsed since `earlier`, zero if clocks stepped backwards.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.duration_since(earlier.0).unwrap_or(Duration::ZERO)
    }

    pub fn as_system_time(&self) -> SystemTime {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local: chrono::DateTime<chrono::Local> = self.0.into();
        write!(f, "{}", local.format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_the_clock() {
        let a = Timestamp::now();
        std::thread::sleep(Duration::from_millis(2));
        let b = Timestamp::now();
        assert!(b > a);
        assert!(b.duration_since(a) >= Duration::from_millis(2));
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }
}
