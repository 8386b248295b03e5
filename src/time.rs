//! Local time and duration types used for timers and timestamps.
//!
//! Grounded on the teacher's `net::time::{LocalTime, LocalDuration}`: a
//! monotonic millisecond clock with a human-readable `Display` impl, plus
//! duration algebra. The timeout wheel (`TimeoutManager`) is dropped — every
//! timer here is driven directly by a `tokio::time::sleep` inside the owning
//! task instead of being polled by a shared reactor.
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time, measured in milliseconds since the Unix epoch.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    millis: u128,
}

impl LocalTime {
    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Construct from whole seconds since the epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Whole seconds since the epoch.
    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Duration elapsed since an earlier point in time. Saturates at zero.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_millis(self.millis.saturating_sub(earlier.millis))
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Self { millis }
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// A duration, measured in milliseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// Construct from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Construct from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Construct from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// Milliseconds in this duration.
    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            d if d.as_millis() < 1000 => write!(f, "{} millisecond(s)", d.as_millis()),
            d if d.as_secs() < 60 => write!(f, "{} second(s)", d.as_secs()),
            d if d.as_secs() < 3600 => write!(f, "{} minute(s)", d.as_secs() / 60),
            d => write!(f, "{} hour(s)", d.as_secs() / 3600),
        }
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

impl From<std::time::Duration> for LocalDuration {
    fn from(other: std::time::Duration) -> Self {
        Self(other.as_millis())
    }
}

/// Deterministic jitter over `[0, duration)`, seeded per call.
///
/// Used by the channel expiration timer (spec §4.4) so that many channels
/// opened at the same moment do not all expire simultaneously.
pub fn jitter(duration: LocalDuration, rng: &mut fastrand::Rng) -> LocalDuration {
    if duration.as_millis() == 0 {
        return duration;
    }
    LocalDuration::from_millis(rng.u128(0..duration.as_millis()))
}
