use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time at microsecond resolution.
///
/// Returned by the poller wait and handed to read handlers so user code
/// can see when a readiness batch was reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

const MICROS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    pub(crate) fn from_micros(micros: i64) -> Timestamp {
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn micros(&self) -> i64 {
        self.micros_since_epoch
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros_since_epoch / MICROS_PER_SECOND,
            self.micros_since_epoch % MICROS_PER_SECOND
        )
    }
}
