use std::time::{Duration, SystemTime};

use time::OffsetDateTime;

/// The current time as a duration since the unix epoch. Every engine operation
/// takes its notion of "now" as one of these so that tests control the clock.
pub fn duration_from_epoch_now() -> Duration {
    #[allow(clippy::expect_used)]
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("invalid duration from epoch now")
}

pub fn odt_from_duration(ct: Duration) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + ct
}
