//! Chain time arithmetic.

use time::OffsetDateTime;

/// Seconds per epoch.
pub const EPOCH_DURATION_SECONDS: i64 = 30;

/// Epochs per day.
pub const EPOCHS_IN_DAY: i64 = 24 * 60 * 60 / EPOCH_DURATION_SECONDS;

/// Unix timestamp of epoch zero on mainnet.
pub const GENESIS_UNIX_TIMESTAMP: i64 = 1_598_306_400;

/// Wall-clock time at which the given epoch begins.
pub fn epoch_to_time(epoch: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(GENESIS_UNIX_TIMESTAMP + epoch * EPOCH_DURATION_SECONDS)
        .expect("epoch timestamps are within OffsetDateTime range")
}

/// Epoch containing the given wall-clock time (clamped to genesis).
pub fn time_to_epoch(t: OffsetDateTime) -> i64 {
    let delta = t.unix_timestamp() - GENESIS_UNIX_TIMESTAMP;
    if delta < 0 {
        return 0;
    }
    delta / EPOCH_DURATION_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_per_day() {
        assert_eq!(EPOCHS_IN_DAY, 2880);
    }

    #[test]
    fn roundtrip_on_epoch_boundary() {
        let e = 3_500_000;
        assert_eq!(time_to_epoch(epoch_to_time(e)), e);
    }

    #[test]
    fn mid_epoch_times_round_down() {
        let t = epoch_to_time(100) + time::Duration::seconds(29);
        assert_eq!(time_to_epoch(t), 100);
        let t = epoch_to_time(100) + time::Duration::seconds(30);
        assert_eq!(time_to_epoch(t), 101);
    }

    #[test]
    fn pre_genesis_clamps_to_zero() {
        let t = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(time_to_epoch(t), 0);
    }
}
