//! Cycle pacing shared by the monitor loops.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sleep budget left after a cycle, so a loop ticks on the interval rather
/// than interval plus cycle time. A cycle that overran the interval yields
/// a zero sleep.
pub fn remaining_sleep(cycle_start: DateTime<Utc>, interval_secs: u64) -> Duration {
    let elapsed = (Utc::now() - cycle_start).to_std().unwrap_or_default();
    Duration::from_secs(interval_secs).saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cycle_sleeps_close_to_the_full_interval() {
        let sleep = remaining_sleep(Utc::now(), 15);
        assert!(sleep <= Duration::from_secs(15));
        assert!(sleep >= Duration::from_secs(14));
    }

    #[test]
    fn overrunning_cycle_yields_zero_sleep() {
        let started = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(remaining_sleep(started, 15), Duration::ZERO);
    }
}
