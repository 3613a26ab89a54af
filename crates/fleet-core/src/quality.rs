//! Connection-quality scoring.
//!
//! Weighted sum of heartbeat recency, lifetime error count, and lifetime
//! connection count, clamped to 0..=100.  Recomputed by the liveness sweep.

use chrono::Duration;

pub fn connection_quality(silence: Duration, error_count: u64, total_connections: u64) -> u8 {
    let secs = silence.num_seconds().max(0);
    let recency = if secs <= 60 {
        50
    } else if secs <= 300 {
        30
    } else if secs <= 900 {
        10
    } else {
        0
    };
    let errors = if error_count == 0 {
        30
    } else if error_count <= 5 {
        20
    } else if error_count <= 10 {
        10
    } else {
        0
    };
    let connections = if total_connections > 100 {
        20
    } else if total_connections > 50 {
        15
    } else if total_connections > 10 {
        10
    } else if total_connections > 0 {
        5
    } else {
        0
    };
    (recency + errors + connections).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_with_clean_history_scores_full() {
        assert_eq!(connection_quality(Duration::seconds(10), 0, 101), 100);
    }

    #[test]
    fn silent_device_scores_from_history_only() {
        assert_eq!(connection_quality(Duration::minutes(20), 0, 5), 35);
    }

    #[test]
    fn six_minutes_of_silence_drops_below_fifty() {
        // Heartbeat-sweep scenario: 6 min silence, a few errors, modest history.
        let q = connection_quality(Duration::minutes(6), 3, 20);
        assert!(q < 50, "got {q}");
    }

    #[test]
    fn recency_tiers() {
        assert_eq!(connection_quality(Duration::seconds(60), 11, 0), 50);
        assert_eq!(connection_quality(Duration::seconds(61), 11, 0), 30);
        assert_eq!(connection_quality(Duration::seconds(301), 11, 0), 10);
        assert_eq!(connection_quality(Duration::seconds(901), 11, 0), 0);
    }
}
