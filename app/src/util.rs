use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Clamps to zero on a pre-epoch clock.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Epoch cutoff for "within the last N hours" filters.
pub fn hours_ago_ms(hours: u64) -> u64 {
    epoch_ms().saturating_sub(hours * 3_600_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_behind_now() {
        let now = epoch_ms();
        let cutoff = hours_ago_ms(1);
        assert!(cutoff <= now);
        assert!(now - cutoff >= 3_600_000 - 1000);
    }
}
