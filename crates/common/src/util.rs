//! Small shared helpers: wall-clock timestamps and row id generation.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Current wall-clock time in Unix milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a fresh opaque row id.
pub fn new_row_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        let ts = current_timestamp_ms();
        // After 2020-01-01 and before 2100-01-01.
        assert!(ts > 1_577_836_800_000);
        assert!(ts < 4_102_444_800_000);
    }

    #[test]
    fn test_row_ids_unique() {
        let a = new_row_id();
        let b = new_row_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
