use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Wall-clock timestamp in milliseconds, for display on chat messages only
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Trims a chat message; None if it ends up empty or longer than max_chars
pub fn sanitize_message(message: &str, max_chars: usize) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max_chars {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_trims() {
        assert_eq!(sanitize_message("  hi  ", 100), Some("hi".to_string()));
    }

    #[test]
    fn test_sanitize_drops_empty_and_oversized() {
        assert_eq!(sanitize_message("   ", 100), None);
        assert_eq!(sanitize_message("", 100), None);
        assert_eq!(sanitize_message(&"a".repeat(101), 100), None);
        assert!(sanitize_message(&"a".repeat(100), 100).is_some());
    }

    #[test]
    fn test_sanitize_counts_chars_not_bytes() {
        let message = "é".repeat(100);
        assert_eq!(sanitize_message(&message, 100), Some(message.clone()));
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in milliseconds
        assert!(get_timestamp() > 1_577_836_800_000);
    }
}
