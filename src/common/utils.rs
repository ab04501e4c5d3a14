// Utility functions

/// Wall-clock now in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn generate_random_id() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Upstream session ids are negative decimal strings.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let value: i64 = rand::thread_rng().gen_range(0..9_000_000_000_000_000_000);
    format!("-{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_is_eight_alphanumerics() {
        let id = generate_random_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn session_id_is_negative_decimal() {
        let sid = generate_session_id();
        assert!(sid.starts_with('-'));
        assert!(sid[1..].chars().all(|c| c.is_ascii_digit()));
    }
}
