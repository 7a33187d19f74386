//! Shared utility helpers.

/// Truncate a string to `max` characters, appending `…` if trimmed.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &s[..end]),
        None => s.to_string(),
    }
}

/// Join a base URL and an endpoint path with exactly one `/` between them.
pub fn join_endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("ééééé", 2), "éé…");
    }

    #[test]
    fn join_endpoint_normalizes_slashes() {
        assert_eq!(
            join_endpoint("https://api.portkey.ai/v1/", "/models"),
            "https://api.portkey.ai/v1/models"
        );
        assert_eq!(
            join_endpoint("http://localhost:8787/v1", "chat/completions"),
            "http://localhost:8787/v1/chat/completions"
        );
    }
}
