use std::time::Duration;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_GENERATION_COUNT: usize = 10;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Env vars checked, in order, for the Gemini API key. Read per generation, not at startup.
pub const API_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub api_base: String,
    pub model: String,
    pub generation_count: usize,
    pub max_concurrency: usize,
    pub request_timeout: Option<Duration>,
    pub max_upload_bytes: usize,
    pub session_ttl: Duration,
    pub max_sessions: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            generation_count: DEFAULT_GENERATION_COUNT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout: None,
            max_upload_bytes: 25 * 1024 * 1024,
            session_ttl: Duration::from_secs(60 * 60),
            max_sessions: 256,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port),
            api_base: lookup("GEMINI_API_BASE").unwrap_or(defaults.api_base),
            model: lookup("GEMINI_IMAGE_MODEL").unwrap_or(defaults.model),
            generation_count: positive(&lookup, "CREATORPIC_GENERATION_COUNT", defaults.generation_count),
            max_concurrency: positive(&lookup, "CREATORPIC_MAX_CONCURRENCY", defaults.max_concurrency),
            request_timeout: lookup("CREATORPIC_REQUEST_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_upload_bytes: lookup("CREATORPIC_MAX_UPLOAD_MB")
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .unwrap_or(defaults.max_upload_bytes),
            session_ttl: lookup("CREATORPIC_SESSION_TTL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            max_sessions: positive(&lookup, "CREATORPIC_MAX_SESSIONS", defaults.max_sessions),
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: usize) -> usize {
    match lookup(name).map(|v| v.parse::<usize>()) {
        None => default,
        Some(Ok(n)) if n >= 1 => n,
        Some(_) => {
            warn!("⚠️ {} must be a positive integer, using {}", name, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let s = settings(&[]);
        assert_eq!(s.port, 8080);
        assert_eq!(s.generation_count, 10);
        assert_eq!(s.max_concurrency, 4);
        assert_eq!(s.model, "gemini-2.5-flash-image");
        assert!(s.request_timeout.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = settings(&[
            ("PORT", "3000"),
            ("CREATORPIC_GENERATION_COUNT", "3"),
            ("CREATORPIC_REQUEST_TIMEOUT_SECS", "90"),
            ("GEMINI_API_BASE", "http://localhost:9999"),
        ]);
        assert_eq!(s.port, 3000);
        assert_eq!(s.generation_count, 3);
        assert_eq!(s.request_timeout, Some(Duration::from_secs(90)));
        assert_eq!(s.api_base, "http://localhost:9999");
    }

    #[test]
    fn oversized_upload_limit_falls_back_instead_of_overflowing() {
        let huge = usize::MAX.to_string();
        let s = settings(&[("CREATORPIC_MAX_UPLOAD_MB", huge.as_str())]);
        assert_eq!(s.max_upload_bytes, Settings::default().max_upload_bytes);

        let s = settings(&[("CREATORPIC_MAX_UPLOAD_MB", "10")]);
        assert_eq!(s.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn session_limits_are_configurable() {
        let s = settings(&[("CREATORPIC_SESSION_TTL_SECS", "600"), ("CREATORPIC_MAX_SESSIONS", "8")]);
        assert_eq!(s.session_ttl, Duration::from_secs(600));
        assert_eq!(s.max_sessions, 8);
        assert_eq!(settings(&[]).max_sessions, 256);
    }

    #[test]
    fn zero_or_garbage_counts_fall_back_to_defaults() {
        let s = settings(&[("CREATORPIC_GENERATION_COUNT", "0"), ("CREATORPIC_MAX_CONCURRENCY", "lots")]);
        assert_eq!(s.generation_count, DEFAULT_GENERATION_COUNT);
        assert_eq!(s.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }
}
