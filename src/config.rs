//! Environment-driven runtime configuration.

use std::env;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Cursor windows, flush thresholds and worker budgets.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    /// Period between worker cycles.
    pub fetch_interval: Duration,
    /// How long after an event the provider's view of it can be trusted.
    pub trust_threshold: Duration,
    /// Latest-window cursors never fetch closer to now than this.
    pub fetch_latest_end_margin: Duration,
    /// Flush the accumulator when this much time passed since the last flush.
    pub aggregation_interval: Duration,
    /// Flush the accumulator when it holds more member ids than this.
    pub aggregation_member_threshold: usize,
    pub max_opened_events: usize,
    pub max_missing_events: usize,
    pub max_events_per_cycle: usize,
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("EMAIL_ANALYTICS_ENABLED", defaults.enabled),
            fetch_interval: env_duration_secs(
                "EMAIL_ANALYTICS_INTERVAL_SECS",
                defaults.fetch_interval.as_secs(),
            ),
            trust_threshold: env_duration_secs(
                "EMAIL_ANALYTICS_TRUST_THRESHOLD_SECS",
                defaults.trust_threshold.as_secs(),
            ),
            fetch_latest_end_margin: env_duration_secs(
                "EMAIL_ANALYTICS_END_MARGIN_SECS",
                defaults.fetch_latest_end_margin.as_secs(),
            ),
            aggregation_interval: env_duration_secs(
                "EMAIL_ANALYTICS_AGGREGATION_INTERVAL_SECS",
                defaults.aggregation_interval.as_secs(),
            ),
            aggregation_member_threshold: env_usize(
                "EMAIL_ANALYTICS_AGGREGATION_MEMBER_THRESHOLD",
                defaults.aggregation_member_threshold,
            ),
            max_opened_events: env_usize(
                "EMAIL_ANALYTICS_MAX_OPENED_EVENTS",
                defaults.max_opened_events,
            ),
            max_missing_events: env_usize(
                "EMAIL_ANALYTICS_MAX_MISSING_EVENTS",
                defaults.max_missing_events,
            ),
            max_events_per_cycle: env_usize(
                "EMAIL_ANALYTICS_MAX_EVENTS_PER_CYCLE",
                defaults.max_events_per_cycle,
            ),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_interval: Duration::from_secs(5 * 60),
            trust_threshold: Duration::from_secs(30 * 60),
            fetch_latest_end_margin: Duration::from_secs(60),
            aggregation_interval: Duration::from_secs(5 * 60),
            aggregation_member_threshold: 5000,
            max_opened_events: 10_000,
            max_missing_events: 10_000,
            max_events_per_cycle: 20_000,
        }
    }
}

/// Credentials and paging settings for the Mailgun events API.
#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: Option<String>,
    pub domain: Option<String>,
    pub base_url: String,
    pub page_size: usize,
    pub tag: Option<String>,
    pub request_timeout: Duration,
}

impl MailgunConfig {
    pub fn from_env() -> Self {
        let tag = env_string("MAILGUN_TAG", "bulk-email");
        Self {
            api_key: env::var("MAILGUN_API_KEY").ok().filter(|v| !v.is_empty()),
            domain: env::var("MAILGUN_DOMAIN").ok().filter(|v| !v.is_empty()),
            base_url: env_string("MAILGUN_BASE_URL", "https://api.mailgun.net/v3"),
            page_size: env_usize("MAILGUN_PAGE_SIZE", 300).clamp(1, 300),
            tag: if tag.is_empty() { None } else { Some(tag) },
            request_timeout: env_duration_millis("MAILGUN_TIMEOUT_MS", 30_000),
        }
    }

    /// Both the API key and the sending domain are present.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.domain.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AnalyticsConfig::default();
        assert_eq!(config.trust_threshold, Duration::from_secs(1800));
        assert_eq!(config.fetch_latest_end_margin, Duration::from_secs(60));
        assert_eq!(config.aggregation_member_threshold, 5000);
        assert_eq!(config.max_events_per_cycle, 20_000);
    }

    #[test]
    fn mailgun_requires_key_and_domain() {
        let mut config = MailgunConfig {
            api_key: Some("key".into()),
            domain: None,
            base_url: "https://api.mailgun.net/v3".into(),
            page_size: 300,
            tag: None,
            request_timeout: Duration::from_secs(30),
        };
        assert!(!config.is_configured());

        config.domain = Some("mg.example.com".into());
        assert!(config.is_configured());
    }
}
