use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(300);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the AiSEG2 lives and how to log in to it.
#[derive(Clone)]
pub struct DeviceEndpoint {
    pub host: String,
    pub username: String,
    pub password: SecretString,
    pub scan_interval: Duration,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: &str) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: SecretString::from(password.to_owned()),
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Base URL for requests. A bare host or IP is assumed to speak plain HTTP.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }
}

impl fmt::Debug for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEndpoint")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("scan_interval", &self.scan_interval)
            .finish()
    }
}

/// Knobs for the poll cycle itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_circuit_pages: u32,
    pub climate: bool,
    pub setting_exit_delay: Duration,
}

impl PollSettings {
    pub fn for_scan_interval(scan_interval: Duration) -> Self {
        Self {
            request_timeout: default_request_timeout(scan_interval),
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            max_circuit_pages: 20,
            climate: true,
            setting_exit_delay: Duration::from_secs(2),
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::for_scan_interval(DEFAULT_SCAN_INTERVAL)
    }
}

/// Capped well below the scan interval so a hung request cannot eat a whole cycle.
fn default_request_timeout(scan_interval: Duration) -> Duration {
    (scan_interval / 4).clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT)
}

/// Long-lived access token and base URL of the Home Assistant REST API.
#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: SecretString,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoint: DeviceEndpoint,
    pub poll: PollSettings,
    pub home_assistant: Option<HomeAssistantConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let host = var("AISEG2_HOST").ok_or(ConfigError::Missing("AISEG2_HOST"))?;
        let password = var("AISEG2_PASSWORD").ok_or(ConfigError::Missing("AISEG2_PASSWORD"))?;
        let username = var("AISEG2_USERNAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string());

        let scan_secs: u64 = parse_or("AISEG2_SCAN_INTERVAL", var("AISEG2_SCAN_INTERVAL"), 300)?;
        if scan_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "AISEG2_SCAN_INTERVAL",
                value: scan_secs.to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        let scan_interval = Duration::from_secs(scan_secs);

        let mut poll = PollSettings::for_scan_interval(scan_interval);
        if let Some(secs) = var("AISEG2_REQUEST_TIMEOUT") {
            let secs: u64 = parse_or("AISEG2_REQUEST_TIMEOUT", Some(secs), 0)?;
            if secs == 0 || secs >= scan_secs {
                return Err(ConfigError::Invalid {
                    name: "AISEG2_REQUEST_TIMEOUT",
                    value: secs.to_string(),
                    reason: "must be positive and shorter than the scan interval".to_string(),
                });
            }
            poll.request_timeout = Duration::from_secs(secs);
        }
        poll.max_retries = parse_or("AISEG2_MAX_RETRIES", var("AISEG2_MAX_RETRIES"), 2)?;
        poll.initial_backoff = Duration::from_millis(parse_or(
            "AISEG2_BACKOFF_MS",
            var("AISEG2_BACKOFF_MS"),
            1000,
        )?);
        poll.max_circuit_pages =
            parse_or("AISEG2_MAX_CIRCUIT_PAGES", var("AISEG2_MAX_CIRCUIT_PAGES"), 20)?;
        poll.climate = parse_bool_or(var("AISEG2_CLIMATE"), true);
        poll.setting_exit_delay = Duration::from_millis(parse_or(
            "AISEG2_SETTING_EXIT_DELAY_MS",
            var("AISEG2_SETTING_EXIT_DELAY_MS"),
            2000,
        )?);

        let home_assistant = match (var("HA_URL"), var("HA_TOKEN")) {
            (Some(url), Some(token)) => Some(HomeAssistantConfig {
                url: url.trim_end_matches('/').to_string(),
                token: SecretString::from(token),
            }),
            (Some(_), None) => return Err(ConfigError::Missing("HA_TOKEN")),
            _ => None,
        };

        Ok(Self {
            endpoint: DeviceEndpoint::new(host, username, &password)
                .with_scan_interval(scan_interval),
            poll,
            home_assistant,
        })
    }
}

fn parse_or<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Parses a boolean flag, falling back to `default` when unset or unparseable
fn parse_bool_or(val: Option<String>, default: bool) -> bool {
    val.and_then(|v| v.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_bool_or() {
        assert!(!parse_bool_or(None, false));
        assert!(parse_bool_or(None, true));
        assert!(parse_bool_or(Some("".to_string()), true));

        assert!(parse_bool_or(Some("true".to_string()), false));
        assert!(parse_bool_or(Some("TrUe".to_string()), false));
        assert!(!parse_bool_or(Some("false".to_string()), true));
        assert!(!parse_bool_or(Some("FALSE".to_string()), true));

        // Invalid strings fall back to the default
        assert!(parse_bool_or(Some("yes".to_string()), true));
        assert!(!parse_bool_or(Some("1".to_string()), false));
    }

    #[test]
    fn test_defaults_from_minimal_env() {
        let config = AppConfig::from_lookup(lookup(&[
            ("AISEG2_HOST", "192.168.11.216"),
            ("AISEG2_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint.username, "admin");
        assert_eq!(config.endpoint.scan_interval, Duration::from_secs(300));
        assert_eq!(config.endpoint.base_url(), "http://192.168.11.216");
        assert_eq!(config.poll.request_timeout, Duration::from_secs(10));
        assert_eq!(config.poll.max_retries, 2);
        assert_eq!(config.poll.initial_backoff, Duration::from_secs(1));
        assert!(config.poll.climate);
        assert!(config.home_assistant.is_none());
    }

    #[test]
    fn test_request_timeout_scales_down_with_short_intervals() {
        assert_eq!(
            default_request_timeout(Duration::from_secs(20)),
            Duration::from_secs(5)
        );
        assert_eq!(
            default_request_timeout(Duration::from_secs(2)),
            Duration::from_secs(1)
        );
        assert_eq!(
            default_request_timeout(Duration::from_secs(3600)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_missing_password_is_reported() {
        let err = AppConfig::from_lookup(lookup(&[("AISEG2_HOST", "aiseg")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AISEG2_PASSWORD")));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("AISEG2_HOST", "aiseg"),
            ("AISEG2_PASSWORD", "pw"),
            ("AISEG2_SCAN_INTERVAL", "often"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "AISEG2_SCAN_INTERVAL",
                ..
            }
        ));

        let err = AppConfig::from_lookup(lookup(&[
            ("AISEG2_HOST", "aiseg"),
            ("AISEG2_PASSWORD", "pw"),
            ("AISEG2_SCAN_INTERVAL", "60"),
            ("AISEG2_REQUEST_TIMEOUT", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "AISEG2_REQUEST_TIMEOUT",
                ..
            }
        ));
    }

    #[test]
    fn test_home_assistant_needs_token() {
        let err = AppConfig::from_lookup(lookup(&[
            ("AISEG2_HOST", "aiseg"),
            ("AISEG2_PASSWORD", "pw"),
            ("HA_URL", "http://ha:8123"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HA_TOKEN")));

        let config = AppConfig::from_lookup(lookup(&[
            ("AISEG2_HOST", "aiseg"),
            ("AISEG2_PASSWORD", "pw"),
            ("HA_URL", "http://ha:8123/"),
            ("HA_TOKEN", "token"),
            ("AISEG2_CLIMATE", "false"),
        ]))
        .unwrap();
        let ha = config.home_assistant.unwrap();
        assert_eq!(ha.url, "http://ha:8123");
        assert!(!config.poll.climate);
    }

    #[test]
    fn test_debug_output_redacts_password() {
        let endpoint = DeviceEndpoint::new("aiseg", "admin", "hunter2");
        let rendered = format!("{endpoint:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = PollSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_secs(1));
        assert_eq!(settings.backoff(1), Duration::from_secs(2));
        assert_eq!(settings.backoff(2), Duration::from_secs(4));
    }
}
