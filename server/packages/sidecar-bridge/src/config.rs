use std::time::Duration;

pub const REQUEST_TIMEOUT_ENV: &str = "SIDECAR_BRIDGE_REQUEST_TIMEOUT_MS";
pub const STOP_GRACE_ENV: &str = "SIDECAR_BRIDGE_STOP_GRACE_MS";
pub const REQUIRE_AUTH_ENV: &str = "SIDECAR_BRIDGE_REQUIRE_AUTH";

const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// `None` waits for the agent indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long stopping a session waits for its calls to drain.
    pub stop_grace: Duration,
    pub require_auth: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            require_auth: false,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: lookup(REQUEST_TIMEOUT_ENV).and_then(|raw| parse_ms(&raw)),
            stop_grace: lookup(STOP_GRACE_ENV)
                .and_then(|raw| parse_ms(&raw))
                .unwrap_or(defaults.stop_grace),
            require_auth: lookup(REQUIRE_AUTH_ENV)
                .map(|raw| is_truthy(&raw))
                .unwrap_or(defaults.require_auth),
        }
    }

    /// Command line values win over the environment.
    pub fn with_overrides(mut self, request_timeout_ms: Option<u64>, require_auth: bool) -> Self {
        if let Some(ms) = request_timeout_ms {
            self.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        self.require_auth |= require_auth;
        self
    }
}

fn parse_ms(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BridgeConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(config_from(&[]), BridgeConfig::default());
    }

    #[test]
    fn environment_values_are_parsed() {
        let config = config_from(&[
            (REQUEST_TIMEOUT_ENV, "1500"),
            (STOP_GRACE_ENV, " 250 "),
            (REQUIRE_AUTH_ENV, "Yes"),
        ]);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.stop_grace, Duration::from_millis(250));
        assert!(config.require_auth);
    }

    #[test]
    fn zero_and_garbage_fall_back() {
        let config = config_from(&[
            (REQUEST_TIMEOUT_ENV, "0"),
            (STOP_GRACE_ENV, "soon"),
            (REQUIRE_AUTH_ENV, "off"),
        ]);
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn flags_override_environment() {
        let config = config_from(&[(REQUEST_TIMEOUT_ENV, "1500")]).with_overrides(Some(0), true);
        assert_eq!(config.request_timeout, None);
        assert!(config.require_auth);
    }
}
