//! Manager settings
//!
//! Defaults first, then environment overrides. The CLI applies its own
//! flags on top of the result.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Name of the external VPN executable
pub const DEFAULT_BINARY_NAME: &str = "edgevpn";

/// Privilege elevation wrapper used to launch and kill the VPN
pub const DEFAULT_ELEVATION: &str = "/usr/bin/pkexec";

/// Repository whose releases provide the VPN binary
pub const DEFAULT_RELEASE_REPO: &str = "mudler/edgevpn";

/// Hosted release API
pub const DEFAULT_RELEASE_API: &str = "https://api.github.com";

/// Directory under the home directory holding all state
const STATE_DIR_NAME: &str = ".edgevpn";

/// Delay before a launched process is checked for liveness
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(2);

/// How long a SIGTERM'd process gets before the forced kill
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Log follower polling interval
pub const DEFAULT_LOG_POLL: Duration = Duration::from_millis(100);

/// Display buffer size, in characters, before history is dropped
pub const DEFAULT_LOG_BUFFER_LIMIT: usize = 1000;

/// Resolved manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root holding one directory per profile plus `bin/`
    pub state_dir: PathBuf,
    /// External binary name looked up in `search_path`
    pub binary_name: String,
    /// Elevation wrapper; `None` runs the binary directly
    pub elevation: Option<PathBuf>,
    /// Directories searched for the system-installed binary
    pub search_path: Vec<PathBuf>,
    pub start_delay: Duration,
    pub stop_grace: Duration,
    pub log_poll: Duration,
    pub log_buffer_limit: usize,
    /// `owner/name` slug for release lookups
    pub release_repo: String,
    pub release_api: String,
    /// Optional API token for the release host
    pub github_token: Option<String>,
}

impl ManagerConfig {
    /// Configuration with every default rooted at `state_dir`
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            elevation: Some(PathBuf::from(DEFAULT_ELEVATION)),
            search_path: Vec::new(),
            start_delay: DEFAULT_START_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            log_poll: DEFAULT_LOG_POLL,
            log_buffer_limit: DEFAULT_LOG_BUFFER_LIMIT,
            release_repo: DEFAULT_RELEASE_REPO.to_string(),
            release_api: DEFAULT_RELEASE_API.to_string(),
            github_token: None,
        }
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = match lookup("EDGEVPN_STATE_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(STATE_DIR_NAME),
        };

        let mut config = Self::with_state_dir(state_dir);

        if let Some(path) = lookup("PATH") {
            config.search_path = std::env::split_paths(&path).collect();
        }

        if let Some(name) = lookup("EDGEVPN_BINARY").filter(|v| !v.is_empty()) {
            config.binary_name = name;
        }

        // Empty value disables elevation entirely
        if let Some(wrapper) = lookup("EDGEVPN_ELEVATION") {
            config.elevation = if wrapper.is_empty() {
                None
            } else {
                Some(PathBuf::from(wrapper))
            };
        }

        if let Some(ms) = lookup("EDGEVPN_START_DELAY_MS") {
            config.start_delay = parse_millis("EDGEVPN_START_DELAY_MS", &ms)?;
        }

        if let Some(repo) = lookup("EDGEVPN_RELEASE_REPO").filter(|v| !v.is_empty()) {
            config.release_repo = repo;
        }

        config.github_token = lookup("GITHUB_TOKEN").filter(|v| !v.is_empty());

        Ok(config)
    }

    /// Directory holding downloaded binaries
    pub fn bin_dir(&self) -> PathBuf {
        self.state_dir.join("bin")
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::with_state_dir("/tmp/state");
        assert_eq!(config.binary_name, "edgevpn");
        assert_eq!(config.elevation, Some(PathBuf::from("/usr/bin/pkexec")));
        assert_eq!(config.start_delay, Duration::from_secs(2));
        assert_eq!(config.log_buffer_limit, 1000);
        assert_eq!(config.bin_dir(), PathBuf::from("/tmp/state/bin"));
    }

    #[test]
    fn test_env_overrides() {
        let config = ManagerConfig::from_lookup(lookup_from(&[
            ("EDGEVPN_STATE_DIR", "/srv/vpn"),
            ("PATH", "/a:/b"),
            ("EDGEVPN_ELEVATION", ""),
            ("EDGEVPN_START_DELAY_MS", "250"),
            ("GITHUB_TOKEN", "ghp_x"),
        ]))
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/srv/vpn"));
        assert_eq!(config.search_path, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(config.elevation, None);
        assert_eq!(config.start_delay, Duration::from_millis(250));
        assert_eq!(config.github_token.as_deref(), Some("ghp_x"));
    }

    #[test]
    fn test_invalid_delay() {
        let result = ManagerConfig::from_lookup(lookup_from(&[
            ("EDGEVPN_STATE_DIR", "/srv/vpn"),
            ("EDGEVPN_START_DELAY_MS", "soon"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
