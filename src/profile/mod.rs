//! VPN profiles
//!
//! A profile is one network configuration for the external binary. Each
//! profile lives in its own directory under the state root; see
//! [`ProfileStore`] for the on-disk layout.

mod store;

pub use store::{ProfileStore, PROCESS_DIR, RECORD_FILE};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Sentinel runtime version meaning "use the system binary"
pub const SYSTEM_RUNTIME: &str = "system";

/// Directory names under the state root that cannot be profile names
const RESERVED_NAMES: &[&str] = &["bin"];

/// One VPN configuration
///
/// The serialized form is a flat JSON record so users can hand-author,
/// export and re-import it. Missing fields default to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Unique identifier, also the storage key
    pub name: String,
    /// Shared network token handed to the binary at launch
    pub token: String,
    /// Address with prefix, e.g. `10.1.0.5/24`
    pub ip: String,
    /// Whether the binary should expose its local management API
    pub api: bool,
    /// `host:port` or `:port`
    pub api_address: String,
    /// Virtual interface the binary creates
    pub interface: String,
    /// Cached binary version; empty selects the system binary
    pub runtime_version: String,
}

impl Profile {
    /// Check every field the store relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        validate_cidr(&self.ip)?;
        Ok(())
    }

    /// Copy with the `"system"` runtime sentinel folded to empty
    pub fn normalized(&self) -> Self {
        let mut profile = self.clone();
        if profile.runtime_version == SYSTEM_RUNTIME {
            profile.runtime_version.clear();
        }
        profile
    }

    /// Token with all but the last four characters hidden
    pub fn masked_token(&self) -> String {
        let chars: Vec<char> = self.token.trim().chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(8), tail)
    }

    /// Browser URL of the management API, when enabled
    pub fn api_url(&self) -> Option<String> {
        if !self.api || self.api_address.is_empty() {
            return None;
        }
        let addr = self.api_address.trim();
        if addr.starts_with(':') {
            Some(format!("http://127.0.0.1{}", addr))
        } else if addr.contains("://") {
            Some(addr.to_string())
        } else {
            Some(format!("http://{}", addr))
        }
    }
}

/// Parse `value` as an address with prefix length
///
/// The value is used verbatim on the command line, so surrounding
/// whitespace is rejected rather than trimmed.
pub fn validate_cidr(value: &str) -> Result<IpNet, ValidationError> {
    value
        .parse::<IpNet>()
        .map_err(|e| ValidationError::InvalidCidr {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Profile names double as directory names
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains('/') || name.contains('\\') || name.contains('\0') {
        Some("name contains a path separator")
    } else if RESERVED_NAMES.contains(&name) {
        Some("name is reserved")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn office() -> Profile {
        Profile {
            name: "office".to_string(),
            token: "b3RwOgogIGRodDoKICAgIGludGVydmFs".to_string(),
            ip: "10.0.0.5/24".to_string(),
            interface: "edgevpn0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("10.0.0.5/24").is_ok());
        assert!(validate_cidr("fd00::1/64").is_ok());
        assert!(validate_cidr("not-an-ip").is_err());
        assert!(validate_cidr("10.0.0.5").is_err());
        assert!(validate_cidr("10.0.0.5/33").is_err());
        assert!(validate_cidr("").is_err());
        assert!(validate_cidr(" 10.0.0.5/24").is_err());
        assert!(validate_cidr("10.0.0.5/24\n").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("office").is_ok());
        assert!(validate_name("home vpn").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("bin").is_err());
    }

    #[test]
    fn test_record_field_names() {
        let json = serde_json::to_value(office()).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "name",
            "token",
            "ip",
            "api",
            "api_address",
            "interface",
            "runtime_version",
        ] {
            assert!(obj.contains_key(key), "missing {}", key);
        }
        assert_eq!(obj.len(), 7);
    }

    #[test]
    fn test_partial_record_defaults() {
        let profile: Profile =
            serde_json::from_str(r#"{"name":"lab","ip":"10.2.0.1/16"}"#).unwrap();
        assert_eq!(profile.name, "lab");
        assert!(!profile.api);
        assert!(profile.runtime_version.is_empty());
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_normalized_system_runtime() {
        let mut profile = office();
        profile.runtime_version = "system".to_string();
        assert_eq!(profile.normalized().runtime_version, "");

        profile.runtime_version = "v0.8.5".to_string();
        assert_eq!(profile.normalized().runtime_version, "v0.8.5");
    }

    #[test]
    fn test_masked_token() {
        let profile = office();
        let masked = profile.masked_token();
        assert!(masked.starts_with("********"));
        assert!(masked.ends_with("dmFs"));
        assert!(!masked.contains("b3Rw"));

        let short = Profile {
            token: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(short.masked_token(), "***");
    }

    #[test]
    fn test_api_url() {
        let mut profile = office();
        assert_eq!(profile.api_url(), None);

        profile.api = true;
        profile.api_address = ":8080".to_string();
        assert_eq!(profile.api_url().as_deref(), Some("http://127.0.0.1:8080"));

        profile.api_address = "0.0.0.0:9090".to_string();
        assert_eq!(profile.api_url().as_deref(), Some("http://0.0.0.0:9090"));
    }
}
