//! External binary resolution
//!
//! A profile either runs the binary found on the search path or a
//! version cached under `<state_dir>/bin/<binary>-<version>`.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ProcessError, StorageError};
use crate::profile::Profile;

/// Locate the system binary on the configured search path
pub fn find_installed(config: &ManagerConfig) -> Option<PathBuf> {
    config
        .search_path
        .iter()
        .map(|dir| dir.join(&config.binary_name))
        .find(|candidate| std::fs::symlink_metadata(candidate).is_ok())
}

/// Path of a cached binary version
pub fn version_path(config: &ManagerConfig, version: &str) -> PathBuf {
    config
        .bin_dir()
        .join(format!("{}-{}", config.binary_name, version))
}

/// Cached versions, sorted by name
///
/// Only files named `<binary>-v*` count.
pub fn available_versions(config: &ManagerConfig) -> Vec<String> {
    let prefix = format!("{}-", config.binary_name);
    let entries = match std::fs::read_dir(config.bin_dir()) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut versions: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let version = name.strip_prefix(&prefix)?;
            version.starts_with('v').then(|| version.to_string())
        })
        .collect();
    versions.sort();
    versions
}

/// Binary a profile should launch
pub fn resolve_binary(config: &ManagerConfig, profile: &Profile) -> Result<PathBuf, ProcessError> {
    let wanted = profile.normalized().runtime_version;

    if !wanted.is_empty() {
        if available_versions(config).iter().any(|v| *v == wanted) {
            return Ok(version_path(config, &wanted));
        }
        return Err(ProcessError::VersionNotFound { version: wanted });
    }

    find_installed(config).ok_or_else(|| ProcessError::BinaryNotInstalled {
        binary: config.binary_name.clone(),
    })
}

/// Binary used for one-off invocations: system first, newest cache second
pub fn default_binary(config: &ManagerConfig) -> Result<PathBuf, ProcessError> {
    if let Some(path) = find_installed(config) {
        return Ok(path);
    }
    available_versions(config)
        .last()
        .map(|v| version_path(config, v))
        .ok_or_else(|| ProcessError::BinaryNotInstalled {
            binary: config.binary_name.clone(),
        })
}

/// Delete a cached version; absent versions are not an error
pub fn remove_version(config: &ManagerConfig, version: &str) -> Result<(), ManagerError> {
    let path = version_path(config, version);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!("Removed cached version {}", version);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}

/// Ask the binary for a fresh network token
pub async fn generate_token(config: &ManagerConfig) -> Result<String, ProcessError> {
    let bin = default_binary(config).map_err(|_| ProcessError::TokenGeneration {
        reason: format!(
            "can't generate a new token as {} is not installed, and no versions were downloaded",
            config.binary_name
        ),
    })?;
    run_token_generator(&bin).await
}

async fn run_token_generator(bin: &Path) -> Result<String, ProcessError> {
    tracing::debug!("Generating token with {:?}", bin);
    let output = Command::new(bin)
        .args(["-g", "-b"])
        .output()
        .await
        .map_err(|e| ProcessError::TokenGeneration {
            reason: format!("{}: {}", bin.display(), e),
        })?;

    if !output.status.success() {
        return Err(ProcessError::TokenGeneration {
            reason: format!(
                "{} exited with {}: {}",
                bin.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(ProcessError::TokenGeneration {
            reason: "binary printed an empty token".to_string(),
        });
    }
    Ok(token)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write an executable shell script
    pub(crate) fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(dir: &TempDir) -> ManagerConfig {
        let mut config = ManagerConfig::with_state_dir(dir.path().join("state"));
        config.search_path = vec![dir.path().join("usr-bin")];
        config
    }

    fn office(runtime_version: &str) -> Profile {
        Profile {
            name: "office".to_string(),
            ip: "10.0.0.5/24".to_string(),
            runtime_version: runtime_version.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_nothing_installed() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(find_installed(&config).is_none());
        assert!(available_versions(&config).is_empty());
        assert!(matches!(
            resolve_binary(&config, &office("")),
            Err(ProcessError::BinaryNotInstalled { .. })
        ));
        assert!(matches!(
            resolve_binary(&config, &office("v1.0.0")),
            Err(ProcessError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn test_available_versions_filters_names() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(config.bin_dir()).unwrap();
        for name in ["edgevpn-v0.9.0", "edgevpn-v0.8.5", "edgevpn-latest", "other-v1.0.0"] {
            std::fs::write(config.bin_dir().join(name), b"").unwrap();
        }

        assert_eq!(available_versions(&config), vec!["v0.8.5", "v0.9.0"]);
        assert_eq!(
            resolve_binary(&config, &office("v0.8.5")).unwrap(),
            config.bin_dir().join("edgevpn-v0.8.5")
        );
        assert_eq!(
            default_binary(&config).unwrap(),
            config.bin_dir().join("edgevpn-v0.9.0")
        );
    }

    #[test]
    fn test_system_binary_preferred() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(dir.path().join("usr-bin")).unwrap();
        write_script(&dir.path().join("usr-bin").join("edgevpn"), "exit 0");

        let expected = dir.path().join("usr-bin").join("edgevpn");
        assert_eq!(resolve_binary(&config, &office("system")).unwrap(), expected);
        assert_eq!(default_binary(&config).unwrap(), expected);
    }

    #[test]
    fn test_remove_version() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(config.bin_dir()).unwrap();
        std::fs::write(version_path(&config, "v0.8.5"), b"").unwrap();

        remove_version(&config, "v0.8.5").unwrap();
        assert!(available_versions(&config).is_empty());
        remove_version(&config, "v0.8.5").unwrap();
    }

    #[tokio::test]
    async fn test_generate_token() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(dir.path().join("usr-bin")).unwrap();
        write_script(
            &dir.path().join("usr-bin").join("edgevpn"),
            r#"[ "$1" = "-g" ] && [ "$2" = "-b" ] && echo "bmV3LXRva2Vu""#,
        );

        assert_eq!(generate_token(&config).await.unwrap(), "bmV3LXRva2Vu");
    }

    #[tokio::test]
    async fn test_generate_token_without_binary() {
        let dir = TempDir::new().unwrap();
        let err = generate_token(&config(&dir)).await.unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
