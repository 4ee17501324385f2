//! Profile persistence
//!
//! Layout under the state root:
//!
//! ```text
//! <state_dir>/<name>/data   JSON record
//! <state_dir>/<name>/vpn/   process state (pid, stdout, stderr)
//! <state_dir>/bin/          downloaded binaries, never a profile
//! ```
//!
//! Records are replaced whole on every save. There is no file locking;
//! two writers racing on the same profile leave whichever rename landed
//! last.

use std::path::{Path, PathBuf};

use super::Profile;
use crate::context::{ManagerContext, Notification};
use crate::error::{ManagerError, StorageError};

/// Record file name inside a profile directory
pub const RECORD_FILE: &str = "data";

/// Process state directory inside a profile directory
pub const PROCESS_DIR: &str = "vpn";

/// Reads and writes profiles under the configured state root
#[derive(Clone)]
pub struct ProfileStore {
    ctx: ManagerContext,
}

impl ProfileStore {
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    pub fn root(&self) -> &Path {
        &self.ctx.config().state_dir
    }

    pub fn profile_dir(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.profile_dir(name).join(RECORD_FILE)
    }

    pub fn process_dir(&self, name: &str) -> PathBuf {
        self.profile_dir(name).join(PROCESS_DIR)
    }

    /// Load a profile by name
    pub fn load(&self, name: &str) -> Result<Profile, ManagerError> {
        super::validate_name(name)?;
        let path = self.record_path(name);
        let profile = read_record(&path)?;
        tracing::debug!("Loaded profile '{}' from {:?}", name, path);
        Ok(profile)
    }

    /// Validate and persist a profile, returning what was written
    ///
    /// Nothing touches the disk unless validation passes.
    pub fn save(&self, profile: &Profile) -> Result<Profile, ManagerError> {
        profile.validate()?;
        let profile = profile.normalized();

        let dir = self.profile_dir(&profile.name);
        ensure_dir(self.root())?;
        ensure_dir(&dir)?;

        let json = serde_json::to_string_pretty(&profile).map_err(|e| StorageError::Malformed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        let path = dir.join(RECORD_FILE);
        let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
        std::fs::write(&tmp, json).map_err(|e| StorageError::io(&tmp, e))?;

        // The token is a secret: owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).ok();
        }

        std::fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;

        tracing::info!("Saved profile '{}' to {:?}", profile.name, path);
        self.ctx.notify(Notification::ProfileSaved {
            name: profile.name.clone(),
        });
        Ok(profile)
    }

    /// Every profile with a readable record, in directory order
    ///
    /// Records whose `name` differs from their directory are skipped.
    pub fn list(&self) -> Result<Vec<Profile>, ManagerError> {
        let root = self.root();
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("State root {:?} does not exist yet", root);
                return Ok(Vec::new());
            }
            Err(e) => return Err(StorageError::io(root, e).into()),
        };

        let mut profiles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let record = entry.path().join(RECORD_FILE);
            if !record.is_file() {
                continue;
            }

            let profile = match read_record(&record) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!("Skipping unreadable profile {:?}: {}", record, e);
                    continue;
                }
            };

            // Every other operation addresses a profile by its directory
            if entry.file_name().to_str() != Some(profile.name.as_str()) {
                tracing::warn!(
                    "Skipping {:?}: record names '{}' but lives in another directory",
                    record,
                    profile.name
                );
                continue;
            }
            profiles.push(profile);
        }

        Ok(profiles)
    }

    /// Remove a profile directory; absent profiles are not an error
    ///
    /// Does not stop a running process. Callers stop it first.
    pub fn delete(&self, name: &str) -> Result<(), ManagerError> {
        super::validate_name(name)?;
        let dir = self.profile_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("Deleted profile '{}'", name);
                self.ctx.notify(Notification::ProfileDeleted {
                    name: name.to_string(),
                });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Profile '{}' already absent", name);
                Ok(())
            }
            Err(e) => Err(StorageError::io(dir, e).into()),
        }
    }

    /// Save a hand-authored or exported record under its own name
    pub fn import(&self, path: &Path) -> Result<Profile, ManagerError> {
        let profile = read_record(path)?;
        self.save(&profile)
    }

    /// Pretty JSON suitable for [`ProfileStore::import`]
    pub fn export(&self, name: &str) -> Result<String, ManagerError> {
        let profile = self.load(name)?;
        let path = self.record_path(name);
        serde_json::to_string_pretty(&profile).map_err(|e| {
            StorageError::Malformed {
                path,
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn read_record(path: &Path) -> Result<Profile, StorageError> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(StorageError::io(path, e)),
    };

    serde_json::from_str(&json).map_err(|e| StorageError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).ok();
    }
    Ok(())
}
