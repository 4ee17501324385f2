//! EdgeVPN Manager - profile and process management for edgevpn
//!
//! Keeps named connection profiles on disk, launches the external
//! `edgevpn` binary for a profile, tracks whether it is still running,
//! tails its logs and looks up published releases.
//!
//! # Features
//!
//! - Per-profile JSON records under a state directory
//! - Elevated launch through `pkexec` with a delayed liveness check
//! - Graceful stop with forced-kill escalation
//! - Live stdout/stderr tailing into a bounded buffer
//! - Release lookup for the platform asset
//! - Optional local REST daemon
//!
//! # Usage
//!
//! ```no_run
//! use edgevpn_manager::{ManagerConfig, ManagerContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), edgevpn_manager::ManagerError> {
//!     let ctx = ManagerContext::new(ManagerConfig::from_env()?);
//!     let profile = ctx.store().load("office")?;
//!     let pending = ctx.supervisor().start(&profile).await?;
//!     println!("{}", pending.outcome().await.message());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod profile;
pub mod release;
pub mod runtime;
pub mod supervisor;
pub mod tail;

pub use config::ManagerConfig;
pub use context::{ManagerContext, Notification};
pub use daemon::DaemonService;
pub use error::ManagerError;
pub use profile::{Profile, ProfileStore};
pub use release::ReleaseFinder;
pub use supervisor::{ProcessStatus, Supervisor};
pub use tail::{LogBuffer, LogTail};
