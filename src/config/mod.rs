//! Manager configuration
//!
//! Paths, timings and external-binary settings shared by every component.

mod settings;

pub use settings::{
    ManagerConfig, DEFAULT_BINARY_NAME, DEFAULT_ELEVATION, DEFAULT_LOG_BUFFER_LIMIT,
    DEFAULT_RELEASE_API, DEFAULT_RELEASE_REPO, DEFAULT_START_DELAY,
};
