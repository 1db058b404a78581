pub mod config;
pub mod types;
pub mod version;

pub use config::RefreshConfig;
pub use types::*;
pub use version::{CodeVersion, VersionError, code_versions_compatible};
