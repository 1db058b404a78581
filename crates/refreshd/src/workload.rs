//! Workload hooks for the daemon.
//!
//! Compatibility follows the code-version rule. The pre-upgrade check
//! fails while a hold file exists; its first line is shown to the
//! operator (e.g. "Backup in progress").

use std::path::PathBuf;

use refresh_rollout::{PrecheckFailed, Workload};
use tracing::debug;

pub struct ConfiguredWorkload {
    name: String,
    hold_file: Option<PathBuf>,
}

impl ConfiguredWorkload {
    pub fn new(name: &str, hold_file: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            hold_file,
        }
    }
}

impl Workload for ConfiguredWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_upgrade_checks_after_first_unit(&self) -> Result<(), PrecheckFailed> {
        let Some(path) = &self.hold_file else {
            return Ok(());
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return Ok(());
        };
        let reason = content.lines().next().unwrap_or("").trim();
        debug!(path = ?path, reason, "upgrade hold present");
        let message = if reason.is_empty() {
            format!("Upgrade held by {}", path.display())
        } else {
            reason.to_string()
        };
        match PrecheckFailed::new(message) {
            Some(failed) => Err(failed),
            None => Ok(()),
        }
    }
}
