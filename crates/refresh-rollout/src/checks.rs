//! Gate checks run before the first unit's new version may serve.
//!
//! Where the pioneer upgrades before the checks, its workload is first
//! compared against the target's pinned workload. Compatibility runs
//! next; pre-upgrade checks are only attempted once compatibility passed,
//! and never for a rollback.

use std::fmt;
use std::sync::Arc;

use refresh_core::{CheckKind, CheckResult, CodeVersion, VersionPin, code_versions_compatible};
use tracing::{debug, info, warn};

use crate::strategy::CheckTiming;

/// A pre-upgrade check or preparation failed.
///
/// The message is shown to the operator next to the rollback command, so
/// it should name the failed check (e.g. "Backup in progress") and not
/// repeat rollback instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecheckFailed {
    message: String,
}

impl PrecheckFailed {
    /// Returns `None` for an empty message.
    pub fn new(message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        if message.is_empty() {
            return None;
        }
        Some(Self { message })
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PrecheckFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PrecheckFailed {}

/// Workload-specific hooks for gate checks.
pub trait Workload: Send + Sync {
    /// Human readable workload name, e.g. `PostgreSQL`.
    fn name(&self) -> &str;

    /// Whether upgrading from `from` to `to` is supported.
    ///
    /// Must return `true` when both pins are identical so rollbacks pass.
    fn is_compatible(&self, from: &VersionPin, to: &VersionPin) -> bool {
        default_compatibility(from, to)
    }

    /// Checks run after the pioneer upgraded, before its workload starts.
    fn pre_upgrade_checks_after_first_unit(&self) -> Result<(), PrecheckFailed>;

    /// Checks run before any unit upgraded (also the `pre-upgrade-check`
    /// action).
    fn pre_upgrade_checks_before_any_unit(&self) -> Result<(), PrecheckFailed> {
        self.pre_upgrade_checks_after_first_unit()
    }
}

/// Identical pins are compatible; otherwise the code-version rule applies.
pub fn default_compatibility(from: &VersionPin, to: &VersionPin) -> bool {
    if from.same_version(to) {
        return true;
    }
    let parsed = CodeVersion::parse(&from.code).and_then(|old| {
        let new = CodeVersion::parse(&to.code)?;
        code_versions_compatible(&old, &new)
    });
    match parsed {
        Ok(compatible) => compatible,
        Err(e) => {
            warn!(from = %from.code, to = %to.code, error = %e, "code versions not comparable");
            false
        }
    }
}

/// Runs gate checks against a workload and wraps outcomes as [`CheckResult`]s.
#[derive(Clone)]
pub struct CheckEngine {
    workload: Arc<dyn Workload>,
}

impl CheckEngine {
    pub fn new(workload: Arc<dyn Workload>) -> Self {
        Self { workload }
    }

    pub fn workload_name(&self) -> &str {
        self.workload.name()
    }

    /// Compare the workload the pioneer came up with against the target's
    /// pin. A pure comparison, so it is cheap to re-evaluate.
    pub fn run_workload_pin_check(&self, installed: &str, target: &VersionPin) -> CheckResult {
        let name = self.workload.name();
        if installed == target.workload {
            debug!(%installed, "workload pin check passed");
            CheckResult::pass(
                CheckKind::WorkloadPin,
                format!("{name} version is pinned by code version {}", target.code),
            )
        } else {
            debug!(%installed, pinned = %target.workload, "workload pin check failed");
            CheckResult::fail(
                CheckKind::WorkloadPin,
                format!(
                    "Upgrade is to {name} version {installed} that has not been validated to work with code version {}",
                    target.code
                ),
            )
        }
    }

    pub fn run_compatibility_check(&self, from: &VersionPin, to: &VersionPin) -> CheckResult {
        let name = self.workload.name();
        if self.workload.is_compatible(from, to) {
            info!(%from, %to, "compatibility check passed");
            CheckResult::pass(
                CheckKind::Compatibility,
                format!("Upgrade from previous {name} version and code version is compatible"),
            )
        } else {
            warn!(%from, %to, "compatibility check failed");
            CheckResult::fail(CheckKind::Compatibility, "Upgrade incompatible")
        }
    }

    pub fn run_pre_upgrade_checks(&self, timing: CheckTiming) -> CheckResult {
        let outcome = match timing {
            CheckTiming::BeforeAnyUnit => self.workload.pre_upgrade_checks_before_any_unit(),
            CheckTiming::AfterFirstUnit => self.workload.pre_upgrade_checks_after_first_unit(),
        };
        match outcome {
            Ok(()) => {
                info!(?timing, "pre-upgrade checks passed");
                CheckResult::pass(CheckKind::PreUpgrade, "Pre-upgrade checks successful")
            }
            Err(failed) => {
                warn!(?timing, reason = %failed, "pre-upgrade check failed");
                CheckResult::fail(
                    CheckKind::PreUpgrade,
                    format!("Pre-upgrade check failed: {failed}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        compatible: bool,
        precheck: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Workload for Fixed {
        fn name(&self) -> &str {
            "PostgreSQL"
        }

        fn is_compatible(&self, _from: &VersionPin, _to: &VersionPin) -> bool {
            self.compatible
        }

        fn pre_upgrade_checks_after_first_unit(&self) -> Result<(), PrecheckFailed> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.precheck.and_then(PrecheckFailed::new) {
                Some(failed) => Err(failed),
                None => Ok(()),
            }
        }
    }

    fn pin(code: &str) -> VersionPin {
        VersionPin::new(code, "sha256:aa", "14.11")
    }

    #[test]
    fn precheck_failed_requires_message() {
        assert!(PrecheckFailed::new("").is_none());
        assert_eq!(
            PrecheckFailed::new("Backup in progress").unwrap().message(),
            "Backup in progress"
        );
    }

    #[test]
    fn default_compatibility_rules() {
        assert!(default_compatibility(&pin("14/1.12.0"), &pin("14/1.13.0")));
        assert!(!default_compatibility(&pin("14/1.13.0"), &pin("14/1.12.0")));
        // Identical pins always pass, even when unparseable.
        assert!(default_compatibility(&pin("garbage"), &pin("garbage")));
        assert!(!default_compatibility(&pin("14/1.12.0"), &pin("16/1.12.0")));
    }

    #[test]
    fn compatibility_result() {
        let engine = CheckEngine::new(Arc::new(Fixed {
            compatible: false,
            precheck: None,
            calls: AtomicUsize::new(0),
        }));
        let result = engine.run_compatibility_check(&pin("14/1.12.0"), &pin("14/1.13.0"));
        assert_eq!(result.kind, CheckKind::Compatibility);
        assert!(!result.passed);
    }

    #[test]
    fn workload_pin_result() {
        let engine = CheckEngine::new(Arc::new(Fixed {
            compatible: true,
            precheck: None,
            calls: AtomicUsize::new(0),
        }));
        let target = pin("14/1.13.0");

        let result = engine.run_workload_pin_check("sha256:aa", &target);
        assert_eq!(result.kind, CheckKind::WorkloadPin);
        assert!(result.passed);

        let result = engine.run_workload_pin_check("sha256:ff", &target);
        assert!(!result.passed);
        assert_eq!(
            result.message,
            "Upgrade is to PostgreSQL version sha256:ff that has not been validated to work with code version 14/1.13.0"
        );
    }

    #[test]
    fn pre_upgrade_before_any_unit_defaults_to_after_first() {
        let workload = Arc::new(Fixed {
            compatible: true,
            precheck: Some("Backup in progress"),
            calls: AtomicUsize::new(0),
        });
        let engine = CheckEngine::new(workload.clone());
        let result = engine.run_pre_upgrade_checks(CheckTiming::BeforeAnyUnit);
        assert!(!result.passed);
        assert_eq!(result.message, "Pre-upgrade check failed: Backup in progress");
        assert_eq!(workload.calls.load(Ordering::SeqCst), 1);
    }
}
