//! redb table definitions for the refresh state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Application records keyed by `{app}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Unit state keyed by `{app}:{ordinal:010}`.
pub const UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("units");

/// The in-progress upgrade session, keyed by `{app}`. Absent when idle.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Audit trail keyed by `{app}:{seq:020}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

/// Start and end keys covering every `{app}:...` composite key.
pub(crate) fn app_range(app: &str) -> (String, String) {
    // ';' sorts immediately after ':'.
    (format!("{app}:"), format!("{app};"))
}
