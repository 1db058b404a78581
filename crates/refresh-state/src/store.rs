//! StateStore: redb-backed state persistence for the rollout orchestrator.
//!
//! Provides typed operations over application records, unit states,
//! upgrade sessions, and the audit trail. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use refresh_core::{Ordinal, validate_app_name};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A single atomic write of session state.
///
/// `expected_generation` is the generation the writer read (`None` when no
/// session existed). `session: None` deletes the session.
#[derive(Debug)]
pub struct SessionCommit<'a> {
    pub app: &'a str,
    pub expected_generation: Option<u64>,
    pub session: Option<&'a UpgradeSession>,
    pub record: Option<&'a ApplicationRecord>,
    /// Units rewritten alongside the session (target changes).
    pub units: &'a [UnitState],
    pub audit: Vec<AuditEntry>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(UNITS).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application record.
    pub fn put_app(&self, record: &ApplicationRecord) -> StateResult<()> {
        validate_app_name(&record.name)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            insert_json(&mut table, &record.name, record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %record.name, "application stored");
        Ok(())
    }

    pub fn get_app(&self, app: &str) -> StateResult<Option<ApplicationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        get_json(&table, app)
    }

    pub fn list_apps(&self) -> StateResult<Vec<ApplicationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Write an application record together with its units in one
    /// transaction, so no reader sees a target without recomputed units.
    pub fn put_app_with_units(
        &self,
        record: &ApplicationRecord,
        units: &[UnitState],
    ) -> StateResult<()> {
        validate_app_name(&record.name)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            insert_json(&mut apps, &record.name, record)?;
            let mut table = txn.open_table(UNITS).map_err(map_err!(Table))?;
            for unit in units {
                insert_json(&mut table, &unit.table_key(), unit)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %record.name, units = units.len(), "application and units stored");
        Ok(())
    }

    // ── Units ──────────────────────────────────────────────────────

    /// Insert or update a unit state.
    pub fn put_unit(&self, unit: &UnitState) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(UNITS).map_err(map_err!(Table))?;
            insert_json(&mut table, &unit.table_key(), unit)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_unit(&self, app: &str, ordinal: Ordinal) -> StateResult<Option<UnitState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(UNITS).map_err(map_err!(Table))?;
        get_json(&table, &unit_key(app, ordinal))
    }

    /// List all units of an application in ascending ordinal order.
    pub fn list_units(&self, app: &str) -> StateResult<Vec<UnitState>> {
        let (start, end) = app_range(app);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(UNITS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let unit: UnitState = decode(value.value())?;
            if unit.app == app {
                results.push(unit);
            }
        }
        Ok(results)
    }

    /// Apply `f` to a stored unit inside one write transaction.
    ///
    /// Returns the updated unit and whatever `f` returned.
    pub fn update_unit<F, R>(&self, app: &str, ordinal: Ordinal, f: F) -> StateResult<(UnitState, R)>
    where
        F: FnOnce(&mut UnitState) -> R,
    {
        let key = unit_key(app, ordinal);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(UNITS).map_err(map_err!(Table))?;
            let current: Option<UnitState> = get_json(&table, &key)?;
            let mut unit = current.ok_or_else(|| StateError::UnknownUnit {
                app: app.to_string(),
                ordinal,
            })?;
            let out = f(&mut unit);
            insert_json(&mut table, &key, &unit)?;
            result = (unit, out);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Delete a unit. Returns true if it existed.
    pub fn delete_unit(&self, app: &str, ordinal: Ordinal) -> StateResult<bool> {
        let key = unit_key(app, ordinal);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(UNITS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "unit deleted");
        Ok(existed)
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn get_session(&self, app: &str) -> StateResult<Option<UpgradeSession>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        get_json(&table, app)
    }

    /// Compare-and-set commit of session state, application record, and
    /// audit entries.
    ///
    /// Fails with [`StateError::Conflict`] without writing anything when the
    /// stored generation differs from `expected_generation`. On success
    /// returns the generation now stored (`None` if the session was deleted).
    pub fn commit(&self, commit: SessionCommit<'_>) -> StateResult<Option<u64>> {
        let app = commit.app;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let generation;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let current: Option<UpgradeSession> = get_json(&sessions, app)?;
            let found = current.map(|s| s.generation);
            if found != commit.expected_generation {
                return Err(StateError::Conflict {
                    app: app.to_string(),
                    expected: commit.expected_generation,
                    found,
                });
            }

            generation = match commit.session {
                Some(session) => {
                    let mut next = session.clone();
                    next.generation = found.map_or(1, |g| g + 1);
                    insert_json(&mut sessions, app, &next)?;
                    Some(next.generation)
                }
                None => {
                    sessions.remove(app).map_err(map_err!(Write))?;
                    None
                }
            };

            if let Some(record) = commit.record {
                let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
                insert_json(&mut apps, app, record)?;
            }

            if !commit.units.is_empty() {
                let mut units = txn.open_table(UNITS).map_err(map_err!(Table))?;
                for unit in commit.units {
                    insert_json(&mut units, &unit.table_key(), unit)?;
                }
            }

            if !commit.audit.is_empty() {
                let mut audit = txn.open_table(AUDIT).map_err(map_err!(Table))?;
                let mut seq = last_audit_seq(&audit, app)?;
                for mut entry in commit.audit {
                    seq += 1;
                    entry.seq = seq;
                    entry.generation = generation.or(found).unwrap_or(0);
                    insert_json(&mut audit, &entry.table_key(), &entry)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app, ?generation, "session committed");
        Ok(generation)
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Audit trail of an application, oldest first.
    pub fn list_audit(&self, app: &str) -> StateResult<Vec<AuditEntry>> {
        let (start, end) = app_range(app);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let audit: AuditEntry = decode(value.value())?;
            if audit.app == app {
                results.push(audit);
            }
        }
        Ok(results)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_json<T, Tbl>(table: &Tbl, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn insert_json<T: serde::Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn last_audit_seq(table: &Table<'_, &'static str, &'static [u8]>, app: &str) -> StateResult<u64> {
    let (start, end) = app_range(app);
    let mut range = table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?;
    while let Some(entry) = range.next_back() {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let last: AuditEntry = decode(value.value())?;
        if last.app == app {
            return Ok(last.seq);
        }
    }
    Ok(0)
}
