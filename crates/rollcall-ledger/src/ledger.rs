//! The attendance ledger: in-memory sheet plus durable persistence.

use crate::error_log::ErrorLog;
use crate::sheet::{AttendanceRecord, LedgerSheet};
use chrono::NaiveDateTime;
use rollcall_core::StudentId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("reading workbook: {0}")]
    Read(#[from] calamine::XlsxError),
    #[error("writing workbook: {0}")]
    Write(#[from] rust_xlsxwriter::XlsxError),
    #[error("malformed ledger at row {row}, column {column}: {reason}")]
    Malformed {
        row: usize,
        column: usize,
        reason: String,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the sheet lives between runs.
pub trait SheetStore {
    /// Load the persisted sheet; an absent sheet loads as empty.
    fn load(&self) -> Result<LedgerSheet, LedgerError>;

    /// Replace the persisted sheet with `sheet`.
    fn save(&self, sheet: &LedgerSheet) -> Result<(), LedgerError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

pub struct AttendanceLedger {
    sheet: LedgerSheet,
    store: Box<dyn SheetStore>,
    error_log: ErrorLog,
    /// Set when the in-memory sheet has changes the store has not accepted.
    dirty: bool,
}

impl AttendanceLedger {
    pub fn open(store: Box<dyn SheetStore>, error_log: ErrorLog) -> Result<Self, LedgerError> {
        let sheet = store.load()?;
        tracing::info!(
            location = %store.describe(),
            students = sheet.rows().len(),
            dates = sheet.dates().len(),
            "ledger opened"
        );
        Ok(Self {
            sheet,
            store,
            error_log,
            dirty: false,
        })
    }

    pub fn sheet(&self) -> &LedgerSheet {
        &self.sheet
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark `id` present at `at` and persist the whole sheet.
    ///
    /// A failed save is logged and leaves the in-memory sheet intact; the
    /// next `record` or [`flush`](Self::flush) writes everything again.
    pub fn record(&mut self, id: &StudentId, at: NaiveDateTime) -> AttendanceRecord {
        let outcome = self.sheet.record(id, at);
        tracing::info!(
            id = %id,
            date = %outcome.record.date,
            time = %outcome.record.time,
            new_row = outcome.new_row,
            new_column = outcome.new_column,
            replaced = ?outcome.previous,
            "attendance marked"
        );
        self.dirty = true;

        if let Err(e) = self.store.save(&self.sheet) {
            tracing::error!(id = %id, location = %self.store.describe(), error = %e, "ledger save failed");
            self.error_log.append("Ledger save error", id.as_str(), &e);
        } else {
            self.dirty = false;
        }

        outcome.record
    }

    /// Write outstanding changes. Used on shutdown, where failure is reported to the caller.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        if !self.dirty {
            return Ok(());
        }
        self.store.save(&self.sheet)?;
        self.dirty = false;
        tracing::info!(location = %self.store.describe(), "ledger flushed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Store that keeps the last saved sheet and can be told to fail.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStore {
        pub saved: Rc<RefCell<Option<LedgerSheet>>>,
        pub saves: Rc<Cell<usize>>,
        pub locked: Rc<Cell<bool>>,
    }

    impl SheetStore for MemoryStore {
        fn load(&self) -> Result<LedgerSheet, LedgerError> {
            Ok(self.saved.borrow().clone().unwrap_or_default())
        }

        fn save(&self, sheet: &LedgerSheet) -> Result<(), LedgerError> {
            self.saves.set(self.saves.get() + 1);
            if self.locked.get() {
                return Err(LedgerError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "file is open in another program",
                )));
            }
            *self.saved.borrow_mut() = Some(sheet.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    pub(crate) fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, crate::sheet::TIMESTAMP_FORMAT).unwrap()
    }

    fn id(s: &str) -> StudentId {
        s.parse().unwrap()
    }

    #[test]
    fn test_record_persists_each_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let mut ledger = AttendanceLedger::open(Box::new(store.clone()), ErrorLog::new(dir.path().join("err.txt"))).unwrap();

        let record = ledger.record(&id("21CS001"), at("2026-03-02 09:00:00"));
        assert_eq!(record.time.to_string(), "09:00:00");
        assert_eq!(store.saves.get(), 1);
        assert_eq!(store.saved.borrow().as_ref(), Some(ledger.sheet()));
        assert!(!ledger.is_dirty());
    }

    #[test]
    fn test_locked_file_keeps_memory_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("err.txt");
        let store = MemoryStore::default();
        let mut ledger = AttendanceLedger::open(Box::new(store.clone()), ErrorLog::new(&log_path)).unwrap();

        store.locked.set(true);
        ledger.record(&id("21CS001"), at("2026-03-02 09:00:00"));
        assert!(ledger.is_dirty());
        assert!(store.saved.borrow().is_none());
        assert!(ledger.sheet().row(&id("21CS001")).is_some());

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("Ledger save error for 21CS001: io: file is open in another program"));

        // Next scan saves everything, including the earlier mark.
        store.locked.set(false);
        ledger.record(&id("21CS002"), at("2026-03-02 09:01:00"));
        assert!(!ledger.is_dirty());
        let saved = store.saved.borrow().clone().unwrap();
        assert_eq!(saved.rows().len(), 2);
    }

    #[test]
    fn test_flush_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let mut ledger = AttendanceLedger::open(Box::new(store.clone()), ErrorLog::new(dir.path().join("err.txt"))).unwrap();

        // Nothing pending: no save attempted.
        ledger.flush().unwrap();
        assert_eq!(store.saves.get(), 0);

        store.locked.set(true);
        ledger.record(&id("A1"), at("2026-03-02 09:00:00"));
        assert!(ledger.flush().is_err());

        store.locked.set(false);
        ledger.flush().unwrap();
        assert!(!ledger.is_dirty());
    }

    #[test]
    fn test_open_loads_existing_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        {
            let mut ledger =
                AttendanceLedger::open(Box::new(store.clone()), ErrorLog::new(dir.path().join("err.txt"))).unwrap();
            ledger.record(&id("A1"), at("2026-03-02 09:00:00"));
        }
        let ledger = AttendanceLedger::open(Box::new(store), ErrorLog::new(dir.path().join("err.txt"))).unwrap();
        assert_eq!(ledger.sheet().rows().len(), 1);
    }
}
