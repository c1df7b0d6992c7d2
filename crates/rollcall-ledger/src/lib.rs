//! rollcall-ledger: Recording attendance.
//!
//! Keeps the date-by-student attendance sheet, persists it as a
//! spreadsheet, mirrors each event to a remote store on a best-effort
//! basis, and appends every non-fatal failure to a durable error log.

pub mod error_log;
pub mod ledger;
pub mod mirror;
pub mod sheet;
pub mod xlsx;

pub use error_log::ErrorLog;
pub use ledger::{AttendanceLedger, LedgerError, SheetStore};
pub use mirror::{FirebaseBackend, MirrorBackend, MirrorError, MirrorPayload, SyncMirror};
pub use sheet::{AttendanceRecord, AttendanceStatus, Cohort, LedgerSheet, RecordOutcome, StudentRow};
pub use xlsx::XlsxSheetStore;
