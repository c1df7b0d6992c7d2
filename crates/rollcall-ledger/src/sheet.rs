//! In-memory attendance sheet: one row per student, one column per date.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rollcall_core::StudentId;
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header text of the fixed leading columns.
pub const FIXED_HEADERS: [&str; 3] = ["Student ID", "Year", "Registration Date"];
/// Sheet column (0-based) of the first date.
pub const FIRST_DATE_COLUMN: usize = FIXED_HEADERS.len();

/// Position in the identifier of the digit the cohort is derived from.
const COHORT_CHAR_INDEX: usize = 2;
/// Cohort = `COHORT_BASE - digit`.
const COHORT_BASE: i32 = 5;

/// Year-of-study derived from a student identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cohort {
    Year(i32),
    Unspecified,
}

impl Cohort {
    /// Derive from the third character of the identifier.
    ///
    /// Identifiers that are too short, or whose third character is not an
    /// ASCII digit, are [`Cohort::Unspecified`].
    pub fn derive(id: &StudentId) -> Self {
        id.as_str()
            .chars()
            .nth(COHORT_CHAR_INDEX)
            .and_then(|c| c.to_digit(10))
            .map(|d| Cohort::Year(COHORT_BASE - d as i32))
            .unwrap_or(Cohort::Unspecified)
    }

    /// Parse the text of a Year cell. Anything but an integer is unspecified.
    pub fn from_cell(text: &str) -> Self {
        text.trim()
            .parse::<i32>()
            .map(Cohort::Year)
            .unwrap_or(Cohort::Unspecified)
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cohort::Year(year) => write!(f, "{year}"),
            Cohort::Unspecified => f.write_str("Not Specified"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }
}

/// One attendance event as committed to the sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// A student row.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentRow {
    pub student_id: StudentId,
    pub cohort: Cohort,
    pub registered_at: NaiveDateTime,
    /// One slot per date column, same order as [`LedgerSheet::dates`].
    pub(crate) marks: Vec<Option<NaiveTime>>,
}

impl StudentRow {
    pub fn marks(&self) -> &[Option<NaiveTime>] {
        &self.marks
    }
}

/// What `record` changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub record: AttendanceRecord,
    pub new_row: bool,
    pub new_column: bool,
    /// Time already recorded for that student and day, now overwritten.
    pub previous: Option<NaiveTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSheet {
    dates: Vec<NaiveDate>,
    rows: Vec<StudentRow>,
}

impl LedgerSheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a sheet from persisted parts. Row mark vectors are padded
    /// or truncated to the number of dates.
    pub(crate) fn from_parts(dates: Vec<NaiveDate>, mut rows: Vec<StudentRow>) -> Self {
        for row in &mut rows {
            row.marks.resize(dates.len(), None);
        }
        Self { dates, rows }
    }

    /// Date columns in first-seen order.
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Students in first-registration order.
    pub fn rows(&self) -> &[StudentRow] {
        &self.rows
    }

    pub fn row(&self, id: &StudentId) -> Option<&StudentRow> {
        self.rows.iter().find(|r| &r.student_id == id)
    }

    pub fn time_for(&self, id: &StudentId, date: NaiveDate) -> Option<NaiveTime> {
        let column = self.dates.iter().position(|d| *d == date)?;
        self.row(id)?.marks[column]
    }

    /// Mark `id` present at `at`.
    ///
    /// Adds the date column and the student row on first sight. The cohort
    /// is re-derived on every call. A second mark on the same day replaces
    /// the earlier time.
    pub fn record(&mut self, id: &StudentId, at: NaiveDateTime) -> RecordOutcome {
        let date = at.date();
        let time = at.time();

        let (column, new_column) = match self.dates.iter().position(|d| *d == date) {
            Some(column) => (column, false),
            None => {
                self.dates.push(date);
                for row in &mut self.rows {
                    row.marks.push(None);
                }
                (self.dates.len() - 1, true)
            }
        };

        let (index, new_row) = match self.rows.iter().position(|r| &r.student_id == id) {
            Some(index) => (index, false),
            None => {
                self.rows.push(StudentRow {
                    student_id: id.clone(),
                    cohort: Cohort::derive(id),
                    registered_at: at,
                    marks: vec![None; self.dates.len()],
                });
                (self.rows.len() - 1, true)
            }
        };

        let row = &mut self.rows[index];
        row.cohort = Cohort::derive(id);
        let previous = row.marks[column].replace(time);

        RecordOutcome {
            record: AttendanceRecord {
                student_id: id.clone(),
                date,
                time,
                status: AttendanceStatus::Present,
            },
            new_row,
            new_column,
            previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> StudentId {
        s.parse().unwrap()
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_cohort_from_third_character() {
        assert_eq!(Cohort::derive(&id("AB3CD")), Cohort::Year(2));
        assert_eq!(Cohort::derive(&id("210CS")), Cohort::Year(5));
        assert_eq!(Cohort::derive(&id("AB")), Cohort::Unspecified);
        assert_eq!(Cohort::derive(&id("ABCDE")), Cohort::Unspecified);
        assert_eq!(Cohort::Unspecified.to_string(), "Not Specified");
        assert_eq!(Cohort::from_cell("3"), Cohort::Year(3));
        assert_eq!(Cohort::from_cell("Not Specified"), Cohort::Unspecified);
    }

    #[test]
    fn test_same_day_mark_is_idempotent() {
        let mut sheet = LedgerSheet::new();
        let first = sheet.record(&id("21CS001"), at("2026-03-02", "09:00:00"));
        assert!(first.new_row && first.new_column);
        assert_eq!(first.previous, None);

        let second = sheet.record(&id("21CS001"), at("2026-03-02", "09:05:30"));
        assert!(!second.new_row && !second.new_column);
        assert_eq!(second.previous, NaiveTime::from_hms_opt(9, 0, 0));

        assert_eq!(sheet.rows().len(), 1);
        assert_eq!(sheet.dates().len(), 1);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(sheet.time_for(&id("21CS001"), date), NaiveTime::from_hms_opt(9, 5, 30));
        // Registration timestamp is the first sighting.
        assert_eq!(sheet.rows()[0].registered_at, at("2026-03-02", "09:00:00"));
    }

    #[test]
    fn test_dates_append_in_first_seen_order() {
        let mut sheet = LedgerSheet::new();
        sheet.record(&id("A1"), at("2026-03-05", "10:00:00"));
        sheet.record(&id("A1"), at("2026-03-03", "10:00:00"));
        sheet.record(&id("B2"), at("2026-03-05", "11:00:00"));
        sheet.record(&id("B2"), at("2026-03-04", "11:00:00"));

        let dates: Vec<String> = sheet.dates().iter().map(|d| d.format(DATE_FORMAT).to_string()).collect();
        assert_eq!(dates, vec!["2026-03-05", "2026-03-03", "2026-03-04"]);
        for row in sheet.rows() {
            assert_eq!(row.marks().len(), 3);
        }
    }

    #[test]
    fn test_new_date_pads_existing_rows() {
        let mut sheet = LedgerSheet::new();
        sheet.record(&id("A1"), at("2026-03-02", "08:00:00"));
        sheet.record(&id("B2"), at("2026-03-03", "08:00:00"));

        let a = sheet.row(&id("A1")).unwrap();
        assert_eq!(a.marks(), &[NaiveTime::from_hms_opt(8, 0, 0), None]);
        let b = sheet.row(&id("B2")).unwrap();
        assert_eq!(b.marks(), &[None, NaiveTime::from_hms_opt(8, 0, 0)]);
    }

    #[test]
    fn test_cohort_rederived_on_existing_row() {
        let mut sheet = LedgerSheet::from_parts(
            vec![],
            vec![StudentRow {
                student_id: id("AB3CD"),
                cohort: Cohort::Year(9),
                registered_at: at("2026-01-01", "08:00:00"),
                marks: vec![],
            }],
        );
        sheet.record(&id("AB3CD"), at("2026-03-02", "08:00:00"));
        assert_eq!(sheet.row(&id("AB3CD")).unwrap().cohort, Cohort::Year(2));
    }

    #[test]
    fn test_rows_in_first_registration_order() {
        let mut sheet = LedgerSheet::new();
        for s in ["C", "A", "B", "A"] {
            sheet.record(&id(s), at("2026-03-02", "08:00:00"));
        }
        let order: Vec<&str> = sheet.rows().iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }
}
