//! Spreadsheet persistence: `calamine` to read, `rust_xlsxwriter` to write.

use crate::ledger::{LedgerError, SheetStore};
use crate::sheet::{
    Cohort, LedgerSheet, StudentRow, DATE_FORMAT, FIRST_DATE_COLUMN, FIXED_HEADERS, TIMESTAMP_FORMAT,
    TIME_FORMAT,
};
use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_xlsxwriter::{Color, Format, FormatPattern, Workbook, Worksheet};
use std::path::{Path, PathBuf};

const HEADER_FILL: u32 = 0xCCCCCC;
const FIXED_WIDTHS: [f64; 3] = [15.0, 10.0, 20.0];
const DATE_WIDTH: f64 = 15.0;

/// Ledger stored as one worksheet of an `.xlsx` workbook.
///
/// Every save rewrites the whole workbook. Other worksheets are carried
/// over by value, in their original order; their styling and formulas are not.
pub struct XlsxSheetStore {
    path: PathBuf,
    sheet_name: String,
}

impl XlsxSheetStore {
    pub fn new(path: impl Into<PathBuf>, sheet_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sheet_name: sheet_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SheetStore for XlsxSheetStore {
    fn load(&self) -> Result<LedgerSheet, LedgerError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "no ledger yet, starting empty");
            return Ok(LedgerSheet::new());
        }

        let mut workbook: Xlsx<_> = open_workbook(&self.path)?;
        if !workbook.sheet_names().iter().any(|n| n == &self.sheet_name) {
            tracing::info!(sheet = %self.sheet_name, "worksheet missing, starting empty");
            return Ok(LedgerSheet::new());
        }
        let range = workbook.worksheet_range(&self.sheet_name)?;
        let mut rows = range.rows();

        let Some(header) = rows.next() else {
            return Ok(LedgerSheet::new());
        };
        let mut dates = Vec::new();
        for column in FIRST_DATE_COLUMN..header.len() {
            let text = cell_text(header, column);
            if text.is_empty() {
                break;
            }
            let date = NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .map_err(|e| malformed(0, column, format!("date header {text:?}: {e}")))?;
            dates.push(date);
        }

        let mut students = Vec::new();
        for (offset, cells) in rows.enumerate() {
            let line = offset + 1;
            let raw_id = cell_text(cells, 0);
            let Ok(student_id) = raw_id.parse() else {
                continue;
            };

            let registered = cell_text(cells, 2);
            let registered_at = NaiveDateTime::parse_from_str(&registered, TIMESTAMP_FORMAT)
                .map_err(|e| malformed(line, 2, format!("registration date {registered:?}: {e}")))?;

            let mut marks = Vec::with_capacity(dates.len());
            for i in 0..dates.len() {
                let column = FIRST_DATE_COLUMN + i;
                let text = cell_text(cells, column);
                if text.is_empty() {
                    marks.push(None);
                } else {
                    let time = NaiveTime::parse_from_str(&text, TIME_FORMAT)
                        .map_err(|e| malformed(line, column, format!("time {text:?}: {e}")))?;
                    marks.push(Some(time));
                }
            }

            students.push(StudentRow {
                student_id,
                cohort: Cohort::from_cell(&cell_text(cells, 1)),
                registered_at,
                marks,
            });
        }

        tracing::debug!(students = students.len(), dates = dates.len(), "ledger loaded");
        Ok(LedgerSheet::from_parts(dates, students))
    }

    fn save(&self, sheet: &LedgerSheet) -> Result<(), LedgerError> {
        let mut workbook = Workbook::new();
        let mut written = false;
        for part in self.existing_parts()? {
            match part {
                WorkbookPart::Ledger => {
                    self.write_ledger(workbook.add_worksheet(), sheet)?;
                    written = true;
                }
                WorkbookPart::Other { name, cells } => {
                    let worksheet = workbook.add_worksheet();
                    worksheet.set_name(&name)?;
                    copy_cells(worksheet, &cells)?;
                }
            }
        }
        if !written {
            self.write_ledger(workbook.add_worksheet(), sheet)?;
        }

        workbook.save(&self.path)?;
        tracing::debug!(path = %self.path.display(), "ledger saved");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} [{}]", self.path.display(), self.sheet_name)
    }
}

/// A worksheet of the workbook already on disk.
enum WorkbookPart {
    Ledger,
    Other { name: String, cells: Range<Data> },
}

impl XlsxSheetStore {
    /// Worksheets currently in the file, in order.
    fn existing_parts(&self) -> Result<Vec<WorkbookPart>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut workbook: Xlsx<_> = open_workbook(&self.path)?;
        let mut parts = Vec::new();
        for name in workbook.sheet_names() {
            if name == self.sheet_name {
                parts.push(WorkbookPart::Ledger);
            } else {
                let cells = workbook.worksheet_range(&name)?;
                tracing::trace!(sheet = %name, "carrying worksheet over");
                parts.push(WorkbookPart::Other { name, cells });
            }
        }
        Ok(parts)
    }

    fn write_ledger(&self, worksheet: &mut Worksheet, sheet: &LedgerSheet) -> Result<(), LedgerError> {
        let header = Format::new()
            .set_bold()
            .set_pattern(FormatPattern::Solid)
            .set_background_color(Color::RGB(HEADER_FILL));
        worksheet.set_name(&self.sheet_name)?;

        for (column, (title, width)) in FIXED_HEADERS.iter().zip(FIXED_WIDTHS).enumerate() {
            worksheet.write_string_with_format(0, column as u16, *title, &header)?;
            worksheet.set_column_width(column as u16, width)?;
        }
        for (i, date) in sheet.dates().iter().enumerate() {
            let column = (FIRST_DATE_COLUMN + i) as u16;
            worksheet.write_string_with_format(0, column, date.format(DATE_FORMAT).to_string(), &header)?;
            worksheet.set_column_width(column, DATE_WIDTH)?;
        }

        for (i, row) in sheet.rows().iter().enumerate() {
            let line = (i + 1) as u32;
            worksheet.write_string(line, 0, row.student_id.as_str())?;
            worksheet.write_string(line, 1, row.cohort.to_string())?;
            worksheet.write_string(line, 2, row.registered_at.format(TIMESTAMP_FORMAT).to_string())?;
            for (j, mark) in row.marks().iter().enumerate() {
                if let Some(time) = mark {
                    let column = (FIRST_DATE_COLUMN + j) as u16;
                    worksheet.write_string(line, column, time.format(TIME_FORMAT).to_string())?;
                }
            }
        }
        Ok(())
    }
}

fn copy_cells(worksheet: &mut Worksheet, cells: &Range<Data>) -> Result<(), LedgerError> {
    let (top, left) = cells.start().unwrap_or((0, 0));
    for (r, c, value) in cells.used_cells() {
        let row = top + r as u32;
        let column = (left + c as u32) as u16;
        match value {
            Data::Int(n) => worksheet.write_number(row, column, *n as f64)?,
            Data::Float(n) => worksheet.write_number(row, column, *n)?,
            Data::Bool(b) => worksheet.write_boolean(row, column, *b)?,
            Data::DateTime(dt) => worksheet.write_number(row, column, dt.as_f64())?,
            Data::String(text) | Data::DateTimeIso(text) | Data::DurationIso(text) => {
                worksheet.write_string(row, column, text)?
            }
            Data::Error(_) | Data::Empty => continue,
        };
    }
    Ok(())
}

fn cell_text(cells: &[Data], column: usize) -> String {
    cells
        .get(column)
        .map(|c| c.to_string().trim().to_string())
        .unwrap_or_default()
}

fn malformed(row: usize, column: usize, reason: String) -> LedgerError {
    LedgerError::Malformed { row, column, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::StudentId;

    fn id(s: &str) -> StudentId {
        s.parse().unwrap()
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = XlsxSheetStore::new(dir.path().join("attendance.xlsx"), "Attendance");
        assert_eq!(store.load().unwrap(), LedgerSheet::new());
    }

    #[test]
    fn test_saved_sheet_reloads_with_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = XlsxSheetStore::new(dir.path().join("attendance.xlsx"), "Attendance");

        let mut sheet = LedgerSheet::new();
        sheet.record(&id("213CS01"), at("2026-03-02 09:00:00"));
        sheet.record(&id("AB"), at("2026-03-02 09:10:00"));
        sheet.record(&id("AB"), at("2026-03-03 08:45:12"));
        store.save(&sheet).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, sheet);

        // Headers and cells as the operator sees them.
        let mut workbook: Xlsx<_> = open_workbook(store.path()).unwrap();
        let range = workbook.worksheet_range("Attendance").unwrap();
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        assert_eq!(
            rows[0],
            vec!["Student ID", "Year", "Registration Date", "2026-03-02", "2026-03-03"]
        );
        assert_eq!(rows[1][..4], ["213CS01", "2", "2026-03-02 09:00:00", "09:00:00"]);
        assert_eq!(rows[1][4], "");
        assert_eq!(rows[2][1], "Not Specified");
        assert_eq!(rows[2][4], "08:45:12");
    }

    #[test]
    fn test_other_worksheets_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.xlsx");
        {
            let mut workbook = Workbook::new();
            let timetable = workbook.add_worksheet();
            timetable.set_name("Timetable").unwrap();
            timetable.write_string(0, 0, "Monday").unwrap();
            timetable.write_number(1, 2, 9.5).unwrap();
            workbook.add_worksheet().set_name("Attendance").unwrap();
            workbook.add_worksheet().set_name("Notes").unwrap().write_boolean(3, 1, true).unwrap();
            workbook.save(&path).unwrap();
        }

        let store = XlsxSheetStore::new(&path, "Attendance");
        let mut sheet = store.load().unwrap();
        sheet.record(&id("213CS01"), at("2026-03-02 09:00:00"));
        store.save(&sheet).unwrap();

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Timetable", "Attendance", "Notes"]);
        let timetable = workbook.worksheet_range("Timetable").unwrap();
        assert_eq!(timetable.get_value((0, 0)), Some(&Data::String("Monday".into())));
        assert_eq!(timetable.get_value((1, 2)), Some(&Data::Float(9.5)));
        let notes = workbook.worksheet_range("Notes").unwrap();
        assert_eq!(notes.get_value((3, 1)), Some(&Data::Bool(true)));
        assert_eq!(store.load().unwrap(), sheet);
    }

    #[test]
    fn test_ledger_sheet_added_to_foreign_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("school.xlsx");
        {
            let mut workbook = Workbook::new();
            workbook.add_worksheet().set_name("Timetable").unwrap().write_string(0, 0, "Monday").unwrap();
            workbook.save(&path).unwrap();
        }

        let store = XlsxSheetStore::new(&path, "Attendance");
        let mut sheet = store.load().unwrap();
        assert!(sheet.rows().is_empty());
        sheet.record(&id("AB"), at("2026-03-02 09:00:00"));
        store.save(&sheet).unwrap();

        let workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Timetable", "Attendance"]);
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = XlsxSheetStore::new(dir.path().join("no/such/dir/attendance.xlsx"), "Attendance");
        assert!(store.save(&LedgerSheet::new()).is_err());
    }
}
