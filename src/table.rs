//! In-memory string tables and CSV I/O.
//!
//! Every cell is kept as the raw text from the file. An empty cell is a
//! missing value; the schema stage decides what the text means.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineResult;

/// A header row plus rectangular string rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Create a table, padding or truncating rows to the header width.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { headers, rows }
    }

    /// Read a CSV file with a header row.
    pub fn read_csv(path: &Path) -> PipelineResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self::new(headers, rows))
    }

    /// Write the table as CSV, replacing any existing file.
    pub fn write_csv(&self, path: &Path) -> PipelineResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the first column with this exact name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Iterate one column's cells top to bottom.
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &str> {
        self.rows.iter().map(move |row| row[index].as_str())
    }

    /// First alias (in priority order) that names a column of this table.
    pub fn find_column<'a>(&self, aliases: &'a [String]) -> Option<&'a str> {
        aliases
            .iter()
            .find(|alias| self.column_index(alias).is_some())
            .map(String::as_str)
    }

    /// Rows whose cell in `column` equals `value`, in table order.
    pub fn filter_eq(&self, column: usize, value: &str) -> Table {
        Table {
            headers: self.headers.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| row[column] == value)
                .cloned()
                .collect(),
        }
    }
}

/// Missing-value test shared by the schema and merge stages.
pub fn is_missing(cell: &str) -> bool {
    cell.is_empty()
}

/// `.csv` files directly inside `dir`, sorted by file name.
pub fn list_csv_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_csv_extension(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Sub-directories of `dir`, sorted by name. A missing `dir` has none.
pub fn list_subdirs(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn has_csv_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// File name as an owned string, empty when it is not valid UTF-8.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
pub(crate) fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
    Table::new(
        headers.iter().map(|s| s.to_string()).collect(),
        rows.iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_csv_roundtrip_keeps_quotes_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        let original = table(
            &["PATIENT", "notes"],
            &[&["P1", "it's \"fine\", mostly"], &["P2", ""]],
        );
        original.write_csv(&path).unwrap();
        assert_eq!(Table::read_csv(&path).unwrap(), original);
    }

    #[test]
    fn test_short_rows_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        fs::write(&path, "a,b,c\n1,2\n3,4,5\n").unwrap();
        let t = Table::read_csv(&path).unwrap();
        assert_eq!(t.rows[0], vec!["1", "2", ""]);
        assert_eq!(t.row_count(), 2);
    }

    #[test]
    fn test_find_column_uses_priority() {
        let t = table(&["PATIENT", "Id"], &[]);
        let aliases = vec!["patient_id".to_string(), "Id".to_string(), "PATIENT".to_string()];
        assert_eq!(t.find_column(&aliases), Some("Id"));
        assert_eq!(table(&["x"], &[]).find_column(&aliases), None);
    }

    #[test]
    fn test_list_csv_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "x\n").unwrap();
        fs::write(dir.path().join("a.CSV"), "x\n").unwrap();
        fs::write(dir.path().join("readme.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("patients")).unwrap();
        let names: Vec<String> = list_csv_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_name_of(p))
            .collect();
        assert_eq!(names, vec!["a.CSV", "b.csv"]);
    }
}
