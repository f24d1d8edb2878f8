//! Corpus validation. Reads the input CSV, drops unusable rows and reports
//! quality problems, without touching the store.

use crate::error::ConfigError;
use crate::models::{Record, ValidationResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const TEXT_COLUMN: &str = "text";
pub const MIN_TEXT_CHARS: usize = 10;
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Validate the corpus at `path`. Records are returned only when the result
/// is valid.
pub fn validate(path: &Path) -> (ValidationResult, Option<Vec<Record>>) {
    let mut result = ValidationResult::default();

    match read_records(path, &mut result) {
        Ok(records) if result.errors.is_empty() => {
            result.is_valid = true;
            tracing::info!(
                path = %path.display(),
                valid_rows = result.valid_rows,
                total_rows = result.total_rows,
                warnings = result.warnings.len(),
                "corpus validated"
            );
            (result, Some(records))
        }
        Ok(_) => {
            tracing::warn!(path = %path.display(), errors = ?result.errors, "corpus rejected");
            (result, None)
        }
        Err(error) => {
            result.errors.push(error);
            tracing::warn!(path = %path.display(), errors = ?result.errors, "corpus rejected");
            (result, None)
        }
    }
}

fn read_records(path: &Path, result: &mut ValidationResult) -> Result<Vec<Record>, String> {
    if !path.is_file() {
        return Err(format!("CSV file not found: {}", path.display()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("failed to open CSV file: {e}"))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("failed to read CSV header: {e}"))?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    if headers.iter().all(String::is_empty) {
        return Err("CSV file is empty".to_string());
    }

    let text_index = headers
        .iter()
        .position(|header| header == TEXT_COLUMN)
        .ok_or_else(|| format!("CSV file must contain '{TEXT_COLUMN}' column"))?;

    let mut records = Vec::new();
    let mut dropped = 0usize;
    let mut short = 0usize;
    let mut long = 0usize;

    for row in reader.records() {
        let row = row.map_err(|e| format!("CSV parsing error: {e}"))?;
        result.total_rows += 1;

        let text = row.get(text_index).unwrap_or_default();
        if text.trim().is_empty() {
            dropped += 1;
            continue;
        }

        let chars = text.chars().count();
        if chars < MIN_TEXT_CHARS {
            short += 1;
        } else if chars > MAX_TEXT_CHARS {
            long += 1;
        }

        let metadata: BTreeMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .enumerate()
            .filter(|(index, (header, value))| {
                *index != text_index && !header.is_empty() && !value.trim().is_empty()
            })
            .map(|(_, (header, value))| (header.clone(), value.to_string()))
            .collect();

        records.push(Record::new(text, metadata));
    }

    if result.total_rows == 0 {
        return Err("CSV file has no data rows".to_string());
    }

    if dropped > 0 {
        result
            .warnings
            .push(format!("{dropped} rows will be skipped due to missing/empty text"));
    }
    if short > 0 {
        result.warnings.push(format!(
            "Found {short} very short text entries (< {MIN_TEXT_CHARS} characters)"
        ));
    }
    if long > 0 {
        result.warnings.push(format!(
            "Found {long} very long text entries (> 10,000 characters)"
        ));
    }

    result.valid_rows = records.len();
    if records.is_empty() {
        result
            .errors
            .push("No valid rows found after filtering empty text".to_string());
    }

    Ok(records)
}

/// The most recently modified `{prefix}*.csv` in `directory`.
pub fn latest_input(directory: &Path, prefix: &str) -> Result<PathBuf, ConfigError> {
    let not_found = || ConfigError::NoInputFile {
        directory: directory.to_path_buf(),
        prefix: prefix.to_string(),
    };

    let entries = std::fs::read_dir(directory).map_err(|_| not_found())?;

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(prefix) && name.ends_with(".csv")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
        .ok_or_else(not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::{Duration, SystemTime};

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create csv");
        file.write_all(contents.as_bytes()).expect("write csv");
        path
    }

    #[test]
    fn missing_text_column_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(&dir, "feed.csv", "body,source\nsome long body text,a.md\n");

        let (result, records) = validate(&path);
        assert!(!result.is_valid);
        assert!(records.is_none());
        assert!(result.errors[0].contains("'text' column"));
    }

    #[test]
    fn missing_and_empty_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");

        let (result, records) = validate(&dir.path().join("absent.csv"));
        assert!(!result.is_valid && records.is_none());
        assert!(result.errors[0].contains("not found"));

        let empty = write_csv(&dir, "empty.csv", "");
        let (result, records) = validate(&empty);
        assert!(!result.is_valid && records.is_none());

        let header_only = write_csv(&dir, "header.csv", "text\n");
        let (result, _) = validate(&header_only);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("no data rows"));
    }

    #[test]
    fn empty_rows_are_dropped_with_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(
            &dir,
            "feed.csv",
            "text,source\nthe first useful chunk,a.md\n   ,b.md\n,c.md\nthe second useful chunk,\n",
        );

        let (result, records) = validate(&path);
        let records = records.expect("valid corpus");
        assert!(result.is_valid);
        assert_eq!(result.total_rows, 4);
        assert_eq!(result.valid_rows, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "the first useful chunk");
        assert_eq!(records[1].text, "the second useful chunk");
        assert!(result.warnings.iter().any(|w| w.starts_with("2 rows will be skipped")));
    }

    #[test]
    fn length_outliers_only_warn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let long = "x".repeat(MAX_TEXT_CHARS + 1);
        let path = write_csv(&dir, "feed.csv", &format!("text\nshort\n{long}\n"));

        let (result, records) = validate(&path);
        assert!(result.is_valid);
        assert_eq!(records.expect("records").len(), 2);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn length_is_counted_in_characters() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Nine characters, but more than ten bytes.
        let path = write_csv(&dir, "feed.csv", "text\nüüüüüüüüü\n");

        let (result, _) = validate(&path);
        assert!(result.warnings.iter().any(|w| w.contains("very short")));
    }

    #[test]
    fn other_columns_become_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(
            &dir,
            "feed.csv",
            "source,text,section\ndocs/a.md,a chunk with enough text,\n",
        );

        let (_, records) = validate(&path);
        let record = &records.expect("records")[0];
        assert_eq!(record.metadata.get("source").map(String::as_str), Some("docs/a.md"));
        assert!(!record.metadata.contains_key("section"));
        assert!(!record.metadata.contains_key("text"));
    }

    #[test]
    fn only_whitespace_rows_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(&dir, "feed.csv", "text\n \n\"\"\n");

        let (result, records) = validate(&path);
        assert!(!result.is_valid);
        assert!(records.is_none());
        assert!(result.errors[0].contains("No valid rows"));
    }

    #[test]
    fn latest_input_picks_newest_matching_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let older = write_csv(&dir, "vector_index_feed_1.csv", "text\n");
        let newer = write_csv(&dir, "vector_index_feed_2.csv", "text\n");
        write_csv(&dir, "other.csv", "text\n");

        let now = SystemTime::now();
        std::fs::File::options()
            .write(true)
            .open(&older)
            .expect("open")
            .set_modified(now - Duration::from_secs(3600))
            .expect("set mtime");
        std::fs::File::options()
            .write(true)
            .open(&newer)
            .expect("open")
            .set_modified(now)
            .expect("set mtime");

        let picked = latest_input(dir.path(), "vector_index_feed_").expect("found");
        assert_eq!(picked, newer);

        let error = latest_input(dir.path(), "missing_prefix_").expect_err("none");
        assert!(matches!(error, ConfigError::NoInputFile { .. }));
    }
}
