//! Live telemetry projection over an in-progress capture file.
//!
//! The ingest worker appends to the log while status queries read it; there
//! is no lock between the two. The projector therefore parses leniently and
//! excludes a fixed trailing margin of rows, which is the torn-read
//! mitigation: decode boundaries do not align with row boundaries, so the
//! newest rows may belong to a write that has not completed yet.

use std::path::Path;

use serde_json::{Map, Number, Value};

/// Implicit device sample rate of 100 Hz. The synthetic time axis is a
/// display convenience, not a measurement of wall-clock arrival.
const SAMPLE_PERIOD_SECS: f64 = 0.01;
/// Upper bound on rows returned per projection.
const WINDOW_ROWS: usize = 1000;
/// Trailing parsed rows excluded as torn-write protection.
const TAIL_MARGIN: usize = 20;

/// A bounded, display-oriented slice of the parsed capture file.
///
/// `rows` may be empty (short files); an unreadable or wholly unparsable
/// file yields no window at all.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryWindow {
    pub columns: Vec<String>,
    pub rows: Vec<TelemetryRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    /// Synthetic timestamp derived from the row's index in the full file.
    pub t: f64,
    pub values: Vec<f64>,
}

impl TelemetryWindow {
    /// Field-map records for the status payload: one map per row, keyed by
    /// the positional column labels plus `t`.
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                let mut record = Map::with_capacity(self.columns.len() + 1);
                for (label, value) in self.columns.iter().zip(&row.values) {
                    record.insert(label.clone(), json_number(*value));
                }
                record.insert("t".to_string(), json_number(row.t));
                record
            })
            .collect()
    }
}

fn json_number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// The full parsed capture file, used by the record-download endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

/// Parse a capture file into numeric rows.
///
/// Column arity is fixed by the first clean row; rows that fail to parse
/// (a torn tail, ragged arity) are dropped rather than failing the caller.
/// Returns `None` when the file is missing, empty, or yields no rows -
/// transient states while a capture is spinning up are expected, not
/// exceptional.
pub fn read_table(path: &Path) -> Option<DataTable> {
    let text = std::fs::read_to_string(path).ok()?;

    let mut width: Option<usize> = None;
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed: Result<Vec<f64>, _> =
            line.split(',').map(|field| field.trim().parse::<f64>()).collect();
        let Ok(values) = parsed else { continue };

        match width {
            None => width = Some(values.len()),
            Some(w) if values.len() != w => continue,
            Some(_) => {}
        }
        rows.push(values);
    }

    let width = width?;
    if rows.is_empty() {
        return None;
    }

    let columns = (0..width).map(|i| format!("V{i}")).collect();
    Some(DataTable { columns, rows })
}

/// Project the trailing window of a capture file.
///
/// The window is the slice `[len - 1000, len - 20)` of the parsed rows,
/// clamped to valid bounds; a short file yields an empty (but present)
/// window rather than an error.
pub fn project(path: &Path) -> Option<TelemetryWindow> {
    let table = read_table(path)?;

    let len = table.rows.len();
    let start = len.saturating_sub(WINDOW_ROWS);
    let end = len.saturating_sub(TAIL_MARGIN);

    let rows = if end > start {
        table.rows[start..end]
            .iter()
            .enumerate()
            .map(|(offset, values)| TelemetryRow {
                t: (start + offset) as f64 * SAMPLE_PERIOD_SECS,
                values: values.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    Some(TelemetryWindow {
        columns: table.columns,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_rows(dir: &tempfile::TempDir, name: &str, rows: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..rows {
            writeln!(file, "{},{},{}", i, i * 2, i * 3).unwrap();
        }
        path
    }

    #[test]
    fn missing_file_yields_no_data() {
        assert_eq!(project(Path::new("/nonexistent/rec_0.csv")), None);
    }

    #[test]
    fn empty_file_yields_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rows(&dir, "rec_empty.csv", 0);
        assert_eq!(project(&path), None);
    }

    #[test]
    fn garbage_file_yields_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec_garbage.csv");
        std::fs::write(&path, "hello\nworld\n").unwrap();
        assert_eq!(project(&path), None);
    }

    #[test]
    fn short_file_yields_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rows(&dir, "rec_short.csv", 5);

        let window = project(&path).unwrap();
        assert_eq!(window.columns, vec!["V0", "V1", "V2"]);
        assert!(window.rows.is_empty());
    }

    #[test]
    fn window_excludes_trailing_margin() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rows(&dir, "rec_mid.csv", 100);

        let window = project(&path).unwrap();
        assert_eq!(window.rows.len(), 80);
        assert_eq!(window.rows[0].t, 0.0);
        assert_eq!(window.rows[0].values, vec![0.0, 0.0, 0.0]);
        // Last included row is index 79; rows 80..100 are the torn-read margin.
        assert_eq!(window.rows[79].values, vec![79.0, 158.0, 237.0]);
    }

    #[test]
    fn window_is_bounded_for_long_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rows(&dir, "rec_long.csv", 1500);

        let window = project(&path).unwrap();
        // [1500 - 1000, 1500 - 20) -> 980 rows, well under the 1000 cap.
        assert_eq!(window.rows.len(), 980);
        assert!(window.rows.len() <= WINDOW_ROWS);
        assert_eq!(window.rows[0].values[0], 500.0);
        assert_eq!(window.rows[0].t, 5.0);
        assert_eq!(window.rows[979].values[0], 1479.0);
    }

    #[test]
    fn torn_tail_row_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec_torn.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..30 {
            writeln!(file, "{},{},{}", i, i, i).unwrap();
        }
        // A flush landed mid-row: two fields and no newline.
        write!(file, "7,8").unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.rows.len(), 30);

        let window = project(&path).unwrap();
        assert_eq!(window.rows.len(), 10);
    }

    #[test]
    fn records_carry_labels_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rows(&dir, "rec_rec.csv", 40);

        let window = project(&path).unwrap();
        let records = window.to_records();
        assert_eq!(records.len(), 20);

        let first = &records[0];
        assert_eq!(first.get("V0"), Some(&serde_json::json!(0.0)));
        assert_eq!(first.get("V2"), Some(&serde_json::json!(0.0)));
        assert_eq!(first.get("t"), Some(&serde_json::json!(0.0)));
        let fifth = &records[5];
        assert_eq!(fifth.get("V0"), Some(&serde_json::json!(5.0)));
        assert_eq!(fifth.get("t"), Some(&serde_json::json!(0.05)));
    }
}
