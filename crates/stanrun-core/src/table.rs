//! Column-oriented results of a single chain and the CmdStan CSV parser.
//!
//! CmdStan writes `#`-prefixed comment blocks (configuration, adaptation,
//! timing) around a single header row of column names and one data row per
//! retained iteration. Comment lines may appear anywhere and are skipped.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, StanError};

/// Ordered columns of equal length, keyed by unique name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    columns: Vec<String>,
    values: Vec<Vec<f64>>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ResultTable {
    /// An empty table with the given column names.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Result<Self> {
        let mut table = ResultTable::default();
        for name in columns {
            table.add_column(name.into(), Vec::new())?;
        }
        Ok(table)
    }

    /// Build a table from `(name, values)` pairs; all columns must have the same length.
    pub fn from_columns<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, Vec<f64>)>,
    ) -> Result<Self> {
        let mut table = ResultTable::default();
        for (name, values) in columns {
            let name = name.into();
            if let Some(expected) = table.values.first().map(Vec::len) {
                if values.len() != expected {
                    return Err(StanError::RaggedTable {
                        column: name,
                        expected,
                        actual: values.len(),
                    });
                }
            }
            table.add_column(name, values)?;
        }
        Ok(table)
    }

    fn add_column(&mut self, name: String, values: Vec<f64>) -> Result<()> {
        if self.index.contains_key(&name) {
            return Err(StanError::DuplicateColumn { column: name });
        }
        self.index.insert(name.clone(), self.columns.len());
        self.columns.push(name);
        self.values.push(values);
        Ok(())
    }

    /// Append one row. Callers guarantee `row.len() == self.column_count()`.
    fn push_row(&mut self, row: Vec<f64>) {
        for (column, value) in self.values.iter_mut().zip(row) {
            column.push(value);
        }
    }

    /// Append `values` to the column at position `idx`.
    pub(crate) fn extend_column(&mut self, idx: usize, values: &[f64]) {
        self.values[idx].extend_from_slice(values);
    }

    /// Column names in file order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.index.get(name).map(|&i| self.values[i].as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows (0 for a table without columns).
    pub fn row_count(&self) -> usize {
        self.values.first().map(Vec::len).unwrap_or(0)
    }

    /// Iterate `(name, values)` in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.iter()
            .map(|(name, values)| (name.to_string(), values.to_vec()))
            .collect()
    }

    pub fn into_map(self) -> BTreeMap<String, Vec<f64>> {
        self.columns.into_iter().zip(self.values).collect()
    }

    /// Write the table as plain CSV (header row, then one row per iteration).
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let wrap = |err: csv::Error| StanError::Io {
            path: path.to_path_buf(),
            source: err.into(),
        };
        let mut writer = csv::WriterBuilder::new().from_path(path).map_err(wrap)?;
        writer.write_record(&self.columns).map_err(wrap)?;
        for row in 0..self.row_count() {
            writer
                .write_record(self.values.iter().map(|col| col[row].to_string()))
                .map_err(wrap)?;
        }
        writer.flush().map_err(StanError::io(path))
    }
}

/// Parse a CmdStan output CSV file.
pub fn parse_result_file(path: &Path) -> Result<ResultTable> {
    let file = std::fs::File::open(path).map_err(StanError::io(path))?;
    parse_result_reader(file, path)
}

/// Parse CmdStan output CSV from any reader; `source` is used in error messages.
///
/// Line numbers in errors are 1-based and count comment lines.
pub fn parse_result_reader<R: Read>(reader: R, source: &Path) -> Result<ResultTable> {
    let parse_err = |line: u64, reason: String| StanError::Parse {
        path: source.to_path_buf(),
        line,
        reason,
    };

    let mut table: Option<ResultTable> = None;

    for (idx, text) in BufReader::new(reader).lines().enumerate() {
        let line = idx as u64 + 1;
        let text = text.map_err(|e| parse_err(line, e.to_string()))?;
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();

        let Some(current) = table.as_mut() else {
            if let Some(empty) = fields.iter().position(|f| f.is_empty()) {
                return Err(parse_err(line, format!("header field {} is empty", empty + 1)));
            }
            let header = ResultTable::new(fields).map_err(|e| parse_err(line, e.to_string()))?;
            table = Some(header);
            continue;
        };

        if fields.len() != current.column_count() {
            return Err(parse_err(
                line,
                format!(
                    "expected {} fields, found {}",
                    current.column_count(),
                    fields.len()
                ),
            ));
        }

        let row = fields
            .iter()
            .zip(current.columns())
            .map(|(field, column)| {
                field.parse::<f64>().map_err(|_| {
                    parse_err(line, format!("column '{column}': '{field}' is not a number"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        current.push_row(row);
    }

    table.ok_or_else(|| parse_err(0, "no header row found".to_string()))
}
