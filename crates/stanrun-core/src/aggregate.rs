//! Merging per-chain result tables.
//!
//! Chains may report different row counts; they must report the same column
//! set. The merged table follows chain 0's column order and concatenates
//! values in chain order.

use crate::error::{ColumnSide, Result, StanError};
use crate::table::ResultTable;

/// Merge all columns of `tables` in chain order.
pub fn merge(tables: &[ResultTable]) -> Result<ResultTable> {
    check_columns(tables)?;
    let Some(first) = tables.first() else {
        return Ok(ResultTable::default());
    };
    let selected: Vec<&str> = first.columns().iter().map(String::as_str).collect();
    concat(tables, &selected)
}

/// Merge only the named columns. Duplicate names are ignored; the result
/// keeps chain 0's column order.
pub fn merge_columns<S: AsRef<str>>(tables: &[ResultTable], columns: &[S]) -> Result<ResultTable> {
    check_columns(tables)?;

    let first = tables.first();
    for name in columns {
        let name = name.as_ref();
        if !first.is_some_and(|t| t.contains(name)) {
            return Err(StanError::ColumnNotFound {
                column: name.to_string(),
            });
        }
    }

    let Some(first) = first else {
        return Ok(ResultTable::default());
    };
    let selected: Vec<&str> = first
        .columns()
        .iter()
        .map(String::as_str)
        .filter(|c| columns.iter().any(|w| w.as_ref() == *c))
        .collect();
    concat(tables, &selected)
}

/// Fail on the first column that differs between chain 0 and any later chain.
fn check_columns(tables: &[ResultTable]) -> Result<()> {
    let Some(first) = tables.first() else {
        return Ok(());
    };
    for (chain, table) in tables.iter().enumerate().skip(1) {
        if let Some(column) = first.columns().iter().find(|c| !table.contains(c)) {
            return Err(StanError::ColumnMismatch {
                column: column.clone(),
                chain,
                side: ColumnSide::Missing,
            });
        }
        if let Some(column) = table.columns().iter().find(|c| !first.contains(c)) {
            return Err(StanError::ColumnMismatch {
                column: column.clone(),
                chain,
                side: ColumnSide::Extra,
            });
        }
    }
    Ok(())
}

fn concat(tables: &[ResultTable], selected: &[&str]) -> Result<ResultTable> {
    let mut merged = ResultTable::new(selected.iter().copied())?;
    for (idx, name) in selected.iter().enumerate() {
        for (chain, table) in tables.iter().enumerate() {
            let values = table.column(name).ok_or_else(|| StanError::ColumnMismatch {
                column: name.to_string(),
                chain,
                side: ColumnSide::Missing,
            })?;
            merged.extend_column(idx, values);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(theta: Vec<f64>) -> ResultTable {
        let lp: Vec<f64> = theta.iter().map(|t| -t).collect();
        ResultTable::from_columns([("lp__", lp), ("theta", theta)]).unwrap()
    }

    #[test]
    fn test_merge_concatenates_in_chain_order() {
        let merged = merge(&[chain(vec![0.1, 0.2]), chain(vec![0.3]), chain(vec![0.4, 0.5])]).unwrap();
        assert_eq!(merged.columns(), &["lp__".to_string(), "theta".to_string()]);
        assert_eq!(merged.row_count(), 5);
        assert_eq!(merged.column("theta").unwrap(), &[0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(merged.column("lp__").unwrap(), &[-0.1, -0.2, -0.3, -0.4, -0.5]);
    }

    #[test]
    fn test_merge_follows_first_table_column_order() {
        let a = ResultTable::from_columns([("x", vec![1.0]), ("y", vec![2.0])]).unwrap();
        let b = ResultTable::from_columns([("y", vec![20.0]), ("x", vec![10.0])]).unwrap();
        let merged = merge(&[a, b]).unwrap();
        assert_eq!(merged.columns(), &["x".to_string(), "y".to_string()]);
        assert_eq!(merged.column("x").unwrap(), &[1.0, 10.0]);
        assert_eq!(merged.column("y").unwrap(), &[2.0, 20.0]);
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        let merged = merge(&[]).unwrap();
        assert_eq!(merged.column_count(), 0);
        assert_eq!(merged.row_count(), 0);
    }

    #[test]
    fn test_missing_lp_names_column_and_chain() {
        let without_lp = ResultTable::from_columns([("theta", vec![0.3])]).unwrap();
        let err = merge(&[chain(vec![0.1]), without_lp]).unwrap_err();
        match err {
            StanError::ColumnMismatch { column, chain, side } => {
                assert_eq!(column, "lp__");
                assert_eq!(chain, 1);
                assert_eq!(side, ColumnSide::Missing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extra_column_is_reported() {
        let extra = ResultTable::from_columns([
            ("lp__", vec![0.0]),
            ("theta", vec![0.0]),
            ("mu", vec![0.0]),
        ])
        .unwrap();
        let err = merge(&[chain(vec![0.1]), chain(vec![0.2]), extra]).unwrap_err();
        assert!(matches!(
            err,
            StanError::ColumnMismatch { ref column, chain: 2, side: ColumnSide::Extra } if column == "mu"
        ));
    }

    #[test]
    fn test_merge_columns_restricts_keys() {
        let tables = [chain(vec![0.1, 0.2]), chain(vec![0.3])];
        let subset = merge_columns(&tables, &["theta"]).unwrap();
        assert_eq!(subset.columns(), &["theta".to_string()]);
        assert_eq!(subset.column("theta"), merge(&tables).unwrap().column("theta"));
    }

    #[test]
    fn test_merge_columns_ignores_duplicates_and_keeps_order() {
        let tables = [chain(vec![0.1])];
        let subset = merge_columns(&tables, &["theta", "lp__", "theta"]).unwrap();
        assert_eq!(subset.columns(), &["lp__".to_string(), "theta".to_string()]);
    }

    #[test]
    fn test_merge_columns_unknown_fails() {
        let err = merge_columns(&[chain(vec![0.1])], &["theta", "mu"]).unwrap_err();
        assert!(matches!(err, StanError::ColumnNotFound { ref column } if column == "mu"));

        let err = merge_columns::<&str>(&[], &["theta"]).unwrap_err();
        assert!(matches!(err, StanError::ColumnNotFound { .. }));
    }

    #[test]
    fn test_empty_chains_merge_cleanly() {
        let empty = ResultTable::new(["lp__", "theta"]).unwrap();
        let merged = merge(&[empty.clone(), chain(vec![0.5]), empty]).unwrap();
        assert_eq!(merged.row_count(), 1);
    }
}
