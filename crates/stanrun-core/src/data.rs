//! Model input data and the CmdStan dump format.
//!
//! A [`DataBindings`] maps variable names to [`DataValue`]s. Bindings are
//! validated when they cross the serialization boundary ([`DataBindings::to_dump`]),
//! not when they are inserted, so callers can assemble them freely.
//!
//! The dump format written here is one declaration per line:
//!
//! ```text
//! N <- 5
//! y <- c(0, 0, 0, 1, 1)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StanError};

/// A single data value: a scalar or a one-dimensional numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl DataValue {
    /// Number of elements (1 for scalars).
    pub fn len(&self) -> usize {
        match self {
            DataValue::Scalar(_) => 1,
            DataValue::Array(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            DataValue::Scalar(v) => Some(*v),
            DataValue::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            DataValue::Scalar(_) => None,
            DataValue::Array(values) => Some(values),
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Scalar(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Scalar(v as f64)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        DataValue::Scalar(f64::from(v))
    }
}

impl From<Vec<f64>> for DataValue {
    fn from(v: Vec<f64>) -> Self {
        DataValue::Array(v)
    }
}

impl From<&[f64]> for DataValue {
    fn from(v: &[f64]) -> Self {
        DataValue::Array(v.to_vec())
    }
}

impl From<Vec<i64>> for DataValue {
    fn from(v: Vec<i64>) -> Self {
        DataValue::Array(v.into_iter().map(|x| x as f64).collect())
    }
}

impl From<Vec<i32>> for DataValue {
    fn from(v: Vec<i32>) -> Self {
        DataValue::Array(v.into_iter().map(f64::from).collect())
    }
}

/// Named input data for a model run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBindings {
    values: BTreeMap<String, DataValue>,
}

impl DataBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Insert a binding, returning the previous value for `name` if any.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<DataValue>,
    ) -> Option<DataValue> {
        self.values.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check every name is a legal Stan identifier.
    pub fn validate(&self) -> Result<()> {
        for name in self.values.keys() {
            validate_name(name)?;
        }
        Ok(())
    }

    /// Serialize to the dump format, validating names first.
    pub fn to_dump(&self) -> Result<String> {
        self.validate()?;
        let mut out = String::new();
        for (name, value) in &self.values {
            out.push_str(name);
            out.push_str(" <- ");
            match value {
                DataValue::Scalar(v) => out.push_str(&format_number(*v)),
                DataValue::Array(values) if values.is_empty() => out.push_str("integer(0)"),
                DataValue::Array(values) => {
                    let items: Vec<String> = values.iter().map(|v| format_number(*v)).collect();
                    out.push_str("c(");
                    out.push_str(&items.join(", "));
                    out.push(')');
                }
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse dump-format text.
    ///
    /// Accepts quoted or bare names, `c(...)` vectors spanning several lines,
    /// `integer(0)` / `double(0)` / `c()` for empty vectors, an optional `L`
    /// integer suffix and `Inf`, `-Inf`, `NaN`. Blank lines and `#` comments
    /// are skipped.
    pub fn from_dump(text: &str) -> Result<Self> {
        let mut bindings = DataBindings::new();
        let mut pending = String::new();
        let mut start_line = 0;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if pending.is_empty() {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                start_line = idx + 1;
            }
            if !pending.is_empty() {
                pending.push(' ');
            }
            pending.push_str(line);

            if paren_depth(&pending) > 0 || pending.ends_with("<-") {
                continue;
            }

            let (name, value) = parse_declaration(&pending, start_line)?;
            if bindings.values.insert(name.clone(), value).is_some() {
                return Err(StanError::DumpParse {
                    line: start_line,
                    reason: format!("duplicate declaration of '{name}'"),
                });
            }
            pending.clear();
        }

        if !pending.is_empty() {
            return Err(StanError::DumpParse {
                line: start_line,
                reason: "incomplete declaration at end of input".to_string(),
            });
        }

        Ok(bindings)
    }

    /// Write the dump form of these bindings to `path`.
    pub fn write_dump(&self, path: &Path) -> Result<()> {
        let text = self.to_dump()?;
        std::fs::write(path, text).map_err(StanError::io(path))
    }

    /// Read bindings from a dump file.
    pub fn read_dump(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(StanError::io(path))?;
        Self::from_dump(&text)
    }
}

impl<K: Into<String>, V: Into<DataValue>> FromIterator<(K, V)> for DataBindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bindings = DataBindings::new();
        for (k, v) in iter {
            bindings.insert(k, v);
        }
        bindings
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| StanError::InvalidData {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name must not be empty")),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(invalid("name must start with a letter"))
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("name may only contain letters, digits and '_'"));
    }
    if name.ends_with("__") {
        return Err(invalid("names ending in '__' are reserved"));
    }
    Ok(())
}

fn format_number(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        // Display gives the shortest round-trip form and prints integral values without a
        // fractional part, which CmdStan reads back as int.
        format!("{v}")
    }
}

fn paren_depth(text: &str) -> i32 {
    text.chars().fold(0, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    })
}

fn parse_declaration(decl: &str, line: usize) -> Result<(String, DataValue)> {
    let err = |reason: String| StanError::DumpParse { line, reason };

    let (lhs, rhs) = decl
        .split_once("<-")
        .ok_or_else(|| err(format!("expected '<-' in '{decl}'")))?;

    let name = lhs.trim().trim_matches('"').trim_matches('\'').to_string();
    validate_name(&name).map_err(|e| err(e.to_string()))?;

    let rhs = rhs.trim();
    let value = if let Some(body) = rhs.strip_prefix("c(").and_then(|r| r.strip_suffix(')')) {
        let body = body.trim();
        if body.is_empty() {
            DataValue::Array(Vec::new())
        } else {
            let values = body
                .split(',')
                .map(|tok| parse_number(tok).map_err(&err))
                .collect::<Result<Vec<f64>>>()?;
            DataValue::Array(values)
        }
    } else if rhs == "integer(0)" || rhs == "double(0)" || rhs == "numeric(0)" {
        DataValue::Array(Vec::new())
    } else if rhs.starts_with("structure(") {
        return Err(err(format!(
            "'{name}': multi-dimensional structures are not supported"
        )));
    } else {
        DataValue::Scalar(parse_number(rhs).map_err(&err)?)
    };

    Ok((name, value))
}

fn parse_number(token: &str) -> std::result::Result<f64, String> {
    let token = token.trim();
    let token = token.strip_suffix('L').unwrap_or(token);
    match token {
        "Inf" | "+Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" | "NA" => Ok(f64::NAN),
        _ => token
            .parse::<f64>()
            .map_err(|_| format!("'{token}' is not a number")),
    }
}
