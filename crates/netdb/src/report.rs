//! Report containers for view projections.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::Row;

/// A fetched projection: a header plus its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    header: Vec<String>,
    rows: Vec<Row>,
}

impl Report {
    pub(crate) fn new(header: Vec<String>, rows: Vec<Row>) -> Self {
        Self { header, rows }
    }

    /// Column names, in projection order.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// The fetched rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the report has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Renders the report as CSV lines, header first.
    ///
    /// Integers render bare, NULL renders empty, everything else is
    /// single-quoted.
    pub fn csv(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(self.header.join(","));
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(csv_field).collect();
            lines.push(fields.join(","));
        }
        lines
    }

    /// Renders in a named format. The structured report itself covers
    /// `native`, so only `csv` has a renderer.
    pub fn render(&self, format: &str) -> Result<Vec<String>> {
        match format {
            "csv" => Ok(self.csv()),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl IntoIterator for Report {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => format!("{}", *b as u8),
        Value::String(s) => format!("'{s}'"),
        other => format!("'{other}'"),
    }
}
