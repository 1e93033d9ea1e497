//! Result set rendering
//!
//! Column names render as a bracketed list of quoted names (`['id', 'name']`)
//! and each row as a parenthesized tuple of literals (`(1, 'a')`). The plain
//! payload is the column list, a newline, then the rows; the structured
//! payload is a JSON object carrying the same two pieces as strings.

use crate::query::{ResultSet, Row, Scalar};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::fmt;

/// Outer shape of a formatted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `<columns>\n<rows>`
    Plain,
    /// `{"columns": "<columns>", "rows": "<rows>"}`
    Structured,
}

/// Renders result sets into a payload string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFormatter {
    shape: PayloadShape,
    row_separator: &'static str,
}

impl ResultFormatter {
    pub const fn new(shape: PayloadShape, row_separator: &'static str) -> Self {
        Self { shape, row_separator }
    }

    /// Formatter for `query_data` results: rows joined with `,`
    pub const fn for_query(shape: PayloadShape) -> Self {
        Self::new(shape, ",")
    }

    /// Formatter for schema and database listings
    pub const fn for_listing(shape: PayloadShape) -> Self {
        match shape {
            PayloadShape::Plain => Self::new(shape, "\n"),
            // rows are concatenated with no separator at all
            PayloadShape::Structured => Self::new(shape, ""),
        }
    }

    pub fn shape(&self) -> PayloadShape {
        self.shape
    }

    pub fn format(&self, result: &ResultSet) -> String {
        self.format_parts(&result.columns, &result.rows)
    }

    pub fn format_parts(&self, columns: &[String], rows: &[Row]) -> String {
        let columns = columns_repr(columns);
        let rows = rows
            .iter()
            .map(row_repr)
            .collect::<Vec<_>>()
            .join(self.row_separator);

        match self.shape {
            PayloadShape::Plain => format!("{}\n{}", columns, rows),
            PayloadShape::Structured => json!({
                "columns": columns,
                "rows": rows,
            })
            .to_string(),
        }
    }
}

/// `['a', 'b']`
pub fn columns_repr(columns: &[String]) -> String {
    let names = columns
        .iter()
        .map(|name| quote(name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{}]", names)
}

/// `(1, 'a', NULL)`
pub fn row_repr(row: &Row) -> String {
    let values = row
        .values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("({})", values)
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Bool(value) => write!(f, "{}", value),
            Scalar::Int(value) => write!(f, "{}", value),
            // keep a fractional part so floats never read as integers
            Scalar::Float(value) => write!(f, "{:?}", value),
            Scalar::Numeric(value) => write!(f, "{}", value),
            Scalar::Text(value) => write!(f, "{}", quote(value)),
            Scalar::Bytes(value) => write!(f, "{}", quote(&general_purpose::STANDARD.encode(value))),
            Scalar::Json(value) => write!(f, "{}", quote(&value.to_string())),
        }
    }
}
