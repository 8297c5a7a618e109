//! Opaque tabular rows whose schema is owned outside this crate.

use std::fmt;

/// Name and ordered column names of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub name: String,
    pub columns: Vec<String>,
}

impl TableLayout {
    pub fn new<I, C>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Position of the column named `column`, if the table has it.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }
}

/// One row of text cells, `None` standing for SQL `NULL`.
///
/// The cells may hold identifying data, so [`fmt::Debug`] only shows the row width.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RawRecord {
    pub values: Vec<Option<String>>,
}

impl RawRecord {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// Cell at `index`. `None` for null cells and for indices past the end of the row.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|value| value.as_deref())
    }
}

impl fmt::Debug for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecord")
            .field("width", &self.values.len())
            .finish_non_exhaustive()
    }
}
