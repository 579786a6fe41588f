//! Row views: live, detached, and synthetic, plus the [`RowAdapter`] that
//! remaps a base row into nested scopes without copying column data.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::value::{require, FromValue, Value};

/// How a [`Row`] came to exist. Carried only so conversion errors can name
/// the row kind they happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Live,
    Detached,
    Synthetic,
}

impl RowKind {
    fn label(self) -> &'static str {
        match self {
            RowKind::Live => "live",
            RowKind::Detached => "detached",
            RowKind::Synthetic => "synthetic",
        }
    }
}

/// An immutable, detached or synthetic row: an ordered sequence of
/// `(column name, Value)` pairs plus a tree of named nested scopes.
///
/// There is no separate live-row type: [`crate::statement::Cursor::for_each_live`]
/// hands its callback a plain `&Row`, borrowed for the duration of one step,
/// built fresh from the statement's current column values each time.
#[derive(Debug, Clone)]
pub struct Row {
    kind: RowKind,
    columns: Vec<(String, Value)>,
    scopes: HashMap<String, Row>,
    prefetched: HashMap<String, Vec<Row>>,
}

impl PartialEq for Row {
    /// Column names compare case-insensitively, matching the lookup rules
    /// `value_named`/`require` use; column order and values still matter.
    fn eq(&self, other: &Self) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|((n1, v1), (n2, v2))| n1.eq_ignore_ascii_case(n2) && v1 == v2)
            && self.scopes == other.scopes
            && self.prefetched == other.prefetched
    }
}

impl Row {
    pub(crate) fn new(kind: RowKind, columns: Vec<(String, Value)>) -> Row {
        Row {
            kind,
            columns,
            scopes: HashMap::new(),
            prefetched: HashMap::new(),
        }
    }

    /// Builds a row from a mapping, not tied to any cursor.
    pub fn synthetic(columns: Vec<(String, Value)>) -> Row {
        Row::new(RowKind::Synthetic, columns)
    }

    pub(crate) fn with_scopes(mut self, scopes: HashMap<String, Row>) -> Row {
        self.scopes = scopes;
        self
    }

    pub(crate) fn set_prefetched(&mut self, key: String, rows: Vec<Row>) {
        self.prefetched.insert(key, rows);
    }

    /// Appends extra `(name, value)` pairs after the row's existing columns,
    /// keeping `scopes`/`prefetched`. Used by [`crate::query::prefetch`] to
    /// annotate each prefetched row with its pivot values.
    pub(crate) fn with_extra_columns(mut self, extra: Vec<(String, Value)>) -> Row {
        self.columns.extend(extra);
        self
    }

    pub fn count(&self) -> usize {
        self.columns.len()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// *optional dynamic*: `Some(value)` or `None` on `Null`. Panics
    /// (a programmer error) if `index` is out of range.
    pub fn value_at(&self, index: usize) -> Option<Value> {
        let value = &self
            .columns
            .get(index)
            .unwrap_or_else(|| panic!("column index {index} out of range"))
            .1;
        if value.is_null() {
            None
        } else {
            Some(value.clone())
        }
    }

    /// Case-insensitive lookup by name. A misspelled column is a
    /// programmer error, not a conversion failure.
    pub fn value_named(&self, name: &str) -> Option<Value> {
        let index = self
            .index_of(name)
            .unwrap_or_else(|| panic!("no column named `{name}` in this row"));
        self.value_at(index)
    }

    /// *optional typed*: `None` on `Null` or on a failed conversion.
    pub fn get<T: FromValue>(&self, index: usize) -> Option<T> {
        let (_, value) = self.columns.get(index)?;
        T::from_value(value)
    }

    /// *required typed*: a [`Error::Conversion`] on `Null` or failed
    /// conversion.
    pub fn require<T: FromValue>(&self, index: usize) -> Result<T, Error> {
        let (_, value) = self
            .columns
            .get(index)
            .unwrap_or_else(|| panic!("column index {index} out of range"));
        require(value, index, self.kind.label())
    }

    /// Returns the blob bytes at `index` without an intermediate `Value`
    /// allocation when the column is already a blob; falls back to the
    /// typed conversion path otherwise (e.g. reading text as bytes).
    pub fn data_no_copy_at(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).and_then(|(_, v)| v.as_bytes())
    }

    pub fn scope(&self, name: &str) -> Option<&Row> {
        self.scopes.get(name)
    }

    pub fn prefetched_rows(&self, key_path: &str) -> Option<&[Row]> {
        self.prefetched.get(key_path).map(Vec::as_slice)
    }

    pub fn copy(&self) -> Row {
        self.clone()
    }

    pub(crate) fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }
}

/// A `RowAdapter` rewrites a base row into a new column space without
/// copying data: it is a list of base-row indices (the new column order)
/// plus a tree of named nested adapters applied to the same base row.
#[derive(Debug, Clone)]
pub struct RowAdapter {
    /// Ordered base indices that make up the adapted row's own columns.
    mapping: Vec<usize>,
    /// Optional display name for each mapped column; defaults to the base
    /// row's own name when absent.
    names: Vec<Option<String>>,
    scopes: HashMap<String, Arc<RowAdapter>>,
}

impl RowAdapter {
    pub fn new(mapping: Vec<usize>) -> RowAdapter {
        let len = mapping.len();
        RowAdapter {
            mapping,
            names: vec![None; len],
            scopes: HashMap::new(),
        }
    }

    /// Canonical factory used by the query compiler to slice joined
    /// results: maps `start..end` of the base row 1:1.
    pub fn range(range: std::ops::Range<usize>) -> RowAdapter {
        RowAdapter::new(range.collect())
    }

    pub fn with_scopes(mut self, scopes: HashMap<String, RowAdapter>) -> RowAdapter {
        self.scopes = scopes.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        self
    }

    pub fn rename(mut self, index_in_mapping: usize, name: impl Into<String>) -> RowAdapter {
        self.names[index_in_mapping] = Some(name.into());
        self
    }

    /// Composes `self` after `other`: `other`'s output indices are
    /// reinterpreted as base indices for `self`.
    pub fn compose(&self, other: &RowAdapter) -> RowAdapter {
        let mapping = self
            .mapping
            .iter()
            .map(|&i| other.mapping[i])
            .collect::<Vec<_>>();
        RowAdapter {
            mapping,
            names: self.names.clone(),
            scopes: self.scopes.clone(),
        }
    }

    /// Applies this adapter to a base row, producing a new detached row
    /// whose count equals the mapping length.
    pub fn apply(&self, base: &Row) -> Row {
        let columns = self
            .mapping
            .iter()
            .enumerate()
            .map(|(i, &base_index)| {
                let (base_name, value) = &base.columns[base_index];
                let name = self.names[i].clone().unwrap_or_else(|| base_name.clone());
                (name, value.clone())
            })
            .collect();
        let scopes = self
            .scopes
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.apply(base)))
            .collect();
        Row::new(base.kind, columns).with_scopes(scopes)
    }
}
