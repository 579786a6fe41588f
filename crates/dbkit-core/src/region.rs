//! [`Region`]: the set of `(table, rowIds-or-all, columns)` triples a query
//! reads, or that a commit modifies. Closed under union and intersection;
//! used both to decide whether a committed event invalidates a cached
//! result and to scope invalidations precisely.

use std::collections::{HashMap, HashSet};

/// The rowId extent of a single table within a [`Region`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extent {
    /// Every row of the table is in scope.
    FullTable,
    /// Only these rowIds are in scope.
    RowIds(HashSet<i64>),
}

impl Extent {
    fn union(self, other: Extent) -> Extent {
        match (self, other) {
            (Extent::FullTable, _) | (_, Extent::FullTable) => Extent::FullTable,
            (Extent::RowIds(mut a), Extent::RowIds(b)) => {
                a.extend(b);
                Extent::RowIds(a)
            }
        }
    }

    fn intersect_rowids(&self, rowid: i64) -> bool {
        match self {
            Extent::FullTable => true,
            Extent::RowIds(ids) => ids.contains(&rowid),
        }
    }
}

/// A single table's observed extent plus the set of columns read from it.
/// An empty column set means "columns unknown/irrelevant" (e.g. a
/// `DELETE`/row-existence observation) and still matches on rowId alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegion {
    pub extent: Extent,
    pub columns: HashSet<String>,
}

/// A union of per-table entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    tables: HashMap<String, TableRegion>,
}

/// A single engine-reported row mutation, as delivered by the update hook.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub rowid: i64,
    pub columns: Option<Vec<String>>,
}

impl Region {
    pub fn empty() -> Region {
        Region::default()
    }

    pub fn full_table(table: impl Into<String>) -> Region {
        let mut tables = HashMap::new();
        tables.insert(
            table.into(),
            TableRegion {
                extent: Extent::FullTable,
                columns: HashSet::new(),
            },
        );
        Region { tables }
    }

    pub fn rows(table: impl Into<String>, rowids: impl IntoIterator<Item = i64>) -> Region {
        let mut tables = HashMap::new();
        tables.insert(
            table.into(),
            TableRegion {
                extent: Extent::RowIds(rowids.into_iter().collect()),
                columns: HashSet::new(),
            },
        );
        Region { tables }
    }

    pub fn with_columns(mut self, table: &str, columns: impl IntoIterator<Item = String>) -> Region {
        if let Some(entry) = self.tables.get_mut(table) {
            entry.columns.extend(columns);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Unions `other` into `self`; table extents union, column sets union.
    pub fn union(mut self, other: Region) -> Region {
        for (table, region) in other.tables {
            self.tables
                .entry(table)
                .and_modify(|existing| {
                    existing.extent = existing.extent.clone().union(region.extent.clone());
                    existing.columns.extend(region.columns.clone());
                })
                .or_insert(region);
        }
        self
    }

    /// Intersects this region down to the given rowIds for `table`,
    /// narrowing (never widening) its extent.
    pub fn intersect_with_rowids(mut self, table: &str, rowids: &HashSet<i64>) -> Region {
        if let Some(entry) = self.tables.get_mut(table) {
            entry.extent = match &entry.extent {
                Extent::FullTable => Extent::RowIds(rowids.clone()),
                Extent::RowIds(ids) => Extent::RowIds(ids.intersection(rowids).copied().collect()),
            };
        }
        self
    }

    /// Returns `true` if `event` touches any row/column this region cares
    /// about.
    pub fn is_modified_by(&self, event: &ChangeEvent) -> bool {
        let Some(entry) = self.tables.get(&event.table) else {
            return false;
        };
        if !entry.extent.intersect_rowids(event.rowid) {
            return false;
        }
        match &event.columns {
            None => true,
            Some(changed) => {
                entry.columns.is_empty() || changed.iter().any(|c| entry.columns.contains(c))
            }
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Whether `self` and `other` could both be affected by the same
    /// write: used by the observation engine, which tracks a whole
    /// transaction's writes as a `Region` rather than a stream of
    /// per-row events.
    pub fn intersects(&self, other: &Region) -> bool {
        for (table, mine) in &self.tables {
            let Some(theirs) = other.tables.get(table) else {
                continue;
            };
            let rows_intersect = match (&mine.extent, &theirs.extent) {
                (Extent::FullTable, _) | (_, Extent::FullTable) => true,
                (Extent::RowIds(a), Extent::RowIds(b)) => !a.is_disjoint(b),
            };
            if !rows_intersect {
                continue;
            }
            if mine.columns.is_empty() || theirs.columns.is_empty() || !mine.columns.is_disjoint(&theirs.columns) {
                return true;
            }
        }
        false
    }
}
