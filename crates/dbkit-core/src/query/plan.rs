//! [`QueryPlan`]: the relational algebra tree clients build and the
//! compiler consumes. Associations form a directed tree, never a graph:
//! cyclic-looking associations in client code (`Author -> Books -> Author`)
//! still materialize as finite trees because every `joining`/`including`
//! is evaluated eagerly at plan-build time.

use crate::value::Value;

/// Where a relation's rows come from.
#[derive(Debug, Clone)]
pub enum Source {
    Table { name: String, alias: Option<String> },
    Subquery(Box<QueryPlan>),
}

/// A scalar expression over a relation's columns.
#[derive(Debug, Clone)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Aggregate(AggKind, Box<Expr>),
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggKind {
    pub(crate) fn sql_fn(self) -> &'static str {
        match self {
            AggKind::Count => "COUNT",
            AggKind::Sum => "SUM",
            AggKind::Avg => "AVG",
            AggKind::Min => "MIN",
            AggKind::Max => "MAX",
        }
    }

    pub(crate) fn default_key(self, key_singular: &str, column: &str) -> String {
        match self {
            AggKind::Count => format!("{key_singular}Count"),
            AggKind::Sum => format!("{key_singular}{column}Sum"),
            AggKind::Avg => format!("average{key_singular}{column}"),
            AggKind::Min => format!("min{key_singular}{column}"),
            AggKind::Max => format!("max{key_singular}{column}"),
        }
    }
}

/// One selected column or expression, with an optional explicit alias.
#[derive(Debug, Clone)]
pub struct Selectable {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Selectable {
    pub fn new(expr: Expr) -> Selectable {
        Selectable { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Selectable {
        Selectable {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A boolean condition over a relation's columns.
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    Gt(Expr, Expr),
    Lt(Expr, Expr),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Escape hatch for conditions the small algebra above doesn't model.
    Raw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub expr: Expr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Required,
    Optional,
}

/// A join child: how it relates to its parent's primary key, and whether
/// only its aggregate is wanted (`including(all:)`/association aggregates)
/// or its own rows should be fetched eagerly as a to-many ([`PrefetchDescriptor`]).
#[derive(Debug, Clone)]
pub struct Child {
    pub kind: JoinKind,
    pub plan: QueryPlan,
    /// `(parent column, child column)` foreign-key pair.
    pub foreign_key: (String, String),
}

/// Eager to-many association descriptor, resolved by
/// [`crate::query::prefetch`] after the parent result set is fetched.
#[derive(Debug, Clone)]
pub struct PrefetchDescriptor {
    pub association_name: String,
    pub child_table: String,
    /// Parent-side pivot columns.
    pub left_columns: Vec<String>,
    /// Child-side pivot columns, positionally matched to `left_columns`.
    pub pivot_columns: Vec<String>,
    pub child_plan: QueryPlan,
}

/// The relational algebra tree: a single [`Source`] plus everything that
/// shapes its emitted SQL.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub source: Source,
    pub selection: Vec<Selectable>,
    pub filters: Vec<Predicate>,
    pub orderings: Vec<OrderTerm>,
    pub grouping: Option<Vec<Expr>>,
    pub having: Vec<Predicate>,
    pub limit: Option<(u64, u64)>,
    /// Ordered `(key, child)` pairs — preserves the tree's child order, the
    /// way an ordered map would, without pulling in an extra dependency the
    /// teacher workspace doesn't already carry.
    pub joins: Vec<(String, Child)>,
    pub distinct: bool,
    pub prefetches: Vec<PrefetchDescriptor>,
}

impl QueryPlan {
    pub fn table(name: impl Into<String>) -> QueryPlan {
        QueryPlan {
            source: Source::Table {
                name: name.into(),
                alias: None,
            },
            selection: Vec::new(),
            filters: Vec::new(),
            orderings: Vec::new(),
            grouping: None,
            having: Vec::new(),
            limit: None,
            joins: Vec::new(),
            distinct: false,
            prefetches: Vec::new(),
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> QueryPlan {
        if let Source::Table { alias: slot, .. } = &mut self.source {
            *slot = Some(alias.into());
        }
        self
    }

    pub fn select(mut self, selection: Vec<Selectable>) -> QueryPlan {
        self.selection = selection;
        self
    }

    pub fn annotated_with(mut self, extra: Selectable) -> QueryPlan {
        self.selection.push(extra);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> QueryPlan {
        self.filters.push(predicate);
        self
    }

    pub fn group(mut self, expressions: Vec<Expr>) -> QueryPlan {
        self.grouping = Some(expressions);
        self
    }

    pub fn having(mut self, predicate: Predicate) -> QueryPlan {
        self.having.push(predicate);
        self
    }

    pub fn order(mut self, expr: Expr, direction: SortDirection) -> QueryPlan {
        self.orderings.push(OrderTerm { expr, direction });
        self
    }

    pub fn reversed(mut self) -> QueryPlan {
        for term in &mut self.orderings {
            term.direction = match term.direction {
                SortDirection::Asc => SortDirection::Desc,
                SortDirection::Desc => SortDirection::Asc,
            };
        }
        self
    }

    pub fn distinct(mut self) -> QueryPlan {
        self.distinct = true;
        self
    }

    pub fn limit(mut self, count: u64, offset: u64) -> QueryPlan {
        self.limit = Some((count, offset));
        self
    }

    /// Joins `key -> child` as required (INNER) or optional (LEFT).
    ///
    /// Chaining a required join behind an optional one is rejected at
    /// compile time (see [`crate::query::generator`]), not here, so plans
    /// stay easy to build incrementally and are only validated once.
    /// A second `joining` call under the same key merges with the
    /// existing child rather than shadowing it.
    pub fn joining(mut self, key: impl Into<String>, kind: JoinKind, child: Child) -> QueryPlan {
        let key = key.into();
        if let Some((_, existing)) = self.joins.iter_mut().find(|(k, _)| *k == key) {
            existing.plan.filters.extend(child.plan.filters);
            existing.plan.selection.extend(child.plan.selection);
        } else {
            self.joins.push((key, Child { kind, ..child }));
        }
        self
    }

    pub fn prefetch(mut self, descriptor: PrefetchDescriptor) -> QueryPlan {
        self.prefetches.push(descriptor);
        self
    }

    pub fn is_aggregated(&self) -> bool {
        self.grouping.is_some()
    }

    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }
}
