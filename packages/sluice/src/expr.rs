//! Relational expressions - the query side of the narrow storage interface.
//!
//! The engine never writes SQL. It composes [`Expression`] trees out of the
//! operations the population algebra needs - restriction, projection with
//! renaming, natural join, subtraction, and a server-side limit - and hands
//! them to a [`Backend`](crate::backend::Backend) for evaluation. SQL
//! backends render the tree to a `SELECT`; the in-memory backend evaluates
//! it directly.
//!
//! Expressions are cheap descriptions, not result sets: nothing touches the
//! database until a backend fetches them.

use serde_json::Value;
use std::collections::BTreeMap;

/// One fetched row: attribute name to value, iterated in sorted order.
pub type Row = BTreeMap<String, Value>;

/// A named stored table with a declared heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Schema-qualified table name.
    pub name: String,
    /// Attribute names, in declaration order.
    pub heading: Vec<String>,
}

impl TableRef {
    /// Declare a stored table.
    pub fn new(name: impl Into<String>, heading: &[&str]) -> Self {
        Self {
            name: name.into(),
            heading: heading.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// A predicate restricting an expression's rows.
///
/// Restrictions in a list are conjoined; an empty list restricts nothing.
#[derive(Debug, Clone)]
pub enum Restriction {
    /// Attribute equality, conjoined over the map. Attributes absent from
    /// the input heading are ignored, so a full key can restrict a
    /// projection of itself.
    Attrs(Row),
    /// Membership in a list of attribute maps (logical OR across entries).
    AnyOf(Vec<Row>),
    /// A raw predicate in the backend's native query language. Only SQL
    /// backends can evaluate this.
    Sql(String),
}

impl Restriction {
    /// Restrict by a single attribute value.
    pub fn eq(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut row = Row::new();
        row.insert(attr.into(), value.into());
        Restriction::Attrs(row)
    }
}

/// One output attribute of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedAttr {
    /// Attribute name in the input heading.
    pub source: String,
    /// Attribute name in the output heading.
    pub alias: String,
}

/// A lazily-evaluated relational expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A stored table.
    Table(TableRef),
    /// Rows of `input` satisfying every restriction.
    Restrict {
        input: Box<Expression>,
        restrictions: Vec<Restriction>,
    },
    /// `input` projected to the listed attributes, renaming where
    /// source and alias differ.
    Project {
        input: Box<Expression>,
        attrs: Vec<ProjectedAttr>,
    },
    /// Natural join on the shared attributes of both headings.
    Join {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Rows of `left` with no match in `right` on their shared attributes.
    Subtract {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// At most `n` rows of `input`, in whatever order the store returns.
    Limit { input: Box<Expression>, n: u64 },
}

impl From<TableRef> for Expression {
    fn from(table: TableRef) -> Self {
        Expression::Table(table)
    }
}

impl Expression {
    /// Restrict by a predicate.
    pub fn restrict(self, restriction: Restriction) -> Self {
        self.restrict_all(vec![restriction])
    }

    /// Restrict by the conjunction of predicates. An empty list is a no-op.
    pub fn restrict_all(self, restrictions: Vec<Restriction>) -> Self {
        if restrictions.is_empty() {
            return self;
        }
        Expression::Restrict {
            input: Box::new(self),
            restrictions,
        }
    }

    /// Project to the named attributes, unchanged.
    pub fn project(self, attrs: &[String]) -> Self {
        let attrs = attrs
            .iter()
            .map(|name| ProjectedAttr {
                source: name.clone(),
                alias: name.clone(),
            })
            .collect();
        Expression::Project {
            input: Box::new(self),
            attrs,
        }
    }

    /// Project with renaming: each pair is `(source, alias)`.
    pub fn project_rename(self, attrs: &[(String, String)]) -> Self {
        let attrs = attrs
            .iter()
            .map(|(source, alias)| ProjectedAttr {
                source: source.clone(),
                alias: alias.clone(),
            })
            .collect();
        Expression::Project {
            input: Box::new(self),
            attrs,
        }
    }

    /// Natural join with another expression.
    pub fn join(self, right: Expression) -> Self {
        Expression::Join {
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Set difference: rows of `self` with no match in `right` on shared
    /// attributes.
    pub fn subtract(self, right: Expression) -> Self {
        Expression::Subtract {
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Cap the result server-side.
    pub fn limit(self, n: u64) -> Self {
        Expression::Limit {
            input: Box::new(self),
            n,
        }
    }

    /// The output heading of this expression.
    pub fn heading(&self) -> Vec<String> {
        match self {
            Expression::Table(t) => t.heading.clone(),
            Expression::Restrict { input, .. } => input.heading(),
            Expression::Project { attrs, .. } => {
                attrs.iter().map(|a| a.alias.clone()).collect()
            }
            Expression::Join { left, right } => {
                let mut heading = left.heading();
                for attr in right.heading() {
                    if !heading.contains(&attr) {
                        heading.push(attr);
                    }
                }
                heading
            }
            Expression::Subtract { left, .. } => left.heading(),
            Expression::Limit { input, .. } => input.heading(),
        }
    }
}
