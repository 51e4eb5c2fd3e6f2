//! Target table descriptors and key-source resolution.
//!
//! A [`TableSchema`] describes the derived table being populated: its full
//! name, heading, primary key, primary parents (with per-parent attribute
//! renaming for aliased foreign keys), and whether it is auto-populated.
//!
//! The key source - the relational expression whose rows become candidate
//! keys - is resolved here. By default it is the natural join of the
//! primary parents' primary-key projections, renaming where a foreign key
//! aliases an attribute. A user-supplied override replaces the default; in
//! either case the expression's heading must cover the target's full
//! primary key.

use typed_builder::TypedBuilder;

use crate::backend::{Backend, InsertMode};
use crate::error::PopulateError;
use crate::expr::{Expression, Row, TableRef};

/// A primary parent of a derived table.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ParentLink {
    /// The parent table.
    pub table: TableRef,
    /// The parent's primary key attributes.
    pub primary_key: Vec<String>,
    /// Attribute renames `(parent_attr, child_attr)` for aliased foreign
    /// keys. Empty when the child inherits parent attribute names.
    #[builder(default)]
    pub renames: Vec<(String, String)>,
}

impl ParentLink {
    /// The parent projected to its primary key, renamed into the child's
    /// attribute space where the foreign key aliases.
    fn projection(&self) -> Expression {
        let expr = Expression::from(self.table.clone());
        if self.renames.is_empty() {
            expr.project(&self.primary_key)
        } else {
            let attrs: Vec<(String, String)> = self
                .primary_key
                .iter()
                .map(|attr| {
                    let alias = self
                        .renames
                        .iter()
                        .find(|(source, _)| source == attr)
                        .map(|(_, alias)| alias.clone())
                        .unwrap_or_else(|| attr.clone());
                    (attr.clone(), alias)
                })
                .collect();
            expr.project_rename(&attrs)
        }
    }
}

/// Descriptor of a derived table.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TableSchema {
    /// Schema-qualified table name.
    pub name: String,
    /// All attributes, in declaration order.
    pub heading: Vec<String>,
    /// Primary-key attributes, in declaration order.
    pub primary_key: Vec<String>,
    /// Primary parents, in declaration order.
    #[builder(default)]
    pub parents: Vec<ParentLink>,
    /// Whether rows must originate from a make invocation.
    #[builder(default = true)]
    pub auto_populated: bool,
    /// User-supplied key source replacing the default construction.
    #[builder(default)]
    pub key_source: Option<Expression>,
}

impl TableSchema {
    /// This table as a relational expression source.
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            name: self.name.clone(),
            heading: self.heading.clone(),
        }
    }

    /// Resolve the key source for this table.
    ///
    /// With no override: the natural join of the primary parents' key
    /// projections, in declared order. Fails with a configuration error
    /// when the table has no primary parents, and with a schema error when
    /// the resulting heading does not cover the full primary key.
    pub fn key_source(&self) -> Result<Expression, PopulateError> {
        let expr = match &self.key_source {
            Some(custom) => custom.clone(),
            None => {
                let mut parents = self.parents.iter();
                let first = parents.next().ok_or_else(|| PopulateError::Configuration {
                    table: self.name.clone(),
                    reason: "auto-populated table has no primary parents and no key source"
                        .into(),
                })?;
                let mut expr = first.projection();
                for parent in parents {
                    expr = expr.join(parent.projection());
                }
                expr
            }
        };

        let heading = expr.heading();
        let missing: Vec<String> = self
            .primary_key
            .iter()
            .filter(|attr| !heading.contains(attr))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PopulateError::Schema {
                table: self.name.clone(),
                missing,
            });
        }
        Ok(expr)
    }

    /// Insert rows into this table from outside a make invocation.
    ///
    /// Auto-populated tables refuse this unless `allow_direct` is set:
    /// derived rows are supposed to originate from a make procedure, and
    /// the override exists for deliberate repairs only. Make procedures
    /// insert through their [`MakeContext`](crate::make::MakeContext)
    /// capability instead.
    pub async fn insert_into(
        &self,
        db: &dyn Backend,
        rows: &[Row],
        allow_direct: bool,
    ) -> Result<(), PopulateError> {
        if self.auto_populated && !allow_direct {
            return Err(PopulateError::DirectInsert {
                table: self.name.clone(),
            });
        }
        db.insert(&self.name, rows, InsertMode::Strict)
            .await
            .map_err(PopulateError::from)
    }
}
