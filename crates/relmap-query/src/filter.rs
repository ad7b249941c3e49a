//! Filter representation for find operations.
//!
//! The core only needs a canonical, comparable representation of a filter's
//! *shape* (for batch-key grouping) and its literal values (for
//! parameterization); parsing any surface syntax is out of scope.
//!
//! A filter's shape is everything except the literal values: which fields are
//! constrained, by which operators, nested relation conditions, ordering, and
//! limit. Two concurrent finds with the same (entity, shape) are candidates
//! for coalescing into one statement.

use relmap_core::Value;
use std::fmt::Write as _;

/// Comparison operators taking exactly one literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// LIKE pattern
    Like,
}

impl CmpOp {
    /// SQL operator text.
    pub const fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Like => "LIKE",
        }
    }

    /// Canonical tag for shape keys.
    const fn tag(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Like => "like",
        }
    }
}

/// A single condition; conditions in a filter are implicitly ANDed.
#[derive(Debug, Clone)]
pub enum Cond {
    /// `field <op> literal`
    Cmp {
        /// Field name on the filtered entity.
        field: &'static str,
        /// Operator.
        op: CmpOp,
        /// The literal.
        value: Value,
    },
    /// `field IN (…)` / `field NOT IN (…)`
    In {
        /// Field name.
        field: &'static str,
        /// Membership set.
        values: Vec<Value>,
        /// NOT IN when true.
        negated: bool,
    },
    /// `field IS NULL` / `field IS NOT NULL`
    Null {
        /// Field name.
        field: &'static str,
        /// IS NOT NULL when true.
        negated: bool,
    },
    /// Condition on a related entity, rendered as an IN-subquery.
    Related {
        /// Relation name on the filtered entity.
        relation: &'static str,
        /// Filter applied to the related entity.
        filter: Filter,
    },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl Dir {
    /// SQL keyword.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Dir::Asc => "ASC",
            Dir::Desc => "DESC",
        }
    }
}

/// A find filter: ANDed conditions, optional ordering, optional limit.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Conditions, in declaration order.
    pub conds: Vec<Cond>,
    /// Order-by fields.
    pub order: Vec<(&'static str, Dir)>,
    /// Row limit.
    pub limit: Option<u64>,
}

impl Filter {
    /// An empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn eq(self, field: &'static str, value: impl Into<Value>) -> Self {
        self.cmp(field, CmpOp::Eq, value)
    }

    /// Add a comparison condition.
    #[must_use]
    pub fn cmp(mut self, field: &'static str, op: CmpOp, value: impl Into<Value>) -> Self {
        self.conds.push(Cond::Cmp {
            field,
            op,
            value: value.into(),
        });
        self
    }

    /// Add a membership condition.
    #[must_use]
    pub fn in_values(mut self, field: &'static str, values: Vec<Value>) -> Self {
        self.conds.push(Cond::In {
            field,
            values,
            negated: false,
        });
        self
    }

    /// Add a negated-membership condition.
    #[must_use]
    pub fn not_in(mut self, field: &'static str, values: Vec<Value>) -> Self {
        self.conds.push(Cond::In {
            field,
            values,
            negated: true,
        });
        self
    }

    /// Add an IS NULL condition.
    #[must_use]
    pub fn is_null(mut self, field: &'static str) -> Self {
        self.conds.push(Cond::Null {
            field,
            negated: false,
        });
        self
    }

    /// Add an IS NOT NULL condition.
    #[must_use]
    pub fn not_null(mut self, field: &'static str) -> Self {
        self.conds.push(Cond::Null {
            field,
            negated: true,
        });
        self
    }

    /// Add a condition on a related entity.
    #[must_use]
    pub fn related(mut self, relation: &'static str, filter: Filter) -> Self {
        self.conds.push(Cond::Related { relation, filter });
        self
    }

    /// Add an order-by field.
    #[must_use]
    pub fn order_by(mut self, field: &'static str, dir: Dir) -> Self {
        self.order.push((field, dir));
        self
    }

    /// Set a row limit.
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// The canonical shape key: the filter's structure with literals
    /// stripped. Filters with equal shape keys against the same entity are
    /// eligible for coalescing.
    pub fn shape_key(&self) -> String {
        let mut out = String::new();
        self.write_shape(&mut out);
        out
    }

    fn write_shape(&self, out: &mut String) {
        for (i, cond) in self.conds.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            match cond {
                Cond::Cmp { field, op, .. } => {
                    let _ = write!(out, "{}({})", op.tag(), field);
                }
                Cond::In {
                    field,
                    values,
                    negated,
                } => {
                    // Membership arity is part of the shape: IN with two
                    // values and IN with three are different statements.
                    let tag = if *negated { "notin" } else { "in" };
                    let _ = write!(out, "{}({},{})", tag, field, values.len());
                }
                Cond::Null { field, negated } => {
                    let tag = if *negated { "notnull" } else { "null" };
                    let _ = write!(out, "{}({})", tag, field);
                }
                Cond::Related { relation, filter } => {
                    let _ = write!(out, "rel({})", relation);
                    out.push('{');
                    filter.write_shape(out);
                    out.push('}');
                }
            }
        }
        for (field, dir) in &self.order {
            let _ = write!(out, "|order:{}:{}", field, dir.as_sql());
        }
        if let Some(n) = self.limit {
            let _ = write!(out, "|limit:{}", n);
        }
    }

    /// Can a group of filters with this shape be folded into a single tagged
    /// statement?
    ///
    /// Vectorization requires every condition to be a single-literal scalar
    /// comparison and at least one condition to exist. Negated membership,
    /// IN sets, NULL tests, nested relation conditions, and per-request
    /// limits all fall back to individual execution. A zero-condition find
    /// is deliberately not vectorized either: a plain statement is cheaper
    /// than a tagged join.
    pub fn vectorizable(&self) -> bool {
        !self.conds.is_empty()
            && self.limit.is_none()
            && self
                .conds
                .iter()
                .all(|c| matches!(c, Cond::Cmp { .. }))
    }

    /// The literal values of the vectorizable conditions, in condition
    /// order. Only meaningful when `vectorizable()` holds.
    pub fn literals(&self) -> Vec<Value> {
        self.conds
            .iter()
            .filter_map(|c| match c {
                Cond::Cmp { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_structure_same_shape() {
        let a = Filter::new().eq("title", "b1").order_by("title", Dir::Asc);
        let b = Filter::new().eq("title", "zzz").order_by("title", Dir::Asc);
        assert_eq!(a.shape_key(), b.shape_key());
    }

    #[test]
    fn different_structure_different_shape() {
        let a = Filter::new().eq("title", "b1");
        let b = Filter::new().eq("name", "b1");
        let c = Filter::new().cmp("title", CmpOp::Gt, "b1");
        assert_ne!(a.shape_key(), b.shape_key());
        assert_ne!(a.shape_key(), c.shape_key());
    }

    #[test]
    fn in_arity_is_part_of_shape() {
        let two = Filter::new().in_values("id", vec![Value::BigInt(1), Value::BigInt(2)]);
        let three = Filter::new().in_values(
            "id",
            vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)],
        );
        assert_ne!(two.shape_key(), three.shape_key());
    }

    #[test]
    fn related_shape_nests() {
        let a = Filter::new().related("author", Filter::new().eq("name", "a1"));
        let b = Filter::new().related("author", Filter::new().eq("name", "other"));
        assert_eq!(a.shape_key(), b.shape_key());
        assert!(a.shape_key().contains("rel(author)"));
    }

    #[test]
    fn vectorizability() {
        assert!(Filter::new().eq("title", "x").vectorizable());
        assert!(
            Filter::new()
                .eq("title", "x")
                .cmp("price", CmpOp::Gt, 10_i64)
                .order_by("title", Dir::Asc)
                .vectorizable()
        );

        // The deliberate exclusions.
        assert!(!Filter::new().vectorizable());
        assert!(!Filter::new().eq("a", 1_i64).limit(5).vectorizable());
        assert!(
            !Filter::new()
                .not_in("id", vec![Value::BigInt(1)])
                .vectorizable()
        );
        assert!(!Filter::new().is_null("author_id").vectorizable());
        assert!(
            !Filter::new()
                .related("author", Filter::new().eq("name", "a"))
                .vectorizable()
        );
    }

    #[test]
    fn literals_in_condition_order() {
        let f = Filter::new()
            .eq("title", "x")
            .cmp("price", CmpOp::Gt, 10_i64);
        assert_eq!(
            f.literals(),
            vec![Value::Text("x".into()), Value::BigInt(10)]
        );
    }
}
