//! Vectorized rewrite for coalesced find groups.
//!
//! Concurrent finds with the same vectorizable shape differ only in literal
//! values, so the whole group can run as one statement: the per-request
//! literals become rows of a `VALUES` derived table, each tagged with the
//! request's index, joined against the target table on the shape's
//! conditions. Every result row then carries the tag of the request it
//! satisfies, which is what lets the results be handed back per-request.
//!
//! Ordering is preserved per request by sorting on the tag first and the
//! requested order second; a request with zero matching rows simply has no
//! rows under its tag, which is distinguishable from "not yet run" at the
//! result-slot layer.

use crate::filter::{Cond, Filter};
use crate::sql::{Stmt, column_list};
use relmap_core::error::Result;
use relmap_core::meta::EntityMeta;
use relmap_core::{Dialect, Row, Value};

/// Column name carrying the request tag in vectorized results.
pub const TAG_COLUMN: &str = "__req";

/// Build the single tagged statement for a group of identically-shaped,
/// vectorizable filters.
///
/// All filters must share `shape.shape_key()`; the first filter supplies the
/// shape, each filter supplies one literal tuple.
pub fn build_group(dialect: Dialect, meta: &EntityMeta, filters: &[&Filter]) -> Result<Stmt> {
    debug_assert!(!filters.is_empty());
    let shape = filters[0];
    debug_assert!(shape.vectorizable());

    // One VALUES column per condition literal, plus the leading tag.
    let arg_count = shape.literals().len();
    let mut params: Vec<Value> = Vec::with_capacity(filters.len() * (arg_count + 1));
    let mut tuples: Vec<String> = Vec::with_capacity(filters.len());
    let mut idx = 1usize;
    for (tag, filter) in filters.iter().enumerate() {
        let mut slots = Vec::with_capacity(arg_count + 1);
        slots.push(dialect.placeholder(idx));
        idx += 1;
        params.push(Value::BigInt(tag as i64));
        for literal in filter.literals() {
            slots.push(dialect.placeholder(idx));
            idx += 1;
            params.push(literal);
        }
        tuples.push(format!("({})", slots.join(", ")));
    }

    let src_cols: Vec<String> = std::iter::once(TAG_COLUMN.to_string())
        .chain((0..arg_count).map(|i| format!("__a{}", i)))
        .map(|c| dialect.quote_identifier(&c))
        .collect();

    // Join conditions: each Cmp condition compares the target column against
    // its VALUES column.
    let mut joins = Vec::with_capacity(arg_count);
    let mut arg = 0usize;
    for cond in &shape.conds {
        if let Cond::Cmp { field, op, .. } = cond {
            let id = meta.field_or_err(field)?;
            joins.push(format!(
                "t.{} {} __v.{}",
                dialect.quote_identifier(meta.field_meta(id).column),
                op.as_sql(),
                dialect.quote_identifier(&format!("__a{}", arg))
            ));
            arg += 1;
        }
    }

    let mut order_parts = vec![format!("__v.{}", dialect.quote_identifier(TAG_COLUMN))];
    for (field, dir) in &shape.order {
        let id = meta.field_or_err(field)?;
        order_parts.push(format!(
            "t.{} {}",
            dialect.quote_identifier(meta.field_meta(id).column),
            dir.as_sql()
        ));
    }

    let sql = format!(
        "SELECT __v.{} AS {}, {} FROM (VALUES {}) AS __v({}) JOIN {} AS t ON {} ORDER BY {}",
        dialect.quote_identifier(TAG_COLUMN),
        dialect.quote_identifier(TAG_COLUMN),
        column_list(dialect, meta, Some("t")),
        tuples.join(", "),
        src_cols.join(", "),
        dialect.quote_identifier(meta.table),
        joins.join(" AND "),
        order_parts.join(", ")
    );

    Ok(Stmt { sql, params })
}

/// Partition the rows of a vectorized result by request tag.
///
/// Rows keep their relative order within each request, which together with
/// the tag-first ORDER BY preserves each request's requested ordering.
pub fn split_by_tag(rows: Vec<Row>, requests: usize) -> Vec<Vec<Row>> {
    let mut out: Vec<Vec<Row>> = (0..requests).map(|_| Vec::new()).collect();
    for row in rows {
        let tag = row
            .get_by_name(TAG_COLUMN)
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        if tag >= 0 && (tag as usize) < requests {
            out[tag as usize].push(row);
        } else {
            tracing::warn!(tag, "vectorized result row with out-of-range tag");
        }
    }
    out
}
