//! Filter representation and SQL generation for relmap.
//!
//! `relmap-query` is the **query construction layer**. It owns the canonical
//! filter representation used by find operations (structure for batch-key
//! grouping, literals for parameterization), the SQL dialect handling, and
//! every statement builder the loader and flush orchestrator emit, including
//! the vectorized rewrite that folds a group of identically-shaped concurrent
//! finds into a single tagged statement.
//!
//! The resulting statements execute through the `Driver` trait from
//! `relmap-core`.

pub mod filter;
pub mod sql;
pub mod vectorize;

pub use filter::{CmpOp, Cond, Dir, Filter};
pub use sql::{
    Stmt, column_list, delete_by_keys, insert_returning, insert_row, link_delete,
    link_delete_for_owner, link_insert, null_fk, select_by_keys, select_filter, select_via_link,
    sequence_next, update_bulk, update_row,
};
pub use vectorize::{TAG_COLUMN, build_group, split_by_tag};
