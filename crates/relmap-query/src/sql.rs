//! SQL statement builders.
//!
//! All builders produce a `Stmt` (SQL text plus parameters) from resolved
//! metadata. Column lists are always explicit and in `FieldId` order so that
//! result ingestion is stable regardless of the store's column ordering.

use crate::filter::{Cond, Dir, Filter};
use relmap_core::error::{Error, Result};
use relmap_core::meta::{
    EntityId, EntityMeta, FieldId, LinkTableDef, Registry, RelationKind, RelationTarget,
};
use relmap_core::{Dialect, Value};

/// A parameterized SQL statement.
#[derive(Debug, Clone)]
pub struct Stmt {
    /// SQL text.
    pub sql: String,
    /// Bound parameters, in placeholder order.
    pub params: Vec<Value>,
}

/// Quoted, comma-separated column list for an entity, in `FieldId` order.
///
/// With `alias`, columns are prefixed (`t."id", t."title", …`).
pub fn column_list(dialect: Dialect, meta: &EntityMeta, alias: Option<&str>) -> String {
    meta.fields
        .iter()
        .map(|f| match alias {
            Some(a) => format!("{}.{}", a, dialect.quote_identifier(f.column)),
            None => dialect.quote_identifier(f.column),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT ... FROM t WHERE key IN (...)`, the by-id batch statement.
pub fn select_by_keys(dialect: Dialect, meta: &EntityMeta, keys: &[Value]) -> Stmt {
    let key_col = dialect.quote_identifier(meta.field_meta(meta.key).column);
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        column_list(dialect, meta, None),
        dialect.quote_identifier(meta.table),
        key_col,
        placeholders.join(", ")
    );
    Stmt {
        sql,
        params: keys.to_vec(),
    }
}

/// `SELECT … FROM t WHERE <filter> [ORDER BY …] [LIMIT n]`.
pub fn select_filter(
    dialect: Dialect,
    registry: &Registry,
    entity: EntityId,
    filter: &Filter,
) -> Result<Stmt> {
    let meta = registry.meta(entity);
    let mut params = Vec::new();
    let mut idx = 1usize;
    let conds = render_conds(dialect, registry, entity, filter, &mut params, &mut idx)?;

    let mut sql = format!(
        "SELECT {} FROM {}",
        column_list(dialect, meta, None),
        dialect.quote_identifier(meta.table)
    );
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    append_order(dialect, meta, &filter.order, None, &mut sql)?;
    if let Some(n) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    Ok(Stmt { sql, params })
}

fn append_order(
    dialect: Dialect,
    meta: &EntityMeta,
    order: &[(&'static str, Dir)],
    alias: Option<&str>,
    sql: &mut String,
) -> Result<()> {
    if order.is_empty() {
        return Ok(());
    }
    let mut parts = Vec::with_capacity(order.len());
    for (field, dir) in order {
        let id = meta.field_or_err(field)?;
        let col = dialect.quote_identifier(meta.field_meta(id).column);
        let col = match alias {
            Some(a) => format!("{}.{}", a, col),
            None => col,
        };
        parts.push(format!("{} {}", col, dir.as_sql()));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&parts.join(", "));
    Ok(())
}

fn render_conds(
    dialect: Dialect,
    registry: &Registry,
    entity: EntityId,
    filter: &Filter,
    params: &mut Vec<Value>,
    idx: &mut usize,
) -> Result<Vec<String>> {
    let meta = registry.meta(entity);
    let mut out = Vec::with_capacity(filter.conds.len());

    for cond in &filter.conds {
        match cond {
            Cond::Cmp { field, op, value } => {
                let id = meta.field_or_err(field)?;
                let col = dialect.quote_identifier(meta.field_meta(id).column);
                out.push(format!("{} {} {}", col, op.as_sql(), dialect.placeholder(*idx)));
                *idx += 1;
                params.push(value.clone());
            }
            Cond::In {
                field,
                values,
                negated,
            } => {
                let id = meta.field_or_err(field)?;
                let col = dialect.quote_identifier(meta.field_meta(id).column);
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        let p = dialect.placeholder(*idx);
                        *idx += 1;
                        params.push(v.clone());
                        p
                    })
                    .collect();
                let op = if *negated { "NOT IN" } else { "IN" };
                out.push(format!("{} {} ({})", col, op, placeholders.join(", ")));
            }
            Cond::Null { field, negated } => {
                let id = meta.field_or_err(field)?;
                let col = dialect.quote_identifier(meta.field_meta(id).column);
                let test = if *negated { "IS NOT NULL" } else { "IS NULL" };
                out.push(format!("{} {}", col, test));
            }
            Cond::Related { relation, filter } => {
                out.push(render_related(
                    dialect, registry, entity, relation, filter, params, idx,
                )?);
            }
        }
    }
    Ok(out)
}

/// Render a related condition as an IN-subquery against the target table.
fn render_related(
    dialect: Dialect,
    registry: &Registry,
    entity: EntityId,
    relation: &'static str,
    sub: &Filter,
    params: &mut Vec<Value>,
    idx: &mut usize,
) -> Result<String> {
    let meta = registry.meta(entity);
    let rid = meta.relation_or_err(relation)?;
    let rel = meta.relation_meta(rid);

    let RelationTarget::Single(target) = &rel.target else {
        return Err(Error::Metadata(format!(
            "cannot filter through polymorphic relation {}.{}",
            meta.name, relation
        )));
    };
    let target = *target;
    let target_meta = registry.meta(target);
    let target_key = dialect.quote_identifier(target_meta.field_meta(target_meta.key).column);
    let target_table = dialect.quote_identifier(target_meta.table);

    let sub_conds = render_conds(dialect, registry, target, sub, params, idx)?;
    let sub_where = if sub_conds.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", sub_conds.join(" AND "))
    };

    let key_col = dialect.quote_identifier(meta.field_meta(meta.key).column);
    match rel.kind {
        RelationKind::ManyToOne => {
            let fk = rel.fk_field.ok_or_else(|| {
                Error::Metadata(format!("relation {}.{} has no FK field", meta.name, relation))
            })?;
            let fk_col = dialect.quote_identifier(meta.field_meta(fk).column);
            Ok(format!(
                "{} IN (SELECT {} FROM {}{})",
                fk_col, target_key, target_table, sub_where
            ))
        }
        RelationKind::OneToMany => {
            let remote = rel.remote_fk.ok_or_else(|| {
                Error::Metadata(format!("relation {}.{} has no remote FK", meta.name, relation))
            })?;
            let remote_col = dialect.quote_identifier(target_meta.field_meta(remote).column);
            Ok(format!(
                "{} IN (SELECT {} FROM {}{})",
                key_col, remote_col, target_table, sub_where
            ))
        }
        RelationKind::OneToOne => {
            if let Some(fk) = rel.fk_field {
                let fk_col = dialect.quote_identifier(meta.field_meta(fk).column);
                Ok(format!(
                    "{} IN (SELECT {} FROM {}{})",
                    fk_col, target_key, target_table, sub_where
                ))
            } else {
                let remote = rel.remote_fk.ok_or_else(|| {
                    Error::Metadata(format!(
                        "relation {}.{} has neither FK side",
                        meta.name, relation
                    ))
                })?;
                let remote_col = dialect.quote_identifier(target_meta.field_meta(remote).column);
                Ok(format!(
                    "{} IN (SELECT {} FROM {}{})",
                    key_col, remote_col, target_table, sub_where
                ))
            }
        }
        RelationKind::ManyToMany => {
            let link = rel.link.ok_or_else(|| {
                Error::Metadata(format!("relation {}.{} has no link table", meta.name, relation))
            })?;
            Ok(format!(
                "{} IN (SELECT {} FROM {} WHERE {} IN (SELECT {} FROM {}{}))",
                key_col,
                dialect.quote_identifier(link.local_column),
                dialect.quote_identifier(link.table),
                dialect.quote_identifier(link.remote_column),
                target_key,
                target_table,
                sub_where
            ))
        }
    }
}

/// `INSERT INTO t (…) VALUES (…)` over an explicit column subset.
pub fn insert_row(
    dialect: Dialect,
    meta: &EntityMeta,
    cols: &[FieldId],
    values: Vec<Value>,
) -> Stmt {
    let col_list: Vec<String> = cols
        .iter()
        .map(|c| dialect.quote_identifier(meta.field_meta(*c).column))
        .collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_identifier(meta.table),
        col_list.join(", "),
        placeholders.join(", ")
    );
    Stmt {
        sql,
        params: values,
    }
}

/// Insert with the key echoed back, for driver-assigned keys.
pub fn insert_returning(
    dialect: Dialect,
    meta: &EntityMeta,
    cols: &[FieldId],
    values: Vec<Value>,
) -> Stmt {
    let mut stmt = insert_row(dialect, meta, cols, values);
    stmt.sql.push_str(&format!(
        " RETURNING {}",
        dialect.quote_identifier(meta.field_meta(meta.key).column)
    ));
    stmt
}

/// `UPDATE t SET … WHERE key = ? [AND version = ?]`.
///
/// When `version` is given, the old version value becomes a precondition and
/// the new value is included in the SET clause; zero rows affected then means
/// a stale write.
pub fn update_row(
    dialect: Dialect,
    meta: &EntityMeta,
    sets: &[(FieldId, Value)],
    key: Value,
    version: Option<(FieldId, Value, Value)>,
) -> Stmt {
    let mut params = Vec::new();
    let mut idx = 1usize;

    let mut set_parts: Vec<String> = Vec::with_capacity(sets.len() + 1);
    for (field, value) in sets {
        set_parts.push(format!(
            "{} = {}",
            dialect.quote_identifier(meta.field_meta(*field).column),
            dialect.placeholder(idx)
        ));
        idx += 1;
        params.push(value.clone());
    }
    if let Some((vfield, new_version, _)) = &version {
        set_parts.push(format!(
            "{} = {}",
            dialect.quote_identifier(meta.field_meta(*vfield).column),
            dialect.placeholder(idx)
        ));
        idx += 1;
        params.push(new_version.clone());
    }

    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        dialect.quote_identifier(meta.table),
        set_parts.join(", "),
        dialect.quote_identifier(meta.field_meta(meta.key).column),
        dialect.placeholder(idx)
    );
    idx += 1;
    params.push(key);

    if let Some((vfield, _, old_version)) = version {
        sql.push_str(&format!(
            " AND {} = {}",
            dialect.quote_identifier(meta.field_meta(vfield).column),
            dialect.placeholder(idx)
        ));
        params.push(old_version);
    }

    Stmt { sql, params }
}

/// Bulk update of the same column set across many rows of one type, via a
/// VALUES-join. Postgres only; other dialects fall back to per-row updates.
pub fn update_bulk(
    dialect: Dialect,
    meta: &EntityMeta,
    cols: &[FieldId],
    rows: &[(Value, Vec<Value>)],
) -> Option<Stmt> {
    if dialect != Dialect::Postgres || rows.len() < 2 {
        return None;
    }

    let mut params = Vec::new();
    let mut idx = 1usize;
    let mut tuples = Vec::with_capacity(rows.len());
    for (key, values) in rows {
        let mut slots = Vec::with_capacity(values.len() + 1);
        slots.push(dialect.placeholder(idx));
        idx += 1;
        params.push(key.clone());
        for v in values {
            slots.push(dialect.placeholder(idx));
            idx += 1;
            params.push(v.clone());
        }
        tuples.push(format!("({})", slots.join(", ")));
    }

    let key_col = dialect.quote_identifier(meta.field_meta(meta.key).column);
    let src_cols: Vec<String> = std::iter::once("__key".to_string())
        .chain(cols.iter().map(|c| format!("__c{}", c.0)))
        .map(|c| dialect.quote_identifier(&c))
        .collect();
    let sets: Vec<String> = cols
        .iter()
        .map(|c| {
            format!(
                "{} = __v.{}",
                dialect.quote_identifier(meta.field_meta(*c).column),
                dialect.quote_identifier(&format!("__c{}", c.0))
            )
        })
        .collect();

    let sql = format!(
        "UPDATE {} AS t SET {} FROM (VALUES {}) AS __v({}) WHERE t.{} = __v.{}",
        dialect.quote_identifier(meta.table),
        sets.join(", "),
        tuples.join(", "),
        src_cols.join(", "),
        key_col,
        dialect.quote_identifier("__key"),
    );
    Some(Stmt { sql, params })
}

/// `DELETE FROM t WHERE key IN (…)`.
pub fn delete_by_keys(dialect: Dialect, meta: &EntityMeta, keys: &[Value]) -> Stmt {
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        dialect.quote_identifier(meta.table),
        dialect.quote_identifier(meta.field_meta(meta.key).column),
        placeholders.join(", ")
    );
    Stmt {
        sql,
        params: keys.to_vec(),
    }
}

/// `UPDATE child SET fk = NULL WHERE fk IN (...)`: compensating relation
/// nulling before a parent delete.
pub fn null_fk(
    dialect: Dialect,
    child: &EntityMeta,
    fk: FieldId,
    parent_keys: &[Value],
) -> Stmt {
    let fk_col = dialect.quote_identifier(child.field_meta(fk).column);
    let placeholders: Vec<String> = (1..=parent_keys.len())
        .map(|i| dialect.placeholder(i))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} = NULL WHERE {} IN ({})",
        dialect.quote_identifier(child.table),
        fk_col,
        fk_col,
        placeholders.join(", ")
    );
    Stmt {
        sql,
        params: parent_keys.to_vec(),
    }
}

/// Insert one join-table row.
pub fn link_insert(dialect: Dialect, link: &LinkTableDef, local: Value, remote: Value) -> Stmt {
    let sql = format!(
        "INSERT INTO {} ({}, {}) VALUES ({}, {})",
        dialect.quote_identifier(link.table),
        dialect.quote_identifier(link.local_column),
        dialect.quote_identifier(link.remote_column),
        dialect.placeholder(1),
        dialect.placeholder(2)
    );
    Stmt {
        sql,
        params: vec![local, remote],
    }
}

/// Delete one join-table row.
pub fn link_delete(dialect: Dialect, link: &LinkTableDef, local: Value, remote: Value) -> Stmt {
    let sql = format!(
        "DELETE FROM {} WHERE {} = {} AND {} = {}",
        dialect.quote_identifier(link.table),
        dialect.quote_identifier(link.local_column),
        dialect.placeholder(1),
        dialect.quote_identifier(link.remote_column),
        dialect.placeholder(2)
    );
    Stmt {
        sql,
        params: vec![local, remote],
    }
}

/// Delete all join-table rows for a set of owners (cascade cleanup).
pub fn link_delete_for_owner(
    dialect: Dialect,
    link: &LinkTableDef,
    column: &str,
    keys: &[Value],
) -> Stmt {
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        dialect.quote_identifier(link.table),
        dialect.quote_identifier(column),
        placeholders.join(", ")
    );
    Stmt {
        sql,
        params: keys.to_vec(),
    }
}

/// Load the remote side of a many-to-many relation through its link table:
/// `SELECT t.… FROM target t JOIN link l ON t.key = l.remote WHERE l.local = ?`.
pub fn select_via_link(
    dialect: Dialect,
    target: &EntityMeta,
    link: &LinkTableDef,
    local_key: Value,
    order_by: Option<FieldId>,
) -> Stmt {
    let mut sql = format!(
        "SELECT {} FROM {} AS t JOIN {} AS l ON t.{} = l.{} WHERE l.{} = {}",
        column_list(dialect, target, Some("t")),
        dialect.quote_identifier(target.table),
        dialect.quote_identifier(link.table),
        dialect.quote_identifier(target.field_meta(target.key).column),
        dialect.quote_identifier(link.remote_column),
        dialect.quote_identifier(link.local_column),
        dialect.placeholder(1)
    );
    if let Some(field) = order_by {
        sql.push_str(&format!(
            " ORDER BY t.{} ASC",
            dialect.quote_identifier(target.field_meta(field).column)
        ));
    }
    Stmt {
        sql,
        params: vec![local_key],
    }
}

/// Allocate `n` keys from a sequence (the assign-identifiers pass).
pub fn sequence_next(dialect: Dialect, sequence: &str, n: usize) -> Stmt {
    let sql = match dialect {
        Dialect::Postgres => format!(
            "SELECT nextval('{}') FROM generate_series(1, {})",
            sequence, n
        ),
        // Without native sequences the driver is expected to emulate them
        // behind this statement shape.
        Dialect::Sqlite | Dialect::Mysql => {
            format!("SELECT nextval('{}') FROM generate_series(1, {})", sequence, n)
        }
    };
    Stmt {
        sql,
        params: vec![],
    }
}
