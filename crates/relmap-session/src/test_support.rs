//! Shared test fixtures for the session crate's unit tests.

use relmap_core::error::Error;
use relmap_core::meta::{EntityDef, FieldDef, Registry, RelationDef, RelationKind, SqlType};
use relmap_core::{Cx, Dialect, Driver, Outcome, Row, Value};
use std::future::Future;
use std::sync::Arc;

/// A driver that answers every query with no rows and every statement with
/// one affected row.
pub(crate) struct NullDriver;

impl Driver for NullDriver {
    fn query(
        &self,
        _cx: &Cx,
        _sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async { Outcome::Ok(vec![]) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        _sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async { Outcome::Ok(1) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        _sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        async { Outcome::Ok(1) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

/// Author / Book fixture registry.
pub(crate) fn fixture_registry() -> Arc<Registry> {
    Registry::build(
        vec![
            EntityDef::new("Author", "authors", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("name", SqlType::Text))
                .relation(
                    RelationDef::new("books", RelationKind::OneToMany, "Book")
                        .remote_fk("author_id")
                        .inverse("author")
                        .owns(),
                ),
            EntityDef::new("Book", "books", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("title", SqlType::Text))
                .field(FieldDef::new("author_id", SqlType::BigInt).nullable())
                .relation(
                    RelationDef::new("author", RelationKind::ManyToOne, "Author")
                        .fk_field("author_id")
                        .inverse("books"),
                ),
        ],
        vec![],
    )
    .expect("fixture registry")
}

/// Run a future on a current-thread asupersync runtime.
pub(crate) fn block_on<T>(future: impl Future<Output = T>) -> T {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}
