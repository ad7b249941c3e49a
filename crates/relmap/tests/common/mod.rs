//! Shared test support: a scripted in-memory driver and fixture registries.
#![allow(dead_code)]

use relmap::{
    Cx, Dialect, Driver, EntityDef, Error, FieldCheck, FieldDef, KeySource, LinkTableDef,
    Outcome, Registry, RelationDef, RelationKind, Row, RuleDef, SqlType, Value,
};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// A registered canned-response handler: first handler whose needle appears
/// in the SQL wins.
type QueryHandler = Box<dyn Fn(&[Value]) -> Vec<Row> + Send>;

#[derive(Default)]
struct DriverState {
    statements: Vec<(String, Vec<Value>)>,
    query_handlers: Vec<(String, QueryHandler)>,
    query_failures: Vec<(String, Error)>,
    execute_results: Vec<(String, u64)>,
    next_id: i64,
}

/// Scripted in-memory driver: records every statement, answers queries from
/// registered handlers, and hands out sequential ids for inserts.
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState {
                next_id: 1,
                ..DriverState::default()
            })),
        }
    }

    /// Answer queries whose SQL contains `needle` with rows built from the
    /// bound parameters.
    pub fn on_query(&self, needle: &str, handler: impl Fn(&[Value]) -> Vec<Row> + Send + 'static) {
        self.state
            .lock()
            .unwrap()
            .query_handlers
            .push((needle.to_string(), Box::new(handler)));
    }

    /// Fail queries whose SQL contains `needle`.
    pub fn fail_query(&self, needle: &str, error: Error) {
        self.state
            .lock()
            .unwrap()
            .query_failures
            .push((needle.to_string(), error));
    }

    /// Override the rows-affected result for statements containing `needle`.
    pub fn on_execute(&self, needle: &str, affected: u64) {
        self.state
            .lock()
            .unwrap()
            .execute_results
            .push((needle.to_string(), affected));
    }

    /// Every statement issued, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .statements
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// How many issued statements contain `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.statements().iter().filter(|s| s.contains(needle)).count()
    }

    /// Index of the first statement containing `needle`.
    pub fn position_of(&self, needle: &str) -> Option<usize> {
        self.statements().iter().position(|s| s.contains(needle))
    }

    fn log(&self, sql: &str, params: &[Value]) {
        self.state
            .lock()
            .unwrap()
            .statements
            .push((sql.to_string(), params.to_vec()));
    }
}

impl Driver for MemoryDriver {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.log(sql, params);
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let guard = state.lock().unwrap();
            if let Some((_, error)) = guard.query_failures.iter().find(|(n, _)| sql.contains(n)) {
                return Outcome::Err(error.clone());
            }
            let rows = guard
                .query_handlers
                .iter()
                .find(|(n, _)| sql.contains(n))
                .map_or_else(Vec::new, |(_, handler)| handler(&params));
            Outcome::Ok(rows)
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.log(sql, params);
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        async move {
            let guard = state.lock().unwrap();
            let affected = guard
                .execute_results
                .iter()
                .find(|(n, _)| sql.contains(n))
                .map_or(1, |(_, n)| *n);
            Outcome::Ok(affected)
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.log(sql, params);
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().unwrap();
            let id = guard.next_id;
            guard.next_id += 1;
            Outcome::Ok(id)
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log("BEGIN", &[]);
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log("COMMIT", &[]);
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log("ROLLBACK", &[]);
        async { Outcome::Ok(()) }
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

/// Author / Book / Tag registry without reactive rules.
pub fn library_registry() -> Arc<Registry> {
    library_registry_with_rules(vec![])
}

/// Author / Book / Tag registry with the given reactive rules.
pub fn library_registry_with_rules(rules: Vec<RuleDef>) -> Arc<Registry> {
    Registry::build(
        vec![
            EntityDef::new("Author", "authors", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("name", SqlType::Text).check(FieldCheck::Required))
                .field(FieldDef::new("book_count", SqlType::Integer).nullable())
                .relation(
                    RelationDef::new("books", RelationKind::OneToMany, "Book")
                        .remote_fk("author_id")
                        .inverse("author")
                        .owns(),
                ),
            EntityDef::new("Book", "books", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("title", SqlType::Text))
                .field(FieldDef::new("price", SqlType::Integer).nullable())
                .field(FieldDef::new("author_id", SqlType::BigInt).nullable())
                .relation(
                    RelationDef::new("author", RelationKind::ManyToOne, "Author")
                        .fk_field("author_id")
                        .inverse("books"),
                )
                .relation(
                    RelationDef::new("tags", RelationKind::ManyToMany, "Tag")
                        .link(LinkTableDef::new("book_tags", "book_id", "tag_id"))
                        .inverse("books"),
                ),
            EntityDef::new("Tag", "tags", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("name", SqlType::Text))
                .relation(
                    RelationDef::new("books", RelationKind::ManyToMany, "Book")
                        .link(LinkTableDef::new("book_tags", "tag_id", "book_id"))
                        .inverse("tags"),
                ),
        ],
        rules,
    )
    .expect("library registry")
}

/// Versioned document registry for optimistic-lock tests.
pub fn doc_registry() -> Arc<Registry> {
    Registry::build(
        vec![
            EntityDef::new("Doc", "docs", "id")
                .key_source(KeySource::Driver)
                .version("version")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("body", SqlType::Text))
                .field(FieldDef::new("topic", SqlType::Text).nullable())
                .field(FieldDef::new("version", SqlType::BigInt).nullable()),
        ],
        vec![],
    )
    .expect("doc registry")
}

pub fn author_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["id".into(), "name".into(), "book_count".into()],
        vec![Value::BigInt(id), Value::Text(name.into()), Value::Null],
    )
}

pub fn book_row(id: i64, title: &str, price: Option<i32>, author: Option<i64>) -> Row {
    Row::new(
        vec![
            "id".into(),
            "title".into(),
            "price".into(),
            "author_id".into(),
        ],
        vec![
            Value::BigInt(id),
            Value::Text(title.into()),
            price.map_or(Value::Null, Value::Int),
            author.map_or(Value::Null, Value::BigInt),
        ],
    )
}

pub fn doc_row(id: i64, body: &str, version: i64) -> Row {
    Row::new(
        vec!["id".into(), "body".into(), "topic".into(), "version".into()],
        vec![
            Value::BigInt(id),
            Value::Text(body.into()),
            Value::Null,
            Value::BigInt(version),
        ],
    )
}

/// Run a future on a current-thread asupersync runtime.
pub fn run<T>(future: impl Future<Output = T>) -> T {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected error, got: {other:?}")),
    }
}
