//! Identity-map and loader-coalescing behavior against a scripted driver.

mod common;

use common::{
    author_row, book_row, expect_err, library_registry, run, unwrap_outcome, MemoryDriver,
};
use relmap::{CmpOp, Cx, Dir, Error, Filter, Row, UnitOfWork, Value};
use std::sync::Arc;

/// Canned author table: answers by-key lookups for ids 1..=3.
fn stub_authors(driver: &MemoryDriver) {
    driver.on_query("FROM \"authors\"", |params| {
        params
            .iter()
            .filter_map(|p| match p {
                Value::BigInt(id @ 1..=3) => Some(author_row(*id, &format!("a{id}"))),
                _ => None,
            })
            .collect()
    });
}

#[test]
fn same_key_resolves_to_the_same_instance() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    stub_authors(&driver);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let first = uow.load("Author", 1_i64).unwrap();
        let second = uow.load("Author", 1_i64).unwrap();
        unwrap_outcome(uow.run_turn(&cx).await);

        let first = first.take().unwrap();
        let second = second.take().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A later turn resolves from the identity map without SQL.
        let third = unwrap_outcome(uow.get(&cx, "Author", 1_i64).await);
        assert!(Arc::ptr_eq(&first, &third));
    });
    assert_eq!(uow.driver().count_matching("FROM \"authors\""), 1);
}

#[test]
fn concurrent_loads_issue_one_statement_per_type() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    stub_authors(&driver);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let a = uow.load("Author", 1_i64).unwrap();
        let b = uow.load("Author", 2_i64).unwrap();
        let c = uow.load("Author", 3_i64).unwrap();
        let turn = unwrap_outcome(uow.run_turn(&cx).await);
        assert_eq!(turn.statements, 1);
        assert_eq!(turn.requests, 3);

        assert_eq!(
            uow.get_value(&a.take().unwrap(), "name").unwrap(),
            Value::Text("a1".into())
        );
        assert_eq!(
            uow.get_value(&b.take().unwrap(), "name").unwrap(),
            Value::Text("a2".into())
        );
        assert_eq!(
            uow.get_value(&c.take().unwrap(), "name").unwrap(),
            Value::Text("a3".into())
        );
    });
    assert_eq!(uow.driver().count_matching("FROM \"authors\""), 1);
}

#[test]
fn requests_in_different_turns_never_coalesce() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    stub_authors(&driver);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let a = uow.load("Author", 1_i64).unwrap();
        unwrap_outcome(uow.run_turn(&cx).await);
        a.take().unwrap();

        let b = uow.load("Author", 2_i64).unwrap();
        unwrap_outcome(uow.run_turn(&cx).await);
        b.take().unwrap();
    });
    assert_eq!(uow.driver().count_matching("FROM \"authors\""), 2);
}

#[test]
fn missing_key_reports_not_found_with_identity() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    stub_authors(&driver);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    let err = run(async { expect_err(uow.get(&cx, "Author", 99_i64).await) });
    match err {
        Error::NotFound { entity, key } => {
            assert_eq!(entity, "Author");
            assert_eq!(key, "99");
        }
        other => panic!("expected NotFound, got {other}"),
    }
}

#[test]
fn identical_filter_shapes_fold_into_one_statement() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    // Vectorized result rows carry the request tag.
    driver.on_query("JOIN \"books\"", |params| {
        // params: (tag, title) pairs.
        let mut rows = Vec::new();
        for pair in params.chunks(2) {
            let (Value::BigInt(tag), Value::Text(title)) = (&pair[0], &pair[1]) else {
                continue;
            };
            if title.as_str() != "missing" {
                let id = 10 + *tag;
                rows.push(Row::new(
                    vec![
                        "__req".into(),
                        "id".into(),
                        "title".into(),
                        "price".into(),
                        "author_id".into(),
                    ],
                    vec![
                        Value::BigInt(*tag),
                        Value::BigInt(id),
                        Value::Text(title.clone()),
                        Value::Null,
                        Value::Null,
                    ],
                ));
            }
        }
        rows
    });
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let b1 = uow.find("Book", Filter::new().eq("title", "b1")).unwrap();
        let b2 = uow.find("Book", Filter::new().eq("title", "b2")).unwrap();
        let none = uow
            .find("Book", Filter::new().eq("title", "missing"))
            .unwrap();
        let turn = unwrap_outcome(uow.run_turn(&cx).await);
        assert_eq!(turn.statements, 1);

        let b1 = b1.take().unwrap();
        assert_eq!(b1.len(), 1);
        assert_eq!(uow.get_value(&b1[0], "title").unwrap(), Value::Text("b1".into()));

        let b2 = b2.take().unwrap();
        assert_eq!(b2.len(), 1);
        assert_eq!(uow.get_value(&b2[0], "title").unwrap(), Value::Text("b2".into()));

        // Zero matches is a completed, empty result.
        assert!(none.take().unwrap().is_empty());
    });
    assert_eq!(uow.driver().count_matching("JOIN \"books\""), 1);
}

#[test]
fn non_vectorizable_operators_execute_individually() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"books\"", |_| vec![]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let a = uow
            .find(
                "Book",
                Filter::new().not_in("id", vec![Value::BigInt(1)]),
            )
            .unwrap();
        let b = uow
            .find(
                "Book",
                Filter::new().not_in("id", vec![Value::BigInt(2)]),
            )
            .unwrap();
        let turn = unwrap_outcome(uow.run_turn(&cx).await);
        assert_eq!(turn.statements, 2);
        assert!(a.take().unwrap().is_empty());
        assert!(b.take().unwrap().is_empty());
    });
    assert_eq!(uow.driver().count_matching("NOT IN"), 2);
}

#[test]
fn distinct_shapes_issue_one_statement_each() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"books\"", |_| vec![]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let by_title = uow.find("Book", Filter::new().eq("title", "x")).unwrap();
        let by_price = uow
            .find("Book", Filter::new().cmp("price", CmpOp::Gt, 10_i64))
            .unwrap();
        let ordered = uow
            .find(
                "Book",
                Filter::new().eq("title", "x").order_by("title", Dir::Asc),
            )
            .unwrap();
        let turn = unwrap_outcome(uow.run_turn(&cx).await);
        // Three distinct shapes, three statements, no more.
        assert_eq!(turn.statements, 3);
        by_title.take().unwrap();
        by_price.take().unwrap();
        ordered.take().unwrap();
    });
}

#[test]
fn result_not_available_before_the_turn() {
    let driver = MemoryDriver::new();
    let mut uow = UnitOfWork::new(library_registry(), driver);

    let handle = uow.load("Author", 1_i64).unwrap();
    assert!(!handle.ready());
    let err = handle.take().unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[test]
fn coalesced_error_reaches_every_request_in_the_batch() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    stub_authors(&driver);
    driver.fail_query("JOIN \"books\"", Error::driver("books table on fire"));
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let b1 = uow.find("Book", Filter::new().eq("title", "b1")).unwrap();
        let b2 = uow.find("Book", Filter::new().eq("title", "b2")).unwrap();
        let author = uow.load("Author", 1_i64).unwrap();
        unwrap_outcome(uow.run_turn(&cx).await);

        // Both coalesced requests share the failure.
        assert!(matches!(b1.take().unwrap_err(), Error::Driver(_)));
        assert!(matches!(b2.take().unwrap_err(), Error::Driver(_)));
        // The author batch is unaffected.
        assert!(author.take().is_ok());
    });
}

#[test]
fn find_through_relation_uses_a_subquery() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("IN (SELECT", |_| vec![book_row(11, "b1", None, Some(1))]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let books = unwrap_outcome(
            uow.find_all(
                &cx,
                "Book",
                Filter::new().related("author", Filter::new().eq("name", "a1")),
            )
            .await,
        );
        assert_eq!(books.len(), 1);
        assert_eq!(
            uow.get_value(&books[0], "title").unwrap(),
            Value::Text("b1".into())
        );
    });
    assert_eq!(uow.driver().count_matching("IN (SELECT \"id\" FROM \"authors\""), 1);
}
