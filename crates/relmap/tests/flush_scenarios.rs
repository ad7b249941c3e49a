//! Flush orchestration: ordering, no-op suppression, validation gating,
//! optimistic locking, and join-row staging.

mod common;

use common::{
    author_row, book_row, doc_registry, doc_row, expect_err, library_registry, run,
    unwrap_outcome, MemoryDriver,
};
use relmap::{Cx, Error, Filter, FlushState, HookPoint, Lifecycle, UnitOfWork, Value};

#[test]
fn author_before_book_in_one_transaction() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = uow.create("Author").unwrap();
        uow.set(&author, "name", "a1").unwrap();
        let book = uow.create("Book").unwrap();
        uow.set(&book, "title", "b1").unwrap();
        uow.set_relation(&book, "author", Some(&author)).unwrap();

        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.inserted, 2);
        assert_eq!(uow.state(), FlushState::Committed);

        // Keys assigned by the driver, FK resolved from the relation.
        assert_eq!(uow.get_value(&author, "id").unwrap(), Value::BigInt(1));
        assert_eq!(uow.get_value(&book, "id").unwrap(), Value::BigInt(2));
        assert_eq!(uow.get_value(&book, "author_id").unwrap(), Value::BigInt(1));
        assert_eq!(author.lifecycle(), Lifecycle::Persisted);
        assert_eq!(book.lifecycle(), Lifecycle::Persisted);
    });

    let driver = uow.driver();
    let begin = driver.position_of("BEGIN").unwrap();
    let authors = driver.position_of("INSERT INTO \"authors\"").unwrap();
    let books = driver.position_of("INSERT INTO \"books\"").unwrap();
    let commit = driver.position_of("COMMIT").unwrap();
    assert!(begin < authors);
    assert!(authors < books);
    assert!(books < commit);
    // Exactly one flush transaction with exactly two inserts.
    assert_eq!(driver.count_matching("BEGIN"), 1);
    assert_eq!(driver.count_matching("INSERT INTO"), 2);
}

#[test]
fn book_found_through_author_name_in_fresh_unit_of_work() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("IN (SELECT", |_| vec![book_row(2, "b1", None, Some(1))]);
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
}

#[test]
fn fields_set_back_to_original_issue_zero_sql() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"authors\"", |_| vec![author_row(1, "a1")]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = unwrap_outcome(uow.get(&cx, "Author", 1_i64).await);
        uow.set(&author, "name", "temporary").unwrap();
        uow.set(&author, "name", "a1").unwrap();

        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.updated, 0);
        assert_eq!(report.inserted, 0);
    });
    // Nothing to write means no transaction at all.
    assert_eq!(uow.driver().count_matching("BEGIN"), 0);
    assert_eq!(uow.driver().count_matching("UPDATE"), 0);
}

#[test]
fn setting_the_current_value_is_a_no_op() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"authors\"", |_| vec![author_row(1, "a1")]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = unwrap_outcome(uow.get(&cx, "Author", 1_i64).await);
        uow.set(&author, "name", "a1").unwrap();
        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.updated, 0);
    });
    assert_eq!(uow.driver().count_matching("UPDATE"), 0);
}

#[test]
fn update_writes_only_dirty_columns() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"authors\"", |_| vec![author_row(1, "a1")]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = unwrap_outcome(uow.get(&cx, "Author", 1_i64).await);
        uow.set(&author, "name", "renamed").unwrap();
        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.updated, 1);
    });

    let updates: Vec<String> = uow
        .driver()
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("UPDATE"))
        .collect();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].contains("\"name\""));
    assert!(!updates[0].contains("book_count"));
}

#[test]
fn validation_failure_aborts_before_any_sql() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let mut uow = UnitOfWork::new(library_registry(), driver);

    let author = run(async {
        let author = uow.create("Author").unwrap();
        // name stays NULL; the Required check must reject the flush.
        let err = expect_err(uow.flush(&cx).await);
        let Error::Validation(report) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, "required");
        assert_eq!(report.violations[0].entity, "Author");
        assert_eq!(uow.state(), FlushState::Failed);
        author
    });
    assert!(uow.driver().statements().is_empty());

    // Fully recoverable: fix the cause and retry.
    run(async {
        uow.set(&author, "name", "a1").unwrap();
        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.inserted, 1);
    });
}

#[test]
fn stale_write_fails_the_whole_flush() {
    let cx = Cx::for_testing();

    // Two units of work load the same row.
    let driver1 = MemoryDriver::new();
    driver1.on_query("FROM \"docs\"", |_| vec![doc_row(7, "draft", 3)]);
    let driver2 = MemoryDriver::new();
    driver2.on_query("FROM \"docs\"", |_| vec![doc_row(7, "draft", 3)]);
    // The second writer's precondition no longer matches.
    driver2.on_execute("UPDATE \"docs\"", 0);

    let mut uow1 = UnitOfWork::new(doc_registry(), driver1);
    let mut uow2 = UnitOfWork::new(doc_registry(), driver2);

    run(async {
        let doc1 = unwrap_outcome(uow1.get(&cx, "Doc", 7_i64).await);
        let doc2 = unwrap_outcome(uow2.get(&cx, "Doc", 7_i64).await);

        uow1.set(&doc1, "body", "first writer").unwrap();
        // The second writer touches a different field; staleness is about
        // the row, not the columns.
        uow2.set(&doc2, "topic", "second writer").unwrap();

        let report = unwrap_outcome(uow1.flush(&cx).await);
        assert_eq!(report.updated, 1);

        let err = expect_err(uow2.flush(&cx).await);
        match err {
            Error::StaleWrite { entity, key } => {
                assert_eq!(entity, "Doc");
                assert_eq!(key, "7");
            }
            other => panic!("expected StaleWrite, got {other}"),
        }
        assert_eq!(uow2.state(), FlushState::Failed);
    });

    // The failed flush rolled back.
    assert_eq!(uow2.driver().count_matching("ROLLBACK"), 1);
    assert_eq!(uow2.driver().count_matching("COMMIT"), 0);
    // The winner bumped the version with a precondition on the old one.
    let update = uow1
        .driver()
        .statements()
        .into_iter()
        .find(|s| s.starts_with("UPDATE \"docs\""))
        .unwrap();
    assert!(update.contains("AND \"version\" ="));
}

#[test]
fn versioned_update_params_carry_old_and_new_version() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"docs\"", |_| vec![doc_row(7, "draft", 3)]);
    let mut uow = UnitOfWork::new(doc_registry(), driver);

    run(async {
        let doc = unwrap_outcome(uow.get(&cx, "Doc", 7_i64).await);
        uow.set(&doc, "body", "v2").unwrap();
        unwrap_outcome(uow.flush(&cx).await);
        // Baseline advanced: the next flush sees version 4 as original.
        assert_eq!(uow.get_value(&doc, "version").unwrap(), Value::BigInt(4));
    });
}

#[test]
fn staged_links_flush_as_join_rows() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"books\"", |_| vec![book_row(2, "b1", None, None)]);
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let book = unwrap_outcome(uow.get(&cx, "Book", 2_i64).await);
        let tag = uow.create("Tag").unwrap();
        uow.set(&tag, "name", "rust").unwrap();
        uow.link(&book, "tags", &tag).unwrap();

        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.link_rows, 1);
    });

    let driver = uow.driver();
    let tag_insert = driver.position_of("INSERT INTO \"tags\"").unwrap();
    let link_insert = driver.position_of("INSERT INTO \"book_tags\"").unwrap();
    assert!(tag_insert < link_insert);
}

#[test]
fn link_then_unlink_cancels_the_staged_row() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    driver.on_query("FROM \"books\"", |_| vec![book_row(2, "b1", None, None)]);
    driver.on_query("FROM \"tags\"", |_| {
        vec![relmap::Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::BigInt(5), Value::Text("rust".into())],
        )]
    });
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let book = unwrap_outcome(uow.get(&cx, "Book", 2_i64).await);
        let tag = unwrap_outcome(uow.get(&cx, "Tag", 5_i64).await);
        uow.link(&book, "tags", &tag).unwrap();
        uow.unlink(&book, "tags", &tag).unwrap();

        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.link_rows, 0);
    });
    assert_eq!(uow.driver().count_matching("book_tags"), 0);
}

#[test]
fn hooks_fire_in_order_and_may_mutate() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = uow.create("Author").unwrap();
        uow.set(&author, "name", "draft").unwrap();

        // A before-create hook may still mutate the entity; the mutation
        // lands in the INSERT.
        uow.on(HookPoint::BeforeCreate, |uow, event| {
            let entity = event.entity.as_ref().expect("per-entity hook");
            uow.set(entity, "name", "hooked")
        });
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observer = std::sync::Arc::clone(&fired);
        uow.on(HookPoint::AfterCommit, move |_, _| {
            observer.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(uow.get_value(&author, "name").unwrap(), Value::Text("hooked".into()));
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    });

    // The hooked value is what got inserted.
    let driver = uow.driver();
    let commit = driver.position_of("COMMIT").unwrap();
    let insert = driver.position_of("INSERT INTO \"authors\"").unwrap();
    assert!(insert < commit);
}

#[test]
fn created_and_deleted_in_one_session_issues_no_sql() {
    let cx = Cx::for_testing();
    let driver = MemoryDriver::new();
    let mut uow = UnitOfWork::new(library_registry(), driver);

    run(async {
        let author = uow.create("Author").unwrap();
        uow.set(&author, "name", "ephemeral").unwrap();
        unwrap_outcome(uow.delete(&cx, &author).await);

        let report = unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.deleted, 0);
    });
    assert!(uow.driver().statements().is_empty());
}
