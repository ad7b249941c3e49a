//! Reactive graph: derived-field settlement, relation-path dependencies, and
//! aggregated validation.

mod common;

use common::{expect_err, library_registry_with_rules, run, unwrap_outcome, MemoryDriver};
use relmap::{
    Cx, EntityDef, Error, FieldDef, Registry, RuleDef, RulePath, SqlType, UnitOfWork, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Invoice with a chained derivation: amount -> tax -> total.
fn invoice_registry(
    tax_runs: Arc<AtomicUsize>,
    total_runs: Arc<AtomicUsize>,
) -> Arc<Registry> {
    Registry::build(
        vec![
            EntityDef::new("Invoice", "invoices", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("amount", SqlType::Integer).nullable())
                .field(FieldDef::new("tax", SqlType::Integer).nullable())
                .field(FieldDef::new("total", SqlType::Integer).nullable()),
        ],
        vec![
            RuleDef::derive(
                "Invoice",
                "calc_tax",
                "tax",
                vec![RulePath::field("amount")],
                move |view| {
                    tax_runs.fetch_add(1, Ordering::SeqCst);
                    let amount = view.value("amount")?.as_i64().unwrap_or(0);
                    Ok(Value::BigInt(amount / 10))
                },
            ),
            RuleDef::derive(
                "Invoice",
                "calc_total",
                "total",
                vec![RulePath::field("amount"), RulePath::field("tax")],
                move |view| {
                    total_runs.fetch_add(1, Ordering::SeqCst);
                    let amount = view.value("amount")?.as_i64().unwrap_or(0);
                    let tax = view.value("tax")?.as_i64().unwrap_or(0);
                    Ok(Value::BigInt(amount + tax))
                },
            ),
        ],
    )
    .expect("invoice registry")
}

#[test]
fn chained_derives_recompute_exactly_once_per_flush() {
    let cx = Cx::for_testing();
    let tax_runs = Arc::new(AtomicUsize::new(0));
    let total_runs = Arc::new(AtomicUsize::new(0));
    let registry = invoice_registry(Arc::clone(&tax_runs), Arc::clone(&total_runs));
    let mut uow = UnitOfWork::new(registry, MemoryDriver::new());

    run(async {
        let invoice = uow.create("Invoice").unwrap();
        uow.set(&invoice, "amount", 100_i64).unwrap();
        unwrap_outcome(uow.flush(&cx).await);

        // Settled in dependency order, each exactly once.
        assert_eq!(tax_runs.load(Ordering::SeqCst), 1);
        assert_eq!(total_runs.load(Ordering::SeqCst), 1);
        assert_eq!(uow.get_value(&invoice, "tax").unwrap(), Value::BigInt(10));
        assert_eq!(uow.get_value(&invoice, "total").unwrap(), Value::BigInt(110));

        // A flush with no intersecting change invokes nothing.
        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(tax_runs.load(Ordering::SeqCst), 1);
        assert_eq!(total_runs.load(Ordering::SeqCst), 1);

        // A new change settles again.
        uow.set(&invoice, "amount", 200_i64).unwrap();
        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(tax_runs.load(Ordering::SeqCst), 2);
        assert_eq!(total_runs.load(Ordering::SeqCst), 2);
        assert_eq!(uow.get_value(&invoice, "total").unwrap(), Value::BigInt(220));
    });
}

#[test]
fn setting_the_same_value_does_not_reinvoke_rules() {
    let cx = Cx::for_testing();
    let tax_runs = Arc::new(AtomicUsize::new(0));
    let total_runs = Arc::new(AtomicUsize::new(0));
    let registry = invoice_registry(Arc::clone(&tax_runs), Arc::clone(&total_runs));
    let mut uow = UnitOfWork::new(registry, MemoryDriver::new());

    run(async {
        let invoice = uow.create("Invoice").unwrap();
        uow.set(&invoice, "amount", 100_i64).unwrap();
        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(tax_runs.load(Ordering::SeqCst), 1);

        // Same value, different width: semantically a no-op.
        uow.set(&invoice, "amount", Value::Int(100)).unwrap();
        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(tax_runs.load(Ordering::SeqCst), 1);
        assert_eq!(total_runs.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn derived_field_follows_relation_paths() {
    let cx = Cx::for_testing();
    let runs = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&runs);
    let registry = library_registry_with_rules(vec![RuleDef::derive(
        "Author",
        "book_count",
        "book_count",
        vec![RulePath::parse("books.title")],
        move |view| {
            observer.fetch_add(1, Ordering::SeqCst);
            let books = view.related("books")?;
            Ok(Value::Int(books.len() as i32))
        },
    )]);
    let mut uow = UnitOfWork::new(registry, MemoryDriver::new());

    run(async {
        let author = uow.create("Author").unwrap();
        uow.set(&author, "name", "a1").unwrap();
        let b1 = uow.create("Book").unwrap();
        uow.set(&b1, "title", "b1").unwrap();
        uow.set_relation(&b1, "author", Some(&author)).unwrap();
        let b2 = uow.create("Book").unwrap();
        uow.set(&b2, "title", "b2").unwrap();
        uow.set_relation(&b2, "author", Some(&author)).unwrap();

        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(
            uow.get_value(&author, "book_count").unwrap(),
            Value::Int(2)
        );
        // Many triggering changes, one settled recomputation.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn validation_failures_are_aggregated_not_short_circuited() {
    let cx = Cx::for_testing();
    let registry = library_registry_with_rules(vec![RuleDef::validate(
        "Book",
        "title_not_empty",
        vec![RulePath::field("title")],
        |view| {
            let title = view.value("title")?;
            Ok(match title.as_str() {
                Some(t) if !t.is_empty() => None,
                _ => Some("title must not be empty".to_string()),
            })
        },
    )]);
    let mut uow = UnitOfWork::new(registry, MemoryDriver::new());

    run(async {
        let author = uow.create("Author").unwrap(); // name missing: field check
        let b1 = uow.create("Book").unwrap();
        uow.set(&b1, "title", "").unwrap();
        uow.set_relation(&b1, "author", Some(&author)).unwrap();
        let b2 = uow.create("Book").unwrap();
        uow.set(&b2, "title", "").unwrap();
        uow.set_relation(&b2, "author", Some(&author)).unwrap();

        let err = expect_err(uow.flush(&cx).await);
        let Error::Validation(report) = err else {
            panic!("expected validation failure");
        };

        let rule_failures = report
            .violations
            .iter()
            .filter(|v| v.rule == "title_not_empty")
            .count();
        let check_failures = report
            .violations
            .iter()
            .filter(|v| v.rule == "required" && v.entity == "Author")
            .count();
        assert_eq!(rule_failures, 2, "every violated rule is reported");
        assert_eq!(check_failures, 1);
    });
    // Aborted before any SQL.
    assert!(uow.driver().statements().is_empty());
}

#[test]
fn validation_runs_after_derivation_settles() {
    let cx = Cx::for_testing();
    let registry = Registry::build(
        vec![
            EntityDef::new("Invoice", "invoices", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("amount", SqlType::Integer).nullable())
                .field(FieldDef::new("total", SqlType::Integer).nullable()),
        ],
        vec![
            RuleDef::derive(
                "Invoice",
                "calc_total",
                "total",
                vec![RulePath::field("amount")],
                |view| {
                    let amount = view.value("amount")?.as_i64().unwrap_or(0);
                    Ok(Value::BigInt(amount * 2))
                },
            ),
            // Validates the *derived* value: only correct if it ran after
            // the derive settled.
            RuleDef::validate(
                "Invoice",
                "total_in_range",
                vec![RulePath::field("total")],
                |view| {
                    let total = view.value("total")?.as_i64().unwrap_or(0);
                    Ok(if total > 100 {
                        Some(format!("total {total} exceeds limit"))
                    } else {
                        None
                    })
                },
            ),
        ],
    )
    .expect("registry");
    let mut uow = UnitOfWork::new(registry, MemoryDriver::new());

    run(async {
        let ok = uow.create("Invoice").unwrap();
        uow.set(&ok, "amount", 10_i64).unwrap();
        unwrap_outcome(uow.flush(&cx).await);
        assert_eq!(uow.get_value(&ok, "total").unwrap(), Value::BigInt(20));

        let bad = uow.create("Invoice").unwrap();
        uow.set(&bad, "amount", 90_i64).unwrap();
        let err = expect_err(uow.flush(&cx).await);
        let Error::Validation(report) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(report.violations[0].rule, "total_in_range");
        assert!(report.violations[0].message.contains("180"));
    });
}
