//! Chain operations: immutability, composition and build-time validation.
//!
//! Nothing here touches the connection source; every assertion is on the
//! compiled SQL or on errors raised before execution.

mod common;

use common::setup;
use undertow::query::{Aggregate, Projection};
use undertow::{OrmError, Value, Q};

// ============================================================================
// Immutability
// ============================================================================

#[test]
fn test_chained_filters_equal_combined_filter() {
    let (_mock, db) = setup();
    let articles = db.objects("article").unwrap();
    let chained = articles
        .filter(Q::new("is_published", true))
        .unwrap()
        .filter(Q::new("view_count__gte", 10))
        .unwrap()
        .compiled()
        .unwrap();
    let combined = articles
        .filter(Q::new("is_published", true) & Q::new("view_count__gte", 10))
        .unwrap()
        .compiled()
        .unwrap();
    assert_eq!(chained.sql, combined.sql);
    assert_eq!(chained.params, combined.params);
}

#[test]
fn test_receiver_is_not_mutated() {
    let (_mock, db) = setup();
    let base = db.objects("article").unwrap().all();
    let before = base.compiled().unwrap();
    let _narrowed = base
        .filter(Q::new("title__startswith", "Rust"))
        .unwrap()
        .order_by(&["-view_count"])
        .unwrap()
        .slice(0, Some(5))
        .unwrap();
    let after = base.compiled().unwrap();
    assert_eq!(before.sql, after.sql);
    assert!(after.params.is_empty());
    assert!(!base.is_evaluated());
}

#[test]
fn test_branches_do_not_contaminate_each_other() {
    let (_mock, db) = setup();
    let base = db.objects("article").unwrap().filter(Q::new("is_published", true)).unwrap();
    let popular = base.filter(Q::new("view_count__gt", 100)).unwrap();
    let untitled = base.filter(Q::new("title", "")).unwrap();

    let popular_sql = popular.compiled().unwrap().sql;
    let untitled_sql = untitled.compiled().unwrap().sql;
    assert!(popular_sql.contains("\"view_count\" >"));
    assert!(!popular_sql.contains("\"title\" ="));
    assert!(untitled_sql.contains("\"title\" ="));
    assert!(!untitled_sql.contains("\"view_count\" >"));
    assert_eq!(base.compiled().unwrap().params, vec![Value::Bool(Some(true))]);
}

#[test]
fn test_clone_starts_unevaluated() {
    let (_mock, db) = setup();
    let qs = db.objects("tag").unwrap().all();
    let copy = qs.clone();
    assert_eq!(qs.compiled().unwrap().sql, copy.compiled().unwrap().sql);
    assert!(!copy.is_evaluated());
}

// ============================================================================
// Slicing and ordering
// ============================================================================

#[test]
fn test_slice_three_to_six() {
    let (_mock, db) = setup();
    let compiled = db
        .objects("article")
        .unwrap()
        .order_by(&["id"])
        .unwrap()
        .slice(3, Some(6))
        .unwrap()
        .compiled()
        .unwrap();
    assert!(compiled.sql.contains("LIMIT $1 OFFSET $2"));
    assert_eq!(
        compiled.params,
        vec![Value::BigUnsigned(Some(3)), Value::BigUnsigned(Some(3))]
    );
}

#[test]
fn test_negative_slice_is_rejected() {
    let (_mock, db) = setup();
    let articles = db.objects("article").unwrap();
    assert!(matches!(
        articles.slice(-1, None),
        Err(OrmError::InvalidQueryError(_))
    ));
    assert!(matches!(
        articles.slice(0, Some(-2)),
        Err(OrmError::InvalidQueryError(_))
    ));
}

#[test]
fn test_filter_after_slice_is_rejected() {
    let (_mock, db) = setup();
    let sliced = db.objects("article").unwrap().slice(0, Some(3)).unwrap();
    assert!(matches!(
        sliced.filter(Q::new("id", 1)),
        Err(OrmError::InvalidQueryError(_))
    ));
    assert!(matches!(
        sliced.order_by(&["title"]),
        Err(OrmError::InvalidQueryError(_))
    ));
}

#[test]
fn test_order_by_descending() {
    let (_mock, db) = setup();
    let compiled = db
        .objects("article")
        .unwrap()
        .order_by(&["-view_count"])
        .unwrap()
        .compiled()
        .unwrap();
    assert!(compiled
        .sql
        .ends_with("ORDER BY \"blog_article\".\"view_count\" DESC"));
}

#[test]
fn test_reverse_flips_ordering() {
    let (_mock, db) = setup();
    let compiled = db
        .objects("article")
        .unwrap()
        .order_by(&["-view_count", "title"])
        .unwrap()
        .reverse()
        .unwrap()
        .compiled()
        .unwrap();
    assert!(compiled.sql.contains(
        "ORDER BY \"blog_article\".\"view_count\" ASC, \"blog_article\".\"title\" DESC"
    ));
}

#[test]
fn test_order_by_unknown_field() {
    let (_mock, db) = setup();
    let err = db.objects("article").unwrap().order_by(&["-nope"]).unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryError(_)));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_unknown_lookup_path() {
    let (_mock, db) = setup();
    let err = db
        .objects("article")
        .unwrap()
        .filter(Q::new("author__nickname", "ada"))
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryError(_)));
}

#[test]
fn test_select_related_rejects_reverse_relations() {
    let (_mock, db) = setup();
    let err = db
        .objects("article")
        .unwrap()
        .select_related(&["comments"])
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryError(_)));
}

#[test]
fn test_values_list_flat_needs_one_field() {
    let (_mock, db) = setup();
    let articles = db.objects("article").unwrap();
    assert!(articles.values_list(&["id", "title"], true, false).is_err());
    assert!(articles.values_list(&["id"], true, true).is_err());
    let flat = articles.values_list(&["title"], true, false).unwrap();
    assert!(matches!(
        flat.spec().projection(),
        Projection::ValuesList { flat: true, .. }
    ));
}

#[test]
fn test_annotation_conflicting_with_field() {
    let (_mock, db) = setup();
    let err = db
        .objects("article")
        .unwrap()
        .annotate(&[("title", Aggregate::count("*"))])
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryError(_)));
}

#[test]
fn test_using_keeps_description() {
    let (_mock, db) = setup();
    let base = db.objects("article").unwrap().filter(Q::new("id", 1)).unwrap();
    let replica = base.using("replica");
    assert_eq!(replica.db_alias(), "replica");
    assert_eq!(base.db_alias(), "default");
    assert_eq!(base.compiled().unwrap().sql, replica.compiled().unwrap().sql);
}
