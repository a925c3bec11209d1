//! Shared fixtures for the mock-backed integration tests.

#![allow(dead_code)]

use undertow::mock::MockDatabase;
use undertow::tests_cfg::blog_registry;
use undertow::{Database, Value};

pub const ARTICLE_COLUMNS: [&str; 7] = [
    "id",
    "title",
    "content",
    "author_id",
    "published_at",
    "is_published",
    "view_count",
];

pub const AUTHOR_COLUMNS: [&str; 3] = ["id", "name", "email"];

pub fn setup() -> (MockDatabase, Database) {
    let mock = MockDatabase::new();
    let db = mock.database(blog_registry());
    (mock, db)
}

pub fn article_row(id: i64, title: &str, author_id: Option<i64>, views: i64) -> Vec<Value> {
    vec![
        Value::BigInt(Some(id)),
        Value::from(title),
        Value::from(""),
        Value::BigInt(author_id),
        Value::ChronoDateTimeUtc(None),
        Value::Bool(Some(views > 0)),
        Value::BigInt(Some(views)),
    ]
}

pub fn author_row(id: i64, name: &str) -> Vec<Value> {
    vec![Value::BigInt(Some(id)), Value::from(name), Value::String(None)]
}

/// Script `rows` as the answer to the next article SELECT.
pub fn push_articles(mock: &MockDatabase, rows: Vec<Vec<Value>>) {
    mock.push_rows(&ARTICLE_COLUMNS, rows);
}
