//! select_related joins and prefetch_related batch loading.

mod common;

use common::{article_row, author_row, push_articles, setup, ARTICLE_COLUMNS, AUTHOR_COLUMNS};
use undertow::{Related, Value, Q};

fn joined_labels() -> Vec<&'static str> {
    let mut labels = ARTICLE_COLUMNS.to_vec();
    labels.extend(["author__id", "author__name", "author__email"]);
    labels
}

#[tokio::test]
async fn test_select_related_attaches_author_in_one_query() {
    let (mock, db) = setup();
    let mut row = article_row(1, "Joined", Some(3), 1);
    row.extend(author_row(3, "Ada"));
    mock.push_rows(&joined_labels(), vec![row]);

    let articles = db
        .objects("article")
        .unwrap()
        .select_related(&["author"])
        .unwrap()
        .alist()
        .await
        .unwrap();
    let author = articles[0].related_one("author").unwrap().unwrap();
    assert_eq!(author.get_as::<String>("name").unwrap(), "Ada");
    assert_eq!(mock.statement_count(), 1);
    assert!(mock.sql_log()[0].contains("LEFT JOIN \"blog_author\""));
}

#[tokio::test]
async fn test_select_related_null_foreign_key_is_absent() {
    let (mock, db) = setup();
    let mut row = article_row(2, "Orphan", None, 0);
    row.extend([Value::BigInt(None), Value::String(None), Value::String(None)]);
    mock.push_rows(&joined_labels(), vec![row]);

    let article = db
        .objects("article")
        .unwrap()
        .select_related(&["author"])
        .unwrap()
        .aget_by(Q::new("id", 2))
        .await
        .unwrap();
    assert!(matches!(article.related("author"), Some(Related::Absent)));
    assert!(article.related_one("author").unwrap().is_none());
}

#[tokio::test]
async fn test_prefetch_reverse_relation() {
    let (mock, db) = setup();
    push_articles(&mock, vec![article_row(1, "One", None, 0), article_row(2, "Two", None, 0)]);
    mock.push_rows(
        &["id", "article_id", "body"],
        vec![
            vec![Value::BigInt(Some(10)), Value::BigInt(Some(1)), Value::from("first")],
            vec![Value::BigInt(Some(11)), Value::BigInt(Some(1)), Value::from("second")],
        ],
    );

    let articles = db
        .objects("article")
        .unwrap()
        .prefetch_related(&["comments"])
        .unwrap()
        .alist()
        .await
        .unwrap();
    assert_eq!(articles[0].related_many("comments").unwrap().len(), 2);
    assert!(articles[1].related_many("comments").unwrap().is_empty());

    let log = mock.sql_log();
    assert_eq!(log.len(), 2);
    assert!(log[1].contains("FROM \"blog_comment\""));
    assert!(log[1].contains("IN ($1, $2)"));
    assert_eq!(mock.peak_connections(), 1);
}

#[tokio::test]
async fn test_prefetch_forward_relation_deduplicates_keys() {
    let (mock, db) = setup();
    push_articles(
        &mock,
        vec![
            article_row(1, "One", Some(7), 0),
            article_row(2, "Two", Some(7), 0),
            article_row(3, "Three", None, 0),
        ],
    );
    mock.push_rows(&AUTHOR_COLUMNS, vec![author_row(7, "Grace")]);

    let articles = db
        .objects("article")
        .unwrap()
        .prefetch_related(&["author"])
        .unwrap()
        .alist()
        .await
        .unwrap();
    assert!(articles[0].related_one("author").unwrap().is_some());
    assert!(articles[1].related_one("author").unwrap().is_some());
    assert!(articles[2].related_one("author").unwrap().is_none());

    let prefetch = &mock.statements()[1];
    assert_eq!(prefetch.params, vec![Value::BigInt(Some(7))]);
}

#[tokio::test]
async fn test_prefetch_many_to_many() {
    let (mock, db) = setup();
    push_articles(&mock, vec![article_row(1, "One", None, 0), article_row(2, "Two", None, 0)]);
    mock.push_rows(
        &["article_id", "tag_id"],
        vec![
            vec![Value::BigInt(Some(1)), Value::BigInt(Some(5))],
            vec![Value::BigInt(Some(1)), Value::BigInt(Some(6))],
            vec![Value::BigInt(Some(2)), Value::BigInt(Some(5))],
        ],
    );
    mock.push_rows(
        &["id", "name"],
        vec![
            vec![Value::BigInt(Some(5)), Value::from("rust")],
            vec![Value::BigInt(Some(6)), Value::from("async")],
        ],
    );

    let articles = db
        .objects("article")
        .unwrap()
        .prefetch_related(&["tags"])
        .unwrap()
        .alist()
        .await
        .unwrap();
    assert_eq!(articles[0].related_many("tags").unwrap().len(), 2);
    assert_eq!(articles[1].related_many("tags").unwrap().len(), 1);

    let log = mock.sql_log();
    assert_eq!(log.len(), 3);
    assert!(log[1].contains("FROM \"blog_article_tags\""));
    assert!(log[2].contains("FROM \"blog_tag\""));
}

#[tokio::test]
async fn test_prefetch_nested_path() {
    let (mock, db) = setup();
    mock.push_rows(&AUTHOR_COLUMNS, vec![author_row(1, "Ada")]);
    push_articles(&mock, vec![article_row(4, "Post", Some(1), 0)]);
    mock.push_rows(
        &["id", "article_id", "body"],
        vec![vec![Value::BigInt(Some(9)), Value::BigInt(Some(4)), Value::from("hi")]],
    );

    let authors = db
        .objects("author")
        .unwrap()
        .prefetch_related(&["articles__comments"])
        .unwrap()
        .alist()
        .await
        .unwrap();
    let articles = authors[0].related_many("articles").unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].related_many("comments").unwrap().len(), 1);
    assert_eq!(mock.statement_count(), 3);
}

#[tokio::test]
async fn test_iterator_prefetches_per_chunk() {
    let (mock, db) = setup();
    push_articles(&mock, vec![article_row(1, "One", Some(7), 0), article_row(2, "Two", Some(7), 0)]);
    mock.push_rows(&AUTHOR_COLUMNS, vec![author_row(7, "Grace")]);
    mock.push_rows(&AUTHOR_COLUMNS, vec![author_row(7, "Grace")]);

    use futures::TryStreamExt;
    let records: Vec<_> = db
        .objects("article")
        .unwrap()
        .prefetch_related(&["author"])
        .unwrap()
        .aiterator(Some(1))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.related_one("author").unwrap().is_some()));
    assert_eq!(mock.statement_count(), 3);
    assert_eq!(mock.open_connections(), 0);
}

#[tokio::test]
async fn test_exclude_across_relation_keeps_articles_without_author() {
    let (mock, db) = setup();
    push_articles(&mock, vec![article_row(3, "C", None, 0)]);
    push_articles(&mock, vec![article_row(3, "C", None, 0)]);
    let articles = db.objects("article").unwrap();

    let by_name = articles.exclude(Q::new("author__name", "Ada")).unwrap().alist().await.unwrap();
    let by_id = articles.exclude(Q::new("author_id", 1)).unwrap().alist().await.unwrap();
    for rows in [&by_name, &by_id] {
        let titles: Vec<String> = rows.iter().map(|r| r.get_as("title").unwrap()).collect();
        assert_eq!(titles, vec!["C"]);
    }

    let log = mock.sql_log();
    assert!(log[0].contains("WHERE NOT (\"author\".\"name\" = $1 AND \"author\".\"name\" IS NOT NULL)"));
    assert!(log[1].contains(
        "WHERE NOT (\"blog_article\".\"author_id\" = $1 AND \"blog_article\".\"author_id\" IS NOT NULL)"
    ));
}

#[tokio::test]
async fn test_exclude_over_reverse_relation_uses_subquery() {
    let (mock, db) = setup();
    push_articles(&mock, vec![article_row(2, "quiet", None, 0)]);
    let clean = db
        .objects("article")
        .unwrap()
        .filter(Q::is_in("title", ["spammy", "quiet"]))
        .unwrap()
        .exclude(Q::new("comments__body", "spam"))
        .unwrap()
        .alist()
        .await
        .unwrap();
    assert_eq!(clean.len(), 1);

    let statement = &mock.statements()[0];
    assert!(statement.sql.contains(
        "NOT \"blog_article\".\"id\" IN (SELECT \"blog_article\".\"id\" FROM \"blog_article\" LEFT JOIN \"blog_comment\" AS \"comments\""
    ));
    // one row per article: the comment join lives only in the subquery
    assert_eq!(statement.sql.matches("LEFT JOIN").count(), 1);
    assert_eq!(
        statement.params,
        vec![Value::from("spammy"), Value::from("quiet"), Value::from("spam")]
    );
}
