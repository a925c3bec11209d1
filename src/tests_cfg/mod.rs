//! Blog schema shared by unit and integration tests.
//!
//! ```text
//! author 1──* article *──* tag      (through blog_article_tags)
//!                │
//!                1──* comment
//! category (standalone, unique name)
//! ```

use crate::entity::{Entity, EntityBuilder, FieldDescriptor, FieldType, Registry, ThroughTable};

pub struct Author;

impl Entity for Author {
    const NAME: &'static str = "author";

    fn describe() -> EntityBuilder {
        EntityBuilder::new(Self::NAME, "blog_author")
            .field(FieldDescriptor::auto_pk("id"))
            .field(FieldDescriptor::new("name", FieldType::Text).unique())
            .field(FieldDescriptor::new("email", FieldType::Text).nullable())
            .reverse_many("articles", "article", "author_id")
    }
}

pub struct Article;

impl Entity for Article {
    const NAME: &'static str = "article";

    fn describe() -> EntityBuilder {
        EntityBuilder::new(Self::NAME, "blog_article")
            .field(FieldDescriptor::auto_pk("id"))
            .field(FieldDescriptor::new("title", FieldType::Text))
            .field(FieldDescriptor::new("content", FieldType::Text).default_value(""))
            .field(FieldDescriptor::new("author_id", FieldType::BigInt).nullable())
            .field(FieldDescriptor::new("published_at", FieldType::TimestampTz).nullable())
            .field(FieldDescriptor::new("is_published", FieldType::Bool).default_value(false))
            .field(FieldDescriptor::new("view_count", FieldType::BigInt).default_value(0i64))
            .forward_one("author", "author", "author_id")
            .reverse_many("comments", "comment", "article_id")
            .many_to_many(
                "tags",
                "tag",
                ThroughTable::new("blog_article_tags", "article_id", "tag_id"),
            )
    }
}

pub struct Comment;

impl Entity for Comment {
    const NAME: &'static str = "comment";

    fn describe() -> EntityBuilder {
        EntityBuilder::new(Self::NAME, "blog_comment")
            .field(FieldDescriptor::auto_pk("id"))
            .field(FieldDescriptor::new("article_id", FieldType::BigInt))
            .field(FieldDescriptor::new("body", FieldType::Text))
            .forward_one("article", "article", "article_id")
    }
}

pub struct Tag;

impl Entity for Tag {
    const NAME: &'static str = "tag";

    fn describe() -> EntityBuilder {
        EntityBuilder::new(Self::NAME, "blog_tag")
            .field(FieldDescriptor::auto_pk("id"))
            .field(FieldDescriptor::new("name", FieldType::Text).unique())
    }
}

pub struct Category;

impl Entity for Category {
    const NAME: &'static str = "category";

    fn describe() -> EntityBuilder {
        EntityBuilder::new(Self::NAME, "blog_category")
            .field(FieldDescriptor::auto_pk("id"))
            .field(FieldDescriptor::new("name", FieldType::Text).unique())
            .field(FieldDescriptor::new("description", FieldType::Text).nullable())
    }
}

/// Registry holding the blog schema.
pub fn blog_registry() -> Registry {
    Registry::builder()
        .entity::<Author>()
        .entity::<Article>()
        .entity::<Comment>()
        .entity::<Tag>()
        .entity::<Category>()
        .build()
        .expect("blog schema is valid")
}

/// DDL for the blog schema, used by the live PostgreSQL tests.
pub const BLOG_SCHEMA: &str = r#"
DROP TABLE IF EXISTS blog_article_tags, blog_comment, blog_article, blog_tag, blog_author, blog_category CASCADE;
CREATE TABLE blog_author (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE, email TEXT);
CREATE TABLE blog_article (
    id BIGSERIAL PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    author_id BIGINT REFERENCES blog_author(id),
    published_at TIMESTAMPTZ,
    is_published BOOLEAN NOT NULL DEFAULT FALSE,
    view_count BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE blog_comment (id BIGSERIAL PRIMARY KEY, article_id BIGINT NOT NULL REFERENCES blog_article(id), body TEXT NOT NULL);
CREATE TABLE blog_tag (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE);
CREATE TABLE blog_article_tags (
    id BIGSERIAL PRIMARY KEY,
    article_id BIGINT NOT NULL REFERENCES blog_article(id),
    tag_id BIGINT NOT NULL REFERENCES blog_tag(id)
);
CREATE TABLE blog_category (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE, description TEXT);
"#;
