//! Entity metadata: descriptors, fields, relations and the registry that owns them.
//!
//! Descriptors are built once, at registration, and shared read-only afterwards.

pub mod descriptor;
pub mod field;
pub mod registry;
pub mod relation;

pub use descriptor::{EntityBuilder, EntityDescriptor};
pub use field::{FieldDescriptor, FieldType};
pub use registry::{Entity, Registry, RegistryBuilder};
pub use relation::{RelationDescriptor, RelationKind, ThroughTable};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrmError;

    fn blog() -> RegistryBuilder {
        Registry::builder()
            .register(
                EntityBuilder::new("author", "blog_author")
                    .field(FieldDescriptor::auto_pk("id"))
                    .field(FieldDescriptor::new("name", FieldType::Text)),
            )
            .register(
                EntityBuilder::new("article", "blog_article")
                    .field(FieldDescriptor::auto_pk("id"))
                    .field(FieldDescriptor::new("title", FieldType::Text))
                    .field(FieldDescriptor::new("author_id", FieldType::BigInt).nullable())
                    .forward_one("author", "author", "author_id"),
            )
    }

    #[test]
    fn test_forward_relation_resolves_remote_pk() {
        let registry = blog().build().unwrap();
        let article = registry.get("article").unwrap();
        let author = article.relation("author").unwrap();
        assert_eq!(author.kind, RelationKind::ForwardOne);
        assert_eq!(author.local_column, "author_id");
        assert_eq!(author.remote_column, "id");
    }

    #[test]
    fn test_pk_alias() {
        let registry = blog().build().unwrap();
        let article = registry.get("article").unwrap();
        assert_eq!(article.field_index("pk"), Some(0));
        assert_eq!(article.primary_key().name, "id");
    }

    #[test]
    fn test_unknown_relation_target() {
        let err = Registry::builder()
            .register(
                EntityBuilder::new("article", "blog_article")
                    .field(FieldDescriptor::auto_pk("id"))
                    .field(FieldDescriptor::new("author_id", FieldType::BigInt))
                    .forward_one("author", "author", "author_id"),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryError(_)));
    }

    #[test]
    fn test_missing_primary_key() {
        let err = Registry::builder()
            .register(EntityBuilder::new("tag", "tag").field(FieldDescriptor::new("name", FieldType::Text)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn test_unknown_field_lists_choices() {
        let registry = blog().build().unwrap();
        let err = registry.get("article").unwrap().require_field("titel").unwrap_err();
        assert!(err.to_string().contains("title"));
        assert!(err.to_string().contains("author"));
    }
}
