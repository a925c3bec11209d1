//! Entity descriptors and their builder.

use crate::entity::field::FieldDescriptor;
use crate::entity::relation::{PendingRelation, RelationDescriptor, RelationKind, ThroughTable};
use crate::error::OrmError;

/// Declares an entity: its table, fields and relations.
///
/// # Example
///
/// ```rust
/// use undertow::entity::{EntityBuilder, FieldDescriptor, FieldType};
///
/// let article = EntityBuilder::new("article", "blog_article")
///     .field(FieldDescriptor::auto_pk("id"))
///     .field(FieldDescriptor::new("title", FieldType::Text))
///     .field(FieldDescriptor::new("author_id", FieldType::BigInt).nullable())
///     .forward_one("author", "author", "author_id")
///     .reverse_many("comments", "comment", "article_id");
/// ```
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    pub(crate) name: String,
    pub(crate) table_name: String,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) relations: Vec<PendingRelation>,
}

impl EntityBuilder {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Foreign key held by this entity (`fk_column`) pointing at `related`'s primary key.
    pub fn forward_one(
        mut self,
        name: impl Into<String>,
        related: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        self.relations.push(PendingRelation {
            name: name.into(),
            kind: RelationKind::ForwardOne,
            related_entity: related.into(),
            local_column: Some(fk_column.into()),
            remote_column: None,
            through: None,
        });
        self
    }

    /// Rows of `related` whose `remote_fk_column` points at this entity's primary key.
    pub fn reverse_many(
        mut self,
        name: impl Into<String>,
        related: impl Into<String>,
        remote_fk_column: impl Into<String>,
    ) -> Self {
        self.relations.push(PendingRelation {
            name: name.into(),
            kind: RelationKind::ReverseMany,
            related_entity: related.into(),
            local_column: None,
            remote_column: Some(remote_fk_column.into()),
            through: None,
        });
        self
    }

    /// Rows of `related` linked through an intermediate table.
    pub fn many_to_many(
        mut self,
        name: impl Into<String>,
        related: impl Into<String>,
        through: ThroughTable,
    ) -> Self {
        self.relations.push(PendingRelation {
            name: name.into(),
            kind: RelationKind::ManyToMany,
            related_entity: related.into(),
            local_column: None,
            remote_column: None,
            through: Some(through),
        });
        self
    }

    pub(crate) fn primary_key_column(&self) -> Result<&str, OrmError> {
        let mut pks = self.fields.iter().filter(|f| f.is_primary_key);
        match (pks.next(), pks.next()) {
            (Some(pk), None) => Ok(&pk.column),
            (None, _) => Err(OrmError::invalid(format!(
                "entity '{}' declares no primary key",
                self.name
            ))),
            (Some(_), Some(_)) => Err(OrmError::invalid(format!(
                "entity '{}' declares more than one primary key",
                self.name
            ))),
        }
    }
}

/// Immutable metadata for one entity type, shared by every query and record of that type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    name: String,
    table_name: String,
    fields: Vec<FieldDescriptor>,
    relations: Vec<RelationDescriptor>,
    pk_index: usize,
}

impl EntityDescriptor {
    pub(crate) fn new(
        name: String,
        table_name: String,
        fields: Vec<FieldDescriptor>,
        relations: Vec<RelationDescriptor>,
    ) -> Result<Self, OrmError> {
        let pk_index = fields
            .iter()
            .position(|f| f.is_primary_key)
            .ok_or_else(|| OrmError::invalid(format!("entity '{}' declares no primary key", name)))?;
        for (i, field) in fields.iter().enumerate() {
            if field.name == "pk" {
                return Err(OrmError::invalid(format!(
                    "entity '{}': 'pk' is reserved as the primary key alias",
                    name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(OrmError::invalid(format!(
                    "entity '{}' declares field '{}' twice",
                    name, field.name
                )));
            }
        }
        for relation in &relations {
            if fields.iter().any(|f| f.name == relation.name)
                || relations.iter().filter(|r| r.name == relation.name).count() > 1
            {
                return Err(OrmError::invalid(format!(
                    "entity '{}': relation name '{}' clashes with another field or relation",
                    name, relation.name
                )));
            }
        }
        Ok(Self {
            name,
            table_name,
            fields,
            relations,
            pk_index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    pub fn primary_key(&self) -> &FieldDescriptor {
        &self.fields[self.pk_index]
    }

    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    /// Index of a field by name; `pk` resolves to the primary key.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        if name == "pk" {
            return Some(self.pk_index);
        }
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    /// Like [`field_index`](Self::field_index) but reports unknown names as an invalid query.
    pub fn require_field(&self, name: &str) -> Result<usize, OrmError> {
        self.field_index(name).ok_or_else(|| {
            OrmError::invalid(format!(
                "Cannot resolve keyword '{}' into field of '{}'. Choices are: {}",
                name,
                self.name,
                self.choices().join(", ")
            ))
        })
    }

    pub fn field_by_column(&self, column: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.column == column)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    fn choices(&self) -> Vec<&str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.relations.iter().map(|r| r.name.as_str()))
            .collect()
    }
}
