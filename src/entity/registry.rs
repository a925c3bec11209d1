//! Entity registry: the reflection capability handing out descriptors by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::descriptor::{EntityBuilder, EntityDescriptor};
use crate::entity::relation::{RelationDescriptor, RelationKind};
use crate::entity::field::FieldDescriptor;
use crate::error::OrmError;
use crate::value::coerce;

/// Entity types that describe themselves.
pub trait Entity {
    /// Registry name of the entity.
    const NAME: &'static str;

    fn describe() -> EntityBuilder;
}

/// Every registered entity, resolved and validated once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entities: HashMap<String, Arc<EntityDescriptor>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&Arc<EntityDescriptor>, OrmError> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::invalid(format!("unknown entity '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

/// Collects entity declarations; [`build`](Self::build) resolves relations across them.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    pending: Vec<EntityBuilder>,
}

impl RegistryBuilder {
    pub fn register(mut self, entity: EntityBuilder) -> Self {
        self.pending.push(entity);
        self
    }

    pub fn entity<E: Entity>(self) -> Self {
        self.register(E::describe())
    }

    /// Resolve primary-key join columns and check every relation target exists.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueryError` for duplicate entities, missing primary keys,
    /// unknown relation targets, join columns that name no field or defaults
    /// that do not fit their field.
    pub fn build(self) -> Result<Registry, OrmError> {
        let mut pk_columns: HashMap<String, String> = HashMap::new();
        for entity in &self.pending {
            let pk = entity.primary_key_column()?.to_string();
            if pk_columns.insert(entity.name.clone(), pk).is_some() {
                return Err(OrmError::invalid(format!(
                    "entity '{}' registered twice",
                    entity.name
                )));
            }
        }
        let columns_of: HashMap<&str, Vec<&str>> = self
            .pending
            .iter()
            .map(|e| {
                (
                    e.name.as_str(),
                    e.fields.iter().map(|f| f.column.as_str()).collect(),
                )
            })
            .collect();

        let mut entities = HashMap::new();
        for entity in &self.pending {
            let mut relations = Vec::with_capacity(entity.relations.len());
            for pending in &entity.relations {
                let related_pk = pk_columns.get(&pending.related_entity).ok_or_else(|| {
                    OrmError::invalid(format!(
                        "relation '{}.{}' targets unknown entity '{}'",
                        entity.name, pending.name, pending.related_entity
                    ))
                })?;
                let own_pk = &pk_columns[&entity.name];
                let relation = RelationDescriptor {
                    name: pending.name.clone(),
                    kind: pending.kind,
                    related_entity: pending.related_entity.clone(),
                    local_column: pending.local_column.clone().unwrap_or_else(|| own_pk.clone()),
                    remote_column: pending
                        .remote_column
                        .clone()
                        .unwrap_or_else(|| related_pk.clone()),
                    through: pending.through.clone(),
                };
                let local_ok = columns_of[entity.name.as_str()].contains(&relation.local_column.as_str());
                let remote_ok = columns_of[relation.related_entity.as_str()]
                    .contains(&relation.remote_column.as_str());
                if !local_ok || !remote_ok {
                    return Err(OrmError::invalid(format!(
                        "relation '{}.{}' joins on a column that is not a declared field",
                        entity.name, relation.name
                    )));
                }
                if relation.kind == RelationKind::ManyToMany && relation.through.is_none() {
                    return Err(OrmError::invalid(format!(
                        "many-to-many relation '{}.{}' needs a through table",
                        entity.name, relation.name
                    )));
                }
                relations.push(relation);
            }
            let descriptor = EntityDescriptor::new(
                entity.name.clone(),
                entity.table_name.clone(),
                coerced_defaults(&entity.name, &entity.fields)?,
                relations,
            )?;
            entities.insert(entity.name.clone(), Arc::new(descriptor));
        }
        log::debug!("registered {} entities", entities.len());
        Ok(Registry { entities })
    }
}

/// Fields with every default coerced to the field's type up front.
fn coerced_defaults(entity: &str, fields: &[FieldDescriptor]) -> Result<Vec<FieldDescriptor>, OrmError> {
    fields
        .iter()
        .map(|field| {
            let mut field = field.clone();
            if let Some(default) = field.default.take() {
                let value = coerce(&field, default).map_err(|e| {
                    OrmError::invalid(format!(
                        "default of '{}.{}' does not fit the field: {}",
                        entity, field.name, e
                    ))
                })?;
                field.default = Some(value);
            }
            Ok(field)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldType;

    fn with_default(value: impl Into<sea_query::Value>) -> Result<Registry, OrmError> {
        Registry::builder()
            .register(
                EntityBuilder::new("counter", "counter")
                    .field(FieldDescriptor::auto_pk("id"))
                    .field(FieldDescriptor::new("hits", FieldType::BigInt).default_value(value)),
            )
            .build()
    }

    #[test]
    fn test_default_is_coerced_at_build() {
        let registry = with_default(3i32).unwrap();
        let counter = registry.get("counter").unwrap();
        assert_eq!(
            counter.field("hits").unwrap().default,
            Some(sea_query::Value::BigInt(Some(3)))
        );
    }

    #[test]
    fn test_default_of_wrong_type_is_rejected() {
        let err = with_default("lots").unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryError(_)));
        assert!(err.to_string().contains("counter.hits"));
    }
}
