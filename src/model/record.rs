//! Hydrated entity instances.

use std::collections::HashMap;
use std::sync::Arc;

use sea_query::Value;

use crate::entity::EntityDescriptor;
use crate::error::OrmError;
use crate::value::{coerce, is_null, null_of, to_json, TryGetable};

/// Whether a record has a row behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    /// Built in memory, never saved.
    New,
    /// Loaded from or saved to the database behind `alias`.
    Persisted { alias: String },
}

/// Cached result of a relation, filled by select_related or prefetch_related.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Box<Record>),
    Many(Vec<Record>),
    /// The foreign key was NULL or pointed nowhere.
    Absent,
}

/// One entity instance: a value per field plus cached relations and annotations.
///
/// A field whose slot is `None` was deferred at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    descriptor: Arc<EntityDescriptor>,
    values: Vec<Option<Value>>,
    state: RecordState,
    relations: HashMap<String, Related>,
    annotations: Vec<(String, Value)>,
}

impl Record {
    /// New, unsaved record with field defaults applied and everything else NULL.
    pub fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        let values = descriptor
            .fields()
            .iter()
            .map(|f| Some(f.default.clone().unwrap_or_else(|| null_of(f.field_type))))
            .collect();
        Self {
            descriptor,
            values,
            state: RecordState::New,
            relations: HashMap::new(),
            annotations: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        descriptor: Arc<EntityDescriptor>,
        values: Vec<Option<Value>>,
        state: RecordState,
    ) -> Self {
        Self {
            descriptor,
            values,
            state,
            relations: HashMap::new(),
            annotations: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn entity_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn state(&self) -> &RecordState {
        &self.state
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.state, RecordState::Persisted { .. })
    }

    /// Alias of the database the record came from.
    pub fn db_alias(&self) -> Option<&str> {
        match &self.state {
            RecordState::Persisted { alias } => Some(alias),
            RecordState::New => None,
        }
    }

    pub(crate) fn mark_persisted(&mut self, alias: &str) {
        self.state = RecordState::Persisted {
            alias: alias.to_string(),
        };
    }

    pub(crate) fn mark_new(&mut self) {
        self.state = RecordState::New;
    }

    /// Primary key, `None` while unset.
    pub fn pk(&self) -> Option<&Value> {
        self.values[self.descriptor.pk_index()]
            .as_ref()
            .filter(|v| !is_null(v))
    }

    pub fn is_deferred(&self, name: &str) -> bool {
        self.descriptor
            .field_index(name)
            .map(|i| self.values[i].is_none())
            .unwrap_or(false)
    }

    /// Names of the fields that were loaded.
    pub fn loaded_fields(&self) -> Vec<&str> {
        self.descriptor
            .fields()
            .iter()
            .zip(&self.values)
            .filter(|(_, v)| v.is_some())
            .map(|(f, _)| f.name.as_str())
            .collect()
    }

    pub(crate) fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn get(&self, name: &str) -> Result<&Value, OrmError> {
        let index = self.descriptor.require_field(name)?;
        self.values[index].as_ref().ok_or_else(|| {
            OrmError::invalid(format!(
                "field '{}' of {} was deferred; refresh it from the database first",
                name,
                self.descriptor.name()
            ))
        })
    }

    /// Typed field access.
    pub fn get_as<T: TryGetable>(&self, name: &str) -> Result<T, OrmError> {
        let value = self.get(name)?.clone();
        T::try_get(value).map_err(|e| {
            OrmError::HydrationError(format!("{}.{}: {}", self.descriptor.name(), name, e))
        })
    }

    /// Assign a field, converting the value to the field's type.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self, OrmError> {
        let index = self.descriptor.require_field(name)?;
        let field = &self.descriptor.fields()[index];
        self.values[index] = Some(coerce(field, value.into())?);
        Ok(self)
    }

    pub(crate) fn set_at(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Some(value);
        }
    }

    /// Cached relation, if it was loaded.
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// Single related record; `Ok(None)` when the relation is absent.
    pub fn related_one(&self, name: &str) -> Result<Option<&Record>, OrmError> {
        match self.relations.get(name) {
            Some(Related::One(record)) => Ok(Some(record)),
            Some(Related::Absent) => Ok(None),
            Some(Related::Many(_)) => Err(OrmError::invalid(format!(
                "relation '{}' holds many records",
                name
            ))),
            None => Err(self.not_loaded(name)),
        }
    }

    /// Related records of a multi-valued relation.
    pub fn related_many(&self, name: &str) -> Result<&[Record], OrmError> {
        match self.relations.get(name) {
            Some(Related::Many(records)) => Ok(records),
            Some(Related::Absent) => Ok(&[]),
            Some(Related::One(_)) => Err(OrmError::invalid(format!(
                "relation '{}' holds a single record",
                name
            ))),
            None => Err(self.not_loaded(name)),
        }
    }

    fn not_loaded(&self, name: &str) -> OrmError {
        OrmError::invalid(format!(
            "relation '{}' of {} was not loaded; use select_related or prefetch_related",
            name,
            self.descriptor.name()
        ))
    }

    pub(crate) fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    /// Mutable access to the records cached under `name`.
    pub(crate) fn related_records_mut(&mut self, name: &str) -> Vec<&mut Record> {
        match self.relations.get_mut(name) {
            Some(Related::One(record)) => vec![record.as_mut()],
            Some(Related::Many(records)) => records.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    pub fn annotation(&self, alias: &str) -> Option<&Value> {
        self.annotations
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, v)| v)
    }

    pub(crate) fn set_annotation(&mut self, alias: impl Into<String>, value: Value) {
        let alias = alias.into();
        match self.annotations.iter_mut().find(|(a, _)| *a == alias) {
            Some(slot) => slot.1 = value,
            None => self.annotations.push((alias, value)),
        }
    }

    /// Loaded fields, annotations and cached relations as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (field, value) in self.descriptor.fields().iter().zip(&self.values) {
            if let Some(value) = value {
                map.insert(field.name.clone(), to_json(value));
            }
        }
        for (alias, value) in &self.annotations {
            map.insert(alias.clone(), to_json(value));
        }
        let mut names: Vec<&String> = self.relations.keys().collect();
        names.sort();
        for name in names {
            let json = match &self.relations[name] {
                Related::One(record) => record.to_json(),
                Related::Many(records) => {
                    serde_json::Value::Array(records.iter().map(Record::to_json).collect())
                }
                Related::Absent => serde_json::Value::Null,
            };
            map.insert(name.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

/// Typed view over a [`Record`].
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> Result<Self, OrmError>;
}

impl FromRecord for Record {
    fn from_record(record: &Record) -> Result<Self, OrmError> {
        Ok(record.clone())
    }
}
