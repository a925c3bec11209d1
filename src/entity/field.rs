//! Field metadata: one `FieldDescriptor` per stored column.

use sea_query::Value;

/// Storage type of a field. Drives value coercion and typed NULLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text,
    Bytes,
    Json,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Decimal,
}

impl FieldType {
    pub fn is_integer(self) -> bool {
        matches!(self, FieldType::SmallInt | FieldType::Int | FieldType::BigInt)
    }

    pub fn is_textual(self) -> bool {
        matches!(self, FieldType::Text)
    }
}

/// A stored field of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    pub field_type: FieldType,
    pub is_primary_key: bool,
    pub nullable: bool,
    pub unique: bool,
    /// Generated by the database (serial / identity); omitted from INSERT when unset.
    pub auto_increment: bool,
    /// Applied on direct construction only, never during hydration.
    pub default: Option<Value>,
}

impl FieldDescriptor {
    /// A non-null field whose column name equals the field name.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            field_type,
            is_primary_key: false,
            nullable: false,
            unique: false,
            auto_increment: false,
            default: None,
        }
    }

    /// An auto-incrementing `BIGINT` primary key.
    pub fn auto_pk(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::BigInt).primary_key().auto_increment()
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.unique = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}
