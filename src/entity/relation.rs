//! Relation definitions between entities.

/// Kind of relation declared on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Many-to-one / one-to-one: this entity holds the foreign key.
    ForwardOne,
    /// One-to-many: the related entity holds a foreign key to this one.
    ReverseMany,
    /// Many-to-many through an intermediate join table.
    ManyToMany,
}

impl RelationKind {
    /// Whether following the relation yields a list.
    pub fn is_multi(self) -> bool {
        !matches!(self, RelationKind::ForwardOne)
    }
}

/// Intermediate table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughTable {
    pub table: String,
    /// Column referencing the owning side's key.
    pub source_column: String,
    /// Column referencing the related side's key.
    pub target_column: String,
}

impl ThroughTable {
    pub fn new(
        table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// A resolved relation. Join condition is
/// `<this>.local_column = <related>.remote_column`, or for many-to-many
/// `<this>.local_column = through.source_column AND through.target_column = <related>.remote_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,
    pub related_entity: String,
    pub local_column: String,
    pub remote_column: String,
    pub through: Option<ThroughTable>,
}

/// Relation as declared, before the registry knows every primary key.
#[derive(Debug, Clone)]
pub(crate) struct PendingRelation {
    pub name: String,
    pub kind: RelationKind,
    pub related_entity: String,
    /// `None` means this entity's primary key column.
    pub local_column: Option<String>,
    /// `None` means the related entity's primary key column.
    pub remote_column: Option<String>,
    pub through: Option<ThroughTable>,
}
