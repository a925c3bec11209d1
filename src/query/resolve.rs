//! Field-path resolution against the registry.
//!
//! A path such as `author__publisher__name` walks relations from the root
//! entity; every relation step becomes a LEFT OUTER JOIN shared by all parts
//! of the query that traverse the same path.

use std::sync::Arc;

use sea_query::Value;

use crate::entity::{EntityDescriptor, FieldDescriptor, FieldType, RelationDescriptor, RelationKind, Registry};
use crate::error::OrmError;
use crate::query::dialect::qualified;
use crate::query::filter::{split_lookup, Comparison, FilterNode, Lookup, Operand, LOOKUP_SEP};
use crate::value::{coerce, is_null};

/// One joined relation.
#[derive(Debug, Clone)]
pub struct JoinStep {
    /// Relation path from the root, `__`-separated.
    pub path: String,
    pub alias: String,
    pub parent_alias: String,
    pub relation: RelationDescriptor,
    pub entity: Arc<EntityDescriptor>,
}

impl JoinStep {
    /// Alias of the intermediate table of a many-to-many step.
    pub fn through_alias(&self) -> String {
        format!("{}__through", self.alias)
    }
}

/// Field reached by a path: the table alias it lives under and its index.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub alias: String,
    pub entity: Arc<EntityDescriptor>,
    pub field_index: usize,
}

impl ResolvedField {
    pub fn field(&self) -> &FieldDescriptor {
        &self.entity.fields()[self.field_index]
    }

    /// Quoted `"alias"."column"`.
    pub fn sql(&self) -> String {
        qualified(&self.alias, &self.field().column)
    }
}

/// Ordered set of joins needed by a query.
#[derive(Debug, Clone)]
pub struct JoinSet {
    root: Arc<EntityDescriptor>,
    root_alias: String,
    steps: Vec<JoinStep>,
}

impl JoinSet {
    pub fn new(root: Arc<EntityDescriptor>) -> Self {
        Self {
            root_alias: root.table_name().to_string(),
            root,
            steps: Vec::new(),
        }
    }

    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    pub fn steps(&self) -> &[JoinStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn alias_for(&self, path: &str) -> String {
        if path == self.root_alias {
            format!("{}_j", path)
        } else {
            path.to_string()
        }
    }

    /// Walk `relations` from the root, adding joins as needed.
    /// Returns the alias and entity at the end of the walk.
    pub fn ensure(
        &mut self,
        registry: &Registry,
        relations: &[String],
    ) -> Result<(String, Arc<EntityDescriptor>), OrmError> {
        let mut alias = self.root_alias.clone();
        let mut entity = self.root.clone();
        let mut path = String::new();
        for name in relations {
            let relation = entity
                .relation(name)
                .ok_or_else(|| {
                    OrmError::invalid(format!(
                        "'{}' is not a relation of '{}'",
                        name,
                        entity.name()
                    ))
                })?
                .clone();
            if !path.is_empty() {
                path.push_str(LOOKUP_SEP);
            }
            path.push_str(name);
            let related = registry.get(&relation.related_entity)?.clone();
            let join_alias = match self.steps.iter().find(|s| s.path == path) {
                Some(step) => step.alias.clone(),
                None => {
                    let join_alias = self.alias_for(&path);
                    self.steps.push(JoinStep {
                        path: path.clone(),
                        alias: join_alias.clone(),
                        parent_alias: alias.clone(),
                        relation,
                        entity: related.clone(),
                    });
                    join_alias
                }
            };
            alias = join_alias;
            entity = related;
        }
        Ok((alias, entity))
    }

    /// Resolve `relation__...__field`. A trailing forward relation name maps to its
    /// foreign-key field without a join; a trailing multi-valued relation maps to
    /// the related primary key.
    pub fn resolve_field(
        &mut self,
        registry: &Registry,
        path: &[String],
    ) -> Result<ResolvedField, OrmError> {
        let (last, relations) = path
            .split_last()
            .ok_or_else(|| OrmError::invalid("empty field path"))?;
        let (alias, entity) = self.ensure(registry, relations)?;
        if let Some(field_index) = entity.field_index(last) {
            return Ok(ResolvedField {
                alias,
                entity,
                field_index,
            });
        }
        if let Some(relation) = entity.relation(last) {
            if relation.kind == RelationKind::ForwardOne {
                let field_index = entity.field_by_column(&relation.local_column).ok_or_else(|| {
                    OrmError::invalid(format!(
                        "relation '{}' has no local field for column '{}'",
                        relation.name, relation.local_column
                    ))
                })?;
                return Ok(ResolvedField {
                    alias,
                    entity,
                    field_index,
                });
            }
            let (alias, related) = self.ensure(registry, path)?;
            let field_index = related.pk_index();
            return Ok(ResolvedField {
                alias,
                entity: related,
                field_index,
            });
        }
        Err(match entity.require_field(last) {
            Err(e) => e,
            Ok(_) => OrmError::invalid(format!("cannot resolve '{}'", last)),
        })
    }

    /// Resolve a `__`-separated path string.
    pub fn resolve_str(&mut self, registry: &Registry, path: &str) -> Result<ResolvedField, OrmError> {
        let segments: Vec<String> = path
            .split(LOOKUP_SEP)
            .flat_map(|p| p.split('.'))
            .map(str::to_string)
            .collect();
        self.resolve_field(registry, &segments)
    }
}

/// Split a relation path (`comments__author`) into relation names.
pub fn relation_segments(path: &str) -> Vec<String> {
    path.split(LOOKUP_SEP)
        .flat_map(|p| p.split('.'))
        .map(str::to_string)
        .collect()
}

fn null_comparison_error(c: &Comparison) -> OrmError {
    OrmError::invalid(format!(
        "'{}__{}' cannot compare against NULL; use isnull",
        c.path_str(),
        c.lookup.as_str()
    ))
}

fn check_comparison(
    registry: &Registry,
    root: &Arc<EntityDescriptor>,
    mut c: Comparison,
) -> Result<Comparison, OrmError> {
    let mut joins = JoinSet::new(root.clone());
    let resolved = joins.resolve_field(registry, &c.path)?;
    let field = resolved.field();
    let operand = std::mem::replace(&mut c.operand, Operand::List(Vec::new()));
    c.operand = match (c.lookup, operand) {
        (Lookup::IsNull, Operand::Value(v @ Value::Bool(Some(_)))) => Operand::Value(v),
        (Lookup::IsNull, _) => {
            return Err(OrmError::invalid(format!(
                "'{}__isnull' requires a boolean",
                c.path_str()
            )))
        }
        (Lookup::In, Operand::List(values)) => Operand::List(
            values
                .into_iter()
                .map(|v| coerce(field, v))
                .collect::<Result<_, _>>()?,
        ),
        (Lookup::In, _) => {
            return Err(OrmError::invalid(format!(
                "'{}__in' requires a list of values",
                c.path_str()
            )))
        }
        (Lookup::Range, Operand::Range(low, high)) => {
            if is_null(&low) || is_null(&high) {
                return Err(null_comparison_error(&c));
            }
            Operand::Range(coerce(field, low)?, coerce(field, high)?)
        }
        (Lookup::Range, _) => {
            return Err(OrmError::invalid(format!(
                "'{}__range' requires a (low, high) pair",
                c.path_str()
            )))
        }
        (lookup, Operand::Value(v)) if lookup.is_pattern() => {
            if field.field_type != FieldType::Text {
                return Err(OrmError::invalid(format!(
                    "'{}' lookup needs a text field, '{}' is {:?}",
                    lookup.as_str(),
                    field.name,
                    field.field_type
                )));
            }
            match v {
                Value::String(Some(_)) => Operand::Value(v),
                _ => {
                    return Err(OrmError::invalid(format!(
                        "'{}__{}' requires a string",
                        c.path_str(),
                        lookup.as_str()
                    )))
                }
            }
        }
        (lookup, Operand::Value(v)) => {
            if is_null(&v) && !matches!(lookup, Lookup::Exact | Lookup::Ne) {
                return Err(null_comparison_error(&c));
            }
            Operand::Value(coerce(field, v)?)
        }
        (lookup, _) => {
            return Err(OrmError::invalid(format!(
                "'{}' lookup takes a single value",
                lookup.as_str()
            )))
        }
    };
    Ok(c)
}

/// Check every comparison of `node` against the registry and coerce its operands
/// to the target field types.
///
/// # Errors
///
/// `InvalidQueryError` for unknown fields, unknown relations or operands that do
/// not fit their lookup.
pub fn validate_filter(
    registry: &Registry,
    root: &Arc<EntityDescriptor>,
    node: FilterNode,
) -> Result<FilterNode, OrmError> {
    node.try_map(&mut |c| check_comparison(registry, root, c))
}

/// Validate a field path used by ordering, values or distinct.
pub fn validate_path(
    registry: &Registry,
    root: &Arc<EntityDescriptor>,
    path: &str,
) -> Result<ResolvedField, OrmError> {
    let (segments, lookup) = split_lookup(path);
    if lookup != Lookup::Exact || segments.join(LOOKUP_SEP) != path.replace('.', LOOKUP_SEP) {
        return Err(OrmError::invalid(format!(
            "'{}' is a lookup, not a field path",
            path
        )));
    }
    JoinSet::new(root.clone()).resolve_field(registry, &segments)
}

/// Validate a relation path used by select_related / prefetch_related.
/// Returns the relation at every step.
pub fn validate_relation_path(
    registry: &Registry,
    root: &Arc<EntityDescriptor>,
    path: &str,
) -> Result<Vec<RelationDescriptor>, OrmError> {
    let mut entity = root.clone();
    let mut out = Vec::new();
    for name in relation_segments(path) {
        let relation = entity
            .relation(&name)
            .ok_or_else(|| {
                OrmError::invalid(format!(
                    "Invalid field name '{}' in '{}': not a relation of '{}'",
                    name,
                    path,
                    entity.name()
                ))
            })?
            .clone();
        entity = registry.get(&relation.related_entity)?.clone();
        out.push(relation);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::Q;
    use crate::tests_cfg::blog_registry;

    fn validate(node: FilterNode) -> Result<FilterNode, OrmError> {
        let registry = blog_registry();
        let article = registry.get("article").unwrap().clone();
        validate_filter(&registry, &article, node)
    }

    #[test]
    fn test_operands_are_coerced_to_field_type() {
        let node = validate(Q::is_in("author__id", [1i32, 2i32]) & Q::new("view_count__gte", 10i32)).unwrap();
        let operands: Vec<&Operand> = node.comparisons().into_iter().map(|c| &c.operand).collect();
        assert_eq!(
            operands,
            vec![
                &Operand::List(vec![Value::BigInt(Some(1)), Value::BigInt(Some(2))]),
                &Operand::Value(Value::BigInt(Some(10))),
            ]
        );
    }

    #[test]
    fn test_isnull_requires_boolean() {
        let err = validate(Q::new("author__isnull", 1i32)).unwrap_err();
        assert!(err.to_string().contains("'author__isnull' requires a boolean"));
    }

    #[test]
    fn test_range_rejects_null_bound() {
        let err = validate(Q::range("view_count", 1i64, Value::BigInt(None))).unwrap_err();
        assert!(err.to_string().contains("cannot compare against NULL"));
    }

    #[test]
    fn test_pattern_lookup_needs_text_field() {
        assert!(validate(Q::new("view_count__contains", "1")).is_err());
        assert!(validate(Q::new("title__contains", "rust")).is_ok());
    }

    #[test]
    fn test_join_alias_is_stable_per_path() {
        let registry = blog_registry();
        let mut joins = JoinSet::new(registry.get("article").unwrap().clone());
        let first = joins.resolve_str(&registry, "author__name").unwrap();
        let again = joins.resolve_str(&registry, "author__email").unwrap();
        assert_eq!(first.alias, again.alias);
        assert_eq!(joins.steps().len(), 1);
    }
}
