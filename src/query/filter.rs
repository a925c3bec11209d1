//! Composable filter predicates.
//!
//! Predicates are built from `field__lookup` strings
//! (`"author__name__icontains"`) and combined with `&`, `|` and `!`:
//!
//! ```rust
//! use undertow::Q;
//!
//! let popular = Q::new("view_count__gte", 100) | Q::new("is_featured", true);
//! let visible = popular & !Q::new("author__isnull", true);
//! ```

use std::ops::{BitAnd, BitOr, Not};

use sea_query::Value;

/// Separator between relation steps, field and lookup.
pub const LOOKUP_SEP: &str = "__";

/// Comparison operator applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Exact,
    IExact,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Like,
    IsNull,
    Range,
}

impl Lookup {
    pub fn parse(name: &str) -> Option<Lookup> {
        let lookup = match name {
            "exact" | "eq" => Lookup::Exact,
            "iexact" => Lookup::IExact,
            "ne" => Lookup::Ne,
            "lt" => Lookup::Lt,
            "lte" => Lookup::Lte,
            "gt" => Lookup::Gt,
            "gte" => Lookup::Gte,
            "in" => Lookup::In,
            "contains" => Lookup::Contains,
            "icontains" => Lookup::IContains,
            "startswith" => Lookup::StartsWith,
            "istartswith" => Lookup::IStartsWith,
            "endswith" => Lookup::EndsWith,
            "iendswith" => Lookup::IEndsWith,
            "like" => Lookup::Like,
            "isnull" => Lookup::IsNull,
            "range" => Lookup::Range,
            _ => return None,
        };
        Some(lookup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::IExact => "iexact",
            Lookup::Ne => "ne",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::In => "in",
            Lookup::Contains => "contains",
            Lookup::IContains => "icontains",
            Lookup::StartsWith => "startswith",
            Lookup::IStartsWith => "istartswith",
            Lookup::EndsWith => "endswith",
            Lookup::IEndsWith => "iendswith",
            Lookup::Like => "like",
            Lookup::IsNull => "isnull",
            Lookup::Range => "range",
        }
    }

    /// Pattern lookups that only apply to text fields.
    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Lookup::IExact
                | Lookup::Contains
                | Lookup::IContains
                | Lookup::StartsWith
                | Lookup::IStartsWith
                | Lookup::EndsWith
                | Lookup::IEndsWith
                | Lookup::Like
        )
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
    Range(Value, Value),
}

/// `field_path <lookup> operand`. `path` holds relation steps followed by the field name.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub path: Vec<String>,
    pub lookup: Lookup,
    pub operand: Operand,
}

impl Comparison {
    /// Path as written in lookups, e.g. `author__name`.
    pub fn path_str(&self) -> String {
        self.path.join(LOOKUP_SEP)
    }
}

/// Boolean predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Comparison(Comparison),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

/// Shorthand used at call sites: `Q::new("title__startswith", "Rust")`.
pub type Q = FilterNode;

/// Split `author__name__icontains` (or `author.name`) into path segments and lookup.
pub fn split_lookup(lookup: &str) -> (Vec<String>, Lookup) {
    let mut parts: Vec<String> = lookup
        .split(LOOKUP_SEP)
        .flat_map(|p| p.split('.'))
        .map(str::to_string)
        .collect();
    if parts.len() > 1 {
        if let Some(op) = parts.last().and_then(|p| Lookup::parse(p)) {
            parts.pop();
            return (parts, op);
        }
    }
    (parts, Lookup::Exact)
}

fn comparison(lookup: &str, operand: Operand, forced: Option<Lookup>) -> FilterNode {
    let (path, parsed) = split_lookup(lookup);
    FilterNode::Comparison(Comparison {
        path,
        lookup: forced.unwrap_or(parsed),
        operand,
    })
}

impl FilterNode {
    /// Comparison from a lookup string; the trailing segment picks the operator (default `exact`).
    pub fn new(lookup: &str, value: impl Into<Value>) -> Self {
        comparison(lookup, Operand::Value(value.into()), None)
    }

    /// `field IN (values)`. A trailing `__in` on the lookup is optional.
    pub fn is_in<I, V>(lookup: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let list = values.into_iter().map(Into::into).collect();
        comparison(lookup, Operand::List(list), Some(Lookup::In))
    }

    /// `field BETWEEN low AND high`. A trailing `__range` on the lookup is optional.
    pub fn range(lookup: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        comparison(
            lookup,
            Operand::Range(low.into(), high.into()),
            Some(Lookup::Range),
        )
    }

    /// Conjunction of every node; nested conjunctions are flattened.
    pub fn all<I: IntoIterator<Item = FilterNode>>(nodes: I) -> Self {
        nodes
            .into_iter()
            .fold(FilterNode::And(Vec::new()), FilterNode::and)
    }

    /// Disjunction of every node; nested disjunctions are flattened.
    pub fn any<I: IntoIterator<Item = FilterNode>>(nodes: I) -> Self {
        nodes
            .into_iter()
            .fold(FilterNode::Or(Vec::new()), FilterNode::or)
    }

    pub fn and(self, other: FilterNode) -> Self {
        let mut children = match self {
            FilterNode::And(children) => children,
            node => vec![node],
        };
        match other {
            FilterNode::And(more) => children.extend(more),
            node => children.push(node),
        }
        FilterNode::And(children)
    }

    pub fn or(self, other: FilterNode) -> Self {
        let mut children = match self {
            FilterNode::Or(children) => children,
            node => vec![node],
        };
        match other {
            FilterNode::Or(more) => children.extend(more),
            node => children.push(node),
        }
        FilterNode::Or(children)
    }

    pub fn negate(self) -> Self {
        FilterNode::Not(Box::new(self))
    }

    /// Visit every comparison in the tree.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            FilterNode::Comparison(c) => out.push(c),
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().for_each(|c| c.collect(out))
            }
            FilterNode::Not(child) => child.collect(out),
        }
    }

    /// Rebuild the tree, transforming each comparison.
    pub fn try_map<E>(
        self,
        f: &mut impl FnMut(Comparison) -> Result<Comparison, E>,
    ) -> Result<FilterNode, E> {
        Ok(match self {
            FilterNode::Comparison(c) => FilterNode::Comparison(f(c)?),
            FilterNode::And(children) => FilterNode::And(
                children
                    .into_iter()
                    .map(|c| c.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            FilterNode::Or(children) => FilterNode::Or(
                children
                    .into_iter()
                    .map(|c| c.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            FilterNode::Not(child) => FilterNode::Not(Box::new(child.try_map(f)?)),
        })
    }
}

impl BitAnd for FilterNode {
    type Output = FilterNode;

    fn bitand(self, rhs: FilterNode) -> FilterNode {
        self.and(rhs)
    }
}

impl BitOr for FilterNode {
    type Output = FilterNode;

    fn bitor(self, rhs: FilterNode) -> FilterNode {
        self.or(rhs)
    }
}

impl Not for FilterNode {
    type Output = FilterNode;

    fn not(self) -> FilterNode {
        self.negate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lookup_default_exact() {
        let (path, lookup) = split_lookup("title");
        assert_eq!(path, vec!["title"]);
        assert_eq!(lookup, Lookup::Exact);
    }

    #[test]
    fn test_split_lookup_relation_and_operator() {
        let (path, lookup) = split_lookup("author__name__icontains");
        assert_eq!(path, vec!["author", "name"]);
        assert_eq!(lookup, Lookup::IContains);
    }

    #[test]
    fn test_split_lookup_dotted() {
        let (path, lookup) = split_lookup("author.name__startswith");
        assert_eq!(path, vec!["author", "name"]);
        assert_eq!(lookup, Lookup::StartsWith);
    }

    #[test]
    fn test_single_segment_named_like_operator_is_a_field() {
        let (path, lookup) = split_lookup("range");
        assert_eq!(path, vec!["range"]);
        assert_eq!(lookup, Lookup::Exact);
    }

    #[test]
    fn test_and_flattens() {
        let a = Q::new("a", 1);
        let b = Q::new("b", 2);
        let c = Q::new("c", 3);
        let left = (a.clone() & b.clone()) & c.clone();
        let right = a & (b & c);
        assert_eq!(left, right);
        match left {
            FilterNode::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_or_and_not() {
        let node = !(Q::new("a", 1) | Q::new("b", 2));
        match node {
            FilterNode::Not(inner) => assert!(matches!(*inner, FilterNode::Or(ref c) if c.len() == 2)),
            other => panic!("expected Not, got {:?}", other),
        }
    }

    #[test]
    fn test_is_in_strips_suffix() {
        let node = Q::is_in("id__in", [1, 2, 3]);
        let comparisons = node.comparisons();
        assert_eq!(comparisons[0].path, vec!["id"]);
        assert_eq!(comparisons[0].lookup, Lookup::In);
        assert_eq!(
            comparisons[0].operand,
            Operand::List(vec![Value::Int(Some(1)), Value::Int(Some(2)), Value::Int(Some(3))])
        );
    }

    #[test]
    fn test_all_of_single_node() {
        let node = Q::all([Q::new("a", 1)]);
        assert_eq!(node, FilterNode::And(vec![Q::new("a", 1)]));
    }
}
