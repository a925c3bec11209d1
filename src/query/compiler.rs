//! SQL compiler: `QuerySpec` → parameterized PostgreSQL + column plan.
//!
//! Identifiers are quoted here; values always travel as bound parameters.

use std::sync::Arc;

use sea_query::{
    Alias, Condition, Expr, ExprTrait, Func, JoinType, LikeExpr, Order, PostgresQueryBuilder,
    Query, SelectStatement, Value,
};

use crate::entity::{EntityDescriptor, RelationKind, Registry};
use crate::error::OrmError;
use crate::query::aggregate::Aggregate;
use crate::query::dialect::{escape_like, qualified, quote_ident};
use crate::query::filter::{Comparison, FilterNode, Lookup, Operand};
use crate::query::resolve::{relation_segments, JoinSet};
use crate::query::spec::{Distinct, Loading, Projection, QuerySpec};
use crate::value::is_null;

/// SQL text, bound parameters and the column layout of the result.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub plan: ColumnPlan,
    /// Output name of every selected column, in SELECT order.
    pub labels: Vec<String>,
}

/// Where a field of an entity sits in the result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedColumn {
    pub field_index: usize,
    pub position: usize,
}

/// Column layout for one entity plus the relations joined under it.
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub entity: Arc<EntityDescriptor>,
    pub fields: Vec<PlannedColumn>,
    pub related: Vec<RelatedPlan>,
    /// `(alias, position)` of annotation columns.
    pub annotations: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct RelatedPlan {
    pub relation: String,
    pub plan: ColumnPlan,
}

impl ColumnPlan {
    fn new(entity: Arc<EntityDescriptor>) -> Self {
        Self {
            entity,
            fields: Vec::new(),
            related: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn related(&self, relation: &str) -> Option<&ColumnPlan> {
        self.related
            .iter()
            .find(|r| r.relation == relation)
            .map(|r| &r.plan)
    }

    fn node_mut(&mut self, path: &[String]) -> Option<&mut ColumnPlan> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .related
                .iter_mut()
                .find(|r| &r.relation == head)
                .and_then(|r| r.plan.node_mut(rest)),
        }
    }
}

/// `"alias"."column"` as a column reference.
fn column_expr(alias: &str, column: &str) -> Expr {
    Expr::col((Alias::new(alias), Alias::new(column)))
}

/// Comparisons whose outcome already accounts for NULL.
fn tests_null(c: &Comparison) -> bool {
    match (c.lookup, &c.operand) {
        (Lookup::IsNull, _) => true,
        (Lookup::Exact | Lookup::Ne, Operand::Value(v)) => is_null(v),
        _ => false,
    }
}

/// Builds the SELECT list while tracking output positions.
struct Columns {
    exprs: Vec<(String, String, bool)>,
}

impl Columns {
    fn new() -> Self {
        Self { exprs: Vec::new() }
    }

    fn push(&mut self, sql: String, label: impl Into<String>) -> usize {
        self.exprs.push((sql, label.into(), false));
        self.exprs.len() - 1
    }

    /// Pushes a column rendered as `sql AS "label"`.
    fn push_named(&mut self, sql: String, label: impl Into<String>) -> usize {
        self.exprs.push((sql, label.into(), true));
        self.exprs.len() - 1
    }

    fn labels(&self) -> Vec<String> {
        self.exprs.iter().map(|(_, l, _)| l.clone()).collect()
    }
}

/// Compiles one `QuerySpec`. Joins discovered while translating filters,
/// ordering and projections are collected and emitted once.
pub struct SqlCompiler<'a> {
    registry: &'a Registry,
    spec: &'a QuerySpec,
    joins: JoinSet,
}

impl<'a> SqlCompiler<'a> {
    pub fn new(registry: &'a Registry, spec: &'a QuerySpec) -> Self {
        Self {
            registry,
            spec,
            joins: JoinSet::new(spec.entity.clone()),
        }
    }

    fn root_alias(&self) -> String {
        self.joins.root_alias().to_string()
    }

    fn root_table(&self) -> Alias {
        Alias::new(self.spec.entity.table_name())
    }

    fn comparison_expr(&mut self, c: &Comparison) -> Result<Expr, OrmError> {
        let resolved = self.joins.resolve_field(self.registry, &c.path)?;
        let alias = resolved.alias.clone();
        let column = resolved.field().column.clone();
        let col = column_expr(&alias, &column);
        let upper = || Expr::from(Func::upper(column_expr(&alias, &column)));
        let text = |op: &Operand| -> Result<String, OrmError> {
            match op {
                Operand::Value(Value::String(Some(s))) => Ok(s.clone()),
                other => Err(OrmError::invalid(format!(
                    "'{}__{}' requires a string, got {:?}",
                    c.path_str(),
                    c.lookup.as_str(),
                    other
                ))),
            }
        };
        let single = |op: &Operand| -> Result<Value, OrmError> {
            match op {
                Operand::Value(v) => Ok(v.clone()),
                other => Err(OrmError::invalid(format!(
                    "'{}__{}' takes a single value, got {:?}",
                    c.path_str(),
                    c.lookup.as_str(),
                    other
                ))),
            }
        };
        let expr = match c.lookup {
            Lookup::Exact => {
                let v = single(&c.operand)?;
                if is_null(&v) {
                    col.is_null()
                } else {
                    col.eq(Expr::val(v))
                }
            }
            Lookup::Ne => {
                let v = single(&c.operand)?;
                if is_null(&v) {
                    col.is_not_null()
                } else {
                    col.ne(Expr::val(v))
                }
            }
            Lookup::Lt => col.lt(Expr::val(single(&c.operand)?)),
            Lookup::Lte => col.lte(Expr::val(single(&c.operand)?)),
            Lookup::Gt => col.gt(Expr::val(single(&c.operand)?)),
            Lookup::Gte => col.gte(Expr::val(single(&c.operand)?)),
            Lookup::In => match &c.operand {
                Operand::List(values) => col.is_in(values.clone()),
                other => {
                    return Err(OrmError::invalid(format!(
                        "'{}__in' requires a list, got {:?}",
                        c.path_str(),
                        other
                    )))
                }
            },
            Lookup::Range => match &c.operand {
                Operand::Range(low, high) => {
                    col.between(Expr::val(low.clone()), Expr::val(high.clone()))
                }
                other => {
                    return Err(OrmError::invalid(format!(
                        "'{}__range' requires a pair, got {:?}",
                        c.path_str(),
                        other
                    )))
                }
            },
            Lookup::IsNull => match &c.operand {
                Operand::Value(Value::Bool(Some(true))) => col.is_null(),
                Operand::Value(Value::Bool(Some(false))) => col.is_not_null(),
                other => {
                    return Err(OrmError::invalid(format!(
                        "'{}__isnull' requires a boolean, got {:?}",
                        c.path_str(),
                        other
                    )))
                }
            },
            Lookup::Like => col.like(LikeExpr::new(text(&c.operand)?)),
            Lookup::Contains => {
                col.like(LikeExpr::new(format!("%{}%", escape_like(&text(&c.operand)?))))
            }
            Lookup::StartsWith => {
                col.like(LikeExpr::new(format!("{}%", escape_like(&text(&c.operand)?))))
            }
            Lookup::EndsWith => {
                col.like(LikeExpr::new(format!("%{}", escape_like(&text(&c.operand)?))))
            }
            Lookup::IExact => {
                upper().like(LikeExpr::new(escape_like(&text(&c.operand)?).to_uppercase()))
            }
            Lookup::IContains => upper().like(LikeExpr::new(format!(
                "%{}%",
                escape_like(&text(&c.operand)?).to_uppercase()
            ))),
            Lookup::IStartsWith => upper().like(LikeExpr::new(format!(
                "{}%",
                escape_like(&text(&c.operand)?).to_uppercase()
            ))),
            Lookup::IEndsWith => upper().like(LikeExpr::new(format!(
                "%{}",
                escape_like(&text(&c.operand)?).to_uppercase()
            ))),
        };
        Ok(expr)
    }

    /// A comparison under an odd number of NOTs. Rows where the compared column
    /// is NULL (nullable field or outer-join miss) must survive the negation, and
    /// a multi-valued path must exclude the parent when any related row matches.
    fn negated_comparison(&mut self, c: &Comparison) -> Result<Condition, OrmError> {
        let mut scratch = JoinSet::new(self.spec.entity.clone());
        let resolved = scratch.resolve_field(self.registry, &c.path)?;
        if scratch
            .steps()
            .iter()
            .any(|step| step.relation.kind != RelationKind::ForwardOne)
        {
            return self.multi_valued_comparison(c);
        }
        let nullable = resolved.alias != scratch.root_alias() || resolved.field().nullable;
        let expr = self.comparison_expr(c)?;
        let mut cond = Condition::all().add(expr);
        if nullable && !tests_null(c) {
            cond = cond.add(column_expr(&resolved.alias, &resolved.field().column).is_not_null());
        }
        Ok(cond)
    }

    /// `pk IN (SELECT pk ... WHERE c)`, joined in its own scope so the outer
    /// query gains no rows per related match.
    fn multi_valued_comparison(&mut self, c: &Comparison) -> Result<Condition, OrmError> {
        let root_alias = self.root_alias();
        let pk_column = self.spec.entity.primary_key().column.clone();
        let mut inner = SqlCompiler::new(self.registry, self.spec);
        let expr = inner.comparison_expr(c)?;
        let mut select = Query::select();
        select.expr(column_expr(&root_alias, &pk_column));
        select.from(self.root_table());
        inner.apply_joins(&mut select);
        select.and_where(expr);
        Ok(Condition::all().add(column_expr(&root_alias, &pk_column).in_subquery(select)))
    }

    fn node_condition(&mut self, node: &FilterNode, negated: bool) -> Result<Condition, OrmError> {
        Ok(match node {
            FilterNode::Comparison(c) if negated => self.negated_comparison(c)?,
            FilterNode::Comparison(c) => Condition::all().add(self.comparison_expr(c)?),
            FilterNode::And(children) if children.is_empty() => {
                Condition::all().add(Expr::cust("TRUE"))
            }
            FilterNode::Or(children) if children.is_empty() => {
                Condition::all().add(Expr::cust("FALSE"))
            }
            FilterNode::And(children) => {
                let mut cond = Condition::all();
                for child in children {
                    cond = cond.add(self.node_condition(child, negated)?);
                }
                cond
            }
            FilterNode::Or(children) => {
                let mut cond = Condition::any();
                for child in children {
                    cond = cond.add(self.node_condition(child, negated)?);
                }
                cond
            }
            FilterNode::Not(child) => self.node_condition(child, !negated)?.not(),
        })
    }

    /// WHERE condition of the QuerySpec, if it filters at all.
    pub(crate) fn condition(&mut self) -> Result<Option<Condition>, OrmError> {
        match &self.spec.filter {
            None => Ok(None),
            Some(FilterNode::And(children)) if children.is_empty() => Ok(None),
            Some(node) => self.node_condition(node, false).map(Some),
        }
    }

    pub(crate) fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    fn apply_joins(&self, select: &mut SelectStatement) {
        for step in self.joins.steps() {
            let relation = &step.relation;
            match (&relation.through, relation.kind) {
                (Some(through), RelationKind::ManyToMany) => {
                    let through_alias = step.through_alias();
                    select.join_as(
                        JoinType::LeftJoin,
                        Alias::new(through.table.as_str()),
                        Alias::new(through_alias.as_str()),
                        Expr::cust(format!(
                            "{} = {}",
                            qualified(&step.parent_alias, &relation.local_column),
                            qualified(&through_alias, &through.source_column)
                        )),
                    );
                    select.join_as(
                        JoinType::LeftJoin,
                        Alias::new(step.entity.table_name()),
                        Alias::new(step.alias.as_str()),
                        Expr::cust(format!(
                            "{} = {}",
                            qualified(&through_alias, &through.target_column),
                            qualified(&step.alias, &relation.remote_column)
                        )),
                    );
                }
                _ => {
                    select.join_as(
                        JoinType::LeftJoin,
                        Alias::new(step.entity.table_name()),
                        Alias::new(step.alias.as_str()),
                        Expr::cust(format!(
                            "{} = {}",
                            qualified(&step.parent_alias, &relation.local_column),
                            qualified(&step.alias, &relation.remote_column)
                        )),
                    );
                }
            }
        }
    }

    fn aggregate_sql(&mut self, agg: &Aggregate) -> Result<String, OrmError> {
        let distinct = if agg.distinct { "DISTINCT " } else { "" };
        if agg.is_star() {
            return match agg.func {
                crate::query::aggregate::AggregateFunc::Count => Ok("COUNT(*)".to_string()),
                other => Err(OrmError::invalid(format!(
                    "{}(*) is not a valid aggregate",
                    other.sql_name()
                ))),
            };
        }
        let resolved = self.joins.resolve_str(self.registry, &agg.path)?;
        Ok(format!(
            "{}({}{})",
            agg.func.sql_name(),
            distinct,
            resolved.sql()
        ))
    }

    fn main_field_indices(&self) -> Result<Vec<usize>, OrmError> {
        let entity = &self.spec.entity;
        let pk = entity.pk_index();
        let indices = match &self.spec.loading {
            Loading::All => (0..entity.fields().len()).collect(),
            Loading::Only(names) => {
                let mut wanted = vec![pk];
                for name in names {
                    let idx = entity.require_field(name)?;
                    if !wanted.contains(&idx) {
                        wanted.push(idx);
                    }
                }
                (0..entity.fields().len())
                    .filter(|i| wanted.contains(i))
                    .collect()
            }
            Loading::Defer(names) => {
                let mut skipped = Vec::new();
                for name in names {
                    let idx = entity.require_field(name)?;
                    if idx != pk {
                        skipped.push(idx);
                    }
                }
                (0..entity.fields().len())
                    .filter(|i| !skipped.contains(i))
                    .collect()
            }
        };
        Ok(indices)
    }

    fn entity_columns(&mut self, columns: &mut Columns) -> Result<ColumnPlan, OrmError> {
        let root_alias = self.root_alias();
        let mut plan = ColumnPlan::new(self.spec.entity.clone());
        for field_index in self.main_field_indices()? {
            let field = &self.spec.entity.fields()[field_index];
            let position = columns.push(qualified(&root_alias, &field.column), field.name.clone());
            plan.fields.push(PlannedColumn {
                field_index,
                position,
            });
        }

        for path in &self.spec.select_related {
            let segments = relation_segments(path);
            for depth in 1..=segments.len() {
                let prefix = &segments[..depth];
                if plan.node_mut(prefix).is_some() {
                    continue;
                }
                let (alias, entity) = self.joins.ensure(self.registry, prefix)?;
                let step_kind = self
                    .joins
                    .steps()
                    .iter()
                    .find(|s| s.alias == alias)
                    .map(|s| s.relation.kind);
                if step_kind != Some(RelationKind::ForwardOne) {
                    return Err(OrmError::invalid(format!(
                        "select_related('{}'): only forward single-valued relations can be joined; use prefetch_related",
                        path
                    )));
                }
                let mut node = ColumnPlan::new(entity.clone());
                for (field_index, field) in entity.fields().iter().enumerate() {
                    let label = format!("{}__{}", prefix.join("__"), field.name);
                    let position = columns.push(qualified(&alias, &field.column), label);
                    node.fields.push(PlannedColumn {
                        field_index,
                        position,
                    });
                }
                let parent = plan.node_mut(&prefix[..depth - 1]).ok_or_else(|| {
                    OrmError::invalid(format!("select_related('{}') has no parent join", path))
                })?;
                parent.related.push(RelatedPlan {
                    relation: prefix[depth - 1].clone(),
                    plan: node,
                });
            }
        }
        Ok(plan)
    }

    fn values_columns(&mut self, columns: &mut Columns) -> Result<Vec<String>, OrmError> {
        let requested: Vec<String> = if self.spec.projection.fields().is_empty() {
            self.spec
                .entity
                .fields()
                .iter()
                .map(|f| f.name.clone())
                .collect()
        } else {
            self.spec.projection.fields().to_vec()
        };
        let mut group_cols = Vec::new();
        for name in requested {
            if self.spec.annotations.iter().any(|(alias, _)| alias == &name) {
                continue;
            }
            let resolved = self.joins.resolve_str(self.registry, &name)?;
            let sql = resolved.sql();
            columns.push_named(sql.clone(), name);
            group_cols.push(sql);
        }
        Ok(group_cols)
    }

    fn annotation_columns(
        &mut self,
        columns: &mut Columns,
    ) -> Result<Vec<(String, usize)>, OrmError> {
        let mut out = Vec::new();
        for (alias, agg) in &self.spec.annotations {
            let sql = self.aggregate_sql(agg)?;
            let position = columns.push_named(sql, alias.clone());
            out.push((alias.clone(), position));
        }
        Ok(out)
    }

    fn order_expr(&mut self, field: &str) -> Result<Expr, OrmError> {
        if self.spec.annotations.iter().any(|(alias, _)| alias == field) {
            return Ok(Expr::cust(quote_ident(field)));
        }
        let resolved = self.joins.resolve_str(self.registry, field)?;
        Ok(Expr::cust(resolved.sql()))
    }

    /// Full SELECT for the QuerySpec's projection.
    fn build_select(&mut self) -> Result<(SelectStatement, ColumnPlan, Vec<String>), OrmError> {
        let mut columns = Columns::new();
        let (mut plan, group_cols) = match &self.spec.projection {
            Projection::Entity => {
                let plan = self.entity_columns(&mut columns)?;
                let group_cols = columns.exprs.iter().map(|(sql, _, _)| sql.clone()).collect();
                (plan, group_cols)
            }
            Projection::Values(_) | Projection::ValuesList { .. } => {
                let group_cols = self.values_columns(&mut columns)?;
                (ColumnPlan::new(self.spec.entity.clone()), group_cols)
            }
        };
        plan.annotations = self.annotation_columns(&mut columns)?;

        let condition = self.condition()?;
        let mut orders = Vec::new();
        for term in &self.spec.ordering {
            let expr = self.order_expr(&term.field)?;
            orders.push((expr, if term.descending { Order::Desc } else { Order::Asc }));
        }
        let mut distinct_on = Vec::new();
        if let Distinct::On(fields) = &self.spec.distinct {
            for name in fields {
                let resolved = self.joins.resolve_str(self.registry, name)?;
                distinct_on.push((
                    Alias::new(resolved.alias.as_str()),
                    Alias::new(resolved.field().column.as_str()),
                ));
            }
        }

        let mut select = Query::select();
        for (sql, label, named) in &columns.exprs {
            if *named {
                select.expr_as(Expr::cust(sql.clone()), Alias::new(label.as_str()));
            } else {
                select.expr(Expr::cust(sql.clone()));
            }
        }
        select.from(self.root_table());
        self.apply_joins(&mut select);
        if let Some(cond) = condition {
            select.cond_where(cond);
        }
        if self.spec.group_by {
            select.add_group_by(group_cols.into_iter().map(Expr::cust));
        }
        match &self.spec.distinct {
            Distinct::Off => {}
            Distinct::All => {
                select.distinct();
            }
            Distinct::On(_) => {
                select.distinct_on(distinct_on);
            }
        }
        for (expr, order) in orders {
            select.order_by_expr(expr, order);
        }
        if let Some(limit) = self.spec.limit {
            if let Some(count) = limit.count {
                select.limit(count);
            }
            if limit.offset > 0 {
                select.offset(limit.offset);
            }
        }
        Ok((select, plan, columns.labels()))
    }

    /// SELECT returning rows for the QuerySpec's projection.
    pub fn compile_select(mut self) -> Result<CompiledQuery, OrmError> {
        let (select, plan, labels) = self.build_select()?;
        let (sql, values) = select.build(PostgresQueryBuilder);
        Ok(CompiledQuery {
            sql,
            params: values.iter().cloned().collect(),
            plan,
            labels,
        })
    }

    fn needs_subquery(&self) -> bool {
        self.spec.limit.is_some() || self.spec.distinct != Distinct::Off || self.spec.group_by
    }

    fn scalar(&self, select: SelectStatement, labels: Vec<String>) -> CompiledQuery {
        let (sql, values) = select.build(PostgresQueryBuilder);
        let mut plan = ColumnPlan::new(self.spec.entity.clone());
        plan.annotations = labels.iter().cloned().enumerate().map(|(i, l)| (l, i)).collect();
        CompiledQuery {
            sql,
            params: values.iter().cloned().collect(),
            plan,
            labels,
        }
    }

    /// `SELECT COUNT(*)` with the QuerySpec's WHERE; sliced, distinct or grouped
    /// specs are counted through a subquery.
    pub fn compile_count(mut self) -> Result<CompiledQuery, OrmError> {
        let mut select = Query::select();
        select.expr_as(Expr::cust("COUNT(*)"), Alias::new("__count"));
        if self.needs_subquery() {
            let (inner, _, _) = self.build_select()?;
            select.from_subquery(inner, Alias::new("subquery"));
        } else {
            let condition = self.condition()?;
            select.from(self.root_table());
            self.apply_joins(&mut select);
            if let Some(cond) = condition {
                select.cond_where(cond);
            }
        }
        Ok(self.scalar(select, vec!["__count".to_string()]))
    }

    /// `SELECT 1 ... LIMIT 1`.
    pub fn compile_exists(mut self) -> Result<CompiledQuery, OrmError> {
        let mut select = Query::select();
        select.expr_as(Expr::cust("1"), Alias::new("a"));
        if self.needs_subquery() {
            let (inner, _, _) = self.build_select()?;
            select.from_subquery(inner, Alias::new("subquery"));
        } else {
            let condition = self.condition()?;
            select.from(self.root_table());
            self.apply_joins(&mut select);
            if let Some(cond) = condition {
                select.cond_where(cond);
            }
        }
        select.limit(1);
        Ok(self.scalar(select, vec!["a".to_string()]))
    }

    /// One row of aggregate values named by their aliases.
    pub fn compile_aggregate(
        mut self,
        aggregates: &[(String, Aggregate)],
    ) -> Result<CompiledQuery, OrmError> {
        if aggregates.is_empty() {
            return Err(OrmError::invalid("aggregate() needs at least one aggregate"));
        }
        let mut select = Query::select();
        let labels: Vec<String> = aggregates.iter().map(|(alias, _)| alias.clone()).collect();
        if self.needs_subquery() {
            let root_alias = self.root_alias();
            let grouped = self.spec.group_by;
            let mut inner_fields: Vec<String> = Vec::new();
            let mut referenced: Vec<String> = Vec::new();
            let mut outer = Vec::new();
            for (alias, agg) in aggregates {
                if agg.is_star() {
                    outer.push((self.aggregate_sql(agg)?, alias.clone()));
                    continue;
                }
                let name = if self.spec.annotations.iter().any(|(a, _)| a == &agg.path) {
                    agg.path.clone()
                } else {
                    let resolved =
                        JoinSet::new(self.spec.entity.clone()).resolve_str(self.registry, &agg.path)?;
                    if resolved.alias != root_alias {
                        return Err(OrmError::invalid(format!(
                            "aggregate over relation path '{}' of a sliced, distinct or grouped query is not supported",
                            agg.path
                        )));
                    }
                    if grouped {
                        // grouped rows are labeled by the requested path
                        agg.path.clone()
                    } else {
                        let name = resolved.field().name.clone();
                        if !inner_fields.contains(&name) {
                            inner_fields.push(name.clone());
                        }
                        name
                    }
                };
                outer.push((
                    format!(
                        "{}({}{})",
                        agg.func.sql_name(),
                        if agg.distinct { "DISTINCT " } else { "" },
                        qualified("subquery", &name)
                    ),
                    alias.clone(),
                ));
                referenced.push(name);
            }
            let inner_spec = if grouped {
                match &self.spec.projection {
                    Projection::Entity => self.spec.with_projection(Projection::Values(Vec::new())),
                    _ => self.spec.clone(),
                }
            } else {
                if inner_fields.is_empty() {
                    inner_fields.push(self.spec.entity.primary_key().name.clone());
                }
                self.spec.with_projection(Projection::Values(inner_fields))
            };
            let (inner, _, inner_labels) =
                SqlCompiler::new(self.registry, &inner_spec).build_select()?;
            if let Some(missing) = referenced.iter().find(|name| !inner_labels.contains(name)) {
                return Err(OrmError::invalid(format!(
                    "aggregate() over a grouped query can only use its selected columns; '{}' is not selected",
                    missing
                )));
            }
            select.from_subquery(inner, Alias::new("subquery"));
            for (sql, alias) in outer {
                select.expr_as(Expr::cust(sql), Alias::new(alias.as_str()));
            }
        } else {
            let mut exprs = Vec::new();
            for (alias, agg) in aggregates {
                exprs.push((self.aggregate_sql(agg)?, alias.clone()));
            }
            let condition = self.condition()?;
            for (sql, alias) in exprs {
                select.expr_as(Expr::cust(sql), Alias::new(alias.as_str()));
            }
            select.from(self.root_table());
            self.apply_joins(&mut select);
            if let Some(cond) = condition {
                select.cond_where(cond);
            }
        }
        Ok(self.scalar(select, labels))
    }

    /// Condition selecting the QuerySpec's rows for UPDATE / DELETE. Filters that need
    /// joins become `pk IN (SELECT pk ...)`.
    pub(crate) fn mutation_condition(mut self) -> Result<Option<Condition>, OrmError> {
        let condition = self.condition()?;
        if !self.has_joins() {
            return Ok(condition);
        }
        let root_alias = self.root_alias();
        let pk_column = self.spec.entity.primary_key().column.clone();
        let mut inner = Query::select();
        inner.expr(column_expr(&root_alias, &pk_column));
        inner.from(self.root_table());
        self.apply_joins(&mut inner);
        if let Some(cond) = condition {
            inner.cond_where(cond);
        }
        Ok(Some(
            Condition::all().add(column_expr(&root_alias, &pk_column).in_subquery(inner)),
        ))
    }
}

/// Compile the QuerySpec's row-returning SELECT.
pub fn compile_select(registry: &Registry, spec: &QuerySpec) -> Result<CompiledQuery, OrmError> {
    SqlCompiler::new(registry, spec).compile_select()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::Q;
    use crate::query::spec::OrderTerm;
    use crate::tests_cfg::blog_registry;

    fn article_spec() -> (Registry, QuerySpec) {
        let registry = blog_registry();
        let spec = QuerySpec::new(registry.get("article").unwrap().clone());
        (registry, spec)
    }

    #[test]
    fn test_select_all_columns() {
        let (registry, spec) = article_spec();
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled
            .sql
            .starts_with("SELECT \"blog_article\".\"id\", \"blog_article\".\"title\""));
        assert!(compiled.sql.contains("FROM \"blog_article\""));
        assert_eq!(compiled.plan.fields.len(), spec.entity.fields().len());
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_filter_binds_parameters() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("view_count__gte", Value::BigInt(Some(10))));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("\"blog_article\".\"view_count\" >= $1"));
        assert_eq!(compiled.params, vec![Value::BigInt(Some(10))]);
    }

    #[test]
    fn test_repeated_filter_equals_conjunction() {
        let (registry, spec) = article_spec();
        let p1 = Q::new("view_count__gt", Value::BigInt(Some(1)));
        let p2 = Q::new("title__startswith", "Rust");
        let chained = spec.with_filter(p1.clone()).with_filter(p2.clone());
        let combined = spec.with_filter(Q::all([p1, p2]));
        let a = compile_select(&registry, &chained).unwrap();
        let b = compile_select(&registry, &combined).unwrap();
        assert_eq!(a.sql, b.sql);
        assert_eq!(a.params, b.params);
    }

    #[test]
    fn test_exact_null_is_null() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("author", Value::BigInt(None)));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("\"blog_article\".\"author_id\" IS NULL"));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_filter_across_relation_adds_left_join() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("author__name", "Ada"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains(
            "LEFT JOIN \"blog_author\" AS \"author\" ON \"blog_article\".\"author_id\" = \"author\".\"id\""
        ));
        assert!(compiled.sql.contains("\"author\".\"name\" = $1"));
        assert!(compiled.plan.related.is_empty());
    }

    #[test]
    fn test_select_related_plan_positions() {
        let (registry, spec) = article_spec();
        let spec = spec.with_select_related(vec!["author".to_string()]);
        let compiled = compile_select(&registry, &spec).unwrap();
        let main_width = spec.entity.fields().len();
        let author = compiled.plan.related("author").unwrap();
        assert_eq!(author.entity.name(), "author");
        assert_eq!(author.fields[0].position, main_width);
        assert_eq!(compiled.labels[main_width], "author__id");
        assert_eq!(compiled.sql.matches("LEFT JOIN").count(), 1);
    }

    #[test]
    fn test_select_related_rejects_reverse_relation() {
        let (registry, spec) = article_spec();
        let spec = spec.with_select_related(vec!["comments".to_string()]);
        assert!(matches!(
            compile_select(&registry, &spec),
            Err(OrmError::InvalidQueryError(_))
        ));
    }

    #[test]
    fn test_order_and_limit() {
        let (registry, spec) = article_spec();
        let spec = spec
            .with_ordering(vec![OrderTerm::parse("-view_count").unwrap()])
            .sliced(3, Some(6))
            .unwrap();
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled
            .sql
            .contains("ORDER BY \"blog_article\".\"view_count\" DESC"));
        assert!(compiled.sql.contains("LIMIT $1 OFFSET $2"));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_distinct_and_distinct_on() {
        let (registry, spec) = article_spec();
        let plain = compile_select(&registry, &spec.with_distinct(Vec::new())).unwrap();
        assert!(plain.sql.starts_with("SELECT DISTINCT "));
        let on = compile_select(&registry, &spec.with_distinct(vec!["title".to_string()])).unwrap();
        assert!(on.sql.contains("DISTINCT ON ("));
        assert!(on.sql.contains("\"title\""));
    }

    #[test]
    fn test_exclude_negates() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(Q::new("is_published", true));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("NOT"));
    }

    #[test]
    fn test_exclude_nullable_column_keeps_null_rows() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(Q::new("author_id", Value::BigInt(Some(1))));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains(
            "NOT (\"blog_article\".\"author_id\" = $1 AND \"blog_article\".\"author_id\" IS NOT NULL)"
        ));
    }

    #[test]
    fn test_exclude_across_forward_relation_guards_join_miss() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(Q::new("author__name", "Ada"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("LEFT JOIN \"blog_author\" AS \"author\""));
        assert!(compiled
            .sql
            .contains("NOT (\"author\".\"name\" = $1 AND \"author\".\"name\" IS NOT NULL)"));
    }

    #[test]
    fn test_exclude_null_test_is_not_guarded() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(Q::new("author__isnull", true));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(!compiled.sql.contains("IS NOT NULL"));

        let spec = QuerySpec::new(spec.entity.clone()).with_exclude(Q::new("is_published", true));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(!compiled.sql.contains("IS NOT NULL"));
    }

    #[test]
    fn test_exclude_multi_valued_path_uses_pk_subquery() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(Q::new("comments__body", "spam"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains(
            "NOT \"blog_article\".\"id\" IN (SELECT \"blog_article\".\"id\" FROM \"blog_article\" LEFT JOIN \"blog_comment\" AS \"comments\""
        ));
        // the outer query stays one row per article
        assert_eq!(compiled.sql.matches("LEFT JOIN").count(), 1);
        assert_eq!(compiled.params, vec![Value::String(Some("spam".to_string()))]);
    }

    #[test]
    fn test_double_negation_is_plain_filter() {
        let (registry, spec) = article_spec();
        let spec = spec.with_exclude(!Q::new("comments__body", "spam"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(!compiled.sql.contains("IN (SELECT"));
        assert!(compiled.sql.contains("\"comments\".\"body\" = $1"));
    }

    #[test]
    fn test_or_uses_disjunction() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("title", "a") | Q::new("title", "b"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains(" OR "));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_only_keeps_primary_key() {
        let (registry, spec) = article_spec();
        let spec = spec.with_loading(Loading::Only(vec!["title".to_string()]));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert_eq!(compiled.labels, vec!["id".to_string(), "title".to_string()]);
    }

    #[test]
    fn test_defer_drops_column() {
        let (registry, spec) = article_spec();
        let spec = spec.with_loading(Loading::Defer(vec!["content".to_string()]));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(!compiled.labels.contains(&"content".to_string()));
        assert!(compiled.labels.contains(&"title".to_string()));
    }

    #[test]
    fn test_count_statement() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("is_published", true));
        let compiled = SqlCompiler::new(&registry, &spec).compile_count().unwrap();
        assert!(compiled.sql.starts_with("SELECT COUNT(*) AS \"__count\" FROM \"blog_article\""));
        assert!(compiled.sql.contains("WHERE"));
        assert!(!compiled.sql.contains("\"title\""));
    }

    #[test]
    fn test_count_of_slice_uses_subquery() {
        let (registry, spec) = article_spec();
        let spec = spec.sliced(0, Some(5)).unwrap();
        let compiled = SqlCompiler::new(&registry, &spec).compile_count().unwrap();
        assert!(compiled.sql.contains("AS \"subquery\""));
    }

    #[test]
    fn test_aggregate_statement() {
        let (registry, spec) = article_spec();
        let compiled = SqlCompiler::new(&registry, &spec)
            .compile_aggregate(&[("total".to_string(), Aggregate::sum("view_count"))])
            .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT SUM(\"blog_article\".\"view_count\") AS \"total\" FROM \"blog_article\""
        );
        assert_eq!(compiled.labels, vec!["total".to_string()]);
    }

    #[test]
    fn test_values_with_annotation_groups() {
        let (registry, spec) = article_spec();
        let spec = spec
            .with_projection(Projection::Values(vec!["author".to_string()]))
            .with_annotations(vec![("n".to_string(), Aggregate::count("*"))]);
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("GROUP BY \"blog_article\".\"author_id\""));
        assert_eq!(compiled.labels, vec!["author".to_string(), "n".to_string()]);
        assert!(compiled.sql.contains("COUNT(*) AS \"n\""));
    }

    #[test]
    fn test_aggregate_over_grouped_query_wraps_subquery() {
        let (registry, spec) = article_spec();
        let spec = spec
            .with_projection(Projection::Values(vec!["author_id".to_string()]))
            .with_annotations(vec![("n".to_string(), Aggregate::count("*"))]);
        let compiled = SqlCompiler::new(&registry, &spec)
            .compile_aggregate(&[
                ("m".to_string(), Aggregate::max("n")),
                ("groups".to_string(), Aggregate::count("*")),
            ])
            .unwrap();
        assert!(compiled.sql.starts_with(
            "SELECT MAX(\"subquery\".\"n\") AS \"m\", COUNT(*) AS \"groups\" FROM (SELECT"
        ));
        assert!(compiled.sql.contains("GROUP BY \"blog_article\".\"author_id\") AS \"subquery\""));
        assert_eq!(compiled.labels, vec!["m".to_string(), "groups".to_string()]);
    }

    #[test]
    fn test_aggregate_over_grouped_query_needs_selected_column() {
        let (registry, spec) = article_spec();
        let spec = spec
            .with_projection(Projection::Values(vec!["author_id".to_string()]))
            .with_annotations(vec![("n".to_string(), Aggregate::count("*"))]);
        let err = SqlCompiler::new(&registry, &spec)
            .compile_aggregate(&[("v".to_string(), Aggregate::sum("view_count"))])
            .unwrap_err();
        assert!(err.to_string().contains("view_count"));
    }

    #[test]
    fn test_many_to_many_filter_joins_through_table() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("tags__name", "rust"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled
            .sql
            .contains("LEFT JOIN \"blog_article_tags\" AS \"tags__through\""));
        assert!(compiled.sql.contains("LEFT JOIN \"blog_tag\" AS \"tags\""));
    }

    #[test]
    fn test_icontains_escapes_wildcards() {
        let (registry, spec) = article_spec();
        let spec = spec.with_filter(Q::new("title__icontains", "50%"));
        let compiled = compile_select(&registry, &spec).unwrap();
        assert!(compiled.sql.contains("UPPER(\"blog_article\".\"title\") LIKE $1"));
        assert_eq!(
            compiled.params,
            vec![Value::String(Some("%50\\%%".to_string()))]
        );
    }
}
