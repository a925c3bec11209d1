//! Instance-level persistence: save, delete and refresh a single record.

use std::collections::BTreeMap;

use sea_query::Value;

use crate::config::DEFAULT_DB_ALIAS;
use crate::connection::Connection;
use crate::database::Database;
use crate::error::OrmError;
use crate::executor::{execute_on, query_on};
use crate::hydrate::records_from_rows;
use crate::model::Record;
use crate::query::filter::Q;
use crate::query::mutation::{compile_delete, compile_insert, compile_update};
use crate::query::spec::{Loading, QuerySpec};
use crate::query::compiler::compile_select;
use crate::query::dialect::quote_ident;
use crate::value::is_null;

/// Columns an INSERT of `record` carries: every loaded field except a NULL
/// auto primary key and NULLs in non-nullable fields (left to the column default).
fn insert_values(record: &Record) -> Vec<(usize, Value)> {
    let entity = record.descriptor();
    entity
        .fields()
        .iter()
        .enumerate()
        .filter_map(|(i, field)| {
            let value = record.value_at(i)?;
            if is_null(value) && (field.auto_increment || field.is_primary_key || !field.nullable) {
                return None;
            }
            Some((i, value.clone()))
        })
        .collect()
}

/// INSERT `record` on `conn`, writing generated values back into it.
pub(crate) async fn insert_on(
    conn: &mut dyn Connection,
    record: &mut Record,
) -> Result<(), OrmError> {
    let entity = record.descriptor().clone();
    let compiled = compile_insert(&entity, &insert_values(record))?;
    let rows = query_on(conn, &compiled.sql, &compiled.params).await?;
    let alias = conn.alias().to_string();
    let saved = records_from_rows(&compiled.plan, &rows, &alias)?
        .into_iter()
        .next()
        .ok_or_else(|| OrmError::execution(&compiled.sql, "INSERT returned no row"))?;
    for i in 0..entity.fields().len() {
        if let Some(value) = saved.value_at(i) {
            record.set_at(i, value.clone());
        }
    }
    record.mark_persisted(&alias);
    Ok(())
}

fn pk_spec(record: &Record) -> Result<QuerySpec, OrmError> {
    let entity = record.descriptor();
    let pk = record.pk().cloned().ok_or_else(|| {
        OrmError::invalid(format!(
            "{} object can't be saved, deleted or refreshed without a primary key",
            entity.name()
        ))
    })?;
    Ok(QuerySpec::new(entity.clone()).with_filter(Q::new(&entity.primary_key().name, pk)))
}

/// UPDATE the row of `record` with the given fields; returns the affected count.
pub(crate) async fn update_on(
    conn: &mut dyn Connection,
    db: &Database,
    record: &Record,
    fields: &[usize],
) -> Result<u64, OrmError> {
    let spec = pk_spec(record)?;
    let assignments: Vec<(usize, Value)> = fields
        .iter()
        .filter_map(|&i| record.value_at(i).map(|v| (i, v.clone())))
        .collect();
    if assignments.is_empty() {
        return Ok(0);
    }
    let stmt = compile_update(db.registry(), &spec, &assignments)?;
    execute_on(conn, &stmt.sql, &stmt.params).await
}

impl Record {
    fn alias_or_default(&self) -> String {
        self.db_alias().unwrap_or(DEFAULT_DB_ALIAS).to_string()
    }

    /// INSERT when the record is new, UPDATE every loaded field otherwise.
    pub async fn asave(&mut self, db: &Database) -> Result<(), OrmError> {
        self.asave_fields(db, None).await
    }

    /// Like [`Record::asave`], restricting an UPDATE to `update_fields`.
    ///
    /// A persisted record whose row is gone is inserted again, unless
    /// `update_fields` is given, which is then an error.
    pub async fn asave_fields(
        &mut self,
        db: &Database,
        update_fields: Option<&[&str]>,
    ) -> Result<(), OrmError> {
        let entity = self.descriptor().clone();
        let fields: Vec<usize> = match update_fields {
            Some(names) => {
                let mut out = Vec::new();
                for name in names {
                    let index = entity.require_field(name)?;
                    if index == entity.pk_index() {
                        return Err(OrmError::invalid(
                            "the primary key cannot be listed in update_fields",
                        ));
                    }
                    out.push(index);
                }
                out
            }
            None => (0..entity.fields().len())
                .filter(|&i| i != entity.pk_index() && self.value_at(i).is_some())
                .collect(),
        };
        let mut conn = db.executor(&self.alias_or_default()).acquire().await?;
        if self.pk().is_none() {
            return insert_on(conn.as_mut(), self).await;
        }
        if fields.is_empty() && self.is_persisted() {
            return Ok(());
        }
        let updated = update_on(conn.as_mut(), db, self, &fields).await?;
        if updated > 0 {
            let alias = conn.alias().to_string();
            self.mark_persisted(&alias);
            return Ok(());
        }
        if update_fields.is_some() {
            return Err(OrmError::execution(
                format!("UPDATE {}", quote_ident(entity.table_name())),
                "save with update_fields did not affect any rows",
            ));
        }
        insert_on(conn.as_mut(), self).await
    }

    /// DELETE the row; the record keeps its values but loses its primary key.
    pub async fn adelete(&mut self, db: &Database) -> Result<(u64, BTreeMap<String, u64>), OrmError> {
        let spec = pk_spec(self)?;
        let stmt = compile_delete(db.registry(), &spec)?;
        let deleted = db
            .executor(&self.alias_or_default())
            .execute(&stmt.sql, &stmt.params)
            .await?;
        let pk = self.descriptor().pk_index();
        let null = crate::value::null_of(self.descriptor().fields()[pk].field_type);
        self.set_at(pk, null);
        self.mark_new();
        let mut breakdown = BTreeMap::new();
        breakdown.insert(self.entity_name().to_string(), deleted);
        Ok((deleted, breakdown))
    }

    /// Reload fields from the database (every field, or only `fields`).
    pub async fn arefresh_from_db(
        &mut self,
        db: &Database,
        fields: Option<&[&str]>,
    ) -> Result<(), OrmError> {
        let mut spec = pk_spec(self)?;
        if let Some(names) = fields {
            for name in names {
                self.descriptor().require_field(name)?;
            }
            spec = spec.with_loading(Loading::Only(names.iter().map(|n| n.to_string()).collect()));
        }
        let compiled = compile_select(db.registry(), &spec)?;
        let alias = self.alias_or_default();
        let rows = db
            .executor(&alias)
            .fetch_all(&compiled.sql, &compiled.params)
            .await?;
        let fresh = records_from_rows(&compiled.plan, &rows, &alias)?
            .into_iter()
            .next()
            .ok_or_else(|| OrmError::DoesNotExist {
                entity: self.entity_name().to_string(),
            })?;
        for i in 0..self.descriptor().fields().len() {
            if let Some(value) = fresh.value_at(i) {
                self.set_at(i, value.clone());
            }
        }
        self.mark_persisted(&alias);
        Ok(())
    }
}
