//! Row shaping for single-table select, insert, update and delete
//!
//! Column bindings use `@col_<name>` (insert) and `@set_<name>` (update) so
//! they never collide with the `@whr<N>` placeholders of a compiled predicate.

use crate::database::Database;
use crate::engine::{Row, RunResult};
use crate::error::{SqliteError, SqliteResult};
use crate::predicate::{compile, CompiledWhere, Predicate};
use crate::schema::check_identifier;
use crate::scope::Scope;
use crate::value::{Params, Value};

/// SQL Query with typed parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Params,
}

impl SqlQuery {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            params: Params::new(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Options for reads; per-call options are merged over table defaults
#[derive(Debug, Default, Clone)]
pub struct SelectOptions {
    pub columns: Option<Vec<String>>,
    pub order_by: Vec<(String, bool)>, // (column, is_ascending)
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub scope: Option<Scope>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order_by.push((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn scope(mut self, scope: &Scope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    /// Values set in `overrides` win; a non-empty `order_by` replaces ours.
    pub fn merge(self, overrides: SelectOptions) -> SelectOptions {
        SelectOptions {
            columns: overrides.columns.or(self.columns),
            order_by: if overrides.order_by.is_empty() {
                self.order_by
            } else {
                overrides.order_by
            },
            limit: overrides.limit.or(self.limit),
            offset: overrides.offset.or(self.offset),
            scope: overrides.scope.or(self.scope),
        }
    }
}

/// A named table on a [`Database`]
#[derive(Clone)]
pub struct Table {
    db: Database,
    name: String,
    defaults: SelectOptions,
}

impl Table {
    pub(crate) fn new(db: Database, name: &str) -> SqliteResult<Self> {
        check_identifier(name)?;
        Ok(Self {
            db,
            name: name.to_string(),
            defaults: SelectOptions::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options applied to every read unless a call overrides them
    pub fn with_defaults(mut self, defaults: SelectOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn select(
        &self,
        predicate: Option<&Predicate>,
        options: SelectOptions,
    ) -> SqliteResult<Vec<Row>> {
        let options = self.defaults.clone().merge(options);
        let query = select_query(&self.name, &compile(predicate)?, &options)?;
        self.db
            .all(&query.statement, &query.params, options.scope.as_ref())
            .await
    }

    pub async fn select_one(
        &self,
        predicate: Option<&Predicate>,
        options: SelectOptions,
    ) -> SqliteResult<Option<Row>> {
        let options = self.defaults.clone().merge(options).limit(1);
        let query = select_query(&self.name, &compile(predicate)?, &options)?;
        self.db
            .get(&query.statement, &query.params, options.scope.as_ref())
            .await
    }

    pub async fn count(
        &self,
        predicate: Option<&Predicate>,
        scope: Option<&Scope>,
    ) -> SqliteResult<i64> {
        let filter = compile(predicate)?;
        let statement = with_filter(format!("SELECT COUNT(*) AS count FROM {}", self.name), &filter);
        let row = self.db.get(&statement, &filter.parameters, scope).await?;
        match row.as_ref().and_then(|row| row.get("count")) {
            Some(Value::Integer(count)) => Ok(*count),
            other => Err(SqliteError::InvalidOperation(format!(
                "unexpected count result {:?}",
                other
            ))),
        }
    }

    pub async fn insert(&self, row: &Row, scope: Option<&Scope>) -> SqliteResult<RunResult> {
        let query = insert_query(&self.name, row)?;
        self.db.run(&query.statement, &query.params, scope).await
    }

    pub async fn update(
        &self,
        set: &Row,
        predicate: Option<&Predicate>,
        scope: Option<&Scope>,
    ) -> SqliteResult<RunResult> {
        let query = update_query(&self.name, set, &compile(predicate)?)?;
        self.db.run(&query.statement, &query.params, scope).await
    }

    pub async fn delete(
        &self,
        predicate: Option<&Predicate>,
        scope: Option<&Scope>,
    ) -> SqliteResult<RunResult> {
        let filter = compile(predicate)?;
        let statement = with_filter(format!("DELETE FROM {}", self.name), &filter);
        self.db.run(&statement, &filter.parameters, scope).await
    }
}

fn with_filter(statement: String, filter: &CompiledWhere) -> String {
    if filter.is_empty() {
        statement
    } else {
        format!("{} {}", statement, filter.query)
    }
}

/// Columns in a stable order so generated SQL is deterministic
fn sorted_columns(row: &Row) -> SqliteResult<Vec<(&String, &Value)>> {
    let mut columns: Vec<_> = row.iter().collect();
    columns.sort_by(|a, b| a.0.cmp(b.0));
    for (column, _) in &columns {
        check_identifier(column)?;
    }
    Ok(columns)
}

pub fn select_query(
    table: &str,
    filter: &CompiledWhere,
    options: &SelectOptions,
) -> SqliteResult<SqlQuery> {
    let columns = match &options.columns {
        Some(columns) if !columns.is_empty() => {
            for column in columns {
                check_identifier(column)?;
            }
            columns.join(", ")
        }
        _ => "*".to_string(),
    };

    let mut statement = with_filter(format!("SELECT {} FROM {}", columns, table), filter);
    if !options.order_by.is_empty() {
        let mut terms = Vec::with_capacity(options.order_by.len());
        for (column, ascending) in &options.order_by {
            check_identifier(column)?;
            terms.push(format!("{} {}", column, if *ascending { "ASC" } else { "DESC" }));
        }
        statement.push_str(" ORDER BY ");
        statement.push_str(&terms.join(", "));
    }
    match (options.limit, options.offset) {
        (Some(limit), Some(offset)) => {
            statement.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
        }
        (Some(limit), None) => statement.push_str(&format!(" LIMIT {}", limit)),
        // SQLite only accepts OFFSET after a LIMIT.
        (None, Some(offset)) => statement.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        (None, None) => {}
    }

    Ok(SqlQuery::new(&statement).with_params(filter.parameters.clone()))
}

pub fn insert_query(table: &str, row: &Row) -> SqliteResult<SqlQuery> {
    let columns = sorted_columns(row)?;
    if columns.is_empty() {
        return Ok(SqlQuery::new(&format!("INSERT INTO {} DEFAULT VALUES", table)));
    }

    let mut params = Params::new();
    let mut names = Vec::with_capacity(columns.len());
    let mut placeholders = Vec::with_capacity(columns.len());
    for (column, value) in columns {
        let placeholder = format!("@col_{}", column);
        params.insert(&placeholder, value.clone());
        names.push(column.as_str());
        placeholders.push(placeholder);
    }

    let statement = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        placeholders.join(", ")
    );
    Ok(SqlQuery::new(&statement).with_params(params))
}

pub fn update_query(table: &str, set: &Row, filter: &CompiledWhere) -> SqliteResult<SqlQuery> {
    let columns = sorted_columns(set)?;
    if columns.is_empty() {
        return Err(SqliteError::InvalidOperation(format!(
            "update of {} sets no columns",
            table
        )));
    }

    let mut params = Params::new();
    let mut assignments = Vec::with_capacity(columns.len());
    for (column, value) in columns {
        let placeholder = format!("@set_{}", column);
        params.insert(&placeholder, value.clone());
        assignments.push(format!("{} = {}", column, placeholder));
    }
    params.extend(filter.parameters.clone());

    let statement = with_filter(
        format!("UPDATE {} SET {}", table, assignments.join(", ")),
        filter,
    );
    Ok(SqlQuery::new(&statement).with_params(params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn select_with_filter_order_and_paging() {
        let filter = compile(Some(&Predicate::eq("name", "John"))).unwrap();
        let options = SelectOptions::new()
            .columns(&["id", "name"])
            .order_by("age", false)
            .limit(10)
            .offset(20);
        let query = select_query("users", &filter, &options).unwrap();
        assert_eq!(
            query.statement,
            "SELECT id, name FROM users WHERE name = @whr1 ORDER BY age DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(query.params, Params::new().with_value("@whr1", "John"));
    }

    #[test]
    fn offset_without_limit() {
        let options = SelectOptions::new().offset(5);
        let query = select_query("users", &CompiledWhere::default(), &options).unwrap();
        assert_eq!(query.statement, "SELECT * FROM users LIMIT -1 OFFSET 5");
    }

    #[test]
    fn insert_binds_sorted_columns() {
        let query = insert_query(
            "users",
            &row(&[("name", "John".into()), ("age", 30.into())]),
        )
        .unwrap();
        assert_eq!(
            query.statement,
            "INSERT INTO users (age, name) VALUES (@col_age, @col_name)"
        );
        assert_eq!(
            query.params,
            Params::new()
                .with_value("@col_age", 30)
                .with_value("@col_name", "John")
        );
        assert_eq!(
            insert_query("users", &Row::new()).unwrap().statement,
            "INSERT INTO users DEFAULT VALUES"
        );
    }

    #[test]
    fn update_keeps_set_and_where_params_apart() {
        let filter = compile(Some(&Predicate::eq("age", 30))).unwrap();
        let query = update_query("users", &row(&[("age", 31.into())]), &filter).unwrap();
        assert_eq!(query.statement, "UPDATE users SET age = @set_age WHERE age = @whr1");
        assert_eq!(
            query.params,
            Params::new()
                .with_value("@set_age", 31)
                .with_value("@whr1", 30)
        );
        assert!(update_query("users", &Row::new(), &filter).is_err());
    }

    #[test]
    fn column_names_are_checked() {
        assert!(insert_query("users", &row(&[("bad name", Value::Null)])).is_err());
        let options = SelectOptions::new().order_by("age; DROP TABLE users", true);
        assert!(select_query("users", &CompiledWhere::default(), &options).is_err());
        assert!(matches!(
            compile(Some(&Predicate::eq("1=1 OR id", -1))),
            Err(SqliteError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn merge_prefers_overrides() {
        let defaults = SelectOptions::new().order_by("id", true).limit(50);
        let merged = defaults.clone().merge(SelectOptions::new().limit(5));
        assert_eq!(merged.limit, Some(5));
        assert_eq!(merged.order_by, vec![("id".to_string(), true)]);

        let merged = defaults.merge(SelectOptions::new().order_by("name", false));
        assert_eq!(merged.order_by, vec![("name".to_string(), false)]);
        assert_eq!(merged.limit, Some(50));
    }
}
