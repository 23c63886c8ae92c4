//! Generic repository over declared record types.
//!
//! A [`Record`] is any row type that declares its table layout as const
//! metadata and can be decoded from a row: a capability set, not a base
//! class. [`Repository<T>`] then provides typed CRUD, filtered queries,
//! pagination, counts and existence checks against a caller-supplied
//! [`Session`]. Soft deletion is a further capability ([`SoftDeletable`])
//! checked at the type level: `soft_delete`/`restore` simply do not exist
//! for types that lack the marker column.
//!
//! Two deliberate behaviors worth knowing before use:
//!
//! - Generic reads **never** filter soft-deleted rows. A row with
//!   `deleted_at` set is returned by `get`, `get_all` and friends like any
//!   other; callers wanting active-only semantics must add the predicate
//!   themselves.
//! - Mutations open a single-operation transaction when the session has
//!   none; an already-open transaction is joined, never committed from here.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Sqlite};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::schema::ColumnDef;
use crate::session::Session;

/// Column name for the store-assigned creation timestamp.
pub const CREATED_AT: &str = "created_at";
/// Column name for the store-assigned update timestamp.
pub const UPDATED_AT: &str = "updated_at";
/// Column name for the soft-delete marker.
pub const DELETED_AT: &str = "deleted_at";

/// A row type the repository can manage.
///
/// Declared columns drive everything: the select list, column-name
/// validation of field maps and predicates, and store-assigned timestamps
/// (`created_at`/`updated_at` are populated automatically when declared).
pub trait Record: for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin {
    /// Table name.
    const TABLE: &'static str;
    /// Declared columns, including exactly one primary key.
    const COLUMNS: &'static [ColumnDef];
    /// Entity name used in logs and error context.
    const ENTITY: &'static str = Self::TABLE;

    /// Primary key value of this row.
    fn id(&self) -> i64;
}

/// Capability marker for records with a `deleted_at` column.
///
/// Declaring this trait is what makes [`Repository::soft_delete`] and
/// [`Repository::restore`] available; there is no runtime probing.
pub trait SoftDeletable: Record {
    /// When the row was soft-deleted, if it is.
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    /// Whether the row is currently soft-deleted.
    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

/// Ordered column/value pairs for `create` and `update`.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builder-style setter.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.push((column.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|(c, _)| c == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// JSON view for diagnostic error context.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (c, v) in &self.0 {
            map.insert(c.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// Equality conjunction over columns: every pair must match.
///
/// `Value::Null` matches SQL `IS NULL`.
#[derive(Debug, Clone, Default)]
pub struct Predicate(Vec<(String, Value)>);

impl Predicate {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add an equality condition.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// JSON view for diagnostic error context.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (c, v) in &self.0 {
            map.insert(c.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// Build a [`Fields`] map: `fields!{"name" => "a", "active" => true}`.
#[macro_export]
macro_rules! fields {
    () => { $crate::repository::Fields::new() };
    ($($col:literal => $val:expr),+ $(,)?) => {{
        let mut f = $crate::repository::Fields::new();
        $( f.insert($col, ::serde_json::Value::from($val)); )+
        f
    }};
}

/// Build a [`Predicate`]: `predicate!{"email" => "a@b", "active" => true}`.
#[macro_export]
macro_rules! predicate {
    () => { $crate::repository::Predicate::new() };
    ($($col:literal => $val:expr),+ $(,)?) => {{
        let mut p = $crate::repository::Predicate::new();
        $( p = p.eq($col, ::serde_json::Value::from($val)); )+
        p
    }};
}

/// A bindable SQL parameter value.
#[derive(Debug, Clone)]
pub(crate) enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(v) => SqlParam::Bool(*v),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlParam::Int(i)
                } else if let Some(f) = n.as_f64() {
                    SqlParam::Float(f)
                } else {
                    SqlParam::Text(n.to_string())
                }
            }
            Value::String(v) => SqlParam::Text(v.clone()),
            // No native JSON storage class; keep the serialized form.
            other => SqlParam::Text(other.to_string()),
        }
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;
type SqliteQueryAs<'q, T> = sqlx::query::QueryAs<'q, Sqlite, T, SqliteArguments<'q>>;

fn bind_param<'q>(query: SqliteQuery<'q>, param: &'q SqlParam) -> SqliteQuery<'q> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

fn bind_param_as<'q, T>(query: SqliteQueryAs<'q, T>, param: &'q SqlParam) -> SqliteQueryAs<'q, T> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

/// Render a predicate into `WHERE` fragments and bind parameters.
fn where_clause(predicate: &Predicate) -> (Vec<String>, Vec<SqlParam>) {
    let mut fragments = Vec::new();
    let mut params = Vec::new();
    for (column, value) in predicate.iter() {
        if value.is_null() {
            fragments.push(format!("{column} IS NULL"));
        } else {
            fragments.push(format!("{column} = ?"));
            params.push(SqlParam::from(value));
        }
    }
    (fragments, params)
}

/// Typed CRUD facade over one record type.
///
/// Stateless: every operation runs against the `&mut Session` the caller
/// supplies, so one repository value can serve any number of sessions.
pub struct Repository<T: Record> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Repository<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Record> Copy for Repository<T> {}

impl<T: Record> Default for Repository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("table", &T::TABLE).finish()
    }
}

impl<T: Record> Repository<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn pk() -> StoreResult<&'static str> {
        T::COLUMNS
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name)
            .ok_or_else(|| {
                StoreError::store(
                    "schema",
                    T::ENTITY,
                    None,
                    format!("table {} declares no primary key", T::TABLE),
                )
            })
    }

    fn has_column(name: &str) -> bool {
        T::COLUMNS.iter().any(|c| c.name == name)
    }

    fn select_list() -> String {
        T::COLUMNS
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Column names are interpolated into SQL, so they are validated against
    /// the declared columns first. Unknown names fail and never reach the
    /// statement text.
    fn check_columns<'a>(
        operation: &str,
        names: impl Iterator<Item = &'a str>,
    ) -> StoreResult<()> {
        for name in names {
            if !Self::has_column(name) {
                return Err(StoreError::store(
                    operation,
                    T::ENTITY,
                    None,
                    format!("unknown column '{}' for table {}", name, T::TABLE),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads (autocommit; never filter soft-deleted rows)
    // ------------------------------------------------------------------

    /// Get a record by primary key. Returns `None` when absent.
    pub async fn get(&self, session: &mut Session, id: i64) -> StoreResult<Option<T>> {
        debug!(entity = T::ENTITY, id, "get");
        self.fetch_by_pk(session, id, "get").await
    }

    /// Get a record by primary key, failing with `NotFound` when absent.
    pub async fn get_or_fail(&self, session: &mut Session, id: i64) -> StoreResult<T> {
        match self.get(session, id).await? {
            Some(record) => Ok(record),
            None => {
                warn!(entity = T::ENTITY, id, "record not found");
                Err(StoreError::not_found(
                    T::ENTITY,
                    format!("{}={}", Self::pk()?, id),
                ))
            }
        }
    }

    /// Get a single record matching the predicate.
    ///
    /// When several rows match, which one is returned is unspecified; add
    /// explicit ordering in a custom query if determinism is required.
    pub async fn get_by(
        &self,
        session: &mut Session,
        predicate: &Predicate,
    ) -> StoreResult<Option<T>> {
        debug!(entity = T::ENTITY, predicate = ?predicate.to_json(), "get_by");
        Self::check_columns("get_by", predicate.iter().map(|(c, _)| c))?;

        let (fragments, params) = where_clause(predicate);
        let mut sql = format!("SELECT {} FROM {}", Self::select_list(), T::TABLE);
        if !fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragments.join(" AND "));
        }
        sql.push_str(" LIMIT 1");

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query_as::<_, T>(&sql);
        for param in &params {
            query = bind_param_as(query, param);
        }
        query
            .fetch_optional(conn)
            .await
            .map_err(|e| StoreError::from_driver("get_by", T::ENTITY, Some(predicate.to_json()), e))
    }

    /// Like [`get_by`](Self::get_by), failing with `NotFound` when nothing
    /// matches.
    pub async fn get_by_or_fail(
        &self,
        session: &mut Session,
        predicate: &Predicate,
    ) -> StoreResult<T> {
        match self.get_by(session, predicate).await? {
            Some(record) => Ok(record),
            None => {
                warn!(entity = T::ENTITY, predicate = ?predicate.to_json(), "record not found");
                Err(StoreError::not_found(
                    T::ENTITY,
                    predicate.to_json().to_string(),
                ))
            }
        }
    }

    /// List records in insertion order with pagination. `limit: None` means
    /// unbounded.
    pub async fn get_all(
        &self,
        session: &mut Session,
        offset: u64,
        limit: Option<u64>,
    ) -> StoreResult<Vec<T>> {
        self.filter(session, &Predicate::new(), offset, limit).await
    }

    /// List records matching the predicate, in insertion order, paginated.
    pub async fn filter(
        &self,
        session: &mut Session,
        predicate: &Predicate,
        offset: u64,
        limit: Option<u64>,
    ) -> StoreResult<Vec<T>> {
        debug!(
            entity = T::ENTITY,
            predicate = ?predicate.to_json(),
            offset,
            limit = ?limit,
            "filter"
        );
        Self::check_columns("filter", predicate.iter().map(|(c, _)| c))?;

        let pk = Self::pk()?;
        let (fragments, params) = where_clause(predicate);
        let mut sql = format!("SELECT {} FROM {}", Self::select_list(), T::TABLE);
        if !fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragments.join(" AND "));
        }
        // Integer primary keys alias the rowid, so pk order is insertion
        // order. LIMIT -1 is SQLite for "no limit".
        sql.push_str(&format!(" ORDER BY {pk} LIMIT ? OFFSET ?"));

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query_as::<_, T>(&sql);
        for param in &params {
            query = bind_param_as(query, param);
        }
        query = query
            .bind(limit.map(|l| l as i64).unwrap_or(-1))
            .bind(offset as i64);
        query
            .fetch_all(conn)
            .await
            .map_err(|e| StoreError::from_driver("filter", T::ENTITY, Some(predicate.to_json()), e))
    }

    /// Count records, optionally restricted by a predicate.
    pub async fn count(
        &self,
        session: &mut Session,
        predicate: Option<&Predicate>,
    ) -> StoreResult<u64> {
        let empty = Predicate::new();
        let predicate = predicate.unwrap_or(&empty);
        Self::check_columns("count", predicate.iter().map(|(c, _)| c))?;
        let (fragments, params) = where_clause(predicate);

        let mut sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        if !fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragments.join(" AND "));
        }

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for param in &params {
            query = bind_param_as(query, param);
        }
        let (count,) = query
            .fetch_one(conn)
            .await
            .map_err(|e| StoreError::from_driver("count", T::ENTITY, Some(predicate.to_json()), e))?;
        Ok(count as u64)
    }

    /// Whether at least one record matches the predicate.
    pub async fn exists(&self, session: &mut Session, predicate: &Predicate) -> StoreResult<bool> {
        Ok(self.count(session, Some(predicate)).await? > 0)
    }

    // ------------------------------------------------------------------
    // Mutations (join an open transaction, or wrap themselves in one)
    // ------------------------------------------------------------------

    /// Insert one record and return it with the generated primary key and
    /// store-assigned timestamps populated.
    ///
    /// Uniqueness and foreign-key conflicts surface as `IntegrityViolation`.
    pub async fn create(&self, session: &mut Session, fields: Fields) -> StoreResult<T> {
        if session.in_transaction() {
            return self.create_inner(session, &fields).await;
        }
        let scope = session.begin().await?;
        match self.create_inner(session, &fields).await {
            Ok(record) => {
                session.commit(scope).await?;
                Ok(record)
            }
            Err(err) => {
                session.abort_scope(scope).await;
                Err(err)
            }
        }
    }

    /// Insert a batch atomically: all rows persist or none do.
    ///
    /// Runs in its own scope even inside an open transaction (a savepoint),
    /// so a mid-batch failure rolls back the whole batch and nothing else.
    pub async fn create_many(
        &self,
        session: &mut Session,
        rows: Vec<Fields>,
    ) -> StoreResult<Vec<T>> {
        debug!(entity = T::ENTITY, count = rows.len(), "create_many");

        let scope = session.begin().await?;
        let mut created = Vec::with_capacity(rows.len());
        for fields in &rows {
            match self.create_inner(session, fields).await {
                Ok(record) => created.push(record),
                Err(err) => {
                    session.abort_scope(scope).await;
                    return Err(err);
                }
            }
        }
        session.commit(scope).await?;
        Ok(created)
    }

    /// Partial update by primary key: only the named fields change, and
    /// `updated_at` is refreshed when declared. Returns the refreshed record,
    /// or `None` when no row has that id.
    pub async fn update(
        &self,
        session: &mut Session,
        id: i64,
        fields: Fields,
    ) -> StoreResult<Option<T>> {
        if session.in_transaction() {
            return self.update_inner(session, id, &fields).await;
        }
        let scope = session.begin().await?;
        match self.update_inner(session, id, &fields).await {
            Ok(record) => {
                session.commit(scope).await?;
                Ok(record)
            }
            Err(err) => {
                session.abort_scope(scope).await;
                Err(err)
            }
        }
    }

    /// Bulk update of every record matching the predicate. Returns the
    /// affected-row count.
    pub async fn update_many(
        &self,
        session: &mut Session,
        predicate: &Predicate,
        fields: Fields,
    ) -> StoreResult<u64> {
        Self::check_columns("update_many", fields.iter().map(|(c, _)| c))?;
        Self::check_columns("update_many", predicate.iter().map(|(c, _)| c))?;
        if fields.is_empty() {
            return Ok(0);
        }

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for (column, value) in fields.iter() {
            sets.push(format!("{column} = ?"));
            params.push(SqlParam::from(value));
        }
        if Self::has_column(UPDATED_AT) && !fields.contains(UPDATED_AT) {
            sets.push(format!("{UPDATED_AT} = ?"));
            params.push(SqlParam::Timestamp(Utc::now()));
        }

        let (fragments, where_params) = where_clause(predicate);
        params.extend(where_params);

        let mut sql = format!("UPDATE {} SET {}", T::TABLE, sets.join(", "));
        if !fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragments.join(" AND "));
        }

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        let result = query.execute(conn).await.map_err(|e| {
            StoreError::from_driver("update_many", T::ENTITY, Some(fields.to_json()), e)
        })?;
        Ok(result.rows_affected())
    }

    /// Hard-delete by primary key. Returns whether a row existed.
    pub async fn delete(&self, session: &mut Session, id: i64) -> StoreResult<bool> {
        let pk = Self::pk()?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", T::TABLE, pk);

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("delete", T::ENTITY, None, e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard-delete every record matching the predicate. An empty predicate
    /// deletes every row in the table. Returns the deleted-row count.
    pub async fn delete_many(
        &self,
        session: &mut Session,
        predicate: &Predicate,
    ) -> StoreResult<u64> {
        Self::check_columns("delete_many", predicate.iter().map(|(c, _)| c))?;

        let (fragments, params) = where_clause(predicate);
        let mut sql = format!("DELETE FROM {}", T::TABLE);
        if !fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragments.join(" AND "));
        }

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        let result = query.execute(conn).await.map_err(|e| {
            StoreError::from_driver("delete_many", T::ENTITY, Some(predicate.to_json()), e)
        })?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn create_inner(&self, session: &mut Session, fields: &Fields) -> StoreResult<T> {
        Self::check_columns("create", fields.iter().map(|(c, _)| c))?;

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for (column, value) in fields.iter() {
            columns.push(column.to_string());
            params.push(SqlParam::from(value));
        }

        let now = Utc::now();
        for ts_column in [CREATED_AT, UPDATED_AT] {
            if Self::has_column(ts_column) && !fields.contains(ts_column) {
                columns.push(ts_column.to_string());
                params.push(SqlParam::Timestamp(now));
            }
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", T::TABLE)
        } else {
            let placeholders = vec!["?"; columns.len()].join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                T::TABLE,
                columns.join(", "),
                placeholders
            )
        };

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        let result = query
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("create", T::ENTITY, Some(fields.to_json()), e))?;

        let id = result.last_insert_rowid();
        match self.fetch_by_pk(session, id, "create").await? {
            Some(record) => Ok(record),
            None => Err(StoreError::store(
                "create",
                T::ENTITY,
                Some(fields.to_json()),
                "inserted row could not be re-read",
            )),
        }
    }

    async fn update_inner(
        &self,
        session: &mut Session,
        id: i64,
        fields: &Fields,
    ) -> StoreResult<Option<T>> {
        Self::check_columns("update", fields.iter().map(|(c, _)| c))?;
        if fields.is_empty() {
            return self.fetch_by_pk(session, id, "update").await;
        }

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for (column, value) in fields.iter() {
            sets.push(format!("{column} = ?"));
            params.push(SqlParam::from(value));
        }
        if Self::has_column(UPDATED_AT) && !fields.contains(UPDATED_AT) {
            sets.push(format!("{UPDATED_AT} = ?"));
            params.push(SqlParam::Timestamp(Utc::now()));
        }

        let pk = Self::pk()?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            T::TABLE,
            sets.join(", "),
            pk
        );

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        let result = query
            .bind(id)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver("update", T::ENTITY, Some(fields.to_json()), e))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch_by_pk(session, id, "update").await
    }

    async fn fetch_by_pk(
        &self,
        session: &mut Session,
        id: i64,
        operation: &str,
    ) -> StoreResult<Option<T>> {
        let pk = Self::pk()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            Self::select_list(),
            T::TABLE,
            pk
        );

        session.trace_sql(&sql);
        let conn = session.conn()?;
        sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(|e| StoreError::from_driver(operation, T::ENTITY, None, e))
    }
}

impl<T: SoftDeletable> Repository<T> {
    /// Mark a record as logically removed by setting its `deleted_at`.
    ///
    /// The row stays in the table and stays visible to every generic read;
    /// only an explicit `deleted_at IS NULL` predicate excludes it. Returns
    /// the refreshed record.
    pub async fn soft_delete(&self, session: &mut Session, record: &T) -> StoreResult<T> {
        self.set_deletion_marker(session, record, Some(Utc::now()), "soft_delete")
            .await
    }

    /// Clear the soft-delete marker. Returns the refreshed record.
    pub async fn restore(&self, session: &mut Session, record: &T) -> StoreResult<T> {
        self.set_deletion_marker(session, record, None, "restore")
            .await
    }

    async fn set_deletion_marker(
        &self,
        session: &mut Session,
        record: &T,
        marker: Option<DateTime<Utc>>,
        operation: &str,
    ) -> StoreResult<T> {
        if session.in_transaction() {
            return self
                .set_deletion_marker_inner(session, record, marker, operation)
                .await;
        }
        let scope = session.begin().await?;
        match self
            .set_deletion_marker_inner(session, record, marker, operation)
            .await
        {
            Ok(refreshed) => {
                session.commit(scope).await?;
                Ok(refreshed)
            }
            Err(err) => {
                session.abort_scope(scope).await;
                Err(err)
            }
        }
    }

    async fn set_deletion_marker_inner(
        &self,
        session: &mut Session,
        record: &T,
        marker: Option<DateTime<Utc>>,
        operation: &str,
    ) -> StoreResult<T> {
        let id = record.id();
        let mut sets = vec![format!("{DELETED_AT} = ?")];
        let mut params = vec![match marker {
            Some(at) => SqlParam::Timestamp(at),
            None => SqlParam::Null,
        }];
        if Self::has_column(UPDATED_AT) {
            sets.push(format!("{UPDATED_AT} = ?"));
            params.push(SqlParam::Timestamp(Utc::now()));
        }

        let pk = Self::pk()?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            T::TABLE,
            sets.join(", "),
            pk
        );

        session.trace_sql(&sql);
        let conn = session.conn()?;
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_param(query, param);
        }
        let result = query
            .bind(id)
            .execute(conn)
            .await
            .map_err(|e| StoreError::from_driver(operation, T::ENTITY, None, e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(T::ENTITY, format!("{pk}={id}")));
        }
        match self.fetch_by_pk(session, id, operation).await? {
            Some(refreshed) => Ok(refreshed),
            None => Err(StoreError::not_found(T::ENTITY, format!("{pk}={id}"))),
        }
    }
}
