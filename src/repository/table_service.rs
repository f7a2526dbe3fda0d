use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "lease_charges",
    "leases",
    "message_logs",
    "notification_markers",
    "organization_members",
    "rent_payments",
];

/// Ascending order and paging for `list_rows`.
#[derive(Debug, Clone, Copy)]
pub struct ListOptions<'a> {
    pub order_by: &'a str,
    pub limit: i64,
    pub offset: i64,
}

impl<'a> ListOptions<'a> {
    pub fn ordered(order_by: &'a str, limit: i64) -> Self {
        Self {
            order_by,
            limit,
            offset: 0,
        }
    }

    pub fn page(self, offset: i64) -> Self {
        Self { offset, ..self }
    }
}

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    options: ListOptions<'_>,
) -> Result<Vec<Value>, AppError> {
    let mut query = build_list_query(table, filters, options)?;
    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

/// Pages through `list_rows` until a short page comes back.
pub async fn list_all_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    options: ListOptions<'_>,
) -> Result<Vec<Value>, AppError> {
    let page_size = options.limit.clamp(1, MAX_PAGE_SIZE);
    let mut offset = 0;
    let mut collected = Vec::new();
    loop {
        let page = list_rows(
            pool,
            table,
            filters,
            ListOptions {
                limit: page_size,
                ..options
            }
            .page(offset),
        )
        .await?;
        let fetched = page.len() as i64;
        collected.extend(page);
        if fetched < page_size {
            return Ok(collected);
        }
        offset += page_size;
    }
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_equals(
        &mut query,
        id_name,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_columns(payload)?;

    // jsonb_populate_record lets PostgreSQL coerce uuid/date/enum columns.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(*key);
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(*key);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

/// Update one row while every `guards` filter still matches it.
///
/// Returns `None` when no row matched, either because it is gone or because a
/// guarded column changed since it was read.
pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
    guards: Option<&Map<String, Value>>,
) -> Result<Option<Value>, AppError> {
    let mut query = build_update_query(table, row_id, payload, id_field, guards)?;

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

const MAX_PAGE_SIZE: i64 = 1000;

fn build_list_query<'q>(
    table: &str,
    filters: Option<&Map<String, Value>>,
    options: ListOptions<'_>,
) -> Result<QueryBuilder<'q, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if options.order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(options.order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    // Stable tiebreak so paging never skips rows that share an order value.
    query.push(" ORDER BY t.").push(order_name).push(" ASC");
    if order_name != "id" {
        query.push(", t.id ASC");
    }
    query
        .push(" LIMIT ")
        .push_bind(options.limit.clamp(1, MAX_PAGE_SIZE))
        .push(" OFFSET ")
        .push_bind(options.offset.max(0));

    Ok(query)
}

fn build_update_query<'q>(
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
    guards: Option<&Map<String, Value>>,
) -> Result<QueryBuilder<'q, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(*key);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(*key);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_equals(
        &mut query,
        id_name,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    if let Some(guard_map) = guards {
        for (key, value) in guard_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }
    query.push(" RETURNING row_to_json(t) AS row");

    Ok(query)
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<&str>, AppError> {
    let mut keys = payload
        .keys()
        .map(|key| validate_identifier(key))
        .collect::<Result<Vec<_>, _>>()?;
    keys.sort_unstable();
    Ok(keys)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    let valid = !trimmed.is_empty()
        && trimmed.chars().all(|character| {
            character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
        })
        && !trimmed.starts_with(|first: char| first.is_ascii_digit());
    if valid {
        Ok(trimmed)
    } else {
        Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    In,
    IsNull,
}

/// Split `status__in` into (`status`, `In`). Unknown suffixes stay part of the column.
fn parse_filter_key(filter_key: &str) -> Result<(&str, Comparison), AppError> {
    let parsed = filter_key
        .rsplit_once("__")
        .and_then(|(column, suffix)| {
            let comparison = match suffix {
                "in" => Comparison::In,
                "is_null" => Comparison::IsNull,
                _ => return None,
            };
            Some((column, comparison))
        })
        .unwrap_or((filter_key, Comparison::Eq));

    Ok((validate_identifier(parsed.0)?, parsed.1))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, comparison) = parse_filter_key(filter_key)?;

    if comparison == Comparison::IsNull {
        let should_be_null = value.as_bool().unwrap_or(true);
        query.push(" AND t.").push(column);
        query.push(if should_be_null {
            " IS NULL"
        } else {
            " IS NOT NULL"
        });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if items.is_empty() {
                // An empty IN list matches nothing.
                query.push(" AND FALSE");
                return Ok(());
            }
            query.push(" AND ");
            push_any(query, column, items);
            Ok(())
        }
        _ if comparison == Comparison::In => Err(AppError::BadRequest(format!(
            "Filter '{filter_key}' expects an array value."
        ))),
        _ => {
            query.push(" AND ");
            push_equals(query, column, &infer_scalar(column, value));
            Ok(())
        }
    }
}

fn push_equals(query: &mut QueryBuilder<Postgres>, column: &str, value: &Scalar) {
    query.push("t.").push(column);
    let operator = " = ";
    match value {
        Scalar::Text(text) => {
            query.push("::text").push(operator).push_bind(text.clone());
        }
        Scalar::Uuid(id) => {
            query.push(operator).push_bind(*id);
        }
        Scalar::Bool(flag) => {
            query.push(operator).push_bind(*flag);
        }
        Scalar::I64(number) => {
            query.push(operator).push_bind(*number);
        }
        Scalar::Date(date) => {
            query.push(operator).push_bind(*date);
        }
    }
}

fn push_any(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    query.push("t.").push(column);
    let scalars = items
        .iter()
        .map(|item| infer_scalar(column, item))
        .collect::<Vec<_>>();

    let uuids = scalars
        .iter()
        .map(|scalar| match scalar {
            Scalar::Uuid(id) => Some(*id),
            _ => None,
        })
        .collect::<Option<Vec<_>>>();
    if let Some(values) = uuids {
        query.push(" = ANY(").push_bind(values).push(")");
        return;
    }

    let texts = scalars.iter().map(render_scalar).collect::<Vec<_>>();
    query.push("::text = ANY(").push_bind(texts).push(")");
}

fn render_scalar(value: &Scalar) -> String {
    match value {
        Scalar::Text(text) => text.clone(),
        Scalar::Uuid(id) => id.to_string(),
        Scalar::Bool(flag) => flag.to_string(),
        Scalar::I64(number) => number.to_string(),
        Scalar::Date(date) => date.to_string(),
    }
}

fn infer_scalar(column: &str, value: &Value) -> Scalar {
    match value {
        Value::Bool(flag) => Scalar::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(Scalar::I64)
            .unwrap_or_else(|| Scalar::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return Scalar::Uuid(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return Scalar::Date(parsed);
                }
            }
            Scalar::Text(text.clone())
        }
        Value::Null => Scalar::Text(String::new()),
        Value::Array(_) | Value::Object(_) => Scalar::Text(value.to_string()),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    identifier == "id" || identifier.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.ends_with("_date")
        || identifier.ends_with("_on")
        || identifier.ends_with("_day")
        || matches!(identifier, "period_start" | "period_end")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}
