//! The adapter boundary: a thin statement runner over a database driver.
//!
//! The engine owns statement sequencing (transactions, savepoints, batches);
//! an adapter only executes one statement at a time. [`PgAdapter`] implements
//! the boundary over `tokio_postgres::Client`, converting rows to JSON
//! values and binding JSON parameters against the statement's inferred
//! parameter types.

use crate::error::{ChainError, ChainResult};
use async_trait::async_trait;
use serde_json::Value;

/// Raw result of one executed statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOutput {
    /// Output column names, in statement order.
    pub fields: Vec<String>,
    /// Positional row values.
    pub rows: Vec<Vec<Value>>,
    pub row_count: u64,
}

/// A connection-level statement runner.
///
/// `query` serves object-shaped return types, `arrays` the positional ones
/// (both return positional rows plus field names; `arrays` implementations
/// may skip any name-based post-processing). `execute` runs statements with
/// no result set and is also the path for `BEGIN`/`COMMIT`/`SAVEPOINT`
/// control statements issued by the transaction context.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput>;

    async fn arrays(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        self.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64>;

    async fn close(&self) -> ChainResult<()>;
}

/// JSON value wrapper that binds against the target parameter type inferred
/// by Postgres for the statement.
struct PgParam(Value);

impl std::fmt::Debug for PgParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PgParam({})", self.0)
    }
}

impl tokio_postgres::types::ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut bytes::BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        use tokio_postgres::types::{IsNull, ToSql, Type};

        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::BOOL => self
                .0
                .as_bool()
                .ok_or_else(|| type_error(&self.0, ty))?
                .to_sql(ty, out),
            Type::INT2 => {
                let n = self.0.as_i64().ok_or_else(|| type_error(&self.0, ty))?;
                (n as i16).to_sql(ty, out)
            }
            Type::INT4 => {
                let n = self.0.as_i64().ok_or_else(|| type_error(&self.0, ty))?;
                (n as i32).to_sql(ty, out)
            }
            Type::INT8 => self
                .0
                .as_i64()
                .ok_or_else(|| type_error(&self.0, ty))?
                .to_sql(ty, out),
            Type::FLOAT4 => {
                let n = self.0.as_f64().ok_or_else(|| type_error(&self.0, ty))?;
                (n as f32).to_sql(ty, out)
            }
            Type::FLOAT8 => self
                .0
                .as_f64()
                .ok_or_else(|| type_error(&self.0, ty))?
                .to_sql(ty, out),
            Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::UNKNOWN => {
                match &self.0 {
                    Value::String(s) => s.to_sql(ty, out),
                    other => other.to_string().to_sql(ty, out),
                }
            }
            Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
            Type::UUID => {
                let s = self.0.as_str().ok_or_else(|| type_error(&self.0, ty))?;
                uuid::Uuid::parse_str(s)?.to_sql(ty, out)
            }
            Type::TIMESTAMPTZ => {
                let s = self.0.as_str().ok_or_else(|| type_error(&self.0, ty))?;
                chrono::DateTime::parse_from_rfc3339(s)?
                    .with_timezone(&chrono::Utc)
                    .to_sql(ty, out)
            }
            Type::TIMESTAMP => {
                let s = self.0.as_str().ok_or_else(|| type_error(&self.0, ty))?;
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))?
                    .to_sql(ty, out)
            }
            Type::DATE => {
                let s = self.0.as_str().ok_or_else(|| type_error(&self.0, ty))?;
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")?.to_sql(ty, out)
            }
            _ => match &self.0 {
                Value::String(s) if <String as tokio_postgres::types::ToSql>::accepts(ty) => {
                    s.to_sql(ty, out)
                }
                other => Err(type_error(other, ty)),
            },
        }
    }

    fn accepts(_ty: &tokio_postgres::types::Type) -> bool {
        // Dispatch happens per target type inside to_sql.
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn type_error(
    value: &Value,
    ty: &tokio_postgres::types::Type,
) -> Box<dyn std::error::Error + Sync + Send> {
    format!("cannot bind {value} as {ty}").into()
}

/// Convert one driver row into positional JSON values.
fn row_to_values(row: &tokio_postgres::Row) -> ChainResult<Vec<Value>> {
    use tokio_postgres::types::Type;

    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)
                .map(|v| v.map(Value::from))?,
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)
                .map(|v| v.map(Value::from))?,
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .map(|v| v.map(Value::from))?,
            Type::INT8 => row
                .try_get::<_, Option<i64>>(i)
                .map(|v| v.map(Value::from))?,
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)
                .map(|v| v.map(Value::from))?,
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(i)
                .map(|v| v.map(Value::from))?,
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(i)?,
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(i)
                .map(|v| v.map(|u| Value::from(u.to_string())))?,
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
                .map(|v| v.map(|t| Value::from(t.to_rfc3339())))?,
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(i)
                .map(|v| {
                    v.map(|t| Value::from(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                })?,
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(i)
                .map(|v| v.map(|d| Value::from(d.to_string())))?,
            _ => row
                .try_get::<_, Option<String>>(i)
                .map(|v| v.map(Value::from))
                .map_err(|e| {
                    ChainError::decode(
                        column.name(),
                        format!("unsupported column type {}: {e}", column.type_()),
                    )
                })?,
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

fn rows_to_output(rows: Vec<tokio_postgres::Row>) -> ChainResult<QueryOutput> {
    let fields = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect()
        })
        .unwrap_or_default();
    let row_count = rows.len() as u64;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(row_to_values(row)?);
    }
    Ok(QueryOutput {
        fields,
        rows: out,
        row_count,
    })
}

async fn client_query(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[Value],
) -> ChainResult<QueryOutput> {
    let wrapped: Vec<PgParam> = params.iter().cloned().map(PgParam).collect();
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        wrapped.iter().map(|p| p as _).collect();
    let rows = client
        .query(sql, &refs)
        .await
        .map_err(ChainError::from_db_error)?;
    rows_to_output(rows)
}

async fn client_execute(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[Value],
) -> ChainResult<u64> {
    let wrapped: Vec<PgParam> = params.iter().cloned().map(PgParam).collect();
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        wrapped.iter().map(|p| p as _).collect();
    client
        .execute(sql, &refs)
        .await
        .map_err(ChainError::from_db_error)
}

/// Adapter over a single `tokio_postgres` connection.
pub struct PgAdapter {
    client: tokio_postgres::Client,
}

impl PgAdapter {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }

    /// Connect with `NoTls`, driving the connection on a spawned task.
    pub async fn connect(conninfo: &str) -> ChainResult<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls)
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(Self { client })
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

#[async_trait]
impl Adapter for PgAdapter {
    async fn query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        client_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64> {
        client_execute(&self.client, sql, params).await
    }

    async fn close(&self) -> ChainResult<()> {
        // Dropping the client tears the connection down.
        Ok(())
    }
}

/// Adapter over a `deadpool_postgres` pool: each call checks a connection
/// out. Use [`PoolAdapter::dedicated`] to pin one connection for a
/// transaction context, which must not hop between connections.
#[cfg(feature = "pool")]
pub struct PoolAdapter {
    pool: deadpool_postgres::Pool,
}

#[cfg(feature = "pool")]
impl PoolAdapter {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }

    /// Check out one connection and wrap it as a connection-pinned adapter.
    pub async fn dedicated(&self) -> ChainResult<DedicatedAdapter> {
        let client = self.pool.get().await?;
        Ok(DedicatedAdapter { client })
    }
}

#[cfg(feature = "pool")]
#[async_trait]
impl Adapter for PoolAdapter {
    async fn query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        let client = self.pool.get().await?;
        client_query(&client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64> {
        let client = self.pool.get().await?;
        client_execute(&client, sql, params).await
    }

    async fn close(&self) -> ChainResult<()> {
        self.pool.close();
        Ok(())
    }
}

/// A pool connection pinned for the lifetime of a transaction context.
#[cfg(feature = "pool")]
pub struct DedicatedAdapter {
    client: deadpool_postgres::Object,
}

#[cfg(feature = "pool")]
#[async_trait]
impl Adapter for DedicatedAdapter {
    async fn query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        client_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64> {
        client_execute(&self.client, sql, params).await
    }

    async fn close(&self) -> ChainResult<()> {
        Ok(())
    }
}
