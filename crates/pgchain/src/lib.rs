//! # pgchain
//!
//! A chainable PostgreSQL query-building and execution engine.
//!
//! ## Features
//!
//! - **Immutable chaining**: every builder call returns a new query; the
//!   descriptor is structurally shared, so long chains stay cheap and a
//!   derived query never mutates its parent
//! - **SQL composer**: joins (plain and lateral), CTEs, nested JSON
//!   projections for sub-queries, `$n` parameter lists
//! - **Lifecycle hooks**: before/after/after-commit hooks per action, with
//!   hook-issued queries joining the same transaction
//! - **Atomic nested mutations**: mutating sub-queries hoist into CTEs of
//!   the host statement, hook data smuggled back via a synthetic column
//! - **Safe defaults**: UPDATE and DELETE require a WHERE clause unless all
//!   rows are requested explicitly
//! - **Batched inserts**: oversized row sets split at the bind-parameter
//!   limit and run inside one transaction
//!
//! ## Example
//!
//! ```ignore
//! use pgchain::{ColumnDef, ExecContext, PgAdapter, Query, TableSchema};
//! use std::sync::Arc;
//!
//! let user = TableSchema::new("user")
//!     .column(ColumnDef::new("id").primary_key())
//!     .column(ColumnDef::new("name"));
//!
//! let adapter = Arc::new(PgAdapter::connect("postgres://localhost/app").await?);
//! let ctx = ExecContext::new(adapter);
//!
//! let row = Query::table(user.clone()).find(1).run(&ctx).await?;
//! let count = Query::table(user)
//!     .where_eq("name", "alice")
//!     .update(vec![("name", "bob".into())])
//!     .run(&ctx)
//!     .await?;
//! ```

pub mod adapter;
pub mod compose;
pub mod context;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod ident;
pub mod joins;
pub mod monitor;
pub mod parse;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod state;
pub mod testing;
pub mod value;

pub use adapter::{Adapter, PgAdapter, QueryOutput};
pub use compose::{CteHookChannel, Statement, MAX_BIND_PARAMS};
pub use context::ExecContext;
pub use error::{ChainError, ChainResult};
pub use expr::Filter;
pub use hooks::{AfterKind, BeforeKind, HookSet, MutationHook, ResultHook, SaveCtx};
pub use ident::ColumnRef;
pub use joins::{JoinKind, JoinTarget};
pub use monitor::{ExecSummary, LoggingMonitor, MonitorToken, QueryMonitor, QueryType};
pub use query::{OnConflictQuery, Query};
pub use schema::{ColumnDef, Shape, TableSchema};
pub use state::{ColumnValue, QueryKind, ReturnType};
pub use testing::TestAdapter;

#[cfg(feature = "pool")]
pub use adapter::{DedicatedAdapter, PoolAdapter};

#[cfg(feature = "tracing")]
pub use monitor::TracingMonitor;
