//! Query monitoring around each physical statement.
//!
//! The pipeline calls `before_query(sql) -> token`, then `after_query(sql,
//! token, summary)` on success or `on_error(err, sql, token)` on failure.
//! The engine never formats log lines itself; monitors do.

use crate::error::ChainError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn truncate_sql_bytes(sql: &str, max_bytes: usize) -> &str {
    if sql.len() <= max_bytes {
        return sql;
    }
    let mut end = max_bytes;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}

/// The type of SQL operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryType {
    /// Detect query type from SQL string, skipping comments and leading
    /// parentheses.
    pub fn from_sql(sql: &str) -> Self {
        fn strip_sql_prefix(sql: &str) -> &str {
            let mut s = sql;
            loop {
                let before = s;
                s = s.trim_start();
                if s.starts_with("--") {
                    if let Some(pos) = s.find('\n') {
                        s = &s[pos + 1..];
                        continue;
                    }
                    return "";
                }
                if s.starts_with("/*") {
                    if let Some(pos) = s.find("*/") {
                        s = &s[pos + 2..];
                        continue;
                    }
                    return "";
                }
                if s.starts_with('(') {
                    s = &s[1..];
                    continue;
                }
                if s == before {
                    break;
                }
            }
            s
        }

        fn starts_with_keyword(s: &str, keyword: &str) -> bool {
            match s.get(0..keyword.len()) {
                Some(prefix) => prefix.eq_ignore_ascii_case(keyword),
                None => false,
            }
        }

        let trimmed = strip_sql_prefix(sql);
        if starts_with_keyword(trimmed, "SELECT") {
            QueryType::Select
        } else if starts_with_keyword(trimmed, "WITH") {
            // A WITH clause may front a mutation; look at the main statement.
            match trimmed.rsplit_once(')') {
                Some((_, tail)) => Self::from_sql(tail),
                None => QueryType::Select,
            }
        } else if starts_with_keyword(trimmed, "INSERT") {
            QueryType::Insert
        } else if starts_with_keyword(trimmed, "UPDATE") {
            QueryType::Update
        } else if starts_with_keyword(trimmed, "DELETE") {
            QueryType::Delete
        } else {
            QueryType::Other
        }
    }
}

/// Opaque token returned by `before_query` and handed back on completion.
#[derive(Debug)]
pub struct MonitorToken {
    pub id: u64,
    pub started: Instant,
}

impl MonitorToken {
    pub fn new() -> Self {
        Self {
            id: TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for MonitorToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome summary of one executed statement.
#[derive(Debug, Clone, Copy)]
pub enum ExecSummary {
    /// Statement returned rows.
    Rows(usize),
    /// Statement reported affected rows only.
    Affected(u64),
}

impl std::fmt::Display for ExecSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecSummary::Rows(n) => write!(f, "{n} rows"),
            ExecSummary::Affected(n) => write!(f, "{n} affected"),
        }
    }
}

/// Observer of the statement lifecycle.
pub trait QueryMonitor: Send + Sync {
    /// Called before a statement is executed.
    fn before_query(&self, sql: &str, param_count: usize) -> MonitorToken {
        let _ = (sql, param_count);
        MonitorToken::new()
    }

    /// Called after a statement completes successfully.
    fn after_query(&self, sql: &str, token: MonitorToken, summary: &ExecSummary);

    /// Called when a statement fails.
    fn on_error(&self, err: &ChainError, sql: &str, token: MonitorToken) {
        let _ = (err, sql, token);
    }
}

/// A monitor that prints completed statements to stderr.
#[derive(Debug, Clone)]
pub struct LoggingMonitor {
    /// Minimum duration to log (filters out fast queries).
    pub min_duration: Option<Duration>,
    /// Whether to log the full SQL or truncate.
    pub max_sql_length: Option<usize>,
    /// Prefix for log messages.
    pub prefix: String,
}

impl Default for LoggingMonitor {
    fn default() -> Self {
        Self {
            min_duration: None,
            max_sql_length: Some(200),
            prefix: "[pgchain]".to_string(),
        }
    }
}

impl LoggingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_duration(mut self, duration: Duration) -> Self {
        self.min_duration = Some(duration);
        self
    }

    pub fn max_sql_length(mut self, len: usize) -> Self {
        self.max_sql_length = Some(len);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn truncate_sql(&self, sql: &str) -> String {
        match self.max_sql_length {
            Some(max) if sql.len() > max => format!("{}...", truncate_sql_bytes(sql, max)),
            _ => sql.to_string(),
        }
    }
}

impl QueryMonitor for LoggingMonitor {
    fn after_query(&self, sql: &str, token: MonitorToken, summary: &ExecSummary) {
        let elapsed = token.elapsed();
        if let Some(min) = self.min_duration {
            if elapsed < min {
                return;
            }
        }
        eprintln!(
            "{} [{:?}] {:?} | {} | {}",
            self.prefix,
            QueryType::from_sql(sql),
            elapsed,
            summary,
            self.truncate_sql(sql)
        );
    }

    fn on_error(&self, err: &ChainError, sql: &str, token: MonitorToken) {
        eprintln!(
            "{} ERROR [{:?}] {:?} | {} | {}",
            self.prefix,
            QueryType::from_sql(sql),
            token.elapsed(),
            err,
            self.truncate_sql(sql)
        );
    }
}

/// A `tracing`-based monitor emitting one event per statement.
///
/// Enable via the crate feature: `pgchain = { features = ["tracing"] }`.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Default)]
pub struct TracingMonitor;

#[cfg(feature = "tracing")]
impl QueryMonitor for TracingMonitor {
    fn after_query(&self, sql: &str, token: MonitorToken, summary: &ExecSummary) {
        tracing::debug!(
            elapsed = ?token.elapsed(),
            result = %summary,
            sql,
            "query complete"
        );
    }

    fn on_error(&self, err: &ChainError, sql: &str, token: MonitorToken) {
        tracing::warn!(
            elapsed = ?token.elapsed(),
            error = %err,
            sql,
            "query failed"
        );
    }
}
