//! Explicit execution and transaction context.
//!
//! An [`ExecContext`] carries the adapter, an optional monitor, and the
//! active transaction, and is passed as a parameter through the pipeline and
//! into hook callbacks, so transaction scoping is visible in signatures
//! instead of living in ambient state. One context owns exactly one adapter
//! connection for the duration of a transaction; after-hooks receive the
//! same context, so queries they issue reuse that connection.

use crate::adapter::{Adapter, QueryOutput};
use crate::error::{ChainError, ChainResult};
use crate::hooks::ResultHook;
use crate::monitor::{ExecSummary, QueryMonitor};
use crate::state::AfterCommitHandler;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_savepoint_name() -> String {
    let n = SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("pgchain_sp_{n}")
}

/// A hook scheduled to run once the enclosing transaction has committed.
pub(crate) struct AfterCommitTask {
    pub hook: Arc<dyn ResultHook>,
    pub rows: Vec<Value>,
    /// The result the query already produced; carried into the error when
    /// the hook fails unhandled.
    pub result: Value,
    pub handlers: Vec<AfterCommitHandler>,
}

/// Shared state of one (outermost) transaction.
pub(crate) struct TxState {
    after_commit: Mutex<Vec<AfterCommitTask>>,
}

impl TxState {
    fn new() -> Self {
        Self {
            after_commit: Mutex::new(Vec::new()),
        }
    }
}

/// Execution context: adapter + monitor + active transaction.
#[derive(Clone)]
pub struct ExecContext {
    adapter: Arc<dyn Adapter>,
    monitor: Option<Arc<dyn QueryMonitor>>,
    tx: Option<Arc<TxState>>,
}

impl ExecContext {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            monitor: None,
            tx: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn QueryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Run `f` inside a transaction. Without an active transaction this is
    /// `BEGIN`/`COMMIT`/`ROLLBACK`; inside one it nests via a savepoint.
    /// After-commit tasks queued during the transaction run in registration
    /// order strictly after the outermost `COMMIT`.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> ChainResult<T>
    where
        F: FnOnce(ExecContext) -> Fut,
        Fut: Future<Output = ChainResult<T>>,
    {
        match &self.tx {
            None => {
                self.run_execute("BEGIN", &[]).await?;
                let tx = Arc::new(TxState::new());
                let child = ExecContext {
                    adapter: self.adapter.clone(),
                    monitor: self.monitor.clone(),
                    tx: Some(tx.clone()),
                };
                match f(child).await {
                    Ok(value) => {
                        self.run_execute("COMMIT", &[]).await?;
                        match self.drain_after_commit(&tx).await {
                            None => Ok(value),
                            Some(err) => Err(err),
                        }
                    }
                    Err(error) => match self.run_execute("ROLLBACK", &[]).await {
                        Ok(_) => Err(error),
                        Err(rollback_err) => Err(ChainError::Other(format!(
                            "{error} (rollback failed: {rollback_err})"
                        ))),
                    },
                }
            }
            Some(_) => {
                let name = next_savepoint_name();
                self.run_execute(&format!("SAVEPOINT {name}"), &[]).await?;
                match f(self.clone()).await {
                    Ok(value) => {
                        self.run_execute(&format!("RELEASE SAVEPOINT {name}"), &[])
                            .await?;
                        Ok(value)
                    }
                    Err(error) => match self
                        .run_execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                        .await
                    {
                        Ok(_) => Err(error),
                        Err(rollback_err) => Err(ChainError::Other(format!(
                            "{error} (savepoint rollback failed: {rollback_err})"
                        ))),
                    },
                }
            }
        }
    }

    /// Queue a task for after the outermost commit. With no transaction
    /// active the task is handed back and the caller runs it itself.
    pub(crate) fn queue_after_commit(&self, task: AfterCommitTask) -> Result<(), AfterCommitTask> {
        match &self.tx {
            Some(tx) => {
                tx.after_commit
                    .lock()
                    .expect("after-commit queue poisoned")
                    .push(task);
                Ok(())
            }
            None => Err(task),
        }
    }

    /// Run queued after-commit tasks. The transaction is over, so hooks run
    /// on a transaction-free context; an unhandled failure is returned as an
    /// `AfterCommit` error carrying the task's already-produced result.
    async fn drain_after_commit(&self, tx: &Arc<TxState>) -> Option<ChainError> {
        let tasks = std::mem::take(
            &mut *tx
                .after_commit
                .lock()
                .expect("after-commit queue poisoned"),
        );
        let base = ExecContext {
            adapter: self.adapter.clone(),
            monitor: self.monitor.clone(),
            tx: None,
        };
        for task in tasks {
            if let Err(err) = task.hook.run(&task.rows, &base).await {
                if task.handlers.is_empty() {
                    return Some(ChainError::AfterCommit {
                        source: Box::new(err),
                        result: task.result,
                    });
                }
                for handler in &task.handlers {
                    handler(&err);
                }
            }
        }
        None
    }

    /// Run the queued after-commit tasks of a query that executed without a
    /// surrounding transaction.
    pub(crate) async fn run_after_commit_now(
        &self,
        tasks: Vec<AfterCommitTask>,
    ) -> Option<ChainError> {
        for task in tasks {
            if let Err(err) = task.hook.run(&task.rows, self).await {
                if task.handlers.is_empty() {
                    return Some(ChainError::AfterCommit {
                        source: Box::new(err),
                        result: task.result,
                    });
                }
                for handler in &task.handlers {
                    handler(&err);
                }
            }
        }
        None
    }

    // Monitored statement execution.

    pub(crate) async fn run_query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        let token = self
            .monitor
            .as_ref()
            .map(|m| m.before_query(sql, params.len()));
        match self.adapter.query(sql, params).await {
            Ok(out) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.after_query(sql, token, &ExecSummary::Rows(out.rows.len()));
                }
                Ok(out)
            }
            Err(err) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.on_error(&err, sql, token);
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn run_arrays(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        let token = self
            .monitor
            .as_ref()
            .map(|m| m.before_query(sql, params.len()));
        match self.adapter.arrays(sql, params).await {
            Ok(out) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.after_query(sql, token, &ExecSummary::Rows(out.rows.len()));
                }
                Ok(out)
            }
            Err(err) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.on_error(&err, sql, token);
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn run_execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64> {
        let token = self
            .monitor
            .as_ref()
            .map(|m| m.before_query(sql, params.len()));
        match self.adapter.execute(sql, params).await {
            Ok(count) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.after_query(sql, token, &ExecSummary::Affected(count));
                }
                Ok(count)
            }
            Err(err) => {
                if let (Some(monitor), Some(token)) = (&self.monitor, token) {
                    monitor.on_error(&err, sql, token);
                }
                Err(err)
            }
        }
    }
}

