//! Row-lifecycle hooks.
//!
//! Hooks are grouped by a closed set of kinds, one ordered list per kind, so
//! the pipeline's dispatch is exhaustive by construction. Before-hooks run
//! strictly sequentially and may merge values into the pending row data via
//! [`SaveCtx::set`]; after-hooks receive the parsed rows plus a context that
//! lets them issue queries inside the same transaction.

use crate::context::ExecContext;
use crate::error::ChainResult;
use crate::state::QueryKind;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Registration points for before-hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeforeKind {
    /// Runs for every mutation.
    Any,
    Create,
    Update,
    Delete,
    /// Runs for create and update.
    Save,
}

/// Registration points for after-hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterKind {
    /// Runs for every mutation, after the action-specific hooks.
    Any,
    Create,
    Update,
    Delete,
    /// Runs for create and update, after the action-specific hooks.
    Save,
    CreateCommit,
    UpdateCommit,
    DeleteCommit,
    SaveCommit,
}

/// Mutable context handed to before-hooks.
pub struct SaveCtx {
    kind: QueryKind,
    user_columns: Vec<String>,
    patches: Vec<(String, Value)>,
}

impl SaveCtx {
    pub(crate) fn new(kind: QueryKind, user_columns: Vec<String>) -> Self {
        Self {
            kind,
            user_columns,
            patches: Vec::new(),
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// The column names the caller supplied. Hook-injected columns do not
    /// appear here: a later hook sees earlier hooks' values through the
    /// merged data, not through this list.
    pub fn columns(&self) -> &[String] {
        &self.user_columns
    }

    /// Merge a value into the pending row data. Hook-supplied values are
    /// exempt from read-only column rejection.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.patches.push((column.into(), value));
    }

    pub(crate) fn into_patches(self) -> Vec<(String, Value)> {
        self.patches
    }
}

/// A before-hook. Implemented for plain closures; implement the trait
/// directly when the hook needs to await.
#[async_trait]
pub trait MutationHook: Send + Sync {
    async fn run(&self, ctx: &mut SaveCtx) -> ChainResult<()>;
}

#[async_trait]
impl<F> MutationHook for F
where
    F: Fn(&mut SaveCtx) -> ChainResult<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut SaveCtx) -> ChainResult<()> {
        self(ctx)
    }
}

/// An after-hook or after-commit-hook. Receives the parsed result rows and
/// the live execution context, so hook-issued queries participate in the
/// same transaction the statement ran in.
#[async_trait]
pub trait ResultHook: Send + Sync {
    async fn run(&self, rows: &[Value], ctx: &ExecContext) -> ChainResult<()>;
}

#[async_trait]
impl<F> ResultHook for F
where
    F: Fn(&[Value], &ExecContext) -> ChainResult<()> + Send + Sync,
{
    async fn run(&self, rows: &[Value], ctx: &ExecContext) -> ChainResult<()> {
        self(rows, ctx)
    }
}

/// All hooks registered on a query, one ordered list per kind.
#[derive(Clone, Default)]
pub struct HookSet {
    pub before: Vec<Arc<dyn MutationHook>>,
    pub before_create: Vec<Arc<dyn MutationHook>>,
    pub before_update: Vec<Arc<dyn MutationHook>>,
    pub before_delete: Vec<Arc<dyn MutationHook>>,
    pub before_save: Vec<Arc<dyn MutationHook>>,
    pub after: Vec<Arc<dyn ResultHook>>,
    pub after_create: Vec<Arc<dyn ResultHook>>,
    pub after_update: Vec<Arc<dyn ResultHook>>,
    pub after_delete: Vec<Arc<dyn ResultHook>>,
    pub after_save: Vec<Arc<dyn ResultHook>>,
    pub after_create_commit: Vec<Arc<dyn ResultHook>>,
    pub after_update_commit: Vec<Arc<dyn ResultHook>>,
    pub after_delete_commit: Vec<Arc<dyn ResultHook>>,
    pub after_save_commit: Vec<Arc<dyn ResultHook>>,
}

impl HookSet {
    pub fn add_before(&mut self, kind: BeforeKind, hook: Arc<dyn MutationHook>) {
        match kind {
            BeforeKind::Any => self.before.push(hook),
            BeforeKind::Create => self.before_create.push(hook),
            BeforeKind::Update => self.before_update.push(hook),
            BeforeKind::Delete => self.before_delete.push(hook),
            BeforeKind::Save => self.before_save.push(hook),
        }
    }

    pub fn add_after(&mut self, kind: AfterKind, hook: Arc<dyn ResultHook>) {
        match kind {
            AfterKind::Any => self.after.push(hook),
            AfterKind::Create => self.after_create.push(hook),
            AfterKind::Update => self.after_update.push(hook),
            AfterKind::Delete => self.after_delete.push(hook),
            AfterKind::Save => self.after_save.push(hook),
            AfterKind::CreateCommit => self.after_create_commit.push(hook),
            AfterKind::UpdateCommit => self.after_update_commit.push(hook),
            AfterKind::DeleteCommit => self.after_delete_commit.push(hook),
            AfterKind::SaveCommit => self.after_save_commit.push(hook),
        }
    }

    /// The before-hooks for an action: generic, then save-level (create and
    /// update only), then action-specific, each list in registration order.
    pub(crate) fn before_chain(&self, kind: QueryKind) -> Vec<Arc<dyn MutationHook>> {
        let mut chain: Vec<_> = self.before.iter().cloned().collect();
        match kind {
            QueryKind::Insert => {
                chain.extend(self.before_save.iter().cloned());
                chain.extend(self.before_create.iter().cloned());
            }
            QueryKind::Update => {
                chain.extend(self.before_save.iter().cloned());
                chain.extend(self.before_update.iter().cloned());
            }
            QueryKind::Delete => chain.extend(self.before_delete.iter().cloned()),
            QueryKind::Select => {}
        }
        chain
    }

    /// After-hook stages for an action: action-specific, then save-level,
    /// then generic. Hooks within one stage may run concurrently.
    pub(crate) fn after_stages(&self, kind: QueryKind) -> Vec<&[Arc<dyn ResultHook>]> {
        let mut stages: Vec<&[Arc<dyn ResultHook>]> = Vec::new();
        match kind {
            QueryKind::Insert => {
                stages.push(&self.after_create);
                stages.push(&self.after_save);
            }
            QueryKind::Update => {
                stages.push(&self.after_update);
                stages.push(&self.after_save);
            }
            QueryKind::Delete => stages.push(&self.after_delete),
            QueryKind::Select => {}
        }
        stages.push(&self.after);
        stages
    }

    /// After-commit hooks for an action, in dispatch order.
    pub(crate) fn after_commit_chain(&self, kind: QueryKind) -> Vec<Arc<dyn ResultHook>> {
        let mut chain = Vec::new();
        match kind {
            QueryKind::Insert => {
                chain.extend(self.after_create_commit.iter().cloned());
                chain.extend(self.after_save_commit.iter().cloned());
            }
            QueryKind::Update => {
                chain.extend(self.after_update_commit.iter().cloned());
                chain.extend(self.after_save_commit.iter().cloned());
            }
            QueryKind::Delete => chain.extend(self.after_delete_commit.iter().cloned()),
            QueryKind::Select => {}
        }
        chain
    }

    /// Whether any in-transaction after-hook is registered for the action;
    /// forces transactional execution. After-commit-only hooks do not: they
    /// run after the pipeline when no transaction surrounds it.
    pub(crate) fn has_after(&self, kind: QueryKind) -> bool {
        let action = match kind {
            QueryKind::Insert => !self.after_create.is_empty() || !self.after_save.is_empty(),
            QueryKind::Update => !self.after_update.is_empty() || !self.after_save.is_empty(),
            QueryKind::Delete => !self.after_delete.is_empty(),
            QueryKind::Select => false,
        };
        action || !self.after.is_empty()
    }

    /// Whether any after-commit hook is registered for the action.
    pub(crate) fn has_after_commit(&self, kind: QueryKind) -> bool {
        match kind {
            QueryKind::Insert => {
                !self.after_create_commit.is_empty() || !self.after_save_commit.is_empty()
            }
            QueryKind::Update => {
                !self.after_update_commit.is_empty() || !self.after_save_commit.is_empty()
            }
            QueryKind::Delete => !self.after_delete_commit.is_empty(),
            QueryKind::Select => false,
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("before", &self.before.len())
            .field("before_create", &self.before_create.len())
            .field("before_update", &self.before_update.len())
            .field("before_delete", &self.before_delete.len())
            .field("after", &self.after.len())
            .field("after_create", &self.after_create.len())
            .field("after_update", &self.after_update.len())
            .field("after_delete", &self.after_delete.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_chain_order() {
        let mut hooks = HookSet::default();
        hooks.add_before(BeforeKind::Create, Arc::new(|_: &mut SaveCtx| -> ChainResult<()> { Ok(()) }));
        hooks.add_before(BeforeKind::Any, Arc::new(|_: &mut SaveCtx| -> ChainResult<()> { Ok(()) }));
        hooks.add_before(BeforeKind::Save, Arc::new(|_: &mut SaveCtx| -> ChainResult<()> { Ok(()) }));

        // Generic first, then save-level, then action-specific.
        assert_eq!(hooks.before_chain(QueryKind::Insert).len(), 3);
        assert_eq!(hooks.before_chain(QueryKind::Update).len(), 2);
        assert_eq!(hooks.before_chain(QueryKind::Delete).len(), 1);
    }

    #[test]
    fn commit_hooks_are_tracked_separately() {
        let mut hooks = HookSet::default();
        assert!(!hooks.has_after(QueryKind::Insert));
        hooks.add_after(
            AfterKind::CreateCommit,
            Arc::new(|_: &[Value], _: &ExecContext| -> ChainResult<()> { Ok(()) }),
        );
        // An after-commit-only hook does not force a transaction.
        assert!(!hooks.has_after(QueryKind::Insert));
        assert!(hooks.has_after_commit(QueryKind::Insert));
        assert!(!hooks.has_after_commit(QueryKind::Delete));
    }

    #[test]
    fn save_ctx_tracks_user_columns_only() {
        let mut ctx = SaveCtx::new(QueryKind::Update, vec!["name".to_string()]);
        ctx.set("password", Value::String("p".to_string()));
        assert_eq!(ctx.columns(), ["name".to_string()]);
        assert_eq!(ctx.into_patches().len(), 1);
    }
}
