//! The execution pipeline: before-hooks, statement execution, after-hooks,
//! after-commit scheduling.
//!
//! One run moves through: before-hooks (sequential, each seeing earlier
//! `set()` effects) -> compile -> optional transaction wrap -> statement
//! loop (oversized insert batches run sequentially, atomically) -> channel
//! extraction and nested-mutation hook dispatch -> after-hooks -> after-
//! commit scheduling -> transforms. A zero row count skips every after-* and
//! after-commit hook.

use crate::adapter::QueryOutput;
use crate::compose::{compose, Composed, CteHookChannel};
use crate::context::{AfterCommitTask, ExecContext};
use crate::error::{ChainError, ChainResult};
use crate::hooks::SaveCtx;
use crate::parse::{describe, parse_result, parse_row};
use crate::state::{ColumnValue, Payload, QueryState, ReturnType, UpdatePatch};
use futures_util::future::try_join_all;
use serde_json::Value;

/// Execute a query descriptor against a context.
pub(crate) async fn execute(state: &QueryState, ctx: &ExecContext) -> ChainResult<Value> {
    if state.none {
        return empty_result(state);
    }

    // Before-hooks mutate a private clone of the descriptor; the caller's
    // query object stays untouched.
    let mut state = state.clone();
    run_before_hooks(&mut state).await?;

    let composed = compose(&state)?;

    let needs_tx = composed.statements.len() > 1
        || composed.statements.iter().any(|s| !s.channels.is_empty())
        || state.hooks.has_after(state.kind);

    if needs_tx && !ctx.in_transaction() {
        let state = state.clone();
        return ctx
            .transaction(move |child| async move {
                run_statements(&state, &composed, &child).await
            })
            .await;
    }
    run_statements(&state, &composed, ctx).await
}

/// The empty-result sentinel short-circuits without touching the database,
/// but a return type that demands a row still reports NotFound.
fn empty_result(state: &QueryState) -> ChainResult<Value> {
    match state.return_type {
        ReturnType::All | ReturnType::Rows | ReturnType::Pluck => Ok(Value::Array(Vec::new())),
        ReturnType::One | ReturnType::Value => Ok(Value::Null),
        ReturnType::OneOrThrow | ReturnType::ValueOrThrow => {
            Err(ChainError::not_found(describe(state)))
        }
        ReturnType::Void => Ok(Value::from(0u64)),
    }
}

/// Run generic + action-specific before-hooks sequentially and merge their
/// `set()` patches into the pending payload.
async fn run_before_hooks(state: &mut QueryState) -> ChainResult<()> {
    let chain = state.hooks.before_chain(state.kind);
    if chain.is_empty() {
        return Ok(());
    }
    let user_columns = match state.payload.as_deref() {
        Some(Payload::Insert(p)) => p.user_columns.clone(),
        Some(Payload::Update(p)) => p.user_columns.clone(),
        _ => Vec::new(),
    };
    let mut save = SaveCtx::new(state.kind, user_columns);
    for hook in chain {
        hook.run(&mut save).await?;
    }
    let patches = save.into_patches();
    if patches.is_empty() {
        return Ok(());
    }
    let is_insert = matches!(state.payload.as_deref(), Some(Payload::Insert(_)));
    let is_update = matches!(state.payload.as_deref(), Some(Payload::Update(_)));
    if is_insert {
        let Payload::Insert(payload) = state.payload_mut() else {
            unreachable!()
        };
        for (column, value) in patches {
            match payload.columns.iter().position(|c| c == &column) {
                Some(index) => {
                    for row in &mut payload.rows {
                        row[index] = ColumnValue::Value(value.clone());
                    }
                }
                None => {
                    payload.columns.push(column);
                    for row in &mut payload.rows {
                        row.push(ColumnValue::Value(value.clone()));
                    }
                }
            }
        }
    } else if is_update {
        let Payload::Update(payload) = state.payload_mut() else {
            unreachable!()
        };
        payload.patches.push(UpdatePatch::Set(
            patches
                .into_iter()
                .map(|(c, v)| (c, ColumnValue::Value(v)))
                .collect(),
        ));
    }
    Ok(())
}

async fn run_statements(
    state: &QueryState,
    composed: &Composed,
    ctx: &ExecContext,
) -> ChainResult<Value> {
    let positional = matches!(
        state.return_type,
        ReturnType::Value | ReturnType::ValueOrThrow | ReturnType::Rows | ReturnType::Pluck
    );

    let mut output = QueryOutput::default();
    let mut channel_data: Vec<(CteHookChannel, Vec<Value>)> = Vec::new();

    for cs in &composed.statements {
        let stmt = &cs.statement;
        let plain_void = state.return_type == ReturnType::Void
            && cs.channels.is_empty()
            && !composed.degraded_to_select;
        if plain_void {
            // No RETURNING clause was emitted; only the count comes back.
            let affected = ctx.run_execute(&stmt.text, &stmt.params).await?;
            output.row_count += affected;
            continue;
        }
        let mut out = if positional && cs.channels.is_empty() {
            ctx.run_arrays(&stmt.text, &stmt.params).await?
        } else {
            ctx.run_query(&stmt.text, &stmt.params).await?
        };
        for channel in &cs.channels {
            let rows = channel.extract(&mut out)?;
            channel_data.push((channel.clone(), rows));
        }
        if output.fields.is_empty() {
            output.fields = out.fields;
        }
        output.row_count += out.row_count;
        output.rows.extend(out.rows);
    }

    let mut immediate_tasks: Vec<AfterCommitTask> = Vec::new();

    // Nested-mutation hooks run before the host statement's own after-hooks.
    for (channel, rows) in &channel_data {
        dispatch_channel_hooks(channel, rows, ctx, &mut immediate_tasks).await?;
    }

    let parsed = parse_result(state, &output)?;

    if output.row_count > 0 {
        let hook_rows = result_rows(&parsed);
        run_after_hooks(state, &hook_rows, ctx).await?;
        schedule_after_commit(state, hook_rows, &parsed, ctx, &mut immediate_tasks);
    }

    let mut result = parsed;
    for transform in state.transforms.iter() {
        result = transform(result);
    }

    // Without a surrounding transaction, after-commit hooks run right here;
    // an unhandled failure still carries the produced result out.
    if !immediate_tasks.is_empty() {
        if let Some(err) = ctx.run_after_commit_now(immediate_tasks).await {
            return Err(err);
        }
    }

    Ok(result)
}

/// The parsed rows after-hooks observe.
fn result_rows(parsed: &Value) -> Vec<Value> {
    match parsed {
        Value::Array(rows) => rows.clone(),
        Value::Object(_) => vec![parsed.clone()],
        _ => Vec::new(),
    }
}

async fn run_after_hooks(
    state: &QueryState,
    hook_rows: &[Value],
    ctx: &ExecContext,
) -> ChainResult<()> {
    let stages = state.hooks.after_stages(state.kind);
    for stage in stages {
        if stage.is_empty() {
            continue;
        }
        // Hooks of one stage are independent and may run concurrently; they
        // all observe the same already-written row data.
        try_join_all(stage.iter().map(|hook| hook.run(hook_rows, ctx))).await?;
    }
    Ok(())
}

/// Register after-commit hooks: queued on the transaction when one exists,
/// collected for immediate execution otherwise.
fn schedule_after_commit(
    state: &QueryState,
    hook_rows: Vec<Value>,
    parsed: &Value,
    ctx: &ExecContext,
    immediate: &mut Vec<AfterCommitTask>,
) {
    let chain = state.hooks.after_commit_chain(state.kind);
    if chain.is_empty() {
        return;
    }
    let handlers = state.after_commit_handlers.as_ref().clone();
    for hook in chain {
        let task = AfterCommitTask {
            hook,
            rows: hook_rows.clone(),
            result: parsed.clone(),
            handlers: handlers.clone(),
        };
        if let Err(task) = ctx.queue_after_commit(task) {
            immediate.push(task);
        }
    }
}

/// Parse channel rows with the nested mutation's own parsers and run that
/// mutation's after-hooks (skipped entirely when it affected no rows).
async fn dispatch_channel_hooks(
    channel: &CteHookChannel,
    rows: &[Value],
    ctx: &ExecContext,
    immediate: &mut Vec<AfterCommitTask>,
) -> ChainResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let nested = &channel.state;
    let mut parsed_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let Value::Object(object) = row else {
            return Err(ChainError::internal(format!(
                "hook channel '{}' carried a non-object row",
                channel.column
            )));
        };
        let fields: Vec<String> = object.keys().cloned().collect();
        let values: Vec<Value> = object.values().cloned().collect();
        parsed_rows.push(Value::Object(parse_row(nested, &fields, &values)?));
    }
    run_after_hooks(nested, &parsed_rows, ctx).await?;

    let result = Value::Array(parsed_rows.clone());
    schedule_after_commit(nested, parsed_rows, &result, ctx, immediate);
    Ok(())
}
