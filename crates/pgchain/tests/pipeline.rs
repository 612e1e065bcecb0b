//! Execution-pipeline tests against the scripted test adapter: hook
//! sequencing, transaction wrapping, batch atomicity, and the CTE hook-data
//! channel — no live database involved.

use async_trait::async_trait;
use pgchain::{
    ChainError, ColumnDef, ExecContext, Filter, Query, ResultHook, SaveCtx, TableSchema,
    TestAdapter, MAX_BIND_PARAMS,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn user() -> TableSchema {
    TableSchema::new("user")
        .column(ColumnDef::new("id").primary_key())
        .column(ColumnDef::new("name"))
        .column(ColumnDef::new("password"))
}

fn posts() -> TableSchema {
    TableSchema::new("posts")
        .column(ColumnDef::new("id").primary_key())
        .column(ColumnDef::new("userId"))
        .column(ColumnDef::new("title"))
}

fn ctx_with(adapter: &Arc<TestAdapter>) -> ExecContext {
    ExecContext::new(adapter.clone())
}

#[tokio::test]
async fn before_update_hook_merges_data_after_user_columns() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let seen_columns: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = seen_columns.clone();

    let query = Query::table(user())
        .find(1)
        .update(vec![("name", json!("x"))])
        .before_update(move |save: &mut SaveCtx| -> pgchain::ChainResult<()> {
            seen.lock().unwrap().extend(save.columns().to_vec());
            save.set("password", json!("p"));
            Ok(())
        });

    adapter.respond_count(1);
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!(1));

    let calls = adapter.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].sql,
        "UPDATE \"user\" SET \"name\" = $1, \"password\" = $2 WHERE \"user\".\"id\" = $3"
    );
    assert_eq!(calls[0].params, vec![json!("x"), json!("p"), json!(1)]);
    // The hook saw only the caller's columns, not its own injection.
    assert_eq!(seen_columns.lock().unwrap().as_slice(), ["name".to_string()]);
}

#[tokio::test]
async fn before_hooks_run_in_order_and_later_hooks_see_earlier_sets() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();

    let query = Query::table(user())
        .find(1)
        .update(vec![("name", json!("x"))])
        .before(move |_: &mut SaveCtx| -> pgchain::ChainResult<()> {
            first.lock().unwrap().push("generic");
            Ok(())
        })
        .before_update(move |_: &mut SaveCtx| -> pgchain::ChainResult<()> {
            second.lock().unwrap().push("update");
            Ok(())
        });

    adapter.respond_count(1);
    query.run(&ctx).await.unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), ["generic", "update"]);
}

#[tokio::test]
async fn after_hooks_skip_when_no_rows_matched() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let fired = Arc::new(AtomicUsize::new(0));
    let after = fired.clone();
    let after_commit = fired.clone();

    let query = Query::table(user())
        .where_eq("name", "missing")
        .update(vec![("name", json!("x"))])
        .after_update(move |_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .after_update_commit(move |_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            after_commit.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    adapter.respond_count(0);
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!(0));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    // The after-hook forced a transaction even though nothing fired.
    let sqls = adapter.sqls();
    assert_eq!(sqls.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(sqls.last().map(String::as_str), Some("COMMIT"));
}

struct ProbeHook {
    schema: TableSchema,
}

#[async_trait]
impl ResultHook for ProbeHook {
    async fn run(&self, _rows: &[Value], ctx: &ExecContext) -> pgchain::ChainResult<()> {
        // A hook-issued query joins the transaction the statement ran in.
        Query::table(self.schema.clone())
            .where_eq("name", "probe")
            .take_optional()
            .run(ctx)
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn after_hook_queries_share_the_transaction() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user())
        .find(1)
        .update(vec![("name", json!("x"))])
        .after_update(ProbeHook { schema: user() });

    adapter.respond_count(1);
    query.run(&ctx).await.unwrap();

    let sqls = adapter.sqls();
    assert_eq!(sqls[0], "BEGIN");
    assert!(sqls[1].starts_with("UPDATE \"user\""));
    assert!(sqls[2].starts_with("SELECT "));
    assert_eq!(sqls[3], "COMMIT");
}

#[tokio::test]
async fn oversized_insert_batch_is_atomic() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let rows: Vec<Vec<(&str, Value)>> = (0..(MAX_BIND_PARAMS / 2 + 1))
        .map(|i| vec![("id", json!(i)), ("name", json!(format!("u{i}")))])
        .collect();
    let query = Query::table(user()).create_many(rows).void();

    adapter.respond_count(32767);
    adapter.fail_next(ChainError::Query {
        message: "deadlock".to_string(),
        code: Some("40P01".to_string()),
        constraint: None,
    });

    let err = query.run(&ctx).await.unwrap_err();
    assert!(matches!(err, ChainError::Query { .. }));

    let sqls = adapter.sqls();
    assert_eq!(sqls[0], "BEGIN");
    assert!(sqls[1].starts_with("INSERT INTO \"user\""));
    assert!(sqls[2].starts_with("INSERT INTO \"user\""));
    // The failure rolled back the whole batch; nothing was committed.
    assert_eq!(sqls[3], "ROLLBACK");
    assert!(!sqls.contains(&"COMMIT".to_string()));
}

#[tokio::test]
async fn nested_transactions_use_savepoints() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    ctx.transaction(|outer| async move {
        outer
            .transaction(|inner| async move {
                Query::table(user()).find(1).run(&inner).await.map(|_| ())
            })
            .await
    })
    .await
    .unwrap_err();
    // find(1) with an empty scripted response raises NotFound; the inner
    // savepoint and the outer transaction both roll back.
    let sqls = adapter.sqls();
    assert_eq!(sqls[0], "BEGIN");
    assert!(sqls[1].starts_with("SAVEPOINT pgchain_sp_"));
    assert!(sqls[2].starts_with("SELECT "));
    assert!(sqls[3].starts_with("ROLLBACK TO SAVEPOINT pgchain_sp_"));
    assert_eq!(sqls[4], "ROLLBACK");
}

#[tokio::test]
async fn after_commit_hooks_run_after_the_outermost_commit() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let commit_log = log.clone();

    let query = Query::table(user())
        .find(1)
        .update(vec![("name", json!("x"))])
        // Force a transaction so the commit hook has to wait for COMMIT.
        .after_update(|_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> { Ok(()) })
        .after_update_commit(move |_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            commit_log.lock().unwrap().push("commit-hook".to_string());
            Ok(())
        });

    adapter.respond_count(1);
    query.run(&ctx).await.unwrap();

    // The hook ran, and it ran after COMMIT was issued.
    assert_eq!(log.lock().unwrap().as_slice(), ["commit-hook".to_string()]);
    let sqls = adapter.sqls();
    assert_eq!(sqls.last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn unhandled_after_commit_failure_carries_the_result() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user())
        .create(vec![("name", json!("a"))])
        .after_create_commit(|_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            Err(ChainError::Other("notify failed".to_string()))
        });

    adapter.respond_rows(&["id", "name"], vec![vec![json!(1), json!("a")]]);
    let err = query.run(&ctx).await.unwrap_err();
    match err {
        ChainError::AfterCommit { result, .. } => {
            assert_eq!(result, json!({"id": 1, "name": "a"}));
        }
        other => panic!("expected AfterCommit, got {other:?}"),
    }
}

#[tokio::test]
async fn catch_after_commit_error_consumes_the_failure() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let caught = Arc::new(AtomicUsize::new(0));
    let counter = caught.clone();

    let query = Query::table(user())
        .create(vec![("name", json!("a"))])
        .after_create_commit(|_: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            Err(ChainError::Other("notify failed".to_string()))
        })
        .catch_after_commit_error(move |_err| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    adapter.respond_rows(&["id", "name"], vec![vec![json!(1), json!("a")]]);
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!({"id": 1, "name": "a"}));
    assert_eq!(caught.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cte_hook_channel_recovers_nested_mutation_rows() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);
    let deleted: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = deleted.clone();

    let del = Query::table(posts())
        .where_eq("id", 5)
        .delete()
        .after_delete(move |rows: &[Value], _: &ExecContext| -> pgchain::ChainResult<()> {
            sink.lock().unwrap().extend(rows.iter().cloned());
            Ok(())
        });
    let query = Query::table(user()).find(1).set_from("name", del);

    adapter.respond_rows(
        &["__hook_rows__posts"],
        vec![vec![json!([{"id": 5, "userId": 9, "title": "t"}])]],
    );
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!(1));

    // The nested delete's after-hook received its parsed rows, and the
    // synthetic column never leaked into the result.
    assert_eq!(
        deleted.lock().unwrap().as_slice(),
        [json!({"id": 5, "userId": 9, "title": "t"})]
    );
    let sqls = adapter.sqls();
    assert_eq!(sqls[0], "BEGIN");
    assert!(sqls[1].starts_with("WITH \"posts\" AS (DELETE FROM \"posts\""));
    assert!(sqls[1].contains("AS \"__hook_rows__posts\""));
    assert_eq!(sqls[2], "COMMIT");
}

#[tokio::test]
async fn empty_update_degrades_to_a_read() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user()).find(1).update(vec![]);
    adapter.respond_rows(
        &["id", "name", "password"],
        vec![vec![json!(1), json!("a"), json!("p")]],
    );
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!(1));

    let sqls = adapter.sqls();
    assert_eq!(sqls.len(), 1);
    assert!(sqls[0].starts_with("SELECT "));
    assert!(!sqls[0].contains("UPDATE"));
}

#[tokio::test]
async fn on_conflict_do_nothing_resolves_to_the_no_value_marker() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user())
        .create(vec![("name", json!("a"))])
        .on_conflict_do_nothing();

    // Conflicting insert: Postgres returns zero rows.
    adapter.respond_rows(&["id", "name"], vec![]);
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, Value::Null);
    assert!(adapter.sqls()[0].contains("ON CONFLICT DO NOTHING"));
}

#[tokio::test]
async fn none_sentinel_short_circuits_without_sql() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user()).join_subquery(
        pgchain::JoinKind::Inner,
        Query::none(posts()),
        None,
        vec![Filter::col_eq("posts.userId", "user.id")],
    );
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!([]));
    assert!(adapter.calls().is_empty());

    // A one-row demand still reports NotFound, without touching the
    // database either.
    let err = query.take().run(&ctx).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn custom_codec_round_trips_through_insert_and_select() {
    // Cents-encoded price column: app values are dollars.
    let schema = TableSchema::new("item")
        .column(ColumnDef::new("id").primary_key())
        .column(
            ColumnDef::new("price")
                .encode_with(|v| Ok(json!((v.as_f64().unwrap() * 100.0).round() as i64)))
                .decode_with(|v| Ok(json!(v.as_i64().unwrap() as f64 / 100.0))),
        );

    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    adapter.respond_rows(&["id", "price"], vec![vec![json!(1), json!(1250)]]);
    Query::table(schema.clone())
        .create(vec![("price", json!(12.5))])
        .run(&ctx)
        .await
        .unwrap();
    assert_eq!(adapter.calls()[0].params, vec![json!(1250)]);

    adapter.respond_rows(&["price"], vec![vec![json!(1250)]]);
    let value = Query::table(schema)
        .find(1)
        .value_of("price")
        .run(&ctx)
        .await
        .unwrap();
    assert_eq!(value, json!(12.5));
}

#[tokio::test]
async fn transforms_apply_after_parsing_in_order() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user())
        .pluck("name")
        .transform(|v| json!(v.as_array().map(|a| a.len()).unwrap_or(0)))
        .transform(|v| json!(v.as_u64().unwrap_or(0) * 10));

    adapter.respond_rows(&["name"], vec![vec![json!("a")], vec![json!("b")]]);
    let result = query.run(&ctx).await.unwrap();
    assert_eq!(result, json!(20));
}

#[tokio::test]
async fn joined_projection_parses_into_nested_object() {
    let profile = TableSchema::new("profile")
        .column(ColumnDef::new("id").primary_key())
        .column(ColumnDef::new("userId"))
        .column(
            ColumnDef::new("bio").decode_with(|v| {
                Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
            }),
        );
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user())
        .join(profile, "profile.userId", "user.id")
        .select(&["user.id", "profile.*"]);

    adapter.respond_rows(
        &["id", "profile"],
        vec![vec![json!(1), json!({"id": 2, "userId": 1, "bio": "hey"})]],
    );
    let result = query.run(&ctx).await.unwrap();
    // One flat SQL row carries the joined table as a nested object, and the
    // joined column's decoder ran inside it.
    assert_eq!(
        result,
        json!([{"id": 1, "profile": {"id": 2, "userId": 1, "bio": "HEY"}}])
    );
    assert!(adapter.sqls()[0].contains("json_build_object"));
}

#[tokio::test]
async fn unique_violation_is_recognizable() {
    let adapter = Arc::new(TestAdapter::new());
    let ctx = ctx_with(&adapter);

    let query = Query::table(user()).create(vec![("name", json!("a"))]);
    adapter.fail_next(ChainError::Query {
        message: "duplicate key value violates unique constraint".to_string(),
        code: Some("23505".to_string()),
        constraint: Some("user_name_key".to_string()),
    });
    let err = query.run(&ctx).await.unwrap_err();
    assert!(err.is_unique());
}
