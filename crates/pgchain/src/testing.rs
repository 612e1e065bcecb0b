//! Test double for the adapter boundary.
//!
//! [`TestAdapter`] records every statement it is asked to run and replays
//! scripted results, so execution semantics (hook ordering, transaction
//! wrapping, batch atomicity) are testable without a live database.
//! Transaction control statements are recorded but never consume a scripted
//! response, so scripts align with the data statements alone.

use crate::adapter::{Adapter, QueryOutput};
use crate::error::{ChainError, ChainResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

enum Scripted {
    Output(QueryOutput),
    Error(ChainError),
}

/// A recorded statement: SQL text plus bound parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Scripted, recording adapter for tests.
#[derive(Default)]
pub struct TestAdapter {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<VecDeque<Scripted>>,
}

impl TestAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for the next data statement.
    pub fn respond(&self, output: QueryOutput) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Scripted::Output(output));
    }

    /// Queue a result built from field names and rows.
    pub fn respond_rows(&self, fields: &[&str], rows: Vec<Vec<Value>>) {
        self.respond(QueryOutput {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            row_count: rows.len() as u64,
            rows,
        });
    }

    /// Queue a row-count-only result (statements without RETURNING).
    pub fn respond_count(&self, count: u64) {
        self.respond(QueryOutput {
            fields: Vec::new(),
            rows: Vec::new(),
            row_count: count,
        });
    }

    /// Queue a failure for the next data statement.
    pub fn fail_next(&self, err: ChainError) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Scripted::Error(err));
    }

    /// Every recorded statement, in execution order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded SQL texts, in execution order.
    pub fn sqls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.sql.clone()).collect()
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.calls.lock().unwrap().push(RecordedCall {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    fn is_control(sql: &str) -> bool {
        sql == "BEGIN"
            || sql == "COMMIT"
            || sql == "ROLLBACK"
            || sql.starts_with("SAVEPOINT ")
            || sql.starts_with("RELEASE SAVEPOINT ")
            || sql.starts_with("ROLLBACK TO SAVEPOINT ")
    }

    fn next(&self) -> ChainResult<QueryOutput> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Error(err)) => Err(err),
            None => Ok(QueryOutput::default()),
        }
    }
}

#[async_trait]
impl Adapter for TestAdapter {
    async fn query(&self, sql: &str, params: &[Value]) -> ChainResult<QueryOutput> {
        self.record(sql, params);
        if Self::is_control(sql) {
            return Ok(QueryOutput::default());
        }
        self.next()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> ChainResult<u64> {
        self.record(sql, params);
        if Self::is_control(sql) {
            return Ok(0);
        }
        self.next().map(|out| out.row_count)
    }

    async fn close(&self) -> ChainResult<()> {
        Ok(())
    }
}
