//! Parameter storage for `$n` placeholder assignment.
//!
//! One `ParamList` is threaded through an entire composition pass, so
//! placeholder numbering is globally correct across CTEs, joins, and
//! sub-queries without any renumbering step. Parameters are
//! `serde_json::Value`: the engine is runtime-dynamic, and the Postgres
//! adapter binds them against the statement's inferred parameter types.

use serde_json::Value;

/// An ordered collection of bound parameters.
#[derive(Clone, Debug, Default)]
pub struct ParamList {
    params: Vec<Value>,
}

impl ParamList {
    /// Create a new empty parameter list.
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Add a parameter and return its 1-based placeholder index.
    pub fn push(&mut self, value: Value) -> usize {
        self.params.push(value);
        self.params.len()
    }

    /// Get the current parameter count.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Borrow the parameters in placeholder order.
    pub fn as_slice(&self) -> &[Value] {
        &self.params
    }

    /// Consume the list, yielding the parameters in placeholder order.
    pub fn into_values(self) -> Vec<Value> {
        self.params
    }
}
