//! The query descriptor and its copy-on-write clone engine.
//!
//! [`QueryState`] is everything needed to build a statement. Every collection
//! field is `Arc`-wrapped: cloning a query bumps reference counts, and
//! builder methods mutate through [`Arc::make_mut`], which copies only the
//! collection actually being touched. Two queries therefore never alias
//! mutable state, and a chain of N builder calls stays linear-time no matter
//! how long the history is.

use crate::error::ChainError;
use crate::expr::Filter;
use crate::hooks::HookSet;
use crate::ident::ColumnRef;
use crate::joins::Join;
use crate::schema::{ColumnDef, DecodeFn, Shape, TableSchema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Statement kind of a query descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
}

/// The shape the result parser must produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnType {
    /// All rows, as objects.
    All,
    /// First row or an explicit no-value marker (JSON null).
    One,
    /// First row, raising NotFound on zero rows.
    OneOrThrow,
    /// Column zero of row zero, or the no-value marker.
    Value,
    /// Column zero of row zero, raising NotFound on zero rows and on a
    /// non-nullable column's SQL NULL.
    ValueOrThrow,
    /// All rows as positional arrays.
    Rows,
    /// Column zero of every row, as a flat array.
    Pluck,
    /// No result payload; the affected-row count is returned instead.
    Void,
}

/// One item of the select list, in declaration order.
#[derive(Clone, Debug)]
pub enum SelectItem {
    /// `*` of the host table, honoring `explicit_select` flags.
    Star,
    /// A column, optionally table-qualified (`profile.userId`).
    Column(ColumnRef),
    /// `alias.*` of a joined table, projected as a nested JSON object.
    TableStar(String),
    /// A raw SQL expression with an output alias.
    Expr { alias: String, sql: String },
    /// A sub-query projected as a nested value, keyed by `alias`.
    SubQuery {
        alias: String,
        query: Box<QueryState>,
    },
}

/// One ORDER BY entry.
#[derive(Clone, Debug)]
pub enum OrderItem {
    Column { column: ColumnRef, desc: bool },
    Raw(String),
}

/// A user-declared CTE.
#[derive(Clone, Debug)]
pub struct CteDef {
    pub name: String,
    pub query: Box<QueryState>,
}

/// A value position in a mutation payload.
#[derive(Clone, Debug)]
pub enum ColumnValue {
    /// A plain value, encoded with the column's encoder at composition time.
    Value(Value),
    /// A raw SQL expression; bypasses encoding.
    Raw(String),
    /// A sub-query; mutating sub-queries are hoisted into CTEs.
    SubQuery(Box<QueryState>),
    /// Postgres DEFAULT.
    Default,
}

/// ON CONFLICT clause.
#[derive(Clone, Debug)]
pub struct OnConflict {
    /// Conflict target columns; None lets Postgres pick the arbiter.
    pub target: Option<Vec<String>>,
    pub action: ConflictAction,
}

#[derive(Clone, Debug)]
pub enum ConflictAction {
    /// `DO NOTHING`; makes the statically-known result optional.
    DoNothing,
    /// `DO UPDATE SET col = EXCLUDED.col` for the given columns, or for all
    /// inserted columns when None.
    Merge { columns: Option<Vec<String>> },
    /// `DO UPDATE SET` with explicit values.
    Set(Vec<(String, ColumnValue)>),
}

/// One partial update, applied in the order added.
#[derive(Clone, Debug)]
pub enum UpdatePatch {
    /// Plain column assignments.
    Set(Vec<(String, ColumnValue)>),
    /// Arithmetic patch: `col = col + amount` (negative for decrement).
    Step { column: String, amount: i64 },
}

/// Insert payload: ordered columns plus one value row per inserted record.
#[derive(Clone, Debug, Default)]
pub struct InsertPayload {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ColumnValue>>,
    pub on_conflict: Option<OnConflict>,
    /// Column names the caller supplied, as seen by before-hooks.
    pub user_columns: Vec<String>,
}

/// Update payload: patches accumulate (hooks may push more) and are merged
/// in order at composition time.
#[derive(Clone, Debug, Default)]
pub struct UpdatePayload {
    pub patches: Vec<UpdatePatch>,
    /// Explicitly allow updating without a filter.
    pub all_rows: bool,
    pub user_columns: Vec<String>,
}

/// Mutation payload, present for insert/update/delete descriptors.
#[derive(Clone, Debug)]
pub enum Payload {
    Insert(InsertPayload),
    Update(UpdatePayload),
    Delete { all_rows: bool },
}

/// A parser for nested JSON produced by a sub-query projection.
///
/// `path` locates the nested structure inside a parsed row; the remaining
/// fields replay the nested query's own return-type semantics recursively.
#[derive(Clone)]
pub struct BatchParser {
    pub path: Vec<String>,
    pub return_type: ReturnType,
    pub parsers: BTreeMap<String, DecodeFn>,
    /// Parser for the single value of a pluck/value projection.
    pub value_parser: Option<DecodeFn>,
    pub nested: Vec<BatchParser>,
}

impl std::fmt::Debug for BatchParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchParser")
            .field("path", &self.path)
            .field("return_type", &self.return_type)
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .field("nested", &self.nested)
            .finish()
    }
}

/// Result-transform function applied after parsing, in registration order.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Handler for after-commit hook failures.
pub type AfterCommitHandler = Arc<dyn Fn(&ChainError) + Send + Sync>;

/// The immutable descriptor of one logical query.
#[derive(Clone)]
pub struct QueryState {
    pub kind: QueryKind,
    pub schema: TableSchema,
    pub alias: Option<String>,
    pub select: Arc<Vec<SelectItem>>,
    pub filters: Arc<Vec<Filter>>,
    pub joins: Arc<Vec<Join>>,
    pub with: Arc<Vec<CteDef>>,
    pub group: Arc<Vec<ColumnRef>>,
    pub order: Arc<Vec<OrderItem>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub return_type: ReturnType,
    /// Shapes of joined targets, keyed by join alias.
    pub joined_shapes: Arc<BTreeMap<String, Arc<Shape>>>,
    /// Decode functions of joined targets, keyed by join alias.
    pub joined_parsers: Arc<BTreeMap<String, BTreeMap<String, DecodeFn>>>,
    /// Computed-column SQL of joined sub-queries, keyed by join alias.
    pub joined_computeds: Arc<BTreeMap<String, BTreeMap<String, String>>>,
    /// Decode overrides for the current projection; defaults come from the
    /// shape's own column decoders.
    pub parsers: Arc<BTreeMap<String, DecodeFn>>,
    pub batch_parsers: Arc<Vec<BatchParser>>,
    pub hooks: Arc<HookSet>,
    pub transforms: Arc<Vec<Transform>>,
    pub payload: Option<Arc<Payload>>,
    /// Logical table name -> alias actually used in emitted SQL.
    pub aliases: Arc<BTreeMap<String, String>>,
    /// Empty-result sentinel: compose nothing, return the empty result.
    pub none: bool,
    /// Override for the empty-sub-query fallback (`'[]'` by default).
    pub coalesce_value: Option<Value>,
    /// Column metadata behind a value/value_or_throw projection.
    pub value_column: Option<ColumnDef>,
    pub after_commit_handlers: Arc<Vec<AfterCommitHandler>>,
    /// Deferred builder-misuse error, surfaced when the query is composed
    /// or executed.
    pub build_error: Option<String>,
}

impl QueryState {
    /// Base state for a table handle: `SELECT *`, all rows.
    pub fn new(schema: TableSchema) -> Self {
        Self {
            kind: QueryKind::Select,
            schema,
            alias: None,
            select: Arc::new(Vec::new()),
            filters: Arc::new(Vec::new()),
            joins: Arc::new(Vec::new()),
            with: Arc::new(Vec::new()),
            group: Arc::new(Vec::new()),
            order: Arc::new(Vec::new()),
            limit: None,
            offset: None,
            return_type: ReturnType::All,
            joined_shapes: Arc::new(BTreeMap::new()),
            joined_parsers: Arc::new(BTreeMap::new()),
            joined_computeds: Arc::new(BTreeMap::new()),
            parsers: Arc::new(BTreeMap::new()),
            batch_parsers: Arc::new(Vec::new()),
            hooks: Arc::new(HookSet::default()),
            transforms: Arc::new(Vec::new()),
            payload: None,
            aliases: Arc::new(BTreeMap::new()),
            none: false,
            coalesce_value: None,
            value_column: None,
            after_commit_handlers: Arc::new(Vec::new()),
            build_error: None,
        }
    }

    /// The alias the host table goes by in emitted SQL.
    pub fn table_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.schema.table)
    }

    // Copy-on-write accessors. Each copies only the collection it touches,
    // and only when it is shared.

    pub(crate) fn select_mut(&mut self) -> &mut Vec<SelectItem> {
        Arc::make_mut(&mut self.select)
    }

    pub(crate) fn filters_mut(&mut self) -> &mut Vec<Filter> {
        Arc::make_mut(&mut self.filters)
    }

    pub(crate) fn joins_mut(&mut self) -> &mut Vec<Join> {
        Arc::make_mut(&mut self.joins)
    }

    pub(crate) fn with_mut(&mut self) -> &mut Vec<CteDef> {
        Arc::make_mut(&mut self.with)
    }

    pub(crate) fn group_mut(&mut self) -> &mut Vec<ColumnRef> {
        Arc::make_mut(&mut self.group)
    }

    pub(crate) fn order_mut(&mut self) -> &mut Vec<OrderItem> {
        Arc::make_mut(&mut self.order)
    }

    pub(crate) fn joined_shapes_mut(&mut self) -> &mut BTreeMap<String, Arc<Shape>> {
        Arc::make_mut(&mut self.joined_shapes)
    }

    pub(crate) fn joined_parsers_mut(&mut self) -> &mut BTreeMap<String, BTreeMap<String, DecodeFn>> {
        Arc::make_mut(&mut self.joined_parsers)
    }

    pub(crate) fn joined_computeds_mut(&mut self) -> &mut BTreeMap<String, BTreeMap<String, String>> {
        Arc::make_mut(&mut self.joined_computeds)
    }

    pub(crate) fn batch_parsers_mut(&mut self) -> &mut Vec<BatchParser> {
        Arc::make_mut(&mut self.batch_parsers)
    }

    pub(crate) fn hooks_mut(&mut self) -> &mut HookSet {
        Arc::make_mut(&mut self.hooks)
    }

    pub(crate) fn transforms_mut(&mut self) -> &mut Vec<Transform> {
        Arc::make_mut(&mut self.transforms)
    }

    pub(crate) fn aliases_mut(&mut self) -> &mut BTreeMap<String, String> {
        Arc::make_mut(&mut self.aliases)
    }

    pub(crate) fn after_commit_handlers_mut(&mut self) -> &mut Vec<AfterCommitHandler> {
        Arc::make_mut(&mut self.after_commit_handlers)
    }

    /// Mutable access to the mutation payload; the payload must exist.
    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        Arc::make_mut(self.payload.as_mut().expect("mutation payload not set"))
    }

    /// Pick a free alias for a joined table, appending a counter when the
    /// logical name is already taken by the host table or another join.
    pub(crate) fn free_alias(&self, wanted: &str) -> String {
        let taken = |name: &str| {
            name == self.table_alias() || self.joined_shapes.contains_key(name)
        };
        if !taken(wanted) {
            return wanted.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{wanted}{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Decode function for a projected column: projection overrides first,
    /// then the shape's own column decoder.
    pub(crate) fn parser_for(&self, column: &str) -> Option<DecodeFn> {
        if let Some(p) = self.parsers.get(column) {
            return Some(p.clone());
        }
        self.schema.shape.get(column).and_then(|c| c.decode.clone())
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("kind", &self.kind)
            .field("table", &self.schema.table)
            .field("return_type", &self.return_type)
            .field("select", &self.select)
            .field("joins", &self.joins.len())
            .field("none", &self.none)
            .finish()
    }
}
