//! The chainable query type.
//!
//! Every builder method clones the descriptor (cheap, structurally shared)
//! and returns a new query; the receiver is never mutated after it has been
//! handed to a caller. Methods that change result cardinality update the
//! return type and the selection together.

use crate::compose::{compose, Statement};
use crate::context::ExecContext;
use crate::error::{ChainError, ChainResult};
use crate::expr::Filter;
use crate::hooks::{AfterKind, BeforeKind, MutationHook, ResultHook};
use crate::ident::{check_name, ColumnRef};
use crate::joins::{needs_lateral, resolve_target, Join, JoinKind, JoinTarget};
use crate::pipeline;
use crate::schema::{ColumnDef, DecodeFn, TableSchema};
use crate::state::{
    BatchParser, ColumnValue, ConflictAction, CteDef, InsertPayload, OnConflict, OrderItem,
    Payload, QueryKind, QueryState, ReturnType, SelectItem, UpdatePatch, UpdatePayload,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A chainable, immutable query descriptor over one table.
#[derive(Clone, Debug)]
pub struct Query {
    state: QueryState,
}

impl Query {
    /// Base query for a table: `SELECT *`, all rows.
    pub fn table(schema: TableSchema) -> Self {
        Self {
            state: QueryState::new(schema),
        }
    }

    /// The empty-result sentinel: never touches the database.
    pub fn none(schema: TableSchema) -> Self {
        let mut state = QueryState::new(schema);
        state.none = true;
        Self { state }
    }

    /// The underlying descriptor, for inspection.
    pub fn state(&self) -> &QueryState {
        &self.state
    }

    /// Whether this query is the empty-result sentinel.
    pub fn is_none(&self) -> bool {
        self.state.none
    }

    fn defer_error(mut self, message: impl Into<String>) -> Self {
        if self.state.build_error.is_none() {
            self.state.build_error = Some(message.into());
        }
        self
    }

    // ==================== SELECT ====================

    /// Select columns. Accepts `"col"`, `"alias.col"`, `"alias.*"` for a
    /// joined table (projected as a nested JSON object), and `"*"`.
    pub fn select(mut self, columns: &[&str]) -> Self {
        for &column in columns {
            self = self.add_select(column);
        }
        self
    }

    fn add_select(mut self, column: &str) -> Self {
        if column == "*" {
            self.state.select_mut().push(SelectItem::Star);
            return self;
        }
        if let Some(prefix) = column.strip_suffix(".*") {
            if prefix == self.state.table_alias() {
                self.state.select_mut().push(SelectItem::Star);
                return self;
            }
            let parsers = self
                .state
                .joined_parsers
                .get(prefix)
                .cloned()
                .unwrap_or_default();
            if !parsers.is_empty() {
                self.state.batch_parsers_mut().push(BatchParser {
                    path: vec![prefix.to_string()],
                    return_type: ReturnType::One,
                    parsers,
                    value_parser: None,
                    nested: Vec::new(),
                });
            }
            let item = SelectItem::TableStar(prefix.to_string());
            self.state.select_mut().push(item);
            return self;
        }
        self.state
            .select_mut()
            .push(SelectItem::Column(ColumnRef::parse(column)));
        self
    }

    /// Select a raw SQL expression under an output alias.
    pub fn select_expr(mut self, alias: &str, sql: &str) -> Self {
        self.state.select_mut().push(SelectItem::Expr {
            alias: alias.to_string(),
            sql: sql.to_string(),
        });
        self
    }

    /// Select a sub-query as a nested value keyed by `alias`. Multi-row
    /// sub-queries project as JSON arrays, single-row ones as objects,
    /// value/pluck ones as scalars/arrays; parsing mirrors that shape.
    pub fn select_subquery(mut self, alias: &str, sub: Query) -> Self {
        let sub_state = sub.state;
        self.state.batch_parsers_mut().push(BatchParser {
            path: vec![alias.to_string()],
            return_type: sub_state.return_type,
            parsers: projection_parsers(&sub_state),
            value_parser: value_parser_of(&sub_state),
            nested: sub_state.batch_parsers.as_ref().clone(),
        });
        self.state.select_mut().push(SelectItem::SubQuery {
            alias: alias.to_string(),
            query: Box::new(sub_state),
        });
        self
    }

    /// Override the fallback used when an empty sub-query projection
    /// coalesces (default `'[]'`).
    pub fn coalesce(mut self, value: Value) -> Self {
        self.state.coalesce_value = Some(value);
        self
    }

    // ==================== WHERE ====================

    /// Add an arbitrary filter expression.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.state.filters_mut().push(filter);
        self
    }

    /// Add WHERE: column = value
    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Add WHERE: column != value
    pub fn where_ne(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::ne(column, value))
    }

    /// Add WHERE: column > value
    pub fn where_gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::gt(column, value))
    }

    /// Add WHERE: column >= value
    pub fn where_gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::gte(column, value))
    }

    /// Add WHERE: column < value
    pub fn where_lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::lt(column, value))
    }

    /// Add WHERE: column <= value
    pub fn where_lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::lte(column, value))
    }

    /// Add WHERE: column IN (values...)
    pub fn where_in(self, column: &str, values: Vec<Value>) -> Self {
        self.filter(Filter::in_list(column, values))
    }

    /// Add WHERE: column IS NULL
    pub fn where_null(self, column: &str) -> Self {
        self.filter(Filter::is_null(column))
    }

    /// Add WHERE: column IS NOT NULL
    pub fn where_not_null(self, column: &str) -> Self {
        self.filter(Filter::is_not_null(column))
    }

    /// Add a raw WHERE condition without params.
    pub fn where_raw(self, sql: &str) -> Self {
        self.filter(Filter::raw(sql))
    }

    /// Add a WHERE condition with `?` placeholders.
    pub fn where_template(self, sql: &str, params: Vec<Value>) -> Self {
        self.filter(Filter::template(sql, params))
    }

    /// OR-compose a group of filters.
    pub fn or_where(self, filters: Vec<Filter>) -> Self {
        self.filter(Filter::or(filters))
    }

    /// Add WHERE EXISTS (sub-query).
    pub fn where_exists(self, sub: Query) -> Self {
        self.filter(Filter::exists(sub.state))
    }

    // ==================== Cardinality ====================

    /// Primary-key lookup; the result is exactly one row or NotFound.
    pub fn find(mut self, pk: impl Into<Value>) -> Self {
        let Some(pk_col) = self.state.schema.shape.primary_key().cloned() else {
            let msg = format!(
                "table \"{}\" has no single primary key for find",
                self.state.schema.table
            );
            return self.defer_error(msg);
        };
        self.state
            .filters_mut()
            .push(Filter::eq(&pk_col.name, pk.into()));
        self.state.return_type = ReturnType::OneOrThrow;
        self.state.limit = Some(1);
        self
    }

    /// Primary-key lookup resolving to the no-value marker on a miss.
    pub fn find_optional(mut self, pk: impl Into<Value>) -> Self {
        self = self.find(pk);
        self.state.return_type = ReturnType::One;
        self
    }

    /// First matching row, or NotFound.
    pub fn take(mut self) -> Self {
        self.state.return_type = ReturnType::OneOrThrow;
        self.state.limit = Some(1);
        self
    }

    /// First matching row, or the no-value marker.
    pub fn take_optional(mut self) -> Self {
        self.state.return_type = ReturnType::One;
        self.state.limit = Some(1);
        self
    }

    /// Single value of one column from the first row, or NotFound (also
    /// raised for SQL NULL when the column is non-nullable).
    pub fn value_of(mut self, column: &str) -> Self {
        let cref = ColumnRef::parse(column);
        self.state.value_column = self
            .state
            .schema
            .shape
            .get(cref.field_name())
            .cloned()
            .or_else(|| Some(ColumnDef::new(cref.field_name())));
        self.state.select = Arc::new(vec![SelectItem::Column(cref)]);
        self.state.return_type = ReturnType::ValueOrThrow;
        self.state.limit = Some(1);
        self
    }

    /// Single value of one column, or the no-value marker.
    pub fn value_optional(mut self, column: &str) -> Self {
        self = self.value_of(column);
        self.state.return_type = ReturnType::Value;
        self
    }

    /// One column of every matching row, as a flat array.
    pub fn pluck(mut self, column: &str) -> Self {
        let cref = ColumnRef::parse(column);
        self.state.value_column = self
            .state
            .schema
            .shape
            .get(cref.field_name())
            .cloned()
            .or_else(|| Some(ColumnDef::new(cref.field_name())));
        self.state.select = Arc::new(vec![SelectItem::Column(cref)]);
        self.state.return_type = ReturnType::Pluck;
        self
    }

    /// All rows as positional arrays.
    pub fn rows(mut self) -> Self {
        self.state.return_type = ReturnType::Rows;
        self
    }

    /// Discard the result payload; the affected-row count is returned.
    pub fn void(mut self) -> Self {
        self.state.return_type = ReturnType::Void;
        self
    }

    /// `SELECT count(*)` honoring filters and joins.
    pub fn count(mut self) -> Self {
        self.state.select = Arc::new(vec![SelectItem::Expr {
            alias: "count".to_string(),
            sql: "count(*)".to_string(),
        }]);
        self.state.value_column = None;
        self.state.return_type = ReturnType::ValueOrThrow;
        self
    }

    /// `SELECT true ... LIMIT 1` existence probe.
    pub fn exists(mut self) -> Self {
        self.state.select = Arc::new(vec![SelectItem::Expr {
            alias: "exists".to_string(),
            sql: "true".to_string(),
        }]);
        self.state.value_column = None;
        self.state.return_type = ReturnType::Value;
        self.state.limit = Some(1);
        self
    }

    // ==================== JOIN ====================

    /// Inner join on a column pair, e.g. `("profile.userId", "user.id")`.
    pub fn join(self, schema: TableSchema, left: &str, right: &str) -> Self {
        let on = vec![Filter::col_eq(left, right)];
        self.add_join(JoinKind::Inner, JoinTarget::Table(schema), None, on, true)
    }

    /// Left join on a column pair.
    pub fn left_join(self, schema: TableSchema, left: &str, right: &str) -> Self {
        let on = vec![Filter::col_eq(left, right)];
        self.add_join(JoinKind::Left, JoinTarget::Table(schema), None, on, false)
    }

    /// Right join on a column pair.
    pub fn right_join(self, schema: TableSchema, left: &str, right: &str) -> Self {
        let on = vec![Filter::col_eq(left, right)];
        self.add_join(JoinKind::Right, JoinTarget::Table(schema), None, on, false)
    }

    /// Full join on a column pair.
    pub fn full_join(self, schema: TableSchema, left: &str, right: &str) -> Self {
        let on = vec![Filter::col_eq(left, right)];
        self.add_join(JoinKind::Full, JoinTarget::Table(schema), None, on, false)
    }

    /// Join with explicit kind, condition filters, and optional alias.
    pub fn join_with(
        self,
        kind: JoinKind,
        schema: TableSchema,
        alias: Option<&str>,
        on: Vec<Filter>,
    ) -> Self {
        let required = kind == JoinKind::Inner;
        self.add_join(
            kind,
            JoinTarget::Table(schema),
            alias.map(str::to_string),
            on,
            required,
        )
    }

    /// Join a sub-query; becomes `JOIN LATERAL` automatically when the
    /// sub-query references the outer row.
    pub fn join_subquery(
        self,
        kind: JoinKind,
        sub: Query,
        alias: Option<&str>,
        on: Vec<Filter>,
    ) -> Self {
        if sub.state.kind != QueryKind::Select {
            return self.defer_error("only select sub-queries can be joined");
        }
        let required = kind == JoinKind::Inner;
        self.add_join(
            kind,
            JoinTarget::SubQuery(Box::new(sub.state)),
            alias.map(str::to_string),
            on,
            required,
        )
    }

    /// Join a CTE declared with [`Query::with`].
    pub fn join_cte(self, kind: JoinKind, name: &str, on: Vec<Filter>) -> Self {
        let required = kind == JoinKind::Inner;
        self.add_join(kind, JoinTarget::Cte(name.to_string()), None, on, required)
    }

    fn add_join(
        mut self,
        kind: JoinKind,
        target: JoinTarget,
        alias: Option<String>,
        on: Vec<Filter>,
        required: bool,
    ) -> Self {
        // Inner-joining the empty sentinel empties the whole query without
        // touching the database.
        if let JoinTarget::SubQuery(sub) = &target {
            if sub.none && required {
                self.state.none = true;
                return self;
            }
        }

        let lateral = match &target {
            JoinTarget::SubQuery(sub) => needs_lateral(sub),
            _ => false,
        };
        let logical = target.default_alias().to_string();
        let wanted = alias.unwrap_or_else(|| logical.clone());
        let mut join = Join {
            kind,
            target,
            alias: wanted.clone(),
            on,
            lateral,
            required,
        };

        // Structural dedup, checked against the requested alias before any
        // collision renaming; conditions carrying bound values never match.
        if let Some(signature) = join.static_signature() {
            let duplicate = self
                .state
                .joins
                .iter()
                .any(|existing| existing.static_signature().as_deref() == Some(signature.as_str()));
            if duplicate {
                return self;
            }
        }
        let alias = self.state.free_alias(&wanted);
        join.alias = alias.clone();

        let resolved = resolve_target(&join.target);
        self.state
            .joined_shapes_mut()
            .insert(alias.clone(), resolved.shape);
        if !resolved.parsers.is_empty() {
            self.state
                .joined_parsers_mut()
                .insert(alias.clone(), resolved.parsers);
        }
        if !resolved.computeds.is_empty() {
            self.state
                .joined_computeds_mut()
                .insert(alias.clone(), resolved.computeds);
        }
        self.state.aliases_mut().insert(logical, alias);
        self.state.joins_mut().push(join);
        self
    }

    // ==================== CTE ====================

    /// Declare a CTE. Mutating queries are allowed and run atomically with
    /// the host statement.
    pub fn with(mut self, name: &str, sub: Query) -> Self {
        if let Err(err) = check_name(name) {
            return self.defer_error(format!("invalid CTE name: {err}"));
        }
        self.state.with_mut().push(CteDef {
            name: name.to_string(),
            query: Box::new(sub.state),
        });
        self
    }

    // ==================== Ordering & pagination ====================

    pub fn order_by(mut self, column: &str) -> Self {
        self.state.order_mut().push(OrderItem::Column {
            column: ColumnRef::parse(column),
            desc: false,
        });
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.state.order_mut().push(OrderItem::Column {
            column: ColumnRef::parse(column),
            desc: true,
        });
        self
    }

    pub fn order_raw(mut self, sql: &str) -> Self {
        self.state.order_mut().push(OrderItem::Raw(sql.to_string()));
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.state.group_mut().push(ColumnRef::parse(column));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.state.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.state.offset = Some(n);
        self
    }

    // ==================== INSERT ====================

    /// Insert one row. Defaults fill omitted columns, virtual columns
    /// delegate to their create handler, read-only columns reject
    /// user-supplied values. Returns the created row.
    pub fn create(self, data: Vec<(&str, Value)>) -> Self {
        self.insert_rows(vec![data], ReturnType::OneOrThrow)
    }

    /// Insert many rows; oversized batches split into multiple statements
    /// run inside one transaction. Returns the created rows.
    pub fn create_many(self, rows: Vec<Vec<(&str, Value)>>) -> Self {
        self.insert_rows(rows, ReturnType::All)
    }

    fn insert_rows(mut self, data: Vec<Vec<(&str, Value)>>, return_type: ReturnType) -> Self {
        if data.is_empty() {
            self.state.none = true;
            self.state.kind = QueryKind::Insert;
            self.state.return_type = ReturnType::All;
            return self;
        }

        let mut user_columns: Vec<String> = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<BTreeMap<String, ColumnValue>> = Vec::with_capacity(data.len());

        for row_data in &data {
            let mut row: BTreeMap<String, ColumnValue> = BTreeMap::new();
            for (column, value) in row_data {
                let def = self.state.schema.shape.get(column);
                if let Some(def) = def {
                    if def.read_only || def.app_read_only {
                        return self.defer_error(format!(
                            "column \"{column}\" is read-only and cannot be inserted"
                        ));
                    }
                    if let Some(handler) = def.virtual_create.clone() {
                        match handler(value) {
                            Ok(pairs) => {
                                for (target, concrete) in pairs {
                                    if !columns.contains(&target) {
                                        columns.push(target.clone());
                                    }
                                    row.insert(target, ColumnValue::Value(concrete));
                                }
                            }
                            Err(err) => {
                                return self.defer_error(format!(
                                    "virtual column \"{column}\": {err}"
                                ));
                            }
                        }
                        if !user_columns.contains(&column.to_string()) {
                            user_columns.push(column.to_string());
                        }
                        continue;
                    }
                }
                if !columns.contains(&column.to_string()) {
                    columns.push(column.to_string());
                }
                if !user_columns.contains(&column.to_string()) {
                    user_columns.push(column.to_string());
                }
                row.insert(column.to_string(), ColumnValue::Value(value.clone()));
            }
            rows.push(row);
        }

        // Query-level defaults for stored columns no row supplied.
        for def in self.state.schema.shape.iter() {
            if def.default.is_some() && def.is_stored() && !columns.contains(&def.name) {
                columns.push(def.name.clone());
            }
        }

        let value_rows: Vec<Vec<ColumnValue>> = rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|column| {
                        row.remove(column).unwrap_or_else(|| {
                            match self
                                .state
                                .schema
                                .shape
                                .get(column)
                                .and_then(|d| d.default.clone())
                            {
                                Some(factory) => ColumnValue::Value(factory()),
                                None => ColumnValue::Default,
                            }
                        })
                    })
                    .collect()
            })
            .collect();

        self.state.kind = QueryKind::Insert;
        self.state.return_type = return_type;
        self.state.payload = Some(Arc::new(Payload::Insert(InsertPayload {
            columns,
            rows: value_rows,
            on_conflict: None,
            user_columns,
        })));
        self
    }

    /// Insert with explicit column values (raw SQL, sub-queries, DEFAULT).
    pub fn create_from(mut self, columns: &[&str], rows: Vec<Vec<ColumnValue>>) -> Self {
        self.state.kind = QueryKind::Insert;
        self.state.return_type = ReturnType::OneOrThrow;
        self.state.payload = Some(Arc::new(Payload::Insert(InsertPayload {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows,
            on_conflict: None,
            user_columns: columns.iter().map(|s| s.to_string()).collect(),
        })));
        self
    }

    /// Start an ON CONFLICT clause for the given target columns.
    pub fn on_conflict(self, target: &[&str]) -> OnConflictQuery {
        OnConflictQuery {
            query: self,
            target: Some(target.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// `ON CONFLICT DO NOTHING` without a target. The result becomes
    /// optional: a conflict yields no row.
    pub fn on_conflict_do_nothing(self) -> Self {
        OnConflictQuery {
            query: self,
            target: None,
        }
        .do_nothing()
    }

    fn set_conflict(mut self, target: Option<Vec<String>>, action: ConflictAction) -> Self {
        if !matches!(self.state.payload.as_deref(), Some(Payload::Insert(_))) {
            return self.defer_error("on_conflict requires an insert query");
        }
        let optional = matches!(action, ConflictAction::DoNothing);
        let Payload::Insert(payload) = self.state.payload_mut() else {
            unreachable!()
        };
        payload.on_conflict = Some(OnConflict { target, action });
        if optional {
            // A conflict produces no row; soften the return type.
            self.state.return_type = match self.state.return_type {
                ReturnType::OneOrThrow => ReturnType::One,
                ReturnType::ValueOrThrow => ReturnType::Value,
                other => other,
            };
        }
        self
    }

    // ==================== UPDATE ====================

    /// Update matching rows with a partial patch. Returns the affected-row
    /// count; chain `returning` to get rows back. Requires a filter unless
    /// `all_rows` was requested.
    pub fn update(mut self, data: Vec<(&str, Value)>) -> Self {
        for (column, _) in &data {
            if let Some(def) = self.state.schema.shape.get(column) {
                if def.read_only || def.app_read_only {
                    return self.defer_error(format!(
                        "column \"{column}\" is read-only and cannot be updated"
                    ));
                }
            }
        }
        let user_columns: Vec<String> = data.iter().map(|(c, _)| c.to_string()).collect();
        let sets: Vec<(String, ColumnValue)> = data
            .into_iter()
            .map(|(c, v)| (c.to_string(), ColumnValue::Value(v)))
            .collect();
        self.ensure_update_payload();
        let Payload::Update(payload) = self.state.payload_mut() else {
            unreachable!()
        };
        payload.patches.push(UpdatePatch::Set(sets));
        payload.user_columns.extend(user_columns);
        self
    }

    /// Assign one column to the result of a sub-query. A mutating sub-query
    /// is hoisted into a CTE of this statement, so both run atomically.
    pub fn set_from(self, column: &str, sub: Query) -> Self {
        self.set_value(column, ColumnValue::from(sub))
    }

    /// Assign one column to an explicit value form (raw SQL, sub-query,
    /// DEFAULT); bypasses encoding.
    pub fn set_value(mut self, column: &str, value: ColumnValue) -> Self {
        self.ensure_update_payload();
        let Payload::Update(payload) = self.state.payload_mut() else {
            unreachable!()
        };
        payload
            .patches
            .push(UpdatePatch::Set(vec![(column.to_string(), value)]));
        self
    }

    /// `col = col + amount` arithmetic patch.
    pub fn increment(mut self, column: &str, amount: i64) -> Self {
        self.ensure_update_payload();
        let Payload::Update(payload) = self.state.payload_mut() else {
            unreachable!()
        };
        payload.patches.push(UpdatePatch::Step {
            column: column.to_string(),
            amount,
        });
        self
    }

    /// `col = col - amount` arithmetic patch.
    pub fn decrement(self, column: &str, amount: i64) -> Self {
        self.increment(column, -amount)
    }

    fn ensure_update_payload(&mut self) {
        if !matches!(self.state.payload.as_deref(), Some(Payload::Update(_))) {
            self.state.kind = QueryKind::Update;
            self.state.return_type = ReturnType::Void;
            self.state.payload = Some(Arc::new(Payload::Update(UpdatePayload::default())));
        }
    }

    // ==================== DELETE ====================

    /// Delete matching rows. Returns the affected-row count; requires a
    /// filter unless `all_rows` was requested.
    pub fn delete(mut self) -> Self {
        self.state.kind = QueryKind::Delete;
        self.state.return_type = ReturnType::Void;
        self.state.payload = Some(Arc::new(Payload::Delete { all_rows: false }));
        self
    }

    /// Explicitly allow an update/delete to touch every row.
    pub fn all_rows(mut self) -> Self {
        let is_update = matches!(self.state.payload.as_deref(), Some(Payload::Update(_)));
        let is_delete = matches!(self.state.payload.as_deref(), Some(Payload::Delete { .. }));
        if is_update {
            let Payload::Update(payload) = self.state.payload_mut() else {
                unreachable!()
            };
            payload.all_rows = true;
            self
        } else if is_delete {
            *self.state.payload_mut() = Payload::Delete { all_rows: true };
            self
        } else {
            self.defer_error("all_rows applies to update and delete queries")
        }
    }

    /// RETURNING clause for a mutation: select the given columns and switch
    /// to a row-returning result.
    pub fn returning(mut self, columns: &[&str]) -> Self {
        self = self.select(columns);
        self.state.return_type = match (self.state.kind, self.state.return_type) {
            (QueryKind::Insert, ReturnType::OneOrThrow | ReturnType::One) => {
                self.state.return_type
            }
            _ => ReturnType::All,
        };
        self
    }

    // ==================== Hooks ====================

    pub fn before(self, hook: impl MutationHook + 'static) -> Self {
        self.add_before(BeforeKind::Any, hook)
    }

    pub fn before_create(self, hook: impl MutationHook + 'static) -> Self {
        self.add_before(BeforeKind::Create, hook)
    }

    pub fn before_update(self, hook: impl MutationHook + 'static) -> Self {
        self.add_before(BeforeKind::Update, hook)
    }

    pub fn before_delete(self, hook: impl MutationHook + 'static) -> Self {
        self.add_before(BeforeKind::Delete, hook)
    }

    pub fn before_save(self, hook: impl MutationHook + 'static) -> Self {
        self.add_before(BeforeKind::Save, hook)
    }

    fn add_before(mut self, kind: BeforeKind, hook: impl MutationHook + 'static) -> Self {
        self.state.hooks_mut().add_before(kind, Arc::new(hook));
        self
    }

    pub fn after(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::Any, hook)
    }

    pub fn after_create(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::Create, hook)
    }

    pub fn after_update(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::Update, hook)
    }

    pub fn after_delete(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::Delete, hook)
    }

    pub fn after_save(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::Save, hook)
    }

    pub fn after_create_commit(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::CreateCommit, hook)
    }

    pub fn after_update_commit(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::UpdateCommit, hook)
    }

    pub fn after_delete_commit(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::DeleteCommit, hook)
    }

    pub fn after_save_commit(self, hook: impl ResultHook + 'static) -> Self {
        self.add_after(AfterKind::SaveCommit, hook)
    }

    fn add_after(mut self, kind: AfterKind, hook: impl ResultHook + 'static) -> Self {
        self.state.hooks_mut().add_after(kind, Arc::new(hook));
        self
    }

    /// Handle after-commit hook failures instead of surfacing them as an
    /// `AfterCommit` error. Multiple handlers may be registered.
    pub fn catch_after_commit_error(
        mut self,
        handler: impl Fn(&ChainError) + Send + Sync + 'static,
    ) -> Self {
        self.state
            .after_commit_handlers_mut()
            .push(Arc::new(handler));
        self
    }

    /// Append a result-transform applied after parsing, in order.
    pub fn transform(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.state.transforms_mut().push(Arc::new(f));
        self
    }

    // ==================== Compose & execute ====================

    fn check_build_error(&self) -> ChainResult<()> {
        match &self.state.build_error {
            Some(message) => Err(ChainError::internal(message.clone())),
            None => Ok(()),
        }
    }

    /// Compile to a single statement. Fails for oversized insert batches;
    /// use [`Query::to_statements`] there.
    pub fn to_sql(&self) -> ChainResult<Statement> {
        let mut statements = self.to_statements()?;
        if statements.len() != 1 {
            return Err(ChainError::internal(format!(
                "query compiles to {} statements; use to_statements",
                statements.len()
            )));
        }
        Ok(statements.remove(0))
    }

    /// Compile to the full statement list (oversized insert batches compile
    /// to several statements run inside one transaction).
    pub fn to_statements(&self) -> ChainResult<Vec<Statement>> {
        self.check_build_error()?;
        if self.state.none {
            return Ok(Vec::new());
        }
        Ok(compose(&self.state)?
            .statements
            .into_iter()
            .map(|s| s.statement)
            .collect())
    }

    /// Execute through the pipeline: before-hooks, statements (transactional
    /// when needed), after-hooks, after-commit hooks, transforms.
    pub async fn run(&self, ctx: &ExecContext) -> ChainResult<Value> {
        self.check_build_error()?;
        pipeline::execute(&self.state, ctx).await
    }
}

impl From<Query> for ColumnValue {
    fn from(query: Query) -> Self {
        ColumnValue::SubQuery(Box::new(query.state))
    }
}

/// ON CONFLICT clause builder.
pub struct OnConflictQuery {
    query: Query,
    target: Option<Vec<String>>,
}

impl OnConflictQuery {
    /// `DO NOTHING`; a conflict resolves to the no-value marker.
    pub fn do_nothing(self) -> Query {
        self.query.set_conflict(self.target, ConflictAction::DoNothing)
    }

    /// `DO UPDATE SET col = EXCLUDED.col` for every non-target column.
    pub fn merge(self) -> Query {
        self.query
            .set_conflict(self.target, ConflictAction::Merge { columns: None })
    }

    /// `DO UPDATE SET col = EXCLUDED.col` for the given columns.
    pub fn merge_columns(self, columns: &[&str]) -> Query {
        self.query.set_conflict(
            self.target,
            ConflictAction::Merge {
                columns: Some(columns.iter().map(|s| s.to_string()).collect()),
            },
        )
    }

    /// `DO UPDATE SET` with explicit values.
    pub fn set(self, sets: Vec<(&str, ColumnValue)>) -> Query {
        self.query.set_conflict(
            self.target,
            ConflictAction::Set(
                sets.into_iter()
                    .map(|(c, v)| (c.to_string(), v))
                    .collect(),
            ),
        )
    }
}

/// Parser map of a query's current projection: selection overrides first,
/// then the shape's own decoders.
fn projection_parsers(state: &QueryState) -> BTreeMap<String, DecodeFn> {
    let mut parsers = BTreeMap::new();
    if state.select.is_empty() {
        for col in state.schema.shape.star_columns() {
            if let Some(p) = state.parser_for(&col.name) {
                parsers.insert(col.name.clone(), p);
            }
        }
        return parsers;
    }
    for item in state.select.iter() {
        match item {
            SelectItem::Star => {
                for col in state.schema.shape.star_columns() {
                    if let Some(p) = state.parser_for(&col.name) {
                        parsers.insert(col.name.clone(), p);
                    }
                }
            }
            SelectItem::Column(cref) => {
                if let Some(p) = state.parser_for(cref.field_name()) {
                    parsers.insert(cref.field_name().to_string(), p);
                }
            }
            _ => {}
        }
    }
    parsers
}

/// Decoder for the single value of a value/pluck projection.
fn value_parser_of(state: &QueryState) -> Option<DecodeFn> {
    if !matches!(
        state.return_type,
        ReturnType::Value | ReturnType::ValueOrThrow | ReturnType::Pluck
    ) {
        return None;
    }
    if let Some(col) = &state.value_column {
        return col.decode.clone();
    }
    crate::compose::select::output_field(state).and_then(|f| state.parser_for(&f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> TableSchema {
        TableSchema::new("user")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("name"))
            .column(ColumnDef::new("password"))
    }

    fn profile() -> TableSchema {
        TableSchema::new("profile")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("userId"))
            .column(ColumnDef::new("bio"))
    }

    fn posts() -> TableSchema {
        TableSchema::new("posts")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("userId"))
            .column(ColumnDef::new("title"))
    }

    #[test]
    fn select_star_expands_shape() {
        let stmt = Query::table(user()).to_sql().unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"user\".\"id\", \"user\".\"name\", \"user\".\"password\" FROM \"user\""
        );
    }

    #[test]
    fn explicit_select_only_column_is_excluded_from_star() {
        let schema = TableSchema::new("user")
            .column(ColumnDef::new("id"))
            .column(ColumnDef::new("password").explicit_select());
        let stmt = Query::table(schema.clone()).to_sql().unwrap();
        assert_eq!(stmt.text, "SELECT \"user\".\"id\" FROM \"user\"");

        let by_name = Query::table(schema).select(&["password"]).to_sql().unwrap();
        assert_eq!(by_name.text, "SELECT \"user\".\"password\" FROM \"user\"");
    }

    #[test]
    fn find_filters_on_primary_key() {
        let stmt = Query::table(user()).find(1).to_sql().unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"user\".\"id\", \"user\".\"name\", \"user\".\"password\" FROM \"user\" WHERE \"user\".\"id\" = $1 LIMIT 1"
        );
        assert_eq!(stmt.params, vec![json!(1)]);
    }

    #[test]
    fn find_without_primary_key_is_rejected() {
        let schema = TableSchema::new("log").column(ColumnDef::new("line"));
        let err = Query::table(schema).find(1).to_sql().unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));
    }

    #[test]
    fn joined_table_star_projects_nested_json() {
        let stmt = Query::table(user())
            .join(profile(), "profile.userId", "user.id")
            .select(&["user.id", "profile.*"])
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"user\".\"id\", json_build_object('id', \"profile\".\"id\", 'userId', \"profile\".\"userId\", 'bio', \"profile\".\"bio\") AS \"profile\" FROM \"user\" JOIN \"profile\" ON \"profile\".\"userId\" = \"user\".\"id\""
        );
    }

    #[test]
    fn static_join_deduplicates() {
        let once = Query::table(user())
            .join(profile(), "profile.userId", "user.id")
            .select(&["user.id"]);
        let twice = once.clone().join(profile(), "profile.userId", "user.id");
        assert_eq!(once.to_sql().unwrap(), twice.to_sql().unwrap());
    }

    #[test]
    fn joins_with_bound_values_are_not_deduplicated() {
        let on = |bio: &str| {
            vec![
                Filter::col_eq("profile.userId", "user.id"),
                Filter::eq("profile.bio", bio),
            ]
        };
        let stmt = Query::table(user())
            .join_with(JoinKind::Inner, profile(), None, on("a"))
            .join_with(JoinKind::Inner, profile(), None, on("b"))
            .select(&["user.id"])
            .to_sql()
            .unwrap();
        assert_eq!(stmt.text.matches(" JOIN ").count(), 2);
        assert_eq!(stmt.params, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn second_join_of_same_table_gets_a_fresh_alias() {
        let stmt = Query::table(user())
            .join_with(
                JoinKind::Inner,
                profile(),
                None,
                vec![
                    Filter::col_eq("profile.userId", "user.id"),
                    Filter::eq("profile.bio", "a"),
                ],
            )
            .join_with(
                JoinKind::Inner,
                profile(),
                None,
                vec![Filter::eq("profile2.bio", "b")],
            )
            .select(&["user.id"])
            .to_sql()
            .unwrap();
        assert!(stmt.text.contains("JOIN \"profile\" \"profile2\""));
    }

    #[test]
    fn correlated_multi_row_subquery_projects_json_array() {
        let sub = Query::table(posts()).filter(Filter::col_eq("posts.userId", "user.id"));
        let stmt = Query::table(user())
            .select(&["user.id"])
            .select_subquery("posts", sub)
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"user\".\"id\", (SELECT COALESCE(json_agg(row_to_json(\"t\".*)), '[]') FROM (SELECT \"posts\".\"id\", \"posts\".\"userId\", \"posts\".\"title\" FROM \"posts\" WHERE \"posts\".\"userId\" = \"user\".\"id\") \"t\") AS \"posts\" FROM \"user\""
        );
    }

    #[test]
    fn coalesce_value_overrides_empty_fallback() {
        let sub = Query::table(posts()).filter(Filter::col_eq("posts.userId", "user.id"));
        let stmt = Query::table(user())
            .coalesce(json!({"empty": true}))
            .select(&["user.id"])
            .select_subquery("posts", sub)
            .to_sql()
            .unwrap();
        assert!(stmt.text.contains("COALESCE(json_agg(row_to_json(\"t\".*)), $1)"));
        assert_eq!(stmt.params, vec![json!({"empty": true})]);
    }

    #[test]
    fn identical_lateral_value_subqueries_share_one_join() {
        let sub = Query::table(posts())
            .filter(Filter::col_eq("posts.userId", "user.id"))
            .count();
        let stmt = Query::table(user())
            .select(&["user.id"])
            .select_subquery("a", sub.clone())
            .select_subquery("b", sub)
            .to_sql()
            .unwrap();
        assert_eq!(stmt.text.matches("LEFT JOIN LATERAL").count(), 1);
        assert!(stmt.text.contains("\"v1\".\"count\" AS \"a\""));
        assert!(stmt.text.contains("\"v1\".\"count\" AS \"b\""));
    }

    #[test]
    fn with_cte_and_cte_join() {
        let stmt = Query::table(user())
            .with("active", Query::table(user()).where_eq("name", "a"))
            .join_cte(
                JoinKind::Inner,
                "active",
                vec![Filter::col_eq("active.id", "user.id")],
            )
            .select(&["user.id"])
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "WITH \"active\" AS (SELECT \"user\".\"id\", \"user\".\"name\", \"user\".\"password\" FROM \"user\" WHERE \"user\".\"name\" = $1) SELECT \"user\".\"id\" FROM \"user\" JOIN \"active\" ON \"active\".\"id\" = \"user\".\"id\""
        );
    }

    #[test]
    fn invalid_cte_name_is_rejected() {
        let err = Query::table(user())
            .with("bad name!", Query::table(user()))
            .to_sql()
            .unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));
    }

    #[test]
    fn clone_independence() {
        let base = Query::table(user()).select(&["user.id"]);
        let before = base.to_sql().unwrap();
        let _derived = base.clone().where_eq("name", "x").order_desc("id").limit(5);
        assert_eq!(base.to_sql().unwrap(), before);
    }

    #[test]
    fn none_sentinel_compiles_to_nothing() {
        let q = Query::none(user());
        assert!(q.to_statements().unwrap().is_empty());
    }

    #[test]
    fn required_join_of_none_collapses_host() {
        let q = Query::table(user()).join_subquery(
            JoinKind::Inner,
            Query::none(profile()),
            None,
            vec![Filter::col_eq("profile.userId", "user.id")],
        );
        assert!(q.is_none());

        let left = Query::table(user()).join_subquery(
            JoinKind::Left,
            Query::none(profile()),
            None,
            vec![Filter::col_eq("profile.userId", "user.id")],
        );
        assert!(!left.is_none());
    }

    #[test]
    fn count_renders_aggregate() {
        let stmt = Query::table(user()).where_eq("name", "a").count().to_sql().unwrap();
        assert_eq!(
            stmt.text,
            "SELECT count(*) AS \"count\" FROM \"user\" WHERE \"user\".\"name\" = $1"
        );
    }

    #[test]
    fn find_then_update_produces_plain_update() {
        let stmt = Query::table(user())
            .find(1)
            .update(vec![("name", json!("x"))])
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "UPDATE \"user\" SET \"name\" = $1 WHERE \"user\".\"id\" = $2"
        );
        assert_eq!(stmt.params, vec![json!("x"), json!(1)]);
    }

    #[test]
    fn create_fills_defaults_and_returns_the_row() {
        let schema = TableSchema::new("user")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("name"))
            .column(ColumnDef::new("role").default_with(|| json!("member")));
        let stmt = Query::table(schema)
            .create(vec![("name", json!("a"))])
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "INSERT INTO \"user\"(\"name\", \"role\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("a"), json!("member")]);
    }

    #[test]
    fn virtual_column_delegates_to_its_handler() {
        let schema = TableSchema::new("user")
            .column(ColumnDef::new("first"))
            .column(ColumnDef::new("last"))
            .column(ColumnDef::new("fullName").virtual_with(|v| {
                let s = v.as_str().unwrap_or_default();
                let (first, last) = s.split_once(' ').unwrap_or((s, ""));
                Ok(vec![
                    ("first".to_string(), json!(first)),
                    ("last".to_string(), json!(last)),
                ])
            }));
        let stmt = Query::table(schema)
            .create(vec![("fullName", json!("Ada Lovelace"))])
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "INSERT INTO \"user\"(\"first\", \"last\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(stmt.params, vec![json!("Ada"), json!("Lovelace")]);
    }

    #[test]
    fn read_only_column_rejects_user_values() {
        let schema = TableSchema::new("user")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("password").read_only());
        let create_err = Query::table(schema.clone())
            .create(vec![("password", json!("x"))])
            .to_sql()
            .unwrap_err();
        assert!(matches!(create_err, ChainError::Internal(_)));

        let update_err = Query::table(schema)
            .find(1)
            .update(vec![("password", json!("x"))])
            .to_sql()
            .unwrap_err();
        assert!(matches!(update_err, ChainError::Internal(_)));
    }

    #[test]
    fn on_conflict_do_nothing_softens_return_type() {
        let q = Query::table(user())
            .create(vec![("name", json!("a"))])
            .on_conflict_do_nothing();
        assert_eq!(q.state().return_type, ReturnType::One);
        let stmt = q.to_sql().unwrap();
        assert!(stmt.text.contains(" ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn on_conflict_merge_targets_columns() {
        let stmt = Query::table(user())
            .create(vec![("name", json!("a")), ("password", json!("p"))])
            .on_conflict(&["name"])
            .merge()
            .to_sql()
            .unwrap();
        assert!(stmt.text.contains(
            "ON CONFLICT (\"name\") DO UPDATE SET \"password\" = EXCLUDED.\"password\""
        ));
    }

    #[test]
    fn nested_delete_hoists_into_cte() {
        let del = Query::table(posts()).where_eq("id", 5).delete();
        let stmt = Query::table(user())
            .find(1)
            .set_from("name", del)
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "WITH \"posts\" AS (DELETE FROM \"posts\" WHERE \"posts\".\"id\" = $1 RETURNING *) UPDATE \"user\" SET \"name\" = (SELECT \"id\" FROM \"posts\" LIMIT 1) WHERE \"user\".\"id\" = $2"
        );
        assert_eq!(stmt.params, vec![json!(5), json!(1)]);
    }

    #[test]
    fn delete_without_where_is_rejected_but_all_rows_passes() {
        let err = Query::table(user()).delete().to_sql().unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));

        let stmt = Query::table(user()).delete().all_rows().to_sql().unwrap();
        assert_eq!(stmt.text, "DELETE FROM \"user\"");
    }

    #[test]
    fn pluck_selects_single_column() {
        let stmt = Query::table(user()).pluck("name").to_sql().unwrap();
        assert_eq!(stmt.text, "SELECT \"user\".\"name\" FROM \"user\"");
        assert_eq!(Query::table(user()).pluck("name").state().return_type, ReturnType::Pluck);
    }

    #[test]
    fn order_group_limit_offset() {
        let stmt = Query::table(user())
            .select(&["user.name"])
            .group_by("name")
            .order_desc("name")
            .limit(10)
            .offset(20)
            .to_sql()
            .unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"user\".\"name\" FROM \"user\" GROUP BY \"user\".\"name\" ORDER BY \"user\".\"name\" DESC LIMIT 10 OFFSET 20"
        );
    }
}
