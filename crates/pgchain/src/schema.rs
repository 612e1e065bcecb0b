//! Column and table metadata.
//!
//! This is the boundary to the schema layer: per column, an opaque decode
//! function (driver value -> app value), an opaque encode function (app
//! value -> driver value), and behavior flags. The engine never interprets
//! the codec functions, it only applies them at the right points (encode on
//! mutation payloads, decode in the result parser).

use crate::error::ChainResult;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Driver value -> application value.
pub type DecodeFn = Arc<dyn Fn(Value) -> ChainResult<Value> + Send + Sync>;
/// Application value -> driver value.
pub type EncodeFn = Arc<dyn Fn(Value) -> ChainResult<Value> + Send + Sync>;
/// Produces a value at statement-build time (defaults, auto-updated columns).
pub type ValueFn = Arc<dyn Fn() -> Value + Send + Sync>;
/// Create handler for a virtual column: maps the supplied app value to
/// concrete `(column, value)` pairs.
pub type VirtualFn = Arc<dyn Fn(&Value) -> ChainResult<Vec<(String, Value)>> + Send + Sync>;

/// Metadata for one column.
#[derive(Clone, Default)]
pub struct ColumnDef {
    pub name: String,
    pub decode: Option<DecodeFn>,
    pub encode: Option<EncodeFn>,
    /// Part of the table's primary key.
    pub primary_key: bool,
    /// Rejects user-supplied values on insert/update; hook-supplied values
    /// are still accepted.
    pub read_only: bool,
    /// Readable but never writable, not even from hooks.
    pub app_read_only: bool,
    /// Excluded from `*` expansion; must be selected by name.
    pub explicit_select: bool,
    /// Declared NOT NULL; `value_or_throw` treats SQL NULL as not-found.
    pub not_null: bool,
    /// Default applied to insert rows that omit the column.
    pub default: Option<ValueFn>,
    /// Value refreshed on every update (auto-updated timestamp columns).
    pub auto_update: Option<ValueFn>,
    /// Virtual column: not stored; inserts delegate to this handler.
    pub virtual_create: Option<VirtualFn>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn app_read_only(mut self) -> Self {
        self.app_read_only = true;
        self
    }

    pub fn explicit_select(mut self) -> Self {
        self.explicit_select = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn decode_with(
        mut self,
        f: impl Fn(Value) -> ChainResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.decode = Some(Arc::new(f));
        self
    }

    pub fn encode_with(
        mut self,
        f: impl Fn(Value) -> ChainResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.encode = Some(Arc::new(f));
        self
    }

    pub fn default_with(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(Arc::new(f));
        self
    }

    pub fn auto_update_with(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.auto_update = Some(Arc::new(f));
        self
    }

    pub fn virtual_with(
        mut self,
        f: impl Fn(&Value) -> ChainResult<Vec<(String, Value)>> + Send + Sync + 'static,
    ) -> Self {
        self.virtual_create = Some(Arc::new(f));
        self
    }

    /// Whether the column is stored in the table (virtual columns are not).
    pub fn is_stored(&self) -> bool {
        self.virtual_create.is_none()
    }
}

impl fmt::Debug for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDef")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("read_only", &self.read_only)
            .field("explicit_select", &self.explicit_select)
            .field("not_null", &self.not_null)
            .finish()
    }
}

/// Declaration-ordered column set of a table or join projection.
#[derive(Clone, Debug, Default)]
pub struct Shape {
    columns: Vec<ColumnDef>,
}

impl Shape {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The primary-key column, when the shape declares exactly one.
    pub fn primary_key(&self) -> Option<&ColumnDef> {
        let mut pks = self.columns.iter().filter(|c| c.primary_key);
        let first = pks.next()?;
        if pks.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Stored columns included in `*` expansion.
    pub fn star_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| !c.explicit_select && c.is_stored())
    }

    /// Columns carrying an auto-update value factory.
    pub fn auto_update_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.auto_update.is_some())
    }
}

/// A table handle: name plus shape.
#[derive(Clone, Debug)]
pub struct TableSchema {
    pub table: String,
    pub shape: Arc<Shape>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            shape: Arc::new(Shape::default()),
        }
    }

    pub fn with_columns(table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            table: table.into(),
            shape: Arc::new(Shape::new(columns)),
        }
    }

    pub fn column(mut self, def: ColumnDef) -> Self {
        Arc::make_mut(&mut self.shape).columns.push(def);
        self
    }
}
