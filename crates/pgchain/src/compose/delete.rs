//! DELETE statement composition.
//!
//! Joined deletes render as `USING ... WHERE ...`: the join targets move
//! into the USING list and their ON conditions fold into the WHERE clause.

use crate::compose::{
    write_returning, write_where, write_with_clause, Composed, ComposedStatement, HoistPlan,
    SqlWriter,
};
use crate::error::{ChainError, ChainResult};
use crate::expr::Filter;
use crate::joins::write_using;
use crate::state::{Payload, QueryState};

pub(crate) fn compose_delete(state: &QueryState) -> ChainResult<Composed> {
    let plan = HoistPlan::empty();
    let mut w = SqlWriter::new();
    write_with_clause(state, &plan, &mut w)?;
    write_delete_body(state, &mut w, false)?;
    Ok(Composed {
        statements: vec![ComposedStatement {
            statement: w.finish(),
            channels: Vec::new(),
        }],
        degraded_to_select: false,
    })
}

pub(crate) fn write_delete_body(
    state: &QueryState,
    w: &mut SqlWriter,
    returning_all: bool,
) -> ChainResult<()> {
    let all_rows = matches!(state.payload.as_deref(), Some(Payload::Delete { all_rows: true }));
    if state.filters.is_empty() && !all_rows {
        return Err(ChainError::internal(
            "delete requires a where clause; use all_rows() to delete every row",
        ));
    }
    if state.joins.iter().any(|j| j.lateral) {
        return Err(ChainError::internal("lateral joins are forbidden on delete"));
    }

    w.push("DELETE FROM ");
    w.push_quoted(&state.schema.table);

    let mut join_conditions: Vec<Filter> = Vec::new();
    if !state.joins.is_empty() {
        w.push(" USING ");
        for (i, join) in state.joins.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            write_using(join, w)?;
            join_conditions.extend(join.on.iter().cloned());
        }
    }

    write_where(state, w, &join_conditions, &state.schema.table)?;

    if returning_all {
        w.push(" RETURNING *");
    } else {
        write_returning(state, w, &HoistPlan::empty())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joins::{Join, JoinKind, JoinTarget};
    use crate::schema::{ColumnDef, TableSchema};
    use crate::state::{QueryKind, ReturnType};
    use std::sync::Arc;

    fn orders() -> TableSchema {
        TableSchema::new("orders")
            .column(ColumnDef::new("id").primary_key())
            .column(ColumnDef::new("userId"))
    }

    fn delete_state() -> QueryState {
        let mut state = QueryState::new(orders());
        state.kind = QueryKind::Delete;
        state.return_type = ReturnType::Void;
        state.payload = Some(Arc::new(Payload::Delete { all_rows: false }));
        state
    }

    fn single(state: &QueryState) -> crate::compose::Statement {
        compose_delete(state)
            .unwrap()
            .statements
            .into_iter()
            .next()
            .unwrap()
            .statement
    }

    #[test]
    fn simple_delete() {
        let mut state = delete_state();
        state.filters_mut().push(Filter::eq("id", 7));
        let stmt = single(&state);
        assert_eq!(
            stmt.text,
            "DELETE FROM \"orders\" WHERE \"orders\".\"id\" = $1"
        );
    }

    #[test]
    fn delete_without_where_is_rejected() {
        let state = delete_state();
        assert!(compose_delete(&state).is_err());
    }

    #[test]
    fn all_rows_opts_out_of_the_guard() {
        let mut state = delete_state();
        state.payload = Some(Arc::new(Payload::Delete { all_rows: true }));
        let stmt = single(&state);
        assert_eq!(stmt.text, "DELETE FROM \"orders\"");
    }

    #[test]
    fn joined_delete_renders_using() {
        let mut state = delete_state();
        state.filters_mut().push(Filter::eq("users.active", false));
        state.joins_mut().push(Join {
            kind: JoinKind::Inner,
            target: JoinTarget::Table(TableSchema::new("users").column(ColumnDef::new("id"))),
            alias: "users".to_string(),
            on: vec![Filter::col_eq("users.id", "orders.userId")],
            lateral: false,
            required: true,
        });
        let stmt = single(&state);
        assert_eq!(
            stmt.text,
            "DELETE FROM \"orders\" USING \"users\" WHERE \"users\".\"active\" = $1 AND \"users\".\"id\" = \"orders\".\"userId\""
        );
    }

    #[test]
    fn lateral_join_is_forbidden() {
        let mut state = delete_state();
        state.filters_mut().push(Filter::eq("id", 1));
        state.joins_mut().push(Join {
            kind: JoinKind::Inner,
            target: JoinTarget::Table(TableSchema::new("users")),
            alias: "users".to_string(),
            on: vec![],
            lateral: true,
            required: true,
        });
        let err = compose_delete(&state).unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));
    }

    #[test]
    fn delete_returning_rows() {
        let mut state = delete_state();
        state.return_type = ReturnType::All;
        state.filters_mut().push(Filter::eq("id", 7));
        let stmt = single(&state);
        assert!(stmt.text.ends_with(" RETURNING *"));
    }
}
