//! SQL statement translation
//!
//! Every client-controlled value travels as a positional binding. Only the
//! backing identifier and filter column names are interpolated, and both are
//! validated against a strict identifier grammar first.

use crate::ConnectorError;
use dataproduct_gateway_core::validation::{validate_column_name, validate_warehouse_identifier};
use dataproduct_gateway_core::QuerySpec;
use serde_json::{json, Map, Value};

/// A positional bind value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Text(String),
    Fixed(u64),
}

impl Binding {
    fn to_json(&self) -> Value {
        match self {
            Binding::Text(v) => json!({ "type": "TEXT", "value": v }),
            Binding::Fixed(v) => json!({ "type": "FIXED", "value": v.to_string() }),
        }
    }
}

/// Parameterized read statement ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub bindings: Vec<Binding>,
}

impl Statement {
    /// SQL API bindings object: `{"1": {"type": .., "value": ..}, ..}`.
    pub fn bindings_json(&self) -> Option<Value> {
        if self.bindings.is_empty() {
            return None;
        }
        let map: Map<String, Value> = self
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| ((i + 1).to_string(), b.to_json()))
            .collect();
        Some(Value::Object(map))
    }
}

/// Translate a query into `SELECT * FROM <ident> [WHERE ..] [LIMIT ? OFFSET ?]`.
pub fn build_statement(spec: &QuerySpec) -> Result<Statement, ConnectorError> {
    validate_warehouse_identifier(&spec.dataset)
        .map_err(|e| ConnectorError::InvalidQuery(e.client_message()))?;

    let mut sql = format!("SELECT * FROM {}", spec.dataset);
    let mut bindings = Vec::with_capacity(spec.filters.len() + 2);

    let mut clauses = Vec::with_capacity(spec.filters.len());
    for (column, value) in spec.filters.iter() {
        validate_column_name(column)
            .map_err(|e| ConnectorError::InvalidQuery(e.client_message()))?;
        clauses.push(format!("{} = ?", column));
        bindings.push(Binding::Text(value.to_string()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if let Some(page) = spec.pagination {
        sql.push_str(" LIMIT ? OFFSET ?");
        bindings.push(Binding::Fixed(u64::from(page.limit)));
        bindings.push(Binding::Fixed(page.offset));
    }

    Ok(Statement { sql, bindings })
}
