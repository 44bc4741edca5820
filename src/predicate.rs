//! Where-expression trees and their compilation into parameterized SQL
//!
//! The loose shorthand accepted from callers is parsed once into a
//! [`Predicate`] tree; [`compile`] then renders that tree into a `WHERE`
//! clause with `@whr<N>` placeholders and the matching bindings.
//!
//! Accepted shorthand (as JSON):
//!
//! - `null` or `{}`: no filter
//! - `["age", ">", 3]`: column, operator, value
//! - `{"name": "John"}`: equality on one column
//! - `{"age": {"operator": "IN", "value": [1, 2]}}`: explicit operator
//! - `{"AND": [...]}` / `{"OR": [...]}`: groups of the above

use crate::error::{SqliteError, SqliteResult};
use crate::schema::check_identifier;
use crate::value::{Params, Value};
use serde_json::Map;
use std::fmt;
use tracing::warn;

/// Prefix of every placeholder produced by the compiler
pub const WHERE_PARAM_PREFIX: &str = "@whr";

/// Comparison operators; anything unknown is passed to the engine verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    In,
    NotIn,
    Other(String),
}

impl Operator {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_ascii_uppercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::NotEq,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            "LIKE" => Operator::Like,
            "IN" => Operator::In,
            "NOT IN" => Operator::NotIn,
            _ => Operator::Other(raw.trim().to_string()),
        }
    }

    pub fn as_sql(&self) -> &str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Other(op) => op,
        }
    }

    /// `IN` and `NOT IN` take a list; everything else takes a single value.
    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Scalar(Value),
    List(Vec<Value>),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Scalar(v)
    }
}

impl From<Vec<Value>> for Operand {
    fn from(v: Vec<Value>) -> Self {
        Operand::List(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Connector::And => "AND",
            Connector::Or => "OR",
        }
    }
}

/// A filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison {
        column: String,
        operator: Operator,
        operand: Operand,
    },
    Logical {
        connector: Connector,
        children: Vec<Predicate>,
    },
}

impl Predicate {
    pub fn compare(column: &str, operator: Operator, operand: impl Into<Operand>) -> Self {
        Predicate::Comparison {
            column: column.to_string(),
            operator,
            operand: operand.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        let value: Value = value.into();
        Self::compare(column, Operator::Eq, value)
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::compare(
            column,
            Operator::In,
            Operand::List(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn and(children: Vec<Predicate>) -> Self {
        Predicate::Logical {
            connector: Connector::And,
            children,
        }
    }

    pub fn or(children: Vec<Predicate>) -> Self {
        Predicate::Logical {
            connector: Connector::Or,
            children,
        }
    }

    /// Parse the JSON shorthand. `null` and `{}` mean "no filter".
    pub fn from_json(json: &serde_json::Value) -> SqliteResult<Option<Predicate>> {
        match json {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Array(items) => parse_triple(items).map(Some),
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            serde_json::Value::Object(map) => parse_object(map).map(Some),
            other => Err(SqliteError::InvalidPredicate(format!(
                "where must be an object or a [column, operator, value] list, found {}",
                other
            ))),
        }
    }
}

fn parse_triple(items: &[serde_json::Value]) -> SqliteResult<Predicate> {
    if items.len() != 3 {
        warn!(
            len = items.len(),
            "where list should be [column, operator, value]; using the first three entries"
        );
    }
    let [column, operator, value, ..] = items else {
        return Err(SqliteError::InvalidPredicate(format!(
            "where list needs column, operator and value, found {} entries",
            items.len()
        )));
    };
    let column = column.as_str().ok_or_else(|| {
        SqliteError::InvalidPredicate(format!("column must be a string, found {}", column))
    })?;
    let operator = operator.as_str().ok_or_else(|| {
        SqliteError::InvalidPredicate(format!("operator must be a string, found {}", operator))
    })?;
    Ok(Predicate::compare(
        column,
        Operator::parse(operator),
        parse_operand(value)?,
    ))
}

fn parse_object(map: &Map<String, serde_json::Value>) -> SqliteResult<Predicate> {
    let and = map.get("AND");
    let or = map.get("OR");
    if and.is_some() && or.is_some() {
        warn!("where has both AND and OR at the same level; using AND");
    }
    if and.is_some() || or.is_some() {
        let ignored: Vec<_> = map
            .keys()
            .filter(|key| key.as_str() != "AND" && key.as_str() != "OR")
            .collect();
        if !ignored.is_empty() {
            warn!(?ignored, "keys next to AND/OR are ignored");
        }
    }
    if let Some(children) = and {
        return parse_group(Connector::And, children);
    }
    if let Some(children) = or {
        return parse_group(Connector::Or, children);
    }

    if map.len() > 1 {
        warn!(
            keys = map.len(),
            "shorthand where covers exactly one column; only the first key is used"
        );
    }
    // Non-empty, checked by the caller.
    let Some((column, value)) = map.iter().next() else {
        return Err(SqliteError::InvalidPredicate("empty where object".into()));
    };

    match value {
        serde_json::Value::Object(explicit) => {
            if !explicit.contains_key("operator") && !explicit.contains_key("value") {
                return Err(SqliteError::InvalidPredicate(format!(
                    "condition on {} needs an operator or a value, found {}",
                    column, value
                )));
            }
            let unknown: Vec<_> = explicit
                .keys()
                .filter(|key| key.as_str() != "operator" && key.as_str() != "value")
                .collect();
            if !unknown.is_empty() {
                warn!(column = %column, ?unknown, "unknown keys in condition are ignored");
            }
            let operator = match explicit.get("operator") {
                None => Operator::Eq,
                Some(serde_json::Value::String(op)) => Operator::parse(op),
                Some(other) => {
                    return Err(SqliteError::InvalidPredicate(format!(
                        "operator for {} must be a string, found {}",
                        column, other
                    )))
                }
            };
            let operand = match explicit.get("value") {
                Some(value) => parse_operand(value)?,
                None => Operand::Scalar(Value::Null),
            };
            Ok(Predicate::compare(column, operator, operand))
        }
        value => Ok(Predicate::compare(
            column,
            Operator::Eq,
            parse_operand(value)?,
        )),
    }
}

fn parse_group(connector: Connector, children: &serde_json::Value) -> SqliteResult<Predicate> {
    let serde_json::Value::Array(items) = children else {
        return Err(SqliteError::InvalidPredicate(format!(
            "{} expects a list of conditions, found {}",
            connector.as_sql(),
            children
        )));
    };
    let children = items
        .iter()
        .filter_map(|item| Predicate::from_json(item).transpose())
        .collect::<SqliteResult<Vec<_>>>()?;
    Ok(Predicate::Logical {
        connector,
        children,
    })
}

fn parse_operand(value: &serde_json::Value) -> SqliteResult<Operand> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(Value::try_from)
            .collect::<SqliteResult<Vec<_>>>()
            .map(Operand::List),
        scalar => Value::try_from(scalar).map(Operand::Scalar),
    }
}

/// Compiled `WHERE` clause and its bindings
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompiledWhere {
    /// Empty, or `WHERE ...`
    pub query: String,
    pub parameters: Params,
}

impl CompiledWhere {
    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }
}

/// Compile a predicate tree. `None` compiles to an empty clause.
pub fn compile(predicate: Option<&Predicate>) -> SqliteResult<CompiledWhere> {
    let Some(predicate) = predicate else {
        return Ok(CompiledWhere::default());
    };

    let mut compiler = Compiler::default();
    let clause = compiler.predicate(predicate)?;
    if clause.is_empty() {
        return Ok(CompiledWhere::default());
    }
    Ok(CompiledWhere {
        query: format!("WHERE {}", clause),
        parameters: compiler.parameters,
    })
}

/// Parse the JSON shorthand and compile it
pub fn compile_json(json: &serde_json::Value) -> SqliteResult<CompiledWhere> {
    compile(Predicate::from_json(json)?.as_ref())
}

#[derive(Default)]
struct Compiler {
    counter: usize,
    parameters: Params,
}

impl Compiler {
    fn predicate(&mut self, predicate: &Predicate) -> SqliteResult<String> {
        match predicate {
            Predicate::Comparison {
                column,
                operator,
                operand,
            } => self.comparison(column, operator, operand),
            Predicate::Logical {
                connector,
                children,
            } => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    let part = self.predicate(child)?;
                    if !part.is_empty() {
                        parts.push(part);
                    }
                }
                if parts.is_empty() {
                    return Ok(String::new());
                }
                let joiner = format!(" {} ", connector.as_sql());
                Ok(format!("({})", parts.join(&joiner)))
            }
        }
    }

    fn comparison(
        &mut self,
        column: &str,
        operator: &Operator,
        operand: &Operand,
    ) -> SqliteResult<String> {
        // Column names are spliced into the clause text.
        check_identifier(column)?;
        match (operator.takes_list(), operand) {
            (true, Operand::List(values)) => {
                let placeholders = values
                    .iter()
                    .map(|value| self.bind(value.clone()))
                    .collect::<Vec<_>>();
                Ok(format!(
                    "{} {} ({})",
                    column,
                    operator,
                    placeholders.join(", ")
                ))
            }
            (true, Operand::Scalar(_)) => Err(SqliteError::InvalidPredicate(format!(
                "{} on {} requires a list value",
                operator, column
            ))),
            (false, Operand::List(_)) => Err(SqliteError::InvalidPredicate(format!(
                "{} on {} does not accept a list value",
                operator, column
            ))),
            (false, Operand::Scalar(value)) => {
                let placeholder = self.bind(value.clone());
                Ok(format!("{} {} {}", column, operator, placeholder))
            }
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.counter += 1;
        let name = format!("{}{}", WHERE_PARAM_PREFIX, self.counter);
        self.parameters.insert(&name, value);
        name
    }
}
