//! Expression DAGs consumed by the filter and project clauses.
//!
//! An [`ExpressionContext`] is an index-addressed node table: nodes refer
//! to their children by name, shared children are evaluated once, and no
//! ownership edges exist that could accidentally form cycles. The host
//! builds these; [`builder`] provides the ergonomic construction used by
//! the tests and embedding APIs.

pub mod builder;
mod evaluator;

use std::collections::{HashMap, HashSet};

use common_error::{StrataError, StrataResult};
use strata_core::{DataType, OutputSchema, Value};

pub use evaluator::{EvalResult, ExprEvaluator};

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    /// Whether this operator statically yields a bitset rather than a
    /// typed column.
    pub const fn produces_bitset(&self) -> bool {
        !matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }

    pub const fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "&",
            Self::Or => "|",
        };
        f.write_str(symbol)
    }
}

/// One node of the expression DAG. Children are referenced by node name.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Column(String),
    Value(Value),
    Unary {
        op: UnaryOp,
        child: String,
    },
    Binary {
        op: BinaryOp,
        left: String,
        right: String,
    },
    Ternary {
        condition: String,
        when_true: String,
        when_false: String,
    },
    IsIn {
        child: String,
        set: Vec<Value>,
        negated: bool,
    },
    IsNull {
        child: String,
        negated: bool,
    },
}

/// What the root of an expression must evaluate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// A bitset, one bit per row (filter).
    Bitset,
    /// A typed column, or a literal broadcast on demand (project).
    Column,
}

/// A named node table with a distinguished root.
#[derive(Debug, Clone)]
pub struct ExpressionContext {
    nodes: HashMap<String, ExpressionNode>,
    pub root_node_name: String,
}

impl ExpressionContext {
    pub fn new(root_node_name: impl Into<String>) -> Self {
        Self {
            nodes: HashMap::new(),
            root_node_name: root_node_name.into(),
        }
    }

    pub fn add_node(&mut self, name: impl Into<String>, node: ExpressionNode) {
        self.nodes.insert(name.into(), node);
    }

    pub fn node(&self, name: &str) -> StrataResult<&ExpressionNode> {
        self.nodes.get(name).ok_or_else(|| {
            StrataError::invalid_user_argument(format!("expression node '{name}' is not defined"))
        })
    }

    /// The set of column names reachable from the root.
    pub fn input_columns(&self) -> StrataResult<HashSet<String>> {
        let mut columns = HashSet::new();
        self.walk(&self.root_node_name, &mut HashSet::new(), &mut |node| {
            if let ExpressionNode::Column(name) = node {
                columns.insert(name.clone());
            }
        })?;
        Ok(columns)
    }

    /// What the root statically produces, validating the DAG on the way:
    /// every referenced node must exist and no name cycle is allowed.
    pub fn root_kind(&self) -> StrataResult<RootKind> {
        self.walk(&self.root_node_name, &mut HashSet::new(), &mut |_| {})?;
        self.kind_of(&self.root_node_name)
    }

    fn kind_of(&self, name: &str) -> StrataResult<RootKind> {
        Ok(match self.node(name)? {
            ExpressionNode::Column(_) | ExpressionNode::Value(_) => RootKind::Column,
            ExpressionNode::Unary { op: UnaryOp::Neg, .. } => RootKind::Column,
            ExpressionNode::Unary { op: UnaryOp::Not, .. } => RootKind::Bitset,
            ExpressionNode::Binary { op, .. } => {
                if op.produces_bitset() {
                    RootKind::Bitset
                } else {
                    RootKind::Column
                }
            }
            ExpressionNode::Ternary { .. } => RootKind::Column,
            ExpressionNode::IsIn { .. } | ExpressionNode::IsNull { .. } => RootKind::Bitset,
        })
    }

    /// Infer the root's output type against an input schema. Missing
    /// columns infer as `Float64` under a dynamic schema and error
    /// otherwise.
    pub fn infer_type(&self, schema: &OutputSchema) -> StrataResult<DataType> {
        self.infer_node_type(&self.root_node_name, schema)
    }

    fn infer_node_type(&self, name: &str, schema: &OutputSchema) -> StrataResult<DataType> {
        match self.node(name)? {
            ExpressionNode::Column(column) => match schema.field(column) {
                Some(field) => Ok(field.data_type.clone()),
                None if schema.dynamic => Ok(DataType::Float64),
                None => Err(StrataError::missing_column(column.clone())),
            },
            ExpressionNode::Value(value) => value.data_type().ok_or_else(|| {
                StrataError::invalid_user_argument("null literal has no inferable type")
            }),
            ExpressionNode::Unary { op: UnaryOp::Neg, child } => {
                let child_type = self.infer_node_type(child, schema)?;
                match child_type {
                    // Negating an unsigned column yields a signed one.
                    DataType::UInt64 => Ok(DataType::Int64),
                    dt if dt.is_numeric() => Ok(dt),
                    dt => Err(StrataError::schema_error(format!(
                        "cannot negate column of type {dt}"
                    ))),
                }
            }
            ExpressionNode::Unary { op: UnaryOp::Not, .. }
            | ExpressionNode::IsIn { .. }
            | ExpressionNode::IsNull { .. } => Ok(DataType::Bool),
            ExpressionNode::Binary { op, left, right } => {
                if op.produces_bitset() {
                    return Ok(DataType::Bool);
                }
                let lhs = self.infer_node_type(left, schema)?;
                let rhs = self.infer_node_type(right, schema)?;
                lhs.promote(&rhs).ok_or_else(|| {
                    StrataError::schema_error(format!(
                        "no numeric promotion between {lhs} and {rhs}"
                    ))
                })
            }
            ExpressionNode::Ternary {
                when_true,
                when_false,
                ..
            } => {
                let lhs = self.infer_node_type(when_true, schema)?;
                let rhs = self.infer_node_type(when_false, schema)?;
                if lhs == rhs {
                    Ok(lhs)
                } else {
                    lhs.promote(&rhs).ok_or_else(|| {
                        StrataError::schema_error(format!(
                            "ternary branches disagree on type: {lhs} vs {rhs}"
                        ))
                    })
                }
            }
        }
    }

    fn walk(
        &self,
        name: &str,
        in_progress: &mut HashSet<String>,
        visit: &mut impl FnMut(&ExpressionNode),
    ) -> StrataResult<()> {
        if !in_progress.insert(name.to_string()) {
            return Err(StrataError::invalid_user_argument(format!(
                "expression node '{name}' participates in a cycle"
            )));
        }
        let node = self.node(name)?;
        visit(node);
        match node {
            ExpressionNode::Column(_) | ExpressionNode::Value(_) => {}
            ExpressionNode::Unary { child, .. } | ExpressionNode::IsNull { child, .. } => {
                self.walk(child, in_progress, visit)?;
            }
            ExpressionNode::IsIn { child, .. } => {
                self.walk(child, in_progress, visit)?;
            }
            ExpressionNode::Binary { left, right, .. } => {
                self.walk(left, in_progress, visit)?;
                self.walk(right, in_progress, visit)?;
            }
            ExpressionNode::Ternary {
                condition,
                when_true,
                when_false,
            } => {
                self.walk(condition, in_progress, visit)?;
                self.walk(when_true, in_progress, visit)?;
                self.walk(when_false, in_progress, visit)?;
            }
        }
        in_progress.remove(name);
        Ok(())
    }
}
