//! Fluent construction of expression contexts.
//!
//! The pipeline consumes the node-table form; this builder flattens a
//! conventional expression tree into it, naming interior nodes `n0`,
//! `n1`, ... in post-order.

use strata_core::Value;

use super::{BinaryOp, ExpressionContext, ExpressionNode, UnaryOp};

/// An expression tree under construction.
#[derive(Debug, Clone)]
pub struct Expr(ExprKind);

#[derive(Debug, Clone)]
enum ExprKind {
    Column(String),
    Value(Value),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    IsIn(Box<Expr>, Vec<Value>, bool),
    IsNull(Box<Expr>, bool),
}

/// Reference a column by name.
pub fn col(name: impl Into<String>) -> Expr {
    Expr(ExprKind::Column(name.into()))
}

/// A literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr(ExprKind::Value(value.into()))
}

/// `if condition then when_true else when_false`, per row.
pub fn ternary(condition: Expr, when_true: Expr, when_false: Expr) -> Expr {
    Expr(ExprKind::Ternary(
        Box::new(condition),
        Box::new(when_true),
        Box::new(when_false),
    ))
}

macro_rules! binary_method {
    ($name:ident, $op:ident) => {
        pub fn $name(self, rhs: Expr) -> Expr {
            Expr(ExprKind::Binary(
                BinaryOp::$op,
                Box::new(self),
                Box::new(rhs),
            ))
        }
    };
}

impl Expr {
    binary_method!(add, Add);
    binary_method!(sub, Sub);
    binary_method!(mul, Mul);
    binary_method!(div, Div);
    binary_method!(eq, Eq);
    binary_method!(not_eq, NotEq);
    binary_method!(lt, Lt);
    binary_method!(lt_eq, LtEq);
    binary_method!(gt, Gt);
    binary_method!(gt_eq, GtEq);
    binary_method!(and, And);
    binary_method!(or, Or);

    pub fn neg(self) -> Expr {
        Expr(ExprKind::Unary(UnaryOp::Neg, Box::new(self)))
    }

    pub fn not(self) -> Expr {
        Expr(ExprKind::Unary(UnaryOp::Not, Box::new(self)))
    }

    pub fn is_null(self) -> Expr {
        Expr(ExprKind::IsNull(Box::new(self), false))
    }

    pub fn is_not_null(self) -> Expr {
        Expr(ExprKind::IsNull(Box::new(self), true))
    }

    pub fn isin(self, set: impl IntoIterator<Item = impl Into<Value>>) -> Expr {
        Expr(ExprKind::IsIn(
            Box::new(self),
            set.into_iter().map(Into::into).collect(),
            false,
        ))
    }

    pub fn not_in(self, set: impl IntoIterator<Item = impl Into<Value>>) -> Expr {
        Expr(ExprKind::IsIn(
            Box::new(self),
            set.into_iter().map(Into::into).collect(),
            true,
        ))
    }

    /// Flatten into a node table rooted at the last node added.
    pub fn build(self) -> ExpressionContext {
        let mut ctx = ExpressionContext::new(String::new());
        let mut counter = 0usize;
        let root = flatten(self, &mut ctx, &mut counter);
        ctx.root_node_name = root;
        ctx
    }
}

fn fresh(counter: &mut usize) -> String {
    let name = format!("n{counter}");
    *counter += 1;
    name
}

fn flatten(expr: Expr, ctx: &mut ExpressionContext, counter: &mut usize) -> String {
    let node = match expr.0 {
        ExprKind::Column(name) => ExpressionNode::Column(name),
        ExprKind::Value(value) => ExpressionNode::Value(value),
        ExprKind::Unary(op, child) => {
            let child = flatten(*child, ctx, counter);
            ExpressionNode::Unary { op, child }
        }
        ExprKind::Binary(op, left, right) => {
            let left = flatten(*left, ctx, counter);
            let right = flatten(*right, ctx, counter);
            ExpressionNode::Binary { op, left, right }
        }
        ExprKind::Ternary(condition, when_true, when_false) => {
            let condition = flatten(*condition, ctx, counter);
            let when_true = flatten(*when_true, ctx, counter);
            let when_false = flatten(*when_false, ctx, counter);
            ExpressionNode::Ternary {
                condition,
                when_true,
                when_false,
            }
        }
        ExprKind::IsIn(child, set, negated) => {
            let child = flatten(*child, ctx, counter);
            ExpressionNode::IsIn {
                child,
                set,
                negated,
            }
        }
        ExprKind::IsNull(child, negated) => {
            let child = flatten(*child, ctx, counter);
            ExpressionNode::IsNull { child, negated }
        }
    };
    let name = fresh(counter);
    ctx.add_node(name.clone(), node);
    name
}
