//! Expression evaluation against a segment's columns.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use ahash::AHashSet;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt64Array,
    new_null_array,
};
use arrow::compute::kernels::{boolean, cmp, numeric, zip};
use arrow::compute::{cast, is_not_null, is_null};
use arrow::datatypes::DataType as ArrowDataType;
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{DataType, Value};

use super::{BinaryOp, ExpressionContext, ExpressionNode, UnaryOp};
use crate::config::ProcessingConfig;

/// The product of one expression node: a typed column, a bitset, or a
/// scalar promoted to a column on demand.
#[derive(Debug, Clone)]
pub enum EvalResult {
    Column(ArrayRef),
    Bitset(BooleanArray),
    Scalar(Value),
}

impl EvalResult {
    /// View as a plain array, broadcasting scalars to `num_rows`.
    fn into_array(self, num_rows: usize) -> ArrayRef {
        match self {
            Self::Column(arr) => arr,
            Self::Bitset(bits) => Arc::new(bits),
            Self::Scalar(value) => value.to_array(num_rows),
        }
    }
}

/// Post-order evaluator over an [`ExpressionContext`].
///
/// Shared DAG children are evaluated once per call via a name-keyed memo.
pub struct ExprEvaluator<'a> {
    context: &'a ExpressionContext,
    config: &'a ProcessingConfig,
}

impl<'a> ExprEvaluator<'a> {
    pub fn new(context: &'a ExpressionContext, config: &'a ProcessingConfig) -> Self {
        Self { context, config }
    }

    /// Evaluate the root against a batch.
    pub fn evaluate(&self, batch: &RecordBatch) -> StrataResult<EvalResult> {
        let mut memo = HashMap::new();
        self.eval_node(&self.context.root_node_name, batch, &mut memo)
    }

    /// Evaluate a root that must produce a bitset. Nulls in the result
    /// are resolved to unset bits.
    pub fn evaluate_bitset(&self, batch: &RecordBatch) -> StrataResult<BooleanArray> {
        match self.evaluate(batch)? {
            EvalResult::Bitset(bits) => Ok(null_fill(&bits, false)),
            other => Err(StrataError::invalid_user_argument(format!(
                "expression root produced {} where a bitset was required",
                result_kind_name(&other)
            ))),
        }
    }

    /// Evaluate a root that must produce a column; scalars broadcast.
    pub fn evaluate_column(&self, batch: &RecordBatch) -> StrataResult<ArrayRef> {
        match self.evaluate(batch)? {
            EvalResult::Column(arr) => Ok(arr),
            EvalResult::Scalar(value) => Ok(value.to_array(batch.num_rows())),
            EvalResult::Bitset(_) => Err(StrataError::invalid_user_argument(
                "expression root produced a bitset where a column was required",
            )),
        }
    }

    fn eval_node(
        &self,
        name: &str,
        batch: &RecordBatch,
        memo: &mut HashMap<String, EvalResult>,
    ) -> StrataResult<EvalResult> {
        if let Some(cached) = memo.get(name) {
            return Ok(cached.clone());
        }
        let result = match self.context.node(name)? {
            ExpressionNode::Column(column) => self.eval_column_ref(column, batch)?,
            ExpressionNode::Value(value) => EvalResult::Scalar(value.clone()),
            ExpressionNode::Unary { op, child } => {
                let child = self.eval_node(child, batch, memo)?;
                self.eval_unary(*op, child, batch)?
            }
            ExpressionNode::Binary { op, left, right } => {
                let left = self.eval_node(left, batch, memo)?;
                let right = self.eval_node(right, batch, memo)?;
                self.eval_binary(*op, left, right, batch)?
            }
            ExpressionNode::Ternary {
                condition,
                when_true,
                when_false,
            } => {
                let condition = self.eval_node(condition, batch, memo)?;
                let when_true = self.eval_node(when_true, batch, memo)?;
                let when_false = self.eval_node(when_false, batch, memo)?;
                self.eval_ternary(condition, when_true, when_false, batch)?
            }
            ExpressionNode::IsIn {
                child,
                set,
                negated,
            } => {
                let child = self.eval_node(child, batch, memo)?;
                self.eval_isin(child, set, *negated, batch)?
            }
            ExpressionNode::IsNull { child, negated } => {
                let child = self.eval_node(child, batch, memo)?;
                let arr = child.into_array(batch.num_rows());
                let bits = if *negated {
                    is_not_null(&arr)?
                } else {
                    is_null(&arr)?
                };
                EvalResult::Bitset(bits)
            }
        };
        memo.insert(name.to_string(), result.clone());
        Ok(result)
    }

    fn eval_column_ref(&self, column: &str, batch: &RecordBatch) -> StrataResult<EvalResult> {
        if let Some(arr) = batch.column_by_name(column) {
            return Ok(EvalResult::Column(arr.clone()));
        }
        if self.config.dynamic_schema {
            if !self.config.missing_column_warned.swap(true, Ordering::AcqRel) {
                tracing::warn!(column, "column not present, treating as all-missing");
            }
            return Ok(EvalResult::Column(new_null_array(
                &ArrowDataType::Float64,
                batch.num_rows(),
            )));
        }
        Err(StrataError::missing_column(format!(
            "column '{}' not found; batch has columns {:?}",
            column,
            batch
                .schema_ref()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect::<Vec<_>>()
        )))
    }

    fn eval_unary(
        &self,
        op: UnaryOp,
        child: EvalResult,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        match op {
            UnaryOp::Not => {
                let bits = match child {
                    EvalResult::Bitset(bits) => bits,
                    other => {
                        return Err(StrataError::schema_error(format!(
                            "NOT requires a bitset operand, got {}",
                            result_kind_name(&other)
                        )));
                    }
                };
                Ok(EvalResult::Bitset(boolean::not(&bits)?))
            }
            UnaryOp::Neg => {
                let arr = child.into_array(batch.num_rows());
                let negated = match arr.data_type() {
                    ArrowDataType::Float64 => numeric::neg(&arr)?,
                    ArrowDataType::Int64 => numeric::neg_wrapping(&arr)?,
                    ArrowDataType::UInt64 => {
                        let signed = cast(&arr, &ArrowDataType::Int64)?;
                        numeric::neg_wrapping(&signed)?
                    }
                    dt => {
                        return Err(StrataError::schema_error(format!(
                            "cannot negate column of type {dt}"
                        )));
                    }
                };
                Ok(EvalResult::Column(negated))
            }
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: EvalResult,
        right: EvalResult,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        match op {
            BinaryOp::And | BinaryOp::Or => self.eval_logical(op, left, right),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                self.eval_arithmetic(op, left, right, batch)
            }
            _ => self.eval_comparison(op, left, right, batch),
        }
    }

    fn eval_logical(
        &self,
        op: BinaryOp,
        left: EvalResult,
        right: EvalResult,
    ) -> StrataResult<EvalResult> {
        let (EvalResult::Bitset(l), EvalResult::Bitset(r)) = (&left, &right) else {
            return Err(StrataError::schema_error(format!(
                "{op} requires bitset operands"
            )));
        };
        let bits = if self.config.dynamic_schema {
            // SQL three-valued logic only when dynamic schema demands it.
            match op {
                BinaryOp::And => boolean::and_kleene(l, r)?,
                _ => boolean::or_kleene(l, r)?,
            }
        } else {
            match op {
                BinaryOp::And => boolean::and(&null_fill(l, false), &null_fill(r, false))?,
                _ => boolean::or(&null_fill(l, true), &null_fill(r, true))?,
            }
        };
        Ok(EvalResult::Bitset(bits))
    }

    fn eval_arithmetic(
        &self,
        op: BinaryOp,
        left: EvalResult,
        right: EvalResult,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        let num_rows = batch.num_rows();
        let (l, r) = promote_pair(left.into_array(num_rows), right.into_array(num_rows))?;
        // Wrapping semantics for integers; the same kernels are exact for
        // floats. Division stays checked so integer divide-by-zero errors.
        let result = match op {
            BinaryOp::Add => numeric::add_wrapping(&l, &r)?,
            BinaryOp::Sub => numeric::sub_wrapping(&l, &r)?,
            BinaryOp::Mul => numeric::mul_wrapping(&l, &r)?,
            _ => numeric::div(&l, &r)?,
        };
        Ok(EvalResult::Column(result))
    }

    fn eval_comparison(
        &self,
        op: BinaryOp,
        left: EvalResult,
        right: EvalResult,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        let num_rows = batch.num_rows();
        let (l, r) = promote_pair(left.into_array(num_rows), right.into_array(num_rows))?;

        // Floats get hand-rolled semantics: NaN compares false in every
        // ordering comparison, equality is bit-exact.
        if l.data_type() == &ArrowDataType::Float64 {
            let l = downcast::<Float64Array>(&l, "Float64")?;
            let r = downcast::<Float64Array>(&r, "Float64")?;
            return Ok(EvalResult::Bitset(float_compare(op, l, r)));
        }

        let bits = match op {
            BinaryOp::Eq => cmp::eq(&l, &r)?,
            BinaryOp::NotEq => cmp::neq(&l, &r)?,
            BinaryOp::Lt => cmp::lt(&l, &r)?,
            BinaryOp::LtEq => cmp::lt_eq(&l, &r)?,
            BinaryOp::Gt => cmp::gt(&l, &r)?,
            BinaryOp::GtEq => cmp::gt_eq(&l, &r)?,
            _ => {
                return Err(StrataError::assertion(format!(
                    "{op} is not a comparison operator"
                )));
            }
        };
        Ok(EvalResult::Bitset(bits))
    }

    fn eval_ternary(
        &self,
        condition: EvalResult,
        when_true: EvalResult,
        when_false: EvalResult,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        let EvalResult::Bitset(condition) = condition else {
            return Err(StrataError::schema_error(
                "ternary condition must be a bitset",
            ));
        };
        let condition = null_fill(&condition, false);
        let num_rows = batch.num_rows();
        let (t, f) = promote_pair(
            when_true.into_array(num_rows),
            when_false.into_array(num_rows),
        )?;
        Ok(EvalResult::Column(zip::zip(&condition, &t, &f)?))
    }

    fn eval_isin(
        &self,
        child: EvalResult,
        set: &[Value],
        negated: bool,
        batch: &RecordBatch,
    ) -> StrataResult<EvalResult> {
        let arr = child.into_array(batch.num_rows());
        // Membership is by value equality at the column's declared type;
        // missing cells are never members, so `isin` excludes them and
        // the negated form includes them.
        let membership: BooleanArray = match arr.data_type() {
            ArrowDataType::Int64 | ArrowDataType::Timestamp(_, _) => {
                let ints = cast(&arr, &ArrowDataType::Int64)?;
                let ints = downcast::<Int64Array>(&ints, "Int64")?;
                let probe: AHashSet<i64> = set.iter().filter_map(Value::as_int64).collect();
                ints.iter().map(|v| v.map(|x| probe.contains(&x))).collect()
            }
            ArrowDataType::UInt64 => {
                let ints = downcast::<UInt64Array>(&arr, "UInt64")?;
                let probe: AHashSet<u64> = set.iter().filter_map(Value::as_uint64).collect();
                ints.iter().map(|v| v.map(|x| probe.contains(&x))).collect()
            }
            ArrowDataType::Float64 => {
                let floats = downcast::<Float64Array>(&arr, "Float64")?;
                let probe: AHashSet<u64> = set
                    .iter()
                    .filter_map(Value::as_float64)
                    .map(f64::to_bits)
                    .collect();
                floats
                    .iter()
                    .map(|v| v.map(|x| probe.contains(&x.to_bits())))
                    .collect()
            }
            ArrowDataType::Utf8 => {
                let strings = downcast::<StringArray>(&arr, "Utf8")?;
                let probe: AHashSet<&str> = set.iter().filter_map(Value::as_str).collect();
                strings
                    .iter()
                    .map(|v| v.map(|s| probe.contains(s)))
                    .collect()
            }
            dt => {
                return Err(StrataError::schema_error(format!(
                    "isin is not defined for columns of type {dt}"
                )));
            }
        };
        let bits = if negated {
            boolean::not(&null_fill(&membership, true))?
        } else {
            null_fill(&membership, false)
        };
        Ok(EvalResult::Bitset(bits))
    }
}

fn result_kind_name(result: &EvalResult) -> &'static str {
    match result {
        EvalResult::Column(_) => "a column",
        EvalResult::Bitset(_) => "a bitset",
        EvalResult::Scalar(_) => "a scalar",
    }
}

fn downcast<'b, T: 'static>(arr: &'b ArrayRef, expected: &str) -> StrataResult<&'b T> {
    arr.as_any().downcast_ref::<T>().ok_or_else(|| {
        StrataError::assertion(format!(
            "array was not the expected {expected} after promotion"
        ))
    })
}

/// Resolve nulls in a bitset to a fixed fill value.
fn null_fill(bits: &BooleanArray, fill: bool) -> BooleanArray {
    if bits.null_count() == 0 {
        return bits.clone();
    }
    bits.iter().map(|v| Some(v.unwrap_or(fill))).collect()
}

/// Promote a pair of arrays to a common type: the wider numeric type for
/// int/float mixes, timestamps for timestamp/integer mixes, otherwise
/// the types must already agree.
fn promote_pair(left: ArrayRef, right: ArrayRef) -> StrataResult<(ArrayRef, ArrayRef)> {
    let lt = left.data_type().clone();
    let rt = right.data_type().clone();
    if lt == rt {
        return Ok((left, right));
    }

    // Null literals broadcast to the other side's type.
    if lt == ArrowDataType::Null {
        return Ok((cast(&left, &rt)?, right));
    }
    if rt == ArrowDataType::Null {
        let casted = cast(&right, &lt)?;
        return Ok((left, casted));
    }

    if let (Some(l), Some(r)) = (DataType::from_arrow(&lt), DataType::from_arrow(&rt)) {
        if let Some(wider) = l.promote(&r) {
            let target = wider.to_arrow();
            return Ok((cast(&left, &target)?, cast(&right, &target)?));
        }
        // Integer literals against a timestamp column compare in epoch
        // nanoseconds.
        if l == DataType::Timestamp && r.is_integer() {
            let casted = cast(&right, &lt)?;
            return Ok((left, casted));
        }
        if r == DataType::Timestamp && l.is_integer() {
            return Ok((cast(&left, &rt)?, right));
        }
    }
    Err(StrataError::schema_error(format!(
        "no common type for operands of types {lt} and {rt}"
    )))
}

/// Ordering comparisons where NaN always loses; equality on bits.
fn float_compare(op: BinaryOp, left: &Float64Array, right: &Float64Array) -> BooleanArray {
    left.iter()
        .zip(right.iter())
        .map(|(l, r)| match (l, r) {
            (Some(l), Some(r)) => Some(match op {
                BinaryOp::Eq => l.to_bits() == r.to_bits(),
                BinaryOp::NotEq => l.to_bits() != r.to_bits(),
                BinaryOp::Lt => l < r,
                BinaryOp::LtEq => l <= r,
                BinaryOp::Gt => l > r,
                _ => l >= r,
            }),
            _ => None,
        })
        .collect()
}
