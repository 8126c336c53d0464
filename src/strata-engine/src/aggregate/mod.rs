//! Grouped aggregation: operators, partial states and column building.
//!
//! Every aggregator is two-phase: partials accumulate per group and
//! per task, `combine` merges partials across tasks, `finalize` turns a
//! partial into one output cell. That keeps grouped and resampled
//! aggregation associative and commutative across processing units.

pub mod sorted;

use std::sync::Arc;

use ahash::AHashSet;
use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, ListBuilder, StringArray, StringBuilder, TimestampNanosecondArray,
    TimestampNanosecondBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::DataType as ArrowDataType;

use common_error::{StrataError, StrataResult};
use strata_core::{DataType, Value};

/// The fixed aggregation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOperator {
    Sum,
    Min,
    Max,
    Mean,
    Count,
    First,
    Last,
    /// Distinct collect.
    Set,
}

impl AggregationOperator {
    pub fn from_name(name: &str) -> StrataResult<Self> {
        Ok(match name {
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "mean" => Self::Mean,
            "count" => Self::Count,
            "first" => Self::First,
            "last" => Self::Last,
            "set" => Self::Set,
            other => {
                return Err(StrataError::invalid_user_argument(format!(
                    "unknown aggregation operator '{other}'"
                )));
            }
        })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
            Self::Set => "set",
        }
    }

    /// Output type for a given input column type.
    pub fn output_type(&self, input: &DataType) -> StrataResult<DataType> {
        let out = match self {
            Self::Count => DataType::Int64,
            Self::Mean => {
                if !input.is_numeric() {
                    return Err(StrataError::schema_error(format!(
                        "mean is not defined for columns of type {input}"
                    )));
                }
                DataType::Float64
            }
            Self::Sum => match input {
                DataType::Int64 => DataType::Int64,
                DataType::UInt64 => DataType::UInt64,
                DataType::Float64 => DataType::Float64,
                other => {
                    return Err(StrataError::schema_error(format!(
                        "sum is not defined for columns of type {other}"
                    )));
                }
            },
            Self::Min | Self::Max | Self::First | Self::Last => input.clone(),
            Self::Set => DataType::List(Box::new(input.clone())),
        };
        Ok(out)
    }
}

impl std::fmt::Display for AggregationOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One requested aggregation: operator plus input and output columns.
#[derive(Debug, Clone)]
pub struct NamedAggregator {
    pub operator: AggregationOperator,
    pub input_column: String,
    pub output_column: String,
}

impl NamedAggregator {
    pub fn new(
        operator: AggregationOperator,
        input_column: impl Into<String>,
        output_column: impl Into<String>,
    ) -> Self {
        Self {
            operator,
            input_column: input_column.into(),
            output_column: output_column.into(),
        }
    }
}

/// A hashable, orderable group-key value. Floats are keyed by bit
/// pattern and ordered by total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(u64),
    Str(String),
    Ts(i64),
}

impl KeyValue {
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => return None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int64(i) => Self::Int(*i),
            Value::UInt64(u) => Self::UInt(*u),
            Value::Float64(f) => Self::Float(f.to_bits()),
            Value::String(s) => Self::Str(s.clone()),
            Value::Timestamp(t) => Self::Ts(*t),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int64(*i),
            Self::UInt(u) => Value::UInt64(*u),
            Self::Float(bits) => Value::Float64(f64::from_bits(*bits)),
            Self::Str(s) => Value::String(s.clone()),
            Self::Ts(t) => Value::Timestamp(*t),
        }
    }

    /// Ordering used for key-ascending output.
    pub fn sort_cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::UInt(a), Self::UInt(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => {
                f64::from_bits(*a).total_cmp(&f64::from_bits(*b))
            }
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Ts(a), Self::Ts(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Read one cell of an array as a scalar. `None` for missing cells.
pub(crate) fn scalar_at(arr: &ArrayRef, row: usize) -> StrataResult<Option<Value>> {
    fn cell<'a, T: 'static>(arr: &'a ArrayRef) -> StrataResult<&'a T> {
        arr.as_any().downcast_ref::<T>().ok_or_else(|| {
            StrataError::assertion(format!(
                "array downcast disagrees with its declared type {}",
                arr.data_type()
            ))
        })
    }

    if arr.is_null(row) {
        return Ok(None);
    }
    let value = match arr.data_type() {
        ArrowDataType::Boolean => Value::Bool(cell::<BooleanArray>(arr)?.value(row)),
        ArrowDataType::Int64 => Value::Int64(cell::<Int64Array>(arr)?.value(row)),
        ArrowDataType::UInt64 => Value::UInt64(cell::<UInt64Array>(arr)?.value(row)),
        ArrowDataType::Float64 => Value::Float64(cell::<Float64Array>(arr)?.value(row)),
        ArrowDataType::Utf8 => {
            Value::String(cell::<StringArray>(arr)?.value(row).to_string())
        }
        ArrowDataType::Timestamp(_, _) => Value::Timestamp(
            arr.as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .ok_or_else(|| {
                    StrataError::schema_error("timestamp column is not nanosecond precision")
                })?
                .value(row),
        ),
        dt => {
            return Err(StrataError::schema_error(format!(
                "cannot read scalar cells from columns of type {dt}"
            )));
        }
    };
    Ok(Some(value))
}

fn kahan_add(sum: &mut f64, compensation: &mut f64, v: f64) {
    let y = v - *compensation;
    let t = *sum + y;
    *compensation = (t - *sum) - y;
    *sum = t;
}

fn value_lt(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int64(a), Value::Int64(b)) => a < b,
        (Value::UInt64(a), Value::UInt64(b)) => a < b,
        (Value::Float64(a), Value::Float64(b)) => a < b,
        (Value::Timestamp(a), Value::Timestamp(b)) => a < b,
        (Value::String(a), Value::String(b)) => a < b,
        (Value::Bool(a), Value::Bool(b)) => a < b,
        _ => false,
    }
}

/// Partial aggregation state for one group.
#[derive(Debug, Clone)]
pub enum AggPartial {
    SumInt { sum: i64, seen: bool },
    SumUInt { sum: u64, seen: bool },
    SumFloat { sum: f64, compensation: f64, seen: bool },
    Min { best: Option<Value> },
    Max { best: Option<Value> },
    Mean { sum: f64, compensation: f64, count: u64 },
    Count { count: u64 },
    First { best: Option<(u64, Value)> },
    Last { best: Option<(u64, Value)> },
    Set { keys: AHashSet<KeyValue> },
}

impl AggPartial {
    /// Fresh partial for an operator over a column of `input` type.
    pub fn new(operator: AggregationOperator, input: &DataType) -> StrataResult<Self> {
        Ok(match operator {
            AggregationOperator::Sum => match input {
                DataType::Int64 => Self::SumInt { sum: 0, seen: false },
                DataType::UInt64 => Self::SumUInt { sum: 0, seen: false },
                DataType::Float64 => Self::SumFloat {
                    sum: 0.0,
                    compensation: 0.0,
                    seen: false,
                },
                other => {
                    return Err(StrataError::schema_error(format!(
                        "sum is not defined for columns of type {other}"
                    )));
                }
            },
            AggregationOperator::Min => Self::Min { best: None },
            AggregationOperator::Max => Self::Max { best: None },
            AggregationOperator::Mean => {
                if !input.is_numeric() {
                    return Err(StrataError::schema_error(format!(
                        "mean is not defined for columns of type {input}"
                    )));
                }
                Self::Mean {
                    sum: 0.0,
                    compensation: 0.0,
                    count: 0,
                }
            }
            AggregationOperator::Count => Self::Count { count: 0 },
            AggregationOperator::First => Self::First { best: None },
            AggregationOperator::Last => Self::Last { best: None },
            AggregationOperator::Set => Self::Set {
                keys: AHashSet::new(),
            },
        })
    }

    /// Fold one non-missing cell in. `row_index` is the pipeline-wide
    /// row index used to break first/last ties deterministically.
    pub fn update(&mut self, value: &Value, row_index: u64) -> StrataResult<()> {
        match self {
            Self::SumInt { sum, seen } => {
                let v = value.as_int64().ok_or_else(|| sum_type_error(value))?;
                *sum = sum.wrapping_add(v);
                *seen = true;
            }
            Self::SumUInt { sum, seen } => {
                let v = value.as_uint64().ok_or_else(|| sum_type_error(value))?;
                *sum = sum.wrapping_add(v);
                *seen = true;
            }
            Self::SumFloat {
                sum,
                compensation,
                seen,
            } => {
                let v = value.as_float64().ok_or_else(|| sum_type_error(value))?;
                kahan_add(sum, compensation, v);
                *seen = true;
            }
            Self::Min { best } => {
                if matches!(value, Value::Float64(f) if f.is_nan()) {
                    return Ok(());
                }
                if best.as_ref().is_none_or(|b| value_lt(value, b)) {
                    *best = Some(value.clone());
                }
            }
            Self::Max { best } => {
                if matches!(value, Value::Float64(f) if f.is_nan()) {
                    return Ok(());
                }
                if best.as_ref().is_none_or(|b| value_lt(b, value)) {
                    *best = Some(value.clone());
                }
            }
            Self::Mean {
                sum,
                compensation,
                count,
            } => {
                let v = value.as_float64().ok_or_else(|| sum_type_error(value))?;
                kahan_add(sum, compensation, v);
                *count += 1;
            }
            Self::Count { count } => *count += 1,
            Self::First { best } => {
                if best.as_ref().is_none_or(|(idx, _)| row_index < *idx) {
                    *best = Some((row_index, value.clone()));
                }
            }
            Self::Last { best } => {
                if best.as_ref().is_none_or(|(idx, _)| row_index > *idx) {
                    *best = Some((row_index, value.clone()));
                }
            }
            Self::Set { keys } => {
                if let Some(key) = KeyValue::from_value(value) {
                    keys.insert(key);
                }
            }
        }
        Ok(())
    }

    /// Merge another partial of the same shape into this one.
    pub fn combine(&mut self, other: Self) -> StrataResult<()> {
        match (self, other) {
            (Self::SumInt { sum, seen }, Self::SumInt { sum: o, seen: os }) => {
                *sum = sum.wrapping_add(o);
                *seen |= os;
            }
            (Self::SumUInt { sum, seen }, Self::SumUInt { sum: o, seen: os }) => {
                *sum = sum.wrapping_add(o);
                *seen |= os;
            }
            (
                Self::SumFloat {
                    sum,
                    compensation,
                    seen,
                },
                Self::SumFloat { sum: o, seen: os, .. },
            ) => {
                kahan_add(sum, compensation, o);
                *seen |= os;
            }
            (Self::Min { best }, Self::Min { best: o }) => {
                if let Some(v) = o {
                    if best.as_ref().is_none_or(|b| value_lt(&v, b)) {
                        *best = Some(v);
                    }
                }
            }
            (Self::Max { best }, Self::Max { best: o }) => {
                if let Some(v) = o {
                    if best.as_ref().is_none_or(|b| value_lt(b, &v)) {
                        *best = Some(v);
                    }
                }
            }
            (
                Self::Mean {
                    sum,
                    compensation,
                    count,
                },
                Self::Mean { sum: o, count: oc, .. },
            ) => {
                kahan_add(sum, compensation, o);
                *count += oc;
            }
            (Self::Count { count }, Self::Count { count: o }) => *count += o,
            (Self::First { best }, Self::First { best: o }) => {
                if let Some((idx, v)) = o {
                    if best.as_ref().is_none_or(|(b, _)| idx < *b) {
                        *best = Some((idx, v));
                    }
                }
            }
            (Self::Last { best }, Self::Last { best: o }) => {
                if let Some((idx, v)) = o {
                    if best.as_ref().is_none_or(|(b, _)| idx > *b) {
                        *best = Some((idx, v));
                    }
                }
            }
            (Self::Set { keys }, Self::Set { keys: o }) => keys.extend(o),
            (this, other) => {
                return Err(StrataError::assertion(format!(
                    "cannot combine aggregation partials {this:?} and {other:?}"
                )));
            }
        }
        Ok(())
    }

    /// The finished cell. `Null` for groups that saw no values.
    pub fn finalize(&self) -> Value {
        match self {
            Self::SumInt { sum, seen } => {
                if *seen {
                    Value::Int64(*sum)
                } else {
                    Value::Null
                }
            }
            Self::SumUInt { sum, seen } => {
                if *seen {
                    Value::UInt64(*sum)
                } else {
                    Value::Null
                }
            }
            Self::SumFloat { sum, seen, .. } => {
                if *seen {
                    Value::Float64(*sum)
                } else {
                    Value::Null
                }
            }
            Self::Min { best } | Self::Max { best } => {
                best.clone().unwrap_or(Value::Null)
            }
            Self::Mean { sum, count, .. } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float64(*sum / *count as f64)
                }
            }
            Self::Count { count } => Value::Int64(*count as i64),
            Self::First { best } | Self::Last { best } => {
                best.clone().map_or(Value::Null, |(_, v)| v)
            }
            Self::Set { .. } => Value::Null, // list cells are built by `build_column`
        }
    }
}

fn sum_type_error(value: &Value) -> StrataError {
    StrataError::schema_error(format!(
        "numeric aggregation saw a {} cell",
        value.type_name()
    ))
}

/// Build the output column for one aggregator from per-group partials,
/// in group order.
pub fn build_column(
    operator: AggregationOperator,
    input_type: &DataType,
    partials: &[AggPartial],
) -> StrataResult<ArrayRef> {
    if operator == AggregationOperator::Set {
        return build_set_column(input_type, partials);
    }
    let output_type = operator.output_type(input_type)?;
    let cells: Vec<Value> = partials.iter().map(AggPartial::finalize).collect();
    build_scalar_column(&output_type, &cells)
}

pub(crate) fn build_scalar_column(data_type: &DataType, cells: &[Value]) -> StrataResult<ArrayRef> {
    macro_rules! build {
        ($builder:ty, $variant:path, |$v:ident| $convert:expr) => {{
            let mut builder = <$builder>::with_capacity(cells.len());
            for cell in cells {
                match cell {
                    Value::Null => builder.append_null(),
                    $variant($v) => builder.append_value($convert),
                    other => {
                        return Err(StrataError::assertion(format!(
                            "aggregation cell {other} does not match column type {data_type}"
                        )));
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    Ok(match data_type {
        DataType::Int64 => build!(Int64Builder, Value::Int64, |v| *v),
        DataType::UInt64 => build!(UInt64Builder, Value::UInt64, |v| *v),
        DataType::Float64 => build!(Float64Builder, Value::Float64, |v| *v),
        DataType::Timestamp => {
            build!(TimestampNanosecondBuilder, Value::Timestamp, |v| *v)
        }
        DataType::Bool => build!(BooleanBuilder, Value::Bool, |v| *v),
        DataType::String => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                match cell {
                    Value::Null => builder.append_null(),
                    Value::String(s) => builder.append_value(s),
                    other => {
                        return Err(StrataError::assertion(format!(
                            "aggregation cell {other} does not match column type String"
                        )));
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::List(_) => {
            return Err(StrataError::assertion(
                "scalar column builder cannot build list columns",
            ));
        }
    })
}

fn build_set_column(input_type: &DataType, partials: &[AggPartial]) -> StrataResult<ArrayRef> {
    let sorted_sets: Vec<Vec<KeyValue>> = partials
        .iter()
        .map(|p| match p {
            AggPartial::Set { keys } => {
                let mut sorted: Vec<KeyValue> = keys.iter().cloned().collect();
                sorted.sort_by(|a, b| a.sort_cmp(b));
                Ok(sorted)
            }
            other => Err(StrataError::assertion(format!(
                "expected a set partial, got {other:?}"
            ))),
        })
        .collect::<StrataResult<_>>()?;

    macro_rules! build_list {
        ($builder:ty, |$k:ident| $convert:expr) => {{
            let mut builder = ListBuilder::new(<$builder>::new());
            for set in &sorted_sets {
                for $k in set {
                    builder.values().append_value($convert);
                }
                builder.append(true);
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    Ok(match input_type {
        DataType::Int64 => build_list!(Int64Builder, |k| match k {
            KeyValue::Int(v) => *v,
            _ => 0,
        }),
        DataType::UInt64 => build_list!(UInt64Builder, |k| match k {
            KeyValue::UInt(v) => *v,
            _ => 0,
        }),
        DataType::Float64 => build_list!(Float64Builder, |k| match k {
            KeyValue::Float(bits) => f64::from_bits(*bits),
            _ => 0.0,
        }),
        DataType::String => build_list!(StringBuilder, |k| match k {
            KeyValue::Str(s) => s.as_str(),
            _ => "",
        }),
        DataType::Timestamp => build_list!(TimestampNanosecondBuilder, |k| match k {
            KeyValue::Ts(v) => *v,
            _ => 0,
        }),
        other => {
            return Err(StrataError::schema_error(format!(
                "set is not defined for columns of type {other}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_int_wraps() {
        let mut partial = AggPartial::new(AggregationOperator::Sum, &DataType::Int64).unwrap();
        partial.update(&Value::Int64(i64::MAX), 0).unwrap();
        partial.update(&Value::Int64(1), 1).unwrap();
        assert_eq!(partial.finalize(), Value::Int64(i64::MIN));
    }

    #[test]
    fn test_empty_sum_is_null() {
        let partial = AggPartial::new(AggregationOperator::Sum, &DataType::Float64).unwrap();
        assert_eq!(partial.finalize(), Value::Null);
    }

    #[test]
    fn test_kahan_compensation() {
        // Summing 1e16 with many tiny values loses them under naive
        // accumulation; Kahan keeps them.
        let mut partial = AggPartial::new(AggregationOperator::Sum, &DataType::Float64).unwrap();
        partial.update(&Value::Float64(1e16), 0).unwrap();
        for i in 0..1000 {
            partial.update(&Value::Float64(1.0), i + 1).unwrap();
        }
        assert_eq!(partial.finalize(), Value::Float64(1e16 + 1000.0));
    }

    #[test]
    fn test_mean_stores_sum_and_count() {
        let mut a = AggPartial::new(AggregationOperator::Mean, &DataType::Int64).unwrap();
        a.update(&Value::Int64(1), 0).unwrap();
        a.update(&Value::Int64(2), 1).unwrap();

        let mut b = AggPartial::new(AggregationOperator::Mean, &DataType::Int64).unwrap();
        b.update(&Value::Int64(9), 2).unwrap();

        a.combine(b).unwrap();
        assert_eq!(a.finalize(), Value::Float64(4.0));
    }

    #[test]
    fn test_first_last_tie_break_on_row_index() {
        // Updates arrive out of row order, as they do after a hash
        // partition reshuffle.
        let mut first = AggPartial::new(AggregationOperator::First, &DataType::Int64).unwrap();
        first.update(&Value::Int64(30), 7).unwrap();
        first.update(&Value::Int64(10), 2).unwrap();
        first.update(&Value::Int64(20), 5).unwrap();
        assert_eq!(first.finalize(), Value::Int64(10));

        let mut last = AggPartial::new(AggregationOperator::Last, &DataType::Int64).unwrap();
        last.update(&Value::Int64(30), 7).unwrap();
        last.update(&Value::Int64(90), 11).unwrap();
        last.update(&Value::Int64(20), 5).unwrap();
        assert_eq!(last.finalize(), Value::Int64(90));
    }

    #[test]
    fn test_min_max_skip_nan() {
        let mut min = AggPartial::new(AggregationOperator::Min, &DataType::Float64).unwrap();
        min.update(&Value::Float64(f64::NAN), 0).unwrap();
        min.update(&Value::Float64(2.5), 1).unwrap();
        assert_eq!(min.finalize(), Value::Float64(2.5));
    }

    #[test]
    fn test_combine_mismatch_is_assertion() {
        let mut count = AggPartial::new(AggregationOperator::Count, &DataType::Int64).unwrap();
        let min = AggPartial::new(AggregationOperator::Min, &DataType::Int64).unwrap();
        assert!(matches!(
            count.combine(min),
            Err(StrataError::AssertionFailure(_))
        ));
    }

    #[test]
    fn test_set_column_is_sorted_distinct() {
        let mut partial = AggPartial::new(AggregationOperator::Set, &DataType::Int64).unwrap();
        for v in [3i64, 1, 3, 2, 1] {
            partial.update(&Value::Int64(v), 0).unwrap();
        }
        let column =
            build_column(AggregationOperator::Set, &DataType::Int64, &[partial]).unwrap();
        let lists = column
            .as_any()
            .downcast_ref::<arrow::array::ListArray>()
            .unwrap();
        let first = lists.value(0);
        let ints = first.as_any().downcast_ref::<Int64Array>().unwrap();
        let collected: Vec<i64> = ints.iter().map(|v| v.unwrap()).collect();
        assert_eq!(collected, vec![1, 2, 3]);
    }

    #[test]
    fn test_count_output_column_type() {
        let mut partial = AggPartial::new(AggregationOperator::Count, &DataType::String).unwrap();
        partial.update(&Value::String("x".into()), 0).unwrap();
        let column =
            build_column(AggregationOperator::Count, &DataType::String, &[partial]).unwrap();
        assert_eq!(column.data_type(), &ArrowDataType::Int64);
    }
}
