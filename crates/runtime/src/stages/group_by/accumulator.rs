//! Per-group aggregate state.
//!
//! Every row goes through two steps. [`AggState::prepare`] converts the source value and
//! computes the update without touching the state; [`AggState::apply`] commits it. A row
//! whose conversion fails for any aggregate therefore leaves the whole group unchanged.

use std::cmp::Ordering;

use rowflow_common::{Result, RowflowError};
use rowflow_execution::{Value, ValueType};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Sum,
    Average,
    Min,
    Max,
    CountAll,
    CountAny,
    Concat,
    First,
    Last,
    FirstInclNull,
    LastInclNull,
}

impl AggregateKind {
    pub fn needs_field(self) -> bool {
        !matches!(self, Self::CountAll)
    }

    /// Output type for a source field of type `source`, or why the pair is invalid.
    pub fn output_type(self, source: Option<ValueType>) -> std::result::Result<ValueType, String> {
        use ValueType as T;
        let numeric_source = |s: Option<T>| match s {
            Some(t @ (T::Integer | T::Number | T::Decimal | T::String)) => Ok(t),
            Some(other) => Err(format!("{self:?} needs a numeric or string field, got {other}")),
            None => Err(format!("{self:?} needs a source field")),
        };
        match self {
            Self::Sum => Ok(match numeric_source(source)? {
                T::Integer => T::Integer,
                T::Decimal => T::Decimal,
                _ => T::Number,
            }),
            Self::Average => Ok(match numeric_source(source)? {
                T::Decimal => T::Decimal,
                _ => T::Number,
            }),
            Self::CountAll | Self::CountAny => Ok(T::Integer),
            Self::Concat => match source {
                Some(T::Binary) => Err("concat cannot join binary fields".to_string()),
                _ => Ok(T::String),
            },
            Self::Min | Self::Max => match source {
                Some(T::Binary) => Err(format!("{self:?} cannot order binary fields")),
                Some(t) => Ok(t),
                None => Err(format!("{self:?} needs a source field")),
            },
            Self::First | Self::Last | Self::FirstInclNull | Self::LastInclNull => {
                source.ok_or_else(|| format!("{self:?} needs a source field"))
            }
        }
    }
}

/// Resolved aggregate: kind, source column, and output type.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub kind: AggregateKind,
    pub field: Option<usize>,
    pub output_type: ValueType,
    pub separator: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggState {
    SumInteger(Option<i64>),
    SumNumber(Option<f64>),
    SumDecimal(Option<Decimal>),
    AverageNumber { sum: f64, count: u64 },
    AverageDecimal { sum: Decimal, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(i64),
    Concat(Option<String>),
    /// `Some` once a value was chosen; the chosen value may itself be null.
    First(Option<Value>),
    Last(Option<Value>),
}

/// A converted update, ready to commit.
#[derive(Debug)]
pub enum Update {
    Keep,
    SumInteger(i64),
    SumNumber(f64),
    SumDecimal(Decimal),
    AverageNumber(f64),
    AverageDecimal(Decimal),
    Replace(Value),
    Count,
    Append(String),
}

pub fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs.iter().map(AggState::new).collect()
}

impl AggState {
    pub fn new(spec: &AggSpec) -> Self {
        match (spec.kind, spec.output_type) {
            (AggregateKind::Sum, ValueType::Integer) => Self::SumInteger(None),
            (AggregateKind::Sum, ValueType::Decimal) => Self::SumDecimal(None),
            (AggregateKind::Sum, _) => Self::SumNumber(None),
            (AggregateKind::Average, ValueType::Decimal) => Self::AverageDecimal {
                sum: Decimal::ZERO,
                count: 0,
            },
            (AggregateKind::Average, _) => Self::AverageNumber { sum: 0.0, count: 0 },
            (AggregateKind::Min, _) => Self::Min(None),
            (AggregateKind::Max, _) => Self::Max(None),
            (AggregateKind::CountAll | AggregateKind::CountAny, _) => Self::Count(0),
            (AggregateKind::Concat, _) => Self::Concat(None),
            (AggregateKind::First | AggregateKind::FirstInclNull, _) => Self::First(None),
            (AggregateKind::Last | AggregateKind::LastInclNull, _) => Self::Last(None),
        }
    }

    /// Compute the update for `value` (read from column `field`) without changing state.
    pub fn prepare(&self, spec: &AggSpec, value: &Value) -> Result<Update> {
        let field = spec.field;
        if matches!(spec.kind, AggregateKind::CountAll) {
            return Ok(Update::Count);
        }
        let include_null = matches!(
            spec.kind,
            AggregateKind::FirstInclNull | AggregateKind::LastInclNull
        );
        if value.is_null() && !include_null {
            return Ok(Update::Keep);
        }

        let update = match self {
            Self::SumInteger(acc) => {
                let v = to_integer(value, field)?;
                let total = acc.unwrap_or(0).checked_add(v).ok_or_else(|| {
                    RowflowError::conversion(
                        field,
                        "SUM_OVERFLOW",
                        format!("integer sum overflows adding {v}"),
                    )
                })?;
                Update::SumInteger(total)
            }
            Self::SumNumber(_) => Update::SumNumber(to_number(value, field)?),
            Self::SumDecimal(acc) => {
                let v = to_decimal(value, field)?;
                let total = acc.unwrap_or(Decimal::ZERO).checked_add(v).ok_or_else(|| {
                    RowflowError::conversion(field, "SUM_OVERFLOW", "decimal sum overflows")
                })?;
                Update::SumDecimal(total)
            }
            Self::AverageNumber { .. } => Update::AverageNumber(to_number(value, field)?),
            Self::AverageDecimal { sum, .. } => {
                let v = to_decimal(value, field)?;
                let total = sum.checked_add(v).ok_or_else(|| {
                    RowflowError::conversion(field, "SUM_OVERFLOW", "decimal sum overflows")
                })?;
                Update::AverageDecimal(total)
            }
            Self::Min(cur) => match cur {
                Some(existing) if compare(value, existing, field)? != Ordering::Less => {
                    Update::Keep
                }
                _ => Update::Replace(value.clone()),
            },
            Self::Max(cur) => match cur {
                Some(existing) if compare(value, existing, field)? != Ordering::Greater => {
                    Update::Keep
                }
                _ => Update::Replace(value.clone()),
            },
            Self::Count(_) => Update::Count,
            Self::Concat(_) => Update::Append(value.to_string()),
            Self::First(Some(_)) => Update::Keep,
            Self::First(None) | Self::Last(_) => Update::Replace(value.clone()),
        };
        Ok(update)
    }

    pub fn apply(&mut self, spec: &AggSpec, update: Update) {
        match (self, update) {
            (_, Update::Keep) => {}
            (Self::SumInteger(acc), Update::SumInteger(total)) => *acc = Some(total),
            (Self::SumNumber(acc), Update::SumNumber(v)) => *acc = Some(acc.unwrap_or(0.0) + v),
            (Self::SumDecimal(acc), Update::SumDecimal(total)) => *acc = Some(total),
            (Self::AverageNumber { sum, count }, Update::AverageNumber(v)) => {
                *sum += v;
                *count += 1;
            }
            (Self::AverageDecimal { sum, count }, Update::AverageDecimal(total)) => {
                *sum = total;
                *count += 1;
            }
            (Self::Min(cur) | Self::Max(cur), Update::Replace(v)) => *cur = Some(v),
            (Self::First(cur) | Self::Last(cur), Update::Replace(v)) => *cur = Some(v),
            (Self::Count(n), Update::Count) => *n = n.saturating_add(1),
            (Self::Concat(acc), Update::Append(s)) => match acc {
                Some(joined) => {
                    joined.push_str(&spec.separator);
                    joined.push_str(&s);
                }
                None => *acc = Some(s),
            },
            _ => {}
        }
    }

    /// Current value: running while the group is open, final once it closed.
    pub fn value(&self) -> Value {
        match self {
            Self::SumInteger(v) => v.map_or(Value::Null, Value::Integer),
            Self::SumNumber(v) => v.map_or(Value::Null, Value::Number),
            Self::SumDecimal(v) => v.map_or(Value::Null, Value::Decimal),
            Self::AverageNumber { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Number(sum / *count as f64)
                }
            }
            Self::AverageDecimal { sum, count } => {
                if *count == 0 {
                    return Value::Null;
                }
                Decimal::from_u64(*count)
                    .and_then(|c| sum.checked_div(c))
                    .map_or(Value::Null, Value::Decimal)
            }
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.clone().unwrap_or(Value::Null)
            }
            Self::Count(n) => Value::Integer(*n),
            Self::Concat(v) => v.clone().map_or(Value::Null, Value::String),
        }
    }
}

fn not_a_number(field: Option<usize>, value: &Value) -> RowflowError {
    RowflowError::conversion(
        field,
        "CONV_NUMBER",
        format!("cannot convert '{value}' to a number"),
    )
}

fn to_integer(value: &Value, field: Option<usize>) -> Result<i64> {
    match value {
        Value::Integer(v) => Ok(*v),
        Value::String(s) => s.trim().parse().map_err(|_| not_a_number(field, value)),
        _ => Err(not_a_number(field, value)),
    }
}

fn to_number(value: &Value, field: Option<usize>) -> Result<f64> {
    match value {
        Value::String(s) => s.trim().parse().map_err(|_| not_a_number(field, value)),
        other => other.to_f64().ok_or_else(|| not_a_number(field, value)),
    }
}

fn to_decimal(value: &Value, field: Option<usize>) -> Result<Decimal> {
    match value {
        Value::Decimal(d) => Ok(*d),
        Value::Integer(v) => Ok(Decimal::from(*v)),
        Value::Number(v) => Decimal::from_f64(*v).ok_or_else(|| not_a_number(field, value)),
        Value::String(s) => s.trim().parse().map_err(|_| not_a_number(field, value)),
        _ => Err(not_a_number(field, value)),
    }
}

fn compare(a: &Value, b: &Value, field: Option<usize>) -> Result<Ordering> {
    a.compare(b).ok_or_else(|| {
        RowflowError::conversion(
            field,
            "CONV_COMPARE",
            format!("cannot compare '{a}' with '{b}'"),
        )
    })
}
