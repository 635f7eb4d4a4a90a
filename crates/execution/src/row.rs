//! Typed values, rows, and row schemas.
//!
//! A [`Row`] is an ordered tuple of [`Value`]s following a [`Schema`]. Rows move by value
//! through channels, so once emitted nobody else can mutate them.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rowflow_common::{Result, RowflowError};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Integer,
    Number,
    Decimal,
    String,
    Date,
    Boolean,
    Binary,
}

impl ValueType {
    /// Integer, number, or decimal.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Number | Self::Decimal)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Decimal => "decimal",
            Self::String => "string",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// One typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Number(f64),
    Decimal(Decimal),
    String(String),
    Date(NaiveDateTime),
    Boolean(bool),
    Binary(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Runtime type of this value; `None` for null.
    #[must_use]
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::Null => None,
            Self::Integer(_) => Some(ValueType::Integer),
            Self::Number(_) => Some(ValueType::Number),
            Self::Decimal(_) => Some(ValueType::Decimal),
            Self::String(_) => Some(ValueType::String),
            Self::Date(_) => Some(ValueType::Date),
            Self::Boolean(_) => Some(ValueType::Boolean),
            Self::Binary(_) => Some(ValueType::Binary),
        }
    }

    /// Numeric view of integer/number/decimal values.
    #[must_use]
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Number(v) => Some(*v),
            Self::Decimal(v) => v.to_f64(),
            _ => None,
        }
    }

    /// Total order used by min/max and sorting checks.
    ///
    /// Null sorts before everything and NaN sorts after every other number. Integer, number,
    /// and decimal compare numerically with each other; any other cross-type comparison
    /// returns `None`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Number(a), Self::Number(b)) => Some(a.total_cmp(b)),
            (Self::Decimal(a), Self::Decimal(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (a, b) => match (a.to_f64(), b.to_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Whether two key tuples are equal under [`Value::compare`], so null equals null and NaN
    /// equals NaN.
    #[must_use]
    pub fn same_key(a: &[Value], b: &[Value]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b)
                .all(|(x, y)| x.compare(y) == Some(Ordering::Equal))
    }

    /// Parse a JSON literal as a value of the declared type.
    pub fn from_json(json: &serde_json::Value, ty: ValueType) -> Result<Self> {
        use serde_json::Value as Json;

        let invalid = || {
            RowflowError::InvalidConfig(format!("cannot read {json} as a {ty} value"))
        };
        if json.is_null() {
            return Ok(Self::Null);
        }
        let value = match ty {
            ValueType::Integer => match json {
                Json::Number(n) => Self::Integer(n.as_i64().ok_or_else(invalid)?),
                Json::String(s) => Self::Integer(s.trim().parse().map_err(|_| invalid())?),
                _ => return Err(invalid()),
            },
            ValueType::Number => match json {
                Json::Number(n) => Self::Number(n.as_f64().ok_or_else(invalid)?),
                Json::String(s) => Self::Number(s.trim().parse().map_err(|_| invalid())?),
                _ => return Err(invalid()),
            },
            ValueType::Decimal => match json {
                Json::Number(n) => Self::Decimal(parse_decimal(&n.to_string()).ok_or_else(invalid)?),
                Json::String(s) => Self::Decimal(parse_decimal(s.trim()).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            },
            ValueType::String => match json {
                Json::String(s) => Self::String(s.clone()),
                other => Self::String(other.to_string()),
            },
            ValueType::Date => match json {
                Json::String(s) => Self::Date(parse_date(s).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            },
            ValueType::Boolean => match json {
                Json::Bool(b) => Self::Boolean(*b),
                Json::String(s) => match s.to_ascii_lowercase().as_str() {
                    "y" | "yes" | "true" => Self::Boolean(true),
                    "n" | "no" | "false" => Self::Boolean(false),
                    _ => return Err(invalid()),
                },
                _ => return Err(invalid()),
            },
            ValueType::Binary => match json {
                Json::String(s) => Self::Binary(s.as_bytes().to_vec()),
                Json::Array(items) => Self::Binary(
                    items
                        .iter()
                        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(invalid)?,
                ),
                _ => return Err(invalid()),
            },
        };
        Ok(value)
    }

    /// Plain JSON rendering: decimals and dates as strings, binary as a byte array.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Integer(v) => Json::from(*v),
            Self::Number(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Self::Decimal(v) => Json::String(v.to_string()),
            Self::String(v) => Json::String(v.clone()),
            Self::Date(_) => Json::String(self.to_string()),
            Self::Boolean(v) => Json::Bool(*v),
            Self::Binary(v) => Json::from(v.clone()),
        }
    }
}

/// Plain or exponent notation, e.g. `12.50` or `1e5`.
fn parse_decimal(s: &str) -> Option<Decimal> {
    s.parse()
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0_u8.hash(state),
            Self::Integer(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Number(v) => {
                2_u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Decimal(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::String(v) => {
                4_u8.hash(state);
                v.hash(state);
            }
            Self::Date(v) => {
                5_u8.hash(state);
                v.hash(state);
            }
            Self::Boolean(v) => {
                6_u8.hash(state);
                v.hash(state);
            }
            Self::Binary(v) => {
                7_u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Date(v) => write!(f, "{}", v.format(DATE_TIME_FORMAT)),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Binary(v) => {
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Name, type, length, and precision of one schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub precision: Option<u32>,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            length: None,
            precision: None,
        }
    }

    #[must_use]
    pub fn with_length_precision(mut self, length: Option<u32>, precision: Option<u32>) -> Self {
        self.length = length;
        self.precision = precision;
        self
    }
}

/// Ordered field list shared by every row on one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldMeta>,
}

/// Shared schema handle.
pub type SchemaRef = Arc<Schema>;

impl Schema {
    pub fn new(fields: Vec<FieldMeta>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &FieldMeta {
        &self.fields[index]
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Like [`Schema::index_of`], but a missing field is a configuration error.
    pub fn require_index(&self, name: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| {
            RowflowError::InvalidConfig(format!(
                "field '{name}' not found in input row (available: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// This schema followed by `extra` fields.
    #[must_use]
    pub fn appended(&self, extra: impl IntoIterator<Item = FieldMeta>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }

    /// Whether `row` has this schema's arity and every non-null value matches its field type.
    pub fn accepts(&self, row: &Row) -> bool {
        row.len() == self.fields.len()
            && row
                .values()
                .iter()
                .zip(&self.fields)
                .all(|(v, f)| v.value_type().is_none_or(|t| t == f.value_type))
    }
}

/// One ordered tuple of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Consume the row and return it with `extra` values appended.
    #[must_use]
    pub fn appended(mut self, extra: impl IntoIterator<Item = Value>) -> Self {
        self.values.extend(extra);
        self
    }

    /// Clone the values at `indexes`, in that order. Out-of-range indexes yield null.
    pub fn project(&self, indexes: &[usize]) -> Vec<Value> {
        indexes
            .iter()
            .map(|&i| self.values.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use rust_decimal::Decimal;

    use super::{FieldMeta, Row, Schema, Value, ValueType};

    #[test]
    fn numeric_values_compare_across_types() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Number(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Decimal(Decimal::new(25, 1)).compare(&Value::Number(2.5)),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::Null.compare(&Value::Integer(0)), Some(Ordering::Less));
        assert_eq!(Value::from("a").compare(&Value::Integer(1)), None);
    }

    #[test]
    fn parses_json_literals_per_declared_type() {
        let v = Value::from_json(&serde_json::json!("2024-02-29"), ValueType::Date)
            .expect("date literal");
        assert_eq!(v.to_string(), "2024-02-29 00:00:00");
        let v = Value::from_json(&serde_json::json!("12.50"), ValueType::Decimal)
            .expect("decimal literal");
        assert_eq!(v, Value::Decimal(Decimal::new(1250, 2)));
        assert_eq!(
            Value::from_json(&serde_json::Value::Null, ValueType::Integer).expect("null"),
            Value::Null
        );
        assert!(Value::from_json(&serde_json::json!("x"), ValueType::Integer).is_err());
    }

    #[test]
    fn decimal_literals_accept_exponents() {
        let v = Value::from_json(&serde_json::json!("1.5e3"), ValueType::Decimal)
            .expect("string exponent");
        assert_eq!(v, Value::Decimal(Decimal::new(1500, 0)));
        let v = Value::from_json(&serde_json::json!(1e25), ValueType::Decimal)
            .expect("number exponent");
        assert_eq!(
            v,
            Value::Decimal(Decimal::from_i128_with_scale(10_i128.pow(25), 0))
        );
        assert!(Value::from_json(&serde_json::json!("1e"), ValueType::Decimal).is_err());
    }

    #[test]
    fn nan_keys_match_each_other() {
        let nan = || vec![Value::from("A"), Value::Number(f64::NAN)];
        assert!(Value::same_key(&nan(), &nan()));
        assert!(Value::same_key(&[Value::Null], &[Value::Null]));
        assert!(!Value::same_key(&nan(), &[Value::from("A"), Value::Number(1.0)]));
        assert_eq!(
            Value::Number(f64::NAN).compare(&Value::Number(f64::INFINITY)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn renders_plain_json() {
        assert_eq!(Value::Integer(3).to_json(), serde_json::json!(3));
        assert_eq!(Value::Decimal(Decimal::new(1250, 2)).to_json(), serde_json::json!("12.50"));
        assert_eq!(Value::Number(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Binary(vec![1, 2]).to_json(), serde_json::json!([1, 2]));
    }

    #[test]
    fn schema_lookup_and_append() {
        let schema = Schema::new(vec![
            FieldMeta::new("k", ValueType::String),
            FieldMeta::new("v", ValueType::Integer),
        ]);
        assert_eq!(schema.index_of("v"), Some(1));
        let err = schema.require_index("missing").expect_err("missing field");
        assert!(err.to_string().contains("k, v"));

        let wider = schema.appended([FieldMeta::new("sum_v", ValueType::Integer)]);
        assert_eq!(wider.names(), vec!["k", "v", "sum_v"]);
        assert!(wider.accepts(&Row::new(vec![
            Value::from("A"),
            Value::Null,
            Value::Integer(3)
        ])));
        assert!(!wider.accepts(&Row::new(vec![Value::from("A")])));
    }

    #[test]
    fn appended_row_keeps_original_values_first() {
        let row = Row::new(vec![Value::from("A"), Value::Integer(1)]).appended([Value::Integer(6)]);
        assert_eq!(row.values()[2], Value::Integer(6));
        assert_eq!(row.project(&[2, 0, 9]), vec![
            Value::Integer(6),
            Value::from("A"),
            Value::Null
        ]);
    }
}
