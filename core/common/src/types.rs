//! Common types used throughout OfflineKit.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A stored record: field name to JSON value, in insertion order.
pub type Row = serde_json::Map<String, Value>;

/// Character reserved for scratch database names.
const RESERVED: char = '~';

/// Name of a local database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Create a new DatabaseName from a string.
    ///
    /// # Errors
    /// - Returns error if name is empty
    /// - Returns error if name contains the reserved `~`
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Database name cannot be empty".to_string(),
            ));
        }
        if name.contains(RESERVED) {
            return Err(crate::Error::InvalidInput(format!(
                "Database name '{}' cannot contain '{}'",
                name, RESERVED
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the scratch database used while this one is recreated.
    ///
    /// No name accepted by [`DatabaseName::new`] can collide with it.
    pub fn temp(&self) -> Self {
        Self(format!("{}{}recreate", self.0, RESERVED))
    }
}

impl<'de> Deserialize<'de> for DatabaseName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        DatabaseName::new(name).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primary key value.
///
/// Keys are totally ordered: every number sorts before every string,
/// numbers compare numerically and strings lexicographically. Integral
/// numbers are held exactly, so 64-bit server identifiers never collide,
/// and keys serialize as their JSON value.
#[derive(Debug, Clone)]
pub enum Key {
    /// Integral number, including integral floats such as `1.0`.
    Integer(i128),
    /// Number with a fractional part.
    Float(f64),
    Text(String),
}

/// Largest magnitude below which an integral float converts to `i128` exactly.
const EXACT_FLOAT_LIMIT: f64 = 1.0e36;

impl Key {
    /// Build a key from a JSON value.
    ///
    /// # Errors
    /// - Value is not a number or a string
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i128::from(i)))
                } else if let Some(u) = n.as_u64() {
                    Ok(Self::Integer(i128::from(u)))
                } else {
                    n.as_f64().map(Self::float).ok_or_else(|| {
                        crate::Error::InvalidInput(format!("Unrepresentable key value: {}", n))
                    })
                }
            }
            Value::String(s) => Ok(Self::Text(s.clone())),
            other => Err(crate::Error::InvalidInput(format!(
                "Unsupported primary key value: {}",
                other
            ))),
        }
    }

    /// Read the key stored under `field` in a row.
    ///
    /// # Errors
    /// - Field is absent or holds a value that cannot be a key
    pub fn from_row(row: &Row, field: &str) -> crate::Result<Self> {
        let value = row.get(field).ok_or_else(|| {
            crate::Error::InvalidInput(format!("Row has no primary key field '{}'", field))
        })?;
        Self::from_value(value)
    }

    fn float(n: f64) -> Self {
        // Integral floats (and -0.0) are the same key as the integer.
        if n.fract() == 0.0 && n.abs() < EXACT_FLOAT_LIMIT {
            Self::Integer(n as i128)
        } else {
            Self::Float(n)
        }
    }

    /// Convert back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Integer(i) => {
                if let Ok(i) = i64::try_from(*i) {
                    Value::from(i)
                } else if let Ok(u) = u64::try_from(*i) {
                    Value::from(u)
                } else {
                    float_value(*i as f64)
                }
            }
            Key::Float(n) => float_value(*n),
            Key::Text(s) => Value::String(s.clone()),
        }
    }

    /// Get the string value, if this is a text key.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Integer(i) => Some(*i as f64),
            Key::Float(n) => Some(*n),
            Key::Text(_) => None,
        }
    }
}

fn float_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Integer(a), Key::Integer(b)) => a.cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Text(_), _) => Ordering::Greater,
            (_, Key::Text(_)) => Ordering::Less,
            // A fractional float never equals an integer.
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => Ordering::Equal,
            },
        }
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Key::Integer(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            Key::Float(n) => {
                1u8.hash(state);
                n.to_bits().hash(state);
            }
            Key::Text(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Integer(i) => write!(f, "{}", i),
            Key::Float(_) => write!(f, "{}", self.to_value()),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Integer(i128::from(value))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Key::Integer(i128::from(value))
    }
}

/// True when a field is absent, null or an empty string.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_database_name_empty_fails() {
        assert!(DatabaseName::new("").is_err());
        assert!(DatabaseName::new("  ").is_err());
    }

    #[test]
    fn test_database_name_temp() {
        let name = DatabaseName::new("orders").unwrap();
        assert_eq!(name.temp().as_str(), "orders~recreate");
        assert!(DatabaseName::new(name.temp().as_str()).is_err());
        assert!(DatabaseName::new("orders_tmp").is_ok());
        assert!(serde_json::from_str::<DatabaseName>(r#""a~b""#).is_err());
    }

    #[test]
    fn test_key_from_value() {
        assert_eq!(Key::from_value(&json!(1)).unwrap(), Key::from(1i64));
        assert_eq!(Key::from_value(&json!("a")).unwrap(), Key::from("a"));
        assert!(Key::from_value(&json!(null)).is_err());
        assert!(Key::from_value(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_key_integer_round_trip() {
        let key = Key::from_value(&json!(42)).unwrap();
        assert_eq!(key.to_value(), json!(42));
        assert_eq!(key.to_string(), "42");
    }

    #[test]
    fn test_negative_zero_is_zero() {
        let a = Key::from_value(&json!(-0.0)).unwrap();
        let b = Key::from_value(&json!(0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_large_integer_keys_stay_distinct() {
        let a = Key::from_value(&json!(9_007_199_254_740_992u64)).unwrap();
        let b = Key::from_value(&json!(9_007_199_254_740_993u64)).unwrap();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(b.to_value(), json!(9_007_199_254_740_993u64));

        let max = Key::from(u64::MAX);
        assert!(Key::from(i64::MAX) < max);
        assert_eq!(max.to_value(), json!(u64::MAX));
        assert_eq!(max.to_string(), u64::MAX.to_string());
    }

    #[test]
    fn test_integral_float_is_integer_key() {
        let float = Key::from_value(&json!(1.0)).unwrap();
        assert_eq!(float, Key::from(1i64));
        assert_eq!(float.to_value(), json!(1));

        let half = Key::from_value(&json!(1.5)).unwrap();
        assert!(Key::from(1i64) < half && half < Key::from(2i64));
        assert_eq!(half.to_value(), json!(1.5));
    }

    #[test]
    fn test_key_serde() {
        let keys = vec![Key::from(3i64), Key::from("u1")];
        let text = serde_json::to_string(&keys).unwrap();
        assert_eq!(text, r#"[3,"u1"]"#);
        let back: Vec<Key> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, keys);
        assert!(serde_json::from_str::<Key>("null").is_err());
    }

    #[test]
    fn test_key_from_row() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!("u1"));
        assert_eq!(Key::from_row(&row, "id").unwrap(), Key::from("u1"));
        assert!(Key::from_row(&row, "missing").is_err());
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&json!(null))));
        assert!(is_blank(Some(&json!(""))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!("x"))));
    }

    proptest! {
        #[test]
        fn prop_number_keys_follow_integer_order(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            prop_assert_eq!(Key::from(a).cmp(&Key::from(b)), a.cmp(&b));
        }

        #[test]
        fn prop_text_keys_follow_string_order(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
            prop_assert_eq!(Key::from(a.as_str()).cmp(&Key::from(b.as_str())), a.cmp(&b));
        }

        #[test]
        fn prop_numbers_sort_before_text(n in any::<i64>(), s in ".*") {
            prop_assert!(Key::from(n) < Key::from(s));
        }
    }
}
