use std::fmt;

use serde_json::Value as JsonValue;

use crate::error::GuestError;

/// A structural host-side clone of a guest value.
///
/// Object entries preserve the guest's insertion order. Values with no host
/// shape (functions, symbols) dump as [`GuestValue::Opaque`] and cannot be
/// marshalled back into the guest.
#[derive(Clone, Debug, PartialEq)]
pub enum GuestValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<GuestValue>),
    Object(Vec<(String, GuestValue)>),
    Error(GuestError),
    Opaque(&'static str),
}

impl GuestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GuestValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GuestValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Fetch an object entry by key.
    pub fn get(&self, key: &str) -> Option<&GuestValue> {
        match self {
            GuestValue::Object(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            },
            _ => None,
        }
    }
}

impl From<JsonValue> for GuestValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => GuestValue::Null,
            JsonValue::Bool(b) => GuestValue::Bool(b),
            JsonValue::Number(n) => GuestValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => GuestValue::String(s),
            JsonValue::Array(items) => {
                GuestValue::Array(items.into_iter().map(GuestValue::from).collect())
            },
            JsonValue::Object(entries) => GuestValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, GuestValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Format a number the way the guest prints it: integral values without a
/// fractional part, everything else through Rust's shortest-roundtrip float
/// formatting.
fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}Infinity", if n < 0.0 { "-" } else { "" })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestValue::Undefined => write!(f, "undefined"),
            GuestValue::Null => write!(f, "null"),
            GuestValue::Bool(b) => write!(f, "{b}"),
            GuestValue::Number(n) => write_number(f, *n),
            GuestValue::String(s) => write!(f, "{s}"),
            GuestValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_nested(f, item)?;
                }
                write!(f, "]")
            },
            GuestValue::Object(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: ")?;
                    write_nested(f, value)?;
                }
                write!(f, "}}")
            },
            GuestValue::Error(e) => write!(f, "{e}"),
            GuestValue::Opaque(kind) => write!(f, "[{kind}]"),
        }
    }
}

// Strings nested inside arrays and objects print quoted, as the guest's own
// console would show them.
fn write_nested(f: &mut fmt::Formatter<'_>, value: &GuestValue) -> fmt::Result {
    match value {
        GuestValue::String(s) => write!(f, "{s:?}"),
        other => write!(f, "{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::GuestValue;

    #[test]
    fn test_display() {
        assert_eq!(GuestValue::Number(3.0).to_string(), "3");
        assert_eq!(GuestValue::Number(2.5).to_string(), "2.5");
        assert_eq!(GuestValue::String("hi".to_string()).to_string(), "hi");
        assert_eq!(
            GuestValue::Array(vec![
                GuestValue::Number(1.0),
                GuestValue::String("a".to_string()),
            ])
            .to_string(),
            r#"[1, "a"]"#
        );
        assert_eq!(
            GuestValue::Object(vec![("x".to_string(), GuestValue::Bool(true))]).to_string(),
            "{x: true}"
        );
    }

    #[test]
    fn test_object_get() {
        let v = GuestValue::Object(vec![
            ("a".to_string(), GuestValue::Number(1.0)),
            ("b".to_string(), GuestValue::Number(2.0)),
        ]);
        assert_eq!(v.get("b"), Some(&GuestValue::Number(2.0)));
        assert_eq!(v.get("c"), None);
    }
}
