use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    io::{self, Write},
};

use crate::{runtime::DeclaredBlock, template::CompiledTemplate};

/// A runtime value flowing through expressions, contexts and resolvers.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A block captured by `@declare`, callable from expressions.
    #[cfg_attr(feature = "serde", serde(skip))]
    Block(DeclaredBlock),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
            Self::Block(_) => true,
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Block(_) => "block",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Null
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::List(_)
            | Self::Map(_)
            | Self::Block(_) => None,
        }
    }

    /// Looks up a field on a map value.
    pub fn get(&self, field: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(field),
            Self::Null
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::String(_)
            | Self::List(_)
            | Self::Block(_) => None,
        }
    }

    /// Builds a map value from name/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (idx, (key, item)) in map.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                f.write_str("}")
            }
            Self::Block(block) => write!(f, "<block {}>", block.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(value: BTreeMap<String, Self>) -> Self {
        Self::Map(value)
    }
}

/// A layer of variable lookup sitting beneath the template's own scopes.
///
/// Returning `true` from [`VariableResolver::assign`] claims the assignment;
/// otherwise the variable is defined in the template's innermost scope.
pub trait VariableResolver {
    fn resolve(&self, name: &str) -> Option<Value>;

    fn assign(&mut self, _name: &str, _value: &Value) -> bool {
        false
    }
}

/// A map-backed resolver. Top-level assignments made by a template are
/// written back into the map.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapResolver {
    vars: BTreeMap<String, Value>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: Into<String>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn get<T: AsRef<str>>(&self, name: T) -> Option<&Value> {
        self.vars.get(name.as_ref())
    }

    pub fn contains<T: AsRef<str>>(&self, name: T) -> bool {
        self.vars.contains_key(name.as_ref())
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.vars
    }
}

impl VariableResolver for MapResolver {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned()
    }

    fn assign(&mut self, name: &str, value: &Value) -> bool {
        self.vars.insert(name.to_string(), value.clone());
        true
    }
}

impl VariableResolver for HashMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Destination for rendered text.
pub trait OutputSink {
    fn append(&mut self, text: &str) -> io::Result<()>;
}

impl OutputSink for String {
    fn append(&mut self, text: &str) -> io::Result<()> {
        self.push_str(text);
        Ok(())
    }
}

/// Streams rendered text into any [`io::Write`].
#[derive(Debug)]
pub struct WriteSink<W: Write> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> OutputSink for WriteSink<W> {
    fn append(&mut self, text: &str) -> io::Result<()> {
        self.inner.write_all(text.as_bytes())
    }
}

/// Resolves logical names to compiled templates for `@includeNamed`.
pub trait TemplateRegistry {
    fn lookup(&self, name: &str) -> Option<CompiledTemplate>;
}

impl TemplateRegistry for HashMap<String, CompiledTemplate> {
    fn lookup(&self, name: &str) -> Option<CompiledTemplate> {
        self.get(name).cloned()
    }
}

impl TemplateRegistry for BTreeMap<String, CompiledTemplate> {
    fn lookup(&self, name: &str) -> Option<CompiledTemplate> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("false").is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::from(vec![1]).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::from(vec![1, 2]).to_string(), "[1, 2]");
        assert_eq!(
            Value::map([("a", Value::Int(1)), ("b", Value::from("x"))]).to_string(),
            "{a: 1, b: x}"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_map_resolver_accepts_assignments() {
        let mut resolver = MapResolver::new();
        resolver.insert("a", 1);
        assert!(resolver.assign("b", &Value::Int(2)));
        assert_eq!(resolver.resolve("a"), Some(Value::Int(1)));
        assert_eq!(resolver.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_write_sink_streams_bytes() {
        let mut sink = WriteSink::new(Vec::new());
        sink.append("héllo").unwrap();
        sink.append("!").unwrap();
        assert_eq!(sink.into_inner(), "héllo!".as_bytes());
    }
}
