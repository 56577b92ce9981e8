//! Search expression builder.
//!
//! Remote collections are filtered with a small expression language:
//! `field = "value" AND other = 2`. [`Filter`] keeps its terms in insertion
//! order so the rendered expression is stable for a given input.

use std::fmt;

/// Default page size for searches.
pub const DEFAULT_PER_PAGE: u32 = 1000;

/// Comparison used for every term of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    /// `field = value`
    #[default]
    Equals,
    /// `field != value`
    NotEquals,
    /// `field ~ value` (substring match)
    Like,
}

impl Operator {
    fn token(self) -> &'static str {
        match self {
            Self::Equals => " = ",
            Self::NotEquals => " != ",
            Self::Like => " ~ ",
        }
    }
}

/// A filter value. Numbers are rendered bare, everything else quoted with
/// embedded backslashes and quotes escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Number(i64),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => {
                let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{escaped}\"")
            }
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&String> for FilterValue {
    fn from(s: &String) -> Self {
        Self::Text(s.clone())
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for FilterValue {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

impl From<u64> for FilterValue {
    fn from(n: u64) -> Self {
        Self::Number(n as i64)
    }
}

impl FilterValue {
    /// Convert a JSON scalar. Objects and arrays are not searchable.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .or_else(|| Some(Self::Text(n.to_string()))),
            serde_json::Value::Bool(b) => Some(Self::Text(b.to_string())),
            _ => None,
        }
    }
}

/// Rendered search parameters, ready for the `search` and `per_page`
/// query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub search: String,
    pub per_page: u32,
}

/// Ordered set of field filters joined with `AND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    terms: Vec<(String, FilterValue)>,
    operator: Operator,
    per_page: u32,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            terms: Vec::new(),
            operator: Operator::Equals,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on a single field.
    pub fn by(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new().with(field, value)
    }

    /// Add a term. Setting a field twice replaces the value in place.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FilterValue>) {
        let field = field.into();
        let value = value.into();
        match self.terms.iter_mut().find(|(f, _)| *f == field) {
            Some(term) => term.1 = value,
            None => self.terms.push((field, value)),
        }
    }

    pub fn operator(mut self, operator: Operator) -> Self {
        self.operator = operator;
        self
    }

    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Render the search expression.
    pub fn build(&self) -> SearchQuery {
        let token = self.operator.token();
        let search = self
            .terms
            .iter()
            .map(|(field, value)| format!("{field}{token}{value}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        SearchQuery {
            search,
            per_page: self.per_page,
        }
    }
}
