// Constraints attached to relation definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A literal value usable as a default or a constraint operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Render as an SQL literal, quoting text.
    pub fn to_sql(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => quote(s),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Quote `s` as an SQL string literal.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Right-hand side of a boundary comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundValue {
    Literal(Literal),
    /// Another attribute of the same entity.
    Attribute(String),
    Now,
    Today,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "=")]
    Eq,
}

impl BoundOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "=",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "=" | "==" => Some(Self::Eq),
            _ => None,
        }
    }
}

/// Constraint on the values of a relation definition.
///
/// Only `Size`, `Unique`, `Boundary`, `Interval` and `StaticVocabulary` have a
/// physical counterpart; `Format` and `Rql` are enforced by the application
/// layer and merely persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Size {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<u32>,
    },
    Unique,
    Boundary {
        op: BoundOp,
        value: BoundValue,
    },
    Interval {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<BoundValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<BoundValue>,
    },
    StaticVocabulary {
        values: Vec<Literal>,
    },
    Format {
        regexp: String,
    },
    Rql {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mainvars: Option<String>,
    },
}

/// Constraint kinds of which a relation definition may carry at most one.
pub const SINGLE_INSTANCE_KINDS: [&str; 3] = [
    "SizeConstraint",
    "FormatConstraint",
    "StaticVocabularyConstraint",
];

impl Constraint {
    /// Persisted type name (`CWConstraint.cstrtype`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Size { .. } => "SizeConstraint",
            Self::Unique => "UniqueConstraint",
            Self::Boundary { .. } => "BoundaryConstraint",
            Self::Interval { .. } => "IntervalBoundConstraint",
            Self::StaticVocabulary { .. } => "StaticVocabularyConstraint",
            Self::Format { .. } => "FormatConstraint",
            Self::Rql { .. } => "RQLConstraint",
        }
    }

    /// JSON form stored in `CWConstraint.value`.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn deserialize(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }

    pub fn max_size(&self) -> Option<u32> {
        match self {
            Self::Size { max, .. } => *max,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_single_quotes() {
        assert_eq!(quote("it's"), "'it''s'");
        assert_eq!(Literal::Text("a".into()).to_sql(), "'a'");
        assert_eq!(Literal::Int(4).to_sql(), "4");
    }

    #[test]
    fn json_form_is_tagged_by_kind() {
        let c = Constraint::Boundary {
            op: BoundOp::Ge,
            value: BoundValue::Literal(Literal::Int(0)),
        };
        let json = c.serialize();
        assert_eq!(json, r#"{"kind":"boundary","op":">=","value":{"literal":0}}"#);
        assert_eq!(Constraint::deserialize(&json), Some(c));
        assert_eq!(
            Constraint::deserialize(r#"{"kind":"interval","max":"today"}"#),
            Some(Constraint::Interval {
                min: None,
                max: Some(BoundValue::Today)
            })
        );
    }

    #[test]
    fn vocabulary_keeps_value_types() {
        let c = Constraint::StaticVocabulary {
            values: vec![Literal::Text("draft".into()), Literal::Int(3)],
        };
        assert_eq!(Constraint::deserialize(&c.serialize()), Some(c));
    }
}
