//! Typed values carried by detection items.
//!
//! Sigma string values interpret `*` as a multi-character wildcard, `?` as a
//! single-character wildcard, and `\` as the escape character. The parsed
//! structure is preserved so backends can apply their own wildcard and escape
//! syntax during rendering.

use std::fmt;

use serde::Serialize;

use crate::error::{Result, SigmaError};

/// Special characters that can appear in a Sigma string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpecialChar {
    /// Multi-character wildcard (`*`)
    WildcardMulti,
    /// Single-character wildcard (`?`)
    WildcardSingle,
}

/// A part of a [`SigmaString`], either plain text or a special character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StringPart {
    Plain(String),
    Special(SpecialChar),
}

/// A Sigma string value that may contain wildcards.
///
/// Backslash only consumes itself when followed by a Sigma-special character
/// (`*`, `?`, `\`). Before any other character it stays a literal backslash,
/// which matters for patterns like `\Windows\System32\`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigmaString {
    pub parts: Vec<StringPart>,
    pub original: String,
}

impl SigmaString {
    /// Parse a string, interpreting `*` and `?` as wildcards and `\` as escape.
    pub fn new(s: &str) -> Self {
        let mut parts: Vec<StringPart> = Vec::new();
        let mut acc = String::new();
        let mut escaped = false;

        for c in s.chars() {
            if escaped {
                if c == '*' || c == '?' || c == '\\' {
                    acc.push(c);
                } else {
                    acc.push('\\');
                    acc.push(c);
                }
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '*' {
                if !acc.is_empty() {
                    parts.push(StringPart::Plain(std::mem::take(&mut acc)));
                }
                parts.push(StringPart::Special(SpecialChar::WildcardMulti));
            } else if c == '?' {
                if !acc.is_empty() {
                    parts.push(StringPart::Plain(std::mem::take(&mut acc)));
                }
                parts.push(StringPart::Special(SpecialChar::WildcardSingle));
            } else {
                acc.push(c);
            }
        }

        if escaped {
            acc.push('\\');
        }
        if !acc.is_empty() {
            parts.push(StringPart::Plain(acc));
        }

        SigmaString {
            parts,
            original: s.to_string(),
        }
    }

    /// Build from already-parsed parts, regenerating the `original` form.
    pub fn from_parts(parts: Vec<StringPart>) -> Self {
        let original = parts
            .iter()
            .map(|p| match p {
                StringPart::Plain(s) => s.replace('\\', "\\\\").replace('*', "\\*").replace('?', "\\?"),
                StringPart::Special(SpecialChar::WildcardMulti) => "*".to_string(),
                StringPart::Special(SpecialChar::WildcardSingle) => "?".to_string(),
            })
            .collect();
        SigmaString { parts, original }
    }

    /// Create from a raw string with no wildcard parsing (used for `re` values).
    pub fn from_raw(s: &str) -> Self {
        SigmaString {
            parts: if s.is_empty() {
                Vec::new()
            } else {
                vec![StringPart::Plain(s.to_string())]
            },
            original: s.to_string(),
        }
    }

    pub fn is_plain(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, StringPart::Plain(_)))
    }

    pub fn contains_wildcards(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, StringPart::Special(_)))
    }

    /// Plain string content without wildcards; `None` if wildcards are present.
    pub fn as_plain(&self) -> Option<String> {
        if !self.is_plain() {
            return None;
        }
        Some(
            self.parts
                .iter()
                .filter_map(|p| match p {
                    StringPart::Plain(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect(),
        )
    }

    pub fn starts_with_wildcard(&self) -> bool {
        matches!(
            self.parts.first(),
            Some(StringPart::Special(SpecialChar::WildcardMulti))
        )
    }

    pub fn ends_with_wildcard(&self) -> bool {
        matches!(
            self.parts.last(),
            Some(StringPart::Special(SpecialChar::WildcardMulti))
        )
    }

    /// Return a copy with a leading `*` wildcard, unless one is already there.
    pub fn with_leading_wildcard(&self) -> Self {
        if self.starts_with_wildcard() {
            return self.clone();
        }
        let mut parts = Vec::with_capacity(self.parts.len() + 1);
        parts.push(StringPart::Special(SpecialChar::WildcardMulti));
        parts.extend(self.parts.iter().cloned());
        SigmaString::from_parts(parts)
    }

    /// Return a copy with a trailing `*` wildcard, unless one is already there.
    pub fn with_trailing_wildcard(&self) -> Self {
        if self.ends_with_wildcard() {
            return self.clone();
        }
        let mut parts = self.parts.clone();
        parts.push(StringPart::Special(SpecialChar::WildcardMulti));
        SigmaString::from_parts(parts)
    }

    /// Apply a transformation to every plain part, keeping wildcards intact.
    pub fn map_plain<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String>,
    {
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            match part {
                StringPart::Plain(s) => parts.push(StringPart::Plain(f(s)?)),
                special => parts.push(special.clone()),
            }
        }
        Ok(SigmaString::from_parts(parts))
    }
}

impl fmt::Display for SigmaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Numeric value, integer or floating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SigmaNumber {
    Int(i64),
    Float(f64),
}

impl fmt::Display for SigmaNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigmaNumber::Int(n) => write!(f, "{n}"),
            SigmaNumber::Float(n) => write!(f, "{n}"),
        }
    }
}

/// Comparison operator attached to a numeric bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// Classification of a [`SigmaValue`], used in backend capability sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    String,
    Number,
    Bool,
    Null,
    Regex,
    Cidr,
    Compare,
}

/// A typed value from a detection item.
///
/// Modifier application may retype values: `re` turns a string into a regex
/// pattern, `cidr` into a network range, `gt`/`lt`/`gte`/`lte` into a numeric
/// comparison bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SigmaValue {
    String(SigmaString),
    Number(SigmaNumber),
    Bool(bool),
    Null,
    /// Regex pattern, stored verbatim.
    Regex(String),
    /// CIDR network range, e.g. `10.0.0.0/8`.
    Cidr(String),
    /// Numeric comparison bound, e.g. `gte 500`.
    Compare(CompareOp, SigmaNumber),
}

impl SigmaValue {
    /// Build a value from a YAML scalar.
    pub fn from_yaml(v: &serde_yaml::Value) -> Result<Self> {
        match v {
            serde_yaml::Value::String(s) => Ok(SigmaValue::String(SigmaString::new(s))),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SigmaValue::Number(SigmaNumber::Int(i)))
                } else if let Some(f) = n.as_f64() {
                    Ok(SigmaValue::Number(SigmaNumber::Float(f)))
                } else {
                    Err(SigmaError::InvalidValue(format!(
                        "unrepresentable number: {n:?}"
                    )))
                }
            }
            serde_yaml::Value::Bool(b) => Ok(SigmaValue::Bool(*b)),
            serde_yaml::Value::Null => Ok(SigmaValue::Null),
            other => Err(SigmaError::InvalidValue(format!(
                "detection values must be scalars, got {other:?}"
            ))),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            SigmaValue::String(_) => ValueKind::String,
            SigmaValue::Number(_) => ValueKind::Number,
            SigmaValue::Bool(_) => ValueKind::Bool,
            SigmaValue::Null => ValueKind::Null,
            SigmaValue::Regex(_) => ValueKind::Regex,
            SigmaValue::Cidr(_) => ValueKind::Cidr,
            SigmaValue::Compare(_, _) => ValueKind::Compare,
        }
    }
}

impl fmt::Display for SigmaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigmaValue::String(s) => write!(f, "{s}"),
            SigmaValue::Number(n) => write!(f, "{n}"),
            SigmaValue::Bool(b) => write!(f, "{b}"),
            SigmaValue::Null => write!(f, "null"),
            SigmaValue::Regex(r) => write!(f, "{r}"),
            SigmaValue::Cidr(c) => write!(f, "{c}"),
            SigmaValue::Compare(op, n) => write!(f, "{} {}", op.symbol(), n),
        }
    }
}

/// Unit of time for a [`Timespan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimespanUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl TimespanUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            TimespanUnit::Second => "s",
            TimespanUnit::Minute => "m",
            TimespanUnit::Hour => "h",
            TimespanUnit::Day => "d",
            TimespanUnit::Week => "w",
        }
    }

    pub fn seconds(&self) -> u64 {
        match self {
            TimespanUnit::Second => 1,
            TimespanUnit::Minute => 60,
            TimespanUnit::Hour => 3600,
            TimespanUnit::Day => 86400,
            TimespanUnit::Week => 604800,
        }
    }
}

/// Duration used by correlation time windows, e.g. `5m` or `24h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timespan {
    pub count: u64,
    pub unit: TimespanUnit,
}

impl Timespan {
    /// Parse a timespan like `15s`, `5m`, `12h`, `7d`, `2w`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| SigmaError::InvalidValue(format!("invalid timespan '{s}'")))?;
        let (digits, suffix) = s.split_at(split);
        let count: u64 = digits
            .parse()
            .map_err(|_| SigmaError::InvalidValue(format!("invalid timespan '{s}'")))?;
        let unit = match suffix {
            "s" => TimespanUnit::Second,
            "m" => TimespanUnit::Minute,
            "h" => TimespanUnit::Hour,
            "d" => TimespanUnit::Day,
            "w" => TimespanUnit::Week,
            _ => {
                return Err(SigmaError::InvalidValue(format!("invalid timespan '{s}'")));
            }
        };
        if count == 0 {
            return Err(SigmaError::InvalidValue(format!(
                "timespan '{s}' must be positive"
            )));
        }
        Ok(Timespan { count, unit })
    }

    pub fn seconds(&self) -> u64 {
        self.count * self.unit.seconds()
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}
