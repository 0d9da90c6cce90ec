//! Value-match modifiers and their application to detection-item values.
//!
//! Modifiers are applied in the order they appear in the field key. Most of
//! them rewrite values eagerly (wildcard wrapping, base64 encoding, dash
//! variants); `re`, `cidr` and the comparison modifiers retype the value;
//! `all` switches the item's value linking from OR to AND; `cased` and
//! `expand` are markers consumed later by the backend and the pipeline.

use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;

use crate::error::{Result, SigmaError};
use crate::value::{CompareOp, SigmaNumber, SigmaString, SigmaValue};

/// All supported value-match modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Contains,
    StartsWith,
    EndsWith,
    All,
    Base64,
    Base64Offset,
    Wide,
    Windash,
    Re,
    Cidr,
    Cased,
    Expand,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Modifier {
    /// Parse a modifier identifier from a field key segment.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "contains" => Ok(Modifier::Contains),
            "startswith" => Ok(Modifier::StartsWith),
            "endswith" => Ok(Modifier::EndsWith),
            "all" => Ok(Modifier::All),
            "base64" => Ok(Modifier::Base64),
            "base64offset" => Ok(Modifier::Base64Offset),
            "wide" => Ok(Modifier::Wide),
            "windash" => Ok(Modifier::Windash),
            "re" => Ok(Modifier::Re),
            "cidr" => Ok(Modifier::Cidr),
            "cased" => Ok(Modifier::Cased),
            "expand" => Ok(Modifier::Expand),
            "gt" => Ok(Modifier::Gt),
            "gte" => Ok(Modifier::Gte),
            "lt" => Ok(Modifier::Lt),
            "lte" => Ok(Modifier::Lte),
            other => Err(SigmaError::UnknownModifier(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Contains => "contains",
            Modifier::StartsWith => "startswith",
            Modifier::EndsWith => "endswith",
            Modifier::All => "all",
            Modifier::Base64 => "base64",
            Modifier::Base64Offset => "base64offset",
            Modifier::Wide => "wide",
            Modifier::Windash => "windash",
            Modifier::Re => "re",
            Modifier::Cidr => "cidr",
            Modifier::Cased => "cased",
            Modifier::Expand => "expand",
            Modifier::Gt => "gt",
            Modifier::Gte => "gte",
            Modifier::Lt => "lt",
            Modifier::Lte => "lte",
        }
    }
}

/// How the values inside one detection item combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueLinking {
    /// Any value may match (default).
    Or,
    /// Every value must match (`all` modifier).
    And,
}

/// Apply a modifier chain to a value list.
///
/// Returns the transformed values and the resulting value linking. Value
/// counts may grow (`base64offset`, `windash`) but ordering stays stable.
pub fn apply_modifiers(
    values: Vec<SigmaValue>,
    modifiers: &[Modifier],
) -> Result<(Vec<SigmaValue>, ValueLinking)> {
    let mut linking = ValueLinking::Or;
    let mut values = values;

    for (index, &modifier) in modifiers.iter().enumerate() {
        match modifier {
            Modifier::All => {
                linking = ValueLinking::And;
                continue;
            }
            Modifier::Cased | Modifier::Expand => continue,
            // Must head the chain; any preceding modifier invalidates it.
            Modifier::Re if index > 0 => {
                return Err(SigmaError::Modifier(
                    "re modifier only applies to unmodified values".to_string(),
                ));
            }
            _ => {}
        }

        let mut next = Vec::with_capacity(values.len());
        for value in values {
            next.extend(apply_one(modifier, value)?);
        }
        values = next;
    }

    Ok((values, linking))
}

fn apply_one(modifier: Modifier, value: SigmaValue) -> Result<Vec<SigmaValue>> {
    match modifier {
        Modifier::Contains => {
            let s = expect_string(modifier, value)?;
            Ok(vec![SigmaValue::String(
                s.with_leading_wildcard().with_trailing_wildcard(),
            )])
        }
        Modifier::StartsWith => {
            let s = expect_string(modifier, value)?;
            Ok(vec![SigmaValue::String(s.with_trailing_wildcard())])
        }
        Modifier::EndsWith => {
            let s = expect_string(modifier, value)?;
            Ok(vec![SigmaValue::String(s.with_leading_wildcard())])
        }
        Modifier::Base64 => {
            let plain = expect_plain_string(modifier, value)?;
            let encoded = general_purpose::STANDARD.encode(plain.as_bytes());
            Ok(vec![SigmaValue::String(SigmaString::from_raw(&encoded))])
        }
        Modifier::Base64Offset => base64_offset_variants(&expect_plain_string(modifier, value)?),
        Modifier::Wide => {
            let s = expect_string(modifier, value)?;
            let widened = s.map_plain(|plain| {
                if !plain.is_ascii() {
                    return Err(SigmaError::Modifier(format!(
                        "wide modifier requires ascii input, got '{plain}'"
                    )));
                }
                let mut out = String::with_capacity(plain.len() * 2);
                for c in plain.chars() {
                    out.push(c);
                    out.push('\u{0}');
                }
                Ok(out)
            })?;
            Ok(vec![SigmaValue::String(widened)])
        }
        Modifier::Windash => {
            let s = expect_string(modifier, value)?;
            Ok(windash_variants(&s))
        }
        Modifier::Re => {
            let s = expect_string(modifier, value)?;
            Ok(vec![SigmaValue::Regex(s.original)])
        }
        Modifier::Cidr => {
            let plain = expect_plain_string(modifier, value)?;
            validate_cidr(&plain)?;
            Ok(vec![SigmaValue::Cidr(plain)])
        }
        Modifier::Gt => compare_bound(CompareOp::Gt, value),
        Modifier::Gte => compare_bound(CompareOp::Gte, value),
        Modifier::Lt => compare_bound(CompareOp::Lt, value),
        Modifier::Lte => compare_bound(CompareOp::Lte, value),
        Modifier::All | Modifier::Cased | Modifier::Expand => Ok(vec![value]),
    }
}

fn expect_string(modifier: Modifier, value: SigmaValue) -> Result<SigmaString> {
    match value {
        SigmaValue::String(s) => Ok(s),
        other => Err(SigmaError::Modifier(format!(
            "{} modifier requires a string value, got '{other}'",
            modifier.as_str()
        ))),
    }
}

fn expect_plain_string(modifier: Modifier, value: SigmaValue) -> Result<String> {
    let s = expect_string(modifier, value)?;
    s.as_plain().ok_or_else(|| {
        SigmaError::Modifier(format!(
            "{} modifier does not allow wildcards in '{s}'",
            modifier.as_str()
        ))
    })
}

/// The three shifted base64 encodings that cover every 3-byte alignment of
/// the plaintext inside a larger encoded stream.
fn base64_offset_variants(plain: &str) -> Result<Vec<SigmaValue>> {
    const START_OFFSETS: [usize; 3] = [0, 2, 3];
    const END_OFFSETS: [usize; 3] = [0, 3, 2];

    let bytes = plain.as_bytes();
    let mut variants = Vec::with_capacity(3);
    for shift in 0..3 {
        let mut padded = vec![b' '; shift];
        padded.extend_from_slice(bytes);
        let encoded = general_purpose::STANDARD.encode(&padded);
        let start = START_OFFSETS[shift];
        let trim = END_OFFSETS[(bytes.len() + shift) % 3];
        let end = encoded.len().saturating_sub(trim);
        if start >= end {
            return Err(SigmaError::Modifier(format!(
                "value '{plain}' too short for base64offset"
            )));
        }
        variants.push(SigmaValue::String(SigmaString::from_raw(
            &encoded[start..end],
        )));
    }
    Ok(variants)
}

/// One variant per dash style, covering the `-`, `/`, and typographic dash
/// spellings of Windows command-line switches.
fn windash_variants(s: &SigmaString) -> Vec<SigmaValue> {
    use crate::value::StringPart;

    const DASHES: [&str; 5] = ["-", "/", "\u{2013}", "\u{2014}", "\u{2015}"];

    if !s
        .parts
        .iter()
        .any(|p| matches!(p, StringPart::Plain(t) if t.contains('-')))
    {
        return vec![SigmaValue::String(s.clone())];
    }

    DASHES
        .iter()
        .map(|dash| {
            let parts = s
                .parts
                .iter()
                .map(|p| match p {
                    StringPart::Plain(t) => StringPart::Plain(t.replace('-', dash)),
                    special => special.clone(),
                })
                .collect();
            SigmaValue::String(SigmaString::from_parts(parts))
        })
        .collect()
}

fn validate_cidr(s: &str) -> Result<()> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| SigmaError::InvalidValue(format!("invalid CIDR '{s}'")))?;
    let addr: std::net::IpAddr = addr
        .parse()
        .map_err(|_| SigmaError::InvalidValue(format!("invalid CIDR '{s}'")))?;
    let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| SigmaError::InvalidValue(format!("invalid CIDR '{s}'")))?;
    if prefix > max_prefix {
        return Err(SigmaError::InvalidValue(format!("invalid CIDR '{s}'")));
    }
    Ok(())
}

fn compare_bound(op: CompareOp, value: SigmaValue) -> Result<Vec<SigmaValue>> {
    match value {
        SigmaValue::Number(n) => Ok(vec![SigmaValue::Compare(op, n)]),
        other => Err(SigmaError::Modifier(format!(
            "{} modifier requires a numeric value, got '{other}'",
            op.symbol()
        ))),
    }
}
