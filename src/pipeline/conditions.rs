//! Predicates guarding processing items.
//!
//! Rule conditions gate on rule metadata, field-name conditions restrict
//! which fields a transformation touches, and detection-item conditions
//! inspect individual item shape. All of them are evaluated against the
//! current rule state at the moment their item runs.

use regex::Regex;
use serde::Serialize;

use crate::error::{Result, SigmaError};
use crate::modifier::Modifier;
use crate::rule::{DetectionItem, Level, LogSource, SigmaRule};
use crate::value::SigmaValue;

/// Predicate over rule metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RuleCondition {
    /// Matches when every field set here equals the rule's log source.
    Logsource(LogSource),
    /// Matches rules at or above the given severity.
    LevelAtLeast(Level),
    /// Matches rules carrying the tag.
    ContainsTag(String),
    /// Matches rules whose id is in the list.
    RuleIdIn(Vec<String>),
}

impl RuleCondition {
    pub fn matches(&self, rule: &SigmaRule) -> bool {
        match self {
            RuleCondition::Logsource(wanted) => rule.logsource.matches(wanted),
            RuleCondition::LevelAtLeast(level) => {
                rule.level.map(|l| l >= *level).unwrap_or(false)
            }
            RuleCondition::ContainsTag(tag) => rule.tags.iter().any(|t| t == tag),
            RuleCondition::RuleIdIn(ids) => rule
                .id
                .as_ref()
                .map(|id| ids.iter().any(|i| i == id))
                .unwrap_or(false),
        }
    }
}

/// Predicate over a detection item's field name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldNameCondition {
    IncludeFields(Vec<String>),
    ExcludeFields(Vec<String>),
}

impl FieldNameCondition {
    pub fn matches(&self, item: &DetectionItem) -> bool {
        match self {
            FieldNameCondition::IncludeFields(fields) => item
                .field
                .as_ref()
                .map(|f| fields.iter().any(|wanted| wanted == f))
                .unwrap_or(false),
            FieldNameCondition::ExcludeFields(fields) => item
                .field
                .as_ref()
                .map(|f| !fields.iter().any(|wanted| wanted == f))
                .unwrap_or(true),
        }
    }
}

/// Predicate over detection-item shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DetectionItemCondition {
    /// At least one plain string value matches the regex.
    MatchString(String),
    /// The item is an unscoped keyword match.
    IsKeyword,
    /// The modifier chain contains the given modifier.
    HasModifier(Modifier),
}

impl DetectionItemCondition {
    pub fn matches(&self, item: &DetectionItem) -> Result<bool> {
        match self {
            DetectionItemCondition::MatchString(pattern) => {
                let re = Regex::new(pattern).map_err(|e| {
                    SigmaError::Pipeline(format!("invalid match_string pattern '{pattern}': {e}"))
                })?;
                Ok(item.values.iter().any(|v| match v {
                    SigmaValue::String(s) => {
                        s.as_plain().map(|p| re.is_match(&p)).unwrap_or(false)
                    }
                    _ => false,
                }))
            }
            DetectionItemCondition::IsKeyword => Ok(item.field.is_none()),
            DetectionItemCondition::HasModifier(modifier) => {
                Ok(item.modifiers.contains(modifier))
            }
        }
    }
}

/// Evaluate the field and item predicate sets against one detection item.
pub fn item_matches(
    field_conditions: &[FieldNameCondition],
    item_conditions: &[DetectionItemCondition],
    item: &DetectionItem,
) -> Result<bool> {
    for cond in field_conditions {
        if !cond.matches(item) {
            return Ok(false);
        }
    }
    for cond in item_conditions {
        if !cond.matches(item)? {
            return Ok(false);
        }
    }
    Ok(true)
}
