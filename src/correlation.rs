//! Cross-rule correlation resolution.
//!
//! Conversion is two-phase: every referenced base rule is converted through
//! the backend first, then the backend wraps the combined filters in its
//! time-bucket, grouping, and threshold constructs. No correlation enters
//! phase 2 until all of its base rules have completed phase 1.

use serde::Serialize;
use serde_yaml::Value as Yaml;

use crate::backend::{Backend, ConversionEngine};
use crate::error::{Result, SigmaError};
use crate::rule::SigmaRule;
use crate::value::Timespan;

/// Comparison operator in an aggregation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl AggregateOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            AggregateOp::Gt => ">",
            AggregateOp::Gte => ">=",
            AggregateOp::Lt => "<",
            AggregateOp::Lte => "<=",
            AggregateOp::Eq => "==",
        }
    }

    fn parse(key: &str) -> Option<Self> {
        match key {
            "gt" => Some(AggregateOp::Gt),
            "gte" => Some(AggregateOp::Gte),
            "lt" => Some(AggregateOp::Lt),
            "lte" => Some(AggregateOp::Lte),
            "eq" => Some(AggregateOp::Eq),
            _ => None,
        }
    }
}

/// Aggregation threshold predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConditionPredicate {
    pub op: AggregateOp,
    pub value: u64,
}

/// What the correlation counts within its window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CorrelationKind {
    /// Number of matching events.
    EventCount,
    /// Number of distinct values of a field.
    ValueCount { field: String },
    /// Co-occurrence of all referenced rules.
    Temporal,
}

/// A rule relating multiple base rules via time window and grouping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationRule {
    pub id: Option<String>,
    pub title: String,
    pub kind: CorrelationKind,
    /// Referenced base rules, by id or title, in declaration order.
    pub rule_refs: Vec<String>,
    pub timespan: Timespan,
    pub group_by: Vec<String>,
    pub condition: ConditionPredicate,
}

impl CorrelationRule {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let doc: Yaml = serde_yaml::from_str(source)?;
        Self::from_yaml(&doc)
    }

    pub fn from_yaml(doc: &Yaml) -> Result<Self> {
        let mapping = doc.as_mapping().ok_or_else(|| {
            SigmaError::InvalidRule("correlation rule must be a mapping".to_string())
        })?;

        let mut id = None;
        let mut title = String::new();
        let mut body = None;
        for (key, value) in mapping {
            match key.as_str() {
                Some("id") => id = value.as_str().map(str::to_string),
                Some("title") => title = value.as_str().unwrap_or_default().to_string(),
                Some("correlation") => body = Some(value),
                _ => {}
            }
        }
        let body = body
            .and_then(Yaml::as_mapping)
            .ok_or_else(|| SigmaError::InvalidRule("missing correlation section".to_string()))?;

        let mut kind_name = None;
        let mut count_field = None;
        let mut rule_refs = Vec::new();
        let mut timespan = None;
        let mut group_by = Vec::new();
        let mut condition = None;

        for (key, value) in body {
            match key.as_str() {
                Some("type") => kind_name = value.as_str().map(str::to_string),
                Some("rules") => {
                    let seq = value.as_sequence().ok_or_else(|| {
                        SigmaError::InvalidRule("correlation rules must be a list".to_string())
                    })?;
                    for r in seq {
                        let name = r.as_str().ok_or_else(|| {
                            SigmaError::InvalidRule("rule reference must be a string".to_string())
                        })?;
                        rule_refs.push(name.to_string());
                    }
                }
                Some("timespan") => {
                    let text = value.as_str().ok_or_else(|| {
                        SigmaError::InvalidRule("timespan must be a string".to_string())
                    })?;
                    timespan = Some(Timespan::parse(text)?);
                }
                Some("group-by") => {
                    let seq = value.as_sequence().ok_or_else(|| {
                        SigmaError::InvalidRule("group-by must be a list".to_string())
                    })?;
                    for f in seq {
                        let field = f.as_str().ok_or_else(|| {
                            SigmaError::InvalidRule("group-by field must be a string".to_string())
                        })?;
                        group_by.push(field.to_string());
                    }
                }
                Some("condition") => {
                    let cond = value.as_mapping().ok_or_else(|| {
                        SigmaError::InvalidRule(
                            "correlation condition must be a mapping".to_string(),
                        )
                    })?;
                    for (cond_key, cond_value) in cond {
                        match cond_key.as_str() {
                            Some("field") => {
                                count_field = cond_value.as_str().map(str::to_string);
                            }
                            Some(op_key) => {
                                if let Some(op) = AggregateOp::parse(op_key) {
                                    let value = cond_value.as_u64().ok_or_else(|| {
                                        SigmaError::InvalidRule(format!(
                                            "threshold '{op_key}' must be a non-negative integer"
                                        ))
                                    })?;
                                    condition = Some(ConditionPredicate { op, value });
                                }
                            }
                            None => {}
                        }
                    }
                }
                _ => {}
            }
        }

        if rule_refs.is_empty() {
            return Err(SigmaError::InvalidRule(
                "correlation references no rules".to_string(),
            ));
        }
        let timespan = timespan
            .ok_or_else(|| SigmaError::InvalidRule("correlation missing timespan".to_string()))?;

        let kind = match kind_name.as_deref() {
            Some("event_count") => CorrelationKind::EventCount,
            Some("value_count") => CorrelationKind::ValueCount {
                field: count_field.ok_or_else(|| {
                    SigmaError::InvalidRule(
                        "value_count correlation requires a condition field".to_string(),
                    )
                })?,
            },
            Some("temporal") => CorrelationKind::Temporal,
            Some(other) => {
                return Err(SigmaError::InvalidRule(format!(
                    "unknown correlation type '{other}'"
                )));
            }
            None => {
                return Err(SigmaError::InvalidRule(
                    "correlation missing type".to_string(),
                ));
            }
        };

        let condition = match (&kind, condition) {
            (CorrelationKind::Temporal, found) => found.unwrap_or(ConditionPredicate {
                op: AggregateOp::Eq,
                value: rule_refs.len() as u64,
            }),
            (_, Some(found)) => found,
            (_, None) => {
                return Err(SigmaError::InvalidRule(
                    "correlation missing threshold condition".to_string(),
                ));
            }
        };

        Ok(CorrelationRule {
            id,
            title,
            kind,
            rule_refs,
            timespan,
            group_by,
            condition,
        })
    }
}

impl<B: Backend> ConversionEngine<B> {
    /// Resolve and convert a correlation rule.
    ///
    /// Phase 1 converts every referenced base rule; a reference that matches
    /// no rule in `base_rules` (by id or title) fails the whole correlation.
    /// Phase 2 hands the collected queries to the backend's correlation
    /// renderer.
    pub fn convert_correlation(
        &self,
        correlation: &CorrelationRule,
        base_rules: &[SigmaRule],
    ) -> Result<String> {
        let mut base_queries = Vec::new();
        for reference in &correlation.rule_refs {
            let rule = base_rules
                .iter()
                .find(|r| r.id.as_deref() == Some(reference) || r.title == *reference)
                .ok_or_else(|| {
                    SigmaError::CorrelationResolution(format!(
                        "correlation '{}' references unknown rule '{reference}'",
                        correlation.title
                    ))
                })?;
            base_queries.extend(self.convert_rule(rule)?);
        }
        self.backend().render_correlation(correlation, &base_queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenericBackend;
    use crate::value::TimespanUnit;

    const BRUTE_FORCE: &str = r#"
title: Many failed logons
id: corr-1
correlation:
    type: event_count
    rules:
        - failed-logon
    group-by:
        - TargetUserName
    timespan: 10m
    condition:
        gte: 100
"#;

    fn base_rule(id: &str, event_id: u32) -> SigmaRule {
        SigmaRule::from_yaml_str(&format!(
            r#"
title: {id}
id: {id}
detection:
    selection:
        EventID: {event_id}
    condition: selection
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_event_count_correlation() {
        let correlation = CorrelationRule::from_yaml_str(BRUTE_FORCE).unwrap();
        assert_eq!(correlation.title, "Many failed logons");
        assert_eq!(correlation.kind, CorrelationKind::EventCount);
        assert_eq!(correlation.rule_refs, vec!["failed-logon"]);
        assert_eq!(correlation.timespan.count, 10);
        assert_eq!(correlation.timespan.unit, TimespanUnit::Minute);
        assert_eq!(correlation.group_by, vec!["TargetUserName"]);
        assert_eq!(correlation.condition.op, AggregateOp::Gte);
        assert_eq!(correlation.condition.value, 100);
    }

    #[test]
    fn test_event_count_conversion() {
        let correlation = CorrelationRule::from_yaml_str(BRUTE_FORCE).unwrap();
        let engine = ConversionEngine::new(GenericBackend::new());
        let query = engine
            .convert_correlation(&correlation, &[base_rule("failed-logon", 4625)])
            .unwrap();
        assert_eq!(
            query,
            "EventID=4625 | window 10m | group by TargetUserName | having count() >= 100"
        );
    }

    #[test]
    fn test_value_count_conversion() {
        let correlation = CorrelationRule::from_yaml_str(
            r#"
title: Password spray
correlation:
    type: value_count
    rules:
        - failed-logon
    group-by:
        - SourceIp
    timespan: 5m
    condition:
        field: TargetUserName
        gte: 50
"#,
        )
        .unwrap();
        let engine = ConversionEngine::new(GenericBackend::new());
        let query = engine
            .convert_correlation(&correlation, &[base_rule("failed-logon", 4625)])
            .unwrap();
        assert_eq!(
            query,
            "EventID=4625 | window 5m | group by SourceIp | having count(distinct TargetUserName) >= 50"
        );
    }

    #[test]
    fn test_temporal_conversion_unions_base_rules() {
        let correlation = CorrelationRule::from_yaml_str(
            r#"
title: Recon then exec
correlation:
    type: temporal
    rules:
        - recon
        - exec
    group-by:
        - Host
    timespan: 1h
"#,
        )
        .unwrap();
        let engine = ConversionEngine::new(GenericBackend::new());
        let query = engine
            .convert_correlation(&correlation, &[base_rule("recon", 1), base_rule("exec", 2)])
            .unwrap();
        assert_eq!(
            query,
            "(EventID=1) OR (EventID=2) | window 1h | group by Host | having rule_count() == 2"
        );
    }

    #[test]
    fn test_missing_base_rule_is_resolution_error() {
        let correlation = CorrelationRule::from_yaml_str(BRUTE_FORCE).unwrap();
        let engine = ConversionEngine::new(GenericBackend::new());
        let err = engine.convert_correlation(&correlation, &[]).unwrap_err();
        assert_eq!(err.kind(), "CorrelationResolutionError");
        assert!(err.to_string().contains("failed-logon"));
    }

    #[test]
    fn test_reference_by_title_also_resolves() {
        let correlation = CorrelationRule::from_yaml_str(BRUTE_FORCE).unwrap();
        let mut rule = base_rule("other-id", 4625);
        rule.title = "failed-logon".to_string();
        let engine = ConversionEngine::new(GenericBackend::new());
        assert!(engine.convert_correlation(&correlation, &[rule]).is_ok());
    }

    #[test]
    fn test_value_count_without_field_rejected() {
        let err = CorrelationRule::from_yaml_str(
            r#"
title: T
correlation:
    type: value_count
    rules: [a]
    timespan: 5m
    condition:
        gte: 10
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("field"));
    }

    #[test]
    fn test_unknown_correlation_type_rejected() {
        let err = CorrelationRule::from_yaml_str(
            r#"
title: T
correlation:
    type: sequence
    rules: [a]
    timespan: 5m
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn test_invalid_timespan_rejected() {
        let err = CorrelationRule::from_yaml_str(
            r#"
title: T
correlation:
    type: event_count
    rules: [a]
    timespan: tenminutes
    condition:
        gte: 10
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SigmaError::InvalidValue(_)));
    }
}
