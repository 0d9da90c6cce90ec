//! Rule collections and batch conversion.
//!
//! A collection holds plain rules and correlation rules from one or more
//! YAML documents. Batch conversion runs every rule through an optional
//! pipeline and the backend, continuing past per-rule failures and
//! collecting structured diagnostics instead of aborting the run.
//! Independent rules convert in parallel; correlations run only after every
//! base rule has been converted.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;

use crate::backend::{Backend, ConversionEngine, QueryPacking};
use crate::correlation::CorrelationRule;
use crate::error::{Diagnostic, Phase, Result, SigmaError};
use crate::pipeline::{ErrorMode, ProcessingPipeline};
use crate::rule::SigmaRule;

/// Rules and correlations parsed from YAML documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SigmaCollection {
    pub rules: Vec<SigmaRule>,
    pub correlations: Vec<CorrelationRule>,
}

impl SigmaCollection {
    /// Parse a (possibly multi-document) YAML source. Documents carrying a
    /// `correlation` section become correlation rules, everything else a
    /// plain rule.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let mut collection = SigmaCollection::default();
        for document in serde_yaml::Deserializer::from_str(source) {
            let value = Yaml::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            collection.push_document(&value)?;
        }
        if collection.rules.is_empty() && collection.correlations.is_empty() {
            return Err(SigmaError::InvalidRule(
                "collection contains no rules".to_string(),
            ));
        }
        Ok(collection)
    }

    fn push_document(&mut self, doc: &Yaml) -> Result<()> {
        let is_correlation = doc
            .as_mapping()
            .map(|m| m.iter().any(|(k, _)| k.as_str() == Some("correlation")))
            .unwrap_or(false);
        if is_correlation {
            self.correlations.push(CorrelationRule::from_yaml(doc)?);
        } else {
            self.rules.push(SigmaRule::from_yaml(doc)?);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len() + self.correlations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.correlations.is_empty()
    }
}

/// Outcome of a batch conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionReport {
    /// Output units after packing, in rule order.
    pub queries: Vec<String>,
    /// One diagnostic per failed rule or correlation.
    pub diagnostics: Vec<Diagnostic>,
    /// Warnings recorded by lenient pipeline runs.
    pub warnings: Vec<String>,
}

impl ConversionReport {
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Serialize the report for external consumers.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SigmaError::InvalidValue(format!("report serialization failed: {e}")))
    }
}

/// Settings for a batch conversion run.
#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    pub pipeline: Option<ProcessingPipeline>,
    pub error_mode: ErrorMode,
    pub packing: QueryPacking,
}

impl SigmaCollection {
    /// Convert every rule and correlation through the backend.
    ///
    /// Rules are independent and convert in parallel. Correlations resolve
    /// against the post-pipeline rule set and run strictly after all rules,
    /// which is the only cross-rule ordering requirement.
    pub fn convert<B>(&self, engine: &ConversionEngine<B>, options: &ConversionOptions) -> ConversionReport
    where
        B: Backend + Sync,
    {
        let outcomes: Vec<RuleOutcome> = self
            .rules
            .par_iter()
            .map(|rule| convert_one(engine, options, rule))
            .collect();

        let mut report = ConversionReport::default();
        let mut transformed = Vec::new();
        for outcome in outcomes {
            report.queries.extend(outcome.queries);
            report.diagnostics.extend(outcome.diagnostics);
            report.warnings.extend(outcome.warnings);
            transformed.extend(outcome.rules);
        }

        for correlation in &self.correlations {
            match engine.convert_correlation(correlation, &transformed) {
                Ok(query) => report.queries.push(query),
                Err(e) => report.diagnostics.push(Diagnostic::from_error(
                    correlation.id.clone().or_else(|| Some(correlation.title.clone())),
                    Phase::Correlation,
                    &e,
                )),
            }
        }

        report.queries = engine.pack(report.queries, &options.packing);
        report
    }
}

struct RuleOutcome {
    rules: Vec<SigmaRule>,
    queries: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    warnings: Vec<String>,
}

fn convert_one<B: Backend>(
    engine: &ConversionEngine<B>,
    options: &ConversionOptions,
    rule: &SigmaRule,
) -> RuleOutcome {
    let rule_id = rule.id.clone().or_else(|| Some(rule.title.clone()));
    let mut outcome = RuleOutcome {
        rules: Vec::new(),
        queries: Vec::new(),
        diagnostics: Vec::new(),
        warnings: Vec::new(),
    };

    let transformed = match &options.pipeline {
        Some(pipeline) => match pipeline.apply(rule.clone(), options.error_mode) {
            Ok(output) => {
                outcome.warnings.extend(output.warnings);
                output.rules
            }
            Err(e) => {
                outcome
                    .diagnostics
                    .push(Diagnostic::from_error(rule_id, Phase::Pipeline, &e));
                return outcome;
            }
        },
        None => vec![rule.clone()],
    };

    for rule in transformed {
        match engine.convert_rule(&rule) {
            Ok(queries) => {
                outcome.queries.extend(queries);
                outcome.rules.push(rule);
            }
            Err(e) => {
                outcome.diagnostics.push(Diagnostic::from_error(
                    rule_id.clone(),
                    phase_of(&e),
                    &e,
                ));
            }
        }
    }
    outcome
}

fn phase_of(err: &SigmaError) -> Phase {
    match err {
        SigmaError::Syntax { .. } | SigmaError::Reference { .. } => Phase::Parse,
        SigmaError::Pipeline(_) => Phase::Pipeline,
        SigmaError::CorrelationResolution(_) => Phase::Correlation,
        _ => Phase::Conversion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenericBackend;

    const TWO_RULES: &str = r#"
title: Rule A
id: rule-a
detection:
    selection:
        EventID: 1
    condition: selection
---
title: Rule B
id: rule-b
detection:
    selection:
        EventID: 2
    condition: selection
"#;

    fn engine() -> ConversionEngine<GenericBackend> {
        ConversionEngine::new(GenericBackend::new())
    }

    #[test]
    fn test_multi_document_parsing() {
        let collection = SigmaCollection::from_yaml_str(TWO_RULES).unwrap();
        assert_eq!(collection.rules.len(), 2);
        assert!(collection.correlations.is_empty());
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_correlation_documents_are_classified() {
        let collection = SigmaCollection::from_yaml_str(
            r#"
title: Base
id: base
detection:
    selection:
        EventID: 4625
    condition: selection
---
title: Burst
correlation:
    type: event_count
    rules: [base]
    timespan: 5m
    condition:
        gte: 10
"#,
        )
        .unwrap();
        assert_eq!(collection.rules.len(), 1);
        assert_eq!(collection.correlations.len(), 1);
    }

    #[test]
    fn test_batch_conversion_in_rule_order() {
        let collection = SigmaCollection::from_yaml_str(TWO_RULES).unwrap();
        let report = collection.convert(&engine(), &ConversionOptions::default());
        assert!(!report.has_errors());
        assert_eq!(report.queries, vec!["EventID=1", "EventID=2"]);
    }

    #[test]
    fn test_batch_continues_past_failures() {
        let collection = SigmaCollection::from_yaml_str(
            r#"
title: Broken
id: broken
detection:
    selection:
        EventID: 1
    condition: selection and
---
title: Fine
id: fine
detection:
    selection:
        EventID: 2
    condition: selection
"#,
        )
        .unwrap();
        let report = collection.convert(&engine(), &ConversionOptions::default());
        assert_eq!(report.queries, vec!["EventID=2"]);
        assert_eq!(report.diagnostics.len(), 1);
        let diag = &report.diagnostics[0];
        assert_eq!(diag.rule_id.as_deref(), Some("broken"));
        assert_eq!(diag.phase, Phase::Parse);
        assert_eq!(diag.kind, "SyntaxError");
        assert!(diag.source_span.is_some());
    }

    #[test]
    fn test_correlations_convert_after_rules() {
        let collection = SigmaCollection::from_yaml_str(
            r#"
title: Base
id: base
detection:
    selection:
        EventID: 4625
    condition: selection
---
title: Burst
correlation:
    type: event_count
    rules: [base]
    group-by: [Host]
    timespan: 5m
    condition:
        gte: 10
"#,
        )
        .unwrap();
        let report = collection.convert(&engine(), &ConversionOptions::default());
        assert!(!report.has_errors());
        assert_eq!(
            report.queries,
            vec![
                "EventID=4625",
                "EventID=4625 | window 5m | group by Host | having count() >= 10"
            ]
        );
    }

    #[test]
    fn test_missing_correlation_reference_reported() {
        let collection = SigmaCollection::from_yaml_str(
            r#"
title: Burst
id: corr-1
correlation:
    type: event_count
    rules: [nonexistent]
    timespan: 5m
    condition:
        gte: 10
"#,
        )
        .unwrap();
        let report = collection.convert(&engine(), &ConversionOptions::default());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, "CorrelationResolutionError");
        assert_eq!(report.diagnostics[0].phase, Phase::Correlation);
    }

    #[test]
    fn test_pipeline_applies_before_conversion() {
        let collection = SigmaCollection::from_yaml_str(TWO_RULES).unwrap();
        let pipeline = ProcessingPipeline::from_yaml_str(
            r#"
name: rename
transformations:
    - type: field_name_mapping
      mapping:
          EventID: event.code
"#,
        )
        .unwrap();
        let options = ConversionOptions {
            pipeline: Some(pipeline),
            ..ConversionOptions::default()
        };
        let report = collection.convert(&engine(), &options);
        assert_eq!(report.queries, vec!["event.code=1", "event.code=2"]);
    }

    #[test]
    fn test_joined_packing() {
        let collection = SigmaCollection::from_yaml_str(TWO_RULES).unwrap();
        let options = ConversionOptions {
            packing: QueryPacking::Joined {
                separator: "\n".to_string(),
            },
            ..ConversionOptions::default()
        };
        let report = collection.convert(&engine(), &options);
        assert_eq!(report.queries, vec!["EventID=1\nEventID=2"]);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let collection = SigmaCollection::from_yaml_str(TWO_RULES).unwrap();
        let report = collection.convert(&engine(), &ConversionOptions::default());
        let json = report.to_json().unwrap();
        assert!(json.contains("EventID=1"));
        assert!(json.contains("\"diagnostics\""));
    }

    #[test]
    fn test_empty_collection_rejected() {
        let err = SigmaCollection::from_yaml_str("").unwrap_err();
        assert!(matches!(err, SigmaError::InvalidRule(_)));
    }
}
