//! Generic text backend.
//!
//! Renders `field=value` comparisons joined by `AND`/`OR` with `NOT (...)`
//! negation, `field IN (...)` membership tests, and quote-on-demand string
//! values. Regex values cannot appear inline and are emitted as deferred
//! `regex` clauses after the main expression.

use std::collections::HashSet;

use crate::backend::{Backend, Capabilities, Fragment, Precedence, QueryPacking};
use crate::correlation::{CorrelationKind, CorrelationRule};
use crate::error::{Result, SigmaError};
use crate::modifier::Modifier;
use crate::value::{SigmaNumber, SigmaString, SigmaValue, SpecialChar, StringPart, ValueKind};

pub struct GenericBackend {
    capabilities: Capabilities,
}

impl GenericBackend {
    pub fn new() -> Self {
        let modifiers = HashSet::from([
            Modifier::Contains,
            Modifier::StartsWith,
            Modifier::EndsWith,
            Modifier::All,
            Modifier::Base64,
            Modifier::Base64Offset,
            Modifier::Wide,
            Modifier::Windash,
            Modifier::Re,
            Modifier::Cidr,
            Modifier::Expand,
            Modifier::Gt,
            Modifier::Gte,
            Modifier::Lt,
            Modifier::Lte,
        ]);
        let value_kinds = HashSet::from([
            ValueKind::String,
            ValueKind::Number,
            ValueKind::Bool,
            ValueKind::Null,
            ValueKind::Regex,
            ValueKind::Cidr,
            ValueKind::Compare,
        ]);
        Self {
            capabilities: Capabilities {
                modifiers,
                value_kinds,
                quantifiers: true,
                in_list: true,
                inline_regex: false,
                deferred_regex: true,
                packing: QueryPacking::PerQuery,
            },
        }
    }

    /// Build a backend with a restricted capability set, for targets that
    /// cannot express the full construct space.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    /// Quote a string value only when bare text would misparse.
    fn quote(&self, raw: &str) -> String {
        let bare_ok = !raw.is_empty()
            && raw.chars().all(|c| {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*' | '?' | ':' | '/' | '\\')
            });
        if bare_ok {
            raw.to_string()
        } else {
            let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\"")
        }
    }

    /// Query-text form of a string value: wildcards as `*`/`?`, plain parts
    /// verbatim (not the escaped source form).
    fn string_text(&self, s: &SigmaString) -> String {
        let mut out = String::new();
        for part in &s.parts {
            match part {
                StringPart::Plain(p) => out.push_str(p),
                StringPart::Special(SpecialChar::WildcardMulti) => out.push('*'),
                StringPart::Special(SpecialChar::WildcardSingle) => out.push('?'),
            }
        }
        out
    }

    fn number(&self, n: &SigmaNumber) -> String {
        match n {
            SigmaNumber::Int(i) => i.to_string(),
            SigmaNumber::Float(f) => f.to_string(),
        }
    }
}

impl Default for GenericBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for GenericBackend {
    fn name(&self) -> &str {
        "generic"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn and_token(&self) -> &str {
        " AND "
    }

    fn or_token(&self) -> &str {
        " OR "
    }

    fn render_not(&self, inner: &Fragment) -> Fragment {
        Fragment {
            text: format!("NOT ({})", inner.text),
            precedence: Precedence::Not,
        }
    }

    fn render_comparison(&self, field: &str, value: &SigmaValue) -> Result<String> {
        match value {
            SigmaValue::String(s) => Ok(format!("{field}={}", self.quote(&self.string_text(s)))),
            SigmaValue::Number(n) => Ok(format!("{field}={}", self.number(n))),
            SigmaValue::Bool(b) => Ok(format!("{field}={b}")),
            SigmaValue::Null => Ok(format!("{field}=null")),
            SigmaValue::Regex(pattern) => {
                // Only reached when inline regex is enabled in a custom
                // capability set.
                let escaped = pattern.replace('\\', "\\\\").replace('"', "\\\"");
                Ok(format!("{field}=~\"{escaped}\""))
            }
            SigmaValue::Cidr(range) => Ok(format!("cidr({field}, \"{range}\")")),
            SigmaValue::Compare(op, bound) => {
                Ok(format!("{field}{}{}", op.symbol(), self.number(bound)))
            }
        }
    }

    fn render_keyword(&self, value: &SigmaValue) -> Result<String> {
        match value {
            SigmaValue::String(s) => Ok(self.quote(&self.string_text(s))),
            SigmaValue::Number(n) => Ok(self.number(n)),
            SigmaValue::Bool(b) => Ok(b.to_string()),
            other => Err(SigmaError::UnsupportedFeature(format!(
                "keyword matches only accept scalar values, got {:?}",
                other.kind()
            ))),
        }
    }

    fn render_in_list(&self, field: &str, values: &[&SigmaValue]) -> Result<String> {
        let rendered = values
            .iter()
            .map(|v| match v {
                SigmaValue::String(s) => Ok(self.quote(&self.string_text(s))),
                SigmaValue::Number(n) => Ok(self.number(n)),
                SigmaValue::Bool(b) => Ok(b.to_string()),
                other => Err(SigmaError::UnsupportedFeature(format!(
                    "IN lists only accept scalar values, got {:?}",
                    other.kind()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("{field} IN ({})", rendered.join(", ")))
    }

    fn in_list_eligible(&self, value: &SigmaValue) -> bool {
        match value {
            SigmaValue::String(s) => !s.contains_wildcards(),
            SigmaValue::Number(_) | SigmaValue::Bool(_) => true,
            _ => false,
        }
    }

    fn deferred_placeholder(&self) -> &str {
        "*"
    }

    fn render_deferred_regex(&self, field: Option<&str>, pattern: &str, negated: bool) -> String {
        let escaped = pattern.replace('\\', "\\\\").replace('"', "\\\"");
        let op = if negated { "!=" } else { "=" };
        match field {
            Some(field) => format!("regex {field}{op}\"{escaped}\""),
            None => format!("regex _raw{op}\"{escaped}\""),
        }
    }

    fn deferred_separator(&self) -> &str {
        " | "
    }

    fn render_correlation(
        &self,
        correlation: &CorrelationRule,
        base_queries: &[String],
    ) -> Result<String> {
        let filter = if base_queries.len() == 1 {
            base_queries[0].clone()
        } else {
            base_queries
                .iter()
                .map(|q| format!("({q})"))
                .collect::<Vec<_>>()
                .join(" OR ")
        };

        let mut out = filter;
        out.push_str(&format!(" | window {}", correlation.timespan));
        if !correlation.group_by.is_empty() {
            out.push_str(&format!(" | group by {}", correlation.group_by.join(", ")));
        }
        match &correlation.kind {
            CorrelationKind::EventCount => {
                let cond = &correlation.condition;
                out.push_str(&format!(
                    " | having count() {} {}",
                    cond.op.symbol(),
                    cond.value
                ));
            }
            CorrelationKind::ValueCount { field } => {
                let cond = &correlation.condition;
                out.push_str(&format!(
                    " | having count(distinct {field}) {} {}",
                    cond.op.symbol(),
                    cond.value
                ));
            }
            CorrelationKind::Temporal => {
                out.push_str(&format!(
                    " | having rule_count() == {}",
                    correlation.rule_refs.len()
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConversionEngine;
    use crate::rule::SigmaRule;

    fn convert(rule: &str) -> Result<Vec<String>> {
        ConversionEngine::new(GenericBackend::new()).convert_rule(&SigmaRule::from_yaml_str(rule)?)
    }

    #[test]
    fn test_and_not_rendering() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        EventID: 4624
        LogonType: 3
    filter:
        AccountName: ANONYMOUS LOGON
    condition: selection and not filter
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec![r#"EventID=4624 AND LogonType=3 AND NOT (AccountName="ANONYMOUS LOGON")"#]
        );
    }

    #[test]
    fn test_or_inside_and_is_parenthesized() {
        let queries = convert(
            r#"
title: T
detection:
    procs:
        - Image: cmd.exe
        - Image: pwsh.exe
    context:
        User: SYSTEM
    condition: procs and context
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec!["(Image=cmd.exe OR Image=pwsh.exe) AND User=SYSTEM"]
        );
    }

    #[test]
    fn test_and_inside_or_is_not_parenthesized() {
        let queries = convert(
            r#"
title: T
detection:
    a:
        EventID: 1
        User: root
    b:
        EventID: 2
    condition: a or b
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["EventID=1 AND User=root OR EventID=2"]);
    }

    #[test]
    fn test_multi_value_or_leaf_renders_in_list() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        EventID:
            - 4624
            - 4625
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["EventID IN (4624, 4625)"]);
    }

    #[test]
    fn test_wildcard_values_bypass_in_list() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        Image|endswith:
            - cmd.exe
            - pwsh.exe
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["Image=*cmd.exe OR Image=*pwsh.exe"]);
    }

    #[test]
    fn test_all_linked_values_render_as_and() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        CommandLine|contains|all:
            - -enc
            - -nop
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec!["CommandLine=*-enc* AND CommandLine=*-nop*"]
        );
    }

    #[test]
    fn test_regex_is_deferred_after_main_expression() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        EventID: 1
    pattern:
        CommandLine|re: \d{8}
    condition: selection and pattern
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec![r#"EventID=1 AND * | regex CommandLine="\\d{8}""#]
        );
    }

    #[test]
    fn test_negated_regex_negates_deferred_clause() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        EventID: 1
    pattern:
        CommandLine|re: \d{8}
    condition: selection and not pattern
"#,
        )
        .unwrap();
        // The main expression keeps the match-all placeholder; the exclusion
        // lives in the deferred clause itself.
        assert_eq!(
            queries,
            vec![r#"EventID=1 AND * | regex CommandLine!="\\d{8}""#]
        );
    }

    #[test]
    fn test_double_negated_regex_stays_positive() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        EventID: 1
    pattern:
        CommandLine|re: \d{8}
    condition: selection and not (not pattern)
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec![r#"EventID=1 AND * | regex CommandLine="\\d{8}""#]
        );
    }

    #[test]
    fn test_negated_regex_alternation_conjoins_exclusions() {
        let queries = convert(
            r#"
title: T
detection:
    pat_a:
        A|re: one
    pat_b:
        B|re: two
    condition: not (pat_a or pat_b)
"#,
        )
        .unwrap();
        assert_eq!(queries, vec![r#"* | regex A!="one" | regex B!="two""#]);
    }

    #[test]
    fn test_negating_mixed_inline_and_deferred_is_unsupported() {
        let err = convert(
            r#"
title: T
detection:
    selection:
        EventID: 1
    pattern:
        User: root
        CommandLine|re: \d{8}
    condition: selection and not pattern
"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFeatureError");
        assert!(err.to_string().contains("deferred"));
    }

    #[test]
    fn test_cased_modifier_fails_negotiation() {
        let err = convert(
            r#"
title: T
detection:
    selection:
        Image|cased: Cmd.exe
    condition: selection
"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFeatureError");
        assert!(err.to_string().contains("cased"));
    }

    #[test]
    fn test_deferred_fragments_keep_encounter_order() {
        let queries = convert(
            r#"
title: T
detection:
    first:
        A|re: one
    second:
        B|re: two
    condition: first and second
"#,
        )
        .unwrap();
        assert_eq!(queries, vec![r#"* AND * | regex A="one" | regex B="two""#]);
    }

    #[test]
    fn test_keyword_detection_renders_bare_values() {
        let queries = convert(
            r#"
title: T
detection:
    keywords:
        - mimikatz
        - sekurlsa::logonpasswords
    condition: keywords
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["mimikatz OR sekurlsa::logonpasswords"]);
    }

    #[test]
    fn test_multiple_conditions_produce_multiple_queries() {
        let queries = convert(
            r#"
title: T
detection:
    a:
        EventID: 1
    b:
        EventID: 2
    condition:
        - a
        - a and b
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["EventID=1", "EventID=1 AND EventID=2"]);
    }

    #[test]
    fn test_quantifier_all_of_them() {
        let queries = convert(
            r#"
title: T
detection:
    sel_a:
        EventID: 1
    sel_b:
        EventID: 2
    condition: all of them
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["EventID=1 AND EventID=2"]);
    }

    #[test]
    fn test_quantifier_two_of_three_expands_combinations() {
        let queries = convert(
            r#"
title: T
detection:
    sel_a:
        A: 1
    sel_b:
        B: 2
    sel_c:
        C: 3
    condition: 2 of sel_*
"#,
        )
        .unwrap();
        assert_eq!(
            queries,
            vec!["A=1 AND B=2 OR A=1 AND C=3 OR B=2 AND C=3"]
        );
    }

    #[test]
    fn test_comparison_modifiers() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        Count|gte: 100
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["Count>=100"]);
    }

    #[test]
    fn test_cidr_rendering() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        DestinationIp|cidr: 10.0.0.0/8
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(queries, vec![r#"cidr(DestinationIp, "10.0.0.0/8")"#]);
    }

    #[test]
    fn test_null_rendering() {
        let queries = convert(
            r#"
title: T
detection:
    selection:
        ParentImage: null
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(queries, vec!["ParentImage=null"]);
    }

    #[test]
    fn test_unsupported_modifier_fails_before_emission() {
        let mut caps = GenericBackend::new().capabilities.clone();
        caps.modifiers.remove(&Modifier::Cidr);
        caps.value_kinds.remove(&ValueKind::Cidr);
        let engine = ConversionEngine::new(GenericBackend::with_capabilities(caps));
        let rule = SigmaRule::from_yaml_str(
            r#"
title: T
detection:
    selection:
        DestinationIp|cidr: 10.0.0.0/8
    condition: selection
"#,
        )
        .unwrap();
        let err = engine.convert_rule(&rule).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFeatureError");
        assert!(err.to_string().contains("cidr"));
    }

    #[test]
    fn test_unsupported_quantifier_fails_fast() {
        let mut caps = GenericBackend::new().capabilities.clone();
        caps.quantifiers = false;
        let engine = ConversionEngine::new(GenericBackend::with_capabilities(caps));
        let rule = SigmaRule::from_yaml_str(
            r#"
title: T
detection:
    sel_a:
        A: 1
    condition: all of them
"#,
        )
        .unwrap();
        let err = engine.convert_rule(&rule).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFeatureError");
    }

    #[test]
    fn test_quote_on_demand() {
        let backend = GenericBackend::new();
        assert_eq!(backend.quote("cmd.exe"), "cmd.exe");
        assert_eq!(backend.quote("ANONYMOUS LOGON"), "\"ANONYMOUS LOGON\"");
        assert_eq!(backend.quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(backend.quote(""), "\"\"");
    }
}
