//! Rule-rewriting transformations.
//!
//! Every transformation consumes a rule value and produces one or more new
//! rule values; nothing is mutated in shared state. Field and item predicates
//! from the enclosing processing item scope which detection items a
//! transformation touches.

use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;

use crate::error::{Result, SigmaError};
use crate::modifier::{apply_modifiers, Modifier};
use crate::pipeline::conditions::{item_matches, DetectionItemCondition, FieldNameCondition};
use crate::rule::{DetectionItem, LogSource, SigmaRule};
use crate::value::SigmaValue;

/// Predicate scope a transformation runs under.
pub struct TransformationScope<'a> {
    pub vars: &'a HashMap<String, String>,
    pub field_conditions: &'a [FieldNameCondition],
    pub item_conditions: &'a [DetectionItemCondition],
}

impl TransformationScope<'_> {
    fn item_matches(&self, item: &DetectionItem) -> Result<bool> {
        item_matches(self.field_conditions, self.item_conditions, item)
    }
}

/// The rewriting operations a processing item can carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Transformation {
    /// Rename fields. A single target renames in place; several targets fan
    /// the rule out into one rule per target.
    FieldMapping(Vec<(String, Vec<String>)>),
    /// Rewrite plain string value content through a regex substitution.
    ValueRegexRewrite { pattern: String, replacement: String },
    /// Append a modifier to matching items and apply it to their values.
    AddModifier(Modifier),
    /// Remove a modifier from matching items' recorded chains.
    RemoveModifier(Modifier),
    /// Rename a selection and rewrite condition expressions accordingly.
    ConditionRewrite { search: String, replacement: String },
    /// Delete matching detection items, pruning emptied groups.
    DropDetectionItem,
    /// Overwrite log source fields.
    ChangeLogsource(LogSource),
    /// Substitute `%name%` placeholders in string values from pipeline vars.
    PlaceholderExpansion,
    /// Unconditional failure, used to mark rules a target cannot support.
    Failure(String),
}

impl Transformation {
    pub fn apply(&self, rule: SigmaRule, scope: &TransformationScope<'_>) -> Result<Vec<SigmaRule>> {
        match self {
            Transformation::FieldMapping(mappings) => apply_field_mapping(rule, mappings, scope),
            Transformation::ValueRegexRewrite {
                pattern,
                replacement,
            } => {
                let re = Regex::new(pattern).map_err(|e| {
                    SigmaError::Pipeline(format!("invalid value rewrite pattern '{pattern}': {e}"))
                })?;
                let mut rule = rule;
                mutate_matching_items(&mut rule, scope, |item| {
                    for value in &mut item.values {
                        if let SigmaValue::String(s) = value {
                            *value = SigmaValue::String(
                                s.map_plain(|p| Ok(re.replace_all(p, replacement.as_str()).into_owned()))?,
                            );
                        }
                    }
                    Ok(())
                })?;
                Ok(vec![rule])
            }
            Transformation::AddModifier(modifier) => {
                let mut rule = rule;
                mutate_matching_items(&mut rule, scope, |item| {
                    item.modifiers.push(*modifier);
                    let values = std::mem::take(&mut item.values);
                    let (values, linking) = apply_modifiers(values, &[*modifier])?;
                    item.values = values;
                    if *modifier == Modifier::All {
                        item.linking = linking;
                    }
                    Ok(())
                })?;
                Ok(vec![rule])
            }
            Transformation::RemoveModifier(modifier) => {
                let mut rule = rule;
                mutate_matching_items(&mut rule, scope, |item| {
                    item.modifiers.retain(|m| m != modifier);
                    Ok(())
                })?;
                Ok(vec![rule])
            }
            Transformation::ConditionRewrite {
                search,
                replacement,
            } => apply_condition_rewrite(rule, search, replacement).map(|r| vec![r]),
            Transformation::DropDetectionItem => {
                let mut rule = rule;
                let failure: RefCell<Option<SigmaError>> = RefCell::new(None);
                for (_, detection) in &mut rule.detections {
                    detection.retain_items(&|item| match scope.item_matches(item) {
                        Ok(matched) => !matched,
                        Err(e) => {
                            failure.borrow_mut().get_or_insert(e);
                            true
                        }
                    });
                }
                if let Some(e) = failure.into_inner() {
                    return Err(e);
                }
                Ok(vec![rule])
            }
            Transformation::ChangeLogsource(target) => {
                let mut rule = rule;
                if target.category.is_some() {
                    rule.logsource.category = target.category.clone();
                }
                if target.product.is_some() {
                    rule.logsource.product = target.product.clone();
                }
                if target.service.is_some() {
                    rule.logsource.service = target.service.clone();
                }
                if target.definition.is_some() {
                    rule.logsource.definition = target.definition.clone();
                }
                Ok(vec![rule])
            }
            Transformation::PlaceholderExpansion => {
                let mut rule = rule;
                mutate_matching_items(&mut rule, scope, |item| {
                    for value in &mut item.values {
                        if let SigmaValue::String(s) = value {
                            *value =
                                SigmaValue::String(s.map_plain(|p| expand_placeholders(p, scope.vars))?);
                        }
                    }
                    item.modifiers.retain(|m| *m != Modifier::Expand);
                    Ok(())
                })?;
                Ok(vec![rule])
            }
            Transformation::Failure(message) => Err(SigmaError::Pipeline(message.clone())),
        }
    }
}

fn apply_field_mapping(
    rule: SigmaRule,
    mappings: &[(String, Vec<String>)],
    scope: &TransformationScope<'_>,
) -> Result<Vec<SigmaRule>> {
    let mut rules = vec![rule];

    for (source, targets) in mappings {
        if targets.is_empty() {
            return Err(SigmaError::Pipeline(format!(
                "field mapping for '{source}' has no targets"
            )));
        }

        let mut next = Vec::with_capacity(rules.len());
        for rule in rules {
            if !rule_uses_field(&rule, source, scope)? {
                next.push(rule);
                continue;
            }
            if targets.len() == 1 {
                let mut renamed = rule;
                rename_field(&mut renamed, source, &targets[0], scope)?;
                next.push(renamed);
            } else {
                // Fan out: one rule per target field.
                for target in targets {
                    let mut renamed = rule.clone();
                    rename_field(&mut renamed, source, target, scope)?;
                    next.push(renamed);
                }
            }
        }
        rules = next;
    }

    Ok(rules)
}

fn rule_uses_field(
    rule: &SigmaRule,
    field: &str,
    scope: &TransformationScope<'_>,
) -> Result<bool> {
    let found: RefCell<Result<bool>> = RefCell::new(Ok(false));
    for (_, detection) in &rule.detections {
        detection.for_each_item(&mut |item| {
            let mut state = found.borrow_mut();
            if !matches!(*state, Ok(false)) {
                return;
            }
            if item.field.as_deref() == Some(field) {
                *state = scope.item_matches(item);
            }
        });
    }
    found.into_inner()
}

fn rename_field(
    rule: &mut SigmaRule,
    source: &str,
    target: &str,
    scope: &TransformationScope<'_>,
) -> Result<()> {
    mutate_matching_items(rule, scope, |item| {
        if item.field.as_deref() == Some(source) {
            item.field = Some(target.to_string());
        }
        Ok(())
    })?;
    for field in &mut rule.fields {
        if field == source {
            *field = target.to_string();
        }
    }
    Ok(())
}

fn apply_condition_rewrite(mut rule: SigmaRule, search: &str, replacement: &str) -> Result<SigmaRule> {
    let token = Regex::new(&format!(r"\b{}\b", regex::escape(search)))
        .map_err(|e| SigmaError::Pipeline(format!("invalid condition rewrite target: {e}")))?;

    for (name, _) in &mut rule.detections {
        if name == search {
            *name = replacement.to_string();
        }
    }
    for condition in &mut rule.conditions {
        *condition = token.replace_all(condition, replacement).into_owned();
    }
    Ok(rule)
}

/// Run `f` over every detection item the scope's predicates accept.
fn mutate_matching_items(
    rule: &mut SigmaRule,
    scope: &TransformationScope<'_>,
    mut f: impl FnMut(&mut DetectionItem) -> Result<()>,
) -> Result<()> {
    let mut failure = None;
    for (_, detection) in &mut rule.detections {
        detection.for_each_item_mut(&mut |item| {
            if failure.is_some() {
                return;
            }
            match scope.item_matches(item) {
                Ok(true) => {
                    if let Err(e) = f(item) {
                        failure = Some(e);
                    }
                }
                Ok(false) => {}
                Err(e) => failure = Some(e),
            }
        });
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn expand_placeholders(text: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(SigmaError::Pipeline(format!(
                            "unbound placeholder '%{name}%'"
                        )));
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Lone percent sign, not a placeholder.
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SigmaString;

    fn empty_vars() -> HashMap<String, String> {
        HashMap::new()
    }

    fn scope<'a>(vars: &'a HashMap<String, String>) -> TransformationScope<'a> {
        TransformationScope {
            vars,
            field_conditions: &[],
            item_conditions: &[],
        }
    }

    fn sample_rule() -> SigmaRule {
        SigmaRule::from_yaml_str(
            r#"
title: T
logsource:
    product: windows
detection:
    selection:
        Image|endswith: cmd.exe
        User: SYSTEM
    condition: selection
fields:
    - Image
"#,
        )
        .unwrap()
    }

    fn field_names(rule: &SigmaRule) -> Vec<String> {
        let mut out = Vec::new();
        for (_, d) in &rule.detections {
            d.for_each_item(&mut |item| {
                out.push(item.field.clone().unwrap_or_default());
            });
        }
        out
    }

    #[test]
    fn test_single_target_rename_in_place() {
        let vars = empty_vars();
        let mapping = Transformation::FieldMapping(vec![(
            "Image".to_string(),
            vec!["process.executable".to_string()],
        )]);
        let out = mapping.apply(sample_rule(), &scope(&vars)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(field_names(&out[0]), vec!["process.executable", "User"]);
        assert_eq!(out[0].fields, vec!["process.executable"]);
    }

    #[test]
    fn test_multi_target_fans_out() {
        let vars = empty_vars();
        let mapping = Transformation::FieldMapping(vec![(
            "Image".to_string(),
            vec!["proc.path".to_string(), "proc.name".to_string()],
        )]);
        let out = mapping.apply(sample_rule(), &scope(&vars)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(field_names(&out[0]), vec!["proc.path", "User"]);
        assert_eq!(field_names(&out[1]), vec!["proc.name", "User"]);
    }

    #[test]
    fn test_mapping_without_match_is_identity() {
        let vars = empty_vars();
        let mapping = Transformation::FieldMapping(vec![(
            "Missing".to_string(),
            vec!["a".to_string(), "b".to_string()],
        )]);
        let out = mapping.apply(sample_rule(), &scope(&vars)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(field_names(&out[0]), vec!["Image", "User"]);
    }

    #[test]
    fn test_value_regex_rewrite() {
        let vars = empty_vars();
        let rewrite = Transformation::ValueRegexRewrite {
            pattern: "cmd".to_string(),
            replacement: "pwsh".to_string(),
        };
        let out = rewrite.apply(sample_rule(), &scope(&vars)).unwrap();
        let mut values = Vec::new();
        out[0].detections[0]
            .1
            .for_each_item(&mut |item| values.extend(item.values.clone()));
        assert!(values.contains(&SigmaValue::String(SigmaString::new("*pwsh.exe"))));
    }

    #[test]
    fn test_add_modifier_transforms_values() {
        let vars = empty_vars();
        let field_conditions = [FieldNameCondition::IncludeFields(vec!["User".to_string()])];
        let scoped = TransformationScope {
            vars: &vars,
            field_conditions: &field_conditions,
            item_conditions: &[],
        };
        let out = Transformation::AddModifier(Modifier::Contains)
            .apply(sample_rule(), &scoped)
            .unwrap();
        let mut values = Vec::new();
        out[0].detections[0]
            .1
            .for_each_item(&mut |item| values.extend(item.values.clone()));
        assert!(values.contains(&SigmaValue::String(SigmaString::new("*SYSTEM*"))));
        // The unscoped Image item keeps its endswith shape.
        assert!(values.contains(&SigmaValue::String(SigmaString::new("*cmd.exe"))));
    }

    #[test]
    fn test_remove_modifier_only_edits_chain() {
        let vars = empty_vars();
        let out = Transformation::RemoveModifier(Modifier::EndsWith)
            .apply(sample_rule(), &scope(&vars))
            .unwrap();
        let mut chains = Vec::new();
        out[0].detections[0]
            .1
            .for_each_item(&mut |item| chains.push(item.modifiers.clone()));
        assert!(chains.iter().all(|c| !c.contains(&Modifier::EndsWith)));
    }

    #[test]
    fn test_condition_rewrite_renames_selection() {
        let vars = empty_vars();
        let out = Transformation::ConditionRewrite {
            search: "selection".to_string(),
            replacement: "sel_windows".to_string(),
        }
        .apply(sample_rule(), &scope(&vars))
        .unwrap();
        assert_eq!(out[0].detections[0].0, "sel_windows");
        assert_eq!(out[0].conditions, vec!["sel_windows"]);
    }

    #[test]
    fn test_condition_rewrite_is_token_scoped() {
        let vars = empty_vars();
        let mut rule = sample_rule();
        rule.conditions = vec!["selection and selection_extra".to_string()];
        let out = Transformation::ConditionRewrite {
            search: "selection".to_string(),
            replacement: "sel".to_string(),
        }
        .apply(rule, &scope(&vars))
        .unwrap();
        assert_eq!(out[0].conditions, vec!["sel and selection_extra"]);
    }

    #[test]
    fn test_drop_detection_item() {
        let vars = empty_vars();
        let field_conditions = [FieldNameCondition::IncludeFields(vec!["User".to_string()])];
        let scoped = TransformationScope {
            vars: &vars,
            field_conditions: &field_conditions,
            item_conditions: &[],
        };
        let out = Transformation::DropDetectionItem
            .apply(sample_rule(), &scoped)
            .unwrap();
        assert_eq!(field_names(&out[0]), vec!["Image"]);
    }

    #[test]
    fn test_change_logsource_overwrites_set_fields() {
        let vars = empty_vars();
        let out = Transformation::ChangeLogsource(LogSource {
            product: Some("linux".to_string()),
            ..LogSource::default()
        })
        .apply(sample_rule(), &scope(&vars))
        .unwrap();
        assert_eq!(out[0].logsource.product.as_deref(), Some("linux"));
    }

    #[test]
    fn test_placeholder_expansion() {
        let mut vars = HashMap::new();
        vars.insert("domain".to_string(), "corp.local".to_string());
        let mut rule = sample_rule();
        rule.detections[0].1.for_each_item_mut(&mut |item| {
            if item.field.as_deref() == Some("User") {
                item.values = vec![SigmaValue::String(SigmaString::new("admin@%domain%"))];
            }
        });
        let out = Transformation::PlaceholderExpansion
            .apply(rule, &scope(&vars))
            .unwrap();
        let mut values = Vec::new();
        out[0].detections[0]
            .1
            .for_each_item(&mut |item| values.extend(item.values.clone()));
        assert!(values.contains(&SigmaValue::String(SigmaString::new("admin@corp.local"))));
    }

    #[test]
    fn test_unbound_placeholder_is_pipeline_error() {
        let vars = empty_vars();
        let mut rule = sample_rule();
        rule.detections[0].1.for_each_item_mut(&mut |item| {
            item.values = vec![SigmaValue::String(SigmaString::new("%missing%"))];
        });
        let err = Transformation::PlaceholderExpansion
            .apply(rule, &scope(&vars))
            .unwrap_err();
        assert_eq!(err.kind(), "PipelineError");
    }

    #[test]
    fn test_failure_transformation() {
        let vars = empty_vars();
        let err = Transformation::Failure("unsupported on this target".to_string())
            .apply(sample_rule(), &scope(&vars))
            .unwrap_err();
        assert_eq!(err.kind(), "PipelineError");
        assert!(err.to_string().contains("unsupported on this target"));
    }
}
