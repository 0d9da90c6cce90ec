//! Processing pipeline engine.
//!
//! A pipeline is an ordered list of guarded transformations. Items run in a
//! single linear pass; each item's predicates are evaluated fresh against the
//! current rule state, so item ordering is observable. A transformation may
//! fan one rule out into several; callers always receive a sequence.

pub mod conditions;
pub mod transformations;

use std::collections::HashMap;

use serde::Serialize;
use serde_yaml::Value as Yaml;

use crate::error::{Result, SigmaError};
use crate::modifier::Modifier;
use crate::rule::{Level, LogSource, SigmaRule};

pub use conditions::{DetectionItemCondition, FieldNameCondition, RuleCondition};
pub use transformations::{Transformation, TransformationScope};

/// How pipeline errors are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// The first failing item aborts the rule's processing.
    #[default]
    Strict,
    /// Failing items are skipped and recorded as warnings.
    Lenient,
}

/// One guarded transformation step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingItem {
    pub identifier: Option<String>,
    pub rule_conditions: Vec<RuleCondition>,
    pub field_conditions: Vec<FieldNameCondition>,
    pub item_conditions: Vec<DetectionItemCondition>,
    pub transformation: Transformation,
}

impl ProcessingItem {
    pub fn new(transformation: Transformation) -> Self {
        Self {
            identifier: None,
            rule_conditions: Vec::new(),
            field_conditions: Vec::new(),
            item_conditions: Vec::new(),
            transformation,
        }
    }

    fn applies_to(&self, rule: &SigmaRule) -> bool {
        self.rule_conditions.iter().all(|c| c.matches(rule))
    }
}

/// Result of running a pipeline over one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    /// The transformed rule sequence (fan-out aware).
    pub rules: Vec<SigmaRule>,
    /// Warnings recorded for skipped items in lenient mode.
    pub warnings: Vec<String>,
}

/// An ordered transformation sequence with a merge priority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingPipeline {
    pub name: Option<String>,
    pub priority: i32,
    pub vars: HashMap<String, String>,
    pub items: Vec<ProcessingItem>,
}

impl Default for ProcessingPipeline {
    fn default() -> Self {
        Self {
            name: None,
            priority: 0,
            vars: HashMap::new(),
            items: Vec::new(),
        }
    }
}

impl ProcessingPipeline {
    /// Merge pipelines into one linear sequence, ordered by ascending
    /// priority with insertion order breaking ties. Variable bindings from
    /// later-running pipelines shadow earlier ones.
    pub fn merge(pipelines: Vec<ProcessingPipeline>) -> ProcessingPipeline {
        let mut sorted = pipelines;
        sorted.sort_by_key(|p| p.priority);

        let mut merged = ProcessingPipeline::default();
        let mut names = Vec::new();
        for pipeline in sorted {
            if let Some(name) = pipeline.name {
                names.push(name);
            }
            merged.priority = pipeline.priority;
            merged.vars.extend(pipeline.vars);
            merged.items.extend(pipeline.items);
        }
        if !names.is_empty() {
            merged.name = Some(names.join("+"));
        }
        merged
    }

    /// Run the pipeline over one rule.
    ///
    /// Items execute strictly in order with no re-entry. In lenient mode a
    /// failing item leaves its input rule unchanged and records a warning.
    pub fn apply(&self, rule: SigmaRule, mode: ErrorMode) -> Result<PipelineOutput> {
        let mut rules = vec![rule];
        let mut warnings = Vec::new();

        for (index, item) in self.items.iter().enumerate() {
            let scope = TransformationScope {
                vars: &self.vars,
                field_conditions: &item.field_conditions,
                item_conditions: &item.item_conditions,
            };

            let mut next = Vec::with_capacity(rules.len());
            for rule in rules {
                if !item.applies_to(&rule) {
                    next.push(rule);
                    continue;
                }
                match item.transformation.apply(rule.clone(), &scope) {
                    Ok(transformed) => next.extend(transformed),
                    Err(e) => match mode {
                        ErrorMode::Strict => return Err(e),
                        ErrorMode::Lenient => {
                            let label = item
                                .identifier
                                .clone()
                                .unwrap_or_else(|| format!("item #{index}"));
                            warnings.push(format!("{label} skipped: {e}"));
                            next.push(rule);
                        }
                    },
                }
            }
            rules = next;
        }

        Ok(PipelineOutput { rules, warnings })
    }

    /// Parse a pipeline declaration from a YAML document string.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let doc: Yaml = serde_yaml::from_str(source)?;
        Self::from_yaml(&doc)
    }

    pub fn from_yaml(doc: &Yaml) -> Result<Self> {
        let mapping = doc
            .as_mapping()
            .ok_or_else(|| SigmaError::Pipeline("pipeline must be a mapping".to_string()))?;

        let mut pipeline = ProcessingPipeline::default();
        for (key, value) in mapping {
            match str_of(key, "pipeline key")? {
                "name" => pipeline.name = Some(str_of(value, "name")?.to_string()),
                "priority" => {
                    pipeline.priority = value.as_i64().ok_or_else(|| {
                        SigmaError::Pipeline("priority must be an integer".to_string())
                    })? as i32;
                }
                "vars" => {
                    let vars = value.as_mapping().ok_or_else(|| {
                        SigmaError::Pipeline("vars must be a mapping".to_string())
                    })?;
                    for (name, binding) in vars {
                        pipeline.vars.insert(
                            str_of(name, "var name")?.to_string(),
                            str_of(binding, "var value")?.to_string(),
                        );
                    }
                }
                "transformations" => {
                    let seq = value.as_sequence().ok_or_else(|| {
                        SigmaError::Pipeline("transformations must be a list".to_string())
                    })?;
                    for entry in seq {
                        pipeline.items.push(parse_processing_item(entry)?);
                    }
                }
                _ => {}
            }
        }
        Ok(pipeline)
    }
}

fn parse_processing_item(entry: &Yaml) -> Result<ProcessingItem> {
    let mapping = entry
        .as_mapping()
        .ok_or_else(|| SigmaError::Pipeline("transformation entry must be a mapping".to_string()))?;

    let kind = lookup(mapping, "type")
        .and_then(Yaml::as_str)
        .ok_or_else(|| SigmaError::Pipeline("transformation entry missing 'type'".to_string()))?;

    let transformation = match kind {
        "field_name_mapping" => {
            let spec = lookup(mapping, "mapping")
                .and_then(Yaml::as_mapping)
                .ok_or_else(|| {
                    SigmaError::Pipeline("field_name_mapping requires 'mapping'".to_string())
                })?;
            let mut pairs = Vec::with_capacity(spec.len());
            for (source, targets) in spec {
                let source = str_of(source, "mapping source")?.to_string();
                let targets = match targets {
                    Yaml::Sequence(seq) => seq
                        .iter()
                        .map(|t| str_of(t, "mapping target").map(str::to_string))
                        .collect::<Result<Vec<_>>>()?,
                    scalar => vec![str_of(scalar, "mapping target")?.to_string()],
                };
                pairs.push((source, targets));
            }
            Transformation::FieldMapping(pairs)
        }
        "value_regex" => Transformation::ValueRegexRewrite {
            pattern: required_str(mapping, "pattern")?,
            replacement: required_str(mapping, "replacement")?,
        },
        "add_modifier" => Transformation::AddModifier(parse_modifier(mapping)?),
        "remove_modifier" => Transformation::RemoveModifier(parse_modifier(mapping)?),
        "condition_rewrite" => Transformation::ConditionRewrite {
            search: required_str(mapping, "search")?,
            replacement: required_str(mapping, "replacement")?,
        },
        "drop_detection_item" => Transformation::DropDetectionItem,
        "change_logsource" => Transformation::ChangeLogsource(parse_logsource(mapping)),
        "placeholder_expansion" => Transformation::PlaceholderExpansion,
        "failure" => Transformation::Failure(required_str(mapping, "message")?),
        other => {
            return Err(SigmaError::Pipeline(format!(
                "unknown transformation type '{other}'"
            )));
        }
    };

    let mut item = ProcessingItem::new(transformation);
    item.identifier = lookup(mapping, "id")
        .and_then(Yaml::as_str)
        .map(str::to_string);

    if let Some(conds) = lookup(mapping, "rule_conditions") {
        for cond in list_of(conds, "rule_conditions")? {
            item.rule_conditions.push(parse_rule_condition(cond)?);
        }
    }
    if let Some(conds) = lookup(mapping, "field_name_conditions") {
        for cond in list_of(conds, "field_name_conditions")? {
            item.field_conditions.push(parse_field_condition(cond)?);
        }
    }
    if let Some(conds) = lookup(mapping, "detection_item_conditions") {
        for cond in list_of(conds, "detection_item_conditions")? {
            item.item_conditions.push(parse_item_condition(cond)?);
        }
    }

    Ok(item)
}

fn parse_rule_condition(entry: &Yaml) -> Result<RuleCondition> {
    let mapping = entry
        .as_mapping()
        .ok_or_else(|| SigmaError::Pipeline("rule condition must be a mapping".to_string()))?;
    let kind = lookup(mapping, "type")
        .and_then(Yaml::as_str)
        .ok_or_else(|| SigmaError::Pipeline("rule condition missing 'type'".to_string()))?;
    match kind {
        "logsource" => Ok(RuleCondition::Logsource(parse_logsource(mapping))),
        "level_at_least" => {
            let level = required_str(mapping, "level")?;
            Ok(RuleCondition::LevelAtLeast(Level::parse(&level)?))
        }
        "contains_tag" => Ok(RuleCondition::ContainsTag(required_str(mapping, "tag")?)),
        "rule_id_in" => {
            let ids = lookup(mapping, "ids")
                .ok_or_else(|| SigmaError::Pipeline("rule_id_in requires 'ids'".to_string()))?;
            let ids = list_of(ids, "ids")?
                .iter()
                .map(|v| str_of(v, "rule id").map(str::to_string))
                .collect::<Result<Vec<_>>>()?;
            Ok(RuleCondition::RuleIdIn(ids))
        }
        other => Err(SigmaError::Pipeline(format!(
            "unknown rule condition type '{other}'"
        ))),
    }
}

fn parse_field_condition(entry: &Yaml) -> Result<FieldNameCondition> {
    let mapping = entry
        .as_mapping()
        .ok_or_else(|| SigmaError::Pipeline("field condition must be a mapping".to_string()))?;
    let kind = lookup(mapping, "type")
        .and_then(Yaml::as_str)
        .ok_or_else(|| SigmaError::Pipeline("field condition missing 'type'".to_string()))?;
    let fields = lookup(mapping, "fields")
        .ok_or_else(|| SigmaError::Pipeline(format!("{kind} requires 'fields'")))?;
    let fields = list_of(fields, "fields")?
        .iter()
        .map(|v| str_of(v, "field name").map(str::to_string))
        .collect::<Result<Vec<_>>>()?;
    match kind {
        "include_fields" => Ok(FieldNameCondition::IncludeFields(fields)),
        "exclude_fields" => Ok(FieldNameCondition::ExcludeFields(fields)),
        other => Err(SigmaError::Pipeline(format!(
            "unknown field condition type '{other}'"
        ))),
    }
}

fn parse_item_condition(entry: &Yaml) -> Result<DetectionItemCondition> {
    let mapping = entry
        .as_mapping()
        .ok_or_else(|| SigmaError::Pipeline("item condition must be a mapping".to_string()))?;
    let kind = lookup(mapping, "type")
        .and_then(Yaml::as_str)
        .ok_or_else(|| SigmaError::Pipeline("item condition missing 'type'".to_string()))?;
    match kind {
        "match_string" => Ok(DetectionItemCondition::MatchString(required_str(
            mapping, "pattern",
        )?)),
        "is_keyword" => Ok(DetectionItemCondition::IsKeyword),
        "has_modifier" => Ok(DetectionItemCondition::HasModifier(parse_modifier(mapping)?)),
        other => Err(SigmaError::Pipeline(format!(
            "unknown item condition type '{other}'"
        ))),
    }
}

fn parse_modifier(mapping: &serde_yaml::Mapping) -> Result<Modifier> {
    let name = lookup(mapping, "modifier")
        .and_then(Yaml::as_str)
        .ok_or_else(|| SigmaError::Pipeline("missing 'modifier'".to_string()))?;
    Modifier::parse(name)
}

fn parse_logsource(mapping: &serde_yaml::Mapping) -> LogSource {
    let get = |key: &str| {
        lookup(mapping, key)
            .and_then(Yaml::as_str)
            .map(str::to_string)
    };
    LogSource {
        category: get("category"),
        product: get("product"),
        service: get("service"),
        definition: get("definition"),
    }
}

fn lookup<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> Option<&'a Yaml> {
    mapping
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn str_of<'a>(v: &'a Yaml, what: &str) -> Result<&'a str> {
    v.as_str()
        .ok_or_else(|| SigmaError::Pipeline(format!("{what} must be a string")))
}

fn list_of<'a>(v: &'a Yaml, what: &str) -> Result<&'a Vec<Yaml>> {
    v.as_sequence()
        .ok_or_else(|| SigmaError::Pipeline(format!("{what} must be a list")))
}

fn required_str(mapping: &serde_yaml::Mapping, key: &str) -> Result<String> {
    lookup(mapping, key)
        .and_then(Yaml::as_str)
        .map(str::to_string)
        .ok_or_else(|| SigmaError::Pipeline(format!("missing '{key}'")))
}
