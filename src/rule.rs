//! Rule model and YAML ingestion.
//!
//! Detections follow the schema's grouping grammar: a keyed mapping combines
//! its entries with AND, a sequence combines its entries with OR, and both
//! nest arbitrarily. Field keys carry modifier chains (`Image|endswith`)
//! which are applied to the values at ingestion time; the parsed modifier
//! list stays on the item for capability negotiation.

use serde::Serialize;
use serde_yaml::Value as Yaml;

use crate::error::{Result, SigmaError};
use crate::modifier::{apply_modifiers, Modifier, ValueLinking};
use crate::value::SigmaValue;

/// Rule maturity as declared in rule metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stable,
    Test,
    Experimental,
    Deprecated,
    Unsupported,
}

impl Status {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stable" => Ok(Status::Stable),
            "test" => Ok(Status::Test),
            "experimental" => Ok(Status::Experimental),
            "deprecated" => Ok(Status::Deprecated),
            "unsupported" => Ok(Status::Unsupported),
            other => Err(SigmaError::InvalidRule(format!("unknown status '{other}'"))),
        }
    }
}

/// Rule severity as declared in rule metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Level {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "informational" => Ok(Level::Informational),
            "low" => Ok(Level::Low),
            "medium" => Ok(Level::Medium),
            "high" => Ok(Level::High),
            "critical" => Ok(Level::Critical),
            other => Err(SigmaError::InvalidRule(format!("unknown level '{other}'"))),
        }
    }
}

/// Log source descriptor used by pipeline predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSource {
    pub category: Option<String>,
    pub product: Option<String>,
    pub service: Option<String>,
    pub definition: Option<String>,
}

impl LogSource {
    fn from_yaml(v: &Yaml) -> Result<Self> {
        let mapping = v
            .as_mapping()
            .ok_or_else(|| SigmaError::InvalidRule("logsource must be a mapping".to_string()))?;
        let mut logsource = LogSource::default();
        for (key, value) in mapping {
            let key = yaml_str(key, "logsource key")?;
            let value = Some(yaml_str(value, "logsource value")?.to_string());
            match key {
                "category" => logsource.category = value,
                "product" => logsource.product = value,
                "service" => logsource.service = value,
                "definition" => logsource.definition = value,
                _ => {}
            }
        }
        Ok(logsource)
    }

    /// True when every field set on `other` matches this log source.
    pub fn matches(&self, other: &LogSource) -> bool {
        fn field_ok(mine: &Option<String>, wanted: &Option<String>) -> bool {
            wanted.is_none() || mine == wanted
        }
        field_ok(&self.category, &other.category)
            && field_ok(&self.product, &other.product)
            && field_ok(&self.service, &other.service)
    }
}

/// A single field comparison inside a detection.
///
/// `field` is `None` for unscoped keyword matches. Values have already been
/// transformed by the modifier chain; `modifiers` records the chain as
/// written so backends can negotiate support.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionItem {
    pub field: Option<String>,
    pub modifiers: Vec<Modifier>,
    pub values: Vec<SigmaValue>,
    pub linking: ValueLinking,
}

impl DetectionItem {
    pub fn new(field: Option<String>, modifiers: Vec<Modifier>, raw: Vec<SigmaValue>) -> Result<Self> {
        let (values, linking) = apply_modifiers(raw, &modifiers)?;
        Ok(Self {
            field,
            modifiers,
            values,
            linking,
        })
    }
}

/// Recursively nested detection structure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Detection {
    /// Keyed grouping: every child must match.
    AllOf(Vec<Detection>),
    /// Sequential grouping: any child may match.
    AnyOf(Vec<Detection>),
    /// Leaf comparison.
    Item(DetectionItem),
}

impl Detection {
    pub fn from_yaml(v: &Yaml) -> Result<Self> {
        match v {
            Yaml::Mapping(mapping) => {
                let mut children = Vec::with_capacity(mapping.len());
                for (key, value) in mapping {
                    let key = yaml_str(key, "detection field key")?;
                    children.push(Detection::Item(item_from_entry(key, value)?));
                }
                if children.is_empty() {
                    return Err(SigmaError::InvalidRule(
                        "empty detection mapping".to_string(),
                    ));
                }
                Ok(Detection::AllOf(children))
            }
            Yaml::Sequence(seq) => {
                let mut children = Vec::with_capacity(seq.len());
                for entry in seq {
                    match entry {
                        Yaml::Mapping(_) | Yaml::Sequence(_) => {
                            children.push(Detection::from_yaml(entry)?)
                        }
                        scalar => children.push(Detection::Item(DetectionItem::new(
                            None,
                            Vec::new(),
                            vec![SigmaValue::from_yaml(scalar)?],
                        )?)),
                    }
                }
                if children.is_empty() {
                    return Err(SigmaError::InvalidRule(
                        "empty detection sequence".to_string(),
                    ));
                }
                Ok(Detection::AnyOf(children))
            }
            scalar => Ok(Detection::Item(DetectionItem::new(
                None,
                Vec::new(),
                vec![SigmaValue::from_yaml(scalar)?],
            )?)),
        }
    }

    pub fn for_each_item(&self, f: &mut impl FnMut(&DetectionItem)) {
        match self {
            Detection::AllOf(children) | Detection::AnyOf(children) => {
                for child in children {
                    child.for_each_item(f);
                }
            }
            Detection::Item(item) => f(item),
        }
    }

    pub fn for_each_item_mut(&mut self, f: &mut impl FnMut(&mut DetectionItem)) {
        match self {
            Detection::AllOf(children) | Detection::AnyOf(children) => {
                for child in children {
                    child.for_each_item_mut(f);
                }
            }
            Detection::Item(item) => f(item),
        }
    }

    /// Remove leaf items not matching `keep`, pruning groups emptied by the
    /// removal.
    pub fn retain_items(&mut self, keep: &impl Fn(&DetectionItem) -> bool) {
        if let Detection::AllOf(children) | Detection::AnyOf(children) = self {
            children.retain_mut(|child| {
                child.retain_items(keep);
                !child.is_empty(keep)
            });
        }
    }

    fn is_empty(&self, keep: &impl Fn(&DetectionItem) -> bool) -> bool {
        match self {
            Detection::AllOf(children) | Detection::AnyOf(children) => children.is_empty(),
            Detection::Item(item) => !keep(item),
        }
    }

    pub fn item_count(&self) -> usize {
        let mut count = 0;
        self.for_each_item(&mut |_| count += 1);
        count
    }
}

/// Parse a `Field|modifier|modifier` detection key.
fn parse_field_spec(key: &str) -> Result<(Option<String>, Vec<Modifier>)> {
    let mut parts = key.split('|');
    let field = match parts.next() {
        Some("") | None => None,
        Some(name) => Some(name.to_string()),
    };
    let modifiers = parts.map(Modifier::parse).collect::<Result<Vec<_>>>()?;
    Ok((field, modifiers))
}

fn item_from_entry(key: &str, value: &Yaml) -> Result<DetectionItem> {
    let (field, modifiers) = parse_field_spec(key)?;
    let raw = match value {
        Yaml::Sequence(seq) => seq
            .iter()
            .map(SigmaValue::from_yaml)
            .collect::<Result<Vec<_>>>()?,
        scalar => vec![SigmaValue::from_yaml(scalar)?],
    };
    DetectionItem::new(field, modifiers, raw)
}

/// A parsed rule: metadata, named detections, raw condition expressions.
///
/// Pipeline passes are the only mutators; conversion reads the final state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SigmaRule {
    pub id: Option<String>,
    pub title: String,
    pub status: Option<Status>,
    pub level: Option<Level>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub references: Vec<String>,
    pub tags: Vec<String>,
    pub logsource: LogSource,
    /// Named detections in document order.
    pub detections: Vec<(String, Detection)>,
    /// Raw condition expressions, each converted independently.
    pub conditions: Vec<String>,
    pub fields: Vec<String>,
    pub falsepositives: Vec<String>,
}

impl SigmaRule {
    /// Parse a rule from a YAML document string.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let doc: Yaml = serde_yaml::from_str(source)?;
        Self::from_yaml(&doc)
    }

    /// Parse a rule from an already-deserialized YAML document.
    pub fn from_yaml(doc: &Yaml) -> Result<Self> {
        let mapping = doc
            .as_mapping()
            .ok_or_else(|| SigmaError::InvalidRule("rule must be a mapping".to_string()))?;

        let mut rule = SigmaRule {
            id: None,
            title: String::new(),
            status: None,
            level: None,
            description: None,
            author: None,
            references: Vec::new(),
            tags: Vec::new(),
            logsource: LogSource::default(),
            detections: Vec::new(),
            conditions: Vec::new(),
            fields: Vec::new(),
            falsepositives: Vec::new(),
        };
        let mut saw_detection = false;

        for (key, value) in mapping {
            let key = yaml_str(key, "rule key")?;
            match key {
                "id" => rule.id = Some(yaml_str(value, "id")?.to_string()),
                "title" => rule.title = yaml_str(value, "title")?.to_string(),
                "status" => rule.status = Some(Status::parse(yaml_str(value, "status")?)?),
                "level" => rule.level = Some(Level::parse(yaml_str(value, "level")?)?),
                "description" => {
                    rule.description = Some(yaml_str(value, "description")?.to_string())
                }
                "author" => rule.author = Some(yaml_str(value, "author")?.to_string()),
                "references" => rule.references = yaml_str_list(value, "references")?,
                "tags" => rule.tags = yaml_str_list(value, "tags")?,
                "fields" => rule.fields = yaml_str_list(value, "fields")?,
                "falsepositives" => rule.falsepositives = yaml_str_list(value, "falsepositives")?,
                "logsource" => rule.logsource = LogSource::from_yaml(value)?,
                "detection" => {
                    saw_detection = true;
                    parse_detection_block(value, &mut rule)?;
                }
                _ => {}
            }
        }

        if rule.title.is_empty() {
            return Err(SigmaError::InvalidRule("missing title".to_string()));
        }
        if !saw_detection {
            return Err(SigmaError::InvalidRule(
                "missing detection section".to_string(),
            ));
        }
        if rule.detections.is_empty() {
            return Err(SigmaError::InvalidRule(
                "detection section defines no selections".to_string(),
            ));
        }
        if rule.conditions.is_empty() {
            return Err(SigmaError::InvalidRule("missing condition".to_string()));
        }

        Ok(rule)
    }

    /// Names of all detections, in document order.
    pub fn detection_names(&self) -> Vec<String> {
        self.detections.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn detection(&self, name: &str) -> Option<&Detection> {
        self.detections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }
}

fn parse_detection_block(value: &Yaml, rule: &mut SigmaRule) -> Result<()> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| SigmaError::InvalidRule("detection must be a mapping".to_string()))?;

    for (key, entry) in mapping {
        let key = yaml_str(key, "detection key")?;
        if key == "condition" {
            match entry {
                Yaml::String(s) => rule.conditions.push(s.clone()),
                Yaml::Sequence(seq) => {
                    for c in seq {
                        rule.conditions.push(yaml_str(c, "condition")?.to_string());
                    }
                }
                _ => {
                    return Err(SigmaError::InvalidRule(
                        "condition must be a string or list of strings".to_string(),
                    ));
                }
            }
        } else {
            rule.detections
                .push((key.to_string(), Detection::from_yaml(entry)?));
        }
    }
    Ok(())
}

fn yaml_str<'a>(v: &'a Yaml, what: &str) -> Result<&'a str> {
    v.as_str()
        .ok_or_else(|| SigmaError::InvalidRule(format!("{what} must be a string")))
}

fn yaml_str_list(v: &Yaml, what: &str) -> Result<Vec<String>> {
    let seq = v
        .as_sequence()
        .ok_or_else(|| SigmaError::InvalidRule(format!("{what} must be a list")))?;
    seq.iter()
        .map(|entry| yaml_str(entry, what).map(str::to_string))
        .collect()
}
