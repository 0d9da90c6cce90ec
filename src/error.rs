//! Error types and structured diagnostics for the converter.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SigmaError>;

/// Byte span within a condition expression string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Errors produced while parsing, transforming, or converting rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SigmaError {
    /// Malformed condition text: unbalanced parentheses, dangling operator,
    /// unknown token.
    #[error("syntax error at {span}: {message}")]
    Syntax { message: String, span: Span },

    /// Unresolved selection name, empty wildcard match, or out-of-range
    /// quantifier count.
    #[error("reference error: {message}")]
    Reference { message: String, span: Option<Span> },

    /// Misconfigured pipeline predicate or contradictory transformation.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// The backend declared no capability for a construct the rule uses.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A correlation rule references a base rule that cannot be resolved.
    #[error("correlation resolution error: {0}")]
    CorrelationResolution(String),

    /// Structural problems in the rule document itself.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("unknown modifier '{0}'")]
    UnknownModifier(String),

    #[error("modifier error: {0}")]
    Modifier(String),

    #[error("YAML parsing error: {0}")]
    Yaml(String),
}

impl SigmaError {
    /// Stable diagnostic kind identifier for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            SigmaError::Syntax { .. } => "SyntaxError",
            SigmaError::Reference { .. } => "ReferenceError",
            SigmaError::Pipeline(_) => "PipelineError",
            SigmaError::UnsupportedFeature(_) => "UnsupportedFeatureError",
            SigmaError::CorrelationResolution(_) => "CorrelationResolutionError",
            SigmaError::InvalidRule(_) => "InvalidRuleError",
            SigmaError::InvalidValue(_) => "InvalidValueError",
            SigmaError::UnknownModifier(_) => "UnknownModifierError",
            SigmaError::Modifier(_) => "ModifierError",
            SigmaError::Yaml(_) => "YamlError",
        }
    }

    /// The offending source span within the condition text, if any.
    pub fn span(&self) -> Option<Span> {
        match self {
            SigmaError::Syntax { span, .. } => Some(*span),
            SigmaError::Reference { span, .. } => *span,
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for SigmaError {
    fn from(err: serde_yaml::Error) -> Self {
        SigmaError::Yaml(err.to_string())
    }
}

/// Processing phase in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Parse,
    Pipeline,
    Conversion,
    Correlation,
}

/// Structured diagnostic attached to a rule's conversion outcome.
///
/// Batch callers collect these instead of aborting the whole run. The shape
/// is stable so reports can be serialized with `serde_json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub rule_id: Option<String>,
    pub phase: Phase,
    pub kind: String,
    pub message: String,
    pub source_span: Option<Span>,
}

impl Diagnostic {
    pub fn from_error(rule_id: Option<String>, phase: Phase, err: &SigmaError) -> Self {
        Self {
            rule_id,
            phase,
            kind: err.kind().to_string(),
            message: err.to_string(),
            source_span: err.span(),
        }
    }
}
