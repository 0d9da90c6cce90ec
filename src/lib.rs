//! Compile Sigma detection rules into backend-native query strings.
//!
//! The crate is laid out as a small compiler: the condition [`parser`]
//! produces an [`ast`] over a rule's named detections, the [`pipeline`]
//! rewrites the rule for a target log schema, and the [`backend`] engine
//! negotiates capabilities and renders the tree into query text.
//! [`correlation`] resolves cross-rule time-window queries over
//! already-converted rules, and [`collection`] drives batch conversion with
//! structured diagnostics.
//!
//! # Example
//!
//! ```
//! use sigma_converter::{ConversionEngine, GenericBackend, SigmaRule};
//!
//! let rule = SigmaRule::from_yaml_str(
//!     r#"
//! title: Suspicious Network Logon
//! detection:
//!     selection:
//!         EventID: 4624
//!         LogonType: 3
//!     filter:
//!         AccountName: ANONYMOUS LOGON
//!     condition: selection and not filter
//! "#,
//! )
//! .unwrap();
//!
//! let engine = ConversionEngine::new(GenericBackend::new());
//! let queries = engine.convert_rule(&rule).unwrap();
//! assert_eq!(
//!     queries[0],
//!     r#"EventID=4624 AND LogonType=3 AND NOT (AccountName="ANONYMOUS LOGON")"#
//! );
//! ```

pub mod ast;
pub mod backend;
pub mod collection;
pub mod correlation;
pub mod error;
pub mod modifier;
pub mod parser;
pub mod pipeline;
pub mod rule;
pub mod value;

pub use ast::{ConditionAst, ConditionVisitor, QuantifierCount, SelectionSet};
pub use backend::{
    Backend, Capabilities, ConversionEngine, Fragment, GenericBackend, Precedence, QueryPacking,
};
pub use collection::{ConversionOptions, ConversionReport, SigmaCollection};
pub use correlation::{AggregateOp, ConditionPredicate, CorrelationKind, CorrelationRule};
pub use error::{Diagnostic, Phase, Result, SigmaError, Span};
pub use modifier::{Modifier, ValueLinking};
pub use parser::parse_condition;
pub use pipeline::{
    DetectionItemCondition, ErrorMode, FieldNameCondition, ProcessingItem, ProcessingPipeline,
    RuleCondition, Transformation,
};
pub use rule::{Detection, DetectionItem, Level, LogSource, SigmaRule, Status};
pub use value::{SigmaNumber, SigmaString, SigmaValue, Timespan, TimespanUnit, ValueKind};
