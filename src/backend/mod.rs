//! Capability-aware backend conversion engine.
//!
//! A backend declares what it can render; the engine checks every construct a
//! rule uses against that declaration before emitting any text, then walks
//! the resolved condition tree producing precedence-tracked fragments.
//! Constructs the target grammar cannot express inline are collected as
//! deferred fragments and appended after the main expression in the order
//! they were encountered.

pub mod generic;

use std::collections::HashSet;

use serde::Serialize;

use crate::ast::{ConditionAst, ConditionVisitor, QuantifierCount};
use crate::correlation::CorrelationRule;
use crate::error::{Result, SigmaError};
use crate::modifier::{Modifier, ValueLinking};
use crate::parser::parse_condition;
use crate::rule::{Detection, DetectionItem, SigmaRule};
use crate::value::{SigmaValue, ValueKind};

pub use generic::GenericBackend;

/// How multiple query strings are packed into output units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryPacking {
    /// One output unit per query.
    PerQuery,
    /// All queries joined into a single unit.
    Joined { separator: String },
}

impl Default for QueryPacking {
    fn default() -> Self {
        QueryPacking::PerQuery
    }
}

/// What a backend declares it can render. Consumed by negotiation, never
/// guessed.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub modifiers: HashSet<Modifier>,
    pub value_kinds: HashSet<ValueKind>,
    pub quantifiers: bool,
    pub in_list: bool,
    pub inline_regex: bool,
    pub deferred_regex: bool,
    pub packing: QueryPacking,
}

impl Capabilities {
    pub fn supports_modifier(&self, m: Modifier) -> bool {
        self.modifiers.contains(&m)
    }

    pub fn supports_value_kind(&self, k: ValueKind) -> bool {
        match k {
            ValueKind::Regex => {
                self.value_kinds.contains(&ValueKind::Regex)
                    && (self.inline_regex || self.deferred_regex)
            }
            other => self.value_kinds.contains(&other),
        }
    }
}

/// Operator precedence of a rendered fragment, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Or,
    And,
    Not,
    Atom,
}

/// A rendered piece of query text with the precedence of its outermost
/// operator, so parents can parenthesize only when actually required.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub precedence: Precedence,
}

impl Fragment {
    pub fn atom(text: String) -> Self {
        Fragment {
            text,
            precedence: Precedence::Atom,
        }
    }

    /// The fragment's text, parenthesized if it would misparse under an
    /// enclosing operator of precedence `ctx`.
    pub fn text_under(&self, ctx: Precedence) -> String {
        if self.precedence < ctx {
            format!("({})", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// A clause that must follow the main filter expression. `negated` records
/// whether the walk reached the deferred leaf under an odd number of
/// negations.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredFragment {
    pub text: String,
    pub negated: bool,
}

/// Target-query-language code generator.
pub trait Backend {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &Capabilities;

    fn and_token(&self) -> &str;
    fn or_token(&self) -> &str;

    /// Render a negation around `inner`.
    fn render_not(&self, inner: &Fragment) -> Fragment;

    /// Render one `field <op> value` comparison.
    fn render_comparison(&self, field: &str, value: &SigmaValue) -> Result<String>;

    /// Render an unscoped keyword match.
    fn render_keyword(&self, value: &SigmaValue) -> Result<String>;

    /// Render a multi-value membership test. Only called when the
    /// capability set declares `in_list` and every value is eligible.
    fn render_in_list(&self, field: &str, values: &[&SigmaValue]) -> Result<String>;

    /// Whether a value may appear inside an IN list.
    fn in_list_eligible(&self, value: &SigmaValue) -> bool;

    /// Placeholder emitted in the main expression for a fully deferred leaf.
    fn deferred_placeholder(&self) -> &str;

    /// Render a deferred regex clause. A negated clause must exclude
    /// matching events rather than keep them.
    fn render_deferred_regex(&self, field: Option<&str>, pattern: &str, negated: bool) -> String;

    /// Separator between the main expression and each deferred fragment.
    fn deferred_separator(&self) -> &str;

    /// Render a resolved correlation over already-converted base queries.
    fn render_correlation(&self, correlation: &CorrelationRule, base_queries: &[String])
        -> Result<String>;
}

/// Walks resolved rules through a backend, negotiating capabilities first.
pub struct ConversionEngine<B: Backend> {
    backend: B,
}

impl<B: Backend> ConversionEngine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Convert one rule into one query string per condition expression.
    ///
    /// All conditions are parsed and the whole rule is negotiated against
    /// the backend's capabilities before any query text is produced.
    pub fn convert_rule(&self, rule: &SigmaRule) -> Result<Vec<String>> {
        let names = rule.detection_names();

        let mut asts = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let ast = parse_condition(condition, &names)?;
            asts.push(ast.resolve(&names)?);
        }

        self.negotiate(rule, &asts)?;

        let mut queries = Vec::with_capacity(asts.len());
        for ast in &asts {
            let mut visitor = RenderVisitor {
                backend: &self.backend,
                rule,
                deferred: Vec::new(),
                negation_depth: 0,
                not_marks: Vec::new(),
            };
            let fragment = ast.translate(&mut visitor)?;
            queries.push(compose(&self.backend, fragment, visitor.deferred));
        }
        Ok(queries)
    }

    /// Apply a packing policy to converted queries.
    pub fn pack(&self, queries: Vec<String>, packing: &QueryPacking) -> Vec<String> {
        match packing {
            QueryPacking::PerQuery => queries,
            QueryPacking::Joined { separator } => {
                if queries.is_empty() {
                    queries
                } else {
                    vec![queries.join(separator)]
                }
            }
        }
    }

    fn negotiate(&self, rule: &SigmaRule, asts: &[ConditionAst]) -> Result<()> {
        let caps = self.backend.capabilities();

        for (name, detection) in &rule.detections {
            let mut unsupported = None;
            detection.for_each_item(&mut |item| {
                if unsupported.is_some() {
                    return;
                }
                for modifier in &item.modifiers {
                    if !caps.supports_modifier(*modifier) {
                        unsupported = Some(format!(
                            "backend '{}' does not support the '{}' modifier (selection '{name}')",
                            self.backend.name(),
                            modifier.as_str(),
                        ));
                        return;
                    }
                }
                for value in &item.values {
                    let kind = value.kind();
                    if !caps.supports_value_kind(kind) {
                        unsupported = Some(format!(
                            "backend '{}' does not support {kind:?} values (selection '{name}')",
                            self.backend.name(),
                        ));
                        return;
                    }
                }
            });
            if let Some(message) = unsupported {
                return Err(SigmaError::UnsupportedFeature(message));
            }
        }

        if !caps.quantifiers {
            for ast in asts {
                if uses_quantifier(ast) {
                    return Err(SigmaError::UnsupportedFeature(format!(
                        "backend '{}' does not support quantified selections",
                        self.backend.name(),
                    )));
                }
            }
        }

        Ok(())
    }
}

fn uses_quantifier(ast: &ConditionAst) -> bool {
    match ast {
        ConditionAst::Quantifier(..) => true,
        ConditionAst::LogicalAnd(children) | ConditionAst::LogicalOr(children) => {
            children.iter().any(uses_quantifier)
        }
        ConditionAst::Not(inner) => uses_quantifier(inner),
        ConditionAst::SelectionRef(_) | ConditionAst::WildcardRef(_) => false,
    }
}

fn compose<B: Backend>(backend: &B, fragment: Fragment, deferred: Vec<DeferredFragment>) -> String {
    let mut query = fragment.text;
    for d in deferred {
        query.push_str(backend.deferred_separator());
        query.push_str(&d.text);
    }
    query
}

struct RenderVisitor<'a, B: Backend> {
    backend: &'a B,
    rule: &'a SigmaRule,
    deferred: Vec<DeferredFragment>,
    negation_depth: usize,
    not_marks: Vec<usize>,
}

impl<'a, B: Backend> RenderVisitor<'a, B> {
    fn combine(&self, children: Vec<Fragment>, precedence: Precedence) -> Fragment {
        let mut children = children;
        if children.len() == 1 {
            return children.remove(0);
        }
        let token = match precedence {
            Precedence::And => self.backend.and_token(),
            _ => self.backend.or_token(),
        };
        let text = children
            .iter()
            .map(|c| c.text_under(precedence))
            .collect::<Vec<_>>()
            .join(token);
        Fragment { text, precedence }
    }

    fn render_selection(&mut self, name: &str) -> Result<Fragment> {
        let detection = self.rule.detection(name).ok_or_else(|| SigmaError::Reference {
            message: format!("unknown selection '{name}'"),
            span: None,
        })?;
        self.render_detection(detection)
    }

    fn render_detection(&mut self, detection: &Detection) -> Result<Fragment> {
        if detection.item_count() == 0 {
            return Err(SigmaError::InvalidRule(
                "selection has no remaining detection items".to_string(),
            ));
        }
        match detection {
            Detection::AllOf(children) => {
                let fragments = children
                    .iter()
                    .map(|c| self.render_detection(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.combine(fragments, Precedence::And))
            }
            Detection::AnyOf(children) => {
                let fragments = children
                    .iter()
                    .map(|c| self.render_detection(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.combine(fragments, Precedence::Or))
            }
            Detection::Item(item) => self.render_item(item),
        }
    }

    fn render_item(&mut self, item: &DetectionItem) -> Result<Fragment> {
        if item.values.is_empty() {
            return Err(SigmaError::InvalidRule(
                "detection item has no values".to_string(),
            ));
        }

        let caps = self.backend.capabilities();

        // Multi-value OR leaves collapse into an IN list when eligible.
        if item.linking == ValueLinking::Or
            && item.values.len() > 1
            && caps.in_list
            && item.field.is_some()
            && item.values.iter().all(|v| self.backend.in_list_eligible(v))
        {
            if let Some(field) = &item.field {
                let refs: Vec<&SigmaValue> = item.values.iter().collect();
                return Ok(Fragment::atom(self.backend.render_in_list(field, &refs)?));
            }
        }

        let mut parts = Vec::with_capacity(item.values.len());
        for value in &item.values {
            parts.push(self.render_value(item.field.as_deref(), value)?);
        }
        let precedence = match item.linking {
            ValueLinking::Or => Precedence::Or,
            ValueLinking::And => Precedence::And,
        };
        Ok(self.combine(parts, precedence))
    }

    fn render_value(&mut self, field: Option<&str>, value: &SigmaValue) -> Result<Fragment> {
        let caps = self.backend.capabilities();

        if let SigmaValue::Regex(pattern) = value {
            if !caps.inline_regex {
                // Cannot appear inline: defer and hold its place. The
                // placeholder carries no polarity, so the clause itself is
                // rendered negated when the walk is inside a negation.
                let negated = self.negation_depth % 2 == 1;
                self.deferred.push(DeferredFragment {
                    text: self.backend.render_deferred_regex(field, pattern, negated),
                    negated,
                });
                return Ok(Fragment::atom(self.backend.deferred_placeholder().to_string()));
            }
        }

        let text = match field {
            Some(field) => self.backend.render_comparison(field, value)?,
            None => self.backend.render_keyword(value)?,
        };
        Ok(Fragment::atom(text))
    }

    /// Whether `fragment` is a lone deferred placeholder or an OR chain of
    /// them, with no inline terms mixed in.
    fn is_deferred_alternation(&self, fragment: &Fragment) -> bool {
        let placeholder = self.backend.deferred_placeholder();
        if fragment.text == placeholder {
            return true;
        }
        fragment.precedence == Precedence::Or
            && fragment
                .text
                .split(self.backend.or_token())
                .all(|part| part == placeholder)
    }
}

impl<'a, B: Backend> ConditionVisitor for RenderVisitor<'a, B> {
    type Output = Fragment;

    fn visit_selection(&mut self, name: &str) -> Result<Fragment> {
        self.render_selection(name)
    }

    fn visit_and(&mut self, children: Vec<Fragment>) -> Result<Fragment> {
        Ok(self.combine(children, Precedence::And))
    }

    fn visit_or(&mut self, children: Vec<Fragment>) -> Result<Fragment> {
        Ok(self.combine(children, Precedence::Or))
    }

    fn enter_not(&mut self) {
        self.not_marks.push(self.deferred.len());
        self.negation_depth += 1;
    }

    fn visit_not(&mut self, inner: Fragment) -> Result<Fragment> {
        let mark = self.not_marks.pop().unwrap_or(0);
        self.negation_depth = self.negation_depth.saturating_sub(1);

        if self.deferred.len() == mark {
            return Ok(self.backend.render_not(&inner));
        }

        // The operand produced deferred clauses, already rendered with the
        // flipped polarity. Deferred clauses conjoin after the main
        // expression, so the negation is absorbed only when the operand is
        // nothing but deferred placeholders in alternation (De Morgan turns
        // the alternation into exactly that conjunction). Anything else
        // cannot be expressed with post-filters.
        if self.is_deferred_alternation(&inner) {
            return Ok(Fragment::atom(self.backend.deferred_placeholder().to_string()));
        }
        Err(SigmaError::UnsupportedFeature(format!(
            "backend '{}' cannot negate an expression that combines deferred clauses with other terms",
            self.backend.name(),
        )))
    }

    fn visit_quantifier(&mut self, count: QuantifierCount, names: &[String]) -> Result<Fragment> {
        let members = names
            .iter()
            .map(|n| self.render_selection(n))
            .collect::<Result<Vec<_>>>()?;

        match count {
            QuantifierCount::All => Ok(self.combine(members, Precedence::And)),
            QuantifierCount::Count(1) => Ok(self.combine(members, Precedence::Or)),
            QuantifierCount::Count(n) if n as usize == members.len() => {
                Ok(self.combine(members, Precedence::And))
            }
            QuantifierCount::Count(n) => {
                // At least n of m: OR over every size-n member combination.
                let combos = combinations(members.len(), n as usize);
                let groups = combos
                    .into_iter()
                    .map(|combo| {
                        let picked = combo.into_iter().map(|i| members[i].clone()).collect();
                        self.combine(picked, Precedence::And)
                    })
                    .collect();
                Ok(self.combine(groups, Precedence::Or))
            }
        }
    }
}

/// All size-`k` index combinations of `0..n`, in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn rec(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            rec(i + 1, n, k, current, out);
            current.pop();
        }
    }
    rec(0, n, k, &mut current, &mut out);
    out
}
