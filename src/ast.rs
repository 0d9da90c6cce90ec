//! Condition AST, wildcard resolution, and the generic tree walk shared by
//! the pipeline and the backend conversion engine.

use serde::Serialize;

use crate::error::{Result, SigmaError};

/// Count part of a quantified term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuantifierCount {
    /// At least `n` of the resolved selections must hold.
    Count(u32),
    /// Every resolved selection must hold (`all of ...`).
    All,
}

/// Selection-set part of a quantified term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SelectionSet {
    /// Every detection name known to the rule (`... of them`).
    Them,
    /// A wildcard pattern over detection names (`... of selection_*`).
    Pattern(String),
    /// Concrete sorted set of names, produced by [`ConditionAst::resolve`].
    Resolved(Vec<String>),
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConditionAst {
    /// Reference to a named detection.
    SelectionRef(String),
    /// Wildcard reference over detection names; expanded by `resolve`.
    WildcardRef(String),
    LogicalAnd(Vec<ConditionAst>),
    LogicalOr(Vec<ConditionAst>),
    Not(Box<ConditionAst>),
    Quantifier(QuantifierCount, SelectionSet),
}

/// One callback per node kind. Both the pipeline (structural rewrites) and
/// the backend (query rendering) walk the tree through this trait, so adding
/// a node kind is a compile-time-checked change in every consumer.
pub trait ConditionVisitor {
    type Output;

    fn visit_selection(&mut self, name: &str) -> Result<Self::Output>;
    fn visit_and(&mut self, children: Vec<Self::Output>) -> Result<Self::Output>;
    fn visit_or(&mut self, children: Vec<Self::Output>) -> Result<Self::Output>;
    /// Called before the operand of a negation is walked, so visitors can
    /// track negation polarity while rendering leaves.
    fn enter_not(&mut self) {}
    fn visit_not(&mut self, inner: Self::Output) -> Result<Self::Output>;
    fn visit_quantifier(
        &mut self,
        count: QuantifierCount,
        names: &[String],
    ) -> Result<Self::Output>;
}

impl ConditionAst {
    /// Expand every wildcard reference into the concrete sorted set of
    /// matching detection names.
    ///
    /// Fails with a reference error when a wildcard matches nothing or a
    /// quantifier count exceeds its resolved set size; these are validation
    /// errors, never silently-false conditions.
    pub fn resolve(&self, known_names: &[String]) -> Result<ConditionAst> {
        match self {
            ConditionAst::SelectionRef(name) => {
                if !known_names.iter().any(|n| n == name) {
                    return Err(SigmaError::Reference {
                        message: format!("unknown selection '{name}'"),
                        span: None,
                    });
                }
                Ok(ConditionAst::SelectionRef(name.clone()))
            }
            ConditionAst::WildcardRef(pattern) => {
                let mut matches = matching_names(pattern, known_names)?;
                if matches.len() == 1 {
                    Ok(ConditionAst::SelectionRef(matches.remove(0)))
                } else {
                    Ok(ConditionAst::LogicalOr(
                        matches.into_iter().map(ConditionAst::SelectionRef).collect(),
                    ))
                }
            }
            ConditionAst::LogicalAnd(children) => Ok(ConditionAst::LogicalAnd(
                children
                    .iter()
                    .map(|c| c.resolve(known_names))
                    .collect::<Result<_>>()?,
            )),
            ConditionAst::LogicalOr(children) => Ok(ConditionAst::LogicalOr(
                children
                    .iter()
                    .map(|c| c.resolve(known_names))
                    .collect::<Result<_>>()?,
            )),
            ConditionAst::Not(inner) => {
                Ok(ConditionAst::Not(Box::new(inner.resolve(known_names)?)))
            }
            ConditionAst::Quantifier(count, set) => {
                let names = match set {
                    SelectionSet::Them => {
                        let mut names: Vec<String> = known_names.to_vec();
                        names.sort();
                        names
                    }
                    SelectionSet::Pattern(pattern) => matching_names(pattern, known_names)?,
                    SelectionSet::Resolved(names) => names.clone(),
                };
                if let QuantifierCount::Count(n) = count {
                    if *n as usize > names.len() {
                        return Err(SigmaError::Reference {
                            message: format!(
                                "quantifier count {n} exceeds selection set size {}",
                                names.len()
                            ),
                            span: None,
                        });
                    }
                }
                Ok(ConditionAst::Quantifier(
                    *count,
                    SelectionSet::Resolved(names),
                ))
            }
        }
    }

    /// Generic tree walk. Requires a resolved tree; encountering a wildcard
    /// or unresolved quantifier set is a reference error.
    pub fn translate<V: ConditionVisitor>(&self, visitor: &mut V) -> Result<V::Output> {
        match self {
            ConditionAst::SelectionRef(name) => visitor.visit_selection(name),
            ConditionAst::WildcardRef(pattern) => Err(SigmaError::Reference {
                message: format!("unresolved wildcard reference '{pattern}'"),
                span: None,
            }),
            ConditionAst::LogicalAnd(children) => {
                let rendered = children
                    .iter()
                    .map(|c| c.translate(visitor))
                    .collect::<Result<Vec<_>>>()?;
                visitor.visit_and(rendered)
            }
            ConditionAst::LogicalOr(children) => {
                let rendered = children
                    .iter()
                    .map(|c| c.translate(visitor))
                    .collect::<Result<Vec<_>>>()?;
                visitor.visit_or(rendered)
            }
            ConditionAst::Not(inner) => {
                visitor.enter_not();
                let rendered = inner.translate(visitor)?;
                visitor.visit_not(rendered)
            }
            ConditionAst::Quantifier(count, SelectionSet::Resolved(names)) => {
                visitor.visit_quantifier(*count, names)
            }
            ConditionAst::Quantifier(_, set) => Err(SigmaError::Reference {
                message: format!("unresolved quantifier set {set:?}"),
                span: None,
            }),
        }
    }

    /// Collapse double negation. Optional readability normalization; never
    /// required for correctness.
    pub fn normalize(self) -> ConditionAst {
        match self {
            ConditionAst::Not(inner) => match inner.normalize() {
                ConditionAst::Not(nested) => *nested,
                other => ConditionAst::Not(Box::new(other)),
            },
            ConditionAst::LogicalAnd(children) => {
                ConditionAst::LogicalAnd(children.into_iter().map(|c| c.normalize()).collect())
            }
            ConditionAst::LogicalOr(children) => {
                ConditionAst::LogicalOr(children.into_iter().map(|c| c.normalize()).collect())
            }
            other => other,
        }
    }
}

/// Sorted detection names matching a `*` wildcard pattern. Empty match is an
/// error, not an empty set.
fn matching_names(pattern: &str, known_names: &[String]) -> Result<Vec<String>> {
    let mut matches: Vec<String> = known_names
        .iter()
        .filter(|name| glob_match(pattern, name))
        .cloned()
        .collect();
    if matches.is_empty() {
        return Err(SigmaError::Reference {
            message: format!("wildcard '{pattern}' matches no detection name"),
            span: None,
        });
    }
    matches.sort();
    Ok(matches)
}

/// Match `pattern` (with `*` wildcards) against `name`.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
