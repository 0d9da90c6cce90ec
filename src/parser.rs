//! Condition expression tokenization and parsing.
//!
//! Grammar: unary `not` binds tighter than `and`, which binds tighter than
//! `or`; parentheses override precedence; same-precedence binary operators
//! associate left-to-right. Quantified terms (`N of pattern`, `all of them`,
//! `any of pattern`) parse as atomic primaries.

use crate::ast::{ConditionAst, QuantifierCount, SelectionSet};
use crate::error::{Result, SigmaError, Span};

/// Tokens in a condition expression.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    And,
    Or,
    Not,
    LeftParen,
    RightParen,
    Of,
    Them,
    All,
    Any,
    Number(u32),
    Wildcard(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Identifier(name) => format!("identifier '{name}'"),
            Token::And => "'and'".to_string(),
            Token::Or => "'or'".to_string(),
            Token::Not => "'not'".to_string(),
            Token::LeftParen => "'('".to_string(),
            Token::RightParen => "')'".to_string(),
            Token::Of => "'of'".to_string(),
            Token::Them => "'them'".to_string(),
            Token::All => "'all'".to_string(),
            Token::Any => "'any'".to_string(),
            Token::Number(n) => format!("number {n}"),
            Token::Wildcard(pattern) => format!("pattern '{pattern}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SpannedToken {
    token: Token,
    span: Span,
}

/// Parse a condition expression against the set of known detection names.
///
/// Literal selection references are checked against `known_names` here;
/// wildcard references and quantifier set sizes are checked later by
/// [`ConditionAst::resolve`].
pub fn parse_condition(expression: &str, known_names: &[String]) -> Result<ConditionAst> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(SigmaError::Syntax {
            message: "empty condition".to_string(),
            span: Span::new(0, expression.len()),
        });
    }

    let mut parser = ConditionParser {
        tokens: &tokens,
        position: 0,
        known_names,
        end: expression.len(),
    };
    let ast = parser.parse_or_expression()?;

    if let Some(trailing) = parser.current() {
        return Err(SigmaError::Syntax {
            message: format!("unexpected {}", trailing.token.describe()),
            span: trailing.span,
        });
    }

    Ok(ast)
}

struct ConditionParser<'a> {
    tokens: &'a [SpannedToken],
    position: usize,
    known_names: &'a [String],
    end: usize,
}

impl<'a> ConditionParser<'a> {
    fn current(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<SpannedToken> {
        let token = self.current().cloned();
        self.position += 1;
        token
    }

    /// Span reported when input ends unexpectedly.
    fn eof_span(&self) -> Span {
        self.tokens
            .last()
            .map(|t| t.span)
            .unwrap_or(Span::new(self.end, self.end))
    }

    /// OR expressions (lowest precedence).
    fn parse_or_expression(&mut self) -> Result<ConditionAst> {
        let mut children = vec![self.parse_and_expression()?];

        while matches!(self.current(), Some(t) if t.token == Token::Or) {
            self.advance();
            children.push(self.parse_and_expression()?);
        }

        if children.len() == 1 {
            Ok(children.remove(0))
        } else {
            Ok(ConditionAst::LogicalOr(children))
        }
    }

    /// AND expressions (medium precedence).
    fn parse_and_expression(&mut self) -> Result<ConditionAst> {
        let mut children = vec![self.parse_not_expression()?];

        while matches!(self.current(), Some(t) if t.token == Token::And) {
            self.advance();
            children.push(self.parse_not_expression()?);
        }

        if children.len() == 1 {
            Ok(children.remove(0))
        } else {
            Ok(ConditionAst::LogicalAnd(children))
        }
    }

    /// NOT expressions (highest precedence).
    fn parse_not_expression(&mut self) -> Result<ConditionAst> {
        if matches!(self.current(), Some(t) if t.token == Token::Not) {
            self.advance();
            let operand = self.parse_not_expression()?;
            Ok(ConditionAst::Not(Box::new(operand)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<ConditionAst> {
        let Some(current) = self.current().cloned() else {
            return Err(SigmaError::Syntax {
                message: "dangling operator: expected a selection or '('".to_string(),
                span: self.eof_span(),
            });
        };

        match current.token {
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_or_expression()?;
                match self.current() {
                    Some(t) if t.token == Token::RightParen => {
                        self.advance();
                        Ok(expr)
                    }
                    Some(t) => Err(SigmaError::Syntax {
                        message: format!(
                            "expected closing parenthesis, found {}",
                            t.token.describe()
                        ),
                        span: t.span,
                    }),
                    None => Err(SigmaError::Syntax {
                        message: "unbalanced parentheses: missing ')'".to_string(),
                        span: current.span,
                    }),
                }
            }
            Token::Identifier(name) => {
                self.advance();
                if self.known_names.iter().any(|n| n == &name) {
                    Ok(ConditionAst::SelectionRef(name))
                } else {
                    Err(SigmaError::Reference {
                        message: format!("unknown selection '{name}'"),
                        span: Some(current.span),
                    })
                }
            }
            Token::Wildcard(pattern) => {
                self.advance();
                Ok(ConditionAst::WildcardRef(pattern))
            }
            Token::Number(n) => {
                self.advance();
                if n == 0 {
                    return Err(SigmaError::Syntax {
                        message: "quantifier count must be positive".to_string(),
                        span: current.span,
                    });
                }
                let set = self.parse_of_clause()?;
                Ok(ConditionAst::Quantifier(QuantifierCount::Count(n), set))
            }
            Token::All => {
                self.advance();
                let set = self.parse_of_clause()?;
                Ok(ConditionAst::Quantifier(QuantifierCount::All, set))
            }
            Token::Any => {
                self.advance();
                let set = self.parse_of_clause()?;
                Ok(ConditionAst::Quantifier(QuantifierCount::Count(1), set))
            }
            other => Err(SigmaError::Syntax {
                message: format!("unexpected {}", other.describe()),
                span: current.span,
            }),
        }
    }

    /// The `of <them | pattern | name>` tail of a quantified term.
    fn parse_of_clause(&mut self) -> Result<SelectionSet> {
        match self.advance() {
            Some(t) if t.token == Token::Of => {}
            Some(t) => {
                return Err(SigmaError::Syntax {
                    message: format!("expected 'of', found {}", t.token.describe()),
                    span: t.span,
                });
            }
            None => {
                return Err(SigmaError::Syntax {
                    message: "expected 'of' after quantifier".to_string(),
                    span: self.eof_span(),
                });
            }
        }

        match self.advance() {
            Some(t) => match t.token {
                Token::Them => Ok(SelectionSet::Them),
                Token::Wildcard(pattern) => Ok(SelectionSet::Pattern(pattern)),
                // A literal name is a degenerate pattern matching exactly itself.
                Token::Identifier(name) => Ok(SelectionSet::Pattern(name)),
                other => Err(SigmaError::Syntax {
                    message: format!("expected 'them' or pattern after 'of', found {}", other.describe()),
                    span: t.span,
                }),
            },
            None => Err(SigmaError::Syntax {
                message: "expected 'them' or pattern after 'of'".to_string(),
                span: self.eof_span(),
            }),
        }
    }
}

fn tokenize(expression: &str) -> Result<Vec<SpannedToken>> {
    let mut tokens = Vec::new();
    let bytes = expression.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos] as char;
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                pos += 1;
            }
            '(' => {
                tokens.push(SpannedToken {
                    token: Token::LeftParen,
                    span: Span::new(pos, pos + 1),
                });
                pos += 1;
            }
            ')' => {
                tokens.push(SpannedToken {
                    token: Token::RightParen,
                    span: Span::new(pos, pos + 1),
                });
                pos += 1;
            }
            '0'..='9' => {
                let start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                let text = &expression[start..pos];
                let number = text.parse::<u32>().map_err(|_| SigmaError::Syntax {
                    message: format!("invalid number '{text}'"),
                    span: Span::new(start, pos),
                })?;
                tokens.push(SpannedToken {
                    token: Token::Number(number),
                    span: Span::new(start, pos),
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '*' => {
                let start = pos;
                while pos < bytes.len() {
                    let c = bytes[pos] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '*' {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                let word = &expression[start..pos];
                let span = Span::new(start, pos);
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "of" => Token::Of,
                    "them" => Token::Them,
                    "all" => Token::All,
                    "any" => Token::Any,
                    _ if word.contains('*') => Token::Wildcard(word.to_string()),
                    _ => Token::Identifier(word.to_string()),
                };
                tokens.push(SpannedToken { token, span });
            }
            other => {
                return Err(SigmaError::Syntax {
                    message: format!("unexpected character '{other}'"),
                    span: Span::new(pos, pos + 1),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_single_selection() {
        let ast = parse_condition("selection", &names(&["selection"])).unwrap();
        assert_eq!(ast, ConditionAst::SelectionRef("selection".to_string()));
    }

    #[test]
    fn test_parse_and_not() {
        let ast = parse_condition(
            "selection1 and not filter1",
            &names(&["selection1", "filter1"]),
        )
        .unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalAnd(vec![
                ConditionAst::SelectionRef("selection1".to_string()),
                ConditionAst::Not(Box::new(ConditionAst::SelectionRef("filter1".to_string()))),
            ])
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let ast = parse_condition("a and b or c", &names(&["a", "b", "c"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalOr(vec![
                ConditionAst::LogicalAnd(vec![
                    ConditionAst::SelectionRef("a".to_string()),
                    ConditionAst::SelectionRef("b".to_string()),
                ]),
                ConditionAst::SelectionRef("c".to_string()),
            ])
        );
    }

    #[test]
    fn test_not_binds_tighter_than_and() {
        let ast = parse_condition("a or not b and c", &names(&["a", "b", "c"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalOr(vec![
                ConditionAst::SelectionRef("a".to_string()),
                ConditionAst::LogicalAnd(vec![
                    ConditionAst::Not(Box::new(ConditionAst::SelectionRef("b".to_string()))),
                    ConditionAst::SelectionRef("c".to_string()),
                ]),
            ])
        );
    }

    #[test]
    fn test_parentheses_override_precedence() {
        let ast = parse_condition("(a or b) and c", &names(&["a", "b", "c"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalAnd(vec![
                ConditionAst::LogicalOr(vec![
                    ConditionAst::SelectionRef("a".to_string()),
                    ConditionAst::SelectionRef("b".to_string()),
                ]),
                ConditionAst::SelectionRef("c".to_string()),
            ])
        );
    }

    #[test]
    fn test_same_precedence_flattens_left_to_right() {
        let ast = parse_condition("a and b and c", &names(&["a", "b", "c"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalAnd(vec![
                ConditionAst::SelectionRef("a".to_string()),
                ConditionAst::SelectionRef("b".to_string()),
                ConditionAst::SelectionRef("c".to_string()),
            ])
        );
    }

    #[test]
    fn test_double_not() {
        let ast = parse_condition("not not a", &names(&["a"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Not(Box::new(ConditionAst::Not(Box::new(
                ConditionAst::SelectionRef("a".to_string())
            ))))
        );
    }

    #[test]
    fn test_quantifier_one_of_them() {
        let ast = parse_condition("1 of them", &names(&["a"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Quantifier(QuantifierCount::Count(1), SelectionSet::Them)
        );
    }

    #[test]
    fn test_quantifier_all_of_pattern() {
        let ast = parse_condition("all of selection_*", &names(&["selection_a"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Quantifier(
                QuantifierCount::All,
                SelectionSet::Pattern("selection_*".to_string())
            )
        );
    }

    #[test]
    fn test_quantifier_any_of_pattern() {
        let ast = parse_condition("any of selection_*", &names(&["selection_a"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Quantifier(
                QuantifierCount::Count(1),
                SelectionSet::Pattern("selection_*".to_string())
            )
        );
    }

    #[test]
    fn test_quantifier_count_of_pattern() {
        let ast = parse_condition("2 of selection_*", &names(&["selection_a"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Quantifier(
                QuantifierCount::Count(2),
                SelectionSet::Pattern("selection_*".to_string())
            )
        );
    }

    #[test]
    fn test_quantifier_binds_as_atomic_term() {
        let ast = parse_condition(
            "selection and not 1 of filter_*",
            &names(&["selection", "filter_a"]),
        )
        .unwrap();
        assert_eq!(
            ast,
            ConditionAst::LogicalAnd(vec![
                ConditionAst::SelectionRef("selection".to_string()),
                ConditionAst::Not(Box::new(ConditionAst::Quantifier(
                    QuantifierCount::Count(1),
                    SelectionSet::Pattern("filter_*".to_string())
                ))),
            ])
        );
    }

    #[test]
    fn test_of_literal_name_is_degenerate_pattern() {
        let ast = parse_condition("all of selection", &names(&["selection"])).unwrap();
        assert_eq!(
            ast,
            ConditionAst::Quantifier(
                QuantifierCount::All,
                SelectionSet::Pattern("selection".to_string())
            )
        );
    }

    #[test]
    fn test_dangling_operator_is_syntax_error() {
        let err = parse_condition("selection and", &names(&["selection"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().contains("dangling operator"));
    }

    #[test]
    fn test_missing_closing_paren() {
        let err = parse_condition("(a and b", &names(&["a", "b"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn test_extra_closing_paren() {
        let err = parse_condition("a and b)", &names(&["a", "b"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
    }

    #[test]
    fn test_unknown_token_character() {
        let err = parse_condition("a @ b", &names(&["a", "b"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert_eq!(err.span(), Some(Span::new(2, 3)));
    }

    #[test]
    fn test_unknown_selection_name_is_reference_error() {
        let err = parse_condition("selection and missing", &names(&["selection"])).unwrap_err();
        assert_eq!(err.kind(), "ReferenceError");
        assert_eq!(err.span(), Some(Span::new(14, 21)));
    }

    #[test]
    fn test_zero_quantifier_count_rejected() {
        let err = parse_condition("0 of them", &names(&["a"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_empty_condition() {
        let err = parse_condition("   ", &names(&["a"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().contains("empty condition"));
    }

    #[test]
    fn test_number_without_of() {
        let err = parse_condition("1 selection", &names(&["selection"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().contains("expected 'of'"));
    }

    #[test]
    fn test_of_followed_by_operator() {
        let err = parse_condition("all of and", &names(&["a"])).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
    }

    #[test]
    fn test_identifier_with_keyword_substring() {
        let ast = parse_condition(
            "selection_and_filter",
            &names(&["selection_and_filter"]),
        )
        .unwrap();
        assert_eq!(
            ast,
            ConditionAst::SelectionRef("selection_and_filter".to_string())
        );
    }

    #[test]
    fn test_hyphenated_identifiers() {
        let ast = parse_condition("my-selection", &names(&["my-selection"])).unwrap();
        assert_eq!(ast, ConditionAst::SelectionRef("my-selection".to_string()));
    }

    #[test]
    fn test_whitespace_is_insignificant() {
        let ast = parse_condition("  a   and\tb ", &names(&["a", "b"])).unwrap();
        assert!(matches!(ast, ConditionAst::LogicalAnd(_)));
    }
}
