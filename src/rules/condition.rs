//! Sigma condition expression parsing.
//!
//! Tokenizes a condition string and parses it into a [`ConditionAst`] with a
//! recursive descent parser. Identifiers are not resolved here; the
//! translator checks them against the rule's selections.

use crate::error::{EvalError, Result};

/// Tokens in a Sigma condition expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Identifier(String),
    And,
    Or,
    Not,
    LeftParen,
    RightParen,
    Of,
    Them,
    All,
    Number(u32),
    Wildcard(String),
    Pipe,
    Near,
}

/// How many of a group of selections must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    /// `1 of`
    Any,
    /// `all of`
    All,
    /// `N of` with N > 1
    AtLeast(u32),
}

/// AST for Sigma condition expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionAst {
    Identifier(String),
    And(Box<ConditionAst>, Box<ConditionAst>),
    Or(Box<ConditionAst>, Box<ConditionAst>),
    Not(Box<ConditionAst>),
    OfThem(Quantifier),
    OfPattern(Quantifier, String),
}

/// Parse a condition string.
///
/// Aggregations (`| count() ...`) and `near` have no search-index
/// equivalent and are reported as [`EvalError::Unsupported`].
///
/// ```rust
/// use detection_eval::rules::condition::{parse_condition, ConditionAst};
///
/// let ast = parse_condition("1 of selection* and not filter")?;
/// assert!(matches!(ast, ConditionAst::And(_, _)));
///
/// let err = parse_condition("selection | count() > 5").unwrap_err();
/// assert!(err.is_unsupported());
/// # Ok::<(), detection_eval::EvalError>(())
/// ```
pub fn parse_condition(condition: &str) -> Result<ConditionAst> {
    let tokens = tokenize_condition(condition)?;
    if tokens.contains(&Token::Pipe) {
        return Err(EvalError::Unsupported(format!(
            "aggregation in condition '{condition}'"
        )));
    }
    if tokens.contains(&Token::Near) {
        return Err(EvalError::Unsupported(format!(
            "'near' in condition '{condition}'"
        )));
    }
    if tokens.is_empty() {
        return Err(EvalError::Translation("Empty condition".to_string()));
    }

    let mut parser = ConditionParser::new(&tokens);
    let ast = parser.parse_or_expression()?;
    if parser.position < tokens.len() {
        return Err(EvalError::Translation(format!(
            "Unexpected trailing tokens in condition '{condition}'"
        )));
    }
    Ok(ast)
}

/// Tokenize a Sigma condition string.
pub(crate) fn tokenize_condition(condition: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = condition.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LeftParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RightParen);
                chars.next();
            }
            '|' => {
                tokens.push(Token::Pipe);
                // everything after the pipe is aggregation syntax
                break;
            }
            '0'..='9' => {
                let mut number_str = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        number_str.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = number_str.parse::<u32>().map_err(|_| {
                    EvalError::Translation(format!("Invalid number in condition: {number_str}"))
                })?;
                tokens.push(Token::Number(number));
            }
            'a'..='z' | 'A'..='Z' | '_' | '*' => {
                let mut identifier = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '*' || ch == '-' {
                        identifier.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                match identifier.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "of" => tokens.push(Token::Of),
                    "them" => tokens.push(Token::Them),
                    "all" => tokens.push(Token::All),
                    "near" => tokens.push(Token::Near),
                    _ => {
                        if identifier.contains('*') {
                            tokens.push(Token::Wildcard(identifier));
                        } else {
                            tokens.push(Token::Identifier(identifier));
                        }
                    }
                }
            }
            _ => {
                return Err(EvalError::Translation(format!(
                    "Unexpected character in condition: '{ch}'"
                )));
            }
        }
    }

    Ok(tokens)
}

/// Recursive descent parser for Sigma conditions.
struct ConditionParser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl<'a> ConditionParser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.current_token().cloned();
        self.position += 1;
        token
    }

    /// Parse OR expressions (lowest precedence).
    fn parse_or_expression(&mut self) -> Result<ConditionAst> {
        let mut left = self.parse_and_expression()?;

        while let Some(Token::Or) = self.current_token() {
            self.advance();
            let right = self.parse_and_expression()?;
            left = ConditionAst::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse AND expressions (medium precedence).
    fn parse_and_expression(&mut self) -> Result<ConditionAst> {
        let mut left = self.parse_not_expression()?;

        while let Some(Token::And) = self.current_token() {
            self.advance();
            let right = self.parse_not_expression()?;
            left = ConditionAst::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse NOT expressions (highest precedence).
    fn parse_not_expression(&mut self) -> Result<ConditionAst> {
        if let Some(Token::Not) = self.current_token() {
            self.advance();
            let operand = self.parse_not_expression()?;
            Ok(ConditionAst::Not(Box::new(operand)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<ConditionAst> {
        match self.advance() {
            Some(Token::LeftParen) => {
                let expr = self.parse_or_expression()?;
                if let Some(Token::RightParen) = self.current_token() {
                    self.advance();
                    Ok(expr)
                } else {
                    Err(EvalError::Translation(
                        "Expected closing parenthesis".to_string(),
                    ))
                }
            }
            Some(Token::Identifier(name)) => Ok(ConditionAst::Identifier(name)),
            Some(Token::Number(count)) => {
                let quantifier = if count == 1 {
                    Quantifier::Any
                } else if count == 0 {
                    return Err(EvalError::Translation(
                        "'0 of' is not a valid quantifier".to_string(),
                    ));
                } else {
                    Quantifier::AtLeast(count)
                };
                self.parse_of_target(quantifier)
            }
            Some(Token::All) => self.parse_of_target(Quantifier::All),
            Some(token) => Err(EvalError::Translation(format!(
                "Unexpected token in condition: {token:?}"
            ))),
            None => Err(EvalError::Translation(
                "Unexpected end of condition".to_string(),
            )),
        }
    }

    fn parse_of_target(&mut self, quantifier: Quantifier) -> Result<ConditionAst> {
        if self.advance() != Some(Token::Of) {
            return Err(EvalError::Translation(
                "Expected 'of' after quantifier".to_string(),
            ));
        }
        match self.advance() {
            Some(Token::Them) => Ok(ConditionAst::OfThem(quantifier)),
            Some(Token::Wildcard(pattern)) => Ok(ConditionAst::OfPattern(quantifier, pattern)),
            Some(Token::Identifier(name)) => Ok(ConditionAst::OfPattern(quantifier, name)),
            _ => Err(EvalError::Translation(
                "Expected 'them' or pattern after 'of'".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<ConditionAst> {
        Box::new(ConditionAst::Identifier(name.to_string()))
    }

    #[test]
    fn test_tokenize_and_expression() {
        let tokens = tokenize_condition("selection1 and selection2").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("selection1".to_string()),
                Token::And,
                Token::Identifier("selection2".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokenize_keywords_case_insensitive() {
        let tokens = tokenize_condition("sel AND NOT filter").unwrap();
        assert_eq!(tokens[1], Token::And);
        assert_eq!(tokens[2], Token::Not);
    }

    #[test]
    fn test_tokenize_wildcard_and_number() {
        let tokens = tokenize_condition("2 of selection_*").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Number(2),
                Token::Of,
                Token::Wildcard("selection_*".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokenize_invalid_character() {
        let result = tokenize_condition("selection1 @ selection2");
        match result {
            Err(EvalError::Translation(msg)) => assert!(msg.contains("Unexpected character")),
            other => panic!("Expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let ast = parse_condition("a or b and not c").unwrap();
        assert_eq!(
            ast,
            ConditionAst::Or(
                ident("a"),
                Box::new(ConditionAst::And(
                    ident("b"),
                    Box::new(ConditionAst::Not(ident("c")))
                ))
            )
        );
    }

    #[test]
    fn test_parentheses() {
        let ast = parse_condition("(a or b) and c").unwrap();
        assert_eq!(
            ast,
            ConditionAst::And(Box::new(ConditionAst::Or(ident("a"), ident("b"))), ident("c"))
        );
    }

    #[test]
    fn test_quantifiers() {
        assert_eq!(
            parse_condition("1 of them").unwrap(),
            ConditionAst::OfThem(Quantifier::Any)
        );
        assert_eq!(
            parse_condition("all of them").unwrap(),
            ConditionAst::OfThem(Quantifier::All)
        );
        assert_eq!(
            parse_condition("3 of sel*").unwrap(),
            ConditionAst::OfPattern(Quantifier::AtLeast(3), "sel*".to_string())
        );
        assert!(parse_condition("0 of them").is_err());
    }

    #[test]
    fn test_unsupported_constructs() {
        assert!(parse_condition("selection | count(User) by Host > 3")
            .unwrap_err()
            .is_unsupported());
        assert!(parse_condition("a near b").unwrap_err().is_unsupported());
    }

    #[test]
    fn test_malformed_conditions() {
        assert!(matches!(
            parse_condition("(a and b"),
            Err(EvalError::Translation(_))
        ));
        assert!(matches!(parse_condition("a b"), Err(EvalError::Translation(_))));
        assert!(matches!(parse_condition("a and"), Err(EvalError::Translation(_))));
        assert!(matches!(parse_condition(""), Err(EvalError::Translation(_))));
        assert!(matches!(parse_condition("all them"), Err(EvalError::Translation(_))));
    }
}
