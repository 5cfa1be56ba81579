//! Boolean conditions over bundle variables.
//!
//! ```text
//! expr    := and ("OR" and)*
//! and     := unary ("AND" unary)*
//! unary   := "NOT" unary | primary
//! primary := "(" expr ")" | operand (cmp operand)?
//! cmp     := "=" | "<>" | "<" | ">" | "<=" | ">="
//! operand := identifier | "quoted" | integer | v1.2.3.4
//! ```

use std::cmp::Ordering;

use anyhow::{anyhow, Result};

use crate::variables::{parse_version, VariableValue, Variables};

/// An absent or blank condition is true.
pub fn evaluate_condition(condition: Option<&str>, variables: &Variables) -> Result<bool> {
    let Some(condition) = condition.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(true);
    };
    let tokens = tokenize(condition)?;
    let mut parser = Parser {
        tokens: &tokens,
        position: 0,
        variables,
    };
    let result = parser.expression()?;
    if parser.position != tokens.len() {
        return Err(anyhow!(
            "unexpected trailing input in condition '{condition}'"
        ));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Identifier(String),
    Quoted(String),
    Integer(i64),
    Version(u64),
    Compare(Comparison),
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars = input.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        match ch {
            _ if ch.is_whitespace() => index += 1,
            '(' => {
                tokens.push(Token::Open);
                index += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                index += 1;
            }
            '=' => {
                tokens.push(Token::Compare(Comparison::Equal));
                index += 1;
            }
            '<' | '>' => {
                let next = chars.get(index + 1).copied();
                let (comparison, width) = match (ch, next) {
                    ('<', Some('>')) => (Comparison::NotEqual, 2),
                    ('<', Some('=')) => (Comparison::LessOrEqual, 2),
                    ('>', Some('=')) => (Comparison::GreaterOrEqual, 2),
                    ('<', _) => (Comparison::Less, 1),
                    _ => (Comparison::Greater, 1),
                };
                tokens.push(Token::Compare(comparison));
                index += width;
            }
            '"' => {
                let start = index + 1;
                let Some(length) = chars[start..].iter().position(|c| *c == '"') else {
                    return Err(anyhow!("unterminated string in condition '{input}'"));
                };
                tokens.push(Token::Quoted(chars[start..start + length].iter().collect()));
                index = start + length + 1;
            }
            _ if ch.is_ascii_digit() || ch == '-' => {
                let start = index;
                index += 1;
                while index < chars.len() && chars[index].is_ascii_digit() {
                    index += 1;
                }
                let raw = chars[start..index].iter().collect::<String>();
                let value = raw
                    .parse::<i64>()
                    .map_err(|_| anyhow!("invalid integer '{raw}' in condition '{input}'"))?;
                tokens.push(Token::Integer(value));
            }
            _ if ch.is_alphabetic() || ch == '_' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_alphanumeric() || matches!(chars[index], '_' | '.'))
                {
                    index += 1;
                }
                let word = chars[start..index].iter().collect::<String>();
                tokens.push(classify_word(word)?);
            }
            other => {
                return Err(anyhow!(
                    "unexpected character '{other}' in condition '{input}'"
                ))
            }
        }
    }

    Ok(tokens)
}

fn classify_word(word: String) -> Result<Token> {
    match word.to_ascii_uppercase().as_str() {
        "AND" => return Ok(Token::And),
        "OR" => return Ok(Token::Or),
        "NOT" => return Ok(Token::Not),
        _ => {}
    }

    let looks_like_version = word.len() > 1
        && word.starts_with(['v', 'V'])
        && word[1..].chars().all(|c| c.is_ascii_digit() || c == '.')
        && word[1..].starts_with(|c: char| c.is_ascii_digit());
    if looks_like_version {
        return Ok(Token::Version(parse_version(&word)?));
    }
    Ok(Token::Identifier(word))
}

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
    variables: &'a Variables,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<bool> {
        let mut value = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            let rhs = self.conjunction()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn conjunction(&mut self) -> Result<bool> {
        let mut value = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<bool> {
        if self.peek() == Some(&Token::Not) {
            self.position += 1;
            return Ok(!self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<bool> {
        match self.next() {
            Some(Token::Open) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err(anyhow!("missing closing parenthesis in condition")),
                }
            }
            Some(token @ (Token::Identifier(_) | Token::Quoted(_) | Token::Integer(_) | Token::Version(_))) => {
                if let Some(Token::Compare(comparison)) = self.peek().cloned() {
                    self.position += 1;
                    let rhs = match self.next() {
                        Some(
                            rhs @ (Token::Identifier(_)
                            | Token::Quoted(_)
                            | Token::Integer(_)
                            | Token::Version(_)),
                        ) => rhs,
                        _ => return Err(anyhow!("comparison is missing its right operand")),
                    };
                    let lhs = self.operand_value(&token);
                    let rhs = self.operand_value(&rhs);
                    return Ok(compare(&lhs, &rhs, comparison));
                }
                Ok(self.operand_value(&token).is_truthy())
            }
            Some(other) => Err(anyhow!("unexpected token {other:?} in condition")),
            None => Err(anyhow!("condition ended unexpectedly")),
        }
    }

    fn operand_value(&self, token: &Token) -> VariableValue {
        match token {
            Token::Identifier(name) => self
                .variables
                .get(name)
                .cloned()
                .unwrap_or(VariableValue::None),
            Token::Quoted(value) => VariableValue::String(value.clone()),
            Token::Integer(value) => VariableValue::Numeric(*value),
            Token::Version(value) => VariableValue::Version(*value),
            _ => VariableValue::None,
        }
    }
}

fn compare(lhs: &VariableValue, rhs: &VariableValue, comparison: Comparison) -> bool {
    let ordering = match (lhs, rhs) {
        (VariableValue::Numeric(a), VariableValue::Numeric(b)) => Some(a.cmp(b)),
        (VariableValue::Version(a), VariableValue::Version(b)) => Some(a.cmp(b)),
        (VariableValue::Version(a), VariableValue::String(b))
        | (VariableValue::String(b), VariableValue::Version(a)) => {
            let ordering = parse_version(b).ok().map(|b| a.cmp(&b));
            if matches!(lhs, VariableValue::String(_)) {
                ordering.map(Ordering::reverse)
            } else {
                ordering
            }
        }
        (VariableValue::Numeric(a), VariableValue::String(b)) => {
            b.trim().parse::<i64>().ok().map(|b| a.cmp(&b))
        }
        (VariableValue::String(a), VariableValue::Numeric(b)) => {
            a.trim().parse::<i64>().ok().map(|a| a.cmp(b))
        }
        (VariableValue::None, VariableValue::None) => Some(Ordering::Equal),
        (VariableValue::None, _) | (_, VariableValue::None) => None,
        _ => Some(lhs.to_string().cmp(&rhs.to_string())),
    };

    match (ordering, comparison) {
        (None, Comparison::NotEqual) => true,
        (None, _) => false,
        (Some(ordering), Comparison::Equal) => ordering == Ordering::Equal,
        (Some(ordering), Comparison::NotEqual) => ordering != Ordering::Equal,
        (Some(ordering), Comparison::Less) => ordering == Ordering::Less,
        (Some(ordering), Comparison::Greater) => ordering == Ordering::Greater,
        (Some(ordering), Comparison::LessOrEqual) => ordering != Ordering::Greater,
        (Some(ordering), Comparison::GreaterOrEqual) => ordering != Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::pack_version;

    fn variables() -> Variables {
        let mut variables = Variables::new();
        variables.set_numeric("VersionNT", 603).expect("set");
        variables.set_string("Edition", "Server").expect("set");
        variables.set_numeric("Disabled", 0).expect("set");
        variables
            .set_version("Runtime", pack_version(4, 8, 0, 0))
            .expect("set");
        variables
    }

    #[test]
    fn empty_condition_is_true() {
        let vars = variables();
        assert!(evaluate_condition(None, &vars).expect("evaluate"));
        assert!(evaluate_condition(Some("   "), &vars).expect("evaluate"));
    }

    #[test]
    fn bare_variables_use_truthiness() {
        let vars = variables();
        assert!(evaluate_condition(Some("Edition"), &vars).expect("evaluate"));
        assert!(!evaluate_condition(Some("Disabled"), &vars).expect("evaluate"));
        assert!(!evaluate_condition(Some("Missing"), &vars).expect("evaluate"));
        assert!(evaluate_condition(Some("NOT Missing"), &vars).expect("evaluate"));
    }

    #[test]
    fn comparisons_and_precedence() {
        let vars = variables();
        assert!(evaluate_condition(Some("VersionNT >= 601 AND Edition = \"Server\""), &vars)
            .expect("evaluate"));
        assert!(evaluate_condition(Some("Disabled OR VersionNT > 600"), &vars).expect("evaluate"));
        assert!(evaluate_condition(Some("NOT (VersionNT <> 603)"), &vars).expect("evaluate"));
        assert!(evaluate_condition(Some("Missing OR Edition AND VersionNT < 700"), &vars)
            .expect("evaluate"));
        assert!(evaluate_condition(Some("Runtime >= v4.5"), &vars).expect("evaluate"));
        assert!(!evaluate_condition(Some("Runtime < v4.5.2"), &vars).expect("evaluate"));
        assert!(evaluate_condition(Some("Missing <> 1"), &vars).expect("evaluate"));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let vars = variables();
        assert!(evaluate_condition(Some("not Disabled and Edition"), &vars).expect("evaluate"));
    }

    #[test]
    fn malformed_conditions_are_errors() {
        let vars = variables();
        assert!(evaluate_condition(Some("(Edition"), &vars).is_err());
        assert!(evaluate_condition(Some("Edition ="), &vars).is_err());
        assert!(evaluate_condition(Some("\"open"), &vars).is_err());
        assert!(evaluate_condition(Some("Edition Edition"), &vars).is_err());
        assert!(evaluate_condition(Some("Edition $ 1"), &vars).is_err());
    }
}
