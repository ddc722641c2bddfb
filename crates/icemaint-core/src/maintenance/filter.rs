//! File selection predicates.
//!
//! Grammar:
//!
//! ```text
//! filter  := term (AND term)*
//! term    := column op literal
//! op      := = | != | <> | < | <= | > | >=
//! literal := 'string' | "string" | integer | float | true | false
//! ```
//!
//! A file is selected when the predicate *may* match it. Partition columns
//! are compared against the file's partition value; other columns are pruned
//! with min/max statistics. Missing statistics select the file.

use crate::error::PlanningError;
use crate::metadata::{FileReference, Literal, TableSchema};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// `column op literal`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Term {
    /// Column name
    pub column: String,
    /// Operator
    pub op: CompareOp,
    /// Right-hand side
    pub value: Literal,
}

impl Term {
    fn may_match(&self, file: &FileReference) -> bool {
        if let Some(raw) = file.partition.get(&self.column) {
            let actual = Literal::coerce_like(raw, &self.value);
            return match actual.partial_cmp_to(&self.value) {
                Some(ordering) => self.op.holds(ordering),
                None => true,
            };
        }

        let stats = match file.column_stats.get(&self.column) {
            Some(stats) => stats,
            None => return true,
        };

        let cmp_min = stats.min.as_ref().and_then(|m| m.partial_cmp_to(&self.value));
        let cmp_max = stats.max.as_ref().and_then(|m| m.partial_cmp_to(&self.value));

        match self.op {
            CompareOp::Eq => {
                cmp_min.map_or(true, |o| o != Ordering::Greater)
                    && cmp_max.map_or(true, |o| o != Ordering::Less)
            }
            CompareOp::NotEq => !(cmp_min == Some(Ordering::Equal)
                && cmp_max == Some(Ordering::Equal)),
            CompareOp::Lt => cmp_min.map_or(true, |o| o == Ordering::Less),
            CompareOp::LtEq => cmp_min.map_or(true, |o| o != Ordering::Greater),
            CompareOp::Gt => cmp_max.map_or(true, |o| o == Ordering::Greater),
            CompareOp::GtEq => cmp_max.map_or(true, |o| o != Ordering::Less),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op.symbol(), self.value)
    }
}

/// Conjunction of terms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    terms: Vec<Term>,
}

impl Filter {
    /// Parse filter text.
    pub fn parse(text: &str) -> Result<Self, PlanningError> {
        let invalid = |message: String| PlanningError::InvalidFilter {
            filter: text.to_string(),
            message,
        };

        let tokens = tokenize(text).map_err(invalid)?;
        let mut tokens = tokens.into_iter().peekable();
        let mut terms = Vec::new();

        loop {
            let column = match tokens.next() {
                Some(Token::Ident(name)) => name,
                Some(other) => return Err(invalid(format!("expected column, found {}", other))),
                None => return Err(invalid("expected column".into())),
            };
            let op = match tokens.next() {
                Some(Token::Op(op)) => op,
                Some(other) => {
                    return Err(invalid(format!("expected operator, found {}", other)))
                }
                None => return Err(invalid(format!("missing operator after '{}'", column))),
            };
            let value = match tokens.next() {
                Some(Token::Literal(value)) => value,
                Some(Token::Ident(word)) => match word.to_ascii_lowercase().as_str() {
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    _ => {
                        return Err(invalid(format!(
                            "expected literal, found '{}' (quote strings)",
                            word
                        )))
                    }
                },
                Some(other) => return Err(invalid(format!("expected literal, found {}", other))),
                None => return Err(invalid(format!("missing value for '{}'", column))),
            };
            terms.push(Term { column, op, value });

            match tokens.next() {
                None => break,
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("and") => continue,
                Some(other) => return Err(invalid(format!("expected AND, found {}", other))),
            }
        }

        Ok(Self { terms })
    }

    /// Check every referenced column against the schema.
    pub fn validate(&self, schema: &TableSchema) -> Result<(), PlanningError> {
        match self.terms.iter().find(|t| !schema.has_column(&t.column)) {
            Some(term) => Err(PlanningError::UnknownColumn(term.column.clone())),
            None => Ok(()),
        }
    }

    /// Whether the file may contain matching rows.
    pub fn may_match(&self, file: &FileReference) -> bool {
        self.terms.iter().all(|t| t.may_match(file))
    }

    /// Parsed terms.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.terms.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" AND "))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(CompareOp),
    Literal(Literal),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "'{}'", name),
            Token::Op(op) => write!(f, "'{}'", op.symbol()),
            Token::Literal(value) => write!(f, "{}", value),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err("unterminated string literal".into());
                }
                tokens.push(Token::Literal(Literal::String(
                    chars[start..end].iter().collect(),
                )));
                i = end + 1;
            }
            '=' => {
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
                tokens.push(Token::Op(CompareOp::Eq));
            }
            '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err("expected '=' after '!'".into());
                }
                tokens.push(Token::Op(CompareOp::NotEq));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(CompareOp::LtEq));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(CompareOp::NotEq));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::GtEq));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let literal = if let Ok(v) = raw.parse::<i64>() {
                    Literal::Int(v)
                } else if let Ok(v) = raw.parse::<f64>() {
                    Literal::Float(v)
                } else {
                    return Err(format!("invalid number '{}'", raw));
                };
                tokens.push(Token::Literal(literal));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    if tokens.is_empty() {
        return Err("empty filter".into());
    }

    Ok(tokens)
}
