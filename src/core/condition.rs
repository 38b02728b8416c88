//! Step conditions - a typed expression tree and its evaluator
//!
//! Condition strings such as `and(succeeded(), eq(OS, 'Linux'))` are parsed
//! once when the pipeline is loaded. Evaluation is pure: it depends only on
//! the facts visible to the step and the current [`PipelineStatus`].

use crate::core::facts::{EnvironmentFacts, FactView};
use crate::core::state::PipelineStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Source of fact values for evaluation
pub trait FactLookup {
    fn lookup(&self, key: &str) -> Option<&str>;
}

impl FactLookup for EnvironmentFacts {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key)
    }
}

impl FactLookup for FactView<'_> {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key)
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Value of a named fact
    Fact(String),
    /// Quoted literal
    Literal(String),
}

impl Operand {
    fn resolve<'a, F: FactLookup + ?Sized>(&'a self, facts: &'a F) -> Option<&'a str> {
        match self {
            Operand::Fact(key) => facts.lookup(key),
            Operand::Literal(value) => Some(value.as_str()),
        }
    }
}

/// Boolean expression gating a step
///
/// Serialized as its expression text, so a config that deserializes always
/// holds well-formed conditions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    /// True while no failure has been recorded
    #[default]
    Succeeded,
    /// True once the run has failed
    Failed,
    Always,
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Equals(Operand, Operand),
    NotEquals(Operand, Operand),
}

impl Condition {
    /// Shorthand for `eq(fact, 'value')`
    pub fn fact_eq(fact: &str, value: &str) -> Self {
        Condition::Equals(Operand::Fact(fact.to_string()), Operand::Literal(value.to_string()))
    }

    /// Evaluate against a set of facts and the run status.
    ///
    /// Comparisons that reference an unknown fact are false.
    pub fn evaluate<F: FactLookup + ?Sized>(&self, facts: &F, status: PipelineStatus) -> bool {
        match self {
            Condition::Succeeded => status == PipelineStatus::Succeeded,
            Condition::Failed => status == PipelineStatus::Failed,
            Condition::Always => true,
            Condition::And(terms) => terms.iter().all(|c| c.evaluate(facts, status)),
            Condition::Or(terms) => terms.iter().any(|c| c.evaluate(facts, status)),
            Condition::Not(inner) => !inner.evaluate(facts, status),
            Condition::Equals(lhs, rhs) => match (lhs.resolve(facts), rhs.resolve(facts)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Condition::NotEquals(lhs, rhs) => match (lhs.resolve(facts), rhs.resolve(facts)) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            },
        }
    }

    /// Whether the condition can hold after a failure has been recorded
    pub fn may_run_after_failure(&self) -> bool {
        match self {
            Condition::Succeeded => false,
            Condition::Failed | Condition::Always => true,
            Condition::And(terms) => terms.iter().all(Condition::may_run_after_failure),
            Condition::Or(terms) => terms.iter().any(Condition::may_run_after_failure),
            Condition::Not(inner) => !matches!(**inner, Condition::Failed),
            Condition::Equals(..) | Condition::NotEquals(..) => true,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Fact(key) => write!(f, "{}", key),
            Operand::Literal(value) => write!(f, "'{}'", value.replace('\'', "''")),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, terms: &[Condition]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", term)?;
            }
            write!(f, ")")
        }

        match self {
            Condition::Succeeded => write!(f, "succeeded()"),
            Condition::Failed => write!(f, "failed()"),
            Condition::Always => write!(f, "always()"),
            Condition::And(terms) => list(f, "and", terms),
            Condition::Or(terms) => list(f, "or", terms),
            Condition::Not(inner) => write!(f, "not({})", inner),
            Condition::Equals(a, b) => write!(f, "eq({}, {})", a, b),
            Condition::NotEquals(a, b) => write!(f, "ne({}, {})", a, b),
        }
    }
}

impl TryFrom<String> for Condition {
    type Error = ConditionParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.to_string()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionParseError {
    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("unexpected character {ch:?} at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: &'static str,
        found: usize,
    },

    #[error("expected {expected} at offset {pos}")]
    Expected { expected: &'static str, pos: usize },

    #[error("trailing input at offset {0}")]
    TrailingInput(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | ',' => {
                chars.next();
                let token = match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    _ => Token::Comma,
                };
                tokens.push((pos, token));
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\'')) => {
                            // '' is an escaped quote
                            if matches!(chars.peek(), Some((_, '\''))) {
                                chars.next();
                                value.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some((_, c)) => value.push(c),
                        None => return Err(ConditionParseError::UnterminatedString(pos)),
                    }
                }
                tokens.push((pos, Token::Str(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ident(ident)));
            }
            other => return Err(ConditionParseError::UnexpectedChar { pos, ch: other }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, t)| t)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(p, _)| *p)
            .unwrap_or(self.end)
    }

    fn next(&mut self) -> Result<Token, ConditionParseError> {
        let token = self
            .tokens
            .get(self.cursor)
            .map(|(_, t)| t.clone())
            .ok_or(ConditionParseError::UnexpectedEnd)?;
        self.cursor += 1;
        Ok(token)
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), ConditionParseError> {
        let pos = self.pos();
        match self.next()? {
            t if t == want => Ok(()),
            _ => Err(ConditionParseError::Expected { expected, pos }),
        }
    }

    fn condition(&mut self) -> Result<Condition, ConditionParseError> {
        let pos = self.pos();
        let name = match self.next()? {
            Token::Ident(name) => name,
            _ => {
                return Err(ConditionParseError::Expected {
                    expected: "function call",
                    pos,
                })
            }
        };
        self.expect(Token::LParen, "'('")?;
        let function = name.to_ascii_lowercase();

        let condition = match function.as_str() {
            "succeeded" | "failed" | "always" => {
                self.expect(Token::RParen, "')'")?;
                match function.as_str() {
                    "succeeded" => Condition::Succeeded,
                    "failed" => Condition::Failed,
                    _ => Condition::Always,
                }
            }
            "and" | "or" | "not" => {
                let mut terms = vec![self.condition()?];
                while self.peek() == Some(&Token::Comma) {
                    self.next()?;
                    terms.push(self.condition()?);
                }
                self.expect(Token::RParen, "')'")?;
                match function.as_str() {
                    "and" => Condition::And(terms),
                    "or" => Condition::Or(terms),
                    _ => {
                        if terms.len() != 1 {
                            return Err(ConditionParseError::Arity {
                                function,
                                expected: "1",
                                found: terms.len(),
                            });
                        }
                        Condition::Not(Box::new(terms.remove(0)))
                    }
                }
            }
            "eq" | "ne" => {
                let lhs = self.operand()?;
                self.expect(Token::Comma, "','")?;
                let rhs = self.operand()?;
                self.expect(Token::RParen, "')'")?;
                if function == "eq" {
                    Condition::Equals(lhs, rhs)
                } else {
                    Condition::NotEquals(lhs, rhs)
                }
            }
            _ => return Err(ConditionParseError::UnknownFunction(name)),
        };

        Ok(condition)
    }

    fn operand(&mut self) -> Result<Operand, ConditionParseError> {
        let pos = self.pos();
        match self.next()? {
            Token::Str(value) => Ok(Operand::Literal(value)),
            Token::Ident(name) if name == "variables" && self.peek() == Some(&Token::LBracket) => {
                self.next()?;
                let key_pos = self.pos();
                let key = match self.next()? {
                    Token::Str(key) => key,
                    _ => {
                        return Err(ConditionParseError::Expected {
                            expected: "quoted variable name",
                            pos: key_pos,
                        })
                    }
                };
                self.expect(Token::RBracket, "']'")?;
                Ok(Operand::Fact(key))
            }
            Token::Ident(name) => Ok(Operand::Fact(name)),
            _ => Err(ConditionParseError::Expected {
                expected: "fact name or quoted value",
                pos,
            }),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            tokens: tokenize(s)?,
            cursor: 0,
            end: s.len(),
        };
        let condition = parser.condition()?;
        if parser.cursor < parser.tokens.len() {
            return Err(ConditionParseError::TrailingInput(parser.pos()));
        }
        Ok(condition)
    }
}
