//! Success/failure predicates over a metric value
//!
//! Grammar (`||` binds loosest):
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := operand ( "<" | "<=" | ">" | ">=" | "==" | "!=" ) operand
//! operand := "result" | number
//! ```
//!
//! `result` is bound to the value returned by the metric evaluator. Equality
//! compares within `f64::EPSILON`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("invalid condition at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("metric value {0} is not finite")]
    NonFinite(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Result,
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { lhs: Operand, op: CmpOp, rhs: Operand },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: input.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((offset, token)) = parser.peek_with_offset() {
            return Err(ConditionError::Parse {
                position: offset,
                message: format!("unexpected {}", token),
            });
        }
        Ok(expr)
    }

    /// Evaluate against a metric value
    ///
    /// Non-finite values (NaN, ±Inf) are rejected rather than compared.
    pub fn evaluate(&self, value: f64) -> Result<bool, ConditionError> {
        if !value.is_finite() {
            return Err(ConditionError::NonFinite(value));
        }
        Ok(self.eval(value))
    }

    fn eval(&self, value: f64) -> bool {
        match self {
            Condition::Compare { lhs, op, rhs } => {
                let a = resolve(*lhs, value);
                let b = resolve(*rhs, value);
                match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    CmpOp::Eq => (a - b).abs() < f64::EPSILON,
                    CmpOp::Ne => (a - b).abs() >= f64::EPSILON,
                }
            }
            Condition::And(l, r) => l.eval(value) && r.eval(value),
            Condition::Or(l, r) => l.eval(value) || r.eval(value),
            Condition::Not(inner) => !inner.eval(value),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

fn resolve(operand: Operand, value: f64) -> f64 {
    match operand {
        Operand::Result => value,
        Operand::Number(n) => n,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Result,
    Number(f64),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Result => write!(f, "'result'"),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Cmp(op) => write!(f, "operator {:?}", op),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Not => write!(f, "'!'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            (b'<', Some(b'=')) => (Token::Cmp(CmpOp::Le), 2),
            (b'>', Some(b'=')) => (Token::Cmp(CmpOp::Ge), 2),
            (b'=', Some(b'=')) => (Token::Cmp(CmpOp::Eq), 2),
            (b'!', Some(b'=')) => (Token::Cmp(CmpOp::Ne), 2),
            (b'&', Some(b'&')) => (Token::And, 2),
            (b'|', Some(b'|')) => (Token::Or, 2),
            (b'<', _) => (Token::Cmp(CmpOp::Lt), 1),
            (b'>', _) => (Token::Cmp(CmpOp::Gt), 1),
            (b'!', _) => (Token::Not, 1),
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            _ if c.is_ascii_digit()
                || c == b'.'
                || (c == b'-' && next.is_some_and(|n| n.is_ascii_digit() || n == b'.')) =>
            {
                let len = number_len(&bytes[i..]);
                let text = &input[i..i + len];
                let n = text.parse::<f64>().map_err(|_| ConditionError::Parse {
                    position: i,
                    message: format!("invalid number '{}'", text),
                })?;
                (Token::Number(n), len)
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let len = bytes[i..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
                let word = &input[i..i + len];
                if word != "result" {
                    return Err(ConditionError::Parse {
                        position: i,
                        message: format!("unknown identifier '{}'", word),
                    });
                }
                (Token::Result, len)
            }
            _ => {
                return Err(ConditionError::Parse {
                    position: i,
                    message: format!("unexpected character '{}'", c as char),
                })
            }
        };

        tokens.push((i, token));
        i += width;
    }

    Ok(tokens)
}

/// Length of a numeric literal: optional sign, digits, fraction, exponent
fn number_len(bytes: &[u8]) -> usize {
    let mut len = 0;
    if bytes.first() == Some(&b'-') {
        len += 1;
    }
    while len < bytes.len() && (bytes[len].is_ascii_digit() || bytes[len] == b'.') {
        len += 1;
    }
    if len < bytes.len() && (bytes[len] == b'e' || bytes[len] == b'E') {
        let mut exp = len + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        let digits = bytes[exp..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits > 0 {
            len = exp + digits;
        }
    }
    len
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    end: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_with_offset(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(o, t)| (*o, t))
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Parse {
            position: self.offset(),
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Condition::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            _ => self.parse_compare(),
        }
    }

    fn parse_compare(&mut self) -> Result<Condition, ConditionError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Cmp(op)) => *op,
            _ => return Err(self.error("expected comparison operator")),
        };
        self.pos += 1;
        let rhs = self.parse_operand()?;
        Ok(Condition::Compare { lhs, op, rhs })
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let operand = match self.peek() {
            Some(Token::Result) => Operand::Result,
            Some(Token::Number(n)) => Operand::Number(*n),
            Some(other) => return Err(self.error(format!("expected operand, found {}", other))),
            None => return Err(self.error("unexpected end of condition")),
        };
        self.pos += 1;
        Ok(operand)
    }
}
