// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hook `when` expression language.
//!
//! A deliberately tiny, closed language evaluated against a flat JSON
//! object of pre-computed event fields — never against code:
//!
//! ```text
//! code == "spend_exceeded" && cost.turns > 3
//! !retryable || attempt >= 2
//! ```
//!
//! Grammar: `||` over `&&` over `!` over comparison over operand, with
//! parentheses. Operands are field references (dotted identifiers),
//! string / number / boolean / null literals. Comparisons between
//! mismatched types are `false`, never an error; truthiness of non-bool
//! operands follows JSON conventions (null and false are falsy, zero and
//! empty strings are falsy).

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from parsing a `when` expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    /// Unexpected character in the input.
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    /// String literal never closed.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// Parser expected something else here.
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    /// Input ended mid-expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed, reusable `when` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct WhenExpr {
    root: Node,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Lit(Value),
    Field(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ExprError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_operand()?;
        Ok(Node::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(name)) => Ok(Node::Field(name)),
            Some(Token::Str(s)) => Ok(Node::Lit(Value::String(s))),
            Some(Token::Num(n)) => Ok(Node::Lit(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Node::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Lit(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Lit(Value::Null)),
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

impl WhenExpr {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns an [`ExprError`] describing the first problem found.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self { root })
    }

    /// Evaluate against a flat field object.
    #[must_use]
    pub fn eval(&self, fields: &Map<String, Value>) -> bool {
        truthy(&eval_node(&self.root, fields))
    }
}

fn eval_node(node: &Node, fields: &Map<String, Value>) -> Value {
    match node {
        Node::Lit(v) => v.clone(),
        Node::Field(path) => lookup(fields, path).cloned().unwrap_or(Value::Null),
        Node::Not(inner) => Value::Bool(!truthy(&eval_node(inner, fields))),
        Node::And(l, r) => Value::Bool(
            truthy(&eval_node(l, fields)) && truthy(&eval_node(r, fields)),
        ),
        Node::Or(l, r) => Value::Bool(
            truthy(&eval_node(l, fields)) || truthy(&eval_node(r, fields)),
        ),
        Node::Cmp(op, l, r) => {
            let lv = eval_node(l, fields);
            let rv = eval_node(r, fields);
            Value::Bool(compare(*op, &lv, &rv))
        }
    }
}

fn lookup<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            // Mismatched types never satisfy an ordering comparison.
            ordering.is_some_and(|ord| match op {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}
