/// Restricted condition evaluator
///
/// Sequence-flow conditions are small boolean expressions over an instance's
/// variables, e.g. `a > 1 and status == "open"`. They are tokenized and parsed
/// by hand; nothing outside the supplied variables is reachable.
///
/// Grammar:
/// ```text
/// expr       := or
/// or         := and (("or" | "||") and)*
/// and        := not (("and" | "&&") not)*
/// not        := ("not" | "!") not | comparison
/// comparison := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
/// primary    := number | string | true | false | null | path | "(" expr ")"
/// path       := identifier ("." identifier)*
/// ```
///
/// Parentheses and negations may nest at most `MAX_DEPTH` levels.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

/// Why a condition could not be evaluated; callers treat every case as `false`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("cannot compare {0} with {1}")]
    Incomparable(String, String),
    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// Evaluate every condition of a flow; all must hold
///
/// Evaluation failures are logged and count as `false`. An empty list passes.
pub fn check_conditions(conditions: &[String], variables: &Map<String, Value>) -> bool {
    conditions.iter().all(|condition| match evaluate(condition, variables) {
        Ok(result) => {
            tracing::debug!("  🧮 '{}' -> {}", condition, result);
            result
        }
        Err(e) => {
            tracing::debug!("  🧮 '{}' failed ({}), treating as false", condition, e);
            false
        }
    })
}

/// Evaluate one expression to a boolean
pub fn evaluate(expression: &str, variables: &Map<String, Value>) -> Result<bool, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ConditionError::UnexpectedToken(format!("{:?}", extra)));
    }
    eval(&expr, variables).map(|v| truthy(&v))
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
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
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_is_eq) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(ConditionError::UnexpectedChar(c, i)),
                };
                tokens.push(token);
                i += if next_is_eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ConditionError::UnexpectedChar(c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ConditionError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Run a nested parse one level deeper, refusing past `MAX_DEPTH`
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>) -> Result<T, ConditionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ConditionError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // Chains stay flat so long `a or b or c ...` lists do not deepen the tree
    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 { operands.remove(0) } else { Expr::Or(operands) })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut operands = vec![self.parse_not()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            operands.push(self.parse_not()?);
        }
        Ok(if operands.len() == 1 { operands.remove(0) } else { Expr::And(operands) })
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "None" => Expr::Literal(Value::Null),
                _ => Expr::Var(word.split('.').map(str::to_string).collect()),
            }),
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn eval(expr: &Expr, variables: &Map<String, Value>) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => lookup(path, variables),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, variables)?))),
        Expr::And(operands) => {
            for operand in operands {
                if !truthy(&eval(operand, variables)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(operands) => {
            for operand in operands {
                if truthy(&eval(operand, variables)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Compare(op, l, r) => {
            let (left, right) = (eval(l, variables)?, eval(r, variables)?);
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn lookup(path: &[String], variables: &Map<String, Value>) -> Result<Value, ConditionError> {
    let unknown = || ConditionError::UnknownVariable(path.join("."));
    let (first, rest) = path.split_first().ok_or_else(unknown)?;
    let mut current = variables.get(first).ok_or_else(unknown)?;
    for key in rest {
        current = current.get(key).ok_or_else(unknown)?;
    }
    Ok(current.clone())
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    let ordering = || {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
        .ok_or_else(|| ConditionError::Incomparable(left.to_string(), right.to_string()))
    };

    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => ordering()? == Ordering::Less,
        CmpOp::Le => ordering()? != Ordering::Greater,
        CmpOp::Gt => ordering()? == Ordering::Greater,
        CmpOp::Ge => ordering()? != Ordering::Less,
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
