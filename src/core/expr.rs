//! Boolean condition evaluation for conditional steps.
//!
//! Conditions are first run through `${path}` interpolation, then parsed as a
//! small expression language with context paths in scope:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | "===" | "!==" | "<" | "<=" | ">" | ">=") primary )?
//! primary := number | 'string' | "string" | true | false | null | undefined
//!          | path | "(" expr ")"
//! ```
//!
//! Paths resolve against the context (`user.age`, `items.length`,
//! `rows[0].ok`); unknown paths evaluate to null. Truthiness follows the
//! usual scripting rules: null, false, 0, "" are falsy, everything else is truthy.

use serde_json::Value;
use std::cmp::Ordering;

use crate::core::context::{interpolate, resolve, whole_template_path};
use crate::core::errors::{PlanError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 12] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "=",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            while i < chars.len() && chars[i] != quote {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                }
                text.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(PlanError::condition(format!(
                    "unterminated string literal in '{}'",
                    input
                )));
            }
            i += 1;
            tokens.push(Token::Str(text));
            continue;
        }
        let signed = c == '-'
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && starts_operand(&tokens);
        if c.is_ascii_digit() || signed {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = literal
                .parse::<f64>()
                .map_err(|_| PlanError::condition(format!("invalid number '{}'", literal)))?;
            tokens.push(Token::Number(number));
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.' | '[' | ']'))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let rest: String = chars[i..].iter().take(3).collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(&"=") => {
                return Err(PlanError::condition(format!(
                    "assignment is not allowed in condition '{}'",
                    input
                )))
            }
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.len();
            }
            None => {
                return Err(PlanError::condition(format!(
                    "unexpected character '{}' in condition '{}'",
                    c, input
                )))
            }
        }
    }
    Ok(tokens)
}

// A leading '-' is a sign only where an operand is expected.
fn starts_operand(tokens: &[Token]) -> bool {
    matches!(tokens.last(), None | Some(Token::Op(_)) | Some(Token::LParen))
}

/// Deepest `!` / parenthesis nesting a condition may use
pub const MAX_CONDITION_DEPTH: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    ctx: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_CONDITION_DEPTH {
            return Err(PlanError::condition(format!(
                "condition nests deeper than {} levels",
                MAX_CONDITION_DEPTH
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.eat_op("||") {
            let right = self.parse_and()?;
            left = if truthy(&left) { left } else { right };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_unary()?;
        while self.eat_op("&&") {
            let right = self.parse_unary()?;
            left = if truthy(&left) { right } else { left };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.eat_op("!") {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Value::Bool(!truthy(&inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Value> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Op(op)) if matches!(*op, "==" | "!=" | "===" | "!==" | "<" | "<=" | ">" | ">=") => *op,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        let result = match op {
            "==" => loose_eq(&left, &right),
            "!=" => !loose_eq(&left, &right),
            "===" => strict_eq(&left, &right),
            "!==" => !strict_eq(&left, &right),
            _ => match compare(&left, &right) {
                Some(ordering) => match op {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                None => false,
            },
        };
        Ok(Value::Bool(result))
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Number(n)) => Ok(number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(name)) => Ok(self.identifier(&name)),
            Some(Token::LParen) => {
                self.descend()?;
                let value = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(PlanError::condition("expected ')'")),
                }
            }
            Some(other) => Err(PlanError::condition(format!("unexpected token {:?}", other))),
            None => Err(PlanError::condition("unexpected end of condition")),
        }
    }

    fn identifier(&self, name: &str) -> Value {
        match name {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" | "undefined" => Value::Null,
            path => {
                if let Some(value) = resolve(self.ctx, path) {
                    return value.clone();
                }
                // `.length` on arrays and strings
                if let Some(base) = path.strip_suffix(".length") {
                    match resolve(self.ctx, base) {
                        Some(Value::Array(items)) => return Value::from(items.len()),
                        Some(Value::String(s)) => return Value::from(s.chars().count()),
                        _ => {}
                    }
                }
                Value::Null
            }
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(_), _) | (_, Value::Number(_)) | (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => left == right,
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluates `condition` against `ctx`.
///
/// A condition that is exactly `{{path}}` is decided by the truthiness of the
/// referenced value.
pub fn evaluate_condition(condition: &str, ctx: &Value) -> Result<bool> {
    let trimmed = condition.trim();
    if let Some(path) = whole_template_path(trimmed) {
        return Ok(resolve(ctx, path).map(truthy).unwrap_or(false));
    }

    let expanded = interpolate(trimmed, ctx);
    let tokens = tokenize(&expanded)?;
    if tokens.is_empty() {
        return Err(PlanError::condition("empty condition"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        ctx,
    };
    let value = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(PlanError::condition(format!(
            "trailing input in condition '{}'",
            expanded
        )));
    }
    Ok(truthy(&value))
}
