//! Typed condition expressions.
//!
//! Predicates on jobs and steps are parsed once at load time into a small
//! expression tree and evaluated against a typed context, so a typo in a
//! field name is a diagnostic rather than a silently-false string
//! comparison. Evaluation is pure: it never executes a step and never
//! touches anything outside the supplied context.
//!
//! Surface syntax:
//!
//! ```text
//! matrix.os == 'windows' && event.trigger != 'pull_request'
//! matrix.task in ['tests', 'docs'] || event.manual
//! !(event.trigger == 'release')
//! ```

use crate::definition::{DimensionAssignment, dimension_value_str};
use crate::error::{Error, Result};
use crate::event::EventContext;
use serde_json::Value;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted field reference: `matrix.os`, `event.trigger`, `job.name`.
    Field(String),
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Membership test: `matrix.task in ['a', 'b']`.
    In {
        needle: Box<Expr>,
        haystack: Vec<Expr>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

/// Typed evaluation context for one job instance.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub job_name: &'a str,
    pub matrix: &'a DimensionAssignment,
    pub event: &'a EventContext,
}

impl EvalContext<'_> {
    fn field(&self, path: &str) -> Result<Value> {
        if let Some(dim) = path.strip_prefix("matrix.") {
            return self
                .matrix
                .get(dim)
                .cloned()
                .ok_or_else(|| Error::UndefinedField(path.to_string()));
        }
        match path {
            "job.name" => Ok(Value::String(self.job_name.to_string())),
            "event.trigger" => Ok(Value::String(self.event.trigger.as_str().to_string())),
            "event.ref" => Ok(Value::String(
                self.event.git_ref.clone().unwrap_or_default(),
            )),
            "event.actor" => Ok(Value::String(self.event.actor.clone().unwrap_or_default())),
            "event.manual" => Ok(Value::Bool(self.event.manual)),
            other => Err(Error::UndefinedField(other.to_string())),
        }
    }
}

impl Expr {
    /// Parse a predicate string into an expression tree.
    pub fn parse(input: &str) -> Result<Expr> {
        let tokens = tokenize(input).map_err(|message| Error::ConditionSyntax {
            expr: input.to_string(),
            message,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr().map_err(|message| Error::ConditionSyntax {
            expr: input.to_string(),
            message,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::ConditionSyntax {
                expr: input.to_string(),
                message: format!("unexpected trailing input at token {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluate to a boolean against the given context.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        match self.eval_value(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::ConditionNotBoolean(dimension_value_str(&other))),
        }
    }

    fn eval_bool(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        self.evaluate(ctx)
    }

    fn eval_value(&self, ctx: &EvalContext<'_>) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(path) => ctx.field(path),
            Expr::Compare { op, lhs, rhs } => {
                let l = lhs.eval_value(ctx)?;
                let r = rhs.eval_value(ctx)?;
                let eq = values_equal(&l, &r);
                Ok(Value::Bool(match op {
                    CompareOp::Eq => eq,
                    CompareOp::Ne => !eq,
                }))
            }
            Expr::In { needle, haystack } => {
                let n = needle.eval_value(ctx)?;
                for item in haystack {
                    if values_equal(&n, &item.eval_value(ctx)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval_bool(ctx)?)),
            Expr::And(a, b) => Ok(Value::Bool(a.eval_bool(ctx)? && b.eval_bool(ctx)?)),
            Expr::Or(a, b) => Ok(Value::Bool(a.eval_bool(ctx)? || b.eval_bool(ctx)?)),
        }
    }
}

/// Compare values the way matrix dimensions are written: booleans and
/// numbers compare natively, everything else by its rendered form, so a
/// quoted `'3.8'` matches an unquoted YAML `3.8`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            x == y || x.as_f64().zip(y.as_f64()).is_some_and(|(l, r)| l == r)
        }
        _ => dimension_value_str(a) == dimension_value_str(b),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(serde_json::Number),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    KwIn,
    True,
    False,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err("expected `==`".to_string());
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err("expected `&&`".to_string());
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::OrOr);
                } else {
                    return Err("expected `||`".to_string());
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                let mut is_float = false;
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        s.push(ch);
                        chars.next();
                    } else if ch == '.' && !is_float {
                        is_float = true;
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = if is_float {
                    s.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .ok_or_else(|| format!("invalid number: {}", s))?
                } else {
                    serde_json::Number::from(
                        s.parse::<i64>().map_err(|_| format!("invalid number: {}", s))?,
                    )
                };
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "in" => tokens.push(Token::KwIn),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(format!("unexpected character `{}`", other)),
        }
    }

    Ok(tokens)
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(format!("expected {:?}, found {:?}", expected, other)),
        }
    }

    fn or_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary_expr()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.unary_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let inner = self.unary_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.primary()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.next();
                let rhs = self.primary()?;
                Ok(Expr::Compare {
                    op: CompareOp::Eq,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            Some(Token::NotEq) => {
                self.next();
                let rhs = self.primary()?;
                Ok(Expr::Compare {
                    op: CompareOp::Ne,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            Some(Token::KwIn) => {
                self.next();
                self.eat(&Token::LBracket)?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.primary()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.eat(&Token::RBracket)?;
                Ok(Expr::In {
                    needle: Box::new(lhs),
                    haystack: items,
                })
            }
            _ => Ok(lhs),
        }
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Ident(path)) => Ok(Expr::Field(path)),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(format!("expected a value, found {:?}", other)),
        }
    }
}
