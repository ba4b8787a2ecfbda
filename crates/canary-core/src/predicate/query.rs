//! A small instant-query engine for health predicates.
//!
//! The supported language is the PromQL subset deployment predicates
//! actually use: vector selectors with equality/inequality label matchers,
//! number literals, unary minus, arithmetic (`+ - * /`), and filtering
//! comparisons (`== != > < >= <=`). Comparison operators bind loosest, then
//! additive, then multiplicative, matching PromQL precedence.
//!
//! Every selector must name a metric and carry a `source_id` equality
//! matcher: `source_id` is the tenancy label that routes the read, not a
//! series label, so the engine cannot fetch anything without it. Both rules
//! are enforced when the expression is parsed, which makes a bad expression
//! a construction-time configuration error rather than a runtime surprise.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::series;
use crate::timeseries::{MetricReader, ReadError};

/// How far back a selector looks for the sample that represents "now".
const LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// Errors detected while parsing or validating an expression.
///
/// These are configuration errors: the query text itself is wrong, so the
/// process should refuse to start rather than tick against it.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The expression could not be parsed.
    #[error("invalid query: {0}")]
    Parse(String),

    /// A selector had matchers but no metric name.
    #[error("selector does not name a metric")]
    MissingMetricName,

    /// A selector lacked a `source_id` equality matcher.
    #[error("metric '{0}' does not have a 'source_id' label")]
    MissingSourceId(String),
}

/// Errors detected while evaluating a parsed expression.
#[derive(Debug, Error)]
pub(crate) enum EvalError {
    /// The time-series backend failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Scalar-to-scalar comparisons need a modifier this engine does not
    /// support.
    #[error("comparisons between two scalars are not supported")]
    ScalarComparison,
}

/// One element of an instant vector.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sample {
    /// The series' identifying labels (envelope tags).
    pub labels: BTreeMap<String, String>,

    /// The series' value at the evaluated instant.
    pub value: f64,
}

/// The result of evaluating an expression at an instant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    /// A bare number.
    Scalar(f64),

    /// An instant vector, possibly empty.
    Vector(Vec<Sample>),
}

impl Value {
    /// Whether the result carries no data. Only a vector can be empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar(_) => false,
            Self::Vector(samples) => samples.is_empty(),
        }
    }
}

/// A label matcher applied to envelope tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

/// Matcher operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchOp {
    /// The tag must be present and equal.
    Eq,

    /// The tag must be absent or different.
    Ne,
}

/// A validated vector selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Selector {
    /// The metric name (`__name__`).
    pub metric: String,

    /// The tenancy source the read is issued against.
    pub source_id: String,

    /// Remaining matchers, applied to envelope tags.
    pub matchers: Vec<Matcher>,
}

impl Selector {
    fn build(name: Option<String>, raw: Vec<RawMatcher>) -> Result<Self, QueryError> {
        let mut metric = name;
        let mut source_id = None;
        let mut matchers = Vec::new();

        for matcher in raw {
            match matcher.name.as_str() {
                "__name__" => {
                    if matcher.op != MatchOp::Eq {
                        return Err(QueryError::Parse(
                            "__name__ matcher must use '='".to_string(),
                        ));
                    }
                    if metric.is_some() {
                        return Err(QueryError::Parse("metric name set twice".to_string()));
                    }
                    metric = Some(matcher.value);
                }
                "source_id" => {
                    if matcher.op != MatchOp::Eq {
                        return Err(QueryError::Parse(
                            "source_id matcher must use '='".to_string(),
                        ));
                    }
                    source_id = Some(matcher.value);
                }
                _ => matchers.push(Matcher {
                    name: matcher.name,
                    op: matcher.op,
                    value: matcher.value,
                }),
            }
        }

        let metric = metric.ok_or(QueryError::MissingMetricName)?;
        let source_id = source_id.ok_or_else(|| QueryError::MissingSourceId(metric.clone()))?;

        Ok(Self {
            metric,
            source_id,
            matchers,
        })
    }
}

/// Binary operators, arithmetic and filtering comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl BinaryOp {
    const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Gt | Self::Lt | Self::Ge | Self::Le
        )
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            _ => unreachable!("comparisons filter, they do not compute"),
        }
    }

    fn compare(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
            _ => unreachable!("arithmetic operators compute, they do not filter"),
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Selector(Selector),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn collect_selectors<'a>(&'a self, out: &mut Vec<&'a Selector>) {
        match self {
            Self::Number(_) => {}
            Self::Selector(selector) => out.push(selector),
            Self::Neg(inner) => inner.collect_selectors(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_selectors(out);
                rhs.collect_selectors(out);
            }
        }
    }
}

/// A parsed, validated instant query, ready to evaluate repeatedly.
pub(crate) struct InstantQuery {
    expr: Expr,
}

impl InstantQuery {
    /// Parses and validates an expression.
    pub fn parse(input: &str) -> Result<Self, QueryError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expression()?;
        if let Some(token) = parser.peek() {
            return Err(QueryError::Parse(format!(
                "unexpected trailing input at '{token}'"
            )));
        }
        Ok(Self { expr })
    }

    /// The selectors the expression will read, in evaluation order.
    pub fn selectors(&self) -> Vec<&Selector> {
        let mut out = Vec::new();
        self.expr.collect_selectors(&mut out);
        out
    }

    /// Evaluates the expression at `at`, issuing one read per selector over
    /// the lookback window ending at `at`.
    pub async fn evaluate(
        &self,
        reader: &dyn MetricReader,
        at: DateTime<Utc>,
    ) -> Result<Value, EvalError> {
        let lookback = chrono::Duration::from_std(LOOKBACK).unwrap_or(chrono::Duration::zero());
        let start = at - lookback;

        let mut fetched = Vec::new();
        for selector in self.selectors() {
            fetched.push(series::select(reader, selector, start, at).await?);
        }

        let mut cursor = 0;
        eval(&self.expr, &fetched, &mut cursor)
    }
}

/// Pure evaluation over pre-fetched selector results. `cursor` walks
/// `fetched` in the same order `selectors()` produced it.
fn eval(expr: &Expr, fetched: &[Vec<Sample>], cursor: &mut usize) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Scalar(*n)),
        Expr::Selector(_) => {
            let samples = fetched[*cursor].clone();
            *cursor += 1;
            Ok(Value::Vector(samples))
        }
        Expr::Neg(inner) => match eval(inner, fetched, cursor)? {
            Value::Scalar(n) => Ok(Value::Scalar(-n)),
            Value::Vector(mut samples) => {
                for sample in &mut samples {
                    sample.value = -sample.value;
                }
                Ok(Value::Vector(samples))
            }
        },
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, fetched, cursor)?;
            let rhs = eval(rhs, fetched, cursor)?;
            apply_binary(*op, lhs, rhs)
        }
    }
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => {
            if op.is_comparison() {
                return Err(EvalError::ScalarComparison);
            }
            Ok(Value::Scalar(op.apply(l, r)))
        }
        (Value::Vector(samples), Value::Scalar(scalar)) => {
            Ok(Value::Vector(vector_scalar(op, samples, scalar, false)))
        }
        (Value::Scalar(scalar), Value::Vector(samples)) => {
            Ok(Value::Vector(vector_scalar(op, samples, scalar, true)))
        }
        (Value::Vector(lhs), Value::Vector(rhs)) => Ok(Value::Vector(vector_vector(op, lhs, rhs))),
    }
}

fn vector_scalar(op: BinaryOp, samples: Vec<Sample>, scalar: f64, scalar_on_left: bool) -> Vec<Sample> {
    let mut out = Vec::with_capacity(samples.len());
    for mut sample in samples {
        let (l, r) = if scalar_on_left {
            (scalar, sample.value)
        } else {
            (sample.value, scalar)
        };
        if op.is_comparison() {
            if op.compare(l, r) {
                out.push(sample);
            }
        } else {
            sample.value = op.apply(l, r);
            out.push(sample);
        }
    }
    out
}

/// One-to-one matching on identical label sets; unmatched entries drop out.
/// Comparisons keep the left sample; arithmetic keeps the left labels.
fn vector_vector(op: BinaryOp, lhs: Vec<Sample>, rhs: Vec<Sample>) -> Vec<Sample> {
    let by_labels: BTreeMap<_, _> = rhs
        .into_iter()
        .map(|sample| (sample.labels.clone(), sample.value))
        .collect();

    let mut out = Vec::new();
    for mut sample in lhs {
        let Some(&rhs_value) = by_labels.get(&sample.labels) else {
            continue;
        };
        if op.is_comparison() {
            if op.compare(sample.value, rhs_value) {
                out.push(sample);
            }
        } else {
            sample.value = op.apply(sample.value, rhs_value);
            out.push(sample);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Assign,
    EqEq,
    NotEq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "{name}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::LBrace => f.write_str("{"),
            Self::RBrace => f.write_str("}"),
            Self::Comma => f.write_str(","),
            Self::Plus => f.write_str("+"),
            Self::Minus => f.write_str("-"),
            Self::Star => f.write_str("*"),
            Self::Slash => f.write_str("/"),
            Self::Assign => f.write_str("="),
            Self::EqEq => f.write_str("=="),
            Self::NotEq => f.write_str("!="),
            Self::Gt => f.write_str(">"),
            Self::Lt => f.write_str("<"),
            Self::Ge => f.write_str(">="),
            Self::Le => f.write_str("<="),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

#[allow(clippy::too_many_lines)]
fn lex(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::EqEq);
                    }
                    Some('~') => {
                        return Err(QueryError::Parse(
                            "regex matchers are not supported".to_string(),
                        ));
                    }
                    _ => tokens.push(Token::Assign),
                }
            }
            '!' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::NotEq);
                    }
                    Some('~') => {
                        return Err(QueryError::Parse(
                            "regex matchers are not supported".to_string(),
                        ));
                    }
                    _ => {
                        return Err(QueryError::Parse("expected '=' after '!'".to_string()));
                    }
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            quote @ ('"' | '\'') => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(QueryError::Parse("unterminated string".to_string()));
                        }
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(escaped) => value.push(escaped),
                            None => {
                                return Err(QueryError::Parse("unterminated string".to_string()));
                            }
                        },
                        Some(c) => value.push(c),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if is_ident_start(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(name));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_digit() && c != '.' {
                        break;
                    }
                    literal.push(c);
                    chars.next();
                }
                let number = literal
                    .parse()
                    .map_err(|_| QueryError::Parse(format!("invalid number '{literal}'")))?;
                tokens.push(Token::Number(number));
            }
            c => {
                return Err(QueryError::Parse(format!("unexpected character '{c}'")));
            }
        }
    }

    Ok(tokens)
}

struct RawMatcher {
    name: String,
    op: MatchOp,
    value: String,
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

    fn expect(&mut self, expected: &Token) -> Result<(), QueryError> {
        match self.next() {
            Some(token) if token == *expected => Ok(()),
            Some(token) => Err(QueryError::Parse(format!(
                "expected '{expected}', found '{token}'"
            ))),
            None => Err(QueryError::Parse(format!(
                "expected '{expected}', found end of query"
            ))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, QueryError> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::Le) => BinaryOp::Le,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, QueryError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, QueryError> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                let matchers = if self.peek() == Some(&Token::LBrace) {
                    self.parse_matchers()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Selector(Selector::build(Some(name), matchers)?))
            }
            Some(Token::LBrace) => {
                let matchers = self.parse_matchers()?;
                Ok(Expr::Selector(Selector::build(None, matchers)?))
            }
            Some(token) => Err(QueryError::Parse(format!("unexpected token '{token}'"))),
            None => Err(QueryError::Parse("unexpected end of query".to_string())),
        }
    }

    fn parse_matchers(&mut self) -> Result<Vec<RawMatcher>, QueryError> {
        self.expect(&Token::LBrace)?;
        let mut matchers = Vec::new();

        if self.peek() == Some(&Token::RBrace) {
            self.pos += 1;
            return Ok(matchers);
        }

        loop {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                Some(token) => {
                    return Err(QueryError::Parse(format!(
                        "expected label name, found '{token}'"
                    )));
                }
                None => {
                    return Err(QueryError::Parse(
                        "expected label name, found end of query".to_string(),
                    ));
                }
            };

            let op = match self.next() {
                Some(Token::Assign) => MatchOp::Eq,
                Some(Token::NotEq) => MatchOp::Ne,
                Some(token) => {
                    return Err(QueryError::Parse(format!(
                        "expected '=' or '!=', found '{token}'"
                    )));
                }
                None => {
                    return Err(QueryError::Parse(
                        "expected matcher operator, found end of query".to_string(),
                    ));
                }
            };

            let value = match self.next() {
                Some(Token::Str(value)) => value,
                Some(token) => {
                    return Err(QueryError::Parse(format!(
                        "expected quoted label value, found '{token}'"
                    )));
                }
                None => {
                    return Err(QueryError::Parse(
                        "expected label value, found end of query".to_string(),
                    ));
                }
            };

            matchers.push(RawMatcher { name, op, value });

            match self.next() {
                Some(Token::Comma) => {
                    if self.peek() == Some(&Token::RBrace) {
                        self.pos += 1;
                        return Ok(matchers);
                    }
                }
                Some(Token::RBrace) => return Ok(matchers),
                Some(token) => {
                    return Err(QueryError::Parse(format!(
                        "expected ',' or '}}', found '{token}'"
                    )));
                }
                None => {
                    return Err(QueryError::Parse(
                        "unterminated matcher list".to_string(),
                    ));
                }
            }
        }
    }
}
