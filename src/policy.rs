//! # Policy Evaluator
//!
//! A small sandboxed expression language evaluated against a probe's parsed
//! JSON response body. Backs `ProbeSpec.responseParsing`: a boolean
//! `condition`, a string `dataExpression`, and a string `outputFormat`.
//!
//! Grammar (informal): literals (string, int, float, bool, null), `a.b`
//! member access, `a[i]` indexing, unary `!`/`-`, binary arithmetic
//! (`+ - * /`), comparison (`== != < <= > >=`), logical (`&& ||`), and the
//! builtins `has(path)`, `size(x)`, `string(x)`, `now`.
//!
//! This is intentionally not a general-purpose language: there is no
//! assignment, no loops, and no user-defined functions, so a hostile or
//! buggy expression cannot do anything but read the body and compute a
//! value.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("parse error at position {pos}: {message}")]
    Parse { pos: usize, message: String },
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("expression did not evaluate to a {expected}")]
    WrongType { expected: &'static str },
}

/// Outcome of evaluating a probe's `PolicySpec` against a response body.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    pub condition_met: bool,
    pub extracted: Vec<String>,
    pub formatted: String,
    pub error: Option<String>,
}

/// Evaluate `condition` (must yield bool), `data_expression` and
/// `output_format` (each, if present, must yield a string-coercible value)
/// against `body`.
pub fn evaluate(
    condition: Option<&str>,
    data_expression: Option<&str>,
    output_format: Option<&str>,
    body: &Value,
) -> EvaluationOutcome {
    let mut outcome = EvaluationOutcome::default();

    let condition_result = match condition {
        Some(expr) => run_bool(expr, body),
        None => Ok(true),
    };
    match condition_result {
        Ok(met) => outcome.condition_met = met,
        Err(e) => {
            outcome.condition_met = false;
            outcome.error = Some(e.to_string());
            return outcome;
        }
    }

    if let Some(expr) = data_expression {
        match run_value(expr, body) {
            Ok(v) => outcome.extracted.push(value_to_string(&v)),
            Err(e) => {
                outcome.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    if let Some(expr) = output_format {
        match run_value(expr, body) {
            Ok(v) => outcome.formatted = value_to_string(&v),
            Err(e) => {
                outcome.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    outcome
}

/// Legacy field-path mode: extract a single value by a dotted/indexed path
/// (`a.b[0].c`) verbatim, without going through the expression compiler.
pub fn extract_by_path(body: &Value, path: &str) -> Result<Value, EvalError> {
    let tokens = tokenize(path).map_err(|e| EvalError::Parse {
        pos: 0,
        message: e,
    })?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_path_only()?;
    Evaluator { root: body }.eval(&expr)
}

fn run_bool(expr: &str, body: &Value) -> Result<bool, EvalError> {
    let value = run_value(expr, body)?;
    value.as_bool().ok_or(EvalError::WrongType {
        expected: "boolean",
    })
}

fn run_value(expr: &str, body: &Value) -> Result<Value, EvalError> {
    let tokens = tokenize(expr).map_err(|e| EvalError::Parse {
        pos: 0,
        message: e,
    })?;
    let mut parser = Parser::new(tokens);
    let ast = parser.parse_expr(0)?;
    parser.expect_end()?;
    Evaluator { root: body }.eval(&ast)
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Bang,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(format!("unexpected '=' at position {i}"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    tokens.push(Token::Float(text.parse().map_err(|_| {
                        format!("invalid number literal '{text}'")
                    })?));
                } else {
                    tokens.push(Token::Int(text.parse().map_err(|_| {
                        format!("invalid number literal '{text}'")
                    })?));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => return Err(format!("unexpected character '{other}' at position {i}")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------
// AST + recursive-descent parser
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Now,
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        f.write_str(s)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_end(&self) -> Result<(), EvalError> {
        if self.pos != self.tokens.len() {
            return Err(EvalError::Parse {
                pos: self.pos,
                message: "trailing tokens after expression".to_string(),
            });
        }
        Ok(())
    }

    /// Parse a bare member/index path, used by the legacy `ExtractByPath` mode.
    fn parse_path_only(&mut self) -> Result<Expr, EvalError> {
        let expr = self.parse_postfix()?;
        self.expect_end()?;
        Ok(expr)
    }

    // Precedence climbing: || < && < equality < relational < additive < multiplicative < unary < postfix
    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let (op, prec) = match self.peek() {
                Some(Token::Or) => (BinOp::Or, 1),
                Some(Token::And) => (BinOp::And, 2),
                Some(Token::Eq) => (BinOp::Eq, 3),
                Some(Token::Ne) => (BinOp::Ne, 3),
                Some(Token::Lt) => (BinOp::Lt, 4),
                Some(Token::Le) => (BinOp::Le, 4),
                Some(Token::Gt) => (BinOp::Gt, 4),
                Some(Token::Ge) => (BinOp::Ge, 4),
                Some(Token::Plus) => (BinOp::Add, 5),
                Some(Token::Minus) => (BinOp::Sub, 5),
                Some(Token::Star) => (BinOp::Mul, 6),
                Some(Token::Slash) => (BinOp::Div, 6),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.next();
            let rhs = self.parse_expr(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.next();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(n)) => n,
                        other => {
                            return Err(EvalError::Parse {
                                pos: self.pos,
                                message: format!("expected identifier after '.', got {other:?}"),
                            })
                        }
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expr(0)?;
                    match self.next() {
                        Some(Token::RBracket) => {}
                        other => {
                            return Err(EvalError::Parse {
                                pos: self.pos,
                                message: format!("expected ']', got {other:?}"),
                            })
                        }
                    }
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Float(n)) => Ok(Expr::Float(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(EvalError::Parse {
                        pos: self.pos,
                        message: format!("expected ')', got {other:?}"),
                    }),
                }
            }
            Some(Token::Ident(name)) => {
                if name == "now" {
                    return Ok(Expr::Now);
                }
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    match self.next() {
                        Some(Token::RParen) => {}
                        other => {
                            return Err(EvalError::Parse {
                                pos: self.pos,
                                message: format!("expected ')', got {other:?}"),
                            })
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(EvalError::Parse {
                pos: self.pos,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------

struct Evaluator<'a> {
    root: &'a Value,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(n) => Ok(Value::from(*n)),
            Expr::Float(n) => Ok(Value::from(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Now => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
            Expr::Var(name) => {
                if name == "body" || name == "response" {
                    Ok(self.root.clone())
                } else {
                    Ok(self.root.get(name).cloned().unwrap_or(Value::Null))
                }
            }
            Expr::Member(base, field) => {
                let base = self.eval(base)?;
                Ok(base.get(field).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(base, idx) => {
                let base = self.eval(base)?;
                let idx = self.eval(idx)?;
                match (&base, &idx) {
                    (Value::Array(arr), Value::Number(n)) => {
                        let i = n.as_u64().ok_or(EvalError::WrongType {
                            expected: "non-negative index",
                        })? as usize;
                        Ok(arr.get(i).cloned().unwrap_or(Value::Null))
                    }
                    (Value::Object(_), Value::String(key)) => {
                        Ok(base.get(key).cloned().unwrap_or(Value::Null))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::Unary(UnOp::Not, inner) => {
                let v = self.eval(inner)?;
                Ok(Value::Bool(!truthy(&v)))
            }
            Expr::Unary(UnOp::Neg, inner) => {
                let v = self.eval(inner)?;
                if let Some(i) = v.as_i64() {
                    Ok(Value::from(-i))
                } else if let Some(n) = v.as_f64() {
                    Ok(Value::from(-n))
                } else {
                    Err(EvalError::WrongType { expected: "number" })
                }
            }
            Expr::Binary(BinOp::And, l, r) => {
                let lv = self.eval(l)?;
                if !truthy(&lv) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(r)?)))
            }
            Expr::Binary(BinOp::Or, l, r) => {
                let lv = self.eval(l)?;
                if truthy(&lv) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(r)?)))
            }
            Expr::Binary(op @ (BinOp::Eq | BinOp::Ne), l, r) => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let eq = values_equal(&lv, &rv);
                Ok(Value::Bool(if matches!(op, BinOp::Eq) { eq } else { !eq }))
            }
            Expr::Binary(
                op @ (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge),
                l,
                r,
            ) => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let (a, b) = (
                    lv.as_f64().ok_or(EvalError::WrongType { expected: "number" })?,
                    rv.as_f64().ok_or(EvalError::WrongType { expected: "number" })?,
                );
                let result = match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            Expr::Binary(op @ (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div), l, r) => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                if let (BinOp::Add, Value::String(a), Value::String(b)) = (op, &lv, &rv) {
                    return Ok(Value::String(format!("{a}{b}")));
                }
                let a = lv.as_f64().ok_or(EvalError::WrongType { expected: "number" })?;
                let b = rv.as_f64().ok_or(EvalError::WrongType { expected: "number" })?;
                let result = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(EvalError::Eval("division by zero".to_string()));
                        }
                        a / b
                    }
                    _ => unreachable!(),
                };
                Ok(serde_json::Number::from_f64(result)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_call(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        match name {
            "has" => {
                let arg = args.first().ok_or_else(|| {
                    EvalError::Eval("has() requires one argument".to_string())
                })?;
                Ok(Value::Bool(!matches!(self.eval(arg)?, Value::Null)))
            }
            "size" => {
                let arg = args.first().ok_or_else(|| {
                    EvalError::Eval("size() requires one argument".to_string())
                })?;
                let v = self.eval(arg)?;
                let n = match &v {
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Null => 0,
                    _ => {
                        return Err(EvalError::Eval(
                            "size() requires an array, object or string".to_string(),
                        ))
                    }
                };
                Ok(Value::from(n as u64))
            }
            "string" => {
                let arg = args.first().ok_or_else(|| {
                    EvalError::Eval("string() requires one argument".to_string())
                })?;
                Ok(Value::String(value_to_string(&self.eval(arg)?)))
            }
            other => Err(EvalError::Eval(format!("unknown function '{other}'"))),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_compares_nested_field() {
        let body = json!({"status": {"code": 200}, "ok": true});
        let outcome = evaluate(Some("status.code == 200"), None, None, &body);
        assert!(outcome.condition_met);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn condition_non_boolean_is_failure() {
        let body = json!({"status": {"code": 200}});
        let outcome = evaluate(Some("status.code"), None, None, &body);
        assert!(!outcome.condition_met);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn data_expression_extracts_and_output_format_concatenates() {
        let body = json!({"name": "widget", "count": 3});
        let outcome = evaluate(
            Some("has(name)"),
            Some("name"),
            Some("string(count)"),
            &body,
        );
        assert!(outcome.condition_met);
        assert_eq!(outcome.extracted, vec!["widget".to_string()]);
        assert_eq!(outcome.formatted, "3");
    }

    #[test]
    fn index_into_array() {
        let body = json!({"items": ["a", "b", "c"]});
        let outcome = evaluate(Some("items[1] == 'b'"), None, None, &body);
        assert!(outcome.condition_met);
    }

    #[test]
    fn logical_operators_short_circuit() {
        let body = json!({"a": true, "b": false});
        let outcome = evaluate(Some("a || b"), None, None, &body);
        assert!(outcome.condition_met);
        let outcome = evaluate(Some("a && b"), None, None, &body);
        assert!(!outcome.condition_met);
    }

    #[test]
    fn has_detects_missing_path() {
        let body = json!({"present": 1});
        let outcome = evaluate(Some("!has(missing)"), None, None, &body);
        assert!(outcome.condition_met);
    }

    #[test]
    fn extract_by_path_matches_legacy_mode() {
        let body = json!({"data": {"items": [{"id": 7}]}});
        let v = extract_by_path(&body, "data.items[0].id").expect("path resolves");
        assert_eq!(v, json!(7));
    }

    #[test]
    fn now_returns_rfc3339_string() {
        let body = json!({});
        let outcome = evaluate(None, Some("now"), None, &body);
        assert!(outcome.formatted.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&outcome.extracted[0]).is_ok());
    }
}
