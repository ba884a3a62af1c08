//! Guard expressions.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) primary )?
//! primary    := number | string | "true" | "false" | identifier | "(" expr ")"
//! ```
//!
//! Identifiers are variable names. Types are never coerced: comparing a
//! number with a string, or using a non-boolean where a boolean is required,
//! is `source_code_is_broken`.

use dispatchcore::{ProcessingErrorKind, ProcessingFailure, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    And,
    Or,
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

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Scalar),
    Variable(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Scalar {
    fn type_name(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Number(_) => "number",
            Scalar::Str(_) => "string",
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::Int(n as i64),
            Scalar::Number(n) => Value::Float(n),
            Scalar::Str(s) => Value::String(s),
        }
    }

    fn from_value(name: &str, value: Value) -> Result<Self, ProcessingFailure> {
        match value {
            Value::Bool(b) => Ok(Scalar::Bool(b)),
            Value::Int(n) => Ok(Scalar::Number(n as f64)),
            Value::Float(n) => Ok(Scalar::Number(n)),
            Value::String(s) => Ok(Scalar::Str(s)),
            Value::Json(serde_json::Value::Bool(b)) => Ok(Scalar::Bool(b)),
            Value::Json(serde_json::Value::Number(n)) => Ok(Scalar::Number(n.as_f64().unwrap_or(f64::NAN))),
            Value::Json(serde_json::Value::String(s)) => Ok(Scalar::Str(s)),
            other => Err(broken(format!(
                "variable '{name}' has type {} which can't be used in an expression",
                other.type_name()
            ))),
        }
    }
}

fn broken(message: impl Into<String>) -> ProcessingFailure {
    ProcessingFailure::new(ProcessingErrorKind::SourceCodeIsBroken, message)
}

fn tokenize(input: &str) -> Result<Vec<Token>, ProcessingFailure> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(broken(format!("unterminated string in '{input}'")));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| broken(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(broken(format!(
                    "unexpected character '{other}' in '{input}'"
                )))
            }
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ProcessingFailure> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ProcessingFailure> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ProcessingFailure> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ProcessingFailure> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ProcessingFailure> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Scalar::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Scalar::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Scalar::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Scalar::Bool(false))),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(broken("missing ')'")),
                }
            }
            Some(other) => Err(broken(format!("unexpected token {other:?}"))),
            None => Err(broken("unexpected end of expression")),
        }
    }
}

fn parse(input: &str) -> Result<Expr, ProcessingFailure> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(broken("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(broken(format!("trailing input in '{input}'")));
    }
    Ok(expr)
}

fn eval<R>(expr: &Expr, resolve: &R) -> Result<Scalar, ProcessingFailure>
where
    R: Fn(&str) -> Result<Value, ProcessingFailure>,
{
    match expr {
        Expr::Literal(s) => Ok(s.clone()),
        Expr::Variable(name) => Scalar::from_value(name, resolve(name)?),
        Expr::Not(inner) => Ok(Scalar::Bool(!eval_bool(inner, resolve)?)),
        Expr::And(l, r) => Ok(Scalar::Bool(eval_bool(l, resolve)? && eval_bool(r, resolve)?)),
        Expr::Or(l, r) => Ok(Scalar::Bool(eval_bool(l, resolve)? || eval_bool(r, resolve)?)),
        Expr::Compare(op, l, r) => {
            let left = eval(l, resolve)?;
            let right = eval(r, resolve)?;
            compare(*op, &left, &right).map(Scalar::Bool)
        }
    }
}

fn eval_bool<R>(expr: &Expr, resolve: &R) -> Result<bool, ProcessingFailure>
where
    R: Fn(&str) -> Result<Value, ProcessingFailure>,
{
    match eval(expr, resolve)? {
        Scalar::Bool(b) => Ok(b),
        other => Err(broken(format!(
            "expected bool but got {} ({other:?})",
            other.type_name()
        ))),
    }
}

fn compare(op: CompareOp, left: &Scalar, right: &Scalar) -> Result<bool, ProcessingFailure> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Bool(a), Scalar::Bool(b)) => match op {
            CompareOp::Eq => return Ok(a == b),
            CompareOp::Ne => return Ok(a != b),
            _ => return Err(broken("booleans can only be compared with == and !=")),
        },
        (a, b) => {
            return Err(broken(format!(
                "can't compare {} with {}",
                a.type_name(),
                b.type_name()
            )))
        }
    };
    let Some(ordering) = ordering else {
        return Ok(matches!(op, CompareOp::Ne));
    };
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

/// Evaluates `expression`, resolving identifiers through `resolve`.
pub fn evaluate<R>(expression: &str, resolve: R) -> Result<Scalar, ProcessingFailure>
where
    R: Fn(&str) -> Result<Value, ProcessingFailure>,
{
    eval(&parse(expression)?, &resolve)
}

/// Evaluates a guard. Anything but a boolean result fails closed.
pub fn evaluate_condition<R>(expression: &str, resolve: R) -> Result<bool, ProcessingFailure>
where
    R: Fn(&str) -> Result<Value, ProcessingFailure>,
{
    eval_bool(&parse(expression)?, &resolve)
}
