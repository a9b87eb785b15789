//! String predicates for the `condition` handler.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in list`
//! - Dot-path access rooted at `params` or `auth`: `params.owner`, `auth.id`
//! - Literals: integers, floats (`-` allowed in front), `"strings"`, `true`, `false`, `null`
//! - Parentheses for grouping
//!
//! Missing paths evaluate to `null`, so `params.owner == null` tests for absence.

use serde_json::{json, Value};

use crate::acl::errors::AclError;
use crate::acl::types::AuthContext;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

// ─── Lexer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Dot,
    LParen,
    RParen,
    Compare(CompareOp),
    And,
    Or,
    Not,
    Minus,
    In,
}

fn tokenize(input: &str) -> Result<Vec<Token>, AclError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => s.push(escaped),
                        None => {
                            return Err(AclError::InvalidCondition(
                                "unterminated string literal".into(),
                            ));
                        }
                    },
                    Some(ch) => s.push(ch),
                    None => {
                        return Err(AclError::InvalidCondition(
                            "unterminated string literal".into(),
                        ));
                    }
                }
            }
            tokens.push(Token::Literal(Value::String(s)));
            continue;
        }

        if c.is_ascii_digit() {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Literal(parse_number(&num)?));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&w) = chars.peek() {
                if w.is_ascii_alphanumeric() || w == '_' {
                    word.push(w);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(match word.as_str() {
                "true" => Token::Literal(Value::Bool(true)),
                "false" => Token::Literal(Value::Bool(false)),
                "null" => Token::Literal(Value::Null),
                "in" => Token::In,
                _ => Token::Ident(word),
            });
            continue;
        }

        chars.next();
        let next = chars.peek().copied();
        let token = match (c, next) {
            ('=', Some('=')) => Token::Compare(CompareOp::Eq),
            ('!', Some('=')) => Token::Compare(CompareOp::Ne),
            ('>', Some('=')) => Token::Compare(CompareOp::Ge),
            ('<', Some('=')) => Token::Compare(CompareOp::Le),
            ('&', Some('&')) => Token::And,
            ('|', Some('|')) => Token::Or,
            ('!', _) => Token::Not,
            ('>', _) => Token::Compare(CompareOp::Gt),
            ('<', _) => Token::Compare(CompareOp::Lt),
            ('.', _) => Token::Dot,
            ('-', _) => Token::Minus,
            ('(', _) => Token::LParen,
            (')', _) => Token::RParen,
            _ => {
                return Err(AclError::InvalidCondition(format!(
                    "unexpected character `{c}`"
                )));
            }
        };
        if matches!(
            token,
            Token::Compare(CompareOp::Eq | CompareOp::Ne | CompareOp::Ge | CompareOp::Le)
                | Token::And
                | Token::Or
        ) {
            chars.next();
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn parse_number(raw: &str) -> Result<Value, AclError> {
    if raw.contains('.') {
        let f: f64 = raw
            .parse()
            .map_err(|_| AclError::InvalidCondition(format!("invalid float `{raw}`")))?;
        Ok(json!(f))
    } else {
        let n: i64 = raw
            .parse()
            .map_err(|_| AclError::InvalidCondition(format!("invalid integer `{raw}`")))?;
        Ok(json!(n))
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────

type Tokens = std::iter::Peekable<std::vec::IntoIter<Token>>;

fn invalid(message: impl Into<String>) -> AclError {
    AclError::InvalidCondition(message.into())
}

/// Binding power of the logical operators; `&&` binds tighter than `||`.
fn logical_op(token: Option<&Token>) -> Option<(LogicalOp, u8)> {
    match token {
        Some(Token::Or) => Some((LogicalOp::Or, 1)),
        Some(Token::And) => Some((LogicalOp::And, 2)),
        _ => None,
    }
}

/// Precedence climbing over `||` and `&&`; operands are comparisons.
fn parse_logical(tokens: &mut Tokens, min_power: u8) -> Result<Expr, AclError> {
    let mut left = parse_comparison(tokens)?;
    while let Some((op, power)) = logical_op(tokens.peek()) {
        if power < min_power {
            break;
        }
        tokens.next();
        let right = parse_logical(tokens, power + 1)?;
        left = Expr::Logical {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_comparison(tokens: &mut Tokens) -> Result<Expr, AclError> {
    let left = parse_unary(tokens)?;
    let expr = match tokens.peek() {
        Some(Token::Compare(op)) => {
            let op = *op;
            tokens.next();
            Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(parse_unary(tokens)?),
            }
        }
        Some(Token::In) => {
            tokens.next();
            Expr::In {
                element: Box::new(left),
                collection: Box::new(parse_unary(tokens)?),
            }
        }
        _ => left,
    };
    Ok(expr)
}

fn parse_unary(tokens: &mut Tokens) -> Result<Expr, AclError> {
    if tokens.next_if_eq(&Token::Not).is_some() {
        return Ok(Expr::Not(Box::new(parse_unary(tokens)?)));
    }
    if tokens.next_if_eq(&Token::Minus).is_some() {
        return match tokens.next() {
            Some(Token::Literal(Value::Number(n))) => Ok(Expr::Literal(negate(&n)?)),
            _ => Err(invalid("`-` must be followed by a number literal")),
        };
    }
    match tokens.next() {
        Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
        Some(Token::Ident(root)) => parse_path(tokens, root),
        Some(Token::LParen) => {
            let inner = parse_logical(tokens, 0)?;
            match tokens.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(invalid("expected closing parenthesis `)`")),
            }
        }
        Some(token) => Err(invalid(format!("unexpected token {token:?}"))),
        None => Err(invalid("unexpected end of expression")),
    }
}

fn negate(n: &serde_json::Number) -> Result<Value, AclError> {
    if let Some(i) = n.as_i64() {
        return Ok(json!(-i));
    }
    match n.as_f64() {
        Some(f) => Ok(json!(-f)),
        None => Err(invalid(format!("cannot negate `{n}`"))),
    }
}

fn parse_path(tokens: &mut Tokens, root: String) -> Result<Expr, AclError> {
    let mut segments = vec![root];
    while tokens.next_if_eq(&Token::Dot).is_some() {
        match tokens.next() {
            Some(Token::Ident(segment)) => segments.push(segment),
            _ => return Err(invalid("a `.` must be followed by a field name")),
        }
    }
    Ok(Expr::Path(segments))
}

/// Parse a condition expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, AclError> {
    let mut tokens = tokenize(input)?.into_iter().peekable();
    if tokens.peek().is_none() {
        return Err(invalid("empty expression"));
    }
    let expr = parse_logical(&mut tokens, 0)?;
    match tokens.next() {
        None => Ok(expr),
        Some(trailing) => Err(invalid(format!("unexpected trailing token {trailing:?}"))),
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Evaluate `expr` against the request: paths resolve from `{"params": …, "auth": …}`.
pub fn evaluate_request(expr: &Expr, params: &Value, auth: &AuthContext) -> Result<bool, AclError> {
    let scope = json!({ "params": params, "auth": auth.to_value() });
    evaluate(expr, &scope)
}

/// Evaluate a parsed expression against a JSON scope.
pub fn evaluate(expr: &Expr, scope: &Value) -> Result<bool, AclError> {
    match eval_value(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(AclError::InvalidCondition(format!(
            "condition must evaluate to boolean, got: {other}"
        ))),
    }
}

fn eval_bool(expr: &Expr, scope: &Value, op: &str) -> Result<bool, AclError> {
    match eval_value(expr, scope)? {
        Value::Bool(b) => Ok(b),
        _ => Err(AclError::InvalidCondition(format!(
            "`{op}` requires boolean operands"
        ))),
    }
}

fn eval_value(expr: &Expr, scope: &Value) -> Result<Value, AclError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => {
            let mut current = scope;
            for seg in segments {
                current = current.get(seg).unwrap_or(&Value::Null);
            }
            Ok(current.clone())
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, scope, "!")?)),
        // short-circuit, so `params.x != null && params.x.y == 1` is safe
        Expr::Logical {
            op: LogicalOp::And,
            left,
            right,
        } => Ok(Value::Bool(
            eval_bool(left, scope, "&&")? && eval_bool(right, scope, "&&")?,
        )),
        Expr::Logical {
            op: LogicalOp::Or,
            left,
            right,
        } => Ok(Value::Bool(
            eval_bool(left, scope, "||")? || eval_bool(right, scope, "||")?,
        )),
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval_value(element, scope)?;
            match eval_value(collection, scope)? {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loose_eq(i, &elem)))),
                _ => Err(AclError::InvalidCondition(
                    "`in` operator requires an array on the right side".into(),
                )),
            }
        }
        Expr::Compare { op, left, right } => {
            let l = eval_value(left, scope)?;
            let r = eval_value(right, scope)?;
            let result = match op {
                CompareOp::Eq => loose_eq(&l, &r),
                CompareOp::Ne => !loose_eq(&l, &r),
                CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => {
                    let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) else {
                        return Err(AclError::InvalidCondition(
                            "comparison operator requires numeric operands".into(),
                        ));
                    };
                    match op {
                        CompareOp::Gt => lf > rf,
                        CompareOp::Lt => lf < rf,
                        CompareOp::Ge => lf >= rf,
                        _ => lf <= rf,
                    }
                }
            };
            Ok(Value::Bool(result))
        }
    }
}

/// Equality where `1 == 1.0`; other values compare structurally.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
