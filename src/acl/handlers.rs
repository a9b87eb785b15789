use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use miette::bail;
use serde_json::{json, Map, Value};

use crate::acl::condition;
use crate::acl::types::{Argument, AuthContext, Evaluation, ExternalContext, Rejection, Verdict};

pub const BOOLEAN: &str = "boolean";
pub const EXPRESSION: &str = "expression";
pub const SELECT: &str = "select";
pub const LIMIT: &str = "limit";
pub const CONDITION: &str = "condition";

/// Result of one handler dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Grant, params unchanged.
    Pass,
    /// Grant, shallow-merge into the params (patch keys win).
    Patch(Map<String, Value>),
    /// Grant, the value becomes the new params.
    Replace(Value),
    /// Refuse; `None` uses the generic message.
    Reject(Option<Rejection>),
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Allow => Outcome::Pass,
            Verdict::Deny => Outcome::Reject(None),
            Verdict::Refuse(rejection) => Outcome::Reject(Some(rejection)),
            Verdict::Patch(patch) => Outcome::Patch(patch),
            Verdict::Replace(value) => Outcome::Replace(value),
        }
    }
}

/// A named rule primitive.
///
/// `Err` is reserved for broken rules (bad argument, malformed condition) and
/// faults the whole evaluation as `bad ACL: …`; refusing a request is
/// [`Outcome::Reject`]. Implementations must not keep `params` past the call.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        argument: &Argument,
        params: &Value,
        auth: &AuthContext,
        context: &ExternalContext,
    ) -> miette::Result<Outcome>;
}

/// Registry of handlers by rule name.
#[derive(Clone)]
pub struct HandlerSet {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerSet {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut set = Self::empty();
        set.register(BOOLEAN, BooleanHandler)
            .register(EXPRESSION, ExpressionHandler)
            .register(SELECT, SelectHandler)
            .register(LIMIT, LimitHandler)
            .register(CONDITION, ConditionHandler);
        set
    }

    /// Add a handler, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("handlers", &self.names())
            .finish()
    }
}

fn plain_value<'a>(argument: &'a Argument, handler: &str) -> miette::Result<&'a Value> {
    match argument.as_value() {
        Some(value) => Ok(value),
        None => bail!("{handler} rule expects a value, not an expression"),
    }
}

// ─── boolean ────────────────────────────────────────────────────────────

pub struct BooleanHandler;

#[async_trait]
impl Handler for BooleanHandler {
    async fn handle(
        &self,
        argument: &Argument,
        _params: &Value,
        _auth: &AuthContext,
        _context: &ExternalContext,
    ) -> miette::Result<Outcome> {
        match plain_value(argument, BOOLEAN)? {
            Value::Bool(true) => Ok(Outcome::Pass),
            Value::Bool(false) | Value::Null => Ok(Outcome::Reject(None)),
            other => bail!("boolean rule expects true, false or null, got {other}"),
        }
    }
}

// ─── expression ─────────────────────────────────────────────────────────

pub struct ExpressionHandler;

#[async_trait]
impl Handler for ExpressionHandler {
    async fn handle(
        &self,
        argument: &Argument,
        params: &Value,
        auth: &AuthContext,
        context: &ExternalContext,
    ) -> miette::Result<Outcome> {
        let Argument::Expression(expression) = argument else {
            bail!("expression is not a function");
        };
        let verdict = match expression.call(params, auth, context)? {
            Evaluation::Ready(verdict) => verdict,
            Evaluation::Pending(pending) => pending.await,
        };
        Ok(verdict.into())
    }
}

// ─── select ─────────────────────────────────────────────────────────────

pub struct SelectHandler;

/// A field name or a list of field names.
fn field_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(field) => Some(vec![field.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// Fields the caller asked for. Non-string items are skipped and any other
/// scalar requests nothing.
fn requested_fields(value: &Value) -> Vec<String> {
    match value {
        Value::String(field) => vec![field.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Handler for SelectHandler {
    async fn handle(
        &self,
        argument: &Argument,
        params: &Value,
        _auth: &AuthContext,
        _context: &ExternalContext,
    ) -> miette::Result<Outcome> {
        let Some(allowed) = field_list(plain_value(argument, SELECT)?) else {
            bail!("select rule expects a field name or a list of field names");
        };

        let requested = match params.get(SELECT) {
            Some(Value::Null) | None => None,
            Some(value) => Some(requested_fields(value)),
        };

        let selected: Vec<String> = match &requested {
            Some(requested) => allowed
                .iter()
                .filter(|field| requested.contains(*field))
                .cloned()
                .collect(),
            None => allowed.clone(),
        };

        if selected.is_empty() {
            return Ok(Outcome::Reject(Some(Rejection::new(format!(
                "no select field is allowed, you can select {}",
                allowed.join(",")
            )))));
        }

        let mut patch = Map::new();
        patch.insert(SELECT.to_string(), json!(selected));
        Ok(Outcome::Patch(patch))
    }
}

// ─── limit ──────────────────────────────────────────────────────────────

pub struct LimitHandler;

#[async_trait]
impl Handler for LimitHandler {
    async fn handle(
        &self,
        argument: &Argument,
        params: &Value,
        _auth: &AuthContext,
        _context: &ExternalContext,
    ) -> miette::Result<Outcome> {
        let max = plain_value(argument, LIMIT)?;
        let Some(max_value) = max.as_f64() else {
            bail!("limit rule expects a number, got {max}");
        };

        let limit = match params.get(LIMIT) {
            Some(requested) if requested.as_f64().is_some_and(|n| n > 0.0 && n <= max_value) => {
                requested.clone()
            }
            _ => max.clone(),
        };

        let mut patch = Map::new();
        patch.insert(LIMIT.to_string(), limit);
        Ok(Outcome::Patch(patch))
    }
}

// ─── condition ──────────────────────────────────────────────────────────

pub struct ConditionHandler;

#[async_trait]
impl Handler for ConditionHandler {
    async fn handle(
        &self,
        argument: &Argument,
        params: &Value,
        auth: &AuthContext,
        _context: &ExternalContext,
    ) -> miette::Result<Outcome> {
        let Some(source) = plain_value(argument, CONDITION)?.as_str() else {
            bail!("condition rule expects an expression string");
        };
        let expr = condition::parse_condition(source)?;
        if condition::evaluate_request(&expr, params, auth)? {
            Ok(Outcome::Pass)
        } else {
            Ok(Outcome::Reject(None))
        }
    }
}
