use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::acl::errors::AclError;

pub const DEFAULT_REJECTION: &str = "ACL refused request";

// ---------- Rule tree ----------

/// Nested namespace table addressed by dotted paths such as `orders.fetch`.
#[derive(Debug, Clone, Default)]
pub struct RuleTree {
    nodes: HashMap<String, RuleNode>,
}

#[derive(Debug, Clone)]
pub enum RuleNode {
    Namespace(RuleTree),
    Roles(RoleTable),
}

impl RuleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RuleTree::insert`] for trees assembled in code.
    pub fn with(mut self, path: &str, table: RoleTable) -> Result<Self, AclError> {
        self.insert(path, table)?;
        Ok(self)
    }

    /// Place `table` at `path`, creating intermediate namespaces.
    /// A path that already holds a table, or that would have to pass through one, is rejected.
    pub fn insert(&mut self, path: &str, table: RoleTable) -> Result<(), AclError> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AclError::InvalidRule(format!(
                "invalid namespace path `{path}` (expected dot-separated segments)"
            )));
        }
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| AclError::InvalidRule("empty namespace path".into()))?;

        let mut current = self;
        for segment in parents {
            let node = current
                .nodes
                .entry((*segment).to_string())
                .or_insert_with(|| RuleNode::Namespace(RuleTree::new()));
            current = match node {
                RuleNode::Namespace(tree) => tree,
                RuleNode::Roles(_) => {
                    return Err(AclError::InvalidRule(format!(
                        "namespace `{path}` passes through the role table at `{segment}`"
                    )));
                }
            };
        }

        if current.nodes.contains_key(*leaf) {
            return Err(AclError::InvalidRule(format!(
                "namespace `{path}` is declared more than once"
            )));
        }
        current
            .nodes
            .insert((*leaf).to_string(), RuleNode::Roles(table));
        Ok(())
    }

    pub fn get(&self, segment: &str) -> Option<&RuleNode> {
        self.nodes.get(segment)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top-level keys that hold a role table, sorted. Namespaces are skipped.
    pub fn top_level_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node, RuleNode::Roles(_)))
            .map(|(key, _)| key.clone())
            .collect();
        out.sort();
        out
    }

    /// Dotted paths of every role table in the tree, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_namespaces("", &mut out);
        out.sort();
        out
    }

    fn collect_namespaces(&self, prefix: &str, out: &mut Vec<String>) {
        for (segment, node) in &self.nodes {
            let path = if prefix.is_empty() {
                segment.clone()
            } else {
                format!("{prefix}.{segment}")
            };
            match node {
                RuleNode::Namespace(tree) => tree.collect_namespaces(&path, out),
                RuleNode::Roles(_) => out.push(path),
            }
        }
    }

    pub fn table_count(&self) -> usize {
        self.nodes
            .values()
            .map(|node| match node {
                RuleNode::Namespace(tree) => tree.table_count(),
                RuleNode::Roles(_) => 1,
            })
            .sum()
    }
}

/// Role identifier -> rule. A missing key means "no rule", which is not the same as [`RuleSpec::Null`].
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    rules: HashMap<String, RuleSpec>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, role: impl Into<String>, rule: impl Into<RuleSpec>) -> Self {
        self.rules.insert(role.into(), rule.into());
        self
    }

    pub fn insert(&mut self, role: impl Into<String>, rule: RuleSpec) -> Option<RuleSpec> {
        self.rules.insert(role.into(), rule)
    }

    pub fn get(&self, role: &str) -> Option<&RuleSpec> {
        self.rules.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.rules.contains_key(role)
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &RuleSpec)> {
        self.rules.iter().map(|(role, rule)| (role.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ---------- Rules ----------

#[derive(Debug, Clone)]
pub enum RuleSpec {
    /// Unconditional grant (`true`) or deny (`false`).
    Boolean(bool),
    /// Explicit "always reject".
    Null,
    Expression(Expression),
    /// One or more named handlers, run in declaration order.
    Handlers(Vec<(String, Argument)>),
    /// Each element runs on the output of the previous one.
    Chain(Vec<RuleSpec>),
}

impl RuleSpec {
    pub fn handler(name: impl Into<String>, argument: impl Into<Argument>) -> Self {
        RuleSpec::Handlers(vec![(name.into(), argument.into())])
    }

    pub fn handlers<N, A, I>(handlers: I) -> Self
    where
        N: Into<String>,
        A: Into<Argument>,
        I: IntoIterator<Item = (N, A)>,
    {
        RuleSpec::Handlers(
            handlers
                .into_iter()
                .map(|(name, argument)| (name.into(), argument.into()))
                .collect(),
        )
    }

    pub fn chain(rules: impl IntoIterator<Item = RuleSpec>) -> Self {
        RuleSpec::Chain(rules.into_iter().collect())
    }
}

impl From<bool> for RuleSpec {
    fn from(value: bool) -> Self {
        RuleSpec::Boolean(value)
    }
}

impl From<Option<bool>> for RuleSpec {
    fn from(value: Option<bool>) -> Self {
        value.map_or(RuleSpec::Null, RuleSpec::Boolean)
    }
}

impl From<Expression> for RuleSpec {
    fn from(value: Expression) -> Self {
        RuleSpec::Expression(value)
    }
}

/// Argument handed to a handler: plain data from a rule, or host code.
#[derive(Debug, Clone)]
pub enum Argument {
    Value(Value),
    Expression(Expression),
}

impl Argument {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Argument::Value(value) => Some(value),
            Argument::Expression(_) => None,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

impl From<Expression> for Argument {
    fn from(value: Expression) -> Self {
        Argument::Expression(value)
    }
}

// ---------- Expressions ----------

pub type VerdictFuture = BoxFuture<'static, Verdict>;

/// What an expression hands back: a verdict now, or one still being computed.
pub enum Evaluation {
    Ready(Verdict),
    Pending(VerdictFuture),
}

impl fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Ready(verdict) => f.debug_tuple("Ready").field(verdict).finish(),
            Evaluation::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Grant, params unchanged.
    Allow,
    /// Reject with the generic message.
    Deny,
    /// Reject with a message of the expression's own.
    Refuse(Rejection),
    /// Grant, shallow-merging these fields over the params.
    Patch(Map<String, Value>),
    /// Grant, handing this value on in place of the params. `Value::Null` is a valid grant.
    Replace(Value),
}

impl From<bool> for Verdict {
    fn from(value: bool) -> Self {
        if value {
            Verdict::Allow
        } else {
            Verdict::Deny
        }
    }
}

impl From<Value> for Verdict {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(granted) => granted.into(),
            Value::Object(patch) => Verdict::Patch(patch),
            other => Verdict::Replace(other),
        }
    }
}

impl From<Map<String, Value>> for Verdict {
    fn from(value: Map<String, Value>) -> Self {
        Verdict::Patch(value)
    }
}

impl From<Rejection> for Verdict {
    fn from(value: Rejection) -> Self {
        Verdict::Refuse(value)
    }
}

impl<T, E> From<Result<T, E>> for Verdict
where
    T: Into<Verdict>,
    E: fmt::Display,
{
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(verdict) => verdict.into(),
            Err(err) => Verdict::Refuse(Rejection::new(err.to_string())),
        }
    }
}

type ExpressionFn =
    dyn Fn(&Value, &AuthContext, &ExternalContext) -> miette::Result<Evaluation> + Send + Sync;

/// Host-supplied predicate/transform run by the `expression` handler.
///
/// Returning `Err` means the rule itself is broken and faults the evaluation;
/// refusing a request is done with [`Verdict::Deny`] or [`Verdict::Refuse`].
#[derive(Clone)]
pub struct Expression(Arc<ExpressionFn>);

impl Expression {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &AuthContext, &ExternalContext) -> miette::Result<Evaluation>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn sync<F, V>(f: F) -> Self
    where
        F: Fn(&Value, &AuthContext, &ExternalContext) -> V + Send + Sync + 'static,
        V: Into<Verdict>,
    {
        Self::new(move |params, auth, context| Ok(Evaluation::Ready(f(params, auth, context).into())))
    }

    /// Expression whose verdict is computed asynchronously (e.g. backed by I/O).
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, AuthContext, ExternalContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        Self::new(move |params, auth, context| {
            Ok(Evaluation::Pending(Box::pin(f(
                params.clone(),
                auth.clone(),
                context.clone(),
            ))))
        })
    }

    pub fn call(
        &self,
        params: &Value,
        auth: &AuthContext,
        context: &ExternalContext,
    ) -> miette::Result<Evaluation> {
        (self.0)(params, auth, context)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Expression(..)")
    }
}

// ---------- Caller ----------

/// A single role, or candidates tried in order (first one present in the table wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Role {
    Single(String),
    Candidates(Vec<String>),
}

impl Role {
    pub fn candidates<S: Into<String>>(roles: impl IntoIterator<Item = S>) -> Self {
        Role::Candidates(roles.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::Single(value.to_string())
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::Single(value)
    }
}

impl From<Vec<String>> for Role {
    fn from(value: Vec<String>) -> Self {
        Role::Candidates(value)
    }
}

/// Already-verified identity of the caller. Read-only to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl AuthContext {
    pub fn new(role: impl Into<Role>) -> Self {
        Self {
            role: Some(role.into()),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Opaque handle passed through to expressions (typically the data layer).
#[derive(Clone, Default)]
pub struct ExternalContext(Option<Arc<dyn Any + Send + Sync>>);

impl ExternalContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for ExternalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("ExternalContext(..)"),
            None => f.write_str("ExternalContext(empty)"),
        }
    }
}

// ---------- Invocation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub message: String,
    /// Optional status-like code for the transport layer.
    pub status: Option<u16>,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl Default for Rejection {
    fn default() -> Self {
        Self::new(DEFAULT_REJECTION)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type RejectFactory = Arc<dyn Fn() -> Rejection + Send + Sync>;

/// Per-call options of a guarded operation.
#[derive(Clone, Default)]
pub struct Options {
    /// Turn a rejection into an empty completion. Faults are never silenced.
    pub reject_silently: bool,
    /// Builds the rejection surfaced to the caller, overriding any other message.
    pub on_reject: Option<RejectFactory>,
}

impl Options {
    pub fn silent() -> Self {
        Self {
            reject_silently: true,
            on_reject: None,
        }
    }

    pub fn on_reject<F>(f: F) -> Self
    where
        F: Fn() -> Rejection + Send + Sync + 'static,
    {
        Self {
            reject_silently: false,
            on_reject: Some(Arc::new(f)),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("reject_silently", &self.reject_silently)
            .field("on_reject", &self.on_reject.as_ref().map(|_| ".."))
            .finish()
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    /// e.g. "orders.fetch"
    pub namespace: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub auth: Option<AuthContext>,
    #[serde(default)]
    pub reject_silently: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    /// Parameters to forward downstream; absent when the request was silently rejected.
    pub params: Option<Value>,
}
