use std::sync::Arc;

use serde_json::{Map, Value};

use crate::acl::errors::AclError;
use crate::acl::handlers::{HandlerSet, Outcome};
use crate::acl::plan;
use crate::acl::resolver::{self, Resolver};
use crate::acl::types::{AuthContext, ExternalContext, Options, RuleTree};

/// Resolves and runs rules. Shared read-only between concurrent evaluations;
/// every evaluation owns its own accumulator.
#[derive(Debug)]
pub struct Engine {
    tree: Arc<RuleTree>,
    handlers: HandlerSet,
    context: ExternalContext,
    resolver: Resolver,
}

impl Engine {
    pub fn new(
        tree: Arc<RuleTree>,
        handlers: HandlerSet,
        context: ExternalContext,
        resolver: Resolver,
    ) -> Self {
        Self {
            tree,
            handlers,
            context,
            resolver,
        }
    }

    pub fn tree(&self) -> &RuleTree {
        &self.tree
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Authorize one request against the rules of `namespace`.
    ///
    /// `Ok(Some(params))` is a grant carrying the params to forward,
    /// `Ok(None)` a rejection silenced by `options.reject_silently`.
    /// Dropping the returned future stops the evaluation before the next step.
    pub async fn evaluate(
        &self,
        namespace: &str,
        params: Option<Value>,
        auth: Option<&AuthContext>,
        options: &Options,
    ) -> Result<Option<Value>, AclError> {
        let params = params.unwrap_or_else(|| Value::Object(Map::new()));

        match self.run(namespace, params, auth).await {
            Ok(granted) => {
                tracing::debug!(namespace, "ACL granted request");
                Ok(Some(granted))
            }
            Err(AclError::Refused(rejection)) => {
                let rejection = match &options.on_reject {
                    Some(on_reject) => on_reject(),
                    None => rejection,
                };
                if options.reject_silently {
                    tracing::debug!(namespace, reason = %rejection, "ACL rejected request silently");
                    return Ok(None);
                }
                tracing::debug!(namespace, reason = %rejection, "ACL rejected request");
                Err(AclError::Refused(rejection))
            }
            Err(fault) => {
                tracing::warn!(namespace, error = %fault, "ACL evaluation faulted");
                Err(fault)
            }
        }
    }

    async fn run(
        &self,
        namespace: &str,
        params: Value,
        auth: Option<&AuthContext>,
    ) -> Result<Value, AclError> {
        // 1. Namespace, so unknown namespaces fault whatever the caller sends
        let table = resolver::resolve(&self.tree, namespace)
            .ok_or_else(|| AclError::NoNamespace(namespace.to_string()))?;

        // 2. Caller
        let auth = auth.ok_or(AclError::NoAuth)?;

        // 3. Rule for the caller's role
        let rule = self
            .resolver
            .rule_for(table, auth)
            .ok_or_else(|| AclError::NoRole(namespace.to_string()))?;

        // 4. Steps, strictly one after another
        let steps = plan::normalize(&rule);
        let mut accumulated = params;
        for (index, step) in steps.iter().enumerate() {
            let handler = self
                .handlers
                .get(&step.handler)
                .ok_or_else(|| AclError::UnknownHandler(step.handler.clone()))?;

            tracing::debug!(namespace, step = index, handler = %step.handler, "dispatching ACL step");

            let outcome = handler
                .handle(&step.argument, &accumulated, auth, &self.context)
                .await
                .map_err(|report| AclError::BadRule(report.to_string()))?;

            accumulated = match outcome {
                Outcome::Pass => accumulated,
                Outcome::Patch(patch) => merge(accumulated, patch),
                Outcome::Replace(value) => value,
                Outcome::Reject(rejection) => {
                    return Err(AclError::Refused(rejection.unwrap_or_default()));
                }
            };
        }

        Ok(accumulated)
    }
}

/// Shallow merge, patch keys win. A non-object accumulator is replaced by the patch.
fn merge(accumulated: Value, patch: Map<String, Value>) -> Value {
    match accumulated {
        Value::Object(mut fields) => {
            fields.extend(patch);
            Value::Object(fields)
        }
        _ => Value::Object(patch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::acl::handlers::Handler;
    use crate::acl::types::{
        Argument, Expression, Rejection, RoleTable, RuleSpec, Verdict,
    };

    /// Passes everything through and counts its calls.
    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for Counter {
        async fn handle(
            &self,
            _argument: &Argument,
            _params: &Value,
            _auth: &AuthContext,
            _context: &ExternalContext,
        ) -> miette::Result<Outcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Pass)
        }
    }

    fn make_engine(rule: RuleSpec) -> (Engine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerSet::builtin();
        handlers.register("count", Counter(calls.clone()));
        let tree = RuleTree::new()
            .with("orders.fetch", RoleTable::new().with_rule("viewer", rule))
            .unwrap();
        let engine = Engine::new(
            Arc::new(tree),
            handlers,
            ExternalContext::empty(),
            Resolver::new(Some("root".into())),
        );
        (engine, calls)
    }

    async fn eval(engine: &Engine, params: Value) -> Result<Option<Value>, AclError> {
        engine
            .evaluate(
                "orders.fetch",
                Some(params),
                Some(&AuthContext::new("viewer")),
                &Options::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_chain_patches_accumulate() {
        let (engine, _) = make_engine(RuleSpec::chain([
            Expression::sync(|_, _, _| json!({ "id": "X" })).into(),
            RuleSpec::handler("limit", json!(5)),
            RuleSpec::handler("select", json!(["id"])),
        ]));
        let granted = eval(&engine, json!({ "id": "A", "extra": 1 })).await.unwrap().unwrap();
        assert_eq!(
            granted,
            json!({ "id": "X", "extra": 1, "limit": 5, "select": ["id"] })
        );
    }

    #[tokio::test]
    async fn test_later_steps_see_earlier_output() {
        let (engine, _) = make_engine(RuleSpec::chain([
            Expression::sync(|_, _, _| json!({ "owner": "u-1" })).into(),
            RuleSpec::handler("condition", json!("params.owner == \"u-1\"")),
            Expression::sync(|params, _, _| json!({ "seen": params["owner"].clone() })).into(),
        ]));
        let granted = eval(&engine, json!({})).await.unwrap().unwrap();
        assert_eq!(granted, json!({ "owner": "u-1", "seen": "u-1" }));
    }

    #[tokio::test]
    async fn test_rejection_short_circuits() {
        let (engine, calls) = make_engine(RuleSpec::chain([
            RuleSpec::handler("count", Value::Null),
            RuleSpec::Boolean(false),
            RuleSpec::handler("count", Value::Null),
        ]));
        let err = eval(&engine, json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "ACL refused request");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fault_short_circuits() {
        let (engine, calls) = make_engine(RuleSpec::handlers([
            ("__expression", json!(true)),
            ("count", Value::Null),
        ]));
        let err = eval(&engine, json!({})).await.unwrap_err();
        assert!(matches!(err, AclError::UnknownHandler(ref name) if name == "__expression"));
        assert_eq!(err.to_string(), "inexistent ACL");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replace_then_patch() {
        let (engine, _) = make_engine(RuleSpec::chain([
            Expression::sync(|_, _, _| json!({ "dropped": true })).into(),
            Expression::sync(|_, _, _| json!("scalar")).into(),
            RuleSpec::handler("limit", json!(3)),
        ]));
        // a replacement discards earlier patches; a patch over a scalar starts a fresh object
        let granted = eval(&engine, json!({ "id": "A" })).await.unwrap().unwrap();
        assert_eq!(granted, json!({ "limit": 3 }));
    }

    #[tokio::test]
    async fn test_replace_with_null_is_a_grant() {
        let (engine, _) = make_engine(Expression::sync(|_, _, _| Value::Null).into());
        assert_eq!(eval(&engine, json!({ "id": "A" })).await.unwrap(), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_missing_params_become_empty_object() {
        let (engine, _) = make_engine(RuleSpec::Boolean(true));
        let granted = engine
            .evaluate(
                "orders.fetch",
                None,
                Some(&AuthContext::new("viewer")),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(granted, Some(json!({})));
    }

    #[tokio::test]
    async fn test_fault_order() {
        let (engine, _) = make_engine(RuleSpec::Boolean(true));

        let err = engine
            .evaluate("orders.missing", None, None, &Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no ACL for orders.missing");

        let err = engine
            .evaluate("orders.fetch", None, None, &Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no auth object provided");

        let err = engine
            .evaluate(
                "orders.fetch",
                None,
                Some(&AuthContext::default()),
                &Options::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no ACL role for orders.fetch");
    }

    #[tokio::test]
    async fn test_bad_rule_wraps_handler_error() {
        let (engine, _) = make_engine(
            Expression::new(|_, _, _| Err(miette::miette!("ops..."))).into(),
        );
        let err = eval(&engine, json!({})).await.unwrap_err();
        assert!(matches!(err, AclError::BadRule(_)));
        assert_eq!(err.to_string(), "bad ACL: ops...");
    }

    #[tokio::test]
    async fn test_options() {
        let (engine, _) = make_engine(RuleSpec::Null);
        let auth = AuthContext::new("viewer");

        let silent = engine
            .evaluate("orders.fetch", None, Some(&auth), &Options::silent())
            .await
            .unwrap();
        assert_eq!(silent, None);

        let custom = engine
            .evaluate(
                "orders.fetch",
                None,
                Some(&auth),
                &Options::on_reject(|| Rejection::new("customError")),
            )
            .await
            .unwrap_err();
        assert_eq!(custom.to_string(), "customError");
    }

    #[tokio::test]
    async fn test_on_reject_overrides_explicit_message() {
        let (engine, _) = make_engine(
            Expression::sync(|_, _, _| Rejection::new("Unknown error")).into(),
        );
        let err = eval(&engine, json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown error");

        let err = engine
            .evaluate(
                "orders.fetch",
                None,
                Some(&AuthContext::new("viewer")),
                &Options::on_reject(|| Rejection::new("customError").with_status(404)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "customError");
        assert_eq!(err.status_code().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_faults_are_never_silenced() {
        let (engine, _) = make_engine(RuleSpec::handler("inexistent", Value::Null));
        let err = engine
            .evaluate(
                "orders.fetch",
                None,
                Some(&AuthContext::new("viewer")),
                &Options::silent(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "inexistent ACL");

        let err = engine
            .evaluate("orders.fetch", None, None, &Options::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::NoAuth));
    }

    #[tokio::test]
    async fn test_bypass_role_skips_table() {
        let (engine, calls) = make_engine(RuleSpec::handler("count", Value::Null));
        let granted = engine
            .evaluate(
                "orders.fetch",
                Some(json!({ "id": "A" })),
                Some(&AuthContext::new("root")),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(granted, Some(json!({ "id": "A" })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_evaluation_runs_no_further_steps() {
        let (engine, calls) = make_engine(RuleSpec::chain([
            Expression::future(|_, _, _| futures::future::pending::<Verdict>()).into(),
            RuleSpec::handler("count", Value::Null),
        ]));
        let abandoned = tokio::time::timeout(Duration::from_millis(20), eval(&engine, json!({}))).await;
        assert!(abandoned.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_steps_run_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slow = {
            let order = order.clone();
            Expression::future(move |_, _, _| {
                let order = order.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().unwrap().push("slow");
                    Verdict::Allow
                }
            })
        };
        let fast = {
            let order = order.clone();
            Expression::sync(move |_, _, _| {
                order.lock().unwrap().push("fast");
                true
            })
        };
        let (engine, _) = make_engine(RuleSpec::chain([slow.into(), fast.into()]));
        eval(&engine, json!({})).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
    }

    #[test]
    fn test_merge() {
        let mut patch = Map::new();
        patch.insert("id".into(), json!("X"));
        assert_eq!(
            merge(json!({ "id": "A", "name": "n" }), patch.clone()),
            json!({ "id": "X", "name": "n" })
        );
        assert_eq!(merge(Value::Null, patch), json!({ "id": "X" }));
    }
}
