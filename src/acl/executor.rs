use std::sync::Arc;

use serde_json::Value;

use crate::acl::engine::Engine;
use crate::acl::errors::AclError;
use crate::acl::types::{AuthContext, Options};

/// An operation protected by the rules of one namespace.
///
/// Built for any path; a path without rules faults on every call.
#[derive(Debug, Clone)]
pub struct GuardedOperation {
    engine: Arc<Engine>,
    namespace: String,
}

impl GuardedOperation {
    pub(crate) fn new(engine: Arc<Engine>, namespace: impl Into<String>) -> Self {
        Self {
            engine,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run the namespace's rules for this caller.
    ///
    /// `Ok(Some(params))` carries the authorized params, `Ok(None)` is a
    /// rejection silenced by `options.reject_silently`.
    pub async fn call(
        &self,
        params: Option<Value>,
        auth: Option<&AuthContext>,
        options: &Options,
    ) -> Result<Option<Value>, AclError> {
        self.engine
            .evaluate(&self.namespace, params, auth, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::acl::handlers::HandlerSet;
    use crate::acl::resolver::Resolver;
    use crate::acl::types::{ExternalContext, RoleTable, RuleTree};

    fn make_engine() -> Arc<Engine> {
        let tree = RuleTree::new()
            .with("orders.fetch", RoleTable::new().with_rule("viewer", true))
            .unwrap();
        Arc::new(Engine::new(
            Arc::new(tree),
            HandlerSet::builtin(),
            ExternalContext::empty(),
            Resolver::default(),
        ))
    }

    #[tokio::test]
    async fn test_call_grants() {
        let operation = GuardedOperation::new(make_engine(), "orders.fetch");
        let granted = operation
            .call(
                Some(json!({ "id": "A" })),
                Some(&AuthContext::new("viewer")),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(granted, Some(json!({ "id": "A" })));
        assert_eq!(operation.namespace(), "orders.fetch");
    }

    #[tokio::test]
    async fn test_unknown_namespace_builds_but_faults() {
        let operation = GuardedOperation::new(make_engine(), "orders.delete");
        let err = operation
            .call(None, Some(&AuthContext::new("viewer")), &Options::silent())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no ACL for orders.delete");
    }
}
