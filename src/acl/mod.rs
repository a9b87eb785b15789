pub mod condition;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod handlers;
pub mod loader;
pub mod plan;
pub mod policy;
pub mod resolver;
pub mod types;
pub mod web;

use std::collections::BTreeMap;
use std::sync::Arc;

use engine::Engine;
use executor::GuardedOperation;
use handlers::{Handler, HandlerSet};
use resolver::Resolver;
use types::{ExternalContext, RuleTree};

/// Which namespaces get a pre-built executor.
#[derive(Debug, Clone, Default)]
pub enum ExecutorSelection {
    /// Every top-level key of the tree that holds a role table.
    #[default]
    All,
    /// Every path of the tree that holds a role table, at any depth.
    Nested,
    None,
    /// Listed dotted paths; paths without a role table are skipped.
    Paths(Vec<String>),
}

/// Compiled access rules plus their executors.
/// Immutable after construction; reloading rules means building a new `Acl`.
#[derive(Debug)]
pub struct Acl {
    engine: Arc<Engine>,
    executors: BTreeMap<String, GuardedOperation>,
}

impl Acl {
    pub fn builder(tree: RuleTree) -> AclBuilder {
        AclBuilder::new(tree)
    }

    /// Built-in handlers, no context, no bypass role, executors for top-level tables.
    pub fn new(tree: RuleTree) -> Self {
        AclBuilder::new(tree).build()
    }

    /// Pre-built executor for a dotted path.
    pub fn executor(&self, path: &str) -> Option<&GuardedOperation> {
        self.executors.get(path)
    }

    pub fn executors(&self) -> impl Iterator<Item = (&str, &GuardedOperation)> {
        self.executors
            .iter()
            .map(|(path, operation)| (path.as_str(), operation))
    }

    /// Executor for any path, pre-built or not.
    pub fn guard(&self, path: &str) -> GuardedOperation {
        match self.executors.get(path) {
            Some(operation) => operation.clone(),
            None => GuardedOperation::new(self.engine.clone(), path),
        }
    }

    pub fn tree(&self) -> &RuleTree {
        self.engine.tree()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.engine.handlers().names()
    }
}

pub struct AclBuilder {
    tree: RuleTree,
    context: ExternalContext,
    selection: ExecutorSelection,
    bypass_role: Option<String>,
    handlers: HandlerSet,
}

impl AclBuilder {
    fn new(tree: RuleTree) -> Self {
        Self {
            tree,
            context: ExternalContext::empty(),
            selection: ExecutorSelection::All,
            bypass_role: None,
            handlers: HandlerSet::builtin(),
        }
    }

    /// Host value handed to every handler and expression.
    pub fn context(mut self, context: ExternalContext) -> Self {
        self.context = context;
        self
    }

    pub fn executors(mut self, selection: ExecutorSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Callers with exactly this role are granted everywhere with unchanged params.
    pub fn bypass_role(mut self, role: impl Into<String>) -> Self {
        self.bypass_role = Some(role.into());
        self
    }

    /// Add or replace a named handler.
    pub fn register(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn build(self) -> Acl {
        let paths = match self.selection {
            ExecutorSelection::All => self.tree.top_level_tables(),
            ExecutorSelection::Nested => self.tree.namespaces(),
            ExecutorSelection::None => Vec::new(),
            ExecutorSelection::Paths(paths) => paths
                .into_iter()
                .filter(|path| resolver::resolve(&self.tree, path).is_some())
                .collect(),
        };

        let engine = Arc::new(Engine::new(
            Arc::new(self.tree),
            self.handlers,
            self.context,
            Resolver::new(self.bypass_role),
        ));

        let executors: BTreeMap<String, GuardedOperation> = paths
            .into_iter()
            .map(|path| {
                let operation = GuardedOperation::new(engine.clone(), path.clone());
                (path, operation)
            })
            .collect();

        tracing::debug!(executors = executors.len(), "built ACL executors");

        Acl { engine, executors }
    }
}
