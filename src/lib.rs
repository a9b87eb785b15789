//! Gatekeeper - role-based ACL evaluator
//!
//! Authorizes calls to named operations against per-namespace, per-role rules
//! and rewrites the call's parameters on the way through.

pub mod acl;
pub mod errors;
pub mod settings;
pub mod web;

use acl::loader::load_rules;
use acl::{Acl, ExecutorSelection};
use errors::GatekeeperError;
use settings::Rules;

/// Load the rule directory and build executors for every namespace.
pub fn build_acl(rules: &Rules) -> Result<Acl, GatekeeperError> {
    let tree = load_rules(&rules.dir)?;
    let mut builder = Acl::builder(tree).executors(ExecutorSelection::Nested);
    if let Some(role) = &rules.bypass_role {
        builder = builder.bypass_role(role.clone());
    }
    Ok(builder.build())
}
