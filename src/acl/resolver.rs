use std::borrow::Cow;

use crate::acl::types::{AuthContext, Role, RoleTable, RuleNode, RuleSpec, RuleTree};

/// Walk `path` one dot-separated segment at a time. Only a path ending on a
/// role table resolves; missing segments and bare namespaces do not.
pub fn resolve<'a>(tree: &'a RuleTree, path: &str) -> Option<&'a RoleTable> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut node = tree.get(first)?;
    for segment in segments {
        node = match node {
            RuleNode::Namespace(subtree) => subtree.get(segment)?,
            RuleNode::Roles(_) => return None,
        };
    }
    match node {
        RuleNode::Roles(table) => Some(table),
        RuleNode::Namespace(_) => None,
    }
}

/// Look up the caller's rule. With candidate roles the first one present as a
/// key wins, whatever its rule is (`#false` and `#null` included).
pub fn resolve_role<'a>(table: &'a RoleTable, role: &Role) -> Option<&'a RuleSpec> {
    match role {
        Role::Single(name) => table.get(name),
        Role::Candidates(names) => names.iter().find_map(|name| table.get(name)),
    }
}

/// Role resolution plus the configured bypass role.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    bypass_role: Option<String>,
}

impl Resolver {
    pub fn new(bypass_role: Option<String>) -> Self {
        Self { bypass_role }
    }

    pub fn bypass_role(&self) -> Option<&str> {
        self.bypass_role.as_deref()
    }

    /// `None` means the table has no rule for this caller.
    pub fn rule_for<'a>(&self, table: &'a RoleTable, auth: &AuthContext) -> Option<Cow<'a, RuleSpec>> {
        let role = auth.role.as_ref()?;
        if let (Some(bypass), Role::Single(name)) = (&self.bypass_role, role) {
            if bypass == name {
                return Some(Cow::Owned(RuleSpec::Boolean(true)));
            }
        }
        resolve_role(table, role).map(Cow::Borrowed)
    }
}
