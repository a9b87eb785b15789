use gatekeeper::acl::loader::load_rules;
use gatekeeper::acl::types::RuleTree;
use gatekeeper::settings::Rules;
use tempfile::TempDir;

/// Rule directory with automatic cleanup
pub struct TestRules {
    dir: TempDir,
}

impl TestRules {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Write one `.kdl` file into the directory
    pub fn with_file(self, name: &str, contents: &str) -> Self {
        std::fs::write(self.dir.path().join(name), contents).expect("Failed to write rule file");
        self
    }

    pub fn settings(&self, bypass_role: Option<&str>) -> Rules {
        Rules {
            dir: self.dir.path().to_path_buf(),
            bypass_role: bypass_role.map(str::to_string),
        }
    }

    pub fn load(&self) -> RuleTree {
        load_rules(self.dir.path()).expect("Failed to load rules")
    }
}

/// Rules shared by the service tests
pub const ORDERS_KDL: &str = r#"
acl "orders.fetch" {
    role "viewer" #true
    role "blocked" #false
    role "banned" #null
    role "editor" {
        select "id" "name"
    }
}

acl "orders.list" {
    role "viewer" {
        select "id" "name"
        limit 20
    }
    role "owner" {
        - { condition "auth.id == params.owner" }
        - { limit 5 }
    }
}
"#;
