use std::path::Path;

use crate::acl::condition::parse_condition;
use crate::acl::errors::AclError;
use crate::acl::handlers::CONDITION;
use crate::acl::plan;
use crate::acl::policy::{parse_kdl_document, ParsedAcl};
use crate::acl::types::RuleTree;

/// Load all `.kdl` rule files from the given directory and compile them
/// into a single immutable `RuleTree`.
pub fn load_rules(dir: &Path) -> Result<RuleTree, AclError> {
    if !dir.is_dir() {
        return Err(AclError::InvalidRule(format!(
            "rules directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut all_parsed = Vec::new();
    let mut file_count = 0;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AclError::RuleLoad {
                path: path.display().to_string(),
                source,
            })?;
        let parsed = parse_kdl_document(&contents)?;
        all_parsed.extend(parsed);
        file_count += 1;
    }

    let tree = compile_rules(all_parsed)?;

    tracing::info!(
        files = file_count,
        namespaces = tree.table_count(),
        "Loaded ACL rules"
    );

    Ok(tree)
}

/// Merge parsed role tables into one tree.
///
/// Duplicate or overlapping namespaces are rejected, and every `condition`
/// string is parsed up front so a typo fails at load time.
pub fn compile_rules(parsed: Vec<ParsedAcl>) -> Result<RuleTree, AclError> {
    let mut tree = RuleTree::new();

    for acl in parsed {
        for (_, rule) in acl.table.rules() {
            for step in plan::normalize(rule) {
                if step.handler != CONDITION {
                    continue;
                }
                match step.argument.as_value().and_then(|v| v.as_str()) {
                    Some(source) => {
                        parse_condition(source)?;
                    }
                    None => {
                        return Err(AclError::InvalidCondition(format!(
                            "condition in acl `{}` must be a single expression string",
                            acl.path
                        )));
                    }
                }
            }
        }
        tree.insert(&acl.path, acl.table)?;
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::resolver::resolve;
    use crate::acl::types::{RoleTable, RuleSpec};
    use serde_json::json;

    #[test]
    fn test_compile_nested_paths() {
        let tree = compile_rules(vec![
            ParsedAcl {
                path: "orders.fetch".into(),
                table: RoleTable::new().with_rule("viewer", true),
            },
            ParsedAcl {
                path: "orders.archive.list".into(),
                table: RoleTable::new().with_rule("viewer", false),
            },
        ])
        .unwrap();
        assert_eq!(tree.namespaces(), vec!["orders.archive.list", "orders.fetch"]);
        assert!(resolve(&tree, "orders.archive.list").is_some());
    }

    #[test]
    fn test_compile_rejects_conflicts() {
        let err = compile_rules(vec![
            ParsedAcl {
                path: "orders".into(),
                table: RoleTable::new(),
            },
            ParsedAcl {
                path: "orders.fetch".into(),
                table: RoleTable::new(),
            },
        ])
        .unwrap_err();
        assert!(matches!(err, AclError::InvalidRule(_)));
    }

    #[test]
    fn test_compile_validates_conditions() {
        let bad = ParsedAcl {
            path: "orders.fetch".into(),
            table: RoleTable::new().with_rule(
                "viewer",
                RuleSpec::chain([
                    RuleSpec::handler("limit", json!(5)),
                    RuleSpec::handler("condition", json!("params.owner ==")),
                ]),
            ),
        };
        let err = compile_rules(vec![bad]).unwrap_err();
        assert!(matches!(err, AclError::InvalidCondition(_)));

        let not_a_string = ParsedAcl {
            path: "orders.fetch".into(),
            table: RoleTable::new()
                .with_rule("viewer", RuleSpec::handler("condition", json!(["a", "b"]))),
        };
        let err = compile_rules(vec![not_a_string]).unwrap_err();
        assert!(matches!(err, AclError::InvalidCondition(_)));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(
            dir.path().join("orders.kdl"),
            r#"
acl "orders.fetch" {
    role "viewer" #true
    role "editor" {
        select "id" "name"
        limit 10
    }
}
"#,
        )
        .unwrap();

        std::fs::write(
            dir.path().join("reports.kdl"),
            r#"
acl "reports.daily" {
    role "auditor" {
        - { condition "auth.id == params.owner" }
        - { limit 5 }
    }
}
"#,
        )
        .unwrap();

        // Also write a non-KDL file that should be ignored
        std::fs::write(dir.path().join("README.md"), "not a rule file").unwrap();

        let tree = load_rules(dir.path()).unwrap();
        assert_eq!(tree.namespaces(), vec!["orders.fetch", "reports.daily"]);
        let table = resolve(&tree, "orders.fetch").unwrap();
        assert!(table.contains("viewer"));
        assert!(table.contains("editor"));
    }

    #[test]
    fn test_load_duplicate_across_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.kdl"), r#"acl "orders.fetch" { role "viewer" #true; }"#)
            .unwrap();
        std::fs::write(dir.path().join("b.kdl"), r#"acl "orders.fetch" { role "admin" #true; }"#)
            .unwrap();
        let err = load_rules(dir.path()).unwrap_err();
        assert!(matches!(err, AclError::InvalidRule(_)));
    }

    #[test]
    fn test_load_nonexistent_directory() {
        let err = load_rules(Path::new("/nonexistent/path")).unwrap_err();
        assert!(matches!(err, AclError::InvalidRule(_)));
    }
}
