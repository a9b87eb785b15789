use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::{Number, Value};

use crate::acl::errors::AclError;
use crate::acl::types::{Argument, RoleTable, RuleSpec};

/// One `acl "<path>" { … }` block.
#[derive(Debug, Clone)]
pub struct ParsedAcl {
    pub path: String,
    pub table: RoleTable,
}

/// Parse a KDL rule document into its role tables.
pub fn parse_kdl_document(source: &str) -> Result<Vec<ParsedAcl>, AclError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AclError::KdlParse(e.to_string()))?;

    let mut acls = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "acl" => {
                let path = first_string_arg(node).ok_or_else(|| {
                    AclError::InvalidRule(
                        "acl node requires a namespace argument (e.g. acl \"orders.fetch\")".into(),
                    )
                })?;
                let table = parse_role_table(&path, node)?;
                acls.push(ParsedAcl { path, table });
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(acls)
}

fn parse_role_table(path: &str, node: &KdlNode) -> Result<RoleTable, AclError> {
    let mut table = RoleTable::new();
    let Some(children) = node.children() else {
        return Ok(table);
    };

    for child in children.nodes() {
        match child.name().value() {
            "role" => {
                let name = first_string_arg(child).ok_or_else(|| {
                    AclError::InvalidRule(format!(
                        "role in acl `{path}` requires a name (e.g. role \"viewer\" #true)"
                    ))
                })?;
                let label = format!("role `{name}` in acl `{path}`");
                let values = positional_args(child);
                let rule = parse_rule(&label, &values[1..], child.children())?;
                if table.insert(name.clone(), rule).is_some() {
                    return Err(AclError::InvalidRule(format!(
                        "role `{name}` is declared more than once in acl `{path}`"
                    )));
                }
            }
            other => {
                return Err(AclError::InvalidRule(format!(
                    "unexpected child `{other}` in acl `{path}` (expected `role`)"
                )));
            }
        }
    }

    Ok(table)
}

/// A rule is either one value (`#true`, `#false`, `#null`) or a children block.
/// Children all named `-` form a chain; otherwise each child is a handler.
fn parse_rule(
    label: &str,
    values: &[&KdlValue],
    children: Option<&KdlDocument>,
) -> Result<RuleSpec, AclError> {
    let children = children.map(KdlDocument::nodes).unwrap_or_default();

    if !children.is_empty() {
        if !values.is_empty() {
            return Err(AclError::InvalidRule(format!(
                "{label} has both a value and a children block"
            )));
        }
        let links = children.iter().filter(|n| n.name().value() == "-").count();
        if links == children.len() {
            let rules = children
                .iter()
                .map(|link| parse_rule(label, &positional_args(link), link.children()))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(RuleSpec::Chain(rules));
        }
        if links > 0 {
            return Err(AclError::InvalidRule(format!(
                "{label} mixes `-` chain links with handlers"
            )));
        }
        let handlers = children
            .iter()
            .map(|handler| parse_handler(label, handler))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(RuleSpec::Handlers(handlers));
    }

    match values {
        [value] if value.is_null() => Ok(RuleSpec::Null),
        [value] => match value.as_bool() {
            Some(granted) => Ok(RuleSpec::Boolean(granted)),
            None => Err(AclError::InvalidRule(format!(
                "{label} expects #true, #false or #null, got {value}"
            ))),
        },
        [] => Err(AclError::InvalidRule(format!(
            "{label} has neither a value nor a children block"
        ))),
        _ => Err(AclError::InvalidRule(format!(
            "{label} expects a single value"
        ))),
    }
}

/// `select "id" "name"` becomes `("select", ["id", "name"])`.
fn parse_handler(label: &str, node: &KdlNode) -> Result<(String, Argument), AclError> {
    let name = node.name().value().to_string();
    if node.children().is_some() {
        return Err(AclError::InvalidRule(format!(
            "handler `{name}` of {label} cannot have children"
        )));
    }
    let mut values = positional_args(node)
        .into_iter()
        .map(to_json)
        .collect::<Result<Vec<_>, _>>()?;
    let argument = match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    };
    Ok((name, argument.into()))
}

fn positional_args(node: &KdlNode) -> Vec<&KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect()
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn to_json(value: &KdlValue) -> Result<Value, AclError> {
    if let Some(s) = value.as_string() {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(n) = value.as_integer() {
        let n = i64::try_from(n)
            .map_err(|_| AclError::InvalidRule(format!("integer {n} is out of range")))?;
        return Ok(Value::from(n));
    }
    if let Some(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| AclError::InvalidRule(format!("float {f} is not a finite number")));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    Ok(Value::Null)
}
