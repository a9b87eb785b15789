use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::acl::types::Rejection;

#[derive(Debug, Error, Diagnostic)]
pub enum AclError {
    #[error("no auth object provided")]
    #[diagnostic(
        code(gatekeeper::acl::no_auth),
        help("Every guarded call needs the caller's auth context, even when the rule is `#true`")
    )]
    NoAuth,

    #[error("no ACL for {0}")]
    #[diagnostic(
        code(gatekeeper::acl::no_namespace),
        help("Declare the namespace with: acl \"<dotted.path>\" {{ role \"<name>\" ... }}")
    )]
    NoNamespace(String),

    #[error("no ACL role for {0}")]
    #[diagnostic(
        code(gatekeeper::acl::no_role),
        help("None of the caller's roles has a rule in this namespace")
    )]
    NoRole(String),

    #[error("inexistent ACL")]
    #[diagnostic(
        code(gatekeeper::acl::unknown_handler),
        help("Built-in handlers: boolean, expression, select, limit, condition")
    )]
    UnknownHandler(String),

    #[error("bad ACL: {0}")]
    #[diagnostic(code(gatekeeper::acl::bad_rule))]
    BadRule(String),

    #[error("{0}")]
    #[diagnostic(code(gatekeeper::acl::refused))]
    Refused(Rejection),

    #[error("Failed to load rule file `{path}`")]
    #[diagnostic(
        code(gatekeeper::acl::rule_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    RuleLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rule: {0}")]
    #[diagnostic(
        code(gatekeeper::acl::invalid_rule),
        help("Rule files contain `acl \"<path>\" {{ role \"<name>\" <#true|#false|#null or handler block> }}` nodes")
    )]
    InvalidRule(String),

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(gatekeeper::acl::invalid_condition),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in. Paths start at `params` or `auth` (e.g. auth.id)")
    )]
    InvalidCondition(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(gatekeeper::acl::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev for the language reference")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(gatekeeper::acl::io))]
    Io(#[from] std::io::Error),
}

impl AclError {
    /// Rejections are the only errors a caller may choose to silence.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AclError::Refused(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AclError::Refused(rejection) => rejection
                .status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::FORBIDDEN),
            AclError::NoAuth => StatusCode::UNAUTHORIZED,
            AclError::NoRole(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AclError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "ACL configuration fault");
        }
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
