use miette::Diagnostic;
use thiserror::Error;

use crate::acl::errors::AclError;

#[derive(Debug, Error, Diagnostic)]
pub enum GatekeeperError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(gatekeeper::io))]
    Io(#[from] std::io::Error),

    #[error("Invalid listen address `{0}`")]
    #[diagnostic(
        code(gatekeeper::listen_addr),
        help("Set server.host and server.port to a valid socket address")
    )]
    ListenAddr(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Acl(#[from] AclError),
}
