use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use crate::acl::{web as acl_web, Acl};
use crate::errors::GatekeeperError;
use crate::settings::Settings;

pub fn app(acl: Arc<Acl>) -> Router {
    acl_web::router(acl)
}

pub async fn serve(settings: Settings, acl: Acl) -> Result<(), GatekeeperError> {
    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|_| GatekeeperError::ListenAddr(settings.listen_addr()))?;

    let router = app(Arc::new(acl));

    tracing::info!(%addr, "ACL check API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
