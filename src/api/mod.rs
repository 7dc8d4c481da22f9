//! HTTP control API
//!
//! Status, health, stream control and command endpoints over the running
//! bridge, served with warp.

pub mod errors;
pub mod handlers;
pub mod routes;

pub use errors::{error_type, ErrorResponse};
pub use routes::routes;

use crate::app::BridgeApp;
use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::Filter;

/// Bind the control API and serve it until `shutdown` resolves
pub async fn serve(
    app: Arc<BridgeApp>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> BridgeResult<()> {
    let filter = routes(app)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("telemetry_bridge::api"));

    let (addr, server) = warp::serve(filter)
        .try_bind_with_graceful_shutdown(SocketAddr::from(([0, 0, 0, 0], port)), shutdown)
        .map_err(|e| BridgeError::internal(format!("Failed to bind control API: {e}")))?;

    tracing::info!(%addr, "Control API listening");
    server.await;
    Ok(())
}
