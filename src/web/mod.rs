//! JSON function layer over the registries and the scheduler.

mod routes;

use crate::api::events::Notifier;
use crate::connections::ConnectionRegistry;
use crate::error::Error;
use crate::pairs::PairRegistry;
use crate::prompts::PromptLibrary;
use crate::scheduler::Scheduler;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppContext {
    pub connections: ConnectionRegistry,
    pub pairs: PairRegistry,
    pub prompts: PromptLibrary,
    pub scheduler: Scheduler,
    pub notifier: Notifier,
}

/// Wraps crate errors so handlers can use `?`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Remote(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({ "success": false, "error": self.0.to_string() })),
        )
            .into_response()
    }
}

pub async fn serve(
    listener: TcpListener,
    ctx: AppContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    axum::serve(listener, routes::router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
