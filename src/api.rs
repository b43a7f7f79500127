// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP control API.
//!
//! | method | path      | body                 | response                    |
//! |--------|-----------|----------------------|-----------------------------|
//! | GET    | `/status` |                      | `{"status": true \| false}` |
//! | POST   | `/switch` | `{"state": <bool>}`  | `{"success": true}`         |
//!
//! Device failures are answered with `500 {"error": "<message>"}`.

use std::io;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::plug::Plug;
use crate::protocol::DeviceTransport;
use crate::types::PowerState;

/// Body of `GET /status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Power state of the plug, `true` when on.
    pub status: PowerState,
}

/// Body of `POST /switch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRequest {
    /// Requested power state, `true` for on.
    pub state: PowerState,
}

/// Successful reply to `POST /switch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchResponse {
    /// Always `true`.
    pub success: bool,
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable failure description.
    pub error: String,
}

/// An error answered over HTTP.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Builds the API router for `plug`.
pub fn router<T: DeviceTransport>(plug: Plug<T>) -> Router {
    Router::new()
        .route("/status", get(status::<T>))
        .route("/switch", post(switch::<T>))
        .with_state(plug)
}

async fn status<T: DeviceTransport>(
    State(plug): State<Plug<T>>,
) -> Result<Json<StatusResponse>, ApiError> {
    match plug.status().await {
        Ok(status) => {
            debug!(%status, "Status requested");
            Ok(Json(StatusResponse { status }))
        }
        Err(e) => {
            warn!(error = %e, "Status request failed");
            Err(e.into())
        }
    }
}

async fn switch<T: DeviceTransport>(
    State(plug): State<Plug<T>>,
    body: Result<Json<SwitchRequest>, JsonRejection>,
) -> Result<Json<SwitchResponse>, ApiError> {
    let Json(request) = body?;

    match plug.switch(request.state).await {
        Ok(_) => Ok(Json(SwitchResponse { success: true })),
        Err(e) => {
            warn!(error = %e, requested = %request.state, "Switch request failed");
            Err(e.into())
        }
    }
}

/// Serves the API on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve<T: DeviceTransport>(
    listener: TcpListener,
    plug: Plug<T>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(plug))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_use_plain_booleans() {
        let status = StatusResponse {
            status: PowerState::On,
        };
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"status":true}"#);

        let request: SwitchRequest = serde_json::from_str(r#"{"state":false}"#).unwrap();
        assert_eq!(request.state, PowerState::Off);
    }

    #[test]
    fn device_errors_are_internal() {
        let err = ApiError::from(Error::Timeout {
            operation: "find",
            after: std::time::Duration::from_secs(5),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "find timed out after 5000 ms");
    }
}
