//! RPC endpoint and connector client.
//!
//! The RPC plane speaks protobuf messages in length-prefixed frames over
//! TCP — the same `Execute` shape on both sides of the gateway. The server
//! side ([`RpcServer`]) is the agent-facing endpoint with semantics
//! identical to `POST /v1/execute`; the client side ([`RpcConnector`]) is
//! the downstream executor adapter the reliability wrapper wraps.

mod framing;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use prost::Message as _;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};

use uag_core::auth::TokenValidator;
use uag_core::connector::{ActionExecutor, ConnectorError};
use uag_core::pipeline::Gateway;

use crate::status::error_status;

/// Wire messages, mirroring `proto/gateway.proto`
/// (package `uag.connector.v1`).
pub mod proto {
    use std::collections::BTreeMap;

    /// One capability invocation.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExecuteRequest {
        /// Capability being invoked, e.g. `jira.ticket.delete`.
        #[prost(string, tag = "1")]
        pub capability_id: String,

        /// Opaque request payload (JSON in practice).
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,

        /// Transport metadata: `agent_id`, `token`, `trace_id` on the
        /// agent-facing side; `source` on the connector-facing side.
        #[prost(btree_map = "string, string", tag = "3")]
        pub metadata: BTreeMap<String, String>,
    }

    /// Result of one invocation.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExecuteResponse {
        /// 0 on success, otherwise an HTTP-equivalent error code.
        #[prost(int32, tag = "1")]
        pub status_code: i32,

        /// Opaque response payload when `status_code == 0`.
        #[prost(bytes = "vec", tag = "2")]
        pub result: Vec<u8>,

        /// Sanitized error text when `status_code != 0`.
        #[prost(string, tag = "3")]
        pub error_message: String,

        /// Backoff hint in milliseconds when the callee is throttling.
        #[prost(uint64, tag = "4")]
        pub retry_after_ms: u64,
    }
}

/// Metadata key carrying the acting agent id.
pub const META_AGENT_ID: &str = "agent_id";

/// Metadata key carrying the bearer token.
pub const META_TOKEN: &str = "token";

/// Metadata key carrying the request trace id.
pub const META_TRACE_ID: &str = "trace_id";

/// RPC transport errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Frame exceeded the protocol limit.
    #[error("frame of {size} bytes exceeds protocol limit {max}")]
    FrameTooLarge {
        /// Offending frame size.
        size: usize,
        /// Protocol limit.
        max: usize,
    },

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Frame did not decode as the expected message.
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Agent-facing RPC endpoint.
pub struct RpcServer {
    gateway: Arc<Gateway>,
    validator: Arc<dyn TokenValidator>,
}

impl RpcServer {
    /// Creates the server over the shared pipeline.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, validator: Arc<dyn TokenValidator>) -> Self {
        Self { gateway, validator }
    }

    /// Accept loop. Runs until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "rpc server listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "rpc accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "rpc connection accepted");
            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, cancel).await;
            });
        }
        info!("rpc server stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, cancel: CancellationToken) {
        let mut framed = Framed::new(stream, FrameCodec::new());

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(error = %e, "rpc frame error, closing connection");
                        return;
                    }
                    None => return,
                },
            };

            let response = self.handle_frame(&frame).await;
            if let Err(e) = framed
                .send(Bytes::from(response.encode_to_vec()))
                .await
            {
                warn!(error = %e, "rpc response write failed");
                return;
            }
        }
    }

    /// Decodes one request, runs the pipeline, encodes the verdict.
    ///
    /// Transport-level problems (undecodable frame, missing metadata) come
    /// back as error responses rather than dropped connections, so a
    /// misbehaving client still learns what went wrong.
    async fn handle_frame(&self, frame: &[u8]) -> proto::ExecuteResponse {
        let request = match proto::ExecuteRequest::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                return error_response(400, &format!("malformed request: {e}"));
            }
        };

        let Some(token) = request.metadata.get(META_TOKEN) else {
            return error_response(401, "missing access token");
        };
        let claims = match self.validator.validate(token) {
            Ok(claims) => claims,
            Err(e) => return error_response(401, &e.to_string()),
        };

        let Some(agent_id) = request.metadata.get(META_AGENT_ID) else {
            return error_response(400, "agent_id metadata is required");
        };
        if request.capability_id.is_empty() {
            return error_response(400, "capability_id is required");
        }

        let trace_id = request
            .metadata
            .get(META_TRACE_ID)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self
            .gateway
            .process_action(
                &claims,
                agent_id,
                &request.capability_id,
                &request.payload,
                &trace_id,
            )
            .await
        {
            Ok(result) => proto::ExecuteResponse {
                status_code: 0,
                result,
                error_message: String::new(),
                retry_after_ms: 0,
            },
            Err(e) => {
                let (code, kind) = error_status(&e);
                error_response(i32::from(code), kind)
            }
        }
    }
}

fn error_response(status_code: i32, message: &str) -> proto::ExecuteResponse {
    proto::ExecuteResponse {
        status_code,
        result: Vec::new(),
        error_message: message.to_string(),
        retry_after_ms: 0,
    }
}

/// Downstream connector client speaking the same frame protocol.
///
/// Connects per call; connection reuse belongs to the transport below the
/// 15 s guard timeout, not to this adapter.
pub struct RpcConnector {
    addr: String,
    call_timeout: Duration,
}

impl RpcConnector {
    /// Creates a connector client for `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            call_timeout,
        }
    }

    async fn round_trip(
        &self,
        capability_id: &str,
        payload: &[u8],
    ) -> Result<proto::ExecuteResponse, ConnectorError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let request = proto::ExecuteRequest {
            capability_id: capability_id.to_string(),
            payload: payload.to_vec(),
            metadata: std::collections::BTreeMap::from([(
                "source".to_string(),
                "uag-engine".to_string(),
            )]),
        };
        framed
            .send(Bytes::from(request.encode_to_vec()))
            .await
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;

        match framed.next().await {
            Some(Ok(frame)) => proto::ExecuteResponse::decode(&frame[..])
                .map_err(|e| ConnectorError::Upstream(format!("malformed response: {e}"))),
            Some(Err(e)) => Err(ConnectorError::Unavailable(e.to_string())),
            None => Err(ConnectorError::Unavailable(
                "connector closed the connection".into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl ActionExecutor for RpcConnector {
    async fn call(&self, capability_id: &str, payload: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let response =
            match tokio::time::timeout(self.call_timeout, self.round_trip(capability_id, payload))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(ConnectorError::Timeout),
            };

        if response.retry_after_ms > 0 {
            return Err(ConnectorError::Throttled {
                retry_after: Duration::from_millis(response.retry_after_ms),
            });
        }
        if response.status_code != 0 {
            return Err(ConnectorError::Upstream(format!(
                "connector returned error [{}]: {}",
                response.status_code, response.error_message
            )));
        }
        Ok(response.result)
    }
}
