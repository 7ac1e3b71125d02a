//! Endpoint tests over a fully wired runtime: HTTP via in-process service
//! calls, RPC over a real TCP socket with the frame codec.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::BodyExt as _;
use prost::Message as _;
use tokio_util::codec::Framed;
use tower::ServiceExt as _;

use uag_core::auth::TokenSigner;
use uag_core::config::UagConfig;
use uag_core::domain::{Agent, AgentStatus, Policy, PolicyEffect};
use uag_core::store::{SqliteStateStore, StateStore};
use uag_daemon::GatewayRuntime;
use uag_daemon::http::{AppState, router};
use uag_daemon::rpc::{FrameCodec, META_AGENT_ID, META_TOKEN, RpcServer, proto};

const AGENT: &str = "A1";
const CAPABILITY: &str = "jira.ticket.delete";

struct TestEnv {
    _dir: tempfile::TempDir,
    runtime: GatewayRuntime,
    signer: TokenSigner,
}

impl TestEnv {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("uag.db");

        let signer = TokenSigner::generate("uag-test", chrono::Duration::minutes(5));

        // Seed durable state before the runtime warm-loads it.
        {
            let store = SqliteStateStore::open(&db_path).unwrap();
            store
                .upsert_agent(&Agent {
                    id: AGENT.into(),
                    name: "jira-helper-bot".into(),
                    status: AgentStatus::Active,
                    is_sandbox: false,
                    scopes: vec![CAPABILITY.into()],
                    last_activity: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    metadata: HashMap::new(),
                })
                .await
                .unwrap();
            store
                .create_policy(&Policy {
                    id: "p1".into(),
                    agent_id: AGENT.into(),
                    capability_id: CAPABILITY.into(),
                    effect: Some(PolicyEffect::Allow),
                    conditions: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let mut config = UagConfig::default();
        config.datastore.path = db_path;
        config.auth.public_key = signer.public_key_base64();

        let runtime = GatewayRuntime::start(&config).await.unwrap();
        Self {
            _dir: dir,
            runtime,
            signer,
        }
    }

    fn app(&self) -> axum::Router {
        router(AppState {
            gateway: Arc::clone(&self.runtime.gateway),
            validator: Arc::clone(&self.runtime.validator),
        })
    }

    fn token(&self) -> String {
        self.signer
            .issue(AGENT, uag_core::auth::scopes_from([CAPABILITY]))
    }

    fn execute_request(&self, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/v1/execute?capability={CAPABILITY}"))
            .header("x-agent-id", AGENT)
            .header("x-trace-id", "trace-e2e");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .body(Body::from(r#"{"id":"T-1","amount":50}"#))
            .unwrap()
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn http_happy_path_returns_downstream_response() {
    let env = TestEnv::start().await;

    let response = env
        .app()
        .oneshot(env.execute_request(Some(&env.token())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-trace-id").unwrap(),
        "trace-e2e"
    );
    let body = body_json(response).await;
    assert_eq!(body["status"], "deleted");
    assert_eq!(body["integration"], "jira");
}

#[tokio::test]
async fn http_missing_token_is_unauthorized() {
    let env = TestEnv::start().await;

    let response = env.app().oneshot(env.execute_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "missing_token");
}

#[tokio::test]
async fn http_garbage_token_is_unauthorized() {
    let env = TestEnv::start().await;

    let response = env
        .app()
        .oneshot(env.execute_request(Some("not-a-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_token");
}

#[tokio::test]
async fn http_missing_policy_is_denied_without_detail() {
    let env = TestEnv::start().await;
    let token = env
        .signer
        .issue(AGENT, uag_core::auth::scopes_from(["crm.lead.create"]));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/execute?capability=crm.lead.create")
        .header("x-agent-id", AGENT)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from("{}"))
        .unwrap();

    let response = env.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "access_denied");
}

#[tokio::test]
async fn http_wrong_method_is_rejected() {
    let env = TestEnv::start().await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/v1/execute?capability={CAPABILITY}"))
        .body(Body::empty())
        .unwrap();
    let response = env.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn http_missing_agent_header_is_bad_request() {
    let env = TestEnv::start().await;
    let token = env.token();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/execute?capability={CAPABILITY}"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from("{}"))
        .unwrap();
    let response = env.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_assigns_trace_id_when_absent() {
    let env = TestEnv::start().await;
    let token = env.token();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/execute?capability={CAPABILITY}"))
        .header("x-agent-id", AGENT)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from("{}"))
        .unwrap();
    let response = env.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-trace-id"));
}

#[tokio::test]
async fn rpc_execute_round_trip() {
    let env = TestEnv::start().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RpcServer::new(
        Arc::clone(&env.runtime.gateway),
        Arc::clone(&env.runtime.validator),
    ));
    let cancel = tokio_util::sync::CancellationToken::new();
    let server_task = tokio::spawn(server.serve(listener, cancel.clone()));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = proto::ExecuteRequest {
        capability_id: CAPABILITY.to_string(),
        payload: br#"{"id":"T-1"}"#.to_vec(),
        metadata: std::collections::BTreeMap::from([
            (META_AGENT_ID.to_string(), AGENT.to_string()),
            (META_TOKEN.to_string(), env.token()),
        ]),
    };
    framed
        .send(Bytes::from(request.encode_to_vec()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response = proto::ExecuteResponse::decode(&frame[..]).unwrap();

    assert_eq!(response.status_code, 0);
    let body: serde_json::Value = serde_json::from_slice(&response.result).unwrap();
    assert_eq!(body["status"], "deleted");

    cancel.cancel();
    server_task.await.unwrap();
}

#[tokio::test]
async fn rpc_missing_token_is_refused() {
    let env = TestEnv::start().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RpcServer::new(
        Arc::clone(&env.runtime.gateway),
        Arc::clone(&env.runtime.validator),
    ));
    let cancel = tokio_util::sync::CancellationToken::new();
    let server_task = tokio::spawn(server.serve(listener, cancel.clone()));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = proto::ExecuteRequest {
        capability_id: CAPABILITY.to_string(),
        payload: b"{}".to_vec(),
        metadata: std::collections::BTreeMap::from([(
            META_AGENT_ID.to_string(),
            AGENT.to_string(),
        )]),
    };
    framed
        .send(Bytes::from(request.encode_to_vec()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response = proto::ExecuteResponse::decode(&frame[..]).unwrap();
    assert_eq!(response.status_code, 401);
    assert!(response.result.is_empty());

    cancel.cancel();
    server_task.await.unwrap();
}
