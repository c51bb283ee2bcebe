//! HTTP transport for the unseal boundary
//!
//! - `GET  /v1/cert.pem`  active public key, cacheable by ETag
//! - `POST /v1/unseal`    `{envelope, scope}` -> `{plaintext}` (base64)
//! - `POST /v1/verify`    same checks, 204 without plaintext
//!
//! Bearer tokens are mapped to identities through their SHA-256 digest;
//! TLS termination belongs to whatever sits in front of this listener.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reseal_core::{CallerIdentity, CancelSignal, Classify, FailureKind, UnsealBoundary, UnsealError, UnsealRequest};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::PolicyFile;

pub const CERT_CACHE_CONTROL: &str = "max-age=60, must-revalidate";

#[derive(Clone)]
pub struct AppState {
    boundary: Arc<UnsealBoundary>,
    tokens: Arc<PolicyFile>,
}

impl AppState {
    pub fn new(boundary: Arc<UnsealBoundary>, tokens: PolicyFile) -> Self {
        Self {
            boundary,
            tokens: Arc::new(tokens),
        }
    }
}

/// Successful unseal body; the base64 text is wiped when the body drops
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct UnsealResponse {
    pub plaintext: String,
}

impl UnsealResponse {
    pub fn encode(plaintext: &[u8]) -> Self {
        Self {
            plaintext: STANDARD.encode(plaintext),
        }
    }

    pub fn decode(&self) -> Result<Zeroizing<Vec<u8>>, base64::DecodeError> {
        STANDARD.decode(self.plaintext.as_bytes()).map(Zeroizing::new)
    }
}

/// Error body: `kind` is a failure kind or `unauthorized`/`bad-request`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/cert.pem", get(cert))
        .route("/v1/unseal", post(unseal))
        .route("/v1/verify", post(verify))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancelSignal) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "unseal boundary listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn cert(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let key = state.boundary.public_key().await?;
    let etag = format!("\"{}\"", key.fingerprint());

    let matches = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag || tag.trim() == "*"));
    if matches {
        return Ok((
            StatusCode::NOT_MODIFIED,
            [(ETAG, etag), (CACHE_CONTROL, CERT_CACHE_CONTROL.to_string())],
        )
            .into_response());
    }

    let pem = key
        .to_pem()
        .map_err(|e| ApiError::Unseal(UnsealError::Crypto(e)))?;
    Ok((
        [
            (CONTENT_TYPE, "application/x-pem-file".to_string()),
            (ETAG, etag),
            (CACHE_CONTROL, CERT_CACHE_CONTROL.to_string()),
        ],
        pem,
    )
        .into_response())
}

async fn unseal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UnsealResponse>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let request = parse_request(&body)?;

    let plaintext = state
        .boundary
        .unseal(&caller, &request)
        .await
        .map_err(|e| log_refusal(&caller, &request, e))?;
    info!(caller = %caller, scope = %request.scope, "unseal granted");
    Ok(Json(UnsealResponse::encode(plaintext.as_slice())))
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let request = parse_request(&body)?;

    state
        .boundary
        .verify(&caller, &request)
        .await
        .map_err(|e| log_refusal(&caller, &request, e))?;
    Ok(StatusCode::NO_CONTENT)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    state
        .tokens
        .identify(&SecretString::new(token.trim().to_string()))
        .cloned()
        .ok_or(ApiError::Unauthorized)
}

fn parse_request(body: &[u8]) -> Result<UnsealRequest, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn log_refusal(caller: &CallerIdentity, request: &UnsealRequest, error: UnsealError) -> ApiError {
    warn!(caller = %caller, scope = %request.scope, kind = %error.kind(), "unseal refused");
    ApiError::Unseal(error)
}

pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Unseal(UnsealError),
}

impl From<UnsealError> for ApiError {
    fn from(e: UnsealError) -> Self {
        ApiError::Unseal(e)
    }
}

/// Status code for a failure kind
pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::Forbidden => StatusCode::FORBIDDEN,
        FailureKind::UnknownKey => StatusCode::NOT_FOUND,
        FailureKind::NoMatchingKey | FailureKind::Tampered => StatusCode::UNPROCESSABLE_ENTITY,
        FailureKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Conflict | FailureKind::Fatal | FailureKind::Aborted => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    kind: "unauthorized".into(),
                    message: "missing or unknown bearer token".into(),
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    kind: "bad-request".into(),
                    message,
                },
            ),
            ApiError::Unseal(e) => {
                let kind = e.kind();
                (
                    status_for(kind),
                    ErrorBody {
                        kind: kind.to_string(),
                        message: e.to_string(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteUnsealer;
    use secrecy::ExposeSecret;
    use chrono::Utc;
    use reseal_core::{
        AccessPolicy, MemoryStore, ObjectRef, ObjectStore, Orchestrator, ReencryptConfig,
        SealedObject, UnsealService,
    };
    use reseal_crypto::{Envelope, KeyRegistry, PublicKey, ScopeLabel, SharedRegistry};

    struct TestServer {
        url: String,
        registry: SharedRegistry,
        token: SecretString,
        shutdown: CancelSignal,
    }

    impl TestServer {
        async fn start(grants: AccessPolicy) -> Self {
            let mut registry = KeyRegistry::new(1024);
            registry.generate(Utc::now()).unwrap();
            let registry = registry.into_shared();

            let mut policy = PolicyFile::default();
            let token = policy.issue_token(&CallerIdentity::new("ci")).unwrap();
            let boundary = Arc::new(UnsealBoundary::new(Arc::clone(&registry), grants));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let shutdown = CancelSignal::new();
            tokio::spawn(serve(listener, AppState::new(boundary, policy), shutdown.clone()));

            Self {
                url,
                registry,
                token,
                shutdown,
            }
        }

        fn client(&self) -> RemoteUnsealer {
            RemoteUnsealer::new(&self.url, SecretString::new(self.token.expose_secret().clone())).unwrap()
        }

        async fn active_key(&self) -> PublicKey {
            self.registry.read().await.active().unwrap().public_key().clone()
        }

        async fn seal(&self, scope: &ScopeLabel, value: &[u8]) -> Envelope {
            reseal_crypto::seal(value, scope, &self.active_key().await).unwrap()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.shutdown.cancel("test finished");
        }
    }

    fn grants() -> AccessPolicy {
        AccessPolicy::empty().with_grant("ci", "prod")
    }

    #[tokio::test]
    async fn test_cert_etag_and_revalidation() {
        let server = TestServer::start(grants()).await;
        let http = reqwest::Client::new();
        let url = format!("{}/v1/cert.pem", server.url);

        let first = http.get(&url).send().await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.headers()[CACHE_CONTROL.as_str()], CERT_CACHE_CONTROL);
        let etag = first.headers()[ETAG.as_str()].to_str().unwrap().to_string();
        let pem = first.text().await.unwrap();
        let key = PublicKey::from_pem(&pem).unwrap();
        assert_eq!(etag, format!("\"{}\"", key.fingerprint()));

        let second = http
            .get(&url)
            .header(IF_NONE_MATCH.as_str(), &etag)
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 304);

        server.registry.write().await.generate(Utc::now()).unwrap();
        let rotated = http
            .get(&url)
            .header(IF_NONE_MATCH.as_str(), &etag)
            .send()
            .await
            .unwrap();
        assert_eq!(rotated.status(), 200);
    }

    #[tokio::test]
    async fn test_unseal_over_http() {
        let server = TestServer::start(grants()).await;
        let client = server.client();
        let scope = ScopeLabel::strict("prod", "db");
        let envelope = server.seal(&scope, b"hunter2").await;

        let key = client.active_key().await.unwrap();
        assert_eq!(key.fingerprint(), server.active_key().await.fingerprint());

        let request = UnsealRequest { envelope, scope };
        let plaintext = client.unseal(&request).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"hunter2");
        client.verify(&request).await.unwrap();
    }

    #[test]
    fn test_unseal_response_wipes_its_text() {
        let mut body = UnsealResponse::encode(b"hunter2");
        assert_eq!(body.decode().unwrap().as_slice(), b"hunter2");

        let json = serde_json::to_string(&body).unwrap();
        let parsed: UnsealResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.decode().unwrap().as_slice(), b"hunter2");

        body.zeroize();
        assert!(body.plaintext.is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_401() {
        let server = TestServer::start(grants()).await;
        let scope = ScopeLabel::strict("prod", "db");
        let body = UnsealRequest {
            envelope: server.seal(&scope, b"x").await,
            scope,
        };
        let http = reqwest::Client::new();
        let url = format!("{}/v1/unseal", server.url);

        let anonymous = http.post(&url).json(&body).send().await.unwrap();
        assert_eq!(anonymous.status(), 401);

        let forged = http
            .post(&url)
            .bearer_auth("not-a-token")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(forged.status(), 401);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let server = TestServer::start(grants()).await;
        let client = server.client();

        // Not granted
        let staging = ScopeLabel::strict("staging", "db");
        let err = client
            .unseal(&UnsealRequest {
                envelope: server.seal(&staging, b"x").await,
                scope: staging,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Forbidden);

        // Bound to another object
        let err = client
            .unseal(&UnsealRequest {
                envelope: server.seal(&ScopeLabel::strict("prod", "a"), b"x").await,
                scope: ScopeLabel::strict("prod", "b"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Tampered);

        // Sealed under a key this boundary never held
        let mut stranger = KeyRegistry::new(1024);
        stranger.generate(Utc::now()).unwrap();
        let scope = ScopeLabel::strict("prod", "db");
        let foreign = reseal_crypto::seal(b"x", &scope, stranger.active().unwrap().public_key()).unwrap();
        let err = client
            .verify(&UnsealRequest {
                envelope: foreign,
                scope,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnknownKey);
    }

    #[tokio::test]
    async fn test_unreachable_boundary_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = RemoteUnsealer::new(&url, SecretString::new("t".into())).unwrap();
        let err = client.active_key().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_reencrypt_through_remote_boundary() {
        let server = TestServer::start(grants()).await;
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            let envelope = server.seal(&ScopeLabel::strict("prod", name), name.as_bytes()).await;
            store
                .put(SealedObject::new("prod", name).with_field("value", envelope))
                .unwrap();
        }
        server.registry.write().await.generate(Utc::now()).unwrap();

        let report = Orchestrator::new(
            store.clone(),
            Arc::new(server.client()),
            ReencryptConfig::for_namespace("prod"),
        )
        .run(&CancelSignal::new())
        .await;

        assert_eq!(report.totals.succeeded, 3);
        let active = server.active_key().await;
        let migrated = store.get(&ObjectRef::new("prod", "b")).await.unwrap().unwrap();
        assert!(!migrated.object.needs_migration(active.fingerprint()));
    }
}
