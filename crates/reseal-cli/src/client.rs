//! Client for a remote unseal boundary

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use reseal_core::{FailureKind, UnsealError, UnsealRequest, UnsealService};
use reseal_crypto::PublicKey;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

use crate::server::{ErrorBody, UnsealResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RemoteUnsealer {
    client: Client,
    base_url: String,
    token: SecretString,
    /// Last certificate seen, with its ETag
    cert: Mutex<Option<(String, PublicKey)>>,
}

impl RemoteUnsealer {
    pub fn new(base_url: &str, token: SecretString) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            cert: Mutex::new(None),
        })
    }

    /// Run the boundary's checks without receiving plaintext
    pub async fn verify(&self, request: &UnsealRequest) -> Result<(), UnsealError> {
        let response = self.post("/v1/verify", request).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Err(error_from(response).await)
    }

    async fn post(&self, path: &str, request: &UnsealRequest) -> Result<Response, UnsealError> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(self.token.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| UnsealError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl UnsealService for RemoteUnsealer {
    async fn active_key(&self) -> Result<PublicKey, UnsealError> {
        let mut cached = self.cert.lock().await;

        let mut request = self.client.get(format!("{}/v1/cert.pem", self.base_url));
        if let Some((etag, _)) = cached.as_ref() {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| UnsealError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some((_, key)) = cached.as_ref() {
                debug!(fingerprint = %key.fingerprint().short(), "certificate unchanged");
                return Ok(key.clone());
            }
        }
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let pem = response
            .text()
            .await
            .map_err(|e| UnsealError::Unavailable(e.to_string()))?;
        let key = PublicKey::from_pem(&pem)?;

        if let Some(etag) = etag {
            *cached = Some((etag, key.clone()));
        }
        Ok(key)
    }

    async fn unseal(&self, request: &UnsealRequest) -> Result<Zeroizing<Vec<u8>>, UnsealError> {
        let response = self.post("/v1/unseal", request).await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let body: UnsealResponse = response
            .json()
            .await
            .map_err(|e| UnsealError::Unavailable(e.to_string()))?;
        body.decode().map_err(|e| UnsealError::Remote {
                kind: FailureKind::Fatal,
                message: format!("invalid plaintext encoding: {}", e),
            })
    }
}

async fn error_from(response: Response) -> UnsealError {
    let status = response.status();
    if status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::GATEWAY_TIMEOUT
    {
        return UnsealError::Unavailable(format!("boundary returned {}", status));
    }

    let body = response.json::<ErrorBody>().await.ok();
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::Forbidden,
        _ => body
            .as_ref()
            .and_then(|b| serde_json::from_value(serde_json::Value::String(b.kind.clone())).ok())
            .unwrap_or(FailureKind::Fatal),
    };
    let message = body
        .map(|b| b.message)
        .unwrap_or_else(|| format!("boundary returned {}", status));
    UnsealError::Remote { kind, message }
}
