//! Signed HTTPS channel to the Iris API.
//!
//! Every request carries an HMAC over `METHOD|PATH|TIMESTAMP|NONCE|SHA256(body)`
//! computed on the exact bytes that go on the wire. Signed replies are
//! checked according to [`ResponseSignaturePolicy`], and when certificate
//! pins are configured the leaf certificate of each response must match one.
//!
//! ## Signed path
//!
//! `PATH` is what the server sees: the full URL path with its first `/api`
//! removed. With the base URL `https://host/api/iris`, a call to
//! `/auth/challenge` is signed as `/iris/auth/challenge`. Response signatures
//! cover the same path.
//!
//! ## Headers
//!
//! | Direction | Header |
//! |-----------|--------|
//! | out | `X-Iris-Client`, `X-Iris-Version`, `X-Iris-Timestamp`, `X-Iris-Nonce`, `X-Iris-Signature` |
//! | in | `X-Iris-Response-Signature`, `X-Iris-Response-Timestamp` |

use chrono::Utc;
use iris_crypto::{generate_nonce, EncryptedPayload, PayloadCipher, RequestSigner};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::config::{ResponseSignaturePolicy, TrustConfig};
use crate::error::{truncate_body, TrustError};

/// Client identifier sent in `X-Iris-Client`.
pub const CLIENT_KIND: &str = "desktop";

/// Request header names.
pub mod headers {
    /// Client kind.
    pub const CLIENT: &str = "X-Iris-Client";
    /// Client version.
    pub const VERSION: &str = "X-Iris-Version";
    /// Signing time, epoch milliseconds.
    pub const TIMESTAMP: &str = "X-Iris-Timestamp";
    /// Random per-request nonce.
    pub const NONCE: &str = "X-Iris-Nonce";
    /// Request HMAC.
    pub const SIGNATURE: &str = "X-Iris-Signature";
    /// Response HMAC.
    pub const RESPONSE_SIGNATURE: &str = "X-Iris-Response-Signature";
    /// Response signing time.
    pub const RESPONSE_TIMESTAMP: &str = "X-Iris-Response-Timestamp";
}

/// Outcome of checking a response signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCheck {
    /// The server did not sign this response.
    Unsigned,
    /// Signature matched.
    Verified,
    /// Signature did not match and the policy let it through.
    Mismatch,
}

/// Signed request channel.
pub struct SecureChannel {
    client: Client,
    base_url: String,
    base_path: String,
    client_version: String,
    signer: RequestSigner,
    policy: ResponseSignaturePolicy,
    pins: Vec<Vec<u8>>,
    cipher: Option<PayloadCipher>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("base_url", &self.base_url)
            .field("client_version", &self.client_version)
            .field("policy", &self.policy)
            .field("pins", &self.pins.len())
            .field("encryption", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Build a channel from configuration.
    pub fn new(config: &TrustConfig) -> Result<Self, TrustError> {
        let network = config.timeouts.network;
        let client = ClientBuilder::new()
            .timeout(network)
            .connect_timeout(network.min(std::time::Duration::from_secs(10)))
            .redirect(reqwest::redirect::Policy::none())
            .tls_info(true)
            .user_agent(user_agent(&config.client_version))
            .build()
            .map_err(|e| {
                TrustError::config(
                    format!("failed to create HTTP client: {e}"),
                    "Check TLS support on this system.",
                )
            })?;

        let pins = config
            .pinned_certificates
            .iter()
            .map(|pin| {
                let digest = pin.strip_prefix("sha256:").unwrap_or(pin);
                hex::decode(digest).map_err(|e| {
                    TrustError::config(
                        format!("invalid certificate pin '{pin}': {e}"),
                        "Pins are SHA-256 hex digests of the leaf certificate.",
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        let base_path = reqwest::Url::parse(&base_url)
            .map_err(|e| {
                TrustError::config(
                    format!("invalid API base URL '{base_url}': {e}"),
                    "Use an absolute http(s) URL such as https://host/api/iris.",
                )
            })?
            .path()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            base_url,
            base_path,
            client_version: config.client_version.clone(),
            signer: RequestSigner::new(&config.request_secret)?,
            policy: config.response_signature_policy,
            pins,
            cipher: None,
        })
    }

    /// Enable payload encryption with a key derived from the request secret.
    ///
    /// The scrypt derivation runs once, here.
    pub fn with_payload_encryption(mut self, config: &TrustConfig) -> Result<Self, TrustError> {
        self.cipher = Some(PayloadCipher::new(&config.request_secret)?);
        Ok(self)
    }

    /// Base URL all paths are relative to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path covered by request and response signatures for endpoint `path`.
    #[must_use]
    pub fn signed_path(&self, path: &str) -> String {
        server_path(&format!("{}{}", self.base_path, path))
    }

    /// `POST` a JSON body and decode the JSON reply.
    #[instrument(skip(self, body, bearer), fields(base = %self.base_url))]
    pub async fn post_json<B, R>(&self, path: &str, body: &B, bearer: Option<&str>) -> Result<R, TrustError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let bytes = serde_json::to_vec(body).map_err(|e| TrustError::InvalidResponse {
            endpoint: path.to_string(),
            message: format!("failed to encode request: {e}"),
        })?;
        let text = self.send(Method::POST, path, bytes, bearer).await?;
        self.decode(path, &text)
    }

    /// `POST` a body sealed with the payload cipher.
    ///
    /// Fails with [`TrustError::Config`] if encryption was not enabled.
    #[instrument(skip(self, body, bearer), fields(base = %self.base_url))]
    pub async fn post_encrypted<B, R>(&self, path: &str, body: &B, bearer: Option<&str>) -> Result<R, TrustError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let cipher = self.cipher.as_ref().ok_or_else(|| {
            TrustError::config(
                "payload encryption is not enabled",
                "Build the channel with with_payload_encryption.",
            )
        })?;
        let sealed: EncryptedPayload = cipher.encrypt(body)?;
        self.post_json(path, &sealed, bearer).await
    }

    /// `POST` without a body and decode the JSON reply.
    #[instrument(skip(self, bearer), fields(base = %self.base_url))]
    pub async fn post_empty<R: DeserializeOwned>(&self, path: &str, bearer: Option<&str>) -> Result<R, TrustError> {
        let text = self.send(Method::POST, path, Vec::new(), bearer).await?;
        self.decode(path, &text)
    }

    /// `GET` and decode the JSON reply.
    #[instrument(skip(self, bearer), fields(base = %self.base_url))]
    pub async fn get_json<R: DeserializeOwned>(&self, path: &str, bearer: Option<&str>) -> Result<R, TrustError> {
        let text = self.send(Method::GET, path, Vec::new(), bearer).await?;
        self.decode(path, &text)
    }

    /// Sign and send one request, returning the raw reply text.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
        bearer: Option<&str>,
    ) -> Result<String, TrustError> {
        let url = format!("{}{}", self.base_url, path);
        let signed_path = self.signed_path(path);
        let timestamp = Utc::now().timestamp_millis();
        let nonce = generate_nonce();
        let signature = self.signer.sign(method.as_str(), &signed_path, timestamp, &nonce, &body);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(headers::CLIENT, CLIENT_KIND)
            .header(headers::VERSION, &self.client_version)
            .header(headers::TIMESTAMP, timestamp.to_string())
            .header(headers::NONCE, &nonce)
            .header(headers::SIGNATURE, signature);
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        debug!(method = %method, url = %url, signed_path = %signed_path, "Sending signed request");
        let response = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Request failed");
            classify_send_error(&url, &e)
        })?;

        let status = response.status();
        info!(url = %url, status = %status, "Response received");

        self.check_certificate_pin(&response, &url)?;

        let response_headers = response.headers().clone();
        let text = response.text().await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to read response body");
            TrustError::Unreachable {
                message: format!("reading response from {url} failed: {e}"),
            }
        })?;

        if !status.is_success() {
            warn!(url = %url, status = %status, "Non-success status");
            return Err(TrustError::HttpStatus {
                status: status.as_u16(),
                body: truncate_body(&text),
            });
        }

        self.check_response_signature(path, &response_headers, text.as_bytes())?;
        Ok(text)
    }

    /// Apply the response signature policy to a reply body from endpoint `path`.
    pub fn check_response_signature(
        &self,
        path: &str,
        response_headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ResponseCheck, TrustError> {
        let header = |name: &str| response_headers.get(name).and_then(|v| v.to_str().ok());
        let (Some(signature), Some(timestamp)) = (
            header(headers::RESPONSE_SIGNATURE),
            header(headers::RESPONSE_TIMESTAMP),
        ) else {
            return Ok(ResponseCheck::Unsigned);
        };

        if self.signer.verify_response(&self.signed_path(path), timestamp, body, signature) {
            debug!(path = %path, "Response signature verified");
            return Ok(ResponseCheck::Verified);
        }

        match self.policy {
            ResponseSignaturePolicy::Warn => {
                warn!(path = %path, "Response signature mismatch, possible tampering");
                Ok(ResponseCheck::Mismatch)
            },
            ResponseSignaturePolicy::Enforce => {
                warn!(path = %path, "Response signature mismatch, rejecting response");
                Err(TrustError::integrity(format!("response signature mismatch for {path}")))
            },
        }
    }

    /// Compare the peer's leaf certificate against the configured pins.
    fn check_certificate_pin(&self, response: &Response, url: &str) -> Result<(), TrustError> {
        if self.pins.is_empty() {
            return Ok(());
        }
        let leaf = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(reqwest::tls::TlsInfo::peer_certificate)
            .ok_or_else(|| {
                warn!(url = %url, "Certificate pinning configured but no peer certificate available");
                TrustError::integrity(format!("no peer certificate presented by {url}"))
            })?;
        let fingerprint = Sha256::digest(leaf);
        if self
            .pins
            .iter()
            .any(|pin| iris_crypto::constant_time_eq(pin, fingerprint.as_slice()))
        {
            debug!(url = %url, "Certificate pin matched");
            Ok(())
        } else {
            warn!(url = %url, fingerprint = %hex::encode(fingerprint), "Certificate pin mismatch");
            Err(TrustError::integrity(format!("certificate for {url} does not match any pin")))
        }
    }

    fn decode<R: DeserializeOwned>(&self, path: &str, text: &str) -> Result<R, TrustError> {
        let invalid = |e: serde_json::Error| TrustError::InvalidResponse {
            endpoint: path.to_string(),
            message: e.to_string(),
        };
        match &self.cipher {
            Some(cipher) => {
                let value: serde_json::Value = serde_json::from_str(text).map_err(invalid)?;
                let opened = cipher.open_value(value)?;
                serde_json::from_value(opened).map_err(invalid)
            },
            None => serde_json::from_str(text).map_err(invalid),
        }
    }
}

/// The server's view of a request path: everything after the first `/api`.
#[must_use]
pub fn server_path(url_path: &str) -> String {
    url_path.replacen("/api", "", 1)
}

/// `User-Agent` for every outbound request.
pub(crate) fn user_agent(version: &str) -> String {
    format!("Iris/{} ({})", version, env!("TARGET"))
}

fn classify_send_error(url: &str, e: &reqwest::Error) -> TrustError {
    if e.is_builder() {
        return TrustError::config(format!("invalid request to {url}: {e}"), "Check the API base URL.");
    }
    TrustError::Unreachable {
        message: format!("request to {url} failed: {e}"),
    }
}
