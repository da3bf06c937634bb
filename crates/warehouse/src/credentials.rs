//! Credentials for the BigQuery REST API
//!
//! The pipeline receives a single secret: the JSON key of a service account
//! (or an authorized-user document produced by `gcloud auth
//! application-default login`). The secret is held in [`Secret`], whose
//! `Debug` output is redacted, and is only ever sent to the token endpoint.

use crate::error::{Result, WarehouseError};
use diagnostics::*;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl, basic::BasicClient,
    reqwest::async_http_client,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Environment variable holding the credential JSON blob
pub const CREDENTIALS_ENV: &str = "GCP_SERVICE_ACCOUNT_KEY";
/// Environment variable holding an already-issued bearer token
pub const ACCESS_TOKEN_ENV: &str = "BIGQUERY_ACCESS_TOKEN";
/// Environment variable holding a path to a credential JSON file
pub const CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// A string that never appears in logs or `Debug` output
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: Secret,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: Secret,
    pub refresh_token: Secret,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialDocument {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

#[derive(Debug, Clone)]
pub enum Credentials {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    AccessToken(Secret),
}

/// Non-secret facts about a credential, safe to print
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    pub kind: &'static str,
    pub project_id: Option<String>,
    pub client_email: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
}

impl Credentials {
    /// Parse a credential JSON document
    pub fn from_json(blob: &str) -> Result<Self> {
        let doc: CredentialDocument = serde_json::from_str(blob.trim()).map_err(|e| {
            WarehouseError::Authentication(format!(
                "credential is not a service_account or authorized_user JSON document: {e}"
            ))
        })?;
        Ok(match doc {
            CredentialDocument::ServiceAccount(key) => Credentials::ServiceAccount(key),
            CredentialDocument::AuthorizedUser(user) => Credentials::AuthorizedUser(user),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let blob = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&blob)
    }

    /// Locate credentials in the environment.
    ///
    /// Lookup order: the injected JSON blob, a pre-issued access token, then
    /// a credential file path.
    pub fn from_env() -> Result<Self> {
        if let Ok(blob) = std::env::var(CREDENTIALS_ENV) {
            if !blob.trim().is_empty() {
                let source = CREDENTIALS_ENV;
                debug!("Using credentials from {source}", source: source);
                return Self::from_json(&blob);
            }
        }
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                let source = ACCESS_TOKEN_ENV;
                debug!("Using access token from {source}", source: source);
                return Ok(Credentials::AccessToken(Secret::new(token.trim())));
            }
        }
        if let Ok(path) = std::env::var(CREDENTIALS_FILE_ENV) {
            let source = CREDENTIALS_FILE_ENV;
            debug!("Using credential file named by {source}", source: source);
            return Self::from_file(path);
        }
        Err(WarehouseError::Authentication(format!(
            "no credentials: set {CREDENTIALS_ENV}, {ACCESS_TOKEN_ENV} or {CREDENTIALS_FILE_ENV}"
        )))
    }

    pub fn summary(&self) -> CredentialSummary {
        match self {
            Credentials::ServiceAccount(key) => CredentialSummary {
                kind: "service_account",
                project_id: key.project_id.clone(),
                client_email: Some(key.client_email.clone()),
            },
            Credentials::AuthorizedUser(user) => CredentialSummary {
                kind: "authorized_user",
                project_id: user.quota_project_id.clone(),
                client_email: None,
            },
            Credentials::AccessToken(_) => CredentialSummary {
                kind: "access_token",
                project_id: None,
                client_email: None,
            },
        }
    }

    /// Exchange the credential for a bearer token scoped to BigQuery
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<Secret> {
        match self {
            Credentials::AccessToken(token) => Ok(token.clone()),
            Credentials::ServiceAccount(key) => service_account_token(http, key).await,
            Credentials::AuthorizedUser(user) => authorized_user_token(user).await,
        }
    }
}

fn signed_assertion(key: &ServiceAccountKey, now: i64) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: BIGQUERY_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.expose().as_bytes())
        .map_err(|e| WarehouseError::Authentication(format!("unreadable private key: {e}")))?;

    jsonwebtoken::encode(&header, &claims, &signing_key)
        .map_err(|e| WarehouseError::Authentication(format!("cannot sign assertion: {e}")))
}

async fn service_account_token(http: &reqwest::Client, key: &ServiceAccountKey) -> Result<Secret> {
    let client_email = key.client_email.as_str();
    info!("Authenticating as service account {client_email}", client_email: client_email);

    let assertion = signed_assertion(key, chrono::Utc::now().timestamp())?;
    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(if status.is_server_error() {
            WarehouseError::Transient(format!("token endpoint returned {status}"))
        } else {
            WarehouseError::Authentication(format!("token endpoint returned {status}: {body}"))
        });
    }

    let reply: TokenReply = response.json().await?;
    Ok(Secret::new(reply.access_token))
}

async fn authorized_user_token(user: &AuthorizedUser) -> Result<Secret> {
    info!("Authenticating with authorized user credentials");

    let auth_url = AuthUrl::new(GOOGLE_AUTH_URL.to_string())
        .map_err(|e| WarehouseError::Authentication(format!("bad authorization URL: {e}")))?;
    let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
        .map_err(|e| WarehouseError::Authentication(format!("bad token URL: {e}")))?;

    let oauth_client = BasicClient::new(
        ClientId::new(user.client_id.clone()),
        Some(ClientSecret::new(user.client_secret.expose().to_string())),
        auth_url,
        Some(token_url),
    );

    let token = oauth_client
        .exchange_refresh_token(&RefreshToken::new(user.refresh_token.expose().to_string()))
        .request_async(async_http_client)
        .await
        .map_err(|e| WarehouseError::Authentication(format!("refresh token exchange failed: {e}")))?;

    Ok(Secret::new(token.access_token().secret().clone()))
}
