use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid token url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid service account key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
    #[error("failed to sign assertion: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("token endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Exchanges a signed service-account assertion for a bearer token.
#[derive(Clone)]
pub struct ServiceAccountAuth {
    http: Client,
    token_url: Url,
    account: ServiceAccount,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

impl ServiceAccountAuth {
    pub fn new(account: ServiceAccount) -> Result<Self, AuthError> {
        Self::with_token_url(DEFAULT_TOKEN_URL, account)
    }

    pub fn with_token_url(token_url: &str, account: ServiceAccount) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            token_url: Url::parse(token_url)?,
            account,
        })
    }

    pub async fn fetch_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let assertion = self.sign_assertion(scope, now_unix())?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<AccessToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }

    fn sign_assertion(&self, scope: &str, issued_at: u64) -> Result<String, AuthError> {
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(AuthError::InvalidKey)?;
        let claims = Claims {
            iss: &self.account.client_email,
            scope,
            aud: self.token_url.as_str(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(AuthError::Sign)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
