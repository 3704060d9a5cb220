//! Identity-provider login: authorize redirect, code exchange, userinfo, and
//! the session cookie that carries the provider's bearer token.

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::OAuthConfig;
use crate::error::{AppError, AppResult};
use crate::models::{StateClaims, UserInfo};

pub const SESSION_COOKIE: &str = "hf_token";
pub const OAUTH_SCOPES: &str = "openid profile write-repos manage-repos inference-api";
const SESSION_MAX_AGE_DAYS: i64 = 30;
const STATE_TTL_SECS: i64 = 600;

pub fn create_state(secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = StateClaims {
        nonce: uuid::Uuid::new_v4().to_string(),
        exp: (chrono::Utc::now().timestamp() + STATE_TTL_SECS) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn validate_state(token: &str, secret: &str) -> Result<StateClaims, jsonwebtoken::errors::Error> {
    let token_data = decode::<StateClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(token_data.claims)
}

/// Build the provider's authorize URL for the login redirect.
pub fn authorize_url(base: &str, oauth: &OAuthConfig, client_id: &str, state: &str) -> AppResult<Url> {
    Url::parse_with_params(
        &format!("{base}/oauth/authorize"),
        &[
            ("client_id", client_id),
            ("redirect_uri", oauth.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", OAUTH_SCOPES),
            ("prompt", "consent"),
            ("state", state),
        ],
    )
    .map_err(|e| AppError::Internal(format!("Invalid authorize URL: {e}")))
}

pub fn session_token(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

pub fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(SESSION_MAX_AGE_DAYS))
        .path("/")
        .build()
}

pub fn clear_session(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/"))
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn base_url(&self) -> &str;

    /// Trade an authorization code for an access token. `Ok(None)` when the
    /// provider answered without one.
    async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> AppResult<Option<String>>;

    /// Resolve a bearer token to its user. `Ok(None)` when the token is rejected.
    async fn userinfo(&self, token: &str) -> AppResult<Option<UserInfo>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Hugging Face OAuth / OpenID endpoints.
pub struct HuggingFaceIdentity {
    http: reqwest::Client,
    base_url: String,
}

impl HuggingFaceIdentity {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HuggingFaceIdentity {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> AppResult<Option<String>> {
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .basic_auth(client_id, Some(client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;

        let status = response.status();
        let body: TokenResponse = response.json().await?;
        if body.access_token.is_none() {
            warn!(%status, "No access token received");
        }
        Ok(body.access_token)
    }

    async fn userinfo(&self, token: &str) -> AppResult<Option<UserInfo>> {
        let response = self
            .http
            .get(format!("{}/oauth/userinfo", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            s => {
                debug!(status = %s, "userinfo rejected");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth() -> OAuthConfig {
        OAuthConfig {
            client_id: Some("abc".into()),
            client_secret: Some("shh".into()),
            redirect_uri: "http://localhost:3000/api/auth/callback".into(),
            state_secret: "secret".into(),
        }
    }

    #[test]
    fn state_round_trips_and_rejects_foreign_secret() {
        let state = create_state("secret").unwrap();
        assert!(validate_state(&state, "secret").is_ok());
        assert!(validate_state(&state, "other").is_err());
        assert!(validate_state("not-a-jwt", "secret").is_err());
    }

    #[test]
    fn authorize_url_carries_client_scope_and_state() {
        let url = authorize_url("https://huggingface.co", &oauth(), "abc", "xyz").unwrap();
        assert_eq!(url.path(), "/oauth/authorize");
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("client_id".into(), "abc".into())));
        assert!(params.contains(&("scope".into(), OAUTH_SCOPES.into())));
        assert!(params.contains(&("state".into(), "xyz".into())));
        assert!(params.contains(&("prompt".into(), "consent".into())));
    }

    #[test]
    fn session_cookie_is_http_only_and_lax() {
        let cookie = session_cookie("tok".into(), true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
    }
}
