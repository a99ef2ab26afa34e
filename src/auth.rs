//! Sign-in against the remote auth service.
//!
//! The UI obtains a Facebook or GitHub OAuth access token through the vendor
//! SDK; this module exchanges it for an [`Identity`] with an auth service
//! speaking the identity-toolkit REST dialect and installs it in the
//! [`Session`]. The OAuth protocol itself never runs here.

use chrono::{DateTime, Duration, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::AuthConfig;
use crate::error::{Result, SyncError};
use crate::session::{Identity, IdentityProvider, Session};

#[derive(Debug, Clone)]
pub struct Tokens {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Grant {
    pub identity: Identity,
    pub tokens: Tokens,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

#[derive(Deserialize, Debug)]
struct RefreshResponse {
    user_id: String,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

fn expiry(expires_in: Option<&str>) -> DateTime<Utc> {
    let secs = expires_in.and_then(|s| s.parse::<i64>().ok()).unwrap_or(3600);
    Utc::now() + Duration::seconds(secs)
}

fn grant_from(resp: SignInResponse, requested: IdentityProvider) -> Grant {
    let provider = match resp.provider_id.as_deref() {
        Some("facebook.com") => Some(IdentityProvider::Facebook),
        Some("github.com") => Some(IdentityProvider::Github),
        Some(_) => Some(requested),
        None => None,
    };
    Grant {
        identity: Identity {
            uid: resp.local_id,
            anonymous: resp.is_anonymous || provider.is_none(),
            provider,
            display_name: resp.display_name,
            photo_url: resp.photo_url,
        },
        tokens: Tokens {
            expires_at: expiry(resp.expires_in.as_deref()),
            id_token: resp.id_token,
            refresh_token: resp.refresh_token,
        },
    }
}

/// Form-encoded credential for `signInWithIdp`.
fn idp_post_body(provider: IdentityProvider, access_token: &str) -> String {
    format!(
        "access_token={}&providerId={}",
        utf8_percent_encode(access_token, NON_ALPHANUMERIC),
        utf8_percent_encode(provider.provider_id(), NON_ALPHANUMERIC),
    )
}

fn facebook_photo(me: &Value) -> Option<String> {
    me.pointer("/picture/data/url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn github_photo(user: &Value) -> Option<String> {
    user.get("avatar_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

pub struct AuthClient {
    http: reqwest::Client,
    config: AuthConfig,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("coursesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    pub async fn sign_in_with_idp(&self, provider: IdentityProvider, access_token: &str) -> Result<Grant> {
        let url = format!(
            "{}/v1/accounts:signInWithIdp?key={}",
            self.config.base_url, self.config.api_key
        );
        let body = json!({
            "postBody": idp_post_body(provider, access_token),
            "requestUri": self.config.request_uri,
            "returnSecureToken": true,
            "returnIdpCredential": true,
        });
        let resp: SignInResponse = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(grant_from(resp, provider))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<(String, Tokens)> {
        let url = format!("{}/v1/token?key={}", self.config.token_url, self.config.api_key);
        let resp: RefreshResponse = self
            .http
            .post(url)
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let tokens = Tokens {
            expires_at: expiry(resp.expires_in.as_deref()),
            id_token: resp.id_token,
            refresh_token: resp.refresh_token,
        };
        Ok((resp.user_id, tokens))
    }

    /// Large profile picture from the provider. Best effort: any failure
    /// is logged and yields `None`.
    pub async fn fetch_profile_photo(&self, provider: IdentityProvider, access_token: &str) -> Option<String> {
        let request = match provider {
            IdentityProvider::Facebook => self
                .http
                .get(format!("{}/me", self.config.facebook_graph_url))
                .query(&[
                    ("fields", "id,name,picture.type(large)"),
                    ("access_token", access_token),
                ]),
            IdentityProvider::Github => self
                .http
                .get(format!("{}/user", self.config.github_api_url))
                .bearer_auth(access_token),
        };

        let fetched = async move {
            let resp = request.send().await?.error_for_status()?;
            resp.json::<Value>().await
        }
        .await;

        match fetched {
            Ok(profile) => {
                let photo = match provider {
                    IdentityProvider::Facebook => facebook_photo(&profile),
                    IdentityProvider::Github => github_photo(&profile),
                };
                tracing::debug!(?provider, photo = ?photo, "profile photo lookup");
                photo
            }
            Err(e) => {
                tracing::warn!(?provider, error = %e, "profile photo lookup failed");
                None
            }
        }
    }

    /// Stores the photo on the auth-service profile. Best effort.
    pub async fn update_photo(&self, id_token: &str, photo_url: &str) {
        let url = format!("{}/v1/accounts:update?key={}", self.config.base_url, self.config.api_key);
        let body = json!({ "idToken": id_token, "photoUrl": photo_url, "returnSecureToken": false });
        let sent = async move { self.http.post(url).json(&body).send().await?.error_for_status() }.await;
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to update profile photo");
        }
    }
}

/// Drives sign-in, token refresh and sign-out for one [`Session`].
pub struct Authenticator {
    client: AuthClient,
    session: Session,
    tokens: Mutex<Option<Tokens>>,
}

impl Authenticator {
    pub fn new(client: AuthClient, session: Session) -> Self {
        Self {
            client,
            session,
            tokens: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn sign_in(&self, provider: IdentityProvider, access_token: &str) -> Result<Identity> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(SyncError::Validation("access token must not be blank".into()));
        }

        let Grant { mut identity, tokens } = self.client.sign_in_with_idp(provider, access_token).await?;

        if !identity.anonymous {
            if let Some(photo) = self.client.fetch_profile_photo(provider, access_token).await {
                if identity.photo_url.as_deref() != Some(photo.as_str()) {
                    self.client.update_photo(&tokens.id_token, &photo).await;
                }
                identity.photo_url = Some(photo);
            }
        }

        self.session.establish(identity.clone())?;
        *self.tokens.lock().await = Some(tokens);
        Ok(identity)
    }

    pub async fn refresh(&self) -> Result<Identity> {
        let mut tokens = self.tokens.lock().await;
        let refresh_token = tokens
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .ok_or(SyncError::NotAuthenticated)?;
        let current = self.session.current().ok_or(SyncError::NotAuthenticated)?;

        let (uid, fresh) = self.client.refresh(&refresh_token).await?;
        let identity = Identity { uid, ..current };
        self.session.refresh(identity.clone())?;
        *tokens = Some(fresh);
        Ok(identity)
    }

    pub async fn sign_out(&self) {
        *self.tokens.lock().await = None;
        self.session.sign_out();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use std::sync::Arc;

    /// Requests seen by the stub auth service: (path, body).
    #[derive(Clone, Default)]
    struct Seen(Arc<std::sync::Mutex<Vec<(String, String)>>>);

    impl Seen {
        fn body_for(&self, path: &str) -> Option<String> {
            let seen = self.0.lock().unwrap();
            seen.iter().find(|(p, _)| p == path).map(|(_, b)| b.clone())
        }
    }

    async fn stub(State(seen): State<Seen>, uri: Uri, body: String) -> Response {
        let path = uri.path().to_string();
        seen.0.lock().unwrap().push((path.clone(), body.clone()));
        match path.as_str() {
            "/v1/accounts:signInWithIdp" => {
                let req: Value = serde_json::from_str(&body).unwrap();
                let post = req["postBody"].as_str().unwrap_or_default();
                if post.starts_with("access_token=expired") {
                    let err = json!({ "error": { "message": "INVALID_IDP_RESPONSE" } });
                    return (StatusCode::BAD_REQUEST, Json(err)).into_response();
                }
                if post.starts_with("access_token=guest") {
                    return Json(json!({
                        "localId": "anon-1",
                        "idToken": "id-anon",
                        "refreshToken": "r-anon",
                        "isAnonymous": true,
                    }))
                    .into_response();
                }
                Json(json!({
                    "localId": "gh-42",
                    "idToken": "id-1",
                    "refreshToken": "r-1",
                    "expiresIn": "3600",
                    "providerId": "github.com",
                    "displayName": "Ada",
                }))
                .into_response()
            }
            "/v1/token" => Json(json!({
                "user_id": "gh-42",
                "id_token": "id-2",
                "refresh_token": "r-2",
                "expires_in": "3600",
            }))
            .into_response(),
            "/user" => Json(json!({ "login": "ada", "avatar_url": "https://avatars.example/gh-42.png" }))
                .into_response(),
            "/v1/accounts:update" => Json(json!({ "localId": "gh-42" })).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn stub_service() -> (AuthConfig, Seen) {
        let seen = Seen::default();
        let app = Router::new().fallback(stub).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let base = format!("http://{addr}");
        let config = AuthConfig {
            base_url: base.clone(),
            token_url: base.clone(),
            api_key: "k".into(),
            request_uri: "http://localhost".into(),
            facebook_graph_url: base.clone(),
            github_api_url: base,
        };
        (config, seen)
    }

    fn sign_in_response(provider_id: Option<&str>, anonymous: bool) -> SignInResponse {
        serde_json::from_value(json!({
            "localId": "uid-1",
            "idToken": "id",
            "refreshToken": "refresh",
            "expiresIn": "3600",
            "providerId": provider_id,
            "displayName": "Ada",
            "isAnonymous": anonymous,
        }))
        .unwrap()
    }

    fn offline_config() -> AuthConfig {
        AuthConfig {
            base_url: "http://127.0.0.1:9".into(),
            token_url: "http://127.0.0.1:9".into(),
            api_key: "k".into(),
            request_uri: "http://localhost".into(),
            facebook_graph_url: "http://127.0.0.1:9".into(),
            github_api_url: "http://127.0.0.1:9".into(),
        }
    }

    #[test]
    fn grant_maps_provider_and_profile() {
        let grant = grant_from(sign_in_response(Some("github.com"), false), IdentityProvider::Facebook);
        assert_eq!(grant.identity.uid, "uid-1");
        assert_eq!(grant.identity.provider, Some(IdentityProvider::Github));
        assert!(!grant.identity.anonymous);
        assert_eq!(grant.identity.display_name.as_deref(), Some("Ada"));
        assert_eq!(grant.tokens.refresh_token, "refresh");
        assert!(grant.tokens.expires_at > Utc::now());
    }

    #[test]
    fn grant_without_provider_is_anonymous() {
        let grant = grant_from(sign_in_response(None, false), IdentityProvider::Github);
        assert!(grant.identity.anonymous);
        let grant = grant_from(sign_in_response(Some("facebook.com"), true), IdentityProvider::Facebook);
        assert!(grant.identity.anonymous);
    }

    #[test]
    fn photo_extraction() {
        let me = json!({ "id": "1", "picture": { "data": { "url": "https://fb/p.jpg" } } });
        assert_eq!(facebook_photo(&me).as_deref(), Some("https://fb/p.jpg"));
        assert_eq!(facebook_photo(&json!({ "id": "1" })), None);

        assert_eq!(
            github_photo(&json!({ "avatar_url": "https://gh/a.png" })).as_deref(),
            Some("https://gh/a.png")
        );
        assert_eq!(github_photo(&json!({ "avatar_url": "" })), None);
    }

    #[tokio::test]
    async fn blank_token_is_rejected_before_any_request() {
        let auth = Authenticator::new(AuthClient::new(offline_config()).unwrap(), Session::new());
        let err = auth.sign_in(IdentityProvider::Facebook, "   ").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn photo_lookup_degrades_to_none() {
        let client = AuthClient::new(offline_config()).unwrap();
        assert_eq!(client.fetch_profile_photo(IdentityProvider::Github, "t").await, None);
    }

    #[tokio::test]
    async fn refresh_without_sign_in() {
        let auth = Authenticator::new(AuthClient::new(offline_config()).unwrap(), Session::new());
        assert_eq!(auth.refresh().await.unwrap_err(), SyncError::NotAuthenticated);
    }

    #[test]
    fn post_body_is_form_encoded() {
        assert_eq!(
            idp_post_body(IdentityProvider::Github, "a&b=c d"),
            "access_token=a%26b%3Dc%20d&providerId=github%2Ecom"
        );
    }

    #[tokio::test]
    async fn sign_in_installs_identity_with_photo() {
        let (config, seen) = stub_service().await;
        let session = Session::new();
        let auth = Authenticator::new(AuthClient::new(config).unwrap(), session.clone());

        let identity = auth.sign_in(IdentityProvider::Github, "gho_abc").await.unwrap();
        assert_eq!(identity.uid, "gh-42");
        assert_eq!(identity.provider, Some(IdentityProvider::Github));
        assert!(!identity.anonymous);
        assert_eq!(identity.photo_url.as_deref(), Some("https://avatars.example/gh-42.png"));
        assert_eq!(session.current(), Some(identity));

        let update = seen.body_for("/v1/accounts:update").unwrap();
        assert!(update.contains("https://avatars.example/gh-42.png"));
        assert!(update.contains("id-1"));
    }

    #[tokio::test]
    async fn anonymous_grant_forces_sign_out() {
        let (config, seen) = stub_service().await;
        let session = Session::new();
        session
            .establish(Identity {
                uid: "u0".into(),
                provider: Some(IdentityProvider::Facebook),
                anonymous: false,
                display_name: None,
                photo_url: None,
            })
            .unwrap();
        let auth = Authenticator::new(AuthClient::new(config).unwrap(), session.clone());

        let err = auth.sign_in(IdentityProvider::Github, "guest").await.unwrap_err();
        assert_eq!(err, SyncError::NotAuthenticated);
        assert_eq!(session.current(), None);
        // no profile enrichment for a rejected identity
        assert!(seen.body_for("/user").is_none());
        assert_eq!(auth.refresh().await.unwrap_err(), SyncError::NotAuthenticated);
    }

    #[tokio::test]
    async fn refresh_keeps_the_signed_in_user() {
        let (config, seen) = stub_service().await;
        let session = Session::new();
        let auth = Authenticator::new(AuthClient::new(config).unwrap(), session.clone());
        let signed_in = auth.sign_in(IdentityProvider::Github, "gho_abc").await.unwrap();
        let mut events = session.events();

        let refreshed = auth.refresh().await.unwrap();
        assert_eq!(refreshed, signed_in);
        assert_eq!(
            events.try_recv().unwrap(),
            crate::session::SessionEvent::TokenRefreshed(refreshed)
        );
        let form = seen.body_for("/v1/token").unwrap();
        assert!(form.contains("refresh_token=r-1"));
    }

    #[tokio::test]
    async fn refused_credential_is_not_authenticated() {
        let (config, _) = stub_service().await;
        let session = Session::new();
        let auth = Authenticator::new(AuthClient::new(config).unwrap(), session.clone());

        let err = auth.sign_in(IdentityProvider::Facebook, "expired").await.unwrap_err();
        assert_eq!(err, SyncError::NotAuthenticated);
        assert_eq!(session.current(), None);
    }
}
