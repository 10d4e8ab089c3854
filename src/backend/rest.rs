use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::query::{Query, ensure_patch};
use super::{AuthApi, TableApi};
use crate::auth::jwt;
use crate::auth::token_store::TokenStore;
use crate::config::Config;
use crate::error::{FALLBACK_MESSAGE, PortalError, PortalResult};
use crate::models::{AuthChange, AuthEvent, AuthIdentity, AuthSession, Credentials};

const EVENT_CAPACITY: usize = 32;

/// Session payload returned by the token and signup endpoints.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthIdentity,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| Utc::now().timestamp() + secs));
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// HTTP client for the hosted auth (`/auth/v1`) and table (`/rest/v1`) APIs.
pub struct RestBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    session: Mutex<Option<AuthSession>>,
    store: TokenStore,
    events: broadcast::Sender<AuthEvent>,
}

impl RestBackend {
    /// Builds the client and restores a previously saved session, if any.
    pub async fn connect(config: &Config) -> PortalResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("portal/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let store = TokenStore::new(&config.session_file);
        let restored = match store.load().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not read saved session");
                None
            }
        };
        if let Some(session) = &restored {
            info!(user_id = %session.user.id, "Restored saved session");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            http,
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone(),
            session: Mutex::new(restored),
            store,
            events,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Attaches the API key and the best bearer token available, renewing an
    /// expired access token first.
    async fn authorized(&self, req: RequestBuilder) -> PortalResult<RequestBuilder> {
        let bearer = match self.current_session().await? {
            Some(session) => session.access_token,
            None => self.anon_key.clone(),
        };
        Ok(req.header("apikey", &self.anon_key).bearer_auth(bearer))
    }

    /// The stored session, refreshed when its access token has lapsed. A
    /// rejected refresh token drops the session.
    async fn current_session(&self) -> PortalResult<Option<AuthSession>> {
        let current = self.session.lock().clone();
        let Some(session) = current else {
            return Ok(None);
        };

        if !jwt::is_expired(&session, Utc::now().timestamp()) {
            return Ok(Some(session));
        }

        debug!(user_id = %session.user.id, "Access token expired, refreshing");
        match self.refresh(&session.refresh_token).await {
            Ok(renewed) => Ok(Some(renewed)),
            Err(PortalError::Auth(message)) => {
                info!(%message, "Refresh rejected, session dropped");
                self.drop_session().await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn store_session(&self, session: AuthSession, change: AuthChange) {
        *self.session.lock() = Some(session.clone());
        if let Err(e) = self.store.save(&session).await {
            warn!(error = %e, "Failed to persist session");
        }
        let _ = self.events.send(AuthEvent {
            change,
            session: Some(session),
        });
    }

    async fn drop_session(&self) {
        *self.session.lock() = None;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear saved session");
        }
        let _ = self.events.send(AuthEvent {
            change: AuthChange::SignedOut,
            session: None,
        });
    }

    #[instrument(name = "auth_refresh", skip_all)]
    async fn refresh(&self, refresh_token: &str) -> PortalResult<AuthSession> {
        let resp = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let token: TokenResponse = auth_checked(resp).await?.json().await?;
        let session = token.into_session();
        self.store_session(session.clone(), AuthChange::TokenRefreshed).await;
        debug!(user_id = %session.user.id, "Session refreshed");
        Ok(session)
    }
}

#[async_trait]
impl AuthApi for RestBackend {
    async fn get_session(&self) -> PortalResult<Option<AuthSession>> {
        self.current_session().await
    }

    #[instrument(name = "auth_sign_up", skip_all, fields(email = %credentials.email))]
    async fn sign_up(&self, credentials: &Credentials) -> PortalResult<Option<AuthIdentity>> {
        let resp = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(credentials)
            .send()
            .await?;

        let body: Value = auth_checked(resp).await?.json().await?;

        // With email confirmation off the provider answers with a full session,
        // otherwise with the bare user object.
        if body.get("access_token").is_some() {
            let token: TokenResponse =
                serde_json::from_value(body).map_err(|e| PortalError::decode("session", e))?;
            let session = token.into_session();
            let identity = session.user.clone();
            self.store_session(session, AuthChange::SignedIn).await;
            return Ok(Some(identity));
        }

        let user = match body.get("user") {
            Some(user) => user.clone(),
            None => body,
        };
        if user.get("id").is_none() {
            return Ok(None);
        }
        serde_json::from_value(user)
            .map(Some)
            .map_err(|e| PortalError::decode("user", e))
    }

    #[instrument(name = "auth_sign_in", skip_all, fields(email = %credentials.email))]
    async fn sign_in_with_password(&self, credentials: &Credentials) -> PortalResult<AuthSession> {
        let resp = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(credentials)
            .send()
            .await?;

        let token: TokenResponse = auth_checked(resp).await?.json().await?;
        let session = token.into_session();
        self.store_session(session.clone(), AuthChange::SignedIn).await;
        Ok(session)
    }

    async fn sign_out(&self) -> PortalResult<()> {
        let token = self.session.lock().as_ref().map(|s| s.access_token.clone());

        // local state goes first so a failed call still leaves us signed out
        self.drop_session().await;

        let Some(token) = token else {
            return Ok(());
        };
        let resp = self
            .http
            .post(self.auth_url("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;
        auth_checked(resp).await?;
        Ok(())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl TableApi for RestBackend {
    async fn select(&self, query: &Query) -> PortalResult<Vec<Value>> {
        let req = self.http.get(self.rest_url(&query.table)).query(&query.to_params());
        let resp = self.authorized(req).await?.send().await?;
        let rows = api_checked(resp).await?.json().await?;
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> PortalResult<Value> {
        let req = self
            .http
            .post(self.rest_url(table))
            .header("Prefer", "return=representation")
            .json(&json!([row]));
        let resp = self.authorized(req).await?.send().await?;
        let rows: Vec<Value> = api_checked(resp).await?.json().await?;

        rows.into_iter().next().ok_or_else(|| {
            error!(table, "Insert returned no row");
            PortalError::InvalidState(format!("insert into {table} returned no row"))
        })
    }

    async fn update(&self, query: &Query, patch: Value) -> PortalResult<Option<Value>> {
        ensure_patch(&patch)?;
        let req = self
            .http
            .patch(self.rest_url(&query.table))
            .query(&query.filter_params())
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.authorized(req).await?.send().await?;
        let rows: Vec<Value> = api_checked(resp).await?.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn delete(&self, query: &Query) -> PortalResult<()> {
        let req = self
            .http
            .delete(self.rest_url(&query.table))
            .query(&query.filter_params());
        let resp = self.authorized(req).await?.send().await?;
        api_checked(resp).await?;
        Ok(())
    }
}

/// Pulls the most specific human-readable text out of an error body.
fn error_message(body: &str) -> (String, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        let text = body.trim();
        let message = if text.is_empty() { FALLBACK_MESSAGE } else { text };
        return (message.to_string(), None);
    };

    let message = ["msg", "error_description", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or(FALLBACK_MESSAGE)
        .to_string();

    let code = ["error_code", "code"].iter().find_map(|key| match value.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    });

    (message, code)
}

async fn api_checked(resp: Response) -> PortalResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let (message, code) = error_message(&body);
    warn!(status = status.as_u16(), %message, "Table request failed");
    Err(PortalError::Api {
        status: status.as_u16(),
        message,
        code,
    })
}

/// Auth endpoints report bad credentials as 4xx; those become `Auth` errors.
async fn auth_checked(resp: Response) -> PortalResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let (message, code) = error_message(&body);
    if status.is_client_error() {
        info!(status = status.as_u16(), %message, "Auth request rejected");
        return Err(PortalError::Auth(message));
    }
    error!(status = status.as_u16(), %message, "Auth request failed");
    Err(PortalError::Api {
        status: status.as_u16(),
        message,
        code,
    })
}
