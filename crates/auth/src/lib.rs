//! Identity provider client for r3alm
//!
//! This crate talks to a Supabase GoTrue endpoint: password sign-in,
//! session refresh, profile lookup and sign-out. Every change to the held
//! session is announced on a broadcast stream so that session consumers can
//! follow the provider without polling.

mod error;
mod fetch;
mod provider;
mod types;

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use url::Url;

use crate::fetch::Fetch;

pub use error::AuthError;
pub use provider::IdentityProvider;
pub use types::{AuthChangeEvent, AuthStateChange, Session, UserRecord};

const STATE_CHANGE_CAPACITY: usize = 16;

/// Connection settings for a Supabase project.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub url: Url,
    pub anon_key: String,
}

impl ProviderConfig {
    /// Creates a new configuration, validating the URL.
    pub fn new(url_str: &str, anon_key: String) -> Result<Self, AuthError> {
        let url = Url::parse(url_str)?;
        if anon_key.trim().is_empty() {
            return Err(AuthError::Config("anon_key cannot be empty".to_string()));
        }
        Ok(Self { url, anon_key })
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Result<Self, AuthError> {
        let url_str = std::env::var("SUPABASE_URL").map_err(|_| {
            AuthError::Config("SUPABASE_URL environment variable not found".to_string())
        })?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY").map_err(|_| {
            AuthError::Config("SUPABASE_ANON_KEY environment variable not found".to_string())
        })?;
        Self::new(&url_str, anon_key)
    }
}

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Refresh an expired session transparently inside `get_session`
    pub auto_refresh_token: bool,
    /// Keep the session returned by sign-in for later calls
    pub persist_session: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
            persist_session: true,
        }
    }
}

/// Auth クライアント
pub struct AuthClient {
    url: String,
    key: String,
    http_client: Client,
    options: AuthOptions,
    current_session: Arc<RwLock<Option<Session>>>,
    state_change: broadcast::Sender<AuthStateChange>,
}

impl AuthClient {
    pub fn new(url: &str, key: &str, http_client: Client, options: AuthOptions) -> Self {
        let (state_change, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
            options,
            current_session: Arc::new(RwLock::new(None)),
            state_change,
        }
    }

    pub fn from_config(config: &ProviderConfig, http_client: Client, options: AuthOptions) -> Self {
        Self::new(config.url.as_str(), &config.anon_key, http_client, options)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        log::debug!("Auth state change: {}", event);
        if self
            .state_change
            .send(AuthStateChange::new(event, session))
            .is_err()
        {
            log::trace!("No listeners for auth state change {}", event);
        }
    }

    async fn store_session(&self, session: &Session) {
        if self.options.persist_session {
            *self.current_session.write().await = Some(session.clone());
        }
    }

    async fn access_token(&self) -> Result<String, AuthError> {
        self.current_session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(AuthError::MissingSession)
    }

    /// メール・パスワードでログイン
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let url = self.auth_url("/token?grant_type=password");

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let session = Fetch::post(&self.http_client, &url)
            .header("apikey", &self.key)
            .json(&payload)?
            .execute::<Session>()
            .await?
            .stamp_expiry();

        log::info!("Signed in as {}", session.subject_id());
        self.store_session(&session).await;
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));

        Ok(session)
    }

    /// Install a session obtained elsewhere (OAuth callback, magic link).
    pub async fn set_session(&self, session: Session) {
        let session = session.stamp_expiry();
        *self.current_session.write().await = Some(session.clone());
        self.emit(AuthChangeEvent::SignedIn, Some(session));
    }

    /// The held session, refreshed first when it has expired.
    ///
    /// A refresh rejected by the provider drops the session and reports
    /// `None`; a transient refresh failure is returned as an error.
    pub async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let session = match self.current_session.read().await.clone() {
            Some(session) => session,
            None => return Ok(None),
        };

        if !session.is_expired() || !self.options.auto_refresh_token {
            return Ok(Some(session));
        }

        if session.refresh_token.is_empty() {
            self.clear_session().await;
            return Ok(None);
        }

        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(err) if err.is_recoverable() => Err(err),
            Err(err) => {
                log::warn!("Refresh token rejected, dropping session: {}", err);
                self.clear_session().await;
                Ok(None)
            }
        }
    }

    /// セッションをリフレッシュ
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let refresh_token = self
            .current_session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(AuthError::MissingSession)?;

        let url = self.auth_url("/token?grant_type=refresh_token");

        let payload = serde_json::json!({
            "refresh_token": refresh_token,
        });

        let session = Fetch::post(&self.http_client, &url)
            .header("apikey", &self.key)
            .json(&payload)?
            .execute::<Session>()
            .await?
            .stamp_expiry();

        self.store_session(&session).await;
        self.emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));

        Ok(session)
    }

    /// 現在のユーザーを取得
    pub async fn get_user(&self) -> Result<UserRecord, AuthError> {
        let token = self.access_token().await?;
        let url = self.auth_url("/user");

        Fetch::get(&self.http_client, &url)
            .header("apikey", &self.key)
            .bearer_auth(&token)
            .execute::<UserRecord>()
            .await
    }

    /// Replace the user's metadata (display name, role requests, ...).
    pub async fn update_user_metadata(
        &self,
        data: serde_json::Value,
    ) -> Result<UserRecord, AuthError> {
        let token = self.access_token().await?;
        let url = self.auth_url("/user");

        let user = Fetch::put(&self.http_client, &url)
            .header("apikey", &self.key)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "data": data }))?
            .execute::<UserRecord>()
            .await?;

        let updated = {
            let mut guard = self.current_session.write().await;
            match guard.as_mut() {
                Some(session) => {
                    session.user = user.clone();
                    Some(session.clone())
                }
                None => None,
            }
        };
        self.emit(AuthChangeEvent::UserUpdated, updated);

        Ok(user)
    }

    /// サインアウト
    ///
    /// The local session is dropped whatever the server answers.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(_) => {
                log::debug!("sign_out called without a session");
                return Ok(());
            }
        };

        let url = self.auth_url("/logout");
        let result = Fetch::post(&self.http_client, &url)
            .header("apikey", &self.key)
            .bearer_auth(&token)
            .execute_empty()
            .await;

        if let Err(ref err) = result {
            log::warn!("Remote logout failed, clearing local session anyway: {}", err);
        }
        self.clear_session().await;

        result
    }

    async fn clear_session(&self) {
        let previous = self.current_session.write().await.take();
        if previous.is_some() {
            self.emit(AuthChangeEvent::SignedOut, None);
        }
    }

    /// 認証状態変更の通知を受け取るためのレシーバーを取得
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        self.state_change.subscribe()
    }
}

#[async_trait]
impl IdentityProvider for AuthClient {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        AuthClient::get_session(self).await
    }

    async fn get_user(&self) -> Result<UserRecord, AuthError> {
        AuthClient::get_user(self).await
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        AuthClient::sign_in_with_password(self, email, password).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        AuthClient::sign_out(self).await
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<AuthStateChange> {
        self.on_auth_state_change()
    }
}
