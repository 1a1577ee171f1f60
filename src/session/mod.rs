//! Session management
//!
//! [`SessionManager`] binds a [`TokenManager`]'s tokens to an HTTP session.
//! Depending on [`SessionMode`] the tokens are kept in a server-side
//! [`SessionStore`] keyed by a session cookie, handed to the client as a
//! cookie or JSON body, or both.
//!
//! Each manager owns at most one refresh timer. Arming a new timer cancels
//! the previous one, and a timer that fires detaches itself before it runs
//! the refresh, so a [`SessionManager::stop`] issued from inside the refresh
//! cannot abort it.
//!
//! A timer-driven refresh has no request to answer, so it only persists the
//! new tokens into the server store. In `client` and `hybrid` mode the
//! refreshed tokens reach the client on the next [`SessionManager::update`]
//! for that client's request.
//!
//! # Session lifecycle
//!
//! ```text
//! NoSession -> Active(scheduled) -> Refreshing -> Active | Terminated
//! ```

pub mod context;
pub mod store;
pub mod timer;

pub use context::{SessionContext, SessionData};
pub use store::{MemorySessionStore, SessionStore};
pub use timer::{ManualTimer, Timer, TimerHandle, TokioTimer};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use base64::Engine as _;
use subtle::ConstantTimeEq as _;

use crate::config::{ClientStorage, SessionConfig, SessionMode};
use crate::error::{OidcError, Result};
use crate::oidc::jwt::Claims;
use crate::oidc::random_token;
use crate::oidc::tokens::{TokenManager, TokenSet};

/// Error message when a session is started without tokens.
pub const NO_TOKENS_MESSAGE: &str = "No tokens available to create a session.";

#[derive(Debug, Default)]
struct SessionState {
    sid: Option<String>,
    timer: Option<TimerHandle>,
    // Bumped whenever the armed timer changes; a stale timer does nothing.
    generation: u64,
}

/// Creates, resumes, refreshes and ends sessions.
pub struct SessionManager {
    config: SessionConfig,
    tokens: Arc<TokenManager>,
    store: Arc<dyn SessionStore>,
    timer: Arc<dyn Timer>,
    me: Weak<SessionManager>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("mode", &self.config.mode)
            .field("has_sid", &self.sid().is_some())
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a session manager.
    ///
    /// # Arguments
    ///
    /// * `config` - Session settings
    /// * `tokens` - Token manager whose tokens back the session
    /// * `store` - Server-side storage, used in `server` and `hybrid` mode
    /// * `timer` - Timer used for scheduled refreshes
    pub fn new(
        config: SessionConfig,
        tokens: Arc<TokenManager>,
        store: Arc<dyn SessionStore>,
        timer: Arc<dyn Timer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            tokens,
            store,
            timer,
            me: me.clone(),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Creates a session manager with an in-memory store and tokio timers.
    pub fn in_memory(config: SessionConfig, tokens: Arc<TokenManager>) -> Arc<Self> {
        let ttl = Duration::from_secs(config.ttl);
        let store = Arc::new(MemorySessionStore::new(tokens.clock().clone(), ttl));
        Self::new(config, tokens, store, Arc::new(TokioTimer))
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The current session id, if a server-side session is active.
    pub fn sid(&self) -> Option<String> {
        self.lock().sid.clone()
    }

    /// True while a refresh timer is armed.
    pub fn has_pending_refresh(&self) -> bool {
        self.lock().timer.is_some()
    }

    // -----------------------------------------------------------------------
    // Start / update
    // -----------------------------------------------------------------------

    /// Resumes or creates the session for `ctx`.
    ///
    /// In `server` mode an existing session named by the session cookie is
    /// resumed and its tokens adopted; a cookie naming no session is
    /// cleared and a new session is created from the current tokens. In
    /// `client` mode the tokens are exposed to the client. `hybrid` does
    /// both.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::NoTokensAvailable`] when a server-side session
    /// must be created and the token manager holds no tokens.
    pub async fn start(&self, ctx: &mut SessionContext) -> Result<()> {
        if self.config.mode.uses_server_store() {
            self.start_server(ctx).await?;
        }
        if self.config.mode.exposes_to_client() {
            self.start_client(ctx).await?;
        }
        Ok(())
    }

    /// Re-saves the token manager's current tokens into the session.
    pub async fn update(&self, ctx: &mut SessionContext) -> Result<()> {
        let tokens = self.tokens.get_tokens().ok_or_else(|| {
            OidcError::NoTokensAvailable("No tokens available to update the session.".to_string())
        })?;
        self.save(ctx, tokens).await
    }

    /// Saves `tokens` (e.g. from a silent renew) into the session.
    ///
    /// The tokens become the token manager's current set. Client modes
    /// re-expose them; server modes merge them into the existing session or
    /// create one when none exists.
    pub async fn save(&self, ctx: &mut SessionContext, tokens: TokenSet) -> Result<()> {
        self.tokens.set_tokens(tokens.clone());

        if self.config.mode.exposes_to_client() {
            self.expose_tokens(ctx, &tokens)?;
        }

        if self.config.mode.uses_server_store() {
            let sid = ctx
                .request_cookie(&self.config.cookie_name)
                .map(str::to_string)
                .or_else(|| self.sid());
            let existing = match &sid {
                Some(sid) => self.store.get(sid).await?,
                None => None,
            };

            match (sid, existing) {
                (Some(sid), Some(mut data)) => {
                    data.tokens = tokens.clone();
                    data.expires_at = self.tokens.expires_at();
                    if let Some(user) = self.fetch_user(&tokens).await {
                        data.user = Some(user);
                    }
                    self.store.touch(&sid, data.clone()).await?;
                    ctx.session = Some(data);
                    self.lock().sid = Some(sid);
                    tracing::debug!("Session updated with new tokens");
                }
                _ => {
                    self.create_session(ctx).await?;
                    return Ok(());
                }
            }
        }

        self.schedule_token_refresh();
        Ok(())
    }

    async fn start_server(&self, ctx: &mut SessionContext) -> Result<()> {
        let cookie_name = self.config.cookie_name.clone();
        if let Some(sid) = ctx.request_cookie(&cookie_name).map(str::to_string) {
            match self.store.get(&sid).await? {
                Some(data) => {
                    self.tokens.restore_tokens(data.tokens.clone(), data.expires_at);
                    ctx.session = Some(data);
                    self.lock().sid = Some(sid);
                    self.schedule_token_refresh();
                    tracing::debug!("Resumed existing session");
                    return Ok(());
                }
                None => {
                    tracing::debug!("Session cookie names no session, clearing it");
                    ctx.clear_cookie(&self.config, &cookie_name);
                }
            }
        }

        self.create_session(ctx).await
    }

    async fn create_session(&self, ctx: &mut SessionContext) -> Result<()> {
        let tokens = self
            .tokens
            .get_tokens()
            .ok_or_else(|| OidcError::NoTokensAvailable(NO_TOKENS_MESSAGE.to_string()))?;

        let user = self.fetch_user(&tokens).await;
        let csrf_token = random_token(32);
        let data = SessionData {
            tokens,
            user,
            csrf_token: Some(csrf_token.clone()),
            expires_at: self.tokens.expires_at(),
        };

        let sid = self.store.set(data.clone()).await?;
        ctx.set_cookie(&self.config, &self.config.cookie_name, sid.clone());
        ctx.set_cookie(&self.config, &self.config.csrf_cookie_name, csrf_token);
        ctx.session = Some(data);
        self.lock().sid = Some(sid);

        self.schedule_token_refresh();
        tracing::info!("Session created");
        Ok(())
    }

    async fn start_client(&self, ctx: &mut SessionContext) -> Result<()> {
        let Some(tokens) = self.tokens.get_tokens() else {
            tracing::warn!("No tokens available to expose to the client");
            return Ok(());
        };

        self.expose_tokens(ctx, &tokens)?;

        let has_user = ctx.session.as_ref().is_some_and(|s| s.user.is_some());
        if !has_user {
            if let Some(user) = self.fetch_user(&tokens).await {
                ctx.session
                    .get_or_insert_with(|| SessionData::new(tokens.clone()))
                    .user = Some(user);
            }
        }

        self.schedule_token_refresh();
        Ok(())
    }

    fn expose_tokens(&self, ctx: &mut SessionContext, tokens: &TokenSet) -> Result<()> {
        match self.config.client_storage {
            ClientStorage::Cookie => {
                let json = serde_json::to_vec(tokens)?;
                let value = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
                ctx.set_cookie(&self.config, &self.config.token_cookie_name, value);
            }
            ClientStorage::Json => {
                ctx.response_body = Some(serde_json::to_value(tokens)?);
            }
        }
        Ok(())
    }

    async fn fetch_user(&self, tokens: &TokenSet) -> Option<Claims> {
        if !self.config.fetch_user_info {
            return None;
        }
        match self
            .tokens
            .user_info()
            .get_user_info(&tokens.access_token)
            .await
        {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("Failed to fetch user info: {}", e);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Refresh scheduling
    // -----------------------------------------------------------------------

    /// Arms the refresh timer for the current tokens.
    ///
    /// The delay is the access token's remaining lifetime minus
    /// `refresh_threshold_ms`, floored at zero; an already expired token is
    /// refreshed immediately. Any previously armed timer is cancelled first.
    ///
    /// # Returns
    ///
    /// The armed delay, or `None` when the tokens carry no `expires_in`.
    pub fn schedule_token_refresh(&self) -> Option<Duration> {
        let expires_in = self.tokens.get_tokens().and_then(|t| t.expires_in);
        let remaining_ms = match (self.tokens.expires_at(), expires_in) {
            (Some(at), _) => {
                let left = at - self.tokens.clock().now();
                u64::try_from(left.num_milliseconds()).unwrap_or(0)
            }
            (None, Some(secs)) => secs.saturating_mul(1000),
            (None, None) => {
                tracing::debug!("Tokens carry no expires_in, refresh not scheduled");
                return None;
            }
        };
        let delay =
            Duration::from_millis(remaining_ms.saturating_sub(self.config.refresh_threshold_ms));

        let mut state = self.lock();
        if let Some(previous) = state.timer.take() {
            previous.cancel();
        }
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;

        let me = self.me.clone();
        let task = Box::pin(async move {
            if let Some(manager) = me.upgrade() {
                manager.on_timer(generation).await;
            }
        });
        state.timer = Some(self.timer.arm(delay, task));
        tracing::debug!("Token refresh scheduled in {}ms", delay.as_millis());
        Some(delay)
    }

    async fn on_timer(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            // Detach: the handle is dropped, not cancelled.
            state.timer = None;
        }
        // Failures are logged and end the session inside refresh_token.
        let _ = self.refresh_token().await;
    }

    /// Refreshes the tokens and persists them into the session.
    ///
    /// On success the refresh is rescheduled. On failure the session is
    /// stopped and the error returned. Client-held tokens are not touched;
    /// call [`Self::update`] with the client's next request to re-expose
    /// them.
    pub async fn refresh_token(&self) -> Result<TokenSet> {
        match self.tokens.refresh_access_token().await {
            Ok(tokens) => {
                self.persist(&tokens).await?;
                self.schedule_token_refresh();
                Ok(tokens)
            }
            Err(e) => {
                tracing::error!("Token refresh failed, ending session: {}", e);
                if let Err(stop_err) = self.stop().await {
                    tracing::warn!("Failed to stop session after refresh failure: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, tokens: &TokenSet) -> Result<()> {
        let Some(sid) = self.sid() else {
            return Ok(());
        };
        let mut data = match self.store.get(&sid).await? {
            Some(mut data) => {
                data.tokens = tokens.clone();
                data
            }
            None => SessionData::new(tokens.clone()),
        };
        data.expires_at = self.tokens.expires_at();
        self.store.touch(&sid, data).await
    }

    /// Ends the session: cancels the timer and destroys the stored entry.
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (timer, sid) = {
            let mut state = self.lock();
            state.generation = state.generation.wrapping_add(1);
            (state.timer.take(), state.sid.take())
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(sid) = sid {
            self.store.destroy(&sid).await?;
            tracing::info!("Session stopped");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CSRF
    // -----------------------------------------------------------------------

    /// Checks `submitted` against the session's CSRF token.
    ///
    /// Uses the session bound to `ctx`, or loads it by the session cookie.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Csrf`] when no token is known or they differ.
    pub async fn validate_csrf(&self, ctx: &SessionContext, submitted: &str) -> Result<()> {
        let expected = match ctx.session.as_ref().and_then(|s| s.csrf_token.clone()) {
            Some(token) => Some(token),
            None => match ctx.request_cookie(&self.config.cookie_name) {
                Some(sid) => self.store.get(sid).await?.and_then(|s| s.csrf_token),
                None => None,
            },
        };

        let Some(expected) = expected else {
            return Err(OidcError::Csrf("session has no CSRF token".to_string()).into());
        };
        if bool::from(expected.as_bytes().ct_eq(submitted.as_bytes())) {
            Ok(())
        } else {
            Err(OidcError::Csrf("CSRF token mismatch".to_string()).into())
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClientConfig;
    use crate::error::error_code;
    use crate::oidc::discovery::{ClientMetadata, StaticIssuer};
    use crate::oidc::userinfo::UserInfo;
    use async_trait::async_trait;

    struct NoUserInfo;

    #[async_trait]
    impl UserInfo for NoUserInfo {
        async fn get_user_info(&self, _access_token: &str) -> Result<Claims> {
            Err(OidcError::UserInfo("unavailable".to_string()).into())
        }
    }

    fn setup(mode: SessionMode) -> (Arc<SessionManager>, Arc<TokenManager>, Arc<ManualTimer>) {
        setup_with(SessionConfig {
            mode,
            ..SessionConfig::default()
        })
    }

    fn setup_with(
        config: SessionConfig,
    ) -> (Arc<SessionManager>, Arc<TokenManager>, Arc<ManualTimer>) {
        let clock = Arc::new(ManualClock::new());
        let issuer = Arc::new(StaticIssuer::new(ClientMetadata::for_issuer(
            "https://id.example.com",
        )));
        let tokens = Arc::new(
            TokenManager::new(
                ClientConfig::new("https://id.example.com", "app"),
                reqwest::Client::new(),
                issuer,
            )
            .unwrap()
            .with_clock(clock.clone())
            .with_user_info(Arc::new(NoUserInfo)),
        );
        let store = Arc::new(MemorySessionStore::new(clock, Duration::from_secs(3600)));
        let timer = Arc::new(ManualTimer::new());
        let manager = SessionManager::new(config, tokens.clone(), store, timer.clone());
        (manager, tokens, timer)
    }

    fn expiring(secs: u64) -> TokenSet {
        let mut tokens = TokenSet::bearer("at");
        tokens.expires_in = Some(secs);
        tokens
    }

    #[tokio::test]
    async fn test_start_without_tokens_fails_with_message() {
        let (manager, _, _) = setup(SessionMode::Server);
        let mut ctx = SessionContext::new();
        let err = manager.start(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), NO_TOKENS_MESSAGE);
        assert_eq!(error_code(&err), Some("NO_TOKENS_AVAILABLE"));
    }

    #[tokio::test]
    async fn test_start_creates_session_and_schedules_refresh() {
        let (manager, tokens, timer) = setup(SessionMode::Server);
        tokens.set_tokens(expiring(120));

        let mut ctx = SessionContext::new();
        manager.start(&mut ctx).await.unwrap();

        let sid = manager.sid().expect("sid");
        assert_eq!(ctx.response_cookie("sid").unwrap().value(), sid);
        let csrf = ctx.response_cookie("csrf_token").unwrap().value().to_string();
        assert_eq!(ctx.session.as_ref().unwrap().csrf_token.as_deref(), Some(csrf.as_str()));
        assert!(ctx.session.as_ref().unwrap().user.is_none());
        assert_eq!(timer.delays(), vec![Duration::from_millis(60000)]);
        manager.validate_csrf(&ctx, &csrf).await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_floors_at_zero_and_keeps_one_timer() {
        let (manager, tokens, timer) = setup(SessionMode::Server);
        tokens.set_tokens(expiring(30));
        assert_eq!(manager.schedule_token_refresh(), Some(Duration::ZERO));
        tokens.set_tokens(expiring(120));
        manager.schedule_token_refresh();
        assert_eq!(timer.pending(), 1);
    }

    #[tokio::test]
    async fn test_schedule_skips_without_expiry() {
        let (manager, tokens, timer) = setup(SessionMode::Client);
        tokens.set_tokens(TokenSet::bearer("at"));
        assert!(manager.schedule_token_refresh().is_none());
        assert!(timer.delays().is_empty());
    }

    #[tokio::test]
    async fn test_client_mode_json_exposes_tokens() {
        let (manager, tokens, _) = setup_with(SessionConfig {
            mode: SessionMode::Client,
            client_storage: ClientStorage::Json,
            ..SessionConfig::default()
        });
        tokens.set_tokens(TokenSet::bearer("at"));

        let mut ctx = SessionContext::new();
        manager.start(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_body.as_ref().unwrap()["access_token"], "at");
        assert!(manager.sid().is_none());
    }

    #[tokio::test]
    async fn test_client_mode_without_tokens_only_warns() {
        let (manager, _, _) = setup(SessionMode::Client);
        let mut ctx = SessionContext::new();
        manager.start(&mut ctx).await.unwrap();
        assert!(ctx.response_cookies.is_empty());
    }

    #[tokio::test]
    async fn test_validate_csrf_mismatch() {
        let (manager, tokens, _) = setup(SessionMode::Server);
        tokens.set_tokens(TokenSet::bearer("at"));
        let mut ctx = SessionContext::new();
        manager.start(&mut ctx).await.unwrap();

        let err = manager.validate_csrf(&ctx, "forged").await.unwrap_err();
        assert_eq!(error_code(&err), Some("CSRF_VALIDATION_FAILED"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (manager, tokens, timer) = setup(SessionMode::Server);
        tokens.set_tokens(expiring(120));
        let mut ctx = SessionContext::new();
        manager.start(&mut ctx).await.unwrap();

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert!(manager.sid().is_none());
        assert!(!manager.has_pending_refresh());
        assert_eq!(timer.pending(), 0);
    }
}
