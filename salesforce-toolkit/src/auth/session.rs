//! Authenticated session: owns the current token, attaches it to requests and logs in
//! again when the server reports the session as expired.

use super::{drive, Error, LoginConfig, Token};
use crate::transport::{Request, Response, Transport};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Error code Salesforce returns for an expired or revoked session.
const INVALID_SESSION_ID: &str = "INVALID_SESSION_ID";

/// Called with the new token after every successful login.
pub type TokenRefreshCallback = Arc<dyn Fn(&Token) + Send + Sync>;

/// Shared authentication state for one org connection.
///
/// Cheap to share behind an [`Arc`]. The token lock is never held across an `.await`;
/// concurrent refreshes are collapsed into one login by `refresh_gate`.
pub struct AuthSession {
    transport: Arc<dyn Transport>,
    login: Option<LoginConfig>,
    token: RwLock<Option<Arc<Token>>>,
    refresh_gate: Mutex<()>,
    on_refresh: Option<TokenRefreshCallback>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("transport", &self.transport)
            .field("login", &self.login)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    /// Creates a session from a login flow, an existing token, or both.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoLogin`] when neither is given.
    pub fn new(
        transport: Arc<dyn Transport>,
        login: Option<LoginConfig>,
        token: Option<Token>,
    ) -> Result<Self, Error> {
        if login.is_none() && token.is_none() {
            return Err(Error::NoLogin);
        }
        Ok(Self {
            transport,
            login,
            token: RwLock::new(token.map(Arc::new)),
            refresh_gate: Mutex::new(()),
            on_refresh: None,
        })
    }

    pub fn with_refresh_callback(mut self, callback: TokenRefreshCallback) -> Self {
        self.on_refresh = Some(callback);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn login_config(&self) -> Option<&LoginConfig> {
        self.login.as_ref()
    }

    /// Returns the current token without logging in.
    pub fn current_token(&self) -> Result<Option<Arc<Token>>, Error> {
        let guard = self.token.read().map_err(|_| Error::LockError)?;
        Ok(guard.clone())
    }

    /// Returns the current token, logging in first if there is none yet.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn token(&self) -> Result<Arc<Token>, Error> {
        match self.current_token()? {
            Some(token) => Ok(token),
            None => self.refresh(None).await,
        }
    }

    /// Discards the current token and runs the login flow again.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn login(&self) -> Result<Arc<Token>, Error> {
        let stale = self.current_token()?;
        self.refresh(stale).await
    }

    /// Logs in unless another task already replaced `stale` while we waited.
    async fn refresh(&self, stale: Option<Arc<Token>>) -> Result<Arc<Token>, Error> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(current) = self.current_token()? {
            let replaced = match &stale {
                Some(stale) => !Arc::ptr_eq(stale, &current),
                None => true,
            };
            if replaced {
                return Ok(current);
            }
        }

        let login = self.login.as_ref().ok_or(Error::SessionExpired)?;
        tracing::debug!(flow = login.flow_name(), "logging in");
        let mut procedure = login.procedure();
        let token = Arc::new(drive(procedure.as_mut(), self.transport.as_ref()).await?);
        tracing::info!(flow = login.flow_name(), instance = %token.authority, "logged in");

        {
            let mut guard = self.token.write().map_err(|_| Error::LockError)?;
            *guard = Some(Arc::clone(&token));
        }
        if let Some(callback) = &self.on_refresh {
            callback(&token);
        }
        Ok(token)
    }

    /// Sends `request` with the session credential attached.
    ///
    /// If the server answers that the session expired, the session logs in once and
    /// replays the request. The caller's `request` carries the credential that was
    /// used for the final attempt, and its URL is moved to the new instance if the
    /// login landed on a different one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] when the replayed request is rejected for the
    /// same reason, or when there is no login flow to renew the session with.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(url = %request.url)))]
    pub async fn execute(&self, request: &mut Request) -> Result<Response, Error> {
        let token = self.token().await?;
        let response = self.send_with(request, &token).await?;
        if !is_session_expired(&response) {
            return Ok(response);
        }

        tracing::warn!(url = %request.url, "session expired, logging in again");
        let fresh = self.refresh(Some(Arc::clone(&token))).await?;
        if fresh.authority != token.authority {
            if let Some(path) = request.url.strip_prefix(&token.base_url()) {
                request.url = format!("{}{path}", fresh.base_url());
            }
        }
        let token = fresh;
        let response = self.send_with(request, &token).await?;
        if is_session_expired(&response) {
            return Err(Error::SessionExpired);
        }
        Ok(response)
    }

    async fn send_with(&self, request: &mut Request, token: &Token) -> Result<Response, Error> {
        request
            .set_bearer(&token.secret)
            .map_err(|source| Error::Transport { source })?;
        self.transport
            .send(request)
            .await
            .map_err(|source| Error::Transport { source })
    }
}

/// True for a 401 whose body carries an `INVALID_SESSION_ID` error code.
pub fn is_session_expired(response: &Response) -> bool {
    if response.status != reqwest::StatusCode::UNAUTHORIZED {
        return false;
    }
    let Ok(body) = response.json::<serde_json::Value>() else {
        return false;
    };
    let code_matches =
        |v: &serde_json::Value| v.get("errorCode").and_then(|c| c.as_str()) == Some(INVALID_SESSION_ID);
    match &body {
        serde_json::Value::Array(errors) => errors.iter().any(code_matches),
        other => code_matches(other),
    }
}
