//! Login flows and the authenticated session.
//!
//! A login flow is modelled as a [`LoginProcedure`]: a small state machine that is
//! driven by repeatedly calling [`LoginProcedure::advance`]. Each step either asks the
//! driver to perform an HTTP exchange ([`Progress::Send`]) or completes with a
//! [`Token`]. The driver feeds every response back into the next `advance` call.
//!
//! Supported flows:
//! - [`cli::CliLogin`]: delegates to a locally authenticated `sf` CLI
//! - [`soap::SoapLogin`]: partner SOAP `login()` call
//! - [`oauth::OAuthLogin`]: OAuth2 password, client-credentials and JWT bearer grants

use crate::transport::{self, Request, Response, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod cli;
pub mod oauth;
pub mod session;
pub mod soap;

pub use session::{AuthSession, TokenRefreshCallback};

/// Errors that can occur while logging in or authenticating a request.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The login endpoint rejected the credentials.
    #[error("Authentication failed ({code}): {message}")]
    AuthenticationFailed {
        /// Error code reported by the server.
        code: String,
        /// Human readable description.
        message: String,
    },
    /// The `sf` executable could not be started.
    #[error("Could not run sf CLI at {path}: {source}")]
    CliUnavailable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The CLI reported a non-zero status.
    #[error("Failed to get credentials for org {org} ({name}): {message}")]
    CliFailed {
        org: String,
        name: String,
        message: String,
    },
    /// The CLI knows the org but is not connected to it.
    #[error("Check SF CLI. Unable to connect to {instance_url} as {username} ({status}): {warnings}")]
    CliDisconnected {
        status: String,
        instance_url: String,
        username: String,
        warnings: String,
    },
    /// The CLI output was not the expected JSON envelope.
    #[error("Failed to parse sf CLI output: {source}")]
    ParseCliOutput {
        #[source]
        source: serde_json::Error,
    },
    /// A login step expected a response but none was supplied.
    #[error("No response received")]
    MissingResponse,
    /// A successful login response lacked a required value.
    #[error("Login response is missing {0}")]
    MissingField(&'static str),
    /// Failed to parse an XML login response.
    #[error("Failed to parse SOAP response: {source}")]
    ParseXml {
        #[source]
        source: quick_xml::Error,
    },
    /// Failed to parse an OAuth2 token response.
    #[error("Failed to parse token response: {source}")]
    ParseTokenResponse {
        #[source]
        source: serde_json::Error,
    },
    /// Invalid URL in a login response or configuration.
    #[error("Invalid URL format: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// Failed to sign a JWT bearer assertion.
    #[error("Failed to sign JWT assertion: {source}")]
    Jwt {
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    /// Failed to get current system time.
    #[error("Failed to get current system time: {source}")]
    SystemTimeError {
        #[source]
        source: std::time::SystemTimeError,
    },
    /// The HTTP exchange itself failed.
    #[error("Transport error during authentication: {source}")]
    Transport {
        #[source]
        source: transport::Error,
    },
    /// The session was rejected again right after logging in again.
    #[error("Session expired and could not be renewed")]
    SessionExpired,
    /// Neither a token nor a login flow is available.
    #[error("No token and no login flow configured")]
    NoLogin,
    /// Failed to acquire lock on token state.
    #[error("Failed to acquire lock on token state")]
    LockError,
}

/// Credential pair granting API access: the instance host and the session secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Instance host (and port, when not the default), e.g. `mydomain.my.salesforce.com`.
    pub authority: String,
    /// Session id / access token.
    pub secret: String,
}

impl Token {
    pub fn new(authority: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            secret: secret.into(),
        }
    }

    /// Builds a token from an instance URL such as `https://na1.salesforce.com/services/...`.
    ///
    /// A bare host without a scheme is accepted.
    pub fn from_instance_url(instance_url: &str, secret: impl Into<String>) -> Result<Self, Error> {
        let url = if instance_url.contains("://") {
            url::Url::parse(instance_url)
        } else {
            url::Url::parse(&format!("https://{instance_url}"))
        }
        .map_err(|source| Error::ParseUrl { source })?;

        let host = url.host_str().ok_or(Error::ParseUrl {
            source: url::ParseError::EmptyHost,
        })?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self::new(authority, secret))
    }

    /// `https://{authority}`
    pub fn base_url(&self) -> String {
        format!("https://{}", self.authority)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("authority", &self.authority)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Outcome of one [`LoginProcedure::advance`] step.
#[derive(Debug)]
pub enum Progress {
    /// Perform this exchange and pass the response to the next `advance` call.
    Send(Request),
    /// The handshake finished.
    Complete(Token),
}

/// An in-progress login handshake.
///
/// The first call to `advance` receives `None`; every following call receives the
/// response to the request returned by the previous step. Procedures are single use:
/// create a fresh one from [`LoginConfig::procedure`] for every attempt.
#[async_trait]
pub trait LoginProcedure: Send {
    async fn advance(&mut self, response: Option<Response>) -> Result<Progress, Error>;
}

/// Runs a procedure to completion, sending each requested exchange through `transport`.
pub async fn drive(
    procedure: &mut dyn LoginProcedure,
    transport: &dyn Transport,
) -> Result<Token, Error> {
    let mut inbound = None;
    loop {
        match procedure.advance(inbound.take()).await? {
            Progress::Complete(token) => return Ok(token),
            Progress::Send(request) => {
                let response = transport
                    .send(&request)
                    .await
                    .map_err(|source| Error::Transport { source })?;
                inbound = Some(response);
            }
        }
    }
}

/// A login flow that consists of exactly one HTTP exchange.
pub(crate) trait TokenExchange: Send + Sync {
    fn request(&self) -> Result<Request, Error>;
    fn parse(&self, response: Response) -> Result<Token, Error>;
}

/// Adapts a [`TokenExchange`] into a two-step [`LoginProcedure`].
pub(crate) struct ExchangeProcedure<E> {
    exchange: E,
    sent: bool,
}

impl<E> ExchangeProcedure<E> {
    pub(crate) fn new(exchange: E) -> Self {
        Self {
            exchange,
            sent: false,
        }
    }
}

#[async_trait]
impl<E: TokenExchange> LoginProcedure for ExchangeProcedure<E> {
    async fn advance(&mut self, response: Option<Response>) -> Result<Progress, Error> {
        if !self.sent {
            self.sent = true;
            return self.exchange.request().map(Progress::Send);
        }
        let response = response.ok_or(Error::MissingResponse)?;
        self.exchange.parse(response).map(Progress::Complete)
    }
}

/// The login flow used by a session, resolved once when the client is built.
#[derive(Debug, Clone)]
pub enum LoginConfig {
    /// Reuse the session of a locally authenticated `sf` CLI.
    Cli(cli::CliLogin),
    /// Partner SOAP API login.
    Soap(soap::SoapLogin),
    /// OAuth2 token endpoint.
    OAuth(oauth::OAuthLogin),
}

impl LoginConfig {
    /// Creates a fresh, not yet started procedure for this flow.
    pub fn procedure(&self) -> Box<dyn LoginProcedure> {
        match self {
            LoginConfig::Cli(login) => Box::new(login.procedure()),
            LoginConfig::Soap(login) => Box::new(ExchangeProcedure::new(login.clone())),
            LoginConfig::OAuth(login) => Box::new(ExchangeProcedure::new(login.clone())),
        }
    }

    /// Short name of the flow, used in logs and errors.
    pub fn flow_name(&self) -> &'static str {
        match self {
            LoginConfig::Cli(_) => "sf_cli",
            LoginConfig::Soap(login) => login.flow_name(),
            LoginConfig::OAuth(login) => login.flow_name(),
        }
    }
}
