use crate::auth::{
    self,
    cli::CliLogin,
    oauth::{Grant, OAuthLogin, PrivateKey},
    soap::{SoapLogin, SoapVariant},
    AuthSession, LoginConfig, Token, TokenRefreshCallback,
};
use crate::metrics::{ApiUsage, UsageTracker};
use crate::transport::{self, ReqwestTransport, Request, Response, Transport};
use oauth2::{ClientId, ClientSecret, ResourceOwnerPassword, ResourceOwnerUsername};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Errors that can occur during client operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read credentials file from disk.
    #[error("Failed to read credentials file at {path}: {source}")]
    ReadCredentials {
        /// Path to the credentials file that failed to read.
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse credentials JSON.
    #[error("Failed to parse credentials JSON: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    /// Required builder parameter was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
    /// Invalid credentials for the selected auth flow.
    #[error("Invalid credentials for {flow}: {message}")]
    InvalidCredentials {
        /// The authentication flow that failed validation.
        flow: String,
        /// Description of what's missing or invalid.
        message: String,
    },
    /// Login or session renewal failed.
    #[error("Authentication error: {source}")]
    Auth {
        #[source]
        source: auth::Error,
    },
    /// Failed to build the default transport.
    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: transport::Error,
    },
    /// The API answered with a non-success status.
    #[error("Salesforce API returned {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body, usually a JSON error list.
        body: String,
    },
    /// Failed to deserialize an API response.
    #[error("Failed to parse API response: {source}")]
    ParseResponse {
        #[source]
        source: serde_json::Error,
    },
    /// A connection with the same name is already registered.
    #[error("Connection {0} is already registered")]
    DuplicateConnection(String),
    /// Failed to acquire lock on the connection registry.
    #[error("Failed to acquire lock on connection registry")]
    LockError,
}

impl From<auth::Error> for Error {
    fn from(source: auth::Error) -> Self {
        Error::Auth { source }
    }
}

impl Error {
    /// Returns true for network failures and server-side (5xx) errors, which may clear
    /// up when the same request is sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { source }
            | Error::Auth {
                source: auth::Error::Transport { source },
            } => source.is_transient(),
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Salesforce login parameters.
///
/// Every field is optional; the login flow is chosen from which fields are set, in this
/// order:
///
/// 1. `sf_cli_alias` or `sf_cli_exec_path`: reuse the session of the `sf` CLI
/// 2. `consumer_key`: OAuth2, as JWT bearer (`private_key` + `username`), password
///    (`username` + `password`) or client credentials (`consumer_secret` only)
/// 3. `username` + `password`: SOAP login, with `security_token` or
///    `organization_id` when given
///
/// # Examples
///
/// ## Client Credentials
///
/// ```
/// use salesforce_toolkit::client::Credentials;
///
/// let creds = Credentials {
///     consumer_key: Some("your_consumer_key".to_string()),
///     consumer_secret: Some("your_consumer_secret".to_string()),
///     domain: Some("mydomain.my".to_string()),
///     ..Default::default()
/// };
/// ```
///
/// ## SOAP with security token
///
/// ```
/// use salesforce_toolkit::client::Credentials;
///
/// let creds = Credentials {
///     username: Some("user@example.com".to_string()),
///     password: Some("your_password".to_string()),
///     security_token: Some("your_token".to_string()),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Credentials {
    /// Org alias for the `sf` CLI. An empty alias selects the CLI default org.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sf_cli_alias: Option<String>,
    /// Path to the `sf` executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sf_cli_exec_path: Option<PathBuf>,
    /// Login domain: `login` (default), `test` or a My Domain prefix such as `acme.my`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Username for authentication (email address).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Security token appended to the password for SOAP login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,
    /// Organization ID for SOAP login of self-service users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Client name reported in SOAP `CallOptions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Consumer Key of the Connected App.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_key: Option<String>,
    /// Consumer Secret of the Connected App.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_secret: Option<String>,
    /// PEM encoded RSA private key for the JWT bearer flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Credentials {
    /// Picks the login flow these credentials describe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] when a consumer key is given without a
    /// usable OAuth2 combination, and [`Error::MissingRequiredAttribute`] when no flow
    /// matches at all.
    pub fn resolve(&self, api_version: &str) -> Result<LoginConfig, Error> {
        let domain = self
            .domain
            .clone()
            .unwrap_or_else(|| crate::DEFAULT_DOMAIN.to_string());

        if self.sf_cli_alias.is_some() || self.sf_cli_exec_path.is_some() {
            return Ok(LoginConfig::Cli(CliLogin {
                alias: self.sf_cli_alias.clone().filter(|alias| !alias.is_empty()),
                exec_path: self.sf_cli_exec_path.clone(),
            }));
        }

        if let Some(consumer_key) = &self.consumer_key {
            let consumer_key = ClientId::new(consumer_key.clone());
            let grant = match (
                &self.username,
                &self.password,
                &self.consumer_secret,
                &self.private_key,
            ) {
                (Some(username), _, _, Some(private_key)) => Grant::JwtBearer {
                    consumer_key,
                    username: username.clone(),
                    private_key: PrivateKey::new(private_key.clone()),
                },
                (Some(username), Some(password), Some(secret), None) => Grant::Password {
                    consumer_key,
                    consumer_secret: ClientSecret::new(secret.clone()),
                    username: ResourceOwnerUsername::new(username.clone()),
                    password: ResourceOwnerPassword::new(password.clone()),
                },
                (None, None, Some(secret), None) => Grant::ClientCredentials {
                    consumer_key,
                    consumer_secret: ClientSecret::new(secret.clone()),
                },
                _ => {
                    return Err(Error::InvalidCredentials {
                        flow: "oauth".to_string(),
                        message: "Unable to determine authentication method".to_string(),
                    })
                }
            };
            return Ok(LoginConfig::OAuth(OAuthLogin::new(domain, grant)));
        }

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            let variant = match (&self.security_token, &self.organization_id) {
                (Some(token), _) => SoapVariant::SecurityToken(token.clone()),
                (None, Some(org_id)) => SoapVariant::OrganizationId(org_id.clone()),
                (None, None) => SoapVariant::NonService,
            };
            return Ok(LoginConfig::Soap(SoapLogin {
                username: username.clone(),
                password: password.clone(),
                variant,
                client_id: self.client_id.clone(),
                domain,
                api_version: api_version.to_string(),
            }));
        }

        Err(Error::MissingRequiredAttribute(
            "sf_cli_alias, consumer_key or username and password".to_string(),
        ))
    }
}

/// Source for loading credentials.
#[derive(Debug, Clone)]
pub enum CredentialsFrom {
    /// Load credentials from a JSON file.
    Path(PathBuf),
    /// Use credentials provided directly.
    Value(Credentials),
}

impl CredentialsFrom {
    fn load(&self) -> Result<Credentials, Error> {
        match self {
            CredentialsFrom::Value(creds) => Ok(creds.clone()),
            CredentialsFrom::Path(path) => {
                let credentials_string =
                    fs::read_to_string(path).map_err(|source| Error::ReadCredentials {
                        path: path.clone(),
                        source,
                    })?;
                serde_json::from_str(&credentials_string)
                    .map_err(|source| Error::ParseCredentials { source })
            }
        }
    }
}

/// Connection to one Salesforce org.
///
/// Use [`Builder`] to construct a client instance. Clones share the same session, so a
/// token renewed through one clone is seen by all of them.
///
/// # Examples
///
/// ## Username-Password Flow
///
/// ```no_run
/// use salesforce_toolkit::client::{self, Credentials};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials(Credentials {
///         consumer_key: Some("your_consumer_key".to_string()),
///         consumer_secret: Some("your_consumer_secret".to_string()),
///         username: Some("user@example.com".to_string()),
///         password: Some("your_password".to_string()),
///         ..Default::default()
///     })
///     .build()?
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Reusing the sf CLI session
///
/// ```no_run
/// use salesforce_toolkit::client::{self, Credentials};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials(Credentials {
///         sf_cli_alias: Some("my-dev-org".to_string()),
///         ..Default::default()
///     })
///     .build()?
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    session: Arc<AuthSession>,
    api_version: String,
    name: Option<String>,
    usage: Arc<UsageTracker>,
}

impl Client {
    /// Logs in now instead of on the first request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the login flow fails.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn connect(self) -> Result<Self, Error> {
        self.session.token().await?;
        Ok(self)
    }

    /// Forces a new session by running the login flow again.
    ///
    /// Requests retry once on `INVALID_SESSION_ID` on their own; use this to renew the
    /// session eagerly, e.g. after a security policy change.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_toolkit::client::{self, Credentials};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = client::Builder::new()
    ///     .credentials_path("credentials.json".into())
    ///     .build()?
    ///     .connect()
    ///     .await?;
    ///
    /// client.reconnect().await?;
    /// # Ok(())
    /// # }
    /// ```
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.session.login().await?;
        Ok(())
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Registry name of this connection.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// API usage reported by the most recent response, if any.
    pub fn api_usage(&self) -> Option<ApiUsage> {
        self.usage.latest()
    }

    /// Returns the current access token, logging in if necessary.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn token(&self) -> Result<Arc<Token>, Error> {
        Ok(self.session.token().await?)
    }

    /// `https://{instance}`
    pub async fn instance_url(&self) -> Result<String, Error> {
        Ok(self.token().await?.base_url())
    }

    /// `https://{instance}/services/data/v{api_version}`
    pub async fn data_url(&self) -> Result<String, Error> {
        Ok(format!(
            "{}/services/data/v{}",
            self.instance_url().await?,
            self.api_version
        ))
    }

    /// Sends a request through the session and returns the response, whatever its status.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute(&self, request: &mut Request) -> Result<Response, Error> {
        let response = self.session.execute(request).await?;
        self.usage.observe(&response);
        Ok(response)
    }

    /// Sends a request and fails with [`Error::Api`] on a non-success status.
    pub async fn send(&self, mut request: Request) -> Result<Response, Error> {
        let response = self.execute(&mut request).await?;
        if !response.is_success() {
            return Err(Error::Api {
                status: response.status.as_u16(),
                body: response.text(),
            });
        }
        Ok(response)
    }

    /// Sends a request and deserializes a successful JSON response.
    pub async fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T, Error> {
        self.send(request)
            .await?
            .json()
            .map_err(|source| Error::ParseResponse { source })
    }

    /// GET `{data_url}{path}` and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = format!("{}{path}", self.data_url().await?);
        self.send_json(Request::get(url)).await
    }

    /// Sends `body` as JSON to `{data_url}{path}` and deserializes the JSON response.
    pub async fn send_body<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.data_url().await?);
        let request = Request::new(method, url)
            .json(body)
            .map_err(|source| Error::Transport { source })?;
        self.send_json(request).await
    }
}

/// Builder for constructing a [`Client`].
///
/// # Examples
///
/// ## Loading from File
///
/// ```no_run
/// use salesforce_toolkit::client;
/// use std::path::PathBuf;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .credentials_path(PathBuf::from("credentials.json"))
///     .api_version("64.0")
///     .build()?
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Starting from a known token
///
/// ```no_run
/// use salesforce_toolkit::auth::Token;
/// use salesforce_toolkit::client;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = client::Builder::new()
///     .token(Token::new("acme.my.salesforce.com", "00D...!AQ..."))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    credentials_from: Option<CredentialsFrom>,
    login: Option<LoginConfig>,
    token: Option<Token>,
    api_version: Option<String>,
    name: Option<String>,
    on_refresh: Option<TokenRefreshCallback>,
    transport: Option<Arc<dyn Transport>>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials to load from a JSON file.
    ///
    /// The file holds a JSON object with the [`Credentials`] fields of one login flow:
    ///
    /// ```json
    /// {
    ///   "consumer_key": "your_consumer_key",
    ///   "consumer_secret": "your_consumer_secret",
    ///   "domain": "mydomain.my"
    /// }
    /// ```
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_from = Some(CredentialsFrom::Path(path));
        self
    }

    /// Sets credentials directly.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials_from = Some(CredentialsFrom::Value(credentials));
        self
    }

    /// Uses an explicit login flow instead of inferring it from credentials.
    pub fn login(mut self, login: LoginConfig) -> Self {
        self.login = Some(login);
        self
    }

    /// Starts with an existing token. Without a login flow the session cannot be renewed.
    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the API version (defaults to [`crate::DEFAULT_API_VERSION`]).
    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = Some(api_version.into());
        self
    }

    /// Names the connection for use with a [`ConnectionRegistry`].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Called with every new token, e.g. to persist it.
    pub fn on_token_refresh(mut self, callback: impl Fn(&Token) + Send + Sync + 'static) -> Self {
        self.on_refresh = Some(Arc::new(callback));
        self
    }

    /// Replaces the default reqwest transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the client. No request is sent until [`Client::connect`] or the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if neither credentials, a login flow nor a token were provided,
    /// or if the credentials do not describe a login flow.
    pub fn build(self) -> Result<Client, Error> {
        let api_version = self
            .api_version
            .unwrap_or_else(|| crate::DEFAULT_API_VERSION.to_string());

        let login = match (self.login, &self.credentials_from) {
            (Some(login), _) => Some(login),
            (None, Some(from)) => Some(from.load()?.resolve(&api_version)?),
            (None, None) => None,
        };
        if login.is_none() && self.token.is_none() {
            return Err(Error::MissingRequiredAttribute(
                "credentials, credentials_path, login or token".to_string(),
            ));
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new().map_err(|source| Error::Transport { source })?),
        };

        let mut session = AuthSession::new(transport, login, self.token)?;
        if let Some(callback) = self.on_refresh {
            session = session.with_refresh_callback(callback);
        }

        Ok(Client {
            session: Arc::new(session),
            api_version,
            name: self.name,
            usage: Arc::new(UsageTracker::default()),
        })
    }
}

/// Named connections, looked up by the connection name given to [`Builder::name`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Client>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingRequiredAttribute`] for an unnamed client and
    /// [`Error::DuplicateConnection`] if the name is taken.
    pub fn register(&self, client: Client) -> Result<(), Error> {
        let name = client
            .name()
            .ok_or_else(|| Error::MissingRequiredAttribute("name".to_string()))?
            .to_string();
        let mut connections = self.connections.write().map_err(|_| Error::LockError)?;
        if connections.contains_key(&name) {
            return Err(Error::DuplicateConnection(name));
        }
        tracing::debug!(connection = %name, "registered connection");
        connections.insert(name, client);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Client>, Error> {
        let connections = self.connections.read().map_err(|_| Error::LockError)?;
        Ok(connections.get(name).cloned())
    }

    pub fn unregister(&self, name: &str) -> Result<Option<Client>, Error> {
        let mut connections = self.connections.write().map_err(|_| Error::LockError)?;
        Ok(connections.remove(name))
    }

    pub fn names(&self) -> Result<Vec<String>, Error> {
        let connections = self.connections.read().map_err(|_| Error::LockError)?;
        let mut names: Vec<_> = connections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::testing::{json_response, MockTransport};
    use reqwest::header::{HeaderName, HeaderValue};
    use serde_json::json;
    use std::env;

    /// Client on instance `h` with token `T0` backed by `transport`.
    pub(crate) fn mock_client(transport: &MockTransport) -> Client {
        Builder::new()
            .token(Token::new("h", "T0"))
            .transport(Arc::new(transport.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_without_credentials() {
        let client = Builder::new().build();
        assert!(matches!(
            client,
            Err(Error::MissingRequiredAttribute(attr)) if attr == "credentials, credentials_path, login or token"
        ));
    }

    #[test]
    fn test_build_with_credentials_file() {
        let creds = r#"{"sf_cli_alias": "dev"}"#;
        let mut path = env::temp_dir();
        path.push(format!("credentials_{}.json", std::process::id()));
        let _ = fs::write(path.clone(), creds);
        let client = Builder::new().credentials_path(path.clone()).build();
        let _ = fs::remove_file(path);

        let client = client.unwrap();
        assert!(matches!(
            client.session().login_config(),
            Some(LoginConfig::Cli(cli)) if cli.alias.as_deref() == Some("dev")
        ));
    }

    #[test]
    fn test_build_with_invalid_credentials_json() {
        let mut path = env::temp_dir();
        path.push(format!("invalid_credentials_{}.json", std::process::id()));
        let _ = fs::write(path.clone(), r#"{"username": 42}"#);
        let result = Builder::new().credentials_path(path.clone()).build();
        let _ = fs::remove_file(path);
        assert!(matches!(result, Err(Error::ParseCredentials { .. })));
    }

    #[test]
    fn test_build_with_missing_file() {
        let mut path = env::temp_dir();
        path.push(format!("nonexistent_{}.json", std::process::id()));
        let result = Builder::new().credentials_path(path).build();
        assert!(matches!(result, Err(Error::ReadCredentials { .. })));
    }

    #[test]
    fn test_resolve_cli() {
        let creds = Credentials {
            sf_cli_alias: Some("my-dev-org".to_string()),
            sf_cli_exec_path: Some(PathBuf::from("/path/to/sf")),
            username: Some("ignored@example.com".to_string()),
            ..Default::default()
        };
        let login = creds.resolve("65.0").unwrap();
        assert!(matches!(
            login,
            LoginConfig::Cli(CliLogin { alias: Some(alias), exec_path: Some(path) })
                if alias == "my-dev-org" && path == PathBuf::from("/path/to/sf")
        ));

        let default_org = Credentials {
            sf_cli_alias: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            default_org.resolve("65.0").unwrap(),
            LoginConfig::Cli(CliLogin { alias: None, .. })
        ));
    }

    #[test]
    fn test_resolve_oauth_grants() {
        let jwt = Credentials {
            consumer_key: Some("ck".to_string()),
            username: Some("u".to_string()),
            private_key: Some("pem".to_string()),
            domain: Some("test".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            jwt.resolve("65.0").unwrap(),
            LoginConfig::OAuth(OAuthLogin { domain, grant: Grant::JwtBearer { .. } }) if domain == "test"
        ));

        let password = Credentials {
            consumer_key: Some("ck".to_string()),
            consumer_secret: Some("cs".to_string()),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            password.resolve("65.0").unwrap(),
            LoginConfig::OAuth(OAuthLogin { domain, grant: Grant::Password { .. } }) if domain == "login"
        ));

        let client_credentials = Credentials {
            consumer_key: Some("ck".to_string()),
            consumer_secret: Some("cs".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            client_credentials.resolve("65.0").unwrap(),
            LoginConfig::OAuth(OAuthLogin { grant: Grant::ClientCredentials { .. }, .. })
        ));
    }

    #[test]
    fn test_resolve_oauth_undeterminable() {
        let creds = Credentials {
            consumer_key: Some("ck".to_string()),
            username: Some("u".to_string()),
            ..Default::default()
        };
        let err = creds.resolve("65.0").unwrap_err();
        assert!(err
            .to_string()
            .contains("Unable to determine authentication method"));
    }

    #[test]
    fn test_resolve_soap_variants() {
        let base = Credentials {
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..Default::default()
        };

        let with_token = Credentials {
            security_token: Some("tok".to_string()),
            ..base.clone()
        };
        assert!(matches!(
            with_token.resolve("64.0").unwrap(),
            LoginConfig::Soap(SoapLogin { variant: SoapVariant::SecurityToken(t), api_version, .. })
                if t == "tok" && api_version == "64.0"
        ));

        let with_org = Credentials {
            organization_id: Some("00D".to_string()),
            ..base.clone()
        };
        assert!(matches!(
            with_org.resolve("65.0").unwrap(),
            LoginConfig::Soap(SoapLogin { variant: SoapVariant::OrganizationId(_), .. })
        ));

        assert!(matches!(
            base.resolve("65.0").unwrap(),
            LoginConfig::Soap(SoapLogin { variant: SoapVariant::NonService, .. })
        ));
    }

    #[test]
    fn test_resolve_nothing() {
        let creds = Credentials {
            username: Some("u".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            creds.resolve("65.0"),
            Err(Error::MissingRequiredAttribute(_))
        ));
    }

    #[test]
    fn test_credentials_serde_optional_fields() {
        let creds = Credentials {
            consumer_key: Some("ck".to_string()),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&creds).unwrap();
        assert_eq!(serialized, r#"{"consumer_key":"ck"}"#);

        let parsed: Credentials = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.consumer_key.as_deref(), Some("ck"));
        assert!(parsed.username.is_none());
    }

    #[tokio::test]
    async fn test_data_url_and_send() {
        let transport = MockTransport::new();
        transport.push_json(200, json!({"totalSize": 0}));
        let client = mock_client(&transport);

        assert_eq!(
            client.data_url().await.unwrap(),
            format!("https://h/services/data/v{}", crate::DEFAULT_API_VERSION)
        );
        let body: serde_json::Value = client.get("/query?q=SELECT+Id+FROM+Account").await.unwrap();
        assert_eq!(body["totalSize"], 0);

        let requests = transport.requests();
        assert_eq!(requests[0].bearer(), Some("T0"));
        assert!(requests[0].url.ends_with("/query?q=SELECT+Id+FROM+Account"));
    }

    #[tokio::test]
    async fn test_send_maps_error_status() {
        let transport = MockTransport::new();
        transport.push_json(400, json!([{"errorCode": "MALFORMED_QUERY", "message": "bad"}]));
        let client = mock_client(&transport);

        let result = client.send(Request::get("https://h/services/data")).await;
        assert!(matches!(
            result,
            Err(Error::Api { status: 400, body }) if body.contains("MALFORMED_QUERY")
        ));
    }

    #[tokio::test]
    async fn test_api_usage_tracked() {
        let transport = MockTransport::new();
        let mut response = json_response(200, json!({}));
        response.headers.insert(
            HeaderName::from_static("sforce-limit-info"),
            HeaderValue::from_static("api-usage=18/5000"),
        );
        transport.push(response);
        let client = mock_client(&transport);
        assert!(client.api_usage().is_none());

        client.send(Request::get("https://h/services/data")).await.unwrap();
        let usage = client.api_usage().unwrap().api_usage.unwrap();
        assert_eq!((usage.used, usage.max), (18, 5000));
    }

    #[tokio::test]
    async fn test_connect_and_reconnect() {
        let logins = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&logins);
        let transport = MockTransport::with_handler(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            json_response(
                200,
                json!({"access_token": format!("T{n}"), "instance_url": "https://h", "token_type": "Bearer"}),
            )
        });
        let refreshed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&refreshed);

        let client = Builder::new()
            .credentials(Credentials {
                consumer_key: Some("ck".to_string()),
                consumer_secret: Some("cs".to_string()),
                ..Default::default()
            })
            .transport(Arc::new(transport))
            .on_token_refresh(move |token| sink.lock().unwrap().push(token.secret.clone()))
            .build()
            .unwrap()
            .connect()
            .await
            .unwrap();
        assert_eq!(client.token().await.unwrap().secret, "T1");

        client.reconnect().await.unwrap();
        assert_eq!(client.token().await.unwrap().secret, "T2");
        assert_eq!(*refreshed.lock().unwrap(), vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let transport = MockTransport::new();
        transport.push_json(400, json!({"error": "invalid_client_id", "error_description": "client identifier invalid"}));
        let result = Builder::new()
            .credentials(Credentials {
                consumer_key: Some("ck".to_string()),
                consumer_secret: Some("cs".to_string()),
                ..Default::default()
            })
            .transport(Arc::new(transport))
            .build()
            .unwrap()
            .connect()
            .await;
        assert!(matches!(
            result,
            Err(Error::Auth { source: auth::Error::AuthenticationFailed { .. } })
        ));
    }

    #[test]
    fn test_registry() {
        let transport = MockTransport::new();
        let registry = ConnectionRegistry::new();
        let named = Builder::new()
            .token(Token::new("h", "T"))
            .transport(Arc::new(transport.clone()))
            .name("prod")
            .build()
            .unwrap();

        registry.register(named.clone()).unwrap();
        assert!(matches!(
            registry.register(named),
            Err(Error::DuplicateConnection(name)) if name == "prod"
        ));
        assert!(matches!(
            registry.register(mock_client(&transport)),
            Err(Error::MissingRequiredAttribute(_))
        ));
        assert_eq!(registry.names().unwrap(), vec!["prod"]);
        assert!(registry.get("prod").unwrap().is_some());

        assert!(registry.unregister("prod").unwrap().is_some());
        assert!(registry.get("prod").unwrap().is_none());
    }

    #[test]
    fn test_transient_errors() {
        let unavailable = Error::Api {
            status: 503,
            body: String::new(),
        };
        let bad_request = Error::Api {
            status: 400,
            body: String::new(),
        };
        assert!(unavailable.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!Error::LockError.is_transient());
    }

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            Error::MissingRequiredAttribute("name".to_string()).to_string(),
            "Missing required attribute: name"
        );
        assert_eq!(
            Error::DuplicateConnection("prod".to_string()).to_string(),
            "Connection prod is already registered"
        );
    }
}
