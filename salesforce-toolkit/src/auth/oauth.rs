//! OAuth2 token endpoint login: username-password, client-credentials and JWT bearer.
//!
//! All three grants post a form to `https://{domain}.salesforce.com/services/oauth2/token`
//! and receive the same token response, whose `instance_url` names the org to talk to.

use super::{Error, Token, TokenExchange};
use crate::transport::{Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use oauth2::basic::{BasicErrorResponse, BasicTokenType};
use oauth2::{
    ClientId, ClientSecret, ExtraTokenFields, ResourceOwnerPassword, ResourceOwnerUsername,
    StandardTokenResponse, TokenResponse,
};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use url::form_urlencoded;

/// Token endpoint path.
const TOKEN_PATH: &str = "/services/oauth2/token";

/// Grant type URN for the JWT bearer flow.
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed JWT assertion.
const JWT_LIFETIME_SECS: u64 = 3600;

/// Salesforce-specific fields returned next to the access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesforceTokenFields {
    /// URL of the org instance the token is valid for.
    pub instance_url: String,
    /// Identity URL of the authenticated user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ExtraTokenFields for SalesforceTokenFields {}

/// Token endpoint response.
pub type SalesforceTokenResponse = StandardTokenResponse<SalesforceTokenFields, BasicTokenType>;

/// PEM encoded RSA private key used to sign JWT assertions.
#[derive(Clone)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    fn pem(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// The OAuth2 grant used against the token endpoint.
#[derive(Debug, Clone)]
pub enum Grant {
    /// Resource owner password credentials.
    Password {
        consumer_key: ClientId,
        consumer_secret: ClientSecret,
        username: ResourceOwnerUsername,
        password: ResourceOwnerPassword,
    },
    /// Client credentials, authenticated with HTTP Basic.
    ClientCredentials {
        consumer_key: ClientId,
        consumer_secret: ClientSecret,
    },
    /// Signed JWT assertion for `username`.
    JwtBearer {
        consumer_key: ClientId,
        username: String,
        private_key: PrivateKey,
    },
}

/// OAuth2 login against `https://{domain}.salesforce.com`.
#[derive(Debug, Clone)]
pub struct OAuthLogin {
    /// Login domain: `login`, `test` or a My Domain prefix.
    pub domain: String,
    pub grant: Grant,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: u64,
}

impl OAuthLogin {
    pub fn new(domain: impl Into<String>, grant: Grant) -> Self {
        Self {
            domain: domain.into(),
            grant,
        }
    }

    pub fn flow_name(&self) -> &'static str {
        match self.grant {
            Grant::Password { .. } => "oauth_password",
            Grant::ClientCredentials { .. } => "oauth_client_credentials",
            Grant::JwtBearer { .. } => "oauth_jwt_bearer",
        }
    }

    fn audience(&self) -> String {
        format!("https://{}.salesforce.com", self.domain)
    }

    fn token_url(&self) -> String {
        format!("{}{TOKEN_PATH}", self.audience())
    }

    fn assertion(
        &self,
        consumer_key: &ClientId,
        username: &str,
        private_key: &PrivateKey,
    ) -> Result<String, Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|source| Error::SystemTimeError { source })?
            .as_secs();
        let claims = JwtClaims {
            iss: consumer_key.as_str().to_string(),
            sub: username.to_string(),
            aud: self.audience(),
            exp: now + JWT_LIFETIME_SECS,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.pem())
            .map_err(|source| Error::Jwt { source })?;
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|source| Error::Jwt { source })
    }

    fn form(&self) -> Result<String, Error> {
        let mut form = form_urlencoded::Serializer::new(String::new());
        match &self.grant {
            Grant::Password {
                consumer_key,
                consumer_secret,
                username,
                password,
            } => {
                form.append_pair("grant_type", "password")
                    .append_pair("client_id", consumer_key.as_str())
                    .append_pair("client_secret", consumer_secret.secret())
                    .append_pair("username", username.as_str())
                    .append_pair("password", password.secret());
            }
            Grant::ClientCredentials { .. } => {
                form.append_pair("grant_type", "client_credentials");
            }
            Grant::JwtBearer {
                consumer_key,
                username,
                private_key,
            } => {
                let assertion = self.assertion(consumer_key, username, private_key)?;
                form.append_pair("grant_type", JWT_BEARER_GRANT)
                    .append_pair("assertion", &assertion);
            }
        }
        Ok(form.finish())
    }
}

impl TokenExchange for OAuthLogin {
    fn request(&self) -> Result<Request, Error> {
        let mut request = Request::post(self.token_url()).body(
            "application/x-www-form-urlencoded",
            self.form()?.into_bytes(),
        );
        if let Grant::ClientCredentials {
            consumer_key,
            consumer_secret,
        } = &self.grant
        {
            let basic = BASE64.encode(format!(
                "{}:{}",
                consumer_key.as_str(),
                consumer_secret.secret()
            ));
            request = request
                .header(AUTHORIZATION, &format!("Basic {basic}"))
                .map_err(|source| Error::Transport { source })?;
        }
        Ok(request)
    }

    fn parse(&self, response: Response) -> Result<Token, Error> {
        if response.is_success() {
            let token: SalesforceTokenResponse = response
                .json()
                .map_err(|source| Error::ParseTokenResponse { source })?;
            return Token::from_instance_url(
                &token.extra_fields().instance_url,
                token.access_token().secret().as_str(),
            );
        }

        let (code, message) = match response.json::<BasicErrorResponse>() {
            Ok(error) => (
                error.error().to_string(),
                error.error_description().cloned().unwrap_or_default(),
            ),
            Err(_) => (response.status.as_u16().to_string(), response.text()),
        };
        if message.contains("not approved") || message.contains("hasn't approved") {
            tracing::warn!(
                flow = self.flow_name(),
                "connected app is not approved for this user; authorize it once by logging in through {}/services/oauth2/authorize",
                self.audience()
            );
        }
        Err(Error::AuthenticationFailed { code, message })
    }
}
