//! Partner SOAP API `login()`.

use super::{Error, Token, TokenExchange};
use crate::transport::{Request, Response};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::HeaderName;

/// Prefix of the `CallOptions` client identifier.
const CLIENT_ID_PREFIX: &str = "sf-toolkit";

/// How the password is supplemented for the org's login policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoapVariant {
    /// Appends a security token to the password.
    SecurityToken(String),
    /// Sends the organization id in a `LoginScopeHeader` (self-service users).
    OrganizationId(String),
    /// Trusted IP range login with the bare password.
    NonService,
}

/// SOAP login settings.
#[derive(Clone)]
pub struct SoapLogin {
    pub username: String,
    pub password: String,
    pub variant: SoapVariant,
    /// Appended to the `CallOptions` client name, e.g. `sf-toolkit/my-app`.
    pub client_id: Option<String>,
    /// Login domain: `login`, `test` or a My Domain prefix.
    pub domain: String,
    pub api_version: String,
}

impl std::fmt::Debug for SoapLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapLogin")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("variant", &self.variant)
            .field("client_id", &self.client_id)
            .field("domain", &self.domain)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl SoapLogin {
    pub fn flow_name(&self) -> &'static str {
        match self.variant {
            SoapVariant::SecurityToken(_) => "soap_security_token",
            SoapVariant::OrganizationId(_) => "soap_organization_id",
            SoapVariant::NonService => "soap_ip_filtering",
        }
    }

    fn url(&self) -> String {
        format!(
            "https://{}.salesforce.com/services/Soap/u/{}",
            self.domain, self.api_version
        )
    }

    fn client_name(&self) -> String {
        match &self.client_id {
            Some(id) => format!("{CLIENT_ID_PREFIX}/{id}"),
            None => CLIENT_ID_PREFIX.to_string(),
        }
    }

    /// Builds the login envelope with every interpolated value XML-escaped.
    pub fn envelope(&self) -> String {
        let password = match &self.variant {
            SoapVariant::SecurityToken(token) => format!("{}{}", self.password, token),
            _ => self.password.clone(),
        };
        let login_scope = match &self.variant {
            SoapVariant::OrganizationId(org_id) => format!(
                "<urn:LoginScopeHeader><urn:organizationId>{}</urn:organizationId></urn:LoginScopeHeader>",
                escape(org_id.as_str())
            ),
            _ => String::new(),
        };

        format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:urn="urn:partner.soap.sforce.com">
  <soapenv:Header>
    <urn:CallOptions><urn:client>{client}</urn:client><urn:defaultNamespace>sf</urn:defaultNamespace></urn:CallOptions>{login_scope}
  </soapenv:Header>
  <soapenv:Body>
    <urn:login><urn:username>{username}</urn:username><urn:password>{password}</urn:password></urn:login>
  </soapenv:Body>
</soapenv:Envelope>"#,
            client = escape(self.client_name().as_str()),
            username = escape(self.username.as_str()),
            password = escape(password.as_str()),
        )
    }
}

impl TokenExchange for SoapLogin {
    fn request(&self) -> Result<Request, Error> {
        Request::post(self.url())
            .body("text/xml", self.envelope().into_bytes())
            .header(HeaderName::from_static("charset"), "UTF-8")
            .and_then(|r| r.header(HeaderName::from_static("soapaction"), "login"))
            .map_err(|source| Error::Transport { source })
    }

    fn parse(&self, response: Response) -> Result<Token, Error> {
        let body = response.body.as_slice();
        if !response.is_success() {
            let code = match element_text(body, "exceptionCode")? {
                Some(code) => code,
                None => element_text(body, "faultcode")?
                    .unwrap_or_else(|| response.status.as_u16().to_string()),
            };
            let message = match element_text(body, "exceptionMessage")? {
                Some(message) => message,
                None => element_text(body, "faultstring")?.unwrap_or_else(|| response.text()),
            };
            return Err(Error::AuthenticationFailed { code, message });
        }

        let session_id = element_text(body, "sessionId")?.ok_or(Error::MissingField("sessionId"))?;
        let server_url = element_text(body, "serverUrl")?.ok_or(Error::MissingField("serverUrl"))?;
        Token::from_instance_url(&server_url, session_id)
    }
}

/// Returns the unescaped text of the first element whose local name is `name`.
fn element_text(xml: &[u8], name: &str) -> Result<Option<String>, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut inside = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|source| Error::ParseXml { source })?;
        match event {
            Event::Start(start) if start.local_name().as_ref() == name.as_bytes() => {
                inside = true;
            }
            Event::Text(text) if inside => {
                let text = text.unescape().map_err(|source| Error::ParseXml { source })?;
                return Ok(Some(text.into_owned()));
            }
            Event::End(_) if inside => return Ok(Some(String::new())),
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}
