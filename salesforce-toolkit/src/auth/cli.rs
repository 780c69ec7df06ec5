//! Login by borrowing the session of a locally authenticated Salesforce CLI.
//!
//! Runs `sf org display --json [-o alias]` and reads the access token and instance URL
//! from its JSON envelope. No HTTP exchange is involved.

use super::{Error, LoginProcedure, Progress, Token};
use crate::transport::Response;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

/// Executables tried, in order, when no explicit path is configured.
const DEFAULT_EXECUTABLES: [&str; 2] = ["sf", "sfdx"];

/// Environment variables that would otherwise make the CLI colorize its JSON.
const NO_COLOR_ENV: [&str; 3] = ["CLICOLOR", "FORCE_COLOR", "CLICOLOR_FORCE"];

/// Connection status reported for a usable org.
const CONNECTED: &str = "Connected";

/// `sf` CLI login settings.
#[derive(Debug, Clone, Default)]
pub struct CliLogin {
    /// Org alias or username; the CLI default org when `None`.
    pub alias: Option<String>,
    /// Path to the CLI executable; `sf` (then `sfdx`) from `PATH` when `None`.
    pub exec_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    result: Option<OrgDisplay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgDisplay {
    #[serde(default)]
    connected_status: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    instance_url: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl CliLogin {
    pub fn new(alias: Option<String>) -> Self {
        Self {
            alias,
            exec_path: None,
        }
    }

    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_path = Some(path.into());
        self
    }

    pub(crate) fn procedure(&self) -> CliProcedure {
        CliProcedure {
            login: self.clone(),
        }
    }

    fn org_label(&self) -> String {
        self.alias.clone().unwrap_or_else(|| "[default]".to_string())
    }

    async fn run(&self) -> Result<Vec<u8>, Error> {
        let candidates: Vec<PathBuf> = match &self.exec_path {
            Some(path) => vec![path.clone()],
            None => DEFAULT_EXECUTABLES.into_iter().map(PathBuf::from).collect(),
        };

        let mut last_error = None;
        for program in candidates {
            let mut command = Command::new(&program);
            command.args(["org", "display", "--json"]);
            if let Some(alias) = &self.alias {
                command.arg("-o").arg(alias);
            }
            for var in color_overrides(|var| std::env::var_os(var).is_some()) {
                command.env(var, "0");
            }

            tracing::debug!(program = %program.display(), org = %self.org_label(), "running sf CLI");
            match command.output().await {
                Ok(output) => return Ok(output.stdout),
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                    last_error = Some(Error::CliUnavailable {
                        path: program,
                        source,
                    });
                }
                Err(source) => {
                    return Err(Error::CliUnavailable {
                        path: program,
                        source,
                    })
                }
            }
        }
        Err(last_error.unwrap_or(Error::MissingField("sf executable")))
    }

    /// Interprets the JSON printed by `sf org display --json`.
    pub fn parse_org_display(&self, stdout: &[u8]) -> Result<Token, Error> {
        let envelope: Envelope =
            serde_json::from_slice(stdout).map_err(|source| Error::ParseCliOutput { source })?;

        if envelope.status != 0 {
            return Err(Error::CliFailed {
                org: self.org_label(),
                name: envelope.name.unwrap_or_default(),
                message: envelope.message.unwrap_or_default(),
            });
        }

        let org = envelope.result.ok_or(Error::MissingField("result"))?;
        let instance_url = org.instance_url.ok_or(Error::MissingField("instanceUrl"))?;
        let status = org.connected_status.unwrap_or_default();
        match org.access_token {
            Some(access_token) if status == CONNECTED => {
                Token::from_instance_url(&instance_url, access_token)
            }
            _ => Err(Error::CliDisconnected {
                status,
                instance_url,
                username: org.username.unwrap_or_default(),
                warnings: envelope.warnings.join("\n"),
            }),
        }
    }
}

/// The color variables present in the inherited environment; only these are reset to `0`.
fn color_overrides(is_set: impl Fn(&str) -> bool) -> Vec<&'static str> {
    NO_COLOR_ENV.into_iter().filter(|var| is_set(*var)).collect()
}

/// Single-step procedure that completes straight from the CLI output.
pub(crate) struct CliProcedure {
    login: CliLogin,
}

#[async_trait]
impl LoginProcedure for CliProcedure {
    async fn advance(&mut self, _response: Option<Response>) -> Result<Progress, Error> {
        let stdout = self.login.run().await?;
        self.login.parse_org_display(&stdout).map(Progress::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::drive;
    use crate::transport::testing::MockTransport;

    const CONNECTED_OUTPUT: &str = r#"{
        "status": 0,
        "result": {
            "id": "00D000000000001",
            "accessToken": "00D!session",
            "instanceUrl": "https://acme.my.salesforce.com",
            "username": "admin@acme.com",
            "connectedStatus": "Connected",
            "alias": "acme"
        },
        "warnings": []
    }"#;

    #[test]
    fn test_parse_connected_org() {
        let login = CliLogin::new(Some("acme".to_string()));
        let token = login.parse_org_display(CONNECTED_OUTPUT.as_bytes()).unwrap();
        assert_eq!(token, Token::new("acme.my.salesforce.com", "00D!session"));
    }

    #[test]
    fn test_parse_failed_status() {
        let output = r#"{"status": 1, "name": "NoOrgFound", "message": "No org configuration found for name acme"}"#;
        let err = CliLogin::new(None)
            .parse_org_display(output.as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::CliFailed { ref org, .. } if org == "[default]"));
        assert!(err.to_string().contains("No org configuration found"));
    }

    #[test]
    fn test_parse_disconnected_org() {
        let output = r#"{
            "status": 0,
            "result": {
                "instanceUrl": "https://acme.my.salesforce.com",
                "username": "admin@acme.com",
                "connectedStatus": "RefreshTokenAuthError"
            },
            "warnings": ["Refresh token expired"]
        }"#;
        let err = CliLogin::new(Some("acme".to_string()))
            .parse_org_display(output.as_bytes())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Unable to connect to https://acme.my.salesforce.com as admin@acme.com"));
        assert!(message.contains("Refresh token expired"));
    }

    #[test]
    fn test_parse_garbage() {
        let result = CliLogin::new(None).parse_org_display(b"\x1b[31mnot json");
        assert!(matches!(result, Err(Error::ParseCliOutput { .. })));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let login = CliLogin::new(None).exec_path("/nonexistent/bin/sf");
        let mut procedure = login.procedure();
        let result = procedure.advance(None).await;
        assert!(matches!(result, Err(Error::CliUnavailable { .. })));
    }

    #[test]
    fn test_color_overrides_only_present_vars() {
        assert_eq!(
            color_overrides(|var| var == "FORCE_COLOR"),
            vec!["FORCE_COLOR"]
        );
        assert!(color_overrides(|_| false).is_empty());
        assert_eq!(color_overrides(|_| true), NO_COLOR_ENV.to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_cli_is_invoked_with_alias() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let script = dir.path().join("sf");
        let body = format!(
            "#!/bin/sh\necho \"$@\" > '{}'\ncat <<'EOF'\n{}\nEOF\n",
            args_file.display(),
            CONNECTED_OUTPUT
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let login = CliLogin::new(Some("acme".to_string())).exec_path(&script);
        let transport = MockTransport::new();
        let mut procedure = login.procedure();
        let token = drive(&mut procedure, &transport).await.unwrap();

        assert_eq!(token.secret, "00D!session");
        assert!(transport.requests().is_empty());
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "org display --json -o acme");
    }
}
