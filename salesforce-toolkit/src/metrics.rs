//! API usage reported by the `Sforce-Limit-Info` response header.
//!
//! Salesforce attaches a header like
//! `api-usage=18/5000; per-app-api-usage=17/250(appName=sample-app)` to REST responses.

use serde::Serialize;
use std::sync::RwLock;

/// Name of the response header carrying API usage.
pub const LIMIT_INFO_HEADER: &str = "sforce-limit-info";

/// Used versus allowed calls for one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used: u64,
    pub max: u64,
}

impl Usage {
    /// Fraction of the limit consumed, in `0.0..=1.0` for sane values.
    pub fn ratio(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.used as f64 / self.max as f64
    }
}

/// Latest API usage seen on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApiUsage {
    /// Org-wide daily API requests.
    pub api_usage: Option<Usage>,
    /// Per connected app usage, with the app name when reported.
    pub per_app_api_usage: Option<(Usage, Option<String>)>,
}

impl ApiUsage {
    /// Parses a `Sforce-Limit-Info` header value. Unknown entries are ignored.
    pub fn parse(header: &str) -> Self {
        let mut usage = ApiUsage::default();
        for entry in header.split(';') {
            let Some((key, value)) = entry.trim().split_once('=') else {
                continue;
            };
            let (counts, app) = match value.split_once('(') {
                Some((counts, rest)) => {
                    let app = rest
                        .trim_end_matches(')')
                        .strip_prefix("appName=")
                        .map(str::to_string);
                    (counts, app)
                }
                None => (value, None),
            };
            let Some(parsed) = parse_counts(counts) else {
                continue;
            };
            match key {
                "api-usage" => usage.api_usage = Some(parsed),
                "per-app-api-usage" => usage.per_app_api_usage = Some((parsed, app)),
                _ => {}
            }
        }
        usage
    }
}

fn parse_counts(counts: &str) -> Option<Usage> {
    let (used, max) = counts.trim().split_once('/')?;
    Some(Usage {
        used: used.trim().parse().ok()?,
        max: max.trim().parse().ok()?,
    })
}

/// Shared holder for the most recent [`ApiUsage`] of a connection.
#[derive(Debug, Default)]
pub struct UsageTracker {
    latest: RwLock<Option<ApiUsage>>,
}

impl UsageTracker {
    /// Records the usage header of a response, if present.
    pub fn observe(&self, response: &crate::transport::Response) {
        let Some(header) = response.header(LIMIT_INFO_HEADER) else {
            return;
        };
        let usage = ApiUsage::parse(header);
        if let Some(api) = usage.api_usage {
            tracing::trace!(used = api.used, max = api.max, "api usage");
            if api.ratio() >= 0.9 {
                tracing::warn!(used = api.used, max = api.max, "api usage above 90% of the daily limit");
            }
        }
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(usage);
        }
    }

    pub fn latest(&self) -> Option<ApiUsage> {
        self.latest.read().ok().and_then(|guard| guard.clone())
    }
}
