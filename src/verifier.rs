//! Live credential verification.
//!
//! A subset of rules names a [`VerifierKind`]; after a regex match the
//! verifier performs one benign authenticated request against the issuing
//! service to weed out false positives. Probes ride the shared retrying
//! transport from [`crate::net`]; probe failures and ambiguous responses
//! keep the finding as [`Verified::Unknown`].

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    findings::Verified,
    net::{HttpClient, HttpError},
};

/// Wall-clock bound for a single verification, retries included.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifierKind {
    GithubToken,
    GitlabToken,
    SlackWebhook,
    StripeKey,
}

/// Service endpoints the probes talk to. Overridable so tests can point at a
/// mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub github: Url,
    pub gitlab: Url,
    pub stripe: Url,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            github: Url::parse("https://api.github.com/").expect("static URL"),
            gitlab: Url::parse("https://gitlab.com/").expect("static URL"),
            stripe: Url::parse("https://api.stripe.com/").expect("static URL"),
        }
    }
}

pub struct Verifier {
    http: HttpClient,
    endpoints: Endpoints,
    enabled: bool,
}

impl Verifier {
    pub fn new(
        enabled: bool,
        ignore_proxy: bool,
        cancel: CancellationToken,
    ) -> Result<Self, HttpError> {
        Self::with_endpoints(enabled, ignore_proxy, cancel, Endpoints::default())
    }

    pub fn with_endpoints(
        enabled: bool,
        ignore_proxy: bool,
        cancel: CancellationToken,
        endpoints: Endpoints,
    ) -> Result<Self, HttpError> {
        let http = HttpClient::builder()
            .timeout(VERIFY_TIMEOUT)
            .ignore_proxy(ignore_proxy)
            .build(cancel)?;
        Ok(Self { http, endpoints, enabled })
    }

    /// Verify one matched credential. Never blocks longer than
    /// [`VERIFY_TIMEOUT`]; never fails the caller.
    pub async fn verify(&self, kind: VerifierKind, matched: &str) -> Verified {
        if !self.enabled {
            return Verified::Unknown;
        }
        let probe = async {
            match kind {
                VerifierKind::GithubToken => self.probe_github(matched).await,
                VerifierKind::GitlabToken => self.probe_gitlab(matched).await,
                VerifierKind::SlackWebhook => self.probe_slack_webhook(matched).await,
                VerifierKind::StripeKey => self.probe_stripe(matched).await,
            }
        };
        match tokio::time::timeout(VERIFY_TIMEOUT, probe).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                debug!(?kind, error = %e, "verification probe failed; keeping finding");
                Verified::Unknown
            }
            Err(_) => {
                debug!(?kind, "verification timed out; keeping finding");
                Verified::Unknown
            }
        }
    }

    async fn probe_github(&self, token: &str) -> Result<Verified, HttpError> {
        let url = join(&self.endpoints.github, "user");
        self.account_probe(url, AUTHORIZATION, &format!("Bearer {token}"), "\"login\"").await
    }

    async fn probe_gitlab(&self, token: &str) -> Result<Verified, HttpError> {
        let url = join(&self.endpoints.gitlab, "api/v4/user");
        let name: HeaderName = "PRIVATE-TOKEN".parse().expect("static header name");
        self.account_probe(url, name, token, "\"username\"").await
    }

    async fn probe_stripe(&self, key: &str) -> Result<Verified, HttpError> {
        let url = join(&self.endpoints.stripe, "v1/account");
        self.account_probe(url, AUTHORIZATION, &format!("Bearer {key}"), "\"id\"").await
    }

    /// One authenticated GET against the service's account endpoint: a 2xx
    /// carrying the expected field is a live credential, 401/403 is a dead
    /// one, anything else is ambiguous and the finding is kept.
    async fn account_probe(
        &self,
        url: Url,
        header: HeaderName,
        credential: &str,
        expected_field: &str,
    ) -> Result<Verified, HttpError> {
        let Ok(mut value) = HeaderValue::from_str(credential) else {
            // Matched text that cannot sit in a header cannot be probed.
            return Ok(Verified::Unknown);
        };
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(header, value);

        match self.http.get(url, Some(headers)).await {
            Ok(response) => Ok(classify_body(&response.text().await?, expected_field)),
            Err(e) => classify_rejection(e),
        }
    }

    /// A POST without a message payload never delivers anything: Slack
    /// answers 400 (`no_text`) for a live webhook and 404 for a dead one.
    async fn probe_slack_webhook(&self, webhook_url: &str) -> Result<Verified, HttpError> {
        let Ok(url) = Url::parse(webhook_url) else {
            return Ok(Verified::Unknown);
        };
        match self.http.post_json(url, &serde_json::json!({})).await {
            // A 2xx on an empty payload is not the documented behavior.
            Ok(_) => Ok(Verified::Unknown),
            Err(e) => match e.status() {
                Some(StatusCode::BAD_REQUEST) => Ok(Verified::Valid),
                Some(StatusCode::NOT_FOUND) | Some(StatusCode::FORBIDDEN) | Some(StatusCode::GONE) => {
                    Ok(Verified::Invalid)
                }
                Some(_) => Ok(Verified::Unknown),
                None => Err(e),
            },
        }
    }
}

fn join(base: &Url, path: &str) -> Url {
    base.join(path).unwrap_or_else(|_| base.clone())
}

/// A 2xx body missing the expected account field stays ambiguous and the
/// finding is kept.
fn classify_body(body: &str, expected_field: &str) -> Verified {
    if body.contains(expected_field) {
        Verified::Valid
    } else {
        Verified::Unknown
    }
}

/// Map a failed account probe: explicit auth rejections kill the finding,
/// any other HTTP status is ambiguous, transport errors bubble up so the
/// caller can log them.
fn classify_rejection(error: HttpError) -> Result<Verified, HttpError> {
    match error.status() {
        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => Ok(Verified::Invalid),
        Some(_) => Ok(Verified::Unknown),
        None => Err(error),
    }
}
