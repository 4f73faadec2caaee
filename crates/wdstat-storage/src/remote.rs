//! Authenticated, retried client for the Wikibase action API and the SPARQL endpoint.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::multipart::Form;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use wdstat_core::{Change, EditPayload, RemoteEntity};

pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_QUERY_URL: &str = "https://query.wikidata.org/sparql";

/// Every failure here is fatal for the run; rate limiting never surfaces as an error.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("giving up after {attempts} attempts (status {status:?}): {body}")]
    RetriesExhausted {
        attempts: usize,
        status: Option<u16>,
        body: String,
    },
    #[error("remote api error: {0}")]
    Api(JsonValue),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("entity {0} does not exist")]
    MissingEntity(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("encoding edit payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts that end in a non-success response; rate-limited attempts are not counted.
    pub max_attempts: usize,
    pub failure_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            failure_delay: Duration::from_secs(10),
        }
    }
}

/// Result of one HTTP round trip, before the retry policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(JsonValue),
    RateLimited(Duration),
    Failed { status: Option<u16>, body: String },
}

pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Classifies a response. A wait directive wins over everything else; an `error`
/// field in a successful JSON body is fatal straight away.
pub fn classify_response(
    status: u16,
    wait: Option<Duration>,
    body: String,
) -> Result<AttemptOutcome, RemoteError> {
    if let Some(wait) = wait {
        return Ok(AttemptOutcome::RateLimited(wait));
    }
    if !(200..300).contains(&status) {
        return Ok(AttemptOutcome::Failed {
            status: Some(status),
            body,
        });
    }
    match serde_json::from_str::<JsonValue>(&body) {
        Ok(json) => match json.get("error") {
            Some(error) => Err(RemoteError::Api(error.clone())),
            None => Ok(AttemptOutcome::Success(json)),
        },
        Err(_) => Ok(AttemptOutcome::Failed {
            status: Some(status),
            body,
        }),
    }
}

/// Drives `attempt` until it succeeds, honouring wait directives without limit and
/// retrying failures after a fixed delay up to the policy's attempt budget.
pub async fn with_retry<F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<JsonValue, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<AttemptOutcome, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = 0usize;
    loop {
        match attempt().await? {
            AttemptOutcome::Success(body) => return Ok(body),
            AttemptOutcome::RateLimited(wait) => {
                debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                tokio::time::sleep(wait).await;
            }
            AttemptOutcome::Failed { status, body } => {
                failures += 1;
                if failures >= max_attempts {
                    return Err(RemoteError::RetriesExhausted {
                        attempts: failures,
                        status,
                        body,
                    });
                }
                warn!(attempt = failures, max_attempts, status = ?status, "request failed, retrying");
                tokio::time::sleep(policy.failure_delay).await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assertion {
    Bot,
    /// Only for the token and login bootstrap.
    Skip,
}

/// Ordered query parameters for an action call; encoding is left to the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiParams {
    pairs: Vec<(String, String)>,
}

impl ApiParams {
    pub fn action(action: &str, maxlag: u32) -> Self {
        Self {
            pairs: vec![
                ("action".to_string(), action.to_string()),
                ("format".to_string(), "json".to_string()),
                ("maxlag".to_string(), maxlag.to_string()),
                ("bot".to_string(), "true".to_string()),
            ],
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.pairs.push((key.to_string(), value.into()));
        self
    }

    pub fn assertion(self, assertion: Assertion, bot_user: Option<&str>) -> Self {
        match (assertion, bot_user) {
            (Assertion::Bot, Some(user)) => self.with("assertuser", user).with("assert", "bot"),
            (Assertion::Bot, None) => self.with("assert", "bot"),
            (Assertion::Skip, _) => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub api_url: String,
    pub query_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub bot_user: Option<String>,
    pub maxlag: u32,
    pub retry: RetryPolicy,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            query_url: DEFAULT_QUERY_URL.to_string(),
            user_agent: "wdstat-bot/0.1".to_string(),
            timeout: Duration::from_secs(30),
            bot_user: None,
            maxlag: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// One SPARQL result cell.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Binding {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

pub type BindingRow = BTreeMap<String, Binding>;

/// Read and write seam used by the batcher and the sync pipeline.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_entity(&self, id: &str) -> Result<RemoteEntity, RemoteError>;
    async fn submit_edit(&self, id: &str, changes: &[Change]) -> Result<(), RemoteError>;
}

/// Session-holding client. Cookies persist across calls; write tokens never do.
#[derive(Debug)]
pub struct WikibaseClient {
    client: reqwest::Client,
    config: RemoteClientConfig,
}

impl WikibaseClient {
    pub fn new(config: RemoteClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteClientConfig {
        &self.config
    }

    fn params(&self, action: &str, assertion: Assertion) -> ApiParams {
        ApiParams::action(action, self.config.maxlag)
            .assertion(assertion, self.config.bot_user.as_deref())
    }

    async fn attempt(request: reqwest::RequestBuilder) -> Result<AttemptOutcome, RemoteError> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Ok(AttemptOutcome::Failed {
                    status: None,
                    body: err.to_string(),
                })
            }
        };
        let status = response.status().as_u16();
        let wait = retry_after(response.headers());
        match response.text().await {
            Ok(body) => classify_response(status, wait, body),
            Err(err) => Ok(AttemptOutcome::Failed {
                status: Some(status),
                body: err.to_string(),
            }),
        }
    }

    async fn get_action(&self, params: &ApiParams) -> Result<JsonValue, RemoteError> {
        let span = info_span!("remote_get", action = params.get("action").unwrap_or_default());
        with_retry(&self.config.retry, || {
            Self::attempt(self.client.get(&self.config.api_url).query(params.pairs()))
        })
        .instrument(span)
        .await
    }

    async fn post_action(
        &self,
        params: &ApiParams,
        form: &[(&str, String)],
    ) -> Result<JsonValue, RemoteError> {
        let span = info_span!("remote_post", action = params.get("action").unwrap_or_default());
        with_retry(&self.config.retry, || {
            let multipart = form
                .iter()
                .fold(Form::new(), |acc, (key, value)| acc.text(key.to_string(), value.clone()));
            Self::attempt(
                self.client
                    .post(&self.config.api_url)
                    .query(params.pairs())
                    .multipart(multipart),
            )
        })
        .instrument(span)
        .await
    }

    /// Fetches a token of the given type; tokens are requested without the bot assertion.
    async fn token(&self, kind: &str) -> Result<String, RemoteError> {
        let params = self
            .params("query", Assertion::Skip)
            .with("meta", "tokens")
            .with("type", kind);
        let body = self.get_action(&params).await?;
        body.pointer(&format!("/query/tokens/{kind}token"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::UnexpectedResponse(format!("no {kind} token in {body}")))
    }

    /// Two-step login: fetch a login token, then post the credentials with it.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), RemoteError> {
        let login_token = self.token("login").await?;
        let params = self
            .params("clientlogin", Assertion::Skip)
            .with("loginreturnurl", "http://example.org/");
        let body = self
            .post_action(
                &params,
                &[
                    ("logintoken", login_token),
                    ("username", username.to_string()),
                    ("password", password.to_string()),
                ],
            )
            .await?;
        match body.pointer("/clientlogin/status").and_then(JsonValue::as_str) {
            Some("PASS") => {
                info!(username, "logged in");
                Ok(())
            }
            _ => Err(RemoteError::LoginRejected(
                body.pointer("/clientlogin/message")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string()),
            )),
        }
    }

    pub async fn get_entity(&self, id: &str) -> Result<RemoteEntity, RemoteError> {
        let params = self.params("wbgetentities", Assertion::Bot).with("ids", id);
        let body = self.get_action(&params).await?;
        let entity = body
            .get("entities")
            .and_then(|entities| entities.get(id))
            .ok_or_else(|| RemoteError::MissingEntity(id.to_string()))?;
        if entity.get("missing").is_some() {
            return Err(RemoteError::MissingEntity(id.to_string()));
        }
        Ok(serde_json::from_value(entity.clone())?)
    }

    /// Runs a discovery query. Runs of whitespace are collapsed before encoding.
    pub async fn run_query(&self, query: &str) -> Result<Vec<BindingRow>, RemoteError> {
        let collapsed = collapse_whitespace(query);
        let span = info_span!("sparql_query");
        let body = with_retry(&self.config.retry, || {
            Self::attempt(
                self.client
                    .get(&self.config.query_url)
                    .header(ACCEPT, "application/sparql-results+json")
                    .query(&[("query", collapsed.as_str()), ("format", "json")]),
            )
        })
        .instrument(span)
        .await?;
        let bindings = body
            .pointer("/results/bindings")
            .cloned()
            .ok_or_else(|| RemoteError::UnexpectedResponse("query result has no bindings".to_string()))?;
        Ok(serde_json::from_value(bindings)?)
    }

    /// Posts `changes` as one edit with a freshly fetched write token.
    pub async fn edit_entity(&self, id: &str, changes: &[Change]) -> Result<(), RemoteError> {
        if changes.is_empty() {
            return Ok(());
        }
        let token = self.token("csrf").await?;
        let data = serde_json::to_string(&EditPayload::from_changes(changes))?;
        let params = self.params("wbeditentity", Assertion::Bot);
        self.post_action(
            &params,
            &[("token", token), ("id", id.to_string()), ("data", data)],
        )
        .await?;
        info!(entity = id, changes = changes.len(), "entity updated");
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for WikibaseClient {
    async fn fetch_entity(&self, id: &str) -> Result<RemoteEntity, RemoteError> {
        self.get_entity(id).await
    }

    async fn submit_edit(&self, id: &str, changes: &[Change]) -> Result<(), RemoteError> {
        self.edit_entity(id, changes).await
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !previous_space {
                out.push(c);
            }
            previous_space = true;
        } else {
            out.push(c);
            previous_space = false;
        }
    }
    out
}
