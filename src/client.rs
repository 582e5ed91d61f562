use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};

use crate::delay_manager::{self, DelayPolicy};
use crate::error::FetchError;
use crate::record::Job;

pub const DEFAULT_URL_TEMPLATE: &str = "https://boardgamegeek.com/xmlapi2/thing?id={id}&stats=1";

/// Status plus body of one GET. Owned by the worker that fetched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One HTTP GET. Errors are request-level faults (timeout, connection).
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<RawResponse, String>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/xml, text/xml"));
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<RawResponse, String> {
        let resp = self.client.get(url).send().map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let body = resp.bytes().map_err(|e| e.to_string())?;
        Ok(RawResponse { status, body: body.to_vec() })
    }
}

/// Issues the request for one job and owns the 429 cooldown loop.
///
/// Stateless between calls, so one instance is shared read-only by all
/// workers; each call paces itself.
pub struct RateLimitedClient {
    transport: Box<dyn Transport>,
    url_template: String,
    policy: DelayPolicy,
}

impl RateLimitedClient {
    pub fn new(
        transport: Box<dyn Transport>,
        url_template: impl Into<String>,
        policy: DelayPolicy,
    ) -> Self {
        RateLimitedClient {
            transport,
            url_template: url_template.into(),
            policy,
        }
    }

    pub fn url_for(&self, job: &Job) -> String {
        self.url_template
            .replace("{id}", &urlencoding::encode(&job.external_id))
    }

    pub fn fetch(&self, job: &Job) -> Result<RawResponse, FetchError> {
        let url = self.url_for(job);
        let mut rate_limited = 0;

        loop {
            delay_manager::request_delay(&self.policy);
            debug!("GET {}", url);

            let resp = self.transport.get(&url).map_err(FetchError::Transient)?;
            match resp.status {
                200 => return Ok(resp),
                429 if rate_limited < self.policy.max_rate_limit_retries => {
                    rate_limited += 1;
                    warn!(
                        "Rate limited for game {}, waiting {:?} ({}/{})...",
                        job.external_id,
                        self.policy.rate_limit_cooldown,
                        rate_limited,
                        self.policy.max_rate_limit_retries
                    );
                    delay_manager::rate_limit_cooldown(&self.policy);
                }
                429 => {
                    return Err(FetchError::RateLimited { attempts: rate_limited + 1 });
                }
                other => {
                    return Err(FetchError::Transient(format!("API returned status code {other}")));
                }
            }
        }
    }
}
