//! HTTP capability consumed by the source adapters.
use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::FetchError;

const DEFAULT_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            json: None,
            timeout: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            json: Some(body),
            ..Self::get(url)
        }
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value, FetchError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends one request. Non-2xx statuses come back as [`FetchError::Status`].
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// `reqwest`-backed client with an optional requests-per-second quota.
pub struct ReqwestHttp {
    http: reqwest::Client,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ReqwestHttp {
    pub fn new(rps: u32, default_timeout: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/html;q=0.9, */*;q=0.8"));
        let ua = crate::util::env::env_opt("INGEST_USER_AGENT").unwrap_or_else(|| DEFAULT_UA.to_string());
        let ua = HeaderValue::from_str(&ua).map_err(|e| FetchError::Other(format!("user agent: {e}")))?;
        headers.insert(USER_AGENT, ua);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(default_timeout)
            .build()?;
        let limiter = NonZeroU32::new(rps).map(|n| RateLimiter::direct(Quota::per_second(n)));
        Ok(Self { http, limiter })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let mut builder = match req.method {
            Method::Get => self.http.get(&req.url),
            Method::Post => self.http.post(&req.url),
            Method::Delete => self.http.delete(&req.url),
        };
        for (k, v) in &req.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| FetchError::Other(format!("header {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| FetchError::Other(format!("header {k}: {e}")))?;
            builder = builder.header(name, value);
        }
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.json {
            builder = builder.json(body);
        }
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }

        let t0 = Instant::now();
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(req.timeout.map(|t| t.as_millis() as u64).unwrap_or(0))
            } else {
                FetchError::Net(e)
            }
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(url = %req.url, status, body_len = body.len(), elapsed_ms = t0.elapsed().as_millis() as u64, "http response");

        if !(200..300).contains(&status) {
            let sample = body.chars().take(200).collect::<String>();
            warn!(url = %req.url, status, sample_body = %sample, "http non-success status");
            return Err(FetchError::Status {
                status,
                body: sample,
            });
        }
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted client for adapter and orchestrator tests.
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Route = Box<dyn Fn(&HttpRequest) -> Option<Result<HttpResponse, FetchError>> + Send + Sync>;

    #[derive(Default)]
    pub struct FakeHttp {
        routes: Vec<Route>,
        queued: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
        pub seen: Mutex<Vec<HttpRequest>>,
    }

    impl FakeHttp {
        pub fn new() -> Self {
            Self::default()
        }

        /// First route returning `Some` answers the request.
        pub fn route<F>(mut self, f: F) -> Self
        where
            F: Fn(&HttpRequest) -> Option<Result<HttpResponse, FetchError>> + Send + Sync + 'static,
        {
            self.routes.push(Box::new(f));
            self
        }

        pub fn enqueue(self, resp: Result<HttpResponse, FetchError>) -> Self {
            self.queued.lock().expect("lock").push_back(resp);
            self
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().expect("lock").clone()
        }
    }

    pub fn ok(body: impl Into<String>) -> Result<HttpResponse, FetchError> {
        Ok(HttpResponse {
            status: 200,
            body: body.into(),
        })
    }

    pub fn param<'a>(req: &'a HttpRequest, key: &str) -> Option<&'a str> {
        req.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[async_trait]
    impl HttpClient for FakeHttp {
        async fn send(&self, req: HttpRequest) -> Result<HttpResponse, FetchError> {
            self.seen.lock().expect("lock").push(req.clone());
            if let Some(resp) = self.queued.lock().expect("lock").pop_front() {
                return resp;
            }
            for route in &self.routes {
                if let Some(resp) = route(&req) {
                    return resp;
                }
            }
            Err(FetchError::Status {
                status: 404,
                body: format!("no route for {}", req.url),
            })
        }
    }
}
