//! [`BrowserSession`] over the W3C WebDriver HTTP protocol.
//!
//! Works against chromedriver, geckodriver or a Selenium grid. Network
//! capture is done in-page by a hook wrapping `fetch` and `XMLHttpRequest`.
//! On chromedriver the hook is registered through CDP when the session
//! starts, so it runs before any page script. Other drivers only get it
//! injected after each navigation, which misses page-load responses.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::browser::{BrowserSession, CapturedResponse, DomCandidate};
use crate::config::BrowserSourceConfig;
use crate::error::FetchError;
use crate::http::{HttpClient, HttpRequest, Method};

const CAPTURE_HOOK: &str = r#"
if (!window.__ingestHooked) {
  window.__ingestHooked = true;
  window.__ingestCaptured = window.__ingestCaptured || [];
  const keep = (url, ct, body) => {
    if (typeof body === 'string' && body.length) {
      window.__ingestCaptured.push({ url: String(url), contentType: ct || '', body: body });
    }
  };
  const origFetch = window.fetch;
  if (origFetch) {
    window.fetch = function () {
      return origFetch.apply(this, arguments).then(resp => {
        try {
          const ct = resp.headers.get('content-type') || '';
          resp.clone().text().then(t => keep(resp.url, ct, t)).catch(() => {});
        } catch (e) {}
        return resp;
      });
    };
  }
  const origOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    this.addEventListener('load', () => {
      try {
        if (this.responseType === '' || this.responseType === 'text') {
          keep(this.responseURL || url, this.getResponseHeader('content-type'), this.responseText);
        }
      } catch (e) {}
    });
    return origOpen.apply(this, arguments);
  };
}
"#;

const DRAIN_CAPTURED: &str = r#"
const out = window.__ingestCaptured || [];
window.__ingestCaptured = [];
return out;
"#;

const LINK_HREFS: &str = "return Array.from(document.querySelectorAll('a[href]')).map(a => a.href);";

const SCROLL_HEIGHT: &str = "return document.body ? document.body.scrollHeight : 0;";

const DOM_CANDIDATES: &str = r#"
const text = el => (el && (el.textContent || '').replace(/\s+/g, ' ').trim()) || '';
const out = [];
document.querySelectorAll('div,li,article,section').forEach(el => {
  const t = text(el);
  if (!/\d/.test(t) || t.length > 2000) return;
  const img = el.querySelector('img');
  const titleEl = el.querySelector('[class*="name"],[class*="title"],h3,h4,.name,.title,[itemprop="name"]');
  if (!img && !titleEl) return;
  let image = null;
  if (img) {
    image = img.getAttribute('src') || img.getAttribute('data-src') || img.getAttribute('srcset') || img.currentSrc || null;
    if (image) { try { image = new URL(image, document.baseURI).href; } catch (e) {} }
  }
  out.push({ text: t, title: titleEl ? text(titleEl) : null, image: image, imageAlt: img ? (img.alt || null) : null });
});
return out;
"#;

const BREADCRUMBS: &str = r#"
const parts = [];
document.querySelectorAll('nav a, .breadcrumb a, [class*="crumb"] a, nav li, .breadcrumb li')
  .forEach(el => { const t = (el.textContent || '').trim(); if (t) parts.push(t); });
return parts.slice(0, 5);
"#;

pub struct WebDriverSession {
    http: Arc<dyn HttpClient>,
    endpoint: String,
    headless: bool,
    timeout: Duration,
    session_id: OnceCell<String>,
    hook_preloaded: AtomicBool,
}

impl WebDriverSession {
    pub fn new(cfg: &BrowserSourceConfig, http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: cfg.webdriver_url.trim_end_matches('/').to_string(),
            headless: cfg.headless,
            timeout,
            session_id: OnceCell::new(),
            hook_preloaded: AtomicBool::new(false),
        }
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--disable-gpu", "--window-size=1366,900"];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }

    async fn session(&self) -> Result<&str, FetchError> {
        let id = self
            .session_id
            .get_or_try_init(|| async {
                let req = HttpRequest::post_json(format!("{}/session", self.endpoint), self.capabilities())
                    .timeout(self.timeout);
                let body = self.http.send(req).await.map_err(browser_err("new session"))?.json()?;
                let id = body
                    .pointer("/value/sessionId")
                    .or_else(|| body.get("sessionId"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| FetchError::Browser("new session: no sessionId in response".into()))?;
                info!(endpoint = %self.endpoint, session = id, "webdriver session started");
                self.preload_hook(id).await;
                Ok::<String, FetchError>(id.to_string())
            })
            .await?;
        Ok(id.as_str())
    }

    /// Registers the capture hook for every new document (chromedriver only).
    async fn preload_hook(&self, session_id: &str) {
        let req = HttpRequest::post_json(
            format!("{}/session/{}/goog/cdp/execute", self.endpoint, session_id),
            json!({
                "cmd": "Page.addScriptToEvaluateOnNewDocument",
                "params": { "source": CAPTURE_HOOK }
            }),
        )
        .timeout(self.timeout);
        match self.http.send(req).await {
            Ok(_) => {
                self.hook_preloaded.store(true, Ordering::Relaxed);
                debug!(session = session_id, "capture hook registered before page load");
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "driver cannot preload scripts; page-load responses will be missed");
            }
        }
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, FetchError> {
        let id = self.session().await?;
        let url = format!("{}/session/{}{}", self.endpoint, id, path);
        let req = match (method, body) {
            (Method::Post, body) => HttpRequest::post_json(url, body.unwrap_or_else(|| json!({}))),
            (Method::Delete, _) => HttpRequest::delete(url),
            (Method::Get, _) => HttpRequest::get(url),
        };
        let resp = self.http.send(req.timeout(self.timeout)).await.map_err(browser_err(path))?;
        let mut value = resp.json()?;
        Ok(value.get_mut("value").map(Value::take).unwrap_or(Value::Null))
    }

    async fn execute(&self, script: &str) -> Result<Value, FetchError> {
        self.command(Method::Post, "/execute/sync", Some(json!({ "script": script, "args": [] })))
            .await
    }
}

fn browser_err(ctx: &str) -> impl Fn(FetchError) -> FetchError + '_ {
    move |e| match e {
        FetchError::Status { status, body } => FetchError::Browser(format!("{ctx}: http {status}: {body}")),
        other => other,
    }
}

fn opt_string(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), FetchError> {
        self.command(Method::Post, "/url", Some(json!({ "url": url }))).await?;
        self.execute(CAPTURE_HOOK).await?;
        debug!(url, "webdriver navigated");
        Ok(())
    }

    fn captures_page_load(&self) -> bool {
        self.hook_preloaded.load(Ordering::Relaxed)
    }

    async fn current_url(&self) -> Result<String, FetchError> {
        let v = self.command(Method::Get, "/url", None).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn take_captured(&self) -> Result<Vec<CapturedResponse>, FetchError> {
        let v = self.execute(DRAIN_CAPTURED).await?;
        Ok(v.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| CapturedResponse {
                        url: opt_string(item, "url").unwrap_or_default(),
                        content_type: opt_string(item, "contentType").unwrap_or_default(),
                        body: opt_string(item, "body").unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn link_hrefs(&self) -> Result<Vec<String>, FetchError> {
        let v = self.execute(LINK_HREFS).await?;
        Ok(v.as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    async fn scroll_height(&self) -> Result<i64, FetchError> {
        let v = self.execute(SCROLL_HEIGHT).await?;
        Ok(v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).unwrap_or(0))
    }

    async fn wheel(&self, delta_y: i64) -> Result<(), FetchError> {
        let actions = json!({
            "actions": [{
                "type": "wheel",
                "id": "ingest-wheel",
                "actions": [{
                    "type": "scroll",
                    "x": 0,
                    "y": 0,
                    "deltaX": 0,
                    "deltaY": delta_y,
                    "origin": "viewport"
                }]
            }]
        });
        self.command(Method::Post, "/actions", Some(actions)).await?;
        Ok(())
    }

    async fn dom_candidates(&self) -> Result<Vec<DomCandidate>, FetchError> {
        let v = self.execute(DOM_CANDIDATES).await?;
        Ok(v.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| DomCandidate {
                        text: opt_string(item, "text").unwrap_or_default(),
                        title: opt_string(item, "title"),
                        image: opt_string(item, "image"),
                        image_alt: opt_string(item, "imageAlt"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn breadcrumbs(&self) -> Result<Vec<String>, FetchError> {
        let v = self.execute(BREADCRUMBS).await?;
        Ok(v.as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), FetchError> {
        if self.session_id.get().is_none() {
            return Ok(());
        }
        self.command(Method::Delete, "", None).await?;
        info!(endpoint = %self.endpoint, "webdriver session closed");
        Ok(())
    }
}
