//! Client-rendered storefronts driven through a scripted browser.
//!
//! JSON responses captured while a category page is open are the primary
//! source. Visible DOM cards are scraped only when no capture produced a
//! payload.
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{collapse_ws, CategoryRef, Cursor, ProductPage, RawPayload, ScrapedCard, SourceAdapter};
use crate::config::BrowserSourceConfig;
use crate::error::FetchError;
use crate::extract::{Context, Node};

/// A network response observed by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub url: String,
    pub content_type: String,
    pub body: String,
}

impl CapturedResponse {
    /// JSON-ish content type and a body that opens like a document.
    pub fn is_json_like(&self) -> bool {
        let ct = self.content_type.to_ascii_lowercase();
        let json_type = ct.contains("json") || ct.contains("graphql") || ct.contains("application/vnd");
        let body = self.body.trim_start();
        json_type && (body.starts_with('{') || body.starts_with('['))
    }
}

/// An element whose subtree has an image or a title-like child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomCandidate {
    pub text: String,
    pub title: Option<String>,
    pub image: Option<String>,
    pub image_alt: Option<String>,
}

/// Scripted-browser capability. Implementations own one page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), FetchError>;

    async fn current_url(&self) -> Result<String, FetchError>;

    /// Whether responses fired while the page itself loads are captured.
    fn captures_page_load(&self) -> bool {
        true
    }

    /// Responses captured since the previous call.
    async fn take_captured(&self) -> Result<Vec<CapturedResponse>, FetchError>;

    /// Absolute `href` of every anchor, in document order.
    async fn link_hrefs(&self) -> Result<Vec<String>, FetchError>;

    async fn scroll_height(&self) -> Result<i64, FetchError>;

    async fn wheel(&self, delta_y: i64) -> Result<(), FetchError>;

    async fn dom_candidates(&self) -> Result<Vec<DomCandidate>, FetchError>;

    /// Breadcrumb texts, outermost first.
    async fn breadcrumbs(&self) -> Result<Vec<String>, FetchError>;

    async fn close(&self) -> Result<(), FetchError>;
}

pub struct BrowserAdapter {
    cfg: BrowserSourceConfig,
    session: Arc<dyn BrowserSession>,
    link_pattern: Regex,
    price_pattern: Regex,
}

impl BrowserAdapter {
    pub fn new(cfg: BrowserSourceConfig, session: Arc<dyn BrowserSession>) -> Result<Self, FetchError> {
        let link_pattern = Regex::new(&cfg.category_link_pattern)
            .map_err(|e| FetchError::Other(format!("category_link_pattern: {e}")))?;
        let price_pattern = Regex::new(&format!(
            r"([0-9]+(?:[.,][0-9]{{1,2}})?)\s*{}",
            regex::escape(&cfg.currency_symbol)
        ))
        .map_err(|e| FetchError::Other(format!("price pattern: {e}")))?;
        Ok(Self {
            cfg,
            session,
            link_pattern,
            price_pattern,
        })
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(self.cfg.settle_ms)).await;
    }

    /// Wheel-scrolls until the page stops growing or the step cap is hit.
    async fn auto_scroll(&self) -> Result<u32, FetchError> {
        let pause = Duration::from_millis(self.cfg.scroll_pause_ms);
        let mut last = self.session.scroll_height().await?;
        let mut steps = 0;
        while steps < self.cfg.max_scroll_steps {
            self.session.wheel(self.cfg.wheel_delta).await?;
            tokio::time::sleep(pause).await;
            let height = self.session.scroll_height().await?;
            if height <= last {
                break;
            }
            last = height;
            steps += 1;
        }
        Ok(steps)
    }

    fn trees(captured: Vec<CapturedResponse>) -> Vec<RawPayload> {
        captured
            .into_iter()
            .filter(CapturedResponse::is_json_like)
            .filter_map(|c| match serde_json::from_str::<serde_json::Value>(&c.body) {
                Ok(v) => Some(RawPayload::Tree {
                    node: Node::from(v),
                    seed: Context::default(),
                }),
                Err(e) => {
                    debug!(url = %c.url, error = %e, "captured body is not json");
                    None
                }
            })
            .collect()
    }

    async fn dom_rows(&self) -> Result<Vec<RawPayload>, FetchError> {
        let crumbs = self.session.breadcrumbs().await?;
        let current = self.session.current_url().await?;
        let (category, subcategory) = taxonomy_guess(&crumbs, &current);
        let candidates = self.session.dom_candidates().await?;
        Ok(candidates
            .into_iter()
            .filter_map(|c| self.dom_row(c, &category, &subcategory))
            .map(RawPayload::DomRow)
            .collect())
    }

    fn dom_row(
        &self,
        c: DomCandidate,
        category: &Option<String>,
        subcategory: &Option<String>,
    ) -> Option<ScrapedCard> {
        let text = collapse_ws(&c.text);
        // containers without a currency token are layout, not products
        let price = self
            .price_pattern
            .captures(&text)
            .and_then(|m| m.get(1))
            .map(|m| m.as_str().to_string())?;
        let name = c
            .title
            .map(|t| collapse_ws(&t))
            .filter(|t| !t.is_empty())
            .or_else(|| c.image_alt.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()));
        Some(ScrapedCard {
            name,
            price_text: Some(price),
            image_url: c.image.filter(|i| !i.trim().is_empty()),
            category: category.clone(),
            subcategory: subcategory.clone(),
            ..ScrapedCard::default()
        })
    }
}

/// Breadcrumbs first (skipping the home crumb), then URL path segments.
pub fn taxonomy_guess(crumbs: &[String], page_url: &str) -> (Option<String>, Option<String>) {
    let segments: Vec<String> = url::Url::parse(page_url)
        .ok()
        .map(|u| {
            u.path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    let pick = |i: usize| {
        crumbs
            .get(i)
            .or_else(|| segments.get(i))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    (pick(1), pick(2))
}

fn link_name(link: &str) -> String {
    url::Url::parse(link)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.rfind(|p| !p.is_empty()).map(str::to_string))
        })
        .unwrap_or_else(|| link.to_string())
}

#[async_trait]
impl SourceAdapter for BrowserAdapter {
    fn kind(&self) -> &'static str {
        "browser"
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError> {
        self.session.goto(&self.cfg.start_url).await?;
        self.settle().await;
        let hrefs = self.session.link_hrefs().await?;
        let mut seen = HashSet::new();
        let links: Vec<String> = hrefs
            .into_iter()
            .filter(|h| self.link_pattern.is_match(h))
            .filter(|h| seen.insert(h.clone()))
            .take(self.cfg.max_category_links)
            .collect();
        if links.is_empty() {
            warn!(start = %self.cfg.start_url, "no category links found; using the landing page");
            return Ok(vec![CategoryRef {
                url: Some(self.cfg.start_url.clone()),
                ..CategoryRef::named(link_name(&self.cfg.start_url))
            }]);
        }
        info!(start = %self.cfg.start_url, count = links.len(), "browser category links");
        Ok(links
            .into_iter()
            .map(|link| CategoryRef {
                url: Some(link.clone()),
                ..CategoryRef::named(link_name(&link))
            })
            .collect())
    }

    async fn list_products(
        &self,
        category: &CategoryRef,
        cursor: Option<&Cursor>,
    ) -> Result<ProductPage, FetchError> {
        if cursor.is_some() {
            return Ok(ProductPage::default());
        }
        let url = category.url.as_deref().unwrap_or(&self.cfg.start_url);
        // drop anything captured on the previous page
        self.session.take_captured().await?;
        self.session.goto(url).await?;
        self.settle().await;
        let steps = self.auto_scroll().await?;

        let mut payloads = Self::trees(self.session.take_captured().await?);
        let captured = payloads.len();
        if payloads.is_empty() {
            payloads = self.dom_rows().await?;
        } else if !self.session.captures_page_load() {
            // the first screenful was rendered before capture started
            payloads.extend(self.dom_rows().await?);
        }
        debug!(url, steps, captured, payloads = payloads.len(), "browser category page");
        Ok(ProductPage::last(payloads))
    }

    fn call_budget(&self, request_timeout: Duration) -> Duration {
        let scrolling = self.cfg.scroll_pause_ms * u64::from(self.cfg.max_scroll_steps);
        request_timeout * 3 + Duration::from_millis(self.cfg.settle_ms + scrolling)
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.session.close().await
    }
}
