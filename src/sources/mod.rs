//! Retailer source adapters.
//!
//! Every retailer channel (server-rendered HTML, GraphQL, paginated JSON,
//! scripted browser) is normalized into [`SourceAdapter`]: a finite list of
//! categories and lazy, restartable product pages of raw payloads.
pub mod browser;
pub mod graphql;
pub mod html;
pub mod rest;
pub mod webdriver;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SourceConfig, StoreConfig};
use crate::error::FetchError;
use crate::extract::{parse_price, Context, Node};
use crate::http::HttpClient;
use crate::model::RawObservation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubcategoryRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRef {
    pub id: Option<String>,
    pub name: String,
    pub url: Option<String>,
    pub subcategory: Option<SubcategoryRef>,
}

impl CategoryRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            url: None,
            subcategory: None,
        }
    }

    /// `Dairy` or `Dairy / Cheese`, for logs and error scopes.
    pub fn label(&self) -> String {
        match &self.subcategory {
            Some(sub) => format!("{} / {}", self.name, sub.name),
            None => self.name.clone(),
        }
    }

    /// Extraction context seeded with this category's taxonomy.
    pub fn seed(&self) -> Context {
        Context::with_taxonomy(
            Some(self.name.clone()),
            self.subcategory.as_ref().map(|s| s.name.clone()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// 1-based page number.
    Page(u32),
    Offset(u32),
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Page(n) => write!(f, "page={n}"),
            Cursor::Offset(n) => write!(f, "offset={n}"),
        }
    }
}

/// A product card scraped from markup (server HTML or a live DOM).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedCard {
    pub name: Option<String>,
    pub price_text: Option<String>,
    pub previous_price_text: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
}

impl ScrapedCard {
    /// `None` is a parse miss: no name, or neither a price nor an image.
    pub fn to_observation(&self) -> Option<RawObservation> {
        let name = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        let price = self.price_text.as_deref().and_then(parse_price);
        let image_url = self.image_url.clone().filter(|s| !s.trim().is_empty());
        if price.is_none() && image_url.is_none() {
            return None;
        }
        Some(RawObservation {
            name: name.to_string(),
            price,
            previous_price: self.previous_price_text.as_deref().and_then(parse_price),
            image_url,
            category: self.category.clone(),
            subcategory: self.subcategory.clone(),
            product_url: self.product_url.clone(),
            ..RawObservation::default()
        })
    }
}

#[derive(Debug, Clone)]
pub enum RawPayload {
    /// Decoded JSON, walked by the tree extractor from `seed`.
    Tree { node: Node, seed: Context },
    Card(ScrapedCard),
    DomRow(ScrapedCard),
}

#[derive(Debug, Clone, Default)]
pub struct ProductPage {
    pub payloads: Vec<RawPayload>,
    pub next: Option<Cursor>,
}

impl ProductPage {
    pub fn last(payloads: Vec<RawPayload>) -> Self {
        Self {
            payloads,
            next: None,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError>;

    /// `cursor == None` requests the first page.
    async fn list_products(
        &self,
        category: &CategoryRef,
        cursor: Option<&Cursor>,
    ) -> Result<ProductPage, FetchError>;

    /// Upper bound for one call, given the configured per-request timeout.
    fn call_budget(&self, request_timeout: Duration) -> Duration {
        request_timeout
    }

    async fn close(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

pub fn build_adapter(
    store: &StoreConfig,
    http: Arc<dyn HttpClient>,
) -> Result<Box<dyn SourceAdapter>, FetchError> {
    let timeout = Duration::from_millis(store.run.request_timeout_ms);
    Ok(match &store.source {
        SourceConfig::Html(cfg) => Box::new(html::HtmlAdapter::new(cfg.clone(), http, timeout)?),
        SourceConfig::Graphql(cfg) => Box::new(graphql::GraphqlAdapter::new(cfg.clone(), http, timeout)),
        SourceConfig::PaginatedJson(cfg) => Box::new(rest::RestAdapter::new(cfg.clone(), http, timeout)?),
        SourceConfig::Browser(cfg) => {
            let session = webdriver::WebDriverSession::new(cfg, http, timeout);
            Box::new(browser::BrowserAdapter::new(cfg.clone(), Arc::new(session))?)
        }
    })
}

/// Joins `href` onto `base`; absolute links pass through.
pub(crate) fn absolutize(base: &url::Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    base.join(href).ok().map(|u| u.to_string())
}

pub(crate) fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cards_without_name_or_value_are_misses() {
        let nameless = ScrapedCard {
            price_text: Some("2,50 ₾".into()),
            ..ScrapedCard::default()
        };
        assert!(nameless.to_observation().is_none());

        let bare = ScrapedCard {
            name: Some("Bread".into()),
            price_text: Some("call us".into()),
            ..ScrapedCard::default()
        };
        assert!(bare.to_observation().is_none());

        let card = ScrapedCard {
            name: Some("  Bread ".into()),
            price_text: Some("2,50 ₾".into()),
            previous_price_text: Some("3,10 ₾".into()),
            category: Some("Bakery".into()),
            ..ScrapedCard::default()
        };
        let obs = card.to_observation().expect("observation");
        assert_eq!(obs.name, "Bread");
        assert_eq!(obs.price.map(|p| p.to_string()), Some("2.50".into()));
        assert_eq!(obs.previous_price.map(|p| p.to_string()), Some("3.10".into()));
        assert_eq!(obs.category.as_deref(), Some("Bakery"));
    }

    #[test]
    fn absolutize_resolves_relative_links() {
        let base = url::Url::parse("https://2nabiji.ge/ge/").expect("url");
        assert_eq!(
            absolutize(&base, "/ge/category/dairy").as_deref(),
            Some("https://2nabiji.ge/ge/category/dairy")
        );
        assert_eq!(
            absolutize(&base, "https://cdn.test/a.png").as_deref(),
            Some("https://cdn.test/a.png")
        );
        assert_eq!(absolutize(&base, "#top"), None);
        assert_eq!(absolutize(&base, "javascript:void(0)"), None);
    }

    #[test]
    fn labels_include_subcategory() {
        let cat = CategoryRef {
            subcategory: Some(SubcategoryRef {
                id: Some("9".into()),
                name: "Cheese".into(),
            }),
            ..CategoryRef::named("Dairy")
        };
        assert_eq!(cat.label(), "Dairy / Cheese");
        assert_eq!(cat.seed().subcategory.as_deref(), Some("Cheese"));
    }
}
