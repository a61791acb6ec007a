//! Server-rendered catalogs scraped with CSS selectors.
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{absolutize, collapse_ws, CategoryRef, Cursor, ProductPage, RawPayload, ScrapedCard, SourceAdapter};
use crate::config::HtmlSourceConfig;
use crate::error::FetchError;
use crate::http::{HttpClient, HttpRequest};

fn compile(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector).map_err(|e| FetchError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn compile_all(selectors: &[String]) -> Result<Vec<Selector>, FetchError> {
    selectors.iter().map(|s| compile(s)).collect()
}

struct FieldSelectors {
    name: Vec<Selector>,
    price: Vec<Selector>,
    previous_price: Vec<Selector>,
    image: Vec<Selector>,
    link: Vec<Selector>,
}

pub struct HtmlAdapter {
    cfg: HtmlSourceConfig,
    http: Arc<dyn HttpClient>,
    base: url::Url,
    timeout: Duration,
    category_links: Selector,
    cards: Vec<Selector>,
    fields: FieldSelectors,
}

impl HtmlAdapter {
    pub fn new(
        cfg: HtmlSourceConfig,
        http: Arc<dyn HttpClient>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let base = url::Url::parse(&cfg.base_url)
            .map_err(|e| FetchError::Other(format!("base_url {}: {e}", cfg.base_url)))?;
        let fields = FieldSelectors {
            name: compile_all(&cfg.fields.name)?,
            price: compile_all(&cfg.fields.price)?,
            previous_price: compile_all(&cfg.fields.previous_price)?,
            image: compile_all(&cfg.fields.image)?,
            link: compile_all(&cfg.fields.link)?,
        };
        Ok(Self {
            category_links: compile(&cfg.category_link_selector)?,
            cards: compile_all(&cfg.card_selectors)?,
            fields,
            base,
            http,
            timeout,
            cfg,
        })
    }

    async fn fetch(&self, req: HttpRequest) -> Result<String, FetchError> {
        let req = req.headers(&self.cfg.headers).timeout(self.timeout);
        Ok(self.http.send(req).await?.body)
    }

    // `Html` is not `Send`; parsing stays in sync helpers so no document
    // lives across an await.
    fn parse_categories(&self, body: &str) -> Vec<CategoryRef> {
        let doc = Html::parse_document(body);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for a in doc.select(&self.category_links) {
            let Some(url) = a.value().attr("href").and_then(|h| absolutize(&self.base, h)) else {
                continue;
            };
            let name = collapse_ws(&a.text().collect::<String>());
            if name.is_empty() || !seen.insert(url.clone()) {
                continue;
            }
            out.push(CategoryRef {
                id: None,
                name,
                url: Some(url),
                subcategory: None,
            });
        }
        out
    }

    fn parse_cards(&self, body: &str, category: &CategoryRef) -> Vec<ScrapedCard> {
        let doc = Html::parse_document(body);
        for selector in &self.cards {
            let found: Vec<ElementRef> = doc.select(selector).collect();
            if found.is_empty() {
                continue;
            }
            return found
                .into_iter()
                .map(|card| ScrapedCard {
                    name: first_text(card, &self.fields.name),
                    price_text: first_text(card, &self.fields.price),
                    previous_price_text: first_text(card, &self.fields.previous_price),
                    image_url: first_image(card, &self.fields.image)
                        .and_then(|src| absolutize(&self.base, &src)),
                    product_url: first_attr(card, &self.fields.link, "href")
                        .and_then(|href| absolutize(&self.base, &href)),
                    category: Some(category.name.clone()),
                    subcategory: category.subcategory.as_ref().map(|s| s.name.clone()),
                })
                .collect();
        }
        Vec::new()
    }
}

fn first_text(card: ElementRef, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        card.select(sel)
            .map(|el| collapse_ws(&el.text().collect::<String>()))
            .find(|t| !t.is_empty())
    })
}

fn first_attr(card: ElementRef, selectors: &[Selector], attr: &str) -> Option<String> {
    selectors.iter().find_map(|sel| {
        card.select(sel)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    })
}

// Lazy-loaded images keep the real source in data attributes.
fn first_image(card: ElementRef, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        card.select(sel).find_map(|img| {
            let el = img.value();
            ["src", "data-src", "data-lazy-src"]
                .iter()
                .filter_map(|a| el.attr(a))
                .map(str::trim)
                .find(|v| !v.is_empty() && !v.starts_with("data:"))
                .map(str::to_string)
                .or_else(|| {
                    el.attr("srcset")
                        .and_then(|s| s.split(',').next())
                        .and_then(|s| s.split_whitespace().next())
                        .map(str::to_string)
                })
        })
    })
}

#[async_trait]
impl SourceAdapter for HtmlAdapter {
    fn kind(&self) -> &'static str {
        "html"
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError> {
        let body = self.fetch(HttpRequest::get(&self.cfg.catalog_url)).await?;
        let categories = self.parse_categories(&body);
        info!(catalog = %self.cfg.catalog_url, count = categories.len(), "html categories");
        Ok(categories)
    }

    async fn list_products(
        &self,
        category: &CategoryRef,
        cursor: Option<&Cursor>,
    ) -> Result<ProductPage, FetchError> {
        let Some(url) = category.url.as_deref() else {
            return Err(FetchError::Other(format!("category {} has no url", category.name)));
        };
        let page = match cursor {
            Some(Cursor::Page(n)) => *n,
            _ => 1,
        };
        let mut req = HttpRequest::get(url);
        if let Some(param) = &self.cfg.page_param {
            req = req.query(param, page);
        }
        let body = self.fetch(req).await?;
        let cards = self.parse_cards(&body, category);
        debug!(category = %category.name, page, cards = cards.len(), "html product page");

        let next = match (&self.cfg.page_param, cards.is_empty()) {
            (Some(_), false) => Some(Cursor::Page(page + 1)),
            _ => None,
        };
        Ok(ProductPage {
            payloads: cards.into_iter().map(RawPayload::Card).collect(),
            next,
        })
    }
}
