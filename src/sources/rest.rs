//! Paginated JSON APIs (`?category=..&page=..&pageSize=..`).
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CategoryRef, Cursor, ProductPage, RawPayload, SourceAdapter, SubcategoryRef};
use crate::config::RestSourceConfig;
use crate::error::FetchError;
use crate::extract::{Node, NAME_ALIASES};
use crate::http::{HttpClient, HttpRequest};

/// Continuation flags in the order they are reported.
pub const HAS_NEXT_ALIASES: &[&str] = &["hasNextPage", "pagination.hasNext", "hasNext"];

/// Reads every continuation alias present in `body`.
///
/// Any `true` continues. Aliases that disagree are logged, never ranked.
/// `None` means the response carries no continuation flag at all.
pub fn has_next(body: &Node) -> Option<bool> {
    let flags: Vec<(&str, bool)> = HAS_NEXT_ALIASES
        .iter()
        .filter_map(|alias| {
            let scalar = body.pointer(alias)?.as_scalar()?;
            Some((*alias, scalar.is_truthy()))
        })
        .collect();
    if flags.is_empty() {
        return None;
    }
    let any = flags.iter().any(|(_, v)| *v);
    if flags.iter().any(|(_, v)| *v != any) {
        warn!(flags = ?flags, "pagination flags disagree; continuing because one is true");
    }
    Some(any)
}

pub struct RestAdapter {
    cfg: RestSourceConfig,
    http: Arc<dyn HttpClient>,
    base: url::Url,
    timeout: Duration,
}

impl RestAdapter {
    pub fn new(
        cfg: RestSourceConfig,
        http: Arc<dyn HttpClient>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut raw = cfg.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = url::Url::parse(&raw)
            .map_err(|e| FetchError::Other(format!("base_url {}: {e}", cfg.base_url)))?;
        Ok(Self {
            cfg,
            http,
            base,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, FetchError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map(|u| u.to_string())
            .map_err(|e| FetchError::Other(format!("path {path}: {e}")))
    }

    async fn get(&self, req: HttpRequest) -> Result<Node, FetchError> {
        let req = req.headers(&self.cfg.headers).timeout(self.timeout);
        Ok(Node::from(self.http.send(req).await?.json()?))
    }

    // Lists under `field`, or the body itself when it is already a list.
    fn entries(body: &Node, field: &str) -> Vec<(Option<String>, String)> {
        let items = body
            .get(field)
            .and_then(Node::as_sequence)
            .or_else(|| body.as_sequence())
            .unwrap_or_default();
        items
            .iter()
            .filter_map(|item| Some((item.text("id"), item.first_text(NAME_ALIASES)?)))
            .collect()
    }

    async fn subcategories(&self, category_id: &str) -> Result<Vec<SubcategoryRef>, FetchError> {
        let Some(path) = &self.cfg.subcategories_path else {
            return Ok(Vec::new());
        };
        let url = self.endpoint(&path.replace("{category_id}", category_id))?;
        let body = self.get(HttpRequest::get(url)).await?;
        Ok(Self::entries(&body, &self.cfg.subcategories_field)
            .into_iter()
            .map(|(id, name)| SubcategoryRef { id, name })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for RestAdapter {
    fn kind(&self) -> &'static str {
        "paginated_json"
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError> {
        let url = self.endpoint(&self.cfg.categories_path)?;
        let body = self.get(HttpRequest::get(url)).await?;
        let mut out = Vec::new();
        for (id, name) in Self::entries(&body, &self.cfg.categories_field) {
            let parent = CategoryRef {
                id: id.clone(),
                ..CategoryRef::named(name)
            };
            let subs = match id.as_deref() {
                Some(id) => match self.subcategories(id).await {
                    Ok(subs) => subs,
                    Err(e) => {
                        warn!(category = %parent.name, error = %e, "subcategory listing failed; ingesting flat");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            if subs.is_empty() {
                out.push(parent);
            } else {
                out.extend(subs.into_iter().map(|sub| CategoryRef {
                    subcategory: Some(sub),
                    ..parent.clone()
                }));
            }
        }
        info!(base = %self.base, count = out.len(), "rest categories");
        Ok(out)
    }

    async fn list_products(
        &self,
        category: &CategoryRef,
        cursor: Option<&Cursor>,
    ) -> Result<ProductPage, FetchError> {
        let Some(id) = category.id.as_deref() else {
            return Err(FetchError::Other(format!("category {} has no id", category.name)));
        };
        let page = match cursor {
            Some(Cursor::Page(n)) => *n,
            _ => 1,
        };
        let mut req = HttpRequest::get(self.endpoint(&self.cfg.products_path)?)
            .query("category", id)
            .query("page", page)
            .query("pageSize", self.cfg.page_size);
        if let Some(sub_id) = category.subcategory.as_ref().and_then(|s| s.id.as_deref()) {
            req = req.query("subcategory", sub_id);
        }
        let body = self.get(req).await?;

        let products = body
            .get(&self.cfg.products_field)
            .cloned()
            .unwrap_or_else(|| body.clone());
        let count = products.as_sequence().map(<[Node]>::len).unwrap_or(0);
        debug!(category = %category.label(), page, count, "rest product page");
        if count == 0 {
            return Ok(ProductPage::default());
        }

        // Without any flag, a full page suggests more.
        let more = has_next(&body).unwrap_or(count as u32 >= self.cfg.page_size);
        Ok(ProductPage {
            payloads: vec![RawPayload::Tree {
                node: products,
                seed: category.seed(),
            }],
            next: more.then_some(Cursor::Page(page + 1)),
        })
    }
}
