//! GraphQL storefront APIs queried with fixed documents.
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{CategoryRef, Cursor, ProductPage, RawPayload, SourceAdapter};
use crate::config::GraphqlSourceConfig;
use crate::error::FetchError;
use crate::extract::{Node, NAME_ALIASES};
use crate::http::{HttpClient, HttpRequest};

pub struct GraphqlAdapter {
    cfg: GraphqlSourceConfig,
    http: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl GraphqlAdapter {
    pub fn new(cfg: GraphqlSourceConfig, http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self { cfg, http, timeout }
    }

    async fn execute(&self, query: &str, variables: Map<String, Value>) -> Result<Node, FetchError> {
        let body = json!({ "query": query, "variables": Value::Object(variables) });
        let req = HttpRequest::post_json(&self.cfg.endpoint, body)
            .headers(&self.cfg.headers)
            .timeout(self.timeout);
        let value = self.http.send(req).await?.json()?;
        check_errors(&value)?;
        Ok(Node::from(value))
    }

    fn id_value(&self, id: &str) -> Value {
        if self.cfg.numeric_ids {
            if let Ok(n) = id.parse::<i64>() {
                return Value::from(n);
            }
        }
        Value::from(id)
    }
}

/// A non-empty top-level `errors` array fails the whole call.
fn check_errors(value: &Value) -> Result<(), FetchError> {
    match value.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            Err(FetchError::GraphQl(if messages.is_empty() {
                format!("{} error(s)", errors.len())
            } else {
                messages.join("; ")
            }))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl SourceAdapter for GraphqlAdapter {
    fn kind(&self) -> &'static str {
        "graphql"
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError> {
        let root = self.execute(&self.cfg.categories_query, Map::new()).await?;
        let items = root
            .pointer(&self.cfg.categories_path)
            .and_then(Node::as_sequence)
            .unwrap_or_default();
        let categories: Vec<CategoryRef> = items
            .iter()
            .filter_map(|item| {
                let name = item.first_text(NAME_ALIASES)?;
                Some(CategoryRef {
                    id: item.text("id"),
                    ..CategoryRef::named(name)
                })
            })
            .collect();
        info!(endpoint = %self.cfg.endpoint, count = categories.len(), "graphql categories");
        Ok(categories)
    }

    async fn list_products(
        &self,
        category: &CategoryRef,
        cursor: Option<&Cursor>,
    ) -> Result<ProductPage, FetchError> {
        let Some(id) = category.id.as_deref() else {
            return Err(FetchError::Other(format!("category {} has no id", category.name)));
        };
        let mut variables = Map::new();
        variables.insert(self.cfg.category_id_variable.clone(), self.id_value(id));
        let offset = match cursor {
            Some(Cursor::Offset(n)) => *n,
            _ => 0,
        };
        if let Some(paging) = &self.cfg.paging {
            variables.insert(paging.offset_variable.clone(), Value::from(offset));
            variables.insert(paging.limit_variable.clone(), Value::from(paging.page_size));
        }

        let root = self.execute(&self.cfg.products_query, variables).await?;
        let Some(products) = root.pointer(&self.cfg.products_path).cloned() else {
            debug!(category = %category.name, path = %self.cfg.products_path, "graphql products path missing");
            return Ok(ProductPage::default());
        };
        let count = products.as_sequence().map(<[Node]>::len).unwrap_or(1);
        debug!(category = %category.name, offset, count, "graphql product page");

        let next = match &self.cfg.paging {
            Some(p) if count > 0 && count as u32 >= p.page_size => Some(Cursor::Offset(offset + p.page_size)),
            _ => None,
        };
        if count == 0 {
            return Ok(ProductPage::default());
        }
        Ok(ProductPage {
            payloads: vec![RawPayload::Tree {
                node: products,
                seed: category.seed(),
            }],
            next,
        })
    }
}
