//! Store definitions loaded from a JSON file.
//!
//! Run settings missing from the file fall back to `INGEST_*` environment
//! variables, then to built-in defaults.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::ConfigError;
use crate::util::env::{env_opt, env_parse};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub stores: Vec<StoreConfig>,
}

impl IngestConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&display, &raw)
    }

    pub fn from_json(origin: &str, raw: &str) -> Result<Self, ConfigError> {
        let cfg: IngestConfig = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name.as_str()) {
                return Err(invalid(&store.name, "duplicate store name"));
            }
            store.validate()?;
        }
        Ok(())
    }

    /// Stores selected by an optional name filter (case-insensitive).
    pub fn select(&self, only: &[String]) -> Vec<StoreConfig> {
        self.stores
            .iter()
            .filter(|s| only.is_empty() || only.iter().any(|o| o.eq_ignore_ascii_case(&s.name)))
            .cloned()
            .collect()
    }
}

fn invalid(store: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        store: store.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub category_map: CategoryMapConfig,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid(&self.name, "store name is empty"));
        }
        if self.run.retry_attempts == 0 {
            return Err(invalid(&self.name, "retry_attempts must be at least 1"));
        }
        if self.run.max_depth == 0 {
            return Err(invalid(&self.name, "max_depth must be at least 1"));
        }
        for raw in self.source.urls() {
            url::Url::parse(raw).map_err(|e| invalid(&self.name, format!("bad url {raw:?}: {e}")))?;
        }
        match &self.source {
            SourceConfig::Html(html) if html.card_selectors.is_empty() => {
                return Err(invalid(&self.name, "html source needs at least one card selector"));
            }
            SourceConfig::Graphql(gql) if gql.paging.as_ref().is_some_and(|p| p.page_size == 0) => {
                return Err(invalid(&self.name, "graphql paging.page_size must be at least 1"));
            }
            SourceConfig::PaginatedJson(rest) if rest.page_size == 0 => {
                return Err(invalid(&self.name, "page_size must be at least 1"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Fetch strategy of one retailer, tagged by `kind`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Html(HtmlSourceConfig),
    Graphql(GraphqlSourceConfig),
    PaginatedJson(RestSourceConfig),
    Browser(BrowserSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Html(_) => "html",
            SourceConfig::Graphql(_) => "graphql",
            SourceConfig::PaginatedJson(_) => "paginated_json",
            SourceConfig::Browser(_) => "browser",
        }
    }

    fn urls(&self) -> Vec<&str> {
        match self {
            SourceConfig::Html(c) => vec![c.base_url.as_str(), c.catalog_url.as_str()],
            SourceConfig::Graphql(c) => vec![c.endpoint.as_str()],
            SourceConfig::PaginatedJson(c) => vec![c.base_url.as_str()],
            SourceConfig::Browser(c) => vec![c.start_url.as_str(), c.webdriver_url.as_str()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtmlSourceConfig {
    /// Origin used to absolutize relative links and images.
    pub base_url: String,
    /// Page holding the category menu.
    pub catalog_url: String,
    #[serde(default = "default_category_link_selector")]
    pub category_link_selector: String,
    /// Tried in order; the first selector with any match wins.
    #[serde(default = "default_card_selectors")]
    pub card_selectors: Vec<String>,
    #[serde(default)]
    pub fields: CardFieldSelectors,
    /// Query parameter carrying the page number; `None` fetches one page per category.
    #[serde(default = "default_page_param")]
    pub page_param: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_category_link_selector() -> String {
    "ul.menu__list li.menu__item > a".into()
}

fn default_card_selectors() -> Vec<String> {
    vec![
        "div.products-list__item".into(),
        "div.catalog-item".into(),
        "div.product-item".into(),
    ]
}

fn default_page_param() -> Option<String> {
    Some("page".into())
}

/// Per-field selectors inside a card, each list in priority order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CardFieldSelectors {
    pub name: Vec<String>,
    pub price: Vec<String>,
    pub previous_price: Vec<String>,
    pub image: Vec<String>,
    pub link: Vec<String>,
}

impl Default for CardFieldSelectors {
    fn default() -> Self {
        let v = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            name: v(&[".product__title", ".title", ".product-name"]),
            price: v(&[".product__price--current", ".price", ".product-price"]),
            previous_price: v(&[".product__price--old", ".old-price"]),
            image: v(&[".product__img img", "img"]),
            link: v(&["a"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphqlSourceConfig {
    pub endpoint: String,
    #[serde(default = "default_categories_query")]
    pub categories_query: String,
    /// Dotted path to the category list in the decoded response.
    #[serde(default = "default_categories_path")]
    pub categories_path: String,
    #[serde(default = "default_products_query")]
    pub products_query: String,
    #[serde(default = "default_products_path")]
    pub products_path: String,
    #[serde(default = "default_id_variable")]
    pub category_id_variable: String,
    /// Send the category id as a number when it parses as one.
    #[serde(default = "default_true")]
    pub numeric_ids: bool,
    #[serde(default)]
    pub paging: Option<GraphqlPaging>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_categories_query() -> String {
    "{ categories { id name } }".into()
}

fn default_categories_path() -> String {
    "data.categories".into()
}

fn default_products_query() -> String {
    "query getCategoryProducts($id: Int!) { category(id: $id) { products { id name price image } } }"
        .into()
}

fn default_products_path() -> String {
    "data.category.products".into()
}

fn default_id_variable() -> String {
    "id".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphqlPaging {
    pub offset_variable: String,
    pub limit_variable: String,
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestSourceConfig {
    pub base_url: String,
    #[serde(default = "default_rest_categories_path")]
    pub categories_path: String,
    #[serde(default = "default_rest_categories_field")]
    pub categories_field: String,
    /// `{category_id}` is substituted; `None` means the retailer has a flat taxonomy.
    #[serde(default)]
    pub subcategories_path: Option<String>,
    #[serde(default = "default_rest_subcategories_field")]
    pub subcategories_field: String,
    #[serde(default = "default_rest_products_path")]
    pub products_path: String,
    #[serde(default = "default_rest_products_field")]
    pub products_field: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_rest_categories_path() -> String {
    "categories".into()
}

fn default_rest_categories_field() -> String {
    "categories".into()
}

fn default_rest_subcategories_field() -> String {
    "subcategories".into()
}

fn default_rest_products_path() -> String {
    "products".into()
}

fn default_rest_products_field() -> String {
    "products".into()
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserSourceConfig {
    pub start_url: String,
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_link_pattern")]
    pub category_link_pattern: String,
    #[serde(default = "default_max_category_links")]
    pub max_category_links: usize,
    #[serde(default = "default_scroll_steps")]
    pub max_scroll_steps: u32,
    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,
    #[serde(default = "default_wheel_delta")]
    pub wheel_delta: i64,
    /// Wait after navigation before the first capture drain.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_currency")]
    pub currency_symbol: String,
    #[serde(default = "default_true")]
    pub headless: bool,
}

fn default_webdriver_url() -> String {
    env_opt("WEBDRIVER_URL").unwrap_or_else(|| "http://localhost:4444".into())
}

fn default_link_pattern() -> String {
    "(?i)category|catalog|categories".into()
}

fn default_max_category_links() -> usize {
    100
}

fn default_scroll_steps() -> u32 {
    30
}

fn default_scroll_pause_ms() -> u64 {
    600
}

fn default_wheel_delta() -> i64 {
    8000
}

fn default_settle_ms() -> u64 {
    1500
}

fn default_currency() -> String {
    "₾".into()
}

/// Pacing and bounds of one store run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSettings {
    pub politeness_delay_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub max_pages: u32,
    pub max_depth: usize,
    /// Requests per second across the store's HTTP client; 0 disables the quota.
    pub rps: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            politeness_delay_ms: env_parse("INGEST_POLITENESS_MS", 1000u64),
            retry_attempts: env_parse("INGEST_RETRY_ATTEMPTS", 3u32),
            retry_delay_ms: env_parse("INGEST_RETRY_DELAY_MS", 1500u64),
            request_timeout_ms: env_parse("INGEST_REQUEST_TIMEOUT_MS", 15_000u64),
            max_pages: env_parse("INGEST_MAX_PAGES", 500u32),
            max_depth: 20,
            rps: env_parse("INGEST_RPS", 0u32),
        }
    }
}

/// Keyword classification for products arriving without a category hint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CategoryMapConfig {
    /// Category name to lowercase keywords; earlier entries win.
    pub keywords: IndexMap<String, Vec<String>>,
    /// Used when no keyword matches; `None` leaves the product uncategorized.
    pub fallback: Option<String>,
}

impl Default for CategoryMapConfig {
    fn default() -> Self {
        Self {
            keywords: IndexMap::new(),
            fallback: None,
        }
    }
}
