//! Schema-agnostic discovery of product records inside decoded JSON.
//!
//! Retailer payloads rarely agree on field names or nesting. The extractor
//! walks the tree depth-first, carrying a context of slots (name, price,
//! image, category, subcategory) found on ancestors, and emits a record from
//! every map whose merged context looks like a product.
pub mod price;
pub mod sink;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;

use crate::model::RawObservation;
pub use price::parse_price;
pub use sink::ObservationSink;

pub const NAME_ALIASES: &[&str] = &[
    "name",
    "title",
    "productName",
    "product_name",
    "caption",
    "label",
    "fullName",
    "displayName",
];
pub const PRICE_ALIASES: &[&str] = &[
    "price",
    "currentPrice",
    "salePrice",
    "unitPrice",
    "priceValue",
    "amount",
    "value",
    "finalPrice",
];
pub const IMAGE_ALIASES: &[&str] = &[
    "image",
    "imageUrl",
    "imageURL",
    "img",
    "thumbnail",
    "picture",
    "photo",
    "imageurl",
    "image_src",
];
pub const CATEGORY_ALIASES: &[&str] = &[
    "category",
    "categoryName",
    "category_name",
    "group",
    "groupName",
    "categoryTitle",
];
pub const SUBCATEGORY_ALIASES: &[&str] = &[
    "subcategory",
    "subCategory",
    "subcategoryName",
    "sub_category_name",
    "subGroup",
    "subgroupName",
    "subCategoryTitle",
];

// Read from the emitting node only.
pub const EXTERNAL_ID_ALIASES: &[&str] = &["id", "productId", "product_id", "sku", "apiProductId"];
pub const BARCODE_ALIASES: &[&str] = &["barCode", "barcode", "ean", "gtin", "upc"];
pub const PREVIOUS_PRICE_ALIASES: &[&str] = &[
    "previousPrice",
    "oldPrice",
    "regularPrice",
    "originalPrice",
    "priceBefore",
];
pub const BRAND_ALIASES: &[&str] = &["brand", "brandName", "manufacturer"];
pub const URL_ALIASES: &[&str] = &["url", "link", "href", "productUrl"];
pub const SALE_START_ALIASES: &[&str] = &["saleStart", "sale_start", "promoStart", "discountStart"];
pub const SALE_END_ALIASES: &[&str] = &["saleEnd", "sale_end", "promoEnd", "discountEnd"];

pub const DEFAULT_MAX_DEPTH: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    /// Text form of a usable slot value; nulls, booleans and blank strings are empty.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Scalar::Text(s) => {
                let t = s.trim();
                (!t.is_empty()).then(|| t.to_string())
            }
            Scalar::Number(n) => Some(n.to_string()),
            Scalar::Null | Scalar::Bool(_) => None,
        }
    }

    pub fn as_price(&self) -> Option<BigDecimal> {
        match self {
            Scalar::Number(n) => price::price_from_number(n),
            Scalar::Text(s) => parse_price(s),
            Scalar::Null | Scalar::Bool(_) => None,
        }
    }

    pub fn as_timestamp(&self, end_of_day: bool) -> Option<DateTime<Utc>> {
        match self {
            Scalar::Text(s) => parse_timestamp(s, end_of_day),
            _ => None,
        }
    }

    /// `true`, non-zero numbers and the strings `"true"`/`"1"`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Scalar::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
            Scalar::Null => false,
        }
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` taken as UTC, or a bare date. A bare
/// date is its first second, or its last one when `end_of_day` is set.
pub fn parse_timestamp(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let naive = if end_of_day {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(naive.and_utc())
}

/// Order-preserving view of a decoded JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Map(IndexMap<String, Node>),
    Sequence(Vec<Node>),
    Scalar(Scalar),
}

impl Node {
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Follows a dotted path (`data.category.products`); numeric segments index sequences.
    pub fn pointer(&self, dotted: &str) -> Option<&Node> {
        let mut cur = self;
        for seg in dotted.split('.').filter(|s| !s.is_empty()) {
            cur = match cur {
                Node::Map(m) => m.get(seg)?,
                Node::Sequence(items) => items.get(seg.parse::<usize>().ok()?)?,
                Node::Scalar(_) => return None,
            };
        }
        Some(cur)
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Node]> {
        match self {
            Node::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)?.as_scalar()?.as_text()
    }

    /// First non-empty scalar under any of `aliases`, in alias order.
    pub fn first_scalar(&self, aliases: &[&str]) -> Option<&Scalar> {
        let Node::Map(m) = self else {
            return None;
        };
        aliases.iter().find_map(|alias| match m.get(*alias) {
            Some(Node::Scalar(s)) if s.as_text().is_some() => Some(s),
            _ => None,
        })
    }

    pub fn first_text(&self, aliases: &[&str]) -> Option<String> {
        self.first_scalar(aliases).and_then(Scalar::as_text)
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Object(map) => Node::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
            Value::Array(items) => Node::Sequence(items.into_iter().map(Node::from).collect()),
            Value::String(s) => Node::Scalar(Scalar::Text(s)),
            Value::Number(n) => Node::Scalar(Scalar::Number(n)),
            Value::Bool(b) => Node::Scalar(Scalar::Bool(b)),
            Value::Null => Node::Scalar(Scalar::Null),
        }
    }
}

/// Slots inherited from ancestors (or seeded by the adapter).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub name: Option<String>,
    pub price: Option<Scalar>,
    pub image: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
}

impl Context {
    pub fn with_taxonomy(category: Option<String>, subcategory: Option<String>) -> Self {
        Self {
            category,
            subcategory,
            ..Self::default()
        }
    }

    fn merged(&self, node: &Node) -> Context {
        let mut next = self.clone();
        if let Some(v) = node.first_text(CATEGORY_ALIASES) {
            next.category = Some(v);
        }
        if let Some(v) = node.first_text(SUBCATEGORY_ALIASES) {
            next.subcategory = Some(v);
        }
        if let Some(v) = node.first_text(NAME_ALIASES) {
            next.name = Some(v);
        }
        if let Some(v) = node.first_scalar(PRICE_ALIASES) {
            next.price = Some(v.clone());
        }
        if let Some(v) = node.first_text(IMAGE_ALIASES) {
            next.image = Some(v);
        }
        next
    }
}

#[derive(Debug, Clone)]
pub struct TreeExtractor {
    max_depth: usize,
}

impl Default for TreeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl TreeExtractor {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Walks `root` and offers every product-shaped record to `sink`.
    /// Returns how many records the sink accepted as new.
    pub fn extract(&self, root: &Node, seed: &Context, sink: &mut ObservationSink) -> usize {
        let mut accepted = 0;
        self.walk(root, seed, 0, sink, &mut accepted);
        accepted
    }

    /// Records of one tree, deduplicated within the tree only.
    pub fn collect(&self, root: &Node, seed: &Context) -> Vec<RawObservation> {
        let mut sink = ObservationSink::new();
        self.extract(root, seed, &mut sink);
        sink.drain()
    }

    fn walk(
        &self,
        node: &Node,
        ctx: &Context,
        depth: usize,
        sink: &mut ObservationSink,
        accepted: &mut usize,
    ) {
        if depth > self.max_depth {
            return;
        }
        match node {
            Node::Map(fields) => {
                let ctx = ctx.merged(node);
                if let Some(obs) = emit(node, &ctx) {
                    if sink.offer(obs) {
                        *accepted += 1;
                    }
                }
                for child in fields.values() {
                    self.walk(child, &ctx, depth + 1, sink, accepted);
                }
            }
            Node::Sequence(items) => {
                for child in items {
                    self.walk(child, ctx, depth + 1, sink, accepted);
                }
            }
            Node::Scalar(_) => {}
        }
    }
}

fn emit(node: &Node, ctx: &Context) -> Option<RawObservation> {
    let name = ctx.name.as_deref()?.trim();
    if name.is_empty() {
        return None;
    }
    let price = ctx.price.as_ref().and_then(Scalar::as_price);
    if price.is_none() && ctx.image.is_none() {
        return None;
    }
    Some(RawObservation {
        name: name.to_string(),
        price,
        previous_price: node
            .first_scalar(PREVIOUS_PRICE_ALIASES)
            .and_then(Scalar::as_price),
        image_url: ctx.image.clone(),
        category: ctx.category.clone(),
        subcategory: ctx.subcategory.clone(),
        external_id: node.first_text(EXTERNAL_ID_ALIASES),
        barcode: node.first_text(BARCODE_ALIASES),
        brand: node.first_text(BRAND_ALIASES),
        product_url: node.first_text(URL_ALIASES),
        sale_start: node
            .first_scalar(SALE_START_ALIASES)
            .and_then(|s| s.as_timestamp(false)),
        sale_end: node
            .first_scalar(SALE_END_ALIASES)
            .and_then(|s| s.as_timestamp(true)),
    })
}
