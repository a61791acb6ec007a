//! Catalog entities shared by the resolver, the recorder and the stores.
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorKind, IngestError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Store {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: i64,
    pub store_id: i64,
    pub name: String,
    pub name_ka: Option<String>,
    pub name_en: Option<String>,
    pub name_ru: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subcategory {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub name_ka: Option<String>,
    pub name_en: Option<String>,
    pub name_ru: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: i64,
    pub store_id: i64,
    pub name: String,
    pub brand: Option<String>,
    pub external_id: Option<String>,
    pub barcode: Option<String>,
    pub image_url: Option<String>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
}

/// Allow-listed fields a new product row may be created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub store_id: i64,
    pub name: String,
    pub brand: Option<String>,
    pub external_id: Option<String>,
    pub barcode: Option<String>,
    pub image_url: Option<String>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
}

/// Last-write-wins update: every `Some` overwrites, `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub external_id: Option<String>,
    pub barcode: Option<String>,
    pub image_url: Option<String>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        *self == ProductPatch::default()
    }

    pub fn apply(&self, product: &mut Product) {
        if let Some(v) = &self.name {
            product.name = v.clone();
        }
        if let Some(v) = &self.brand {
            product.brand = Some(v.clone());
        }
        if let Some(v) = &self.external_id {
            product.external_id = Some(v.clone());
        }
        if let Some(v) = &self.barcode {
            product.barcode = Some(v.clone());
        }
        if let Some(v) = &self.image_url {
            product.image_url = Some(v.clone());
        }
        if let Some(v) = self.category_id {
            product.category_id = Some(v);
        }
        if let Some(v) = self.subcategory_id {
            product.subcategory_id = Some(v);
        }
    }
}

/// Predicate for the attribute rule of the identity chain. Only provided
/// fields take part in the match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductMatch {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub barcode: Option<String>,
    /// Rows carrying a different external id never match.
    pub external_id: Option<String>,
}

impl ProductMatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.brand.is_none() && self.barcode.is_none()
    }

    pub fn matches(&self, product: &Product) -> bool {
        if self.is_empty() {
            return false;
        }
        let eq = |want: &Option<String>, have: &Option<String>| match want {
            Some(w) => have.as_deref() == Some(w.as_str()),
            None => true,
        };
        if let Some(name) = &self.name {
            if product.name != *name {
                return false;
            }
        }
        if !eq(&self.brand, &product.brand) || !eq(&self.barcode, &product.barcode) {
            return false;
        }
        match (&self.external_id, &product.external_id) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceObservation {
    pub id: i64,
    pub product_id: i64,
    pub price: BigDecimal,
    pub previous_price: Option<BigDecimal>,
    pub is_on_sale: bool,
    pub sale_start: Option<DateTime<Utc>>,
    pub sale_end: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPriceObservation {
    pub product_id: i64,
    pub price: BigDecimal,
    pub previous_price: Option<BigDecimal>,
    pub is_on_sale: bool,
    pub sale_start: Option<DateTime<Utc>>,
    pub sale_end: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// Normalized output of extraction; never persisted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawObservation {
    pub name: String,
    pub price: Option<BigDecimal>,
    pub previous_price: Option<BigDecimal>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub external_id: Option<String>,
    pub barcode: Option<String>,
    pub brand: Option<String>,
    pub product_url: Option<String>,
    pub sale_start: Option<DateTime<Utc>>,
    pub sale_end: Option<DateTime<Utc>>,
}

impl RawObservation {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub store: String,
    pub products_seen: usize,
    pub products_created: usize,
    pub prices_recorded: usize,
    pub prices_skipped: usize,
    pub parse_misses: usize,
    pub conflicts: usize,
    pub pages_fetched: usize,
    pub categories_done: usize,
    pub cancelled: bool,
    pub errors: Vec<IngestError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionReport {
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
            products_seen: 0,
            products_created: 0,
            prices_recorded: 0,
            prices_skipped: 0,
            parse_misses: 0,
            conflicts: 0,
            pages_fetched: 0,
            categories_done: 0,
            cancelled: false,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push_error(&mut self, err: IngestError) {
        self.errors.push(err);
    }

    pub fn errors_of(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|e| e.kind == kind).count()
    }

    pub fn is_fatal(&self) -> bool {
        self.errors_of(ErrorKind::Fatal) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str, barcode: Option<&str>, external_id: Option<&str>) -> Product {
        Product {
            id: 1,
            store_id: 1,
            name: name.into(),
            brand: None,
            external_id: external_id.map(str::to_string),
            barcode: barcode.map(str::to_string),
            image_url: None,
            category_id: None,
            subcategory_id: None,
        }
    }

    #[test]
    fn absent_fields_are_left_out_of_the_match() {
        let stored = product("Milk", Some("123"), None);
        let by_name = ProductMatch {
            name: Some("Milk".into()),
            ..ProductMatch::default()
        };
        assert!(by_name.matches(&stored));

        let wrong_barcode = ProductMatch {
            name: Some("Milk".into()),
            barcode: Some("999".into()),
            ..ProductMatch::default()
        };
        assert!(!wrong_barcode.matches(&stored));

        // A stored NULL brand does not equal a provided brand.
        let with_brand = ProductMatch {
            name: Some("Milk".into()),
            brand: Some("Sante".into()),
            ..ProductMatch::default()
        };
        assert!(!with_brand.matches(&stored));
    }

    #[test]
    fn differing_external_ids_never_match() {
        let stored = product("Milk", None, Some("7"));
        let other = ProductMatch {
            name: Some("Milk".into()),
            external_id: Some("8".into()),
            ..ProductMatch::default()
        };
        assert!(!other.matches(&stored));
    }

    #[test]
    fn patch_overwrites_only_present_fields() {
        let mut stored = product("Milk", None, Some("7"));
        stored.image_url = Some("a.png".into());
        let patch = ProductPatch {
            name: Some("Milk 1L".into()),
            barcode: Some("123".into()),
            ..ProductPatch::default()
        };
        patch.apply(&mut stored);
        assert_eq!(stored.name, "Milk 1L");
        assert_eq!(stored.barcode.as_deref(), Some("123"));
        assert_eq!(stored.image_url.as_deref(), Some("a.png"));
    }
}
