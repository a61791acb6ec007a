//! Identity resolution: decides whether an observation is a known product.
//!
//! Keys are tried in order: (store, external id), then (store, name, brand,
//! barcode) over the fields present, then a new row. Callers hold the
//! per-store lock (`CatalogTx::lock_store`) for the enclosing transaction.
use anyhow::Result;
use tracing::{debug, warn};

use crate::config::CategoryMapConfig;
use crate::model::{NewProduct, Product, ProductMatch, ProductPatch, RawObservation, Store};
use crate::store::{CatalogTx, InsertOutcome};

/// Keyword classifier for observations that carry no category hint.
#[derive(Debug, Clone, Default)]
pub struct CategoryMapper {
    rules: Vec<(String, Vec<String>)>,
    fallback: Option<String>,
}

impl CategoryMapper {
    pub fn from_config(cfg: &CategoryMapConfig) -> Self {
        let rules = cfg
            .keywords
            .iter()
            .map(|(category, words)| {
                let words = words
                    .iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect();
                (category.clone(), words)
            })
            .collect();
        Self {
            rules,
            fallback: cfg.fallback.clone(),
        }
    }

    pub fn classify(&self, product_name: &str) -> Option<&str> {
        let lower = product_name.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w.as_str())))
            .map(|(category, _)| category.as_str())
            .or(self.fallback.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    ExternalId,
    Attributes,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub product: Product,
    pub matched_by: MatchedBy,
    /// Another writer created the same external id first; converged onto its row.
    pub conflict: bool,
}

impl Resolution {
    pub fn created(&self) -> bool {
        self.matched_by == MatchedBy::Created && !self.conflict
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    mapper: CategoryMapper,
}

impl IdentityResolver {
    pub fn new(mapper: CategoryMapper) -> Self {
        Self { mapper }
    }

    pub async fn resolve(
        &self,
        tx: &mut dyn CatalogTx,
        store: &Store,
        obs: &RawObservation,
    ) -> Result<Resolution> {
        let (category_id, subcategory_id) = self.taxonomy(tx, store, obs).await?;
        let patch = ProductPatch {
            name: Some(obs.name.trim().to_string()),
            brand: obs.brand.clone(),
            external_id: obs.external_id.clone(),
            barcode: obs.barcode.clone(),
            image_url: obs.image_url.clone(),
            category_id,
            subcategory_id,
        };

        if let Some(ext) = obs.external_id.as_deref() {
            if let Some(found) = tx.find_product_by_external_id(store.id, ext).await? {
                let product = tx.update_product(found.id, &patch).await?;
                return Ok(Resolution {
                    product,
                    matched_by: MatchedBy::ExternalId,
                    conflict: false,
                });
            }
        }

        let filter = ProductMatch {
            name: patch.name.clone(),
            brand: obs.brand.clone(),
            barcode: obs.barcode.clone(),
            external_id: obs.external_id.clone(),
        };
        if let Some(found) = tx.find_product_by_attributes(store.id, &filter).await? {
            let product = tx.update_product(found.id, &patch).await?;
            return Ok(Resolution {
                product,
                matched_by: MatchedBy::Attributes,
                conflict: false,
            });
        }

        let new = NewProduct {
            store_id: store.id,
            name: obs.name.trim().to_string(),
            brand: obs.brand.clone(),
            external_id: obs.external_id.clone(),
            barcode: obs.barcode.clone(),
            image_url: obs.image_url.clone(),
            category_id,
            subcategory_id,
        };
        match tx.insert_product(&new).await? {
            InsertOutcome::Created(product) => {
                debug!(store = %store.name, product_id = product.id, name = %product.name, "created product");
                Ok(Resolution {
                    product,
                    matched_by: MatchedBy::Created,
                    conflict: false,
                })
            }
            InsertOutcome::Existing(existing) => {
                warn!(store = %store.name, product_id = existing.id, external_id = ?new.external_id, "identity conflict; converging on existing row");
                let product = tx.update_product(existing.id, &patch).await?;
                Ok(Resolution {
                    product,
                    matched_by: MatchedBy::Created,
                    conflict: true,
                })
            }
        }
    }

    async fn taxonomy(
        &self,
        tx: &mut dyn CatalogTx,
        store: &Store,
        obs: &RawObservation,
    ) -> Result<(Option<i64>, Option<i64>)> {
        let hinted = obs
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let Some(category_name) = hinted.or_else(|| self.mapper.classify(&obs.name)) else {
            return Ok((None, None));
        };
        let category = tx.ensure_category(store.id, category_name).await?;
        let subcategory = match obs.subcategory.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                Some(tx.ensure_subcategory(category.id, name).await?.id)
            }
            _ => None,
        };
        Ok((Some(category.id), subcategory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogStore, MemoryCatalogStore};
    use indexmap::IndexMap;

    async fn resolve_all(
        store: &MemoryCatalogStore,
        resolver: &IdentityResolver,
        observations: &[RawObservation],
    ) -> Vec<Resolution> {
        let s = store.ensure_store("Spar").await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        tx.lock_store(s.id).await.expect("lock");
        let mut out = Vec::new();
        for obs in observations {
            out.push(resolver.resolve(tx.as_mut(), &s, obs).await.expect("resolve"));
        }
        tx.commit().await.expect("commit");
        out
    }

    #[tokio::test]
    async fn replaying_the_same_identity_creates_one_product() {
        let store = MemoryCatalogStore::new();
        let resolver = IdentityResolver::default();
        let obs = RawObservation {
            external_id: Some("42".into()),
            ..RawObservation::named("Bread")
        };
        let first = resolve_all(&store, &resolver, &[obs.clone()]).await;
        let again = resolve_all(&store, &resolver, &vec![obs; 5]).await;

        assert!(first[0].created());
        assert!(again.iter().all(|r| r.matched_by == MatchedBy::ExternalId));
        assert_eq!(store.snapshot().await.products.len(), 1);
    }

    #[tokio::test]
    async fn later_observation_overwrites_present_fields() {
        let store = MemoryCatalogStore::new();
        let resolver = IdentityResolver::default();
        let first = RawObservation {
            external_id: Some("7".into()),
            image_url: Some("milk.png".into()),
            ..RawObservation::named("Milk")
        };
        let second = RawObservation {
            external_id: Some("7".into()),
            barcode: Some("123".into()),
            ..RawObservation::named("Milk 1L")
        };
        resolve_all(&store, &resolver, &[first, second]).await;

        let products = store.snapshot().await.products;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].name, "Milk 1L");
        assert_eq!(products[0].barcode.as_deref(), Some("123"));
        assert_eq!(products[0].image_url.as_deref(), Some("milk.png"));
    }

    #[tokio::test]
    async fn attribute_match_without_external_id() {
        let store = MemoryCatalogStore::new();
        let resolver = IdentityResolver::default();
        let a = RawObservation {
            barcode: Some("4860001".into()),
            ..RawObservation::named("Kefir")
        };
        let b = RawObservation {
            image_url: Some("kefir.png".into()),
            ..RawObservation::named("Kefir")
        };
        let out = resolve_all(&store, &resolver, &[a, b]).await;
        assert_eq!(out[1].matched_by, MatchedBy::Attributes);
        assert_eq!(store.snapshot().await.products.len(), 1);
    }

    #[tokio::test]
    async fn different_external_ids_stay_distinct_products() {
        let store = MemoryCatalogStore::new();
        let resolver = IdentityResolver::default();
        let a = RawObservation {
            external_id: Some("1".into()),
            ..RawObservation::named("Water 0.5L")
        };
        let b = RawObservation {
            external_id: Some("2".into()),
            ..RawObservation::named("Water 0.5L")
        };
        resolve_all(&store, &resolver, &[a, b]).await;
        assert_eq!(store.snapshot().await.products.len(), 2);
    }

    #[tokio::test]
    async fn category_hints_and_mapper_fill_taxonomy() {
        let store = MemoryCatalogStore::new();
        let mut keywords = IndexMap::new();
        keywords.insert("Milk & Dairy".to_string(), vec!["milk".to_string(), "cheese".to_string()]);
        let resolver = IdentityResolver::new(CategoryMapper::from_config(&CategoryMapConfig {
            keywords,
            fallback: Some("Other".into()),
        }));
        let hinted = RawObservation {
            category: Some("Dairy".into()),
            subcategory: Some("Cheese".into()),
            ..RawObservation::named("Gouda")
        };
        let mapped = RawObservation::named("Sante Milk 2.5%");
        let other = RawObservation::named("Dish soap");
        resolve_all(&store, &resolver, &[hinted, mapped, other]).await;

        let snap = store.snapshot().await;
        let names: Vec<_> = snap.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dairy", "Milk & Dairy", "Other"]);
        assert_eq!(snap.subcategories.len(), 1);
        assert!(snap.products.iter().all(|p| p.category_id.is_some()));
    }

    #[test]
    fn mapper_without_fallback_leaves_unknowns_uncategorized() {
        let mut keywords = IndexMap::new();
        keywords.insert("Drinks".to_string(), vec!["Juice".to_string()]);
        let mapper = CategoryMapper::from_config(&CategoryMapConfig {
            keywords,
            fallback: None,
        });
        assert_eq!(mapper.classify("Orange JUICE 1L"), Some("Drinks"));
        assert_eq!(mapper.classify("Soap"), None);
    }
}
