//! In-process catalog used for `--memory` dry runs and tests.
//!
//! A transaction holds the store-wide lock from `begin` to `commit`, works
//! on a staged copy of the state and swaps it in on commit.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{check_savepoint_name, CatalogStore, CatalogTx, InsertOutcome};
use crate::model::{
    Category, NewPriceObservation, NewProduct, PriceObservation, Product, ProductMatch,
    ProductPatch, Store, Subcategory,
};
use crate::record::current_price;

// NUMERIC(12, 2) leaves ten integer digits.
const MAX_PRICE_INTEGER_DIGITS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    next_id: i64,
    pub stores: Vec<Store>,
    pub categories: Vec<Category>,
    pub subcategories: Vec<Subcategory>,
    pub products: Vec<Product>,
    pub prices: Vec<PriceObservation>,
}

impl CatalogState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> CatalogState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn ensure_store(&self, name: &str) -> Result<Store> {
        let mut state = self.state.lock().await;
        if let Some(s) = state.stores.iter().find(|s| s.name == name) {
            return Ok(s.clone());
        }
        let store = Store {
            id: state.next_id(),
            name: name.to_string(),
        };
        state.stores.push(store.clone());
        Ok(store)
    }

    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            savepoints: Vec::new(),
        }))
    }

    async fn current_price(&self, product_id: i64) -> Result<Option<PriceObservation>> {
        let state = self.state.lock().await;
        let rows: Vec<PriceObservation> = state
            .prices
            .iter()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect();
        Ok(current_price(&rows).cloned())
    }

    async fn product_count(&self, store_id: i64) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.products.iter().filter(|p| p.store_id == store_id).count() as i64)
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<CatalogState>,
    staged: CatalogState,
    savepoints: Vec<(String, CatalogState)>,
}

fn integer_digits(value: &BigDecimal) -> usize {
    let (digits, scale) = value.as_bigint_and_exponent();
    let len = digits.magnitude().to_string().len() as i64;
    (len - scale).max(0) as usize
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn lock_store(&mut self, store_id: i64) -> Result<()> {
        // The guard taken in `begin` already excludes every other writer.
        if self.staged.stores.iter().any(|s| s.id == store_id) {
            Ok(())
        } else {
            Err(anyhow!("unknown store id {store_id}"))
        }
    }

    async fn ensure_category(&mut self, store_id: i64, name: &str) -> Result<Category> {
        let state = &mut self.staged;
        if let Some(c) = state
            .categories
            .iter()
            .find(|c| c.store_id == store_id && c.name == name)
        {
            return Ok(c.clone());
        }
        let category = Category {
            id: state.next_id(),
            store_id,
            name: name.to_string(),
            name_ka: None,
            name_en: None,
            name_ru: None,
            icon: None,
        };
        state.categories.push(category.clone());
        Ok(category)
    }

    async fn ensure_subcategory(&mut self, category_id: i64, name: &str) -> Result<Subcategory> {
        let state = &mut self.staged;
        if let Some(s) = state
            .subcategories
            .iter()
            .find(|s| s.category_id == category_id && s.name == name)
        {
            return Ok(s.clone());
        }
        let sub = Subcategory {
            id: state.next_id(),
            category_id,
            name: name.to_string(),
            name_ka: None,
            name_en: None,
            name_ru: None,
            icon: None,
        };
        state.subcategories.push(sub.clone());
        Ok(sub)
    }

    async fn find_product_by_external_id(
        &mut self,
        store_id: i64,
        external_id: &str,
    ) -> Result<Option<Product>> {
        Ok(self
            .staged
            .products
            .iter()
            .find(|p| p.store_id == store_id && p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_product_by_attributes(
        &mut self,
        store_id: i64,
        filter: &ProductMatch,
    ) -> Result<Option<Product>> {
        Ok(self
            .staged
            .products
            .iter()
            .filter(|p| p.store_id == store_id && filter.matches(p))
            .min_by_key(|p| p.id)
            .cloned())
    }

    async fn insert_product(&mut self, new: &NewProduct) -> Result<InsertOutcome> {
        if let Some(ext) = &new.external_id {
            if let Some(existing) = self.find_product_by_external_id(new.store_id, ext).await? {
                return Ok(InsertOutcome::Existing(existing));
            }
        }
        let state = &mut self.staged;
        let product = Product {
            id: state.next_id(),
            store_id: new.store_id,
            name: new.name.clone(),
            brand: new.brand.clone(),
            external_id: new.external_id.clone(),
            barcode: new.barcode.clone(),
            image_url: new.image_url.clone(),
            category_id: new.category_id,
            subcategory_id: new.subcategory_id,
        };
        state.products.push(product.clone());
        Ok(InsertOutcome::Created(product))
    }

    async fn update_product(&mut self, product_id: i64, patch: &ProductPatch) -> Result<Product> {
        let store_id = self
            .staged
            .products
            .iter()
            .find(|p| p.id == product_id)
            .map(|p| p.store_id)
            .ok_or_else(|| anyhow!("product {product_id} not found"))?;
        if let Some(ext) = &patch.external_id {
            let taken = self.staged.products.iter().any(|p| {
                p.id != product_id
                    && p.store_id == store_id
                    && p.external_id.as_deref() == Some(ext.as_str())
            });
            if taken {
                return Err(anyhow!(
                    "duplicate key value violates unique constraint \"products_store_external_id_key\""
                ));
            }
        }
        let product = self
            .staged
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| anyhow!("product {product_id} not found"))?;
        patch.apply(product);
        Ok(product.clone())
    }

    async fn insert_price(&mut self, new: &NewPriceObservation) -> Result<PriceObservation> {
        if integer_digits(&new.price) > MAX_PRICE_INTEGER_DIGITS {
            return Err(anyhow!("numeric field overflow for price {}", new.price));
        }
        let state = &mut self.staged;
        if !state.products.iter().any(|p| p.id == new.product_id) {
            return Err(anyhow!("product {} not found", new.product_id));
        }
        let row = PriceObservation {
            id: state.next_id(),
            product_id: new.product_id,
            price: new.price.clone(),
            previous_price: new.previous_price.clone(),
            is_on_sale: new.is_on_sale,
            sale_start: new.sale_start,
            sale_end: new.sale_end,
            observed_at: new.observed_at,
        };
        state.prices.push(row.clone());
        Ok(row)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        self.savepoints.push((name.to_string(), self.staged.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("savepoint {name} does not exist"))?;
        // Postgres keeps the savepoint itself after ROLLBACK TO.
        self.savepoints.truncate(pos + 1);
        self.staged = self.savepoints[pos].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("savepoint {name} does not exist"))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;

    fn new_product(store_id: i64, name: &str, external_id: Option<&str>) -> NewProduct {
        NewProduct {
            store_id,
            name: name.into(),
            brand: None,
            external_id: external_id.map(str::to_string),
            barcode: None,
            image_url: None,
            category_id: None,
            subcategory_id: None,
        }
    }

    #[tokio::test]
    async fn uncommitted_work_is_discarded() {
        let store = MemoryCatalogStore::new();
        let s = store.ensure_store("Spar").await.expect("store");

        let mut tx = store.begin().await.expect("begin");
        tx.insert_product(&new_product(s.id, "Milk", None)).await.expect("insert");
        tx.rollback().await.expect("rollback");
        assert_eq!(store.product_count(s.id).await.expect("count"), 0);

        let mut tx = store.begin().await.expect("begin");
        tx.insert_product(&new_product(s.id, "Milk", None)).await.expect("insert");
        tx.commit().await.expect("commit");
        assert_eq!(store.product_count(s.id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_earlier_work() {
        let store = MemoryCatalogStore::new();
        let s = store.ensure_store("Spar").await.expect("store");
        let mut tx = store.begin().await.expect("begin");

        tx.savepoint("product_1").await.expect("sp");
        tx.insert_product(&new_product(s.id, "Milk", Some("1"))).await.expect("insert");
        tx.release_savepoint("product_1").await.expect("release");

        tx.savepoint("product_2").await.expect("sp");
        tx.insert_product(&new_product(s.id, "Bread", Some("2"))).await.expect("insert");
        tx.rollback_to_savepoint("product_2").await.expect("rollback to");
        tx.release_savepoint("product_2").await.expect("release");
        tx.commit().await.expect("commit");

        let snap = store.snapshot().await;
        let names: Vec<_> = snap.products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Milk"]);
    }

    #[tokio::test]
    async fn duplicate_external_id_converges_on_existing_row() {
        let store = MemoryCatalogStore::new();
        let s = store.ensure_store("Spar").await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        let first = tx
            .insert_product(&new_product(s.id, "Milk", Some("7")))
            .await
            .expect("insert");
        let second = tx
            .insert_product(&new_product(s.id, "Milk 1L", Some("7")))
            .await
            .expect("insert");
        assert!(matches!(first, InsertOutcome::Created(_)));
        assert_eq!(second, InsertOutcome::Existing(first.into_product()));
    }

    #[tokio::test]
    async fn oversized_prices_are_rejected() {
        let store = MemoryCatalogStore::new();
        let s = store.ensure_store("Spar").await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        let p = tx
            .insert_product(&new_product(s.id, "Gold bar", None))
            .await
            .expect("insert")
            .into_product();
        let obs = NewPriceObservation {
            product_id: p.id,
            price: BigDecimal::from_str("12345678901").expect("decimal"),
            previous_price: None,
            is_on_sale: false,
            sale_start: None,
            sale_end: None,
            observed_at: Utc::now(),
        };
        assert!(tx.insert_price(&obs).await.is_err());
        let ok = NewPriceObservation {
            price: BigDecimal::from_str("1234567890.99").expect("decimal"),
            ..obs
        };
        assert!(tx.insert_price(&ok).await.is_ok());
    }
}
