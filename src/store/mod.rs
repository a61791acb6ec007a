//! Persistence capability for the catalog.
//!
//! A [`CatalogStore`] hands out [`CatalogTx`] units of work; one transaction
//! covers one ingested page. Products are written under per-product
//! savepoints so a failing product rolls back alone.
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    Category, NewPriceObservation, NewProduct, PriceObservation, Product, ProductMatch,
    ProductPatch, Store, Subcategory,
};

pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

/// Result of an insert that may race another writer on (store, external id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(Product),
    /// The identity key already existed; carries the row that won.
    Existing(Product),
}

impl InsertOutcome {
    pub fn into_product(self) -> Product {
        match self {
            InsertOutcome::Created(p) | InsertOutcome::Existing(p) => p,
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Get-or-create by unique name.
    async fn ensure_store(&self, name: &str) -> Result<Store>;

    async fn begin(&self) -> Result<Box<dyn CatalogTx>>;

    /// Observation with the latest `observed_at`, ties broken by highest id.
    async fn current_price(&self, product_id: i64) -> Result<Option<PriceObservation>>;

    async fn product_count(&self, store_id: i64) -> Result<i64>;
}

#[async_trait]
pub trait CatalogTx: Send {
    /// Serializes identity resolution for one store until the transaction ends.
    async fn lock_store(&mut self, store_id: i64) -> Result<()>;

    async fn ensure_category(&mut self, store_id: i64, name: &str) -> Result<Category>;

    async fn ensure_subcategory(&mut self, category_id: i64, name: &str) -> Result<Subcategory>;

    async fn find_product_by_external_id(
        &mut self,
        store_id: i64,
        external_id: &str,
    ) -> Result<Option<Product>>;

    /// Lowest-id product of the store satisfying `filter`.
    async fn find_product_by_attributes(
        &mut self,
        store_id: i64,
        filter: &ProductMatch,
    ) -> Result<Option<Product>>;

    async fn insert_product(&mut self, product: &NewProduct) -> Result<InsertOutcome>;

    async fn update_product(&mut self, product_id: i64, patch: &ProductPatch) -> Result<Product>;

    async fn insert_price(&mut self, price: &NewPriceObservation) -> Result<PriceObservation>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// Savepoint names are spliced into SQL; only plain identifiers are allowed.
pub(crate) fn check_savepoint_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(anyhow::anyhow!("invalid savepoint name {name:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::check_savepoint_name;

    #[test]
    fn savepoint_names_are_identifiers() {
        assert!(check_savepoint_name("product_12").is_ok());
        assert!(check_savepoint_name("1abc").is_err());
        assert!(check_savepoint_name("p; DROP TABLE products").is_err());
    }
}
