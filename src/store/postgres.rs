//! Postgres-backed catalog. Statements are unprepared (`persistent(false)`)
//! so the store works behind PgBouncer in transaction mode.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, Executor, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};

use super::{check_savepoint_name, CatalogStore, CatalogTx, InsertOutcome};
use crate::model::{
    Category, NewPriceObservation, NewProduct, PriceObservation, Product, ProductMatch,
    ProductPatch, Store, Subcategory,
};
use crate::util::db::Db;

const PRODUCT_COLUMNS: &str =
    "id, store_id, name, brand, external_id, barcode, image_url, category_id, subcategory_id";

const PRICE_COLUMNS: &str =
    "id, product_id, price, previous_price, is_on_sale, sale_start, sale_end, observed_at";

fn product_from_row(row: &PgRow) -> Result<Product> {
    Ok(Product {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        external_id: row.try_get("external_id")?,
        barcode: row.try_get("barcode")?,
        image_url: row.try_get("image_url")?,
        category_id: row.try_get("category_id")?,
        subcategory_id: row.try_get("subcategory_id")?,
    })
}

fn price_from_row(row: &PgRow) -> Result<PriceObservation> {
    Ok(PriceObservation {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        price: row.try_get("price")?,
        previous_price: row.try_get("previous_price")?,
        is_on_sale: row.try_get("is_on_sale")?,
        sale_start: row.try_get("sale_start")?,
        sale_end: row.try_get("sale_end")?,
        observed_at: row.try_get("observed_at")?,
    })
}

#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self))]
    async fn ensure_store(&self, name: &str) -> Result<Store> {
        let row = sqlx::query(
            "INSERT INTO stores (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name",
        )
        .persistent(false)
        .bind(name)
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("ensure store {name}"))?;
        Ok(Store {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        let tx = self.db.pool.begin().await.context("begin transaction")?;
        Ok(Box::new(PgCatalogTx { tx }))
    }

    async fn current_price(&self, product_id: i64) -> Result<Option<PriceObservation>> {
        let sql = format!(
            "SELECT {PRICE_COLUMNS} FROM price_observations
             WHERE product_id = $1
             ORDER BY observed_at DESC, id DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(product_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(price_from_row).transpose()
    }

    async fn product_count(&self, store_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM products WHERE store_id = $1")
            .persistent(false)
            .bind(store_id)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

pub struct PgCatalogTx {
    tx: Transaction<'static, Postgres>,
}

/// `SELECT` for the attribute rule: every provided field must be equal and a
/// row holding a different external id is excluded.
fn attribute_query(store_id: i64, filter: &ProductMatch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE store_id = "));
    qb.push_bind(store_id);
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(brand) = &filter.brand {
        qb.push(" AND brand = ").push_bind(brand.clone());
    }
    if let Some(barcode) = &filter.barcode {
        qb.push(" AND barcode = ").push_bind(barcode.clone());
    }
    if let Some(ext) = &filter.external_id {
        qb.push(" AND (external_id IS NULL OR external_id = ")
            .push_bind(ext.clone())
            .push(")");
    }
    qb.push(" ORDER BY id LIMIT 1");
    qb
}

fn update_query(product_id: i64, patch: &ProductPatch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE products SET ");
    let mut sep = qb.separated(", ");
    sep.push("updated_at = now()");
    if let Some(v) = &patch.name {
        sep.push("name = ").push_bind_unseparated(v.clone());
    }
    if let Some(v) = &patch.brand {
        sep.push("brand = ").push_bind_unseparated(v.clone());
    }
    if let Some(v) = &patch.external_id {
        sep.push("external_id = ").push_bind_unseparated(v.clone());
    }
    if let Some(v) = &patch.barcode {
        sep.push("barcode = ").push_bind_unseparated(v.clone());
    }
    if let Some(v) = &patch.image_url {
        sep.push("image_url = ").push_bind_unseparated(v.clone());
    }
    if let Some(v) = patch.category_id {
        sep.push("category_id = ").push_bind_unseparated(v);
    }
    if let Some(v) = patch.subcategory_id {
        sep.push("subcategory_id = ").push_bind_unseparated(v);
    }
    qb.push(" WHERE id = ").push_bind(product_id);
    qb.push(format!(" RETURNING {PRODUCT_COLUMNS}"));
    qb
}

#[async_trait]
impl CatalogTx for PgCatalogTx {
    async fn lock_store(&mut self, store_id: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .persistent(false)
            .bind(store_id)
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("lock store {store_id}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_category(&mut self, store_id: i64, name: &str) -> Result<Category> {
        let row = sqlx::query(
            "INSERT INTO categories (store_id, name) VALUES ($1, $2)
             ON CONFLICT (store_id, name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, store_id, name, name_ka, name_en, name_ru, icon",
        )
        .persistent(false)
        .bind(store_id)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(Category {
            id: row.try_get("id")?,
            store_id: row.try_get("store_id")?,
            name: row.try_get("name")?,
            name_ka: row.try_get("name_ka")?,
            name_en: row.try_get("name_en")?,
            name_ru: row.try_get("name_ru")?,
            icon: row.try_get("icon")?,
        })
    }

    #[instrument(skip(self))]
    async fn ensure_subcategory(&mut self, category_id: i64, name: &str) -> Result<Subcategory> {
        let row = sqlx::query(
            "INSERT INTO subcategories (category_id, name) VALUES ($1, $2)
             ON CONFLICT (category_id, name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, category_id, name, name_ka, name_en, name_ru, icon",
        )
        .persistent(false)
        .bind(category_id)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(Subcategory {
            id: row.try_get("id")?,
            category_id: row.try_get("category_id")?,
            name: row.try_get("name")?,
            name_ka: row.try_get("name_ka")?,
            name_en: row.try_get("name_en")?,
            name_ru: row.try_get("name_ru")?,
            icon: row.try_get("icon")?,
        })
    }

    async fn find_product_by_external_id(
        &mut self,
        store_id: i64,
        external_id: &str,
    ) -> Result<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE store_id = $1 AND external_id = $2");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(store_id)
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn find_product_by_attributes(
        &mut self,
        store_id: i64,
        filter: &ProductMatch,
    ) -> Result<Option<Product>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let mut qb = attribute_query(store_id, filter);
        let row = qb.build().persistent(false).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self, product), fields(store_id = product.store_id, name = %product.name))]
    async fn insert_product(&mut self, product: &NewProduct) -> Result<InsertOutcome> {
        let sql = format!(
            "INSERT INTO products
                (store_id, name, brand, external_id, barcode, image_url, category_id, subcategory_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (store_id, external_id) WHERE external_id IS NOT NULL DO NOTHING
             RETURNING {PRODUCT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(product.store_id)
            .bind(&product.name)
            .bind(&product.brand)
            .bind(&product.external_id)
            .bind(&product.barcode)
            .bind(&product.image_url)
            .bind(product.category_id)
            .bind(product.subcategory_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(row) = row {
            return Ok(InsertOutcome::Created(product_from_row(&row)?));
        }

        // DO NOTHING only fires on the external id key.
        let ext = product
            .external_id
            .as_deref()
            .ok_or_else(|| anyhow!("insert of {} returned no row", product.name))?;
        debug!(external_id = ext, "insert lost the race; loading existing row");
        let existing = self
            .find_product_by_external_id(product.store_id, ext)
            .await?
            .ok_or_else(|| anyhow!("product {ext} conflicted but is not visible"))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn update_product(&mut self, product_id: i64, patch: &ProductPatch) -> Result<Product> {
        let mut qb = update_query(product_id, patch);
        let row = qb
            .build()
            .persistent(false)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("product {product_id} not found"))?;
        product_from_row(&row)
    }

    async fn insert_price(&mut self, price: &NewPriceObservation) -> Result<PriceObservation> {
        let sql = format!(
            "INSERT INTO price_observations
                (product_id, price, previous_price, is_on_sale, sale_start, sale_end, observed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {PRICE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(price.product_id)
            .bind(&price.price)
            .bind(&price.previous_price)
            .bind(price.is_on_sale)
            .bind(price.sale_start)
            .bind(price.sale_end)
            .bind(price.observed_at)
            .fetch_one(&mut *self.tx)
            .await
            .with_context(|| format!("insert price for product {}", price.product_id))?;
        price_from_row(&row)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        let sql = format!("SAVEPOINT {name}");
        (&mut *self.tx).execute(sqlx::raw_sql(&sql)).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        let sql = format!("ROLLBACK TO SAVEPOINT {name}");
        (&mut *self.tx).execute(sqlx::raw_sql(&sql)).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        let sql = format!("RELEASE SAVEPOINT {name}");
        (&mut *self.tx).execute(sqlx::raw_sql(&sql)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("commit")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("rollback")?;
        Ok(())
    }
}
