//! Append-only price history.
use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{NewPriceObservation, PriceObservation, Product, RawObservation};
use crate::store::CatalogTx;

#[derive(Debug, Clone, Copy, Default)]
pub struct PriceRecorder;

impl PriceRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Row to append for `obs`, or `None` when no price was parsed.
    pub fn observation_for(
        &self,
        product_id: i64,
        obs: &RawObservation,
        observed_at: DateTime<Utc>,
    ) -> Option<NewPriceObservation> {
        let price = obs.price.clone()?;
        let is_on_sale = is_on_sale(
            &price,
            obs.previous_price.as_ref(),
            obs.sale_start,
            obs.sale_end,
            observed_at,
        );
        Some(NewPriceObservation {
            product_id,
            price,
            previous_price: obs.previous_price.clone(),
            is_on_sale,
            sale_start: obs.sale_start,
            sale_end: obs.sale_end,
            observed_at,
        })
    }

    /// Appends one observation; never touches earlier rows.
    pub async fn record(
        &self,
        tx: &mut dyn CatalogTx,
        product: &Product,
        obs: &RawObservation,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<PriceObservation>> {
        let Some(row) = self.observation_for(product.id, obs, observed_at) else {
            debug!(product_id = product.id, name = %product.name, "no price parsed; skipping");
            return Ok(None);
        };
        let stored = tx.insert_price(&row).await?;
        Ok(Some(stored))
    }
}

/// Discounted against the previous price, or inside an explicit sale window.
pub fn is_on_sale(
    price: &BigDecimal,
    previous_price: Option<&BigDecimal>,
    sale_start: Option<DateTime<Utc>>,
    sale_end: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> bool {
    if previous_price.is_some_and(|prev| price < prev) {
        return true;
    }
    if sale_start.is_none() && sale_end.is_none() {
        return false;
    }
    sale_start.map_or(true, |s| s <= at) && sale_end.map_or(true, |e| at <= e)
}

/// Latest observation by `observed_at`, ties broken by the highest id.
pub fn current_price(rows: &[PriceObservation]) -> Option<&PriceObservation> {
    rows.iter().max_by_key(|r| (r.observed_at, r.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogStore, MemoryCatalogStore};
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).expect("decimal literal")
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).single().expect("valid time")
    }

    fn row(id: i64, observed_at: DateTime<Utc>, price: &str) -> PriceObservation {
        PriceObservation {
            id,
            product_id: 1,
            price: dec(price),
            previous_price: None,
            is_on_sale: false,
            sale_start: None,
            sale_end: None,
            observed_at,
        }
    }

    #[test]
    fn discount_against_previous_price_is_a_sale() {
        assert!(is_on_sale(&dec("4.50"), Some(&dec("5.00")), None, None, at(9)));
        assert!(!is_on_sale(&dec("5.00"), Some(&dec("5.00")), None, None, at(9)));
        assert!(!is_on_sale(&dec("5.00"), None, None, None, at(9)));
    }

    #[test]
    fn sale_window_bounds_may_be_open() {
        let p = dec("3");
        assert!(is_on_sale(&p, None, Some(at(8)), Some(at(10)), at(9)));
        assert!(!is_on_sale(&p, None, Some(at(8)), Some(at(10)), at(11)));
        assert!(is_on_sale(&p, None, Some(at(8)), None, at(23)));
        assert!(is_on_sale(&p, None, None, Some(at(10)), at(1)));
        assert!(!is_on_sale(&p, None, None, Some(at(10)), at(12)));
    }

    #[test]
    fn current_price_prefers_latest_then_highest_id() {
        let rows = vec![row(1, at(10), "5"), row(3, at(9), "4"), row(2, at(10), "6")];
        assert_eq!(current_price(&rows).map(|r| r.id), Some(2));
        assert!(current_price(&[]).is_none());
    }

    #[test]
    fn missing_price_yields_no_row() {
        let obs = RawObservation::named("Bread");
        assert!(PriceRecorder::new().observation_for(1, &obs, at(9)).is_none());
    }

    #[tokio::test]
    async fn interleaved_writers_keep_latest_as_current() {
        let store = MemoryCatalogStore::new();
        let s = store.ensure_store("Spar").await.expect("store");
        let recorder = PriceRecorder::new();

        let mut tx = store.begin().await.expect("begin");
        let product = tx
            .insert_product(&crate::model::NewProduct {
                store_id: s.id,
                name: "Milk".into(),
                brand: None,
                external_id: None,
                barcode: None,
                image_url: None,
                category_id: None,
                subcategory_id: None,
            })
            .await
            .expect("insert")
            .into_product();
        tx.commit().await.expect("commit");

        let base = at(12);
        let writes = [(base, "2.00"), (base - Duration::hours(2), "1.50"), (base + Duration::minutes(5), "2.10")];
        let mut handles = Vec::new();
        for (observed_at, price) in writes {
            let store = store.clone();
            let product = product.clone();
            handles.push(tokio::spawn(async move {
                let obs = RawObservation {
                    price: Some(dec(price)),
                    ..RawObservation::named("Milk")
                };
                let mut tx = store.begin().await.expect("begin");
                recorder
                    .record(tx.as_mut(), &product, &obs, observed_at)
                    .await
                    .expect("record");
                tx.commit().await.expect("commit");
            }));
        }
        for h in handles {
            h.await.expect("join");
        }

        let current = store.current_price(product.id).await.expect("query").expect("row");
        assert_eq!(current.price, dec("2.10"));
        assert_eq!(store.snapshot().await.prices.len(), 3);
    }
}
