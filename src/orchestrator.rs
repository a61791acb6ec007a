//! Per-store ingestion runs.
//!
//! One run walks a retailer's categories page by page. Every page is
//! extracted into the run's [`ObservationSink`] and committed in its own
//! transaction while the next page is being fetched.
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{RunSettings, StoreConfig};
use crate::error::{ErrorKind, FetchError, IngestError};
use crate::extract::{ObservationSink, TreeExtractor};
use crate::http::ReqwestHttp;
use crate::model::{IngestionReport, RawObservation, Store};
use crate::record::PriceRecorder;
use crate::resolve::{CategoryMapper, IdentityResolver};
use crate::sources::{build_adapter, CategoryRef, Cursor, ProductPage, RawPayload, SourceAdapter};
use crate::store::{CatalogStore, CatalogTx};

/// Builds the source adapter of one store run.
pub type AdapterFactory =
    Arc<dyn Fn(&StoreConfig) -> Result<Box<dyn SourceAdapter>, FetchError> + Send + Sync>;

#[derive(Clone)]
pub struct Ingestor {
    catalog: Arc<dyn CatalogStore>,
    adapters: AdapterFactory,
    recorder: PriceRecorder,
}

impl Ingestor {
    pub fn new(catalog: Arc<dyn CatalogStore>, adapters: AdapterFactory) -> Self {
        Self {
            catalog,
            adapters,
            recorder: PriceRecorder::new(),
        }
    }

    /// One `reqwest` client per store, paced by that store's `rps`.
    pub fn with_http(catalog: Arc<dyn CatalogStore>) -> Self {
        let adapters: AdapterFactory = Arc::new(|cfg: &StoreConfig| {
            let timeout = Duration::from_millis(cfg.run.request_timeout_ms);
            let http = ReqwestHttp::new(cfg.run.rps, timeout)?;
            build_adapter(cfg, Arc::new(http))
        });
        Self::new(catalog, adapters)
    }

    /// Runs every store concurrently; reports come back in input order.
    pub async fn run_all(
        &self,
        stores: Vec<StoreConfig>,
        cancel: CancellationToken,
    ) -> Vec<IngestionReport> {
        let names: Vec<String> = stores.iter().map(|s| s.name.clone()).collect();
        let mut tasks = Vec::with_capacity(stores.len());
        for cfg in stores {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                info!(store = %cfg.name, kind = cfg.source.kind(), "starting store run");
                let report = this.run_ingestion(&cfg, &cancel).await;
                if report.is_fatal() {
                    error!(store = %cfg.name, "store run aborted");
                } else {
                    info!(store = %cfg.name, errors = report.errors.len(), "store run finished");
                }
                report
            }));
        }
        join_all(tasks)
            .await
            .into_iter()
            .zip(names)
            .map(|(res, name)| match res {
                Ok(report) => report,
                Err(join_err) => {
                    error!(store = %name, error = %join_err, "store task failed");
                    let mut report = IngestionReport::new(&name);
                    report.push_error(IngestError::new(ErrorKind::Fatal, "task", join_err));
                    report.finished_at = Some(Utc::now());
                    report
                }
            })
            .collect()
    }

    #[instrument(skip_all, fields(store = %cfg.name))]
    pub async fn run_ingestion(
        &self,
        cfg: &StoreConfig,
        cancel: &CancellationToken,
    ) -> IngestionReport {
        let mut report = IngestionReport::new(&cfg.name);
        let store = match self.catalog.ensure_store(&cfg.name).await {
            Ok(store) => store,
            Err(e) => {
                error!(store = %cfg.name, error = %e, "catalog unreachable; aborting run");
                report.push_error(IngestError::new(ErrorKind::Fatal, "store", format!("{e:#}")));
                report.finished_at = Some(Utc::now());
                return report;
            }
        };
        let adapter = match (self.adapters)(cfg) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(store = %cfg.name, error = %e, "source adapter could not be built");
                report.push_error(IngestError::new(ErrorKind::Fatal, "adapter", e));
                report.finished_at = Some(Utc::now());
                return report;
            }
        };

        let mut run = StoreRun {
            catalog: self.catalog.as_ref(),
            recorder: self.recorder,
            resolver: IdentityResolver::new(CategoryMapper::from_config(&cfg.category_map)),
            extractor: TreeExtractor::new(cfg.run.max_depth),
            policy: RetryPolicy::for_run(&cfg.run, adapter.as_ref()),
            politeness: Duration::from_millis(cfg.run.politeness_delay_ms),
            last_fetch: None,
            max_pages: cfg.run.max_pages,
            adapter: adapter.as_ref(),
            sink: ObservationSink::new(),
            store,
            report,
        };
        run.execute(cancel).await;
        let StoreRun { mut report, sink, .. } = run;

        if let Err(e) = adapter.close().await {
            warn!(store = %cfg.name, error = %e, "closing source adapter failed");
        }
        report.finished_at = Some(Utc::now());
        info!(
            store = %report.store,
            pages = report.pages_fetched,
            products_seen = report.products_seen,
            products_created = report.products_created,
            prices_recorded = report.prices_recorded,
            duplicates = sink.duplicates(),
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "ingestion summary"
        );
        report
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
    /// Upper bound of a single attempt.
    budget: Duration,
}

impl RetryPolicy {
    fn for_run(run: &RunSettings, adapter: &dyn SourceAdapter) -> Self {
        Self {
            attempts: run.retry_attempts.max(1),
            delay: Duration::from_millis(run.retry_delay_ms),
            budget: adapter.call_budget(Duration::from_millis(run.request_timeout_ms)),
        }
    }
}

/// Fixed-delay retry of transient failures; each attempt runs under the budget.
async fn retry_fetch<T, F, Fut>(policy: RetryPolicy, scope: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let res = match tokio::time::timeout(policy.budget, op()).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout(policy.budget.as_millis() as u64)),
        };
        match res {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(attempt, max = policy.attempts, scope, error = %e, "fetch failed; retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct PageStats {
    seen: usize,
    created: usize,
    recorded: usize,
    skipped: usize,
    conflicts: usize,
    errors: Vec<IngestError>,
}

struct ProductWrite {
    created: bool,
    conflict: bool,
    recorded: bool,
}

struct StoreRun<'a> {
    catalog: &'a dyn CatalogStore,
    adapter: &'a dyn SourceAdapter,
    recorder: PriceRecorder,
    resolver: IdentityResolver,
    extractor: TreeExtractor,
    policy: RetryPolicy,
    politeness: Duration,
    /// End of the previous request to the retailer, in any category.
    last_fetch: Option<Instant>,
    max_pages: u32,
    sink: ObservationSink,
    store: Store,
    report: IngestionReport,
}

impl StoreRun<'_> {
    async fn execute(&mut self, cancel: &CancellationToken) {
        let adapter = self.adapter;
        let listed = retry_fetch(self.policy, "categories", || adapter.list_categories()).await;
        self.last_fetch = Some(Instant::now());
        let categories = match listed {
            Ok(categories) => categories,
            Err(e) => {
                error!(store = %self.store.name, error = %e, "listing categories failed");
                self.report
                    .push_error(IngestError::new(ErrorKind::TransientFetch, "categories", e));
                return;
            }
        };
        info!(store = %self.store.name, kind = adapter.kind(), categories = categories.len(), "categories listed");

        for category in &categories {
            if cancel.is_cancelled() {
                self.report.cancelled = true;
                break;
            }
            self.ingest_category(category, cancel).await;
            if self.report.cancelled {
                break;
            }
            self.report.categories_done += 1;
        }
        if self.report.cancelled {
            info!(store = %self.store.name, done = self.report.categories_done, "run cancelled");
        }
    }

    async fn ingest_category(&mut self, category: &CategoryRef, cancel: &CancellationToken) {
        let label = category.label();
        let adapter = self.adapter;
        let policy = self.policy;
        let mut cursor: Option<Cursor> = None;
        let mut pages = 0u32;
        let mut pending: Option<(String, Vec<RawObservation>)> = None;

        loop {
            if cancel.is_cancelled() {
                self.report.cancelled = true;
                break;
            }
            if pages >= self.max_pages {
                warn!(store = %self.store.name, category = %label, max_pages = self.max_pages, "page limit reached");
                break;
            }
            let scope = format!(
                "category={label} {}",
                cursor.map(|c| c.to_string()).unwrap_or_else(|| "page=1".into())
            );
            let not_before = self.last_fetch.map(|at| at + self.politeness);
            let current = cursor;
            let fetch = async {
                if let Some(at) = not_before {
                    tokio::time::sleep_until(at).await;
                }
                let res = retry_fetch(policy, &scope, || adapter.list_products(category, current.as_ref())).await;
                (res, Instant::now())
            };
            let batch = pending.take();
            let this = &*self;
            let commit = async move {
                match batch {
                    Some((scope, batch)) => Some(this.commit_page(&scope, batch).await),
                    None => None,
                }
            };
            let ((fetched, fetched_at), committed) = tokio::join!(fetch, commit);
            self.last_fetch = Some(fetched_at);
            if let Some(stats) = committed {
                self.apply(stats);
            }

            let ProductPage { payloads, next } = match fetched {
                Ok(page) => page,
                Err(e) => {
                    warn!(store = %self.store.name, category = %label, error = %e, "page failed; abandoning category");
                    self.report
                        .push_error(IngestError::new(ErrorKind::TransientFetch, scope, e));
                    break;
                }
            };
            pages += 1;
            self.report.pages_fetched += 1;
            if payloads.is_empty() {
                break;
            }
            self.absorb(&scope, payloads);
            pending = Some((scope, self.sink.drain()));
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some((scope, batch)) = pending.take() {
            let stats = self.commit_page(&scope, batch).await;
            self.apply(stats);
        }
        debug!(store = %self.store.name, category = %label, pages, "category done");
    }

    fn absorb(&mut self, scope: &str, payloads: Vec<RawPayload>) {
        let mut misses = 0;
        for payload in payloads {
            match payload {
                RawPayload::Tree { node, seed } => {
                    self.extractor.extract(&node, &seed, &mut self.sink);
                }
                RawPayload::Card(card) | RawPayload::DomRow(card) => match card.to_observation() {
                    Some(obs) => {
                        self.sink.offer(obs);
                    }
                    None => misses += 1,
                },
            }
        }
        if misses > 0 {
            debug!(scope, misses, "cards dropped");
            self.report.parse_misses += misses;
            self.report.push_error(IngestError::new(
                ErrorKind::ParseMiss,
                scope,
                format!("{misses} card(s) without a name, or without both price and image"),
            ));
        }
    }

    fn apply(&mut self, stats: PageStats) {
        let r = &mut self.report;
        r.products_seen += stats.seen;
        r.products_created += stats.created;
        r.prices_recorded += stats.recorded;
        r.prices_skipped += stats.skipped;
        r.conflicts += stats.conflicts;
        r.errors.extend(stats.errors);
    }

    async fn open_tx(&self) -> Result<Box<dyn CatalogTx>> {
        let mut tx = self.catalog.begin().await?;
        tx.lock_store(self.store.id).await?;
        Ok(tx)
    }

    /// One transaction per page; a failing product rolls back to its savepoint.
    async fn commit_page(&self, scope: &str, batch: Vec<RawObservation>) -> PageStats {
        let mut stats = PageStats::default();
        if batch.is_empty() {
            return stats;
        }
        let mut tx = match self.open_tx().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(store = %self.store.name, scope, error = %e, "page transaction unavailable");
                stats.errors.push(IngestError::new(ErrorKind::Persist, scope, format!("{e:#}")));
                return stats;
            }
        };

        let observed_at = Utc::now();
        for (i, obs) in batch.iter().enumerate() {
            let savepoint = format!("product_{i}");
            match self.write_product(tx.as_mut(), &savepoint, obs, observed_at).await {
                Ok(w) => {
                    stats.seen += 1;
                    if w.created {
                        stats.created += 1;
                    }
                    if w.recorded {
                        stats.recorded += 1;
                    } else {
                        stats.skipped += 1;
                    }
                    if w.conflict {
                        stats.conflicts += 1;
                        stats.errors.push(IngestError::new(
                            ErrorKind::Conflict,
                            format!("{scope} product={}", obs.name),
                            "identity key created concurrently; converged on existing row",
                        ));
                    }
                }
                Err(e) => {
                    warn!(store = %self.store.name, scope, product = %obs.name, error = %e, "product write rolled back");
                    stats.errors.push(IngestError::new(
                        ErrorKind::Persist,
                        format!("{scope} product={}", obs.name),
                        format!("{e:#}"),
                    ));
                }
            }
        }

        match tx.commit().await {
            Ok(()) => {
                debug!(store = %self.store.name, scope, products = stats.seen, prices = stats.recorded, "page committed");
                stats
            }
            Err(e) => {
                warn!(store = %self.store.name, scope, error = %e, "page commit failed");
                let mut errors = stats.errors;
                errors.push(IngestError::new(ErrorKind::Persist, scope, format!("{e:#}")));
                PageStats {
                    errors,
                    ..PageStats::default()
                }
            }
        }
    }

    async fn write_product(
        &self,
        tx: &mut dyn CatalogTx,
        savepoint: &str,
        obs: &RawObservation,
        observed_at: DateTime<Utc>,
    ) -> Result<ProductWrite> {
        tx.savepoint(savepoint).await?;
        match self.resolve_and_record(tx, obs, observed_at).await {
            Ok(w) => {
                tx.release_savepoint(savepoint).await?;
                Ok(w)
            }
            Err(e) => {
                tx.rollback_to_savepoint(savepoint).await?;
                tx.release_savepoint(savepoint).await?;
                Err(e)
            }
        }
    }

    async fn resolve_and_record(
        &self,
        tx: &mut dyn CatalogTx,
        obs: &RawObservation,
        observed_at: DateTime<Utc>,
    ) -> Result<ProductWrite> {
        let resolution = self.resolver.resolve(tx, &self.store, obs).await?;
        let price = self
            .recorder
            .record(tx, &resolution.product, obs, observed_at)
            .await?;
        Ok(ProductWrite {
            created: resolution.created(),
            conflict: resolution.conflict,
            recorded: price.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryMapConfig, RestSourceConfig, SourceConfig};
    use crate::extract::{Context, Node};
    use crate::http::testing::{ok, param, FakeHttp};
    use crate::http::HttpClient;
    use crate::model::{Category, PriceObservation, ProductMatch};
    use crate::sources::ScrapedCard;
    use crate::store::MemoryCatalogStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    type PageKey = (String, u32);

    #[derive(Clone, Default)]
    struct ScriptedAdapter {
        categories: Vec<CategoryRef>,
        pages: HashMap<PageKey, Vec<RawPayload>>,
        failures: Arc<Mutex<HashMap<PageKey, usize>>>,
        calls: Arc<Mutex<Vec<PageKey>>>,
        started: Arc<Mutex<Vec<std::time::Instant>>>,
        cancel_on: Option<(PageKey, CancellationToken)>,
    }

    impl ScriptedAdapter {
        fn category(mut self, name: &str, pages: Vec<Vec<RawPayload>>) -> Self {
            self.categories.push(CategoryRef::named(name));
            for (i, payloads) in pages.into_iter().enumerate() {
                self.pages.insert((name.to_string(), i as u32 + 1), payloads);
            }
            self
        }

        fn failing(self, name: &str, page: u32, times: usize) -> Self {
            self.failures
                .lock()
                .expect("lock")
                .insert((name.to_string(), page), times);
            self
        }

        fn calls_to(&self, name: &str, page: u32) -> usize {
            let key = (name.to_string(), page);
            self.calls.lock().expect("lock").iter().filter(|k| **k == key).count()
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn list_categories(&self) -> Result<Vec<CategoryRef>, FetchError> {
            Ok(self.categories.clone())
        }

        async fn list_products(
            &self,
            category: &CategoryRef,
            cursor: Option<&Cursor>,
        ) -> Result<ProductPage, FetchError> {
            let page = match cursor {
                Some(Cursor::Page(n)) => *n,
                _ => 1,
            };
            let key = (category.name.clone(), page);
            self.calls.lock().expect("lock").push(key.clone());
            self.started.lock().expect("lock").push(std::time::Instant::now());
            if let Some((at, token)) = &self.cancel_on {
                if *at == key {
                    token.cancel();
                }
            }
            {
                let mut failures = self.failures.lock().expect("lock");
                if let Some(left) = failures.get_mut(&key).filter(|left| **left > 0) {
                    *left -= 1;
                    return Err(FetchError::Status {
                        status: 503,
                        body: "unavailable".into(),
                    });
                }
            }
            let payloads = self.pages.get(&key).cloned().unwrap_or_default();
            let next = self
                .pages
                .contains_key(&(category.name.clone(), page + 1))
                .then_some(Cursor::Page(page + 1));
            Ok(ProductPage { payloads, next })
        }
    }

    fn tree(category: &str, items: Value) -> RawPayload {
        RawPayload::Tree {
            node: Node::from(items),
            seed: Context::with_taxonomy(Some(category.to_string()), None),
        }
    }

    fn run_settings() -> RunSettings {
        RunSettings {
            politeness_delay_ms: 0,
            retry_attempts: 3,
            retry_delay_ms: 1,
            request_timeout_ms: 2_000,
            max_pages: 50,
            max_depth: 20,
            rps: 0,
        }
    }

    fn store_config(name: &str) -> StoreConfig {
        StoreConfig {
            name: name.to_string(),
            source: SourceConfig::PaginatedJson(RestSourceConfig {
                base_url: "https://api.test/".into(),
                categories_path: "categories".into(),
                categories_field: "categories".into(),
                subcategories_path: Some("categories/{category_id}/subcategories".into()),
                subcategories_field: "subcategories".into(),
                products_path: "products".into(),
                products_field: "products".into(),
                page_size: 2,
                headers: BTreeMap::new(),
            }),
            run: run_settings(),
            category_map: CategoryMapConfig::default(),
        }
    }

    fn ingestor(catalog: &MemoryCatalogStore, adapter: &ScriptedAdapter) -> Ingestor {
        let adapter = adapter.clone();
        let factory: AdapterFactory =
            Arc::new(move |_: &StoreConfig| Ok(Box::new(adapter.clone()) as Box<dyn SourceAdapter>));
        Ingestor::new(Arc::new(catalog.clone()), factory)
    }

    async fn product_names(catalog: &MemoryCatalogStore) -> Vec<String> {
        let mut names: Vec<String> = catalog
            .snapshot()
            .await
            .products
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn page_failing_every_attempt_is_reported_and_the_run_moves_on() {
        let adapter = ScriptedAdapter::default()
            .category(
                "Dairy",
                vec![
                    vec![tree("Dairy", json!([{"name": "Milk", "price": "2.50"}]))],
                    vec![tree("Dairy", json!([{"name": "Kefir", "price": "3.10"}]))],
                    vec![tree("Dairy", json!([{"name": "Cheese", "price": "5.99"}]))],
                ],
            )
            .category("Bakery", vec![vec![tree("Bakery", json!([{"name": "Bread", "price": "1.20"}]))]])
            .failing("Dairy", 2, 3);
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert_eq!(adapter.calls_to("Dairy", 2), 3);
        assert_eq!(adapter.calls_to("Dairy", 3), 0);
        assert_eq!(report.errors_of(ErrorKind::TransientFetch), 1);
        let failed = &report.errors[0];
        assert_eq!(failed.scope, "category=Dairy page=2");
        assert_eq!(report.categories_done, 2);
        assert_eq!(report.products_created, 2);
        assert_eq!(product_names(&catalog).await, vec!["Bread", "Milk"]);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn failures_within_the_retry_bound_are_absorbed() {
        let adapter = ScriptedAdapter::default()
            .category("Dairy", vec![vec![tree("Dairy", json!([{"name": "Milk", "price": 2.5}]))]])
            .failing("Dairy", 1, 2);
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(adapter.calls_to("Dairy", 1), 3);
        assert_eq!(report.prices_recorded, 1);
    }

    #[tokio::test]
    async fn cancellation_is_honoured_between_pages() {
        let token = CancellationToken::new();
        let mut adapter = ScriptedAdapter::default()
            .category(
                "Dairy",
                vec![
                    vec![tree("Dairy", json!([{"name": "Milk", "price": "2.50"}]))],
                    vec![tree("Dairy", json!([{"name": "Kefir", "price": "3.10"}]))],
                ],
            )
            .category("Bakery", vec![vec![tree("Bakery", json!([{"name": "Bread", "price": "1.20"}]))]]);
        adapter.cancel_on = Some((("Dairy".to_string(), 1), token.clone()));
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &token)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.pages_fetched, 1);
        assert_eq!(adapter.calls_to("Dairy", 2), 0);
        assert_eq!(adapter.calls_to("Bakery", 1), 0);
        // The page fetched before cancellation is still committed.
        assert_eq!(product_names(&catalog).await, vec!["Milk"]);
    }

    #[tokio::test]
    async fn politeness_delay_spans_category_boundaries() {
        let adapter = ScriptedAdapter::default()
            .category(
                "Dairy",
                vec![
                    vec![tree("Dairy", json!([{"name": "Milk", "price": 2.5}]))],
                    vec![tree("Dairy", json!([{"name": "Kefir", "price": 3.1}]))],
                ],
            )
            .category("Bakery", vec![vec![tree("Bakery", json!([{"name": "Bread", "price": 1.2}]))]])
            .category("Drinks", vec![vec![tree("Drinks", json!([{"name": "Cola", "price": 2}]))]]);
        let mut cfg = store_config("Spar");
        cfg.run.politeness_delay_ms = 60;
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&cfg, &CancellationToken::new())
            .await;

        assert_eq!(report.pages_fetched, 4);
        let started = adapter.started.lock().expect("lock").clone();
        assert_eq!(started.len(), 4);
        for pair in started.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(60), "fetches {gap:?} apart");
        }
    }

    struct UnreachableCatalog;

    #[async_trait]
    impl CatalogStore for UnreachableCatalog {
        async fn ensure_store(&self, _name: &str) -> Result<Store> {
            Err(anyhow::anyhow!("connection refused"))
        }

        async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
            Err(anyhow::anyhow!("connection refused"))
        }

        async fn current_price(&self, _product_id: i64) -> Result<Option<PriceObservation>> {
            Err(anyhow::anyhow!("connection refused"))
        }

        async fn product_count(&self, _store_id: i64) -> Result<i64> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn unreachable_catalog_aborts_the_run() {
        let adapter = ScriptedAdapter::default()
            .category("Dairy", vec![vec![tree("Dairy", json!([{"name": "Milk", "price": 2.5}]))]]);
        let factory_adapter = adapter.clone();
        let factory: AdapterFactory =
            Arc::new(move |_: &StoreConfig| Ok(Box::new(factory_adapter.clone()) as Box<dyn SourceAdapter>));
        let report = Ingestor::new(Arc::new(UnreachableCatalog), factory)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert!(report.is_fatal());
        assert_eq!(report.errors[0].message, "connection refused");
        assert_eq!(report.pages_fetched, 0);
        assert_eq!(adapter.calls_to("Dairy", 1), 0);
    }

    #[tokio::test]
    async fn failing_product_does_not_abort_its_siblings() {
        // 11 integer digits overflow NUMERIC(12,2).
        let adapter = ScriptedAdapter::default().category(
            "Dairy",
            vec![vec![tree(
                "Dairy",
                json!([
                    {"name": "Gold bar", "price": "12345678901"},
                    {"name": "Milk", "price": "2.50"}
                ]),
            )]],
        );
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert_eq!(report.errors_of(ErrorKind::Persist), 1);
        assert!(report.errors[0].scope.ends_with("product=Gold bar"));
        assert_eq!(report.prices_recorded, 1);
        assert_eq!(product_names(&catalog).await, vec!["Milk"]);
        assert_eq!(catalog.snapshot().await.prices.len(), 1);
    }

    #[tokio::test]
    async fn incomplete_cards_are_counted_as_parse_misses() {
        let card = |name: Option<&str>, price: Option<&str>| {
            RawPayload::Card(ScrapedCard {
                name: name.map(str::to_string),
                price_text: price.map(str::to_string),
                category: Some("Dairy".into()),
                ..ScrapedCard::default()
            })
        };
        let adapter = ScriptedAdapter::default().category(
            "Dairy",
            vec![vec![
                card(Some("Milk"), Some("2,50 ₾")),
                card(None, Some("3,00 ₾")),
                card(Some("Kefir"), None),
                card(Some("Yogurt"), Some("ფასი მალე")),
            ]],
        );
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert_eq!(report.parse_misses, 3);
        assert_eq!(report.errors_of(ErrorKind::ParseMiss), 1);
        assert_eq!(report.products_seen, 1);
        assert_eq!(product_names(&catalog).await, vec!["Milk"]);
    }

    #[tokio::test]
    async fn repeated_runs_append_prices_but_not_products() {
        let adapter = ScriptedAdapter::default().category(
            "Dairy",
            vec![vec![tree(
                "Dairy",
                json!([
                    {"id": 7, "name": "Milk", "price": "2.50", "oldPrice": "2.90"},
                    {"id": 7, "name": "Milk", "price": "2.50", "oldPrice": "2.90"},
                    {"name": "Bread", "image": "bread.png"}
                ]),
            )]],
        );
        let catalog = MemoryCatalogStore::new();
        let ingest = ingestor(&catalog, &adapter);
        let first = ingest
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;
        let second = ingest
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert_eq!(first.products_created, 2);
        assert_eq!(first.prices_recorded, 1);
        assert_eq!(first.prices_skipped, 1);
        assert_eq!(second.products_created, 0);
        assert_eq!(second.products_seen, 2);

        let state = catalog.snapshot().await;
        assert_eq!(state.products.len(), 2);
        assert_eq!(state.prices.len(), 2);
        assert!(state.prices.iter().all(|p| p.is_on_sale));
    }

    #[tokio::test]
    async fn sale_window_from_the_payload_marks_the_price() {
        let adapter = ScriptedAdapter::default().category(
            "Dairy",
            vec![vec![tree(
                "Dairy",
                json!([
                    {"name": "Milk", "price": "2.50", "saleStart": "2020-01-01T00:00:00Z", "saleEnd": "2099-01-01"},
                    {"name": "Kefir", "price": "3.10", "promoStart": "2099-01-01"}
                ]),
            )]],
        );
        let catalog = MemoryCatalogStore::new();
        let report = ingestor(&catalog, &adapter)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;
        assert_eq!(report.prices_recorded, 2);

        let state = catalog.snapshot().await;
        let price_of = |name: &str| {
            let product = state.products.iter().find(|p| p.name == name).expect("product");
            state
                .prices
                .iter()
                .find(|p| p.product_id == product.id)
                .cloned()
                .expect("price")
        };
        let milk = price_of("Milk");
        assert!(milk.is_on_sale);
        assert_eq!(milk.sale_start.map(|t| t.to_rfc3339()).as_deref(), Some("2020-01-01T00:00:00+00:00"));
        assert_eq!(milk.sale_end.map(|t| t.to_rfc3339()).as_deref(), Some("2099-01-01T23:59:59+00:00"));
        let kefir = price_of("Kefir");
        assert!(!kefir.is_on_sale);
        assert!(kefir.sale_start.is_some());
    }

    #[tokio::test]
    async fn paginated_json_store_end_to_end() {
        let http = Arc::new(FakeHttp::new().route(|req| match req.url.as_str() {
            "https://api.test/categories" => Some(ok(r#"{"categories":[{"id":1,"name":"Dairy"}]}"#)),
            "https://api.test/categories/1/subcategories" => {
                Some(ok(r#"{"subcategories":[{"id":10,"name":"Milk"}]}"#))
            }
            "https://api.test/products" => Some(ok(match param(req, "page") {
                Some("1") => r#"{"products":[
                    {"id":"sku-1","name":"Sante Milk 1L","price":"3,45 ₾","barCode":"4860001"},
                    {"id":"sku-2","name":"Sante Milk 0.5L","price":1.95}
                ],"hasNextPage":true}"#,
                Some("2") => r#"{"products":[{"id":"sku-3","name":"Lactose Free Milk","price":"4.20"}],"hasNextPage":false}"#,
                _ => r#"{"products":[]}"#,
            })),
            _ => None,
        }));
        let shared = http.clone();
        let factory: AdapterFactory = Arc::new(move |cfg: &StoreConfig| {
            build_adapter(cfg, shared.clone() as Arc<dyn HttpClient>)
        });
        let catalog = MemoryCatalogStore::new();
        let report = Ingestor::new(Arc::new(catalog.clone()), factory)
            .run_ingestion(&store_config("Spar"), &CancellationToken::new())
            .await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.products_created, 3);

        let state = catalog.snapshot().await;
        let dairy: &Category = state.categories.iter().find(|c| c.name == "Dairy").expect("category");
        let milk = state.subcategories.iter().find(|s| s.name == "Milk").expect("subcategory");
        assert_eq!(milk.category_id, dairy.id);
        let filter = ProductMatch {
            barcode: Some("4860001".into()),
            ..ProductMatch::default()
        };
        let product = state.products.iter().find(|p| filter.matches(p)).expect("product");
        assert_eq!(product.external_id.as_deref(), Some("sku-1"));
        assert_eq!(product.subcategory_id, Some(milk.id));

        let current = catalog.current_price(product.id).await.expect("query").expect("price");
        assert_eq!(current.price.to_string(), "3.45");
        let store_id = state.stores[0].id;
        assert_eq!(catalog.product_count(store_id).await.expect("count"), 3);
    }

    #[tokio::test]
    async fn stores_run_concurrently_and_report_in_order() {
        let adapter = ScriptedAdapter::default()
            .category("Dairy", vec![vec![tree("Dairy", json!([{"name": "Milk", "price": 2.5}]))]]);
        let catalog = MemoryCatalogStore::new();
        let reports = ingestor(&catalog, &adapter)
            .run_all(
                vec![store_config("Spar"), store_config("2nabiji")],
                CancellationToken::new(),
            )
            .await;

        let names: Vec<&str> = reports.iter().map(|r| r.store.as_str()).collect();
        assert_eq!(names, vec!["Spar", "2nabiji"]);
        assert!(reports.iter().all(|r| r.products_created == 1));
        assert_eq!(catalog.snapshot().await.stores.len(), 2);
    }
}
