//! Scrape-run orchestration and backend maintenance operations.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use precios_backend::{BackendClient, BackendConfig, FetcherConfig, PageFetcher};
use precios_core::{
    classify, format_usd, match_category, parse_price_usd, Category, ClassifierConfig,
    DecimalStyle, ExchangeRate, NewPrice, ProductRecord, ProductUpsert, ScrapedCard, StoreRecord,
    StoreSeed,
};
use precios_scrape::{
    accept_card, collapse_duplicates, extract_cards, BucketRehoster, FarmatodoScraper,
    ImageRehoster, NoopRehoster, StoreScraper,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "precios-ingest";

const DEFAULT_STORE_ID: &str = "fe1e307f-aa6e-4af3-944f-1b7fb37299b8";
const DEFAULT_RETAILER_BASE: &str = "https://www.farmatodo.com.ve";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// How price rows are written: the legacy behavior appends one row per
/// scrape, the later behavior keeps one row per `(product, store)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PriceWriteMode {
    #[default]
    Insert,
    UpsertPerStore,
}

impl FromStr for PriceWriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insert" => Ok(PriceWriteMode::Insert),
            "upsert" | "upsert-per-store" => Ok(PriceWriteMode::UpsertPerStore),
            other => Err(format!("unknown price write mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub backend_url: String,
    pub service_key: String,
    pub store_id: Uuid,
    pub decimal_style: DecimalStyle,
    pub fallback_rate: f64,
    pub price_write_mode: PriceWriteMode,
    pub rehost_images: bool,
    pub image_bucket: String,
    pub retailer_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub scheduled_terms: Vec<String>,
    pub workspace_root: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// A division by anything else turns a valid Bolívar price into garbage.
pub fn usable_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

pub fn validated_fallback_rate(raw: &str) -> Result<f64> {
    let rate: f64 = raw.parse().context("parsing PRECIOS_FALLBACK_RATE")?;
    anyhow::ensure!(
        usable_rate(rate),
        "PRECIOS_FALLBACK_RATE must be a positive finite number"
    );
    Ok(rate)
}

pub fn split_terms(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let backend_url = std::env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .context("SUPABASE_SERVICE_ROLE_KEY is not set")?;
        let store_id = env_or("PRECIOS_STORE_ID", DEFAULT_STORE_ID)
            .parse::<Uuid>()
            .context("parsing PRECIOS_STORE_ID")?;
        let decimal_style = env_or("PRECIOS_DECIMAL_STYLE", "comma")
            .parse::<DecimalStyle>()
            .map_err(anyhow::Error::msg)?;
        let fallback_rate = validated_fallback_rate(&env_or("PRECIOS_FALLBACK_RATE", "65.0"))?;
        let price_write_mode = env_or("PRECIOS_PRICE_WRITE_MODE", "insert")
            .parse::<PriceWriteMode>()
            .map_err(anyhow::Error::msg)?;

        Ok(Self {
            backend_url,
            service_key,
            store_id,
            decimal_style,
            fallback_rate,
            price_write_mode,
            rehost_images: env_flag("PRECIOS_REHOST_IMAGES", true),
            image_bucket: env_or("PRECIOS_IMAGE_BUCKET", "product-images"),
            retailer_base_url: env_or("PRECIOS_RETAILER_BASE_URL", DEFAULT_RETAILER_BASE),
            user_agent: env_or("PRECIOS_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: env_or("PRECIOS_HTTP_TIMEOUT_SECS", "20")
                .parse()
                .context("parsing PRECIOS_HTTP_TIMEOUT_SECS")?,
            scheduler_enabled: env_flag("PRECIOS_SCHEDULER_ENABLED", false),
            scrape_cron: env_or("PRECIOS_SCRAPE_CRON", "0 0 6 * * *"),
            scheduled_terms: split_terms(&env_or("PRECIOS_SCRAPE_TERMS", "Arroz")),
            workspace_root: PathBuf::from("."),
        })
    }
}

/// Seed stores per municipality, deserialized from `stores.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRegistry {
    pub stores: Vec<StoreSeed>,
}

pub async fn load_store_registry(path: &Path) -> Result<StoreRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// An existing image URL counts as hosted when it already lives in the
/// backend; anything else is a retailer/CDN URL worth replacing.
pub fn is_hosted_url(url: &str, backend_url: &str) -> bool {
    url.starts_with(backend_url.trim_end_matches('/')) || url.contains("supabase.co")
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedItem {
    pub name: String,
    pub category: String,
    pub price_usd: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub search_term: String,
    pub exchange_rate: f64,
    pub cards_seen: usize,
    pub cards_accepted: usize,
    pub products_saved: usize,
    pub prices_saved: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reports_dir: String,
}

pub async fn write_run_report(
    workspace_root: &Path,
    summary: &RunSummary,
    items: &[SavedItem],
) -> Result<PathBuf> {
    let dir = workspace_root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let payload = json!({ "run": summary, "items": items });
    let bytes = serde_json::to_vec_pretty(&payload).context("serializing run report")?;
    fs::write(dir.join("run_summary.json"), bytes)
        .await
        .context("writing run_summary.json")?;
    Ok(dir)
}

struct CardOutcome {
    price_written: bool,
    item: SavedItem,
}

pub struct IngestPipeline {
    config: IngestConfig,
    backend: BackendClient,
    scraper: Box<dyn StoreScraper>,
    rehoster: Box<dyn ImageRehoster>,
    classifier: ClassifierConfig,
}

impl IngestPipeline {
    pub fn from_config(config: IngestConfig) -> Result<Self> {
        let backend = BackendClient::new(BackendConfig {
            url: config.backend_url.clone(),
            service_key: config.service_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;
        let fetcher = PageFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let scraper: Box<dyn StoreScraper> = Box::new(FarmatodoScraper::new(
            fetcher.clone(),
            config.retailer_base_url.clone(),
        ));
        let rehoster: Box<dyn ImageRehoster> = if config.rehost_images {
            Box::new(BucketRehoster::new(
                fetcher,
                backend.clone(),
                config.image_bucket.clone(),
                config.retailer_base_url.clone(),
            ))
        } else {
            Box::new(NoopRehoster)
        };
        Ok(Self {
            config,
            backend,
            scraper,
            rehoster,
            classifier: ClassifierConfig::default(),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn classifier(&self) -> &ClassifierConfig {
        &self.classifier
    }

    /// Latest BCV rate on file; any miss, and any stored rate that is not a
    /// positive finite number, degrades to the configured fallback.
    pub async fn latest_exchange_rate(&self) -> f64 {
        let query = [
            ("select", "rate_bcv,date"),
            ("order", "date.desc"),
            ("limit", "1"),
        ];
        match self
            .backend
            .select_one::<ExchangeRate>("exchange_rates", &query)
            .await
        {
            Ok(Some(rate)) => {
                if !usable_rate(rate.rate_bcv) {
                    warn!(
                        rate = rate.rate_bcv,
                        date = %rate.date,
                        fallback = self.config.fallback_rate,
                        "stored exchange rate is unusable"
                    );
                    return self.config.fallback_rate;
                }
                info!(rate = rate.rate_bcv, date = %rate.date, "exchange rate loaded");
                rate.rate_bcv
            }
            Ok(None) => {
                warn!(fallback = self.config.fallback_rate, "no exchange rate on file");
                self.config.fallback_rate
            }
            Err(err) => {
                warn!(%err, fallback = self.config.fallback_rate, "exchange rate lookup failed");
                self.config.fallback_rate
            }
        }
    }

    /// One full scrape pass for a search term: fetch, extract, filter,
    /// persist card by card. Per-card failures are logged and skipped; only
    /// a failure to obtain the results page fails the run.
    pub async fn run_scrape(
        &self,
        search_term: &str,
        category_override: Option<Category>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, search_term, "starting scrape run");

        let exchange_rate = self.latest_exchange_rate().await;

        let html = self
            .scraper
            .fetch_results_html(search_term)
            .await
            .with_context(|| format!("fetching results page for `{search_term}`"))?;
        let cards = extract_cards(&html)?;
        let cards_seen = cards.len();

        let accepted = collapse_duplicates(
            cards
                .into_iter()
                .filter(|card| accept_card(card, search_term))
                .collect(),
        );
        let cards_accepted = accepted.len();
        info!(cards_seen, cards_accepted, "extracted product cards");

        let mut products_saved = 0usize;
        let mut prices_saved = 0usize;
        let mut skipped = 0usize;
        let mut items = Vec::new();

        for card in &accepted {
            match self
                .ingest_card(card, search_term, category_override, exchange_rate)
                .await
            {
                Ok(outcome) => {
                    products_saved += 1;
                    if outcome.price_written {
                        prices_saved += 1;
                    }
                    items.push(outcome.item);
                }
                Err(err) => {
                    skipped += 1;
                    error!(
                        name = card.name.as_deref().unwrap_or("<sin nombre>"),
                        %err,
                        "card skipped"
                    );
                }
            }
        }

        let finished_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            search_term: search_term.to_string(),
            exchange_rate,
            cards_seen,
            cards_accepted,
            products_saved,
            prices_saved,
            skipped,
            reports_dir: String::new(),
        };
        let dir = write_run_report(&self.config.workspace_root, &summary, &items).await?;
        summary.reports_dir = dir.display().to_string();
        info!(
            %run_id,
            products_saved,
            prices_saved,
            skipped,
            reports_dir = %summary.reports_dir,
            "scrape run finished"
        );
        Ok(summary)
    }

    async fn ingest_card(
        &self,
        card: &ScrapedCard,
        search_term: &str,
        category_override: Option<Category>,
        exchange_rate: f64,
    ) -> Result<CardOutcome> {
        let name = card.name.as_deref().context("card without a name")?;
        let price_usd =
            parse_price_usd(card.price_raw.as_deref(), exchange_rate, self.config.decimal_style);
        let category = category_override
            .unwrap_or_else(|| classify(name, search_term, &self.classifier));

        let name_filter = format!("eq.{name}");
        let existing = self
            .backend
            .select_one::<ProductRecord>(
                "products",
                &[
                    ("select", "id,name,image_url,category"),
                    ("name", name_filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await
            .context("looking up existing product")?;

        let mut image_url = existing.and_then(|p| p.image_url);
        let already_hosted = image_url
            .as_deref()
            .map(|u| is_hosted_url(u, &self.config.backend_url))
            .unwrap_or(false);
        if !already_hosted {
            if let Some(remote) = card.image_url.as_deref() {
                if let Some(uploaded) = self.rehoster.rehost(remote, name).await {
                    image_url = Some(uploaded);
                }
            }
        }

        let product = ProductUpsert {
            name: name.to_string(),
            // The retailer rarely exposes a brand in a stable class.
            brand: "Genérico".to_string(),
            image_url: image_url.clone(),
            category,
        };
        let rows: Vec<ProductRecord> = self
            .backend
            .upsert("products", "name", &product)
            .await
            .context("upserting product")?;
        let product_id = rows
            .first()
            .map(|r| r.id)
            .context("product upsert returned no rows")?;

        let mut price_written = false;
        if price_usd > 0.0 {
            let row = NewPrice {
                product_id,
                store_id: self.config.store_id,
                price_usd,
            };
            let write = match self.config.price_write_mode {
                PriceWriteMode::Insert => self
                    .backend
                    .insert::<_, serde_json::Value>("prices", &row)
                    .await
                    .map(|_| ()),
                PriceWriteMode::UpsertPerStore => self
                    .backend
                    .upsert::<_, serde_json::Value>("prices", "product_id,store_id", &row)
                    .await
                    .map(|_| ()),
            };
            match write {
                Ok(()) => {
                    price_written = true;
                    info!(name, price_usd = %format_usd(price_usd), rate = exchange_rate, "price saved");
                }
                Err(err) => warn!(name, %err, "price write failed; product kept"),
            }
        } else {
            warn!(
                name,
                raw = card.price_raw.as_deref().unwrap_or(""),
                "unparseable price; product saved without a price row"
            );
        }

        Ok(CardOutcome {
            price_written,
            item: SavedItem {
                name: name.to_string(),
                category: category.to_string(),
                price_usd: format_usd(price_usd),
                image_url,
            },
        })
    }
}

/// Cron-driven repeats of the scheduled search terms, gated behind config.
pub async fn maybe_build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().scrape_cron.clone();
    let terms = pipeline.config().scheduled_terms.clone();
    let job_pipeline = pipeline.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = job_pipeline.clone();
        let terms = terms.clone();
        Box::pin(async move {
            for term in &terms {
                match pipeline.run_scrape(term, None).await {
                    Ok(summary) => info!(
                        term,
                        products = summary.products_saved,
                        "scheduled scrape complete"
                    ),
                    Err(err) => error!(term, %err, "scheduled scrape failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[derive(Debug, Default, Serialize)]
pub struct StorePopulationSummary {
    pub inserted: usize,
    pub failed: usize,
    pub total_in_backend: usize,
}

/// Insert the seed stores; per-row failures are tallied, not fatal.
pub async fn populate_stores(
    backend: &BackendClient,
    registry: &StoreRegistry,
) -> Result<StorePopulationSummary> {
    let mut summary = StorePopulationSummary::default();
    for seed in &registry.stores {
        match backend.insert::<_, StoreRecord>("stores", seed).await {
            Ok(_) => {
                info!(name = %seed.name, "store inserted");
                summary.inserted += 1;
            }
            Err(err) => {
                error!(name = %seed.name, %err, "store insert failed");
                summary.failed += 1;
            }
        }
    }
    let all: Vec<StoreRecord> = backend
        .select("stores", &[("select", "id,name,municipality_id")])
        .await
        .context("counting stores")?;
    summary.total_in_backend = all.len();
    Ok(summary)
}

#[derive(Debug, Default, Serialize)]
pub struct RecategorizeSummary {
    pub scanned: usize,
    pub changed: usize,
    pub alimentos: usize,
    pub farmacia: usize,
}

/// Re-run keyword classification over every stored product. Rows with no
/// keyword hit keep their stored category.
pub async fn update_categories(
    backend: &BackendClient,
    classifier: &ClassifierConfig,
) -> Result<RecategorizeSummary> {
    let products: Vec<ProductRecord> = backend
        .select("products", &[("select", "id,name,image_url,category")])
        .await
        .context("listing products")?;

    let mut summary = RecategorizeSummary {
        scanned: products.len(),
        ..Default::default()
    };

    for product in products {
        let Some(name) = product.name.as_deref() else {
            continue;
        };
        let Some(new_category) = match_category(name, "", classifier) else {
            continue;
        };
        match new_category {
            Category::Alimentos => summary.alimentos += 1,
            Category::Farmacia => summary.farmacia += 1,
        }
        if product.category.as_deref() == Some(new_category.as_str()) {
            continue;
        }
        let id_filter = format!("eq.{}", product.id);
        match backend
            .update::<_, serde_json::Value>(
                "products",
                &[("id", id_filter.as_str())],
                &json!({ "category": new_category.as_str() }),
            )
            .await
        {
            Ok(_) => {
                info!(name, category = new_category.as_str(), "product reclassified");
                summary.changed += 1;
            }
            Err(err) => error!(name, %err, "category update failed"),
        }
    }
    Ok(summary)
}

/// Bulk-set the category of specific products; returns the affected names.
pub async fn recategorize(
    backend: &BackendClient,
    ids: &[Uuid],
    category: Category,
) -> Result<Vec<String>> {
    let id_filter = format!(
        "in.({})",
        ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
    );
    let rows: Vec<ProductRecord> = backend
        .update(
            "products",
            &[
                ("id", id_filter.as_str()),
                ("select", "id,name,image_url,category"),
            ],
            &json!({ "category": category.as_str() }),
        )
        .await
        .context("recategorizing products")?;
    Ok(rows.into_iter().filter_map(|r| r.name).collect())
}

#[derive(Debug, Default, Serialize)]
pub struct CleanSummary {
    pub prices_deleted: u64,
    pub products_deleted: u64,
    pub images_deleted: usize,
}

/// Wipe prices, products and bucket objects, in foreign-key order. Waits
/// five seconds before touching anything so a mistaken invocation can be
/// interrupted.
pub async fn clean_database(backend: &BackendClient, bucket: &str) -> Result<CleanSummary> {
    warn!("deleting ALL prices, products and bucket objects in 5 seconds (Ctrl+C to abort)");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let nil_filter = "neq.00000000-0000-0000-0000-000000000000";
    let prices_deleted = backend
        .delete("prices", &[("id", nil_filter)])
        .await
        .context("clearing prices")?;
    let products_deleted = backend
        .delete("products", &[("id", nil_filter)])
        .await
        .context("clearing products")?;

    let objects = backend
        .list_objects(bucket, 1000)
        .await
        .context("listing bucket objects")?;
    let images_deleted = objects.len();
    if !objects.is_empty() {
        let names: Vec<String> = objects.into_iter().map(|o| o.name).collect();
        backend
            .remove_objects(bucket, &names)
            .await
            .context("removing bucket objects")?;
    }

    Ok(CleanSummary {
        prices_deleted,
        products_deleted,
        images_deleted,
    })
}

#[derive(Debug, Serialize)]
pub struct SampledImage {
    pub name: String,
    pub image_url: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ImageAudit {
    pub sample: Vec<SampledImage>,
    pub bucket_objects: usize,
    pub hosted_urls: usize,
    pub external_urls: usize,
}

/// Sample stored image URLs and compare against the bucket contents.
pub async fn check_images(
    backend: &BackendClient,
    bucket: &str,
    backend_url: &str,
) -> Result<ImageAudit> {
    let products: Vec<ProductRecord> = backend
        .select(
            "products",
            &[
                ("select", "id,name,image_url,category"),
                ("image_url", "not.is.null"),
                ("limit", "10"),
            ],
        )
        .await
        .context("sampling products with images")?;

    let mut audit = ImageAudit::default();
    for product in products {
        let Some(url) = product.image_url else { continue };
        if is_hosted_url(&url, backend_url) {
            audit.hosted_urls += 1;
        } else {
            audit.external_urls += 1;
        }
        audit.sample.push(SampledImage {
            name: product.name.unwrap_or_default(),
            image_url: url,
        });
    }

    audit.bucket_objects = backend
        .list_objects(bucket, 100)
        .await
        .context("listing bucket objects")?
        .len();
    Ok(audit)
}

#[derive(Debug, Deserialize)]
struct StateRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MunicipalityRow {
    name: String,
}

#[derive(Debug, Serialize)]
pub struct RegionMunicipalities {
    pub state: String,
    pub municipalities: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct StoreAudit {
    pub stores: Vec<StoreRecord>,
    pub regions: Vec<RegionMunicipalities>,
}

/// List stores plus the municipalities of the two seeded states.
pub async fn check_stores(backend: &BackendClient) -> Result<StoreAudit> {
    let stores: Vec<StoreRecord> = backend
        .select("stores", &[("select", "id,name,municipality_id")])
        .await
        .context("listing stores")?;

    let mut regions = Vec::new();
    for pattern in ["*falc*", "*carabobo*"] {
        let name_filter = format!("ilike.{pattern}");
        let state = backend
            .select_one::<StateRow>(
                "states",
                &[
                    ("select", "id,name"),
                    ("name", name_filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await
            .context("looking up state")?;
        let Some(state) = state else { continue };
        let state_filter = format!("eq.{}", state.id);
        let municipalities: Vec<MunicipalityRow> = backend
            .select(
                "municipalities",
                &[("select", "name"), ("state_id", state_filter.as_str())],
            )
            .await
            .context("listing municipalities")?;
        regions.push(RegionMunicipalities {
            state: state.name,
            municipalities: municipalities.into_iter().map(|m| m.name).collect(),
        });
    }

    Ok(StoreAudit { stores, regions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_registry_parses_municipality_seeds() {
        let yaml = r#"
stores:
  - name: Farmatodo Punto Fijo
    municipality_id: da661bdc-913c-4f0e-8c2e-638b50b133b4
  - name: Farmatodo Valencia Centro
    municipality_id: fb9616ba-de50-4d0d-b8a1-65e63b41d75d
"#;
        let registry: StoreRegistry = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(registry.stores.len(), 2);
        assert_eq!(registry.stores[0].name, "Farmatodo Punto Fijo");
        assert_eq!(
            registry.stores[1].municipality_id.to_string(),
            "fb9616ba-de50-4d0d-b8a1-65e63b41d75d"
        );
    }

    #[test]
    fn price_write_modes_parse_config_spellings() {
        assert_eq!("insert".parse::<PriceWriteMode>().unwrap(), PriceWriteMode::Insert);
        assert_eq!(
            "upsert".parse::<PriceWriteMode>().unwrap(),
            PriceWriteMode::UpsertPerStore
        );
        assert!("append".parse::<PriceWriteMode>().is_err());
    }

    #[test]
    fn degenerate_stored_rates_are_rejected_before_division() {
        // A zero rate would turn every price into +inf, which still passes a
        // `> 0.0` gate; the rate check is what keeps it out of the pipeline.
        let usd = parse_price_usd(
            Some("Bs. 1.573,95"),
            0.0,
            DecimalStyle::CommaDecimal,
        );
        assert!(usd.is_infinite());
        assert!(usd > 0.0);

        assert!(!usable_rate(0.0));
        assert!(!usable_rate(-65.0));
        assert!(!usable_rate(f64::NAN));
        assert!(!usable_rate(f64::INFINITY));
        assert!(usable_rate(65.0));
    }

    #[test]
    fn fallback_rate_must_be_positive_and_finite() {
        assert_eq!(validated_fallback_rate("65.0").unwrap(), 65.0);
        assert_eq!(validated_fallback_rate("382.63").unwrap(), 382.63);
        assert!(validated_fallback_rate("0").is_err());
        assert!(validated_fallback_rate("-1.5").is_err());
        assert!(validated_fallback_rate("NaN").is_err());
        assert!(validated_fallback_rate("inf").is_err());
        assert!(validated_fallback_rate("sixty-five").is_err());
    }

    #[test]
    fn term_lists_split_and_trim() {
        assert_eq!(split_terms("Arroz, Harina , Café"), vec!["Arroz", "Harina", "Café"]);
        assert_eq!(split_terms("Arroz"), vec!["Arroz"]);
        assert!(split_terms(" , ,").is_empty());
    }

    #[test]
    fn hosted_url_detection() {
        let backend = "https://example.supabase.co";
        assert!(is_hosted_url(
            "https://example.supabase.co/storage/v1/object/public/product-images/x.jpg",
            backend
        ));
        assert!(!is_hosted_url("https://www.farmatodo.com.ve/img/x.jpg", backend));
        assert!(!is_hosted_url("/images/x.jpg", backend));
    }

    #[tokio::test]
    async fn run_reports_land_under_the_run_id() {
        let dir = tempdir().expect("tempdir");
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            search_term: "arroz".to_string(),
            exchange_rate: 65.0,
            cards_seen: 3,
            cards_accepted: 2,
            products_saved: 2,
            prices_saved: 1,
            skipped: 0,
            reports_dir: String::new(),
        };
        let items = vec![SavedItem {
            name: "Arroz Primor 1kg".to_string(),
            category: "Alimentos".to_string(),
            price_usd: "24.21".to_string(),
            image_url: None,
        }];

        let written = write_run_report(dir.path(), &summary, &items)
            .await
            .expect("write report");
        assert!(written.ends_with(summary.run_id.to_string()));

        let text =
            std::fs::read_to_string(written.join("run_summary.json")).expect("read report");
        let value: serde_json::Value = serde_json::from_str(&text).expect("parse report");
        assert_eq!(value["run"]["search_term"], "arroz");
        assert_eq!(value["items"][0]["price_usd"], "24.21");
    }
}
