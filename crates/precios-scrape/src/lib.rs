//! Retailer page extraction and the image-rehosting capability seam.

use async_trait::async_trait;
use precios_backend::{BackendClient, FetchError, PageFetcher};
use precios_core::{normalize, sanitize_filename, ScrapedCard};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "precios-scrape";

const CARD_SELECTOR: &str = "div.product-card";
const TITLE_SELECTOR: &str = ".product-card__title";
const PRICE_SELECTOR: &str = ".product-card__price-value";
const IMAGE_LAZY_SELECTOR: &str = ".product-image__image.lozad";
const IMAGE_SELECTOR: &str = ".product-image__image";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

fn sel(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extract every product card from a rendered search-results page.
///
/// Lazily-loaded images keep their `lozad` class until hydration, so the
/// lazy variant of the image selector is tried first.
pub fn extract_cards(html: &str) -> Result<Vec<ScrapedCard>, ScrapeError> {
    let document = Html::parse_document(html);
    let card_sel = sel(CARD_SELECTOR)?;
    let title_sel = sel(TITLE_SELECTOR)?;
    let price_sel = sel(PRICE_SELECTOR)?;
    let image_lazy_sel = sel(IMAGE_LAZY_SELECTOR)?;
    let image_sel = sel(IMAGE_SELECTOR)?;

    let mut cards = Vec::new();
    for card in document.select(&card_sel) {
        let image = card
            .select(&image_lazy_sel)
            .next()
            .or_else(|| card.select(&image_sel).next());
        cards.push(ScrapedCard {
            name: first_text(card, &title_sel),
            price_raw: first_text(card, &price_sel),
            image_url: image
                .and_then(|n| n.value().attr("src"))
                .and_then(|v| text_or_none(v.to_string())),
            image_alt: image
                .and_then(|n| n.value().attr("alt"))
                .and_then(|v| text_or_none(v.to_string())),
        });
    }
    Ok(cards)
}

/// A card is worth persisting when it has a name and a raw price, and its
/// alt text actually mentions the search term (accent-insensitive).
pub fn accept_card(card: &ScrapedCard, search_term: &str) -> bool {
    if card.name.is_none() || card.price_raw.is_none() {
        return false;
    }
    let alt = normalize(card.image_alt.as_deref());
    let term = normalize(Some(search_term));
    alt.contains(&term)
}

/// Collapse duplicate renders of the same product; first occurrence wins.
pub fn collapse_duplicates(cards: Vec<ScrapedCard>) -> Vec<ScrapedCard> {
    let mut seen = std::collections::HashSet::new();
    cards
        .into_iter()
        .filter(|card| seen.insert(normalize(card.name.as_deref())))
        .collect()
}

pub fn search_url(base_url: &str, search_term: &str) -> String {
    format!(
        "{}/buscar?product={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(search_term)
    )
}

/// Seam between page acquisition and extraction. Tests run the extraction
/// path against inline HTML; the HTTP implementation drives one page at a
/// time.
#[async_trait]
pub trait StoreScraper: Send + Sync {
    fn store_slug(&self) -> &'static str;
    async fn fetch_results_html(&self, search_term: &str) -> Result<String, ScrapeError>;
}

pub struct FarmatodoScraper {
    fetcher: PageFetcher,
    base_url: String,
}

impl FarmatodoScraper {
    pub fn new(fetcher: PageFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StoreScraper for FarmatodoScraper {
    fn store_slug(&self) -> &'static str {
        "farmatodo"
    }

    async fn fetch_results_html(&self, search_term: &str) -> Result<String, ScrapeError> {
        let url = search_url(&self.base_url, search_term);
        debug!(url, "fetching search results");
        let resp = self.fetcher.fetch_bytes(&url, None).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

/// Optional platform capability: fetch a product image and re-host it in the
/// backend's bucket. Selected at startup; the no-op implementation stands in
/// when rehosting is disabled. Failures never block persistence: every
/// error path degrades to `None`.
#[async_trait]
pub trait ImageRehoster: Send + Sync {
    async fn rehost(&self, remote_url: &str, product_name: &str) -> Option<String>;
}

pub struct NoopRehoster;

#[async_trait]
impl ImageRehoster for NoopRehoster {
    async fn rehost(&self, _remote_url: &str, _product_name: &str) -> Option<String> {
        None
    }
}

pub struct BucketRehoster {
    fetcher: PageFetcher,
    backend: BackendClient,
    bucket: String,
    retailer_base: String,
}

impl BucketRehoster {
    pub fn new(
        fetcher: PageFetcher,
        backend: BackendClient,
        bucket: impl Into<String>,
        retailer_base: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            backend,
            bucket: bucket.into(),
            retailer_base: retailer_base.into(),
        }
    }

    fn resolve_url(&self, remote_url: &str) -> String {
        if remote_url.starts_with('/') {
            format!("{}{remote_url}", self.retailer_base.trim_end_matches('/'))
        } else {
            remote_url.to_string()
        }
    }
}

#[async_trait]
impl ImageRehoster for BucketRehoster {
    async fn rehost(&self, remote_url: &str, product_name: &str) -> Option<String> {
        let url = self.resolve_url(remote_url);
        let resp = match self.fetcher.fetch_bytes(&url, Some(&self.retailer_base)).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(url, %err, "image fetch failed");
                return None;
            }
        };

        let content_type = resp
            .content_type
            .clone()
            .unwrap_or_else(|| "image/jpeg".to_string());
        if content_type.contains("svg") {
            return None;
        }
        let extension = if content_type.contains("png") { "png" } else { "jpg" };

        // Content-addressed object name so re-uploading identical bytes is
        // idempotent.
        let hash = precios_backend::sha256_hex(&resp.body);
        let object_path = format!(
            "{}-{}.{extension}",
            sanitize_filename(Some(product_name)),
            &hash[..12]
        );

        if let Err(err) = self
            .backend
            .upload_object(&self.bucket, &object_path, &content_type, resp.body)
            .await
        {
            warn!(object_path, %err, "image upload failed");
            return None;
        }

        Some(self.backend.public_object_url(&self.bucket, &object_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
        <html><body>
          <div class="search-results">
            <div class="product-card">
              <img class="product-image__image lozad"
                   src="/images/arroz-primor.jpg" alt="Arroz Primor 1kg" />
              <span class="product-card__title">Arroz Primor 1kg</span>
              <span class="product-card__price-value">Bs. 1.573,95</span>
            </div>
            <div class="product-card">
              <img class="product-image__image"
                   src="https://cdn.example.com/azucar.jpg" alt="Azúcar Montalbán 1kg" />
              <span class="product-card__title">Azúcar Montalbán 1kg</span>
              <span class="product-card__price-value">Bs. 890,00</span>
            </div>
            <div class="product-card">
              <img class="product-image__image lozad"
                   src="/images/arroz-primor.jpg" alt="Arroz Primor 1kg" />
              <span class="product-card__title">Arroz Primor 1kg</span>
              <span class="product-card__price-value">Bs. 1.573,95</span>
            </div>
            <div class="product-card">
              <span class="product-card__title">Tarjeta Sin Precio</span>
            </div>
          </div>
        </body></html>
    "#;

    #[test]
    fn extracts_every_card_with_selector_fallback() {
        let cards = extract_cards(RESULTS_PAGE).expect("extract");
        assert_eq!(cards.len(), 4);
        assert_eq!(cards[0].name.as_deref(), Some("Arroz Primor 1kg"));
        assert_eq!(cards[0].price_raw.as_deref(), Some("Bs. 1.573,95"));
        assert_eq!(cards[0].image_url.as_deref(), Some("/images/arroz-primor.jpg"));
        assert_eq!(cards[0].image_alt.as_deref(), Some("Arroz Primor 1kg"));
        // non-lazy image still resolves through the plain selector
        assert_eq!(
            cards[1].image_url.as_deref(),
            Some("https://cdn.example.com/azucar.jpg")
        );
        assert!(cards[3].price_raw.is_none());
    }

    #[test]
    fn acceptance_requires_name_price_and_matching_alt() {
        let cards = extract_cards(RESULTS_PAGE).expect("extract");
        assert!(accept_card(&cards[0], "arroz"));
        assert!(!accept_card(&cards[1], "arroz"));
        assert!(!accept_card(&cards[3], "tarjeta"));
    }

    #[test]
    fn alt_matching_is_accent_insensitive() {
        let cards = extract_cards(RESULTS_PAGE).expect("extract");
        assert!(accept_card(&cards[1], "azucar"));
        assert!(accept_card(&cards[1], "Azúcar"));
    }

    #[test]
    fn duplicate_cards_collapse_by_normalized_name() {
        let cards = extract_cards(RESULTS_PAGE).expect("extract");
        let accepted: Vec<_> = cards
            .into_iter()
            .filter(|c| accept_card(c, "arroz"))
            .collect();
        assert_eq!(accepted.len(), 2);
        let collapsed = collapse_duplicates(accepted);
        assert_eq!(collapsed.len(), 1);
    }

    #[test]
    fn empty_page_yields_no_cards() {
        let cards = extract_cards("<html><body></body></html>").expect("extract");
        assert!(cards.is_empty());
    }

    #[test]
    fn search_urls_encode_the_term() {
        assert_eq!(
            search_url("https://www.farmatodo.com.ve/", "harina de maíz"),
            "https://www.farmatodo.com.ve/buscar?product=harina%20de%20ma%C3%ADz"
        );
    }

    #[tokio::test]
    async fn noop_rehoster_always_declines() {
        let rehoster = NoopRehoster;
        assert_eq!(rehoster.rehost("/images/x.jpg", "Producto").await, None);
    }
}
