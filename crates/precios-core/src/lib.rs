//! Core domain model and the pure pricing/classification routines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "precios-core";

/// One product card as rendered on a retailer search-results page.
/// Ephemeral: produced per page render, consumed once per pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScrapedCard {
    pub name: Option<String>,
    pub price_raw: Option<String>,
    pub image_url: Option<String>,
    pub image_alt: Option<String>,
}

/// Latest-by-date BCV exchange rate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub rate_bcv: f64,
    pub date: String,
}

/// Upsert payload for the `products` table. Conflict key is `name`, so a
/// re-scrape overwrites brand/image/category but preserves identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductUpsert {
    pub name: String,
    pub brand: String,
    pub image_url: Option<String>,
    pub category: Category,
}

/// Persisted product row as read back from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: Uuid,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPrice {
    pub product_id: Uuid,
    pub store_id: Uuid,
    pub price_usd: f64,
}

/// Seed store definition, keyed to a municipality known at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSeed {
    pub name: String,
    pub municipality_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: Uuid,
    pub name: String,
    pub municipality_id: Option<Uuid>,
}

/// The two retail verticals the retailer taxonomy collapses to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Alimentos,
    Farmacia,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Alimentos => "Alimentos",
            Category::Farmacia => "Farmacia",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "alimentos" => Ok(Category::Alimentos),
            "farmacia" => Ok(Category::Farmacia),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// How a raw Bolívar string encodes its decimal separator. The two styles
/// interpret the same string differently, so this is configuration, never
/// inferred per input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DecimalStyle {
    /// `"Bs. 1.573,95"`: comma is the decimal separator, dots are thousands.
    #[default]
    CommaDecimal,
    /// `"Bs.1.150.60"`: the last dot is the decimal separator, earlier dots
    /// are thousands. A dotless string is an integer Bs amount.
    LastDotDecimal,
}

impl FromStr for DecimalStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "comma" | "comma-decimal" => Ok(DecimalStyle::CommaDecimal),
            "last-dot" | "last-dot-decimal" | "dot" => Ok(DecimalStyle::LastDotDecimal),
            other => Err(format!("unknown decimal style: {other}")),
        }
    }
}

/// Parse a scraped Bolívar price into a USD amount rounded to two decimals.
///
/// Total over all inputs: `None`, empty, and unparseable strings all come out
/// as `0.0`, which downstream reads as "skip pricing, keep going".
pub fn parse_price_usd(raw: Option<&str>, exchange_rate: f64, style: DecimalStyle) -> f64 {
    let Some(raw) = raw else { return 0.0 };
    let Some(bolivars) = parse_bolivars(raw, style) else {
        return 0.0;
    };
    round_half_away(bolivars / exchange_rate)
}

/// Two-decimal display form, e.g. `24.21`.
pub fn format_usd(amount: f64) -> String {
    format!("{:.2}", round_half_away(amount))
}

fn round_half_away(value: f64) -> f64 {
    // f64::round is round-half-away-from-zero, which is what the stored
    // prices use.
    (value * 100.0).round() / 100.0
}

fn parse_bolivars(raw: &str, style: DecimalStyle) -> Option<f64> {
    match style {
        DecimalStyle::CommaDecimal => {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == ',')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            let mut groups = cleaned.splitn(3, ',');
            let int_part = groups.next().unwrap_or("");
            let frac_part = groups.next().unwrap_or("");
            // Anything after a second comma is trailing garbage; the original
            // prefix parse ignored it too.
            if int_part.is_empty() && frac_part.is_empty() {
                return None;
            }
            format!("{int_part}.{frac_part}").parse().ok()
        }
        DecimalStyle::LastDotDecimal => {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            match cleaned.rfind('.') {
                Some(idx) => {
                    let int_part: String = cleaned[..idx]
                        .chars()
                        .filter(char::is_ascii_digit)
                        .collect();
                    let frac_part = &cleaned[idx + 1..];
                    if int_part.is_empty() && frac_part.is_empty() {
                        return None;
                    }
                    format!("{int_part}.{frac_part}").parse().ok()
                }
                None => cleaned.parse().ok(),
            }
        }
    }
}

/// Keyword sets used when the retailer's own taxonomy is unavailable, plus
/// the category assigned when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    pub alimentos_keywords: Vec<String>,
    pub farmacia_keywords: Vec<String>,
    pub default_category: Category,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let alimentos = [
            "harina",
            "pan",
            "arroz",
            "pasta",
            "aceite",
            "azucar",
            "azúcar",
            "leche",
            "cafe",
            "café",
            "chocolate",
            "galleta",
            "cereal",
            "mantequilla",
            "margarina",
            "mayonesa",
            "salsa",
            "sopa",
            "atun",
            "atún",
            "bebida",
            "refresco",
            "snack",
            "queso",
        ];
        let farmacia = [
            "acetaminofen",
            "acetaminofén",
            "paracetamol",
            "ibuprofeno",
            "tableta",
            "capsula",
            "cápsula",
            "jarabe",
            "analper",
            "gasa",
            "venda",
            "alcohol",
            "vitamina",
            "diclofenac",
            "gel",
        ];
        Self {
            alimentos_keywords: alimentos.iter().map(|s| s.to_string()).collect(),
            farmacia_keywords: farmacia.iter().map(|s| s.to_string()).collect(),
            default_category: Category::Farmacia,
        }
    }
}

/// Keyword lookup without the default fallback. `None` means neither set
/// matched; callers that re-categorize existing rows keep the stored value in
/// that case instead of forcing the default.
pub fn match_category(
    product_name: &str,
    search_term: &str,
    config: &ClassifierConfig,
) -> Option<Category> {
    let name = product_name.to_lowercase();
    let term = search_term.to_lowercase();
    let hit = |keywords: &[String]| {
        keywords
            .iter()
            .any(|kw| name.contains(kw.as_str()) || term.contains(kw.as_str()))
    };

    // Pharmacy wins ties: the retailer's primary vertical has priority.
    if hit(&config.farmacia_keywords) {
        Some(Category::Farmacia)
    } else if hit(&config.alimentos_keywords) {
        Some(Category::Alimentos)
    } else {
        None
    }
}

/// Assign a category to a scraped product. Deterministic, order-independent,
/// no external calls. Diacritics are deliberately NOT stripped here; the
/// keyword sets carry accented and unaccented spellings instead.
pub fn classify(product_name: &str, search_term: &str, config: &ClassifierConfig) -> Category {
    match_category(product_name, search_term, config).unwrap_or(config.default_category)
}

/// Diacritic-free, lower-cased form for robust substring comparison.
/// Idempotent: normalizing a normalized string is a no-op.
pub fn normalize(text: Option<&str>) -> String {
    text.unwrap_or_default()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Slug form of a product name for storage object paths.
pub fn sanitize_filename(name: Option<&str>) -> String {
    let base = normalize(name);
    let slug = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unk".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_decimal_strips_thousands_dot() {
        let usd = parse_price_usd(Some("Bs. 1.573,95"), 65.0, DecimalStyle::CommaDecimal);
        assert_eq!(format_usd(usd), "24.21");
    }

    #[test]
    fn last_dot_decimal_treats_final_dot_as_separator() {
        let usd = parse_price_usd(Some("Bs.1.150.60"), 382.63, DecimalStyle::LastDotDecimal);
        assert_eq!(format_usd(usd), "3.01");
    }

    #[test]
    fn last_dot_decimal_without_thousands_group() {
        let usd = parse_price_usd(Some("Bs.727.50"), 382.63, DecimalStyle::LastDotDecimal);
        assert_eq!(format_usd(usd), "1.90");
    }

    #[test]
    fn dotless_string_is_an_integer_bolivar_amount() {
        let usd = parse_price_usd(Some("Bs 500"), 100.0, DecimalStyle::LastDotDecimal);
        assert_eq!(usd, 5.0);
    }

    #[test]
    fn missing_and_empty_inputs_parse_to_zero() {
        for style in [DecimalStyle::CommaDecimal, DecimalStyle::LastDotDecimal] {
            assert_eq!(parse_price_usd(None, 65.0, style), 0.0);
            assert_eq!(parse_price_usd(Some(""), 65.0, style), 0.0);
            assert_eq!(parse_price_usd(Some("precio no disponible"), 65.0, style), 0.0);
        }
    }

    #[test]
    fn lone_separators_parse_to_zero() {
        assert_eq!(parse_price_usd(Some("Bs ,"), 65.0, DecimalStyle::CommaDecimal), 0.0);
        assert_eq!(
            parse_price_usd(Some("Bs ..."), 65.0, DecimalStyle::LastDotDecimal),
            0.0
        );
    }

    #[test]
    fn comma_decimal_ignores_groups_after_the_second_comma() {
        // Prefix-parse semantics: "12,34,56" reads as 12.34.
        let usd = parse_price_usd(Some("12,34,56"), 1.0, DecimalStyle::CommaDecimal);
        assert_eq!(format_usd(usd), "12.34");
    }

    #[test]
    fn fractional_only_price_parses() {
        let usd = parse_price_usd(Some("Bs ,95"), 1.0, DecimalStyle::CommaDecimal);
        assert_eq!(format_usd(usd), "0.95");
    }

    #[test]
    fn classifier_matches_food_keyword_in_name() {
        let config = ClassifierConfig::default();
        assert_eq!(classify("Doritos Queso", "Doritos", &config), Category::Alimentos);
        assert_eq!(classify("Harina P.A.N. 1kg", "harina", &config), Category::Alimentos);
    }

    #[test]
    fn classifier_matches_keyword_in_search_term() {
        let config = ClassifierConfig::default();
        assert_eq!(
            classify("Producto Sin Marca 500g", "arroz", &config),
            Category::Alimentos
        );
    }

    #[test]
    fn pharmacy_wins_when_both_sets_match() {
        let config = ClassifierConfig::default();
        assert_eq!(
            classify("Gel Antibacterial Snack Pack", "gel", &config),
            Category::Farmacia
        );
    }

    #[test]
    fn unmatched_product_falls_back_to_default() {
        let config = ClassifierConfig::default();
        assert_eq!(
            classify("Producto Desconocido XYZ", "xyz", &config),
            Category::Farmacia
        );
        assert_eq!(match_category("Producto Desconocido XYZ", "xyz", &config), None);
    }

    #[test]
    fn normalize_strips_diacritics_and_case() {
        assert_eq!(normalize(Some("Ñandú Pérez")), "nandu perez");
        assert_eq!(normalize(None), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(Some("Azúcar Montalbán"));
        let twice = normalize(Some(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_builds_hyphenated_slugs() {
        assert_eq!(
            sanitize_filename(Some("Café Fama de América 250g")),
            "cafe-fama-de-america-250g"
        );
        assert_eq!(sanitize_filename(Some("  ¡¡Oferta!!  ")), "oferta");
        assert_eq!(sanitize_filename(None), "unk");
        assert_eq!(sanitize_filename(Some("¿?¡!")), "unk");
    }

    #[test]
    fn category_round_trips_through_strings() {
        assert_eq!("Alimentos".parse::<Category>().unwrap(), Category::Alimentos);
        assert_eq!("farmacia".parse::<Category>().unwrap(), Category::Farmacia);
        assert!("juguetes".parse::<Category>().is_err());
        assert_eq!(Category::Alimentos.to_string(), "Alimentos");
    }

    #[test]
    fn decimal_style_parses_config_spellings() {
        assert_eq!("comma".parse::<DecimalStyle>().unwrap(), DecimalStyle::CommaDecimal);
        assert_eq!(
            "last-dot".parse::<DecimalStyle>().unwrap(),
            DecimalStyle::LastDotDecimal
        );
        assert!("semicolon".parse::<DecimalStyle>().is_err());
    }
}
