use crate::http::build_client;
use crate::models::{KeywordScore, Marketplace, Review};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::debug;
use urlencoding::encode;

static OXYLABS_USERNAME: Lazy<String> =
    Lazy::new(|| env::var("OXYLABS_USERNAME").unwrap_or_default());

static OXYLABS_PASSWORD: Lazy<String> =
    Lazy::new(|| env::var("OXYLABS_PASSWORD").unwrap_or_default());

static APIFY_TOKEN: Lazy<Option<String>> = Lazy::new(|| {
    env::var("APIFY_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty())
});

static APIFY_REVIEWS_ACTOR: Lazy<String> = Lazy::new(|| {
    env::var("APIFY_REVIEWS_ACTOR").unwrap_or_else(|_| "junglee~amazon-reviews-scraper".into())
});

const OXYLABS_REALTIME_URL: &str = "https://realtime.oxylabs.io/v1/queries";

fn network_enabled() -> bool {
    match env::var("SCRAPER_ENABLE_NETWORK") {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("invalid asin: {0}")]
    InvalidAsin(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

/// Adapter over the scraping providers. Network calls are gated by
/// `SCRAPER_ENABLE_NETWORK`; without it (and in tests) responses are
/// synthesized deterministically from the query so every flow still runs.
#[derive(Clone)]
pub struct ScraperClient {
    http: Client,
}

pub fn is_valid_asin(asin: &str) -> bool {
    asin.len() == 10 && asin.chars().all(|ch| ch.is_ascii_alphanumeric())
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct OxylabsQuery<'a> {
    source: &'a str,
    query: &'a str,
    domain: &'a str,
    parse: bool,
    geo_location: Option<&'a str>,
    pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OxylabsEnvelope {
    #[serde(default)]
    results: Vec<OxylabsResult>,
}

#[derive(Debug, Deserialize)]
struct OxylabsResult {
    content: Value,
}

impl ScraperClient {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }

    /// Looks up one product by ASIN and returns the normalized content
    /// payload.
    pub async fn lookup_product(
        &self,
        asin: &str,
        marketplace: Marketplace,
    ) -> Result<Value, ScraperError> {
        if !is_valid_asin(asin) {
            return Err(ScraperError::InvalidAsin(asin.to_string()));
        }
        if !network_enabled() {
            return Ok(synth_product(asin, marketplace));
        }
        let query = OxylabsQuery {
            source: "amazon_product",
            query: asin,
            domain: marketplace.domain(),
            parse: true,
            geo_location: Some(marketplace.geo_location()),
            pages: None,
        };
        self.realtime(&query).await
    }

    /// Fetches customer reviews for one ASIN, preferring the Apify actor
    /// when a token is configured.
    pub async fn fetch_reviews(
        &self,
        asin: &str,
        marketplace: Marketplace,
        max_pages: u32,
    ) -> Result<Vec<Review>, ScraperError> {
        if !is_valid_asin(asin) {
            return Err(ScraperError::InvalidAsin(asin.to_string()));
        }
        if !network_enabled() {
            return Ok(synth_reviews(asin, marketplace));
        }
        if APIFY_TOKEN.is_some() {
            return self.apify_reviews(asin, marketplace).await;
        }
        let query = OxylabsQuery {
            source: "amazon_reviews",
            query: asin,
            domain: marketplace.domain(),
            parse: true,
            geo_location: Some(marketplace.geo_location()),
            pages: Some(max_pages.max(1)),
        };
        let content = self.realtime(&query).await?;
        parse_review_content(&content, asin)
    }

    /// Keyword search returning competitor ASINs in result order.
    pub async fn search_products(
        &self,
        keyword: &str,
        marketplace: Marketplace,
    ) -> Result<Vec<String>, ScraperError> {
        if keyword.trim().is_empty() {
            return Err(ScraperError::UnexpectedPayload("empty keyword".into()));
        }
        if !network_enabled() {
            return Ok(synth_search_asins(keyword, marketplace));
        }
        let query = OxylabsQuery {
            source: "amazon_search",
            query: keyword,
            domain: marketplace.domain(),
            parse: true,
            geo_location: Some(marketplace.geo_location()),
            pages: Some(1),
        };
        let content = self.realtime(&query).await?;
        parse_search_asins(&content)
    }

    /// Related keywords with relevance scores for a seed term.
    pub async fn search_keywords(
        &self,
        keyword: &str,
        marketplace: Marketplace,
    ) -> Result<Vec<KeywordScore>, ScraperError> {
        if keyword.trim().is_empty() {
            return Err(ScraperError::UnexpectedPayload("empty keyword".into()));
        }
        if !network_enabled() {
            return Ok(synth_keywords(keyword));
        }
        let query = OxylabsQuery {
            source: "amazon_search",
            query: keyword,
            domain: marketplace.domain(),
            parse: true,
            geo_location: Some(marketplace.geo_location()),
            pages: Some(1),
        };
        let content = self.realtime(&query).await?;
        Ok(parse_suggested_keywords(&content, keyword))
    }

    async fn realtime(&self, query: &OxylabsQuery<'_>) -> Result<Value, ScraperError> {
        if OXYLABS_USERNAME.is_empty() || OXYLABS_PASSWORD.is_empty() {
            return Err(ScraperError::Request(
                "oxylabs credentials are not configured".into(),
            ));
        }
        debug!(
            target = "listforge.scraper",
            source = query.source,
            query = query.query,
            "realtime query"
        );
        let response = self
            .http
            .post(OXYLABS_REALTIME_URL)
            .basic_auth(OXYLABS_USERNAME.as_str(), Some(OXYLABS_PASSWORD.as_str()))
            .json(query)
            .send()
            .await
            .map_err(|err| ScraperError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ScraperError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let envelope: OxylabsEnvelope = response
            .json()
            .await
            .map_err(|err| ScraperError::UnexpectedPayload(err.to_string()))?;
        envelope
            .results
            .into_iter()
            .next()
            .map(|result| result.content)
            .ok_or_else(|| ScraperError::UnexpectedPayload("empty results".into()))
    }

    async fn apify_reviews(
        &self,
        asin: &str,
        marketplace: Marketplace,
    ) -> Result<Vec<Review>, ScraperError> {
        let token = APIFY_TOKEN
            .as_deref()
            .ok_or_else(|| ScraperError::Request("apify token missing".into()))?;
        let url = format!(
            "https://api.apify.com/v2/acts/{actor}/run-sync-get-dataset-items?token={token}",
            actor = encode(APIFY_REVIEWS_ACTOR.as_str()),
            token = encode(token),
        );
        let body = json!({
            "productUrls": [format!("https://www.{}/dp/{asin}", marketplace.domain())],
            "maxReviews": 50,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ScraperError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ScraperError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let items: Vec<Value> = response
            .json()
            .await
            .map_err(|err| ScraperError::UnexpectedPayload(err.to_string()))?;
        Ok(items
            .iter()
            .filter_map(|item| review_from_value(item, asin))
            .collect())
    }
}

impl Default for ScraperClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_review_content(content: &Value, asin: &str) -> Result<Vec<Review>, ScraperError> {
    let reviews = content
        .get("reviews")
        .and_then(Value::as_array)
        .ok_or_else(|| ScraperError::UnexpectedPayload("missing reviews array".into()))?;
    Ok(reviews
        .iter()
        .filter_map(|item| review_from_value(item, asin))
        .collect())
}

fn review_from_value(item: &Value, asin: &str) -> Option<Review> {
    let body = item
        .get("content")
        .or_else(|| item.get("text"))
        .or_else(|| item.get("reviewDescription"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if body.is_empty() {
        return None;
    }
    Some(Review {
        asin: asin.to_string(),
        title: item
            .get("title")
            .or_else(|| item.get("reviewTitle"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        body,
        rating: item
            .get("rating")
            .or_else(|| item.get("ratingScore"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32,
        author: item
            .get("author")
            .or_else(|| item.get("userProfileName"))
            .and_then(Value::as_str)
            .unwrap_or("Anonymous")
            .trim()
            .to_string(),
        date: item
            .get("timestamp")
            .or_else(|| item.get("date"))
            .and_then(Value::as_str)
            .map(|value| value.to_string()),
    })
}

fn parse_search_asins(content: &Value) -> Result<Vec<String>, ScraperError> {
    let organic = content
        .get("results")
        .and_then(|results| results.get("organic"))
        .and_then(Value::as_array)
        .ok_or_else(|| ScraperError::UnexpectedPayload("missing organic results".into()))?;
    Ok(organic
        .iter()
        .filter_map(|item| item.get("asin").and_then(Value::as_str))
        .filter(|asin| is_valid_asin(asin))
        .map(|asin| asin.to_string())
        .collect())
}

fn parse_suggested_keywords(content: &Value, seed: &str) -> Vec<KeywordScore> {
    let suggested = content
        .get("results")
        .and_then(|results| results.get("suggested"))
        .and_then(Value::as_array);
    match suggested {
        Some(items) => items
            .iter()
            .filter_map(|item| item.get("phrase").and_then(Value::as_str))
            .enumerate()
            .map(|(rank, phrase)| KeywordScore {
                keyword: phrase.to_string(),
                relevance: (1.0 - rank as f64 * 0.08).max(0.1),
            })
            .collect(),
        None => synth_keywords(seed),
    }
}

fn seed_for(query: &str, marketplace: Marketplace) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    marketplace.domain().hash(&mut hasher);
    hasher.finish()
}

fn synth_product(asin: &str, marketplace: Marketplace) -> Value {
    let seed = seed_for(asin, marketplace);
    let price = 9.99 + (seed % 9000) as f64 / 100.0;
    json!({
        "asin": asin,
        "title": format!("Sample product {}", &asin[..6.min(asin.len())]),
        "brand": "Sample Brand",
        "price": (price * 100.0).round() / 100.0,
        "currency": "USD",
        "rating": 3.5 + (seed % 15) as f64 / 10.0,
        "reviews_count": (seed % 4000) + 12,
        "bullet_points": [
            "Durable construction",
            "Easy to clean",
            "Backed by a 12-month warranty",
        ],
        "source": "offline",
    })
}

fn synth_reviews(asin: &str, marketplace: Marketplace) -> Vec<Review> {
    let seed = seed_for(asin, marketplace);
    let mut rng = SmallRng::seed_from_u64(seed);
    let count = 3 + (seed % 5) as usize;
    let templates = [
        ("Great value", "Works exactly as described and arrived early."),
        ("Solid quality", "The build quality surprised me for the price."),
        ("Does the job", "Not fancy, but it does what I needed."),
        ("Would buy again", "Second one I've ordered, no complaints."),
        (
            "Good with caveats",
            "Mostly happy, though the \"premium\" finish scuffs easily.",
        ),
    ];
    (0..count)
        .map(|index| {
            let (title, body) = templates[index % templates.len()];
            Review {
                asin: asin.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                rating: rng.random_range(2..=5) as f32,
                author: format!("Customer {}", index + 1),
                date: None,
            }
        })
        .collect()
}

fn synth_search_asins(keyword: &str, marketplace: Marketplace) -> Vec<String> {
    let seed = seed_for(keyword, marketplace);
    (0..8)
        .map(|index| format!("B{:09X}", (seed.wrapping_add(index * 7919)) & 0xFFFF_FFFF))
        .map(|asin| asin.chars().take(10).collect())
        .collect()
}

fn synth_keywords(seed_term: &str) -> Vec<KeywordScore> {
    let qualifiers = [
        ("", 0.95),
        ("for home", 0.72),
        ("premium", 0.61),
        ("with accessories", 0.55),
        ("gift", 0.44),
        ("cheap", 0.31),
    ];
    qualifiers
        .iter()
        .map(|(qualifier, relevance)| KeywordScore {
            keyword: if qualifier.is_empty() {
                seed_term.trim().to_string()
            } else {
                format!("{} {qualifier}", seed_term.trim())
            },
            relevance: *relevance,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asin_validation() {
        assert!(is_valid_asin("B00EXAMPLE"));
        assert!(is_valid_asin("0123456789"));
        assert!(!is_valid_asin("B00EXAMPLE1"));
        assert!(!is_valid_asin("B00-XAMPLE"));
        assert!(!is_valid_asin(""));
    }

    #[tokio::test]
    async fn offline_lookup_is_deterministic() {
        let client = ScraperClient::new();
        let first = client
            .lookup_product("B00EXAMPLE", Marketplace::AmazonUs)
            .await
            .expect("offline lookup");
        let second = client
            .lookup_product("B00EXAMPLE", Marketplace::AmazonUs)
            .await
            .expect("offline lookup");
        assert_eq!(first, second);
        assert_eq!(first["asin"], "B00EXAMPLE");
    }

    #[tokio::test]
    async fn invalid_asin_rejected_before_any_call() {
        let client = ScraperClient::new();
        let err = client
            .lookup_product("nope", Marketplace::AmazonUs)
            .await
            .expect_err("invalid asin");
        assert!(matches!(err, ScraperError::InvalidAsin(_)));
    }

    #[tokio::test]
    async fn offline_reviews_are_plausible() {
        let client = ScraperClient::new();
        let reviews = client
            .fetch_reviews("B00EXAMPLE", Marketplace::AmazonUk, 1)
            .await
            .expect("offline reviews");
        assert!(!reviews.is_empty());
        assert!(reviews.iter().all(|review| {
            review.asin == "B00EXAMPLE" && review.rating >= 1.0 && review.rating <= 5.0
        }));
    }

    #[tokio::test]
    async fn offline_search_returns_valid_asins() {
        let client = ScraperClient::new();
        let asins = client
            .search_products("yoga mat", Marketplace::AmazonUs)
            .await
            .expect("offline search");
        assert!(!asins.is_empty());
        assert!(asins.iter().all(|asin| is_valid_asin(asin)));
    }

    #[tokio::test]
    async fn keyword_scores_descend_from_seed_term() {
        let client = ScraperClient::new();
        let keywords = client
            .search_keywords("yoga mat", Marketplace::AmazonUs)
            .await
            .expect("offline keywords");
        assert_eq!(keywords[0].keyword, "yoga mat");
        assert!(
            keywords
                .windows(2)
                .all(|pair| pair[0].relevance >= pair[1].relevance)
        );
    }

    #[test]
    fn review_parsing_tolerates_provider_field_names() {
        let oxylabs_shape = json!({ "title": "Nice", "content": "Good mat", "rating": 4, "author": "Sam" });
        let apify_shape = json!({ "reviewTitle": "Nice", "reviewDescription": "Good mat", "ratingScore": 4.0, "userProfileName": "Sam" });
        let first = review_from_value(&oxylabs_shape, "B00EXAMPLE").expect("oxylabs");
        let second = review_from_value(&apify_shape, "B00EXAMPLE").expect("apify");
        assert_eq!(first.body, second.body);
        assert_eq!(first.rating, second.rating);
        assert_eq!(first.author, second.author);
    }
}
