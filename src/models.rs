use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Hard ceiling on keys accepted by the batch lookup endpoint.
pub const MAX_BATCH_KEYS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchLookupRequest {
    pub keys: Vec<String>,
    #[serde(default)]
    pub marketplace: Marketplace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateListingRequest {
    pub product: ProductDetails,
    pub keywords: Vec<KeywordScore>,
    #[serde(default)]
    pub marketplace: Marketplace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionEditRequest {
    pub section_type: SectionType,
    #[serde(default)]
    pub selected_variation: Option<usize>,
    #[serde(default)]
    pub final_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewsJobRequest {
    pub asins: Vec<String>,
    #[serde(default)]
    pub marketplace: Marketplace,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntelJobRequest {
    pub keyword: String,
    #[serde(default)]
    pub marketplace: Marketplace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionRequest {
    pub asins: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Marketplace {
    #[default]
    AmazonUs,
    AmazonUk,
    AmazonDe,
}

impl Marketplace {
    pub fn domain(&self) -> &'static str {
        match self {
            Marketplace::AmazonUs => "amazon.com",
            Marketplace::AmazonUk => "amazon.co.uk",
            Marketplace::AmazonDe => "amazon.de",
        }
    }

    pub fn geo_location(&self) -> &'static str {
        match self {
            Marketplace::AmazonUs => "United States",
            Marketplace::AmazonUk => "United Kingdom",
            Marketplace::AmazonDe => "Germany",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "AMAZON_US" | "US" => Some(Marketplace::AmazonUs),
            "AMAZON_UK" | "UK" | "GB" => Some(Marketplace::AmazonUk),
            "AMAZON_DE" | "DE" => Some(Marketplace::AmazonDe),
            _ => None,
        }
    }
}

/// Content slots of a listing, in the canonical order used for keyword
/// placement attribution (title first, then bullets, description, search
/// terms, backend attributes).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Title,
    Bullet1,
    Bullet2,
    Bullet3,
    Bullet4,
    Bullet5,
    Description,
    SearchTerms,
    BackendAttributes,
}

pub const CANONICAL_SECTION_ORDER: [SectionType; 9] = [
    SectionType::Title,
    SectionType::Bullet1,
    SectionType::Bullet2,
    SectionType::Bullet3,
    SectionType::Bullet4,
    SectionType::Bullet5,
    SectionType::Description,
    SectionType::SearchTerms,
    SectionType::BackendAttributes,
];

impl SectionType {
    pub fn display_name(&self) -> &'static str {
        match self {
            SectionType::Title => "Title",
            SectionType::Bullet1 => "Bullet 1",
            SectionType::Bullet2 => "Bullet 2",
            SectionType::Bullet3 => "Bullet 3",
            SectionType::Bullet4 => "Bullet 4",
            SectionType::Bullet5 => "Bullet 5",
            SectionType::Description => "Description",
            SectionType::SearchTerms => "Search Terms",
            SectionType::BackendAttributes => "Backend Attributes",
        }
    }

    /// Character budget per slot. Search terms are a byte budget on the
    /// Amazon side; counted the same way here.
    pub fn char_limit(&self, marketplace: Marketplace) -> usize {
        match self {
            SectionType::Title => match marketplace {
                Marketplace::AmazonDe => 150,
                _ => 200,
            },
            SectionType::Bullet1
            | SectionType::Bullet2
            | SectionType::Bullet3
            | SectionType::Bullet4
            | SectionType::Bullet5 => 255,
            SectionType::Description => 2000,
            SectionType::SearchTerms => 250,
            SectionType::BackendAttributes => 500,
        }
    }
}

/// Linear generation phases. No branching, no skipping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Pending,
    Title,
    Bullets,
    Description,
    Backend,
    Complete,
}

impl Phase {
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Pending => Some(Phase::Title),
            Phase::Title => Some(Phase::Bullets),
            Phase::Bullets => Some(Phase::Description),
            Phase::Description => Some(Phase::Backend),
            Phase::Backend => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// Sections whose text is produced while this phase is active.
    pub fn sections(&self) -> &'static [SectionType] {
        match self {
            Phase::Pending | Phase::Complete => &[],
            Phase::Title => &[SectionType::Title],
            Phase::Bullets => &[
                SectionType::Bullet1,
                SectionType::Bullet2,
                SectionType::Bullet3,
                SectionType::Bullet4,
                SectionType::Bullet5,
            ],
            Phase::Description => &[SectionType::Description, SectionType::SearchTerms],
            Phase::Backend => &[SectionType::BackendAttributes],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Title => "title",
            Phase::Bullets => "bullets",
            Phase::Description => "description",
            Phase::Backend => "backend",
            Phase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub section_type: SectionType,
    pub variations: Vec<String>,
    pub selected_variation: usize,
    /// User-editable text; starts empty and must be filled (usually by
    /// selecting a variation) before the owning phase can be confirmed.
    pub final_text: String,
    pub approved: bool,
}

impl Section {
    pub fn draft(section_type: SectionType, variations: Vec<String>) -> Self {
        Self {
            section_type,
            variations,
            selected_variation: 0,
            final_text: String::new(),
            approved: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordScore {
    pub keyword: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    High,
    Medium,
    Low,
}

impl PriorityTier {
    pub fn from_relevance(relevance: f64) -> Self {
        if relevance >= 0.6 {
            PriorityTier::High
        } else if relevance >= 0.4 {
            PriorityTier::Medium
        } else {
            PriorityTier::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacedKeyword {
    pub keyword: String,
    pub relevance: f64,
    pub placed_in: SectionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemainingKeyword {
    pub keyword: String,
    pub relevance: f64,
    pub tier: PriorityTier,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeywordCoverage {
    pub placed: Vec<PlacedKeyword>,
    pub remaining: Vec<RemainingKeyword>,
    /// placed/total as an integer percentage.
    pub coverage_score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub asin: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
}

/// A listing under generation. Persisted after every phase transition and
/// after every section edit; never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingJob {
    pub id: Uuid,
    pub phase: Phase,
    pub marketplace: Marketplace,
    pub product: ProductDetails,
    pub keywords: Vec<KeywordScore>,
    pub sections: Vec<Section>,
    pub coverage: KeywordCoverage,
    pub usage: UsageCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ListingJob {
    pub fn new(
        product: ProductDetails,
        keywords: Vec<KeywordScore>,
        marketplace: Marketplace,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Pending,
            marketplace,
            product,
            keywords,
            sections: Vec::new(),
            coverage: KeywordCoverage::default(),
            usage: UsageCounters::default(),
            generation_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn section(&self, section_type: SectionType) -> Option<&Section> {
        self.sections
            .iter()
            .find(|section| section.section_type == section_type)
    }

    pub fn section_mut(&mut self, section_type: SectionType) -> Option<&mut Section> {
        self.sections
            .iter_mut()
            .find(|section| section.section_type == section_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub key: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
    pub fetched: usize,
    pub failed: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Reviews,
    MarketIntel,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Reviews => "reviews",
            JobKind::MarketIntel => "market_intel",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Collecting,
    AwaitingSelection,
    Analyzing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub step: String,
    pub current: u32,
    pub total: u32,
    pub message: String,
}

/// A long-running external task observed via polling. The worker is the
/// sole status writer; the one exception is the ASIN selection write that
/// moves an intel job out of `awaiting_selection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub marketplace: Marketplace,
    #[serde(default)]
    pub asins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundJob {
    pub fn new(kind: JobKind, marketplace: Marketplace) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            marketplace,
            asins: Vec::new(),
            keyword: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One scraped customer review, normalized from whichever provider
/// supplied it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub asin: String,
    pub title: String,
    pub body: String,
    pub rating: f32,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_sequence_is_linear() {
        let mut phase = Phase::Pending;
        let mut labels = vec![phase.label()];
        while let Some(next) = phase.next() {
            phase = next;
            labels.push(phase.label());
        }
        assert_eq!(
            labels,
            vec!["pending", "title", "bullets", "description", "backend", "complete"]
        );
        assert!(Phase::Complete.next().is_none());
    }

    #[test]
    fn bullets_phase_owns_five_sections() {
        assert_eq!(Phase::Bullets.sections().len(), 5);
        assert_eq!(Phase::Description.sections().len(), 2);
        assert!(Phase::Pending.sections().is_empty());
    }

    #[test]
    fn tier_thresholds() {
        assert_eq!(PriorityTier::from_relevance(0.6), PriorityTier::High);
        assert_eq!(PriorityTier::from_relevance(0.59), PriorityTier::Medium);
        assert_eq!(PriorityTier::from_relevance(0.4), PriorityTier::Medium);
        assert_eq!(PriorityTier::from_relevance(0.39), PriorityTier::Low);
    }

    #[test]
    fn marketplace_parsing() {
        assert_eq!(
            Marketplace::from_str("amazon_uk"),
            Some(Marketplace::AmazonUk)
        );
        assert_eq!(Marketplace::from_str("DE"), Some(Marketplace::AmazonDe));
        assert_eq!(Marketplace::from_str("mars"), None);
    }
}
