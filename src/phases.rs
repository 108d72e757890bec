use crate::coverage::compute_coverage;
use crate::llm::{LlmClient, LlmError, LlmMessage};
use crate::models::{
    KeywordScore, ListingJob, Marketplace, Phase, ProductDetails, Section, SectionEditRequest,
    SectionType,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const VARIATIONS_PER_SECTION: usize = 3;

const SYSTEM_PROMPT: &str = r#"
You are an Amazon listing copywriter. Given product details, a scored keyword list, and the
text confirmed so far, write the requested listing sections. Respect the character limit given
for each section and work high-relevance keywords in naturally. Respond with a JSON object of
the form {"sections":[{"section_type":"...","variations":["...","..."]}]} and nothing else.
"#;

#[derive(Debug, Error)]
#[error("phase `{phase}` failed: {message}")]
pub struct PhaseError {
    phase: &'static str,
    message: String,
    kind: PhaseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseErrorKind {
    InvalidInput,
    Provider,
    Timeout,
}

impl PhaseError {
    pub fn invalid_input(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            kind: PhaseErrorKind::InvalidInput,
        }
    }

    pub fn provider(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            kind: PhaseErrorKind::Provider,
        }
    }

    pub fn timeout(phase: &'static str) -> Self {
        Self {
            phase,
            message: "generation timed out".into(),
            kind: PhaseErrorKind::Timeout,
        }
    }

    pub fn phase(&self) -> &'static str {
        self.phase
    }

    pub fn kind(&self) -> PhaseErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation timed out")]
    TimedOut,
    #[error("{0}")]
    Provider(String),
}

#[derive(Debug, Clone)]
pub struct GeneratedSection {
    pub section_type: SectionType,
    pub variations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub sections: Vec<GeneratedSection>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Everything a generator needs to draft one phase: the phase being
/// generated, the product, the running keyword list, and the text
/// confirmed in earlier phases.
pub struct PhaseContext<'a> {
    pub phase: Phase,
    pub product: &'a ProductDetails,
    pub keywords: &'a [KeywordScore],
    pub marketplace: Marketplace,
    pub confirmed: Vec<(SectionType, String)>,
}

/// Seam between the state machine and the AI provider. The production
/// implementation drives the multi-provider LLM client; tests substitute
/// deterministic stubs.
pub trait PhaseGenerator: Send + Sync {
    fn generate(
        &self,
        ctx: &PhaseContext<'_>,
    ) -> impl Future<Output = Result<GenerationResult, GenerateError>> + Send;
}

/// Confirms the current phase and generates the next one.
///
/// The guard requires every section of the current phase to carry
/// non-empty `final_text`; a violation names the offending section and
/// mutates nothing. A generator failure records `generation_error` and
/// leaves the phase untouched so a retry re-issues the identical call.
pub async fn advance<G: PhaseGenerator>(
    job: &mut ListingJob,
    generator: &G,
) -> Result<Phase, PhaseError> {
    let current = job.phase;
    let Some(next) = current.next() else {
        return Err(PhaseError::invalid_input(
            current.label(),
            "listing is already complete",
        ));
    };

    for section_type in current.sections() {
        let filled = job
            .section(*section_type)
            .map(|section| !section.final_text.trim().is_empty())
            .unwrap_or(false);
        if !filled {
            return Err(PhaseError::invalid_input(
                current.label(),
                format!("{} is missing final text", section_type.display_name()),
            ));
        }
    }

    if next == Phase::Complete {
        approve_phase(job, current);
        job.phase = Phase::Complete;
        job.generation_error = None;
        job.coverage = compute_coverage(&job.keywords, &coverage_texts(job));
        job.updated_at = Utc::now();
        info!(target = "listforge.phases", job_id = %job.id, "listing complete");
        return Ok(Phase::Complete);
    }

    let ctx = PhaseContext {
        phase: next,
        product: &job.product,
        keywords: &job.keywords,
        marketplace: job.marketplace,
        confirmed: confirmed_texts(job),
    };

    let generated = match generator.generate(&ctx).await {
        Ok(generated) => generated,
        Err(err) => {
            let phase_error = match err {
                GenerateError::TimedOut => PhaseError::timeout(next.label()),
                GenerateError::Provider(message) => PhaseError::provider(next.label(), message),
            };
            warn!(
                target = "listforge.phases",
                job_id = %job.id,
                phase = next.label(),
                error = %phase_error,
                "generation_failed"
            );
            job.generation_error = Some(phase_error.detail().to_string());
            job.updated_at = Utc::now();
            return Err(phase_error);
        }
    };

    approve_phase(job, current);
    install_drafts(job, next, &generated)?;
    job.phase = next;
    job.generation_error = None;
    job.usage.calls += 1;
    job.usage.input_tokens += generated.input_tokens;
    job.usage.output_tokens += generated.output_tokens;
    job.usage.last_model = Some(generated.model);
    job.coverage = compute_coverage(&job.keywords, &coverage_texts(job));
    job.updated_at = Utc::now();
    info!(
        target = "listforge.phases",
        job_id = %job.id,
        phase = next.label(),
        coverage = job.coverage.coverage_score,
        "phase advanced"
    );
    Ok(next)
}

/// Re-issues the failed generation for the current transition. Valid only
/// while a generation error is recorded.
pub async fn retry<G: PhaseGenerator>(
    job: &mut ListingJob,
    generator: &G,
) -> Result<Phase, PhaseError> {
    if job.generation_error.is_none() {
        return Err(PhaseError::invalid_input(
            job.phase.label(),
            "nothing to retry",
        ));
    }
    advance(job, generator).await
}

/// Full reset back to `pending`. The only way out of `complete`.
pub fn reset(job: &mut ListingJob) {
    job.phase = Phase::Pending;
    job.sections.clear();
    job.coverage = Default::default();
    job.usage = Default::default();
    job.generation_error = None;
    job.updated_at = Utc::now();
}

/// Applies a user edit to an unapproved section and recomputes coverage.
pub fn edit_section(job: &mut ListingJob, edit: &SectionEditRequest) -> Result<(), PhaseError> {
    let phase = job.phase.label();
    let Some(section) = job.section_mut(edit.section_type) else {
        return Err(PhaseError::invalid_input(
            phase,
            format!("{} has not been generated yet", edit.section_type.display_name()),
        ));
    };
    if section.approved {
        return Err(PhaseError::invalid_input(
            phase,
            format!("{} is already approved", edit.section_type.display_name()),
        ));
    }
    if let Some(index) = edit.selected_variation {
        let Some(text) = section.variations.get(index) else {
            return Err(PhaseError::invalid_input(phase, "variation index out of range"));
        };
        section.selected_variation = index;
        section.final_text = text.clone();
    }
    if let Some(text) = &edit.final_text {
        section.final_text = text.clone();
    }
    job.coverage = compute_coverage(&job.keywords, &coverage_texts(job));
    job.updated_at = Utc::now();
    Ok(())
}

fn approve_phase(job: &mut ListingJob, phase: Phase) {
    for section_type in phase.sections() {
        if let Some(section) = job.section_mut(*section_type) {
            section.approved = true;
        }
    }
}

fn install_drafts(
    job: &mut ListingJob,
    phase: Phase,
    generated: &GenerationResult,
) -> Result<(), PhaseError> {
    let mut drafts = Vec::new();
    for section_type in phase.sections() {
        let limit = section_type.char_limit(job.marketplace);
        let draft = generated
            .sections
            .iter()
            .find(|section| section.section_type == *section_type)
            .ok_or_else(|| {
                PhaseError::provider(
                    phase.label(),
                    format!("provider omitted {}", section_type.display_name()),
                )
            })?;
        let variations: Vec<String> = draft
            .variations
            .iter()
            .filter(|text| !text.trim().is_empty())
            .take(VARIATIONS_PER_SECTION)
            .map(|text| clamp_chars(text.trim(), limit))
            .collect();
        if variations.is_empty() {
            return Err(PhaseError::provider(
                phase.label(),
                format!("provider returned no text for {}", section_type.display_name()),
            ));
        }
        drafts.push(Section::draft(*section_type, variations));
    }
    // Replace any stale drafts from a previous reset cycle.
    job.sections
        .retain(|section| !phase.sections().contains(&section.section_type));
    job.sections.extend(drafts);
    Ok(())
}

fn clamp_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

fn confirmed_texts(job: &ListingJob) -> Vec<(SectionType, String)> {
    job.sections
        .iter()
        .filter(|section| !section.final_text.trim().is_empty())
        .map(|section| (section.section_type, section.final_text.clone()))
        .collect()
}

/// Confirmed text plus the drafted (not yet confirmed) text of every
/// section, keyed by slot. Drafts fall back to the selected variation
/// until the user edits the final text.
fn coverage_texts(job: &ListingJob) -> HashMap<SectionType, String> {
    job.sections
        .iter()
        .filter_map(|section| {
            let text = if !section.final_text.trim().is_empty() {
                section.final_text.clone()
            } else {
                section
                    .variations
                    .get(section.selected_variation)
                    .cloned()
                    .unwrap_or_default()
            };
            if text.is_empty() {
                None
            } else {
                Some((section.section_type, text))
            }
        })
        .collect()
}

// ---- production generator over the LLM client ----

pub struct LlmPhaseGenerator {
    llm: Arc<LlmClient>,
}

impl LlmPhaseGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

impl PhaseGenerator for LlmPhaseGenerator {
    async fn generate(&self, ctx: &PhaseContext<'_>) -> Result<GenerationResult, GenerateError> {
        let messages = build_messages(ctx);
        let response = self.llm.chat(&messages).await.map_err(|err| match err {
            LlmError::TimedOut => GenerateError::TimedOut,
            other => GenerateError::Provider(other.to_string()),
        })?;
        let sections = parse_generated(&response.text, ctx.phase)
            .map_err(GenerateError::Provider)?;
        Ok(GenerationResult {
            sections,
            model: response.model,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        })
    }
}

pub fn build_messages(ctx: &PhaseContext<'_>) -> Vec<LlmMessage> {
    let limits: Vec<_> = ctx
        .phase
        .sections()
        .iter()
        .map(|section| {
            json!({
                "section_type": section,
                "display_name": section.display_name(),
                "char_limit": section.char_limit(ctx.marketplace),
            })
        })
        .collect();
    let confirmed: Vec<_> = ctx
        .confirmed
        .iter()
        .map(|(section, text)| json!({ "section_type": section, "text": text }))
        .collect();
    let payload = json!({
        "phase": ctx.phase.label(),
        "marketplace": ctx.marketplace,
        "product": ctx.product,
        "keywords": ctx.keywords,
        "sections_to_write": limits,
        "confirmed_sections": confirmed,
        "variations_per_section": VARIATIONS_PER_SECTION,
    });
    vec![
        LlmMessage {
            role: "system".into(),
            content: SYSTEM_PROMPT.trim().to_string(),
        },
        LlmMessage {
            role: "user".into(),
            content: payload.to_string(),
        },
    ]
}

#[derive(Deserialize)]
struct GeneratedPayload {
    sections: Vec<GeneratedSectionPayload>,
}

#[derive(Deserialize)]
struct GeneratedSectionPayload {
    section_type: SectionType,
    variations: Vec<String>,
}

fn parse_generated(text: &str, phase: Phase) -> Result<Vec<GeneratedSection>, String> {
    let cleaned = strip_markdown_fence(text);
    let payload: GeneratedPayload = serde_json::from_str(&cleaned)
        .map_err(|err| format!("unparseable {} payload: {err}", phase.label()))?;
    Ok(payload
        .sections
        .into_iter()
        .map(|section| GeneratedSection {
            section_type: section.section_type,
            variations: section.variations,
        })
        .collect())
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeywordScore, ProductDetails};

    struct StubGenerator;

    impl PhaseGenerator for StubGenerator {
        async fn generate(
            &self,
            ctx: &PhaseContext<'_>,
        ) -> Result<GenerationResult, GenerateError> {
            let sections = ctx
                .phase
                .sections()
                .iter()
                .map(|section_type| GeneratedSection {
                    section_type: *section_type,
                    variations: vec![
                        format!("{} variation one yoga mat", section_type.display_name()),
                        format!("{} variation two", section_type.display_name()),
                    ],
                })
                .collect();
            Ok(GenerationResult {
                sections,
                model: "stub-model".into(),
                input_tokens: 10,
                output_tokens: 20,
            })
        }
    }

    struct FailingGenerator;

    impl PhaseGenerator for FailingGenerator {
        async fn generate(
            &self,
            _ctx: &PhaseContext<'_>,
        ) -> Result<GenerationResult, GenerateError> {
            Err(GenerateError::Provider("provider unavailable".into()))
        }
    }

    struct TimedOutGenerator;

    impl PhaseGenerator for TimedOutGenerator {
        async fn generate(
            &self,
            _ctx: &PhaseContext<'_>,
        ) -> Result<GenerationResult, GenerateError> {
            Err(GenerateError::TimedOut)
        }
    }

    fn sample_job() -> ListingJob {
        ListingJob::new(
            ProductDetails {
                name: "Yoga Mat".into(),
                brand: Some("Acme".into()),
                category: Some("Sports".into()),
                features: vec!["6mm thick".into()],
                asin: None,
            },
            vec![
                KeywordScore {
                    keyword: "yoga mat".into(),
                    relevance: 0.9,
                },
                KeywordScore {
                    keyword: "non slip".into(),
                    relevance: 0.5,
                },
            ],
            Marketplace::AmazonUs,
        )
    }

    fn fill_current_phase(job: &mut ListingJob) {
        for section_type in job.phase.sections().to_vec() {
            let edit = SectionEditRequest {
                section_type,
                selected_variation: Some(0),
                final_text: None,
            };
            edit_section(job, &edit).expect("fill section");
        }
    }

    #[tokio::test]
    async fn first_advance_generates_title_drafts() {
        let mut job = sample_job();
        let phase = advance(&mut job, &StubGenerator).await.expect("advance");
        assert_eq!(phase, Phase::Title);
        let title = job.section(SectionType::Title).expect("title drafted");
        assert_eq!(title.variations.len(), 2);
        assert!(!title.approved);
        assert!(title.final_text.is_empty());
        assert_eq!(job.usage.calls, 1);
        assert_eq!(job.usage.last_model.as_deref(), Some("stub-model"));
        // drafted variations count toward coverage
        assert_eq!(job.coverage.coverage_score, 50);
    }

    #[tokio::test]
    async fn guard_rejects_empty_final_text_and_names_the_section() {
        let mut job = sample_job();
        advance(&mut job, &StubGenerator).await.unwrap();
        fill_current_phase(&mut job);
        advance(&mut job, &StubGenerator).await.unwrap();
        assert_eq!(job.phase, Phase::Bullets);

        // Fill all bullets except bullet 3.
        for section_type in [
            SectionType::Bullet1,
            SectionType::Bullet2,
            SectionType::Bullet4,
            SectionType::Bullet5,
        ] {
            edit_section(
                &mut job,
                &SectionEditRequest {
                    section_type,
                    selected_variation: Some(0),
                    final_text: None,
                },
            )
            .unwrap();
        }

        let before = job.sections.clone();
        let err = advance(&mut job, &StubGenerator)
            .await
            .expect_err("guard must trip");
        assert_eq!(err.kind(), PhaseErrorKind::InvalidInput);
        assert!(err.detail().contains("Bullet 3"));
        assert_eq!(job.phase, Phase::Bullets);
        assert_eq!(
            serde_json::to_value(&job.sections).unwrap(),
            serde_json::to_value(&before).unwrap()
        );
    }

    #[tokio::test]
    async fn provider_failure_leaves_phase_and_sets_error() {
        let mut job = sample_job();
        advance(&mut job, &StubGenerator).await.unwrap();
        fill_current_phase(&mut job);

        let err = advance(&mut job, &FailingGenerator)
            .await
            .expect_err("provider down");
        assert_eq!(err.kind(), PhaseErrorKind::Provider);
        assert_eq!(job.phase, Phase::Title);
        assert_eq!(job.generation_error.as_deref(), Some("provider unavailable"));
        let title = job.section(SectionType::Title).unwrap();
        assert!(!title.approved, "no partial phase state committed");

        // Retry re-issues the identical call; a healthy provider succeeds.
        let phase = retry(&mut job, &StubGenerator).await.expect("retry");
        assert_eq!(phase, Phase::Bullets);
        assert!(job.generation_error.is_none());
        assert!(job.section(SectionType::Title).unwrap().approved);
    }

    #[tokio::test]
    async fn timeout_is_reported_distinctly() {
        let mut job = sample_job();
        advance(&mut job, &StubGenerator).await.unwrap();
        fill_current_phase(&mut job);
        let err = advance(&mut job, &TimedOutGenerator)
            .await
            .expect_err("timed out");
        assert_eq!(err.kind(), PhaseErrorKind::Timeout);
        assert_eq!(job.generation_error.as_deref(), Some("generation timed out"));
    }

    #[tokio::test]
    async fn retry_without_error_is_rejected() {
        let mut job = sample_job();
        let err = retry(&mut job, &StubGenerator)
            .await
            .expect_err("nothing to retry");
        assert_eq!(err.kind(), PhaseErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn full_walk_reaches_complete_and_is_not_reenterable() {
        let mut job = sample_job();
        while job.phase != Phase::Complete {
            advance(&mut job, &StubGenerator).await.expect("advance");
            fill_current_phase(&mut job);
        }
        assert_eq!(job.phase, Phase::Complete);
        assert!(job.sections.iter().all(|section| section.approved));

        let err = advance(&mut job, &StubGenerator)
            .await
            .expect_err("complete is terminal");
        assert_eq!(err.kind(), PhaseErrorKind::InvalidInput);

        reset(&mut job);
        assert_eq!(job.phase, Phase::Pending);
        assert!(job.sections.is_empty());
        assert_eq!(job.usage.calls, 0);
    }

    #[tokio::test]
    async fn editing_approved_sections_is_rejected() {
        let mut job = sample_job();
        advance(&mut job, &StubGenerator).await.unwrap();
        fill_current_phase(&mut job);
        advance(&mut job, &StubGenerator).await.unwrap();

        let err = edit_section(
            &mut job,
            &SectionEditRequest {
                section_type: SectionType::Title,
                selected_variation: None,
                final_text: Some("rewrite".into()),
            },
        )
        .expect_err("title approved in prior phase");
        assert!(err.detail().contains("already approved"));
    }

    #[tokio::test]
    async fn manual_edit_recomputes_coverage() {
        let mut job = sample_job();
        advance(&mut job, &StubGenerator).await.unwrap();
        edit_section(
            &mut job,
            &SectionEditRequest {
                section_type: SectionType::Title,
                selected_variation: None,
                final_text: Some("Acme non slip yoga mat".into()),
            },
        )
        .unwrap();
        assert_eq!(job.coverage.coverage_score, 100);
    }

    #[test]
    fn parse_generated_handles_fenced_json() {
        let fenced = "```json\n{\"sections\":[{\"section_type\":\"title\",\"variations\":[\"A yoga mat\"]}]}\n```";
        let sections = parse_generated(fenced, Phase::Title).expect("parse");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_type, SectionType::Title);
    }

    #[test]
    fn clamp_respects_char_limit() {
        let long = "x".repeat(300);
        assert_eq!(clamp_chars(&long, 200).chars().count(), 200);
        assert_eq!(clamp_chars("short", 200), "short");
    }
}
