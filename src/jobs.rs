use crate::batch::{self, BatchError};
use crate::llm::{LlmClient, LlmMessage};
use crate::metrics;
use crate::models::{
    ApiError, BackgroundJob, IntelJobRequest, JobKind, JobProgress, JobStatus, Marketplace,
    ReviewsJobRequest, Review, MAX_BATCH_KEYS,
};
use crate::scraper::{self, ScraperClient};
use crate::store::JobStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<WorkOrder>,
    store: JobStore,
}

#[derive(Clone, Copy)]
enum WorkOrder {
    Reviews { id: Uuid, max_pages: u32 },
    IntelCollect(Uuid),
    IntelAnalyze(Uuid),
}

impl JobQueue {
    pub fn spawn(
        store: JobStore,
        scraper: ScraperClient,
        llm: Arc<LlmClient>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WorkOrder>(queue_capacity_from_env());
        let worker_store = store.clone();

        let handle = tokio::spawn(async move {
            let worker = Worker {
                store: worker_store,
                scraper,
                llm,
            };
            while let Some(order) = rx.recv().await {
                match order {
                    WorkOrder::Reviews { id, max_pages } => {
                        worker.run_reviews(id, max_pages).await
                    }
                    WorkOrder::IntelCollect(id) => worker.run_intel_collect(id).await,
                    WorkOrder::IntelAnalyze(id) => worker.run_intel_analyze(id).await,
                }
            }
        });

        (Self { tx, store }, handle)
    }

    pub async fn enqueue_reviews(&self, request: ReviewsJobRequest) -> Result<Uuid, ApiError> {
        if request.asins.is_empty() {
            return Err(invalid("no_asins", "Provide at least one ASIN"));
        }
        if request.asins.len() > MAX_BATCH_KEYS {
            return Err(invalid(
                "too_many_asins",
                format!("At most {MAX_BATCH_KEYS} ASINs per job"),
            ));
        }
        let max_pages = request.max_pages.unwrap_or(1).clamp(1, 10);
        let mut job = BackgroundJob::new(JobKind::Reviews, request.marketplace);
        job.asins = request.asins;
        let id = job.id;
        self.store.insert(job).await;
        self.send(WorkOrder::Reviews { id, max_pages }).await?;
        Ok(id)
    }

    pub async fn enqueue_intel(&self, request: IntelJobRequest) -> Result<Uuid, ApiError> {
        if request.keyword.trim().is_empty() {
            return Err(invalid("missing_keyword", "Provide a seed keyword"));
        }
        let mut job = BackgroundJob::new(JobKind::MarketIntel, request.marketplace);
        job.keyword = Some(request.keyword.trim().to_string());
        let id = job.id;
        self.store.insert(job).await;
        self.send(WorkOrder::IntelCollect(id)).await?;
        Ok(id)
    }

    /// The single follow-up write allowed on an intel job: moves it out of
    /// `awaiting_selection` with the user's chosen ASINs and hands it back
    /// to the worker.
    pub async fn submit_selection(&self, id: Uuid, asins: Vec<String>) -> Result<(), ApiError> {
        if asins.is_empty() {
            return Err(invalid("no_asins", "Select at least one ASIN"));
        }
        if asins.len() > MAX_BATCH_KEYS {
            return Err(invalid(
                "too_many_asins",
                format!("At most {MAX_BATCH_KEYS} ASINs per selection"),
            ));
        }
        let Some(job) = self.store.get(id).await else {
            return Err(invalid("not_found", "Unknown job id"));
        };
        if job.kind != JobKind::MarketIntel {
            return Err(invalid("wrong_kind", "Selection applies to intel jobs only"));
        }
        if job.status != JobStatus::AwaitingSelection {
            return Err(invalid(
                "wrong_status",
                "Job is not awaiting an ASIN selection",
            ));
        }
        self.store
            .with_job(id, |job| {
                job.asins = asins;
                job.status = JobStatus::Analyzing;
                job.progress = JobProgress {
                    step: "analysis".into(),
                    current: 0,
                    total: job.asins.len() as u32,
                    message: "Analyzing selected products".into(),
                };
            })
            .await
            .map_err(|err| invalid("not_found", err.to_string()))?;
        self.send(WorkOrder::IntelAnalyze(id)).await
    }

    async fn send(&self, order: WorkOrder) -> Result<(), ApiError> {
        self.tx.send(order).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })
    }
}

fn invalid(code: &str, detail: impl Into<String>) -> ApiError {
    ApiError {
        error: code.to_string(),
        detail: Some(detail.into()),
    }
}

struct Worker {
    store: JobStore,
    scraper: ScraperClient,
    llm: Arc<LlmClient>,
}

impl Worker {
    async fn run_reviews(&self, id: Uuid, max_pages: u32) {
        let Some(job) = self.store.get(id).await else {
            warn!(target = "listforge.jobs", job_id = %id, "reviews job vanished");
            return;
        };
        let asins = job.asins.clone();
        let marketplace = job.marketplace;
        let total = asins.len() as u32;
        self.set_progress(id, JobStatus::Collecting, "reviews", 0, total, "Fetching reviews")
            .await;

        let scraper = self.scraper.clone();
        let store = self.store.clone();
        let mut done = 0u32;
        let report = batch::fetch_batch(
            &asins,
            |asin| {
                let scraper = scraper.clone();
                async move {
                    scraper
                        .fetch_reviews(&asin, marketplace, max_pages)
                        .await
                        .and_then(|reviews| {
                            serde_json::to_value(reviews).map_err(|err| {
                                scraper::ScraperError::UnexpectedPayload(err.to_string())
                            })
                        })
                }
            },
            |_asin, _data| {
                done += 1;
                let store = store.clone();
                async move {
                    let _ = store
                        .with_job(id, |job| {
                            job.progress.current = done;
                            job.progress.message = format!("Fetched {done} of {total}");
                        })
                        .await;
                }
            },
        )
        .await;

        let report = match report {
            Ok(report) => report,
            Err(err @ (BatchError::Empty | BatchError::TooManyKeys(_))) => {
                self.fail(id, err.to_string()).await;
                return;
            }
        };

        if report.fetched == 0 {
            self.fail(
                id,
                format!("no reviews collected: {}", report.message),
            )
            .await;
            return;
        }

        let reviews: Vec<Review> = report
            .results
            .iter()
            .filter_map(|item| item.data.clone())
            .filter_map(|data| serde_json::from_value::<Vec<Review>>(data).ok())
            .flatten()
            .collect();

        self.set_progress(
            id,
            JobStatus::Analyzing,
            "analysis",
            0,
            1,
            "Summarizing reviews",
        )
        .await;
        let summary = self.summarize_reviews(&reviews).await;

        let result = json!({
            "reviews": reviews,
            "summary": summary,
            "batch": { "fetched": report.fetched, "failed": report.failed, "message": report.message },
        });
        self.complete(id, result).await;
    }

    async fn run_intel_collect(&self, id: Uuid) {
        let Some(job) = self.store.get(id).await else {
            warn!(target = "listforge.jobs", job_id = %id, "intel job vanished");
            return;
        };
        let Some(keyword) = job.keyword.clone() else {
            self.fail(id, "intel job has no keyword".to_string()).await;
            return;
        };
        self.set_progress(
            id,
            JobStatus::Collecting,
            "search",
            0,
            1,
            "Searching the marketplace",
        )
        .await;

        match self.scraper.search_products(&keyword, job.marketplace).await {
            Ok(candidates) if !candidates.is_empty() => {
                let _ = self
                    .store
                    .with_job(id, |job| {
                        job.status = JobStatus::AwaitingSelection;
                        job.progress = JobProgress {
                            step: "selection".into(),
                            current: 1,
                            total: 1,
                            message: format!("Found {} candidates", candidates.len()),
                        };
                        job.result = Some(json!({ "candidates": candidates }));
                    })
                    .await;
                info!(target = "listforge.jobs", job_id = %id, "intel awaiting selection");
            }
            Ok(_) => self.fail(id, format!("no products found for `{keyword}`")).await,
            Err(err) => self.fail(id, err.to_string()).await,
        }
    }

    async fn run_intel_analyze(&self, id: Uuid) {
        let Some(job) = self.store.get(id).await else {
            warn!(target = "listforge.jobs", job_id = %id, "intel job vanished");
            return;
        };
        let asins = job.asins.clone();
        let marketplace = job.marketplace;
        let total = asins.len() as u32;

        let scraper = self.scraper.clone();
        let store = self.store.clone();
        let mut done = 0u32;
        let report = batch::fetch_batch(
            &asins,
            |asin| {
                let scraper = scraper.clone();
                async move { scraper.lookup_product(&asin, marketplace).await }
            },
            |_asin, _data| {
                done += 1;
                let store = store.clone();
                async move {
                    let _ = store
                        .with_job(id, |job| {
                            job.progress.current = done;
                            job.progress.message = format!("Analyzed {done} of {total}");
                        })
                        .await;
                }
            },
        )
        .await;

        let report = match report {
            Ok(report) => report,
            Err(err) => {
                self.fail(id, err.to_string()).await;
                return;
            }
        };
        if report.fetched == 0 {
            self.fail(id, format!("no products analyzed: {}", report.message))
                .await;
            return;
        }

        let products: Vec<Value> = report
            .results
            .iter()
            .filter_map(|item| item.data.clone())
            .collect();
        let summary = self.summarize_products(&products).await;
        let candidates = job
            .result
            .as_ref()
            .and_then(|value| value.get("candidates").cloned())
            .unwrap_or(Value::Null);
        let result = json!({
            "candidates": candidates,
            "products": products,
            "summary": summary,
            "batch": { "fetched": report.fetched, "failed": report.failed, "message": report.message },
        });
        self.complete(id, result).await;
    }

    /// LLM summary with a heuristic fallback, so analysis still completes
    /// when no provider is configured.
    async fn summarize_reviews(&self, reviews: &[Review]) -> Value {
        let prompt = format!(
            "Summarize the recurring themes in these customer reviews as 3-5 short bullet lines:\n{}",
            reviews
                .iter()
                .take(40)
                .map(|review| format!("[{}] {}: {}", review.rating, review.title, review.body))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        match self
            .llm
            .chat(&[LlmMessage {
                role: "user".into(),
                content: prompt,
            }])
            .await
        {
            Ok(response) => json!({ "themes": response.text, "model": response.model }),
            Err(err) => {
                warn!(target = "listforge.jobs", error = %err, "review_summary_fallback");
                heuristic_review_summary(reviews)
            }
        }
    }

    async fn summarize_products(&self, products: &[Value]) -> Value {
        let prompt = format!(
            "Compare these competitor product payloads and call out pricing and positioning gaps:\n{}",
            serde_json::to_string(&products.iter().take(10).collect::<Vec<_>>())
                .unwrap_or_default(),
        );
        match self
            .llm
            .chat(&[LlmMessage {
                role: "user".into(),
                content: prompt,
            }])
            .await
        {
            Ok(response) => json!({ "analysis": response.text, "model": response.model }),
            Err(err) => {
                warn!(target = "listforge.jobs", error = %err, "product_summary_fallback");
                heuristic_product_summary(products)
            }
        }
    }

    async fn set_progress(
        &self,
        id: Uuid,
        status: JobStatus,
        step: &str,
        current: u32,
        total: u32,
        message: &str,
    ) {
        let _ = self
            .store
            .with_job(id, |job| {
                job.status = status;
                job.progress = JobProgress {
                    step: step.to_string(),
                    current,
                    total,
                    message: message.to_string(),
                };
            })
            .await;
    }

    async fn complete(&self, id: Uuid, result: Value) {
        let kind = self
            .store
            .with_job(id, |job| {
                job.status = JobStatus::Completed;
                job.progress.current = job.progress.total;
                job.progress.message = "Done".into();
                job.result = Some(result);
                job.kind
            })
            .await;
        if let Ok(kind) = kind {
            metrics::job_finished(kind.as_str(), "completed");
        }
        info!(target = "listforge.jobs", job_id = %id, "job completed");
    }

    async fn fail(&self, id: Uuid, message: String) {
        warn!(target = "listforge.jobs", job_id = %id, error = %message, "job failed");
        let kind = self
            .store
            .with_job(id, |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(message);
                job.kind
            })
            .await;
        if let Ok(kind) = kind {
            metrics::job_finished(kind.as_str(), "failed");
        }
    }
}

fn heuristic_review_summary(reviews: &[Review]) -> Value {
    let count = reviews.len();
    let average = if count == 0 {
        0.0
    } else {
        reviews.iter().map(|review| review.rating as f64).sum::<f64>() / count as f64
    };
    let positive = reviews.iter().filter(|review| review.rating >= 4.0).count();
    json!({
        "review_count": count,
        "average_rating": (average * 10.0).round() / 10.0,
        "positive_share": if count == 0 { 0.0 } else { (positive as f64 / count as f64 * 100.0).round() },
    })
}

fn heuristic_product_summary(products: &[Value]) -> Value {
    let prices: Vec<f64> = products
        .iter()
        .filter_map(|product| product.get("price").and_then(Value::as_f64))
        .collect();
    let average_price = if prices.is_empty() {
        0.0
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    };
    json!({
        "product_count": products.len(),
        "average_price": (average_price * 100.0).round() / 100.0,
    })
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(64)
}
