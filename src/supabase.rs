use crate::http::build_client;
use crate::models::{BackgroundJob, ListingJob};
use reqwest::Client;
use thiserror::Error;
use tracing::warn;

/// Best-effort remote mirror of listing and job records. The in-process
/// stores remain the read path; a write that fails here is logged and
/// otherwise ignored.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    pub async fn upsert_listing(&self, job: &ListingJob) {
        if let Err(err) = self.upsert("listing_jobs", job).await {
            warn!(target = "listforge.supabase", job_id = %job.id, error = %err, "listing mirror write failed");
        }
    }

    pub async fn upsert_background_job(&self, job: &BackgroundJob) {
        if let Err(err) = self.upsert("background_jobs", job).await {
            warn!(target = "listforge.supabase", job_id = %job.id, error = %err, "job mirror write failed");
        }
    }

    async fn upsert<T: serde::Serialize>(
        &self,
        table: &str,
        record: &T,
    ) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/{table}?on_conflict=id", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates")
            .json(record)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
