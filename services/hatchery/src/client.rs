//! Job server API client.
//!
//! JSON over HTTP with bearer token authentication. Every request carries
//! the configured timeout; nothing is retried here, the calling loop
//! retries on its next tick.

use async_trait::async_trait;
use hatchery_sdk::{
    HatcheryId, HatcheryIdentity, Job, JobId, JobServer, JobServerError, ModelId, ModelType,
    RegisteredWorker, SpawnInfo, WorkerId, WorkerModel,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::Config;

/// Job server reached over HTTP.
pub struct HttpJobServer {
    client: reqwest::Client,
    base_url: String,
    token: String,
    model_type: ModelType,
}

#[derive(Debug, Serialize)]
struct SpawnErrorRequest<'a> {
    error: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    identity: HatcheryIdentity,
    #[serde(default = "up_to_date_default")]
    up_to_date: bool,
}

fn up_to_date_default() -> bool {
    true
}

impl HttpJobServer {
    pub fn new(config: &Config) -> Result<Self, JobServerError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JobServerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            model_type: config.model_type,
        })
    }

    /// Jobs waiting for a worker, oldest first.
    pub async fn list_pending_jobs(&self) -> Result<Vec<Job>, JobServerError> {
        let url = format!("{}/queue/jobs?status=waiting", self.base_url);
        let response = self.send(self.client.get(&url)).await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, JobServerError> {
        let request = if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        };

        let response = request
            .send()
            .await
            .map_err(|e| JobServerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(JobServerError::Conflict(body)),
            StatusCode::NOT_FOUND => Err(JobServerError::NotFound(url)),
            _ => {
                error!(status = %status, url = %url, body = %body, "Job server request failed");
                Err(JobServerError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, JobServerError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| JobServerError::Transport(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl JobServer for HttpJobServer {
    async fn list_registered_workers(&self) -> Result<Vec<RegisteredWorker>, JobServerError> {
        let response = self.send(self.client.get(self.url("/worker"))).await?;
        decode(response).await
    }

    async fn list_worker_models(&self) -> Result<Vec<WorkerModel>, JobServerError> {
        let url = self.url(&format!("/worker/model?type={}", self.model_type));
        let response = self.send(self.client.get(url)).await?;
        decode(response).await
    }

    async fn book_job(&self, job_id: JobId) -> Result<(), JobServerError> {
        debug!(job_id = %job_id, "Booking job");
        let url = self.url(&format!("/queue/jobs/{job_id}/book"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn book_model_for_registration(&self, model_id: ModelId) -> Result<(), JobServerError> {
        let url = self.url(&format!("/worker/model/{model_id}/book"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn send_spawn_info(
        &self,
        job_id: JobId,
        infos: &[SpawnInfo],
    ) -> Result<(), JobServerError> {
        let url = self.url(&format!("/queue/jobs/{job_id}/spawn/infos"));
        self.send(self.client.post(url).json(infos)).await?;
        Ok(())
    }

    async fn report_model_spawn_error(
        &self,
        model_id: ModelId,
        message: &str,
    ) -> Result<(), JobServerError> {
        let url = self.url(&format!("/worker/model/{model_id}/spawn/error"));
        self.send(self.client.put(url).json(&SpawnErrorRequest { error: message }))
            .await?;
        Ok(())
    }

    async fn disable_worker(&self, worker_id: WorkerId) -> Result<(), JobServerError> {
        let url = self.url(&format!("/worker/{worker_id}/disable"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn register_hatchery(
        &self,
        identity: &HatcheryIdentity,
    ) -> Result<(HatcheryIdentity, bool), JobServerError> {
        let response = self
            .send(self.client.post(self.url("/hatchery/register")).json(identity))
            .await?;
        let registered: RegisterResponse = decode(response).await?;
        Ok((registered.identity, registered.up_to_date))
    }

    async fn refresh_hatchery(&self, id: HatcheryId) -> Result<(), JobServerError> {
        let url = self.url(&format!("/hatchery/{id}/heartbeat"));
        self.send(self.client.post(url)).await?;
        Ok(())
    }
}
