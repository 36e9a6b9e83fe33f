//! Runner registry client.
//!
//! [`RunnerRegistry`] covers the slice of the CI service API the workflow
//! needs: minting registration tokens, looking up a runner by name or label
//! and removing it. [`GitHubRegistry`] implements it for GitHub Actions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::types::{RegistrationCredential, RepoRef, RunnerRegistration, RunnerSelector, Secret};

const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;

/// Result of a runner removal. Removal never fails the workflow, so the
/// outcome is a value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerRemoval {
    /// The service confirmed removal.
    Removed,
    /// The service rejected the request as unprocessable; usually the
    /// runner was already removed.
    AlreadyGone,
    /// Any other answer.
    Failed { status: u16, message: String },
}

/// CI service operations used by the workflow.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Mint a single-use registration token scoped to `repo`.
    async fn mint_registration_token(&self, repo: &RepoRef)
        -> ProvisionResult<RegistrationCredential>;

    /// First runner of `repo` matching `selector`.
    async fn find_runner(
        &self,
        repo: &RepoRef,
        selector: &RunnerSelector,
    ) -> ProvisionResult<Option<RunnerRegistration>>;

    /// Remove a runner registration. Only transport failures are errors.
    async fn delete_runner(&self, repo: &RepoRef, runner_id: u64)
        -> ProvisionResult<RunnerRemoval>;
}

/// GitHub Actions REST client.
pub struct GitHubRegistry {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RunnerList {
    total_count: u64,
    runners: Vec<GitHubRunner>,
}

#[derive(Debug, Deserialize)]
struct GitHubRunner {
    id: u64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

impl From<GitHubRunner> for RunnerRegistration {
    fn from(runner: GitHubRunner) -> Self {
        Self {
            id: runner.id,
            name: runner.name,
            status: runner.status,
            labels: runner.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

impl GitHubRegistry {
    /// Create a client for the API at `endpoint`, authenticated by `token`.
    pub fn new(endpoint: &str, token: Secret, timeout: Duration) -> ProvisionResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(API_VERSION),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|_| ProvisionError::Configuration("github_token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vmrunner/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn runners_url(&self, repo: &RepoRef) -> String {
        format!(
            "{}/repos/{}/{}/actions/runners",
            self.base_url, repo.owner, repo.name
        )
    }

    async fn registry_error(response: reqwest::Response) -> ProvisionError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        ProvisionError::Registry { status, message }
    }
}

#[async_trait]
impl RunnerRegistry for GitHubRegistry {
    #[instrument(skip(self, repo), fields(repo = %repo))]
    async fn mint_registration_token(
        &self,
        repo: &RepoRef,
    ) -> ProvisionResult<RegistrationCredential> {
        let response = self
            .client
            .post(format!("{}/registration-token", self.runners_url(repo)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::registry_error(response).await);
        }

        let body: TokenResponse = response.json().await?;
        info!(expires_at = ?body.expires_at, "Registration token minted");
        Ok(RegistrationCredential {
            token: Secret::new(body.token),
            expires_at: body.expires_at,
        })
    }

    #[instrument(skip(self, repo, selector), fields(repo = %repo, selector = %selector))]
    async fn find_runner(
        &self,
        repo: &RepoRef,
        selector: &RunnerSelector,
    ) -> ProvisionResult<Option<RunnerRegistration>> {
        let mut page = 1;
        let mut seen = 0u64;

        loop {
            let response = self
                .client
                .get(self.runners_url(repo))
                .query(&[("per_page", PER_PAGE), ("page", page)])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(Self::registry_error(response).await);
            }

            let body: RunnerList = response.json().await?;
            debug!(page, total = body.total_count, count = body.runners.len(), "Fetched runner page");
            if body.runners.is_empty() {
                return Ok(None);
            }
            seen += body.runners.len() as u64;

            if let Some(runner) = body
                .runners
                .into_iter()
                .map(RunnerRegistration::from)
                .find(|r| selector.matches(r))
            {
                return Ok(Some(runner));
            }
            if seen >= body.total_count {
                return Ok(None);
            }
            page += 1;
        }
    }

    #[instrument(skip(self, repo), fields(repo = %repo))]
    async fn delete_runner(&self, repo: &RepoRef, runner_id: u64) -> ProvisionResult<RunnerRemoval> {
        let response = self
            .client
            .delete(format!("{}/{}", self.runners_url(repo), runner_id))
            .send()
            .await?;

        let outcome = match response.status() {
            StatusCode::NO_CONTENT => {
                info!(runner_id, "Runner removed");
                RunnerRemoval::Removed
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                warn!(runner_id, "Runner removal rejected (422); it was probably already removed");
                RunnerRemoval::AlreadyGone
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                error!(runner_id, status = status.as_u16(), %message, "Runner removal failed");
                RunnerRemoval::Failed {
                    status: status.as_u16(),
                    message,
                }
            }
        };
        Ok(outcome)
    }
}
