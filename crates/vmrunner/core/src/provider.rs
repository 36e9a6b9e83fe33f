//! VM lifecycle client.
//!
//! [`VmProvider`] is the capability the workflow needs from a cloud provider:
//! create, list and delete. [`LinodeProvider`] implements it against the
//! Linode v4 REST API.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{ProvisionError, ProvisionResult};
use crate::types::{InstanceId, InstanceSpec, Secret, VmInstance};

/// Cloud provider operations used by the workflow.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Create and boot a new instance.
    async fn create_instance(&self, spec: &InstanceSpec) -> ProvisionResult<VmInstance>;

    /// All instances visible to the account credential.
    async fn list_instances(&self) -> ProvisionResult<Vec<VmInstance>>;

    /// Delete an instance. Deleting an instance that no longer exists succeeds.
    async fn delete_instance(&self, id: &InstanceId) -> ProvisionResult<()>;
}

/// Pick the single instance a destroy search phrase refers to.
///
/// An instance matches when its label contains (or equals) the phrase, or
/// when the phrase is one of its tags. Anything other than exactly one match
/// is an error; the caller must disambiguate.
pub fn select_by_phrase(instances: Vec<VmInstance>, phrase: &str) -> ProvisionResult<VmInstance> {
    let mut matches: Vec<VmInstance> = instances
        .into_iter()
        .filter(|vm| vm.label.contains(phrase) || vm.tags.contains(phrase))
        .collect();

    match matches.len() {
        0 => Err(ProvisionError::NotFound {
            phrase: phrase.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(ProvisionError::AmbiguousMatch {
            phrase: phrase.to_string(),
            candidates: matches
                .iter()
                .map(|vm| format!("{} ({})", vm.id, vm.label))
                .collect(),
        }),
    }
}

/// Build a provider label for a new runner VM.
///
/// Linode labels allow `[A-Za-z0-9_-]`, must start and end with a letter or
/// digit, may not repeat `-` or `_`, and are 3-64 characters long. A random
/// suffix keeps labels unique per account.
pub fn instance_label(runner_label: &str) -> String {
    let mut base = String::with_capacity(runner_label.len());
    for c in runner_label.chars() {
        if c.is_ascii_alphanumeric() {
            base.push(c);
        } else if !base.is_empty() && !base.ends_with(['-', '_']) {
            base.push(if c == '_' { '_' } else { '-' });
        }
    }
    base.truncate(55);
    let base = base.trim_end_matches(['-', '_']);
    let base = if base.is_empty() { "runner" } else { base };

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

/// Linode v4 API client.
pub struct LinodeProvider {
    client: Client,
    base_url: String,
    token: Secret,
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    region: &'a str,
    #[serde(rename = "type")]
    machine_type: &'a str,
    image: &'a str,
    root_pass: &'a str,
    label: &'a str,
    tags: Vec<&'a str>,
    booted: bool,
}

#[derive(Debug, Deserialize)]
struct LinodeInstance {
    id: u64,
    label: String,
    #[serde(default)]
    ipv4: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl From<LinodeInstance> for VmInstance {
    fn from(linode: LinodeInstance) -> Self {
        Self {
            id: InstanceId::new(linode.id.to_string()),
            address: linode.ipv4.into_iter().next(),
            label: linode.label,
            tags: linode.tags.into_iter().collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    page: u32,
    pages: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    reason: String,
    field: Option<String>,
}

const PAGE_SIZE: u32 = 100;

impl LinodeProvider {
    /// Create a client for the API at `endpoint`, authenticated by `token`.
    pub fn new(endpoint: &str, token: Secret, timeout: Duration) -> ProvisionResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> ProvisionResult<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::provider_error(response).await)
        }
    }

    async fn provider_error(response: Response) -> ProvisionError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) if !body.errors.is_empty() => body
                .errors
                .iter()
                .map(|e| match &e.field {
                    Some(field) => format!("{}: {}", field, e.reason),
                    None => e.reason.clone(),
                })
                .collect::<Vec<_>>()
                .join("; "),
            _ => text,
        };
        ProvisionError::Provider { status, message }
    }
}

#[async_trait]
impl VmProvider for LinodeProvider {
    #[instrument(skip(self, spec), fields(label = %spec.label, region = %spec.sizing.region))]
    async fn create_instance(&self, spec: &InstanceSpec) -> ProvisionResult<VmInstance> {
        let body = CreateInstanceRequest {
            region: &spec.sizing.region,
            machine_type: &spec.sizing.machine_type,
            image: &spec.sizing.image,
            root_pass: spec.root_password.expose(),
            label: &spec.label,
            tags: spec.tags.iter().map(String::as_str).collect(),
            booted: true,
        };

        let response = self
            .client
            .post(format!("{}/linode/instances", self.base_url))
            .bearer_auth(self.token.expose())
            .json(&body)
            .send()
            .await?;
        let instance: VmInstance = Self::handle_response::<LinodeInstance>(response)
            .await?
            .into();

        info!(
            instance_id = %instance.id,
            address = instance.address.as_deref().unwrap_or("-"),
            "Instance created"
        );
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn list_instances(&self) -> ProvisionResult<Vec<VmInstance>> {
        let mut instances = Vec::new();
        let mut page = 1;

        loop {
            let response = self
                .client
                .get(format!("{}/linode/instances", self.base_url))
                .query(&[("page", page), ("page_size", PAGE_SIZE)])
                .bearer_auth(self.token.expose())
                .send()
                .await?;
            let body: Page<LinodeInstance> = Self::handle_response(response).await?;
            debug!(page = body.page, pages = body.pages, count = body.data.len(), "Fetched instance page");

            instances.extend(body.data.into_iter().map(VmInstance::from));
            if body.page >= body.pages {
                break;
            }
            page = body.page + 1;
        }

        Ok(instances)
    }

    #[instrument(skip(self))]
    async fn delete_instance(&self, id: &InstanceId) -> ProvisionResult<()> {
        let response = self
            .client
            .delete(format!("{}/linode/instances/{}", self.base_url, id))
            .bearer_auth(self.token.expose())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(instance_id = %id, "Instance deleted");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                info!(instance_id = %id, "Instance already gone");
                Ok(())
            }
            _ => Err(Self::provider_error(response).await),
        }
    }
}
