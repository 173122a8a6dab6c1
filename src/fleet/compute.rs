//! Cloud compute collaborator and its Compute Engine implementation.
//!
//! The dispatcher only needs a handful of calls, captured by
//! [`ComputeClient`]. [`GceClient`] implements them against the Compute
//! Engine v1 REST API with a caller-supplied OAuth access token.
//!
//! Mutating calls return an [`Operation`]; [`ComputeClient::wait_operation`]
//! blocks until the operation is `DONE`, which is what tells the dispatcher
//! the instance actually exists.

use crate::error::FleetError;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";

/// Rounds of the server-side operation wait (each returns after ~2 minutes).
const OPERATION_WAIT_ROUNDS: usize = 15;

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type: String,
    pub source_image: String,
    pub network: String,
    /// Instance metadata items, e.g. `startup-script`, `start-date`.
    pub metadata: Vec<(String, String)>,
}

/// A long-running Compute Engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Terminated,
    Other(String),
}

impl From<&str> for InstanceStatus {
    fn from(s: &str) -> Self {
        match s {
            "PROVISIONING" => InstanceStatus::Provisioning,
            "STAGING" => InstanceStatus::Staging,
            "RUNNING" => InstanceStatus::Running,
            "STOPPING" => InstanceStatus::Stopping,
            "TERMINATED" => InstanceStatus::Terminated,
            other => InstanceStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    pub status: InstanceStatus,
    pub external_ip: Option<String>,
    pub metadata: HashMap<String, String>,
}

pub trait ComputeClient {
    /// Make sure the network (and an SSH firewall rule) exists; "already
    /// exists" counts as success.
    async fn ensure_network(&self, network: &str) -> Result<(), FleetError>;

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Operation, FleetError>;

    /// Block until `operation` is done; an operation error is returned as
    /// [`FleetError::Operation`].
    async fn wait_operation(&self, operation: &Operation) -> Result<(), FleetError>;

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo, FleetError>;

    /// Serial console output, where startup-script logs appear.
    async fn serial_output(&self, name: &str) -> Result<String, FleetError>;

    async fn delete_instance(&self, name: &str) -> Result<Operation, FleetError>;
}

#[derive(Debug, Clone)]
pub struct GceClient {
    client: Client,
    project_url: String,
    zone: String,
    access_token: String,
}

impl GceClient {
    pub fn new(project: &str, zone: &str, access_token: &str) -> Result<Self, FleetError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()?;
        Ok(Self {
            client,
            project_url: format!("{COMPUTE_API}/projects/{project}"),
            zone: zone.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn zone_url(&self, path: &str) -> String {
        format!("{}/zones/{}/{}", self.project_url, self.zone, path)
    }

    fn instance_body(&self, spec: &InstanceSpec) -> Value {
        let items: Vec<Value> = spec
            .metadata
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        json!({
            "name": spec.name,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, spec.machine_type),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": { "sourceImage": spec.source_image }
            }],
            "networkInterfaces": [{
                "network": format!("global/networks/{}", spec.network),
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }]
            }],
            "metadata": { "items": items }
        })
    }

    async fn post_operation(&self, url: &str, body: &Value) -> Result<Operation, FleetError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Ok(check(resp).await?.json::<Operation>().await?)
    }

    /// Insert a global resource, treating 409 Conflict as already present.
    async fn insert_global(&self, kind: &str, body: Value) -> Result<(), FleetError> {
        let url = format!("{}/global/{}", self.project_url, kind);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            info!(kind, name = %body["name"], "Resource already exists");
            return Ok(());
        }
        let operation = check(resp).await?.json::<Operation>().await?;
        self.wait_operation(&operation).await
    }
}

impl ComputeClient for GceClient {
    #[instrument(level = "info", skip(self))]
    async fn ensure_network(&self, network: &str) -> Result<(), FleetError> {
        self.insert_global(
            "networks",
            json!({ "name": network, "autoCreateSubnetworks": true }),
        )
        .await?;
        self.insert_global(
            "firewalls",
            json!({
                "name": format!("{network}-allow-ssh"),
                "network": format!("global/networks/{network}"),
                "allowed": [{ "IPProtocol": "tcp", "ports": ["22"] }],
                "sourceRanges": ["0.0.0.0/0"]
            }),
        )
        .await
    }

    #[instrument(level = "info", skip_all, fields(instance = %spec.name))]
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Operation, FleetError> {
        let operation = self
            .post_operation(&self.zone_url("instances"), &self.instance_body(spec))
            .await?;
        info!(operation = %operation.name, "Instance insert requested");
        Ok(operation)
    }

    #[instrument(level = "debug", skip_all, fields(operation = %operation.name))]
    async fn wait_operation(&self, operation: &Operation) -> Result<(), FleetError> {
        let mut current = operation.clone();
        for round in 0..OPERATION_WAIT_ROUNDS {
            if current.is_done() {
                return match current.error {
                    Some(error) => Err(FleetError::Operation {
                        operation: current.name,
                        message: error.to_string(),
                    }),
                    None => Ok(()),
                };
            }
            debug!(round, status = %current.status, "Waiting on operation");
            current = self
                .post_operation(&format!("{}/wait", current.self_link), &json!({}))
                .await?;
        }
        Err(FleetError::Operation {
            operation: current.name,
            message: format!("still {} after {OPERATION_WAIT_ROUNDS} wait rounds", current.status),
        })
    }

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo, FleetError> {
        let resp = self
            .client
            .get(self.zone_url(&format!("instances/{name}")))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body = check(resp).await?.json::<Value>().await?;
        Ok(parse_instance(&body))
    }

    async fn serial_output(&self, name: &str) -> Result<String, FleetError> {
        let resp = self
            .client
            .get(self.zone_url(&format!("instances/{name}/serialPort")))
            .query(&[("port", "1")])
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body = check(resp).await?.json::<Value>().await?;
        Ok(body["contents"].as_str().unwrap_or_default().to_string())
    }

    #[instrument(level = "info", skip(self))]
    async fn delete_instance(&self, name: &str) -> Result<Operation, FleetError> {
        let resp = self
            .client
            .delete(self.zone_url(&format!("instances/{name}")))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(check(resp).await?.json::<Operation>().await?)
    }
}

async fn check(resp: Response) -> Result<Response, FleetError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "Compute API call failed");
    Err(FleetError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Pull status, external address and metadata out of an instance resource.
fn parse_instance(body: &Value) -> InstanceInfo {
    let external_ip = body["networkInterfaces"][0]["accessConfigs"][0]["natIP"]
        .as_str()
        .map(str::to_string);
    let metadata = body["metadata"]["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some((
                        item["key"].as_str()?.to_string(),
                        item["value"].as_str().unwrap_or_default().to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    InstanceInfo {
        name: body["name"].as_str().unwrap_or_default().to_string(),
        status: InstanceStatus::from(body["status"].as_str().unwrap_or_default()),
        external_ip,
        metadata,
    }
}
