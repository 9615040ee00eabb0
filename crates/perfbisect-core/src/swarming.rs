//! Swarming-backed [`FleetClient`] over pRPC JSON.
//!
//! All calls are `POST {server}/prpc/swarming.v2.Tasks/{Method}` with JSON
//! bodies. Responses carry the `)]}'` XSSI guard, and int64 fields arrive
//! as JSON strings.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::config::BisectConfig;
use crate::domain::{BisectError, Result};
use crate::fleet::{CasReference, FleetClient, TaskRequest, TaskState};

const XSSI_PREFIX: &str = ")]}'";
const TASKS_SERVICE: &str = "swarming.v2.Tasks";
const IO_TIMEOUT_SECS: u64 = 1200;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewTaskRequest<'a> {
    name: &'a str,
    priority: i32,
    tags: &'a [String],
    task_slices: Vec<TaskSlice<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSlice<'a> {
    expiration_secs: u64,
    properties: TaskProperties<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskProperties<'a> {
    cas_input_root: WireCasReference,
    command: &'a [String],
    dimensions: Vec<StringPair<'a>>,
    execution_timeout_secs: u64,
    io_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct StringPair<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCasReference {
    cas_instance: String,
    digest: WireDigest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDigest {
    hash: String,
    #[serde(default, deserialize_with = "int64_string")]
    size_bytes: i64,
}

impl From<&CasReference> for WireCasReference {
    fn from(cas: &CasReference) -> Self {
        Self {
            cas_instance: cas.cas_instance.clone(),
            digest: WireDigest {
                hash: cas.digest.hash.clone(),
                size_bytes: cas.digest.size_bytes,
            },
        }
    }
}

impl From<WireCasReference> for CasReference {
    fn from(wire: WireCasReference) -> Self {
        CasReference::new(wire.cas_instance, wire.digest.hash, wire.digest.size_bytes)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRequestMetadata {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    task_result: Option<TaskResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResult {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    cas_output_root: Option<WireCasReference>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdRequest<'a> {
    task_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest<'a> {
    task_id: &'a str,
    kill_running: bool,
}

/// proto3 JSON encodes int64 as a string; accept either form.
fn int64_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Num(i64),
        Str(String),
    }
    match Int64::deserialize(deserializer)? {
        Int64::Num(n) => Ok(n),
        Int64::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn new_task_body(request: &TaskRequest) -> NewTaskRequest<'_> {
    NewTaskRequest {
        name: &request.name,
        priority: request.priority,
        tags: &request.tags,
        task_slices: vec![TaskSlice {
            expiration_secs: request.expiration_secs,
            properties: TaskProperties {
                cas_input_root: (&request.cas_input).into(),
                command: &request.command,
                dimensions: request
                    .dimensions
                    .iter()
                    .map(|(key, value)| StringPair { key, value })
                    .collect(),
                execution_timeout_secs: request.execution_timeout_secs,
                io_timeout_secs: IO_TIMEOUT_SECS,
            },
        }],
    }
}

fn parse_response<T: DeserializeOwned>(body: &str) -> serde_json::Result<T> {
    serde_json::from_str(body.trim_start().trim_start_matches(XSSI_PREFIX))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SwarmingClient {
    server: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl SwarmingClient {
    pub fn new(config: &BisectConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("perfbisect/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BisectError::Fleet {
                operation: "connect".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            server: config.swarming_url.trim_end_matches('/').to_string(),
            client,
            auth_token: config.auth_token.clone(),
        })
    }

    async fn call<B: Serialize, R: DeserializeOwned>(&self, method: &str, body: &B) -> Result<R> {
        let err = |reason: String| BisectError::Fleet {
            operation: method.to_string(),
            reason,
        };
        let url = format!("{}/prpc/{TASKS_SERVICE}/{method}", self.server);
        let mut req = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| err(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| err(e.to_string()))?;
        if !status.is_success() {
            return Err(err(format!("{status}: {}", text.trim())));
        }
        parse_response(&text).map_err(|e| err(format!("bad response: {e}")))
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult> {
        self.call("GetResult", &TaskIdRequest { task_id }).await
    }
}

#[async_trait]
impl FleetClient for SwarmingClient {
    async fn trigger_task(&self, request: &TaskRequest) -> Result<String> {
        let meta: TaskRequestMetadata = self.call("NewTask", &new_task_body(request)).await?;
        let state = meta
            .task_result
            .and_then(|r| r.state)
            .map(|s| s.parse::<TaskState>().unwrap_or(TaskState::Unknown(s)));
        if state.as_ref().is_some_and(TaskState::is_no_resource) {
            return Err(BisectError::NoResource {
                reason: format!("no bot matches {:?}", request.dimensions),
            });
        }
        if meta.task_id.is_empty() {
            return Err(BisectError::Fleet {
                operation: "NewTask".to_string(),
                reason: "response carried no task id".to_string(),
            });
        }
        debug!(task_id = %meta.task_id, name = %request.name, "task created");
        Ok(meta.task_id)
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskState> {
        let result = self.get_result(task_id).await?;
        Ok(match result.state {
            Some(s) => s.parse().unwrap_or(TaskState::Unknown(s)),
            None => TaskState::Pending,
        })
    }

    async fn get_cas_output(&self, task_id: &str) -> Result<CasReference> {
        let result = self.get_result(task_id).await?;
        result
            .cas_output_root
            .map(CasReference::from)
            .ok_or_else(|| BisectError::Fleet {
                operation: "GetResult".to_string(),
                reason: format!("task {task_id} has no CAS output"),
            })
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "CancelTask",
                &CancelRequest {
                    task_id,
                    kill_running: true,
                },
            )
            .await?;
        Ok(())
    }
}
