//! # Virtual Machine Driver
//!
//! Same lifecycle contract as the container drivers, backed by the
//! virtualization manager's REST API through a [`VmApiClient`]:
//!
//! | Operation | Request                                               |
//! |-----------|-------------------------------------------------------|
//! | create    | `POST   /nodes/{node}/qemu` `{vmid, name, memory, cores, tags}` |
//! | start     | `POST   /nodes/{node}/qemu/{vmid}/status/start`       |
//! | stop      | `POST   /nodes/{node}/qemu/{vmid}/status/shutdown`    |
//! | kill      | `POST   /nodes/{node}/qemu/{vmid}/status/stop`        |
//! | delete    | `DELETE /nodes/{node}/qemu/{vmid}`                    |
//! | query     | `GET    /nodes/{node}/qemu/{vmid}/status/current`     |
//! | update    | `PUT    /nodes/{node}/qemu/{vmid}/config`             |
//!
//! The HTTP client itself is a collaborator. [`PveshApiClient`] reaches the
//! API through the host's `pvesh` CLI; tests substitute scripted clients.
//!
//! VM ids use the same mapping as managed containers, so an id means the
//! same guest number on both backends.

use crate::bundle::OciBundle;
use crate::config::VmConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CommandExecutor, ExecPolicy};
use crate::request::ResourceLimits;
use crate::runtime::{ContainerDriver, ContainerStatus, KillOutcome, ObservedState, Signal};
use crate::runtimes::{bundle_cores, bundle_memory_mib, guest_id, poll_until_stopped};
use crate::selector::RuntimeKind;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// API Client Boundary
// =============================================================================

/// HTTP verb of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of an API call. Status `0` means no HTTP exchange took place.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn message(&self) -> String {
        self.body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.body.to_string())
    }
}

/// Client for the virtualization manager API.
#[async_trait]
pub trait VmApiClient: Send + Sync {
    /// Performs one call and returns `(status, json)`.
    ///
    /// Only failures to reach the API at all are `Err`; HTTP error statuses
    /// are returned as responses.
    async fn call(&self, verb: HttpVerb, path: &str, body: Option<&Value>) -> Result<ApiResponse>;
}

/// Maps an HTTP status to an error kind.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        0 => ErrorKind::NetworkError,
        400 => ErrorKind::InvalidInput,
        401 | 403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        409 => ErrorKind::AlreadyExists,
        500..=599 => ErrorKind::OperationFailed,
        _ => ErrorKind::Unknown,
    }
}

fn status_for_kind(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NetworkError => 0,
        ErrorKind::InvalidInput => 400,
        ErrorKind::PermissionDenied => 403,
        ErrorKind::NotFound => 404,
        ErrorKind::AlreadyExists => 409,
        ErrorKind::Timeout => 504,
        _ => 500,
    }
}

/// [`VmApiClient`] that goes through the host's `pvesh` CLI.
///
/// `pvesh` has no status codes; failures are classified by the executor's
/// error table and mapped back to the equivalent HTTP status.
#[derive(Debug, Clone)]
pub struct PveshApiClient {
    executor: CommandExecutor,
    cli: String,
    policy: ExecPolicy,
}

impl PveshApiClient {
    pub fn new(executor: CommandExecutor, cli: impl Into<String>, policy: ExecPolicy) -> Self {
        Self {
            executor,
            cli: cli.into(),
            policy,
        }
    }

    fn argv(&self, verb: HttpVerb, path: &str, body: Option<&Value>) -> Vec<String> {
        let command = match verb {
            HttpVerb::Get => "get",
            HttpVerb::Post => "create",
            HttpVerb::Put => "set",
            HttpVerb::Delete => "delete",
        };
        let mut argv = vec![
            self.cli.clone(),
            command.to_string(),
            path.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(Value::Object(params)) = body {
            for (key, value) in params {
                argv.push(format!("--{key}"));
                argv.push(match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        }
        argv
    }
}

#[async_trait]
impl VmApiClient for PveshApiClient {
    async fn call(&self, verb: HttpVerb, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        let argv = self.argv(verb, path, body);
        match self.executor.run(&argv, &self.policy).await {
            Ok(output) => {
                let trimmed = output.stdout.trim();
                let body = if trimmed.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
                };
                Ok(ApiResponse::ok(body))
            }
            Err(Error::BinaryNotFound { program }) => Err(Error::RuntimeUnavailable {
                runtime: RuntimeKind::VirtualMachine.to_string(),
                reason: format!("{program} not found"),
            }),
            Err(Error::Timeout { .. }) => Ok(ApiResponse::error(504, "request timed out")),
            Err(Error::CommandFailed { kind, stderr, .. }) => {
                Ok(ApiResponse::error(status_for_kind(kind), stderr))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for virtual machines.
pub struct VirtualMachineDriver {
    client: Arc<dyn VmApiClient>,
    config: VmConfig,
}

impl VirtualMachineDriver {
    pub fn new(client: Arc<dyn VmApiClient>, config: VmConfig) -> Self {
        Self { client, config }
    }

    fn vm_path(&self, vmid: u32, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.config.node, vmid, suffix)
    }

    /// Performs a call and turns error statuses into [`Error::Api`].
    async fn request(&self, verb: HttpVerb, path: &str, body: Option<Value>) -> Result<Value> {
        debug!("{} {}", verb, path);
        let response = self.client.call(verb, path, body.as_ref()).await?;
        if response.is_success() {
            return Ok(response.body);
        }
        Err(Error::Api {
            verb: verb.to_string(),
            path: path.to_string(),
            status: response.status,
            kind: kind_for_status(response.status),
            message: response.message(),
        })
    }

    async fn signal(&self, id: &str, signal: Signal, timeout: Duration) -> Result<KillOutcome> {
        let vmid = guest_id(id);
        if self.query(id).await?.status == ContainerStatus::Stopped {
            debug!(id, vmid, "VM already stopped");
            return Ok(KillOutcome::already_stopped());
        }

        let (suffix, body) = match signal {
            Signal::Term => (
                "/status/shutdown",
                Some(json!({ "timeout": timeout.as_secs().max(1) })),
            ),
            Signal::Kill => ("/status/stop", None),
            other => {
                return Err(Error::NotSupported(format!(
                    "{other} cannot be delivered to a virtual machine"
                )));
            }
        };
        self.request(HttpVerb::Post, &self.vm_path(vmid, suffix), body)
            .await?;

        let attempts = self.config.stop_poll_attempts;
        if poll_until_stopped(self, id, attempts, self.config.poll_interval()).await? {
            info!(id, vmid, "Stopped VM");
            return Ok(KillOutcome {
                signal_attempts: 1,
                status: ContainerStatus::Stopped,
            });
        }

        let waited = self.config.poll_interval() * attempts;
        warn!(id, vmid, "VM still running after {:?}", waited);
        Err(Error::Timeout {
            operation: format!("{signal} to VM '{id}'"),
            duration: waited,
        })
    }
}

#[async_trait]
impl ContainerDriver for VirtualMachineDriver {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::VirtualMachine
    }

    fn is_available(&self) -> bool {
        true
    }

    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn create(&self, id: &str, bundle: &OciBundle) -> Result<()> {
        let vmid = guest_id(id);
        let mut body = json!({
            "vmid": vmid,
            "name": id,
            "tags": "unirun",
        });
        if let Some(mib) = bundle_memory_mib(bundle) {
            body["memory"] = json!(mib);
        }
        if let Some(cores) = bundle_cores(bundle) {
            body["cores"] = json!(cores);
        }

        let path = format!("/nodes/{}/qemu", self.config.node);
        self.request(HttpVerb::Post, &path, Some(body)).await?;
        info!(id, vmid, "Created VM");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let vmid = guest_id(id);
        self.request(HttpVerb::Post, &self.vm_path(vmid, "/status/start"), None)
            .await?;
        info!(id, vmid, "Started VM");
        Ok(())
    }

    async fn stop(&self, id: &str, signal: Signal, timeout: Duration) -> Result<KillOutcome> {
        self.signal(id, signal, timeout).await
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<KillOutcome> {
        self.signal(id, signal, crate::constants::DEFAULT_GRACE_PERIOD)
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let vmid = guest_id(id);
        self.request(
            HttpVerb::Delete,
            &self.vm_path(vmid, ""),
            Some(json!({ "purge": 1 })),
        )
        .await?;
        info!(id, vmid, "Deleted VM");
        Ok(())
    }

    async fn query(&self, id: &str) -> Result<ObservedState> {
        let vmid = guest_id(id);
        let body = self
            .request(HttpVerb::Get, &self.vm_path(vmid, "/status/current"), None)
            .await?;

        let status = match body.get("status").and_then(Value::as_str) {
            Some("running") | Some("paused") => ContainerStatus::Running,
            Some("stopped") => ContainerStatus::Stopped,
            other => {
                return Err(Error::Driver {
                    runtime: RuntimeKind::VirtualMachine.to_string(),
                    operation: "query".to_string(),
                    id: id.to_string(),
                    kind: ErrorKind::Unknown,
                    reason: format!("unexpected status {other:?}"),
                });
            }
        };
        let pid = match status {
            ContainerStatus::Running => body
                .get("pid")
                .and_then(Value::as_u64)
                .and_then(|p| u32::try_from(p).ok())
                .filter(|p| *p != 0)
                .unwrap_or(1),
            _ => 0,
        };
        Ok(ObservedState::new(status, pid))
    }

    async fn update(&self, id: &str, resources: &ResourceLimits) -> Result<()> {
        let vmid = guest_id(id);
        let mut body = serde_json::Map::new();
        if let Some(bytes) = resources.memory_bytes {
            body.insert("memory".to_string(), json!(bytes.div_ceil(1024 * 1024)));
        }
        if let Some(shares) = resources.cpu_shares {
            body.insert(
                "cores".to_string(),
                json!(crate::bundle::cores_for_shares(shares)),
            );
        }
        if body.is_empty() {
            return Err(Error::InvalidRequest("no resource changes given".to_string()));
        }
        self.request(HttpVerb::Put, &self.vm_path(vmid, "/config"), Some(Value::Object(body)))
            .await?;
        info!(id, vmid, "Updated VM resources");
        Ok(())
    }
}
