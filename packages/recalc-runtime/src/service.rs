//! Async front end: requests over a channel, cascades on blocking tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use recalc_core::OpMap;

use crate::bridge::{ApplyBridge, ApplyOutcome};
use crate::error::RuntimeError;
use crate::transport::ApplyEvent;
use crate::{ResponseSender, Result};

/// Request handled by the bridge service
#[derive(Debug)]
pub enum BridgeRequest {
    /// Apply one transport edit
    Apply {
        user_id: String,
        event: ApplyEvent,
        response: ResponseSender<ApplyOutcome>,
    },
    /// Recompute computed fields of a table
    CalculateFields {
        user_id: String,
        table_id: String,
        field_ids: Vec<String>,
        response: ResponseSender<OpMap>,
    },
    /// Recompute fields and all their dependents
    ResetFields {
        user_id: String,
        table_id: String,
        field_ids: Vec<String>,
        response: ResponseSender<OpMap>,
    },
    /// Recompute every computed field of some records
    CalculateByRecordIds {
        user_id: String,
        table_id: String,
        record_ids: Vec<String>,
        response: ResponseSender<OpMap>,
    },
}

impl BridgeRequest {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeRequest::Apply { .. } => "apply",
            BridgeRequest::CalculateFields { .. } => "calculate_fields",
            BridgeRequest::ResetFields { .. } => "reset_fields",
            BridgeRequest::CalculateByRecordIds { .. } => "calculate_fields_by_record_ids",
        }
    }
}

/// Runs a closure, turning a panic into `TaskPanicked`.
fn run_guarded<T>(kind: &str, f: impl FnOnce() -> recalc_core::Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(RuntimeError::from),
        Err(panic) => {
            let panic_msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!(request = kind, "cascade panicked: {}", panic_msg);
            Err(RuntimeError::TaskPanicked(panic_msg))
        }
    }
}

/// Service loop dispatching requests onto blocking tasks.
///
/// Requests run concurrently; edits touching the same records serialize
/// through the bridge's version checks.
pub struct BridgeService {
    bridge: Arc<ApplyBridge>,
    request_rx: mpsc::Receiver<BridgeRequest>,
}

impl BridgeService {
    /// Creates a service and the handle that feeds it.
    pub fn new(bridge: Arc<ApplyBridge>, capacity: usize) -> (Self, BridgeHandle) {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        (
            Self { bridge, request_rx },
            BridgeHandle { request_tx },
        )
    }

    /// Spawns the service loop on the current tokio runtime.
    pub fn spawn(bridge: Arc<ApplyBridge>, capacity: usize) -> (BridgeHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(bridge, capacity);
        (handle, tokio::spawn(service.run()))
    }

    /// Serves requests until every handle is dropped, then waits for the
    /// cascades still running.
    pub async fn run(mut self) {
        let mut in_flight = Vec::new();
        while let Some(request) = self.request_rx.recv().await {
            let bridge = Arc::clone(&self.bridge);
            in_flight.retain(|task: &JoinHandle<()>| !task.is_finished());
            in_flight.push(tokio::task::spawn_blocking(move || Self::dispatch(&bridge, request)));
        }
        for task in in_flight {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "bridge task failed");
            }
        }
        tracing::debug!("bridge service stopped");
    }

    fn dispatch(bridge: &ApplyBridge, request: BridgeRequest) {
        let kind = request.kind();
        tracing::debug!(request = kind, "dispatching bridge request");
        // A send fails only when the caller stopped waiting
        match request {
            BridgeRequest::Apply {
                user_id,
                event,
                response,
            } => {
                let _ = response.send(run_guarded(kind, || bridge.apply(&user_id, &event)));
            }
            BridgeRequest::CalculateFields {
                user_id,
                table_id,
                field_ids,
                response,
            } => {
                let _ = response.send(run_guarded(kind, || {
                    bridge.calculate_fields(&user_id, &table_id, &field_ids)
                }));
            }
            BridgeRequest::ResetFields {
                user_id,
                table_id,
                field_ids,
                response,
            } => {
                let _ = response.send(run_guarded(kind, || {
                    bridge.reset_fields(&user_id, &table_id, &field_ids)
                }));
            }
            BridgeRequest::CalculateByRecordIds {
                user_id,
                table_id,
                record_ids,
                response,
            } => {
                let _ = response.send(run_guarded(kind, || {
                    bridge.calculate_fields_by_record_ids(&user_id, &table_id, &record_ids)
                }));
            }
        }
    }
}

/// Cloneable client of a running [`BridgeService`].
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    request_tx: mpsc::Sender<BridgeRequest>,
}

impl BridgeHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(ResponseSender<T>) -> BridgeRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(build(response_tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        response_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Applies one transport edit.
    pub async fn apply(&self, user_id: &str, event: ApplyEvent) -> Result<ApplyOutcome> {
        let user_id = user_id.to_string();
        self.call(|response| BridgeRequest::Apply {
            user_id,
            event,
            response,
        })
        .await
    }

    pub async fn calculate_fields(
        &self,
        user_id: &str,
        table_id: &str,
        field_ids: Vec<String>,
    ) -> Result<OpMap> {
        let (user_id, table_id) = (user_id.to_string(), table_id.to_string());
        self.call(|response| BridgeRequest::CalculateFields {
            user_id,
            table_id,
            field_ids,
            response,
        })
        .await
    }

    pub async fn reset_fields(
        &self,
        user_id: &str,
        table_id: &str,
        field_ids: Vec<String>,
    ) -> Result<OpMap> {
        let (user_id, table_id) = (user_id.to_string(), table_id.to_string());
        self.call(|response| BridgeRequest::ResetFields {
            user_id,
            table_id,
            field_ids,
            response,
        })
        .await
    }

    pub async fn calculate_fields_by_record_ids(
        &self,
        user_id: &str,
        table_id: &str,
        record_ids: Vec<String>,
    ) -> Result<OpMap> {
        let (user_id, table_id) = (user_id.to_string(), table_id.to_string());
        self.call(|response| BridgeRequest::CalculateByRecordIds {
            user_id,
            table_id,
            record_ids,
            response,
        })
        .await
    }
}
