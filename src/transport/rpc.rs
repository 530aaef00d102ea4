//! Deadline and failure handling over a transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{CallConfig, Command, Transport, TransportError, TransportResult};
use crate::config::DomainMetadata;
use crate::error::BridgeResult;

/// Client for the signing authority
///
/// Applies each call's deadline and, when a call fails locally, sends the
/// authority a best-effort `handleTimeout` or `handleError` notice so it
/// can dismiss any prompt still open. The notice is fire-and-forget: the
/// caller sees the original failure right away.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    metadata: DomainMetadata,
    started: Arc<AtomicBool>,
}

impl RpcClient {
    /// Wrap a transport for a site
    pub fn new(transport: Arc<dyn Transport>, metadata: DomainMetadata) -> Self {
        RpcClient {
            transport,
            metadata,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Site metadata sent with approval requests
    pub fn metadata(&self) -> &DomainMetadata {
        &self.metadata
    }

    /// Start the transport once
    pub async fn start(&self) -> BridgeResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.transport.start().await?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Call with the default config (no deadline)
    pub async fn call(&self, command: Command) -> BridgeResult<Value> {
        self.call_with(command, CallConfig::default()).await
    }

    /// Call with an explicit config
    pub async fn call_with(&self, command: Command, config: CallConfig) -> BridgeResult<Value> {
        self.start().await?;

        let handler = command.method();
        debug!(handler, timeout_ms = config.timeout_ms, "dispatching to authority");

        let result = self.dispatch(&command, &config).await;
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(handler, error = %err, "authority call failed");
                self.notify_failure(&command, &err);
                Err(err.into())
            }
        }
    }

    async fn dispatch(&self, command: &Command, config: &CallConfig) -> TransportResult<Value> {
        let call = self.transport.call(command, config);
        if config.timeout_ms == 0 {
            return call.await;
        }

        match tokio::time::timeout(Duration::from_millis(config.timeout_ms), call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                handler: command.method(),
                after_ms: config.timeout_ms,
            }),
        }
    }

    fn notify_failure(&self, command: &Command, err: &TransportError) {
        // The authority reported these itself, or they are notices already
        if matches!(err, TransportError::Remote { .. })
            || matches!(
                command,
                Command::HandleTimeout { .. } | Command::HandleError { .. }
            )
        {
            return;
        }

        let metadata = self.metadata.clone();
        let message = err.to_string();
        let notice = match err {
            TransportError::Timeout { .. } => Command::HandleTimeout { metadata, message },
            _ => Command::HandleError { metadata, message },
        };

        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.call(&notice, &CallConfig::default()).await {
                debug!(handler = notice.method(), error = %e, "failure notice not delivered");
            }
        });
    }
}
