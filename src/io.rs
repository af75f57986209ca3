//! I/O broker interface and the local filesystem broker.
//!
//! Copy and touch commands are fire-and-forget sends to a broker; each
//! command receives exactly one acknowledgement on the reply channel the
//! sender supplied. The broker serializes access to the storage backend.

use std::path::Path;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IoCommandKind {
    Copy { source: String, destination: String },
    Touch { path: String },
}

/// One I/O command. The id makes each dispatched command distinct so
/// in-flight sets can track acknowledgements command-by-command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IoCommand {
    pub id: Uuid,
    pub kind: IoCommandKind,
}

impl IoCommand {
    pub fn copy(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: IoCommandKind::Copy {
                source: source.into(),
                destination: destination.into(),
            },
        }
    }

    pub fn touch(path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: IoCommandKind::Touch { path: path.into() },
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            IoCommandKind::Copy {
                source,
                destination,
            } => format!("copy {source} -> {destination}"),
            IoCommandKind::Touch { path } => format!("touch {path}"),
        }
    }
}

/// Acknowledgement for one command.
#[derive(Debug, Clone)]
pub enum IoAck {
    Success(IoCommand),
    /// Generic failure.
    Failure { command: IoCommand, message: String },
    /// Read was denied by the storage backend; carries the forbidden path.
    ReadForbidden { command: IoCommand, path: String },
}

impl IoAck {
    pub fn command(&self) -> &IoCommand {
        match self {
            IoAck::Success(command) => command,
            IoAck::Failure { command, .. } => command,
            IoAck::ReadForbidden { command, .. } => command,
        }
    }
}

#[derive(Debug)]
pub struct IoRequest {
    pub command: IoCommand,
    pub reply: mpsc::Sender<IoAck>,
}

#[derive(Debug, Error)]
pub enum IoClientError {
    #[error("I/O broker is gone")]
    BrokerGone,
}

/// Clonable handle for submitting commands to a broker.
#[derive(Debug, Clone)]
pub struct IoClient {
    tx: mpsc::Sender<IoRequest>,
}

impl IoClient {
    pub fn new(tx: mpsc::Sender<IoRequest>) -> Self {
        Self { tx }
    }

    /// Submit a command; its single acknowledgement arrives on `reply`.
    pub async fn send(
        &self,
        command: IoCommand,
        reply: mpsc::Sender<IoAck>,
    ) -> Result<(), IoClientError> {
        self.tx
            .send(IoRequest { command, reply })
            .await
            .map_err(|_| IoClientError::BrokerGone)
    }
}

/// Broker that executes commands against the local filesystem. Integration
/// tests and single-host deployments use it directly; cloud deployments
/// substitute their own broker behind the same [`IoClient`] handle.
pub struct LocalIoBroker {
    client: IoClient,
    handle: JoinHandle<()>,
}

impl LocalIoBroker {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_broker(rx));
        Self {
            client: IoClient::new(tx),
            handle,
        }
    }

    pub fn client(&self) -> IoClient {
        self.client.clone()
    }

    /// Drop the submission side and wait for queued commands to drain.
    pub async fn shutdown(self) {
        let LocalIoBroker { client, handle } = self;
        drop(client);
        let _ = handle.await;
    }
}

async fn run_broker(mut rx: mpsc::Receiver<IoRequest>) {
    while let Some(request) = rx.recv().await {
        let ack = execute(&request.command).await;
        debug!(command = %request.command.describe(), ok = matches!(ack, IoAck::Success(_)), "io command executed");
        if request.reply.send(ack).await.is_err() {
            warn!(command = %request.command.describe(), "io reply receiver dropped");
        }
    }
}

async fn execute(command: &IoCommand) -> IoAck {
    match &command.kind {
        IoCommandKind::Copy {
            source,
            destination,
        } => {
            if let Some(parent) = Path::new(destination).parent()
                && let Err(err) = tokio::fs::create_dir_all(parent).await
            {
                return IoAck::Failure {
                    command: command.clone(),
                    message: format!("creating {}: {err}", parent.display()),
                };
            }
            match tokio::fs::copy(source, destination).await {
                Ok(_) => IoAck::Success(command.clone()),
                Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                    IoAck::ReadForbidden {
                        command: command.clone(),
                        path: source.clone(),
                    }
                }
                Err(err) => IoAck::Failure {
                    command: command.clone(),
                    message: err.to_string(),
                },
            }
        }
        IoCommandKind::Touch { path } => {
            let result = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await;
            match result {
                Ok(_) => IoAck::Success(command.clone()),
                Err(err) => IoAck::Failure {
                    command: command.clone(),
                    message: err.to_string(),
                },
            }
        }
    }
}
