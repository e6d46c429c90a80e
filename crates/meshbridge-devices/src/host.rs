//! Asynchronous device host.
//!
//! Drives [`DeviceSession`]s on tokio. One task owns every session and
//! processes commands from an mpsc channel in order, so messages for one
//! device never interleave. Outbound requests run on spawned tasks against
//! the [`Transport`]; their results return through the same channel as
//! completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshbridge_core::{AttributeValue, EngineConfig, Error, EventSink, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::learner::LearnedProfile;
use crate::power::PowerSummary;
use crate::session::{DeviceProfile, DeviceSession, InboundEvent, OutboundRequest, RequestId};
use crate::transport::{OperationOutput, Transport, TransportError, TransportResult};
use crate::zone::ZoneEnrollmentState;

/// Command channel capacity.
pub const CHANNEL_CAPACITY: usize = 256;

/// Default per-request transport timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Serializable state of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub profile: DeviceProfile,
    pub capabilities: serde_json::Value,
    pub zones: Vec<ZoneEnrollmentState>,
    pub power: PowerSummary,
}

enum HostCommand {
    Inbound {
        device_id: String,
        event: InboundEvent,
    },
    Completion {
        device_id: String,
        generation: u64,
        id: RequestId,
        result: TransportResult<OperationOutput>,
    },
    SetCapability {
        device_id: String,
        capability: String,
        value: AttributeValue,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    Learn {
        device_id: String,
        reply: oneshot::Sender<Option<LearnedProfile>>,
    },
    Snapshot {
        device_id: String,
        reply: oneshot::Sender<Option<DeviceSnapshot>>,
    },
    Remove {
        device_id: String,
    },
    Shutdown,
}

fn stopped() -> Error {
    Error::Other("device host stopped".to_string())
}

/// Cloneable handle for talking to a running host.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    /// Deliver an inbound message. A session is created on first traffic.
    pub async fn deliver(&self, device_id: impl Into<String>, event: InboundEvent) -> Result<()> {
        self.tx
            .send(HostCommand::Inbound {
                device_id: device_id.into(),
                event,
            })
            .await
            .map_err(|_| stopped())
    }

    /// Ask a device to change a capability; returns the request id.
    pub async fn set_capability(
        &self,
        device_id: impl Into<String>,
        capability: impl Into<String>,
        value: AttributeValue,
    ) -> Result<RequestId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::SetCapability {
                device_id: device_id.into(),
                capability: capability.into(),
                value,
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn learn(&self, device_id: impl Into<String>) -> Result<LearnedProfile> {
        let device_id = device_id.into();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Learn {
                device_id: device_id.clone(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await
            .map_err(|_| stopped())?
            .ok_or(Error::NotFound(device_id))
    }

    pub async fn snapshot(&self, device_id: impl Into<String>) -> Result<DeviceSnapshot> {
        let device_id = device_id.into();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Snapshot {
                device_id: device_id.clone(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await
            .map_err(|_| stopped())?
            .ok_or(Error::NotFound(device_id))
    }

    /// Drop a device's session. Completions still in flight are ignored.
    pub async fn remove(&self, device_id: impl Into<String>) -> Result<()> {
        self.tx
            .send(HostCommand::Remove {
                device_id: device_id.into(),
            })
            .await
            .map_err(|_| stopped())
    }
}

/// Running device host.
pub struct DeviceHost {
    handle: HostHandle,
    task: JoinHandle<()>,
}

impl DeviceHost {
    /// Start the host task.
    pub fn spawn(transport: Arc<dyn Transport>, config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::spawn_with_timeout(transport, config, sink, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn spawn_with_timeout(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
        request_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let runner = HostRunner {
            sessions: HashMap::new(),
            next_generation: 0,
            completions: tx.downgrade(),
            transport,
            config,
            sink,
            request_timeout,
        };
        let task = tokio::spawn(runner.run(rx));
        Self {
            handle: HostHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    /// Stop the host and wait for its task. Sessions are dropped.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(HostCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// A session plus the generation it was created in. Request ids restart
/// with every session, so completions carry the generation they were
/// issued under.
struct HostedSession {
    generation: u64,
    session: DeviceSession,
}

struct HostRunner {
    sessions: HashMap<String, HostedSession>,
    next_generation: u64,
    // Weak so the host stops once every handle is gone
    completions: mpsc::WeakSender<HostCommand>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    request_timeout: Duration,
}

impl HostRunner {
    async fn run(mut self, mut rx: mpsc::Receiver<HostCommand>) {
        info!(
            category = "host",
            transport = self.transport.name(),
            "Device host started"
        );

        while let Some(command) = rx.recv().await {
            match command {
                HostCommand::Inbound { device_id, event } => self.inbound(device_id, event),
                HostCommand::Completion {
                    device_id,
                    generation,
                    id,
                    result,
                } => self.completion(device_id, generation, id, result),
                HostCommand::SetCapability {
                    device_id,
                    capability,
                    value,
                    reply,
                } => {
                    let result = match self.sessions.get_mut(&device_id) {
                        Some(hosted) => hosted
                            .session
                            .set_capability(&capability, value)
                            .map(|request| (hosted.generation, request)),
                        None => Err(Error::NotFound(device_id.clone())),
                    };
                    let result = result.map(|(generation, request)| {
                        let id = request.id;
                        self.dispatch(&device_id, generation, vec![request]);
                        id
                    });
                    let _ = reply.send(result);
                }
                HostCommand::Learn { device_id, reply } => {
                    let learned = self
                        .sessions
                        .get_mut(&device_id)
                        .map(|hosted| hosted.session.learn());
                    let _ = reply.send(learned);
                }
                HostCommand::Snapshot { device_id, reply } => {
                    let snapshot = self.sessions.get(&device_id).map(|hosted| {
                        let s = &hosted.session;
                        DeviceSnapshot {
                            device_id: device_id.clone(),
                            profile: s.profile().clone(),
                            capabilities: s.store().to_json(),
                            zones: s.zones().iter().cloned().collect(),
                            power: s.power().summary(),
                        }
                    });
                    let _ = reply.send(snapshot);
                }
                HostCommand::Remove { device_id } => {
                    if let Some(hosted) = self.sessions.remove(&device_id) {
                        debug!(
                            category = "host",
                            device_id = %device_id,
                            generation = hosted.generation,
                            abandoned = hosted.session.pending_count(),
                            "Session removed"
                        );
                    }
                }
                HostCommand::Shutdown => break,
            }
        }

        info!(
            category = "host",
            sessions = self.sessions.len(),
            "Device host stopped"
        );
    }

    fn inbound(&mut self, device_id: String, event: InboundEvent) {
        if let InboundEvent::Completion { id, result } = event {
            // Delivered from outside; applies to the current session only
            let Some(generation) = self.sessions.get(&device_id).map(|h| h.generation) else {
                debug!(
                    category = "host",
                    device_id = %device_id,
                    request = %id,
                    "Completion for unknown device ignored"
                );
                return;
            };
            return self.completion(device_id, generation, id, result);
        }

        let (config, sink) = (&self.config, &self.sink);
        let next_generation = &mut self.next_generation;
        let hosted = self.sessions.entry(device_id.clone()).or_insert_with(|| {
            *next_generation += 1;
            HostedSession {
                generation: *next_generation,
                session: DeviceSession::new(device_id.clone(), config, sink.clone()),
            }
        });
        let generation = hosted.generation;
        let requests = hosted.session.handle(event);
        self.dispatch(&device_id, generation, requests);
    }

    /// Completions never create a session, and results issued under an
    /// earlier session of the same device are dropped.
    fn completion(
        &mut self,
        device_id: String,
        generation: u64,
        id: RequestId,
        result: TransportResult<OperationOutput>,
    ) {
        let hosted = match self.sessions.get_mut(&device_id) {
            Some(hosted) if hosted.generation == generation => hosted,
            _ => {
                debug!(
                    category = "host",
                    device_id = %device_id,
                    request = %id,
                    generation,
                    "Completion for removed session ignored"
                );
                return;
            }
        };
        let requests = hosted.session.handle(InboundEvent::Completion { id, result });
        self.dispatch(&device_id, generation, requests);
    }

    fn dispatch(&self, device_id: &str, generation: u64, requests: Vec<OutboundRequest>) {
        for request in requests {
            let Some(tx) = self.completions.upgrade() else {
                return;
            };
            let transport = self.transport.clone();
            let device_id = device_id.to_string();
            let timeout = self.request_timeout;

            tokio::spawn(async move {
                let result = match tokio::time::timeout(
                    timeout,
                    request.operation.execute(transport.as_ref(), &device_id),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
                };
                let completion = HostCommand::Completion {
                    device_id,
                    generation,
                    id: request.id,
                    result,
                };
                // Fails only after shutdown
                let _ = tx.send(completion).await;
            });
        }
    }
}
