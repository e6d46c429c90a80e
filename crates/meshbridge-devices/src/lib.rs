//! Device engine for meshbridge.
//!
//! Per-device sessions that turn mesh traffic into capabilities:
//!
//! - [`transport`]: the boundary to the mesh radio stack
//! - [`capabilities`]: host-side capability store
//! - [`mapper`]: datapoint and attribute heuristics, single write path
//! - [`zone`]: zone enrollment handshake and alarm bitmaps
//! - [`power`]: power source and battery gating
//! - [`learner`]: best-effort profile synthesis for unknown devices
//! - [`session`]: sans-IO per-device state machine
//! - [`host`]: tokio driver owning all sessions

pub mod capabilities;
pub mod host;
pub mod learner;
pub mod mapper;
pub mod power;
pub mod session;
pub mod transport;
pub mod zone;

pub use capabilities::{CapabilitySet, CapabilityStore, CapabilityUpdate, CapabilityWriteError};
pub use host::{DeviceHost, DeviceSnapshot, HostHandle};
pub use learner::{Classification, DeviceClass, LearnedProfile, ProfileLearner, ValueKind};
pub use mapper::{CapabilityMapper, HeuristicTable};
pub use power::{DeviceKind, PowerModel, PowerSource};
pub use session::{DeviceProfile, DeviceSession, InboundEvent, OutboundRequest, RequestId};
pub use transport::{Operation, OperationOutput, Transport, TransportError, TransportResult};
pub use zone::{ZoneEnrollmentState, ZoneRegistry};
