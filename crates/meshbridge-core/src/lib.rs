//! Core types for meshbridge.
//!
//! Protocol-level building blocks shared by the device engine and the CLI:
//! the cluster catalog, dialect detection, the datapoint codec, values,
//! events and their bus, configuration, logging and the time responder.

pub mod catalog;
pub mod config;
pub mod datapoint;
pub mod dialect;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod logging;
pub mod time;
pub mod value;

pub use catalog::{ClusterCatalog, ClusterRef, Direction};
pub use config::{ConfigError, EngineConfig, TemperatureScaling};
pub use datapoint::{
    Datapoint, DatapointFrame, DatapointType, DatapointValue, DecodeError, Decoded,
    EncodingError, UnrecognizedDatapoint,
};
pub use dialect::{
    detect, Detection, DialectSet, EndpointDescriptor, EndpointTopology, TopologySnapshot,
};
pub use error::{Error, Result};
pub use event::{EnrollmentStatus, EventMetadata, MeshEvent, SignalSource};
pub use eventbus::{
    EventBus, EventBusReceiver, EventSink, FilterBuilder, FilteredReceiver, MemorySink, NullSink,
    SharedEventBus, DEFAULT_CHANNEL_CAPACITY,
};
pub use time::{TimeResponder, TimeSnapshot};
pub use value::AttributeValue;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::catalog::{id as cluster, ClusterCatalog, ClusterRef, Direction};
    pub use crate::config::{env_vars, EngineConfig, TemperatureScaling};
    pub use crate::datapoint::{Datapoint, DatapointType, DatapointValue, Decoded};
    pub use crate::dialect::{detect, Detection, DialectSet, TopologySnapshot};
    pub use crate::error::{Error, Result};
    pub use crate::event::{EnrollmentStatus, MeshEvent, SignalSource};
    pub use crate::eventbus::{EventBus, EventSink, SharedEventBus};
    pub use crate::value::AttributeValue;
}
