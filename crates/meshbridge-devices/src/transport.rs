//! Transport boundary.
//!
//! The mesh radio stack lives outside this crate. It delivers inbound
//! traffic as [`InboundEvent`](crate::session::InboundEvent)s and executes
//! the outbound operations a session asks for through [`Transport`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use meshbridge_core::AttributeValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device did not answer
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Operation timeout
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// The device answered with a non-success status
    #[error("Device rejected request with status 0x{0:02X}")]
    Rejected(u8),

    /// The device or transport does not support the request
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// Transport shut down
    #[error("Transport is stopped")]
    Stopped,

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<TransportError> for meshbridge_core::Error {
    fn from(err: TransportError) -> Self {
        meshbridge_core::transport_err!(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Operations a device session needs from the mesh stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str {
        "transport"
    }

    async fn read_attribute(
        &self,
        device_id: &str,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
    ) -> TransportResult<AttributeValue>;

    async fn write_attributes(
        &self,
        device_id: &str,
        endpoint: u8,
        cluster: u16,
        values: &BTreeMap<u16, AttributeValue>,
    ) -> TransportResult<()>;

    async fn send_command(
        &self,
        device_id: &str,
        endpoint: u8,
        cluster: u16,
        command: u8,
        payload: &[u8],
    ) -> TransportResult<()>;
}

/// An outbound operation, independent of any transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    ReadAttribute {
        endpoint: u8,
        cluster: u16,
        attribute: u16,
    },
    WriteAttributes {
        endpoint: u8,
        cluster: u16,
        values: BTreeMap<u16, AttributeValue>,
    },
    SendCommand {
        endpoint: u8,
        cluster: u16,
        command: u8,
        payload: Vec<u8>,
    },
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Value(AttributeValue),
    Done,
}

impl Operation {
    pub fn endpoint(&self) -> u8 {
        match self {
            Self::ReadAttribute { endpoint, .. }
            | Self::WriteAttributes { endpoint, .. }
            | Self::SendCommand { endpoint, .. } => *endpoint,
        }
    }

    pub fn cluster(&self) -> u16 {
        match self {
            Self::ReadAttribute { cluster, .. }
            | Self::WriteAttributes { cluster, .. }
            | Self::SendCommand { cluster, .. } => *cluster,
        }
    }

    /// Run this operation against a transport.
    pub async fn execute<T>(&self, transport: &T, device_id: &str) -> TransportResult<OperationOutput>
    where
        T: Transport + ?Sized,
    {
        match self {
            Self::ReadAttribute {
                endpoint,
                cluster,
                attribute,
            } => transport
                .read_attribute(device_id, *endpoint, *cluster, *attribute)
                .await
                .map(OperationOutput::Value),
            Self::WriteAttributes {
                endpoint,
                cluster,
                values,
            } => transport
                .write_attributes(device_id, *endpoint, *cluster, values)
                .await
                .map(|_| OperationOutput::Done),
            Self::SendCommand {
                endpoint,
                cluster,
                command,
                payload,
            } => transport
                .send_command(device_id, *endpoint, *cluster, *command, payload)
                .await
                .map(|_| OperationOutput::Done),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadAttribute {
                endpoint,
                cluster,
                attribute,
            } => write!(f, "read ep{}/0x{:04X}/0x{:04X}", endpoint, cluster, attribute),
            Self::WriteAttributes {
                endpoint,
                cluster,
                values,
            } => write!(f, "write ep{}/0x{:04X} ({} attrs)", endpoint, cluster, values.len()),
            Self::SendCommand {
                endpoint,
                cluster,
                command,
                payload,
            } => write!(
                f,
                "command ep{}/0x{:04X}/0x{:02X} ({} bytes)",
                endpoint,
                cluster,
                command,
                payload.len()
            ),
        }
    }
}
