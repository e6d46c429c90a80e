//! Dialect detection.
//!
//! Classifies a device from its endpoint topology. The result is additive:
//! a device can be profile-classified and carry the proprietary datapoint
//! flag and any number of private-cluster vendor tags at the same time.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{
    id, is_manufacturer_specific, is_private_cluster, ClusterCatalog, ClusterRef, Direction,
};

/// Application profile ids.
pub mod profile {
    pub const HOME_AUTOMATION: u16 = 0x0104;
    pub const SMART_ENERGY: u16 = 0x0109;
    pub const LIGHT_LINK: u16 = 0xC05E;
}

/// Standard application profile a device declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardProfile {
    HomeAutomation,
    SmartEnergy,
    LightLink,
}

impl StandardProfile {
    pub fn from_profile_id(profile_id: u16) -> Option<Self> {
        match profile_id {
            profile::HOME_AUTOMATION => Some(Self::HomeAutomation),
            profile::SMART_ENERGY => Some(Self::SmartEnergy),
            profile::LIGHT_LINK => Some(Self::LightLink),
            _ => None,
        }
    }
}

/// Clusters of a single endpoint as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTopology {
    pub endpoint: u8,
    /// Declared profile id, if the simple descriptor was read.
    #[serde(default)]
    pub profile_id: Option<u16>,
    #[serde(default)]
    pub input_clusters: Vec<u16>,
    #[serde(default)]
    pub output_clusters: Vec<u16>,
}

impl EndpointTopology {
    pub fn new(endpoint: u8) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, profile_id: u16) -> Self {
        self.profile_id = Some(profile_id);
        self
    }

    pub fn with_inputs(mut self, clusters: impl IntoIterator<Item = u16>) -> Self {
        self.input_clusters.extend(clusters);
        self
    }

    pub fn with_outputs(mut self, clusters: impl IntoIterator<Item = u16>) -> Self {
        self.output_clusters.extend(clusters);
        self
    }

    pub fn has_input(&self, cluster_id: u16) -> bool {
        self.input_clusters.contains(&cluster_id)
    }
}

/// Cluster references of one endpoint.
///
/// The standard set is fixed when the descriptor is built from the topology
/// read; the private set grows as vendor clusters surface in traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub endpoint: u8,
    standard: BTreeSet<ClusterRef>,
    private: BTreeSet<ClusterRef>,
}

impl EndpointDescriptor {
    pub fn new(endpoint: u8) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn from_topology(topology: &EndpointTopology) -> Self {
        let mut descriptor = Self::new(topology.endpoint);
        let sides = [
            (&topology.input_clusters, Direction::Input),
            (&topology.output_clusters, Direction::Output),
        ];
        for (clusters, direction) in sides {
            for &cluster_id in clusters {
                let cluster = ClusterRef::new(cluster_id, direction);
                if is_private_cluster(cluster_id) {
                    descriptor.private.insert(cluster);
                } else {
                    descriptor.standard.insert(cluster);
                }
            }
        }
        descriptor
    }

    pub fn standard(&self) -> &BTreeSet<ClusterRef> {
        &self.standard
    }

    pub fn private(&self) -> &BTreeSet<ClusterRef> {
        &self.private
    }

    /// Record a private cluster seen in traffic.
    ///
    /// Returns `true` if the private set grew. Standard clusters are ignored.
    pub fn observe_private(&mut self, cluster_id: u16, direction: Direction) -> bool {
        if !is_private_cluster(cluster_id) {
            return false;
        }
        self.private.insert(ClusterRef::new(cluster_id, direction))
    }

    pub fn has_cluster(&self, cluster_id: u16) -> bool {
        self.standard
            .iter()
            .chain(self.private.iter())
            .any(|c| c.id == cluster_id)
    }
}

/// Endpoint/cluster snapshot delivered at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub endpoints: Vec<EndpointTopology>,
}

impl TopologySnapshot {
    pub fn new(endpoints: Vec<EndpointTopology>) -> Self {
        Self { endpoints }
    }

    pub fn endpoint(&self, endpoint: u8) -> Option<&EndpointTopology> {
        self.endpoints.iter().find(|e| e.endpoint == endpoint)
    }

    /// One descriptor per endpoint, in snapshot order.
    pub fn descriptors(&self) -> Vec<EndpointDescriptor> {
        self.endpoints
            .iter()
            .map(EndpointDescriptor::from_topology)
            .collect()
    }

    /// Endpoints that expose the given cluster as a server.
    pub fn endpoints_with_input(&self, cluster_id: u16) -> impl Iterator<Item = u8> + '_ {
        self.endpoints
            .iter()
            .filter(move |e| e.has_input(cluster_id))
            .map(|e| e.endpoint)
    }
}

/// Combined dialect classification of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectSet {
    /// Standard profile, if one was declared.
    pub profile: Option<StandardProfile>,
    /// Device tunnels the compact datapoint protocol.
    pub proprietary_datapoint: bool,
    /// Vendor tags of private clusters (`XIAOMI`, `PRIVATE_FC57`, ...).
    pub private_vendors: BTreeSet<String>,
}

impl DialectSet {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && !self.proprietary_datapoint && self.private_vendors.is_empty()
    }

    /// Whether any standard profile was declared.
    pub fn is_standard(&self) -> bool {
        self.profile.is_some()
    }

    /// Fold in another classification; never removes anything already set.
    ///
    /// Returns `true` if the set grew.
    pub fn merge(&mut self, other: &DialectSet) -> bool {
        let before = self.clone();
        if self.profile.is_none() {
            self.profile = other.profile;
        }
        self.proprietary_datapoint |= other.proprietary_datapoint;
        self.private_vendors
            .extend(other.private_vendors.iter().cloned());
        *self != before
    }

    /// Record a private cluster that surfaced after the topology read.
    pub fn observe_cluster(&mut self, cluster_id: u16) -> bool {
        let mut extra = DialectSet::default();
        classify_cluster(cluster_id, &mut extra);
        self.merge(&extra)
    }
}

impl fmt::Display for DialectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(profile) = self.profile {
            parts.push(format!("{:?}", profile));
        }
        if self.proprietary_datapoint {
            parts.push("ProprietaryDatapoint".to_string());
        }
        parts.extend(self.private_vendors.iter().cloned());
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join("+"))
        }
    }
}

/// Outcome of dialect detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Detection {
    /// Topology was not available.
    NoTopology,
    Classified(DialectSet),
}

impl Detection {
    pub fn dialects(&self) -> Option<&DialectSet> {
        match self {
            Self::Classified(set) => Some(set),
            Self::NoTopology => None,
        }
    }

    pub fn into_dialects(self) -> DialectSet {
        match self {
            Self::Classified(set) => set,
            Self::NoTopology => DialectSet::default(),
        }
    }
}

/// Synthesized tag for an unknown private cluster.
pub fn private_tag(cluster_id: u16) -> String {
    format!("PRIVATE_{:04X}", cluster_id)
}

fn classify_cluster(cluster_id: u16, set: &mut DialectSet) {
    if cluster_id == id::PROPRIETARY_DATAPOINT {
        set.proprietary_datapoint = true;
    } else if is_manufacturer_specific(cluster_id) {
        let tag = ClusterCatalog::vendor_of(cluster_id)
            .map(str::to_string)
            .unwrap_or_else(|| private_tag(cluster_id));
        set.private_vendors.insert(tag);
    }
}

/// Classify a device from its topology.
pub fn detect(topology: Option<&TopologySnapshot>) -> Detection {
    let Some(topology) = topology.filter(|t| !t.endpoints.is_empty()) else {
        return Detection::NoTopology;
    };

    let mut set = DialectSet::default();
    for endpoint in &topology.endpoints {
        if set.profile.is_none() {
            set.profile = endpoint.profile_id.and_then(StandardProfile::from_profile_id);
        }
        for &cluster in &endpoint.input_clusters {
            classify_cluster(cluster, &mut set);
        }
        // Private clusters count on either side; the datapoint tunnel only as a server
        for &cluster in &endpoint.output_clusters {
            if cluster != id::PROPRIETARY_DATAPOINT {
                classify_cluster(cluster, &mut set);
            }
        }
    }
    Detection::Classified(set)
}
