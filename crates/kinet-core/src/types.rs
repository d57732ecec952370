//! Data model shared by the tracker and the placement controllers

use serde::{Deserialize, Serialize};

/// Access point identifier (1-based, as configured)
pub type ApId = u32;

/// Compute node identifier (1 = bootstrap worker)
pub type NodeId = u32;

/// Vehicle identifier (1-based, as configured)
pub type VehicleId = u32;

/// A point in the 2-D simulation plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Planar Euclidean distance
    pub fn distance(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Fixed compass travel axis used by the single-flow scenario.
///
/// The "still ahead" test is a plain coordinate comparison on one axis,
/// not a directional projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heading {
    North,
    South,
    East,
    West,
}

impl Heading {
    /// True if `destination` still lies ahead of `source` along this axis.
    pub fn is_ahead(&self, source: Point, destination: Point) -> bool {
        match self {
            Heading::North => source.y < destination.y,
            Heading::South => source.y > destination.y,
            Heading::West => source.x > destination.x,
            Heading::East => source.x < destination.x,
        }
    }
}

/// An access point, mapped to exactly one compute node.
///
/// Loaded from the static topology config; immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPoint {
    pub id: ApId,
    pub position: Point,
    pub channel: String,
    /// Owning compute node ("where traffic *should* go")
    pub node: NodeId,
}

/// An installed forwarding-rule pairing: traffic for `ap` is currently
/// redirected to `node` ("where traffic *currently* goes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub ap: ApId,
    pub node: NodeId,
}

/// Mutable per-vehicle state, shared between the tracker loop and the
/// decision loop behind a single lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleState {
    /// Last sampled position; `None` until the first telemetry line
    pub position: Option<Point>,

    /// Displacement between the last two distinct samples;
    /// undefined until the second sample
    pub direction: Option<(f64, f64)>,

    /// AP the vehicle is currently attached to
    pub associated_ap: Option<ApId>,

    /// Node currently serving the vehicle (load-balancing scenario)
    pub using_node: Option<NodeId>,

    /// Per-vehicle flow history; records are appended, never removed
    pub flows: Vec<FlowRecord>,
}

impl VehicleState {
    /// True if some flow already pins this vehicle to `ap`.
    pub fn has_flow_for_ap(&self, ap: ApId) -> bool {
        self.flows.iter().any(|f| f.ap == ap)
    }
}
