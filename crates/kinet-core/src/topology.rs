//! Static AP/node topology index and placement geometry
//!
//! The index is loaded once per run from the network simulator's topology
//! config and is immutable afterwards. The AP to node mapping is ground
//! truth for the whole run: flows converge towards it.
//!
//! All distances are planar Euclidean. Every nearest-AP search walks the AP
//! list in its configured order and updates on `distance <= running_min`,
//! so an exact tie resolves to the **later** AP in list order.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, TopologyError};
use crate::types::{AccessPoint, ApId, Heading, NodeId, Point};

/// Default AP coverage radius (meters)
pub const DEFAULT_RANGE: f64 = 300.0;

/// Fraction of the range below which a vehicle counts as leaving its AP
pub const LEAVING_THRESHOLD: f64 = 0.20;

/// Raw topology config as emitted for the network simulator
#[derive(Debug, Deserialize)]
pub struct TopologyConfig {
    pub aps: Vec<ApEntry>,
    pub cars: CarsEntry,
}

/// Raw AP entry; `position` is the simulator's `"x,y,z"` string
#[derive(Debug, Deserialize)]
pub struct ApEntry {
    pub id: ApId,
    pub position: String,
    #[serde(default)]
    pub channel: String,
    pub node: NodeId,
}

#[derive(Debug, Deserialize)]
pub struct CarsEntry {
    pub count: u32,
}

/// Immutable AP/node lookup table for one run
#[derive(Debug, Clone)]
pub struct TopologyIndex {
    aps: Vec<AccessPoint>,
    vehicle_count: u32,
}

fn parse_position(ap: ApId, raw: &str) -> Result<Point> {
    let mut parts = raw.split(',');
    let x = parts
        .next()
        .and_then(|p| p.trim().parse::<f64>().ok())
        .ok_or_else(|| TopologyError::malformed_position(ap, raw))?;
    let y = parts
        .next()
        .and_then(|p| p.trim().parse::<f64>().ok())
        .ok_or_else(|| TopologyError::malformed_position(ap, raw))?;
    // A trailing z coordinate is allowed and discarded
    Ok(Point::new(x, y))
}

impl TopologyIndex {
    /// Load the topology from a JSON config file. Fatal on any error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: TopologyConfig = serde_json::from_str(&raw)?;
        Self::from_config(config)
    }

    /// Build the index from an already-parsed config.
    pub fn from_config(config: TopologyConfig) -> Result<Self> {
        if config.aps.is_empty() {
            return Err(TopologyError::NoAccessPoints);
        }

        let aps = config
            .aps
            .into_iter()
            .map(|entry| {
                Ok(AccessPoint {
                    id: entry.id,
                    position: parse_position(entry.id, &entry.position)?,
                    channel: entry.channel,
                    node: entry.node,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            aps,
            vehicle_count: config.cars.count,
        })
    }

    /// Access points in configured order
    pub fn aps(&self) -> &[AccessPoint] {
        &self.aps
    }

    /// Number of vehicles in the run
    pub fn vehicle_count(&self) -> u32 {
        self.vehicle_count
    }

    fn ap(&self, id: ApId) -> Option<&AccessPoint> {
        self.aps.iter().find(|ap| ap.id == id)
    }

    /// Ground-truth node for an AP
    pub fn node_for_ap(&self, ap: ApId) -> Option<NodeId> {
        self.ap(ap).map(|ap| ap.node)
    }

    /// APs mapped to a node, in configured order
    pub fn aps_for_node(&self, node: NodeId) -> Vec<ApId> {
        self.aps
            .iter()
            .filter(|ap| ap.node == node)
            .map(|ap| ap.id)
            .collect()
    }

    /// Nearest AP to a point; exact tie resolves to the later AP.
    pub fn closest_ap(&self, point: Point) -> Option<ApId> {
        let mut closest = None;
        let mut min_distance = f64::INFINITY;
        for ap in &self.aps {
            let distance = point.distance(ap.position);
            if distance <= min_distance {
                min_distance = distance;
                closest = Some(ap.id);
            }
        }
        closest
    }

    /// Boolean range test against a single AP
    pub fn is_ap_in_range(&self, point: Point, ap: ApId, range: f64) -> bool {
        match self.ap(ap) {
            Some(ap) => point.distance(ap.position) <= range,
            None => false,
        }
    }

    /// First AP (in list order) within range, plus a "migrate" flag set when
    /// the vehicle has already crossed the AP along the travel axis.
    pub fn ap_and_node_in_range(
        &self,
        point: Point,
        heading: Heading,
        range: f64,
    ) -> Option<(ApId, NodeId, bool)> {
        for ap in &self.aps {
            if point.distance(ap.position) <= range {
                let migrate = !heading.is_ahead(point, ap.position);
                return Some((ap.id, ap.node, migrate));
            }
        }
        None
    }

    /// Minimum-distance AP among those either out of range or still being
    /// approached along the travel axis. Later tie wins.
    pub fn next_ap_and_node(
        &self,
        point: Point,
        heading: Heading,
        range: f64,
    ) -> Option<(ApId, NodeId)> {
        let mut next = None;
        let mut min_distance = f64::INFINITY;
        for ap in &self.aps {
            let distance = point.distance(ap.position);
            if distance > range || heading.is_ahead(point, ap.position) {
                if distance <= min_distance {
                    min_distance = distance;
                    next = Some((ap.id, ap.node));
                }
            }
        }
        next
    }

    /// Predicted travel distance until the vehicle exits the AP's range
    /// circle, scaled by the observed per-tick displacement.
    ///
    /// With a zero direction vector this degenerates to the remaining radial
    /// margin `range - distance(point, ap)`. Otherwise the point is stepped
    /// by the raw (unnormalized) direction vector, accumulating its magnitude
    /// per step, until it leaves the circle. Not a unit-speed projection.
    pub fn distance_in_range(
        &self,
        point: Point,
        direction: (f64, f64),
        ap: ApId,
        range: f64,
    ) -> f64 {
        let Some(ap) = self.ap(ap) else {
            warn!(ap_id = ap, "distance_in_range: unknown AP");
            return 0.0;
        };

        let (dx, dy) = direction;
        let step = dx.hypot(dy);
        if step == 0.0 {
            return range - point.distance(ap.position);
        }

        let mut distance = 0.0;
        let mut theoretical = point;
        while theoretical.distance(ap.position) <= range {
            theoretical.x += dx;
            theoretical.y += dy;
            distance += step;
        }
        distance
    }

    /// True iff the retention estimate is positive but at most
    /// `LEAVING_THRESHOLD * range` (the boundary value counts as leaving).
    pub fn is_leaving_ap(&self, point: Point, direction: (f64, f64), ap: ApId, range: f64) -> bool {
        let distance = self.distance_in_range(point, direction, ap, range);
        if distance == 0.0 {
            warn!(ap_id = ap, "retention estimate is zero, treating as not leaving");
            return false;
        }
        distance <= LEAVING_THRESHOLD * range
    }

    /// Theoretical next AP once the vehicle finishes crossing its current
    /// coverage circle: advance a hypothetical position by the direction
    /// vector until it exits the range circle centered on the *original*
    /// vehicle position, then return the AP (excluding `current`) nearest to
    /// that hypothetical position.
    ///
    /// NOTE: the exit test is against the original position, not the AP
    /// being left. This mirrors the deployed behavior and must not be
    /// "fixed" without confirming against real runs.
    pub fn next_ap_in_direction(
        &self,
        point: Point,
        direction: (f64, f64),
        current: ApId,
        range: f64,
    ) -> Option<ApId> {
        let (dx, dy) = direction;
        if dx == 0.0 && dy == 0.0 {
            // A stationary vehicle never exits the circle
            return None;
        }

        let mut theoretical = point;
        while theoretical.distance(point) <= range {
            theoretical.x += dx;
            theoretical.y += dy;
        }

        let mut closest = None;
        let mut min_distance = f64::INFINITY;
        for ap in &self.aps {
            if ap.id == current {
                continue;
            }
            let distance = theoretical.distance(ap.position);
            if distance <= min_distance {
                min_distance = distance;
                closest = Some(ap.id);
            }
        }
        closest
    }

    /// Abstract inter-node latency proxy: absolute id difference between
    /// `ap` and the representative AP of `target_node` (the one closest to
    /// the coordinate origin).
    pub fn distance_factor_between_nodes(&self, ap: ApId, target_node: NodeId) -> u32 {
        let candidates = self.aps_for_node(target_node);
        if candidates.is_empty() {
            warn!(node_id = target_node, "no APs associated with node");
            return 0;
        }

        let origin = Point::new(0.0, 0.0);
        let mut representative = candidates[0];
        let mut min_distance = f64::INFINITY;
        for id in candidates {
            if let Some(candidate) = self.ap(id) {
                let distance = candidate.position.distance(origin);
                if distance <= min_distance {
                    min_distance = distance;
                    representative = id;
                }
            }
        }

        (ap as i64 - representative as i64).unsigned_abs() as u32
    }
}
