//! SDN controller REST client
//!
//! Flow rules are posted to the controller's `stats/flowentry` endpoints.
//! Each AP is a switch whose datapath id is derived from the AP id; port 1
//! faces the radio side, port 2 faces the backhaul towards the compute node.
//!
//! Two rule shapes exist. Per-AP defaults (priority 10) redirect everything
//! addressed to the bootstrap node towards the AP's current node. Per-vehicle
//! pins (priority 100) override the default for a single client IP, so a
//! pinned vehicle keeps its node while the rest of the AP's traffic follows
//! the default. Controller failures are logged and the rule is skipped; the
//! next tick re-evaluates.

use serde::Serialize;
use tracing::{debug, warn};

use kinet_core::{ApId, VehicleId};

use crate::error::Result;

/// Datapath id of the first AP switch
const BASE_DPID: u64 = 1_152_921_504_606_846_977;

/// OpenFlow FLOOD pseudo-port
const FLOOD_PORT: u32 = 0xfffffffb;

/// IPv4 ethertype
const ETH_TYPE_IPV4: u32 = 2048;

/// Datapath id of the switch backing an AP
pub fn dpid_for_ap(ap: ApId) -> u64 {
    BASE_DPID + u64::from(ap) - 1
}

/// IP address the network simulator assigns to a vehicle
pub fn vehicle_ip(vehicle: VehicleId) -> String {
    format!("10.0.0.{vehicle}")
}

/// MAC address the network simulator assigns to a vehicle
pub fn vehicle_mac(vehicle: VehicleId) -> String {
    format!("02:00:00:00:{vehicle:02x}:00")
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowMatch {
    pub in_port: u32,
    pub eth_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_dst: Option<String>,
}

impl FlowMatch {
    fn new(in_port: u32) -> Self {
        Self {
            in_port,
            eth_type: ETH_TYPE_IPV4,
            ipv4_src: None,
            ipv4_dst: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum FlowAction {
    #[serde(rename = "SET_FIELD")]
    SetField { field: String, value: String },
    #[serde(rename = "OUTPUT")]
    Output { port: u32 },
}

impl FlowAction {
    fn set_field(field: &str, value: impl Into<String>) -> Self {
        Self::SetField {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// Wire shape of a flowentry add/delete request
#[derive(Debug, Clone, Serialize)]
pub struct FlowEntry {
    pub dpid: u64,
    pub cookie: u32,
    pub cookie_mask: u32,
    pub table_id: u32,
    pub idle_timeout: u32,
    pub hard_timeout: u32,
    pub priority: u32,
    pub flags: u32,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl FlowEntry {
    fn new(ap: ApId, priority: u32, flow_match: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            dpid: dpid_for_ap(ap),
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            flags: 0,
            flow_match,
            actions,
        }
    }
}

/// REST client for the SDN controller
pub struct SdnClient {
    base_url: String,
    client: reqwest::Client,
}

impl SdnClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, endpoint: &str, entry: &FlowEntry) {
        let url = format!("{}/stats/flowentry/{}", self.base_url, endpoint);
        match self.client.post(&url).json(entry).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(dpid = entry.dpid, priority = entry.priority, "flow {} ok", endpoint);
            }
            Ok(response) => {
                warn!(
                    dpid = entry.dpid,
                    status = %response.status(),
                    "flow {} rejected by controller",
                    endpoint
                );
            }
            Err(e) => {
                warn!(dpid = entry.dpid, "flow {} failed: {}", endpoint, e);
            }
        }
    }

    /// Pin one vehicle's traffic at `ap` to `node_ip` (priority 100).
    ///
    /// Forward: radio-side traffic from the vehicle is rewritten to the node
    /// and sent out the backhaul. Reverse: node replies to the vehicle are
    /// rewritten to look like they came from the bootstrap node, then
    /// flooded back out the radio side.
    pub async fn install_vehicle_pin(
        &self,
        ap: ApId,
        vehicle: VehicleId,
        node_ip: &str,
        bootstrap_ip: &str,
    ) -> Result<()> {
        let vip = vehicle_ip(vehicle);

        let mut forward_match = FlowMatch::new(1);
        forward_match.ipv4_src = Some(vip.clone());
        let forward = FlowEntry::new(
            ap,
            100,
            forward_match,
            vec![
                FlowAction::set_field("ipv4_dst", node_ip),
                FlowAction::Output { port: 2 },
            ],
        );

        let mut reverse_match = FlowMatch::new(2);
        reverse_match.ipv4_src = Some(node_ip.to_string());
        reverse_match.ipv4_dst = Some(vip);
        let reverse = FlowEntry::new(
            ap,
            100,
            reverse_match,
            vec![
                FlowAction::set_field("ipv4_src", bootstrap_ip),
                FlowAction::Output { port: FLOOD_PORT },
            ],
        );

        self.post("add", &forward).await;
        self.post("add", &reverse).await;
        Ok(())
    }

    /// Default redirect for an AP: everything addressed to the bootstrap
    /// node goes to `node_ip` instead (priority 10).
    pub async fn install_ap_redirect(
        &self,
        ap: ApId,
        node_ip: &str,
        bootstrap_ip: &str,
    ) -> Result<()> {
        let mut forward_match = FlowMatch::new(1);
        forward_match.ipv4_dst = Some(bootstrap_ip.to_string());
        let forward = FlowEntry::new(
            ap,
            10,
            forward_match,
            vec![
                FlowAction::set_field("ipv4_dst", node_ip),
                FlowAction::Output { port: 2 },
            ],
        );

        let mut reverse_match = FlowMatch::new(2);
        reverse_match.ipv4_src = Some(node_ip.to_string());
        let reverse = FlowEntry::new(
            ap,
            10,
            reverse_match,
            vec![
                FlowAction::set_field("ipv4_src", bootstrap_ip),
                FlowAction::Output { port: FLOOD_PORT },
            ],
        );

        self.post("add", &forward).await;
        self.post("add", &reverse).await;
        Ok(())
    }

    /// Remove the priority-10 redirect rules of an AP (both directions).
    pub async fn delete_ap_flows(&self, ap: ApId) -> Result<()> {
        let reverse = FlowEntry::new(ap, 10, FlowMatch::new(2), vec![]);
        let forward = FlowEntry::new(ap, 10, FlowMatch::new(1), vec![]);

        self.post("delete", &reverse).await;
        self.post("delete", &forward).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpid_for_ap() {
        assert_eq!(dpid_for_ap(1), 1_152_921_504_606_846_977);
        assert_eq!(dpid_for_ap(3), 1_152_921_504_606_846_977 + 2);
    }

    #[test]
    fn test_vehicle_addressing() {
        assert_eq!(vehicle_ip(7), "10.0.0.7");
        assert_eq!(vehicle_mac(7), "02:00:00:00:07:00");
        assert_eq!(vehicle_mac(30), "02:00:00:00:1e:00");
    }

    #[test]
    fn test_match_skips_unset_fields() {
        let entry = FlowEntry::new(1, 10, FlowMatch::new(2), vec![]);
        let json = serde_json::to_value(&entry).unwrap();

        let m = &json["match"];
        assert_eq!(m["in_port"], 2);
        assert_eq!(m["eth_type"], 2048);
        assert!(m.get("ipv4_src").is_none());
        assert!(m.get("ipv4_dst").is_none());
        assert_eq!(json["actions"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_action_serialization() {
        let set = FlowAction::set_field("ipv4_dst", "10.0.0.249");
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["type"], "SET_FIELD");
        assert_eq!(json["field"], "ipv4_dst");
        assert_eq!(json["value"], "10.0.0.249");

        let out = FlowAction::Output { port: FLOOD_PORT };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "OUTPUT");
        assert_eq!(json["port"], 4294967291u64);
    }

    #[test]
    fn test_flow_entry_wire_shape() {
        let mut m = FlowMatch::new(1);
        m.ipv4_src = Some(vehicle_ip(2));
        let entry = FlowEntry::new(
            3,
            100,
            m,
            vec![
                FlowAction::set_field("ipv4_dst", "10.0.0.250"),
                FlowAction::Output { port: 2 },
            ],
        );

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["dpid"], 1_152_921_504_606_846_977u64 + 2);
        assert_eq!(json["priority"], 100);
        assert_eq!(json["cookie"], 0);
        assert_eq!(json["table_id"], 0);
        assert_eq!(json["match"]["ipv4_src"], "10.0.0.2");
        assert_eq!(json["actions"][0]["type"], "SET_FIELD");
        assert_eq!(json["actions"][1]["port"], 2);
    }
}
