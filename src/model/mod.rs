use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Device state snapshot as carried by `syncPilot` params and `getPilot` results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PilotState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimming: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<u32>,
    #[serde(default, rename = "sceneId", skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PilotState {
    pub fn rgb(&self) -> Option<(u8, u8, u8)> {
        Some((self.r?, self.g?, self.b?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub ip: IpAddr,
    pub mac: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pilot_keeps_unknown_fields() {
        let state: PilotState = serde_json::from_value(serde_json::json!({
            "mac": "a8bb50aabbcc",
            "state": true,
            "dimming": 40,
            "sceneId": 11,
            "schdPsetId": 3
        }))
        .unwrap();
        assert_eq!(state.dimming, Some(40));
        assert_eq!(state.scene_id, Some(11));
        assert_eq!(state.extra.get("schdPsetId"), Some(&serde_json::json!(3)));
        assert_eq!(state.rgb(), None);
    }
}
