use crate::error::{Result, WizError};
use crate::model::PilotState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEVICE_PORT: u16 = 38899;
pub const PUSH_PORT: u16 = 38900;

pub const METHOD_SET_PILOT: &str = "setPilot";
pub const METHOD_GET_PILOT: &str = "getPilot";
pub const METHOD_GET_DEV_INFO: &str = "getDevInfo";
pub const METHOD_SYNC_PILOT: &str = "syncPilot";
pub const METHOD_FIRST_BEAT: &str = "firstBeat";
pub const METHOD_REGISTRATION: &str = "registration";
pub const METHOD_SYNC_ACC_EVT: &str = "syncAccEvt";

/// Literal payload some firmware emits on the push port; never JSON.
pub const TEST_MARKER: &[u8; 4] = b"test";

pub fn is_test_marker(datagram: &[u8]) -> bool {
    datagram == TEST_MARKER
}

/// Outbound request: `{"method": ..., "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub method: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl Command {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn registration(params: &RegistrationParams) -> Self {
        let mut cmd = Self::new(METHOD_REGISTRATION);
        cmd.params.insert("phoneIp".to_string(), Value::String(params.phone_ip.clone()));
        cmd.params.insert("phoneMac".to_string(), Value::String(params.phone_mac.clone()));
        cmd.params.insert("register".to_string(), Value::Bool(params.register));
        cmd
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationParams {
    #[serde(rename = "phoneIp")]
    pub phone_ip: String,
    #[serde(rename = "phoneMac")]
    pub phone_mac: String,
    pub register: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Every datagram this crate consumes, classified once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SetPilot { params: Map<String, Value> },
    SyncPilot { mac: String, state: PilotState },
    FirstBeat { mac: String },
    Registration(RegistrationParams),
    SyncAccEvt { mac: String, frame: String },
    Reply { method: Option<String>, result: Value },
    Error { method: Option<String>, error: RpcError },
    Other { method: String },
}

impl Message {
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let raw: RawMessage = serde_json::from_slice(datagram)?;

        if let Some(error) = raw.error {
            return Ok(Self::Error {
                method: raw.method,
                error,
            });
        }
        if let Some(result) = raw.result {
            return Ok(Self::Reply {
                method: raw.method,
                result,
            });
        }

        let method = raw
            .method
            .ok_or_else(|| WizError::Parse("message has no method, result or error".to_string()))?;
        let params = raw.params.unwrap_or(Value::Null);

        match method.as_str() {
            METHOD_SET_PILOT => Ok(Self::SetPilot {
                params: into_object(params, &method)?,
            }),
            METHOD_SYNC_PILOT => {
                let mac = required_str(&params, "mac", &method)?;
                let state: PilotState = serde_json::from_value(params)?;
                Ok(Self::SyncPilot { mac, state })
            }
            METHOD_FIRST_BEAT => Ok(Self::FirstBeat {
                mac: required_str(&params, "mac", &method)?,
            }),
            METHOD_REGISTRATION => Ok(Self::Registration(serde_json::from_value(params)?)),
            METHOD_SYNC_ACC_EVT => Ok(Self::SyncAccEvt {
                mac: required_str(&params, "mac", &method)?,
                frame: required_str(&params, "frame", &method)?,
            }),
            _ => Ok(Self::Other { method }),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::SetPilot { .. } => Some(METHOD_SET_PILOT),
            Self::SyncPilot { .. } => Some(METHOD_SYNC_PILOT),
            Self::FirstBeat { .. } => Some(METHOD_FIRST_BEAT),
            Self::Registration(_) => Some(METHOD_REGISTRATION),
            Self::SyncAccEvt { .. } => Some(METHOD_SYNC_ACC_EVT),
            Self::Reply { method, .. } | Self::Error { method, .. } => method.as_deref(),
            Self::Other { method } => Some(method),
        }
    }
}

fn into_object(value: Value, method: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(WizError::Parse(format!("{method}: params is not an object"))),
    }
}

fn required_str(params: &Value, key: &str, method: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WizError::Parse(format!("{method}: missing string field '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_omits_empty_params() {
        let bytes = Command::new(METHOD_GET_PILOT).to_bytes().unwrap();
        assert_eq!(bytes, br#"{"method":"getPilot"}"#);

        let cmd = Command::new(METHOD_SET_PILOT).with_param("dimming", 50);
        let value: Value = serde_json::from_slice(&cmd.to_bytes().unwrap()).unwrap();
        assert_eq!(value, json!({"method": "setPilot", "params": {"dimming": 50}}));
    }

    #[test]
    fn registration_command_uses_wire_names() {
        let cmd = Command::registration(&RegistrationParams {
            phone_ip: "192.168.1.20".to_string(),
            phone_mac: "AABBCCDDEEFF".to_string(),
            register: true,
        });
        let value: Value = serde_json::from_slice(&cmd.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "method": "registration",
                "params": {"phoneIp": "192.168.1.20", "phoneMac": "AABBCCDDEEFF", "register": true}
            })
        );
    }

    #[test]
    fn parses_sync_pilot_with_state() {
        let msg = Message::parse(
            br#"{"method":"syncPilot","env":"pro","params":{"mac":"a8bb50aabbcc","state":true,"dimming":70}}"#,
        )
        .unwrap();
        match msg {
            Message::SyncPilot { mac, state } => {
                assert_eq!(mac, "a8bb50aabbcc");
                assert_eq!(state.dimming, Some(70));
                assert_eq!(state.state, Some(true));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn sync_pilot_without_mac_is_rejected() {
        let err = Message::parse(br#"{"method":"syncPilot","params":{"state":true}}"#).unwrap_err();
        assert!(matches!(err, WizError::Parse(_)));
    }

    #[test]
    fn error_object_wins_over_method() {
        let msg = Message::parse(
            br#"{"method":"setPilot","error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(msg.method(), Some("setPilot"));
        assert!(matches!(msg, Message::Error { error, .. } if error.code == -32601));
    }

    #[test]
    fn reply_and_unknown_methods_classify() {
        let reply = Message::parse(br#"{"method":"getPilot","result":{"state":false}}"#).unwrap();
        assert!(matches!(reply, Message::Reply { .. }));

        let other = Message::parse(br#"{"method":"pulse","params":{}}"#).unwrap();
        assert_eq!(other, Message::Other { method: "pulse".to_string() });
    }

    #[test]
    fn acc_event_requires_frame() {
        let msg = Message::parse(
            br#"{"method":"syncAccEvt","params":{"mac":"d8a0110a0b0c","frame":"gb4AAAAgCQFgqyXB2g=="}}"#,
        )
        .unwrap();
        assert!(matches!(msg, Message::SyncAccEvt { .. }));
        assert!(Message::parse(br#"{"method":"syncAccEvt","params":{"mac":"x"}}"#).is_err());
    }

    #[test]
    fn test_marker_is_not_json() {
        assert!(is_test_marker(b"test"));
        assert!(!is_test_marker(b"tests"));
        assert!(Message::parse(b"test").is_err());
    }
}
