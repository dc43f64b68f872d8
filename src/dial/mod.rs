use crate::config::DialConfig;
use crate::error::{Result, WizError};
use crate::protocol::{is_test_marker, Message};
use crate::transport::MAX_DATAGRAM_SIZE;
use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const FRAME_LEN: usize = 13;
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(400);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialCategory {
    ShortPress,
    LongPress,
    RotateCounterClockwise,
    RotateClockwise,
    SceneAShort,
    SceneBShort,
    SceneALong,
    SceneBLong,
    Unknown,
}

impl DialCategory {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::ShortPress,
            0x02 => Self::LongPress,
            0x08 => Self::RotateCounterClockwise,
            0x09 => Self::RotateClockwise,
            0x10 => Self::SceneAShort,
            0x11 => Self::SceneBShort,
            0x12 => Self::SceneALong,
            0x13 => Self::SceneBLong,
            _ => Self::Unknown,
        }
    }

    /// Rotation arrives as a stream of ticks and is never debounced.
    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::RotateClockwise | Self::RotateCounterClockwise)
    }
}

/// Raw 13-byte accessory frame. Only the sequence and event code are
/// interpreted; everything else is carried as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialFrame {
    pub sequence: u16,
    pub header: [u8; 4],
    pub event_code: u8,
    pub action: u8,
    pub state: u8,
    pub reserved: [u8; 4],
}

impl DialFrame {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FRAME_LEN {
            return None;
        }
        Some(Self {
            sequence: u16::from_be_bytes([bytes[0], bytes[1]]),
            header: [bytes[2], bytes[3], bytes[4], bytes[5]],
            event_code: bytes[6],
            action: bytes[7],
            state: bytes[8],
            reserved: [bytes[9], bytes[10], bytes[11], bytes[12]],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialEvent {
    pub device_id: String,
    pub category: DialCategory,
    pub sequence: u16,
    pub raw_type: u8,
    pub frame: DialFrame,
    pub timestamp: Instant,
}

/// Decodes a `syncAccEvt` datagram. Anything else, including a frame that is
/// not exactly 13 bytes, yields `None`.
pub fn decode(datagram: &[u8]) -> Option<DialEvent> {
    decode_at(datagram, Instant::now())
}

pub fn decode_at(datagram: &[u8], timestamp: Instant) -> Option<DialEvent> {
    let (mac, frame) = match Message::parse(datagram).ok()? {
        Message::SyncAccEvt { mac, frame } => (mac, frame),
        _ => return None,
    };
    let bytes = general_purpose::STANDARD.decode(frame.trim()).ok()?;
    let frame = DialFrame::parse(&bytes)?;
    Some(DialEvent {
        device_id: mac,
        category: DialCategory::from_code(frame.event_code),
        sequence: frame.sequence,
        raw_type: frame.event_code,
        frame,
        timestamp,
    })
}

/// Drops repeated button presses of the same kind from the same device that
/// land inside the window. Keys are never evicted.
#[derive(Debug)]
pub struct DebounceFilter {
    window: Duration,
    last_accepted: HashMap<(String, DialCategory), Instant>,
}

impl DebounceFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    pub fn accept(&mut self, event: &DialEvent) -> bool {
        if event.category.is_continuous() {
            return true;
        }
        let key = (event.device_id.clone(), event.category);
        if let Some(last) = self.last_accepted.get(&key) {
            if event.timestamp.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_accepted.insert(key, event.timestamp);
        true
    }
}

impl Default for DebounceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

/// Receives accessory frames on their own socket and forwards the ones that
/// pass the debounce filter.
pub struct DialListener {
    socket: UdpSocket,
    filter: DebounceFilter,
}

impl DialListener {
    pub async fn bind(config: &DialConfig) -> Result<Self> {
        let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.listen_port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|err| WizError::Connection(format!("bind dial listener on {addr}: {err}")))?;
        Ok(Self {
            socket,
            filter: DebounceFilter::new(config.debounce_window()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn spawn(self) -> (JoinHandle<()>, mpsc::Receiver<DialEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (tokio::spawn(self.run(tx)), rx)
    }

    pub async fn run(mut self, tx: mpsc::Sender<DialEvent>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(error = %err, "dial listener receive failed");
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    continue;
                }
            };
            let datagram = &buf[..len];
            if is_test_marker(datagram) {
                continue;
            }
            let Some(event) = decode(datagram) else {
                tracing::debug!(%from, len, "dropping datagram that is not an accessory frame");
                continue;
            };
            if !self.filter.accept(&event) {
                tracing::trace!(device = %event.device_id, category = ?event.category, "debounced");
                continue;
            }
            if tx.send(event).await.is_err() {
                tracing::debug!("dial event receiver dropped; stopping listener");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: &str = "d8a0110a0b0c";

    fn envelope(frame: &[u8]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "method": "syncAccEvt",
            "params": {"mac": MAC, "frame": general_purpose::STANDARD.encode(frame)}
        }))
        .unwrap()
    }

    fn frame_with_code(code: u8) -> [u8; 13] {
        [0x81, 0xbe, 0x00, 0x00, 0x00, 0x20, code, 0x01, 0x60, 0xab, 0x25, 0xc1, 0xda]
    }

    fn event(category: DialCategory, at: Instant) -> DialEvent {
        let frame = DialFrame::parse(&frame_with_code(0x01)).unwrap();
        DialEvent {
            device_id: MAC.to_string(),
            category,
            sequence: frame.sequence,
            raw_type: frame.event_code,
            frame,
            timestamp: at,
        }
    }

    #[test]
    fn decodes_observed_rotation_frame() {
        let event = decode(&envelope(&[
            0x81, 0xbe, 0x00, 0x00, 0x00, 0x20, 0x09, 0x01, 0x60, 0xab, 0x25, 0xc1, 0xda,
        ]))
        .unwrap();
        assert_eq!(event.category, DialCategory::RotateClockwise);
        assert_eq!(event.sequence, 0x81be);
        assert_eq!(event.device_id, MAC);
        assert_eq!(event.frame.state, 0x60);
        assert_eq!(event.frame.reserved, [0xab, 0x25, 0xc1, 0xda]);
    }

    #[test]
    fn every_defined_code_maps_and_keeps_raw_bytes() {
        let table = [
            (0x01, DialCategory::ShortPress),
            (0x02, DialCategory::LongPress),
            (0x08, DialCategory::RotateCounterClockwise),
            (0x09, DialCategory::RotateClockwise),
            (0x10, DialCategory::SceneAShort),
            (0x11, DialCategory::SceneBShort),
            (0x12, DialCategory::SceneALong),
            (0x13, DialCategory::SceneBLong),
        ];
        for (code, category) in table {
            let mut bytes = frame_with_code(code);
            bytes[8] = 0x5f;
            let event = decode(&envelope(&bytes)).unwrap();
            assert_eq!(event.category, category, "code {code:#04x}");
            assert_eq!(event.raw_type, code);
            assert_eq!(event.sequence, 0x81be);
            assert_eq!(event.frame.action, 0x01);
            assert_eq!(event.frame.state, 0x5f);
        }
    }

    #[test]
    fn unrecognized_code_is_unknown_not_an_error() {
        let event = decode(&envelope(&frame_with_code(0x7f))).unwrap();
        assert_eq!(event.category, DialCategory::Unknown);
        assert_eq!(event.raw_type, 0x7f);
    }

    #[test]
    fn structural_mismatches_yield_none() {
        assert!(decode(&envelope(&[0u8; 12])).is_none());
        assert!(decode(&envelope(&[0u8; 14])).is_none());
        assert!(decode(br#"{"method":"syncPilot","params":{"mac":"x","frame":"AAAA"}}"#).is_none());
        assert!(decode(br#"{"method":"syncAccEvt","params":{"frame":"gb4AAAAgCQFgqyXB2g=="}}"#).is_none());
        assert!(decode(br#"{"method":"syncAccEvt","params":{"mac":"x","frame":"***"}}"#).is_none());
        assert!(decode(b"not json").is_none());
    }

    #[test]
    fn presses_inside_window_are_dropped() {
        let mut filter = DebounceFilter::default();
        let t0 = Instant::now();
        assert!(filter.accept(&event(DialCategory::ShortPress, t0)));
        assert!(!filter.accept(&event(DialCategory::ShortPress, t0 + Duration::from_millis(399))));
    }

    #[test]
    fn presses_at_window_spacing_pass() {
        let mut filter = DebounceFilter::default();
        let t0 = Instant::now();
        assert!(filter.accept(&event(DialCategory::ShortPress, t0)));
        assert!(filter.accept(&event(DialCategory::ShortPress, t0 + Duration::from_millis(400))));
    }

    #[test]
    fn window_is_per_category() {
        let mut filter = DebounceFilter::default();
        let t0 = Instant::now();
        assert!(filter.accept(&event(DialCategory::ShortPress, t0)));
        assert!(filter.accept(&event(DialCategory::LongPress, t0 + Duration::from_millis(10))));
    }

    #[test]
    fn rapid_rotation_is_never_filtered() {
        let mut filter = DebounceFilter::default();
        let t0 = Instant::now();
        let accepted = (0..5)
            .filter(|i| {
                filter.accept(&event(
                    DialCategory::RotateClockwise,
                    t0 + Duration::from_millis(10 * i),
                ))
            })
            .count();
        assert_eq!(accepted, 5);
    }

    #[tokio::test]
    async fn listener_forwards_debounced_events() {
        let config = DialConfig {
            enabled: true,
            listen_port: 0,
            debounce_window_ms: 400,
        };
        let listener = DialListener::bind(&config).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (task, mut rx) = listener.spawn();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target: SocketAddr = ([127, 0, 0, 1], port).into();
        sender.send_to(b"test", target).await.unwrap();
        sender.send_to(&envelope(&frame_with_code(0x01)), target).await.unwrap();
        sender.send_to(&envelope(&frame_with_code(0x01)), target).await.unwrap();
        sender.send_to(&envelope(&frame_with_code(0x09)), target).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.category, DialCategory::ShortPress);
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.category, DialCategory::RotateClockwise);

        task.abort();
    }
}
