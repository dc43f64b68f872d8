use crate::config::DiscoveryConfig;
use crate::error::{Result, WizError};
use crate::model::DiscoveredDevice;
use crate::protocol::{Command, Message, METHOD_GET_DEV_INFO};
use crate::transport::{unspecified_for, RetrySchedule, MAX_DATAGRAM_SIZE};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};

/// Broadcasts `getDevInfo` and collects every device that answers before the
/// wait elapses. The request is repeated on `schedule`'s offsets that fall
/// inside the wait. A device answering several copies is reported once, at
/// the address it first answered from.
pub async fn discover(
    config: &DiscoveryConfig,
    device_port: u16,
    schedule: &RetrySchedule,
) -> Result<Vec<DiscoveredDevice>> {
    let broadcast: IpAddr = config
        .broadcast_address
        .trim()
        .parse()
        .map_err(|_| WizError::Config(format!("bad broadcast address '{}'", config.broadcast_address)))?;
    let target = SocketAddr::new(broadcast, device_port);
    let wait = Duration::from_millis(config.wait_ms);

    let socket = UdpSocket::bind(unspecified_for(&target))
        .await
        .map_err(|err| WizError::Connection(format!("bind discovery socket: {err}")))?;
    socket
        .set_broadcast(true)
        .map_err(|err| WizError::Connection(format!("enable broadcast: {err}")))?;

    let payload = Command::new(METHOD_GET_DEV_INFO).to_bytes()?;
    let offsets: Vec<Duration> = schedule.offsets().into_iter().filter(|o| *o < wait).collect();
    let started = Instant::now();
    let deadline = sleep_until(started + wait);
    tokio::pin!(deadline);

    let mut found: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut sent = 0usize;
    loop {
        let next_send = offsets.get(sent).map(|offset| started + *offset);
        tokio::select! {
            biased;
            _ = &mut deadline => break,
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::debug!(error = %err, "discovery receive failed");
                        continue;
                    }
                };
                let Some(mac) = reply_mac(&buf[..len]) else {
                    continue;
                };
                if !found.iter().any(|device| device.mac == mac) {
                    tracing::debug!(%mac, ip = %from.ip(), "discovered device");
                    found.push(DiscoveredDevice { ip: from.ip(), mac });
                }
            }
            _ = sleep_until(next_send.unwrap_or(started)), if next_send.is_some() => {
                socket
                    .send_to(&payload, target)
                    .await
                    .map_err(|err| WizError::Connection(format!("broadcast to {target}: {err}")))?;
                sent += 1;
            }
        }
    }
    Ok(found)
}

fn reply_mac(datagram: &[u8]) -> Option<String> {
    match Message::parse(datagram).ok()? {
        Message::Reply { result, .. } => result.get("mac").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_device(mac: &'static str) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
                assert_eq!(request["method"], "getDevInfo");
                let reply = serde_json::json!({
                    "method": "getDevInfo",
                    "env": "pro",
                    "result": {"mac": mac, "devMac": mac, "moduleName": "ESP01_SHRGB_03"}
                });
                socket.send_to(&serde_json::to_vec(&reply).unwrap(), from).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn collects_each_device_once() {
        let port = fake_device("a8bb50aabbcc").await;
        let config = DiscoveryConfig {
            broadcast_address: "127.0.0.1".to_string(),
            wait_ms: 1000,
        };

        // Two sends land inside the wait, so the device answers twice.
        let found = discover(&config, port, &RetrySchedule::standard()).await.unwrap();
        assert_eq!(
            found,
            vec![DiscoveredDevice {
                ip: "127.0.0.1".parse().unwrap(),
                mac: "a8bb50aabbcc".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn rejects_unparsable_broadcast_address() {
        let config = DiscoveryConfig {
            broadcast_address: "everyone".to_string(),
            wait_ms: 10,
        };
        let err = discover(&config, 38899, &RetrySchedule::standard()).await.unwrap_err();
        assert!(matches!(err, WizError::Config(_)));
    }

    #[test]
    fn only_replies_with_mac_count() {
        assert_eq!(reply_mac(br#"{"result":{"mac":"abc"}}"#).as_deref(), Some("abc"));
        assert_eq!(reply_mac(br#"{"result":{}}"#), None);
        assert_eq!(reply_mac(br#"{"method":"firstBeat","params":{"mac":"abc"}}"#), None);
    }
}
