use crate::config::TransportConfig;
use crate::error::{Result, WizError};
use crate::protocol::Message;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};

pub const DEFAULT_ATTEMPTS: u32 = 6;
pub const DEFAULT_FIRST_INTERVAL: Duration = Duration::from_millis(750);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(13);
pub const COMMIT_ATTEMPTS: u32 = 3;
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const MAX_DATAGRAM_SIZE: usize = 4096;

/// When each copy of a request goes out, relative to the first send, and when
/// the exchange gives up.
///
/// Gaps start at `first_interval` and double up to `max_interval`. The overall
/// `timeout` is always later than the last scheduled send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    attempts: u32,
    first_interval: Duration,
    max_interval: Duration,
    timeout: Duration,
}

impl RetrySchedule {
    pub fn new(
        attempts: u32,
        first_interval: Duration,
        max_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        if attempts == 0 {
            return Err(WizError::Config("retry schedule needs at least one attempt".into()));
        }
        if attempts > 1 && (first_interval.is_zero() || max_interval.is_zero()) {
            return Err(WizError::Config("retry intervals must be non-zero".into()));
        }
        let schedule = Self {
            attempts,
            first_interval,
            max_interval,
            timeout,
        };
        if timeout <= schedule.last_send() {
            return Err(WizError::Config(format!(
                "timeout {:?} must be later than the last send at {:?}",
                timeout,
                schedule.last_send()
            )));
        }
        Ok(schedule)
    }

    /// 6 sends at 0, 0.75, 2.25, 5.25, 8.25 and 11.25s; gives up at 13s.
    pub fn standard() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            first_interval: DEFAULT_FIRST_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Short schedule for writes where a late retry would show as flicker.
    pub fn commit() -> Self {
        Self {
            attempts: COMMIT_ATTEMPTS,
            first_interval: DEFAULT_FIRST_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            timeout: COMMIT_TIMEOUT,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn offsets(&self) -> Vec<Duration> {
        let mut offsets = Vec::with_capacity(self.attempts as usize);
        let mut at = Duration::ZERO;
        let mut gap = self.first_interval.min(self.max_interval);
        for _ in 0..self.attempts {
            offsets.push(at);
            at += gap;
            gap = gap.saturating_mul(2).min(self.max_interval);
        }
        offsets
    }

    pub fn last_send(&self) -> Duration {
        self.offsets().last().copied().unwrap_or_default()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// First datagram received on an exchange socket.
#[derive(Debug, Clone)]
pub struct Response {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

impl Response {
    pub fn message(&self) -> Result<Message> {
        Message::parse(&self.bytes)
    }
}

/// Request/response over UDP with progressive retransmission.
///
/// The reply is whatever datagram arrives first on the exchange's own
/// ephemeral socket; the protocol carries no request id. Callers must keep at
/// most one exchange in flight per device (see `DeviceLink`).
#[derive(Debug, Clone)]
pub struct Transport {
    standard: RetrySchedule,
    commit: RetrySchedule,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(RetrySchedule::standard(), RetrySchedule::commit())
    }
}

impl Transport {
    pub fn new(standard: RetrySchedule, commit: RetrySchedule) -> Self {
        Self { standard, commit }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Ok(Self::new(config.standard_schedule()?, config.commit_schedule()?))
    }

    pub fn standard_schedule(&self) -> &RetrySchedule {
        &self.standard
    }

    pub fn commit_schedule(&self) -> &RetrySchedule {
        &self.commit
    }

    pub async fn send(&self, payload: &[u8], target: SocketAddr) -> Result<Response> {
        exchange(payload, target, &self.standard).await
    }

    pub async fn send_commit(&self, payload: &[u8], target: SocketAddr) -> Result<Response> {
        exchange(payload, target, &self.commit).await
    }
}

pub(crate) fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Runs one exchange to completion. Dropping the returned future closes the
/// socket and cancels every pending send.
pub async fn exchange(
    payload: &[u8],
    target: SocketAddr,
    schedule: &RetrySchedule,
) -> Result<Response> {
    let socket = UdpSocket::bind(unspecified_for(&target))
        .await
        .map_err(|err| WizError::Connection(format!("bind ephemeral socket: {err}")))?;

    let offsets = schedule.offsets();
    let started = Instant::now();
    let deadline = sleep_until(started + schedule.timeout());
    tokio::pin!(deadline);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut sent = 0usize;
    loop {
        let next_send = offsets.get(sent).map(|offset| started + *offset);
        tokio::select! {
            biased;
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = recv
                    .map_err(|err| WizError::Connection(format!("receive from {target}: {err}")))?;
                tracing::trace!(%target, %from, attempts = sent, "exchange answered");
                return Ok(Response { bytes: buf[..len].to_vec(), from });
            }
            _ = &mut deadline => {
                tracing::debug!(%target, attempts = sent, "exchange timed out");
                return Err(WizError::Timeout { target, attempts: sent as u32 });
            }
            _ = sleep_until(next_send.unwrap_or(started)), if next_send.is_some() => {
                socket
                    .send_to(payload, target)
                    .await
                    .map_err(|err| WizError::Connection(format!("send to {target}: {err}")))?;
                sent += 1;
                if sent > 1 {
                    tracing::trace!(%target, attempt = sent, "retransmitted request");
                }
            }
        }
    }
}
