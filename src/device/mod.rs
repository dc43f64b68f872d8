use crate::error::{Result, WizError, METHOD_NOT_FOUND};
use crate::model::PilotState;
use crate::protocol::{Command, Message, METHOD_GET_PILOT};
use crate::transport::{Response, Transport};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One addressable device. Every exchange goes through `in_flight`, so a
/// device never has two requests outstanding; links to different devices do
/// not wait on each other.
#[derive(Debug, Clone)]
pub struct DeviceLink {
    target: SocketAddr,
    transport: Transport,
    in_flight: Arc<Mutex<()>>,
}

impl DeviceLink {
    pub fn new(target: SocketAddr, transport: Transport) -> Self {
        Self {
            target,
            transport,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub async fn request(&self, command: &Command) -> Result<Value> {
        let payload = command.to_bytes()?;
        let response = {
            let _guard = self.in_flight.lock().await;
            self.transport.send(&payload, self.target).await?
        };
        classify_reply(&command.method, &response)
    }

    /// Same as `request` on the short commit schedule.
    pub async fn commit(&self, command: &Command) -> Result<Value> {
        let payload = command.to_bytes()?;
        let response = {
            let _guard = self.in_flight.lock().await;
            self.transport.send_commit(&payload, self.target).await?
        };
        classify_reply(&command.method, &response)
    }

    pub async fn get_pilot(&self) -> Result<PilotState> {
        let result = self.request(&Command::new(METHOD_GET_PILOT)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

fn classify_reply(method: &str, response: &Response) -> Result<Value> {
    match response.message()? {
        Message::Reply { result, .. } => Ok(result),
        Message::Error { error, .. } if error.code == METHOD_NOT_FOUND => {
            Err(WizError::UnsupportedMethod {
                method: method.to_string(),
            })
        }
        Message::Error { error, .. } => Err(WizError::Device {
            code: error.code,
            message: error.message,
        }),
        other => Err(WizError::Parse(format!(
            "expected a reply to {method}, got {:?}",
            other.method()
        ))),
    }
}
