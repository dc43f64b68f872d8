//! Client core for the UDP/JSON smart-light protocol: retried command
//! exchanges, push registration and routing, and the accessory dial stream.

pub mod app;
pub mod config;
pub mod device;
pub mod dial;
pub mod discovery;
pub mod error;
pub mod model;
pub mod protocol;
pub mod push;
pub mod transport;

pub use config::Config;
pub use device::DeviceLink;
pub use dial::{decode, DebounceFilter, DialCategory, DialEvent, DialListener};
pub use error::{PushStartFailure, Result, WizError};
pub use model::{DiscoveredDevice, PilotState};
pub use protocol::{Command, Message};
pub use push::{DiscoveryBeat, PushManager, PushUpdate, Subscription};
pub use transport::{RetrySchedule, Response, Transport};
