//! Step synchronization with an external service.
//!
//! A controller asks a service to start a unit of work, learns within a short
//! bounded wait whether it was accepted, then polls without blocking for the
//! completion notification until a timeout expires. Whatever happens, the
//! channel is released and exactly one outcome reaches the step driver.
//!
//! - [`plugin`]: host-facing hooks and the [`plugin::StepDriver`] contract.
//! - [`handshake`]: the per-step state machine.
//! - [`channel`]: the single request/reply channel a plugin owns.
//! - [`service`]: the reference service implementing the replying side.
//! - [`net`], [`protocol`]: TCP transport and wire format.
//! - [`runtime::timing`]: clocks and the timing-wheel ticker driving polls.

pub mod channel;
pub mod config;
pub mod handshake;
pub mod net;
pub mod plugin;
pub mod protocol;
pub mod runtime;
pub mod service;
pub mod trace;

pub use trace::init_tracing;

pub use channel::{ChannelError, ChannelManager, Connector, RequestChannel, TcpConnector};
pub use config::{AppOptions, EndpointConfig, OptionsProvider, SharedOptions, StepOptions};
pub use handshake::{HandshakeError, Phase, StepOutcome};
pub use plugin::{Collaborators, ServicePlugin, StepDriver};
pub use service::{ReferenceService, ServiceError, ServiceHandle, service_main};
