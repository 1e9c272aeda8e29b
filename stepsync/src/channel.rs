//! Channel Manager: owns the single request/reply channel of a plugin.
//!
//! There is either no channel (no address configured, or closed) or exactly
//! one open channel. Opening a new one always closes the previous one first.
//! The manager does not know about handshake sessions; a caller that resets
//! the channel must abandon whatever session was using it.

#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use std::time::Duration;

use thiserror::Error;

use crate::net::{AddressError, ReqSocket, ServiceAddress, SocketError};
use crate::protocol::{Reply, Request};
use crate::trace::{debug, info, warn};

#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedChannel, ScriptedConnector};

/// Channel failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Send/receive attempted with no channel open.
    #[error("no service channel is open")]
    ChannelAbsent,
    /// The configured address cannot be used.
    #[error("invalid service address: {0}")]
    InvalidAddress(#[from] AddressError),
    /// Transport failure on the open channel.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// One open request/reply channel.
pub trait RequestChannel {
    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Returns a [`SocketError`] if the request cannot be queued or written.
    fn send(&mut self, request: &Request) -> Result<(), SocketError>;

    /// Returns a reply if one is ready within `wait`; never blocks longer.
    ///
    /// # Errors
    ///
    /// Returns a [`SocketError`] if the transport failed.
    fn try_recv(&mut self, wait: Duration) -> Result<Option<Reply>, SocketError>;
}

/// Opens request channels to a service address.
pub trait Connector {
    type Channel: RequestChannel;

    /// Opens a channel connected to `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`SocketError`] if the channel cannot be created.
    fn connect(&self, address: ServiceAddress) -> Result<Self::Channel, SocketError>;
}

impl RequestChannel for ReqSocket {
    fn send(&mut self, request: &Request) -> Result<(), SocketError> {
        Self::send(self, request.as_str().as_bytes())
    }

    fn try_recv(&mut self, wait: Duration) -> Result<Option<Reply>, SocketError> {
        Ok(Self::try_recv(self, wait)?.map(|payload| Reply::parse(&payload)))
    }
}

/// Connects [`ReqSocket`]s over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Channel = ReqSocket;

    fn connect(&self, address: ServiceAddress) -> Result<ReqSocket, SocketError> {
        ReqSocket::connect(address)
    }
}

/// Owns at most one open channel.
pub struct ChannelManager<K: Connector> {
    connector: K,
    channel: Option<(ServiceAddress, K::Channel)>,
}

impl<K: Connector> ChannelManager<K> {
    /// Manager with no channel open.
    pub const fn new(connector: K) -> Self {
        Self {
            connector,
            channel: None,
        }
    }

    /// Whether a channel is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Address of the open channel, if any.
    #[must_use]
    pub fn address(&self) -> Option<ServiceAddress> {
        self.channel.as_ref().map(|(addr, _)| *addr)
    }

    /// Closes the open channel, if any. Idempotent.
    pub fn close_all(&mut self) {
        if let Some((_address, channel)) = self.channel.take() {
            drop(channel);
            info!(address = %_address, "service channel closed");
        }
    }

    /// Closes any open channel, then opens one to `address` unless it is empty.
    ///
    /// On error no channel is left open.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidAddress`] for a malformed address and
    /// [`ChannelError::Socket`] if the channel cannot be created.
    pub fn reset(&mut self, address: &str) -> Result<(), ChannelError> {
        self.close_all();
        if address.trim().is_empty() {
            debug!("no service address configured, channel left absent");
            return Ok(());
        }
        let address = ServiceAddress::parse(address).inspect_err(|_e| {
            warn!(error = %_e, "cannot open service channel");
        })?;
        let channel = self.connector.connect(address).inspect_err(|_e| {
            warn!(address = %address, error = %_e, "cannot open service channel");
        })?;
        info!(address = %address, "service channel opened");
        self.channel = Some((address, channel));
        Ok(())
    }

    /// Sends one request on the open channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ChannelAbsent`] if no channel is open, or the
    /// transport error.
    pub fn send(&mut self, request: &Request) -> Result<(), ChannelError> {
        let (_, channel) = self.channel.as_mut().ok_or(ChannelError::ChannelAbsent)?;
        channel.send(request)?;
        Ok(())
    }

    /// Checks for a reply, waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ChannelAbsent`] if no channel is open, or the
    /// transport error.
    pub fn try_receive(&mut self, wait: Duration) -> Result<Option<Reply>, ChannelError> {
        let (_, channel) = self.channel.as_mut().ok_or(ChannelError::ChannelAbsent)?;
        Ok(channel.try_recv(wait)?)
    }
}
