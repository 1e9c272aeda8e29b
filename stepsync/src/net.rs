//! Network transport for the request/reply channel.
//!
//! TCP sockets driven by mio, addressed with `tcp://host:port` strings.

pub mod address;
pub mod socket;

pub use address::{AddressError, ServiceAddress};
pub use socket::{Incoming, PeerId, RepSocket, ReqSocket, SocketError};
