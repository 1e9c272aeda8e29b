//! Wire protocol between the driver and the service.
//!
//! | Request               | Valid replies              |
//! |-----------------------|----------------------------|
//! | `"start"`             | `"started"`                |
//! | `"notify_completion"` | `"completed"` \| `"error"` |
//! | anything else         | `"error"`                  |
//!
//! One request is in flight at a time and the driver is always the requester.

pub mod frame;
pub mod message;

pub use frame::{FrameDecoder, FrameError, MAX_FRAME_LEN, encode_frame};
pub use message::{Reply, Request};
