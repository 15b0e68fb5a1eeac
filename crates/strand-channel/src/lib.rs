//! Channels and Handler Pipelines for the Strand Runtime
//!
//! A channel is a bidirectional endpoint pinned to one event executor. Its
//! pipeline is a doubly-linked chain of handler contexts between fixed head
//! and tail sentinels: inbound events flow head to tail, outbound operations
//! flow tail to head, and every async operation returns a promise.
//!
//! # Key Features
//!
//! - Capability-masked dispatch: traversal skips non-participating handlers
//! - On-loop discipline: off-loop calls are forwarded to the owning executor
//! - Outbound buffer with flush watermark and progress observation hooks
//! - Typed channel attributes keyed by pool constants
//! - `EmbeddedChannel`: inline, virtual-time test harness
//!
//! # Example
//!
//! ```
//! use strand_channel::EmbeddedChannel;
//!
//! let channel = EmbeddedChannel::new();
//! channel.write_inbound(Box::new("ping".to_string()));
//!
//! let msg = channel.read_inbound().unwrap();
//! assert_eq!(*msg.downcast::<String>().unwrap(), "ping");
//! assert!(!channel.finish());
//! ```

mod attrs;
mod channel;
mod embedded;
mod error;
mod handler;
mod outbound;
mod pipeline;

pub use attrs::{AttrKey, AttrMap};
pub use channel::{Channel, ChannelConfig, ChannelId, ChannelState, Transport};
pub use embedded::EmbeddedChannel;
pub use error::ChannelError;
pub use handler::{release_msg, Event, Handler, HandlerCaps, Msg};
pub use outbound::OutboundBuffer;
pub use pipeline::{Ctx, Pipeline};
