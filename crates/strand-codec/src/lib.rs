//! Stream-to-Frame Decoding for the Strand Runtime
//!
//! [`StreamDecoder`] drives a [`FrameDecoder`] against the channel's
//! accumulated inbound bytes: adopt or cumulate each delivery, decode until
//! no progress, forward the frames, and keep the partial remainder for the
//! next delivery. [`LineDecoder`] is the concrete framer; [`IdleHandler`]
//! and [`WriteTimeoutHandler`] supervise channels with deadline tasks on
//! the owning executor.
//!
//! # Example
//!
//! ```
//! use strand_buf::{BufAllocator, HeapAllocator};
//! use strand_channel::EmbeddedChannel;
//! use strand_codec::{LineDecoder, StreamDecoder};
//!
//! let channel = EmbeddedChannel::with_handlers(vec![Box::new(StreamDecoder::new(
//!     LineDecoder::new(1024).with_strip_delimiter(true),
//! ))]);
//!
//! let alloc = HeapAllocator::unsampled();
//! let mut buf = alloc.allocate(16, 64);
//! buf.write_bytes(b"hello\nwo").unwrap();
//! channel.write_inbound(Box::new(buf));
//!
//! let frame = channel.read_inbound_buf().unwrap();
//! assert_eq!(frame.copy_to_vec(), b"hello");
//! frame.release().unwrap();
//! ```

mod decoder;
mod error;
mod idle;
mod line;
mod write_timeout;

pub use decoder::{DecoderConfig, FrameDecoder, StreamDecoder};
pub use error::CodecError;
pub use idle::{IdleConfig, IdleHandler, IdleState, IdleStateEvent};
pub use line::LineDecoder;
pub use write_timeout::WriteTimeoutHandler;
