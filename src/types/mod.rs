//! Core data types flowing through the pipeline.
//!
//! - [`RawFrame`] is what the transport hands over: opaque bytes plus an arrival time
//! - [`DecodedEvent`] is a parsed frame with its partition key
//! - [`KeyPath`] locates the key inside the event document
//! - [`ConnectionState`] is the transport connector's lifecycle state
//!
//! ```rust
//! use firehose::types::{DecodedEvent, KeyPath, RawFrame};
//!
//! let frame = RawFrame::from_text(r#"{"kind":"commit","commit":{"rev":"3l3qo2vutsw2b"}}"#);
//! let event = DecodedEvent::decode(&frame, &KeyPath::default()).unwrap();
//! assert_eq!(event.key, "3l3qo2vutsw2b");
//! ```

mod event;
mod frame;
mod state;

pub use event::{DecodedEvent, KeyPath};
pub use frame::RawFrame;
pub use state::ConnectionState;
