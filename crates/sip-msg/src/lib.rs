// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message metadata, stream framing, parsing, and egress encoding.
//!
//! This crate owns the wire-facing half of the proxy: splitting a TCP byte
//! stream into complete SIP messages, extracting the routing-relevant fields
//! into a [`MessageMetadata`], and re-emitting messages with staged rewrites
//! applied (most importantly the `ep` endpoint parameter that steers reply
//! traffic back to this proxy instance).
//!
//! Parsed fields are `(offset, len)` spans into the message's owned raw
//! bytes, so metadata stays valid when staged for a response long after the
//! ingress buffer is gone.
//!
//! # Example
//! ```
//! use bytes::BytesMut;
//! use sip_msg::{drain_frames, parse_message, FrameLimits, ParseOptions};
//!
//! let raw = b"OPTIONS sip:ping@example.com SIP/2.0\r\n\
//!             Via: SIP/2.0/TCP client.example.com;branch=z9hG4bK77\r\n\
//!             Content-Length: 0\r\n\r\n";
//! let mut buf = BytesMut::from(&raw[..]);
//! let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
//! let meta = parse_message(frames[0].clone(), &ParseOptions::default()).unwrap();
//! assert_eq!(meta.transaction_id(), Some("z9hG4bK77"));
//! ```

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod metadata;

pub use decoder::{drain_frames, parse_message, FrameLimits, ParseOptions};
pub use encoder::encode;
pub use error::{AppError, ResponseKind};
pub use metadata::{MessageMetadata, Method, MsgKind, RewriteOp, Span};
