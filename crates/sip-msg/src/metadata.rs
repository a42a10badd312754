// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parsed, span-backed view of a single SIP message.

use bytes::Bytes;
use smol_str::SmolStr;

/// Request method, reduced to the distinction this proxy acts on.
///
/// Routing is keyed by the Via branch, not the method; the one
/// method-sensitive behavior is ACK handling: an ACK joins the transaction
/// its branch indexes (the ACK-for-4xx case) and expects no response, so it
/// is never registered for response correlation. Every other method carries
/// its token for matching, logging, and the CSeq echo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Ack,
    Other(SmolStr),
}

impl Method {
    /// Returns the method token.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Ack => "ACK",
            Method::Other(token) => token.as_str(),
        }
    }

    /// Parses a method token.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else {
            Method::Other(SmolStr::new(token))
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Method::Ack)
    }
}

/// Whether a message is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Response,
}

/// Byte range into a message's raw bytes.
///
/// Spans replace borrowed string views so metadata can outlive the ingress
/// buffer it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn of(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Resolves the span against the raw bytes it was computed from.
    pub fn slice<'a>(&self, raw: &'a [u8]) -> &'a str {
        std::str::from_utf8(&raw[self.start..self.end()]).unwrap_or("")
    }
}

/// A staged egress edit, positioned against the original raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOp {
    /// Insert `text` before the byte at `at`.
    Insert { at: usize, text: SmolStr },
    /// Replace the bytes covered by `span` with `text`.
    Replace { span: Span, text: SmolStr },
}

impl RewriteOp {
    pub(crate) fn position(&self) -> usize {
        match self {
            RewriteOp::Insert { at, .. } => *at,
            RewriteOp::Replace { span, .. } => span.start,
        }
    }
}

/// Where the egress `ep` parameter lands in this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpSlot {
    /// An `ep=` parameter exists; its value span is replaced.
    ReplaceValue(Span),
    /// No `ep=` parameter; `;ep=<ip>` is inserted at this offset.
    InsertAt(usize),
}

/// Metadata for one SIP message: owned raw bytes, span-backed views of the
/// routing-relevant fields, the selected destination, and the ordered list of
/// rewrite operations consumed by the egress encoder.
///
/// The transaction id (topmost Via `branch`) is fixed at parse time and never
/// changes for the life of the metadata.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub(crate) raw: Bytes,
    pub(crate) kind: MsgKind,
    pub(crate) method: Option<Method>,
    pub(crate) resp_method: Option<Method>,
    pub(crate) status: Option<u16>,
    pub(crate) request_uri: Option<Span>,
    pub(crate) top_via: Option<Span>,
    pub(crate) transaction_id: Option<Span>,
    pub(crate) top_route: Option<Span>,
    pub(crate) domain: Option<Span>,
    pub(crate) route_ep: Option<Span>,
    pub(crate) route_opaque: Option<Span>,
    pub(crate) p_cookie: Option<Span>,
    pub(crate) from_header: Option<Span>,
    pub(crate) to_header: Option<Span>,
    pub(crate) call_id: Option<Span>,
    pub(crate) cseq: Option<Span>,
    pub(crate) ep_slot: Option<EpSlot>,
    destination: Option<SmolStr>,
    rewrites: Vec<RewriteOp>,
    ep_rewrite_index: Option<usize>,
}

impl MessageMetadata {
    pub(crate) fn new(raw: Bytes, kind: MsgKind) -> Self {
        Self {
            raw,
            kind,
            method: None,
            resp_method: None,
            status: None,
            request_uri: None,
            top_via: None,
            transaction_id: None,
            top_route: None,
            domain: None,
            route_ep: None,
            route_opaque: None,
            p_cookie: None,
            from_header: None,
            to_header: None,
            call_id: None,
            cseq: None,
            ep_slot: None,
            destination: None,
            rewrites: Vec::new(),
            ep_rewrite_index: None,
        }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn kind(&self) -> MsgKind {
        self.kind
    }

    /// Request method, or the CSeq method echo for responses.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref().or(self.resp_method.as_ref())
    }

    /// Method echoed by the CSeq header of a response.
    pub fn resp_method(&self) -> Option<&Method> {
        self.resp_method.as_ref()
    }

    /// Response status code.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    fn view(&self, span: Option<Span>) -> Option<&str> {
        span.map(|s| s.slice(&self.raw))
    }

    pub fn request_uri(&self) -> Option<&str> {
        self.view(self.request_uri)
    }

    /// Value of the topmost Via header.
    pub fn top_via(&self) -> Option<&str> {
        self.view(self.top_via)
    }

    /// The `branch` token of the topmost Via.
    pub fn transaction_id(&self) -> Option<&str> {
        self.view(self.transaction_id)
    }

    /// Value of the topmost Route header.
    pub fn top_route(&self) -> Option<&str> {
        self.view(self.top_route)
    }

    /// Domain the route table matches against.
    pub fn domain(&self) -> Option<&str> {
        self.view(self.domain)
    }

    /// `ep` parameter of the top Route URI.
    pub fn route_ep(&self) -> Option<&str> {
        self.view(self.route_ep)
    }

    /// `opaque` parameter of the top Route URI.
    pub fn route_opaque(&self) -> Option<&str> {
        self.view(self.route_opaque)
    }

    /// `p-cookie` parameter of the top Route URI.
    pub fn p_cookie(&self) -> Option<&str> {
        self.view(self.p_cookie)
    }

    pub fn from_header(&self) -> Option<&str> {
        self.view(self.from_header)
    }

    pub fn to_header(&self) -> Option<&str> {
        self.view(self.to_header)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.view(self.call_id)
    }

    pub fn cseq(&self) -> Option<&str> {
        self.view(self.cseq)
    }

    /// Upstream host this message is pinned to, when affinity resolved one.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn set_destination(&mut self, destination: impl Into<SmolStr>) {
        self.destination = Some(destination.into());
    }

    /// Stages the mandatory `ep=<local_ip>` rewrite on the top Route when one
    /// exists, otherwise on the topmost Via. Idempotent: a later call
    /// replaces the previously staged endpoint.
    pub fn set_endpoint(&mut self, local_ip: &str) {
        let Some(slot) = self.ep_slot else {
            return;
        };
        let op = match slot {
            EpSlot::ReplaceValue(span) => RewriteOp::Replace {
                span,
                text: SmolStr::new(local_ip),
            },
            EpSlot::InsertAt(at) => RewriteOp::Insert {
                at,
                text: SmolStr::new(format!(";ep={}", local_ip)),
            },
        };
        match self.ep_rewrite_index {
            Some(index) => self.rewrites[index] = op,
            None => {
                self.rewrites.push(op);
                self.ep_rewrite_index = Some(self.rewrites.len() - 1);
            }
        }
    }

    /// Stages an arbitrary rewrite, applied by the encoder after all
    /// previously recorded operations.
    pub fn push_rewrite(&mut self, op: RewriteOp) {
        self.rewrites.push(op);
    }

    pub fn rewrites(&self) -> &[RewriteOp] {
        &self.rewrites
    }
}
