// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Egress encoding: replays staged rewrites over the raw message bytes.

use bytes::Bytes;

use crate::metadata::{MessageMetadata, RewriteOp};

/// Produces the wire bytes for a message, applying its staged rewrites in
/// recorded order.
///
/// Rewrite positions refer to the original raw bytes; as operations are
/// applied, positions of later operations are shifted by the length delta of
/// every earlier operation at or before them.
pub fn encode(meta: &MessageMetadata) -> Bytes {
    if meta.rewrites().is_empty() {
        return meta.raw().clone();
    }

    let mut out: Vec<u8> = meta.raw().to_vec();
    let mut applied: Vec<(usize, isize)> = Vec::new();
    for op in meta.rewrites() {
        let orig = op.position();
        let shift: isize = applied
            .iter()
            .filter(|(p, _)| *p <= orig)
            .map(|(_, d)| *d)
            .sum();
        let pos = (orig as isize + shift) as usize;
        match op {
            RewriteOp::Insert { text, .. } => {
                out.splice(pos..pos, text.as_bytes().iter().copied());
                applied.push((orig, text.len() as isize));
            }
            RewriteOp::Replace { span, text } => {
                out.splice(pos..pos + span.len, text.as_bytes().iter().copied());
                applied.push((orig, text.len() as isize - span.len as isize));
            }
        }
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{parse_message, ParseOptions};
    use crate::metadata::Span;

    fn parse(raw: &[u8]) -> MessageMetadata {
        parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap()
    }

    #[test]
    fn untouched_message_round_trips() {
        let raw = b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/TCP d;branch=b1\r\nContent-Length: 0\r\n\r\n";
        let meta = parse(raw);
        assert_eq!(encode(&meta).as_ref(), raw.as_slice());
    }

    #[test]
    fn injects_ep_on_top_via() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1\r\n\
            Content-Length: 0\r\n\r\n";
        let mut meta = parse(raw);
        meta.set_endpoint("127.0.0.1");
        let out = encode(&meta);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(
            text.contains("Via: SIP/2.0/TCP d;branch=z9hG4bK-1;ep=127.0.0.1\r\n"),
            "missing ep injection: {}",
            text
        );
    }

    #[test]
    fn replaces_existing_ep_on_top_via() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1;ep=10.1.1.1;rport\r\n\
            Content-Length: 0\r\n\r\n";
        let mut meta = parse(raw);
        meta.set_endpoint("127.0.0.1");
        let out = encode(&meta);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains(";ep=127.0.0.1;rport"), "ep not replaced: {}", text);
        assert!(!text.contains("10.1.1.1"));
    }

    #[test]
    fn injects_ep_on_top_route_when_present() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1\r\n\
            Route: <sip:proxy.pcsf.com;opaque=xyz>\r\n\
            Content-Length: 0\r\n\r\n";
        let mut meta = parse(raw);
        meta.set_endpoint("127.0.0.1");
        let out = encode(&meta);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(
            text.contains("Route: <sip:proxy.pcsf.com;opaque=xyz;ep=127.0.0.1>\r\n"),
            "ep not placed on route uri: {}",
            text
        );
    }

    #[test]
    fn replaces_existing_ep_on_top_route() {
        let raw = b"ACK sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1\r\n\
            Route: <sip:proxy.pcsf.com;ep=abc>\r\n\
            Content-Length: 0\r\n\r\n";
        let mut meta = parse(raw);
        meta.set_endpoint("192.0.2.7");
        let out = encode(&meta);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("Route: <sip:proxy.pcsf.com;ep=192.0.2.7>\r\n"));
    }

    #[test]
    fn later_positions_shift_after_earlier_inserts() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1\r\n\
            Route: <sip:proxy.pcsf.com;opaque=old>\r\n\
            Content-Length: 0\r\n\r\n";
        let mut meta = parse(raw);
        // Stage an opaque replacement after the endpoint rewrite; the opaque
        // span sits later in the raw bytes than the route ep insertion point.
        let opaque = meta.route_opaque().unwrap().to_owned();
        assert_eq!(opaque, "old");
        meta.set_endpoint("127.0.0.1");
        let span = {
            let start = raw.windows(4).position(|w| w == &b"=old"[..]).unwrap() + 1;
            Span::of(start, 3)
        };
        meta.push_rewrite(RewriteOp::Replace {
            span,
            text: "fresh".into(),
        });
        let out = encode(&meta);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(
            text.contains("Route: <sip:proxy.pcsf.com;opaque=fresh;ep=127.0.0.1>\r\n"),
            "rewrites misapplied: {}",
            text
        );
    }
}
