// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Raw SIP message builders for tests.
//!
//! Builders produce complete wire frames (CRLF headers, Content-Length
//! framing) so tests can drive the proxy over real sockets without a
//! message type in between.
//!
//! # Example
//! ```
//! use sip_testkit::build_invite;
//! let frame = build_invite("sip:alice@ex.com", "z9hG4bK-1", "cid-1");
//! assert!(frame.starts_with(b"INVITE sip:alice@ex.com SIP/2.0\r\n"));
//! ```

use bytes::Bytes;

/// Builds a request with the standard dialog headers.
pub fn build_request(
    method: &str,
    uri: &str,
    branch: &str,
    call_id: &str,
    route: Option<&str>,
) -> Bytes {
    let mut msg = format!("{} {} SIP/2.0\r\n", method, uri);
    msg.push_str(&format!(
        "Via: SIP/2.0/TCP client.example.com:5060;branch={}\r\n",
        branch
    ));
    if let Some(route) = route {
        msg.push_str(&format!("Route: {}\r\n", route));
    }
    msg.push_str("From: <sip:alice@example.com>;tag=1234\r\n");
    msg.push_str("To: <sip:bob@example.com>\r\n");
    msg.push_str(&format!("Call-ID: {}\r\n", call_id));
    msg.push_str(&format!("CSeq: 1 {}\r\n", method));
    msg.push_str("Max-Forwards: 70\r\n");
    msg.push_str("Content-Length: 0\r\n\r\n");
    Bytes::from(msg.into_bytes())
}

/// Builds a minimal INVITE.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Bytes {
    build_request("INVITE", uri, branch, call_id, None)
}

/// Builds an INVITE carrying a Route header.
pub fn build_invite_with_route(uri: &str, branch: &str, call_id: &str, route: &str) -> Bytes {
    build_request("INVITE", uri, branch, call_id, Some(route))
}

/// Builds an ACK sharing the given branch.
pub fn build_ack(uri: &str, branch: &str, call_id: &str) -> Bytes {
    build_request("ACK", uri, branch, call_id, None)
}

/// Builds a minimal OPTIONS ping.
pub fn build_options(uri: &str, branch: &str) -> Bytes {
    build_request("OPTIONS", uri, branch, "options-ping", None)
}

/// Builds a response to a raw request, echoing its Via, From, To, Call-ID,
/// and CSeq headers the way a well-behaved UAS would.
pub fn response_for(request: &[u8], code: u16, reason: &str) -> Bytes {
    let text = std::str::from_utf8(request).expect("request is not valid UTF-8");
    let mut msg = format!("SIP/2.0 {} {}\r\n", code, reason);
    for line in text.split("\r\n") {
        if header_is(line, "Via")
            || header_is(line, "From")
            || header_is(line, "To")
            || header_is(line, "Call-ID")
            || header_is(line, "CSeq")
        {
            msg.push_str(line);
            msg.push_str("\r\n");
        }
    }
    msg.push_str("Content-Length: 0\r\n\r\n");
    Bytes::from(msg.into_bytes())
}

fn header_is(line: &str, name: &str) -> bool {
    line.len() > name.len()
        && line.as_bytes()[name.len()] == b':'
        && line[..name.len()].eq_ignore_ascii_case(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_branch_and_framing() {
        let frame = build_invite("sip:alice@ex.com", "z9hG4bK-t", "cid-t");
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.contains(";branch=z9hG4bK-t\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn response_echoes_dialog_headers() {
        let request = build_invite("sip:alice@ex.com", "z9hG4bK-t", "cid-t");
        let response = response_for(&request, 200, "OK");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains(";branch=z9hG4bK-t\r\n"));
        assert!(text.contains("Call-ID: cid-t\r\n"));
        assert!(text.contains("CSeq: 1 INVITE\r\n"));
        assert!(!text.contains("Max-Forwards"));
    }

    #[test]
    fn route_header_is_optional() {
        let with = build_invite_with_route(
            "sip:alice@ex.com",
            "z9hG4bK-r",
            "cid-r",
            "<sip:proxy.pcsf.com;ep=abc>",
        );
        assert!(std::str::from_utf8(&with)
            .unwrap()
            .contains("Route: <sip:proxy.pcsf.com;ep=abc>\r\n"));
        let without = build_invite("sip:alice@ex.com", "z9hG4bK-r", "cid-r");
        assert!(!std::str::from_utf8(&without).unwrap().contains("Route:"));
    }
}
