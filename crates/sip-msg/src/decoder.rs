// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stream framing and header extraction.
//!
//! [`drain_frames`] splits buffered TCP data into complete SIP messages using
//! CRLF-delimited headers and Content-Length framing, tolerating partial
//! input and RFC 5626 keep-alive CRLFs. [`parse_message`] turns one complete
//! frame into a [`MessageMetadata`] whose fields are spans into the frame.

use bytes::{Buf, Bytes, BytesMut};
use smol_str::SmolStr;
use tracing::warn;

use crate::error::AppError;
use crate::metadata::{EpSlot, MessageMetadata, Method, MsgKind, Span};

/// Maximum size of SIP headers before the empty line (64 KB).
/// Protects against unbounded header growth from peers that never send the
/// header terminator.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Default cap on Content-Length (1 MB). Exceeding the configured cap
/// surfaces as [`AppError::Oversize`].
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Framing limits applied while splitting the stream into messages.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Knobs consulted while extracting fields from a message.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// When set, a top-Route URI parameter with this name supplies the
    /// domain the route table matches against.
    pub domain_match_param: Option<SmolStr>,
}

/// Splits buffered stream data into complete SIP messages.
///
/// Returns all complete frames and leaves partial input in `buf` untouched,
/// to be re-entered when more data arrives. Leading CRLF keep-alive bytes
/// between messages are consumed and discarded.
pub fn drain_frames(buf: &mut BytesMut, limits: &FrameLimits) -> Result<Vec<Bytes>, AppError> {
    let mut frames = Vec::new();
    loop {
        consume_leading_crlf(buf);
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if buf.len() > limits.max_header_bytes {
                    return Err(AppError::ProtocolError(format!(
                        "header section exceeds {} bytes without terminator",
                        limits.max_header_bytes
                    )));
                }
                break;
            }
        };

        if head_end > limits.max_header_bytes {
            return Err(AppError::ProtocolError(format!(
                "header section is {} bytes, cap is {}",
                head_end, limits.max_header_bytes
            )));
        }

        let content_length = parse_content_length(&buf[..head_end])?;
        if let Some(cl) = content_length {
            if cl > limits.max_body_bytes {
                return Err(AppError::Oversize {
                    limit: limits.max_body_bytes,
                    actual: cl,
                });
            }
        }

        // Content-Length is mandatory on stream transports (RFC 3261 §18.3);
        // a missing header is treated as a zero-length body.
        let body_length = content_length.unwrap_or_else(|| {
            warn!("message without Content-Length on stream transport, assuming empty body");
            0
        });

        let needed = head_end + 4 + body_length;
        if buf.len() < needed {
            break;
        }

        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn consume_leading_crlf(buf: &mut BytesMut) {
    while buf.starts_with(b"\r\n") || buf.starts_with(b"\n") || buf.starts_with(b"\r") {
        let n = if buf.starts_with(b"\r\n") { 2 } else { 1 };
        buf.advance(n);
    }
}

fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, AppError> {
    let mut found: Option<usize> = None;
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        // "l" is the compact form of Content-Length (RFC 3261 §7.3.3)
        if !ascii_eq_ignore_case(name, b"content-length") && !ascii_eq_ignore_case(name, b"l") {
            continue;
        }
        let value = trim_ascii(&line[colon + 1..]);
        let parsed = parse_ascii_usize(value)?;
        match found {
            Some(existing) if existing != parsed => {
                return Err(AppError::ProtocolError(
                    "conflicting Content-Length headers".into(),
                ));
            }
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = input.len();
    while start < end && input[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && input[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &input[start..end]
}

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn parse_ascii_usize(value: &[u8]) -> Result<usize, AppError> {
    if value.is_empty() {
        return Err(AppError::ProtocolError("empty Content-Length value".into()));
    }
    let mut acc: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(AppError::ProtocolError(
                "Content-Length contains non-digit characters".into(),
            ));
        }
        acc = acc
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or_else(|| AppError::ProtocolError("Content-Length overflows".into()))?;
    }
    Ok(acc)
}

/// Parses one complete frame into message metadata.
///
/// Extracts the start line, topmost Via and its `branch` token, the top Route
/// with its `ep`/`opaque`/`p-cookie` parameters, the matching domain, and the
/// dialog headers echoed into local replies. A request or response without a
/// topmost Via carrying a branch is a protocol error.
pub fn parse_message(raw: Bytes, opts: &ParseOptions) -> Result<MessageMetadata, AppError> {
    let head_end = memchr::memmem::find(raw.as_ref(), b"\r\n\r\n")
        .ok_or_else(|| AppError::ProtocolError("message has no header terminator".into()))?;
    let head = std::str::from_utf8(&raw[..head_end])
        .map_err(|_| AppError::ProtocolError("header section is not valid UTF-8".into()))?;

    let mut lines = head.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| AppError::ProtocolError("empty message".into()))?;

    let mut meta;
    if first.len() >= 7 && first[..7].eq_ignore_ascii_case("SIP/2.0") {
        let code = parse_status_line(first)
            .ok_or_else(|| AppError::ProtocolError(format!("malformed status line: {}", first)))?;
        meta = MessageMetadata::new(raw.clone(), MsgKind::Response);
        meta.status = Some(code);
    } else {
        let (method, uri_off, uri_len) = parse_request_line(first)
            .ok_or_else(|| AppError::ProtocolError(format!("malformed request line: {}", first)))?;
        meta = MessageMetadata::new(raw.clone(), MsgKind::Request);
        meta.method = Some(method);
        meta.request_uri = Some(Span::of(uri_off, uri_len));
    }

    let mut offset = first.len() + 2;
    for line in lines {
        let line_start = offset;
        offset += line.len() + 2;
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.find(':') else {
            continue;
        };
        let name = line[..colon].trim();
        let value_raw = &line[colon + 1..];
        let ltrim = value_raw.len() - value_raw.trim_start().len();
        let value = value_raw.trim();
        let value_span = Span::of(line_start + colon + 1 + ltrim, value.len());

        if (name.eq_ignore_ascii_case("Via") || name.eq_ignore_ascii_case("v"))
            && meta.top_via.is_none()
        {
            meta.top_via = Some(value_span);
            meta.transaction_id = branch_span(value, value_span.start);
        } else if name.eq_ignore_ascii_case("Route") && meta.top_route.is_none() {
            meta.top_route = Some(value_span);
            scan_route(&mut meta, value, value_span, opts);
        } else if (name.eq_ignore_ascii_case("From") || name.eq_ignore_ascii_case("f"))
            && meta.from_header.is_none()
        {
            meta.from_header = Some(value_span);
        } else if (name.eq_ignore_ascii_case("To") || name.eq_ignore_ascii_case("t"))
            && meta.to_header.is_none()
        {
            meta.to_header = Some(value_span);
        } else if (name.eq_ignore_ascii_case("Call-ID") || name.eq_ignore_ascii_case("i"))
            && meta.call_id.is_none()
        {
            meta.call_id = Some(value_span);
        } else if name.eq_ignore_ascii_case("CSeq") && meta.cseq.is_none() {
            meta.cseq = Some(value_span);
            if let Some(token) = value.split_ascii_whitespace().nth(1) {
                meta.resp_method = Some(Method::from_token(token));
            }
        }
    }

    let Some(via_span) = meta.top_via else {
        return Err(AppError::ProtocolError("missing Via header".into()));
    };
    if meta.transaction_id.is_none() {
        return Err(AppError::ProtocolError(
            "top Via has no branch parameter".into(),
        ));
    }

    if meta.ep_slot.is_none() {
        let via = via_span.slice(&raw);
        meta.ep_slot = Some(match param_value_span(via, via_span.start, "ep") {
            Some(span) => EpSlot::ReplaceValue(span),
            None => EpSlot::InsertAt(via_span.end()),
        });
    }

    if meta.domain.is_none() {
        if let Some(uri_span) = meta.request_uri {
            meta.domain = host_span_of_uri(uri_span.slice(&raw), uri_span.start);
        }
    }

    Ok(meta)
}

/// Extracts the `branch` token from a Via header value: the substring after
/// `branch=` up to the next `;`, `>`, or the end of the value.
fn branch_span(via: &str, via_start: usize) -> Option<Span> {
    let start = via.find("branch=")? + "branch=".len();
    let rest = &via[start..];
    let len = rest.find(|c| c == ';' || c == '>').unwrap_or(rest.len());
    (len > 0).then(|| Span::of(via_start + start, len))
}

/// Finds a `name=value` parameter in a `;`-separated value and returns the
/// span of its value.
fn param_value_span(value: &str, value_start: usize, name: &str) -> Option<Span> {
    let mut idx = value.find(';')? + 1;
    while idx < value.len() {
        let rest = &value[idx..];
        let seg_len = rest.find(';').unwrap_or(rest.len());
        let seg = &rest[..seg_len];
        if let Some(eq) = seg.find('=') {
            if seg[..eq].trim().eq_ignore_ascii_case(name) {
                let v = seg[eq + 1..].trim_end_matches('>');
                return Some(Span::of(value_start + idx + eq + 1, v.len()));
            }
        }
        idx += seg_len + 1;
    }
    None
}

/// Extracts the URI region of a Route header value, its host, and the proxy
/// parameters carried on it.
fn scan_route(meta: &mut MessageMetadata, value: &str, value_span: Span, opts: &ParseOptions) {
    let (uri_rel, uri_end_rel) = match value.find('<') {
        Some(lt) => {
            let gt = value[lt..].find('>').map(|g| lt + g).unwrap_or(value.len());
            (lt + 1, gt)
        }
        None => (0, value.find(',').unwrap_or(value.len())),
    };
    let uri = &value[uri_rel..uri_end_rel];
    let uri_start = value_span.start + uri_rel;

    let route_domain = host_span_of_uri(uri, uri_start);

    let mut ep = None;
    let mut opaque = None;
    let mut p_cookie = None;
    let mut matched_domain = None;
    scan_uri_params(uri, uri_start, |name, span| {
        if name.eq_ignore_ascii_case("ep") {
            ep.get_or_insert(span);
        } else if name.eq_ignore_ascii_case("opaque") {
            opaque.get_or_insert(span);
        } else if name.eq_ignore_ascii_case("p-cookie") {
            p_cookie.get_or_insert(span);
        }
        if let Some(param) = &opts.domain_match_param {
            if name.eq_ignore_ascii_case(param) {
                matched_domain.get_or_insert(span);
            }
        }
    });

    meta.route_ep = ep;
    meta.route_opaque = opaque;
    meta.p_cookie = p_cookie;
    meta.domain = matched_domain.or(route_domain);
    meta.ep_slot = Some(match ep {
        Some(span) => EpSlot::ReplaceValue(span),
        None => EpSlot::InsertAt(uri_start + uri.len()),
    });
}

fn scan_uri_params(uri: &str, uri_start: usize, mut f: impl FnMut(&str, Span)) {
    let Some(first) = uri.find(';') else {
        return;
    };
    let mut idx = first + 1;
    while idx < uri.len() {
        let rest = &uri[idx..];
        let seg_len = rest.find(';').unwrap_or(rest.len());
        let seg = &rest[..seg_len];
        match seg.find('=') {
            Some(eq) => {
                let v = &seg[eq + 1..];
                f(seg[..eq].trim(), Span::of(uri_start + idx + eq + 1, v.len()));
            }
            None => f(seg.trim(), Span::of(uri_start + idx + seg_len, 0)),
        }
        idx += seg_len + 1;
    }
}

/// Span of the host portion of a SIP URI: after the scheme and userinfo, up
/// to the port, parameters, or end.
fn host_span_of_uri(uri: &str, uri_start: usize) -> Option<Span> {
    let after_scheme = if uri.len() >= 5 && uri[..5].eq_ignore_ascii_case("sips:") {
        5
    } else if uri.len() >= 4 && uri[..4].eq_ignore_ascii_case("sip:") {
        4
    } else {
        0
    };
    let rest = &uri[after_scheme..];
    let params_at = rest.find(';').unwrap_or(rest.len());
    let host_rel = match rest[..params_at].find('@') {
        Some(at) => at + 1,
        None => 0,
    };
    let host_area = &rest[host_rel..];
    let len = host_area
        .find(|c| c == ':' || c == ';' || c == '?' || c == '>')
        .unwrap_or(host_area.len());
    (len > 0).then(|| Span::of(uri_start + after_scheme + host_rel, len))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}

/// Parses a request line, returning the method and the URI's offset within
/// the line.
fn parse_request_line(line: &str) -> Option<(Method, usize, usize)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line).ok()?;
    if !version_token.trim().eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    let uri_off = uri_token.as_ptr() as usize - line.as_ptr() as usize;
    Some((Method::from_token(method_token), uri_off, uri_token.len()))
}

fn parse_status_line(line: &str) -> Option<u16> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, _)) = parser(line).ok()?;
    (100..700).contains(&code).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP d.example.com;branch=z9hG4bK-1\r\n\
        From: <sip:bob@d.example.com>;tag=99\r\n\
        To: <sip:alice@ex.com>\r\n\
        Call-ID: cid-1@d.example.com\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn drains_multiple_frames_and_bodies() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let payload = [msg1.as_slice(), msg2.as_slice()].concat();
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn leaves_partial_body_in_buffer() {
        let payload = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn leaves_partial_headers_in_buffer() {
        let payload = b"INVITE sip:a SIP/2.0\r\nVia: SIP/2.0/TCP d;br";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn strips_crlf_keepalives() {
        let msg = b"\r\n\r\nOPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_body_is_rejected() {
        let limits = FrameLimits {
            max_body_bytes: 16,
            ..Default::default()
        };
        let msg = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 17\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let err = drain_frames(&mut buf, &limits).unwrap_err();
        assert_eq!(
            err,
            AppError::Oversize {
                limit: 16,
                actual: 17
            }
        );
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        assert!(drain_frames(&mut buf, &FrameLimits::default()).is_err());
    }

    #[test]
    fn compact_content_length_frames_body() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nl: 4\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), msg.as_slice());
    }

    #[test]
    fn parses_invite_fields() {
        let meta = parse_message(Bytes::from_static(INVITE), &ParseOptions::default()).unwrap();
        assert_eq!(meta.kind(), MsgKind::Request);
        assert_eq!(meta.method().map(Method::as_str), Some("INVITE"));
        assert_eq!(meta.request_uri(), Some("sip:alice@ex.com"));
        assert_eq!(meta.transaction_id(), Some("z9hG4bK-1"));
        assert_eq!(meta.domain(), Some("ex.com"));
        assert_eq!(meta.call_id(), Some("cid-1@d.example.com"));
        assert_eq!(meta.cseq(), Some("1 INVITE"));
        assert_eq!(meta.from_header(), Some("<sip:bob@d.example.com>;tag=99"));
    }

    #[test]
    fn branch_ends_at_semicolon_or_gt() {
        assert_eq!(
            branch_span("SIP/2.0/TCP d;branch=abc;rport", 0).map(|s| s.len),
            Some(3)
        );
        assert_eq!(
            branch_span("SIP/2.0/TCP d;branch=abc>", 0).map(|s| s.len),
            Some(3)
        );
        assert_eq!(
            branch_span("SIP/2.0/TCP d;branch=abc", 0).map(|s| s.len),
            Some(3)
        );
        assert!(branch_span("SIP/2.0/TCP d;rport", 0).is_none());
    }

    #[test]
    fn parses_route_params() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-2\r\n\
            Route: <sip:proxy.pcsf.com;ep=abc;opaque=xyz;p-cookie=ck1>\r\n\
            Content-Length: 0\r\n\r\n";
        let meta =
            parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap();
        assert_eq!(meta.route_ep(), Some("abc"));
        assert_eq!(meta.route_opaque(), Some("xyz"));
        assert_eq!(meta.p_cookie(), Some("ck1"));
        assert_eq!(meta.domain(), Some("proxy.pcsf.com"));
        assert_eq!(meta.top_route(), Some("<sip:proxy.pcsf.com;ep=abc;opaque=xyz;p-cookie=ck1>"));
    }

    #[test]
    fn domain_match_parameter_overrides_route_host() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-3\r\n\
            Route: <sip:proxy.pcsf.com;x-suri=sip.ims.net>\r\n\
            Content-Length: 0\r\n\r\n";
        let opts = ParseOptions {
            domain_match_param: Some("x-suri".into()),
        };
        let meta = parse_message(Bytes::copy_from_slice(raw), &opts).unwrap();
        assert_eq!(meta.domain(), Some("sip.ims.net"));
    }

    #[test]
    fn parses_response_with_cseq_echo() {
        let raw = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/TCP d;branch=z9hG4bK-1\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let meta =
            parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap();
        assert_eq!(meta.kind(), MsgKind::Response);
        assert_eq!(meta.status(), Some(200));
        assert_eq!(meta.resp_method().map(Method::as_str), Some("INVITE"));
        assert_eq!(meta.transaction_id(), Some("z9hG4bK-1"));
    }

    #[test]
    fn missing_via_is_a_protocol_error() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let err =
            parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }

    #[test]
    fn via_without_branch_is_a_protocol_error() {
        let raw = b"INVITE sip:alice@ex.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP d.example.com\r\n\
            Content-Length: 0\r\n\r\n";
        let err =
            parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }

    #[test]
    fn malformed_start_line_is_a_protocol_error() {
        let raw = b"NOT A SIP LINE\r\nVia: SIP/2.0/TCP d;branch=b\r\n\r\n";
        let err =
            parse_message(Bytes::copy_from_slice(raw), &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }

    #[test]
    fn host_span_skips_scheme_user_and_port() {
        let uri = "sip:alice@ex.com:5060;transport=tcp";
        let span = host_span_of_uri(uri, 0).unwrap();
        assert_eq!(span.slice(uri.as_bytes()), "ex.com");
    }
}
