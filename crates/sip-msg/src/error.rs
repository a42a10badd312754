// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application-level proxy errors and their SIP status mapping.

/// Classification of a locally generated reply, used for response counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    Error,
    Exception,
}

/// Errors surfaced while decoding, routing, or forwarding a SIP message.
///
/// Every variant that is raised while a live metadata and downstream
/// connection exist is converted into a SIP status response; decode failures
/// before any headers parsed close the connection instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Malformed SIP: bad start-line, missing Via, broken header section.
    ProtocolError(String),
    /// Content-Length exceeds the configured cap.
    Oversize { limit: usize, actual: usize },
    /// No route entry matched the message domain.
    RouteMissing,
    /// The matched route names a cluster that does not exist.
    UnknownCluster(String),
    /// The cluster has no host that is healthy and acceptable.
    NoHealthyUpstream(String),
    /// The cluster is administratively drained.
    MaintenanceMode(String),
    /// The upstream TCP connect failed or timed out.
    UpstreamConnectFailed(String),
    /// An established upstream connection was reset mid-transaction.
    UpstreamReset,
    /// The traffic routing assistant could not be reached.
    TraUnavailable,
    /// The downstream connection closed before the reply could be written.
    DownstreamClosed,
}

impl AppError {
    /// SIP status code used when this error is answered with a local reply.
    pub fn status(&self) -> u16 {
        match self {
            AppError::ProtocolError(_) => 400,
            AppError::Oversize { .. } => 413,
            AppError::RouteMissing => 404,
            AppError::UnknownCluster(_)
            | AppError::NoHealthyUpstream(_)
            | AppError::MaintenanceMode(_)
            | AppError::UpstreamConnectFailed(_)
            | AppError::TraUnavailable => 503,
            AppError::UpstreamReset | AppError::DownstreamClosed => 500,
        }
    }

    /// Reason phrase paired with [`AppError::status`].
    pub fn reason(&self) -> &'static str {
        match self.status() {
            400 => "Bad Request",
            404 => "Not Found",
            413 => "Request Entity Too Large",
            503 => "Service Unavailable",
            _ => "Server Internal Error",
        }
    }

    /// Counter bucket for the local reply generated from this error.
    ///
    /// Decode-level failures count as exceptions, routing and upstream
    /// failures as plain error replies.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            AppError::ProtocolError(_) | AppError::Oversize { .. } => ResponseKind::Exception,
            _ => ResponseKind::Error,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::ProtocolError(detail) => write!(f, "protocol error: {}", detail),
            AppError::Oversize { limit, actual } => {
                write!(f, "message body of {} bytes exceeds cap of {}", actual, limit)
            }
            AppError::RouteMissing => write!(f, "no route matched"),
            AppError::UnknownCluster(name) => write!(f, "unknown cluster: {}", name),
            AppError::NoHealthyUpstream(name) => {
                write!(f, "no healthy upstream host in cluster {}", name)
            }
            AppError::MaintenanceMode(name) => {
                write!(f, "cluster {} is in maintenance mode", name)
            }
            AppError::UpstreamConnectFailed(detail) => {
                write!(f, "upstream connect failed: {}", detail)
            }
            AppError::UpstreamReset => write!(f, "upstream connection reset"),
            AppError::TraUnavailable => write!(f, "traffic routing assistant unavailable"),
            AppError::DownstreamClosed => write!(f, "downstream connection is closed"),
        }
    }
}

impl std::error::Error for AppError {}
