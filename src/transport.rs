// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of transport failures into a closed set of categories.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Low-level cause of a failure while talking to a host (origin or proxy)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFault {
    Refused,
    Closed,
    NotFound,
    TimedOut,
    Canceled,
    /// The network went away; `transient` losses are expected to recover
    NetworkLost { transient: bool },
    Other,
}

/// Low-level cause of a failure at the protocol level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    UnknownScheme,
    InvalidOperation,
    Breakdown,
    ReSendFailed,
    Other,
}

/// A raw transport outcome, as reported by whatever performs the I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOutcome {
    /// Nothing went wrong. Classifying this is a caller bug.
    NoError,
    Connection(ConnectionFault),
    Proxy(ConnectionFault),
    Tls { retry_pending: bool },
    /// The server answered with this HTTP status
    Status(u16),
    Protocol(ProtocolFault),
}

/// Categorized transport failure.
///
/// Every variant carries exactly one display message, which doubles as the
/// lookup key for translated catalogs via [`TransportError::code`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportError {
    #[error("No error but error handler called (probably a bug)")]
    NoErrorButHandlerCalled,

    #[error("The remote server refused the connection")]
    ConnectionRefused,

    #[error("The remote server closed the connection prematurely")]
    RemoteHostClosed,

    #[error("The remote host name was not found")]
    RemoteHostNotFound,

    #[error("The connection to the remote server timed out")]
    Timeout,

    #[error("The operation was canceled")]
    OperationCanceled,

    #[error("The SSL/TLS handshake failed")]
    SslHandshakeFailed,

    #[error("Error in ssl session initialization when handling a request")]
    SslSessionInitFailed,

    #[error("{}", disconnected_message(*retryable))]
    Disconnected { retryable: bool },

    #[error("The connection to the proxy server was refused")]
    ProxyConnectionRefused,

    #[error("The proxy server closed the connection prematurely")]
    ProxyConnectionClosed,

    #[error("The proxy host name was not found")]
    ProxyHostNotFound,

    #[error("The connection to the proxy timed out")]
    ProxyTimeout,

    #[error("The proxy requires authentication")]
    ProxyAuthRequired,

    #[error("The access to the remote content was denied")]
    AccessDenied,

    #[error("The operation requested is not permitted")]
    OperationNotPermitted,

    #[error("The remote content was not found")]
    ContentNotFound,

    #[error("Authentication failed")]
    AuthenticationRequired,

    #[error("The request needed to be sent again, but this failed")]
    ContentReSendFailed,

    #[error("Conflict with the current state of the resource")]
    Conflict,

    #[error("The requested resource is no longer available")]
    Gone,

    #[error("Internal server error")]
    InternalServerError,

    #[error("The server does not support the functionality required")]
    OperationNotSupported,

    #[error("The server is unable to handle the request at this time")]
    ServiceUnavailable,

    #[error("Unknown protocol")]
    ProtocolUnknown,

    #[error("The requested operation is invalid for this protocol")]
    ProtocolInvalidOperation,

    #[error("A breakdown in protocol was detected")]
    ProtocolFailure,

    #[error("Unknown network-related error")]
    UnknownNetworkError,

    #[error("Unknown proxy-related error")]
    UnknownProxyError,

    #[error("Unknown error related to the remote content")]
    UnknownContentError,

    #[error("Unknown error related to the server response")]
    UnknownServerError,

    #[error("Unknown protocol-related error")]
    UnknownProtocolError,
}

fn disconnected_message(retryable: bool) -> &'static str {
    if retryable {
        "The connection was broken due to disconnection from the network (connection will be retried automatically)"
    } else {
        "The connection was broken due to disconnection from the network"
    }
}

/// Map a raw outcome to its category. Pure; never panics.
pub fn classify(outcome: &RawOutcome) -> TransportError {
    match *outcome {
        RawOutcome::NoError => TransportError::NoErrorButHandlerCalled,
        RawOutcome::Connection(fault) => match fault {
            ConnectionFault::Refused => TransportError::ConnectionRefused,
            ConnectionFault::Closed => TransportError::RemoteHostClosed,
            ConnectionFault::NotFound => TransportError::RemoteHostNotFound,
            ConnectionFault::TimedOut => TransportError::Timeout,
            ConnectionFault::Canceled => TransportError::OperationCanceled,
            ConnectionFault::NetworkLost { transient } => TransportError::Disconnected {
                retryable: transient,
            },
            ConnectionFault::Other => TransportError::UnknownNetworkError,
        },
        RawOutcome::Proxy(fault) => match fault {
            ConnectionFault::Refused => TransportError::ProxyConnectionRefused,
            ConnectionFault::Closed => TransportError::ProxyConnectionClosed,
            ConnectionFault::NotFound => TransportError::ProxyHostNotFound,
            ConnectionFault::TimedOut => TransportError::ProxyTimeout,
            ConnectionFault::Canceled => TransportError::OperationCanceled,
            ConnectionFault::NetworkLost { transient } => TransportError::Disconnected {
                retryable: transient,
            },
            ConnectionFault::Other => TransportError::UnknownProxyError,
        },
        RawOutcome::Tls { retry_pending } => {
            if retry_pending {
                TransportError::SslSessionInitFailed
            } else {
                TransportError::SslHandshakeFailed
            }
        }
        RawOutcome::Status(code) => classify_status(code),
        RawOutcome::Protocol(fault) => match fault {
            ProtocolFault::UnknownScheme => TransportError::ProtocolUnknown,
            ProtocolFault::InvalidOperation => TransportError::ProtocolInvalidOperation,
            ProtocolFault::Breakdown => TransportError::ProtocolFailure,
            ProtocolFault::ReSendFailed => TransportError::ContentReSendFailed,
            ProtocolFault::Other => TransportError::UnknownProtocolError,
        },
    }
}

fn classify_status(code: u16) -> TransportError {
    match code {
        200..=299 => TransportError::NoErrorButHandlerCalled,
        401 => TransportError::AuthenticationRequired,
        403 => TransportError::AccessDenied,
        404 => TransportError::ContentNotFound,
        405 => TransportError::OperationNotPermitted,
        407 => TransportError::ProxyAuthRequired,
        409 => TransportError::Conflict,
        410 => TransportError::Gone,
        500 => TransportError::InternalServerError,
        501 => TransportError::OperationNotSupported,
        503 => TransportError::ServiceUnavailable,
        400..=499 => TransportError::UnknownContentError,
        500..=599 => TransportError::UnknownServerError,
        _ => TransportError::UnknownProtocolError,
    }
}

impl TransportError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        classify(&RawOutcome::Status(status))
    }

    /// Classify an error reported by reqwest
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        classify(&raw_outcome_of(error))
    }

    /// Only a transient disconnection may be retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Disconnected { retryable: true })
    }

    /// The remote could not be reached at all, as opposed to answering with an error
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::RemoteHostNotFound
                | TransportError::RemoteHostClosed
                | TransportError::Timeout
                | TransportError::Disconnected { .. }
                | TransportError::ProxyHostNotFound
                | TransportError::ProxyConnectionClosed
                | TransportError::ProxyTimeout
                | TransportError::UnknownNetworkError
                | TransportError::UnknownProxyError
        )
    }

    /// Stable key identifying the category, for message catalogs
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NoErrorButHandlerCalled => "no_error_but_handler_called",
            TransportError::ConnectionRefused => "connection_refused",
            TransportError::RemoteHostClosed => "remote_host_closed",
            TransportError::RemoteHostNotFound => "remote_host_not_found",
            TransportError::Timeout => "timeout",
            TransportError::OperationCanceled => "operation_canceled",
            TransportError::SslHandshakeFailed => "ssl_handshake_failed",
            TransportError::SslSessionInitFailed => "ssl_session_init_failed",
            TransportError::Disconnected { retryable: true } => "disconnected_retryable",
            TransportError::Disconnected { retryable: false } => "disconnected",
            TransportError::ProxyConnectionRefused => "proxy_connection_refused",
            TransportError::ProxyConnectionClosed => "proxy_connection_closed",
            TransportError::ProxyHostNotFound => "proxy_host_not_found",
            TransportError::ProxyTimeout => "proxy_timeout",
            TransportError::ProxyAuthRequired => "proxy_auth_required",
            TransportError::AccessDenied => "access_denied",
            TransportError::OperationNotPermitted => "operation_not_permitted",
            TransportError::ContentNotFound => "content_not_found",
            TransportError::AuthenticationRequired => "authentication_required",
            TransportError::ContentReSendFailed => "content_resend_failed",
            TransportError::Conflict => "conflict",
            TransportError::Gone => "gone",
            TransportError::InternalServerError => "internal_server_error",
            TransportError::OperationNotSupported => "operation_not_supported",
            TransportError::ServiceUnavailable => "service_unavailable",
            TransportError::ProtocolUnknown => "protocol_unknown",
            TransportError::ProtocolInvalidOperation => "protocol_invalid_operation",
            TransportError::ProtocolFailure => "protocol_failure",
            TransportError::UnknownNetworkError => "unknown_network_error",
            TransportError::UnknownProxyError => "unknown_proxy_error",
            TransportError::UnknownContentError => "unknown_content_error",
            TransportError::UnknownServerError => "unknown_server_error",
            TransportError::UnknownProtocolError => "unknown_protocol_error",
        }
    }
}

fn raw_outcome_of(error: &reqwest::Error) -> RawOutcome {
    if let Some(status) = error.status() {
        return RawOutcome::Status(status.as_u16());
    }
    if error.is_builder() {
        return RawOutcome::Protocol(ProtocolFault::UnknownScheme);
    }
    if error.is_redirect() {
        return RawOutcome::Protocol(ProtocolFault::InvalidOperation);
    }
    if error.is_timeout() {
        return RawOutcome::Connection(ConnectionFault::TimedOut);
    }
    if error.is_connect() {
        if mentions_tls(error) {
            return RawOutcome::Tls {
                retry_pending: false,
            };
        }
        if mentions_dns(error) {
            return RawOutcome::Connection(ConnectionFault::NotFound);
        }
        return match find_io_kind(error) {
            Some(kind) => RawOutcome::Connection(fault_from_io_kind(kind)),
            None => RawOutcome::Connection(ConnectionFault::Other),
        };
    }
    if error.is_body() || error.is_decode() || error.is_request() {
        return match find_io_kind(error) {
            Some(kind) => RawOutcome::Connection(fault_from_io_kind(kind)),
            None if error.is_decode() => RawOutcome::Protocol(ProtocolFault::Breakdown),
            None => RawOutcome::Connection(ConnectionFault::NetworkLost { transient: true }),
        };
    }
    RawOutcome::Connection(ConnectionFault::Other)
}

/// Map an I/O error kind to the connection fault it represents
pub fn fault_from_io_kind(kind: io::ErrorKind) -> ConnectionFault {
    match kind {
        io::ErrorKind::ConnectionRefused => ConnectionFault::Refused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            ConnectionFault::Closed
        }
        io::ErrorKind::TimedOut => ConnectionFault::TimedOut,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => {
            ConnectionFault::NetworkLost { transient: true }
        }
        io::ErrorKind::NotConnected
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkDown => ConnectionFault::NetworkLost { transient: false },
        io::ErrorKind::AddrNotAvailable => ConnectionFault::NotFound,
        _ => ConnectionFault::Other,
    }
}

fn source_chain(error: &reqwest::Error) -> impl Iterator<Item = &(dyn StdError + 'static)> {
    std::iter::successors(error.source(), |&e| e.source())
}

fn find_io_kind(error: &reqwest::Error) -> Option<io::ErrorKind> {
    source_chain(error)
        .find_map(|e| e.downcast_ref::<io::Error>())
        .map(io::Error::kind)
}

const DNS_MARKERS: &[&str] = &["dns error", "failed to lookup address"];
const TLS_MARKERS: &[&str] = &["certificate", "handshake", "tls"];

fn mentions_dns(error: &reqwest::Error) -> bool {
    chain_mentions(source_chain(error), DNS_MARKERS)
}

fn mentions_tls(error: &reqwest::Error) -> bool {
    chain_mentions(source_chain(error), TLS_MARKERS)
}

/// Whether any error in the chain names one of `markers`, ignoring case
fn chain_mentions<'a>(
    mut chain: impl Iterator<Item = &'a (dyn StdError + 'static)>,
    markers: &[&str],
) -> bool {
    chain.any(|e| {
        let text = e.to_string().to_lowercase();
        markers.iter().any(|marker| text.contains(marker))
    })
}
