//! Error classification for relay teardown
//!
//! Half-closing one direction makes the other direction observe a closed
//! stream sooner or later. Those errors are the normal end of a circuit and
//! must not be reported as failures. The decision is made on structured
//! error values, never on message text.

use crate::constants::CLOSE_OK;
use quinn::{ConnectionError, ReadError, VarInt, WriteError};
use std::io;

/// How an error seen while relaying should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The connection was already being closed; not worth reporting.
    Expected,
    /// A genuine bridge failure.
    Failure,
}

/// Classify an I/O error raised by a relay direction or a close
pub fn classify(err: &io::Error) -> Teardown {
    if let Some(inner) = err.get_ref() {
        if let Some(read) = inner.downcast_ref::<ReadError>() {
            return classify_read(read);
        }
        if let Some(write) = inner.downcast_ref::<WriteError>() {
            return classify_write(write);
        }
        if let Some(conn) = inner.downcast_ref::<ConnectionError>() {
            return classify_connection(conn);
        }
    }

    match err.kind() {
        io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Teardown::Expected,
        _ => Teardown::Failure,
    }
}

fn classify_read(err: &ReadError) -> Teardown {
    match err {
        // Peer abandoned its send side
        ReadError::Reset(_) => Teardown::Expected,
        ReadError::ClosedStream => Teardown::Expected,
        ReadError::ConnectionLost(conn) => classify_connection(conn),
        _ => Teardown::Failure,
    }
}

fn classify_write(err: &WriteError) -> Teardown {
    match err {
        // Peer no longer reads this stream
        WriteError::Stopped(_) => Teardown::Expected,
        WriteError::ClosedStream => Teardown::Expected,
        WriteError::ConnectionLost(conn) => classify_connection(conn),
        _ => Teardown::Failure,
    }
}

fn classify_connection(err: &ConnectionError) -> Teardown {
    match err {
        ConnectionError::LocallyClosed => Teardown::Expected,
        // Any other code is the peer refusing or aborting the circuit
        ConnectionError::ApplicationClosed(close) if close.error_code == VarInt::from_u32(CLOSE_OK) => {
            Teardown::Expected
        }
        _ => Teardown::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLOSE_UPSTREAM_UNREACHABLE;
    use quinn::ApplicationClose;

    fn application_closed(code: u32, reason: &'static str) -> ConnectionError {
        ConnectionError::ApplicationClosed(ApplicationClose {
            error_code: VarInt::from_u32(code),
            reason: reason.into(),
        })
    }

    #[test]
    fn test_closed_socket_kinds_are_expected() {
        for kind in [
            io::ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert_eq!(classify(&io::Error::from(kind)), Teardown::Expected, "{:?}", kind);
        }
    }

    #[test]
    fn test_other_kinds_are_failures() {
        for kind in [
            io::ErrorKind::TimedOut,
            io::ErrorKind::InvalidData,
            io::ErrorKind::Other,
            io::ErrorKind::PermissionDenied,
        ] {
            assert_eq!(classify(&io::Error::from(kind)), Teardown::Failure, "{:?}", kind);
        }
    }

    #[test]
    fn test_message_text_is_ignored() {
        let err = io::Error::new(io::ErrorKind::Other, "use of closed network connection");
        assert_eq!(classify(&err), Teardown::Failure);
    }

    #[test]
    fn test_quinn_local_close_is_expected() {
        let err: io::Error = ReadError::ConnectionLost(ConnectionError::LocallyClosed).into();
        assert_eq!(classify(&err), Teardown::Expected);

        let err: io::Error = WriteError::ClosedStream.into();
        assert_eq!(classify(&err), Teardown::Expected);

        let err: io::Error = WriteError::Stopped(VarInt::from_u32(0)).into();
        assert_eq!(classify(&err), Teardown::Expected);

        let err: io::Error = ReadError::Reset(VarInt::from_u32(0)).into();
        assert_eq!(classify(&err), Teardown::Expected);
    }

    #[test]
    fn test_quinn_timeout_is_failure_despite_not_connected_kind() {
        let err: io::Error = ReadError::ConnectionLost(ConnectionError::TimedOut).into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(classify(&err), Teardown::Failure);

        let err: io::Error = WriteError::ConnectionLost(ConnectionError::Reset).into();
        assert_eq!(classify(&err), Teardown::Failure);
    }

    #[test]
    fn test_peer_close_with_ok_code_is_expected() {
        let err: io::Error = ReadError::ConnectionLost(application_closed(CLOSE_OK, "")).into();
        assert_eq!(classify(&err), Teardown::Expected);

        let err: io::Error = WriteError::ConnectionLost(application_closed(CLOSE_OK, "")).into();
        assert_eq!(classify(&err), Teardown::Expected);
    }

    #[test]
    fn test_refused_circuit_is_failure() {
        let refused = application_closed(CLOSE_UPSTREAM_UNREACHABLE, "upstream unreachable");
        let err: io::Error = ReadError::ConnectionLost(refused.clone()).into();
        assert_eq!(classify(&err), Teardown::Failure);

        let err: io::Error = WriteError::ConnectionLost(refused).into();
        assert_eq!(classify(&err), Teardown::Failure);
    }
}
