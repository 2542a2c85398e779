use std::fmt;
use std::io;

use fwlink::rssi::RssiError;
use fwlink::srp::SrpError;
use fwlink::stream::StreamError;
use fwlink::StackError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DEVICE_ERROR: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn stream_error(context: &str, err: StreamError) -> CliError {
    match err {
        StreamError::Io(source) => io_error(context, source),
        StreamError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        StreamError::ConnectionClosed | StreamError::Cancelled => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        StreamError::Boundary { .. }
        | StreamError::InvalidMagic
        | StreamError::FrameTooLarge { .. }
        | StreamError::Protocol(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn rssi_error(context: &str, err: RssiError) -> CliError {
    match err {
        RssiError::Stream(err) => stream_error(context, err),
        RssiError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        RssiError::Closed(_) | RssiError::NotConnected => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        RssiError::SegmentTooLarge { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn srp_error(context: &str, err: SrpError) -> CliError {
    match err {
        SrpError::Stream(err) => stream_error(context, err),
        SrpError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SrpError::Status(_) => CliError::new(DEVICE_ERROR, format!("{context}: {err}")),
        SrpError::UnsupportedAlignment { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn stack_error(context: &str, err: StackError) -> CliError {
    match err {
        StackError::Stream(err) => stream_error(context, err),
        StackError::Rssi(err) => rssi_error(context, err),
        StackError::Srp(err) => srp_error(context, err),
        StackError::Packetizer(err) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = stack_error("read", StackError::Srp(SrpError::Timeout(Duration::from_secs(1))));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("read: "));
    }

    #[test]
    fn device_status_has_its_own_code() {
        assert_eq!(srp_error("write", SrpError::Status(1)).code, DEVICE_ERROR);
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let err = io_error("connect", io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.code, TRANSPORT_ERROR);
    }
}
