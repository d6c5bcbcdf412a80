// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArgument,
    InvalidConfig,
    InvalidDhcpMessage,
    InvalidCommand,
    /// The requested listen address is not assigned on this host.
    AddressNotAvailable,
    BindFailed,
    NotConnected,
    Timeout,
    Bug,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::InvalidArgument => "invalid_argument",
                Self::InvalidConfig => "invalid_config",
                Self::InvalidDhcpMessage => "invalid_dhcp_message",
                Self::InvalidCommand => "invalid_command",
                Self::AddressNotAvailable => "address_not_available",
                Self::BindFailed => "bind_failed",
                Self::NotConnected => "not_connected",
                Self::Timeout => "timeout",
                Self::Bug => "bug",
            }
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VleaseError {
    kind: ErrorKind,
    msg: String,
}

impl VleaseError {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        self.msg.as_str()
    }
}

impl std::fmt::Display for VleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for VleaseError {}

impl From<std::io::Error> for VleaseError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Bug, format!("IO error: {e}"))
    }
}

impl From<nix::errno::Errno> for VleaseError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::new(ErrorKind::Bug, format!("System error: {e}"))
    }
}

impl From<std::ffi::NulError> for VleaseError {
    fn from(e: std::ffi::NulError) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            format!("String contains NUL byte: {e}"),
        )
    }
}

impl From<serde_json::Error> for VleaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidCommand, format!("Invalid JSON: {e}"))
    }
}

pub(crate) trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T, VleaseError>;
}

impl<T> ErrorContext<T> for Result<T, VleaseError> {
    fn context(self, msg: &str) -> Result<T, VleaseError> {
        self.map_err(|e| {
            VleaseError::new(e.kind, format!("{}: {}", msg, e.msg))
        })
    }
}
