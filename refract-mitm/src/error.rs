use std::fmt;
use thiserror::Error;

/// Which leg of the double handshake failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeLeg {
    /// Probe handshake used only to read the real server's certificate
    Probe,
    /// Server-side handshake impersonating the real host to the client
    Client,
    /// Client-side handshake to the real server
    Server,
}

impl fmt::Display for HandshakeLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe => write!(f, "probe"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MitmError {
    #[error("CA error: {0}")]
    Ca(String),

    #[error("Certificate error: {0}")]
    Cert(String),

    #[error("Handshake failed ({leg}): {message}")]
    Handshake { leg: HandshakeLeg, message: String },

    #[error("No flow registered for local port {0}")]
    FlowNotFound(u16),

    #[error("Invalid pinning list: {0}")]
    Pinning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    pub fn handshake<S: Into<String>>(leg: HandshakeLeg, message: S) -> Self {
        Self::Handshake {
            leg,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MitmError>;
