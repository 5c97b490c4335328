//! Refract mitm — inline TLS interception.
//!
//! A local TLS-terminating proxy the forwarder redirects TLS flows into.
//! It impersonates the real server toward the client with leaves signed by
//! a locally generated CA, speaks real TLS to the destination, and splices
//! decrypted bytes through the engine's filter hooks. Apps that pin their
//! certificates are exempted, statically via an allow-list and dynamically
//! after a failed handshake.

pub mod ca;
pub mod cert;
pub mod error;
pub mod pinning;
pub mod probe;
pub mod splice;
pub mod terminator;
pub mod verifier;

pub use ca::{InterceptCa, LeafKey};
pub use cert::DynamicCertResolver;
pub use error::{HandshakeLeg, MitmError, Result};
pub use pinning::{PinningEntry, PinningList};
pub use probe::{CertProbe, UpstreamIdentity};
pub use splice::splice;
pub use terminator::{FlowDirectory, InterceptPhase, OwningFlow, TlsTerminator};
pub use verifier::SkipServerVerification;
