//! Console automation over a machine's serial console.
//!
//! A [`ConsoleSession`] owns one [`ConsoleTransport`] and advances through
//! [`ConsolePhase`]s by waiting for a marker, then sending input lines.

pub mod session;
pub mod transport;
pub mod virsh;

pub use session::{
    ConsolePhase, ConsoleSession, CredentialChangeAck, CredentialPrompts, Input, PhaseResult,
    SessionError, SessionState,
};
pub use transport::{ConsoleTransport, OutputSink, StreamTransport, TransportError};
pub use virsh::VirshConsole;
