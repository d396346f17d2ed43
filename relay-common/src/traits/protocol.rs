use std::{collections::HashMap, fmt::Debug, net::SocketAddr};

use tokio::{net::TcpStream, sync::broadcast};

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

/// A running session handed off by [`Protocol::handle`].
///
/// `run` consumes the session and drives it to completion, returning once
/// the peer disconnects, the protocol finishes, or `signal` fires.
pub trait SessionHandler: Send {
    fn run(
        self,
        signal: broadcast::Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

/// A protocol a [`Listener`](crate::listener::Listener) can serve.
///
/// Implementors describe how to turn an accepted [`TcpStream`] into a
/// [`Self::Session`], and how to validate the arguments a listener was
/// configured with before binding.
pub trait Protocol: Default + Send + Sync + 'static {
    /// The session produced for each accepted connection.
    type Session: SessionHandler + Send + 'static;

    /// Protocol-specific listener arguments (extensions, TLS, spool handles, ...).
    type Args: Clone + Send + Sync + Debug;

    /// A short, human-readable name for this protocol, used in logs.
    fn ty() -> &'static str;

    /// Validate and normalize `args` before the listener binds its socket.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if `args` is not usable (e.g. a configured
    /// TLS certificate file does not exist).
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError>;

    /// Construct a session for a freshly accepted connection.
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        init_context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session;
}
