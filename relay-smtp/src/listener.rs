use std::{collections::HashMap, net::SocketAddr};

use empath_common::{
    Signal, internal, tracing,
    traits::protocol::{Protocol, SessionHandler},
};
use futures_util::future::join_all;
use relay_tracing::traced;
use serde::Deserialize;
use tokio::net::TcpListener;

#[allow(
    clippy::unsafe_derive_deserialize,
    reason = "The unsafe aspects have nothing to do with the struct"
)]
#[derive(Deserialize)]
pub struct Listener<Proto: Protocol>
where
    Proto::Args: Default + for<'de> Deserialize<'de>,
{
    #[serde(skip)]
    handler: Proto,
    socket: SocketAddr,
    #[serde(default)]
    args: Proto::Args,
    #[serde(default)]
    init_context: HashMap<String, String>,
}

impl<Proto: Protocol> Listener<Proto>
where
    Proto::Args: Default + for<'de> Deserialize<'de>,
{
    #[must_use]
    pub fn new(socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler: Proto::default(),
            socket,
            args,
            init_context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_init_context(mut self, init_context: HashMap<String, String>) -> Self {
        self.init_context = init_context;
        self
    }

    /// Validate this listener's protocol-specific args once before serving.
    ///
    /// # Errors
    ///
    /// See [`Protocol::validate`].
    pub fn validate(&mut self) -> Result<(), empath_common::error::ProtocolError> {
        self.handler.validate(&mut self.args)
    }

    /// Apply `f` to this listener's args, e.g. to inject a runtime-constructed
    /// collaborator that can't come from deserialized config.
    pub fn map_args(&mut self, f: impl FnOnce(Proto::Args) -> Proto::Args) {
        self.args = f(std::mem::take(&mut self.args));
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err))]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        internal!("Serving {} on {:?}", Proto::ty(), self.socket);
        let mut sessions = Vec::default();

        let (address, port) = (self.socket.ip(), self.socket.port());
        let listener = TcpListener::bind(self.socket).await?;

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "{} Listener {}:{} received shutdown signal, finishing sessions ...", Proto::ty(), address, port);
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    tracing::debug!("Connection received on {}", self.socket);
                    let (stream, peer) = connection?;
                    let session = self.handler.handle(stream, peer, self.init_context.clone(), self.args.clone());
                    let session_signal = shutdown.resubscribe();
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(session_signal).await {
                            internal!(level = ERROR, "Error: {err}");
                        }
                    }));
                }
            }
        }

        Ok(())
    }
}
