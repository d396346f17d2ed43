use std::sync::LazyLock;

use empath_common::{Signal, internal, logging, tracing};
use empath_smtp::{Smtp, listener::Listener};
use relay_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

/// Top-level configuration: a list of SMTP listeners sharing one spool.
#[derive(Deserialize)]
pub struct Empath {
    #[serde(alias = "smtp")]
    listeners: Vec<Listener<Smtp>>,
    #[serde(alias = "spool", default)]
    spool: empath_spool::SpoolConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Empath {
    /// Run every configured listener against the shared spool until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool fails to initialise, a listener fails
    /// validation (e.g. a configured TLS certificate is missing), or any
    /// listener's accept loop fails.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let spool = self.spool.into_spool()?;
        let backing_store = spool.backing_store();

        for listener in &mut self.listeners {
            listener.map_args(|args| args.with_spool(backing_store.clone()));
            listener.validate()?;
        }

        let listeners = self.listeners;

        let ret = tokio::select! {
            r = futures_util::future::try_join_all(
                listeners.iter().map(|l| l.serve(SHUTDOWN_BROADCAST.subscribe()))
            ) => r.map(|_| ()),
            r = spool.serve(SHUTDOWN_BROADCAST.subscribe()) => r.map_err(anyhow::Error::from),
            r = shutdown() => r,
        };

        internal!("Shutting down...");

        ret
    }
}
