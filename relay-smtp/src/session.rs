use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use empath_common::{
    Signal,
    address::Address,
    context::Context,
    error::SessionError,
    incoming, internal, outgoing,
    status::Status,
    tracing,
};
use relay_tracing::traced;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    SmtpServerTimeouts,
    command::{AuthMechanism, Command, HeloVariant},
    connection::Connection,
    extensions::Extension,
    state::{self, State},
};

/// RFC 5321 4.5.3.1.1-ish resource caps, enforced per session.
const SMTP_MAXRCPT: usize = 1000;
const SMTP_KICKTHRESHOLD: u32 = 50;

/// Validates a SASL credential pair.
///
/// The reference implementation lives in a separate `Auth` collaborator
/// crate; the session only depends on this trait, mirroring the way it
/// depends on [`empath_spool::BackingStore`] rather than a concrete spool.
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    async fn check(&self, username: &str, password: &str) -> bool;
}

/// An [`Authenticator`] that rejects every credential, used when no real
/// one has been configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthenticator;

#[async_trait]
impl Authenticator for NullAuthenticator {
    async fn check(&self, _username: &str, _password: &str) -> bool {
        false
    }
}

/// Reverse-DNS lookup for the connecting peer, consulted once at CONNECT.
///
/// Mirrors the `Authenticator`/`BackingStore` collaborator-boundary shape:
/// the session depends only on this trait, never on a concrete resolver.
#[async_trait]
pub trait Dns: Send + Sync + std::fmt::Debug {
    async fn ptr(&self, peer: SocketAddr) -> Option<String>;
}

/// A [`Dns`] that never resolves anything, used when no resolver is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDns;

#[async_trait]
impl Dns for NullDns {
    async fn ptr(&self, _peer: SocketAddr) -> Option<String> {
        None
    }
}

/// Outcome of a policy/reputation checkpoint consulted by [`Mfa`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaVerdict {
    Allow,
    Refuse {
        code: u32,
        enhanced: &'static str,
        reason: &'static str,
    },
}

/// Policy refusal gate, consulted at CONNECT/HELO/MAIL FROM/RCPT TO/DATA.
///
/// Every checkpoint defaults to `Allow` so a real implementation only needs
/// to override the checkpoints it cares about.
#[async_trait]
pub trait Mfa: Send + Sync + std::fmt::Debug {
    async fn connect(&self, peer: SocketAddr) -> MfaVerdict {
        let _ = peer;
        MfaVerdict::Allow
    }

    async fn helo(&self, id: &str) -> MfaVerdict {
        let _ = id;
        MfaVerdict::Allow
    }

    async fn mail_from(&self, sender: Option<&Address>) -> MfaVerdict {
        let _ = sender;
        MfaVerdict::Allow
    }

    async fn rcpt_to(&self, recipient: &Address) -> MfaVerdict {
        let _ = recipient;
        MfaVerdict::Allow
    }

    async fn data(&self) -> MfaVerdict {
        MfaVerdict::Allow
    }
}

/// An [`Mfa`] that allows every checkpoint, used when no policy engine is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMfa;

#[async_trait]
impl Mfa for NullMfa {}

/// Session life-cycle phase, orthogonal to the wire [`State`] machine.
///
/// `Transaction` holds exactly when [`Session::message_id`] is `Some`: the
/// phase is derived from that field rather than tracked separately, so the
/// two can never drift out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before HELO/EHLO.
    Init,
    /// Greeted, no mail transaction in progress.
    Setup,
    /// Between an accepted MAIL FROM and the message's commit (or RSET).
    Transaction,
}

/// Queue collaborator: the multi-call protocol a session drives a message
/// through (assign an id, stage the envelope as recipients accumulate,
/// commit at end-of-body, or discard on RSET).
///
/// Adapts the spec's multi-call queue protocol onto the teacher's
/// single-shot [`empath_spool::BackingStore::write`].
#[async_trait]
pub trait Queue: Send + Sync + std::fmt::Debug {
    /// Assign a new message id, opening a transaction.
    async fn create_message(&self) -> String;

    /// Stage the envelope accumulated so far under `message_id`. Called once
    /// per MAIL FROM/RCPT TO so the queue always has the latest recipient set.
    async fn submit_envelope(&self, message_id: &str, ctx: &Context) -> Result<(), String>;

    /// Commit the completed message, returning the durable tracking id.
    async fn commit_message(&self, message_id: &str, ctx: &mut Context) -> Result<String, String>;

    /// Discard a transaction abandoned via RSET or a dropped connection.
    async fn remove_message(&self, message_id: &str);
}

/// A [`Queue`] that never durably stores anything, used when no spool is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullQueue;

#[async_trait]
impl Queue for NullQueue {
    async fn create_message(&self) -> String {
        "local".to_string()
    }

    async fn submit_envelope(&self, _message_id: &str, _ctx: &Context) -> Result<(), String> {
        Ok(())
    }

    async fn commit_message(&self, message_id: &str, _ctx: &mut Context) -> Result<String, String> {
        Ok(message_id.to_string())
    }

    async fn remove_message(&self, _message_id: &str) {}
}

/// The real [`Queue`]: assigns ids locally and commits through a
/// [`empath_spool::BackingStore`].
#[derive(Debug)]
pub struct SpoolQueue {
    store: Arc<dyn empath_spool::BackingStore>,
    next_id: AtomicU64,
}

impl SpoolQueue {
    #[must_use]
    pub fn new(store: Arc<dyn empath_spool::BackingStore>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Queue for SpoolQueue {
    async fn create_message(&self) -> String {
        format!("{:016x}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The envelope lives in `Context` itself (mutated by `State::transition`
    /// on each MAIL FROM/RCPT TO); nothing needs staging ahead of commit.
    async fn submit_envelope(&self, _message_id: &str, _ctx: &Context) -> Result<(), String> {
        Ok(())
    }

    async fn commit_message(&self, _message_id: &str, ctx: &mut Context) -> Result<String, String> {
        self.store
            .write(ctx)
            .await
            .map(|id| id.to_string())
            .map_err(|err| err.to_string())
    }

    async fn remove_message(&self, _message_id: &str) {}
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub struct SessionConfig {
    pub extensions: Vec<Extension>,
    pub spool: Option<Arc<dyn empath_spool::BackingStore>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub dns: Option<Arc<dyn Dns>>,
    pub mfa: Option<Arc<dyn Mfa>>,
    pub banner: String,
    pub timeouts: SmtpServerTimeouts,
    pub init_context: HashMap<Cow<'static, str>, String>,
    pub starttls_require: bool,
    pub auth_require: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    extensions: Vec<Extension>,
    spool: Option<Arc<dyn empath_spool::BackingStore>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    dns: Option<Arc<dyn Dns>>,
    mfa: Option<Arc<dyn Mfa>>,
    banner: String,
    timeouts: SmtpServerTimeouts,
    init_context: HashMap<Cow<'static, str>, String>,
    starttls_require: bool,
    auth_require: bool,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    #[must_use]
    pub fn with_spool(mut self, spool: Option<Arc<dyn empath_spool::BackingStore>>) -> Self {
        self.spool = spool;
        self
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn with_dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = Some(dns);
        self
    }

    #[must_use]
    pub fn with_mfa(mut self, mfa: Arc<dyn Mfa>) -> Self {
        self.mfa = Some(mfa);
        self
    }

    #[must_use]
    pub const fn with_starttls_require(mut self, require: bool) -> Self {
        self.starttls_require = require;
        self
    }

    #[must_use]
    pub const fn with_auth_require(mut self, require: bool) -> Self {
        self.auth_require = require;
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: String) -> Self {
        self.banner = banner;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_init_context(mut self, init_context: HashMap<Cow<'static, str>, String>) -> Self {
        self.init_context = init_context;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            extensions: self.extensions,
            spool: self.spool,
            authenticator: self.authenticator,
            dns: self.dns,
            mfa: self.mfa,
            banner: self.banner,
            timeouts: self.timeouts,
            init_context: self.init_context,
            starttls_require: self.starttls_require,
            auth_require: self.auth_require,
        }
    }
}

/// What the dispatcher should do with the connection after a reply is sent.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Continue,
    Close,
}

/// Returns the index one past the first CRLF in `buf`, if any.
fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|pos| pos + 2)
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    state: State,
    context: Context,
    extensions: Vec<Extension>,
    banner: String,
    tls_context: Option<TlsContext>,
    queue: Arc<dyn Queue>,
    authenticator: Arc<dyn Authenticator>,
    dns: Arc<dyn Dns>,
    mfa: Arc<dyn Mfa>,
    /// `None` only while a TLS upgrade is being performed (see [`Self::upgrade_tls`]).
    connection: Option<Connection<Stream>>,
    /// Unparsed bytes read from the wire but not yet split into lines.
    read_buf: Vec<u8>,
    /// Message body accumulated while in [`State::Reading`].
    body: Vec<u8>,
    /// Maximum message size in bytes as advertised via SIZE (RFC 1870). Zero
    /// means unlimited.
    max_message_size: usize,
    rcptcount: usize,
    kickcount: u32,
    /// Set once the DATA ingest has exceeded `max_message_size`.
    body_overflowed: bool,
    /// Survives `Context::reset()`, unlike transaction-scoped metadata:
    /// mirrors the spec's `F_AUTHENTICATED` flag, cleared only on teardown.
    authenticated: bool,
    /// Set once a TLS upgrade has completed.
    secure: bool,
    /// `Some` iff [`Phase::Transaction`] — assigned at MAIL FROM, cleared at
    /// commit or RSET.
    message_id: Option<String>,
    starttls_require: bool,
    auth_require: bool,
    timeouts: SmtpServerTimeouts,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(crate) fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        let max_message_size = config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Size(size) => Some(*size),
                _ => None,
            })
            .unwrap_or(0);

        let tls_context = config.extensions.iter().find_map(|ext| match ext {
            Extension::Starttls(context) => Some(context.clone()),
            _ => None,
        });

        let mut context = Context::default();
        context
            .metadata
            .extend(config.init_context.into_iter().map(|(k, v)| (k.into_owned(), v)));

        Self {
            peer,
            state: State::default(),
            context,
            connection: Some(Connection::Plain {
                stream,
                read_buf: Vec::new(),
                read_pos: 0,
                read_len: 0,
            }),
            extensions: config.extensions,
            tls_context,
            queue: config.spool.map_or_else(
                || Arc::new(NullQueue) as Arc<dyn Queue>,
                |store| Arc::new(SpoolQueue::new(store)) as Arc<dyn Queue>,
            ),
            authenticator: config
                .authenticator
                .unwrap_or_else(|| Arc::new(NullAuthenticator)),
            dns: config.dns.unwrap_or_else(|| Arc::new(NullDns)),
            mfa: config.mfa.unwrap_or_else(|| Arc::new(NullMfa)),
            banner: if config.banner.is_empty() {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            } else {
                config.banner
            },
            read_buf: Vec::new(),
            body: Vec::new(),
            max_message_size,
            rcptcount: 0,
            kickcount: 0,
            body_overflowed: false,
            authenticated: false,
            secure: false,
            message_id: None,
            starttls_require: config.starttls_require,
            auth_require: config.auth_require,
            timeouts: config.timeouts,
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(?peer = self.peer)), timing(precision = "us"))]
    pub(crate) async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        if let MfaVerdict::Refuse { code, enhanced, reason } = self.mfa.connect(self.peer).await {
            self.send(&format!("{code} {enhanced} {reason}")).await?;
            return Ok(());
        }

        if let Some(name) = self.dns.ptr(self.peer).await {
            self.context.metadata.insert("ptr".to_string(), name);
        }

        let banner = format!("{} {}", Status::ServiceReady, self.banner);
        self.send(&banner).await?;

        loop {
            if matches!(self.state, State::StartTls(_)) {
                let Some(tls_context) = self.tls_context.clone() else {
                    self.send(&format!("{} TLS not available", Status::NotImplemented))
                        .await?;
                    return Ok(());
                };

                let connection = self
                    .connection
                    .take()
                    .expect("connection present outside of upgrade");
                let (connection, info) = connection
                    .upgrade(&tls_context)
                    .await
                    .map_err(|err| SessionError::Protocol(err.to_string()))?;
                self.connection = Some(connection);
                self.secure = true;
                self.context
                    .metadata
                    .insert("tls".to_string(), "true".to_string());
                self.context
                    .metadata
                    .insert("protocol".to_string(), info.proto());
                self.context
                    .metadata
                    .insert("cipher".to_string(), info.cipher());

                internal!(level = DEBUG, "Connection upgraded to TLS");
                self.send(&format!("{} Ready to begin TLS", Status::ServiceReady))
                    .await?;
                self.state = if self.context.extended {
                    State::Ehlo(state::Ehlo {
                        id: self.context.id.clone(),
                    })
                } else {
                    State::Helo(state::Helo {
                        id: self.context.id.clone(),
                    })
                };
                continue;
            }

            let budget = self.step_timeout();
            let event = tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "Shutdown signal received, closing session");
                        self.send(&format!("{} Server shutting down", Status::Unavailable)).await?;
                    }
                    Event::Close
                }
                result = tokio::time::timeout(budget, self.step()) => match result {
                    Ok(result) => result?,
                    Err(_) => {
                        internal!(level = INFO, "Session idle for {budget:?}, closing");
                        self.send(&format!("{} Timeout waiting for input", Status::Unavailable)).await?;
                        Event::Close
                    }
                },
            };

            if event == Event::Close {
                internal!("Connection closed");
                return Ok(());
            }
        }
    }

    /// Per RFC 5321 4.5.3.2: the allowed idle time depends on where we are
    /// in the protocol (plain commands vs. the three DATA phases).
    fn step_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(match self.state {
            State::Reading(_) => self.timeouts.data_block_secs,
            State::Data(_) => self.timeouts.data_init_secs,
            _ => self.timeouts.command_secs,
        })
    }

    async fn send(&mut self, line: &str) -> Result<(), SessionError> {
        outgoing!("{line}");
        self.connection
            .as_mut()
            .expect("connection present outside of upgrade")
            .send(line)
            .await
            .map_err(|err| SessionError::Connection(std::io::Error::other(err.to_string())))?;
        Ok(())
    }

    /// Read, dispatch, and reply to exactly one unit of protocol: either one
    /// command line, or one line of DATA body.
    async fn step(&mut self) -> Result<Event, SessionError> {
        let (line, pipelined) = self.read_line().await?;
        let Some(line) = line else {
            return Ok(Event::Close);
        };

        if matches!(self.state, State::Reading(_)) {
            return self.ingest_line(&line).await;
        }

        let text = String::from_utf8_lossy(&line).into_owned();

        // Mid-SASL, the next line is a raw base64 continuation, not a
        // command to be parsed (RFC 4954).
        let command = if matches!(
            self.state,
            State::AuthInit(_) | State::AuthUsername(_) | State::AuthPassword(_)
        ) {
            Command::AuthContinuation(text)
        } else {
            Command::try_from(text.as_str()).unwrap_or_else(|e| e)
        };
        incoming!("{command}");

        if pipelined {
            self.send(&format!(
                "{} 5.0.0 Pipelining not supported",
                Status::CommandUnrecognized
            ))
            .await?;
            return Ok(Event::Close);
        }

        self.dispatch(command).await
    }

    /// Pulls the next CRLF-terminated line out of `read_buf`, reading more
    /// bytes from the connection as needed. Returns whether more data
    /// remains buffered after this line (pipelining).
    async fn read_line(&mut self) -> Result<(Option<Vec<u8>>, bool), SessionError> {
        loop {
            if let Some(end) = find_line_end(&self.read_buf) {
                let mut line: Vec<u8> = self.read_buf.drain(..end).collect();
                line.truncate(line.len() - 2);
                let pipelined = !self.read_buf.is_empty();
                return Ok((Some(line), pipelined));
            }

            let mut buf = [0_u8; 4096];
            let read = self
                .connection
                .as_mut()
                .expect("connection present outside of upgrade")
                .receive(&mut buf)
                .await
                .map_err(|err| SessionError::Connection(std::io::Error::other(err.to_string())))?;

            if read == 0 {
                return Ok((None, false));
            }

            self.read_buf.extend_from_slice(&buf[..read]);
        }
    }

    fn note_refusal(&mut self) {
        self.kickcount += 1;
    }

    fn reset_kick(&mut self) {
        self.kickcount = 0;
    }

    async fn dispatch(&mut self, command: Command) -> Result<Event, SessionError> {
        // NOOP never touches phase, state, or kick counters (RFC 5321 4.1.1.9).
        if matches!(command, Command::Noop) {
            self.send(&format!("{} 2.0.0 Ok", Status::Ok)).await?;
            return Ok(Event::Continue);
        }

        if let Some(event) = self.policy_check(&command).await? {
            return Ok(event);
        }

        let is_rset = matches!(command, Command::Rset);

        self.state = std::mem::take(&mut self.state).transition(command, &mut self.context);

        if is_rset
            && let Some(id) = self.message_id.take()
        {
            self.queue.remove_message(&id).await;
        }

        if matches!(self.state, State::Invalid(_)) {
            self.note_refusal();
        }

        if self.kickcount >= SMTP_KICKTHRESHOLD {
            internal!(level = WARN, "session not moving forward, kicking");
            if relay_metrics::is_enabled() {
                relay_metrics::metrics().smtp.record_error(421);
            }
            self.send(&format!(
                "{} 4.7.0 Too many errors, closing connection",
                Status::Unavailable
            ))
            .await?;
            return Ok(Event::Close);
        }

        self.reply().await
    }

    /// Consults [`Mfa`] (and the `STARTTLS_REQUIRE`/`AUTH_REQUIRE` gates) at
    /// the HELO/MAIL FROM/RCPT TO/DATA checkpoints, before `transition` runs.
    /// Returns `Some(event)` if the command was refused outright.
    async fn policy_check(&mut self, command: &Command) -> Result<Option<Event>, SessionError> {
        let verdict = match command {
            Command::Helo(HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) => {
                self.mfa.helo(id).await
            }
            Command::MailFrom(sender, _) => {
                if self.starttls_require && !self.secure {
                    return self
                        .refuse(530, "5.7.0", "Must issue a STARTTLS command first")
                        .await
                        .map(Some);
                }
                if self.auth_require && !self.authenticated {
                    return self
                        .refuse(530, "5.7.0", "Must authenticate first")
                        .await
                        .map(Some);
                }
                self.mfa.mail_from(sender.as_ref()).await
            }
            Command::RcptTo(recipients) => {
                let mut verdict = MfaVerdict::Allow;
                for addr in recipients.iter() {
                    verdict = self.mfa.rcpt_to(addr).await;
                    if !matches!(verdict, MfaVerdict::Allow) {
                        break;
                    }
                }
                verdict
            }
            Command::Data => self.mfa.data().await,
            _ => MfaVerdict::Allow,
        };

        if let MfaVerdict::Refuse { code, enhanced, reason } = verdict {
            return self.refuse(code, enhanced, reason).await.map(Some);
        }

        Ok(None)
    }

    async fn refuse(&mut self, code: u32, enhanced: &str, reason: &str) -> Result<Event, SessionError> {
        self.note_refusal();
        self.send(&format!("{code} {enhanced} {reason}")).await?;
        Ok(Event::Continue)
    }

    /// Produce and send the reply for the current state, returning whether
    /// the connection should close afterward.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "ns"))]
    async fn reply(&mut self) -> Result<Event, SessionError> {
        match self.state.clone() {
            State::Helo(helo) => {
                self.send(&format!("{} {} says hello to {}", Status::Ok, self.banner, helo.id))
                    .await?;
                Ok(Event::Continue)
            }
            State::Ehlo(ehlo) => {
                self.send_ehlo_lines(&ehlo.id, false).await?;
                Ok(Event::Continue)
            }
            State::Help(help) => {
                self.send_ehlo_lines("", help.from_ehlo).await?;
                Ok(Event::Continue)
            }
            State::StartTls(_) => Ok(Event::Continue), // handled in run()'s upgrade branch
            State::AuthInit(_) => {
                self.send(&format!("{} ", Status::AuthContinue)).await?;
                Ok(Event::Continue)
            }
            State::AuthUsername(_) => {
                self.send(&format!(
                    "{} {}",
                    Status::AuthContinue,
                    base64::engine::general_purpose::STANDARD.encode("Username:")
                ))
                .await?;
                Ok(Event::Continue)
            }
            State::AuthPassword(_) => {
                self.send(&format!(
                    "{} {}",
                    Status::AuthContinue,
                    base64::engine::general_purpose::STANDARD.encode("Password:")
                ))
                .await?;
                Ok(Event::Continue)
            }
            State::AuthFinalize(finalize) => self.finalize_auth(finalize).await,
            State::MailFrom(mail) => {
                if let Some(size) = mail.params.size
                    && self.max_message_size > 0
                    && size > self.max_message_size
                {
                    self.note_refusal();
                    self.state = State::Ehlo(state::Ehlo {
                        id: self.context.id.clone(),
                    });
                    self.send(&format!(
                        "{} 5.2.3 Declared message size {} exceeds maximum {}",
                        Status::ExceededStorage, size, self.max_message_size
                    ))
                    .await?;
                    return Ok(Event::Continue);
                }
                let message_id = self.queue.create_message().await;
                if let Err(err) = self.queue.submit_envelope(&message_id, &self.context).await {
                    internal!(level = ERROR, "Failed to submit envelope: {err}");
                }
                self.message_id = Some(message_id);
                self.send(&format!("{} 2.1.0 Ok", Status::Ok)).await?;
                Ok(Event::Continue)
            }
            State::RcptTo(_) => {
                self.rcptcount += 1;
                if self.rcptcount > SMTP_MAXRCPT {
                    self.note_refusal();
                    self.send(&format!("{} 5.5.3 Too many recipients", Status::Error))
                        .await?;
                    return Ok(Event::Continue);
                }
                if let Some(id) = self.message_id.clone()
                    && let Err(err) = self.queue.submit_envelope(&id, &self.context).await
                {
                    internal!(level = ERROR, "Failed to submit envelope: {err}");
                }
                self.reset_kick();
                self.send(&format!("{} 2.1.5 Ok", Status::Ok)).await?;
                Ok(Event::Continue)
            }
            State::Data(_) => {
                if self.context.envelope.recipients().is_none_or(|r| r.is_empty()) {
                    self.note_refusal();
                    self.state = State::Ehlo(state::Ehlo {
                        id: self.context.id.clone(),
                    });
                    self.send(&format!(
                        "{} 5.5.1 No recipient specified",
                        Status::InvalidCommandSequence
                    ))
                    .await?;
                    return Ok(Event::Continue);
                }

                self.body.clear();
                self.body.extend_from_slice(self.received_trailer().as_bytes());
                self.body_overflowed = false;
                self.state = State::Reading(state::Reading);
                self.send(&format!(
                    "{} End data with <CR><LF>.<CR><LF>",
                    Status::StartMailInput
                ))
                .await?;
                Ok(Event::Continue)
            }
            State::Quit(_) => {
                self.send(&format!("{} Bye", Status::GoodBye)).await?;
                Ok(Event::Close)
            }
            State::Reject(_) | State::Close(_) => Ok(Event::Close),
            State::Reading(_) | State::PostDot(_) => Ok(Event::Continue),
            State::Connect(_) => Ok(Event::Continue),
            State::Invalid(invalid) => {
                self.send(&format!("{} {} {}", invalid.code, invalid.enhanced, invalid.reason))
                    .await?;
                Ok(Event::Continue)
            }
        }
    }

    async fn send_ehlo_lines(&mut self, greet_to: &str, help: bool) -> Result<(), SessionError> {
        let mut lines = Vec::new();
        if !help {
            lines.push(format!(
                "{}{}{} says hello to {}",
                Status::Ok,
                if self.extensions.is_empty() { ' ' } else { '-' },
                self.banner,
                greet_to
            ));
        }

        // STARTTLS stops being relevant once the connection is already
        // secure; AUTH is only worth advertising once secured and not yet
        // authenticated (RFC 4954 advises against cleartext AUTH).
        let visible: Vec<Extension> = self
            .extensions
            .iter()
            .filter(|ext| match ext {
                Extension::Starttls(_) => !self.secure,
                Extension::Auth(_) => self.secure && !self.authenticated,
                _ => true,
            })
            .cloned()
            .collect();

        let count = visible.len();
        for (idx, extension) in visible.iter().enumerate() {
            let status = if help { Status::HelpMessage } else { Status::Ok };
            let sep = if idx + 1 == count { ' ' } else { '-' };
            lines.push(format!("{status}{sep}{extension}"));
        }

        if lines.is_empty() {
            lines.push(format!("{} Ok", Status::Ok));
        }

        for line in lines {
            self.send(&line).await?;
        }
        Ok(())
    }

    fn received_trailer(&self) -> String {
        format!(
            "Received: from {} ({} [{}]);\r\n\tby {} (relay) with {}SMTP id {};\r\n\t{}\r\n",
            self.context.id,
            self.context.id,
            self.peer,
            self.banner,
            if self.context.extended { "E" } else { "" },
            self.context.id,
            Utc::now().to_rfc2822(),
        )
    }

    /// DATA-mode line sink: dot-unstuffing, 7-bit masking, size cap.
    async fn ingest_line(&mut self, line: &[u8]) -> Result<Event, SessionError> {
        if line == b"." {
            return self.end_of_body().await;
        }

        let line = if let Some(stripped) = line.strip_prefix(b".") {
            stripped
        } else {
            line
        };

        // EHLO sessions default to 8BITMIME-clean handling unless the
        // transaction explicitly declared `BODY=7BIT` (RFC 6152).
        let eight_bit = self.context.extended
            && !matches!(
                self.context.envelope.mail_params().and_then(|p| p.body),
                Some(empath_common::envelope::BodyType::SevenBit)
            );

        let masked: Vec<u8> = if eight_bit {
            line.to_vec()
        } else {
            line.iter().map(|b| b & 0x7F).collect()
        };

        if !self.body_overflowed {
            let projected = self.body.len() + masked.len() + 1;
            if self.max_message_size > 0 && projected > self.max_message_size {
                self.body_overflowed = true;
            } else {
                self.body.extend_from_slice(&masked);
                self.body.push(b'\n');
            }
        }

        Ok(Event::Continue)
    }

    async fn end_of_body(&mut self) -> Result<Event, SessionError> {
        if self.body_overflowed {
            self.body.clear();
            self.state = State::Ehlo(state::Ehlo {
                id: self.context.id.clone(),
            });
            self.send(&format!("{} 5.0.0 Transaction failed", Status::TransactionFailed))
                .await?;
            return Ok(Event::Continue);
        }

        let size = self.body.len();
        self.context.set_data(std::mem::take(&mut self.body));

        let message_id = self.message_id.take().unwrap_or_else(|| "local".to_string());
        let tracking_id = match self.queue.commit_message(&message_id, &mut self.context).await {
            Ok(id) => Some(id),
            Err(err) => {
                internal!(level = ERROR, "Failed to commit message: {err}");
                None
            }
        };

        if let Some(id) = &tracking_id {
            let sender = self
                .context
                .envelope
                .sender()
                .map_or_else(String::new, ToString::to_string);
            let recipients: Vec<String> = self
                .context
                .envelope
                .recipients()
                .map(|r| r.iter().map(ToString::to_string).collect())
                .unwrap_or_default();
            empath_common::audit::log_message_received(
                id,
                &sender,
                &recipients,
                size,
                &self.peer.to_string(),
            );
        }

        self.context.reset();
        self.rcptcount = 0;
        self.reset_kick();

        self.state = State::Ehlo(state::Ehlo {
            id: self.context.id.clone(),
        });

        let queued_as = tracking_id.unwrap_or_else(|| "local".to_string());
        self.send(&format!(
            "{} 2.0.0 {} Message accepted for delivery",
            Status::Ok, queued_as
        ))
        .await?;
        Ok(Event::Continue)
    }

    async fn finalize_auth(&mut self, finalize: state::AuthFinalize) -> Result<Event, SessionError> {
        let credentials = match decode_sasl(&finalize) {
            Ok(creds) => creds,
            Err(reason) => {
                self.note_refusal();
                self.state = State::Ehlo(state::Ehlo {
                    id: self.context.id.clone(),
                });
                self.send(&format!("{} 5.5.2 {reason}", Status::SyntaxError))
                    .await?;
                return Ok(Event::Continue);
            }
        };

        let authenticated = self
            .authenticator
            .check(&credentials.username, &credentials.password)
            .await;
        // The password never outlives this call.
        drop(credentials);

        self.state = if self.context.extended {
            State::Ehlo(state::Ehlo {
                id: self.context.id.clone(),
            })
        } else {
            State::Helo(state::Helo {
                id: self.context.id.clone(),
            })
        };

        if authenticated {
            self.reset_kick();
            self.authenticated = true;
            self.send(&format!("{} 2.7.0 Authentication succeeded", Status::AuthSucceeded))
                .await?;
        } else {
            self.note_refusal();
            self.send(&format!("{} 5.7.8 Authentication failed", Status::AuthFailed))
                .await?;
        }

        Ok(Event::Continue)
    }
}

struct Credentials {
    username: String,
    password: String,
}

/// Decodes the collected SASL payload(s) per RFC 4954, for either PLAIN
/// (`[authzid] \0 authcid \0 password`, possibly split across an initial
/// response and a continuation) or LOGIN (plain base64 username + password).
fn decode_sasl(finalize: &state::AuthFinalize) -> Result<Credentials, String> {
    let decode = |value: &str| {
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| "Invalid base64".to_string())
    };

    match finalize.mechanism {
        AuthMechanism::Plain => {
            let raw = decode(&finalize.payload)?;
            let text = String::from_utf8(raw).map_err(|_| "Invalid UTF-8 in response".to_string())?;
            let mut parts = text.splitn(3, '\0');
            let _authzid = parts.next().ok_or("Malformed PLAIN response")?;
            let authcid = parts.next().ok_or("Malformed PLAIN response")?;
            let password = parts.next().ok_or("Malformed PLAIN response")?;
            if authcid.is_empty() || password.is_empty() {
                return Err("Malformed PLAIN response".to_string());
            }
            Ok(Credentials {
                username: authcid.to_string(),
                password: password.to_string(),
            })
        }
        AuthMechanism::Login => {
            let username = finalize
                .username
                .as_deref()
                .ok_or("Missing LOGIN username")?;
            let username = String::from_utf8(decode(username)?)
                .map_err(|_| "Invalid UTF-8 in username".to_string())?;
            let password = String::from_utf8(decode(&finalize.payload)?)
                .map_err(|_| "Invalid UTF-8 in password".to_string())?;
            Ok(Credentials { username, password })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test {
    use std::io::Cursor;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn session_with(input: &[u8]) -> Session<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::<Vec<u8>>::default();
        cursor.get_mut().extend_from_slice(input);
        Session::create(
            cursor,
            "127.0.0.1:25".parse().unwrap(),
            SessionConfig::builder().with_banner("testing".to_string()).build(),
        )
    }

    #[test]
    fn find_line_end_locates_crlf() {
        assert_eq!(find_line_end(b"HELO foo\r\n"), Some(10));
        assert_eq!(find_line_end(b"HELO foo"), None);
    }

    #[tokio::test]
    async fn helo_then_quit_flow() {
        let mut session = session_with(b"HELO example.com\r\nQUIT\r\n");
        let event = session.step().await.unwrap();
        assert_eq!(event, Event::Continue);
        assert!(matches!(session.state, State::Helo(_)));

        let event = session.step().await.unwrap();
        assert_eq!(event, Event::Close);
        assert!(matches!(session.state, State::Quit(_)));
    }

    #[tokio::test]
    async fn auth_plain_rejected_by_null_authenticator() {
        let mut session = session_with(b"EHLO example.com\r\nAUTH PLAIN AGxlZnRpbWUAcGFzcw==\r\n");
        session.step().await.unwrap();
        assert!(matches!(session.state, State::Ehlo(_)));

        session.step().await.unwrap();
        assert!(matches!(session.state, State::Ehlo(_)));
        assert_eq!(session.kickcount, 1);
    }

    #[test]
    fn decode_sasl_plain_rejects_missing_null() {
        let finalize = state::AuthFinalize {
            mechanism: AuthMechanism::Plain,
            payload: base64::engine::general_purpose::STANDARD.encode("nouls"),
            username: None,
        };
        assert!(decode_sasl(&finalize).is_err());
    }

    #[test]
    fn decode_sasl_login_round_trips() {
        let finalize = state::AuthFinalize {
            mechanism: AuthMechanism::Login,
            payload: base64::engine::general_purpose::STANDARD.encode("secret"),
            username: Some(base64::engine::general_purpose::STANDARD.encode("alice")),
        };
        let creds = decode_sasl(&finalize).expect("decodes");
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[tokio::test]
    async fn noop_does_not_touch_state_or_kickcount() {
        let mut session = session_with(b"HELO example.com\r\nNOOP\r\n");
        session.step().await.unwrap();
        let kick_before = session.kickcount;

        let event = session.step().await.unwrap();
        assert_eq!(event, Event::Continue);
        assert!(matches!(session.state, State::Helo(_)));
        assert_eq!(session.kickcount, kick_before);
    }

    #[test]
    fn dot_unstuffing_strips_one_leading_dot() {
        assert_eq!(b"..foo".strip_prefix(b".").unwrap(), b".foo");
        assert_eq!(b".".strip_prefix(b".").unwrap(), b"");
    }

    // --- Black-box wire tests over a genuine duplex "socket" ---------------
    //
    // `Session::create`/`run` are crate-internal, so a `tests/` integration
    // harness can't reach them; these drive the real wire protocol from the
    // other end of a `tokio::io::duplex` pair instead.

    #[derive(Debug, Default, Clone, Copy)]
    struct AllowAllAuthenticator;

    #[async_trait]
    impl Authenticator for AllowAllAuthenticator {
        async fn check(&self, _username: &str, _password: &str) -> bool {
            true
        }
    }

    fn duplex_session(
        config: SessionConfig,
    ) -> (Session<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(8192);
        let session = Session::create(server, "203.0.113.7:0".parse().unwrap(), config);
        (session, client)
    }

    async fn write_line(client: &mut tokio::io::DuplexStream, line: &str) {
        client
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Reads one SMTP reply (possibly multi-line) and returns its lines.
    async fn read_reply(
        reader: &mut tokio::io::BufReader<&mut tokio::io::DuplexStream>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                break;
            }
        }
        lines
    }

    #[tokio::test]
    async fn e2e_minimal_accept() {
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) = duplex_session(
            SessionConfig::builder().with_banner("relay.example".to_string()).build(),
        );
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        assert!(read_reply(&mut reader).await[0].starts_with("220"));

        write_line(reader.get_mut(), "EHLO client.example").await;
        assert!(read_reply(&mut reader).await[0].starts_with("250"));

        write_line(reader.get_mut(), "MAIL FROM:<a@example.com>").await;
        assert!(read_reply(&mut reader).await[0].starts_with("250"));

        write_line(reader.get_mut(), "RCPT TO:<b@example.com>").await;
        assert!(read_reply(&mut reader).await[0].starts_with("250"));

        write_line(reader.get_mut(), "DATA").await;
        assert!(read_reply(&mut reader).await[0].starts_with("354"));

        write_line(reader.get_mut(), "Subject: hi").await;
        write_line(reader.get_mut(), "").await;
        write_line(reader.get_mut(), "body").await;
        write_line(reader.get_mut(), ".").await;
        let reply = read_reply(&mut reader).await;
        assert!(reply[0].starts_with("250"), "expected accept, got {reply:?}");
    }

    #[tokio::test]
    async fn e2e_dot_stuffing_is_unstuffed_on_the_wire() {
        use empath_spool::BackingStore as _;

        let store = Arc::new(empath_spool::MemoryBackingStore::new());
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) =
            duplex_session(SessionConfig::builder().with_spool(Some(store.clone())).build());
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        read_reply(&mut reader).await;
        write_line(reader.get_mut(), "EHLO client.example").await;
        read_reply(&mut reader).await;
        write_line(reader.get_mut(), "MAIL FROM:<a@example.com>").await;
        read_reply(&mut reader).await;
        write_line(reader.get_mut(), "RCPT TO:<b@example.com>").await;
        read_reply(&mut reader).await;
        write_line(reader.get_mut(), "DATA").await;
        read_reply(&mut reader).await;

        write_line(reader.get_mut(), "..leading dot line").await;
        write_line(reader.get_mut(), ".").await;
        let reply = read_reply(&mut reader).await;
        assert!(reply[0].starts_with("250"), "got {reply:?}");

        let ids = store.list().await.unwrap();
        let id = ids.first().expect("message stored");
        let ctx = store.read(id).await.unwrap();
        let body = ctx.data.expect("body stored");
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains(".leading dot line"), "body: {body}");
        assert!(!body.contains("..leading dot line"), "body: {body}");
    }

    #[tokio::test]
    async fn e2e_pipelining_is_refused() {
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) = duplex_session(SessionConfig::builder().build());
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        read_reply(&mut reader).await;

        reader
            .get_mut()
            .write_all(b"EHLO a.example\r\nEHLO b.example\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply[0].starts_with("500"), "expected refusal, got {reply:?}");
    }

    #[tokio::test]
    async fn e2e_starttls_required_blocks_mail_from() {
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) = duplex_session(
            SessionConfig::builder().with_starttls_require(true).build(),
        );
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        read_reply(&mut reader).await;

        write_line(reader.get_mut(), "EHLO client.example").await;
        read_reply(&mut reader).await;

        write_line(reader.get_mut(), "MAIL FROM:<a@example.com>").await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply.len(), 1);
        assert!(reply[0].starts_with("530 5.7.0"), "got {reply:?}");
    }

    #[tokio::test]
    async fn e2e_auth_plain_with_real_authenticator_succeeds() {
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) = duplex_session(
            SessionConfig::builder()
                .with_authenticator(Arc::new(AllowAllAuthenticator))
                .build(),
        );
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        read_reply(&mut reader).await;

        write_line(reader.get_mut(), "EHLO client.example").await;
        read_reply(&mut reader).await;

        let creds = base64::engine::general_purpose::STANDARD.encode("\0alice\0secret");
        write_line(reader.get_mut(), &format!("AUTH PLAIN {creds}")).await;
        let reply = read_reply(&mut reader).await;
        assert!(reply[0].starts_with("235"), "got {reply:?}");
    }

    #[tokio::test]
    async fn e2e_kick_closes_connection_after_threshold() {
        let (sender, _rx) = tokio::sync::broadcast::channel(1);
        let (session, mut client) = duplex_session(SessionConfig::builder().build());
        tokio::spawn(session.run(sender.subscribe()));

        let mut reader = tokio::io::BufReader::new(&mut client);
        read_reply(&mut reader).await;

        for _ in 0..SMTP_KICKTHRESHOLD {
            write_line(reader.get_mut(), "GARBAGE").await;
            read_reply(&mut reader).await;
        }

        write_line(reader.get_mut(), "GARBAGE").await;
        let reply = read_reply(&mut reader).await;
        assert!(reply[0].starts_with("421"), "got {reply:?}");

        let mut buf = [0_u8; 1];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should have closed the connection");
    }
}
