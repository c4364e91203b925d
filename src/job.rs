//! Establishing a single outbound connection.
//!
//! A [`ConnectJob`] drives a bounded sequence of non-blocking connect
//! attempts towards one resolved address and reports exactly one terminal
//! [`Outcome`] to its caller, however the job ends: success, deadline,
//! exhausted retries, out-of-band socket closure, or cancellation.
//!
//! The job is constructed with a target address and a [`Config`], started
//! with a completion handler, and then driven to completion by running the
//! returned [`JobDriver`], typically by spawning it onto a runtime:
//!
//! ```no_run
//! # #[cfg(unix)]
//! # async fn _demo() {
//! use dialer::job::{Config, ConnectJob, Outcome};
//! use dialer::scheduler::TokioScheduler;
//! use dialer::socket::OsSocket;
//!
//! let target = "192.0.2.1:80".parse().unwrap();
//! let mut config = Config::default();
//! config.set_max_retries(2);
//! let mut job =
//!     ConnectJob::with_config(OsSocket, TokioScheduler, target, config);
//! job.set_hostname(Some("origin.example"));
//! let (handle, driver) = job.start(|outcome| match outcome {
//!     Outcome::Connected { local_addr, .. } => {
//!         println!("connected from {local_addr:?}");
//!     }
//!     other => println!("could not reach address: {other:?}"),
//! });
//! tokio::spawn(driver.run());
//! # handle.cancel();
//! # }
//! ```
//!
//! A job handles one target address. A caller that wants to fall back
//! across several candidate addresses starts a new job per address.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::cmp;
use std::boxed::Box;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::Error;
use crate::feedback::{AddressFeedback, PeerAccounting};
use crate::scheduler::EventScheduler;
use crate::socket::{ConnectPoll, SocketLayer};

//------------ Configuration Constants ----------------------------------------

/// Configuration limits for the overall connect timeout.
const CONNECT_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(60),
    Duration::from_millis(1),
    Duration::from_secs(600),
);

/// Configuration limits for the number of retries after definitive
/// failures. The initial attempt is not a retry, so a job issues at most
/// `max_retries + 1` failing attempts.
const MAX_RETRIES: DefMinMax<u8> = DefMinMax::new(0, 0, 10);

/// Configuration limits for the delay before retrying a failed attempt.
///
/// The delay is a fixed short interval rather than an exponential backoff;
/// total latency is bounded by the overall timeout, not by backoff growth.
const RETRY_DELAY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(50),
    Duration::from_millis(1),
    Duration::from_secs(1),
);

//------------ Config ---------------------------------------------------------

/// Configuration for a connect job.
#[derive(Clone, Debug)]
pub struct Config {
    /// Overall timeout for establishing the connection.
    connect_timeout: Duration,

    /// Maximum number of retries after definitive connect failures.
    max_retries: u8,

    /// Delay between a definitive failure and the next attempt.
    retry_delay: Duration,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the overall connect timeout.
    ///
    /// The deadline is fixed when the job starts; no attempt is begun after
    /// it, even if a watch fires slightly late.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sets the overall connect timeout.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = CONNECT_TIMEOUT.limit(timeout);
    }

    /// Returns the maximum number of retries after definitive failures.
    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Sets the maximum number of retries.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_max_retries(&mut self, value: u8) {
        self.max_retries = MAX_RETRIES.limit(value);
    }

    /// Returns the delay before retrying a failed attempt.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Sets the delay before retrying a failed attempt.
    ///
    /// Excessive values are quietly trimmed.
    pub fn set_retry_delay(&mut self, value: Duration) {
        self.retry_delay = RETRY_DELAY.limit(value);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT.default(),
            max_retries: MAX_RETRIES.default(),
            retry_delay: RETRY_DELAY.default(),
        }
    }
}

//------------ Outcome --------------------------------------------------------

/// The terminal result of a connect job.
///
/// Exactly one outcome is delivered to the completion handler, whatever
/// path the job takes to get there. The variants are mutually exclusive.
#[derive(Debug)]
pub enum Outcome<S> {
    /// The connection was established.
    ///
    /// The socket now belongs to the caller; the job will not close it.
    Connected {
        /// The connected socket.
        socket: S,

        /// The local address of the connection.
        ///
        /// Looking it up is best effort; `None` means the lookup failed
        /// after the connection was already established.
        local_addr: Option<SocketAddr>,
    },

    /// The deadline passed before any attempt succeeded.
    TimedOut,

    /// The retry budget was exhausted, or no socket could be opened.
    Failed(Error),

    /// The socket was closed out of band, or the owner cancelled the job.
    Aborted,
}

//------------ State ----------------------------------------------------------

/// Progress of a connect job.
///
/// `Done` is terminal; no transitions leave it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// The job has not been started.
    Idle,

    /// About to issue a connect attempt.
    Connecting,

    /// An attempt is in flight; waiting for the socket to become writable.
    WaitingWritable,

    /// An attempt failed definitively; waiting out the retry delay.
    RetryScheduled,

    /// A terminal outcome has been delivered.
    Done,
}

//------------ Terminal -------------------------------------------------------

/// Terminal classification of a job, before side effects are applied.
#[derive(Clone, Copy, Debug)]
enum Terminal {
    /// An attempt succeeded.
    Connected,

    /// The deadline passed.
    TimedOut,

    /// The retry budget is spent.
    Failed,

    /// External closure or cancellation.
    Aborted,
}

//------------ ConnectJob -----------------------------------------------------

/// The completion handler of a job; consumed on delivery.
type ResultSink<S> = Box<dyn FnOnce(Outcome<S>) + Send>;

/// A single outbound connection establishment job.
///
/// See the [module documentation][self] for an overview.
pub struct ConnectJob<L: SocketLayer, E> {
    /// The socket layer issuing the actual syscalls.
    layer: L,

    /// The scheduler delivering readiness and timer events.
    scheduler: E,

    /// The remote address to connect to.
    target: SocketAddr,

    /// The hostname the target was resolved from, if known.
    ///
    /// Used only for address feedback reports.
    hostname: Option<String>,

    /// The upstream peer this connection is accounted to, if any.
    peer: Option<String>,

    /// A caller-supplied socket to connect with instead of opening one.
    socket: Option<L::Socket>,

    /// Timeout and retry policy.
    config: Config,

    /// Where good and bad address reports go.
    feedback: Arc<dyn AddressFeedback + Send + Sync>,

    /// Where successful connections are counted.
    accounting: Arc<dyn PeerAccounting + Send + Sync>,
}

impl<L: SocketLayer, E> ConnectJob<L, E> {
    /// Creates a new job with default configuration.
    pub fn new(layer: L, scheduler: E, target: SocketAddr) -> Self {
        Self::with_config(layer, scheduler, target, Default::default())
    }

    /// Creates a new job with the given configuration.
    pub fn with_config(
        layer: L,
        scheduler: E,
        target: SocketAddr,
        config: Config,
    ) -> Self {
        Self {
            layer,
            scheduler,
            target,
            hostname: None,
            peer: None,
            socket: None,
            config,
            feedback: Arc::new(()),
            accounting: Arc::new(()),
        }
    }

    /// Returns the remote address the job connects to.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Returns the hostname the target was resolved from, if set.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Sets or clears the hostname the target was resolved from.
    ///
    /// Without a hostname the job sends no address feedback.
    pub fn set_hostname(&mut self, hostname: Option<&str>) {
        self.hostname = hostname.map(Into::into);
    }

    /// Sets or clears the upstream peer this connection is accounted to.
    ///
    /// Without a peer the job does no accounting.
    pub fn set_peer(&mut self, peer: Option<&str>) {
        self.peer = peer.map(Into::into);
    }

    /// Supplies an already open socket to connect with.
    ///
    /// The job then skips opening one of its own and owns the supplied
    /// socket under the usual rules: it is closed on every failing exit and
    /// handed back inside [`Outcome::Connected`] on success.
    pub fn set_socket(&mut self, socket: L::Socket) {
        self.socket = Some(socket);
    }

    /// Sets the sink for address feedback reports.
    pub fn set_feedback(
        &mut self,
        feedback: Arc<dyn AddressFeedback + Send + Sync>,
    ) {
        self.feedback = feedback;
    }

    /// Sets the sink for peer accounting.
    pub fn set_accounting(
        &mut self,
        accounting: Arc<dyn PeerAccounting + Send + Sync>,
    ) {
        self.accounting = accounting;
    }

    /// Starts the job.
    ///
    /// Returns a handle for cancelling the job and the driver that performs
    /// the actual work. The driver's [`run`][JobDriver::run] future must be
    /// awaited, most easily by spawning it onto a runtime. `on_complete` is
    /// invoked exactly once with the terminal outcome.
    pub fn start<F>(self, on_complete: F) -> (JobHandle, JobDriver<L, E>)
    where
        F: FnOnce(Outcome<L::Socket>) + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let handle = JobHandle {
            cancel: cancel.clone(),
        };
        let driver = JobDriver {
            layer: self.layer,
            scheduler: self.scheduler,
            target: self.target,
            hostname: self.hostname,
            peer: self.peer,
            socket: self.socket,
            config: self.config,
            feedback: self.feedback,
            accounting: self.accounting,
            cancel,
            sink: Some(Box::new(on_complete)),
            state: State::Idle,
            total_attempts: 0,
            fail_retries: 0,
            last_errno: 0,
        };
        (handle, driver)
    }
}

impl<L: SocketLayer, E> fmt::Debug for ConnectJob<L, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectJob")
            .field("target", &self.target)
            .field("hostname", &self.hostname)
            .field("peer", &self.peer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//------------ JobHandle ------------------------------------------------------

/// Owner-side handle to a started job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    /// Signals the driver to abort.
    cancel: Arc<Notify>,
}

impl JobHandle {
    /// Cancels the job.
    ///
    /// The driver cancels its outstanding watches, closes the socket unless
    /// it was already handed over, and delivers [`Outcome::Aborted`] if no
    /// outcome was delivered yet. Cancelling twice, or cancelling a job
    /// that already completed, is a no-op; the completion handler is never
    /// invoked a second time.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

//------------ JobDriver ------------------------------------------------------

/// The working half of a started connect job.
///
/// [`run`][Self::run] resolves once the terminal outcome has been
/// delivered. Dropping the driver before that counts as cancellation: the
/// socket is closed and a still-waiting caller receives
/// [`Outcome::Aborted`].
pub struct JobDriver<L: SocketLayer, E> {
    /// The socket layer issuing the actual syscalls.
    layer: L,

    /// The scheduler delivering readiness and timer events.
    scheduler: E,

    /// The remote address to connect to.
    target: SocketAddr,

    /// The hostname the target was resolved from, if known.
    hostname: Option<String>,

    /// The upstream peer this connection is accounted to, if any.
    peer: Option<String>,

    /// The socket, until [`run`][Self::run] takes ownership of it.
    socket: Option<L::Socket>,

    /// Timeout and retry policy.
    config: Config,

    /// Where good and bad address reports go.
    feedback: Arc<dyn AddressFeedback + Send + Sync>,

    /// Where successful connections are counted.
    accounting: Arc<dyn PeerAccounting + Send + Sync>,

    /// Cancellation signal shared with the [`JobHandle`].
    cancel: Arc<Notify>,

    /// The completion handler. Consumed on delivery; any later path that
    /// finds it empty does nothing, which is what keeps delivery single.
    sink: Option<ResultSink<L::Socket>>,

    /// Progress of the job.
    state: State,

    /// Connect syscalls issued so far, including re-checks after
    /// writability.
    total_attempts: u32,

    /// Definitive failures so far. Bounded by the retry budget.
    fail_retries: u8,

    /// Raw OS error of the most recent definitive failure.
    last_errno: i32,
}

impl<L, E> JobDriver<L, E>
where
    L: SocketLayer,
    E: EventScheduler<L::Socket>,
{
    /// Drives the job to its terminal outcome.
    ///
    /// Resolves after the completion handler has been invoked. The socket
    /// is owned by this future for the whole run; it leaves either inside
    /// [`Outcome::Connected`] or through the socket layer's close.
    pub async fn run(mut self) {
        debug_assert_eq!(self.state, State::Idle);

        // Get a socket open and ready for connecting with, unless the
        // caller supplied one.
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => match self.layer.open(self.target) {
                Ok(socket) => socket,
                Err(err) => {
                    trace!(addr = %self.target, "socket open failed: {}", err);
                    self.deliver(Outcome::Failed(Error::SocketOpen(
                        Arc::new(err),
                    )));
                    return;
                }
            },
        };

        // Whole-life watches: out-of-band closure and the overall deadline.
        // They are dropped, and thereby cancelled, when this future
        // resolves or is itself dropped.
        let closed = self.scheduler.closed(&socket);
        let deadline_watch =
            self.scheduler.sleep(self.config.connect_timeout);
        let deadline = self.scheduler.now() + self.config.connect_timeout;
        let cancel = self.cancel.clone();
        let addr = self.target;

        self.state = State::Connecting;

        let terminal = tokio::select! {
            biased;
            _ = closed => {
                trace!(%addr, "socket closed out of band");
                Terminal::Aborted
            }
            _ = cancel.notified() => {
                trace!(%addr, "connect job cancelled");
                Terminal::Aborted
            }
            _ = deadline_watch => {
                trace!(%addr, "connect deadline expired");
                Terminal::TimedOut
            }
            terminal = self.attempt_loop(&mut socket, deadline) => terminal,
        };

        match terminal {
            Terminal::Connected => {
                // The counter limits per-peer connections, so increment
                // even though the caller may still drop the connection.
                if let Some(peer) = self.peer.as_deref() {
                    self.accounting.increment_open_connections(peer);
                }
                let local_addr = match self.layer.local_addr(&socket) {
                    Ok(local_addr) => Some(local_addr),
                    Err(err) => {
                        warn!(
                            %addr,
                            "failed to retrieve local address: {}", err
                        );
                        None
                    }
                };
                if let Some(hostname) = self.hostname.as_deref() {
                    self.feedback.report_good(hostname, self.target);
                }
                self.deliver(Outcome::Connected { socket, local_addr });
            }
            Terminal::TimedOut => {
                self.layer.close(socket);
                self.deliver(Outcome::TimedOut);
            }
            Terminal::Failed => {
                self.layer.close(socket);
                self.deliver(Outcome::Failed(Error::Exhausted(
                    self.last_errno,
                )));
            }
            Terminal::Aborted => {
                self.layer.close(socket);
                self.deliver(Outcome::Aborted);
            }
        }
    }

    /// Steps through connect attempts until a terminal classification.
    ///
    /// Runs the `Connecting`, `WaitingWritable` and `RetryScheduled`
    /// states. The deadline is re-checked before every attempt, so a watch
    /// that fires late can never start an attempt past it.
    async fn attempt_loop(
        &mut self,
        socket: &mut L::Socket,
        deadline: Instant,
    ) -> Terminal {
        loop {
            match self.state {
                State::Connecting => {
                    if self.scheduler.now() > deadline {
                        return Terminal::TimedOut;
                    }
                    self.total_attempts += 1;
                    match self.layer.connect(socket, self.target) {
                        ConnectPoll::Success => {
                            trace!(
                                addr = %self.target,
                                tries = self.total_attempts,
                                "connected"
                            );
                            return Terminal::Connected;
                        }
                        ConnectPoll::InProgress => {
                            trace!(
                                addr = %self.target,
                                "connect in progress"
                            );
                            self.state = State::WaitingWritable;
                        }
                        ConnectPoll::Failed(errno) => {
                            trace!(
                                addr = %self.target,
                                errno,
                                "connect attempt failed"
                            );
                            self.last_errno = errno;
                            if let Some(hostname) = self.hostname.as_deref()
                            {
                                self.feedback
                                    .report_bad(hostname, self.target);
                            }
                            self.fail_retries += 1;
                            if self.scheduler.now() > deadline {
                                return Terminal::TimedOut;
                            }
                            if self.fail_retries > self.config.max_retries {
                                return Terminal::Failed;
                            }
                            self.state = State::RetryScheduled;
                        }
                    }
                }
                State::WaitingWritable => {
                    self.scheduler.writable(socket).await;
                    self.state = State::Connecting;
                }
                State::RetryScheduled => {
                    self.scheduler.sleep(self.config.retry_delay).await;
                    self.state = State::Connecting;
                }
                State::Idle | State::Done => {
                    // run() never enters the loop in these states.
                    return Terminal::Aborted;
                }
            }
        }
    }
}

impl<L: SocketLayer, E> JobDriver<L, E> {
    /// Delivers the terminal outcome to the completion handler.
    fn deliver(&mut self, outcome: Outcome<L::Socket>) {
        self.state = State::Done;
        if let Some(sink) = self.sink.take() {
            sink(outcome);
        }
    }
}

impl<L: SocketLayer, E> Drop for JobDriver<L, E> {
    /// Tears down a job that never reached a terminal outcome.
    ///
    /// Covers an owner dropping the driver without running it, and a
    /// runtime aborting the task mid-await: the socket is closed and a
    /// still-waiting caller receives [`Outcome::Aborted`].
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.layer.close(socket);
        }
        if self.sink.is_some() {
            self.deliver(Outcome::Aborted);
        }
    }
}

impl<L: SocketLayer, E> fmt::Debug for JobDriver<L, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDriver")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("total_attempts", &self.total_attempts)
            .field("fail_retries", &self.fail_retries)
            .finish_non_exhaustive()
    }
}

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Tests =========================================================
