//! Establishing outbound TCP connections for a forwarding proxy.
//!
//! This crate provides the connection establishment engine of a forwarding
//! proxy: it opens a single non-blocking TCP connection to a resolved
//! remote endpoint, bounded by an overall timeout and a retry budget, and
//! reports exactly one terminal outcome to its caller. It never blocks the
//! calling thread; all waiting happens through asynchronous watches.
//!
//! The engine deliberately does *not* resolve names, select among several
//! candidate addresses, negotiate TLS, or pool connections. It establishes
//! the raw transport connection to one address and hands it over; anything
//! above that is the caller's business.
//!
//! # Modules
//!
//! * [job] holds the engine itself: the [`ConnectJob`][job::ConnectJob]
//!   state machine, its [`Config`][job::Config], and the
//!   [`Outcome`][job::Outcome] it delivers.
//! * [socket] defines the [`SocketLayer`][socket::SocketLayer] the engine
//!   issues its syscalls through, with an OS-backed implementation.
//! * [scheduler] defines the [`EventScheduler`][scheduler::EventScheduler]
//!   that delivers writability, closure, and timer events, with a
//!   Tokio-backed implementation.
//! * [error] is the error type carried inside failed outcomes.
//! * [feedback] holds the sink traits for address reachability reports and
//!   per-peer connection accounting.
//!
//! See the [job] module documentation for a usage example.

#![warn(missing_docs)]

pub mod error;
pub mod feedback;
pub mod job;
pub mod scheduler;
pub mod socket;
