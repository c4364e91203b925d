//! Reporting connect results to interested collaborators.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::net::SocketAddr;

//------------ AddressFeedback ------------------------------------------------

/// Records whether a resolved address proved reachable.
///
/// The reports bias future address selection. They are owned by an external
/// cache; a connect job only generates them, one per attempt with a
/// definitive result, and only when it knows the hostname the address was
/// resolved from.
pub trait AddressFeedback {
    /// Marks `addr` as reachable for `hostname`.
    fn report_good(&self, hostname: &str, addr: SocketAddr);

    /// Marks `addr` as unreachable for `hostname`.
    fn report_bad(&self, hostname: &str, addr: SocketAddr);
}

impl AddressFeedback for () {
    fn report_good(&self, _hostname: &str, _addr: SocketAddr) {}

    fn report_bad(&self, _hostname: &str, _addr: SocketAddr) {}
}

//------------ PeerAccounting -------------------------------------------------

/// Open-connection counters for named upstream peers.
///
/// The counter limits connections per peer, so it is incremented as soon as
/// the transport connection is established, even if the caller later drops
/// the connection without using it.
pub trait PeerAccounting {
    /// Counts a newly opened connection to `peer`.
    fn increment_open_connections(&self, peer: &str);
}

impl PeerAccounting for () {
    fn increment_open_connections(&self, _peer: &str) {}
}
