//! tarn is a small IRC daemon: nickname and channel registration, channel
//! and direct messaging, WHOIS/WHO presence queries, operator
//! authentication, PING/PONG liveness, and cooperative shutdown, all over
//! plain TCP.
//!
//! One event-loop task owns every piece of mutable state; per-connection
//! reader and writer tasks, the acceptor, and the heartbeat feed it through
//! bounded channels. See [`irc::server::Server`].

pub mod irc;
