//! Per-connection client state and channels.
//!
//! Both types are plain data owned by the server's maps. A client refers to
//! its channels by canonical name and a channel to its members by client id;
//! all resolution goes through the server, so there are no owning cycles.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use super::message::Message;

/// Unique within one server run; never reused.
pub type ClientId = u64;

/// Messages a client outbox buffers before enqueueing applies backpressure
/// to the event loop.
pub const OUTBOX_CAPACITY: usize = 100;

/// A connected user.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub ip: IpAddr,
    /// Empty until the first NICK. Stored as sent, not canonicalized.
    pub nick: String,
    pub user: String,
    pub realname: String,
    /// True once both NICK and USER have completed.
    pub registered: bool,
    /// Single-character user modes (`o` for operator).
    pub modes: HashSet<char>,
    /// Canonical names of joined channels.
    pub channels: HashSet<String>,
    /// Last time the client sent us anything.
    pub last_activity: Instant,
    /// Last time we sent the client a PING.
    pub last_ping: Instant,
    /// Sender half of the writer task's outbox. Dropped with the Client,
    /// which closes the outbox and lets the writer flush and hang up.
    pub outbox: mpsc::Sender<Message>,
}

impl Client {
    pub fn new(id: ClientId, ip: IpAddr, outbox: mpsc::Sender<Message>) -> Self {
        let now = Instant::now();
        Client {
            id,
            ip,
            nick: String::new(),
            user: String::new(),
            realname: String::new(),
            registered: false,
            modes: HashSet::new(),
            channels: HashSet::new(),
            last_activity: now,
            last_ping: now,
            outbox,
        }
    }

    /// The `nick!~user@ip` source identity this client's messages carry.
    pub fn uhost(&self) -> String {
        format!("{}!~{}@{}", self.nick, self.user, self.ip)
    }

    pub fn is_operator(&self) -> bool {
        self.modes.contains(&'o')
    }
}

/// A chat room. Created on first JOIN, dropped when the last member leaves.
#[derive(Debug)]
pub struct Channel {
    /// Canonical (lower-cased) name.
    pub name: String,
    /// Member client ids.
    pub members: HashSet<ClientId>,
}

impl Channel {
    pub fn new(name: String) -> Self {
        Channel {
            name,
            members: HashSet::new(),
        }
    }
}
