//! Server core: the single-writer event loop and everything that feeds it.
//!
//! One task owns all mutable state. The acceptor, the heartbeat, and the
//! two I/O tasks per connection talk to it only through bounded inboxes,
//! and every blocking send in those tasks races the shutdown token, so the
//! whole task set winds down cooperatively.

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::client::{Channel, Client, ClientId, OUTBOX_CAPACITY};
use super::codec::IrcCodec;
use super::config::Config;
use super::message::Message;
use super::names::canonicalize;

/// Capacity of the event-loop inboxes (new clients, inbound, dead).
const INBOX_CAPACITY: usize = 100;

/// An inbound message tagged with the client that sent it.
#[derive(Debug)]
pub(crate) struct ClientMessage {
    pub id: ClientId,
    pub message: Message,
}

/// All server state. Owned and mutated by the event loop only.
pub struct Server {
    pub(crate) config: Config,
    /// Client id to client.
    pub(crate) clients: HashMap<ClientId, Client>,
    /// Canonical nickname to client id. Also holds unregistered clients
    /// that sent NICK, so uniqueness covers pre-registration claims.
    pub(crate) nicks: HashMap<String, ClientId>,
    /// Canonical channel name to channel.
    pub(crate) channels: HashMap<String, Channel>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Server {
            config,
            clients: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that shuts the server down when cancelled. The in-band
    /// equivalent is the DIE command.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the server on an already-bound listener until shutdown.
    pub async fn run(mut self, listener: TcpListener) -> io::Result<()> {
        let tracker = TaskTracker::new();

        let (new_client_tx, mut new_client_rx) = mpsc::channel(INBOX_CAPACITY);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOX_CAPACITY);
        let (dead_tx, mut dead_rx) = mpsc::channel(INBOX_CAPACITY);
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(1);

        tracker.spawn(accept_loop(
            listener,
            tracker.clone(),
            self.shutdown.clone(),
            new_client_tx,
            inbound_tx,
            dead_tx,
        ));
        tracker.spawn(heartbeat_loop(
            self.config.wakeup_time,
            heartbeat_tx,
            self.shutdown.clone(),
        ));

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                Some(mut client) = new_client_rx.recv() => {
                    info!(id = client.id, ip = %client.ip, "new client");
                    client.last_activity = Instant::now();
                    self.clients.insert(client.id, client);
                }
                Some(inbound) = inbound_rx.recv() => {
                    // The client may have been reaped between enqueue and
                    // dequeue; drop the message if so.
                    if self.clients.contains_key(&inbound.id) {
                        self.handle_message(inbound.id, inbound.message).await;
                    }
                }
                Some(id) = dead_rx.recv() => {
                    if self.clients.contains_key(&id) {
                        info!(id, "client died");
                        self.quit_client(id, "I/O error").await;
                    }
                }
                Some(()) = heartbeat_rx.recv() => {
                    self.sweep_clients().await;
                }
                _ = shutdown.cancelled() => break,
                else => break,
            }
        }

        // Quit whatever DIE did not already reap. This is the path taken
        // when the shutdown token is cancelled from outside.
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.quit_client(id, "Server shutting down").await;
        }

        // The acceptor and heartbeat close their inboxes once they see the
        // shutdown token; drain them so neither blocks on a final send. The
        // inbound and dead inboxes stay open: readers and writers guard
        // those sends with the token instead.
        while new_client_rx.recv().await.is_some() {}
        while heartbeat_rx.recv().await.is_some() {}

        tracker.close();
        tracker.wait().await;
        info!("event loop finished");
        Ok(())
    }

    /// Shutdown sequence: trip the token, then quit every client. The
    /// acceptor sees the token, stops accepting, and drops the listener.
    pub(crate) async fn initiate_shutdown(&mut self) {
        info!("server shutdown initiated");
        self.shutdown.cancel();
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.quit_client(id, "Server shutting down").await;
        }
    }

    /// Liveness sweep, run on each heartbeat. Quiet registered clients get
    /// a PING once per ping period and are reaped after the dead period;
    /// unregistered clients are simply reaped.
    pub(crate) async fn sweep_clients(&mut self) {
        let now = Instant::now();
        let server_name = self.config.get("server-name").to_owned();
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            let (registered, idle, since_ping) = {
                let Some(client) = self.clients.get(&id) else {
                    continue;
                };
                (
                    client.registered,
                    now.duration_since(client.last_activity),
                    now.duration_since(client.last_ping),
                )
            };

            if registered {
                if idle < self.config.ping_time {
                    continue;
                }
                if idle > self.config.dead_time {
                    self.quit_client(id, &format!("Ping timeout: {} seconds", idle.as_secs()))
                        .await;
                    continue;
                }
                if since_ping < self.config.ping_time {
                    continue;
                }
                self.send_server(id, "PING", vec![server_name.clone()]).await;
                if let Some(client) = self.clients.get_mut(&id) {
                    client.last_ping = now;
                }
            } else if idle > self.config.dead_time {
                self.quit_client(id, "Idle too long.").await;
            }
        }
    }

    /// The client-quit procedure: broadcast QUIT to every channel peer
    /// exactly once, drop memberships and the nickname, send the final
    /// ERROR, and close the outbox by dropping the client.
    pub(crate) async fn quit_client(&mut self, id: ClientId, msg: &str) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let registered = client.registered;
        let nick = client.nick.clone();
        let prefix = client.uhost();
        let channel_names: Vec<String> = client.channels.iter().cloned().collect();

        if registered {
            let mut told: HashSet<ClientId> = HashSet::new();
            for name in &channel_names {
                let Some(channel) = self.channels.get(name) else {
                    continue;
                };
                let members: Vec<ClientId> = channel.members.iter().copied().collect();
                for member in members {
                    if told.insert(member) {
                        self.send_from_trailing(&prefix, member, "QUIT", vec![msg.to_owned()])
                            .await;
                    }
                }
            }
            // A client in no channel still sees its own QUIT.
            if !told.contains(&id) {
                self.send_from_trailing(&prefix, id, "QUIT", vec![msg.to_owned()])
                    .await;
            }
            for name in &channel_names {
                self.remove_member(name, id);
            }
            self.nicks.remove(&canonicalize(&nick));
        } else if !nick.is_empty() {
            self.nicks.remove(&canonicalize(&nick));
        }

        self.send_server_trailing(id, "ERROR", vec![msg.to_owned()])
            .await;

        // Dropping the client drops the outbox sender; the writer drains,
        // flushes, and shuts the socket down, which ends the reader.
        self.clients.remove(&id);
        debug!(id, "client removed");
    }

    /// Drop a member from a channel, deleting the channel when it empties.
    pub(crate) fn remove_member(&mut self, name: &str, id: ClientId) {
        if let Some(channel) = self.channels.get_mut(name) {
            channel.members.remove(&id);
            if channel.members.is_empty() {
                self.channels.remove(name);
            }
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.channels.remove(name);
        }
    }

    /// Queue a message onto a client's outbox. Blocks briefly when the
    /// outbox is full; a closed outbox (dead writer) is ignored here and
    /// reaped through the dead-client inbox.
    async fn enqueue(&self, id: ClientId, message: Message) {
        if let Some(client) = self.clients.get(&id) {
            let _ = client.outbox.send(message).await;
        }
    }

    /// Send a server-originated message. Numeric replies get the
    /// recipient's nick prepended, or `*` before one is set.
    pub(crate) async fn send_server(&self, id: ClientId, command: &str, params: Vec<String>) {
        self.send_server_message(id, command, params, false).await;
    }

    /// Like [`Server::send_server`], with the final parameter forced into
    /// trailing form.
    pub(crate) async fn send_server_trailing(
        &self,
        id: ClientId,
        command: &str,
        params: Vec<String>,
    ) {
        self.send_server_message(id, command, params, true).await;
    }

    async fn send_server_message(
        &self,
        id: ClientId,
        command: &str,
        mut params: Vec<String>,
        trailing: bool,
    ) {
        if command.bytes().all(|b| b.is_ascii_digit()) {
            let nick = self
                .clients
                .get(&id)
                .map(|c| c.nick.as_str())
                .filter(|n| !n.is_empty())
                .unwrap_or("*");
            params.insert(0, nick.to_owned());
        }
        let message = Message {
            prefix: Some(self.config.get("server-name").to_owned()),
            command: command.to_owned(),
            params,
            trailing,
        };
        self.enqueue(id, message).await;
    }

    /// Send a message that appears to come from a client, via its
    /// `nick!~user@ip` prefix.
    pub(crate) async fn send_from(
        &self,
        prefix: &str,
        to: ClientId,
        command: &str,
        params: Vec<String>,
    ) {
        self.send_from_message(prefix, to, command, params, false)
            .await;
    }

    /// Like [`Server::send_from`], with the final parameter forced into
    /// trailing form.
    pub(crate) async fn send_from_trailing(
        &self,
        prefix: &str,
        to: ClientId,
        command: &str,
        params: Vec<String>,
    ) {
        self.send_from_message(prefix, to, command, params, true)
            .await;
    }

    async fn send_from_message(
        &self,
        prefix: &str,
        to: ClientId,
        command: &str,
        params: Vec<String>,
        trailing: bool,
    ) {
        let message = Message {
            prefix: Some(prefix.to_owned()),
            command: command.to_owned(),
            params,
            trailing,
        };
        self.enqueue(to, message).await;
    }
}

/// Accept connections until shutdown, wiring up the connection pair for
/// each and announcing the client to the event loop.
async fn accept_loop(
    listener: TcpListener,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    new_client_tx: mpsc::Sender<Client>,
    inbound_tx: mpsc::Sender<ClientMessage>,
    dead_tx: mpsc::Sender<ClientId>,
) {
    let mut next_id: ClientId = 0;
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("acceptor shutting down");
                // Returning drops new_client_tx (closing that inbox) and
                // the listener itself.
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            },
        };

        let id = next_id;
        // Ids are never reused.
        next_id = match next_id.checked_add(1) {
            Some(n) => n,
            None => panic!("client id space exhausted"),
        };

        debug!(%addr, id, "accepted connection");

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let client = Client::new(id, addr.ip(), outbox_tx);

        // Both halves share a child token: it fires on server shutdown, and
        // the writer fires it once the socket is gone, which is what ends a
        // reader whose peer never hangs up.
        let conn = shutdown.child_token();
        let (read_half, write_half) = socket.into_split();
        tracker.spawn(read_loop(
            id,
            read_half,
            inbound_tx.clone(),
            dead_tx.clone(),
            conn.clone(),
        ));
        tracker.spawn(write_loop(id, write_half, outbox_rx, dead_tx.clone(), conn));

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("acceptor shutting down");
                return;
            }
            _ = new_client_tx.send(client) => {}
        }
    }
}

/// Reader half of the connection pair: socket to event loop. `conn` fires
/// on server shutdown or once the writer has closed the socket.
async fn read_loop(
    id: ClientId,
    read_half: OwnedReadHalf,
    inbound_tx: mpsc::Sender<ClientMessage>,
    dead_tx: mpsc::Sender<ClientId>,
    conn: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, IrcCodec);
    loop {
        let frame = tokio::select! {
            _ = conn.cancelled() => {
                debug!(id, "reader shutting down");
                return;
            }
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(message)) => {
                tokio::select! {
                    _ = conn.cancelled() => {
                        debug!(id, "reader shutting down");
                        return;
                    }
                    sent = inbound_tx.send(ClientMessage { id, message }) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                debug!(id, "read error: {e}");
                notify_dead(id, &dead_tx, &conn).await;
                return;
            }
            None => {
                debug!(id, "connection closed by peer");
                notify_dead(id, &dead_tx, &conn).await;
                return;
            }
        }
    }
}

/// Writer half of the connection pair: outbox to socket. The outbox closing
/// is the signal that everything queued has been flushed and the socket may
/// go away.
async fn write_loop(
    id: ClientId,
    write_half: OwnedWriteHalf,
    mut outbox_rx: mpsc::Receiver<Message>,
    dead_tx: mpsc::Sender<ClientId>,
    conn: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, IrcCodec);
    while let Some(message) = outbox_rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(id, "write error: {e}");
            notify_dead(id, &dead_tx, &conn).await;
            break;
        }
    }

    let mut socket = sink.into_inner();
    let _ = socket.shutdown().await;
    // Let the reader go too; its half of a closed socket would otherwise
    // keep it parked until the peer hangs up.
    conn.cancel();
    debug!(id, "writer terminating");
}

/// Report a dead client without blocking through a shutdown.
async fn notify_dead(id: ClientId, dead_tx: &mpsc::Sender<ClientId>, conn: &CancellationToken) {
    tokio::select! {
        _ = conn.cancelled() => {}
        _ = dead_tx.send(id) => {}
    }
}

/// Wake the event loop every `period` so it can run the liveness sweep.
async fn heartbeat_loop(period: Duration, tx: mpsc::Sender<()>, shutdown: CancellationToken) {
    loop {
        tokio::time::sleep(period).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(()) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if shutdown.is_cancelled() {
            break;
        }
    }
    // Dropping tx closes the heartbeat inbox.
    info!("heartbeat shutting down");
}
