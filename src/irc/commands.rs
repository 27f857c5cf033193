//! Protocol dispatch: the command table and its handlers.
//!
//! Handlers run inside the event loop and are the only code that mutates
//! server state. Replies leave through client outboxes; sockets are never
//! touched here.

use std::collections::HashSet;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::debug;

use super::client::{Channel, ClientId};
use super::message::{Message, MAX_LINE_LENGTH};
use super::names::{canonicalize, is_valid_channel, is_valid_nick, is_valid_user};
use super::server::Server;

type Handler = for<'a> fn(&'a mut Server, ClientId, Message) -> BoxFuture<'a, ()>;

/// One entry in the dispatch table.
struct CommandEntry {
    name: &'static str,
    /// Accepted before registration completes. Everything else draws a 451.
    pre_registration: bool,
    handler: Handler,
}

/// The command table. Lookup is by upper-cased name; unknown commands fall
/// through to the default arm in [`Server::handle_message`].
static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "CAP",
        pre_registration: true,
        handler: |server: &mut Server, id, message| Box::pin(server.cap(id, message)),
    },
    CommandEntry {
        name: "NICK",
        pre_registration: true,
        handler: |server: &mut Server, id, message| Box::pin(server.nick(id, message)),
    },
    CommandEntry {
        name: "USER",
        pre_registration: true,
        handler: |server: &mut Server, id, message| Box::pin(server.user(id, message)),
    },
    CommandEntry {
        name: "QUIT",
        pre_registration: true,
        handler: |server: &mut Server, id, message| Box::pin(server.quit(id, message)),
    },
    CommandEntry {
        name: "PONG",
        pre_registration: true,
        handler: |server: &mut Server, id, message| Box::pin(server.pong(id, message)),
    },
    CommandEntry {
        name: "JOIN",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.join(id, message)),
    },
    CommandEntry {
        name: "PART",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.part(id, message)),
    },
    CommandEntry {
        name: "PRIVMSG",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.privmsg(id, message)),
    },
    CommandEntry {
        name: "LUSERS",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.lusers(id, message)),
    },
    CommandEntry {
        name: "MOTD",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.motd(id, message)),
    },
    CommandEntry {
        name: "PING",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.ping(id, message)),
    },
    CommandEntry {
        name: "DIE",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.die(id, message)),
    },
    CommandEntry {
        name: "WHOIS",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.whois(id, message)),
    },
    CommandEntry {
        name: "OPER",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.oper(id, message)),
    },
    CommandEntry {
        name: "MODE",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.mode(id, message)),
    },
    CommandEntry {
        name: "WHO",
        pre_registration: false,
        handler: |server: &mut Server, id, message| Box::pin(server.who(id, message)),
    },
];

impl Server {
    /// Dispatch one inbound message from a connected client.
    pub(crate) async fn handle_message(&mut self, id: ClientId, message: Message) {
        let registered = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            client.last_activity = Instant::now();
            client.registered
        };

        // Clients must not send a source prefix (RFC 1459 section 2.3).
        if message.prefix.as_deref().is_some_and(|p| !p.is_empty()) {
            self.send_server(id, "ERROR", vec!["Do not send a prefix".into()])
                .await;
            return;
        }

        let name = message.command.to_uppercase();
        match COMMANDS.iter().find(|entry| entry.name == name) {
            Some(entry) if entry.pre_registration || registered => {
                (entry.handler)(self, id, message).await;
            }
            Some(_) | None if !registered => {
                self.send_server(id, "451", vec!["You have not registered.".into()])
                    .await;
            }
            _ => {
                debug!(id, command = %message.command, "unknown command");
                self.send_server(
                    id,
                    "421",
                    vec![message.command.clone(), "Unknown command".into()],
                )
                .await;
            }
        }
    }

    /// CAP is not part of the RFC but widely sent; accept and ignore it.
    async fn cap(&mut self, _id: ClientId, _message: Message) {}

    async fn nick(&mut self, id: ClientId, message: Message) {
        let Some(nick) = message.params.first() else {
            self.send_server(id, "431", vec!["No nickname given".into()])
                .await;
            return;
        };
        if !is_valid_nick(nick) {
            self.send_server(id, "432", vec![nick.clone(), "Erroneous nickname".into()])
                .await;
            return;
        }

        let canon = canonicalize(nick);
        if self.nicks.contains_key(&canon) {
            // Sent as 432 rather than the RFC's 433.
            self.send_server(
                id,
                "432",
                vec![nick.clone(), "Nickname is already in use".into()],
            )
            .await;
            return;
        }

        // Claim the new nick, then release the old one.
        self.nicks.insert(canon, id);
        let (registered, old_nick, old_prefix, channel_names) = {
            let Some(client) = self.clients.get(&id) else {
                return;
            };
            (
                client.registered,
                client.nick.clone(),
                client.uhost(),
                client.channels.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if !old_nick.is_empty() {
            self.nicks.remove(&canonicalize(&old_nick));
        }

        if registered {
            // Everyone sharing a channel hears about the change once, from
            // the old identity.
            let mut informed: HashSet<ClientId> = HashSet::new();
            for name in &channel_names {
                let Some(channel) = self.channels.get(name) else {
                    continue;
                };
                let members: Vec<ClientId> = channel.members.iter().copied().collect();
                for member in members {
                    if informed.insert(member) {
                        self.send_from(&old_prefix, member, "NICK", vec![nick.clone()])
                            .await;
                    }
                }
            }
            if !informed.contains(&id) {
                self.send_from(&old_prefix, id, "NICK", vec![nick.clone()])
                    .await;
            }
        }

        // The stored nick changes only after the announcements went out.
        if let Some(client) = self.clients.get_mut(&id) {
            client.nick = nick.clone();
        }
    }

    async fn user(&mut self, id: ClientId, message: Message) {
        {
            let Some(client) = self.clients.get(&id) else {
                return;
            };
            if client.registered {
                self.send_server(
                    id,
                    "462",
                    vec!["Unauthorized command (already registered)".into()],
                )
                .await;
                return;
            }
            // NICK must come first; the RFC only recommends the order.
            if client.nick.is_empty() {
                self.send_server(id, "ERROR", vec!["Please send NICK first".into()])
                    .await;
                return;
            }
        }

        // Exactly <user> <mode> <unused> <realname>.
        if message.params.len() != 4 {
            self.send_server(
                id,
                "461",
                vec![message.command.clone(), "Not enough parameters".into()],
            )
            .await;
            return;
        }

        let user = &message.params[0];
        if !is_valid_user(user) {
            self.send_server(id, "ERROR", vec!["Invalid username".into()])
                .await;
            return;
        }

        let realname = &message.params[3];
        if realname.len() > 64 {
            self.send_server(id, "ERROR", vec!["Invalid realname".into()])
                .await;
            return;
        }

        let uhost = {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            client.user = user.clone();
            client.realname = realname.clone();
            client.registered = true;
            client.uhost()
        };

        // Registration is complete; RFC 2813 lists what to send.
        self.send_server(
            id,
            "001",
            vec![format!("Welcome to the Internet Relay Network {uhost}")],
        )
        .await;
        self.send_server(
            id,
            "002",
            vec![format!(
                "Your host is {}, running version {}",
                self.config.get("server-name"),
                self.config.get("version")
            )],
        )
        .await;
        self.send_server(
            id,
            "003",
            vec![format!(
                "This server was created {}",
                self.config.get("created-date")
            )],
        )
        .await;
        self.send_server(
            id,
            "004",
            vec![
                self.config.get("server-name").to_owned(),
                self.config.get("version").to_owned(),
                "o".into(),
                "n".into(),
            ],
        )
        .await;

        self.send_lusers(id).await;
        self.send_motd(id).await;
    }

    async fn join(&mut self, id: ClientId, message: Message) {
        let Some(first) = message.params.first() else {
            self.send_server(id, "461", vec!["JOIN".into(), "Not enough parameters".into()])
                .await;
            return;
        };

        // JOIN 0 leaves every channel.
        if message.params.len() == 1 && first == "0" {
            let names: Vec<String> = self
                .clients
                .get(&id)
                .map(|c| c.channels.iter().cloned().collect())
                .unwrap_or_default();
            for name in names {
                self.part_channel(id, &name, "").await;
            }
            return;
        }

        // Single channel only; comma-separated lists are not supported.
        let name = canonicalize(first);
        if !is_valid_channel(&name) {
            self.send_server(id, "403", vec![name, "Invalid channel name".into()])
                .await;
            return;
        }

        let already = self
            .clients
            .get(&id)
            .is_some_and(|c| c.channels.contains(&name));
        if already {
            self.send_server(id, "ERROR", vec!["You are on that channel".into()])
                .await;
            return;
        }

        // Create lazily, then wire up both sides of the membership.
        let members: Vec<ClientId> = {
            let channel = self
                .channels
                .entry(name.clone())
                .or_insert_with(|| Channel::new(name.clone()));
            channel.members.insert(id);
            channel.members.iter().copied().collect()
        };
        let prefix = match self.clients.get_mut(&id) {
            Some(client) => {
                client.channels.insert(name.clone());
                client.uhost()
            }
            None => return,
        };

        // Echo JOIN to the joiner before anything else.
        self.send_from(&prefix, id, "JOIN", vec![name.clone()]).await;

        // Names list: one 353 per member, then the terminator. The names
        // field is a space-delimited list, so it always goes out in
        // trailing form, one nick or not.
        for member in &members {
            let Some(member_nick) = self.clients.get(member).map(|c| c.nick.clone()) else {
                continue;
            };
            self.send_server_trailing(id, "353", vec!["=".into(), name.clone(), member_nick])
                .await;
        }
        self.send_server(id, "366", vec![name.clone(), "End of NAMES list".into()])
            .await;

        // Now tell the rest of the channel.
        for member in &members {
            if *member != id {
                self.send_from(&prefix, *member, "JOIN", vec![name.clone()])
                    .await;
            }
        }
    }

    async fn part(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.send_server(id, "461", vec!["PART".into(), "Not enough parameters".into()])
                .await;
            return;
        }
        let part_message = message.params.get(1).cloned().unwrap_or_default();
        self.part_channel(id, &message.params[0], &part_message).await;
    }

    /// Leave one channel. Shared by PART and JOIN 0.
    async fn part_channel(&mut self, id: ClientId, channel_name: &str, part_message: &str) {
        let name = canonicalize(channel_name);
        if !is_valid_channel(&name) {
            self.send_server(id, "403", vec![name, "Invalid channel name".into()])
                .await;
            return;
        }
        if !self.channels.contains_key(&name) {
            self.send_server(id, "403", vec![name, "No such channel".into()])
                .await;
            return;
        }
        let member = self
            .clients
            .get(&id)
            .is_some_and(|c| c.channels.contains(&name));
        if !member {
            self.send_server(id, "403", vec![name, "You are not on that channel".into()])
                .await;
            return;
        }

        let prefix = match self.clients.get(&id) {
            Some(client) => client.uhost(),
            None => return,
        };
        let mut params = vec![name.clone()];
        if !part_message.is_empty() {
            params.push(part_message.to_owned());
        }

        // Everyone on the channel hears the PART, the parting client
        // included; only then does the membership change. The part message,
        // when present, is free text and goes out in trailing form.
        let members: Vec<ClientId> = self
            .channels
            .get(&name)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        for member in members {
            if part_message.is_empty() {
                self.send_from(&prefix, member, "PART", params.clone()).await;
            } else {
                self.send_from_trailing(&prefix, member, "PART", params.clone())
                    .await;
            }
        }
        self.remove_member(&name, id);
    }

    async fn privmsg(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.send_server(id, "411", vec!["No recipient given (PRIVMSG)".into()])
                .await;
            return;
        }
        if message.params.len() == 1 {
            self.send_server(id, "412", vec!["No text to send".into()])
                .await;
            return;
        }

        let target = message.params[0].clone();
        let prefix = match self.clients.get(&id) {
            Some(client) => client.uhost(),
            None => return,
        };

        // Trim the tail until prefix plus framing fits the wire limit.
        let mut text = message.params[1].clone();
        let overhead =
            ":".len() + prefix.len() + " PRIVMSG ".len() + target.len() + " :".len() + "\r\n".len();
        if overhead + text.len() > MAX_LINE_LENGTH {
            let mut keep = MAX_LINE_LENGTH.saturating_sub(overhead);
            while keep > 0 && !text.is_char_boundary(keep) {
                keep -= 1;
            }
            text.truncate(keep);
        }

        if target.starts_with('#') {
            let name = canonicalize(&target);
            if !is_valid_channel(&name) {
                self.send_server(id, "404", vec![name, "Cannot send to channel".into()])
                    .await;
                return;
            }
            let Some(channel) = self.channels.get(&name) else {
                self.send_server(id, "403", vec![name, "No such channel".into()])
                    .await;
                return;
            };
            if !channel.members.contains(&id) {
                self.send_server(id, "404", vec![name, "Cannot send to channel".into()])
                    .await;
                return;
            }
            let members: Vec<ClientId> = channel.members.iter().copied().collect();
            for member in members {
                if member != id {
                    self.send_from_trailing(
                        &prefix,
                        member,
                        "PRIVMSG",
                        vec![name.clone(), text.clone()],
                    )
                    .await;
                }
            }
            return;
        }

        // A direct message to a nick.
        let nick = canonicalize(&target);
        if !is_valid_nick(&nick) {
            self.send_server(id, "401", vec![nick, "No such nick/channel".into()])
                .await;
            return;
        }
        let Some(&to) = self.nicks.get(&nick) else {
            self.send_server(id, "401", vec![nick, "No such nick/channel".into()])
                .await;
            return;
        };
        self.send_from_trailing(&prefix, to, "PRIVMSG", vec![nick, text])
            .await;
    }

    async fn lusers(&mut self, id: ClientId, _message: Message) {
        self.send_lusers(id).await;
    }

    pub(crate) async fn send_lusers(&self, id: ClientId) {
        self.send_server(
            id,
            "251",
            vec![format!(
                "There are {} users and 0 services on 0 servers.",
                self.nicks.len()
            )],
        )
        .await;

        // 252 would be the operator count; not reported.

        let unknown = self.clients.len().saturating_sub(self.nicks.len());
        if unknown > 0 {
            self.send_server(
                id,
                "253",
                vec![unknown.to_string(), "unknown connection(s)".into()],
            )
            .await;
        }

        if !self.channels.is_empty() {
            self.send_server(
                id,
                "254",
                vec![self.channels.len().to_string(), "channels formed".into()],
            )
            .await;
        }

        self.send_server(
            id,
            "255",
            vec![format!("I have {} clients and 0 servers", self.nicks.len())],
        )
        .await;
    }

    async fn motd(&mut self, id: ClientId, _message: Message) {
        self.send_motd(id).await;
    }

    pub(crate) async fn send_motd(&self, id: ClientId) {
        self.send_server(
            id,
            "375",
            vec![format!(
                "- {} Message of the day - ",
                self.config.get("server-name")
            )],
        )
        .await;
        self.send_server(id, "372", vec![format!("- {}", self.config.get("motd"))])
            .await;
        self.send_server(id, "376", vec!["End of MOTD command".into()])
            .await;
    }

    async fn quit(&mut self, id: ClientId, message: Message) {
        let mut msg = String::from("Quit:");
        if let Some(reason) = message.params.first() {
            msg.push(' ');
            msg.push_str(reason);
        }
        self.quit_client(id, &msg).await;
    }

    async fn ping(&mut self, id: ClientId, message: Message) {
        // A single <server> parameter; forwarding is not supported.
        let Some(origin) = message.params.first() else {
            self.send_server(id, "409", vec!["No origin specified".into()])
                .await;
            return;
        };
        if origin.as_str() != self.config.get("server-name") {
            self.send_server(id, "402", vec![origin.clone(), "No such server".into()])
                .await;
            return;
        }
        self.send_server(id, "PONG", vec![origin.clone()]).await;
    }

    /// The preamble already recorded the activity; nothing else to do.
    async fn pong(&mut self, _id: ClientId, _message: Message) {}

    async fn die(&mut self, _id: ClientId, _message: Message) {
        // TODO: require operator status.
        self.initiate_shutdown().await;
    }

    async fn whois(&mut self, id: ClientId, message: Message) {
        // A single nickname; masks and server targets are not supported.
        let Some(target) = message.params.first() else {
            self.send_server(id, "431", vec!["No nickname given".into()])
                .await;
            return;
        };
        let Some(&target_id) = self.nicks.get(&canonicalize(target)) else {
            self.send_server(id, "401", vec![target.clone(), "No such nick/channel".into()])
                .await;
            return;
        };
        let (nick, user, ip, realname, operator, idle_secs) = {
            let Some(target_client) = self.clients.get(&target_id) else {
                return;
            };
            (
                target_client.nick.clone(),
                target_client.user.clone(),
                target_client.ip.to_string(),
                target_client.realname.clone(),
                target_client.is_operator(),
                target_client.last_activity.elapsed().as_secs(),
            )
        };

        self.send_server(
            id,
            "311",
            vec![nick.clone(), user, ip, "*".into(), realname],
        )
        .await;
        self.send_server(
            id,
            "312",
            vec![
                nick.clone(),
                self.config.get("server-name").to_owned(),
                self.config.get("server-info").to_owned(),
            ],
        )
        .await;
        if operator {
            self.send_server(id, "313", vec![nick.clone(), "is an IRC operator".into()])
                .await;
        }
        self.send_server(
            id,
            "317",
            vec![nick.clone(), idle_secs.to_string(), "seconds idle".into()],
        )
        .await;
        self.send_server(id, "318", vec![nick, "End of WHOIS list".into()])
            .await;
    }

    async fn oper(&mut self, id: ClientId, message: Message) {
        if message.params.len() < 2 {
            self.send_server(id, "461", vec!["OPER".into(), "Not enough parameters".into()])
                .await;
            return;
        }
        let already = self.clients.get(&id).is_some_and(|c| c.is_operator());
        if already {
            self.send_server(id, "ERROR", vec!["You are already an operator.".into()])
                .await;
            return;
        }

        let name = &message.params[0];
        let password = &message.params[1];
        if self.config.opers.get(name) != Some(password) {
            self.send_server(id, "464", vec!["Password incorrect".into()])
                .await;
            return;
        }

        let (prefix, nick) = match self.clients.get_mut(&id) {
            Some(client) => {
                client.modes.insert('o');
                (client.uhost(), client.nick.clone())
            }
            None => return,
        };
        self.send_from(&prefix, id, "MODE", vec![nick, "+o".into()])
            .await;
        self.send_server(id, "381", vec!["You are now an IRC operator".into()])
            .await;
    }

    async fn mode(&mut self, id: ClientId, message: Message) {
        if message.params.is_empty() {
            self.send_server(id, "461", vec!["MODE".into(), "Not enough parameters".into()])
                .await;
            return;
        }
        let target = message.params[0].clone();
        let modes = message.params.get(1).cloned().unwrap_or_default();

        let canon = canonicalize(&target);
        if let Some(&target_id) = self.nicks.get(&canon) {
            self.user_mode(id, target_id, &modes).await;
            return;
        }
        if self.channels.contains_key(&canon) {
            self.channel_mode(id, &canon, &modes).await;
            return;
        }

        // Nothing by that name; 403 is the closest extant error.
        self.send_server(id, "403", vec![target, "No such channel".into()])
            .await;
    }

    async fn user_mode(&mut self, id: ClientId, target_id: ClientId, modes: &str) {
        if target_id != id {
            self.send_server(id, "502", vec!["Cannot change mode for other users".into()])
                .await;
            return;
        }

        // No modes requested: report the current set.
        if modes.is_empty() {
            let flags: String = self
                .clients
                .get(&id)
                .map(|c| c.modes.iter().collect())
                .unwrap_or_default();
            self.send_server(id, "221", vec![format!("+{flags}")]).await;
            return;
        }

        let mut action = ' ';
        for flag in modes.chars() {
            if flag == '+' || flag == '-' {
                action = flag;
                continue;
            }
            if action == ' ' {
                self.send_server(id, "ERROR", vec!["Malformed MODE".into()])
                    .await;
                continue;
            }
            // Ignored silently so common clients see no unknown-mode noise.
            if flag == 'i' || flag == 'w' || flag == 's' {
                continue;
            }
            if flag != 'o' {
                self.send_server(id, "501", vec!["Unknown MODE flag".into()])
                    .await;
                continue;
            }
            // Operator status is only gained through OPER.
            if action == '+' {
                continue;
            }
            let dropped = match self.clients.get_mut(&id) {
                Some(client) if client.is_operator() => {
                    client.modes.remove(&'o');
                    Some((client.uhost(), client.nick.clone()))
                }
                _ => None,
            };
            if let Some((prefix, nick)) = dropped {
                self.send_from(&prefix, id, "MODE", vec!["-o".into(), nick])
                    .await;
            }
        }
    }

    async fn channel_mode(&mut self, id: ClientId, name: &str, modes: &str) {
        let member = self
            .channels
            .get(name)
            .is_some_and(|c| c.members.contains(&id));
        if !member {
            self.send_server(
                id,
                "442",
                vec![name.to_owned(), "You're not on that channel".into()],
            )
            .await;
            return;
        }

        // +n is the only channel mode there is.
        if modes.is_empty() {
            self.send_server(id, "324", vec![name.to_owned(), "+n".into()])
                .await;
            return;
        }

        // No ban support; the list is always empty.
        if modes == "b" || modes == "+b" {
            self.send_server(
                id,
                "368",
                vec![name.to_owned(), "End of channel ban list".into()],
            )
            .await;
            return;
        }

        // Channel operators are unimplemented, so every mutation is refused.
        self.send_server(
            id,
            "482",
            vec![name.to_owned(), "You're not channel operator".into()],
        )
        .await;
    }

    async fn who(&mut self, id: ClientId, message: Message) {
        // Only `WHO #channel` is supported.
        if message.params.is_empty() {
            self.send_server(
                id,
                "461",
                vec![message.command.clone(), "Not enough parameters".into()],
            )
            .await;
            return;
        }

        let name = canonicalize(&message.params[0]);
        let members: Vec<ClientId> = match self.channels.get(&name) {
            Some(channel) if channel.members.contains(&id) => {
                channel.members.iter().copied().collect()
            }
            Some(_) => {
                self.send_server(
                    id,
                    "442",
                    vec![name, "You're not on that channel".into()],
                )
                .await;
                return;
            }
            None => {
                self.send_server(
                    id,
                    "403",
                    vec![message.params[0].clone(), "Invalid channel name".into()],
                )
                .await;
                return;
            }
        };

        let server_name = self.config.get("server-name").to_owned();
        for member in members {
            let Some(client) = self.clients.get(&member) else {
                continue;
            };
            let mut flags = String::from("H");
            if client.is_operator() {
                flags.push('*');
            }
            self.send_server(
                id,
                "352",
                vec![
                    name.clone(),
                    client.user.clone(),
                    client.ip.to_string(),
                    server_name.clone(),
                    client.nick.clone(),
                    flags,
                    format!("0 {}", client.realname),
                ],
            )
            .await;
        }
        self.send_server(id, "315", vec![name, "End of WHO list".into()])
            .await;
    }
}
