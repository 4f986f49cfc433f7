//! The owned connection state and its single-consumer dispatch loop.
//!
//! A [`Conn`] lives on exactly one task. The owner loop selects over the
//! inbound line queue, the writer's error channel, and the invoker queue;
//! every handler — internal protocol handlers first, then user handlers —
//! runs inline on that task, so handlers read and mutate the `Conn`
//! without locks. Work arrives from other tasks only through the invoker
//! queue or as pre-composed lines on the writer queue.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::handlers;
use crate::message::{parse_line, Line, User};
use crate::registry::{CallbackRegistry, HandlerId};
use crate::safe::{SafeConn, SafeConnState};
use crate::wire::{
    compose_ctcp, compose_join, compose_nick, compose_notice, compose_part, compose_privmsg,
    compose_quit, filter_message, first_line, first_word,
};

/// A closure shipped from another task to run on the owner task.
pub(crate) type Invoke = Box<dyn FnOnce(&mut Conn) + Send>;

/// Override for picking a new nick after a 431/432/433/436/437, given the
/// contested nick and the numeric code.
pub type NickInUseFn = Box<dyn FnMut(&str, u16) -> String + Send>;

/// Handles to the reader and writer pump tasks. Present while the
/// connection is open; taken by shutdown, which cancels the reader and
/// detaches the writer (the writer pump exits on its own once its queue
/// closes).
pub(crate) struct IoHandles {
    pub(crate) reader: JoinHandle<()>,
    pub(crate) writer: JoinHandle<()>,
}

/// A connection to a single IRC server.
///
/// Obtained only inside callbacks (the `init` callback and every handler).
/// To interact with the connection from elsewhere, take a [`SafeConn`] via
/// [`Conn::safe_conn`].
pub struct Conn {
    pub(crate) me: User,
    pub(crate) state_registry: CallbackRegistry,
    pub(crate) substate: Arc<SafeConnState>,
    pub(crate) nick_in_use: Option<NickInUseFn>,
    /// Owner-context end of the writer queue. `None` until the pumps are
    /// wired up (after `init` returns) and again after shutdown.
    pub(crate) writer: Option<UnboundedSender<String>>,
    pub(crate) io: Option<IoHandles>,
    /// Most recent nick attempted by the default collision policy.
    pub(crate) last_nick: String,
}

impl Conn {
    /// The client's own identity. The nick is authoritative; the user and
    /// host portions are whatever was configured.
    pub fn me(&self) -> &User {
        &self.me
    }

    /// The `host:port` pair identifying the server.
    pub fn server(&self) -> &str {
        &self.substate.server
    }

    /// Whether the connection is currently open. After disconnecting, the
    /// owner loop still drains any outstanding lines and invokes.
    pub fn connected(&self) -> bool {
        self.io.is_some()
    }

    /// Detach a thread-safe handle sharing this connection's state.
    pub fn safe_conn(&self) -> SafeConn {
        SafeConn::new(self.me.clone(), Arc::clone(&self.substate))
    }

    /// Register a handler for an IRC command, numeric, or `irc:*` event.
    /// The returned id can be passed to [`Conn::remove_handler`].
    pub fn add_handler<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&mut Conn, &Line) + Send + Sync + 'static,
    {
        self.substate.registry.add(name, handler)
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, id: HandlerId) {
        self.substate.registry.remove(id);
    }

    /// Forcibly terminate the connection. Idempotent. Cancels the reader
    /// task, closes the writer queue, clears the shared channels so every
    /// [`SafeConn`] send starts returning `false`, and fires
    /// `irc:disconnected`.
    ///
    /// The writer pump is not cancelled: once every sender is gone it
    /// finishes any pacing sleep in progress, drains what was queued, and
    /// exits on its own, closing its error channel — the owner loop's
    /// secondary exit path.
    pub fn shutdown(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };
        // Socket-close analog: the reader is parked in read_line with no
        // queue of its own to observe.
        io.reader.abort();
        drop(io.writer);

        self.writer = None;
        {
            let mut channels = self.substate.channels.write();
            channels.writer = None;
            channels.invoker = None;
        }

        let registry = self.substate.registry.clone();
        let line = Line::event(crate::DISCONNECTED, self.me.clone());
        registry.dispatch(crate::DISCONNECTED, self, &line);
    }

    fn send_line(&self, line: String) {
        // No writer before the pumps are wired up (during `init`) or
        // after shutdown; early and late sends die quietly.
        if let Some(writer) = &self.writer {
            let _ = writer.send(line);
        }
    }

    /// Send a raw line (clamped to its first line and sanitized).
    pub fn raw(&self, msg: &str) {
        self.send_line(filter_message(first_line(msg)));
    }

    pub fn privmsg(&self, dst: &str, msg: &str) {
        self.send_line(compose_privmsg(dst, msg));
    }

    pub fn notice(&self, dst: &str, msg: &str) {
        self.send_line(compose_notice(dst, msg));
    }

    pub fn action(&self, dst: &str, msg: &str) {
        self.send_line(compose_ctcp(dst, "ACTION", msg, false));
    }

    pub fn ctcp(&self, dst: &str, command: &str, args: &str) {
        self.send_line(compose_ctcp(dst, command, args, false));
    }

    pub fn ctcp_reply(&self, dst: &str, command: &str, args: &str) {
        self.send_line(compose_ctcp(dst, command, args, true));
    }

    pub fn quit(&self, msg: &str) {
        self.send_line(compose_quit(msg));
    }

    pub fn nick(&self, newnick: &str) {
        self.send_line(compose_nick(newnick));
    }

    /// JOIN one or more channels, with optional keys. An empty channel
    /// list sends nothing.
    pub fn join(&self, channels: &[&str], keys: &[&str]) {
        if !channels.is_empty() {
            self.send_line(compose_join(channels, keys));
        }
    }

    /// PART one or more channels. An empty channel list sends nothing.
    pub fn part(&self, channels: &[&str], msg: &str) {
        if !channels.is_empty() {
            self.send_line(compose_part(channels, msg));
        }
    }

    /// Respond to an incoming CTCP with the built-in behavior (PING, TIME,
    /// and VERSION replies). Runs automatically when no user handler is
    /// registered for `irc:ctcp`; a registered handler may call it to chain
    /// to the default behavior.
    pub fn default_ctcp_handler(&self, line: &Line) {
        handlers::default_ctcp(self, line);
    }

    /// Default nick-collision policy: append `_`, or if the server
    /// truncated the previous attempt, rewrite the rightmost
    /// non-underscore. Gives up (shuts down, returns empty) when there is
    /// no nick to vary or nothing but underscores is left.
    pub(crate) fn bump_nick(&mut self, oldnick: &str) -> String {
        if oldnick.is_empty() {
            self.shutdown();
            return String::new();
        }
        let next = if oldnick != self.last_nick && self.last_nick.starts_with(oldnick) {
            // The server truncated our padded attempt; vary within the
            // length it allowed instead of growing forever.
            match oldnick.char_indices().rev().find(|(_, c)| *c != '_') {
                Some((idx, c)) => {
                    format!("{}_{}", &oldnick[..idx], &oldnick[idx + c.len_utf8()..])
                }
                None => {
                    self.shutdown();
                    return String::new();
                }
            }
        } else {
            format!("{oldnick}_")
        };
        self.last_nick = next.clone();
        next
    }

    /// Fire the login sequence: optional PASS, then NICK, then USER.
    pub(crate) fn log_in(&self, realname: &str, password: &str) {
        if !password.is_empty() {
            self.raw(&format!("PASS :{password}"));
        }
        self.nick(&self.me.nick);
        let user = first_word(&self.me.user);
        let user = if user.is_empty() { "guest" } else { user };
        let realname = if realname.is_empty() { "guest" } else { realname };
        // 8 requests invisible mode (+i) at registration.
        self.raw(&format!("USER {user} 8 * :{realname}"));
    }

    /// The owner loop. Consumes the connection; returns when the reader
    /// queue closes or a write error is reported.
    pub(crate) async fn run_loop(
        mut self,
        mut reader: UnboundedReceiver<String>,
        mut write_err: Receiver<io::Error>,
        mut read_err: Receiver<io::Error>,
        mut invoker: UnboundedReceiver<Invoke>,
    ) {
        loop {
            tokio::select! {
                line = reader.recv() => match line {
                    Some(line) => self.process_line(&line),
                    None => {
                        if let Ok(err) = read_err.try_recv() {
                            tracing::debug!("read side closed: {err}");
                        }
                        self.shutdown();
                        return;
                    }
                },
                err = write_err.recv() => {
                    if let Some(err) = err {
                        tracing::debug!("write side closed: {err}");
                    }
                    self.shutdown();
                    return;
                }
                invoke = invoker.recv() => {
                    if let Some(invoke) = invoke {
                        invoke(&mut self);
                    }
                }
            }
        }
    }

    /// Parse one inbound line and dispatch it: internal state handlers
    /// first, then user handlers, then the built-in CTCP responder if no
    /// user handler claimed an `irc:ctcp` event.
    pub(crate) fn process_line(&mut self, input: &str) {
        let Some(mut line) = parse_line(input) else {
            // Malformed; drop it.
            return;
        };
        line.me = self.me.clone();

        // CTCP rides inside PRIVMSG/NOTICE as a \x01-wrapped trailing
        // argument; unwrap it and rewrite the line as a pseudo-command.
        if (line.command == "PRIVMSG" || line.command == "NOTICE")
            && line.args.len() > 1
            && line.args.last().is_some_and(|arg| arg.starts_with('\u{1}'))
        {
            let text = {
                let arg = line.args.last().map(String::as_str).unwrap_or("");
                let arg = arg.strip_prefix('\u{1}').unwrap_or(arg);
                arg.strip_suffix('\u{1}').unwrap_or(arg).to_string()
            };
            line.dst = line.args[0].clone();
            let mut parts = text.splitn(2, ' ');
            let ctcp_command = parts.next().unwrap_or("").to_string();
            let remainder = parts.next().map(str::to_string);

            if line.command == "PRIVMSG" {
                if ctcp_command == "ACTION" {
                    line.command = crate::ACTION.to_string();
                    line.args = vec![remainder.unwrap_or_default()];
                } else {
                    line.command = crate::CTCP.to_string();
                    line.args = match remainder {
                        Some(rest) => vec![ctcp_command, rest],
                        None => vec![ctcp_command],
                    };
                }
            } else {
                line.command = crate::CTCPREPLY.to_string();
                line.args = match remainder {
                    Some(rest) => vec![ctcp_command, rest],
                    None => vec![ctcp_command],
                };
            }
        }

        let command = line.command.clone();
        let state_registry = self.state_registry.clone();
        state_registry.dispatch(&command, self, &line);

        let user_registry = self.substate.registry.clone();
        if !user_registry.dispatch(&command, self, &line) && command == crate::CTCP {
            self.default_ctcp_handler(&line);
        }
    }
}

#[cfg(test)]
pub(crate) fn test_conn() -> (Conn, UnboundedReceiver<String>) {
    use crate::message::parse_user;
    use tokio::sync::mpsc;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (invoker_tx, invoker_rx) = mpsc::unbounded_channel();
    std::mem::forget(invoker_rx); // keep the invoker channel open

    let substate = Arc::new(SafeConnState::new("irc.test:6667".to_string()));
    {
        let mut channels = substate.channels.write();
        channels.writer = Some(writer_tx.clone());
        channels.invoker = Some(invoker_tx);
    }

    let conn = Conn {
        me: parse_user("mynick!myuser@myhost"),
        state_registry: CallbackRegistry::new(),
        substate,
        nick_in_use: None,
        writer: Some(writer_tx),
        io: Some(IoHandles {
            reader: tokio::spawn(async {}),
            writer: tokio::spawn(async {}),
        }),
        last_nick: String::new(),
    };
    (conn, writer_rx)
}
