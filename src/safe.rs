//! Cross-task handle to a live connection.
//!
//! A [`SafeConn`] may be cloned freely and moved to any task; it can
//! outlive the connection it was created from. Send methods return `true`
//! if the connection was still open when the send was queued — not that
//! the server received anything.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::conn::{Conn, Invoke};
use crate::message::{Line, User};
use crate::registry::{CallbackRegistry, HandlerId};
use crate::wire::{
    compose_ctcp, compose_join, compose_nick, compose_notice, compose_part, compose_privmsg,
    compose_quit, filter_message, first_line,
};

/// The nullable ends of the connection: present while the connection is
/// open, cleared by shutdown under the write lock.
#[derive(Default)]
pub(crate) struct Channels {
    pub(crate) writer: Option<UnboundedSender<String>>,
    pub(crate) invoker: Option<UnboundedSender<Invoke>>,
}

/// The part of a connection shared between the owner task and every
/// [`SafeConn`]. Handles take the read lock to send; shutdown takes the
/// write lock to clear the channels.
pub(crate) struct SafeConnState {
    pub(crate) server: String,
    pub(crate) registry: CallbackRegistry,
    pub(crate) channels: RwLock<Channels>,
}

impl SafeConnState {
    pub(crate) fn new(server: String) -> SafeConnState {
        SafeConnState {
            server,
            registry: CallbackRegistry::new(),
            channels: RwLock::new(Channels::default()),
        }
    }
}

/// A thread-safe view of a connection.
#[derive(Clone)]
pub struct SafeConn {
    me: User,
    state: Arc<SafeConnState>,
}

impl std::fmt::Debug for SafeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeConn")
            .field("me", &self.me)
            .finish_non_exhaustive()
    }
}

impl SafeConn {
    pub(crate) fn new(me: User, state: Arc<SafeConnState>) -> SafeConn {
        SafeConn { me, state }
    }

    /// The client identity as of when this handle was created. The nick may
    /// have changed since; handlers see the live value on [`Conn`].
    pub fn me(&self) -> &User {
        &self.me
    }

    /// The `host:port` pair identifying the server.
    pub fn server(&self) -> &str {
        &self.state.server
    }

    /// Whether the connection is still open. The connection keeps
    /// processing queued lines and invokes for a short time after this
    /// turns false.
    pub fn connected(&self) -> bool {
        self.state.channels.read().writer.is_some()
    }

    /// Run `f` with the [`Conn`] on the connection's owner task.
    pub fn invoke<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Conn) + Send + 'static,
    {
        let channels = self.state.channels.read();
        if channels.writer.is_none() {
            return false;
        }
        match channels.invoker.as_ref() {
            Some(invoker) => {
                let _ = invoker.send(Box::new(f));
                true
            }
            None => false,
        }
    }

    /// Register a handler for an IRC command, numeric, or `irc:*` event.
    pub fn add_handler<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&mut Conn, &Line) + Send + Sync + 'static,
    {
        self.state.registry.add(name, handler)
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, id: HandlerId) {
        self.state.registry.remove(id);
    }

    fn send_line(&self, line: String) -> bool {
        let channels = self.state.channels.read();
        match channels.writer.as_ref() {
            Some(writer) => {
                let _ = writer.send(line);
                true
            }
            None => false,
        }
    }

    /// Send a raw line (clamped to its first line and sanitized).
    pub fn raw(&self, msg: &str) -> bool {
        self.send_line(filter_message(first_line(msg)))
    }

    pub fn privmsg(&self, dst: &str, msg: &str) -> bool {
        self.send_line(compose_privmsg(dst, msg))
    }

    pub fn notice(&self, dst: &str, msg: &str) -> bool {
        self.send_line(compose_notice(dst, msg))
    }

    pub fn action(&self, dst: &str, msg: &str) -> bool {
        self.send_line(compose_ctcp(dst, "ACTION", msg, false))
    }

    pub fn ctcp(&self, dst: &str, command: &str, args: &str) -> bool {
        self.send_line(compose_ctcp(dst, command, args, false))
    }

    pub fn ctcp_reply(&self, dst: &str, command: &str, args: &str) -> bool {
        self.send_line(compose_ctcp(dst, command, args, true))
    }

    pub fn quit(&self, msg: &str) -> bool {
        self.send_line(compose_quit(msg))
    }

    pub fn nick(&self, newnick: &str) -> bool {
        self.send_line(compose_nick(newnick))
    }

    /// JOIN one or more channels, with optional keys. An empty channel
    /// list sends nothing.
    pub fn join(&self, channels: &[&str], keys: &[&str]) -> bool {
        if channels.is_empty() {
            return self.connected();
        }
        self.send_line(compose_join(channels, keys))
    }

    /// PART one or more channels. An empty channel list sends nothing.
    pub fn part(&self, channels: &[&str], msg: &str) -> bool {
        if channels.is_empty() {
            return self.connected();
        }
        self.send_line(compose_part(channels, msg))
    }
}
