//! Callback-driven IRC (RFC 1459/2812) client library.
//!
//! The crate connects to an IRC server over TCP (optionally TLS), performs
//! the login handshake, and parses incoming protocol lines into [`Line`]
//! values that are dispatched to registered handlers. All handlers run
//! serially on a single owner task, so they may freely read and mutate the
//! [`Conn`] they are given without locking. Other tasks interact with the
//! connection through a [`SafeConn`], a cheap-to-clone handle whose send
//! methods report whether the connection was still open.
//!
//! ```no_run
//! use irckit::{Config, CONNECTED};
//!
//! # async fn run() -> Result<(), irckit::ConnectError> {
//! let mut config = Config::default();
//! config.host = "irc.libera.chat".into();
//! config.ssl = true;
//! config.nick = "mybot".into();
//! config.init = Some(Box::new(|conn| {
//!     conn.add_handler(CONNECTED, |conn, _line| {
//!         conn.join(&["#mybot"], &[]);
//!     });
//!     conn.add_handler("PRIVMSG", |_conn, line| {
//!         println!("<{}> {}", line.src, line.args.get(1).map_or("", String::as_str));
//!     });
//! }));
//! let safe = irckit::connect(config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Inbound traffic is decoupled from handler dispatch by unbounded queues:
//! a slow handler never stalls the socket read, and outbound bursts are
//! buffered ahead of the flood-control pacing applied by the writer task.

mod client;
mod conn;
mod handlers;
mod message;
mod registry;
mod safe;
mod wire;

pub use client::{connect, connect_with_stream, Config, ConnectError, InitFn};
pub use conn::{Conn, NickInUseFn};
pub use message::{Line, User};
pub use registry::HandlerId;
pub use safe::SafeConn;

/// Fired once the connection is established, before logging in.
/// It is not yet safe to send messages to the server from this handler.
pub const INIT: &str = "irc:init";

/// Fired when the server login has finished (004 received). It is now safe
/// to send messages to the server.
pub const CONNECTED: &str = "irc:connected";

/// Fired when the connection with the server is terminated.
pub const DISCONNECTED: &str = "irc:disconnected";

/// Fired for PRIVMSGs that encode a CTCP ACTION. The line has one argument,
/// the action text, and `dst` holds the original target of the PRIVMSG.
pub const ACTION: &str = "irc:action";

/// Fired for PRIVMSGs that encode a CTCP message. The line has one or two
/// arguments (the CTCP command, then the remainder if any), and `dst` holds
/// the original target of the PRIVMSG.
pub const CTCP: &str = "irc:ctcp";

/// Fired for NOTICEs that encode a CTCP reply. Arguments are laid out as
/// for [`CTCP`], with `dst` holding the original target of the NOTICE.
pub const CTCPREPLY: &str = "irc:ctcpreply";
