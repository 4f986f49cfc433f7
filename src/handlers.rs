//! Internal protocol handlers, installed into every connection's state
//! registry at startup. They keep the login handshake and nick state
//! honest; everything else is the user's business.

use chrono::Local;

use crate::conn::Conn;
use crate::message::Line;

pub(crate) fn install(conn: &Conn) {
    let registry = &conn.state_registry;

    registry.add("001", on_welcome);
    registry.add("004", on_server_info);

    registry.add("PING", on_ping);
    registry.add("MODE", on_mode);
    registry.add("NICK", on_nick);

    // ERR_NONICKNAMEGIVEN, ERR_ERRONEUSNICKNAME, ERR_NICKNAMEINUSE,
    // ERR_NICKCOLLISION, ERR_UNAVAILRESOURCE
    for code in [431u16, 432, 433, 436, 437] {
        registry.add(&code.to_string(), move |conn: &mut Conn, line: &Line| {
            on_bad_nick(conn, line, code);
        });
    }
}

/// 001: the server confirms login and names the nick it actually gave us.
fn on_welcome(conn: &mut Conn, line: &Line) {
    match line.args.first() {
        Some(nick) => conn.me.nick = nick.clone(),
        // A 001 without our nick leaves us with no identity to speak as.
        None => conn.shutdown(),
    }
}

/// 004: the login handshake is complete.
fn on_server_info(conn: &mut Conn, _line: &Line) {
    let registry = conn.substate.registry.clone();
    let event = Line::event(crate::CONNECTED, conn.me.clone());
    registry.dispatch(crate::CONNECTED, conn, &event);
}

fn on_ping(conn: &mut Conn, line: &Line) {
    let token = line.args.first().map(String::as_str).unwrap_or("");
    conn.raw(&format!("PONG :{token}"));
}

fn on_mode(conn: &mut Conn, line: &Line) {
    if line.args.len() > 1 && line.args[0] == conn.me.nick {
        // Our own umode changed. Mode state is not tracked here.
        tracing::trace!(modes = %line.args[1], "own mode change");
    }
}

fn on_nick(conn: &mut Conn, line: &Line) {
    if line.src_is_me() {
        if let Some(nick) = line.args.first() {
            conn.me.nick = nick.clone();
        }
    }
}

/// Common path for the 43x nick errors: ask the user override (or the
/// default underscore policy) for a new nick and send it — unless the
/// policy gave up and closed the connection.
fn on_bad_nick(conn: &mut Conn, line: &Line, code: u16) {
    // 431 carries no nick argument; the rest report it in args[1].
    let oldnick = if code == 431 {
        String::new()
    } else {
        line.args.get(1).cloned().unwrap_or_default()
    };

    let newnick = match conn.nick_in_use.as_mut() {
        Some(pick) => pick(&oldnick, code),
        None => conn.bump_nick(&oldnick),
    };

    if !conn.connected() {
        return;
    }
    conn.nick(&newnick);
}

/// Built-in responses for common CTCP requests. Runs when no user handler
/// is registered for `irc:ctcp`.
pub(crate) fn default_ctcp(conn: &Conn, line: &Line) {
    if line.src.nick.is_empty() {
        // No nick to address the reply to.
        return;
    }
    let command = line.args.first().map(String::as_str).unwrap_or("");
    let remainder = line.args.get(1).map(String::as_str).unwrap_or("");

    match command {
        "PING" => conn.ctcp_reply(&line.src.nick, "PING", remainder),
        "TIME" => {
            let now = Local::now().format("%a %b %e %H:%M:%S %Y").to_string();
            conn.ctcp_reply(&line.src.nick, "TIME", &now);
        }
        "VERSION" => conn.ctcp_reply(
            &line.src.nick,
            "VERSION",
            concat!("irckit ", env!("CARGO_PKG_VERSION")),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::conn::test_conn;

    #[tokio::test]
    async fn welcome_adopts_server_assigned_nick() {
        let (mut conn, _rx) = test_conn();
        install(&conn);
        conn.process_line(":irc.example.com 001 newme :Welcome to the network");
        assert_eq!(conn.me().nick, "newme");
        assert!(conn.connected());
    }

    #[tokio::test]
    async fn welcome_without_nick_shuts_down() {
        let (mut conn, _rx) = test_conn();
        install(&conn);
        conn.process_line(":irc.example.com 001");
        assert!(!conn.connected());
    }

    #[tokio::test]
    async fn server_info_fires_connected_exactly_once() {
        let (mut conn, _rx) = test_conn();
        install(&conn);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        conn.add_handler(crate::CONNECTED, move |conn, _line| {
            assert_eq!(conn.me().nick, "mynick2");
            h.fetch_add(1, Ordering::SeqCst);
        });

        conn.process_line(":irc.example.com 001 mynick2 :Welcome");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        conn.process_line(":irc.example.com 004 mynick2 irc.example.com testd aiow biklmnopstv");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line("PING :abc");
        assert_eq!(rx.try_recv().unwrap(), "PONG :abc");
    }

    #[tokio::test]
    async fn nick_change_of_self_updates_identity() {
        let (mut conn, _rx) = test_conn();
        install(&conn);
        conn.process_line(":mynick!myuser@myhost NICK :renamed");
        assert_eq!(conn.me().nick, "renamed");
    }

    #[tokio::test]
    async fn nick_change_of_others_is_ignored() {
        let (mut conn, _rx) = test_conn();
        install(&conn);
        conn.process_line(":somebody!u@h NICK :whatever");
        assert_eq!(conn.me().nick, "mynick");
    }

    #[tokio::test]
    async fn nick_in_use_applies_default_policy() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":irc.example.com 433 * taken :Nickname is already in use");
        assert_eq!(rx.try_recv().unwrap(), "NICK :taken_");
        conn.process_line(":irc.example.com 433 * taken_ :Nickname is already in use");
        assert_eq!(rx.try_recv().unwrap(), "NICK :taken__");
    }

    #[tokio::test]
    async fn nick_exhaustion_shuts_down_without_sending() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.last_nick = "_____".to_string();
        conn.process_line(":irc.example.com 433 * ____ :Nickname is already in use");
        assert!(!conn.connected());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nick_in_use_override_wins_over_default() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.nick_in_use = Some(Box::new(|old, code| format!("{old}{code}")));
        conn.process_line(":irc.example.com 433 * taken :Nickname is already in use");
        assert_eq!(rx.try_recv().unwrap(), "NICK :taken433");
    }

    #[tokio::test]
    async fn no_nick_given_passes_empty_candidate() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        // Default policy has nothing to vary: give up.
        conn.process_line(":irc.example.com 431 :No nickname given");
        assert!(!conn.connected());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn default_ctcp_answers_ping_with_same_token() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":asker!u@h PRIVMSG mynick :\u{1}PING 12345\u{1}");
        assert_eq!(rx.try_recv().unwrap(), "NOTICE asker :\u{1}PING 12345\u{1}");
    }

    #[tokio::test]
    async fn default_ctcp_answers_version() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":asker!u@h PRIVMSG mynick :\u{1}VERSION\u{1}");
        let reply = rx.try_recv().unwrap();
        assert!(reply.starts_with("NOTICE asker :\u{1}VERSION irckit "));
    }

    #[tokio::test]
    async fn default_ctcp_answers_time() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":asker!u@h PRIVMSG mynick :\u{1}TIME\u{1}");
        let reply = rx.try_recv().unwrap();
        assert!(reply.starts_with("NOTICE asker :\u{1}TIME "));
    }

    #[tokio::test]
    async fn default_ctcp_ignores_sources_without_nick() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":irc.example.com PRIVMSG mynick :\u{1}PING 1\u{1}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_ctcp_handler_suppresses_default() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.add_handler(crate::CTCP, |_conn, _line| {});
        conn.process_line(":asker!u@h PRIVMSG mynick :\u{1}PING 1\u{1}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_ctcp_is_ignored_by_default() {
        let (mut conn, mut rx) = test_conn();
        install(&conn);
        conn.process_line(":asker!u@h PRIVMSG mynick :\u{1}CLIENTINFO\u{1}");
        assert!(rx.try_recv().is_err());
    }
}
