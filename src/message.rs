//! Inbound protocol data: message sources and parsed lines.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// A message source of the form `nick[!user]@host`.
///
/// `nick`, `user`, and `host` are only populated when the raw source
/// matches that shape; a server host as source leaves all three empty and
/// only `raw` set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub nick: String,
    pub user: String,
    pub host: String,
    /// The source string exactly as it appeared on the wire.
    pub raw: String,
}

// Nick grammar per RFC 1459: letters and []\^_`{|} to start, digits and -
// allowed afterwards. The user part takes anything up to the @.
static USER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z\[-`{-}][A-Za-z0-9\[-`{-}-]+)(?:!([^@]+))?@(.+)$").expect("user regex")
});

pub(crate) fn parse_user(raw: &str) -> User {
    let mut user = User {
        raw: raw.to_string(),
        ..User::default()
    };
    if let Some(caps) = USER_RE.captures(raw) {
        user.nick = caps[1].to_string();
        user.user = caps.get(2).map_or(String::new(), |m| m.as_str().to_string());
        user.host = caps[3].to_string();
    }
    user
}

impl fmt::Display for User {
    /// The nickname, or the raw source string if there is none.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nick.is_empty() {
            f.write_str(&self.raw)
        } else {
            f.write_str(&self.nick)
        }
    }
}

/// One parsed IRC message.
#[derive(Debug, Clone)]
pub struct Line {
    /// Who sent the message. Empty fields for server sources.
    pub src: User,
    /// The IRC command or numeric, or one of the `irc:*` pseudo-commands.
    pub command: String,
    /// Positional arguments; a trailing argument is the final element.
    pub args: Vec<String>,
    /// The line exactly as received.
    pub raw: String,
    /// When the line was parsed.
    pub time: DateTime<Utc>,
    /// Original target of a CTCP-bearing PRIVMSG/NOTICE; empty otherwise.
    pub dst: String,

    /// Snapshot of the connection's own identity at dispatch time.
    pub(crate) me: User,
}

impl Line {
    /// Whether the source of this line is the connection itself.
    pub fn src_is_me(&self) -> bool {
        self.src.nick == self.me.nick
    }

    /// A synthetic line carrying a library lifecycle event.
    pub(crate) fn event(name: &str, me: User) -> Line {
        Line {
            src: User::default(),
            command: name.to_string(),
            args: Vec::new(),
            raw: String::new(),
            time: Utc::now(),
            dst: String::new(),
            me,
        }
    }
}

/// Parse one wire line (CR/LF already stripped) into a [`Line`].
///
/// Returns `None` for malformed input: empty, leading space, or no command
/// token. Such lines are dropped before dispatch.
pub(crate) fn parse_line(input: &str) -> Option<Line> {
    if input.is_empty() || input.starts_with(' ') {
        return None;
    }

    // Split off the trailing argument first, then tokenize the rest.
    let (head, trailing) = match input.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => (input, None),
    };
    let mut words = head.split(' ').filter(|w| !w.is_empty());

    let mut src = User::default();
    let mut first = words.next()?;
    if let Some(stripped) = first.strip_prefix(':') {
        src = parse_user(stripped);
        first = words.next()?;
    }
    let command = first.to_string();

    let mut args: Vec<String> = words.map(str::to_string).collect();
    if let Some(trailing) = trailing {
        args.push(trailing.to_string());
    }

    Some(Line {
        src,
        command,
        args,
        raw: input.to_string(),
        time: Utc::now(),
        dst: String::new(),
        me: User::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privmsg_with_trailing() {
        let line = parse_line(":nick!user@host PRIVMSG #chan :hello world").unwrap();
        assert_eq!(line.src.nick, "nick");
        assert_eq!(line.src.user, "user");
        assert_eq!(line.src.host, "host");
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.args, vec!["#chan", "hello world"]);
        assert_eq!(line.raw, ":nick!user@host PRIVMSG #chan :hello world");
    }

    #[test]
    fn command_without_prefix() {
        let line = parse_line("PING :abc").unwrap();
        assert!(line.src.nick.is_empty());
        assert_eq!(line.command, "PING");
        assert_eq!(line.args, vec!["abc"]);
    }

    #[test]
    fn numeric_with_middle_args() {
        let line = parse_line(":irc.example.com 433 * taken :Nickname is already in use").unwrap();
        assert_eq!(line.command, "433");
        assert_eq!(
            line.args,
            vec!["*", "taken", "Nickname is already in use"]
        );
        // Server-host source: no nick.
        assert!(line.src.nick.is_empty());
        assert_eq!(line.src.raw, "irc.example.com");
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(parse_line("").is_none());
        assert!(parse_line(" PRIVMSG #chan :x").is_none());
        assert!(parse_line(":prefix.only").is_none());
    }

    #[test]
    fn repeated_spaces_collapse() {
        let line = parse_line("MODE  #chan   +o  someone").unwrap();
        assert_eq!(line.args, vec!["#chan", "+o", "someone"]);
    }

    #[test]
    fn trailing_may_contain_colons_and_spaces() {
        let line = parse_line(":a@h NOTICE me :one :two three").unwrap();
        assert_eq!(line.args, vec!["me", "one :two three"]);
    }

    #[test]
    fn user_full_triple() {
        let u = parse_user("nick!user@host");
        assert_eq!((u.nick.as_str(), u.user.as_str(), u.host.as_str()), ("nick", "user", "host"));
        assert_eq!(u.to_string(), "nick");
    }

    #[test]
    fn user_without_ident() {
        let u = parse_user("nick@host");
        assert_eq!(u.nick, "nick");
        assert!(u.user.is_empty());
        assert_eq!(u.host, "host");
    }

    #[test]
    fn user_special_chars_in_nick() {
        let u = parse_user("n[i]ck`{}!u@h");
        assert_eq!(u.nick, "n[i]ck`{}");
    }

    #[test]
    fn server_source_leaves_components_empty() {
        let u = parse_user("irc.example.com");
        assert!(u.nick.is_empty() && u.user.is_empty() && u.host.is_empty());
        assert_eq!(u.raw, "irc.example.com");
        assert_eq!(u.to_string(), "irc.example.com");
    }

    #[test]
    fn nick_may_not_start_with_digit() {
        let u = parse_user("9nick!u@h");
        assert!(u.nick.is_empty());
        assert_eq!(u.raw, "9nick!u@h");
    }

    #[test]
    fn src_is_me_compares_nicks() {
        let mut line = parse_line(":mynick!u@h NICK :other").unwrap();
        line.me = parse_user("mynick!ident@elsewhere");
        assert!(line.src_is_me());
        line.me = parse_user("unrelated!ident@elsewhere");
        assert!(!line.src_is_me());
    }
}
