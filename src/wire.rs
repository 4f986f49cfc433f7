//! Outbound line sanitization and composition.
//!
//! Every sender primitive funnels through [`filter_message`], which strips
//! the bytes IRC cannot carry (NUL, CR, LF) and clamps the line to the
//! 510-byte payload limit. Targets are clamped to their first word and
//! message bodies to their first line, so caller-supplied text cannot
//! smuggle extra arguments or whole extra commands onto the wire.

/// Maximum payload length: 512 bytes on the wire minus the CRLF.
const MAX_LINE: usize = 510;

/// Strip NUL/CR/LF and truncate to 510 bytes on a char boundary.
pub(crate) fn filter_message(text: &str) -> String {
    let mut out: String = text
        .chars()
        .filter(|c| !matches!(c, '\0' | '\r' | '\n'))
        .collect();
    if out.len() > MAX_LINE {
        let mut end = MAX_LINE;
        // Back off past a split multi-byte sequence; a boundary is always
        // within 3 bytes in valid UTF-8.
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// The text up to the first space, CR, or LF.
pub(crate) fn first_word(text: &str) -> &str {
    text.split([' ', '\r', '\n']).next().unwrap_or("")
}

/// The text up to the first CR or LF.
pub(crate) fn first_line(text: &str) -> &str {
    text.split(['\r', '\n']).next().unwrap_or("")
}

pub(crate) fn compose_privmsg(dst: &str, msg: &str) -> String {
    filter_message(&format!("PRIVMSG {} :{}", first_word(dst), first_line(msg)))
}

pub(crate) fn compose_notice(dst: &str, msg: &str) -> String {
    filter_message(&format!("NOTICE {} :{}", first_word(dst), first_line(msg)))
}

/// CTCP request (PRIVMSG) or reply (NOTICE): the payload rides inside
/// \x01 delimiters in the trailing argument.
pub(crate) fn compose_ctcp(dst: &str, command: &str, msg: &str, is_reply: bool) -> String {
    let verb = if is_reply { "NOTICE" } else { "PRIVMSG" };
    if msg.is_empty() {
        filter_message(&format!(
            "{verb} {} :\u{1}{}\u{1}",
            first_word(dst),
            first_word(command)
        ))
    } else {
        filter_message(&format!(
            "{verb} {} :\u{1}{} {}\u{1}",
            first_word(dst),
            first_word(command),
            first_line(msg)
        ))
    }
}

pub(crate) fn compose_quit(msg: &str) -> String {
    if msg.is_empty() {
        "QUIT".to_string()
    } else {
        filter_message(&format!("QUIT :{}", first_line(msg)))
    }
}

pub(crate) fn compose_nick(nick: &str) -> String {
    filter_message(&format!("NICK :{}", first_line(nick)))
}

// Channel and key list entries are cut at the first comma so one entry
// cannot expand into several.
fn clean_list(entries: &[&str]) -> Vec<String> {
    entries
        .iter()
        .map(|e| {
            first_word(e)
                .split(',')
                .next()
                .unwrap_or("")
                .to_string()
        })
        .collect()
}

pub(crate) fn compose_join(channels: &[&str], keys: &[&str]) -> String {
    let channels = clean_list(channels).join(",");
    if keys.is_empty() {
        filter_message(&format!("JOIN {channels}"))
    } else {
        let keys = clean_list(keys).join(",");
        filter_message(&format!("JOIN {channels} {keys}"))
    }
}

pub(crate) fn compose_part(channels: &[&str], msg: &str) -> String {
    let channels = clean_list(channels).join(",");
    if msg.is_empty() {
        filter_message(&format!("PART {channels}"))
    } else {
        filter_message(&format!("PART {channels} :{}", first_line(msg)))
    }
}
