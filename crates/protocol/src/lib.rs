//! Shared-sheet wire protocol.
//!
//! The wire format is line-delimited UTF-8 text over TCP. Each message is a
//! command line followed by `Key:Value` header lines. Messages that carry
//! cell contents or a sheet document add a payload whose byte length is
//! declared by a `Length:` header.
//!
//! This crate defines the outbound request frames and an explicit state
//! machine, [`ReplyReader`], that reassembles inbound replies one line at a
//! time. Socket plumbing lives in the client crate; everything here is pure
//! and synchronous, which is what makes the protocol testable without a
//! server.

use log::warn;

/// Protocol revision tag. Servers may echo it in a `Protocol:` header on any
/// reply; it is tolerated and ignored for dispatch.
pub const PROTOCOL_VERSION: &str = "ps6";

/// Default server port.
pub const DEFAULT_PORT: u16 = 1984;

// =============================================================================
// Client → Server Requests
// =============================================================================

/// Messages sent from the client to the sheet server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create {
        name: String,
        password: String,
    },
    Join {
        name: String,
        password: String,
    },
    Change {
        name: String,
        version: String,
        cell: String,
        content: String,
    },
    Undo {
        name: String,
        version: String,
    },
    Save {
        name: String,
    },
    Leave {
        name: String,
    },
}

impl Request {
    /// Render the exact outbound frame, trailing newline included.
    pub fn to_frame(&self) -> String {
        match self {
            Request::Create { name, password } => {
                format!("CREATE\nName:{}\nPassword:{}\n", name, password)
            }
            Request::Join { name, password } => {
                format!("JOIN\nName:{}\nPassword:{}\n", name, password)
            }
            Request::Change {
                name,
                version,
                cell,
                content,
            } => format!(
                "CHANGE\nName:{}\nVersion:{}\nCell:{}\nLength:{}\n{}\n",
                name,
                version,
                cell,
                content.len(),
                content
            ),
            Request::Undo { name, version } => {
                format!("UNDO\nName:{}\nVersion:{}\n", name, version)
            }
            Request::Save { name } => format!("SAVE\nName:{}\n", name),
            Request::Leave { name } => format!("LEAVE\nName:{}\n", name),
        }
    }
}

// =============================================================================
// Server → Client Replies
// =============================================================================

/// A fully reassembled server reply.
///
/// FAIL variants carry every accumulated line of the reply; the last line is
/// the human-readable message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    CreateOk {
        name: String,
        password: String,
    },
    CreateFail {
        lines: Vec<String>,
    },
    JoinOk {
        name: String,
        version: String,
        payload: String,
    },
    JoinFail {
        lines: Vec<String>,
    },
    ChangeOk {
        name: String,
        version: String,
    },
    ChangeWait {
        name: String,
        version: String,
    },
    ChangeFail {
        lines: Vec<String>,
    },
    UndoOk {
        name: String,
        version: String,
        cell: String,
        content: String,
    },
    UndoEnd {
        name: String,
        version: String,
    },
    UndoWait {
        name: String,
        version: String,
    },
    UndoFail {
        lines: Vec<String>,
    },
    SaveOk,
    SaveFail {
        lines: Vec<String>,
    },
    Update {
        name: String,
        version: String,
        cell: String,
        content: String,
    },
    /// A bare `ERROR` frame, an unrecognized command line, or a reply whose
    /// required fields never arrived.
    GenericError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    CreateOk,
    CreateFail,
    JoinOk,
    JoinFail,
    ChangeOk,
    ChangeWait,
    ChangeFail,
    UndoOk,
    UndoEnd,
    UndoWait,
    UndoFail,
    SaveFail,
    Update,
}

impl Kind {
    fn from_command(line: &str) -> Option<Kind> {
        match line {
            "CREATE OK" => Some(Kind::CreateOk),
            "CREATE FAIL" => Some(Kind::CreateFail),
            "JOIN OK" => Some(Kind::JoinOk),
            "JOIN FAIL" => Some(Kind::JoinFail),
            "CHANGE OK" => Some(Kind::ChangeOk),
            "CHANGE WAIT" => Some(Kind::ChangeWait),
            "CHANGE FAIL" => Some(Kind::ChangeFail),
            "UNDO OK" => Some(Kind::UndoOk),
            "UNDO END" => Some(Kind::UndoEnd),
            "UNDO WAIT" => Some(Kind::UndoWait),
            "UNDO FAIL" => Some(Kind::UndoFail),
            "SAVE FAIL" => Some(Kind::SaveFail),
            "UPDATE" => Some(Kind::Update),
            _ => None,
        }
    }

    /// FAIL replies are completed by their message line rather than a fixed
    /// header set.
    fn is_fail(self) -> bool {
        matches!(
            self,
            Kind::CreateFail
                | Kind::JoinFail
                | Kind::ChangeFail
                | Kind::UndoFail
                | Kind::SaveFail
        )
    }

    /// Replies that carry a `Length:`-framed payload.
    fn wants_payload(self) -> bool {
        matches!(self, Kind::JoinOk | Kind::UndoOk | Kind::Update)
    }
}

/// Accumulated state of one in-flight reply.
#[derive(Debug)]
struct Message {
    kind: Kind,
    lines: Vec<String>,
    name: Option<String>,
    version: Option<String>,
    cell: Option<String>,
    password: Option<String>,
    length: Option<usize>,
}

impl Message {
    fn new(kind: Kind, command: &str) -> Message {
        Message {
            kind,
            lines: vec![command.to_string()],
            name: None,
            version: None,
            cell: None,
            password: None,
            length: None,
        }
    }

    /// True once every header this kind requires (payload aside) is present.
    fn headers_complete(&self) -> bool {
        match self.kind {
            Kind::CreateOk => self.name.is_some() && self.password.is_some(),
            Kind::ChangeOk | Kind::ChangeWait | Kind::UndoEnd | Kind::UndoWait => {
                self.name.is_some() && self.version.is_some()
            }
            // Payload and FAIL kinds complete elsewhere.
            _ => false,
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    InMessage(Message),
    InPayload {
        msg: Message,
        declared: usize,
        acc: Option<String>,
    },
}

/// Receive-side state machine: `{Idle, InMessage, InPayload}`.
///
/// Feed it one line at a time (without the trailing newline); each completed
/// reply comes back as `Some(Reply)`. Out-of-order headers within a reply are
/// tolerated. A reply missing required fields is logged and surfaces as
/// [`Reply::GenericError`], as does an unrecognized command line.
///
/// Payload framing follows the `Length:` header when the payload spans
/// several lines, and falls back to next-line-is-payload when that single
/// line already satisfies the declared byte count.
#[derive(Debug)]
pub struct ReplyReader {
    state: State,
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyReader {
    pub fn new() -> ReplyReader {
        ReplyReader { state: State::Idle }
    }

    pub fn push_line(&mut self, line: &str) -> Option<Reply> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.on_idle(line),
            State::InMessage(msg) => self.on_message_line(msg, line),
            State::InPayload {
                msg,
                declared,
                acc,
            } => self.on_payload_line(msg, declared, acc, line),
        }
    }

    fn on_idle(&mut self, line: &str) -> Option<Reply> {
        if line.is_empty() {
            return None;
        }
        if line == "SAVE OK" {
            // Terminal for the save; no fields follow.
            return Some(Reply::SaveOk);
        }
        if line == "ERROR" {
            return Some(Reply::GenericError);
        }
        match Kind::from_command(line) {
            Some(kind) => {
                self.state = State::InMessage(Message::new(kind, line));
                None
            }
            None => {
                warn!("unrecognized reply command: {:?}", line);
                Some(Reply::GenericError)
            }
        }
    }

    fn on_message_line(&mut self, mut msg: Message, line: &str) -> Option<Reply> {
        msg.lines.push(line.to_string());

        let header = split_header(line);

        if msg.kind.is_fail() {
            // FAIL replies carry only Name/Protocol headers; any other line
            // (colons included) is the failure message and completes the
            // reply.
            match header {
                Some(("Name", value)) => msg.name = Some(value.to_string()),
                Some(("Protocol", _)) => {}
                _ => return Some(fail_reply(msg)),
            }
            self.state = State::InMessage(msg);
            return None;
        }

        match header {
            Some(("Name", value)) => msg.name = Some(value.to_string()),
            Some(("Version", value)) => msg.version = Some(value.to_string()),
            Some(("Cell", value)) => msg.cell = Some(value.to_string()),
            Some(("Password", value)) => msg.password = Some(value.to_string()),
            Some(("Length", value)) => match value.trim().parse::<usize>() {
                Ok(n) => msg.length = Some(n),
                Err(_) => {
                    warn!("bad Length header in {:?} reply: {:?}", msg.kind, line);
                    return Some(Reply::GenericError);
                }
            },
            // Servers may tag replies with the protocol revision.
            Some(("Protocol", _)) => {}
            Some((key, _)) => {
                warn!("ignoring unknown header {:?} in {:?} reply", key, msg.kind);
            }
            None => {
                warn!(
                    "unexpected line {:?} in {:?} reply; required fields missing",
                    line, msg.kind
                );
                return Some(Reply::GenericError);
            }
        }

        if msg.kind.wants_payload() {
            if let Some(declared) = msg.length {
                if declared == 0 {
                    return Some(finish_payload(msg, String::new()));
                }
                self.state = State::InPayload {
                    msg,
                    declared,
                    acc: None,
                };
                return None;
            }
        } else if msg.headers_complete() {
            return Some(finish_headers(msg));
        }

        self.state = State::InMessage(msg);
        None
    }

    fn on_payload_line(
        &mut self,
        msg: Message,
        declared: usize,
        acc: Option<String>,
        line: &str,
    ) -> Option<Reply> {
        let acc = match acc {
            // The common case: the next line alone covers the declared
            // length, so it is the whole payload regardless of exact count.
            None if line.len() >= declared => {
                return Some(finish_payload(msg, line.to_string()));
            }
            None => line.to_string(),
            Some(mut acc) => {
                acc.push('\n');
                acc.push_str(line);
                acc
            }
        };

        if acc.len() >= declared {
            Some(finish_payload(msg, acc))
        } else {
            self.state = State::InPayload {
                msg,
                declared,
                acc: Some(acc),
            };
            None
        }
    }
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    // Header keys are single words; a colon elsewhere (say inside an XML
    // payload line that arrived out of framing) is not a header.
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((key, value))
}

fn fail_reply(msg: Message) -> Reply {
    let lines = msg.lines;
    match msg.kind {
        Kind::CreateFail => Reply::CreateFail { lines },
        Kind::JoinFail => Reply::JoinFail { lines },
        Kind::ChangeFail => Reply::ChangeFail { lines },
        Kind::UndoFail => Reply::UndoFail { lines },
        Kind::SaveFail => Reply::SaveFail { lines },
        _ => unreachable!("fail_reply called for non-FAIL kind"),
    }
}

fn finish_headers(msg: Message) -> Reply {
    match (msg.kind, msg.name, msg.version, msg.password) {
        (Kind::CreateOk, Some(name), _, Some(password)) => Reply::CreateOk { name, password },
        (Kind::ChangeOk, Some(name), Some(version), _) => Reply::ChangeOk { name, version },
        (Kind::ChangeWait, Some(name), Some(version), _) => Reply::ChangeWait { name, version },
        (Kind::UndoEnd, Some(name), Some(version), _) => Reply::UndoEnd { name, version },
        (Kind::UndoWait, Some(name), Some(version), _) => Reply::UndoWait { name, version },
        (kind, ..) => {
            warn!("reply {:?} completed without its required fields", kind);
            Reply::GenericError
        }
    }
}

fn finish_payload(msg: Message, payload: String) -> Reply {
    match (msg.kind, msg.name, msg.version, msg.cell) {
        (Kind::JoinOk, Some(name), Some(version), _) => Reply::JoinOk {
            name,
            version,
            payload,
        },
        (Kind::UndoOk, Some(name), Some(version), Some(cell)) => Reply::UndoOk {
            name,
            version,
            cell,
            content: payload,
        },
        (Kind::Update, Some(name), Some(version), Some(cell)) => Reply::Update {
            name,
            version,
            cell,
            content: payload,
        },
        (kind, ..) => {
            warn!("payload reply {:?} missing required headers", kind);
            Reply::GenericError
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a full multi-line script and collect every completed reply.
    fn feed(reader: &mut ReplyReader, script: &str) -> Vec<Reply> {
        script
            .split('\n')
            .filter_map(|line| reader.push_line(line))
            .collect()
    }

    #[test]
    fn test_change_frame_rendering() {
        let frame = Request::Change {
            name: "budget".into(),
            version: "v7".into(),
            cell: "A1".into(),
            content: "=B1+2".into(),
        }
        .to_frame();
        assert_eq!(
            frame,
            "CHANGE\nName:budget\nVersion:v7\nCell:A1\nLength:5\n=B1+2\n"
        );
    }

    #[test]
    fn test_handshake_frame_rendering() {
        let create = Request::Create {
            name: "sheet".into(),
            password: "pw".into(),
        };
        assert_eq!(create.to_frame(), "CREATE\nName:sheet\nPassword:pw\n");

        let join = Request::Join {
            name: "sheet".into(),
            password: "pw".into(),
        };
        assert_eq!(join.to_frame(), "JOIN\nName:sheet\nPassword:pw\n");
    }

    #[test]
    fn test_bare_frames_rendering() {
        let undo = Request::Undo {
            name: "s".into(),
            version: "v1".into(),
        };
        assert_eq!(undo.to_frame(), "UNDO\nName:s\nVersion:v1\n");
        assert_eq!(Request::Save { name: "s".into() }.to_frame(), "SAVE\nName:s\n");
        assert_eq!(Request::Leave { name: "s".into() }.to_frame(), "LEAVE\nName:s\n");
    }

    #[test]
    fn test_change_frame_length_counts_bytes() {
        let frame = Request::Change {
            name: "s".into(),
            version: "v".into(),
            cell: "A1".into(),
            content: "héllo".into(), // 6 bytes in UTF-8
        }
        .to_frame();
        assert!(frame.contains("Length:6\n"), "frame: {:?}", frame);
    }

    #[test]
    fn test_create_ok() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "CREATE OK\nName:sheet\nPassword:pw");
        assert_eq!(
            replies,
            vec![Reply::CreateOk {
                name: "sheet".into(),
                password: "pw".into()
            }]
        );
    }

    #[test]
    fn test_change_ok_and_wait() {
        let mut reader = ReplyReader::new();
        let replies = feed(
            &mut reader,
            "CHANGE OK\nName:s\nVersion:v2\nCHANGE WAIT\nName:s\nVersion:v2",
        );
        assert_eq!(
            replies,
            vec![
                Reply::ChangeOk {
                    name: "s".into(),
                    version: "v2".into()
                },
                Reply::ChangeWait {
                    name: "s".into(),
                    version: "v2".into()
                },
            ]
        );
    }

    #[test]
    fn test_out_of_order_headers_tolerated() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "CHANGE OK\nVersion:v2\nName:s");
        assert_eq!(
            replies,
            vec![Reply::ChangeOk {
                name: "s".into(),
                version: "v2".into()
            }]
        );
    }

    #[test]
    fn test_update_single_line_payload() {
        let mut reader = ReplyReader::new();
        let replies = feed(
            &mut reader,
            "UPDATE\nName:s\nVersion:v3\nCell:B1\nLength:5\n=A1+1",
        );
        assert_eq!(
            replies,
            vec![Reply::Update {
                name: "s".into(),
                version: "v3".into(),
                cell: "B1".into(),
                content: "=A1+1".into()
            }]
        );
    }

    #[test]
    fn test_payload_length_advisory_when_line_longer() {
        // The next line exceeds the declared length: line framing wins and
        // the whole line is the payload.
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "UPDATE\nName:s\nVersion:v\nCell:A1\nLength:2\nhello");
        assert_eq!(
            replies,
            vec![Reply::Update {
                name: "s".into(),
                version: "v".into(),
                cell: "A1".into(),
                content: "hello".into()
            }]
        );
    }

    #[test]
    fn test_join_ok_multiline_payload() {
        let payload = "<spreadsheet version=\"v1\">\n</spreadsheet>";
        let script = format!(
            "JOIN OK\nName:s\nVersion:v1\nLength:{}\n{}",
            payload.len(),
            payload
        );
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, &script);
        assert_eq!(
            replies,
            vec![Reply::JoinOk {
                name: "s".into(),
                version: "v1".into(),
                payload: payload.into()
            }]
        );
    }

    #[test]
    fn test_zero_length_payload() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "UPDATE\nName:s\nVersion:v\nCell:A1\nLength:0");
        assert_eq!(
            replies,
            vec![Reply::Update {
                name: "s".into(),
                version: "v".into(),
                cell: "A1".into(),
                content: String::new()
            }]
        );
    }

    #[test]
    fn test_undo_ok_payload() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "UNDO OK\nName:s\nVersion:v4\nCell:C3\nLength:2\n17");
        assert_eq!(
            replies,
            vec![Reply::UndoOk {
                name: "s".into(),
                version: "v4".into(),
                cell: "C3".into(),
                content: "17".into()
            }]
        );
    }

    #[test]
    fn test_undo_end() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "UNDO END\nName:s\nVersion:v4");
        assert_eq!(
            replies,
            vec![Reply::UndoEnd {
                name: "s".into(),
                version: "v4".into()
            }]
        );
    }

    #[test]
    fn test_fail_carries_all_lines() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "CHANGE FAIL\nName:s\nsomeone else won the race");
        assert_eq!(
            replies,
            vec![Reply::ChangeFail {
                lines: vec![
                    "CHANGE FAIL".into(),
                    "Name:s".into(),
                    "someone else won the race".into()
                ]
            }]
        );
    }

    #[test]
    fn test_fail_message_with_colon_is_not_a_header() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "JOIN FAIL\nName:s\nerror: no such sheet");
        assert_eq!(
            replies,
            vec![Reply::JoinFail {
                lines: vec![
                    "JOIN FAIL".into(),
                    "Name:s".into(),
                    "error: no such sheet".into()
                ]
            }]
        );
    }

    #[test]
    fn test_save_ok_is_immediate() {
        let mut reader = ReplyReader::new();
        assert_eq!(reader.push_line("SAVE OK"), Some(Reply::SaveOk));
        // And the reader is straight back to Idle.
        let replies = feed(&mut reader, "CHANGE OK\nName:s\nVersion:v");
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_bare_error() {
        let mut reader = ReplyReader::new();
        assert_eq!(reader.push_line("ERROR"), Some(Reply::GenericError));
    }

    #[test]
    fn test_unknown_command_is_generic_error() {
        let mut reader = ReplyReader::new();
        assert_eq!(reader.push_line("HELLO THERE"), Some(Reply::GenericError));
    }

    #[test]
    fn test_missing_required_fields_is_generic_error() {
        // CHANGE OK without a Version, interrupted by a free-text line.
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "CHANGE OK\nName:s\nwhoops");
        assert_eq!(replies, vec![Reply::GenericError]);

        // The reader recovered to Idle.
        let replies = feed(&mut reader, "UNDO END\nName:s\nVersion:v9");
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_bad_length_header_is_generic_error() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "UPDATE\nName:s\nVersion:v\nCell:A1\nLength:lots");
        assert_eq!(replies, vec![Reply::GenericError]);
    }

    #[test]
    fn test_protocol_header_tolerated() {
        let mut reader = ReplyReader::new();
        let replies = feed(
            &mut reader,
            "CHANGE OK\nProtocol:ps6\nName:s\nVersion:v2",
        );
        assert_eq!(
            replies,
            vec![Reply::ChangeOk {
                name: "s".into(),
                version: "v2".into()
            }]
        );
    }

    #[test]
    fn test_empty_idle_lines_skipped() {
        let mut reader = ReplyReader::new();
        let replies = feed(&mut reader, "\n\nSAVE OK\n");
        assert_eq!(replies, vec![Reply::SaveOk]);
    }

    #[test]
    fn test_interleaved_replies_reassemble_in_order() {
        let mut reader = ReplyReader::new();
        let script = "UPDATE\nName:s\nVersion:v2\nCell:A1\nLength:1\n3\nCHANGE OK\nName:s\nVersion:v3";
        let replies = feed(&mut reader, script);
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], Reply::Update { .. }));
        assert!(matches!(replies[1], Reply::ChangeOk { .. }));
    }
}
