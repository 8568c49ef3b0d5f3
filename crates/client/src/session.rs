//! Session engine: the protocol-driving side of the client.
//!
//! A [`Session`] owns the spreadsheet, the dependency graph, the server
//! version token, and the at-most-one pending change. UI calls (`change`,
//! `undo`, `save`, `leave`) and the socket reader thread are the only two
//! actors; both funnel through one mutex, and the reader applies replies in
//! the order the server delivered them; that ordering is the linearization
//! point of the collaborative model.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, warn};

use gridlink_engine::cell::{CellContents, CellValue};
use gridlink_engine::sheet::{Normalizer, SheetError, Spreadsheet, Validator};
use gridlink_io::ReadWriteError;
use gridlink_protocol::{Reply, ReplyReader, Request};

use crate::events::{EventHandler, SessionEvent};

/// Maximum reply line size (10MB). Protects against memory exhaustion from
/// malformed or hostile frames.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// CREATE sent, waiting for the server to mint the sheet.
    Creating,
    /// JOIN sent, waiting for the initial population payload.
    Joining,
    Joined,
    Closed,
}

/// The one local edit awaiting a server reply.
///
/// Set when CHANGE goes on the wire; cleared on OK (committed), FAIL
/// (rejected), or a WAIT whose version shows the server has moved on.
#[derive(Debug, Clone)]
struct PendingChange {
    cell: String,
    content: String,
}

struct SessionInner {
    sheet: Spreadsheet,
    /// Server-side sheet name.
    name: String,
    /// Kept for the automatic JOIN after CREATE OK.
    password: String,
    /// Opaque version token from the server; replaced on every confirmed
    /// mutation before any event fires.
    version: String,
    pending: Option<PendingChange>,
    state: SessionState,
    writer: Option<Box<dyn Write + Send>>,
    socket: Option<TcpStream>,
    handlers: Vec<EventHandler>,
}

/// A connection to a shared spreadsheet.
///
/// Cheap to clone; all clones share the same session state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    /// Connect to `host:port` and start the handshake: CREATE when
    /// `create_new`, otherwise JOIN. The outcome arrives as a `Joined` or
    /// `Failed` event; this call only fails on immediate socket errors.
    pub fn connect(
        host: &str,
        port: u16,
        file: &str,
        password: &str,
        create_new: bool,
        is_valid: Validator,
        normalize: Normalizer,
    ) -> io::Result<Session> {
        let stream = TcpStream::connect((host, port))?;
        let writer = BufWriter::new(stream.try_clone()?);
        let session = Session::build(
            Box::new(writer),
            Some(stream.try_clone()?),
            file,
            password,
            create_new,
            is_valid,
            normalize,
        );

        let reader_session = session.clone();
        thread::spawn(move || match reader_session.pump(stream) {
            Ok(()) => reader_session.connection_closed(),
            Err(e) => reader_session.socket_error(e.to_string()),
        });

        Ok(session)
    }

    /// Build a session over an arbitrary outbound transport, with no reader
    /// thread. `connect` wires this to a TCP stream; tests drive the receive
    /// side through [`Session::pump`] with scripted input.
    pub fn with_transport(
        writer: Box<dyn Write + Send>,
        file: &str,
        password: &str,
        create_new: bool,
        is_valid: Validator,
        normalize: Normalizer,
    ) -> Session {
        Session::build(writer, None, file, password, create_new, is_valid, normalize)
    }

    fn build(
        writer: Box<dyn Write + Send>,
        socket: Option<TcpStream>,
        file: &str,
        password: &str,
        create_new: bool,
        is_valid: Validator,
        normalize: Normalizer,
    ) -> Session {
        let mut inner = SessionInner {
            sheet: Spreadsheet::new(is_valid, normalize),
            name: file.to_string(),
            password: password.to_string(),
            version: String::new(),
            pending: None,
            state: if create_new {
                SessionState::Creating
            } else {
                SessionState::Joining
            },
            writer: Some(writer),
            socket,
            handlers: Vec::new(),
        };

        let handshake = if create_new {
            Request::Create {
                name: inner.name.clone(),
                password: inner.password.clone(),
            }
        } else {
            Request::Join {
                name: inner.name.clone(),
                password: inner.password.clone(),
            }
        };
        inner.send(&handshake);

        Session {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an event subscriber. Delivery is ordered and synchronous
    /// with reply dispatch; handlers must not call back into the session on
    /// the same thread of execution.
    pub fn subscribe(&self, handler: EventHandler) {
        self.lock().handlers.push(handler);
    }

    /// Propose new contents for a cell.
    ///
    /// Validates the name, the formula syntax, and acyclicity against the
    /// current graph before any bytes go out; those failures return `Err`.
    /// While another change is awaiting its reply, or the session is not
    /// joined, the input is deliberately dropped.
    pub fn change(&self, cell: &str, content: &str) -> Result<(), SheetError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Joined {
            debug!("change to {} dropped: session not joined", cell);
            return Ok(());
        }
        if inner.pending.is_some() {
            debug!("change to {} dropped: a change is already in flight", cell);
            return Ok(());
        }

        inner.sheet.check_contents(cell, content)?;
        let cell = inner.sheet.normalize_name(cell)?;

        let request = Request::Change {
            name: inner.name.clone(),
            version: inner.version.clone(),
            cell: cell.clone(),
            content: content.to_string(),
        };
        inner.pending = Some(PendingChange {
            cell,
            content: content.to_string(),
        });
        inner.send(&request);
        Ok(())
    }

    /// Ask the server to undo the sheet's most recent change.
    pub fn undo(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Joined {
            debug!("undo dropped: session not joined");
            return;
        }
        let request = Request::Undo {
            name: inner.name.clone(),
            version: inner.version.clone(),
        };
        inner.send(&request);
    }

    /// Ask the server to save the sheet on its side.
    pub fn save(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Joined {
            debug!("save dropped: session not joined");
            return;
        }
        let request = Request::Save {
            name: inner.name.clone(),
        };
        inner.send(&request);
    }

    /// Write the sheet to a local XML file and clear the dirty flag.
    pub fn save_local(&self, path: &Path) -> Result<(), ReadWriteError> {
        let mut inner = self.lock();
        gridlink_io::save_spreadsheet(&inner.sheet, &inner.version, path)?;
        inner.sheet.mark_saved();
        Ok(())
    }

    /// Send LEAVE and close the connection. The reader's in-flight receive
    /// completes with `ConnectionClosed`.
    pub fn leave(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return;
        }
        let request = Request::Leave {
            name: inner.name.clone(),
        };
        inner.send(&request);
        inner.teardown();
    }

    pub fn cell_contents(&self, name: &str) -> Result<CellContents, SheetError> {
        self.lock().sheet.contents(name)
    }

    pub fn cell_value(&self, name: &str) -> Result<CellValue, SheetError> {
        self.lock().sheet.value(name)
    }

    pub fn nonempty_cells(&self) -> Vec<String> {
        self.lock()
            .sheet
            .nonempty_names()
            .map(str::to_string)
            .collect()
    }

    /// The current server version token.
    pub fn version(&self) -> String {
        self.lock().version.clone()
    }

    /// The server-side sheet name.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// True once any confirmed edit has landed since the last local save.
    pub fn is_changed(&self) -> bool {
        self.lock().sheet.is_changed()
    }

    pub fn is_joined(&self) -> bool {
        self.lock().state == SessionState::Joined
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state == SessionState::Closed
    }

    /// Read framed replies from `reader` until end-of-stream or an I/O
    /// error, dispatching each completed reply.
    ///
    /// The socket reader thread lives in this loop; tests call it directly
    /// with scripted input. End-of-stream handling (the `ConnectionClosed`
    /// event) belongs to the caller.
    pub fn pump<R: Read>(&self, reader: R) -> io::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut frames = ReplyReader::new();
        loop {
            match read_line_bounded(&mut reader)? {
                Some(line) => {
                    if let Some(reply) = frames.push_line(&line) {
                        self.dispatch(reply);
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn dispatch(&self, reply: Reply) {
        let (events, handlers) = {
            let mut inner = self.lock();
            let events = inner.handle_reply(reply);
            (events, inner.handlers.clone())
        };
        for event in &events {
            for handler in &handlers {
                handler(event);
            }
        }
    }

    fn connection_closed(&self) {
        let handlers = {
            let mut inner = self.lock();
            inner.teardown();
            inner.handlers.clone()
        };
        let event = SessionEvent::ConnectionClosed;
        for handler in &handlers {
            handler(&event);
        }
    }

    fn socket_error(&self, reason: String) {
        let handlers = {
            let mut inner = self.lock();
            inner.teardown();
            inner.handlers.clone()
        };
        let event = SessionEvent::SocketError(reason);
        for handler in &handlers {
            handler(&event);
        }
    }
}

impl SessionInner {
    /// Apply one reply and produce the events it implies, in order.
    /// Version tokens are always updated before the events are returned.
    fn handle_reply(&mut self, reply: Reply) -> Vec<SessionEvent> {
        match reply {
            Reply::CreateOk { name, password } => {
                // Join the sheet we just created, with the server's
                // (possibly rewritten) credentials.
                self.name = name;
                self.password = password;
                self.state = SessionState::Joining;
                let join = Request::Join {
                    name: self.name.clone(),
                    password: self.password.clone(),
                };
                self.send(&join);
                Vec::new()
            }

            Reply::CreateFail { lines } | Reply::JoinFail { lines } => {
                self.teardown();
                vec![SessionEvent::Failed(lines)]
            }

            Reply::JoinOk {
                name,
                version,
                payload,
            } => {
                self.name = name;
                self.version = version;
                match gridlink_io::read_cells(&payload) {
                    Ok(doc) => {
                        for (cell, contents) in &doc.cells {
                            if let Err(e) = self.sheet.set_contents(cell, contents) {
                                warn!("dropping cell {} from server sheet: {}", cell, e);
                            }
                        }
                        self.sheet.mark_saved();
                        self.state = SessionState::Joined;
                        vec![SessionEvent::Joined]
                    }
                    Err(e) => {
                        warn!("unreadable JOIN payload: {}", e);
                        self.teardown();
                        vec![SessionEvent::Failed(vec![e.to_string()])]
                    }
                }
            }

            Reply::ChangeOk { version, .. } => {
                self.version = version;
                match self.pending.take() {
                    Some(pending) => match self.sheet.set_contents(&pending.cell, &pending.content)
                    {
                        Ok(cells) => vec![SessionEvent::Updated(cells)],
                        Err(e) => {
                            // Pre-validated at send time; only a conflicting
                            // concurrent edit can get us here.
                            warn!("confirmed change to {} no longer applies: {}", pending.cell, e);
                            vec![SessionEvent::GenericError]
                        }
                    },
                    None => {
                        warn!("CHANGE OK with no pending change");
                        Vec::new()
                    }
                }
            }

            Reply::ChangeWait { version, .. } => {
                if version == self.version {
                    // The server is merely serializing and we are already
                    // caught up: retry the same change.
                    if let Some(pending) = self.pending.clone() {
                        let request = Request::Change {
                            name: self.name.clone(),
                            version: self.version.clone(),
                            cell: pending.cell,
                            content: pending.content,
                        };
                        self.send(&request);
                    }
                } else {
                    // Someone else's edit won; the UPDATE carrying it will
                    // advance our version. Drop ours and stay subscribed.
                    debug!("dropping pending change: server is at {}", version);
                    self.pending = None;
                }
                Vec::new()
            }

            Reply::ChangeFail { lines } => {
                self.pending = None;
                vec![SessionEvent::Failed(lines)]
            }

            Reply::UndoOk {
                version,
                cell,
                content,
                ..
            }
            | Reply::Update {
                version,
                cell,
                content,
                ..
            } => {
                self.version = version;
                match self.sheet.set_contents(&cell, &content) {
                    Ok(cells) => vec![SessionEvent::Updated(cells)],
                    Err(e) => {
                        warn!("server edit to {} does not apply: {}", cell, e);
                        vec![SessionEvent::GenericError]
                    }
                }
            }

            Reply::UndoEnd { version, .. } => {
                self.version = version;
                vec![SessionEvent::UndoEnd]
            }

            Reply::UndoWait { version, .. } => {
                if version == self.version {
                    let request = Request::Undo {
                        name: self.name.clone(),
                        version: self.version.clone(),
                    };
                    self.send(&request);
                }
                Vec::new()
            }

            Reply::UndoFail { lines } | Reply::SaveFail { lines } => {
                vec![SessionEvent::Failed(lines)]
            }

            Reply::SaveOk => Vec::new(),

            Reply::GenericError => vec![SessionEvent::GenericError],
        }
    }

    fn send(&mut self, request: &Request) {
        let Some(writer) = self.writer.as_mut() else {
            debug!("dropping {:?}: session closed", request);
            return;
        };
        let frame = request.to_frame();
        if let Err(e) = writer
            .write_all(frame.as_bytes())
            .and_then(|_| writer.flush())
        {
            // The reader thread will observe the broken connection and
            // surface it as an event.
            warn!("send failed: {}", e);
        }
    }

    fn teardown(&mut self) {
        self.writer = None;
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.pending = None;
        self.state = SessionState::Closed;
    }
}

/// Read one `\n`-terminated line, with a size cap.
///
/// Returns `Ok(None)` at end-of-stream, including mid-line, per the rule
/// that any EOF read is terminal. Retries on `Interrupted`.
fn read_line_bounded<R: Read>(reader: &mut BufReader<R>) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(256);
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
                if buf.len() > MAX_LINE_BYTES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("line exceeds {}MB limit", MAX_LINE_BYTES / (1024 * 1024)),
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid UTF-8: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================
