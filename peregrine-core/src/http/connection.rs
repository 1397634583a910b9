use std::fs::{self, File};
use std::io::{IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use memchr::memchr2;
use memmap2::Mmap;
use mysql::Conn;
use tracing::{debug, info, warn};

use super::{HttpCode, Method, NextStep, SendOutcome, TrigMode};
use crate::db::UserDirectory;

/// Incoming request bytes are staged here; a request larger than this is
/// rejected by closing the connection.
pub const READ_BUFFER_SIZE: usize = 2048;
/// Response status line, headers, and inline error bodies are staged here.
pub const WRITE_BUFFER_SIZE: usize = 1024;
/// Longest resolved filesystem path the dispatcher accepts.
const FILENAME_LEN: usize = 200;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
const ERROR_400_FORM: &str = "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Body served for an existing but empty file.
const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// Best-effort reply for connections the server cannot take on (descriptor
/// cap reached or the worker queue is full).
pub const BUSY_RESPONSE: &str =
    "HTTP/1.1 500 Internal Error\r\nContent-Length:20\r\nConnection:close\r\n\r\nInternal server busy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Header,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Per-connection HTTP/1.1 state machine.
///
/// The parser is incremental: [`read_once`](Self::read_once) appends bytes,
/// [`process`](Self::process) consumes as much as is there and either asks
/// for more or stages a response, and [`write`](Self::write) drives the
/// scatter-gather send. The caller owns epoll: each method reports the next
/// interest instead of re-arming the descriptor itself.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    mode: TrigMode,
    doc_root: Arc<PathBuf>,

    read_buf: Box<[u8]>,
    /// One past the last byte received.
    read_idx: usize,
    /// One past the last byte the line scanner consumed.
    checked_idx: usize,
    /// Start of the line currently being parsed.
    start_line: usize,

    write_buf: Box<[u8]>,
    write_idx: usize,

    check_state: CheckState,
    method: Method,
    /// Half-open ranges into `read_buf`; `(0, 0)` until parsed.
    url: (usize, usize),
    host: (usize, usize),
    body: (usize, usize),
    content_length: usize,
    keep_alive: bool,
    /// Set for POST: the body carries CGI-style form fields.
    cgi: bool,

    real_path: PathBuf,
    /// Read-only shared mapping of the file being served.
    file: Option<Mmap>,
    file_len: usize,

    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl HttpConnection {
    /// Wrap an accepted socket. The caller decides blocking mode and epoll
    /// registration.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        mode: TrigMode,
        doc_root: Arc<PathBuf>,
    ) -> Self {
        Self {
            stream,
            peer,
            mode,
            doc_root,
            read_buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: vec![0; WRITE_BUFFER_SIZE].into_boxed_slice(),
            write_idx: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: (0, 0),
            host: (0, 0),
            body: (0, 0),
            content_length: 0,
            keep_alive: false,
            cgi: false,
            real_path: PathBuf::new(),
            file: None,
            file_len: 0,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Peer address the socket was accepted from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the current request asked for keep-alive.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Pull bytes off the socket into the read buffer.
    ///
    /// Level-triggered mode does a single read; edge-triggered mode drains
    /// until `EAGAIN`. Returns `false` on orderly close, error, or a full
    /// buffer, in which case the connection is finished.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }
        match self.mode {
            TrigMode::Level => match self.stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => false,
                Ok(n) => {
                    self.read_idx += n;
                    true
                }
                Err(_) => false,
            },
            TrigMode::Edge => loop {
                match self.stream.read(&mut self.read_buf[self.read_idx..]) {
                    Ok(0) => return false,
                    Ok(n) => {
                        self.read_idx += n;
                        if self.read_idx >= READ_BUFFER_SIZE {
                            // No room for the rest of the request.
                            return false;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => return false,
                }
            },
        }
    }

    /// Parse buffered bytes and, on a complete request, stage the response.
    ///
    /// `db` is the leased database handle, used only by the registration
    /// endpoint; login runs entirely against the in-memory directory.
    pub fn process(&mut self, users: &UserDirectory, db: Option<&mut Conn>) -> NextStep {
        let code = self.process_read();
        if code == HttpCode::NoRequest {
            return NextStep::AwaitRead;
        }
        let code = if code == HttpCode::GetRequest {
            self.do_request(users, db)
        } else {
            code
        };
        if self.build_response(code) {
            NextStep::AwaitWrite
        } else {
            NextStep::Close
        }
    }

    // ---- parsing -------------------------------------------------------

    /// Scan for the next CRLF, NUL-ing it out and advancing `checked_idx`
    /// past it.
    fn parse_line(&mut self) -> LineStatus {
        let Some(pos) = memchr2(b'\r', b'\n', &self.read_buf[self.checked_idx..self.read_idx])
        else {
            return LineStatus::Open;
        };
        let i = self.checked_idx + pos;
        if self.read_buf[i] == b'\r' {
            if i + 1 == self.read_idx {
                // CR is the last byte so far; the LF may still arrive.
                return LineStatus::Open;
            }
            if self.read_buf[i + 1] == b'\n' {
                self.read_buf[i] = 0;
                self.read_buf[i + 1] = 0;
                self.checked_idx = i + 2;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }
        // Bare LF is only valid directly after a CR from a previous read.
        if i >= 1 && self.read_buf[i - 1] == b'\r' {
            self.read_buf[i - 1] = 0;
            self.read_buf[i] = 0;
            self.checked_idx = i + 1;
            return LineStatus::Ok;
        }
        LineStatus::Bad
    }

    fn process_read(&mut self) -> HttpCode {
        let mut line_status = LineStatus::Ok;
        loop {
            if self.check_state == CheckState::Content && line_status == LineStatus::Ok {
                // Body bytes are consumed without line splitting.
            } else {
                line_status = self.parse_line();
                if line_status != LineStatus::Ok {
                    break;
                }
            }

            let start = self.start_line;
            match self.check_state {
                CheckState::RequestLine => {
                    let end = self.checked_idx - 2;
                    self.start_line = self.checked_idx;
                    if self.parse_request_line(start, end) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Header => {
                    let end = self.checked_idx - 2;
                    self.start_line = self.checked_idx;
                    match self.parse_headers(start, end) {
                        HttpCode::GetRequest => return HttpCode::GetRequest,
                        HttpCode::BadRequest => return HttpCode::BadRequest,
                        _ => {}
                    }
                }
                CheckState::Content => {
                    self.start_line = self.checked_idx;
                    if self.parse_content(start) == HttpCode::GetRequest {
                        return HttpCode::GetRequest;
                    }
                    line_status = LineStatus::Open;
                }
            }
        }
        HttpCode::NoRequest
    }

    /// `METHOD URL VERSION`, split on spaces/tabs. Only GET and POST are
    /// accepted, and only `HTTP/1.1`.
    fn parse_request_line(&mut self, start: usize, end: usize) -> HttpCode {
        let text = &self.read_buf[start..end];

        let Some(m_end) = text.iter().position(|b| *b == b' ' || *b == b'\t') else {
            return HttpCode::BadRequest;
        };
        let method = if text[..m_end].eq_ignore_ascii_case(b"GET") {
            Method::Get
        } else if text[..m_end].eq_ignore_ascii_case(b"POST") {
            Method::Post
        } else {
            return HttpCode::BadRequest;
        };

        let url_start = skip_ws(text, m_end);
        let Some(sep) = text[url_start..]
            .iter()
            .position(|b| *b == b' ' || *b == b'\t')
        else {
            return HttpCode::BadRequest;
        };
        let url_end = url_start + sep;
        let version_start = skip_ws(text, url_end);

        if !text[version_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        // Absolute-form targets: strip the scheme and authority.
        let mut u_off = url_start;
        if text[u_off..url_end].len() >= 7 && text[u_off..u_off + 7].eq_ignore_ascii_case(b"http://")
        {
            u_off += 7;
            match text[u_off..url_end].iter().position(|b| *b == b'/') {
                Some(i) => u_off += i,
                None => return HttpCode::BadRequest,
            }
        } else if text[u_off..url_end].len() >= 8
            && text[u_off..u_off + 8].eq_ignore_ascii_case(b"https://")
        {
            u_off += 8;
            match text[u_off..url_end].iter().position(|b| *b == b'/') {
                Some(i) => u_off += i,
                None => return HttpCode::BadRequest,
            }
        }

        if u_off >= url_end || text[u_off] != b'/' {
            return HttpCode::BadRequest;
        }

        self.method = method;
        if method == Method::Post {
            self.cgi = true;
        }
        self.url = (start + u_off, start + url_end);
        self.check_state = CheckState::Header;
        HttpCode::NoRequest
    }

    /// One header line; an empty line ends the header section.
    fn parse_headers(&mut self, start: usize, end: usize) -> HttpCode {
        if start == end {
            if self.content_length != 0 {
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let text = &self.read_buf[start..end];
        if starts_with_ci(text, b"Connection:") {
            let value = text[b"Connection:".len()..].trim_ascii();
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if starts_with_ci(text, b"Content-length:") {
            let value = text[b"Content-length:".len()..].trim_ascii();
            self.content_length = ascii_to_usize(value);
        } else if starts_with_ci(text, b"Host:") {
            let off = skip_ws(text, b"Host:".len());
            self.host = (start + off, end);
        } else {
            info!("unknown header: {}", String::from_utf8_lossy(text));
        }
        HttpCode::NoRequest
    }

    /// The body is complete once `content_length` bytes sit past the
    /// header section.
    fn parse_content(&mut self, start: usize) -> HttpCode {
        if self.read_idx >= self.content_length + self.checked_idx {
            self.body = (start, start + self.content_length);
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }

    // ---- dispatch ------------------------------------------------------

    /// Resolve the parsed URL against the document root and map the file.
    fn do_request(&mut self, users: &UserDirectory, db: Option<&mut Conn>) -> HttpCode {
        let raw = self.read_buf[self.url.0..self.url.1].to_vec();
        let url: &[u8] = if raw.as_slice() == b"/" {
            b"/judge.html"
        } else {
            raw.as_slice()
        };

        let last_slash = url
            .iter()
            .rposition(|b| *b == b'/')
            .unwrap_or_default();
        let flag = url.get(last_slash + 1).copied().unwrap_or(0);

        let mut rewritten: Option<&'static str> = None;
        if self.cgi && (flag == b'2' || flag == b'3') {
            let body = self.read_buf[self.body.0..self.body.1].to_vec();
            let Some((name, password)) = parse_credentials(&body) else {
                return HttpCode::BadRequest;
            };
            if flag == b'3' {
                let registered = match db {
                    Some(conn) => !users.contains(&name) && users.register(&name, &password, conn),
                    None => false,
                };
                rewritten = Some(if registered {
                    "/log.html"
                } else {
                    "/registerError.html"
                });
            } else {
                rewritten = Some(if users.verify(&name, &password) {
                    "/welcome.html"
                } else {
                    "/logError.html"
                });
            }
        }

        let target: &[u8] = match rewritten {
            Some(page) => page.as_bytes(),
            None => match flag {
                b'0' => b"/register.html",
                b'1' => b"/log.html",
                b'5' => b"/picture.html",
                b'6' => b"/video.html",
                b'7' => b"/fans.html",
                _ => url,
            },
        };

        let mut path = (*self.doc_root).clone();
        path.push(std::ffi::OsStr::from_bytes(&target[1..]));
        if path.as_os_str().len() >= FILENAME_LEN {
            return HttpCode::NoResource;
        }

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        self.file_len = meta.len() as usize;
        if self.file_len > 0 {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(_) => return HttpCode::NoResource,
            };
            // Read-only shared mapping; dropped when the response is done.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => self.file = Some(map),
                Err(err) => {
                    warn!("mmap of {} failed: {err}", path.display());
                    return HttpCode::NoResource;
                }
            }
        }
        debug!(
            "{} -> {} ({} bytes)",
            String::from_utf8_lossy(url),
            path.display(),
            self.file_len
        );
        self.real_path = path;
        HttpCode::FileRequest
    }

    // ---- response ------------------------------------------------------

    fn push_response(&mut self, text: &str) -> bool {
        let bytes = text.as_bytes();
        if self.write_idx + bytes.len() >= WRITE_BUFFER_SIZE {
            return false;
        }
        self.write_buf[self.write_idx..self.write_idx + bytes.len()].copy_from_slice(bytes);
        self.write_idx += bytes.len();
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.push_response(&format!("HTTP/1.1 {status} {title}\r\n"))
    }

    fn add_headers(&mut self, content_length: usize) -> bool {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.push_response(&format!("Content-Length:{content_length}\r\n"))
            && self.push_response(&format!("Connection:{connection}\r\n"))
            && self.push_response("\r\n")
    }

    /// Stage status line, headers, and body for `code`. Returns `false`
    /// when the header buffer overflows, which closes the connection.
    fn build_response(&mut self, code: HttpCode) -> bool {
        self.write_idx = 0;
        let mut file_payload = false;
        let ok = match code {
            HttpCode::InternalError => {
                self.add_status_line(500, ERROR_500_TITLE)
                    && self.add_headers(ERROR_500_FORM.len())
                    && self.push_response(ERROR_500_FORM)
            }
            HttpCode::BadRequest => {
                self.add_status_line(400, ERROR_400_TITLE)
                    && self.add_headers(ERROR_400_FORM.len())
                    && self.push_response(ERROR_400_FORM)
            }
            HttpCode::ForbiddenRequest => {
                self.add_status_line(403, ERROR_403_TITLE)
                    && self.add_headers(ERROR_403_FORM.len())
                    && self.push_response(ERROR_403_FORM)
            }
            HttpCode::NoResource => {
                self.add_status_line(404, ERROR_404_TITLE)
                    && self.add_headers(ERROR_404_FORM.len())
                    && self.push_response(ERROR_404_FORM)
            }
            HttpCode::FileRequest => {
                if self.file_len != 0 {
                    file_payload = true;
                    self.add_status_line(200, OK_200_TITLE) && self.add_headers(self.file_len)
                } else {
                    self.add_status_line(200, OK_200_TITLE)
                        && self.add_headers(EMPTY_FILE_BODY.len())
                        && self.push_response(EMPTY_FILE_BODY)
                }
            }
            _ => return false,
        };
        if !ok {
            return false;
        }
        self.bytes_to_send = if file_payload {
            self.write_idx + self.file_len
        } else {
            self.write_idx
        };
        self.bytes_have_send = 0;
        true
    }

    /// Drive the staged response onto the socket with `writev`.
    pub fn write(&mut self) -> SendOutcome {
        if self.bytes_to_send == 0 {
            self.reset_for_next();
            return SendOutcome::KeepAlive;
        }
        loop {
            let result = if self.bytes_have_send < self.write_idx {
                let head = &self.write_buf[self.bytes_have_send..self.write_idx];
                match &self.file {
                    Some(map) => self
                        .stream
                        .write_vectored(&[IoSlice::new(head), IoSlice::new(&map[..self.file_len])]),
                    None => self.stream.write_vectored(&[IoSlice::new(head)]),
                }
            } else {
                let off = self.bytes_have_send - self.write_idx;
                match &self.file {
                    Some(map) => self
                        .stream
                        .write_vectored(&[IoSlice::new(&map[off..self.file_len])]),
                    // Header-only responses finish in the branch above.
                    None => return SendOutcome::Close,
                }
            };

            match result {
                Ok(0) => {
                    self.file = None;
                    return SendOutcome::Close;
                }
                Ok(n) => self.bytes_have_send += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return SendOutcome::Blocked;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("send to {} failed: {err}", self.peer);
                    self.file = None;
                    return SendOutcome::Close;
                }
            }

            if self.bytes_have_send >= self.bytes_to_send {
                self.file = None;
                if self.keep_alive {
                    self.reset_for_next();
                    return SendOutcome::KeepAlive;
                }
                return SendOutcome::Close;
            }
        }
    }

    /// Best-effort overload reply, sent right before the caller closes the
    /// connection. Errors are ignored; the peer is being dropped anyway.
    pub fn reject_busy(&mut self) {
        let _ = self.stream.write_all(BUSY_RESPONSE.as_bytes());
    }

    /// Return the connection to its initial parse state for the next
    /// request on the same socket.
    fn reset_for_next(&mut self) {
        self.read_buf.fill(0);
        self.write_buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.write_idx = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url = (0, 0);
        self.host = (0, 0);
        self.body = (0, 0);
        self.content_length = 0;
        self.keep_alive = false;
        self.cgi = false;
        self.real_path = PathBuf::new();
        self.file = None;
        self.file_len = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }
}

impl AsFd for HttpConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn skip_ws(text: &[u8], mut i: usize) -> usize {
    while i < text.len() && (text[i] == b' ' || text[i] == b'\t') {
        i += 1;
    }
    i
}

fn starts_with_ci(text: &[u8], prefix: &[u8]) -> bool {
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Leading-digits conversion in the `atol` tradition: garbage parses to 0.
fn ascii_to_usize(text: &[u8]) -> usize {
    let mut value: usize = 0;
    for b in text {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    value
}

/// Slice `user=<name>&password=<password>` the way the form pages submit
/// it. No percent-decoding is applied.
fn parse_credentials(body: &[u8]) -> Option<(String, String)> {
    let amp = body.iter().position(|b| *b == b'&')?;
    if amp < 5 || body.len() < amp + 10 {
        return None;
    }
    let name = &body[5..amp];
    let password = &body[amp + 10..];
    Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}
