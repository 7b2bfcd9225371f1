//! Streaming transfer client for the deconfliction service
//!
//! Uploads the assembled pack plus branch metadata and decodes the
//! `multipart/mixed` response incrementally:
//! - Status, protocol version, and content type are gated before the
//!   first part is surfaced
//! - Parts are yielded strictly in arrival order, one fully materialized
//!   part at a time
//! - Dropping the stream releases the connection, even mid-part

use bytes::{Buf, BytesMut};
use reqwest::Method;

use crate::object::ObjectId;
use crate::protocol::{
    self, ControlMessage, ResponseMessage, API_RESPONSE_VERSION, MAX_PART_SIZE,
};

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors that can occur while talking to the service
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("server speaks API version {got:?}, expected {expected:?}; please update this client")]
    VersionMismatch { expected: &'static str, got: String },

    #[error("unexpected content type: {0}")]
    UnsupportedContentType(String),

    #[error("unexpected part content type: {0}")]
    UnsupportedPartType(String),

    #[error("malformed multipart response: {0}")]
    MalformedEnvelope(String),

    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client identity metadata attached to every request.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    /// Client release version.
    pub version: String,
    /// Version string of the local toolchain.
    pub git_version: String,
}

/// Branch metadata and the assembled pack for one deconflict upload.
///
/// The pack is moved into the request body wholesale; it is produced once
/// and never reused.
#[derive(Debug)]
pub struct DeconflictRequest {
    pub main_ref: String,
    pub topic_ref: String,
    pub main_sha: ObjectId,
    pub topic_sha: ObjectId,
    /// Deduplicated remote-URL hints, best effort.
    pub remotes: Vec<String>,
    pub pack: Vec<u8>,
}

/// HTTP client for the deconfliction service.
pub struct Client {
    base_url: String,
    token: String,
    identity: ClientIdentity,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client targeting `base_url` (e.g. `https://dmerge.dev`).
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        identity: ClientIdentity,
    ) -> Self {
        let url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url: url,
            token: token.into(),
            identity,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "multipart/mixed")
            .header(protocol::HDR_GIT_VERSION, &self.identity.git_version)
            .header(protocol::HDR_CLIENT_VERSION, &self.identity.version)
            .header(protocol::HDR_CLIENT_OS, std::env::consts::OS)
            .header(protocol::HDR_CLIENT_ARCH, std::env::consts::ARCH)
            .header(
                protocol::HDR_CLIENT_API_VERSION,
                protocol::API_REQUEST_VERSION,
            )
    }

    /// GET /cli/root: service greeting/status.
    pub async fn root(&self) -> Result<ResponseStream> {
        self.start(self.request(Method::GET, "/cli/root")).await
    }

    /// GET /cli/check-auth: verify the stored token.
    pub async fn check_auth(&self) -> Result<ResponseStream> {
        self.start(self.request(Method::GET, "/cli/check-auth"))
            .await
    }

    /// POST /cli/<verb>/: upload a divergence pack for deconfliction.
    pub async fn deconflict(&self, verb: &str, req: DeconflictRequest) -> Result<ResponseStream> {
        let mut rb = self
            .request(Method::POST, &format!("/cli/{}/", verb))
            .header(protocol::HDR_MAIN_REF, &req.main_ref)
            .header(protocol::HDR_TOPIC_REF, &req.topic_ref)
            .header(protocol::HDR_MAIN_SHA, req.main_sha.to_hex())
            .header(protocol::HDR_TOPIC_SHA, req.topic_sha.to_hex())
            .header(protocol::HDR_PACK_SIZE, req.pack.len().to_string());
        for remote in &req.remotes {
            rb = rb.header(protocol::HDR_REMOTE, remote);
        }
        self.start(rb.body(req.pack)).await
    }

    /// Send the request and run the pre-stream gates: status must be 200,
    /// the server API version must match exactly, and the content type
    /// must be multipart with a boundary.
    async fn start(&self, rb: reqwest::RequestBuilder) -> Result<ResponseStream> {
        let resp = rb.send().await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let url = resp.url().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransferError::UnexpectedStatus {
                status: status.as_u16(),
                url,
                body: excerpt(body),
            });
        }

        let server_version = resp
            .headers()
            .get(protocol::HDR_SERVER_API_VERSION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if server_version != API_RESPONSE_VERSION {
            return Err(TransferError::VersionMismatch {
                expected: API_RESPONSE_VERSION,
                got: server_version,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let (media_type, boundary) = parse_content_type(&content_type);
        if !media_type.starts_with("multipart/") {
            return Err(TransferError::UnsupportedContentType(media_type));
        }
        let boundary = boundary.ok_or_else(|| {
            TransferError::MalformedEnvelope("content type has no boundary parameter".to_string())
        })?;

        Ok(ResponseStream {
            resp,
            decoder: MultipartDecoder::new(&boundary),
            failed: false,
        })
    }
}

/// Lazily decoded multipart response.
///
/// Pull messages with [`ResponseStream::next`]. The stream ends with
/// `None` after the closing delimiter, or with a single terminal error;
/// messages already yielded stay valid either way.
#[derive(Debug)]
pub struct ResponseStream {
    resp: reqwest::Response,
    decoder: MultipartDecoder,
    failed: bool,
}

impl ResponseStream {
    /// The next message, suspending only on network reads.
    pub async fn next(&mut self) -> Option<Result<ResponseMessage>> {
        if self.failed || self.decoder.is_done() {
            return None;
        }
        loop {
            match self.decoder.next_message() {
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Ok(Some(msg)) => return Some(Ok(msg)),
                Ok(None) => {
                    if self.decoder.is_done() {
                        return None;
                    }
                    match self.resp.chunk().await {
                        Ok(Some(chunk)) => self.decoder.push(&chunk),
                        Ok(None) => self.decoder.finish(),
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e.into()));
                        }
                    }
                }
            }
        }
    }
}

/// Incremental decoder for a `multipart/*` body.
///
/// Push network chunks of any granularity with [`MultipartDecoder::push`],
/// pull complete parts with [`MultipartDecoder::next_message`]. One part
/// is buffered at a time, bounded by [`MAX_PART_SIZE`].
#[derive(Debug)]
pub struct MultipartDecoder {
    dash_boundary: Vec<u8>,
    buf: BytesMut,
    state: DecodeState,
    eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Before the first boundary line.
    Preamble,
    /// Inside a part's header block.
    Headers,
    /// Inside a part's body.
    Body(PartKind),
    /// The closing delimiter was seen; anything after it is ignored.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Json,
    Binary,
}

impl MultipartDecoder {
    /// Create a decoder for the given boundary parameter.
    pub fn new(boundary: &str) -> Self {
        let mut dash_boundary = Vec::with_capacity(boundary.len() + 2);
        dash_boundary.extend_from_slice(b"--");
        dash_boundary.extend_from_slice(boundary.as_bytes());
        Self {
            dash_boundary,
            buf: BytesMut::new(),
            state: DecodeState::Preamble,
            eof: false,
        }
    }

    /// Append raw body bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Signal end of the body stream.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Whether the closing delimiter has been decoded.
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// The next complete part, `Ok(None)` when more input is needed or the
    /// stream is done. After [`MultipartDecoder::finish`], an incomplete
    /// envelope is an error rather than a wait.
    pub fn next_message(&mut self) -> Result<Option<ResponseMessage>> {
        loop {
            match self.state {
                DecodeState::Done => return Ok(None),
                DecodeState::Preamble => {
                    let Some(idx) = find_at_line_start(&self.buf, &self.dash_boundary) else {
                        return self.need_more();
                    };
                    match self.cross_delimiter(idx + self.dash_boundary.len())? {
                        Crossed::NeedMore => return self.need_more(),
                        Crossed::Advanced => {}
                    }
                }
                DecodeState::Headers => {
                    if self.buf.starts_with(b"\r\n") {
                        return Err(TransferError::UnsupportedPartType(
                            "(no content type)".to_string(),
                        ));
                    }
                    let Some(end) = find(&self.buf, b"\r\n\r\n") else {
                        return self.need_more();
                    };
                    let value = content_type_of(&self.buf[..end]).ok_or_else(|| {
                        TransferError::UnsupportedPartType("(no content type)".to_string())
                    })?;
                    let bare = value.split(';').next().unwrap_or("").trim().to_string();
                    let kind = if bare.eq_ignore_ascii_case(protocol::PART_TYPE_JSON) {
                        PartKind::Json
                    } else if bare.eq_ignore_ascii_case(protocol::PART_TYPE_BINARY) {
                        PartKind::Binary
                    } else {
                        return Err(TransferError::UnsupportedPartType(value));
                    };
                    self.buf.advance(end + 4);
                    self.state = DecodeState::Body(kind);
                }
                DecodeState::Body(kind) => {
                    let Some(idx) = find_part_end(&self.buf, &self.dash_boundary) else {
                        if self.buf.len() > MAX_PART_SIZE + self.dash_boundary.len() + 4 {
                            return Err(TransferError::MalformedEnvelope(format!(
                                "part exceeds maximum size of {} bytes",
                                MAX_PART_SIZE
                            )));
                        }
                        return self.need_more();
                    };
                    // Decide what follows the delimiter before consuming the
                    // body, so an incomplete tail leaves the buffer intact.
                    let after = idx + 2 + self.dash_boundary.len();
                    if self.buf.len() < after + 2 {
                        return self.need_more();
                    }
                    let body = self.buf.split_to(idx).freeze();
                    self.buf.advance(2 + self.dash_boundary.len());
                    match self.cross_delimiter(0)? {
                        Crossed::NeedMore => unreachable!("tail length checked above"),
                        Crossed::Advanced => {}
                    }
                    let msg = match kind {
                        PartKind::Json => {
                            let ctl: ControlMessage = serde_json::from_slice(&body)?;
                            ResponseMessage::Control(ctl)
                        }
                        PartKind::Binary => ResponseMessage::Binary(body),
                    };
                    return Ok(Some(msg));
                }
            }
        }
    }

    /// Consume the two bytes after a boundary marker ending at `pos`:
    /// `--` closes the stream, CRLF opens the next part's headers.
    fn cross_delimiter(&mut self, pos: usize) -> Result<Crossed> {
        if self.buf.len() < pos + 2 {
            return Ok(Crossed::NeedMore);
        }
        match &self.buf[pos..pos + 2] {
            b"--" => {
                self.state = DecodeState::Done;
                self.buf.clear();
                Ok(Crossed::Advanced)
            }
            b"\r\n" => {
                self.buf.advance(pos + 2);
                self.state = DecodeState::Headers;
                Ok(Crossed::Advanced)
            }
            other => Err(TransferError::MalformedEnvelope(format!(
                "unexpected bytes after boundary: {:?}",
                other
            ))),
        }
    }

    fn need_more(&self) -> Result<Option<ResponseMessage>> {
        if self.eof {
            Err(TransferError::MalformedEnvelope(
                "truncated response body".to_string(),
            ))
        } else {
            Ok(None)
        }
    }
}

enum Crossed {
    NeedMore,
    Advanced,
}

/// First occurrence of `needle` at the start of a line.
fn find_at_line_start(hay: &[u8], needle: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        if (i == 0 || hay[i - 1] == b'\n') && hay[i..].starts_with(needle) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Index of the CRLF that terminates a part body, i.e. the start of
/// `\r\n--boundary`.
fn find_part_end(hay: &[u8], dash_boundary: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 2 + dash_boundary.len() <= hay.len() {
        if hay[i] == b'\r' && hay[i + 1] == b'\n' && hay[i + 2..].starts_with(dash_boundary) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Extract the Content-Type value from a part's header block.
fn content_type_of(headers: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-type") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Split a Content-Type header into its media type (lowercased) and the
/// boundary parameter, if any.
fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut boundary = None;
    for param in parts {
        let Some((name, val)) = param.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("boundary") {
            let val = val.trim().trim_matches('"');
            if !val.is_empty() {
                boundary = Some(val.to_string());
            }
        }
    }
    (media, boundary)
}

fn excerpt(mut body: String) -> String {
    const MAX: usize = 2048;
    if body.len() > MAX {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}
