//! The per-request context.
//!
//! One [`Ctx`] is created per request (or per WebSocket session) and owns
//! everything a handler may touch: the parsed request, the mutable current
//! path, the response being built, the scratch attributes, and the
//! [`UpgradableResponse`] holding the client socket.

use crate::prelude::*;
use crate::response::State;
use tokio_tungstenite::WebSocketStream;

/// How much of an unread request body the connection loop drains before
/// giving up on keep-alive.
const DISCARD_LIMIT: u64 = 64 * 1024;

/// The response body being built.
pub enum Body {
    /// No body.
    Empty,
    /// An in-memory body.
    Bytes(Bytes),
    /// A streamed body with a known length; cut at the source's error or
    /// close.
    Stream {
        /// The byte source.
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// The number of bytes the source yields.
        len: u64,
    },
}
impl Body {
    /// The length of the body in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Stream { len, .. } => *len,
        }
    }
    /// Whether the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl Debug for Body {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Self::Stream { len, .. } => write!(f, "Body::Stream({len} bytes)"),
        }
    }
}

/// Converts a `host` authority to its comparable hostname form:
/// port stripped, lowercased, punycode labels decoded to unicode.
#[must_use]
pub fn unicode_hostname(host: &str) -> String {
    let without_port = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.bytes().all(|b| b.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    let lower = without_port.to_ascii_lowercase();
    if lower.contains("xn--") {
        let (unicode, result) = idna::domain_to_unicode(&lower);
        if result.is_ok() {
            return unicode;
        }
    }
    lower
}

/// The context of one request, handed through the middleware chain.
pub struct Ctx {
    method: Method,
    version: Version,
    host: String,
    hostname: String,
    path: String,
    original_path: String,
    querystring: String,
    headers: HeaderMap,
    ip: IpAddr,
    secure: bool,
    ws: bool,

    status: StatusCode,
    res_headers: HeaderMap,
    body: Body,
    handled: bool,

    handler: Option<String>,
    site: Option<String>,
    /// Parameters captured by the matched path pattern.
    pub params: HashMap<String, String>,
    bytes: u64,
    started: Instant,
    error: Option<String>,
    log_enabled: bool,
    loggers: Vec<String>,
    session: Option<String>,

    body_prefix: Bytes,
    body_len: u64,
    body_consumed: bool,

    res: UpgradableResponse,
}

impl Ctx {
    /// Builds a context from a parsed request head.
    ///
    /// `surplus` holds bytes read past the head (the start of the body),
    /// `res` owns the client socket.
    pub fn new(
        request: &http::Request<()>,
        surplus: Bytes,
        ip: IpAddr,
        secure: bool,
        res: UpgradableResponse,
    ) -> Self {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let body_len = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let path = request.uri().path().to_owned();
        Self {
            method: request.method().clone(),
            version: request.version(),
            hostname: unicode_hostname(&host),
            host,
            original_path: path.clone(),
            path,
            querystring: request.uri().query().unwrap_or("").to_owned(),
            ws: websocket::is_upgrade_request(request.headers()),
            headers: request.headers().clone(),
            ip,
            secure,
            status: StatusCode::OK,
            res_headers: HeaderMap::new(),
            body: Body::Empty,
            handled: false,
            handler: None,
            site: None,
            params: HashMap::new(),
            bytes: 0,
            started: Instant::now(),
            error: None,
            log_enabled: true,
            loggers: Vec::new(),
            session: None,
            body_prefix: surplus,
            body_len,
            body_consumed: false,
            res,
        }
    }

    // --- request side ---

    /// The request method.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }
    /// The HTTP version of the connection.
    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }
    /// The `host` authority as the client sent it.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
    /// The hostname in comparable form; see [`unicode_hostname`].
    #[inline]
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
    /// The current path. Rewrites and mounts edit this in place.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
    /// Replaces the current path.
    #[inline]
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }
    /// The path as requested, untouched by rewrites.
    #[inline]
    #[must_use]
    pub fn original_path(&self) -> &str {
        &self.original_path
    }
    /// The query string, without `?`. Empty when absent.
    #[inline]
    #[must_use]
    pub fn querystring(&self) -> &str {
        &self.querystring
    }
    /// The request headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    /// A request header by name, as a string. [`None`] when absent or not
    /// UTF-8.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
    /// The client address.
    #[inline]
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
    /// Whether the connection was accepted over TLS.
    #[inline]
    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }
    /// Whether the request asks for a WebSocket upgrade.
    #[inline]
    #[must_use]
    pub fn ws(&self) -> bool {
        self.ws
    }
    /// Clears the upgrade flag; used when an upstream WebSocket failed and
    /// the request falls back to plain HTTP handling.
    #[inline]
    pub fn clear_ws(&mut self) {
        self.ws = false;
    }

    /// Reads the request body into memory.
    ///
    /// Repeated calls return an empty buffer; the body is consumed once.
    ///
    /// # Errors
    ///
    /// Any socket error while reading.
    pub async fn read_body(&mut self) -> Result<Bytes, Error> {
        if self.body_consumed {
            return Ok(Bytes::new());
        }
        self.body_consumed = true;
        let len = usize::try_from(self.body_len).unwrap_or(usize::MAX);
        let mut buffer = BytesMut::with_capacity(len.min(64 * 1024));
        buffer.extend_from_slice(&self.body_prefix);
        if let Some(io) = self.res.io_mut() {
            while buffer.len() < len {
                if io.read_buf(&mut buffer).await? == 0 {
                    break;
                }
            }
        }
        buffer.truncate(len);
        Ok(buffer.freeze())
    }

    // --- response side ---

    /// The response status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
    /// Sets the response status and marks the request handled.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        if !self.res.is_buffering() {
            return Err(Error::HeadersSent);
        }
        self.status = status;
        self.handled = true;
        Ok(())
    }
    /// Sets a response header, replacing earlier values.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn set(&mut self, name: impl header::IntoHeaderName + Copy, value: HeaderValue) -> Result<(), Error> {
        if !self.res.is_buffering() {
            return Err(Error::HeadersSent);
        }
        utility::replace_header(&mut self.res_headers, name, value);
        Ok(())
    }
    /// Sets many response headers at once; see [`Self::set`].
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn set_all(
        &mut self,
        headers: impl IntoIterator<Item = (HeaderName, HeaderValue)>,
    ) -> Result<(), Error> {
        for (name, value) in headers {
            self.set(&name, value)?;
        }
        Ok(())
    }
    /// Sets a response header only when it is not present yet.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn set_if_unset(
        &mut self,
        name: impl header::IntoHeaderName + Copy,
        value: HeaderValue,
    ) -> Result<(), Error> {
        if !self.res.is_buffering() {
            return Err(Error::HeadersSent);
        }
        self.res_headers.entry(name).or_insert(value);
        Ok(())
    }
    /// Appends a response header without replacing earlier values
    /// (`set-cookie` and friends).
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), Error> {
        if !self.res.is_buffering() {
            return Err(Error::HeadersSent);
        }
        self.res_headers.append(name, value);
        Ok(())
    }
    /// Removes a response header.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn remove(&mut self, name: impl header::IntoHeaderName) -> Result<(), Error> {
        if !self.res.is_buffering() {
            return Err(Error::HeadersSent);
        }
        utility::remove_all_headers(&mut self.res_headers, name);
        Ok(())
    }
    /// The response headers written so far.
    #[inline]
    #[must_use]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.res_headers
    }
    /// Sets the `content-type` of the response.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn set_content_type(&mut self, mime: &Mime) -> Result<(), Error> {
        // A rendered mime type is a legal header value.
        self.set(
            &header::CONTENT_TYPE,
            HeaderValue::from_str(mime.as_ref()).unwrap(),
        )
    }

    /// The response body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }
    /// Sets an in-memory response body and marks the request handled.
    pub fn set_body(&mut self, bytes: Bytes) {
        self.body = Body::Bytes(bytes);
        self.handled = true;
    }
    /// Sets a streamed response body of `len` bytes and marks the request
    /// handled.
    pub fn set_stream(&mut self, reader: impl AsyncRead + Send + Unpin + 'static, len: u64) {
        self.body = Body::Stream {
            reader: Box::new(reader),
            len,
        };
        self.handled = true;
    }
    /// Clears the response body.
    pub fn clear_body(&mut self) {
        self.body = Body::Empty;
    }

    /// Responds with a `302 Found` to `url`.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn redirect(&mut self, url: &str) -> Result<(), Error> {
        self.set(
            &header::LOCATION,
            HeaderValue::from_str(url).map_err(|_| Error::BadRequest("invalid redirect url"))?,
        )?;
        self.set_status(StatusCode::FOUND)
    }

    /// Creates an [`Error::Status`] to propagate up the chain.
    #[must_use]
    pub fn throw(&self, code: StatusCode, message: impl Into<String>) -> Error {
        Error::Status(code, message.into())
    }

    /// Whether any handler produced a response (status, body, or upgrade).
    #[inline]
    #[must_use]
    pub fn handled(&self) -> bool {
        self.handled
    }

    // --- scratch attributes ---

    /// The name of the handler serving this request, for logging.
    #[inline]
    #[must_use]
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }
    /// Sets the handler name, returning the previous one.
    pub fn set_handler(&mut self, handler: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.handler, handler)
    }
    /// The host pattern which matched this request.
    #[inline]
    #[must_use]
    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }
    /// Records the matched host pattern.
    pub fn set_site(&mut self, site: String) {
        self.site = Some(site);
    }
    /// The session reference attached by outer middleware, if any.
    #[inline]
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }
    /// Attaches a session reference.
    pub fn set_session(&mut self, session: String) {
        self.session = Some(session);
    }

    /// Bytes transferred for this request, best effort.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
    /// Adds to the transferred-byte counter.
    #[inline]
    pub fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
    }
    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The recorded error, if a handler stored one.
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
    /// Records an error without aborting the chain.
    pub fn record_error(&mut self, error: impl Display) {
        self.error = Some(error.to_string());
    }

    /// Whether request logging is enabled.
    #[inline]
    #[must_use]
    pub fn log_enabled(&self) -> bool {
        self.log_enabled
    }
    /// Disables request logging; used by routes configured with `nolog`.
    #[inline]
    pub fn disable_log(&mut self) {
        self.log_enabled = false;
    }
    /// Records a log line for this request and mirrors it to the `log`
    /// facade. No-op when logging is disabled.
    pub fn log(&mut self, name: &str, message: impl Display) {
        if !self.log_enabled {
            return;
        }
        let line = format!("{name}: {message}");
        debug!("{} {} {line}", self.method, self.path);
        self.loggers.push(line);
    }
    /// The log lines recorded for this request.
    #[inline]
    #[must_use]
    pub fn loggers(&self) -> &[String] {
        &self.loggers
    }

    // --- the upgrade path ---

    /// Completes the WebSocket handshake with the client and hands over
    /// the socket. See
    /// [`UpgradableResponse::upgrade`](crate::response::UpgradableResponse::upgrade).
    ///
    /// # Errors
    ///
    /// [`Error::UpgradeFailed`] when the request carries no
    /// `sec-websocket-key`; [`Error::HeadersSent`] when the response has
    /// already begun; socket errors from the handshake.
    pub async fn upgrade(&mut self) -> Result<WebSocketStream<Box<dyn Io>>, Error> {
        let key = self
            .headers
            .get("sec-websocket-key")
            .cloned()
            .ok_or(Error::UpgradeFailed)?;
        let prefix = std::mem::take(&mut self.body_prefix);
        self.body_consumed = true;
        self.handled = true;
        self.res.upgrade(&key, prefix).await
    }

    /// The state of the underlying response target.
    #[must_use]
    pub fn response_state(&self) -> State {
        self.res.state()
    }

    // --- completion (crate internal) ---

    /// Writes the built response to the wire and returns the socket for
    /// keep-alive. [`None`] when the connection cannot be reused (upgrade,
    /// or an oversized unread request body).
    pub(crate) async fn finish(mut self) -> Result<Option<Box<dyn Io>>, Error> {
        if self.res.state() == State::Upgraded {
            return Ok(None);
        }

        let head_only =
            self.method == Method::HEAD || matches!(self.status.as_u16(), 204 | 304);
        if !matches!(self.status.as_u16(), 204 | 304) {
            utility::replace_header(
                &mut self.res_headers,
                &header::CONTENT_LENGTH,
                HeaderValue::from(self.body.len()),
            );
        }
        if !self.res_headers.contains_key(header::DATE) {
            let now = httpdate::fmt_http_date(std::time::SystemTime::now());
            // httpdate output is ASCII.
            self.res_headers
                .insert(header::DATE, HeaderValue::from_str(&now).unwrap());
        }

        self.res.send_head(self.status, &self.res_headers).await?;
        if !head_only {
            match std::mem::replace(&mut self.body, Body::Empty) {
                Body::Empty => {}
                Body::Bytes(bytes) => {
                    self.res.write(&bytes).await?;
                    self.bytes += bytes.len() as u64;
                }
                Body::Stream { reader, .. } => {
                    self.bytes += self.res.stream(reader).await?;
                }
            }
        }
        self.res.flush().await?;

        // Drain a small unread request body so the connection stays
        // usable; give up on keep-alive for large ones.
        if !self.body_consumed && self.body_len > 0 {
            let remaining = self.body_len.saturating_sub(self.body_prefix.len() as u64);
            if remaining > DISCARD_LIMIT {
                return Ok(None);
            }
            if let Some(io) = self.res.io_mut() {
                let mut discard = tokio::io::sink();
                let mut limited = io.take(remaining);
                tokio::io::copy(&mut limited, &mut discard).await?;
            }
        }
        Ok(self.res.take_io())
    }
}

impl Debug for Ctx {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("handler", &self.handler)
            .field("ws", &self.ws)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Builds a [`Ctx`] over an in-memory duplex socket for unit tests.
    pub(crate) fn ctx(method: Method, path: &str) -> (Ctx, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let request = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost")
            .body(())
            .unwrap();
        let ctx = Ctx::new(
            &request,
            Bytes::new(),
            IpAddr::from([127, 0, 0, 1]),
            false,
            UpgradableResponse::new(Box::new(server)),
        );
        (ctx, client)
    }
}
