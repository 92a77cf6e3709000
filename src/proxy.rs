//! The reverse proxy.
//!
//! HTTP mode forwards the request upstream over a fresh HTTP/1.1
//! connection, reads the whole response into memory, copies the filtered
//! head onto the context, and delegates to `next` so outer middleware can
//! decorate the response. WebSocket mode bridges the client and an
//! upstream WebSocket frame-by-frame through the same route.
//!
//! Upstream connections are plain TCP; `https`/`wss` upstreams are a
//! configuration error, the same boundary as TLS acceptance.

use crate::mount::ExecutionContext;
use crate::prelude::*;
use crate::response::close_code;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

/// The default upstream timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
/// The largest upstream head accepted.
const MAX_HEAD: usize = 16 * 1024;
/// Request headers never forwarded upstream.
const DEFAULT_REQ_FILTER: &[&str] = &["host"];
/// Response headers never copied back.
const DEFAULT_RES_FILTER: &[&str] = &["connection", "transfer-encoding"];

/// Options of the `proxy` handler, as they appear in the route table.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    /// The upstream URL. Required.
    pub upstream: Option<String>,
    /// Bridge WebSocket upgrades on this route.
    pub websocket: bool,
    /// Upstream timeout in milliseconds; 3000 when absent.
    pub timeout: Option<u64>,
    /// Disable request logging on this route.
    pub nolog: bool,
    /// Request headers dropped before forwarding; replaces the default
    /// (`host`).
    pub req_headers_filter: Option<Vec<String>>,
    /// Response headers dropped before copying back; replaces the default
    /// (`connection`, `transfer-encoding`).
    pub res_headers_filter: Option<Vec<String>>,
}

/// The `proxy` handler factory.
///
/// Accepts a bare string (the upstream URL) or a [`ProxyConfig`] mapping.
///
/// # Errors
///
/// [`Error::Config`] for a missing or non-`http` upstream.
pub fn factory(
    _scope: &mut ExecutionContext<'_>,
    args: &serde_yaml::Value,
) -> Result<Option<Arc<dyn Middleware>>, Error> {
    let config = match args {
        serde_yaml::Value::String(upstream) => ProxyConfig {
            upstream: Some(upstream.clone()),
            ..ProxyConfig::default()
        },
        other => serde_yaml::from_value(other.clone())
            .map_err(|err| Error::Config(format!("proxy: {err}")))?,
    };
    Ok(Some(Arc::new(Proxy::from_config(config)?)))
}

/// Forwards requests to one upstream; see the module documentation.
pub struct Proxy {
    /// `host[:port]` of the upstream.
    authority: String,
    websocket: bool,
    timeout: Duration,
    nolog: bool,
    req_filter: Vec<String>,
    res_filter: Vec<String>,
}
impl Proxy {
    /// A proxy forwarding to `upstream` with default options.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unparsable or non-`http` URL.
    pub fn new(upstream: &str) -> Result<Self, Error> {
        Self::from_config(ProxyConfig {
            upstream: Some(upstream.to_owned()),
            ..ProxyConfig::default()
        })
    }
    /// A proxy from parsed options.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a missing or non-`http` upstream.
    pub fn from_config(config: ProxyConfig) -> Result<Self, Error> {
        let upstream = config
            .upstream
            .as_deref()
            .ok_or_else(|| Error::Config("proxy needs an upstream".into()))?;
        let uri = Uri::try_from(upstream)
            .map_err(|_| Error::Config(format!("invalid upstream url: {upstream}")))?;
        match uri.scheme_str() {
            Some("http" | "ws") | None => {}
            Some(other) => {
                return Err(Error::Config(format!(
                    "upstream scheme {other} is not supported; terminate TLS outside"
                )))
            }
        }
        let authority = uri
            .authority()
            .ok_or_else(|| Error::Config(format!("upstream url needs a host: {upstream}")))?
            .to_string();
        let lower = |filter: Vec<String>| -> Vec<String> {
            filter.into_iter().map(|name| name.to_ascii_lowercase()).collect()
        };
        Ok(Self {
            authority,
            websocket: config.websocket,
            timeout: config.timeout.map_or(DEFAULT_TIMEOUT, Duration::from_millis),
            nolog: config.nolog,
            req_filter: config.req_headers_filter.map_or_else(
                || DEFAULT_REQ_FILTER.iter().map(|s| (*s).to_owned()).collect(),
                lower,
            ),
            res_filter: config.res_headers_filter.map_or_else(
                || DEFAULT_RES_FILTER.iter().map(|s| (*s).to_owned()).collect(),
                lower,
            ),
        })
    }

    fn connect_addr(&self) -> String {
        if self.authority.contains(':') {
            self.authority.clone()
        } else {
            format!("{}:80", self.authority)
        }
    }

    fn upstream_path(ctx: &Ctx) -> String {
        if ctx.querystring().is_empty() {
            ctx.path().to_owned()
        } else {
            format!("{}?{}", ctx.path(), ctx.querystring())
        }
    }

    /// Marks the request failed upstream and lets the chain continue.
    async fn fail(
        &self,
        ctx: &mut Ctx,
        next: Next<'_>,
        what: &'static str,
        detail: impl Display,
    ) -> Result<(), Error> {
        warn!("proxy to {} failed: {what}: {detail}", self.authority);
        ctx.record_error(format_args!("{what}: {detail}"));
        ctx.log("Proxy-Failed", what);
        ctx.set_status(StatusCode::SERVICE_UNAVAILABLE)?;
        ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/html"))?;
        ctx.set_body(utility::hardcoded_error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            Some(what),
        ));
        next.invoke(ctx).await
    }

    /// Builds the upstream request head from the context.
    fn upstream_request(&self, ctx: &Ctx, body_len: usize) -> Result<http::Request<()>, Error> {
        let mut builder = http::Request::builder()
            .method(ctx.method().clone())
            .version(Version::HTTP_11)
            .uri(
                Uri::try_from(Self::upstream_path(ctx))
                    .map_err(|_| Error::BadRequest("unforwardable path"))?,
            );
        let headers = builder.headers_mut().unwrap();
        for (name, value) in ctx.headers() {
            let name_str = name.as_str();
            if name_str.starts_with(':') || self.req_filter.iter().any(|f| f == name_str) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        // The upstream sees itself as the host.
        utility::replace_header(
            headers,
            &header::HOST,
            HeaderValue::from_str(&self.authority)
                .map_err(|_| Error::Config("unrepresentable upstream authority".into()))?,
        );
        let forwarded = match ctx.get("x-forwarded-for") {
            Some(prior) => format!("{prior}, {}", ctx.ip()),
            None => ctx.ip().to_string(),
        };
        // An IP list is a legal header value.
        utility::replace_header(
            headers,
            "x-forwarded-for",
            HeaderValue::from_str(&forwarded).unwrap(),
        );
        // One request per connection; the body was read whole.
        utility::replace_header(headers, &header::CONNECTION, HeaderValue::from_static("close"));
        utility::replace_header(
            headers,
            &header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        utility::replace_header(
            headers,
            &header::CONTENT_LENGTH,
            HeaderValue::from(body_len),
        );
        builder.body(()).map_err(|_| Error::BadRequest("unforwardable request"))
    }

    async fn forward_http(&self, ctx: &mut Ctx, next: Next<'_>) -> Result<(), Error> {
        let body = ctx.read_body().await?;
        let request = self.upstream_request(ctx, body.len())?;

        let mut upstream =
            match tokio::time::timeout(self.timeout, TcpStream::connect(self.connect_addr())).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return self.fail(ctx, next, "connect", err).await,
                Err(_) => return self.fail(ctx, next, "connect timeout", self.timeout.as_millis()).await,
            };
        if let Err(err) = wire::write_request(&request, &body, &mut upstream).await {
            return self.fail(ctx, next, "write", err).await;
        }

        let (response, surplus) =
            match wire::read_response(&mut upstream, MAX_HEAD, self.timeout).await {
                Ok(head) => head,
                Err(err) => return self.fail(ctx, next, "read", err.as_str()).await,
            };

        let body = match self
            .read_upstream_body(&response, surplus, &mut upstream, ctx.method())
            .await
        {
            Ok(body) => body,
            Err(err) => {
                // A timeout destroys the upstream request; dropping the
                // stream closes it.
                drop(upstream);
                return self.fail(ctx, next, "body", err).await;
            }
        };

        ctx.set_status(response.status())?;
        for (name, value) in response.headers() {
            let name_str = name.as_str();
            if name_str.starts_with(':') || self.res_filter.iter().any(|f| f == name_str) {
                continue;
            }
            ctx.append(name.clone(), value.clone())?;
        }
        ctx.set_body(body);
        ctx.log("Proxy", format_args!("{} {}", self.authority, ctx.bytes()));
        next.invoke(ctx).await
    }

    /// Reads the upstream body whole: by `content-length`, chunked, or to
    /// EOF (the upstream was asked to close).
    async fn read_upstream_body(
        &self,
        response: &http::Response<()>,
        surplus: Bytes,
        upstream: &mut TcpStream,
        method: &Method,
    ) -> Result<Bytes, io::Error> {
        let status = response.status();
        if *method == Method::HEAD
            || status.is_informational()
            || matches!(status.as_u16(), 204 | 304)
        {
            return Ok(Bytes::new());
        }

        let chunked = utility::header_eq(response.headers(), header::TRANSFER_ENCODING, "chunked");
        let mut buffer = BytesMut::with_capacity(surplus.len().max(512));
        let read = async {
            if chunked {
                let reader = (&surplus[..]).chain(&mut *upstream);
                let mut decoder = async_chunked_transfer::Decoder::new(reader);
                wire::read_to_end_or_max(&mut buffer, &mut decoder, usize::MAX).await
            } else {
                buffer.extend_from_slice(&surplus);
                let len = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                if buffer.len() < len {
                    wire::read_to_end_or_max(&mut buffer, upstream, len).await?;
                }
                buffer.truncate(len.min(buffer.len()));
                Ok(())
            }
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream body timed out"))??;
        Ok(buffer.freeze())
    }

    async fn bridge_websocket(&self, ctx: &mut Ctx, next: Next<'_>) -> Result<(), Error> {
        let url = format!("ws://{}{}", self.authority, Self::upstream_path(ctx));
        let upstream =
            match tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url.as_str())).await
            {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(err)) => return self.websocket_failed(ctx, next, err).await,
                Err(_) => return self.websocket_failed(ctx, next, "open timed out").await,
            };

        let client = match ctx.upgrade().await {
            Ok(client) => client,
            Err(Error::UpgradeFailed) => {
                return self.websocket_failed(ctx, next, "client handshake failed").await;
            }
            Err(err) => return Err(err),
        };
        ctx.log("ProxyWS", &self.authority);

        let (mut client_tx, mut client_rx) = client.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();
        let mut transferred: u64 = 0;
        let mut session_error: Option<String> = None;

        // Forward frames both ways until either side closes or errs.
        loop {
            tokio::select! {
                message = client_rx.next() => match message {
                    Some(Ok(message)) => {
                        transferred += message.len() as u64;
                        let closing = message.is_close();
                        if upstream_tx.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        session_error = Some(format!("client: {err}"));
                        break;
                    }
                    None => break,
                },
                message = upstream_rx.next() => match message {
                    Some(Ok(message)) => {
                        transferred += message.len() as u64;
                        let closing = message.is_close();
                        if client_tx.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        session_error = Some(format!("upstream: {err}"));
                        break;
                    }
                    None => break,
                },
            }
        }

        let code = if session_error.is_some() {
            close_code(StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            close_code(ctx.status())
        };
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        let _ = client_tx.send(Message::Close(Some(frame.clone()))).await;
        let _ = upstream_tx.send(Message::Close(Some(frame))).await;

        ctx.add_bytes(transferred);
        if let Some(err) = session_error {
            ctx.record_error(&err);
            ctx.log("ProxyWS-Error", err);
        }
        Ok(())
    }

    /// The upstream failed before `open`: clear the upgrade flag and let a
    /// later handler respond normally.
    async fn websocket_failed(
        &self,
        ctx: &mut Ctx,
        next: Next<'_>,
        detail: impl Display,
    ) -> Result<(), Error> {
        warn!("websocket proxy to {} failed: {detail}", self.authority);
        ctx.clear_ws();
        ctx.record_error(&detail);
        ctx.log("ProxyWS-Failed", detail);
        ctx.set_status(StatusCode::OK)?;
        ctx.clear_body();
        next.invoke(ctx).await
    }
}
impl Middleware for Proxy {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            if self.nolog {
                ctx.disable_log();
            }
            if ctx.ws() && self.websocket {
                self.bridge_websocket(ctx, next).await
            } else {
                self.forward_http(ctx, next).await
            }
        })
    }
}
impl Debug for Proxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("authority", &self.authority)
            .field("websocket", &self.websocket)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_shapes() {
        let proxy = Proxy::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(proxy.authority, "127.0.0.1:8080");
        assert_eq!(proxy.timeout, DEFAULT_TIMEOUT);
        assert_eq!(proxy.req_filter, ["host"]);
        assert_eq!(proxy.res_filter, ["connection", "transfer-encoding"]);

        assert!(matches!(
            Proxy::new("https://secure.example"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Proxy::from_config(ProxyConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn yaml_options() {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "upstream: http://127.0.0.1:9000\nwebsocket: true\ntimeout: 250\nreqHeadersFilter: [host, cookie]",
        )
        .unwrap();
        let config: ProxyConfig = serde_yaml::from_value(value).unwrap();
        let proxy = Proxy::from_config(config).unwrap();
        assert!(proxy.websocket);
        assert_eq!(proxy.timeout, Duration::from_millis(250));
        assert_eq!(proxy.req_filter, ["host", "cookie"]);
    }
}
