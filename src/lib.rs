//! Verge is a configurable HTTP edge server: it terminates client
//! connections and routes each request by virtual host and URL path
//! through a composable chain of handlers (static files, reverse proxy,
//! redirect, rewrite, mounted applications), then writes the assembled
//! response. The same chain serves WebSocket sessions: a handler may
//! claim the client socket mid-request through
//! [`Ctx::upgrade`](ctx::Ctx::upgrade).
//!
//! TLS termination, HTTP/2, rate limiting, and session storage are outer
//! collaborators; the context exposes the hook points they need
//! (`secure`, `session`, the log switch).

// Module declaration
pub mod chain;
pub mod config;
pub mod ctx;
pub mod error;
pub mod files;
pub mod host;
pub mod mount;
pub mod parse;
pub mod prelude;
pub mod proxy;
pub mod response;
pub mod router;
pub mod utility;
pub mod websocket;
pub mod wire;

use prelude::*;
use tokio::task::JoinHandle;

// When users import crate::* and not crate::prelude::*
pub use chain::{Chain, Middleware, Next, RetFut, Tail};
pub use ctx::{Body, Ctx};
pub use error::Error;
pub use host::{HostPattern, HostRouter};
pub use response::{Io, UpgradableResponse};
pub use router::PathRouter;

/// The server identifier.
pub const SERVER_NAME: &str = "Verge";

const HEAD_MAX: usize = 16 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// The tail under all routing: a request escaping the routing layer gets
/// a hard-coded 404.
struct NotFound;
impl Tail for NotFound {
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            if !ctx.handled() {
                ctx.set_status(StatusCode::NOT_FOUND)?;
                ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/html"))?;
                ctx.set_body(utility::hardcoded_error_body(StatusCode::NOT_FOUND, None));
            }
            Ok(())
        })
    }
}

/// What to run: a router and the addresses to listen on.
#[derive(Debug)]
#[must_use]
pub struct RunConfig {
    router: Arc<HostRouter>,
    addrs: Vec<SocketAddr>,
}
impl RunConfig {
    /// A run configuration for `router` with no addresses bound yet.
    pub fn new(router: HostRouter) -> Self {
        Self {
            router: Arc::new(router),
            addrs: Vec::new(),
        }
    }
    /// Adds a listening address. Port `0` picks an ephemeral port,
    /// reported by [`Handle::addr`].
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.addrs.push(addr);
        self
    }
    /// Binds all addresses and starts accepting.
    ///
    /// # Errors
    ///
    /// Any error binding the listeners.
    pub async fn execute(self) -> io::Result<Handle> {
        let mut addrs = Vec::with_capacity(self.addrs.len());
        let mut tasks = Vec::with_capacity(self.addrs.len());
        for addr in self.addrs {
            let listener = TcpListener::bind(addr).await?;
            addrs.push(listener.local_addr()?);
            let router = Arc::clone(&self.router);
            tasks.push(tokio::spawn(accept(listener, router)));
        }
        info!("{SERVER_NAME} listening on {addrs:?}");
        Ok(Handle { addrs, tasks })
    }
}

/// A running server.
#[derive(Debug)]
pub struct Handle {
    addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}
impl Handle {
    /// The first bound address.
    ///
    /// # Panics
    ///
    /// Panics when the configuration bound no address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addrs[0]
    }
    /// All bound addresses.
    #[must_use]
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }
    /// Stops accepting new connections. Established connections run on.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
    /// Waits for the accept loops; they only end through
    /// [`Self::shutdown`].
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn accept(listener: TcpListener, router: Arc<HostRouter>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, addr, router).await {
                        debug!("connection from {addr} ended: {err}");
                    }
                });
            }
            Err(err) => {
                error!("accept failed: {err}");
            }
        }
    }
}

/// Serves one connection: requests are read, routed, and answered until
/// the peer closes, keep-alive ends, or a handler takes the socket over.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<HostRouter>,
) -> Result<(), Error> {
    let mut io: Box<dyn Io> = Box::new(stream);
    loop {
        let (request, surplus) = match wire::read_request(&mut io, HEAD_MAX, HEAD_TIMEOUT).await {
            Ok(head) => head,
            // Closed between requests, or went idle.
            Err(parse::Error::UnexpectedEnd) => return Ok(()),
            Err(err) => {
                let status = StatusCode::BAD_REQUEST;
                let body = utility::hardcoded_error_body(status, Some(err.as_str()));
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
                headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
                let _ = wire::write_head(status, &headers, &mut io).await;
                let _ = io.write_all(&body).await;
                let _ = io.flush().await;
                return Err(err.into());
            }
        };

        let keep_alive = request.version() == Version::HTTP_11
            && !utility::header_contains(request.headers(), header::CONNECTION, "close");

        let res = UpgradableResponse::new(io);
        let mut ctx = Ctx::new(&request, surplus, addr.ip(), false, res);

        let chain = Chain::new(vec![Arc::clone(&router) as Arc<dyn Middleware>]);
        if let Err(err) = chain.execute(&mut ctx, &NotFound).await {
            warn!("handler error for {} {}: {err}", ctx.method(), ctx.original_path());
            if ctx.response_state() == response::State::Buffering {
                let status = err.status();
                let _ = ctx.set_status(status);
                let _ = ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
                ctx.set_body(utility::hardcoded_error_body(status, Some(err.as_str())));
            } else {
                // The head is on the wire; nothing sane can follow.
                return Err(err);
            }
        }

        if !keep_alive {
            let _ = ctx.set(&header::CONNECTION, HeaderValue::from_static("close"));
        }
        debug!(
            "{} {} -> {} ({:?}, {}B, {:?})",
            ctx.method(),
            ctx.original_path(),
            ctx.status(),
            ctx.handler(),
            ctx.bytes(),
            ctx.elapsed(),
        );
        match ctx.finish().await? {
            Some(back) if keep_alive => io = back,
            _ => return Ok(()),
        }
    }
}
