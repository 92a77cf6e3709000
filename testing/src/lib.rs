//! Helpers for integration-testing verge.
//!
//! Spin up a server on an ephemeral port and send requests to it in a few
//! lines:
//!
//! ```no_run
//! # async fn example() {
//! use verge_testing::prelude::*;
//!
//! let server = ServerBuilder::default()
//!     .with_yaml("router:\n  routes:\n    \"*\":\n      ^/: echo\n")
//!     .run()
//!     .await;
//! let response = server.get("/hello").send().await.unwrap();
//! assert_eq!(response.status(), reqwest::StatusCode::OK);
//! # }
//! ```

use verge::prelude::*;

macro_rules! impl_methods {
    ($($method: ident $name: ident),*) => {
        $(
            /// Make a request to `path` with the selected method.
            pub fn $method(&self, path: impl AsRef<str>) -> reqwest::RequestBuilder {
                let client = reqwest::Client::new();
                client.request(reqwest::Method::$name, self.url(path))
            }
        )*
    };
}

/// A running server to connect to, returned by [`ServerBuilder::run`].
///
/// Shuts the server down on drop.
#[derive(Debug)]
pub struct Server {
    handle: Handle,
}
impl Server {
    impl_methods!(get GET, post POST, put PUT, delete DELETE, head HEAD, options OPTIONS, patch PATCH);

    /// Builds a URL to the server with `path`.
    pub fn url(&self, path: impl AsRef<str>) -> reqwest::Url {
        let added_root = if path.as_ref().starts_with('/') { "" } else { "/" };
        let string = format!(
            "http://localhost:{}{}{}",
            self.port(),
            added_root,
            path.as_ref()
        );
        reqwest::Url::parse(&string).unwrap()
    }
    /// Builds a `ws://` URL to the server with `path`.
    #[must_use]
    pub fn ws_url(&self, path: impl AsRef<str>) -> String {
        let added_root = if path.as_ref().starts_with('/') { "" } else { "/" };
        format!(
            "ws://localhost:{}{}{}",
            self.port(),
            added_root,
            path.as_ref()
        )
    }
    /// Sends a raw request over a fresh TCP connection and returns the
    /// whole response as text. Useful when the client library would
    /// normalise the interesting part away (host headers, `..` segments).
    ///
    /// # Panics
    ///
    /// Panics on connection errors.
    pub async fn raw(&self, request: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(self.addr())
            .await
            .expect("failed to connect to the test server");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Gets the port of the TCP listener.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.handle.addr().port()
    }
    /// Gets the bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }
}
impl Drop for Server {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// A builder starting a test [`Server`].
#[must_use = "run the server"]
pub struct ServerBuilder {
    router: Option<HostRouter>,
    yaml: Option<String>,
    env: mount::Env,
}
impl ServerBuilder {
    /// Creates a builder; the route table comes from
    /// [`Self::with_router`] or [`Self::with_yaml`].
    pub fn new() -> Self {
        let _ = env_logger::Builder::new()
            .is_test(true)
            .parse_default_env()
            .try_init();
        Self {
            router: None,
            yaml: None,
            env: mount::Env::new("."),
        }
    }
    /// Uses a programmatically built host router.
    pub fn with_router(mut self, router: HostRouter) -> Self {
        self.router = Some(router);
        self
    }
    /// Installs `router` under the wildcard host.
    pub fn with_path_router(mut self, router: PathRouter) -> Self {
        let mut hosts = HostRouter::new();
        hosts.add(HostPattern::Any, router);
        self.router = Some(hosts);
        self
    }
    /// Binds a YAML route table at [`Self::run`].
    pub fn with_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.yaml = Some(yaml.into());
        self
    }
    /// Sets the environment (registries and project root) used for YAML
    /// binding.
    pub fn with_env(mut self, env: mount::Env) -> Self {
        self.env = env;
        self
    }

    /// Starts a server on an ephemeral port.
    ///
    /// # Panics
    ///
    /// Panics on configuration or bind errors; this is a test harness.
    pub async fn run(self) -> Server {
        let router = match (self.router, self.yaml) {
            (Some(router), None) => router,
            (None, Some(yaml)) => {
                let document = config::load_str(&yaml).expect("invalid test config");
                config::build(&document, &self.env).expect("test config failed to bind")
            }
            (None, None) => HostRouter::new(),
            (Some(_), Some(_)) => panic!("use either with_router or with_yaml, not both"),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let handle = RunConfig::new(router)
            .bind(addr)
            .execute()
            .await
            .expect("failed to bind test server");
        Server { handle }
    }
}
impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The testing prelude. Also imports `verge::prelude::*`.
pub mod prelude {
    pub use super::{Server, ServerBuilder};
    pub use reqwest;
    #[doc(hidden)]
    pub use verge::prelude::*;
}
