//! Handler resolution and application mounting.
//!
//! Routes name their handlers; a [`HandlerRegistry`] maps each name to a
//! factory producing the middleware. Applications — handlers which install
//! whole sub-routers — are registered the same way and receive an
//! [`ExecutionContext`]: a narrowed view of the path router bound to the
//! route's base path, through which they register their own sub-routes.
//! Middlewares an app installs are wrapped so the handler name is recorded
//! and the current path is rebased (base stripped on entry, restored on
//! fall-through).

use crate::prelude::*;
use serde_yaml::Value;

/// A factory producing the middleware for a named handler.
///
/// Returns [`None`] when the handler registered everything it needs through
/// the [`ExecutionContext`] (the `app` case) and there is nothing to push
/// onto the stack.
pub type HandlerFactory = Arc<
    dyn Fn(&mut ExecutionContext<'_>, &Value) -> Result<Option<Arc<dyn Middleware>>, Error>
        + Send
        + Sync,
>;

/// An application's entry function.
pub type AppInit =
    Arc<dyn Fn(&mut ExecutionContext<'_>, &Value) -> Result<(), Error> + Send + Sync>;

/// The named handlers routes can resolve.
#[derive(Clone)]
pub struct HandlerRegistry {
    map: HashMap<String, HandlerFactory>,
}
impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
    /// The registry with the built-in handlers: `static`, `proxy`, `app`,
    /// and `echo`.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.insert("static", Arc::new(files::factory));
        registry.insert("proxy", Arc::new(proxy::factory));
        registry.insert("app", Arc::new(app_factory));
        registry.insert("echo", Arc::new(echo_factory));
        registry
    }
    /// Registers `factory` under `name`, replacing an earlier entry.
    pub fn insert(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.map.insert(name.into(), factory);
    }
    /// Looks a factory up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HandlerFactory> {
        self.map.get(name)
    }
}
impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        f.debug_struct("HandlerRegistry").field("names", &names).finish()
    }
}

/// The applications the `app` handler can mount, by name.
#[derive(Clone, Default)]
pub struct AppRegistry {
    map: HashMap<String, AppInit>,
}
impl AppRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers `init` under `name`.
    pub fn insert(&mut self, name: impl Into<String>, init: AppInit) {
        self.map.insert(name.into(), init);
    }
    /// Looks an app up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AppInit> {
        self.map.get(name)
    }
}
impl Debug for AppRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        f.debug_struct("AppRegistry").field("names", &names).finish()
    }
}

/// Everything handler factories need besides the router: the registries
/// and the project root for file-system resolution.
#[derive(Debug, Clone)]
pub struct Env {
    /// The handler registry.
    pub handlers: Arc<HandlerRegistry>,
    /// The app registry.
    pub apps: Arc<AppRegistry>,
    /// The project root; `resolve_fs_path` is relative to it.
    pub root: PathBuf,
}
impl Env {
    /// An environment with the built-in handlers, no apps, and `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            apps: Arc::new(AppRegistry::new()),
            root: root.into(),
        }
    }
}

/// The base path of a route pattern: the literal prefix before any
/// parameter or wildcard, without a trailing slash.
#[must_use]
pub fn base_of(path: &str) -> String {
    let path = path.strip_prefix('^').unwrap_or(path);
    let cut = path.find([':', '*']).unwrap_or(path.len());
    let mut base = &path[..cut];
    if cut < path.len() {
        base = &base[..base.rfind('/').unwrap_or(0)];
    }
    base.trim_end_matches('/').to_owned()
}

/// The build-time registration surface handed to handler factories and
/// apps, bound to one route of one [`PathRouter`].
pub struct ExecutionContext<'r> {
    router: &'r mut PathRouter,
    env: &'r Env,
    base: String,
    name: String,
}
impl<'r> ExecutionContext<'r> {
    pub(crate) fn new(router: &'r mut PathRouter, path: &str, name: &str, env: &'r Env) -> Self {
        Self {
            router,
            env,
            base: base_of(path),
            name: name.to_owned(),
        }
    }

    /// The name recorded into `ctx.handler` for everything registered
    /// here.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Renames the scope; the `app` factory sets the app's own name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
    /// The base path of the mount.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }
    /// The environment: registries and project root.
    #[must_use]
    pub fn env(&self) -> &Env {
        self.env
    }

    /// Converts a base-relative route path to an absolute one, keeping the
    /// `^` wildcard-prefix convention.
    #[must_use]
    pub fn resolve_req_path(&self, rel: &str) -> String {
        let (caret, rel) = match rel.strip_prefix('^') {
            Some(rest) => ("^", rest),
            None => ("", rel),
        };
        let rel = rel.strip_prefix('/').unwrap_or(rel);
        format!(
            "{caret}{}",
            parse::normalize_path(&format!("{}/{rel}", self.base))
        )
    }
    /// Converts a base-relative path to a file-system path under the
    /// project root.
    #[must_use]
    pub fn resolve_fs_path(&self, rel: &str) -> PathBuf {
        self.env.root.join(rel.trim_start_matches('/'))
    }

    /// Wraps `mw` for this mount: `ctx.handler` is set to the scope name
    /// and `ctx.path` is rebased while `mw` runs.
    #[must_use]
    pub fn mount(&self, mw: Arc<dyn Middleware>) -> Arc<dyn Middleware> {
        Arc::new(Mounted {
            base: self.base.clone(),
            name: self.name.clone(),
            chain: Chain::new(vec![mw]),
        })
    }

    /// Registers `mw` for any method at the base-relative `rel`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn any(&mut self, rel: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        let path = self.resolve_req_path(rel);
        let mounted = self.mount(mw);
        self.router.any(&path, mounted)
    }
    /// Registers `mw` for `GET`/`HEAD` at the base-relative `rel`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn get(&mut self, rel: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        let path = self.resolve_req_path(rel);
        let mounted = self.mount(mw);
        self.router.get(&path, mounted)
    }
    /// Registers `mw` for `POST` at the base-relative `rel`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn post(&mut self, rel: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        let path = self.resolve_req_path(rel);
        let mounted = self.mount(mw);
        self.router.post(&path, mounted)
    }
    /// Installs a rewrite at the base-relative `rel`; see
    /// [`PathRouter::add_rewrite`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn add_rewrite(&mut self, rel: &str, src: &str, dest: &str) -> Result<(), Error> {
        let path = self.resolve_req_path(rel);
        self.router.add_rewrite(&path, src, dest)
    }
    /// Installs a redirect at the base-relative `rel`; see
    /// [`PathRouter::add_redirect`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern, destination, or code.
    pub fn add_redirect(&mut self, rel: &str, dest: &str, code: Option<u16>) -> Result<(), Error> {
        let path = self.resolve_req_path(rel);
        self.router.add_redirect(&path, dest, code)
    }

    /// Responds on `ctx` with `status` and an in-memory `body`.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] once the head is committed.
    pub fn send(ctx: &mut Ctx, status: StatusCode, body: Bytes) -> Result<(), Error> {
        ctx.set_status(status)?;
        ctx.set_body(body);
        Ok(())
    }
}
impl Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("base", &self.base)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Records the handler name while `inner` runs. The next handler
/// overwrites it on fall-through.
pub struct Named {
    name: String,
    inner: Arc<dyn Middleware>,
}
impl Named {
    /// Wraps `inner` under `name`.
    pub fn new(name: impl Into<String>, inner: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}
impl Middleware for Named {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.set_handler(Some(self.name.clone()));
            self.inner.handle(ctx, next).await
        })
    }
}
impl Debug for Named {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Named({})", self.name)
    }
}

/// The mount helper: strips the base prefix from the current path on
/// entry and restores it on fall-through, so the wrapped middlewares see
/// paths relative to their mount.
struct Mounted {
    base: String,
    name: String,
    chain: Chain,
}
impl Middleware for Mounted {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            if !self.base.is_empty() && !ctx.path().starts_with(self.base.as_str()) {
                return next.invoke(ctx).await;
            }
            let saved_path = ctx.path().to_owned();
            let saved_handler = ctx.set_handler(Some(self.name.clone()));

            let mut rebased = saved_path[self.base.len()..].to_owned();
            if !rebased.starts_with('/') {
                rebased.insert(0, '/');
            }
            ctx.set_path(rebased);

            let restore = RestoreTail {
                path: saved_path.clone(),
                handler: saved_handler.clone(),
                next: &next,
            };
            let result = self.chain.execute(ctx, &restore).await;

            ctx.set_path(saved_path);
            result
        })
    }
}

/// Restores the pre-mount path and handler before the outer continuation
/// runs.
struct RestoreTail<'a> {
    path: String,
    handler: Option<String>,
    next: &'a Next<'a>,
}
impl Tail for RestoreTail<'_> {
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.set_path(self.path.clone());
            ctx.set_handler(self.handler.clone());
            self.next.invoke(ctx).await
        })
    }
}

/// The `app` handler: resolves a named application and lets it register
/// its sub-routes under the route's base.
fn app_factory(
    scope: &mut ExecutionContext<'_>,
    args: &Value,
) -> Result<Option<Arc<dyn Middleware>>, Error> {
    let name = match args {
        Value::String(name) => name.clone(),
        Value::Mapping(map) => map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config("app needs a name".into()))?
            .to_owned(),
        _ => return Err(Error::Config("app needs a name".into())),
    };
    let init = scope
        .env()
        .apps
        .get(&name)
        .cloned()
        .ok_or_else(|| Error::Config(format!("unknown app: {name}")))?;
    scope.set_name(name);
    init(scope, args)?;
    Ok(None)
}

/// A diagnostic handler echoing the request line and a few attributes as
/// `text/plain`.
fn echo_factory(
    _scope: &mut ExecutionContext<'_>,
    _args: &Value,
) -> Result<Option<Arc<dyn Middleware>>, Error> {
    Ok(Some(Arc::new(echo)))
}
fn echo<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        let mut body = format!("{} {}", ctx.method(), ctx.path());
        if !ctx.querystring().is_empty() {
            body.push('?');
            body.push_str(ctx.querystring());
        }
        body.push('\n');
        body.push_str(&format!("host: {}\n", ctx.host()));
        body.push_str(&format!("ip: {}\n", ctx.ip()));
        ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))?;
        ctx.set_status(StatusCode::OK)?;
        ctx.set_body(Bytes::from(body));
        Ok(())
    })
}
