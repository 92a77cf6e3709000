//! Second-level routing: URL path to middleware stack.
//!
//! A [`PathRouter`] owns ordered `(pattern, stack)` entries. Patterns
//! follow the conventional path-to-regexp grammar: literal segments,
//! colon-prefixed parameters (`/user/:id`), a trailing wildcard
//! (`/files/*`), and the `^/prefix` convention from the route table, which
//! expands to a prefix match.
//!
//! Every entry matching a request participates, in declaration order, as
//! one composed chain; a middleware's `next` reaches the next matching
//! entry and finally the router's own continuation.

use crate::prelude::*;
use regex::Regex;

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    kind: Kind,
}
#[derive(Debug, Clone)]
enum Kind {
    Literal,
    Prefix(String),
    Params(Regex, Vec<String>),
}
impl PathPattern {
    /// Compiles `path`.
    ///
    /// `^/prefix` and `/prefix/*` match the prefix; `:name` segments
    /// capture parameters; anything else matches exactly.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the path produces an invalid expression.
    pub fn compile(path: &str) -> Result<Self, Error> {
        let raw = path.to_owned();
        if let Some(prefix) = path.strip_prefix('^') {
            if !prefix.starts_with('/') {
                return Err(Error::Config(format!("wildcard path must start with ^/: {path}")));
            }
            return Ok(Self {
                raw,
                kind: Kind::Prefix(prefix.to_owned()),
            });
        }
        if !path.starts_with('/') {
            return Err(Error::Config(format!("path must start with /: {path}")));
        }
        if let Some(prefix) = path.strip_suffix('*') {
            if !prefix.contains(':') {
                return Ok(Self {
                    raw,
                    kind: Kind::Prefix(prefix.to_owned()),
                });
            }
        }
        if path.contains(':') {
            let mut expression = String::with_capacity(path.len() + 16);
            let mut names = Vec::new();
            expression.push('^');
            for (position, segment) in path.split('/').enumerate() {
                if position > 0 {
                    expression.push('/');
                }
                if let Some(name) = segment.strip_prefix(':') {
                    names.push(name.to_owned());
                    expression.push_str("([^/]+)");
                } else if segment == "*" {
                    expression.push_str("(.*)");
                    names.push("*".to_owned());
                } else {
                    expression.push_str(&regex::escape(segment));
                }
            }
            expression.push('$');
            let regex = Regex::new(&expression)
                .map_err(|err| Error::Config(format!("bad path pattern {path}: {err}")))?;
            return Ok(Self {
                raw,
                kind: Kind::Params(regex, names),
            });
        }
        Ok(Self {
            raw,
            kind: Kind::Literal,
        })
    }

    /// The pattern as written in configuration.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Matches `path`, returning captured parameters.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match &self.kind {
            Kind::Literal => (self.raw == path).then(HashMap::new),
            Kind::Prefix(prefix) => path.starts_with(prefix.as_str()).then(HashMap::new),
            Kind::Params(regex, names) => {
                let captures = regex.captures(path)?;
                Some(
                    names
                        .iter()
                        .zip(captures.iter().skip(1))
                        .filter_map(|(name, capture)| {
                            Some((name.clone(), capture?.as_str().to_owned()))
                        })
                        .collect(),
                )
            }
        }
    }
}

/// Which methods a route answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFilter {
    /// Every method.
    Any,
    /// `GET` and `HEAD`.
    Get,
    /// `POST`.
    Post,
}
impl MethodFilter {
    fn accepts(self, method: &Method) -> bool {
        match self {
            Self::Any => true,
            Self::Get => *method == Method::GET || *method == Method::HEAD,
            Self::Post => *method == Method::POST,
        }
    }
}

struct Route {
    pattern: PathPattern,
    filter: MethodFilter,
    stack: Vec<Arc<dyn Middleware>>,
}

/// Applies captured path parameters before running a route's stack.
struct WithParams {
    params: HashMap<String, String>,
    chain: Chain,
}
impl Middleware for WithParams {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.params = self.params.clone();
            self.chain.handle(ctx, next).await
        })
    }
}

/// An ordered path router; see the module documentation.
#[derive(Default)]
pub struct PathRouter {
    routes: Vec<Route>,
    /// Positions of the per-path module stacks, so repeated
    /// [`Self::push_stack`] calls extend one installed entry.
    stacks: HashMap<String, usize>,
}
impl PathRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, path: &str, filter: MethodFilter, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        self.routes.push(Route {
            pattern: PathPattern::compile(path)?,
            filter,
            stack: vec![mw],
        });
        Ok(())
    }

    /// Registers `mw` for any method at `path`; the `use` registration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn any(&mut self, path: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        self.add(path, MethodFilter::Any, mw)
    }
    /// Registers `mw` for `GET` (and `HEAD`) at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn get(&mut self, path: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        self.add(path, MethodFilter::Get, mw)
    }
    /// Registers `mw` for `POST` at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn post(&mut self, path: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        self.add(path, MethodFilter::Post, mw)
    }

    /// Installs a rewrite: when `path` matches, the first occurrence of
    /// `src` in the current path is replaced with `dest` for everything
    /// downstream.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn add_rewrite(&mut self, path: &str, src: &str, dest: &str) -> Result<(), Error> {
        self.any(path, Arc::new(Rewrite::new(src, dest)))
    }

    /// Installs a terminal redirect at `path` with `code`
    /// (301 when [`None`]).
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern, destination, or code.
    pub fn add_redirect(&mut self, path: &str, dest: &str, code: Option<u16>) -> Result<(), Error> {
        self.any(path, Arc::new(Redirect::new(dest, code)?))
    }

    /// Pushes `mw` onto the module stack of `path`.
    ///
    /// The first call installs the stack as one composed entry at the
    /// current position; later calls with the same `path` extend it in
    /// place.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid pattern.
    pub fn push_stack(&mut self, path: &str, mw: Arc<dyn Middleware>) -> Result<(), Error> {
        if let Some(position) = self.stacks.get(path) {
            self.routes[*position].stack.push(mw);
            return Ok(());
        }
        self.stacks.insert(path.to_owned(), self.routes.len());
        self.add(path, MethodFilter::Any, mw)
    }

    /// Resolves a handler named `name` through `env` and pushes the
    /// produced middleware onto `path`'s stack; the `addModule`
    /// registration. Handlers which register their own sub-routes (apps)
    /// produce nothing to push.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unknown handler name, an invalid pattern,
    /// or a handler rejecting `args`.
    pub fn add_module(
        &mut self,
        path: &str,
        name: &str,
        args: &serde_yaml::Value,
        env: &mount::Env,
    ) -> Result<(), Error> {
        let factory = env
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown handler: {name}")))?;
        let produced = {
            let mut scope = mount::ExecutionContext::new(self, path, name, env);
            factory(&mut scope, args)?
        };
        if let Some(mw) = produced {
            let named = Arc::new(mount::Named::new(name, mw));
            self.push_stack(path, named)?;
        }
        Ok(())
    }

    /// The number of installed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }
    /// Whether no entries are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
impl Middleware for PathRouter {
    /// Matches `ctx.path` once, composes every matching entry, and runs
    /// the result. Rewrites downstream do not replay the matching.
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut collected: Vec<Arc<dyn Middleware>> = Vec::new();
            for route in &self.routes {
                if !route.filter.accepts(ctx.method()) {
                    continue;
                }
                if let Some(params) = route.pattern.matches(ctx.path()) {
                    if params.is_empty() {
                        collected.extend(route.stack.iter().cloned());
                    } else {
                        collected.push(Arc::new(WithParams {
                            params,
                            chain: Chain::new(route.stack.clone()),
                        }));
                    }
                }
            }
            if collected.is_empty() {
                return next.invoke(ctx).await;
            }
            let chain = Chain::new(collected);
            chain.execute(ctx, &next).await
        })
    }
}
impl Debug for PathRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let routes: Vec<&str> = self.routes.iter().map(|r| r.pattern.raw()).collect();
        f.debug_struct("PathRouter").field("routes", &routes).finish()
    }
}

/// In-place path substitution, visible only downstream.
///
/// The current path is restored when the stack unwinds, so the original
/// caller observes the pre-rewrite value on fall-through.
#[derive(Debug)]
pub struct Rewrite {
    src: String,
    dest: String,
}
impl Rewrite {
    /// Creates a rewrite replacing the first `src` with `dest`.
    #[must_use]
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
        }
    }
}
impl Middleware for Rewrite {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            let saved = ctx.path().to_owned();
            let rewritten = parse::normalize_path(&saved.replacen(&self.src, &self.dest, 1));
            ctx.log("Rewrite", format_args!("{saved} -> {rewritten}"));
            ctx.set_path(rewritten);
            let result = next.invoke(ctx).await;
            ctx.set_path(saved);
            result
        })
    }
}

/// A terminal redirect: sets `location` and the status, never calls
/// `next`.
#[derive(Debug)]
pub struct Redirect {
    location: HeaderValue,
    code: StatusCode,
}
impl Redirect {
    /// Creates a redirect to `dest` with `code` (301 when [`None`]).
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid destination or a non-redirect
    /// status code.
    pub fn new(dest: &str, code: Option<u16>) -> Result<Self, Error> {
        let location = HeaderValue::from_str(dest)
            .map_err(|_| Error::Config(format!("invalid redirect destination: {dest}")))?;
        let code = StatusCode::from_u16(code.unwrap_or(301))
            .map_err(|_| Error::Config(format!("invalid redirect code for {dest}")))?;
        Ok(Self { location, code })
    }
}
impl Middleware for Redirect {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.set(&header::LOCATION, self.location.clone())?;
            ctx.set_status(self.code)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::test::ctx;

    #[test]
    fn patterns() {
        let literal = PathPattern::compile("/about").unwrap();
        assert!(literal.matches("/about").is_some());
        assert!(literal.matches("/about/team").is_none());

        let wildcard = PathPattern::compile("^/static").unwrap();
        assert!(wildcard.matches("/static/a.txt").is_some());
        assert!(wildcard.matches("/other").is_none());

        let starred = PathPattern::compile("/files/*").unwrap();
        assert!(starred.matches("/files/deep/path").is_some());

        let params = PathPattern::compile("/user/:id/posts/:post").unwrap();
        let captured = params.matches("/user/7/posts/42").unwrap();
        assert_eq!(captured["id"], "7");
        assert_eq!(captured["post"], "42");
        assert!(params.matches("/user/7").is_none());

        assert!(PathPattern::compile("relative").is_err());
    }

    struct EndTail;
    impl Tail for EndTail {
        fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>> {
            Box::pin(async move {
                ctx.log("tail", "reached");
                Ok(())
            })
        }
    }

    fn first<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.log("first", "in");
            next.invoke(ctx).await
        })
    }
    fn second<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.log("second", "in");
            ctx.set_status(StatusCode::NO_CONTENT)?;
            Ok(())
        })
    }

    async fn run(router: PathRouter, ctx: &mut Ctx) -> Result<(), Error> {
        let router: Arc<dyn Middleware> = Arc::new(router);
        Chain::new(vec![router]).execute(ctx, &EndTail).await
    }

    #[tokio::test]
    async fn stack_extension() {
        let mut router = PathRouter::new();
        router.push_stack("^/", Arc::new(first)).unwrap();
        router.push_stack("^/", Arc::new(second)).unwrap();
        // Two modules on the same path share one installed entry.
        assert_eq!(router.len(), 1);

        let (mut ctx, _io) = ctx(Method::GET, "/anything");
        run(router, &mut ctx).await.unwrap();
        assert_eq!(ctx.loggers(), ["first: in", "second: in"]);
        assert_eq!(ctx.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn separate_entries_compose_in_order() {
        let mut router = PathRouter::new();
        router.any("^/", Arc::new(first)).unwrap();
        router.get("/exact", Arc::new(second)).unwrap();

        let (mut ctx, _io) = ctx(Method::GET, "/exact");
        run(router, &mut ctx).await.unwrap();
        assert_eq!(ctx.loggers(), ["first: in", "second: in"]);
    }

    #[tokio::test]
    async fn method_filters() {
        let mut router = PathRouter::new();
        router.post("/submit", Arc::new(second)).unwrap();

        {
            let (mut ctx, _io) = ctx(Method::GET, "/submit");
            run(router, &mut ctx).await.unwrap();
            // No match; the request escaped to the tail.
            assert_eq!(ctx.loggers(), ["tail: reached"]);
        }

        let mut router = PathRouter::new();
        router.post("/submit", Arc::new(second)).unwrap();
        let (mut ctx, _io) = ctx(Method::POST, "/submit");
        run(router, &mut ctx).await.unwrap();
        assert_eq!(ctx.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn rewrite_restores_on_fall_through() {
        fn observe<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
            Box::pin(async move {
                let path = ctx.path().to_owned();
                ctx.log("observed", path);
                next.invoke(ctx).await
            })
        }

        let mut router = PathRouter::new();
        router.add_rewrite("^/old", "/old", "/new").unwrap();
        router.any("^/", Arc::new(observe)).unwrap();

        let (mut ctx, _io) = ctx(Method::GET, "/old/page");
        run(router, &mut ctx).await.unwrap();
        assert!(ctx.loggers().contains(&"observed: /new/page".to_owned()));
        // Restored after the stack unwound.
        assert_eq!(ctx.path(), "/old/page");
    }

    #[tokio::test]
    async fn redirect_is_terminal() {
        let mut router = PathRouter::new();
        router.add_redirect("/away", "https://example.com/", None).unwrap();
        router.any("^/", Arc::new(first)).unwrap();

        let (mut ctx, _io) = ctx(Method::GET, "/away");
        run(router, &mut ctx).await.unwrap();
        assert_eq!(ctx.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            ctx.response_headers().get("location").unwrap(),
            "https://example.com/"
        );
        // The later entry matched `^/` but the redirect never called next.
        assert!(!ctx.loggers().iter().any(|line| line.starts_with("first")));
    }

    #[tokio::test]
    async fn params_are_captured() {
        fn param<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
            Box::pin(async move {
                let id = ctx.params.get("id").cloned().unwrap_or_default();
                ctx.set_body(Bytes::from(id));
                Ok(())
            })
        }

        let mut router = PathRouter::new();
        router.get("/user/:id", Arc::new(param)).unwrap();

        let (mut ctx, _io) = ctx(Method::GET, "/user/42");
        run(router, &mut ctx).await.unwrap();
        match ctx.body() {
            Body::Bytes(bytes) => assert_eq!(bytes.as_ref(), b"42"),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
