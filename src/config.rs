//! The declarative route document and its binding.
//!
//! Operators drive verge entirely through a YAML document:
//!
//! ```yaml
//! router:
//!   verbose: true
//!   routes:
//!     example.com:
//!       /old: { redirect: "https://example.com/new", code: 308 }
//!       ^/static: { static: { root: public, maxage: 60000 } }
//!       ^/api: { rewrite: [["/api", ""]], proxy: "http://127.0.0.1:8080" }
//!     "*":
//!       ^/: echo
//! ```
//!
//! Host keys surrounded by `/` are regex literals; path keys starting with
//! `^/` are wildcard prefixes. The binder walks `routes` in declaration
//! order and wires the host router, path routers, rewrites, redirects,
//! and named handlers together. Every error here is fatal at startup.

use crate::prelude::*;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Reserved keys of a path entry; everything else names a handler.
const RESERVED: &[&str] = &["redirect", "code", "rewrite"];

/// The top of the configuration document.
#[derive(Debug, Deserialize)]
pub struct Document {
    /// The address the binary listens on; `0.0.0.0:8080` when absent.
    /// TLS listeners are configured by the outer layers.
    #[serde(default)]
    pub listen: Option<String>,
    /// The routing section.
    pub router: RouterSection,
}

/// The `router` section: the route table and its options.
#[derive(Debug, Deserialize)]
pub struct RouterSection {
    /// Log every installed route at startup.
    #[serde(default)]
    pub verbose: bool,
    /// `host pattern -> path pattern -> entry`, in declaration order.
    pub routes: Mapping,
}

/// Parses a configuration document from YAML text.
///
/// # Errors
///
/// [`Error::Config`] when the document does not deserialise.
pub fn load_str(yaml: &str) -> Result<Document, Error> {
    serde_yaml::from_str(yaml).map_err(|err| Error::Config(format!("config: {err}")))
}

/// Binds a parsed document to a ready [`HostRouter`].
///
/// # Errors
///
/// Any [`Error::Config`] from patterns, handler names, or handler options.
pub fn build(document: &Document, env: &mount::Env) -> Result<HostRouter, Error> {
    bind(&document.router, env)
}

/// Binds the `router` section; see [`build`].
///
/// # Errors
///
/// Any [`Error::Config`] from patterns, handler names, or handler options.
pub fn bind(section: &RouterSection, env: &mount::Env) -> Result<HostRouter, Error> {
    let mut host_router = HostRouter::new();
    let mut installed = 0_usize;

    for (host_key, site_value) in &section.routes {
        let host_key = host_key
            .as_str()
            .ok_or_else(|| Error::Config("host keys must be strings".into()))?;
        let paths = site_value.as_mapping().ok_or_else(|| {
            Error::Config(format!("routes for {host_key} must be a mapping"))
        })?;
        let router = host_router.entry(host_key)?;

        for (path_key, entry) in paths {
            let path = path_key
                .as_str()
                .ok_or_else(|| Error::Config(format!("path keys of {host_key} must be strings")))?;
            installed += bind_path(router, host_key, path, entry, env, section.verbose)?;
        }
    }

    info!("router ready: {installed} routes installed");
    Ok(host_router)
}

fn bind_path(
    router: &mut PathRouter,
    host: &str,
    path: &str,
    entry: &Value,
    env: &mount::Env,
    verbose: bool,
) -> Result<usize, Error> {
    let mut installed = 0_usize;
    let mut log_route = |handler: &str| {
        if verbose {
            info!("route {host} {path} -> {handler}");
        }
    };

    match entry {
        // A bare string is a single handler name with no options.
        Value::String(name) => {
            router
                .add_module(path, name, &Value::Null, env)
                .map_err(|err| at(host, path, err))?;
            log_route(name);
            installed += 1;
        }
        Value::Mapping(map) => {
            // Rewrites apply before anything else on the path.
            if let Some(rewrites) = map.get("rewrite") {
                for pair in rewrite_pairs(host, path, rewrites)? {
                    router
                        .add_rewrite(path, &pair.0, &pair.1)
                        .map_err(|err| at(host, path, err))?;
                    log_route("rewrite");
                    installed += 1;
                }
            }
            // A redirect is terminal; remaining keys are ignored.
            if let Some(redirect) = map.get("redirect") {
                let url = redirect.as_str().ok_or_else(|| {
                    Error::Config(format!("{host}{path}: redirect must be a string"))
                })?;
                let code = map
                    .get("code")
                    .and_then(Value::as_u64)
                    .map(|code| u16::try_from(code).unwrap_or(0));
                router
                    .add_redirect(path, url, code)
                    .map_err(|err| at(host, path, err))?;
                log_route("redirect");
                return Ok(installed + 1);
            }
            for (key, value) in map {
                let name = key.as_str().ok_or_else(|| {
                    Error::Config(format!("{host}{path}: handler names must be strings"))
                })?;
                if RESERVED.contains(&name) {
                    continue;
                }
                router
                    .add_module(path, name, value, env)
                    .map_err(|err| at(host, path, err))?;
                log_route(name);
                installed += 1;
            }
        }
        other => {
            return Err(Error::Config(format!(
                "{host}{path}: unsupported entry {other:?}"
            )))
        }
    }
    Ok(installed)
}

fn rewrite_pairs(host: &str, path: &str, value: &Value) -> Result<Vec<(String, String)>, Error> {
    let bad = || Error::Config(format!("{host}{path}: rewrite must be a list of [src, dst]"));
    let list = value.as_sequence().ok_or_else(bad)?;
    let mut pairs = Vec::with_capacity(list.len());
    for pair in list {
        let pair = pair.as_sequence().ok_or_else(bad)?;
        match (pair.first().and_then(Value::as_str), pair.get(1).and_then(Value::as_str)) {
            (Some(src), Some(dst)) if pair.len() == 2 => {
                pairs.push((src.to_owned(), dst.to_owned()));
            }
            _ => return Err(bad()),
        }
    }
    Ok(pairs)
}

/// Prefixes a configuration error with its route.
fn at(host: &str, path: &str, err: Error) -> Error {
    match err {
        Error::Config(message) => Error::Config(format!("{host}{path}: {message}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> mount::Env {
        mount::Env::new(".")
    }

    #[test]
    fn binds_in_order() {
        let document = load_str(
            r#"
router:
  verbose: false
  routes:
    "/^www\\.example\\.com$/":
      /old: { redirect: "https://example.com/", code: 308 }
      ^/: echo
    "*":
      ^/: echo
"#,
        )
        .unwrap();
        let router = build(&document, &env()).unwrap();
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn unknown_handler_is_fatal() {
        let document = load_str(
            r#"
router:
  routes:
    "*":
      /x: teleporter
"#,
        )
        .unwrap();
        let err = build(&document, &env()).unwrap_err();
        assert!(matches!(err, Error::Config(message) if message.contains("teleporter")));
    }

    #[test]
    fn two_handlers_share_one_stack() {
        let document = load_str(
            r#"
router:
  routes:
    "*":
      ^/:
        echo: ~
        static: { root: "." }
"#,
        )
        .unwrap();
        let host_router = build(&document, &env()).unwrap();
        assert_eq!(host_router.len(), 1);
        // Both handlers landed in one installed entry; the second extends
        // the first's stack.
    }

    #[test]
    fn rewrite_shape_is_checked() {
        let document = load_str(
            r#"
router:
  routes:
    "*":
      ^/api: { rewrite: "broken", proxy: "http://127.0.0.1:1" }
"#,
        )
        .unwrap();
        assert!(matches!(build(&document, &env()), Err(Error::Config(_))));
    }

    #[test]
    fn bad_host_regex_is_fatal() {
        let document = load_str(
            r#"
router:
  routes:
    "/broken(/":
      ^/: echo
"#,
        )
        .unwrap();
        assert!(matches!(build(&document, &env()), Err(Error::Config(_))));
    }
}
