//! First-level routing: hostname to path router.
//!
//! A route table maps [`HostPattern`]s to [`PathRouter`]s, in declaration
//! order. The first pattern matching the request's hostname wins; `*`
//! placed last acts as the default. A request matching no pattern escapes
//! the routing layer through the outer continuation.

use crate::prelude::*;
use regex::Regex;

/// A pattern for the `host` of a request, a *site* in the route table.
///
/// Matching is against the comparable hostname form (lowercased,
/// IDN-unicode, no port); see
/// [`unicode_hostname`](crate::ctx::unicode_hostname).
#[derive(Debug, Clone)]
pub enum HostPattern {
    /// An exact hostname.
    Exact(String),
    /// Any of several exact hostnames.
    List(Vec<String>),
    /// A compiled regular expression, written `/…/` in configuration.
    Pattern(Regex),
    /// Every hostname; the wildcard `*`.
    Any,
}
impl HostPattern {
    /// Parses a configuration key into a pattern.
    ///
    /// `*` is [`Self::Any`]; a string surrounded by `/` is a regex literal
    /// with an optional trailing `i` flag; a comma-separated string is a
    /// [`Self::List`]; anything else matches exactly.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the regex does not compile.
    pub fn parse(key: &str) -> Result<Self, Error> {
        let key = key.trim();
        if key == "*" {
            return Ok(Self::Any);
        }
        if let Some(rest) = key.strip_prefix('/') {
            let end = rest
                .rfind('/')
                .ok_or_else(|| Error::Config(format!("unterminated host regex: {key}")))?;
            let (pattern, flags) = (&rest[..end], &rest[end + 1..]);
            let pattern = if flags.contains('i') {
                format!("(?i){pattern}")
            } else {
                pattern.to_owned()
            };
            let regex = Regex::new(&pattern)
                .map_err(|err| Error::Config(format!("bad host regex {key}: {err}")))?;
            return Ok(Self::Pattern(regex));
        }
        if key.contains(',') {
            return Ok(Self::List(
                key.split(',')
                    .map(|host| ctx::unicode_hostname(host.trim()))
                    .filter(|host| !host.is_empty())
                    .collect(),
            ));
        }
        Ok(Self::Exact(ctx::unicode_hostname(key)))
    }

    /// Whether `hostname` matches this pattern.
    #[must_use]
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Exact(host) => host == hostname,
            Self::List(hosts) => hosts.iter().any(|host| host == hostname),
            Self::Pattern(regex) => regex.is_match(hostname),
            Self::Any => true,
        }
    }
}
impl Display for HostPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(host) => f.write_str(host),
            Self::List(hosts) => f.write_str(&hosts.join(",")),
            Self::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
            Self::Any => f.write_str("*"),
        }
    }
}

struct Site {
    pattern: HostPattern,
    /// The configuration key, for `ctx.site` and entry lookup.
    raw: String,
    router: PathRouter,
}

/// The top of the routing tree: ordered `(pattern, path router)` entries.
#[derive(Default)]
pub struct HostRouter {
    sites: Vec<Site>,
}
impl HostRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the path router for `key`, creating it at the end of the table
    /// on first use.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `key` is not a valid [`HostPattern`].
    pub fn entry(&mut self, key: &str) -> Result<&mut PathRouter, Error> {
        if let Some(pos) = self.sites.iter().position(|site| site.raw == key) {
            return Ok(&mut self.sites[pos].router);
        }
        let pattern = HostPattern::parse(key)?;
        self.sites.push(Site {
            pattern,
            raw: key.to_owned(),
            router: PathRouter::new(),
        });
        Ok(&mut self.sites.last_mut().unwrap().router)
    }

    /// Adds a pre-built path router under `pattern`.
    pub fn add(&mut self, pattern: HostPattern, router: PathRouter) {
        self.sites.push(Site {
            raw: pattern.to_string(),
            pattern,
            router,
        });
    }

    /// The number of sites in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }
    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    fn find(&self, hostname: &str) -> Option<&Site> {
        self.sites.iter().find(|site| site.pattern.matches(hostname))
    }
}
impl Middleware for HostRouter {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            match self.find(ctx.hostname()) {
                Some(site) => {
                    ctx.set_site(site.raw.clone());
                    site.router.handle(ctx, next).await
                }
                None => next.invoke(ctx).await,
            }
        })
    }
}
impl Debug for HostRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sites: Vec<&str> = self.sites.iter().map(|site| site.raw.as_str()).collect();
        f.debug_struct("HostRouter").field("sites", &sites).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kinds() {
        assert!(matches!(HostPattern::parse("*"), Ok(HostPattern::Any)));
        assert!(matches!(
            HostPattern::parse("example.com"),
            Ok(HostPattern::Exact(_))
        ));
        assert!(matches!(
            HostPattern::parse("a.com, b.com"),
            Ok(HostPattern::List(_))
        ));
        assert!(matches!(
            HostPattern::parse(r"/^www\.example\.com$/"),
            Ok(HostPattern::Pattern(_))
        ));
        assert!(matches!(
            HostPattern::parse("/broken(/"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn matching() {
        let exact = HostPattern::parse("Example.COM").unwrap();
        assert!(exact.matches("example.com"));
        assert!(!exact.matches("www.example.com"));

        let list = HostPattern::parse("a.com,b.com").unwrap();
        assert!(list.matches("b.com"));
        assert!(!list.matches("c.com"));

        let regex = HostPattern::parse("/^(www|api)\\.example\\.com$/").unwrap();
        assert!(regex.matches("api.example.com"));
        assert!(!regex.matches("api.example.org"));

        let insensitive = HostPattern::parse("/example/i").unwrap();
        assert!(insensitive.matches("EXAMPLE.com"));
    }

    #[test]
    fn declaration_order_wins() {
        let mut router = HostRouter::new();
        router.entry("/^.*\\.example\\.com$/").unwrap();
        router.entry("www.example.com").unwrap();
        router.entry("*").unwrap();

        // The regex is declared first, so it shadows the exact entry.
        let found = router.find("www.example.com").unwrap();
        assert_eq!(found.raw, "/^.*\\.example\\.com$/");
        // Anything else lands on the wildcard.
        let found = router.find("other.org").unwrap();
        assert_eq!(found.raw, "*");
    }

    #[test]
    fn idn_hosts() {
        let pattern = HostPattern::parse("bücher.example").unwrap();
        assert!(pattern.matches(&ctx::unicode_hostname("xn--bcher-kva.example")));
    }
}
