//! The static file handler.
//!
//! Resolves the current path under a configured root with lexical
//! containment, negotiates precompressed encodings (`.br` preferred over
//! `.gz`), honours conditional and range requests, and streams the file.
//! Optionally renders a minimal directory listing.

use crate::mount::ExecutionContext;
use crate::prelude::*;
use serde::Deserialize;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncSeekExt;

/// The `setHeaders` hook, invoked just before streaming.
pub type SetHeaders = Arc<dyn Fn(&mut Ctx, &Path, &std::fs::Metadata) + Send + Sync>;

/// Options of the `static` handler, as they appear in the route table.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesConfig {
    /// The directory files are served from. Required.
    pub root: Option<String>,
    /// A prefix stripped from the current path before resolution.
    pub base: Option<String>,
    /// Render a directory listing for directories without an index.
    pub browse: bool,
    /// Disable request logging on this route.
    pub nolog: bool,
    /// The file appended to directory paths. `null` disables it.
    pub index: Option<String>,
    /// Serve dot-prefixed files and directories.
    pub hidden: bool,
    /// Consider `.gz` siblings.
    pub gzip: bool,
    /// Consider `.br` siblings.
    pub brotli: bool,
    /// `cache-control: max-age`, in milliseconds.
    pub maxage: u64,
    /// Append `immutable` to `cache-control`.
    pub immutable: bool,
    /// Serve `<dir>/<index>` when a directory is requested.
    pub format: bool,
    /// Extensions tried in order when the basename has none.
    pub extensions: Option<Vec<String>>,
    /// Rejected here: a header hook cannot be expressed in the document.
    /// Use [`Files::set_headers`] from code.
    #[serde(rename = "setHeaders")]
    pub set_headers: Option<serde_yaml::Value>,
}
impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: None,
            base: None,
            browse: false,
            nolog: false,
            index: Some("index.html".to_owned()),
            hidden: false,
            gzip: true,
            brotli: true,
            maxage: 0,
            immutable: false,
            format: true,
            extensions: None,
            set_headers: None,
        }
    }
}

/// The `static` handler factory.
///
/// Accepts a bare string (the root) or a [`FilesConfig`] mapping.
///
/// # Errors
///
/// [`Error::Config`] when no root is given or `setHeaders` appears in the
/// document.
pub fn factory(
    scope: &mut ExecutionContext<'_>,
    args: &serde_yaml::Value,
) -> Result<Option<Arc<dyn Middleware>>, Error> {
    let config = match args {
        serde_yaml::Value::String(root) => FilesConfig {
            root: Some(root.clone()),
            ..FilesConfig::default()
        },
        other => serde_yaml::from_value(other.clone())
            .map_err(|err| Error::Config(format!("static: {err}")))?,
    };
    let root = config
        .root
        .as_deref()
        .ok_or_else(|| Error::Config("static needs a root".into()))?;
    if config.set_headers.is_some() {
        return Err(Error::Config(
            "static: setHeaders is not callable from the route table".into(),
        ));
    }
    let root = if Path::new(root).is_absolute() {
        PathBuf::from(root)
    } else {
        scope.resolve_fs_path(root)
    };
    Ok(Some(Arc::new(Files::new(root).with_config(config))))
}

/// Serves files under a root directory; see the module documentation.
pub struct Files {
    root: PathBuf,
    base: Option<String>,
    browse: bool,
    nolog: bool,
    index: Option<String>,
    hidden: bool,
    gzip: bool,
    brotli: bool,
    maxage: Duration,
    immutable: bool,
    format: bool,
    extensions: Vec<String>,
    set_headers: Option<SetHeaders>,
}
impl Files {
    /// A handler serving `root` with default options.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: None,
            browse: false,
            nolog: false,
            index: Some("index.html".to_owned()),
            hidden: false,
            gzip: true,
            brotli: true,
            maxage: Duration::ZERO,
            immutable: false,
            format: true,
            extensions: Vec::new(),
            set_headers: None,
        }
    }
    fn with_config(mut self, config: FilesConfig) -> Self {
        self.base = config.base;
        self.browse = config.browse;
        self.nolog = config.nolog;
        self.index = config.index;
        self.hidden = config.hidden;
        self.gzip = config.gzip;
        self.brotli = config.brotli;
        self.maxage = Duration::from_millis(config.maxage);
        self.immutable = config.immutable;
        self.format = config.format;
        self.extensions = config.extensions.unwrap_or_default();
        self
    }
    /// Enables the directory listing.
    #[must_use]
    pub fn browse(mut self) -> Self {
        self.browse = true;
        self
    }
    /// Sets the header hook invoked just before streaming.
    #[must_use]
    pub fn set_headers(mut self, hook: SetHeaders) -> Self {
        self.set_headers = Some(hook);
        self
    }

    /// Resolves `path` under the root with lexical containment.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] when a `..` segment escapes the root,
    /// [`Error::NotFound`] for a hidden segment without `hidden` enabled
    /// (the caller falls through instead of responding).
    fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(Error::Forbidden);
                    }
                }
                other => {
                    if other.starts_with('.') && !self.hidden {
                        return Err(Error::NotFound);
                    }
                    segments.push(other);
                }
            }
        }
        let mut resolved = self.root.clone();
        for segment in segments {
            resolved.push(segment);
        }
        Ok(resolved)
    }

    /// Picks a precompressed sibling if the client prefers its encoding.
    ///
    /// `br` takes precedence over `gzip`.
    async fn negotiate_encoding(
        &self,
        resolved: &Path,
        accept_encoding: Option<&str>,
    ) -> Option<(PathBuf, &'static str)> {
        let accept = accept_encoding?;
        let identity = parse::quality_of(accept, "identity").unwrap_or(1.0);
        for (enabled, encoding, suffix) in
            [(self.brotli, "br", ".br"), (self.gzip, "gzip", ".gz")]
        {
            let quality = parse::quality_of(accept, encoding).unwrap_or(0.0);
            if !enabled || quality <= 0.0 || quality < identity {
                continue;
            }
            let mut candidate = resolved.as_os_str().to_owned();
            candidate.push(suffix);
            let candidate = PathBuf::from(candidate);
            if fs::metadata(&candidate).await.map_or(false, |m| m.is_file()) {
                return Some((candidate, encoding));
            }
        }
        None
    }

    /// Tries the configured extension fallbacks, first hit wins.
    async fn try_extensions(&self, resolved: PathBuf) -> PathBuf {
        if self.extensions.is_empty()
            || resolved
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(true, |name| name.contains('.'))
        {
            return resolved;
        }
        for extension in &self.extensions {
            let extension = extension.strip_prefix('.').unwrap_or(extension);
            let mut candidate = resolved.as_os_str().to_owned();
            candidate.push(".");
            candidate.push(extension);
            let candidate = PathBuf::from(candidate);
            if fs::metadata(&candidate).await.is_ok() {
                return candidate;
            }
        }
        resolved
    }

    fn respond_error(&self, ctx: &mut Ctx, status: StatusCode) -> Result<(), Error> {
        ctx.set_status(status)?;
        ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/html"))?;
        ctx.set_body(utility::hardcoded_error_body(status, None));
        Ok(())
    }

    fn stat_status(err: &io::Error) -> StatusCode {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::NotADirectory
            | io::ErrorKind::InvalidFilename => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    async fn render_listing(&self, ctx: &mut Ctx, dir: &Path, url: &str) -> Result<(), Error> {
        match listing_html(dir, url).await {
            Ok(html) => {
                ctx.set_status(StatusCode::OK)?;
                ctx.set(&header::CONTENT_TYPE, HeaderValue::from_static("text/html"))?;
                ctx.set_body(Bytes::from(html));
                Ok(())
            }
            Err(err) => self.respond_error(ctx, Self::stat_status(&err)),
        }
    }

    /// Streams `file_path`, handling conditional and range requests.
    async fn send_file(
        &self,
        ctx: &mut Ctx,
        file_path: &Path,
        mime_path: &Path,
        encoding: Option<&'static str>,
        metadata: &std::fs::Metadata,
    ) -> Result<(), Error> {
        let len = metadata.len();
        let modified = metadata.modified().ok();

        if let Some(value) = modified.map(format_http_date) {
            ctx.set_if_unset(&header::LAST_MODIFIED, value)?;
        }
        let mut cache_control = format!("max-age={}", self.maxage.as_secs());
        if self.immutable {
            cache_control.push_str(", immutable");
        }
        // Rendered from an integer and a literal; always a legal value.
        ctx.set_if_unset(
            &header::CACHE_CONTROL,
            HeaderValue::from_str(&cache_control).unwrap(),
        )?;
        if !ctx.response_headers().contains_key(header::CONTENT_TYPE) {
            let mime = mime_guess::from_path(mime_path).first_or_octet_stream();
            ctx.set_content_type(&mime)?;
        }
        if let Some(encoding) = encoding {
            ctx.set(&header::CONTENT_ENCODING, HeaderValue::from_static(encoding))?;
            // Drop any externally supplied length; it described the
            // identity representation.
            ctx.remove(&header::CONTENT_LENGTH)?;
        }
        ctx.set(&header::ACCEPT_RANGES, HeaderValue::from_static("bytes"))?;

        // Conditional GET; whole-second resolution like the wire format.
        if let (Some(since), Some(modified)) = (
            ctx.get("if-modified-since")
                .and_then(|v| httpdate::parse_http_date(v).ok()),
            modified,
        ) {
            if truncate_secs(modified) <= since {
                ctx.set_status(StatusCode::NOT_MODIFIED)?;
                ctx.clear_body();
                return Ok(());
            }
        }

        if let Some(hook) = &self.set_headers {
            hook(ctx, file_path, metadata);
        }

        let range = ctx.get("range").map(str::to_owned);
        let mut file = fs::File::open(file_path).await?;

        if let Some(range) = range {
            match parse::range_header(&range).and_then(|spec| spec.resolve(len)) {
                Some((start, end)) => {
                    ctx.set_status(StatusCode::PARTIAL_CONTENT)?;
                    let content_range = format!("bytes {start}-{}/{len}", end - 1);
                    ctx.set(
                        &header::CONTENT_RANGE,
                        HeaderValue::from_str(&content_range).unwrap(),
                    )?;
                    ctx.set(&header::CONTENT_LENGTH, HeaderValue::from(end - start))?;
                    file.seek(io::SeekFrom::Start(start)).await?;
                    ctx.set_stream(file.take(end - start), end - start);
                    return Ok(());
                }
                None => {
                    // Unsatisfiable or malformed: 416 with the whole file
                    // as a courtesy body.
                    ctx.set_status(StatusCode::RANGE_NOT_SATISFIABLE)?;
                    ctx.set(
                        &header::CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes */{len}")).unwrap(),
                    )?;
                    ctx.set(&header::CONTENT_LENGTH, HeaderValue::from(len))?;
                    ctx.set_stream(file, len);
                    return Ok(());
                }
            }
        }

        ctx.set(&header::CONTENT_LENGTH, HeaderValue::from(len))?;
        ctx.set_stream(file, len);
        Ok(())
    }
}
impl Middleware for Files {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            if *ctx.method() != Method::GET && *ctx.method() != Method::HEAD {
                return next.invoke(ctx).await;
            }
            if self.nolog {
                ctx.disable_log();
            }

            // Work on a local copy; the context path is untouched on
            // fall-through.
            let mut path = ctx.path().to_owned();
            if let Some(base) = &self.base {
                match path.strip_prefix(base.as_str()) {
                    Some(rest) => {
                        path = if rest.starts_with('/') {
                            rest.to_owned()
                        } else {
                            format!("/{rest}")
                        };
                    }
                    None => return next.invoke(ctx).await,
                }
            }

            let mut path = match parse::percent_decode(&path) {
                Some(decoded) => decoded.into_owned(),
                None => return self.respond_error(ctx, StatusCode::BAD_REQUEST),
            };
            if path.ends_with('/') {
                if let Some(index) = &self.index {
                    path.push_str(index);
                }
            }

            let resolved = match self.resolve(&path) {
                Ok(resolved) => resolved,
                Err(Error::Forbidden) => {
                    ctx.log("Static", "path escapes root");
                    return self.respond_error(ctx, StatusCode::FORBIDDEN);
                }
                // A hidden segment without `hidden`: not ours to answer.
                Err(_) => return next.invoke(ctx).await,
            };

            let accept_encoding = ctx.get("accept-encoding").map(str::to_owned);
            let (file_path, encoding) = match self
                .negotiate_encoding(&resolved, accept_encoding.as_deref())
                .await
            {
                Some((candidate, encoding)) => (candidate, Some(encoding)),
                None => (self.try_extensions(resolved.clone()).await, None),
            };

            let metadata = match fs::metadata(&file_path).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    let status = Self::stat_status(&err);
                    if status == StatusCode::INTERNAL_SERVER_ERROR {
                        ctx.record_error(&err);
                    }
                    return self.respond_error(ctx, status);
                }
            };

            let (file_path, metadata) = if metadata.is_dir() {
                match (&self.index, self.format) {
                    (Some(index), true) => {
                        let with_index = file_path.join(index);
                        match fs::metadata(&with_index).await {
                            Ok(metadata) => (with_index, metadata),
                            Err(_) if self.browse => {
                                let url = ctx.path().to_owned();
                                return self.render_listing(ctx, &file_path, &url).await;
                            }
                            Err(err) => return self.respond_error(ctx, Self::stat_status(&err)),
                        }
                    }
                    _ if self.browse => {
                        let url = ctx.path().to_owned();
                        return self.render_listing(ctx, &file_path, &url).await;
                    }
                    _ => return next.invoke(ctx).await,
                }
            } else {
                (file_path, metadata)
            };

            ctx.log("Static", file_path.display());
            // The MIME type ignores the encoding suffix when one was
            // negotiated.
            let mime_path = if encoding.is_some() {
                resolved
            } else {
                file_path.clone()
            };
            self.send_file(ctx, &file_path, &mime_path, encoding, &metadata)
                .await
        })
    }
}
impl Debug for Files {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Files")
            .field("root", &self.root)
            .field("base", &self.base)
            .field("browse", &self.browse)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

fn truncate_secs(time: SystemTime) -> SystemTime {
    let since = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    SystemTime::UNIX_EPOCH + Duration::from_secs(since.as_secs())
}

fn format_http_date(time: SystemTime) -> HeaderValue {
    // httpdate output is ASCII.
    HeaderValue::from_str(&httpdate::fmt_http_date(time)).unwrap()
}

/// Renders a minimal directory listing with a parent link (omitted at the
/// root).
async fn listing_html(dir: &Path, url: &str) -> io::Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.metadata().await?.is_dir();
        entries.push(if is_dir { format!("{name}/") } else { name });
    }
    entries.sort();

    let base = if url.ends_with('/') {
        url.to_owned()
    } else {
        format!("{url}/")
    };
    let title = utility::html_escape(url);
    let mut html = String::with_capacity(256 + entries.len() * 64);
    html.push_str("<html><head><title>Index of ");
    html.push_str(&title);
    html.push_str("</title></head><body><h1>Index of ");
    html.push_str(&title);
    html.push_str("</h1><ul>");
    if base != "/" {
        html.push_str("<li><a href=\"");
        html.push_str(&utility::html_escape(&parse::normalize_path(&format!("{base}.."))));
        html.push_str("\">../</a></li>");
    }
    for name in entries {
        let escaped = utility::html_escape(&name);
        html.push_str("<li><a href=\"");
        html.push_str(&utility::html_escape(&base));
        html.push_str(&escaped);
        html.push_str("\">");
        html.push_str(&escaped);
        html.push_str("</a></li>");
    }
    html.push_str("</ul></body></html>");
    Ok(html)
}
