//! **The verge prelude**
//!
//! The purpose of this module is to *simplify* development and *keep module
//! dependencies obvious*. It exports the commonly used external types and the
//! crate's own core items.

// External commonly used dependencies
pub use bytes::{Bytes, BytesMut};
pub use http::{header, uri, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
pub use log::{debug, error, info, trace, warn};
pub use mime::Mime;
pub use std::borrow::Cow;
pub use std::collections::HashMap;
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::io;
pub use std::net::{IpAddr, SocketAddr};
pub use std::path::{Path, PathBuf};
pub use std::pin::Pin;
pub use std::str;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
pub use tokio::net::{TcpListener, TcpStream};

// Modules
pub use crate::{
    chain, config, ctx, files, host, mount, parse, proxy, response, router, utility, websocket,
    wire,
};

// Crate types
pub use crate::chain::{Chain, Middleware, Next, RetFut, Tail};
pub use crate::ctx::{Body, Ctx};
pub use crate::error::Error;
pub use crate::host::{HostPattern, HostRouter};
pub use crate::response::{Io, UpgradableResponse};
pub use crate::router::PathRouter;
pub use crate::{Handle, RunConfig};
