//! Small helpers shared by the handlers.

use crate::prelude::*;

/// Replaces the header `name` with `new` in `headers`,
/// removing all other occurrences of `name`.
#[inline]
pub fn replace_header<K: header::IntoHeaderName + Copy>(
    headers: &mut HeaderMap,
    name: K,
    new: HeaderValue,
) {
    match headers.entry(name) {
        header::Entry::Vacant(slot) => {
            slot.insert(new);
        }
        header::Entry::Occupied(slot) => {
            slot.remove_entry_mult();
            headers.insert(name, new);
        }
    }
}

/// Removes all headers with `name` from `headers`.
#[inline]
pub fn remove_all_headers<K: header::IntoHeaderName>(headers: &mut HeaderMap, name: K) {
    if let header::Entry::Occupied(entry) = headers.entry(name) {
        entry.remove_entry_mult();
    }
}

/// Checks the value of `name` in `headers` against `value`, ignoring case.
pub fn header_eq(headers: &HeaderMap, name: impl header::AsHeaderName, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |s| s.eq_ignore_ascii_case(value))
}

/// Checks whether the comma-separated list in `name` contains `token`,
/// ignoring case. Used for `connection: keep-alive, upgrade`.
pub fn header_contains(headers: &HeaderMap, name: impl header::AsHeaderName, token: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |s| {
            s.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
        })
}

/// Gets a hard-coded HTML error body for `code`.
///
/// Used when no handler produced a response and for errors escaping the
/// chain.
#[must_use]
pub fn hardcoded_error_body(code: StatusCode, message: Option<&str>) -> Bytes {
    let mut body = BytesMut::with_capacity(200);
    let reason = code.canonical_reason().unwrap_or("");

    body.extend(b"<html><head><title>");
    body.extend(code.as_str().as_bytes());
    body.extend(b" ");
    body.extend(reason.as_bytes());
    body.extend(b"</title></head><body><center><h1>");
    body.extend(code.as_str().as_bytes());
    body.extend(b" ");
    body.extend(reason.as_bytes());
    body.extend(b"</h1><hr>An unexpected error occurred. <a href='/'>Return home</a>?");
    if let Some(message) = message {
        body.extend(b"<p>");
        body.extend(message.as_bytes());
        body.extend(b"</p>");
    }
    body.extend(b"</center></body></html>");

    body.freeze()
}

/// Escapes `&`, `<`, and `>` for embedding text in HTML, as the directory
/// listing does.
#[must_use]
pub fn html_escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for char in text.chars() {
        match char {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}
