use std::fs;
use std::path::PathBuf;
use verge_testing::prelude::*;

const DATA: &str = "This is a small document used to exercise byte ranges.";

fn fixtures(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("verge-tests-{}", std::process::id()))
        .join(name);
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn yaml_for(root: &std::path::Path, options: &str) -> String {
    format!(
        "router:\n  routes:\n    \"*\":\n      ^/: {{ static: {{ root: \"{}\"{options} }} }}\n",
        root.display()
    )
}

async fn server_with(root: &std::path::Path, options: &str) -> Server {
    ServerBuilder::default()
        .with_yaml(yaml_for(root, options))
        .run()
        .await
}

#[tokio::test]
async fn serves_a_file() {
    let root = fixtures("plain");
    fs::write(root.join("hello.txt"), "hi\n").unwrap();
    let server = server_with(&root, "").await;

    let response = server.get("/hello.txt").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "3");
    assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
    assert!(response.headers().get("last-modified").is_some());
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "hi\n");
}

#[tokio::test]
async fn head_omits_the_body() {
    let root = fixtures("head");
    fs::write(root.join("hello.txt"), "hi\n").unwrap();
    let server = server_with(&root, "").await;

    let response = server.head("/hello.txt").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "3");
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

#[tokio::test]
async fn brotli_beats_gzip() {
    let root = fixtures("encodings");
    fs::write(root.join("hello.txt"), "identity").unwrap();
    fs::write(root.join("hello.txt.br"), "brotli bytes").unwrap();
    fs::write(root.join("hello.txt.gz"), "gzip bytes").unwrap();
    let server = server_with(&root, "").await;

    let response = server
        .get("/hello.txt")
        .header("accept-encoding", "gzip, br")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers().get("content-encoding").unwrap(), "br");
    // The MIME type still names the identity file.
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"brotli bytes");

    // Without brotli acceptance the gzip sibling wins.
    let response = server
        .get("/hello.txt")
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"gzip bytes");

    // No accept-encoding: the identity file.
    let response = server.get("/hello.txt").send().await.unwrap();
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"identity");
}

#[tokio::test]
async fn traversal_never_leaves_the_root() {
    let base = fixtures("traversal");
    let root = base.join("www");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("hello.txt"), "public").unwrap();
    fs::write(base.join("outside.txt"), "SECRET").unwrap();
    let server = server_with(&root, "").await;

    let response = server
        .raw("GET /../outside.txt HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await;
    let status = response.lines().next().unwrap_or("").to_owned();
    assert!(
        status.contains("403") || status.contains("404"),
        "unexpected status line: {status}"
    );
    assert!(!response.contains("SECRET"));
}

#[tokio::test]
async fn hidden_files_fall_through() {
    let root = fixtures("hidden");
    fs::write(root.join(".secret"), "dotfile").unwrap();
    let server = server_with(&root, "").await;

    let response = server.get("/.secret").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn byte_ranges_concatenate() {
    let root = fixtures("ranges");
    fs::write(root.join("data.bin"), DATA).unwrap();
    let server = server_with(&root, "").await;

    let response = server
        .get("/data.bin")
        .header("range", "bytes=0-15")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    let content_range = response
        .headers()
        .get("content-range")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert_eq!(content_range, format!("bytes 0-15/{}", DATA.len()));
    let mut received = response.bytes().await.unwrap().to_vec();

    let response = server
        .get("/data.bin")
        .header("range", "bytes=16-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    received.extend_from_slice(&response.bytes().await.unwrap());

    assert_eq!(received, DATA.as_bytes());
}

#[tokio::test]
async fn unsatisfiable_range_is_416_with_courtesy_body() {
    let root = fixtures("range-416");
    fs::write(root.join("data.bin"), DATA).unwrap();
    let server = server_with(&root, "").await;

    for range in ["bytes=9999-", "bytes=30-20"] {
        let response = server
            .get("/data.bin")
            .header("range", range)
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::RANGE_NOT_SATISFIABLE,
            "range {range}"
        );
        assert_eq!(
            response.headers().get("content-range").unwrap().to_str().unwrap(),
            format!("bytes */{}", DATA.len())
        );
        // The whole file still arrives as a courtesy body.
        assert_eq!(response.bytes().await.unwrap().as_ref(), DATA.as_bytes());
    }
}

#[tokio::test]
async fn conditional_get_returns_304() {
    let root = fixtures("conditional");
    fs::write(root.join("hello.txt"), "hi\n").unwrap();
    let server = server_with(&root, "").await;

    let first = server.get("/hello.txt").send().await.unwrap();
    let modified = first
        .headers()
        .get("last-modified")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let response = server
        .get("/hello.txt")
        .header("if-modified-since", &modified)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_MODIFIED);
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

#[tokio::test]
async fn directory_index_and_format() {
    let root = fixtures("index");
    fs::write(root.join("index.html"), "<h1>home</h1>").unwrap();
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("sub/index.html"), "<h1>sub</h1>").unwrap();
    let server = server_with(&root, "").await;

    let response = server.get("/").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "<h1>home</h1>");

    // A directory without a trailing slash serves its index through
    // `format`.
    let response = server.get("/sub").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "<h1>sub</h1>");
}

#[tokio::test]
async fn directory_listing() {
    let root = fixtures("listing");
    fs::write(root.join("hello.txt"), "hi").unwrap();
    fs::create_dir_all(root.join("nested")).unwrap();
    let server = server_with(&root, ", browse: true, index: null").await;

    let response = server.get("/").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
    let html = response.text().await.unwrap();
    assert!(html.contains("hello.txt"));
    assert!(html.contains("nested/"));
    // The root has no parent link.
    assert!(!html.contains("../"));
}

#[tokio::test]
async fn extension_fallback() {
    let root = fixtures("extensions");
    fs::write(root.join("doc.html"), "<p>doc</p>").unwrap();
    let server = server_with(&root, ", extensions: [html]").await;

    let response = server.get("/doc").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "<p>doc</p>");
}

#[tokio::test]
async fn max_age_and_immutable() {
    let root = fixtures("cache-control");
    fs::write(root.join("hello.txt"), "hi").unwrap();
    let server = server_with(&root, ", maxage: 60000, immutable: true").await;

    let response = server.get("/hello.txt").send().await.unwrap();
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "max-age=60, immutable"
    );
}

#[tokio::test]
async fn undecodable_path_is_bad_request() {
    let root = fixtures("decode");
    let server = server_with(&root, "").await;

    let response = server
        .raw("GET /%zz HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}
