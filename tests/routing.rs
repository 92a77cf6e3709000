use verge_testing::prelude::*;

fn logger<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        ctx.set("x-first", HeaderValue::from_static("1"))?;
        next.invoke(ctx).await
    })
}
fn responder<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        ctx.set_status(StatusCode::OK)?;
        let site = ctx.site().unwrap_or("-").to_owned();
        ctx.set_body(Bytes::from(format!("site={site}")));
        Ok(())
    })
}
fn greedy<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        next.invoke(ctx).await?;
        next.invoke(ctx).await
    })
}

fn hosts() -> HostRouter {
    let mut hosts = HostRouter::new();
    let mut exact = PathRouter::new();
    exact.any("^/", Arc::new(responder)).unwrap();
    hosts.add(HostPattern::parse("one.test").unwrap(), exact);

    let mut regex = PathRouter::new();
    regex.any("^/", Arc::new(responder)).unwrap();
    hosts.add(HostPattern::parse("/^.*\\.wild\\.test$/").unwrap(), regex);

    let mut fallback = PathRouter::new();
    fallback.any("^/", Arc::new(responder)).unwrap();
    hosts.add(HostPattern::Any, fallback);
    hosts
}

#[tokio::test]
async fn host_patterns_in_declared_order() {
    let server = ServerBuilder::default().with_router(hosts()).run().await;

    let response = server
        .raw("GET / HTTP/1.1\r\nhost: one.test\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.contains("site=one.test"));

    let response = server
        .raw("GET / HTTP/1.1\r\nhost: a.wild.test\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.contains("site=/^.*\\.wild\\.test$/"));

    let response = server
        .raw("GET / HTTP/1.1\r\nhost: other.example\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.contains("site=*"));
}

#[tokio::test]
async fn no_match_yields_404() {
    let mut hosts = HostRouter::new();
    let mut router = PathRouter::new();
    router.get("/only-here", Arc::new(responder)).unwrap();
    hosts.add(HostPattern::parse("known.test").unwrap(), router);
    let server = ServerBuilder::default().with_router(hosts).run().await;

    // Unknown host escapes the routing layer.
    let response = server
        .raw("GET / HTTP/1.1\r\nhost: stranger.test\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("404 Not Found"));

    // Known host, unknown path.
    let response = server
        .raw("GET /missing HTTP/1.1\r\nhost: known.test\r\nconnection: close\r\n\r\n")
        .await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn stacked_handlers_run_in_order() {
    let mut router = PathRouter::new();
    router.push_stack("^/", Arc::new(logger)).unwrap();
    router.push_stack("^/", Arc::new(responder)).unwrap();
    let server = ServerBuilder::default().with_path_router(router).run().await;

    let response = server.get("/").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    // The first middleware decorated, the second responded.
    assert_eq!(response.headers().get("x-first").unwrap(), "1");
    assert_eq!(response.text().await.unwrap(), "site=*");
}

#[tokio::test]
async fn double_next_is_a_server_error() {
    let mut router = PathRouter::new();
    router.any("^/", Arc::new(greedy)).unwrap();
    let server = ServerBuilder::default().with_path_router(router).run().await;

    let response = server.get("/").send().await.unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn redirect_and_echo_from_yaml() {
    let server = ServerBuilder::default()
        .with_yaml(
            r#"
router:
  routes:
    "*":
      /away: { redirect: "https://example.com/new", code: 308 }
      ^/: echo
"#,
        )
        .run()
        .await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client.get(server.url("/away")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://example.com/new"
    );

    let response = server.get("/somewhere?q=1").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("GET /somewhere?q=1"));
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
    let server = ServerBuilder::default()
        .with_yaml("router:\n  routes:\n    \"*\":\n      ^/: echo\n")
        .run()
        .await;

    let client = reqwest::Client::new();
    for path in ["/a", "/b", "/c"] {
        let response = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.text().await.unwrap().starts_with(&format!("GET {path}")));
    }
}
