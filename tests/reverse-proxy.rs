use futures_util::{SinkExt, StreamExt};
use verge::websocket::tokio_tungstenite::connect_async;
use verge::websocket::tungstenite::Message;
use verge_testing::prelude::*;

/// An upstream answering 204 with a marker header.
fn no_content<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        ctx.set("x-upstream", HeaderValue::from_static("yes"))?;
        ctx.set_status(StatusCode::NO_CONTENT)?;
        Ok(())
    })
}

/// An upstream echoing WebSocket messages.
fn ws_echo<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
    Box::pin(async move {
        if !ctx.ws() {
            return next.invoke(ctx).await;
        }
        let mut ws = ctx.upgrade().await?;
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
            if ws.send(message).await.is_err() {
                break;
            }
        }
        Ok(())
    })
}

async fn upstream_echo() -> Server {
    ServerBuilder::default()
        .with_yaml("router:\n  routes:\n    \"*\":\n      ^/: echo\n")
        .run()
        .await
}

fn proxy_yaml(upstream_port: u16, extra: &str) -> String {
    format!(
        "router:\n  routes:\n    \"*\":\n      ^/: {{ proxy: {{ upstream: \"http://127.0.0.1:{upstream_port}\"{extra} }} }}\n"
    )
}

#[tokio::test]
async fn forwards_and_rewrites_host() {
    let upstream = upstream_echo().await;
    let front = ServerBuilder::default()
        .with_yaml(proxy_yaml(upstream.port(), ""))
        .run()
        .await;

    let response = front.get("/api/x?q=1").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("GET /api/x?q=1"));
    // The upstream saw itself as the host, not the client's authority.
    assert!(text.contains(&format!("host: 127.0.0.1:{}", upstream.port())));
}

#[tokio::test]
async fn upstream_status_is_surfaced() {
    let mut router = PathRouter::new();
    router.any("^/", Arc::new(no_content)).unwrap();
    let upstream = ServerBuilder::default().with_path_router(router).run().await;

    let front = ServerBuilder::default()
        .with_yaml(proxy_yaml(upstream.port(), ""))
        .run()
        .await;

    let response = front.get("/anything").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

#[tokio::test]
async fn dead_upstream_is_503() {
    // Nothing listens on port 9; connecting fails fast.
    let front = ServerBuilder::default()
        .with_yaml("router:\n  routes:\n    \"*\":\n      ^/: { proxy: { upstream: \"http://127.0.0.1:9\", timeout: 300 } }\n")
        .run()
        .await;

    let response = front.get("/").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn request_body_reaches_the_upstream() {
    // An upstream that reflects its request body.
    fn reflect<'a>(ctx: &'a mut Ctx, _next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            let body = ctx.read_body().await?;
            ctx.set_status(StatusCode::OK)?;
            ctx.set_body(body);
            Ok(())
        })
    }
    let mut router = PathRouter::new();
    router.post("/reflect", Arc::new(reflect)).unwrap();
    let upstream = ServerBuilder::default().with_path_router(router).run().await;

    let front = ServerBuilder::default()
        .with_yaml(proxy_yaml(upstream.port(), ""))
        .run()
        .await;

    let response = front
        .post("/reflect")
        .body("payload bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "payload bytes");
}

#[tokio::test]
async fn websocket_bridge_echoes() {
    let mut router = PathRouter::new();
    router.any("^/", Arc::new(ws_echo)).unwrap();
    let upstream = ServerBuilder::default().with_path_router(router).run().await;

    let front = ServerBuilder::default()
        .with_yaml(proxy_yaml(upstream.port(), ", websocket: true"))
        .run()
        .await;

    let (mut ws, response) = connect_async(front.ws_url("/ws")).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::Text("through the bridge".into()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("through the bridge".into()));

    ws.send(Message::Close(None)).await.unwrap();
}

#[tokio::test]
async fn websocket_failure_falls_through() {
    // The proxy's upstream is dead; the echo handler after it in the same
    // stack answers the request as plain HTTP.
    let front = ServerBuilder::default()
        .with_yaml(
            "router:\n  routes:\n    \"*\":\n      ^/:\n        proxy: { upstream: \"http://127.0.0.1:9\", websocket: true, timeout: 300 }\n        echo: ~\n",
        )
        .run()
        .await;

    let response = front
        .raw(
            "GET /ws HTTP/1.1\r\nhost: localhost\r\nconnection: upgrade, close\r\nupgrade: websocket\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\nsec-websocket-version: 13\r\n\r\n",
        )
        .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("GET /ws"));
}
