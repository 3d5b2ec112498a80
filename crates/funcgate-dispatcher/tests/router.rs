use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use funcgate_core::fixtures::InMemoryJobQueue;
use funcgate_core::Schedule;
use funcgate_dispatcher::{router, AuthMode, DispatcherConfig, Gateway, PendingRequest};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

fn schedule(id: &str, code_name: &str, payload: &str) -> Schedule {
    Schedule {
        id: id.to_string(),
        code_name: code_name.to_string(),
        cluster: "c1".to_string(),
        timeout: 300,
        payload: payload.to_string(),
        ..Default::default()
    }
}

fn queue_with_async_fn() -> Arc<InMemoryJobQueue> {
    let queue = Arc::new(InMemoryJobQueue::new());
    queue.add_code("fn1");
    queue.add_schedule(schedule(
        "S-async",
        "fn1",
        r#"{"type":"async","encrypted_payload":"enc-1","timeout":90}"#,
    ));
    queue
}

fn gateway(queue: Arc<InMemoryJobQueue>, cfg: DispatcherConfig) -> anyhow::Result<Arc<Gateway>> {
    Ok(Arc::new(Gateway::new(cfg, queue)?))
}

fn config() -> DispatcherConfig {
    DispatcherConfig {
        upstream_wait_timeout: Duration::from_millis(200),
        upstream_poll_interval: Duration::from_millis(20),
        enable_crontab: false,
        ..Default::default()
    }
}

async fn send(gateway: &Arc<Gateway>, req: Request<Body>) -> anyhow::Result<(StatusCode, Bytes)> {
    let resp = router(gateway.clone())
        .oneshot(req)
        .await
        .context("oneshot")?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .context("collect body")?
        .to_bytes();
    Ok((status, body))
}

fn error_message(body: &Bytes) -> anyhow::Result<String> {
    let v: serde_json::Value = serde_json::from_slice(body).context("error body is json")?;
    Ok(v["error"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn async_without_callback_is_rejected_before_any_remote_call() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let gw = gateway(queue.clone(), config())?;

    let req = Request::builder()
        .method("POST")
        .uri("/async-function/fn1")
        .body(Body::from("{}"))?;
    let (status, body) = send(&gw, req).await?;

    anyhow::ensure!(status == StatusCode::BAD_REQUEST, "status={status}");
    anyhow::ensure!(error_message(&body)?.contains("X-Callback-URL"));
    anyhow::ensure!(queue.queued().is_empty());
    anyhow::ensure!(queue.listings() == 0, "no schedule lookup expected");
    anyhow::ensure!(gw.cache().is_empty());
    Ok(())
}

#[tokio::test]
async fn async_rejects_non_post() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let gw = gateway(queue.clone(), config())?;

    let req = Request::builder()
        .method("GET")
        .uri("/async-function/fn1")
        .header("X-Callback-URL", "https://cb.example/done")
        .body(Body::empty())?;
    let (status, _) = send(&gw, req).await?;

    anyhow::ensure!(status == StatusCode::BAD_REQUEST, "status={status}");
    anyhow::ensure!(queue.listings() == 0);
    anyhow::ensure!(queue.queued().is_empty());
    Ok(())
}

#[tokio::test]
async fn async_request_is_parked_for_pickup() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let gw = gateway(queue.clone(), config())?;

    let req = Request::builder()
        .method("POST")
        .uri("/async-function/fn1/hook")
        .header("x-callback-url", "https://cb.example/done")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"n":1}"#))?;
    let (status, body) = send(&gw, req).await?;

    anyhow::ensure!(status == StatusCode::ACCEPTED, "status={status}");
    let accepted: serde_json::Value = serde_json::from_slice(&body)?;
    anyhow::ensure!(accepted == serde_json::json!({ "taskID": "T1" }), "{accepted}");

    let queued = queue.queued();
    anyhow::ensure!(queued.len() == 1);
    anyhow::ensure!(queued[0].code_name == "fn1");
    anyhow::ensure!(queued[0].payload == "enc-1");
    anyhow::ensure!(queued[0].timeout == 90);
    anyhow::ensure!(queue.cancelled().is_empty(), "async tasks are never cancelled");

    for _ in 0..2 {
        let req = Request::builder()
            .method("GET")
            .uri("/payload/T1")
            .body(Body::empty())?;
        let (status, body) = send(&gw, req).await?;
        anyhow::ensure!(status == StatusCode::OK, "status={status}");

        let snapshot: PendingRequest = serde_json::from_slice(&body)?;
        anyhow::ensure!(snapshot.body == r#"{"n":1}"#);
        anyhow::ensure!(snapshot.callback == "https://cb.example/done");
        anyhow::ensure!(snapshot.path == "/hook");
        anyhow::ensure!(
            snapshot.headers.get("X-Callback-Url").map(String::as_str)
                == Some("https://cb.example/done")
        );
        anyhow::ensure!(
            snapshot.headers.get("Content-Type").map(String::as_str) == Some("application/json")
        );
    }
    Ok(())
}

#[tokio::test]
async fn async_queue_failure_leaves_no_cache_entry() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    queue.set_fail_queue(true);
    let gw = gateway(queue.clone(), config())?;

    let req = Request::builder()
        .method("POST")
        .uri("/async-function/fn1")
        .header("X-Callback-URL", "https://cb.example/done")
        .body(Body::from("x"))?;
    let (status, _) = send(&gw, req).await?;

    anyhow::ensure!(status == StatusCode::BAD_GATEWAY, "status={status}");
    anyhow::ensure!(gw.cache().is_empty());
    Ok(())
}

#[tokio::test]
async fn pickup_miss_and_corrupt_entry_are_not_found() -> anyhow::Result<()> {
    let queue = Arc::new(InMemoryJobQueue::new());
    let gw = gateway(queue, config())?;
    gw.cache()
        .insert_raw("T9", Bytes::from_static(b"not json"), Duration::from_secs(60));

    for uri in ["/payload/unknown", "/payload/T9"] {
        let req = Request::builder().method("GET").uri(uri).body(Body::empty())?;
        let (status, body) = send(&gw, req).await?;
        anyhow::ensure!(status == StatusCode::NOT_FOUND, "{uri}: status={status}");
        anyhow::ensure!(error_message(&body)? == "request data not found");
    }
    Ok(())
}

#[tokio::test]
async fn unknown_function_is_bad_gateway_without_spawn() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let gw = gateway(queue.clone(), config())?;

    // fn1 only has an async schedule; nothing serves sync calls.
    for uri in ["/function/fn1", "/function/nope/x"] {
        let req = Request::builder().method("POST").uri(uri).body(Body::from("x"))?;
        let (status, body) = send(&gw, req).await?;
        anyhow::ensure!(status == StatusCode::BAD_GATEWAY, "{uri}: status={status}");
        anyhow::ensure!(error_message(&body)? == "no matching schedule");
    }
    anyhow::ensure!(queue.queued().is_empty());
    anyhow::ensure!(queue.cancelled().is_empty());
    Ok(())
}

#[tokio::test]
async fn token_auth_guards_every_route() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let cfg = DispatcherConfig {
        auth: AuthMode::Token("xxx".to_string()),
        ..config()
    };
    let gw = gateway(queue.clone(), cfg)?;

    for (auth, expected) in [
        (None, StatusCode::UNAUTHORIZED),
        (Some("Token yyy"), StatusCode::UNAUTHORIZED),
        (Some("Bearer xxx"), StatusCode::UNAUTHORIZED),
        (Some("Token xxx"), StatusCode::ACCEPTED),
    ] {
        let mut req = Request::builder()
            .method("POST")
            .uri("/async-function/fn1")
            .header("X-Callback-URL", "https://cb.example/done");
        if let Some(auth) = auth {
            req = req.header("Authorization", auth);
        }
        let (status, body) = send(&gw, req.body(Body::from("x"))?).await?;
        anyhow::ensure!(status == expected, "{auth:?}: status={status}");
        if expected == StatusCode::UNAUTHORIZED {
            anyhow::ensure!(error_message(&body)? == "invalid token");
        }
    }
    anyhow::ensure!(queue.queued().len() == 1, "only the authorized call spawns");

    let req = Request::builder()
        .method("GET")
        .uri("/payload/T1")
        .body(Body::empty())?;
    let (status, _) = send(&gw, req).await?;
    anyhow::ensure!(status == StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn oversized_body_is_rejected_before_spawn() -> anyhow::Result<()> {
    let queue = Arc::new(InMemoryJobQueue::new());
    queue.add_code("fn1");
    queue.add_schedule(schedule("S-sync", "fn1", r#"{"type":"sync"}"#));
    let cfg = DispatcherConfig {
        max_body_bytes: 8,
        ..config()
    };
    let gw = gateway(queue.clone(), cfg)?;

    let req = Request::builder()
        .method("POST")
        .uri("/function/fn1")
        .body(Body::from("this body is far too long"))?;
    let (status, body) = send(&gw, req).await?;

    anyhow::ensure!(status == StatusCode::BAD_REQUEST, "status={status}");
    let message = error_message(&body)?;
    anyhow::ensure!(message.contains("8 byte limit"), "message={message}");
    anyhow::ensure!(queue.queued().is_empty());
    anyhow::ensure!(queue.listings() == 0, "no schedule lookup expected");
    Ok(())
}

#[tokio::test]
async fn async_body_is_validated_before_schedule_lookup() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let cfg = DispatcherConfig {
        max_body_bytes: 8,
        ..config()
    };
    let gw = gateway(queue.clone(), cfg)?;

    for body in [
        Body::from(vec![0xff_u8, 0xfe]),
        Body::from("this body is far too long"),
    ] {
        let req = Request::builder()
            .method("POST")
            .uri("/async-function/fn1")
            .header("X-Callback-URL", "https://cb.example/done")
            .body(body)?;
        let (status, _) = send(&gw, req).await?;
        anyhow::ensure!(status == StatusCode::BAD_REQUEST, "status={status}");
    }

    anyhow::ensure!(queue.listings() == 0, "listings={}", queue.listings());
    anyhow::ensure!(queue.queued().is_empty());
    anyhow::ensure!(gw.cache().is_empty());
    Ok(())
}

#[tokio::test]
async fn async_snapshot_keeps_escaped_residual_path() -> anyhow::Result<()> {
    let queue = queue_with_async_fn();
    let gw = gateway(queue.clone(), config())?;

    let req = Request::builder()
        .method("POST")
        .uri("/async-function/fn1/a%3Fb/c%2Fd")
        .header("X-Callback-URL", "https://cb.example/done")
        .body(Body::from("x"))?;
    let (status, _) = send(&gw, req).await?;
    anyhow::ensure!(status == StatusCode::ACCEPTED, "status={status}");

    let raw = gw.cache().get_raw("T1").context("snapshot cached")?;
    let snapshot: PendingRequest = serde_json::from_slice(&raw)?;
    anyhow::ensure!(snapshot.path == "/a%3Fb/c%2Fd", "path={}", snapshot.path);
    Ok(())
}
