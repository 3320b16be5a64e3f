use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// End-to-end delivery through a worker thread to a local HTTP server:
// the request must arrive exactly once, signed, with the event headers.
#[tokio::test(flavor = "multi_thread")]
async fn delivers_signed_posts() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(axum::http::HeaderMap, String)>();

    let app = axum::Router::new().route(
        "/w",
        axum::routing::post(move |headers: axum::http::HeaderMap, body: String| {
            let tx = tx.clone();
            async move {
                tx.send((headers, body)).ok();
                "ok"
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let runner = webhooks::WebHookRunner::new();
    runner.set_num_threads(1);
    runner.set_timeout(5);
    runner.start_threads();

    let mut config = HashMap::new();
    config.insert("url".to_string(), format!("http://{addr}/w"));
    config.insert("secret".to_string(), "s3cret".to_string());
    let hook = Arc::new(webhooks::WebHook::new(
        1,
        vec!["addbl".to_string()],
        true,
        config,
    ));

    let payload = serde_json::json!({
        "key": "203.0.113.5/32",
        "bl_type": "ip",
        "reason": "abuse",
        "expire_secs": 3600,
    });
    runner.run_hook_json("addbl", hook.clone(), &payload);

    let (headers, body) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("delivery within the timeout")
        .expect("channel open");

    assert_eq!(headers.get("x-wforce-event").unwrap(), "addbl");
    assert_eq!(headers.get("x-wforce-hookid").unwrap(), "1");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert!(headers.contains_key("x-wforce-delivery"));
    assert_eq!(
        headers.get("x-wforce-signature").unwrap().to_str().unwrap(),
        webhooks::sign_payload("s3cret", &body)
    );

    let got: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(got, payload);

    // At-most-once: no duplicate arrives.
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err(),
        "unexpected duplicate delivery"
    );

    // The hook's own success counter advanced.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while hook.successes() == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hook.successes(), 1);
    assert_eq!(hook.failures(), 0);
}
