use breakwater::auth::AccessControl;
use breakwater::http::{self, App};
use breakwater::{BuiltinPolicy, Verdict};
use std::net::SocketAddr;
use std::sync::Arc;

async fn serve() -> SocketAddr {
    let db = statsdb::StatsDb::with_fields(
        "default",
        600,
        6,
        4,
        statsdb::parse_field_schema([
            ("countLogins", "int"),
            ("diffPasswords", "hll"),
            ("diffIPs", "hll"),
        ])
        .unwrap(),
    );
    statsdb::register(db.clone()).expect("fresh registry in this test binary");

    let verdict = Verdict::new(Box::new(BuiltinPolicy::new(
        db,
        breakwater::config::PolicyConfig::default(),
    )));
    let access = AccessControl::new(
        Some("super".to_string()),
        vec!["127.0.0.0/8".parse().unwrap()],
    );
    let app = Arc::new(App::new(verdict, access));
    app.register_custom_endpoint("ping", Arc::new(|_| serde_json::json!({"status": "ok"})));

    let router = http::build_router(app);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn rest_surface_end_to_end() {
    let addr = serve().await;
    let client = reqwest::Client::new();
    let tuple = serde_json::json!({
        "login": "bob",
        "remote": "192.0.2.17",
        "pwhash": "cafe01",
        "success": false,
        "protocol": "imap",
    });

    // Missing credentials are rejected before any work happens.
    let resp = client
        .post(format!("http://{addr}/?command=report"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // A wrong password too.
    let resp = client
        .post(format!("http://{addr}/?command=report"))
        .basic_auth("anyone", Some("wrong"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Reports ack with a bare ok.
    let resp = client
        .post(format!("http://{addr}/?command=report"))
        .basic_auth("anyone", Some("super"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // A clean tuple is allowed.
    let resp = client
        .post(format!("http://{addr}/?command=allow"))
        .basic_auth("anyone", Some("super"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 0);

    // A deny-listed login is rejected until reset.
    lists::bl_db().add_internal(lists::Kind::Login, "bob", 600, "abuse", false);
    let resp = client
        .post(format!("http://{addr}/?command=allow"))
        .basic_auth("anyone", Some("super"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], -1);
    assert_eq!(body["msg"], "Temporarily blocked");

    let resp = client
        .post(format!("http://{addr}/?command=reset"))
        .basic_auth("anyone", Some("super"))
        .json(&serde_json::json!({"login": "bob", "ip": "192.0.2.17"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("http://{addr}/?command=allow"))
        .basic_auth("anyone", Some("super"))
        .json(&tuple)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 0);

    // Schema violations are the caller's problem.
    let resp = client
        .post(format!("http://{addr}/?command=report"))
        .basic_auth("anyone", Some("super"))
        .body("{\"login\": \"bob\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/?command=frobnicate"))
        .basic_auth("anyone", Some("super"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Custom endpoints dispatch by name.
    let resp = client
        .post(format!("http://{addr}/command/ping"))
        .basic_auth("anyone", Some("super"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // Metrics need no credentials, only an allowed source address.
    let resp = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("breakwater_commands_total"));
}
