//! Integration test: start the gateway on a free port and exercise the HTTP
//! control surface. Does not require Ollama or Telegram. The server task is
//! left running when the test ends.

use lib::config::Config;
use lib::gateway;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_dir() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("harbor-gateway-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("skills")).expect("create skills dir");
    std::fs::create_dir_all(dir.join("state")).expect("create state dir");
    let config_path = dir.join("config.json");
    std::fs::File::create(&config_path)
        .and_then(|mut f| f.write_all(b"{}"))
        .expect("write config.json");
    (dir, config_path)
}

async fn wait_for_health(client: &reqwest::Client, port: u16) -> serde_json::Value {
    let url = format!("http://127.0.0.1:{}/health", port);
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json().await.expect("parse JSON");
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} did not return 200 within 5s; last error: {:?}",
        url, last_err
    );
}

#[tokio::test]
async fn gateway_http_surface_responds() {
    let port = free_port();
    let (_temp_dir, config_path) = temp_config_dir();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();

    tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let client = reqwest::Client::new();
    let health = wait_for_health(&client, port).await;
    assert_eq!(health.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(health.get("clients").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(health.get("sessions").and_then(|v| v.as_u64()), Some(0));

    // empty lists before any traffic
    let sessions: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/sessions", port))
        .send()
        .await
        .expect("GET /sessions")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(sessions["sessions"].as_array().map(|a| a.len()), Some(0));

    let pairing: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/pairing", port))
        .send()
        .await
        .expect("GET /pairing")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(pairing["pairing"].as_array().map(|a| a.len()), Some(0));

    // unknown session id is a 404 with the domain error string
    let resp = client
        .get(format!("http://127.0.0.1:{}/sessions/missing", port))
        .send()
        .await
        .expect("GET /sessions/:id");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.expect("parse JSON");
    assert_eq!(body["error"], "Session not found");

    // approve without both fields is a 400
    let resp = client
        .post(format!("http://127.0.0.1:{}/pairing/approve", port))
        .json(&serde_json::json!({ "channel": "telegram" }))
        .send()
        .await
        .expect("POST /pairing/approve");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("parse JSON");
    assert_eq!(body["error"], "channel and userId required");

    // approve of an unknown pair is a 404
    let resp = client
        .post(format!("http://127.0.0.1:{}/pairing/approve", port))
        .json(&serde_json::json!({ "channel": "telegram", "userId": "99" }))
        .send()
        .await
        .expect("POST /pairing/approve");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.expect("parse JSON");
    assert_eq!(body["error"], "Pairing not found");
}

#[tokio::test]
async fn gateway_refuses_non_loopback_bind_without_token() {
    let (_temp_dir, config_path) = temp_config_dir();
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.gateway.bind = "0.0.0.0".to_string();

    let err = gateway::run_gateway(config, config_path)
        .await
        .expect_err("expected startup to fail");
    assert!(err.to_string().contains("refusing to bind"));
}
