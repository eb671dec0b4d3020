use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::process::{Child, Command};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const TEST_SIGNALING_PORT: u16 = 18080;
const TEST_HEALTH_PORT: u16 = 18081;
const TEST_WS_SIGNALING_PORT: u16 = 18090;
const TEST_WS_HEALTH_PORT: u16 = 18091;
const STARTUP_DELAY_MS: u64 = 2000;

/// Manages the server process under test, started against
/// `tests/test_config.toml` in `--test-mode` so the video source is a
/// `videotestsrc` rather than a real display capture.
struct TestServer {
    process: Child,
    health_port: u16,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with_config("tests/test_config.toml", TEST_HEALTH_PORT).await
    }

    /// Same as `start`, but against the `websockets` transport-mode config,
    /// which binds on the `TEST_WS_*` port pair instead.
    async fn start_websockets() -> Result<Self> {
        Self::start_with_config("tests/test_config_ws.toml", TEST_WS_HEALTH_PORT).await
    }

    async fn start_with_config(config_path: &str, health_port: u16) -> Result<Self> {
        let _ = Command::new("pkill").arg("-f").arg("selkies-core.*--test-mode").output();
        sleep(Duration::from_millis(500)).await;

        let process = Command::new("cargo")
            .args(["run", "--", "--test-mode", "--config", config_path])
            .spawn()
            .expect("failed to start test server");

        sleep(Duration::from_millis(STARTUP_DELAY_MS)).await;
        Ok(TestServer { process, health_port })
    }

    async fn is_ready(&self) -> bool {
        let client = reqwest::Client::new();
        let health_port = self.health_port;
        for _ in 0..10 {
            if let Ok(resp) = client
                .get(format!("http://127.0.0.1:{health_port}/health"))
                .timeout(Duration::from_secs(1))
                .send()
                .await
            {
                if resp.status().is_success() {
                    return true;
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let client = reqwest::Client::new();
    let resp = client.get(format!("http://127.0.0.1:{TEST_HEALTH_PORT}/health")).send().await?;

    assert!(resp.status().is_success());
    let body: Value = resp.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);

    Ok(())
}

#[tokio::test]
async fn test_websocket_signaling_connection() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_SIGNALING_PORT}");
    let (ws_stream, _) = connect_async(&ws_url).await?;
    drop(ws_stream);
    Ok(())
}

#[tokio::test]
async fn test_webrtc_offer_answer_exchange() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_SIGNALING_PORT}");
    let (ws_stream, _) = connect_async(&ws_url).await?;
    let (mut write, mut read) = ws_stream.split();

    let offer = json!({ "offer": { "type": "offer", "sdp": mock_sdp_offer() } });
    write.send(Message::Text(offer.to_string())).await?;

    let answer = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Ok(Message::Text(text)) = msg {
                let value: Value = serde_json::from_str(&text)?;
                if value.get("answer").is_some() {
                    return Ok::<_, anyhow::Error>(value);
                }
            }
        }
        Err(anyhow::anyhow!("no answer received before socket closed"))
    })
    .await??;

    assert!(answer["answer"]["sdp"].is_string());
    assert_eq!(answer["answer"]["type"], "answer");

    Ok(())
}

#[tokio::test]
async fn test_ice_candidates_trickle_after_offer() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_SIGNALING_PORT}");
    let (ws_stream, _) = connect_async(&ws_url).await?;
    let (mut write, mut read) = ws_stream.split();

    let offer = json!({ "offer": { "type": "offer", "sdp": mock_sdp_offer() } });
    write.send(Message::Text(offer.to_string())).await?;

    // Trickle ICE is best-effort in a test environment with no real network
    // interfaces to gather candidates from; this only asserts the exchange
    // doesn't hang or error out within the window.
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(msg) = read.next().await {
            if let Ok(Message::Text(text)) = msg {
                let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                if value.get("iceCandidate").is_some() {
                    return;
                }
            }
        }
    })
    .await;

    Ok(())
}

#[tokio::test]
async fn test_multiple_concurrent_sessions() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_SIGNALING_PORT}");
    let mut handles = Vec::new();
    for _ in 0..3 {
        let url = ws_url.clone();
        handles.push(tokio::spawn(async move { connect_async(&url).await }));
    }

    let mut success_count = 0;
    for handle in handles {
        if matches!(handle.await, Ok(Ok(_))) {
            success_count += 1;
        }
    }

    assert!(success_count >= 2, "at least 2 of 3 concurrent connections should succeed");
    Ok(())
}

#[tokio::test]
async fn test_session_reconnect_after_disconnect() -> Result<()> {
    let server = TestServer::start().await?;
    assert!(server.is_ready().await, "server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_SIGNALING_PORT}");
    {
        let (ws_stream, _) = connect_async(&ws_url).await?;
        drop(ws_stream);
    }

    sleep(Duration::from_millis(100)).await;

    let (ws_stream, _) = connect_async(&ws_url).await?;
    drop(ws_stream);
    Ok(())
}

#[tokio::test]
async fn test_websocket_transport_mode_streams_without_sdp() -> Result<()> {
    let server = TestServer::start_websockets().await?;
    assert!(server.is_ready().await, "websockets-mode server failed to start");

    let ws_url = format!("ws://127.0.0.1:{TEST_WS_SIGNALING_PORT}");
    let (ws_stream, _) = connect_async(&ws_url).await?;
    let (_write, mut read) = ws_stream.split();

    // In websockets mode frames start flowing on connect with no offer/answer
    // step, so the first message off the wire should be a binary video frame
    // rather than the text SDP payload the WebRTC-mode test expects.
    let first_message = tokio::time::timeout(Duration::from_secs(5), read.next()).await?;
    match first_message {
        Some(Ok(Message::Binary(frame))) => {
            assert!(!frame.is_empty(), "video frame should carry a non-empty payload");
        }
        Some(Ok(other)) => panic!("expected a binary video frame, got {other:?}"),
        Some(Err(e)) => panic!("websocket error before first frame: {e}"),
        None => panic!("socket closed before any frame arrived"),
    }

    Ok(())
}

fn mock_sdp_offer() -> String {
    r#"v=0
o=- 123456 2 IN IP4 127.0.0.1
s=-
t=0 0
a=group:BUNDLE 0
a=msid-semantic: WMS stream
m=video 9 UDP/TLS/RTP/SAVPF 96
c=IN IP4 0.0.0.0
a=rtcp:9 IN IP4 0.0.0.0
a=ice-ufrag:test
a=ice-pwd:testpassword1234567890
a=fingerprint:sha-256 00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00
a=setup:actpass
a=mid:0
a=sendrecv
a=rtcp-mux
a=rtpmap:96 VP8/90000
a=ssrc:1234567890 cname:test
a=ssrc:1234567890 msid:stream video
a=ssrc:1234567890 mslabel:stream
a=ssrc:1234567890 label:video
"#
    .to_string()
}
