//! Drives a spawned HTTP/2 connection task over an in-memory duplex
//! transport, client frames on one side and the adaptor on the other.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use weir::{
    Delivery, Forwarder, Server,
    http2::{self, Http2Config, frame, hpack},
};

#[derive(Default)]
struct RecordingForwarder {
    delivered: Mutex<Vec<(String, Arc<Delivery>)>>,
}

impl Forwarder for RecordingForwarder {
    fn deliver(&self, to: &str, delivery: &Arc<Delivery>) -> bool {
        self.delivered
            .lock()
            .unwrap()
            .push((to.to_string(), delivery.clone()));
        true
    }
}

fn parse_frames(mut bytes: &[u8]) -> Vec<(frame::FrameHeader, Vec<u8>)> {
    let mut frames = Vec::new();
    while bytes.len() >= frame::FRAME_HEADER_LEN {
        let header = frame::FrameHeader::decode(bytes[..frame::FRAME_HEADER_LEN].try_into().unwrap());
        let total = frame::FRAME_HEADER_LEN + header.length as usize;
        if bytes.len() < total {
            break;
        }
        frames.push((header, bytes[frame::FRAME_HEADER_LEN..total].to_vec()));
        bytes = &bytes[total..];
    }
    frames
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn driver_round_trip() {
    let (client, server_io) = tokio::io::duplex(64 * 1024);
    let server = Server::new();
    let forwarder = Arc::new(RecordingForwarder::default());

    let (_conn, engine, driver) = http2::spawn(
        server_io,
        Some("h2".to_string()),
        42,
        "test-peer".to_string(),
        Http2Config {
            address: "examples/http2".to_string(),
            max_message_size: 0,
        },
        forwarder.clone(),
        server,
    );

    let (mut client_rx, mut client_tx) = tokio::io::split(client);

    // Client preface, SETTINGS, then a complete GET.
    let mut bytes = frame::PREFACE.to_vec();
    frame::write_settings(&mut bytes, &frame::Settings::default());
    let headers = vec![
        (":method".to_string(), "GET".to_string()),
        (":path".to_string(), "/thing".to_string()),
    ];
    let block = hpack::Encoder::new().encode(&headers);
    frame::write_headers(&mut bytes, 1, &block, true);
    client_tx.write_all(&bytes).await.unwrap();

    // Wait for the request to be routed.
    let delivery = tokio::time::timeout(std::time::Duration::from_secs(3), async {
        loop {
            if let Some((to, d)) = forwarder.delivered.lock().unwrap().first().cloned() {
                assert_eq!(to, "/thing");
                break d;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Respond through the shared engine handle, the way the core thread
    // would after routing the response delivery back.
    {
        let mut props = weir::Composer::new(weir::Performative::Properties);
        props
            .start_list()
            .insert_null()
            .insert_null()
            .insert_null()
            .insert_string("204")
            .end_list();
        let response = weir::Message::compose(vec![props], true);
        let response_delivery = Delivery::new(response);
        let mut engine = engine.lock().await;
        engine.attach_response(1, response_delivery);
        drop(engine);
        // The driver task flushes on its next wake.
        delivery.with_message(|m| assert!(m.receive_complete()));
    }
    // Nudge the connection task so it flushes the response.
    let mut ping = Vec::new();
    frame::FrameHeader {
        length: 8,
        kind: frame::frame_type::PING,
        flags: 0,
        stream_id: 0,
    }
    .encode(&mut ping);
    ping.extend_from_slice(&[0; 8]);
    client_tx.write_all(&ping).await.unwrap();

    // Collect server egress until the response HEADERS shows up.
    let mut collected = Vec::new();
    let found = tokio::time::timeout(std::time::Duration::from_secs(3), async {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = client_rx.read(&mut buf).await.unwrap();
            if n == 0 {
                return false;
            }
            collected.extend_from_slice(&buf[..n]);
            let frames = parse_frames(&collected);
            if frames.iter().any(|(h, _)| h.kind == frame::frame_type::HEADERS) {
                return true;
            }
        }
    })
    .await
    .unwrap();
    assert!(found);

    let frames = parse_frames(&collected);
    let headers_frame = frames
        .iter()
        .find(|(h, _)| h.kind == frame::frame_type::HEADERS)
        .unwrap();
    let decoded = hpack::Decoder::new(4096).decode(&headers_frame.1).unwrap();
    assert_eq!(decoded[0], (":status".to_string(), "204".to_string()));

    driver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn driver_alpn_mismatch_sends_goaway() {
    let (client, server_io) = tokio::io::duplex(16 * 1024);
    let server = Server::new();
    let forwarder = Arc::new(RecordingForwarder::default());

    let (_conn, _engine, driver) = http2::spawn(
        server_io,
        Some("http/1.1".to_string()),
        43,
        "test-peer".to_string(),
        Http2Config {
            address: "examples/http2".to_string(),
            max_message_size: 0,
        },
        forwarder,
        server,
    );

    let (mut client_rx, _client_tx) = tokio::io::split(client);
    let mut collected = Vec::new();
    let mut buf = vec![0u8; 1024];
    let ok = tokio::time::timeout(std::time::Duration::from_secs(3), async {
        loop {
            match client_rx.read(&mut buf).await {
                Ok(0) | Err(_) => return !collected.is_empty(),
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .unwrap();
    assert!(ok);

    let frames = parse_frames(&collected);
    assert_eq!(frames[0].0.kind, frame::frame_type::GOAWAY);
    let code = u32::from_be_bytes(frames[0].1[4..8].try_into().unwrap());
    assert_eq!(code, frame::error_code::PROTOCOL_ERROR);

    driver.stop().await.unwrap();
}
