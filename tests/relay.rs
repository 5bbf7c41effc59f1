//! End-to-end relay tests: real TCP clients against a server on loopback.
//!
//! Each test starts the server on its own fixed port (bind_addr must be
//! explicit) and drives raw RTSP over the socket.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use rtsp_relay::protocol::auth::digest_response;
use rtsp_relay::{AuthConfig, AuthScheme, RtspServer, ServerConfig};

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=relay\r\n\
    c=IN IP4 0.0.0.0\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:streamid=0\r\n\
    m=audio 0 RTP/AVP 97\r\n\
    a=rtpmap:97 mpeg4-generic/44100/2\r\n\
    a=control:streamid=1\r\n";

const READ_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(port: u16, configure: impl FnOnce(ServerConfig) -> ServerConfig) {
    let config = configure(ServerConfig::with_addr(
        format!("127.0.0.1:{port}").parse().unwrap(),
    ));
    let server = RtspServer::new(config);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    // give the listener a moment to bind
    tokio::time::sleep(Duration::from_millis(100)).await;
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        TestClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Send one request and read the full response (headers + body).
    async fn request(&mut self, text: &str) -> String {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
        self.read_response().await
    }

    async fn read_response(&mut self) -> String {
        let mut response = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("response read timed out")
                .unwrap();
            assert!(n > 0, "connection closed mid-response:\n{response}");
            response.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        if let Some(len) = content_length(&response) {
            if len > 0 {
                let mut body = vec![0u8; len];
                self.reader.read_exact(&mut body).await.unwrap();
                response.push_str(&String::from_utf8_lossy(&body));
            }
        }
        response
    }

    async fn send_frame(&mut self, channel: u8, payload: &[u8]) {
        let len = payload.len() as u16;
        let header = [0x24, channel, (len >> 8) as u8, len as u8];
        self.writer.write_all(&header).await.unwrap();
        self.writer.write_all(payload).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let result = tokio::time::timeout(READ_TIMEOUT, async {
            let mut header = [0u8; 4];
            self.reader.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x24, "expected interleaved frame");
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; len];
            self.reader.read_exact(&mut payload).await.unwrap();
            (header[1], payload)
        })
        .await;
        result.expect("frame read timed out")
    }

    /// The peer closed the connection (possibly after trailing data).
    async fn expect_eof(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), self.reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => continue,
                Err(_) => panic!("expected connection close"),
            }
        }
    }
}

fn content_length(response: &str) -> Option<usize> {
    response
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse().ok())
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&name.to_ascii_lowercase()))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim())
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// RTP packet with payload type 96 (video) or 97 (audio) and one NAL unit
/// (for video) as the codec payload.
fn rtp_packet(payload_type: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x80, payload_type, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn video_keyframe(seq: u16) -> Vec<u8> {
    rtp_packet(96, seq, &[0x65, 0x88, 0x84, 0x00])
}

fn video_slice(seq: u16) -> Vec<u8> {
    rtp_packet(96, seq, &[0x41, 0x9A, 0x00])
}

fn audio_packet(seq: u16) -> Vec<u8> {
    rtp_packet(97, seq, &[0xAF, 0x01, 0x02])
}

fn rtp_seq(payload: &[u8]) -> u16 {
    u16::from_be_bytes([payload[2], payload[3]])
}

/// ANNOUNCE + SETUP both tracks (interleaved 0-1 video, 2-3 audio) + RECORD.
async fn publish(client: &mut TestClient, url: &str) {
    let announce = format!(
        "ANNOUNCE {url} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    let res = client.request(&announce).await;
    assert_eq!(status_of(&res), 200, "ANNOUNCE failed:\n{res}");

    let res = client
        .request(&format!(
            "SETUP {url}/streamid=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 200, "SETUP video failed:\n{res}");

    let res = client
        .request(&format!(
            "SETUP {url}/streamid=1 RTSP/1.0\r\nCSeq: 4\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 200, "SETUP audio failed:\n{res}");

    let res = client
        .request(&format!("RECORD {url} RTSP/1.0\r\nCSeq: 5\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 200, "RECORD failed:\n{res}");
}

/// DESCRIBE + SETUP both tracks + PLAY, then wait for the attach to land.
async fn play(client: &mut TestClient, url: &str) -> String {
    let describe = client
        .request(&format!(
            "DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&describe), 200, "DESCRIBE failed:\n{describe}");

    let res = client
        .request(&format!(
            "SETUP {url}/streamid=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 200, "SETUP video failed:\n{res}");

    let res = client
        .request(&format!(
            "SETUP {url}/streamid=1 RTSP/1.0\r\nCSeq: 4\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 200, "SETUP audio failed:\n{res}");

    let res = client
        .request(&format!("PLAY {url} RTSP/1.0\r\nCSeq: 5\r\nRange: npt=0.000-\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 200, "PLAY failed:\n{res}");

    // the attach runs after the PLAY response; let it land
    tokio::time::sleep(Duration::from_millis(300)).await;
    describe
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_single_publisher_single_player() {
    let port = 28554;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/a");

    let mut publisher = TestClient::connect(port).await;
    let res = publisher
        .request(&format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 200);
    assert!(header_value(&res, "Public").unwrap().contains("ANNOUNCE"));
    publish(&mut publisher, &url).await;

    let mut player = TestClient::connect(port).await;
    let describe = play(&mut player, &url).await;
    // DESCRIBE echoes the publisher's SDP body
    assert!(describe.contains("a=rtpmap:96 H264/90000"));
    assert!(describe.contains("a=rtpmap:97 mpeg4-generic/44100/2"));
    assert!(header_value(&describe, "Content-Type").unwrap().contains("application/sdp"));
    // CSeq echo
    assert_eq!(header_value(&describe, "CSeq"), Some("2"));

    // 50 video (keyframe first) and 50 audio, interleaved
    for seq in 0..50u16 {
        let video = if seq == 0 {
            video_keyframe(0)
        } else {
            video_slice(seq)
        };
        publisher.send_frame(0, &video).await;
        publisher.send_frame(2, &audio_packet(seq)).await;
    }

    // the player sees exactly the same 100 packets, in order, on its own
    // channel numbers
    for seq in 0..50u16 {
        let (channel, payload) = player.read_frame().await;
        assert_eq!(channel, 0, "expected video frame");
        assert_eq!(rtp_seq(&payload), seq);
        let (channel, payload) = player.read_frame().await;
        assert_eq!(channel, 2, "expected audio frame");
        assert_eq!(rtp_seq(&payload), seq);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_late_joiner_starts_at_keyframe() {
    let port = 28555;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/late");

    let mut publisher = TestClient::connect(port).await;
    publish(&mut publisher, &url).await;

    // 200 video packets with keyframes at 0 and 120
    for seq in 0..200u16 {
        let packet = if seq == 0 || seq == 120 {
            video_keyframe(seq)
        } else {
            video_slice(seq)
        };
        publisher.send_frame(0, &packet).await;
    }
    // let the pump drain before the player attaches
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut player = TestClient::connect(port).await;
    play(&mut player, &url).await;

    // primed from the last keyframe: packets 120..200 in order
    for expected in 120..200u16 {
        let (channel, payload) = player.read_frame().await;
        assert_eq!(channel, 0);
        assert_eq!(rtp_seq(&payload), expected);
    }

    // and the live stream continues seamlessly
    publisher.send_frame(0, &video_slice(200)).await;
    let (_, payload) = player.read_frame().await;
    assert_eq!(rtp_seq(&payload), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_takeover_keeps_players() {
    let port = 28556;
    start_server(port, |config| config.close_old(true)).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/x");

    let mut publisher_a = TestClient::connect(port).await;
    publish(&mut publisher_a, &url).await;

    let mut player = TestClient::connect(port).await;
    play(&mut player, &url).await;

    publisher_a.send_frame(0, &video_keyframe(0)).await;
    publisher_a.send_frame(0, &video_slice(1)).await;
    assert_eq!(rtp_seq(&player.read_frame().await.1), 0);
    assert_eq!(rtp_seq(&player.read_frame().await.1), 1);

    // publisher B takes over the path
    let mut publisher_b = TestClient::connect(port).await;
    publish(&mut publisher_b, &url).await;

    // A's session is terminated
    publisher_a.expect_eof().await;

    // the existing player keeps receiving, now from B
    publisher_b.send_frame(0, &video_keyframe(50)).await;
    publisher_b.send_frame(0, &video_slice(51)).await;
    assert_eq!(rtp_seq(&player.read_frame().await.1), 50);
    assert_eq!(rtp_seq(&player.read_frame().await.1), 51);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_digest_auth_challenge_response() {
    let port = 28557;
    start_server(port, |config| {
        config.auth(
            AuthConfig::new(AuthScheme::Digest)
                .publisher("cam", "campass")
                .player("viewer", "viewpass"),
        )
    })
    .await;
    let url = format!("rtsp://127.0.0.1:{port}/live/secure");

    // publisher: unauthenticated ANNOUNCE gets the challenge
    let mut publisher = TestClient::connect(port).await;
    let announce = format!(
        "ANNOUNCE {url} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    let challenge = publisher.request(&announce).await;
    assert_eq!(status_of(&challenge), 401);
    let www = header_value(&challenge, "WWW-Authenticate").unwrap().to_string();
    assert!(www.contains(r#"Digest realm="EasyDarwin""#), "{www}");
    assert!(www.contains(r#"algorithm="MD5""#));
    let nonce = www
        .split("nonce=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();

    // retry with the computed response
    let response = digest_response("cam", "EasyDarwin", "campass", "ANNOUNCE", &url, &nonce);
    let authorized = format!(
        "ANNOUNCE {url} RTSP/1.0\r\nCSeq: 3\r\n\
         Authorization: Digest username=\"cam\", realm=\"EasyDarwin\", nonce=\"{nonce}\", uri=\"{url}\", response=\"{response}\"\r\n\
         Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    let res = publisher.request(&authorized).await;
    assert_eq!(status_of(&res), 200, "authorized ANNOUNCE failed:\n{res}");

    // player: same dance on DESCRIBE
    let mut player = TestClient::connect(port).await;
    let challenge = player
        .request(&format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\n\r\n"))
        .await;
    assert_eq!(status_of(&challenge), 401);
    let www = header_value(&challenge, "WWW-Authenticate").unwrap().to_string();
    let nonce = www
        .split("nonce=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();
    let response = digest_response("viewer", "EasyDarwin", "viewpass", "DESCRIBE", &url, &nonce);
    let res = player
        .request(&format!(
            "DESCRIBE {url} RTSP/1.0\r\nCSeq: 3\r\n\
             Authorization: Digest username=\"viewer\", realm=\"EasyDarwin\", nonce=\"{nonce}\", uri=\"{url}\", response=\"{response}\"\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 200, "authorized DESCRIBE failed:\n{res}");
    assert!(res.contains("a=rtpmap:96 H264/90000"));
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_unknown_setup_control_terminates() {
    let port = 28558;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/bad");

    let mut publisher = TestClient::connect(port).await;
    let announce = format!(
        "ANNOUNCE {url} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    assert_eq!(status_of(&publisher.request(&announce).await), 200);

    let res = publisher
        .request(&format!(
            "SETUP {url}/streamid=9 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
        ))
        .await;
    assert_eq!(status_of(&res), 500);
    assert!(res.contains("UnKown control"), "{res}");

    // non-200/401 terminates the session
    publisher.expect_eof().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_graceful_teardown_keeps_other_players() {
    let port = 28559;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/t");

    let mut publisher = TestClient::connect(port).await;
    publish(&mut publisher, &url).await;

    let mut player_one = TestClient::connect(port).await;
    play(&mut player_one, &url).await;
    let mut player_two = TestClient::connect(port).await;
    play(&mut player_two, &url).await;

    publisher.send_frame(0, &video_keyframe(0)).await;
    assert_eq!(rtp_seq(&player_one.read_frame().await.1), 0);
    assert_eq!(rtp_seq(&player_two.read_frame().await.1), 0);

    // player one leaves politely
    let res = player_one
        .request(&format!("TEARDOWN {url} RTSP/1.0\r\nCSeq: 6\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 200);
    player_one.expect_eof().await;

    // the pusher keeps serving the other player
    publisher.send_frame(0, &video_slice(1)).await;
    assert_eq!(rtp_seq(&player_two.read_frame().await.1), 1);

    // the GOP cache survived the detach: a fresh player is primed from
    // the keyframe
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut player_three = TestClient::connect(port).await;
    play(&mut player_three, &url).await;
    assert_eq!(rtp_seq(&player_three.read_frame().await.1), 0);
    assert_eq!(rtp_seq(&player_three.read_frame().await.1), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_describe_unknown_path_is_404() {
    let port = 28560;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/nothing");

    let mut player = TestClient::connect(port).await;
    let res = player
        .request(&format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 404);
    player.expect_eof().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_duplicate_publish_rejected_without_close_old() {
    let port = 28561;
    start_server(port, |config| config).await;
    let url = format!("rtsp://127.0.0.1:{port}/live/dup");

    let mut publisher_a = TestClient::connect(port).await;
    publish(&mut publisher_a, &url).await;

    let mut publisher_b = TestClient::connect(port).await;
    let announce = format!(
        "ANNOUNCE {url} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    let res = publisher_b.request(&announce).await;
    assert_eq!(status_of(&res), 406, "duplicate publish must be rejected:\n{res}");
    publisher_b.expect_eof().await;

    // the original publisher is untouched
    let res = publisher_a
        .request(&format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 9\r\n\r\n"))
        .await;
    assert_eq!(status_of(&res), 200);
}
