//! Per-connection session driver.
//!
//! Each accepted TCP connection gets one [`Session`]. Its reader task
//! deframes the interleaved stream and fans out to two worker loops: one
//! dispatching RTP packets to the bound pusher, one driving requests
//! through the protocol state machine. Responses and outgoing media share
//! the connection through the handle's serialized writer.
//!
//! Per-request errors become RTSP responses; any response other than 200
//! or 401 stops the session after it is written. Teardown runs exactly
//! once no matter who triggers it (TEARDOWN, read error, idle timeout,
//! takeover, server stop).

mod handle;

pub use handle::{ChannelBindings, MediaInfo, SessionHandle, SessionRole, TransportKind};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Error, Result};
use crate::media::{ChannelKind, RtpPacket};
use crate::protocol::auth::{AuthScheme, Authenticator, CredentialRole};
use crate::protocol::codec::{FrameReader, FrameWriter, Incoming, SessionWriter};
use crate::protocol::message::{Method, Request, Response};
use crate::protocol::sdp::parse_sdp;
use crate::protocol::transport::{insert_server_ports, parse_transport, TransportSpec};
use crate::registry::{AttachOutcome, PusherRegistry};
use crate::relay::{Player, Pusher};
use crate::server::config::ServerConfig;
use crate::server::hooks::{HookContext, RelayHooks};

/// Depth of the reader-to-dispatcher RTP channel: enough to decouple the
/// socket read from pusher queueing without buffering a stream's worth.
const RTP_DISPATCH_DEPTH: usize = 10;

/// Which track a SETUP addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    Audio,
    Video,
}

/// Outcome of the per-request authentication gate.
enum AuthCheck {
    Ok,
    /// Role cannot be inferred from the method: 403.
    MethodError,
    /// 401 with this WWW-Authenticate value.
    Challenge(String),
}

pub struct Session {
    config: Arc<ServerConfig>,
    registry: Arc<PusherRegistry>,
    hooks: Arc<dyn RelayHooks>,
    auth: Option<Arc<Authenticator>>,
    handle: Arc<SessionHandle>,
    /// Digest nonce issued with the last 401, echoed by retries.
    nonce: Option<String>,
}

impl Session {
    /// Split the socket and set up the shared handle. The read half goes
    /// back to the caller so `run` can own the read loop.
    pub(crate) fn new(
        id: u64,
        socket: TcpStream,
        config: Arc<ServerConfig>,
        registry: Arc<PusherRegistry>,
        hooks: Arc<dyn RelayHooks>,
        auth: Option<Arc<Authenticator>>,
    ) -> std::io::Result<(Session, FrameReader<OwnedReadHalf>)> {
        let peer_addr = socket.peer_addr()?;
        let (read_half, write_half) = socket.into_split();
        let reader = FrameReader::new(read_half, config.network_buffer, config.max_request_body);
        let writer: SessionWriter = FrameWriter::new(Box::new(write_half), config.network_buffer);
        let timeout_ms = config.timeout.as_millis() as u64;
        let handle = Arc::new(SessionHandle::new(id, peer_addr, writer, timeout_ms));
        let session = Session {
            config,
            registry,
            hooks,
            auth,
            handle,
            nonce: None,
        };
        Ok((session, reader))
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Drive the session to completion. Returns once the connection is
    /// torn down and both worker loops have exited.
    pub(crate) async fn run(self, mut reader: FrameReader<OwnedReadHalf>) {
        let handle = Arc::clone(&self.handle);
        let registry = Arc::clone(&self.registry);
        let hooks = Arc::clone(&self.hooks);

        let (rtp_tx, mut rtp_rx) = mpsc::channel::<RtpPacket>(RTP_DISPATCH_DEPTH);
        let (req_tx, mut req_rx) = mpsc::channel::<Request>(1);

        // RTP dispatcher: forwards to the bound pusher while this session
        // is still its source. A displaced publisher keeps sending for a
        // moment after takeover; those packets are dropped here.
        let rtp_handle = Arc::clone(&handle);
        let rtp_worker = tokio::spawn(async move {
            while let Some(pack) = rtp_rx.recv().await {
                if rtp_handle.is_stopped() {
                    break;
                }
                let Some(pusher) = rtp_handle.pusher() else {
                    continue;
                };
                if pusher.is_source(rtp_handle.id()) {
                    pusher.queue_rtp(pack).await;
                } else {
                    tracing::debug!(
                        session_id = rtp_handle.id(),
                        "pusher has a new source session, dropping packet"
                    );
                }
            }
        });

        // Request worker: owns the state machine.
        let req_worker = tokio::spawn(async move {
            let mut session = self;
            while let Some(req) = req_rx.recv().await {
                session.handle_request(req).await;
            }
        });

        // Reader loop.
        let mut heartbeat = Instant::now();
        loop {
            if handle.is_stopped() || handle.stop_requested() {
                break;
            }
            let frame = tokio::select! {
                _ = handle.stop_notified() => break,
                frame = read_with_deadline(&mut reader, handle.timeout_ms()) => frame,
            };
            match frame {
                Ok(Incoming::Rtp { channel, payload }) => {
                    handle.set_in_bytes(reader.bytes_read());
                    let kind = handle.bindings().kind_for(channel);
                    let Some(kind) = kind else {
                        tracing::debug!(
                            session_id = handle.id(),
                            channel,
                            "unknown rtp channel, dropping frame"
                        );
                        continue;
                    };
                    if matches!(kind, ChannelKind::AudioMedia | ChannelKind::VideoMedia)
                        && heartbeat.elapsed() >= Duration::from_secs(30)
                    {
                        tracing::debug!(session_id = handle.id(), kind = %kind, "receiving rtp");
                        heartbeat = Instant::now();
                    }
                    if rtp_tx.send(RtpPacket::new(kind, payload)).await.is_err() {
                        break;
                    }
                }
                Ok(Incoming::Request(req)) => {
                    handle.set_in_bytes(reader.bytes_read());
                    if req_tx.send(req).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !handle.path().is_empty() {
                        tracing::info!(
                            session_id = handle.id(),
                            path = %handle.path(),
                            error = %err,
                            "session read ended"
                        );
                    }
                    break;
                }
            }
        }

        shutdown_session(&handle, &registry, hooks.as_ref()).await;
        drop(rtp_tx);
        drop(req_tx);
        let _ = tokio::join!(rtp_worker, req_worker);
    }

    /// Process one request: auth gate, dispatch, response, post-actions.
    async fn handle_request(&mut self, req: Request) {
        if self.handle.is_stopped() && req.method != Method::Teardown {
            return;
        }
        if self.config.debug_log_enable {
            tracing::debug!(session_id = self.handle.id(), "<<<\n{}", req.serialize());
        }
        let cseq = req.cseq().unwrap_or_default().to_string();
        let session_id = self.handle.id().to_string();

        let res = match AssertUnwindSafe(self.dispatch(&req, &cseq)).catch_unwind().await {
            Ok(res) => res,
            Err(_panic) => {
                tracing::error!(
                    session_id = self.handle.id(),
                    method = %req.method,
                    "request handler panicked"
                );
                Response::new(500, "Inner Server Error", &cseq, &session_id)
            }
        };

        if self.config.debug_log_enable {
            tracing::debug!(session_id = self.handle.id(), ">>>\n{}", res.serialize());
        }
        if let Err(err) = self.handle.send_response(&res).await {
            tracing::debug!(
                session_id = self.handle.id(),
                error = %err,
                "response write failed"
            );
            shutdown_session(&self.handle, &self.registry, self.hooks.as_ref()).await;
            return;
        }

        match req.method {
            Method::Play | Method::Record if res.status == 200 => {
                if self.handle.role() == SessionRole::Player {
                    if let (Some(pusher), Some(player)) =
                        (self.handle.pusher(), self.handle.player())
                    {
                        if pusher.has_player(player.id()) {
                            player.set_paused(false);
                        } else {
                            pusher.add_player(player).await;
                        }
                    }
                }
            }
            Method::Teardown => {
                shutdown_session(&self.handle, &self.registry, self.hooks.as_ref()).await;
                return;
            }
            _ => {}
        }

        if res.status != 200 && res.status != 401 {
            tracing::info!(
                session_id = self.handle.id(),
                status = res.status,
                "request failed, stopping session"
            );
            shutdown_session(&self.handle, &self.registry, self.hooks.as_ref()).await;
        }
    }

    async fn dispatch(&mut self, req: &Request, cseq: &str) -> Response {
        let session_id = self.handle.id().to_string();
        let mut res = Response::ok(cseq, &session_id);

        if req.method != Method::Options {
            if let Some(auth) = self.auth.clone() {
                match self.check_auth(&auth, req) {
                    AuthCheck::Ok => {}
                    AuthCheck::MethodError => {
                        res.set_status(403, "Method Error");
                        return res;
                    }
                    AuthCheck::Challenge(challenge) => {
                        res.set_status(401, "Unauthorized");
                        res.set_header("WWW-Authenticate", &challenge);
                        return res;
                    }
                }
            }
        }

        match &req.method {
            Method::Options => {
                res.set_header(
                    "Public",
                    "DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, OPTIONS, ANNOUNCE, RECORD",
                );
            }
            Method::Announce => self.handle_announce(req, &mut res).await,
            Method::Describe => self.handle_describe(req, &mut res).await,
            Method::Setup => self.handle_setup(req, &mut res).await,
            Method::Play => {
                if self.handle.pusher().is_none() {
                    res.set_status(500, "Error Status");
                    return res;
                }
                if let Some(range) = req.header("Range") {
                    res.set_header("Range", range);
                }
            }
            Method::Record => {
                if self.handle.pusher().is_none() {
                    res.set_status(500, "Error Status");
                }
            }
            Method::Pause => match self.handle.player() {
                Some(player) => player.set_paused(true),
                None => res.set_status(500, "Error Status"),
            },
            Method::Teardown => {}
            Method::Extension(_) => {}
        }
        res
    }

    fn check_auth(&mut self, auth: &Authenticator, req: &Request) -> AuthCheck {
        let role = match self.handle.role() {
            SessionRole::Pusher => CredentialRole::Publisher,
            SessionRole::Player => CredentialRole::Player,
            SessionRole::Unknown => match req.method {
                Method::Announce => CredentialRole::Publisher,
                Method::Describe => CredentialRole::Player,
                _ => return AuthCheck::MethodError,
            },
        };

        if let Some(line) = req.header("Authorization") {
            let nonce = self.nonce.as_deref().unwrap_or_default();
            match auth.verify(line, req.method.name(), nonce, role) {
                Ok(()) => return AuthCheck::Ok,
                Err(err) => {
                    tracing::debug!(session_id = self.handle.id(), error = %err, "auth check failed");
                }
            }
        }

        let challenge = match auth.scheme() {
            AuthScheme::Basic => auth.challenge(""),
            AuthScheme::Digest => {
                let nonce = Authenticator::generate_nonce();
                let challenge = auth.challenge(&nonce);
                self.nonce = Some(nonce);
                challenge
            }
        };
        AuthCheck::Challenge(challenge)
    }

    async fn handle_announce(&mut self, req: &Request, res: &mut Response) {
        self.handle.set_role_once(SessionRole::Pusher);
        let path = match Url::parse(&req.uri) {
            Ok(url) => url.path().to_string(),
            Err(_) => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };

        let ctx = HookContext {
            session_id: self.handle.id(),
            peer_addr: self.handle.peer_addr(),
            url: &req.uri,
            path: &path,
        };
        if !self.hooks.on_publish(&ctx) {
            res.set_status(500, "Server not allowed you push stream");
            return;
        }

        let tracks = parse_sdp(&req.body);
        let mut info = MediaInfo {
            path: path.clone(),
            url: req.uri.clone(),
            sdp_raw: req.body.clone(),
            ..Default::default()
        };
        if let Some(audio) = tracks.get("audio") {
            info.audio_control = audio.control.clone();
            info.audio_codec = audio.codec.clone();
            tracing::info!(session_id = self.handle.id(), codec = %info.audio_codec, "audio track");
        }
        if let Some(video) = tracks.get("video") {
            info.video_control = video.control.clone();
            info.video_codec = video.codec.clone();
            tracing::info!(session_id = self.handle.id(), codec = %info.video_codec, "video track");
        }
        self.handle.set_media(info);

        if self.config.close_old {
            match self.registry.try_attach(&path, &self.handle).await {
                AttachOutcome::Attached(pusher) => {
                    self.handle.set_pusher(pusher);
                    return;
                }
                AttachOutcome::Rejected => {
                    tracing::info!(session_id = self.handle.id(), path = %path, "pusher rejected");
                    res.set_status(406, "Not Acceptable");
                    return;
                }
                AttachOutcome::NoPusher => {}
            }
        }

        let pusher = Pusher::new(Arc::clone(&self.handle), self.config.gop_cache_enable);
        if self.registry.add_pusher(Arc::clone(&pusher)).await {
            self.handle.set_pusher(pusher);
        } else {
            tracing::info!(session_id = self.handle.id(), path = %path, "pusher rejected");
            res.set_status(406, "Not Acceptable");
        }
    }

    async fn handle_describe(&mut self, req: &Request, res: &mut Response) {
        self.handle.set_role_once(SessionRole::Player);
        let path = match Url::parse(&req.uri) {
            Ok(url) => url.path().to_string(),
            Err(_) => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };

        let ctx = HookContext {
            session_id: self.handle.id(),
            peer_addr: self.handle.peer_addr(),
            url: &req.uri,
            path: &path,
        };
        if !self.hooks.on_play(&ctx) {
            res.set_status(500, "Server not allowed you pull stream");
            return;
        }

        let Some(pusher) = self.wait_for_pusher(&path).await else {
            res.set_status(404, "NOT FOUND");
            return;
        };

        let player = Player::new(
            Arc::clone(&self.handle),
            path.clone(),
            self.config.player_queue_limit,
            self.config.drop_packet_when_paused,
        );
        self.handle.set_media(MediaInfo {
            path: path.clone(),
            url: req.uri.clone(),
            sdp_raw: pusher.sdp_raw(),
            audio_control: pusher.audio_control(),
            video_control: pusher.video_control(),
            audio_codec: pusher.audio_codec(),
            video_codec: pusher.video_codec(),
        });
        self.handle.set_player(player);
        self.handle.set_pusher(Arc::clone(&pusher));
        // players produce no steady TCP traffic, so drop the idle deadline
        self.handle.clear_timeout();

        res.set_header("Content-Type", "application/sdp");
        res.set_body(&pusher.sdp_raw());
    }

    /// Wait out the configured grace window for a pusher to appear.
    async fn wait_for_pusher(&self, path: &str) -> Option<Arc<Pusher>> {
        if let Some(pusher) = self.registry.get(path).await {
            return Some(pusher);
        }
        let hold = self.config.stream_not_exist_hold;
        if hold.is_zero() {
            return None;
        }
        let deadline = tokio::time::Instant::now() + hold;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Some(pusher) = self.registry.get(path).await {
                return Some(pusher);
            }
        }
        None
    }

    async fn handle_setup(&mut self, req: &Request, res: &mut Response) {
        let Some(transport_header) = req.header("Transport").map(str::to_string) else {
            res.set_status(500, "Invalid Transport");
            return;
        };
        // SETUP before ANNOUNCE or DESCRIBE
        let Some(pusher) = self.handle.pusher() else {
            res.set_status(500, "Error Status");
            return;
        };

        let setup_url = match normalize_url(&req.uri) {
            Ok(url) => url,
            Err(_) => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };
        let media = self.handle.media();
        let audio_path = match resolve_control(&media.audio_control) {
            Ok(path) => path,
            Err(_) => {
                res.set_status(500, "Invalid AControl");
                return;
            }
        };
        let video_path = match resolve_control(&media.video_control) {
            Ok(path) => path,
            Err(_) => {
                res.set_status(500, "Invalid VControl");
                return;
            }
        };

        let track = if control_matches(&setup_url, &audio_path) {
            Track::Audio
        } else if control_matches(&setup_url, &video_path) {
            Track::Video
        } else {
            tracing::info!(
                session_id = self.handle.id(),
                url = %setup_url,
                audio = %audio_path,
                video = %video_path,
                "setup control matched no track"
            );
            res.set_status(500, format!("SETUP got UnKown control:{setup_url}"));
            return;
        };

        let spec = match parse_transport(&transport_header) {
            Ok(spec) => spec,
            Err(err) => {
                res.set_status(500, err.status().1);
                return;
            }
        };

        match spec {
            TransportSpec::Tcp {
                rtp_channel,
                rtcp_channel,
            } => {
                self.handle.set_transport(TransportKind::Tcp);
                match track {
                    Track::Audio => self.handle.bind_audio(rtp_channel, rtcp_channel),
                    Track::Video => self.handle.bind_video(rtp_channel, rtcp_channel),
                }
                res.set_header("Transport", &transport_header);
            }
            TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            } => {
                self.handle.set_transport(TransportKind::Udp);
                // media now flows over UDP; the control connection may idle
                self.handle.clear_timeout();
                let mut transport_out = transport_header.clone();
                match self.handle.role() {
                    SessionRole::Player => {
                        let setup = self
                            .handle
                            .setup_udp_track(track == Track::Audio, client_rtp, client_rtcp)
                            .await;
                        if let Err(err) = setup {
                            res.set_status(500, format!("udp client setup error, {err}"));
                            return;
                        }
                    }
                    SessionRole::Pusher => {
                        let ports = match track {
                            Track::Audio => {
                                pusher.setup_udp_audio(self.config.udp_port_range).await
                            }
                            Track::Video => {
                                pusher.setup_udp_video(self.config.udp_port_range).await
                            }
                        };
                        match ports {
                            Ok((rtp, rtcp)) => {
                                transport_out = insert_server_ports(&transport_out, rtp, rtcp);
                            }
                            Err(err) => {
                                res.set_status(500, format!("udp server setup error, {err}"));
                                return;
                            }
                        }
                    }
                    SessionRole::Unknown => {
                        res.set_status(500, "Error Status");
                        return;
                    }
                }
                res.set_header("Transport", &transport_out);
            }
        }
    }
}

/// Run the session teardown path exactly once.
///
/// A pusher session releases its pusher only while it is still the active
/// source; a session displaced by takeover leaves the pusher (and its
/// players) alone. A player session detaches from its pusher.
pub(crate) async fn shutdown_session(
    handle: &Arc<SessionHandle>,
    registry: &PusherRegistry,
    hooks: &dyn RelayHooks,
) {
    if !handle.mark_stopped() {
        return;
    }
    tracing::info!(
        session_id = handle.id(),
        role = %handle.role(),
        path = %handle.path(),
        "session stopping"
    );
    hooks.on_session_close(handle.id(), handle.peer_addr());

    match handle.role() {
        SessionRole::Pusher => {
            if let Some(pusher) = handle.take_pusher() {
                if pusher.is_source(handle.id()) {
                    registry.remove_pusher(&pusher).await;
                    pusher.shutdown().await;
                } else {
                    tracing::debug!(
                        session_id = handle.id(),
                        "pusher has a new source session, leaving it running"
                    );
                }
            }
        }
        SessionRole::Player => {
            let player = handle.take_player();
            let pusher = handle.take_pusher();
            if let Some(player) = player {
                if let Some(pusher) = pusher {
                    pusher.remove_player(player.id());
                }
                player.stop();
            }
        }
        SessionRole::Unknown => {
            handle.take_pusher();
            handle.take_player();
        }
    }

    handle.close_udp_client().await;
    handle.flush_writer().await;
    // wake the reader loop if teardown came from another task
    handle.request_stop();
}

async fn read_with_deadline(
    reader: &mut FrameReader<OwnedReadHalf>,
    timeout_ms: u64,
) -> Result<Incoming> {
    if timeout_ms == 0 {
        return reader.read_frame().await;
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms), reader.read_frame()).await {
        Ok(frame) => frame,
        Err(_) => Err(Error::Timeout),
    }
}

/// Normalize an RTSP URL, inserting the default port 554 when absent.
fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|_| Error::InvalidUrl(raw.to_string()))?;
    if url.port().is_none() {
        url.set_port(Some(554))
            .map_err(|_| Error::InvalidUrl(raw.to_string()))?;
    }
    Ok(url.to_string())
}

/// Resolve a track control to its comparable form: full `rtsp://` controls
/// are normalized like request URLs, anything else is compared verbatim.
fn resolve_control(control: &str) -> Result<String> {
    if control.to_ascii_lowercase().starts_with("rtsp://") {
        normalize_url(control)
    } else {
        Ok(control.to_string())
    }
}

/// A SETUP URL addresses a track when it equals the control or ends with
/// `/<control>`.
fn control_matches(setup_url: &str, control: &str) -> bool {
    !control.is_empty()
        && (setup_url == control || setup_url.ends_with(&format!("/{control}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_inserts_default_port() {
        assert_eq!(
            normalize_url("rtsp://host/live/a").unwrap(),
            "rtsp://host:554/live/a"
        );
        assert_eq!(
            normalize_url("rtsp://host:8554/live/a").unwrap(),
            "rtsp://host:8554/live/a"
        );
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_control_matching_by_suffix() {
        let setup = "rtsp://host:554/live/a/streamid=0";
        assert!(control_matches(setup, "streamid=0"));
        assert!(!control_matches(setup, "streamid=1"));
        assert!(control_matches(setup, setup));
        assert!(!control_matches(setup, ""));
    }

    #[test]
    fn test_control_match_requires_segment_boundary() {
        // "id=0" is a suffix of the path but not a path segment
        assert!(!control_matches("rtsp://host:554/live/a/streamid=0", "id=0"));
    }

    #[test]
    fn test_resolve_full_url_control() {
        assert_eq!(
            resolve_control("rtsp://192.168.1.64/trackID=1").unwrap(),
            "rtsp://192.168.1.64:554/trackID=1"
        );
        assert_eq!(resolve_control("streamid=0").unwrap(), "streamid=0");
        assert_eq!(resolve_control("").unwrap(), "");
    }
}
