//! UDP media transports.
//!
//! A UDP publisher gets an RTP/RTCP port pair bound in the configured
//! range; read loops tag incoming datagrams with the track's channel kind
//! and feed them to the pusher queue, exactly as TCP interleaved ingress
//! would. A UDP player gets ephemeral sockets that forward packets to the
//! `client_port` pair from its Transport header.
//!
//! Socket buffer sizing (`SO_RCVBUF`/`SO_SNDBUF`) is left to the OS;
//! configuring it portably needs raw socket options that tokio does not
//! expose.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::media::{ChannelKind, RtpPacket};
use crate::relay::pusher::PusherEvent;

/// Probe attempts before the allocator gives up on the range.
const PORT_ALLOC_ATTEMPTS: usize = 64;

/// Largest UDP datagram we accept.
const MAX_DATAGRAM: usize = 65536;

/// A bound RTP/RTCP socket pair: an even port and the next odd one.
pub struct UdpPair {
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Bind an adjacent even/odd port pair inside `[min, max]` by random
/// probing. Bind exclusivity makes concurrently allocated pairs distinct.
pub async fn allocate_port_pair(port_range: (u16, u16)) -> Result<UdpPair> {
    let (min, max) = port_range;
    if min >= max {
        return Err(Error::ResourceExhausted("udp port range is empty"));
    }
    let span = (max - min) as u32 + 1;
    for _ in 0..PORT_ALLOC_ATTEMPTS {
        let mut rtp_port = min + (rand::random::<u32>() % span) as u16;
        rtp_port &= !1;
        if rtp_port < min {
            rtp_port += 2;
        }
        let Some(rtcp_port) = rtp_port.checked_add(1) else {
            continue;
        };
        if rtp_port < min || rtcp_port > max {
            continue;
        }
        let Ok(rtp) = UdpSocket::bind(("0.0.0.0", rtp_port)).await else {
            continue;
        };
        let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", rtcp_port)).await else {
            continue;
        };
        return Ok(UdpPair {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
            rtp_port,
            rtcp_port,
        });
    }
    Err(Error::ResourceExhausted(
        "no free udp port pair in configured range",
    ))
}

/// Ingress side for a UDP publisher: one port pair per set-up track, each
/// socket pumped into the pusher queue by its own read loop.
pub struct UdpServer {
    audio_ports: Option<(u16, u16)>,
    video_ports: Option<(u16, u16)>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpServer {
    pub fn new() -> Self {
        Self {
            audio_ports: None,
            video_ports: None,
            tasks: Vec::new(),
        }
    }

    /// Bind the audio pair and start its read loops. Idempotent per track.
    pub(crate) async fn setup_audio(
        &mut self,
        ingress: mpsc::Sender<PusherEvent>,
        port_range: (u16, u16),
    ) -> Result<(u16, u16)> {
        if let Some(ports) = self.audio_ports {
            return Ok(ports);
        }
        let pair = allocate_port_pair(port_range).await?;
        let ports = (pair.rtp_port, pair.rtcp_port);
        self.spawn_pair(pair, ChannelKind::AudioMedia, ChannelKind::AudioControl, ingress);
        self.audio_ports = Some(ports);
        Ok(ports)
    }

    /// Bind the video pair and start its read loops. Idempotent per track.
    pub(crate) async fn setup_video(
        &mut self,
        ingress: mpsc::Sender<PusherEvent>,
        port_range: (u16, u16),
    ) -> Result<(u16, u16)> {
        if let Some(ports) = self.video_ports {
            return Ok(ports);
        }
        let pair = allocate_port_pair(port_range).await?;
        let ports = (pair.rtp_port, pair.rtcp_port);
        self.spawn_pair(pair, ChannelKind::VideoMedia, ChannelKind::VideoControl, ingress);
        self.video_ports = Some(ports);
        Ok(ports)
    }

    fn spawn_pair(
        &mut self,
        pair: UdpPair,
        media_kind: ChannelKind,
        control_kind: ChannelKind,
        ingress: mpsc::Sender<PusherEvent>,
    ) {
        self.tasks
            .push(tokio::spawn(read_loop(pair.rtp, media_kind, ingress.clone())));
        self.tasks
            .push(tokio::spawn(read_loop(pair.rtcp, control_kind, ingress)));
    }

    /// Abort the read loops and release the sockets.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.audio_ports = None;
        self.video_ports = None;
    }
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop(socket: Arc<UdpSocket>, kind: ChannelKind, ingress: mpsc::Sender<PusherEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _peer)) => {
                let pack = RtpPacket::new(kind, Bytes::copy_from_slice(&buf[..n]));
                if ingress.send(PusherEvent::Packet(pack)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(kind = %kind, error = %err, "udp read loop ended");
                break;
            }
        }
    }
}

/// Egress side for a UDP player: ephemeral local sockets sending to the
/// client's advertised port pair.
pub struct UdpClient {
    peer_ip: IpAddr,
    audio: Option<UdpTrack>,
    video: Option<UdpTrack>,
}

struct UdpTrack {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    client_rtp: u16,
    client_rtcp: u16,
}

impl UdpClient {
    pub fn new(peer_ip: IpAddr) -> Self {
        Self {
            peer_ip,
            audio: None,
            video: None,
        }
    }

    pub async fn setup_audio(&mut self, client_rtp: u16, client_rtcp: u16) -> Result<()> {
        self.audio = Some(UdpTrack::bind(client_rtp, client_rtcp).await?);
        Ok(())
    }

    pub async fn setup_video(&mut self, client_rtp: u16, client_rtcp: u16) -> Result<()> {
        self.video = Some(UdpTrack::bind(client_rtp, client_rtcp).await?);
        Ok(())
    }

    /// Forward one packet to the matching client port. Packets for tracks
    /// the player never set up are dropped.
    pub async fn send_rtp(&self, pack: &RtpPacket) -> Result<usize> {
        let (track, control) = match pack.kind {
            ChannelKind::AudioMedia => (&self.audio, false),
            ChannelKind::AudioControl => (&self.audio, true),
            ChannelKind::VideoMedia => (&self.video, false),
            ChannelKind::VideoControl => (&self.video, true),
        };
        let Some(track) = track else {
            tracing::trace!(kind = %pack.kind, "udp track not set up, dropping packet");
            return Ok(0);
        };
        let (socket, port) = if control {
            (&track.rtcp, track.client_rtcp)
        } else {
            (&track.rtp, track.client_rtp)
        };
        let n = socket.send_to(&pack.payload, (self.peer_ip, port)).await?;
        Ok(n)
    }
}

impl UdpTrack {
    async fn bind(client_rtp: u16, client_rtcp: u16) -> Result<UdpTrack> {
        Ok(UdpTrack {
            rtp: UdpSocket::bind("0.0.0.0:0").await?,
            rtcp: UdpSocket::bind("0.0.0.0:0").await?,
            client_rtp,
            client_rtcp,
        })
    }
}
