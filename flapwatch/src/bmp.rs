use anyhow::Result;
use bgpkit_parser::bmp::messages::{BmpMessage, PerPeerFlags};
use bgpkit_parser::models::{AsPath, AsPathSegment, BgpMessage, BgpUpdateMessage, NetworkPrefix};
use bgpkit_parser::parse_bmp_msg;
use bgpkit_parser::parser::bmp::messages::BmpMessageBody;
use bytes::Bytes;
use core::net::IpAddr;
use metrics::counter;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error, info, trace};

use flapwatch_lib::queue::{bounded, QueueSender, ShedPolicy};
use flapwatch_lib::route_table::track_routes;
use flapwatch_lib::update::{PathChange, RouteUpdate};

use crate::config::BMPConfig;
use crate::session::Sessions;

pub fn new_path(path: Option<AsPath>) -> Vec<u32> {
    match path {
        Some(mut path) => {
            let mut constructed_path: Vec<u32> = Vec::new();
            path.coalesce();
            for segment in path.into_segments_iter() {
                if let AsPathSegment::AsSequence(dedup_asns) = segment {
                    for asn in dedup_asns {
                        constructed_path.push(asn.to_u32());
                    }
                }
            }
            constructed_path
        }
        None => Vec::new(),
    }
}

/// Announces and withdrawals carried by one BGP UPDATE, including MP_REACH
/// and MP_UNREACH NLRI.
pub fn route_updates(update: BgpUpdateMessage) -> Vec<RouteUpdate> {
    let as_path = new_path(update.attributes.as_path().cloned());

    let announced = update.announced_prefixes.iter().chain(
        update
            .attributes
            .get_reachable_nlri()
            .map(|nlri| nlri.prefixes.iter())
            .into_iter()
            .flatten(),
    );
    let withdrawn = update.withdrawn_prefixes.iter().chain(
        update
            .attributes
            .get_unreachable_nlri()
            .map(|nlri| nlri.prefixes.iter())
            .into_iter()
            .flatten(),
    );

    announced
        .map(|prefix: &NetworkPrefix| {
            RouteUpdate::announce(prefix.prefix, prefix.path_id.unwrap_or(0), as_path.clone())
        })
        .chain(withdrawn.map(|prefix: &NetworkPrefix| {
            RouteUpdate::withdraw(prefix.prefix, prefix.path_id.unwrap_or(0))
        }))
        .collect()
}

/// One routing view of a monitored peer. Pre- and post-policy, Adj-RIB-In
/// and Adj-RIB-Out streams of the same peer carry different paths for the
/// same routes, so each gets its own route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PeerView {
    peer_ip: IpAddr,
    is_post_policy: bool,
    is_adj_rib_out: bool,
}

impl PeerView {
    fn new(peer_ip: IpAddr, peer_flags: PerPeerFlags) -> PeerView {
        let (is_post_policy, is_adj_rib_out) = match peer_flags {
            PerPeerFlags::PeerFlags(flags) => (flags.is_post_policy(), flags.is_adj_rib_out()),
            PerPeerFlags::LocalRibPeerFlags(_) => (false, false),
        };
        PeerView {
            peer_ip,
            is_post_policy,
            is_adj_rib_out,
        }
    }
}

impl fmt::Display for PeerView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.peer_ip,
            if self.is_post_policy { "post-policy" } else { "pre-policy" },
            if self.is_adj_rib_out { "adj-rib-out" } else { "adj-rib-in" }
        )
    }
}

/// Route trackers of the peer views monitored over one BMP session.
struct Peers {
    socket: SocketAddr,
    trackers: HashMap<PeerView, QueueSender<RouteUpdate>>,
}

impl Peers {
    fn new(socket: SocketAddr) -> Peers {
        Peers {
            socket,
            trackers: HashMap::new(),
        }
    }

    fn tracker(
        &mut self,
        view: PeerView,
        cfg: &BMPConfig,
        path_changes: &QueueSender<PathChange>,
        guard: &ShutdownGuard,
    ) -> &QueueSender<RouteUpdate> {
        let socket = self.socket;
        self.trackers.entry(view).or_insert_with(|| {
            let (tx, rx) = bounded(
                "bmp_updates",
                cfg.queue_capacity,
                ShedPolicy::Above {
                    high_water: cfg.queue_high_water,
                    burst: cfg.shed_burst,
                },
            );
            let name = format!("{} - {}", socket, view);
            let path_changes = path_changes.clone();
            let import_limit = cfg.import_limit;
            let task_guard = guard.clone();
            guard.spawn_task(async move {
                if let Err(e) =
                    track_routes(name.clone(), rx, path_changes, import_limit, task_guard).await
                {
                    debug!("{} - route tracker stopped: {}", name, e);
                }
            });
            tx
        })
    }

    /// Hands updates to the view's tracker. Returns whether the view is new.
    ///
    /// A view cut off by the import limit stays registered with its closed
    /// queue, so its updates are ignored until the peer goes down.
    fn dispatch(
        &mut self,
        view: PeerView,
        updates: Vec<RouteUpdate>,
        cfg: &BMPConfig,
        path_changes: &QueueSender<PathChange>,
        guard: &ShutdownGuard,
    ) -> bool {
        let known_views = self.trackers.len();
        let tracker = self.tracker(view, cfg, path_changes, guard);
        if tracker.is_closed() {
            trace!("{} - tracker closed, {} updates ignored", view, updates.len());
        } else {
            for update in updates {
                tracker.offer(update);
            }
        }
        self.trackers.len() != known_views
    }

    /// Dropping the senders ends the trackers of every view of the peer,
    /// together with their tables.
    fn remove(&mut self, peer_ip: &IpAddr) -> bool {
        let known_views = self.trackers.len();
        self.trackers.retain(|view, _| view.peer_ip != *peer_ip);
        self.trackers.len() != known_views
    }

    fn peer_ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.trackers.keys().map(|view| &view.peer_ip)
    }
}

pub async fn handle(
    stream: &mut TcpStream,
    cfg: BMPConfig,
    sessions: Sessions,
    path_changes: QueueSender<PathChange>,
    guard: ShutdownGuard,
) -> Result<()> {
    // Get router IP information
    let socket = stream.peer_addr()?;
    info!("{}: session established", socket);
    sessions.open(socket);

    let mut peers = Peers::new(socket);
    let result = read_messages(
        stream,
        &cfg,
        &sessions,
        &path_changes,
        &mut peers,
        &guard,
    )
    .await;

    sessions.close(&socket);
    info!(
        "{}: session closed, {} monitored peer views dropped",
        socket,
        peers.trackers.len()
    );
    result
}

async fn read_messages(
    stream: &mut TcpStream,
    cfg: &BMPConfig,
    sessions: &Sessions,
    path_changes: &QueueSender<PathChange>,
    peers: &mut Peers,
    guard: &ShutdownGuard,
) -> Result<()> {
    let socket = peers.socket;

    loop {
        // Wait for the stream to be readable
        tokio::select! {
            _ = guard.cancelled() => return Ok(()),
            readable = stream.readable() => readable?,
        }

        // Get minimal packet length to get how many bytes to remove from the socket
        let mut common_header = [0; 6];
        let n_bytes_peeked = stream.peek(&mut common_header).await?;
        if n_bytes_peeked == 0 {
            return Ok(());
        }
        if n_bytes_peeked != 6 {
            trace!("{}: incomplete peek", socket);
            trace!("{}: {:02x?}", socket, common_header);
            continue;
        }

        // Get the message version from the `Version` BMP field
        let message_version = common_header[0];
        if message_version != 3 {
            let error_message = "not supported BMP message version";
            error!("{}: {}", socket, error_message);
            trace!("{}: {:02x?}", socket, common_header);
            anyhow::bail!(error_message);
        }

        // Get the message length from the `Message Length` BMP field
        let packet_length = u32::from_be_bytes([
            common_header[1],
            common_header[2],
            common_header[3],
            common_header[4],
        ]);
        let packet_length = usize::try_from(packet_length)?;
        if packet_length == 0 {
            let error_message = "invalid BMP message length";
            error!("{}: {}", socket, error_message);
            trace!("{}: {:02x?}", socket, common_header);
            anyhow::bail!(error_message);
        }

        // Get the message type from the `Message Type` BMP field
        let message_type = common_header[5];
        if message_type > 6 {
            let error_message = "not supported BMP message type";
            error!("{}: {}", socket, error_message);
            trace!("{}: {:02x?}", socket, common_header);
            anyhow::bail!(error_message);
        }

        // Exactly read the number of bytes found in the BMP message
        let mut buffer = vec![0; packet_length];
        stream.read_exact(&mut buffer).await?;
        trace!("{}: {:02x?}", socket, buffer);
        let mut buffer = Bytes::from(buffer);

        let message = match parse_bmp_msg(&mut buffer) {
            Ok(message) => message,
            Err(_) => {
                error!("{}: failed to parse BMP message", socket);
                continue;
            }
        };
        counter!("flapwatch_bmp_messages_total").increment(1);

        process_bmp_message(message, cfg, sessions, path_changes, peers, guard);
    }
}

fn process_bmp_message(
    message: BmpMessage,
    cfg: &BMPConfig,
    sessions: &Sessions,
    path_changes: &QueueSender<PathChange>,
    peers: &mut Peers,
    guard: &ShutdownGuard,
) {
    let socket = peers.socket;
    let BmpMessage {
        per_peer_header,
        message_body,
        ..
    } = message;

    match message_body {
        BmpMessageBody::RouteMonitoring(body) => {
            let Some(pph) = per_peer_header else {
                error!("{}: RouteMonitoring - no per-peer header", socket);
                return;
            };
            let BgpMessage::Update(update) = body.bgp_message else {
                return;
            };

            let updates = route_updates(update);
            if updates.is_empty() {
                return;
            }

            let view = PeerView::new(pph.peer_ip, pph.peer_flags);
            if peers.dispatch(view, updates, cfg, path_changes, guard) {
                sessions.set_peers(&socket, peers.peer_ips());
            }
        }
        BmpMessageBody::PeerUpNotification(_) => {
            if let Some(pph) = per_peer_header {
                debug!("{}: PeerUpNotification - {}", socket, pph.peer_ip);
            }
        }
        BmpMessageBody::PeerDownNotification(_) => {
            let Some(pph) = per_peer_header else {
                error!("{}: PeerDownNotification - no per-peer header", socket);
                return;
            };
            debug!("{}: PeerDownNotification - {}", socket, pph.peer_ip);
            if peers.remove(&pph.peer_ip) {
                sessions.set_peers(&socket, peers.peer_ips());
            }
        }
        BmpMessageBody::InitiationMessage(_) => {
            debug!("{}: InitiationMessage", socket);
        }
        BmpMessageBody::TerminationMessage(_) => {
            info!("{}: TerminationMessage", socket);
        }
        _ => {
            trace!("{}: ignored BMP message", socket);
        }
    }
}
