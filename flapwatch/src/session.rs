use chrono::Utc;
use core::net::IpAddr;
use metrics::gauge;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub remote: SocketAddr,
    pub established: i64,
    pub peers: Vec<IpAddr>,
}

/// BMP sessions currently connected.
#[derive(Debug, Clone, Default)]
pub struct Sessions {
    inner: Arc<RwLock<HashMap<SocketAddr, SessionInfo>>>,
}

impl Sessions {
    pub fn new() -> Sessions {
        Sessions::default()
    }

    pub fn open(&self, remote: SocketAddr) {
        let mut sessions = self.inner.write();
        sessions.insert(
            remote,
            SessionInfo {
                remote,
                established: Utc::now().timestamp(),
                peers: Vec::new(),
            },
        );
        gauge!("flapwatch_bmp_sessions").set(sessions.len() as f64);
    }

    pub fn close(&self, remote: &SocketAddr) {
        let mut sessions = self.inner.write();
        sessions.remove(remote);
        gauge!("flapwatch_bmp_sessions").set(sessions.len() as f64);
    }

    pub fn set_peers<'a>(&self, remote: &SocketAddr, peers: impl Iterator<Item = &'a IpAddr>) {
        let mut sessions = self.inner.write();
        if let Some(session) = sessions.get_mut(remote) {
            let peers: BTreeSet<IpAddr> = peers.copied().collect();
            session.peers = peers.into_iter().collect();
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.read();
        let mut list: Vec<SessionInfo> = sessions.values().cloned().collect();
        list.sort_by_key(|session| session.remote);
        list
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}
