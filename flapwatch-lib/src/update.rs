use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Ordered list of AS numbers a route traversed.
pub type AsPath = Vec<u32>;

/// One announce or withdraw received from a BGP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub prefix: IpNet,
    pub path_id: u32,
    pub as_path: AsPath,
    pub is_withdrawal: bool,
}

impl RouteUpdate {
    pub fn announce(prefix: IpNet, path_id: u32, as_path: AsPath) -> RouteUpdate {
        RouteUpdate {
            prefix,
            path_id,
            as_path,
            is_withdrawal: false,
        }
    }

    pub fn withdraw(prefix: IpNet, path_id: u32) -> RouteUpdate {
        RouteUpdate {
            prefix,
            path_id,
            as_path: Vec::new(),
            is_withdrawal: true,
        }
    }
}

/// Emitted by the route table when the observable state of a prefix changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub prefix: IpNet,
    pub is_withdrawal: bool,
    /// Path that was replaced or removed.
    pub previous_path: AsPath,
}
