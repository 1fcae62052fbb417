use serde::{Deserialize, Serialize};

/// Service endpoints of one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,

    /// Plain binary-protocol port.
    #[serde(rename = "binary-port")]
    pub binary_port: u16,

    /// TLS binary-protocol port, when the node offers one.
    #[serde(rename = "ssl-binary-port")]
    pub ssl_binary_port: Option<u16>,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, binary_port: u16) -> Self {
        Self {
            host: host.into(),
            binary_port,
            ssl_binary_port: None,
        }
    }

    /// `host:port` of the binary service, honoring the SSL flag.
    pub fn binary_address(&self, ssl: bool) -> Option<String> {
        if ssl {
            self.ssl_binary_port
                .map(|port| format!("{}:{}", self.host, port))
        } else {
            Some(format!("{}:{}", self.host, self.binary_port))
        }
    }
}

/// One revision of a bucket's topology.
///
/// The vbucket map assigns every partition to the index of its master node,
/// or -1 while the partition is unassigned. Revisions are monotone; consumers
/// ignore configs whose `rev` does not advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub rev: u64,

    pub nodes: Vec<NodeEndpoint>,

    #[serde(rename = "vbucket-map")]
    pub vbucket_map: Vec<i16>,

    /// Forward map published mid-rebalance, when present.
    #[serde(rename = "fast-forward-map", default)]
    pub fast_forward_map: Option<Vec<i16>>,
}

impl BucketConfig {
    pub fn num_partitions(&self) -> u16 {
        self.vbucket_map.len() as u16
    }

    /// Index of the node currently mastering `partition`.
    pub fn master_of(&self, partition: u16, use_fast_forward: bool) -> Option<usize> {
        let map = if use_fast_forward {
            self.fast_forward_map.as_ref().unwrap_or(&self.vbucket_map)
        } else {
            &self.vbucket_map
        };
        match map.get(partition as usize) {
            Some(&index) if index >= 0 && (index as usize) < self.nodes.len() => {
                Some(index as usize)
            }
            _ => None,
        }
    }

    pub fn node_at(&self, index: usize) -> Option<&NodeEndpoint> {
        self.nodes.get(index)
    }

    /// Whether any partition has its primary on the node at `index`.
    pub fn has_primary_partitions_on(&self, index: usize) -> bool {
        self.vbucket_map.iter().any(|&i| i == index as i16)
    }

    /// Partitions mastered by the node at `index`.
    pub fn partitions_of(&self, index: usize) -> Vec<u16> {
        self.vbucket_map
            .iter()
            .enumerate()
            .filter(|(_, &i)| i == index as i16)
            .map(|(p, _)| p as u16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BucketConfig {
        BucketConfig {
            rev: 7,
            nodes: vec![
                NodeEndpoint::new("10.0.0.1", 11210),
                NodeEndpoint::new("10.0.0.2", 11210),
            ],
            vbucket_map: vec![0, 1, 0, -1],
            fast_forward_map: Some(vec![1, 1, 0, 0]),
        }
    }

    #[test]
    fn test_master_of() {
        let cfg = config();
        assert_eq!(Some(0), cfg.master_of(0, false));
        assert_eq!(Some(1), cfg.master_of(1, false));
        assert_eq!(None, cfg.master_of(3, false), "unassigned partition");
        assert_eq!(None, cfg.master_of(9, false), "out of range partition");
        assert_eq!(Some(1), cfg.master_of(0, true), "fast-forward map applies");
    }

    #[test]
    fn test_partition_enumeration() {
        let cfg = config();
        assert!(cfg.has_primary_partitions_on(0));
        assert!(cfg.has_primary_partitions_on(1));
        assert_eq!(vec![0u16, 2], cfg.partitions_of(0));
        assert_eq!(vec![1u16], cfg.partitions_of(1));
        assert_eq!(4, cfg.num_partitions());
    }

    #[test]
    fn test_binary_address() {
        let mut node = NodeEndpoint::new("example.org", 11210);
        assert_eq!(
            Some("example.org:11210".to_owned()),
            node.binary_address(false)
        );
        assert_eq!(None, node.binary_address(true));
        node.ssl_binary_port = Some(11207);
        assert_eq!(
            Some("example.org:11207".to_owned()),
            node.binary_address(true)
        );
    }
}
