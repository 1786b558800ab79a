use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// One back-end shard endpoint, as learnt from the bootstrap node table.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: Role,
    /// Slots this node claims ownership of.
    pub slots: Vec<u16>,
    /// `(slot, destination id)` pairs of slots being handed off.
    pub migrating: Vec<(u16, String)>,
    /// `(slot, source id)` pairs of slots being taken over.
    pub importing: Vec<(u16, String)>,
    /// For a private per-client copy, the shared node it was cloned from.
    /// Clones never share connections with their original.
    pub clone_of: Option<Arc<Node>>,
}

impl Node {
    pub fn is_replica(&self) -> bool {
        self.role == Role::Replica
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid nodes reply: missing flags")]
    MissingFlags,
    #[error("invalid nodes reply: missing addr")]
    MissingAddr,
    #[error("invalid node address '{0}'")]
    BadAddress(String),
    #[error("invalid slot spec '{0}'")]
    BadSlotSpec(String),
}

/// The cluster layout: nodes in table order plus the ordered slot map.
///
/// The slot map stores the *endpoints* of every claimed range in ascending
/// order, and ownership lookup seeks the first entry ≥ the wanted slot, so
/// a slot inside a range resolves to the node owning the range's upper
/// endpoint. Built once at bootstrap and immutable afterwards.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, Arc<Node>>,
    slots: BTreeMap<u16, Arc<Node>>,
}

impl Topology {
    /// Build the topology from the textual node table returned by the
    /// bootstrap query. `entry` is the address the operator pointed the
    /// proxy at; the `myself` line merges into it, keeping the reachable
    /// entry address over whatever the table advertises.
    pub fn from_nodes_reply(
        text: &str,
        entry: Option<(&str, u16)>,
    ) -> Result<Self, TopologyError> {
        let mut topology = Topology::default();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(' ').collect();
            let name = fields[0];
            if fields.len() < 3 {
                return if fields.len() < 2 {
                    Err(TopologyError::MissingAddr)
                } else {
                    Err(TopologyError::MissingFlags)
                };
            }
            let flags = fields[2];
            let primary_id = fields.get(3).copied();
            let myself = flags.contains("myself");

            let (host, port) = match (myself, entry) {
                (true, Some((host, port))) => (host.to_string(), port),
                _ => parse_node_addr(fields[1])?,
            };
            let role = if flags.contains("slave")
                || primary_id.map(|id| !id.starts_with('-')).unwrap_or(false)
            {
                Role::Replica
            } else {
                Role::Primary
            };

            let mut slots = Vec::new();
            let mut claims = Vec::new();
            let mut migrating = Vec::new();
            let mut importing = Vec::new();
            for spec in fields.iter().skip(8) {
                parse_slot_spec(spec, &mut slots, &mut claims, &mut migrating, &mut importing)?;
            }

            let node = Arc::new(Node {
                name: name.to_string(),
                host,
                port,
                role,
                slots,
                migrating,
                importing,
                clone_of: None,
            });
            for claim in claims {
                topology.slots.insert(claim, node.clone());
            }
            topology.by_name.insert(node.name.clone(), node.clone());
            topology.nodes.push(node);
        }
        Ok(topology)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// The node owning `slot`: the first map entry at or above it.
    pub fn node_of_slot(&self, slot: u16) -> Option<&Arc<Node>> {
        self.slots.range(slot..).next().map(|(_, node)| node)
    }

    pub fn node_of_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.by_name.get(name)
    }

    /// The node owning the lowest mapped slot. Keyless commands land here.
    pub fn first_node(&self) -> Option<&Arc<Node>> {
        self.slots.values().next()
    }

    /// Deep-clone for a client's private pool: every node is a fresh,
    /// unconnected copy pointing back at its shared original.
    pub fn clone_private(&self) -> Topology {
        let mut clone = Topology::default();
        for node in &self.nodes {
            let copy = Arc::new(Node {
                name: node.name.clone(),
                host: node.host.clone(),
                port: node.port,
                role: node.role,
                slots: node.slots.clone(),
                migrating: node.migrating.clone(),
                importing: node.importing.clone(),
                clone_of: Some(node.clone()),
            });
            clone.by_name.insert(copy.name.clone(), copy.clone());
            clone.nodes.push(copy);
        }
        for (&slot, node) in &self.slots {
            let copy = clone.by_name[&node.name].clone();
            clone.slots.insert(slot, copy);
        }
        clone
    }
}

fn parse_node_addr(addr: &str) -> Result<(String, u16), TopologyError> {
    // Drop any "@internal-bus-port" suffix.
    let addr = addr.split('@').next().unwrap_or(addr);
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TopologyError::BadAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TopologyError::BadAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

fn parse_slot_spec(
    spec: &str,
    slots: &mut Vec<u16>,
    claims: &mut Vec<u16>,
    migrating: &mut Vec<(u16, String)>,
    importing: &mut Vec<(u16, String)>,
) -> Result<(), TopologyError> {
    let bad = || TopologyError::BadSlotSpec(spec.to_string());
    if let Some(inner) = spec.strip_prefix('[') {
        let inner = inner.strip_suffix(']').unwrap_or(inner);
        if let Some((slot, dest)) = inner.split_once("->-") {
            let slot = slot.parse::<u16>().map_err(|_| bad())?;
            migrating.push((slot, dest.to_string()));
        } else if let Some((slot, src)) = inner.split_once("-<-") {
            let slot = slot.parse::<u16>().map_err(|_| bad())?;
            importing.push((slot, src.to_string()));
        }
        // Anything else inside brackets is ignored.
        return Ok(());
    }
    if let Some((start, stop)) = spec.split_once('-') {
        let start = start.parse::<u16>().map_err(|_| bad())?;
        let stop = stop.parse::<u16>().map_err(|_| bad())?;
        claims.push(start);
        claims.push(stop);
        slots.extend(start..=stop);
    } else {
        let slot = spec.parse::<u16>().map_err(|_| bad())?;
        claims.push(slot);
        slots.push(slot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    fn topology() -> Topology {
        Topology::from_nodes_reply(NODES, Some(("10.0.0.9", 7000))).unwrap()
    }

    #[test]
    fn test_nodes_and_roles() {
        let topology = topology();
        assert_eq!(topology.nodes().len(), 4);
        let replicas = topology
            .nodes()
            .iter()
            .filter(|n| n.is_replica())
            .count();
        assert_eq!(replicas, 1);
    }

    #[test]
    fn test_myself_keeps_entry_address() {
        let topology = topology();
        let myself = topology
            .node_of_name("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
            .unwrap();
        assert_eq!(myself.host, "10.0.0.9");
        assert_eq!(myself.port, 7000);
        // The internal-bus suffix of the other nodes is dropped.
        let other = topology
            .node_of_name("67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1")
            .unwrap();
        assert_eq!((other.host.as_str(), other.port), ("127.0.0.1", 30002));
    }

    #[test]
    fn test_slot_ownership_via_seek() {
        let topology = topology();
        let owner = |slot| topology.node_of_slot(slot).unwrap().port;
        assert_eq!(owner(0), 7000);
        assert_eq!(owner(3000), 7000);
        assert_eq!(owner(5460), 7000);
        assert_eq!(owner(5461), 30002);
        assert_eq!(owner(10922), 30002);
        assert_eq!(owner(10923), 30003);
        assert_eq!(owner(16383), 30003);
    }

    #[test]
    fn test_first_node_is_lowest_slot() {
        let topology = topology();
        assert_eq!(topology.first_node().unwrap().port, 7000);
    }

    #[test]
    fn test_migrating_and_importing_specs() {
        let text = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 127.0.0.1:7001 master - 0 0 1 connected 0-99 [7->-bbbb] [8-<-cccc]
";
        let topology = Topology::from_nodes_reply(text, None).unwrap();
        let node = topology.node_of_slot(50).unwrap();
        assert_eq!(node.migrating, vec![(7, "bbbb".to_string())]);
        assert_eq!(node.importing, vec![(8, "cccc".to_string())]);
        assert_eq!(node.slots.len(), 100);
    }

    #[test]
    fn test_single_slot_spec() {
        let text = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 127.0.0.1:7001 master - 0 0 1 connected 42
";
        let topology = Topology::from_nodes_reply(text, None).unwrap();
        assert_eq!(topology.node_of_slot(42).unwrap().port, 7001);
        assert!(topology.node_of_slot(43).is_none());
    }

    #[test]
    fn test_missing_fields_reject_bootstrap() {
        assert!(matches!(
            Topology::from_nodes_reply("justaname 127.0.0.1:7001\n", None),
            Err(TopologyError::MissingFlags)
        ));
        assert!(matches!(
            Topology::from_nodes_reply("justaname\n", None),
            Err(TopologyError::MissingAddr)
        ));
    }

    #[test]
    fn test_replica_by_primary_id() {
        let text = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 127.0.0.1:7001 master bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb 0 0 1 connected
";
        let topology = Topology::from_nodes_reply(text, None).unwrap();
        assert!(topology.nodes()[0].is_replica());
    }

    #[test]
    fn test_clone_private() {
        let topology = topology();
        let private = topology.clone_private();
        assert_eq!(private.nodes().len(), topology.nodes().len());
        for (clone, original) in private.nodes().iter().zip(topology.nodes()) {
            assert!(Arc::ptr_eq(clone.clone_of.as_ref().unwrap(), original));
            assert!(!Arc::ptr_eq(clone, original));
        }
        // Ownership resolves identically, onto the cloned nodes.
        let owner = private.node_of_slot(5461).unwrap();
        assert_eq!(owner.port, 30002);
        assert!(owner.clone_of.is_some());
    }
}
