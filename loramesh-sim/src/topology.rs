//! Radio reachability between simulated nodes.

use hashbrown::HashMap;
use loramesh::Duration;

use crate::NodeIndex;

/// Properties of a radio path between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Frame loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Extra delay on top of the frame's airtime.
    pub delay: Duration,
    /// Whether the link is currently active.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            rssi: -90,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set the loss rate, clamped to [0, 1].
    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Which nodes hear each other. Links are symmetric.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(NodeIndex, NodeIndex), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node hears every other node.
    pub fn fully_connected(count: usize, link: Link) -> Self {
        let mut topo = Self::new();
        for a in 0..count {
            for b in a + 1..count {
                topo.add_link(a, b, link.clone());
            }
        }
        topo
    }

    /// Each node hears only its predecessor and successor.
    pub fn chain(count: usize, link: Link) -> Self {
        let mut topo = Self::new();
        for a in 1..count {
            topo.add_link(a - 1, a, link.clone());
        }
        topo
    }

    /// Node 0 is the hub; the others only hear the hub.
    pub fn star(count: usize, link: Link) -> Self {
        let mut topo = Self::new();
        for spoke in 1..count {
            topo.add_link(0, spoke, link.clone());
        }
        topo
    }

    pub fn add_link(&mut self, a: NodeIndex, b: NodeIndex, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: NodeIndex, b: NodeIndex) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: NodeIndex, b: NodeIndex) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// True if a link exists and is active.
    pub fn is_connected(&self, a: NodeIndex, b: NodeIndex) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable from `node` over active links, in index order.
    pub fn neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut result: Vec<NodeIndex> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect();
        result.sort_unstable();
        result
    }

    /// Disable all links crossing between partition groups.
    ///
    /// Nodes not listed in any group are cut off from every group.
    pub fn partition(&mut self, groups: &[Vec<NodeIndex>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all links.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    fn canonical_pair(a: NodeIndex, b: NodeIndex) -> (NodeIndex, NodeIndex) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_connected() {
        let topo = Topology::fully_connected(3, Link::default());
        assert!(topo.is_connected(0, 1));
        assert!(topo.is_connected(2, 0));
        assert!(topo.is_connected(1, 2));
        assert!(!topo.is_connected(1, 1));
    }

    #[test]
    fn test_chain() {
        let topo = Topology::chain(4, Link::default());
        assert!(topo.is_connected(0, 1));
        assert!(topo.is_connected(2, 3));
        assert!(!topo.is_connected(0, 2));
        assert_eq!(topo.neighbors(1), vec![0, 2]);
    }

    #[test]
    fn test_star() {
        let topo = Topology::star(4, Link::default());
        assert_eq!(topo.neighbors(0), vec![1, 2, 3]);
        assert_eq!(topo.neighbors(2), vec![0]);
        assert!(!topo.is_connected(1, 2));
    }

    #[test]
    fn test_partition_and_heal() {
        let mut topo = Topology::fully_connected(4, Link::default());
        topo.partition(&[vec![0, 1], vec![2, 3]]);

        assert!(topo.is_connected(0, 1));
        assert!(topo.is_connected(2, 3));
        assert!(!topo.is_connected(0, 2));
        assert!(!topo.is_connected(1, 3));

        topo.heal();
        assert!(topo.is_connected(0, 3));
    }

    #[test]
    fn test_link_builder_clamps_loss() {
        let link = Link::new().with_loss_rate(1.5).with_rssi(-110);
        assert_eq!(link.loss_rate, 1.0);
        assert_eq!(link.rssi, -110);

        let mut topo = Topology::chain(2, link);
        topo.set_global_loss_rate(-0.5);
        assert_eq!(topo.get_link(1, 0).map(|l| l.loss_rate), Some(0.0));
    }
}
