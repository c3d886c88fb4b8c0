//! The k-bucket routing table keyed on our own node ID.
use super::node::Node;
use super::node::NodeId;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;

/// A bucket is refreshed when it has seen no traffic for this long.
pub const BUCKET_LONELY_AFTER: Duration = Duration::from_secs(3600);

fn xor(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn or(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] | b[i];
    }
    out
}

fn shift_right(value: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    let mut carry = 0u8;
    for i in 0..20 {
        out[i] = (value[i] >> 1) | (carry << 7);
        carry = value[i] & 1;
    }
    out
}

/// One range of the ID space, holding up to `ksize` live nodes ordered
/// least-recently-seen first, plus a replacement cache.
///
/// Bounds are inclusive. Midpoint splits keep every bucket an aligned
/// power-of-two block, so `lo ^ hi` is always a contiguous low-bit mask;
/// the bucket set partitions the whole ID space.
#[derive(Debug, Clone)]
pub struct Bucket {
    lo: [u8; 20],
    hi: [u8; 20],
    ksize: usize,
    nodes: Vec<Node>,
    replacements: Vec<Node>,
    last_updated: Instant,
}

impl Bucket {
    pub fn new(lo: [u8; 20], hi: [u8; 20], ksize: usize) -> Self {
        Self {
            lo,
            hi,
            ksize,
            nodes: Vec::new(),
            replacements: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    fn all_of_id_space(ksize: usize) -> Self {
        Self::new([0u8; 20], [0xffu8; 20], ksize)
    }

    /// Rebuilds a bucket from a state snapshot.
    pub fn restore(
        lo: [u8; 20],
        hi: [u8; 20],
        ksize: usize,
        nodes: Vec<Node>,
        age: std::time::Duration,
    ) -> Self {
        let mut bucket = Self::new(lo, hi, ksize);
        for node in nodes.into_iter().take(ksize) {
            bucket.nodes.push(node);
        }
        bucket.set_age(age);
        bucket
    }

    pub fn lo(&self) -> &[u8; 20] {
        &self.lo
    }

    pub fn hi(&self) -> &[u8; 20] {
        &self.hi
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn covers(&self, id: &NodeId) -> bool {
        self.lo <= id.0 && id.0 <= self.hi
    }

    pub fn age(&self) -> Duration {
        self.last_updated.elapsed()
    }

    pub fn set_age(&mut self, age: Duration) {
        self.last_updated = Instant::now()
            .checked_sub(age)
            .unwrap_or_else(Instant::now);
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    /// A uniformly random ID inside this bucket's range, used as the
    /// target of a refresh lookup.
    pub fn random_id(&self) -> NodeId {
        let mask = xor(&self.lo, &self.hi);
        let random = NodeId::random();
        let mut id = self.lo;
        for i in 0..20 {
            id[i] |= random.0[i] & mask[i];
        }
        NodeId(id)
    }

    /// Splits at the range midpoint, redistributing live nodes and the
    /// replacement cache.
    fn split(self) -> (Bucket, Bucket) {
        let mask = xor(&self.lo, &self.hi);
        let lower_half = shift_right(&mask);
        let left_hi = or(&self.lo, &lower_half);
        // right side starts where the distinguishing bit flips on
        let mut right_lo = [0u8; 20];
        for i in 0..20 {
            right_lo[i] = self.lo[i] | (mask[i] & !lower_half[i]);
        }

        let mut left = Bucket::new(self.lo, left_hi, self.ksize);
        let mut right = Bucket::new(right_lo, self.hi, self.ksize);
        left.last_updated = self.last_updated;
        right.last_updated = self.last_updated;
        for node in self.nodes {
            let side = if left.covers(&node.id) { &mut left } else { &mut right };
            side.nodes.push(node);
        }
        for node in self.replacements {
            let side = if left.covers(&node.id) { &mut left } else { &mut right };
            side.replacements.push(node);
        }
        (left, right)
    }

    /// Inserts or refreshes a node. Returns `false` when the bucket is
    /// full and the node is not already a member.
    fn add_node(&mut self, node: Node) -> bool {
        self.touch();
        if let Some(position) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(position);
            self.nodes.push(node);
            return true;
        }
        if self.nodes.len() < self.ksize {
            self.nodes.push(node);
            return true;
        }
        false
    }

    fn add_replacement(&mut self, node: Node) {
        self.replacements.retain(|n| n.id != node.id);
        self.replacements.push(node);
        if self.replacements.len() > self.ksize {
            self.replacements.remove(0);
        }
    }

    /// Drops a node and promotes the freshest replacement into the live
    /// set.
    fn remove_node(&mut self, id: &NodeId) {
        self.replacements.retain(|n| n.id != *id);
        if let Some(position) = self.nodes.iter().position(|n| n.id == *id) {
            self.nodes.remove(position);
            if let Some(replacement) = self.replacements.pop() {
                self.nodes.push(replacement);
            }
        }
    }

    fn least_recently_seen(&self) -> Option<&Node> {
        self.nodes.first()
    }
}

/// Ordered list of buckets partitioning the 160-bit ID space.
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    ksize: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, ksize: usize) -> Self {
        Self {
            our_id,
            ksize,
            buckets: vec![Bucket::all_of_id_space(ksize)],
        }
    }

    /// Rebuilds a table from snapshot buckets; falls back to a fresh
    /// table when the snapshot held none.
    pub fn from_buckets(our_id: NodeId, ksize: usize, buckets: Vec<Bucket>) -> Self {
        if buckets.is_empty() {
            return Self::new(our_id, ksize);
        }
        Self {
            our_id,
            ksize,
            buckets,
        }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.covers(id))
            .expect("buckets partition the ID space")
    }

    pub fn is_new_node(&self, id: &NodeId) -> bool {
        let bucket = &self.buckets[self.bucket_index(id)];
        !bucket.nodes().iter().any(|n| n.id == *id)
    }

    /// Adds a contact. When the target bucket is full and does not cover
    /// our own ID, the newcomer goes to the replacement cache and the
    /// least-recently-seen live node is returned so the caller can ping
    /// it (and evict it via [`remove_contact`] if it stays silent).
    ///
    /// [`remove_contact`]: RoutingTable::remove_contact
    pub fn add_contact(&mut self, node: Node) -> Option<Node> {
        loop {
            let index = self.bucket_index(&node.id);
            if self.buckets[index].add_node(node.clone()) {
                return None;
            }
            if self.buckets[index].covers(&self.our_id) {
                debug!(bucket = index, "splitting full bucket");
                let (left, right) = self.buckets.remove(index).split();
                self.buckets.insert(index, right);
                self.buckets.insert(index, left);
                continue;
            }
            let bucket = &mut self.buckets[index];
            let stale = bucket.least_recently_seen().cloned();
            bucket.add_replacement(node);
            return stale;
        }
    }

    pub fn remove_contact(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        self.buckets[index].remove_node(id);
    }

    /// The `k` table members nearest `target` by XOR distance.
    pub fn find_neighbors(&self, target: &NodeId, k: usize, exclude: Option<&NodeId>) -> Vec<Node> {
        let mut nodes: Vec<&Node> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes())
            .filter(|node| Some(&node.id) != exclude)
            .collect();
        nodes.sort_by_key(|node| target.distance(&node.id));
        nodes.into_iter().take(k).cloned().collect()
    }

    /// Buckets that have not seen traffic for an hour; these drive the
    /// periodic refresh.
    pub fn lonely_buckets(&self) -> Vec<&Bucket> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.age() >= BUCKET_LONELY_AFTER)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::net::SocketAddrV4;

    fn node_with_prefix(prefix: u8, suffix: u8) -> Node {
        let mut id = [0u8; 20];
        id[0] = prefix;
        id[19] = suffix;
        Node::new(
            NodeId(id),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000 + suffix as u16),
        )
    }

    #[test]
    fn buckets_partition_after_splits() {
        // our id sits at zero, so the low bucket keeps splitting
        let mut table = RoutingTable::new(NodeId([0u8; 20]), 2);
        for i in 0..32u8 {
            table.add_contact(node_with_prefix(i.wrapping_mul(8), i));
        }

        let buckets = table.buckets();
        assert_eq!(buckets[0].lo(), &[0u8; 20]);
        assert_eq!(buckets.last().unwrap().hi(), &[0xffu8; 20]);
        for pair in buckets.windows(2) {
            let mut expected_lo = *pair[0].hi();
            // inclusive bounds: next lo is hi + 1
            for byte in expected_lo.iter_mut().rev() {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                if !overflow {
                    break;
                }
            }
            assert_eq!(pair[1].lo(), &expected_lo);
        }
    }

    #[test]
    fn full_foreign_bucket_reports_stale_node() {
        let mut our_id = [0u8; 20];
        our_id[0] = 0xff;
        let mut table = RoutingTable::new(NodeId(our_id), 2);
        // force a split so a bucket not covering our id exists
        table.add_contact(node_with_prefix(0xfe, 1));
        table.add_contact(node_with_prefix(0xfd, 2));
        table.add_contact(node_with_prefix(0x01, 3));
        table.add_contact(node_with_prefix(0x02, 4));

        // fill the low bucket beyond ksize
        let mut stale = None;
        for suffix in 5..10 {
            stale = table.add_contact(node_with_prefix(0x03, suffix));
            if stale.is_some() {
                break;
            }
        }
        let stale = stale.expect("full bucket should nominate its oldest node");
        assert!(!table.is_new_node(&stale.id));

        // silence: evict it; the replacement cache refills the slot
        table.remove_contact(&stale.id);
        assert!(table.is_new_node(&stale.id));
    }

    #[test]
    fn re_adding_known_node_refreshes_it() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]), 8);
        let node = node_with_prefix(1, 1);
        assert!(table.add_contact(node.clone()).is_none());
        assert!(table.add_contact(node.clone()).is_none());
        assert!(!table.is_new_node(&node.id));
    }

    #[test]
    fn find_neighbors_returns_k_nearest() {
        let mut table = RoutingTable::new(NodeId([0u8; 20]), 8);
        for i in 1..=10u8 {
            table.add_contact(node_with_prefix(i, i));
        }
        let mut target = [0u8; 20];
        target[0] = 3;
        let neighbors = table.find_neighbors(&NodeId(target), 3, None);
        assert_eq!(neighbors.len(), 3);
        assert_eq!(neighbors[0].id.0[0], 3);

        // nearest by XOR to 3 are 3 (d=0), 2 (d=1), 1 (d=2)
        let firsts: Vec<u8> = neighbors.iter().map(|n| n.id.0[0]).collect();
        assert_eq!(firsts, vec![3, 2, 1]);

        let excluded = table.find_neighbors(&NodeId(target), 3, Some(&neighbors[0].id));
        assert!(excluded.iter().all(|n| n.id.0[0] != 3));
    }

    #[test]
    fn random_id_stays_in_bucket_range() {
        let bucket = Bucket::new([0u8; 20], [0xffu8; 20], 8);
        for _ in 0..32 {
            let id = bucket.random_id();
            assert!(bucket.covers(&id));
        }
    }
}
