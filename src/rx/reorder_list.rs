//! Reassembly of a single payload from packets that arrive in arbitrary order.
//!
//! Received packets are kept in intervals of consecutive sequence numbers, ordered by sequence
//!  number. A new packet either extends an interval at one of its ends, or becomes an interval of
//!  its own. When a packet closes the gap between two intervals, they are merged, so the payload is
//!  complete when a single interval is left.
//!
//! ```ascii
//! arrival order 2, 7, 6, 4, 5, 0, 1, 3:
//!
//!   2      [2]
//!   7      [2] [7]
//!   6      [2] [6-7]
//!   4      [2] [4] [6-7]
//!   5      [2] [4-7]
//!   0      [0] [2] [4-7]
//!   1      [0-2] [4-7]
//!   3      [0-7]
//! ```
//!
//! Intervals live in an arena owned by the payload and reference their neighbors by index.

use std::collections::VecDeque;
use std::mem;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::error::CdiResult;
use crate::pool::PoolItem;
use crate::rx::RxPools;
use crate::sgl::SgList;

/// A piece of received payload data, accounted for by the fragment pool
#[derive(Debug, Default)]
pub struct MemoryFragment {
    pub data: Bytes,
}

impl PoolItem for MemoryFragment {
    fn reset(&mut self) {
        self.data = Bytes::new();
    }
}

/// A gap-free run of sequence numbers, together with the fragments of those packets in order
#[derive(Debug, Default)]
pub struct ReorderInterval {
    pub top_sequence_num: u32,
    pub bot_sequence_num: u32,
    fragments: VecDeque<MemoryFragment>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl PoolItem for ReorderInterval {
    fn reset(&mut self) {
        debug_assert!(self.fragments.is_empty(), "interval returned to pool with fragments still attached");
        self.top_sequence_num = 0;
        self.bot_sequence_num = 0;
        self.fragments.clear();
        self.prev = None;
        self.next = None;
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ReorderInsert {
    /// The packet was added, contributing this many payload bytes
    Added(usize),
    /// The sequence number was received before. The packet was not added.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct PacketReorderList {
    /// slots of intervals that were freed hold a default value and are listed in `free_slots`
    nodes: Vec<ReorderInterval>,
    free_slots: Vec<usize>,
    head: Option<usize>,
}

impl PacketReorderList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// A payload is complete when all of its packets were merged into a single interval
    pub fn is_complete(&self) -> bool {
        match self.head {
            Some(head) => self.nodes[head].next.is_none(),
            None => false,
        }
    }

    /// `(top, bot)` sequence numbers of all intervals in order
    pub fn intervals(&self) -> Vec<(u32, u32)> {
        let mut result = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            result.push((node.top_sequence_num, node.bot_sequence_num));
            cur = node.next;
        }
        result
    }

    /// Adds a received packet. The first `initial_offset` bytes of the packet's first SGL entry are
    ///  its transport header and are skipped.
    ///
    /// If a pool is exhausted, all of this payload's fragments and intervals are returned to their
    ///  pools before the error is returned, leaving the list empty.
    pub fn add_packet(&mut self, pools: &RxPools, packet: &SgList, sequence_num: u32, initial_offset: usize) -> CdiResult<ReorderInsert> {
        let result = self.insert(pools, packet, sequence_num, initial_offset);
        if result.is_err() {
            self.free_all(pools);
        }
        result
    }

    fn insert(&mut self, pools: &RxPools, packet: &SgList, sequence_num: u32, initial_offset: usize) -> CdiResult<ReorderInsert> {
        let mut prev = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.top_sequence_num <= sequence_num && sequence_num <= node.bot_sequence_num {
                warn!("sequence number {} has already been received - skipping", sequence_num);
                return Ok(ReorderInsert::Duplicate);
            }
            if sequence_num > node.bot_sequence_num {
                prev = cur;
                cur = node.next;
            }
            else {
                break;
            }
        }

        let (fragments, num_bytes) = Self::checkout_fragments(pools, packet, sequence_num, initial_offset)?;

        match prev {
            None => match cur {
                Some(first) if sequence_num.checked_add(1) == Some(self.nodes[first].top_sequence_num) => {
                    self.prepend(first, sequence_num, fragments);
                }
                _ => {
                    let new_idx = self.insert_node(pools, None, cur, sequence_num, fragments)?;
                    self.head = Some(new_idx);
                }
            },
            Some(prev) => {
                if self.nodes[prev].bot_sequence_num.checked_add(1) == Some(sequence_num) {
                    trace!("appending sequence number {} to [{}-{}]", sequence_num, self.nodes[prev].top_sequence_num, self.nodes[prev].bot_sequence_num);
                    let node = &mut self.nodes[prev];
                    node.fragments.extend(fragments);
                    node.bot_sequence_num = sequence_num;

                    if let Some(next) = cur {
                        if sequence_num.checked_add(1) == Some(self.nodes[next].top_sequence_num) {
                            self.merge_next(pools, prev);
                        }
                    }
                }
                else {
                    match cur {
                        Some(next) if sequence_num.checked_add(1) == Some(self.nodes[next].top_sequence_num) => {
                            self.prepend(next, sequence_num, fragments);
                        }
                        _ => {
                            self.insert_node(pools, Some(prev), cur, sequence_num, fragments)?;
                        }
                    }
                }
            }
        }

        Ok(ReorderInsert::Added(num_bytes))
    }

    fn checkout_fragments(pools: &RxPools, packet: &SgList, sequence_num: u32, initial_offset: usize) -> CdiResult<(Vec<MemoryFragment>, usize)> {
        let mut fragments = Vec::with_capacity(packet.num_entries());
        let mut num_bytes = 0;
        let mut offset = initial_offset;

        for entry in packet.entries() {
            if entry.len() <= offset {
                warn!("got sequence number {} with no payload data", sequence_num);
            }

            let mut fragment = match pools.fragments.checkout() {
                Ok(fragment) => fragment,
                Err(e) => {
                    pools.fragments.put_all(fragments);
                    return Err(e);
                }
            };

            // a truncated packet may be shorter than the header it is supposed to have
            offset = offset.min(entry.len());
            fragment.data = entry.slice(offset..);
            num_bytes += fragment.data.len();
            fragments.push(fragment);

            offset = 0;
        }

        Ok((fragments, num_bytes))
    }

    fn prepend(&mut self, idx: usize, sequence_num: u32, fragments: Vec<MemoryFragment>) {
        let node = &mut self.nodes[idx];
        trace!("prepending sequence number {} to [{}-{}]", sequence_num, node.top_sequence_num, node.bot_sequence_num);
        for fragment in fragments.into_iter().rev() {
            node.fragments.push_front(fragment);
        }
        node.top_sequence_num = sequence_num;
    }

    fn insert_node(&mut self, pools: &RxPools, prev: Option<usize>, next: Option<usize>, sequence_num: u32, fragments: Vec<MemoryFragment>) -> CdiResult<usize> {
        let mut node = match pools.intervals.checkout() {
            Ok(node) => node,
            Err(e) => {
                pools.fragments.put_all(fragments);
                return Err(e);
            }
        };
        trace!("creating interval for sequence number {}", sequence_num);

        node.top_sequence_num = sequence_num;
        node.bot_sequence_num = sequence_num;
        node.fragments.extend(fragments);
        node.prev = prev;
        node.next = next;

        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        if let Some(prev) = prev {
            self.nodes[prev].next = Some(idx);
        }
        if let Some(next) = next {
            self.nodes[next].prev = Some(idx);
        }
        Ok(idx)
    }

    /// Moves the interval following `idx` into `idx`, returning its node to the pool
    fn merge_next(&mut self, pools: &RxPools, idx: usize) {
        let Some(next_idx) = self.nodes[idx].next else {
            return;
        };
        let mut next = mem::take(&mut self.nodes[next_idx]);
        self.free_slots.push(next_idx);

        debug!("merging [{}-{}] into [{}-{}]", next.top_sequence_num, next.bot_sequence_num, self.nodes[idx].top_sequence_num, self.nodes[idx].bot_sequence_num);

        let node = &mut self.nodes[idx];
        node.fragments.append(&mut next.fragments);
        node.bot_sequence_num = next.bot_sequence_num;
        node.next = next.next;
        if let Some(after) = next.next {
            self.nodes[after].prev = Some(idx);
        }

        pools.intervals.put(next);
    }

    /// Returns all fragments and intervals to their pools. Calling this on an empty list does
    ///  nothing.
    pub fn free_all(&mut self, pools: &RxPools) {
        let mut cur = self.head.take();
        while let Some(idx) = cur {
            let mut node = mem::take(&mut self.nodes[idx]);
            cur = node.next;
            pools.fragments.put_all(node.fragments.drain(..));
            pools.intervals.put(node);
        }
        self.nodes.clear();
        self.free_slots.clear();
    }

    /// Takes the received data out of the list, in sequence number order, and returns all pooled
    ///  resources. Intended for a complete payload, where this is the payload's data.
    pub fn take_sgl(&mut self, pools: &RxPools) -> SgList {
        let mut sgl = SgList::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = &mut self.nodes[idx];
            for fragment in node.fragments.iter_mut() {
                sgl.push(mem::take(&mut fragment.data));
            }
            cur = node.next;
        }
        self.free_all(pools);
        sgl
    }
}

impl PoolItem for PacketReorderList {
    fn reset(&mut self) {
        debug_assert!(self.is_empty(), "reorder list reset with intervals still attached");
        self.head = None;
        self.nodes.clear();
        self.free_slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;
    use crate::config::{PoolConfig, RxReorderConfig};
    use crate::error::CdiError;
    use super::*;

    fn pools() -> RxPools {
        RxPools::new(&RxReorderConfig::default())
    }

    fn small_pools(fragments: usize, intervals: usize) -> RxPools {
        RxPools::new(&RxReorderConfig {
            fragment_pool: PoolConfig::fixed(fragments),
            interval_pool: PoolConfig::fixed(intervals),
            ..RxReorderConfig::default()
        })
    }

    /// a packet with a 2 byte header followed by the sequence number as payload
    fn packet(sequence_num: u32) -> SgList {
        SgList::from(Bytes::from(vec![0xee, 0xee, sequence_num as u8]))
    }

    fn add_all(list: &mut PacketReorderList, pools: &RxPools, order: &[u32]) -> usize {
        order.iter()
            .map(|&seq| match list.add_packet(pools, &packet(seq), seq, 2).unwrap() {
                ReorderInsert::Added(n) => n,
                ReorderInsert::Duplicate => panic!("unexpected duplicate {}", seq),
            })
            .sum()
    }

    #[test]
    fn test_arrival_sequence_converges() {
        let pools = pools();
        let mut list = PacketReorderList::default();

        let expected_intervals: Vec<Vec<(u32, u32)>> = vec![
            vec![(2, 2)],
            vec![(2, 2), (7, 7)],
            vec![(2, 2), (6, 7)],
            vec![(2, 2), (4, 4), (6, 7)],
            vec![(2, 2), (4, 7)],
            vec![(0, 0), (2, 2), (4, 7)],
            vec![(0, 2), (4, 7)],
            vec![(0, 7)],
        ];

        for (seq, expected) in [2, 7, 6, 4, 5, 0, 1, 3].into_iter().zip(expected_intervals) {
            assert_eq!(list.add_packet(&pools, &packet(seq), seq, 2), Ok(ReorderInsert::Added(1)));
            assert_eq!(list.intervals(), expected);
        }

        assert!(list.is_complete());
        assert_eq!(pools.intervals.checked_out(), 1);
        assert_eq!(pools.fragments.checked_out(), 8);

        let sgl = list.take_sgl(&pools);
        assert_eq!(sgl.linearize().as_ref(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(list.is_empty());
        assert_eq!(pools.intervals.checked_out(), 0);
        assert_eq!(pools.fragments.checked_out(), 0);
    }

    #[test]
    fn test_two_blocks_of_sixteen() {
        let pools = pools();
        let mut list = PacketReorderList::default();

        let block = [2, 0, 1, 6, 7, 4, 3, 5, 8, 10, 12, 11, 9, 15, 14, 13];
        let order = block.iter()
            .copied()
            .chain(block.iter().map(|s| s + 16))
            .collect::<Vec<_>>();

        assert_eq!(add_all(&mut list, &pools, &order), 32);
        assert_eq!(list.intervals(), vec![(0, 31)]);
        assert!(list.is_complete());
        assert_eq!(list.take_sgl(&pools).linearize().to_vec(), (0..32).collect::<Vec<u8>>());
    }

    #[test]
    fn test_all_permutations_converge() {
        let pools = pools();
        let mut rng = StdRng::seed_from_u64(8331);

        for len in 1..=24u32 {
            for _ in 0..20 {
                let mut order = (0..len).collect::<Vec<_>>();
                order.shuffle(&mut rng);

                let mut list = PacketReorderList::default();
                add_all(&mut list, &pools, &order);

                assert_eq!(list.intervals(), vec![(0, len - 1)], "order {:?}", order);
                assert!(list.is_complete());
                assert_eq!(list.take_sgl(&pools).linearize().to_vec(), (0..len as u8).collect::<Vec<_>>());
            }
        }

        assert_eq!(pools.intervals.checked_out(), 0);
        assert_eq!(pools.fragments.checked_out(), 0);
    }

    #[test]
    fn test_intervals_stay_sorted_and_disjoint() {
        let pools = pools();
        let mut rng = StdRng::seed_from_u64(291);
        let mut order = (0..64u32).collect::<Vec<_>>();
        order.shuffle(&mut rng);

        let mut list = PacketReorderList::default();
        for &seq in &order {
            list.add_packet(&pools, &packet(seq), seq, 2).unwrap();

            let intervals = list.intervals();
            for (top, bot) in &intervals {
                assert!(top <= bot);
            }
            for pair in intervals.windows(2) {
                // a gap of at least one sequence number, otherwise they would have been merged
                assert!(pair[0].1 + 1 < pair[1].0, "{:?}", intervals);
            }
            assert_eq!(list.is_complete(), intervals.len() == 1);
        }
    }

    #[rstest]
    #[case::single(vec![4], 4)]
    #[case::top_of_interval(vec![3, 4, 5], 3)]
    #[case::inside_interval(vec![3, 4, 5], 4)]
    #[case::bottom_of_interval(vec![3, 4, 5], 5)]
    #[case::second_interval(vec![0, 1, 5, 6], 6)]
    fn test_duplicate_is_ignored(#[case] received: Vec<u32>, #[case] duplicate: u32) {
        let pools = pools();
        let mut list = PacketReorderList::default();
        add_all(&mut list, &pools, &received);
        let intervals_before = list.intervals();
        let fragments_before = pools.fragments.checked_out();

        assert_eq!(list.add_packet(&pools, &packet(duplicate), duplicate, 2), Ok(ReorderInsert::Duplicate));

        assert_eq!(list.intervals(), intervals_before);
        assert_eq!(pools.fragments.checked_out(), fragments_before);
    }

    #[test]
    fn test_multi_entry_packets() {
        let pools = pools();
        let mut list = PacketReorderList::default();

        let packet_1 = SgList::from_entries(vec![
            Bytes::from_static(&[0xee, 0xee, 10]),
            Bytes::from_static(&[11, 12]),
        ]);
        let packet_0 = SgList::from_entries(vec![
            Bytes::from_static(&[0xee, 0xee, 1]),
            Bytes::from_static(&[2]),
            Bytes::from_static(&[3, 4]),
        ]);

        assert_eq!(list.add_packet(&pools, &packet_1, 1, 2), Ok(ReorderInsert::Added(3)));
        assert_eq!(list.add_packet(&pools, &packet_0, 0, 2), Ok(ReorderInsert::Added(4)));
        assert_eq!(pools.fragments.checked_out(), 5);

        let sgl = list.take_sgl(&pools);
        assert_eq!(sgl.num_entries(), 5);
        assert_eq!(sgl.linearize().as_ref(), &[1, 2, 3, 4, 10, 11, 12]);
    }

    #[test]
    fn test_header_longer_than_packet() {
        let pools = pools();
        let mut list = PacketReorderList::default();

        let truncated = SgList::from(Bytes::from_static(&[0xee]));
        assert_eq!(list.add_packet(&pools, &truncated, 0, 2), Ok(ReorderInsert::Added(0)));
        assert_eq!(list.intervals(), vec![(0, 0)]);
    }

    #[test]
    fn test_fragment_pool_exhausted() {
        let pools = small_pools(3, 10);
        let mut list = PacketReorderList::default();
        add_all(&mut list, &pools, &[0, 2, 4]);

        assert_eq!(list.add_packet(&pools, &packet(6), 6, 2), Err(CdiError::PoolExhausted));

        assert!(list.is_empty());
        assert!(list.intervals().is_empty());
        assert_eq!(pools.fragments.checked_out(), 0);
        assert_eq!(pools.intervals.checked_out(), 0);
    }

    #[test]
    fn test_interval_pool_exhausted() {
        let pools = small_pools(10, 2);
        let mut list = PacketReorderList::default();
        add_all(&mut list, &pools, &[0, 2]);

        // attaching to an existing interval needs no interval from the pool
        assert_eq!(list.add_packet(&pools, &packet(3), 3, 2), Ok(ReorderInsert::Added(1)));
        assert_eq!(list.add_packet(&pools, &packet(5), 5, 2), Err(CdiError::PoolExhausted));

        assert!(list.is_empty());
        assert_eq!(pools.fragments.checked_out(), 0);
        assert_eq!(pools.intervals.checked_out(), 0);
    }

    #[test]
    fn test_free_all_is_idempotent() {
        let pools = pools();
        let mut list = PacketReorderList::default();
        add_all(&mut list, &pools, &[9, 1, 5, 2]);
        assert_eq!(list.intervals(), vec![(1, 2), (5, 5), (9, 9)]);

        list.free_all(&pools);
        list.free_all(&pools);

        assert!(list.is_empty());
        assert_eq!(pools.fragments.checked_out(), 0);
        assert_eq!(pools.intervals.checked_out(), 0);

        // the list is usable again afterwards
        add_all(&mut list, &pools, &[1, 0]);
        assert_eq!(list.intervals(), vec![(0, 1)]);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let pools = pools();
        let mut list = PacketReorderList::default();
        add_all(&mut list, &pools, &[0, 2, 4, 6, 1, 3, 5]);

        assert_eq!(list.intervals(), vec![(0, 6)]);
        assert_eq!(pools.intervals.checked_out(), 1);

        add_all(&mut list, &pools, &[10, 12]);
        assert_eq!(list.nodes.len(), 4);
        assert_eq!(list.intervals(), vec![(0, 6), (10, 10), (12, 12)]);
    }
}
