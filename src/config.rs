use anyhow::bail;

/// Sizing of one object pool: a fixed number of items that are available up front, plus an
///  optional bounded growth policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// Number of items the pool hands out before it has to grow.
    pub item_count: usize,
    /// Number of items added each time the pool grows. Irrelevant if `max_grow_count` is 0.
    pub grow_count: usize,
    /// Maximum number of times the pool may grow. Once the pool has grown this often, checkout
    ///  fails with `PoolExhausted` until items are returned.
    pub max_grow_count: usize,
}

impl PoolConfig {
    pub const fn fixed(item_count: usize) -> PoolConfig {
        PoolConfig {
            item_count,
            grow_count: 0,
            max_grow_count: 0,
        }
    }

    /// The number of items that can be checked out at the same time after all growth
    pub fn hard_limit(&self) -> usize {
        self.item_count + self.grow_count * self.max_grow_count
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.item_count == 0 {
            bail!("pool item count must be positive");
        }
        if self.max_grow_count > 0 && self.grow_count == 0 {
            bail!("pool grow count must be positive if the pool is allowed to grow");
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            item_count: 128,
            grow_count: 8,
            max_grow_count: 5,
        }
    }
}

/// Configuration of the receive side payload reordering for a single endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RxReorderConfig {
    /// Number of slots in the circular payload state array. Payload numbers are mapped to slots by
    ///  masking, so this must be a power of two.
    pub payload_state_capacity: usize,

    /// Ceiling for the number of packets buffered across all payloads that are still waiting to be
    ///  delivered. Reaching it forces partial payloads out as errors, oldest first.
    ///
    /// This must be at least the number of packets in the biggest payload, otherwise a single
    ///  payload can never complete.
    pub max_buffered_packets: u32,

    /// A payload that has not received a packet while this many packets arrived on the endpoint is
    ///  considered stale and is abandoned.
    pub stale_packet_window: u32,

    /// The biggest payload number the sender's protocol version produces before wrapping to 0
    ///  (255 for 8-bit payload numbers, 65535 for 16-bit ones). If there are more payload numbers
    ///  than slots, their number must be a multiple of the slot count.
    pub payload_num_max: u32,

    pub fragment_pool: PoolConfig,
    pub interval_pool: PoolConfig,
    pub payload_state_pool: PoolConfig,
}

impl RxReorderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_state_capacity < 2 || !self.payload_state_capacity.is_power_of_two() {
            bail!("payload state capacity must be a power of two and at least 2, was {}", self.payload_state_capacity);
        }
        if self.max_buffered_packets == 0 {
            bail!("max buffered packets must be positive");
        }
        if self.stale_packet_window as usize > self.payload_state_capacity {
            bail!("stale packet window {} must not exceed the payload state capacity {}", self.stale_packet_window, self.payload_state_capacity);
        }
        if self.payload_num_max == 0 {
            bail!("payload number range must not be empty");
        }
        let num_payload_nums = self.payload_num_max as u64 + 1;
        let capacity = self.payload_state_capacity as u64;
        if num_payload_nums > capacity && num_payload_nums % capacity != 0 {
            bail!("{} payload numbers do not map evenly onto {} payload state slots", num_payload_nums, capacity);
        }

        self.fragment_pool.validate()?;
        self.interval_pool.validate()?;
        self.payload_state_pool.validate()?;
        Ok(())
    }
}

impl Default for RxReorderConfig {
    fn default() -> Self {
        RxReorderConfig {
            payload_state_capacity: 32,
            max_buffered_packets: 32,
            stale_packet_window: 32,
            payload_num_max: 255,
            fragment_pool: PoolConfig::default(),
            interval_pool: PoolConfig::default(),
            payload_state_pool: PoolConfig::fixed(32),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        RxReorderConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::default(PoolConfig::default(), 168)]
    #[case::fixed(PoolConfig::fixed(7), 7)]
    #[case::no_growth_allowed(PoolConfig { item_count: 4, grow_count: 3, max_grow_count: 0 }, 4)]
    fn test_pool_hard_limit(#[case] config: PoolConfig, #[case] expected: usize) {
        assert_eq!(config.hard_limit(), expected);
    }

    #[rstest]
    #[case::empty(PoolConfig::fixed(0))]
    #[case::grow_by_zero(PoolConfig { item_count: 4, grow_count: 0, max_grow_count: 2 })]
    fn test_pool_invalid(#[case] config: PoolConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::capacity_not_power_of_two(|c: &mut RxReorderConfig| c.payload_state_capacity = 24)]
    #[case::capacity_too_small(|c: &mut RxReorderConfig| c.payload_state_capacity = 1)]
    #[case::no_buffered_packets(|c: &mut RxReorderConfig| c.max_buffered_packets = 0)]
    #[case::window_too_big(|c: &mut RxReorderConfig| c.stale_packet_window = 33)]
    #[case::empty_payload_range(|c: &mut RxReorderConfig| c.payload_num_max = 0)]
    #[case::invalid_pool(|c: &mut RxReorderConfig| c.interval_pool = PoolConfig::fixed(0))]
    #[case::payload_nums_not_multiple_of_capacity(|c: &mut RxReorderConfig| c.payload_num_max = 39)]
    #[case::payload_nums_not_multiple_of_bigger_capacity(|c: &mut RxReorderConfig| { c.payload_state_capacity = 64; c.payload_num_max = 95 })]
    fn test_reorder_invalid(#[case] modify: fn(&mut RxReorderConfig)) {
        let mut config = RxReorderConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::fewer_payload_nums_than_slots(|c: &mut RxReorderConfig| c.payload_num_max = 15)]
    #[case::odd_count_below_capacity(|c: &mut RxReorderConfig| c.payload_num_max = 20)]
    #[case::as_many_as_slots(|c: &mut RxReorderConfig| c.payload_num_max = 31)]
    #[case::multiple_of_capacity(|c: &mut RxReorderConfig| c.payload_num_max = 95)]
    #[case::sixteen_bit(|c: &mut RxReorderConfig| c.payload_num_max = 65535)]
    #[case::full_u32(|c: &mut RxReorderConfig| c.payload_num_max = u32::MAX)]
    fn test_reorder_valid(#[case] modify: fn(&mut RxReorderConfig)) {
        let mut config = RxReorderConfig::default();
        modify(&mut config);
        assert!(config.validate().is_ok());
    }
}
