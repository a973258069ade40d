//! Receive side reassembly: packets of a payload are put in order by a [reorder_list::PacketReorderList],
//!  payloads are put in order and delivered by a [payload_window::PayloadWindow], and an
//!  [endpoint::RxEndpoint] drives both for every received packet.

pub mod endpoint;
pub mod payload_window;
pub mod reorder_list;

use crate::config::RxReorderConfig;
use crate::pool::Pool;
use crate::rx::payload_window::RxPayloadState;
use crate::rx::reorder_list::{MemoryFragment, ReorderInterval};

/// The pools that receive side reassembly draws its resources from. They may be shared between
///  several endpoints, e.g. all endpoints of a connection.
pub struct RxPools {
    pub fragments: Pool<MemoryFragment>,
    pub intervals: Pool<ReorderInterval>,
    pub payload_states: Pool<RxPayloadState>,
}

impl RxPools {
    pub fn new(config: &RxReorderConfig) -> RxPools {
        RxPools {
            fragments: Pool::new("rx fragments", config.fragment_pool),
            intervals: Pool::new("rx reorder intervals", config.interval_pool),
            payload_states: Pool::new("rx payload states", config.payload_state_pool),
        }
    }

    /// true if no pooled resources are checked out
    pub fn is_idle(&self) -> bool {
        self.fragments.checked_out() == 0
            && self.intervals.checked_out() == 0
            && self.payload_states.checked_out() == 0
    }
}
