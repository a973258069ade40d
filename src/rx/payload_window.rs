//! In-order delivery of payloads that complete out of order.
//!
//! Payload states live in a circular array of slots, indexed by payload number masked to the array
//!  size. A cursor points to the slot of the next payload to be delivered. Delivery only ever
//!  happens at the cursor, so payloads reach the sink in payload number order even if later
//!  payloads complete first:
//!
//! ```ascii
//!  cursor
//!    v
//!  [ 4: in progress ][ 5: complete ][ 6: error ][ 7: empty ] ...
//!
//!  4 completes  ->  4, 5 and 6 are delivered, cursor moves to 7
//! ```
//!
//! Only payload numbers less than one window length ahead of the cursor's payload are buffered.
//!  Packets for payloads behind the cursor are late and dropped. A payload further ahead moves the
//!  window forward: older payloads are delivered or abandoned first, so the order still holds.
//!
//! Packets of payloads that wait for delivery are held in reorder lists and counted in a buffered
//!  packet count. When that count reaches its ceiling, partial payloads at the front of the window
//!  are forced out as errors until it drops below the ceiling again.

use std::cmp::min;
#[cfg(test)] use mockall::automock;
use tracing::{debug, error, trace, warn};
use crate::config::RxReorderConfig;
use crate::error::{CdiError, CdiResult};
use crate::pool::PoolItem;
use crate::rx::reorder_list::PacketReorderList;
use crate::rx::RxPools;
use crate::safe_converter::SafeCast;
use crate::sgl::SgList;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadState {
    /// No packet was processed for the payload yet
    #[default]
    Idle,
    /// Packets were received, but not packet 0 which carries the payload's total size
    PacketZeroPending,
    InProgress,
    Complete,
    Error,
    /// The payload was delivered as an error. Late packets for it are dropped until the slot is
    ///  taken over by a different payload.
    Ignore,
}

impl PayloadState {
    pub fn is_receiving(self) -> bool {
        matches!(self, PayloadState::PacketZeroPending | PayloadState::InProgress)
    }
}

#[derive(Debug, Default)]
pub struct RxPayloadState {
    pub payload_num: u32,
    pub state: PayloadState,
    pub data_bytes_received: usize,
    /// only known after packet 0 was received
    pub expected_payload_size: usize,
    /// number of packets held for this payload, counted against the endpoint's buffered packets
    pub packet_count: u32,
    /// the endpoint's total packet count when this payload last received a packet
    pub last_total_packet_count: u32,
    /// set after warning about a packet for a completed payload, so the warning is not repeated
    pub suspend_warnings: bool,
    pub reorder_list: PacketReorderList,
}

impl RxPayloadState {
    /// Puts the state back to `Idle` for a (new) payload. Any packets the payload held must have
    ///  been freed before.
    pub fn reset_for(&mut self, payload_num: u32) {
        debug_assert!(self.reorder_list.is_empty(), "payload state reset while holding packets");
        self.payload_num = payload_num;
        self.state = PayloadState::Idle;
        self.data_bytes_received = 0;
        self.expected_payload_size = 0;
        self.packet_count = 0;
        self.last_total_packet_count = 0;
        self.suspend_warnings = false;
    }

    fn set_ignore(&mut self) {
        self.state = PayloadState::Ignore;
        self.packet_count = 0;
    }
}

impl PoolItem for RxPayloadState {
    fn reset(&mut self) {
        self.reset_for(0);
    }
}

/// A payload handed to the [PayloadSink]: either its complete data in order, or the information
///  that it was lost
#[derive(Debug)]
pub struct ReceivedPayload {
    pub payload_num: u32,
    /// `Err(RxPayloadError)` for payloads that could not be reassembled
    pub status: CdiResult<()>,
    /// the payload's data in order, empty for errored payloads
    pub sgl: SgList,
    pub data_bytes_received: usize,
    pub packet_count: u32,
}

/// Receives the reassembled payloads of an endpoint, exactly once per payload and in payload
///  number order. This is called on the packet processing thread, so implementations are expected
///  to hand the payload off rather than process it.
#[cfg_attr(test, automock)]
pub trait PayloadSink {
    fn send_payload(&mut self, payload: ReceivedPayload);
}

/// Where a payload number lies relative to the window of payloads starting at the cursor
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WindowPosition {
    Inside,
    /// delivered or abandoned already
    Behind,
    /// too far ahead to be buffered before the window moves on
    Ahead,
    /// bigger than the protocol's maximum payload number
    OutOfRange,
}

pub struct PayloadWindow {
    slots: Vec<Option<RxPayloadState>>,
    current_index: usize,
    /// the payload number expected at the cursor, unknown before the first packet
    cursor_payload_num: Option<u32>,
    buffered_packet_count: u32,
    /// number of packets received on the endpoint, wrapping
    total_packet_count: u32,
    max_buffered_packets: u32,
    stale_packet_window: u32,
    payload_num_max: u32,
    delivered_first_payload: bool,
}

impl PayloadWindow {
    pub fn new(config: &RxReorderConfig) -> PayloadWindow {
        PayloadWindow {
            slots: (0..config.payload_state_capacity).map(|_| None).collect(),
            current_index: 0,
            cursor_payload_num: None,
            buffered_packet_count: 0,
            total_packet_count: 0,
            max_buffered_packets: config.max_buffered_packets,
            stale_packet_window: config.stale_packet_window,
            payload_num_max: config.payload_num_max,
            delivered_first_payload: false,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn cursor_payload_num(&self) -> Option<u32> {
        self.cursor_payload_num
    }

    pub fn buffered_packet_count(&self) -> u32 {
        self.buffered_packet_count
    }

    pub fn total_packet_count(&self) -> u32 {
        self.total_packet_count
    }

    pub fn delivered_first_payload(&self) -> bool {
        self.delivered_first_payload
    }

    pub fn slot_index(&self, payload_num: u32) -> usize {
        payload_num.safe_cast() & (self.slots.len() - 1)
    }

    /// The last slot in use. If the protocol's payload numbers do not cover the entire array, the
    ///  unused tail of the array is skipped.
    fn max_index(&self) -> usize {
        min(self.payload_num_max.safe_cast(), self.slots.len() - 1)
    }

    fn advance_index(&self, index: usize) -> usize {
        if index + 1 > self.max_index() {
            0
        }
        else {
            index + 1
        }
    }

    fn next_payload_num(&self, payload_num: u32) -> u32 {
        if payload_num >= self.payload_num_max {
            0
        }
        else {
            payload_num + 1
        }
    }

    /// Number of payload numbers that can be buffered at the same time, starting at the cursor
    fn window_len(&self) -> u64 {
        self.max_index() as u64 + 1
    }

    /// How far `to` is ahead of `from`, modulo the payload number range
    fn distance(&self, from: u32, to: u32) -> u64 {
        let num_payload_nums = self.payload_num_max as u64 + 1;
        (to as u64 + num_payload_nums - from as u64) % num_payload_nums
    }

    /// Payload numbers outside the window are split in half: the nearer half counts as ahead, the
    ///  other half as late. The configuration guarantees that the payload number range is either
    ///  at most one window or a multiple of it, so neither half is empty.
    pub fn position(&self, payload_num: u32) -> WindowPosition {
        if payload_num > self.payload_num_max {
            return WindowPosition::OutOfRange;
        }
        let Some(cursor_payload_num) = self.cursor_payload_num else {
            return WindowPosition::Inside;
        };

        let num_payload_nums = self.payload_num_max as u64 + 1;
        let window_len = self.window_len();
        let distance = self.distance(cursor_payload_num, payload_num);
        if distance < window_len {
            WindowPosition::Inside
        }
        else if distance < window_len + (num_payload_nums - window_len) / 2 {
            WindowPosition::Ahead
        }
        else {
            WindowPosition::Behind
        }
    }

    /// The first packet on a (new or flushed) connection determines the cursor's payload number.
    pub fn anchor(&mut self, payload_num: u32) {
        if self.cursor_payload_num.is_none() {
            trace!("rx window anchored at payload {}", payload_num);
            self.cursor_payload_num = Some(payload_num);
            self.current_index = self.slot_index(payload_num);
        }
    }

    pub fn state(&self, payload_num: u32) -> Option<&RxPayloadState> {
        self.slots[self.slot_index(payload_num)].as_ref()
    }

    pub fn count_packet(&mut self) {
        self.total_packet_count = self.total_packet_count.wrapping_add(1);
    }

    pub fn add_buffered_packet(&mut self) {
        self.buffered_packet_count += 1;
    }

    fn decrease_buffered_packets(&mut self, packet_count: u32) {
        self.buffered_packet_count = self.buffered_packet_count.saturating_sub(packet_count);
    }

    /// Returns the state in the slot for `payload_num`, taking a fresh one from the pool if the
    ///  slot is empty. The returned state may belong to a different payload that maps to the same
    ///  slot, it is up to the caller to check that.
    pub fn get_or_create_state(&mut self, pools: &RxPools, payload_num: u32) -> CdiResult<&mut RxPayloadState> {
        let index = self.slot_index(payload_num);
        let slot = &mut self.slots[index];
        if slot.is_none() {
            let mut state = pools.payload_states.checkout()
                .inspect_err(|_| error!("failed to get rx payload state for payload {} from pool", payload_num))?;
            state.reset_for(payload_num);
            *slot = Some(state);
        }
        match slot {
            Some(state) => Ok(state),
            None => Err(CdiError::PoolExhausted),
        }
    }

    /// A payload is stale when more than `stale_packet_window` packets arrived on the endpoint since
    ///  its own last packet.
    pub fn is_stale(&self, state: &RxPayloadState) -> bool {
        self.total_packet_count.wrapping_sub(state.last_total_packet_count) > self.stale_packet_window
    }

    /// Frees all packets held for a payload and marks it as errored. It is still counted as
    ///  buffered until it is delivered.
    pub fn payload_error(pools: &RxPools, state: &mut RxPayloadState) {
        warn!("rx packet error occurred: payload {} got {} packets", state.payload_num, state.packet_count);
        state.reorder_list.free_all(pools);
        state.state = PayloadState::Error;
    }

    fn send_payload_if_complete_or_error(&mut self, pools: &RxPools, sink: &mut impl PayloadSink, index: usize) -> bool {
        let Some(state) = self.slots[index].as_mut() else {
            return false;
        };

        let status = match state.state {
            PayloadState::Complete => Ok(()),
            PayloadState::Error => Err(CdiError::RxPayloadError),
            _ => return false,
        };
        let is_complete = status.is_ok();
        let payload_num = state.payload_num;

        let payload = ReceivedPayload {
            payload_num,
            status,
            sgl: state.reorder_list.take_sgl(pools),
            data_bytes_received: state.data_bytes_received,
            packet_count: state.packet_count,
        };
        if !is_complete {
            // errored payloads keep their slot, so late packets for them are recognized and dropped
            state.set_ignore();
        }

        debug!("delivering payload {} from slot {}: {:?}", payload.payload_num, index, payload.status);
        self.decrease_buffered_packets(payload.packet_count);
        sink.send_payload(payload);

        if is_complete {
            if let Some(state) = self.slots[index].take() {
                pools.payload_states.put(state);
            }
        }

        self.current_index = self.advance_index(index);
        self.cursor_payload_num = Some(self.next_payload_num(payload_num));
        self.delivered_first_payload = true;
        true
    }

    /// Delivers all complete or errored payloads starting at the cursor, stopping at the first slot
    ///  that is empty or still receiving. If the buffered packet ceiling is reached after that,
    ///  partial payloads are flushed, and the payloads that were waiting behind them are delivered.
    pub fn send_ready_payloads(&mut self, pools: &RxPools, sink: &mut impl PayloadSink) {
        self.deliver_from_cursor(pools, sink);

        if self.buffered_packet_count >= self.max_buffered_packets {
            if self.delivered_first_payload {
                error!("exceeded rx reorder window of {} buffered packets - flushing payload(s)", self.max_buffered_packets);
            }
            else {
                debug!("exceeded rx reorder window of {} buffered packets before the first payload - flushing payload(s)", self.max_buffered_packets);
            }
            self.flush_partial_payloads(pools, sink);
            self.deliver_from_cursor(pools, sink);
        }
    }

    fn deliver_from_cursor(&mut self, pools: &RxPools, sink: &mut impl PayloadSink) {
        let mut index = self.current_index;
        while self.send_payload_if_complete_or_error(pools, sink, index) {
            index = self.advance_index(index);
        }
    }

    /// Walks the window from the cursor, turning partial payloads into errors and delivering them,
    ///  until the buffered packet count is below the ceiling.
    ///
    /// Panics if a full pass over the window does not get below the ceiling. That can only happen
    ///  if the ceiling is too small for the payloads on the connection.
    fn flush_partial_payloads(&mut self, pools: &RxPools, sink: &mut impl PayloadSink) {
        let starting_index = self.current_index;
        let mut index = starting_index;

        while self.buffered_packet_count >= self.max_buffered_packets {
            if let Some(state) = self.slots[index].as_mut() {
                if state.state.is_receiving() {
                    Self::payload_error(pools, state);
                }
                self.send_payload_if_complete_or_error(pools, sink, index);
            }

            index = self.advance_index(index);
            if index == starting_index {
                assert!(self.buffered_packet_count < self.max_buffered_packets,
                        "failed to reduce rx buffered packet count {} below limit {} - max buffered packets is too small",
                        self.buffered_packet_count, self.max_buffered_packets);
                break;
            }
        }
    }

    /// Moves the window forward so that `payload_num` fits into it. Payloads that drop out of the
    ///  window are delivered, partial ones as errors, and the payloads waiting behind them follow.
    pub fn realign(&mut self, pools: &RxPools, sink: &mut impl PayloadSink, payload_num: u32) {
        let Some(cursor_payload_num) = self.cursor_payload_num else {
            return;
        };
        let window_len = self.window_len();
        let distance = self.distance(cursor_payload_num, payload_num);
        if distance < window_len {
            return;
        }

        let num_payload_nums = self.payload_num_max as u64 + 1;
        let new_start = ((payload_num as u64 + num_payload_nums - (window_len - 1)) % num_payload_nums) as u32;
        warn!("realigning rx window from payload {} to {} for payload {}", cursor_payload_num, new_start, payload_num);

        let mut index = self.current_index;
        for _ in 0..min(distance - window_len + 1, window_len) {
            if let Some(state) = self.slots[index].as_mut() {
                if state.state.is_receiving() {
                    Self::payload_error(pools, state);
                }
                self.send_payload_if_complete_or_error(pools, sink, index);
            }
            index = self.advance_index(index);
        }

        self.current_index = self.slot_index(new_start);
        self.cursor_payload_num = Some(new_start);
        self.deliver_from_cursor(pools, sink);
    }

    /// Before the first payload was delivered, the cursor is moved to the first occupied slot. The
    ///  first payload number on a connection need not be 0.
    pub fn seek_first_payload(&mut self) {
        let mut index = self.current_index;
        while self.slots[index].is_none() {
            index = self.advance_index(index);
            if index == self.current_index {
                break;
            }
        }
        trace!("first payload slot is {}", index);
        self.current_index = index;
        if let Some(state) = self.slots[index].as_ref() {
            self.cursor_payload_num = Some(state.payload_num);
        }
    }

    /// Turns the payload at the cursor into an error if it is stale, and delivers it, repeating
    ///  for the payloads that then move to the cursor.
    pub fn abandon_stale_payloads(&mut self, pools: &RxPools, sink: &mut impl PayloadSink) {
        loop {
            let index = self.current_index;
            let is_stale = self.slots[index].as_ref()
                .is_some_and(|state| state.state.is_receiving() && self.is_stale(state));
            if !is_stale {
                return;
            }

            let stale_packet_window = self.stale_packet_window;
            if let Some(state) = self.slots[index].as_mut() {
                warn!("payload {} is stale: no packet during the last {} packets on the endpoint", state.payload_num, stale_packet_window);
                Self::payload_error(pools, state);
            }
            self.send_ready_payloads(pools, sink);
        }
    }

    /// Returns all payload states and the packets they hold to their pools without delivering
    ///  them, and starts over with an empty window.
    pub fn flush_all(&mut self, pools: &RxPools) {
        for slot in self.slots.iter_mut() {
            if let Some(mut state) = slot.take() {
                state.reorder_list.free_all(pools);
                pools.payload_states.put(state);
            }
        }
        self.current_index = 0;
        self.cursor_payload_num = None;
        self.buffered_packet_count = 0;
        self.delivered_first_payload = false;
    }
}
