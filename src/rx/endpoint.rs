use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use crate::config::RxReorderConfig;
use crate::error::{CdiError, CdiResult};
use crate::rx::payload_window::{PayloadSink, PayloadState, PayloadWindow, WindowPosition};
use crate::rx::reorder_list::ReorderInsert;
use crate::rx::RxPools;
use crate::sgl::SgList;

/// The parts of a packet's transport header that reassembly works with. Parsing the header is the
///  transport's job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxPacketHeader {
    pub payload_num: u32,
    pub packet_sequence_num: u32,
    /// number of bytes at the start of the packet's first SGL entry that belong to the header
    pub header_size: usize,
    /// the payload's total data size, only evaluated for packet 0
    pub total_payload_size: usize,
}

/// Reassembles the payloads received on one endpoint and delivers them to a [PayloadSink]. All
///  methods are called from the endpoint's packet processing thread, only the pools may be shared
///  with other endpoints.
pub struct RxEndpoint<S: PayloadSink> {
    name: String,
    pools: Arc<RxPools>,
    window: PayloadWindow,
    sink: S,
}

impl<S: PayloadSink> RxEndpoint<S> {
    pub fn new(name: impl Into<String>, config: &RxReorderConfig, pools: Arc<RxPools>, sink: S) -> CdiResult<RxEndpoint<S>> {
        config.validate()?;

        Ok(RxEndpoint {
            name: name.into(),
            pools,
            window: PayloadWindow::new(config),
            sink,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn buffered_packet_count(&self) -> u32 {
        self.window.buffered_packet_count()
    }

    pub fn window(&self) -> &PayloadWindow {
        &self.window
    }

    /// Processes a received packet and delivers every payload that is ready as a consequence.
    ///
    /// Packets that can not be used are dropped: late packets for payloads that were delivered
    ///  already, duplicates, payload numbers beyond the protocol's range, and packets for a payload
    ///  number whose slot is still taken by an older payload. A packet too far ahead of the window
    ///  moves it forward first. The only error is failure to get a payload state from its pool, in
    ///  which case the packet is dropped as well.
    pub fn receive_packet(&mut self, header: &RxPacketHeader, packet: &SgList) -> CdiResult<()> {
        trace!("{}: payload {} packet {} ({} bytes)", self.name, header.payload_num, header.packet_sequence_num, packet.total_data_size());

        self.window.count_packet();
        let result = self.add_to_payload(header, packet);

        self.window.abandon_stale_payloads(&self.pools, &mut self.sink);
        if !self.window.delivered_first_payload() {
            self.window.seek_first_payload();
        }
        self.window.send_ready_payloads(&self.pools, &mut self.sink);

        result
    }

    fn add_to_payload(&mut self, header: &RxPacketHeader, packet: &SgList) -> CdiResult<()> {
        let pools = self.pools.as_ref();

        match self.window.position(header.payload_num) {
            WindowPosition::Inside => {}
            WindowPosition::Behind => {
                trace!("{}: dropping late packet {} for payload {}", self.name, header.packet_sequence_num, header.payload_num);
                return Ok(());
            }
            WindowPosition::OutOfRange => {
                warn!("{}: payload number {} is out of range - dropping packet", self.name, header.payload_num);
                return Ok(());
            }
            WindowPosition::Ahead => {
                warn!("{}: payload {} is ahead of the rx window", self.name, header.payload_num);
                self.window.realign(pools, &mut self.sink, header.payload_num);
            }
        }
        self.window.anchor(header.payload_num);

        let total_packet_count = self.window.total_packet_count();
        let slot_index = self.window.slot_index(header.payload_num);
        let slot_at_cursor = slot_index == self.window.current_index();

        let state = self.window.get_or_create_state(pools, header.payload_num)?;

        if state.payload_num != header.payload_num {
            match state.state {
                PayloadState::Idle | PayloadState::Ignore => {
                    trace!("{}: taking over slot {} from payload {} for payload {}", self.name, slot_index, state.payload_num, header.payload_num);
                    state.reset_for(header.payload_num);
                }
                PayloadState::Complete | PayloadState::Error => {
                    warn!("{}: payload {} arrived while payload {} waits for delivery in its slot - dropping packet", self.name, header.payload_num, state.payload_num);
                    return Ok(());
                }
                PayloadState::PacketZeroPending | PayloadState::InProgress => {
                    warn!("{}: payload {} arrived while payload {} is still in progress in its slot - abandoning the older payload", self.name, header.payload_num, state.payload_num);
                    PayloadWindow::payload_error(pools, state);
                    return Ok(());
                }
            }
        }
        else if state.state == PayloadState::Ignore && slot_at_cursor {
            // the window went full circle since this payload number was abandoned, so this is a new payload
            state.reset_for(header.payload_num);
        }

        match state.state {
            PayloadState::Ignore | PayloadState::Error => {
                trace!("{}: dropping packet {} for errored payload {}", self.name, header.packet_sequence_num, header.payload_num);
                return Ok(());
            }
            PayloadState::Complete => {
                if !state.suspend_warnings {
                    warn!("{}: received packet for completed payload {} - additional packets for this payload will be dropped", self.name, header.payload_num);
                    state.suspend_warnings = true;
                }
                return Ok(());
            }
            PayloadState::Idle => {
                if header.packet_sequence_num == 0 {
                    state.expected_payload_size = header.total_payload_size;
                    state.state = PayloadState::InProgress;
                }
                else {
                    state.state = PayloadState::PacketZeroPending;
                }
            }
            PayloadState::PacketZeroPending => {
                if header.packet_sequence_num == 0 {
                    state.expected_payload_size = header.total_payload_size;
                    state.state = PayloadState::InProgress;
                }
            }
            PayloadState::InProgress => {}
        }

        match state.reorder_list.add_packet(pools, packet, header.packet_sequence_num, header.header_size) {
            Ok(ReorderInsert::Added(num_bytes)) => {
                state.data_bytes_received += num_bytes;
                state.packet_count += 1;
                state.last_total_packet_count = total_packet_count;
            }
            Ok(ReorderInsert::Duplicate) => {
                return Ok(());
            }
            Err(e) => {
                error!("{}: failed to buffer packet {} of payload {}: {}", self.name, header.packet_sequence_num, header.payload_num, e);
                PayloadWindow::payload_error(pools, state);
                return Ok(());
            }
        }

        if state.state == PayloadState::InProgress
            && state.data_bytes_received >= state.expected_payload_size
            && state.reorder_list.is_complete()
        {
            debug!("{}: payload {} complete: {} bytes in {} packets", self.name, header.payload_num, state.data_bytes_received, state.packet_count);
            state.state = PayloadState::Complete;
        }

        self.window.add_buffered_packet();
        Ok(())
    }

    /// Returns all resources held for payloads that were not delivered yet, without delivering
    ///  them. The endpoint starts over as if it was new.
    pub fn flush_resources(&mut self) {
        debug!("{}: flushing rx resources", self.name);
        self.window.flush_all(&self.pools);
    }
}

impl<S: PayloadSink> Drop for RxEndpoint<S> {
    fn drop(&mut self) {
        self.flush_resources();
    }
}
