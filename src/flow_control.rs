use crate::seq::SeqNo;
use tracing::{debug, trace};

/// Sliding-window flow control: bounds the bytes in flight by what the
/// receiver has advertised room for.
pub struct FlowController {
    window_cap: u32,
    receiver_window: u32,
    bytes_in_flight: usize,
}

impl FlowController {
    pub fn new(initial_window: u32) -> FlowController {
        FlowController {
            window_cap: initial_window,
            receiver_window: initial_window,
            bytes_in_flight: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.window_cap.min(self.receiver_window) as usize
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn receiver_window(&self) -> u32 {
        self.receiver_window
    }

    pub fn on_send(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    pub fn on_ack(&mut self, bytes: usize, receiver_window: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        self.receiver_window = receiver_window;
    }

    pub fn update_receiver_window(&mut self, receiver_window: u32) {
        self.receiver_window = receiver_window;
    }
}

/// TCP-style congestion control: slow start, congestion avoidance, fast
/// retransmit on the third duplicate ACK, fast recovery, and a full window
/// collapse on retransmission timeout.
///
/// The window is kept as a float so the congestion-avoidance increment
/// `mss * mss / cwnd` accumulates across ACKs instead of rounding to zero.
pub struct CongestionController {
    mss: usize,
    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,
    in_fast_recovery: bool,
    last_ack: SeqNo,
    dup_ack_count: u32,
    fast_retransmits: u64,
    timeouts: u64,
}

impl CongestionController {
    pub fn new(mss: usize, initial_ssthresh: u32) -> CongestionController {
        CongestionController {
            mss,
            cwnd: mss as f64,
            ssthresh: initial_ssthresh as f64,
            in_slow_start: true,
            in_fast_recovery: false,
            last_ack: SeqNo::ZERO,
            dup_ack_count: 0,
            fast_retransmits: 0,
            timeouts: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.cwnd as usize
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh as usize
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    pub fn duplicate_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    pub fn fast_retransmits(&self) -> u64 {
        self.fast_retransmits
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// A new (window-advancing) cumulative ACK arrived.
    pub fn on_ack(&mut self, ack: SeqNo) {
        self.last_ack = ack;

        if self.in_fast_recovery {
            // deflate back to the post-loss threshold
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
            debug!("leaving fast recovery, cwnd={}", self.cwnd as usize);
        } else if self.in_slow_start {
            self.cwnd += self.mss as f64;
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
                debug!("leaving slow start at cwnd={}", self.cwnd as usize);
            }
        } else {
            // additive increase: one MSS per round trip
            self.cwnd += (self.mss * self.mss) as f64 / self.cwnd;
        }

        self.dup_ack_count = 0;
    }

    /// An ACK repeating the previous cumulative value arrived. Returns true
    /// when this is the third duplicate, i.e. the caller must fast-retransmit
    /// the packet the peer is stuck on.
    pub fn on_duplicate_ack(&mut self, ack: SeqNo) -> bool {
        if ack != self.last_ack {
            self.last_ack = ack;
            self.dup_ack_count = 1;
            return false;
        }

        self.dup_ack_count += 1;
        if self.dup_ack_count == 3 {
            self.enter_fast_recovery();
            return true;
        }
        if self.in_fast_recovery {
            // each further duplicate signals another packet has left the network
            self.cwnd += self.mss as f64;
        }
        false
    }

    fn enter_fast_recovery(&mut self) {
        self.fast_retransmits += 1;
        self.ssthresh = (self.cwnd / 2.0).max((2 * self.mss) as f64);
        self.cwnd = self.ssthresh + (3 * self.mss) as f64;
        self.in_fast_recovery = true;
        self.in_slow_start = false;
        debug!(
            "fast retransmit: ssthresh={} cwnd={}",
            self.ssthresh as usize, self.cwnd as usize
        );
    }

    /// A retransmission timeout fired: collapse to one segment and start over.
    pub fn on_timeout(&mut self) {
        self.timeouts += 1;
        self.ssthresh = (self.cwnd / 2.0).max((2 * self.mss) as f64);
        self.cwnd = self.mss as f64;
        self.in_slow_start = true;
        self.in_fast_recovery = false;
        self.dup_ack_count = 0;
        debug!(
            "timeout: ssthresh={} cwnd collapsed to {}",
            self.ssthresh as usize, self.cwnd as usize
        );
    }
}

/// The send admission gate: the logical AND of flow control and congestion
/// control. A payload may go out only while
/// `bytes_in_flight + payload <= min(flow window, cwnd)`.
pub struct AdaptiveFlowController {
    flow: FlowController,
    congestion: CongestionController,
}

impl AdaptiveFlowController {
    pub fn new(mss: usize, initial_window: u32) -> AdaptiveFlowController {
        AdaptiveFlowController {
            flow: FlowController::new(initial_window),
            congestion: CongestionController::new(mss, initial_window),
        }
    }

    pub fn can_send(&self, bytes: usize) -> bool {
        self.flow.bytes_in_flight() + bytes <= self.flow.window().min(self.congestion.window())
    }

    pub fn effective_window(&self) -> usize {
        self.flow
            .window()
            .min(self.congestion.window())
            .saturating_sub(self.flow.bytes_in_flight())
    }

    pub fn on_send(&mut self, bytes: usize) {
        self.flow.on_send(bytes);
        trace!(
            "sent {} bytes, {} now in flight",
            bytes,
            self.flow.bytes_in_flight()
        );
    }

    pub fn on_ack(&mut self, ack: SeqNo, bytes: usize, receiver_window: u32) {
        self.flow.on_ack(bytes, receiver_window);
        self.congestion.on_ack(ack);
    }

    /// Returns true when the third duplicate ACK asks for a fast retransmit.
    /// Duplicate ACKs still carry a window advertisement, so the flow side is
    /// updated even though no bytes are released.
    pub fn on_duplicate_ack(&mut self, ack: SeqNo, receiver_window: u32) -> bool {
        self.flow.update_receiver_window(receiver_window);
        self.congestion.on_duplicate_ack(ack)
    }

    pub fn on_timeout(&mut self) {
        self.congestion.on_timeout();
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.flow.bytes_in_flight()
    }

    pub fn receiver_window(&self) -> u32 {
        self.flow.receiver_window()
    }

    pub fn cwnd(&self) -> usize {
        self.congestion.window()
    }

    pub fn ssthresh(&self) -> usize {
        self.congestion.ssthresh()
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.congestion.in_fast_recovery()
    }

    pub fn duplicate_ack_count(&self) -> u32 {
        self.congestion.duplicate_ack_count()
    }
}
