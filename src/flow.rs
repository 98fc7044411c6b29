//! Flow control (component F): fence round-trip RTT measurement and a
//! TCP-Vegas-style latency-driven congestion window, gating when the
//! update pipeline (`update.rs`) may flush a `FramebufferUpdate`.
//!
//! The teacher has no flow control at all (every update is written
//! immediately); this module is grounded directly on the TCP-Vegas
//! description in spec §4.F, since there is no teacher code to adapt.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::{Fence, FENCE_FLAG_BLOCK_BEFORE, FENCE_FLAG_REQUEST};

/// Lower clamp for the congestion window (spec §4.F).
pub const MINIMUM_WINDOW: u64 = 4 * 1024;
/// Upper clamp for the congestion window (spec §4.F).
pub const MAXIMUM_WINDOW: u64 = 4 * 1024 * 1024;
/// Starting window before the first RTT sample, and the ceiling
/// re-applied on idle reset.
pub const INITIAL_WINDOW: u64 = 16 * 1024;
/// One-byte payload fixed for an RTT-measuring fence (spec §4.F).
const RTT_PING_PAYLOAD: u8 = 0x01;

fn ms_between(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    ts: Instant,
    pos: u64,
    extra: u64,
    congested: bool,
}

/// Per-connection flow-control state; only consulted once the client
/// has negotiated the Fence pseudo-encoding.
pub struct FlowController {
    cong_window: u64,
    base_rtt: Option<Duration>,
    min_rtt: Option<Duration>,
    min_congested_rtt: Option<Duration>,
    measurements: u32,
    in_slow_start: bool,
    last_position: u64,
    last_update: Instant,
    last_sent: Instant,
    extra_buffer: u64,
    pending: VecDeque<PendingPing>,
    last_pong: Option<PendingPing>,
    last_pong_arrival: Instant,
    last_adjustment: Instant,
}

impl FlowController {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            cong_window: INITIAL_WINDOW,
            base_rtt: None,
            min_rtt: None,
            min_congested_rtt: None,
            measurements: 0,
            in_slow_start: true,
            last_position: 0,
            last_update: now,
            last_sent: now,
            extra_buffer: 0,
            pending: VecDeque::new(),
            last_pong: None,
            last_pong_arrival: now,
            last_adjustment: now,
        }
    }

    #[must_use]
    pub fn cong_window(&self) -> u64 {
        self.cong_window
    }

    #[must_use]
    pub fn base_rtt(&self) -> Option<Duration> {
        self.base_rtt
    }

    #[must_use]
    pub fn pending_pings(&self) -> usize {
        self.pending.len()
    }

    /// Wire-position callback from Wire I/O: `pos` is the cumulative
    /// byte offset of the outgoing stream after the most recent write.
    pub fn note_position(&mut self, pos: u64) {
        let now = Instant::now();
        let delta = pos.saturating_sub(self.last_position);
        if let Some(base) = self.base_rtt {
            if base > Duration::ZERO {
                let elapsed = now.saturating_duration_since(self.last_update);
                let predicted =
                    elapsed.as_secs_f64() * (self.cong_window as f64) / base.as_secs_f64();
                let extra = (delta as f64) - predicted;
                self.extra_buffer = if extra > 0.0 { extra as u64 } else { 0 };
            }
        }
        self.last_position = pos;
        self.last_update = now;
        if delta > 0 {
            self.last_sent = now;
        }
    }

    /// Builds the RTT-measuring Fence message and records the pending
    /// ping (spec §4.F "Ping protocol").
    pub fn send_rtt_ping(&mut self) -> Fence {
        self.pending.push_back(PendingPing {
            ts: Instant::now(),
            pos: self.last_position,
            extra: self.extra_buffer,
            congested: self.is_congested(),
        });
        Fence {
            flags: FENCE_FLAG_REQUEST | FENCE_FLAG_BLOCK_BEFORE,
            payload: vec![RTT_PING_PAYLOAD],
        }
    }

    /// Records the peer's echoed fence, updating RTT samples and the
    /// congestion window once at least 3 measurements have
    /// accumulated since the last adjustment.
    pub fn on_pong(&mut self) {
        let Some(ping) = self.pending.pop_front() else { return };
        let now = Instant::now();
        let rtt = now.saturating_duration_since(ping.ts);

        self.base_rtt = Some(self.base_rtt.map_or(rtt, |b| b.min(rtt)));
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
        if ping.congested {
            self.min_congested_rtt = Some(self.min_congested_rtt.map_or(rtt, |m| m.min(rtt)));
        }
        self.last_pong = Some(ping);
        self.last_pong_arrival = now;
        self.measurements += 1;

        if self.measurements >= 3 {
            self.apply_adjustment();
        }
    }

    /// `in_flight ≥ congWindow` (spec §4.F "Congestion check").
    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.in_flight() >= self.cong_window
    }

    /// Estimated unacknowledged bytes: `lastPosition − lastPong.pos`,
    /// linearly interpolated toward the next pending ping's expected
    /// arrival to account for bytes that have likely already reached
    /// the peer but haven't been acknowledged yet (`GetInFlight()` in
    /// `flowcontrol.c`).
    fn in_flight(&self) -> u64 {
        let last_pong_pos = self.last_pong.map_or(0, |p| p.pos);
        if self.last_position == last_pong_pos {
            return 0;
        }

        // No RTT measurement yet: fall back to the raw gap to the
        // oldest outstanding ping, or zero if nothing is in flight.
        let Some(base_rtt) = self.base_rtt else {
            return match self.pending.front() {
                Some(next) => self.last_position.saturating_sub(next.pos),
                None => 0,
            };
        };

        // `base_rtt` and `last_pong` are only ever set together, in
        // `on_pong`, so this is always populated once we reach here.
        let last_pong = self.last_pong.expect("base_rtt implies a recorded pong");

        // If we aren't waiting for a pong, estimate as though one had
        // arrived right after the last position update.
        let next_pong = self.pending.front().copied().unwrap_or(PendingPing {
            ts: self.last_update,
            pos: self.last_position,
            extra: self.extra_buffer,
            congested: false,
        });

        let base_rtt_ms = (base_rtt.as_millis() as u64).max(1);
        let cong_window = self.cong_window.max(1);

        // How far behind the next expected pong should be, compensated
        // for each side's buffering delay.
        let mut eta_next = ms_between(last_pong.ts, next_pong.ts);
        eta_next += next_pong.extra * base_rtt_ms / cong_window;
        let delay = last_pong.extra * base_rtt_ms / cong_window;
        eta_next = eta_next.saturating_sub(delay);

        let elapsed = ms_between(self.last_pong_arrival, Instant::now());

        // The pong should arrive very soon; be optimistic and assume
        // its position is already reachable. Otherwise interpolate.
        let acked = if eta_next <= elapsed {
            next_pong.pos
        } else {
            last_pong.pos + next_pong.pos.saturating_sub(last_pong.pos) * elapsed / eta_next
        };

        self.last_position.saturating_sub(acked)
    }

    /// When congested, the caller should arm a timer for this long
    /// before re-entering the update pipeline; `None` means send now.
    #[must_use]
    pub fn defer_for(&self) -> Option<Duration> {
        if !self.is_congested() {
            return None;
        }
        let Some(base) = self.base_rtt else { return Some(Duration::from_millis(50)) };
        Some(base.max(Duration::from_millis(1)))
    }

    fn apply_adjustment(&mut self) {
        let (Some(base), Some(min_rtt)) = (self.base_rtt, self.min_rtt) else {
            self.reset_measurement_window();
            return;
        };
        let base_ms = base.as_millis() as i64;
        let min_ms = min_rtt.as_millis() as i64;
        let min_cong_ms = self.min_congested_rtt.map(|d| d.as_millis() as i64);
        let spike_threshold = (base_ms / 2).max(100);

        if min_ms - base_ms > spike_threshold {
            self.shrink_to_ratio(base_ms, min_ms);
            self.in_slow_start = false;
        } else if self.in_slow_start {
            if min_ms - base_ms > 25 {
                self.in_slow_start = false;
                self.shrink_to_ratio(base_ms, min_ms);
            } else if min_cong_ms.is_some_and(|mc| mc - base_ms < 25) {
                self.cong_window = self.cong_window.saturating_mul(2);
            }
        } else {
            if min_ms - base_ms > 50 {
                self.cong_window = self.cong_window.saturating_sub(4096);
            }
            if min_cong_ms.is_some_and(|mc| mc - base_ms < 5) {
                self.cong_window = self.cong_window.saturating_add(8192);
            } else if min_cong_ms.is_some_and(|mc| mc - base_ms < 25) {
                self.cong_window = self.cong_window.saturating_add(4096);
            }
        }

        self.cong_window = self.cong_window.clamp(MINIMUM_WINDOW, MAXIMUM_WINDOW);
        self.reset_measurement_window();
    }

    fn shrink_to_ratio(&mut self, base_ms: i64, min_ms: i64) {
        if min_ms > 0 {
            self.cong_window = ((self.cong_window as f64) * (base_ms as f64) / (min_ms as f64)) as u64;
        }
    }

    fn reset_measurement_window(&mut self) {
        self.measurements = 0;
        self.min_rtt = None;
        self.min_congested_rtt = None;
        self.last_adjustment = Instant::now();
    }

    /// Idle detection (spec §4.F): resets the window and slow-start
    /// state when nothing has been sent for a while.
    pub fn check_idle(&mut self) {
        let threshold = self.base_rtt.map_or(Duration::from_millis(100), |b| {
            (b * 2).max(Duration::from_millis(100))
        });
        if Instant::now().saturating_duration_since(self.last_sent) > threshold {
            self.cong_window = self.cong_window.min(INITIAL_WINDOW);
            self.base_rtt = None;
            self.measurements = 0;
            self.in_slow_start = true;
        }
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_window_starts_at_initial_and_stays_in_bounds() {
        let fc = FlowController::new();
        assert_eq!(fc.cong_window(), INITIAL_WINDOW);
    }

    #[test]
    fn ping_then_pong_records_base_rtt() {
        let mut fc = FlowController::new();
        let _fence = fc.send_rtt_ping();
        assert_eq!(fc.pending_pings(), 1);
        fc.on_pong();
        assert_eq!(fc.pending_pings(), 0);
        assert!(fc.base_rtt().is_some());
    }

    #[test]
    fn not_congested_before_any_bytes_are_sent() {
        let fc = FlowController::new();
        assert!(!fc.is_congested());
    }

    #[test]
    fn window_never_leaves_its_clamped_range() {
        let mut fc = FlowController::new();
        for _ in 0..10 {
            let _ = fc.send_rtt_ping();
            fc.on_pong();
        }
        assert!(fc.cong_window() >= MINIMUM_WINDOW);
        assert!(fc.cong_window() <= MAXIMUM_WINDOW);
    }
}
