//! BBR-style delivery-rate congestion model for a single TCP endpoint.
//!
//! Gains are fixed-point, scaled by [`GAIN_SCALE`] -- this kernel has no
//! floating point anywhere else (no FPU state is assumed live outside a
//! task context switch), so congestion control stays on the same integer
//! footing as the scheduler's quantum math.

use crate::arch::timer::get_ticks;

/// Fixed-point scale for gain factors: a gain of `GAIN_SCALE` means 1.0x.
pub const GAIN_SCALE: u64 = 256;

/// BBR operates in one of four modes, cycling STARTUP -> DRAIN -> PROBE_BW
/// forever, with periodic excursions into PROBE_RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrMode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// The eight-phase pacing-gain cycle PROBE_BW rotates through, scaled by
/// [`GAIN_SCALE`]. One phase (1.25x) probes for more bandwidth; the next
/// (0.75x) drains the queue that probe built up; the rest hold steady.
const PROBE_BW_CYCLE: [u64; 8] = [320, 192, 256, 256, 256, 256, 256, 256];

/// PROBE_RTT is entered at most this often.
const PROBE_RTT_INTERVAL_TICKS: u64 = 10 * crate::arch::timer::TICK_HZ;

/// Consecutive round trips STARTUP tolerates without the required 25%
/// bandwidth growth before it exits to DRAIN.
const STARTUP_ROUND_TRIPS_WITHOUT_GROWTH: u32 = 3;

#[derive(Debug, Clone)]
pub struct BbrModel {
    /// Smallest RTT sample ever observed, in timer ticks.
    pub min_rtt_ticks: u64,
    tick_at_min_rtt: u64,
    /// Windowed maximum delivery rate, in bytes per tick.
    pub bottleneck_bw: u64,
    pub pacing_gain: u64,
    pub cwnd_gain: u64,
    pub mode: BbrMode,
    pub cycle_index: usize,
    tick_at_cycle_start: u64,
    tick_at_probe_rtt: u64,
    rounds_without_growth: u32,
    bw_at_round_start: u64,
}

impl BbrModel {
    pub fn new() -> Self {
        Self {
            min_rtt_ticks: u64::MAX,
            tick_at_min_rtt: 0,
            bottleneck_bw: 0,
            pacing_gain: PROBE_BW_CYCLE[0].max(256), // STARTUP's own gain, set below
            cwnd_gain: 256,
            mode: BbrMode::Startup,
            cycle_index: 0,
            tick_at_cycle_start: get_ticks(),
            tick_at_probe_rtt: get_ticks(),
            rounds_without_growth: 0,
            bw_at_round_start: 0,
        }
    }

    /// STARTUP's gain: `2/ln(2)` is the textbook BBR constant (doubles
    /// delivery rate each round trip); scaled to our fixed point that's
    /// `≈739/256`.
    const STARTUP_GAIN: u64 = 739;

    /// Feeds one acknowledged round-trip sample `(rtt_ticks, delivered_bytes)`
    /// into the model, per spec: update `min_rtt`, fold the delivery rate
    /// into the windowed `bottleneck_bw` max, then run the mode machine.
    pub fn on_ack_sample(&mut self, rtt_ticks: u64, delivered_bytes: u64, inflight_bytes: u64) {
        let now = get_ticks();

        if rtt_ticks < self.min_rtt_ticks {
            self.min_rtt_ticks = rtt_ticks;
            self.tick_at_min_rtt = now;
        }

        let rtt = rtt_ticks.max(1);
        let bw_sample = delivered_bytes / rtt;
        if bw_sample > self.bottleneck_bw {
            self.bottleneck_bw = bw_sample;
        }

        match self.mode {
            BbrMode::Startup => {
                self.pacing_gain = Self::STARTUP_GAIN;
                self.cwnd_gain = Self::STARTUP_GAIN;
                if self.bottleneck_bw >= self.bw_at_round_start + self.bw_at_round_start / 4 {
                    self.rounds_without_growth = 0;
                    self.bw_at_round_start = self.bottleneck_bw;
                } else {
                    self.rounds_without_growth += 1;
                    if self.rounds_without_growth >= STARTUP_ROUND_TRIPS_WITHOUT_GROWTH {
                        self.enter_drain(now);
                    }
                }
            }
            BbrMode::Drain => {
                self.pacing_gain = (GAIN_SCALE * GAIN_SCALE) / Self::STARTUP_GAIN;
                self.cwnd_gain = Self::STARTUP_GAIN;
                if inflight_bytes <= self.bdp() {
                    self.enter_probe_bw(now);
                }
            }
            BbrMode::ProbeBw => {
                self.cwnd_gain = 512;
                if now.saturating_sub(self.tick_at_cycle_start) >= self.min_rtt_ticks.max(1) {
                    self.cycle_index = (self.cycle_index + 1) % PROBE_BW_CYCLE.len();
                    self.tick_at_cycle_start = now;
                }
                self.pacing_gain = PROBE_BW_CYCLE[self.cycle_index];
                if now.saturating_sub(self.tick_at_probe_rtt) >= PROBE_RTT_INTERVAL_TICKS {
                    self.enter_probe_rtt(now);
                }
            }
            BbrMode::ProbeRtt => {
                self.pacing_gain = 256;
                self.cwnd_gain = 128;
                if now.saturating_sub(self.tick_at_probe_rtt) >= self.min_rtt_ticks.max(1) {
                    self.enter_probe_bw(now);
                }
            }
        }
    }

    fn enter_drain(&mut self, now: u64) {
        self.mode = BbrMode::Drain;
        self.tick_at_cycle_start = now;
    }

    fn enter_probe_bw(&mut self, now: u64) {
        self.mode = BbrMode::ProbeBw;
        self.cycle_index = 0;
        self.tick_at_cycle_start = now;
        self.tick_at_probe_rtt = now;
    }

    fn enter_probe_rtt(&mut self, now: u64) {
        self.mode = BbrMode::ProbeRtt;
        self.tick_at_probe_rtt = now;
    }

    /// Bandwidth-delay product: the in-flight volume the pipe can hold at
    /// the current `bottleneck_bw`/`min_rtt` estimate.
    pub fn bdp(&self) -> u64 {
        if self.min_rtt_ticks == u64::MAX {
            return 0;
        }
        self.bottleneck_bw * self.min_rtt_ticks
    }

    /// Effective congestion window: `cwnd_gain * bottleneck_bw * min_rtt`.
    pub fn cwnd(&self) -> u64 {
        (self.cwnd_gain * self.bdp()) / GAIN_SCALE
    }

    /// Pacing rate in bytes per tick: `pacing_gain * bottleneck_bw`.
    pub fn pacing_rate(&self) -> u64 {
        (self.pacing_gain * self.bottleneck_bw) / GAIN_SCALE
    }
}

impl Default for BbrModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_begins_with_the_doubling_gain() {
        let model = BbrModel::new();
        assert_eq!(model.mode, BbrMode::Startup);
        assert_eq!(model.bottleneck_bw, 0);
    }

    #[test]
    fn bandwidth_sample_updates_the_windowed_maximum() {
        let mut model = BbrModel::new();
        model.on_ack_sample(10, 1000, 500);
        assert_eq!(model.bottleneck_bw, 100);
        model.on_ack_sample(10, 400, 500);
        // a lower sample never pulls the windowed max back down
        assert_eq!(model.bottleneck_bw, 100);
    }

    #[test]
    fn min_rtt_only_ever_shrinks() {
        let mut model = BbrModel::new();
        model.on_ack_sample(50, 1000, 500);
        assert_eq!(model.min_rtt_ticks, 50);
        model.on_ack_sample(80, 1000, 500);
        assert_eq!(model.min_rtt_ticks, 50);
        model.on_ack_sample(20, 1000, 500);
        assert_eq!(model.min_rtt_ticks, 20);
    }

    #[test]
    fn stalled_bandwidth_growth_exits_startup_to_drain() {
        let mut model = BbrModel::new();
        model.on_ack_sample(10, 10_000, 0);
        for _ in 0..STARTUP_ROUND_TRIPS_WITHOUT_GROWTH {
            model.on_ack_sample(10, 10_000, 0);
        }
        assert_eq!(model.mode, BbrMode::Drain);
    }

    #[test]
    fn drain_exits_to_probe_bw_once_inflight_clears_the_bdp() {
        let mut model = BbrModel::new();
        model.mode = BbrMode::Drain;
        model.bottleneck_bw = 100;
        model.min_rtt_ticks = 10;
        model.on_ack_sample(10, 1000, 0);
        assert_eq!(model.mode, BbrMode::ProbeBw);
    }
}
