//! Dynamic timer-frequency governor
//!
//! A background system process that samples scheduler load every
//! `SAMPLING_INTERVAL` ticks and retunes the PIT between `MIN_TIMER_FREQ`
//! and `MAX_TIMER_FREQ`. The controller is a fixed-point blend of
//! proportional learning, momentum, and a short prediction window over
//! recent samples; hysteresis keeps it from chattering the timer.

use crate::{
    arch::x86_64::pit,
    config::*,
    process, sched,
};

/// Fixed-point scale (10 fractional bits).
const FXP_SHIFT: u32 = 10;
const FXP_SCALE: i64 = 1 << FXP_SHIFT;

/// Context-switch rate (per tick, fixed point) treated as thrashing.
const CS_EMERGENCY_RATE: i64 = 15 * FXP_SCALE;
const CS_HIGH_RATE: i64 = 8 * FXP_SCALE;
const CS_LOW_RATE: i64 = 3 * FXP_SCALE;

/// Hz added per runnable process.
const HZ_PER_PROCESS: u32 = 50;
/// Hz added per queued process when queues back up.
const QUEUE_PRESSURE_FACTOR: u32 = 10;

/// Power states ordered by aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Idle,
    Balanced,
    Performance,
    Emergency,
}

/// One load observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSample {
    pub ticks_delta: u64,
    pub process_count: u32,
    pub ready_count: u32,
    pub context_switch_delta: u64,
    pub total_queue_depth: u32,
    pub max_queue_depth: u32,
    pub rt_queue_depth: u32,
    pub active_queues: u32,
}

/// Recorded history entry feeding the prediction window.
#[derive(Debug, Clone, Copy, Default)]
struct HistoryEntry {
    context_switches: u64,
    frequency: u16,
}

/// Controller state.
pub struct Governor {
    current_freq: u16,
    power_state: PowerState,
    learning_rate: i64,
    momentum: i64,
    prediction_weight: i64,
    last_adjustment: i64,
    emergency_boosts: u32,
    stability: u32,
    consecutive_high: u32,
    consecutive_low: u32,
    history: [HistoryEntry; FREQ_HISTORY_SIZE],
    history_index: usize,
    samples: u64,
}

impl Governor {
    pub fn new(initial_freq: u16) -> Self {
        Self {
            current_freq: initial_freq,
            power_state: PowerState::Balanced,
            // 0.25, 0.8 and 0.3 in fixed point.
            learning_rate: FXP_SCALE / 4,
            momentum: FXP_SCALE * 4 / 5,
            prediction_weight: FXP_SCALE * 3 / 10,
            last_adjustment: 0,
            emergency_boosts: 0,
            stability: 0,
            consecutive_high: 0,
            consecutive_low: 0,
            history: [HistoryEntry::default(); FREQ_HISTORY_SIZE],
            history_index: 0,
            samples: 0,
        }
    }

    pub fn current_frequency(&self) -> u16 {
        self.current_freq
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    /// Raw demand estimate before learning and clamping.
    fn target_frequency(&mut self, s: &LoadSample, cs_rate: i64) -> u32 {
        let mut target = BASELINE_TIMER_FREQ as u32;

        // More runnable work wants more ticks; real-time depth doubly so.
        if s.process_count > 1 {
            target += (s.process_count - 1) * HZ_PER_PROCESS
                + s.rt_queue_depth * (HZ_PER_PROCESS / 2);
        }

        // Queue pressure, weighted up when many levels are busy.
        if s.max_queue_depth > 2 {
            let pressure = if s.active_queues > 2 {
                QUEUE_PRESSURE_FACTOR * 2
            } else {
                QUEUE_PRESSURE_FACTOR
            };
            target += s.max_queue_depth * pressure;
        }

        // Context-switch rate: boost under churn, relax when calm.
        if cs_rate > CS_EMERGENCY_RATE {
            target = (target * 3) / 2;
            self.emergency_boosts += 1;
            self.consecutive_high += 1;
            self.consecutive_low = 0;
            if self.emergency_boosts > 3 {
                self.power_state = PowerState::Emergency;
                target = MAX_TIMER_FREQ as u32;
            }
        } else if cs_rate > CS_HIGH_RATE {
            target = (target * 13) / 10;
            self.consecutive_high += 1;
            self.consecutive_low = 0;
            self.emergency_boosts = 0;
        } else if cs_rate < CS_LOW_RATE && s.process_count > 1 {
            target = (target * 85) / 100;
            self.consecutive_low += 1;
            self.consecutive_high = 0;
            self.emergency_boosts = 0;
        } else {
            self.emergency_boosts = 0;
        }

        // Prediction window: if the recent trend says switching is about
        // to rise, lean into it early.
        if self.samples as usize > PREDICTION_WINDOW {
            let mut predicted: u64 = 0;
            let mut weight: u64 = 0;
            for i in 1..=PREDICTION_WINDOW {
                let idx =
                    (self.history_index + FREQ_HISTORY_SIZE - i) % FREQ_HISTORY_SIZE;
                predicted += self.history[idx].context_switches;
                weight += (PREDICTION_WINDOW - i + 1) as u64;
            }
            predicted = predicted * weight
                / (PREDICTION_WINDOW * (PREDICTION_WINDOW + 1) / 2) as u64
                / PREDICTION_WINDOW as u64;

            if predicted > s.context_switch_delta + s.context_switch_delta / 5 {
                target += ((target as i64 * self.prediction_weight) >> FXP_SHIFT) as u32;
            }
        }

        // Power-state selection from sustained load.
        let load_pct = s.total_queue_depth * 100 / MAX_PROCESSES as u32;
        if self.consecutive_low > 8 && s.process_count <= 2 {
            self.power_state = PowerState::Idle;
            target = MIN_TIMER_FREQ as u32;
        } else if load_pct > 75 || self.emergency_boosts > 0 {
            self.power_state = PowerState::Emergency;
            target = (target * 3) / 2;
        } else if self.consecutive_high > 4 || load_pct > 50 {
            self.power_state = PowerState::Performance;
            target = (target * 7) / 5;
        } else {
            self.power_state = PowerState::Balanced;
        }

        target
    }

    /// Feed one sample; returns the new frequency when the timer should
    /// be reprogrammed, or None inside the hysteresis band.
    pub fn update(&mut self, s: &LoadSample) -> Option<u16> {
        let ticks = s.ticks_delta.max(1);
        let cs_rate = (s.context_switch_delta as i64 * FXP_SCALE) / ticks as i64;

        let target = self.target_frequency(s, cs_rate) as i64;

        // Learning with momentum: move a fraction of the error, carried
        // by the previous adjustment.
        let rate = match self.power_state {
            PowerState::Performance | PowerState::Emergency => self.learning_rate * 3 / 2,
            PowerState::Idle => self.learning_rate * 3 / 4,
            PowerState::Balanced => self.learning_rate,
        };
        let diff = target - self.current_freq as i64;
        let mut adjustment = diff * rate;
        adjustment += (self.momentum * self.last_adjustment) >> FXP_SHIFT;
        self.last_adjustment = adjustment;

        let mut new_freq = self.current_freq as i64 + (adjustment >> FXP_SHIFT);

        // Power-state dependent bounds.
        let min = match self.power_state {
            PowerState::Idle => MIN_TIMER_FREQ as i64,
            _ => (MIN_TIMER_FREQ as i64 + BASELINE_TIMER_FREQ as i64) / 2,
        };
        let max = match self.power_state {
            PowerState::Performance | PowerState::Emergency => MAX_TIMER_FREQ as i64,
            _ => MAX_TIMER_FREQ as i64 * 4 / 5,
        };
        new_freq = new_freq.clamp(min, max);

        // Smooth over four samples.
        new_freq = (new_freq + 3 * self.current_freq as i64) / 4;
        let new_freq = new_freq as u16;

        self.record(s, new_freq);

        // Hysteresis, halved once the controller has been stable a while.
        let band = if self.stability > STABILITY_REQUIREMENT {
            HYSTERESIS_THRESHOLD / 2
        } else {
            HYSTERESIS_THRESHOLD
        };
        if new_freq.abs_diff(self.current_freq) > band {
            self.current_freq = new_freq;
            self.stability = 0;
            Some(new_freq)
        } else {
            self.stability += 1;
            None
        }
    }

    fn record(&mut self, s: &LoadSample, frequency: u16) {
        self.history[self.history_index % FREQ_HISTORY_SIZE] = HistoryEntry {
            context_switches: s.context_switch_delta,
            frequency,
        };
        self.history_index = (self.history_index + 1) % FREQ_HISTORY_SIZE;
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Collect one load sample from the live scheduler and process table.
fn sample_system(last_ticks: u64, last_switches: u64) -> (LoadSample, u64, u64) {
    let sched = sched::scheduler();
    let table = process::table();

    let (total, max, rt, active) = sched.queue_depths();
    let now = sched.ticks;
    let switches = sched.context_switches();

    let sample = LoadSample {
        ticks_delta: now.saturating_sub(last_ticks),
        process_count: table.active_popcount(),
        ready_count: table.ready_bitmap().count_ones(),
        context_switch_delta: switches.saturating_sub(last_switches),
        total_queue_depth: total,
        max_queue_depth: max,
        rt_queue_depth: rt,
        active_queues: active,
    };
    (sample, now, switches)
}

/// Entry point of the governor process.
pub fn governor_entry() {
    log::info!("governor: online at {} Hz", pit::current_frequency());

    let mut governor = Governor::new(pit::current_frequency());
    let mut last_ticks = sched::ticks();
    let mut last_switches = 0u64;

    loop {
        if sched::ticks().saturating_sub(last_ticks) >= SAMPLING_INTERVAL {
            let (sample, now, switches) = sample_system(last_ticks, last_switches);
            last_ticks = now;
            last_switches = switches;

            if let Some(freq) = governor.update(&sample) {
                pit::set_frequency(freq);
            }

            if governor.samples() % 100 == 0 {
                log::info!(
                    "governor: {} Hz, {} queued, cs/interval {}, state {:?}",
                    governor.current_frequency(),
                    sample.total_queue_depth,
                    sample.context_switch_delta,
                    governor.power_state()
                );
            }
        }

        process::lifecycle::reap_zombies();
        sched::yield_now();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn busy_sample() -> LoadSample {
        LoadSample {
            ticks_delta: SAMPLING_INTERVAL,
            process_count: 20,
            ready_count: 16,
            context_switch_delta: 12 * SAMPLING_INTERVAL,
            total_queue_depth: 24,
            max_queue_depth: 8,
            rt_queue_depth: 4,
            active_queues: 4,
        }
    }

    fn idle_sample() -> LoadSample {
        LoadSample {
            ticks_delta: SAMPLING_INTERVAL,
            process_count: 1,
            ready_count: 0,
            context_switch_delta: 0,
            total_queue_depth: 0,
            max_queue_depth: 0,
            rt_queue_depth: 0,
            active_queues: 0,
        }
    }

    #[test]
    fn sustained_load_raises_frequency() {
        let mut governor = Governor::new(BASELINE_TIMER_FREQ);
        let mut raised = false;
        for _ in 0..50 {
            if governor.update(&busy_sample()).is_some()
                && governor.current_frequency() > BASELINE_TIMER_FREQ
            {
                raised = true;
            }
        }
        assert!(raised, "busy system should drive the frequency up");
        assert!(governor.current_frequency() <= MAX_TIMER_FREQ);
    }

    #[test]
    fn sustained_idle_lowers_frequency() {
        let mut governor = Governor::new(MAX_TIMER_FREQ);
        for _ in 0..60 {
            governor.update(&idle_sample());
        }
        assert!(
            governor.current_frequency() < MAX_TIMER_FREQ,
            "idle system should relax the timer"
        );
        assert!(governor.current_frequency() >= MIN_TIMER_FREQ);
    }

    #[test]
    fn frequency_stays_clamped() {
        let mut governor = Governor::new(BASELINE_TIMER_FREQ);
        let mut thrash = busy_sample();
        thrash.context_switch_delta = 100 * SAMPLING_INTERVAL;
        for _ in 0..100 {
            governor.update(&thrash);
            assert!(governor.current_frequency() <= MAX_TIMER_FREQ);
            assert!(governor.current_frequency() >= MIN_TIMER_FREQ);
        }
        assert_eq!(governor.power_state(), PowerState::Emergency);
    }

    #[test]
    fn hysteresis_suppresses_small_changes() {
        let mut governor = Governor::new(BASELINE_TIMER_FREQ);
        // A sample matching the baseline demand produces near-zero error.
        let calm = LoadSample {
            ticks_delta: SAMPLING_INTERVAL,
            process_count: 2,
            ready_count: 1,
            context_switch_delta: 4 * SAMPLING_INTERVAL,
            total_queue_depth: 1,
            max_queue_depth: 1,
            rt_queue_depth: 0,
            active_queues: 1,
        };
        governor.update(&calm);
        let settled = governor.current_frequency();
        let mut reprograms = 0;
        for _ in 0..20 {
            if governor.update(&calm).is_some() {
                reprograms += 1;
            }
        }
        assert!(
            reprograms <= 2,
            "calm load should not keep reprogramming the timer (got {}, at {} Hz)",
            reprograms,
            settled
        );
    }
}
