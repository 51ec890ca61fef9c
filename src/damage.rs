use anyhow::{Result, bail};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, RingBuffer};

use crate::digits::{DamageReading, DigitReadError, DigitRecognizer};
use crate::frame::{PixelGrid, Region};

// =============================================================================
// Debounce Knobs
// =============================================================================

#[derive(Debug, Clone)]
pub struct DamageTrackerConfig {
    /// Identical consecutive readings needed before a nonzero value is accepted.
    pub confirmations: usize,
    /// Identical consecutive zero readings needed before a reset is accepted.
    pub zero_confirmations: usize,
    /// Frames without a visible `%` that count as the readout disappearing.
    pub missing_percent_threshold: u32,
    /// Emulator frames between two observations.
    pub frames_per_step: u32,
}

impl Default for DamageTrackerConfig {
    fn default() -> Self {
        Self {
            confirmations: 3,
            zero_confirmations: 3,
            missing_percent_threshold: 12,
            frames_per_step: 4,
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Turns noisy per-frame damage readings into a stable damage value and
/// death events.
///
/// Damage only goes up while a character is alive. A drop to zero is only
/// believed after the readout vanished for a while (the respawn animation
/// hides it), which filters out misreads of a single frame.
pub struct DamageTracker {
    config: DamageTrackerConfig,
    recent: HeapRb<u16>,
    curr_damage: u16,
    damage_at_last_reward: i32,
    missing_percent_streak: u32,
    zero_streak: usize,
    has_processed_death: bool,
    met_reset_threshold: bool,
    reader: Option<(DigitRecognizer, Region)>,
}

impl DamageTracker {
    pub fn new(config: DamageTrackerConfig) -> Self {
        let capacity = config.confirmations.max(config.zero_confirmations).max(1);
        let mut recent = HeapRb::new(capacity);
        for _ in 0..capacity {
            recent.push_overwrite(0);
        }
        Self {
            config,
            recent,
            curr_damage: 0,
            damage_at_last_reward: 0,
            missing_percent_streak: 0,
            zero_streak: 0,
            has_processed_death: false,
            met_reset_threshold: false,
            reader: None,
        }
    }

    /// Attaches the recognizer used by [`DamageTracker::observe_grid`].
    pub fn with_reader(mut self, recognizer: DigitRecognizer, region: Region) -> Self {
        self.reader = Some((recognizer, region));
        self
    }

    pub fn set_frames_per_step(&mut self, frames: u32) {
        self.config.frames_per_step = frames;
    }

    pub fn current_damage(&self) -> u16 {
        self.curr_damage
    }

    pub fn missing_percent_streak(&self) -> u32 {
        self.missing_percent_streak
    }

    pub fn met_reset_threshold(&self) -> bool {
        self.met_reset_threshold
    }

    /// Reads the readout region of `screen` and feeds the result to the tracker.
    pub fn observe_grid(&mut self, screen: &PixelGrid) -> Result<DamageReading> {
        let Some((recognizer, region)) = self.reader.as_mut() else {
            bail!("damage tracker has no recognizer attached");
        };
        let reading = recognizer.recognize_in(screen, *region)?;
        self.observe(reading);
        if reading == Ok(0) && self.zero_streak >= self.config.zero_confirmations {
            if let Some((recognizer, _)) = self.reader.as_mut() {
                recognizer.confirm_zero_color();
            }
        }
        Ok(reading)
    }

    pub fn observe(&mut self, reading: DamageReading) {
        match reading {
            Ok(value) => self.observe_value(value),
            Err(DigitReadError::PercentUndetected) => {
                self.missing_percent_streak += 1;
                let missing_frames = self.missing_percent_streak.saturating_mul(self.config.frames_per_step);
                if missing_frames >= self.config.missing_percent_threshold && !self.met_reset_threshold {
                    tracing::debug!(missing_frames, "damage readout gone, zero allowed");
                    self.met_reset_threshold = true;
                }
            }
            Err(_) => {
                self.missing_percent_streak = 0;
                self.zero_streak = 0;
            }
        }
    }

    fn observe_value(&mut self, value: u16) {
        self.missing_percent_streak = 0;
        self.zero_streak = if value == 0 { self.zero_streak + 1 } else { 0 };
        let previous = self.recent.iter().last().copied().unwrap_or(0);
        if value != 0 && previous != 0 {
            self.met_reset_threshold = false;
        }
        self.recent.push_overwrite(value);

        let required = if value == 0 {
            self.config.zero_confirmations
        } else {
            self.config.confirmations
        };
        let skip = self.recent.occupied_len().saturating_sub(required);
        if !self.recent.iter().skip(skip).all(|&r| r == value) {
            return;
        }

        if value != 0 && value >= self.curr_damage {
            self.curr_damage = value;
        } else if value == 0 && self.met_reset_threshold {
            let old = self.curr_damage;
            tracing::debug!(old, "damage reset, counting a death");
            self.curr_damage = 0;
            self.damage_at_last_reward -= old as i32;
            self.has_processed_death = true;
            self.met_reset_threshold = false;
        }
    }

    /// Returns whether a death happened and the damage taken since the last call.
    ///
    /// Damage taken just before a death is still reported once.
    pub fn consume_delta(&mut self) -> (bool, i32) {
        let died = std::mem::take(&mut self.has_processed_death);
        let delta = self.curr_damage as i32 - self.damage_at_last_reward;
        self.damage_at_last_reward = self.curr_damage as i32;
        (died, delta)
    }

    /// Forgets everything except the attached reader.
    pub fn reset(&mut self) {
        let reader = self.reader.take();
        *self = Self::new(self.config.clone());
        self.reader = reader;
    }
}
