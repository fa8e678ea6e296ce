//! The mapping engine: ordered rules turning input state into output
//! slot values.
//!
//! Two triggers drive a pass: a new input event (`tick_due = false`) and
//! the 1 ms tick (`tick_due = true`). The split exists for
//! absolute-to-relative rules, whose accumulator must advance exactly
//! once per tick no matter how many events arrive in between; every other
//! rule kind is a pure function of current state and safe to re-run on
//! every event.
//!
//! Rules run strictly in declaration order over a shared slot table, so a
//! later rule can read what an earlier rule wrote (chaining). A rule
//! whose target has no field in the descriptor we advertise is skipped
//! and counted, never fatal.

use heapless::{FnvIndexMap, Vec};

use hid_proto::{ReportDescriptor, ReportKind, Usage};

use crate::config::Config;
use crate::state::InputState;

/// Maximum rules in one config.
pub const MAX_RULES: usize = 32;

/// Extra (non-primary) sources of a combo rule.
pub const MAX_COMBO_EXTRA: usize = 3;

/// Output slot capacity (power of two for `FnvIndexMap`).
pub const MAX_SLOTS: usize = 64;

/// What a rule does with its source value(s).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RuleKind {
    /// Copy the source value to the same usage on the output side.
    Passthrough,
    /// Copy the source value to a different usage.
    KeyRemap,
    /// A GPIO pin acting as a key: nonzero source presses the target.
    GpioKey,
    /// Absolute axis to relative axis. The delta between tick samples is
    /// accumulated into the target; `divisor` scales it down (0 acts
    /// as 1).
    AbsToRel { divisor: u8 },
    /// Chord over the primary source plus up to [`MAX_COMBO_EXTRA`] more
    /// usages; the target fires on the transition to all-held and
    /// releases on the transition away, never on levels in between.
    Combo { extra: Vec<Usage, MAX_COMBO_EXTRA> },
}

/// One declarative transform from source usage(s) to a target usage.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MappingRule {
    pub kind: RuleKind,
    pub source: Usage,
    pub target: Usage,
}

/// Per-rule runtime state, parallel to the rule list and reset whenever
/// the config changes.
#[derive(Clone, Copy, Debug, Default)]
enum RuleState {
    #[default]
    None,
    /// Last tick-sampled absolute value.
    AbsToRel { last: Option<i32> },
    /// Whether the chord was fully held at the previous evaluation.
    Combo { active: bool },
}

/// Engine counters, snapshotted by the 1 Hz stats log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    /// Event-triggered passes.
    pub events: u32,
    /// Tick-triggered passes.
    pub ticks: u32,
    /// Rule evaluations dropped because the target usage has no field in
    /// the advertised descriptor.
    pub dropped_targets: u32,
}

/// Target-usage value table the assembler reads from.
///
/// Absolute values are overwritten on every pass; relative values are
/// accumulated here and zeroed by the driver once a report carrying them
/// went out.
#[derive(Debug, Default)]
pub struct OutputSlots {
    values: FnvIndexMap<Usage, i32, MAX_SLOTS>,
}

impl OutputSlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, usage: Usage) -> Option<i32> {
        self.values.get(&usage).copied()
    }

    /// Overwrite a slot. Returns false when the table is full and the
    /// usage is new.
    pub fn set(&mut self, usage: Usage, value: i32) -> bool {
        match self.values.get_mut(&usage) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => self.values.insert(usage, value).is_ok(),
        }
    }

    /// Accumulate into a slot (relative targets).
    pub fn add(&mut self, usage: Usage, delta: i32) -> bool {
        match self.values.get_mut(&usage) {
            Some(slot) => {
                *slot = slot.saturating_add(delta);
                true
            }
            None => self.values.insert(usage, delta).is_ok(),
        }
    }

    /// Slots in insertion order (the order rules first wrote them).
    pub fn iter(&self) -> impl Iterator<Item = (Usage, i32)> + '_ {
        self.values.iter().map(|(&u, &v)| (u, v))
    }

    /// Zero every slot backing a relative field of one report id. Called
    /// after that report was handed to the transport so each delta is
    /// sent once.
    pub fn clear_relative(&mut self, own: &ReportDescriptor, report_id: u8) {
        for field in own.report_fields(report_id, ReportKind::Input) {
            if !field.flags.is_relative() || field.flags.is_constant() {
                continue;
            }
            for (usage, value) in self.values.iter_mut() {
                if field.usages.contains(*usage) {
                    *value = 0;
                }
            }
        }
    }
}

/// Owns the active config and the per-rule runtime state.
#[derive(Debug, Default)]
pub struct MappingEngine {
    config: Config,
    rule_state: Vec<RuleState, MAX_RULES>,
    stats: Stats,
}

impl MappingEngine {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut engine = Self {
            config,
            rule_state: Vec::new(),
            stats: Stats::default(),
        };
        engine.reset_rule_state();
        engine
    }

    /// The active config.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutate the config through `f`, then drop all per-rule state so
    /// stale accumulators cannot leak across an edit.
    pub fn edit_config<R>(&mut self, f: impl FnOnce(&mut Config) -> R) -> R {
        let result = f(&mut self.config);
        self.reset_rule_state();
        result
    }

    /// Replace the whole config (boot-time load).
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
        self.reset_rule_state();
    }

    fn reset_rule_state(&mut self) {
        self.rule_state.clear();
        for _ in 0..self.config.rules.len() {
            let _ = self.rule_state.push(RuleState::None);
        }
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// One mapping pass over all rules, in order.
    ///
    /// `device` is the parsed downstream descriptor (used to fold
    /// absolute-axis wraparound into the source's logical span), `own`
    /// the descriptor we advertise (used to validate targets).
    pub fn process(
        &mut self,
        tick_due: bool,
        inputs: &InputState,
        device: &ReportDescriptor,
        own: &ReportDescriptor,
        slots: &mut OutputSlots,
    ) {
        if tick_due {
            self.stats.ticks = self.stats.ticks.wrapping_add(1);
        } else {
            self.stats.events = self.stats.events.wrapping_add(1);
        }

        // Targets written so far in this pass. Chaining only ever reads
        // these; slot values surviving from previous passes must not mask
        // an input that has since changed (a rule mapping a usage onto
        // itself would otherwise latch forever).
        let mut written: Vec<Usage, MAX_SLOTS> = Vec::new();

        for (index, rule) in self.config.rules.iter().enumerate() {
            if own.find_input(rule.target).is_none() {
                self.stats.dropped_targets = self.stats.dropped_targets.saturating_add(1);
                continue;
            }
            let state = match self.rule_state.get_mut(index) {
                Some(state) => state,
                None => continue,
            };
            match &rule.kind {
                RuleKind::Passthrough | RuleKind::KeyRemap | RuleKind::GpioKey => {
                    if let Some(value) = read_source(rule.source, slots, inputs, &written) {
                        slots.set(rule.target, value);
                        mark_written(&mut written, rule.target);
                    }
                }
                RuleKind::AbsToRel { divisor } => {
                    abs_to_rel(
                        rule, *divisor, tick_due, state, inputs, device, slots, &mut written,
                    );
                }
                RuleKind::Combo { extra } => {
                    combo(rule, extra, state, slots, inputs, &mut written);
                }
            }
        }
    }
}

/// Rule chaining: a source already written by an earlier rule in this
/// pass reads the fresh slot value; everything else reads the input
/// store.
fn read_source(
    usage: Usage,
    slots: &OutputSlots,
    inputs: &InputState,
    written: &[Usage],
) -> Option<i32> {
    if written.contains(&usage) {
        slots.get(usage)
    } else {
        inputs.get(usage)
    }
}

fn mark_written(written: &mut Vec<Usage, MAX_SLOTS>, usage: Usage) {
    if !written.contains(&usage) {
        let _ = written.push(usage);
    }
}

#[allow(clippy::too_many_arguments)]
fn abs_to_rel(
    rule: &MappingRule,
    divisor: u8,
    tick_due: bool,
    state: &mut RuleState,
    inputs: &InputState,
    device: &ReportDescriptor,
    slots: &mut OutputSlots,
    written: &mut Vec<Usage, MAX_SLOTS>,
) {
    // Events read state but never advance the accumulator; only the tick
    // does, so the emitted rate is tick-locked regardless of event jitter.
    if !tick_due {
        return;
    }
    let Some(current) = read_source(rule.source, slots, inputs, written) else {
        return;
    };
    let last = match state {
        RuleState::AbsToRel { last } => *last,
        _ => None,
    };
    if let Some(last) = last {
        let delta = wrap_delta(current, last, device.find_input(rule.source));
        let scaled = delta / i32::from(divisor.max(1));
        if scaled != 0 {
            slots.add(rule.target, scaled);
            mark_written(written, rule.target);
        }
    }
    *state = RuleState::AbsToRel {
        last: Some(current),
    };
}

/// Delta between two absolute samples, folded into the source field's
/// logical span so a wrapping axis (e.g. a dial crossing max back to min)
/// yields the shortest signed distance instead of a full-span jump.
fn wrap_delta(current: i32, last: i32, field: Option<hid_proto::FieldRef<'_>>) -> i32 {
    let raw = current.wrapping_sub(last);
    let Some(field) = field else {
        return raw;
    };
    let span = (field.field.logical_max as i64 - field.field.logical_min as i64) + 1;
    if span <= 1 {
        return raw;
    }
    let mut folded = raw as i64;
    if folded > span / 2 {
        folded -= span;
    } else if folded < -span / 2 {
        folded += span;
    }
    folded as i32
}

fn combo(
    rule: &MappingRule,
    extra: &[Usage],
    state: &mut RuleState,
    slots: &mut OutputSlots,
    inputs: &InputState,
    written: &mut Vec<Usage, MAX_SLOTS>,
) {
    let held = |usage: Usage| read_source(usage, slots, inputs, written).unwrap_or(0) != 0;
    let all_held = held(rule.source) && extra.iter().all(|&u| held(u));
    let was_active = matches!(state, RuleState::Combo { active: true });
    // Edge-triggered: write only on transitions, so the target cannot
    // repeat-fire on every event while the chord is held.
    if all_held && !was_active {
        slots.set(rule.target, 1);
        mark_written(written, rule.target);
    } else if !all_held && was_active {
        slots.set(rule.target, 0);
        mark_written(written, rule.target);
    }
    *state = RuleState::Combo { active: all_held };
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use hid_proto::usage::pages;

    /// Downstream: one 8-bit wrapping dial (0..=255) plus two buttons.
    const DEVICE: &[u8] = &[
        0x05, 0x01, 0x09, 0x05, 0xA1, 0x01, // gamepad collection
        0x09, 0x37, // Usage (Dial)
        0x15, 0x00, 0x26, 0xFF, 0x00, // Logical 0..255
        0x75, 0x08, 0x95, 0x01, 0x81, 0x02, //
        0x05, 0x09, 0x19, 0x01, 0x29, 0x02, // buttons 1..2
        0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x02, 0x81, 0x02, //
        0x75, 0x06, 0x95, 0x01, 0x81, 0x01, // pad
        0xC0,
    ];

    /// Advertised: relative X axis plus three buttons.
    const OWN: &[u8] = &[
        0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, // mouse collection
        0x05, 0x09, 0x19, 0x01, 0x29, 0x03, //
        0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x03, 0x81, 0x02, //
        0x75, 0x05, 0x95, 0x01, 0x81, 0x01, //
        0x05, 0x01, 0x09, 0x30, // Usage (X)
        0x15, 0x81, 0x25, 0x7F, 0x75, 0x08, 0x95, 0x01, 0x81, 0x06, //
        0xC0,
    ];

    const DIAL: Usage = Usage::new(pages::GENERIC_DESKTOP, 0x37);
    const X: Usage = Usage::new(pages::GENERIC_DESKTOP, 0x30);
    const B1: Usage = Usage::new(pages::BUTTON, 1);
    const B2: Usage = Usage::new(pages::BUTTON, 2);
    const B3: Usage = Usage::new(pages::BUTTON, 3);

    fn engine_with(rules: &[MappingRule]) -> MappingEngine {
        let mut config = Config::default();
        for rule in rules {
            config.rules.push(rule.clone()).unwrap();
        }
        MappingEngine::new(config)
    }

    fn descriptors() -> (ReportDescriptor, ReportDescriptor) {
        (
            ReportDescriptor::parse(DEVICE).unwrap(),
            ReportDescriptor::parse(OWN).unwrap(),
        )
    }

    #[test]
    fn passthrough_copies_level() {
        let (device, own) = descriptors();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::Passthrough,
            source: B1,
            target: B1,
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(B1, 1, 0);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B1), Some(1));

        inputs.set(B1, 0, 1);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B1), Some(0));
    }

    #[test]
    fn later_pass_reads_inputs_not_stale_slots() {
        let (device, own) = descriptors();
        // Rule 1 reads B2 before rule 2 writes it, so B2's slot carries a
        // value from the previous pass when rule 1 runs.
        let mut engine = engine_with(&[
            MappingRule {
                kind: RuleKind::KeyRemap,
                source: B2,
                target: B3,
            },
            MappingRule {
                kind: RuleKind::KeyRemap,
                source: B1,
                target: B2,
            },
        ]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(B1, 1, 0);
        inputs.set(B2, 0, 0);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B2), Some(1));
        assert_eq!(slots.get(B3), Some(0));

        // B1 released: rule 1 must read the B2 *input* (0), not the slot
        // rule 2 wrote last pass.
        inputs.set(B1, 0, 1);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B2), Some(0));
        assert_eq!(slots.get(B3), Some(0));
    }

    #[test]
    fn accumulator_advances_only_on_ticks() {
        let (device, own) = descriptors();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::AbsToRel { divisor: 1 },
            source: DIAL,
            target: X,
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        // Prime the accumulator.
        inputs.set(DIAL, 100, 0);
        engine.process(true, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(X), None);

        // Five events inside one tick window move the axis to 150; events
        // must not advance anything.
        for (i, value) in [110, 120, 130, 140, 150].iter().enumerate() {
            inputs.set(DIAL, *value, 1 + i as u64);
            engine.process(false, &inputs, &device, &own, &mut slots);
            assert_eq!(slots.get(X), None);
        }

        // The tick computes the delta once: 50, not 5 partial deltas.
        engine.process(true, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(X), Some(50));

        // A tick without movement adds nothing.
        engine.process(true, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(X), Some(50));
    }

    #[test]
    fn dial_wraparound_takes_shortest_distance() {
        let (device, own) = descriptors();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::AbsToRel { divisor: 1 },
            source: DIAL,
            target: X,
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(DIAL, 250, 0);
        engine.process(true, &inputs, &device, &own, &mut slots);
        // 250 -> 4 across the wrap is +10, not -246.
        inputs.set(DIAL, 4, 1);
        engine.process(true, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(X), Some(10));
    }

    #[test]
    fn combo_fires_on_edges_only() {
        let (device, own) = descriptors();
        let mut extra = Vec::new();
        extra.push(B2).unwrap();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::Combo { extra },
            source: B1,
            target: B3,
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(B1, 1, 0);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B3), None);

        inputs.set(B2, 1, 1);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B3), Some(1));

        // Held: later passes must not rewrite (another rule could have
        // chained off the slot meanwhile).
        slots.set(B3, 7);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B3), Some(7));

        inputs.set(B1, 0, 2);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B3), Some(0));
    }

    #[test]
    fn rules_chain_in_order() {
        let (device, own) = descriptors();
        // First rule writes B2's slot from B1; second reads B2 (now the
        // slot value, not input state) into B3.
        let mut engine = engine_with(&[
            MappingRule {
                kind: RuleKind::KeyRemap,
                source: B1,
                target: B2,
            },
            MappingRule {
                kind: RuleKind::KeyRemap,
                source: B2,
                target: B3,
            },
        ]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(B1, 1, 0);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(B2), Some(1));
        assert_eq!(slots.get(B3), Some(1));
    }

    #[test]
    fn unknown_target_is_skipped_and_counted() {
        let (device, own) = descriptors();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::KeyRemap,
            source: B1,
            // Keyboard 'A' has no field in the advertised descriptor.
            target: Usage::new(pages::KEYBOARD, 0x04),
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(B1, 1, 0);
        engine.process(false, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(Usage::new(pages::KEYBOARD, 0x04)), None);
        assert_eq!(engine.stats().dropped_targets, 1);
    }

    #[test]
    fn editing_config_resets_accumulators() {
        let (device, own) = descriptors();
        let mut engine = engine_with(&[MappingRule {
            kind: RuleKind::AbsToRel { divisor: 1 },
            source: DIAL,
            target: X,
        }]);
        let mut inputs = InputState::new();
        let mut slots = OutputSlots::new();

        inputs.set(DIAL, 100, 0);
        engine.process(true, &inputs, &device, &own, &mut slots);

        engine.edit_config(|_| ());

        // Next tick re-primes instead of emitting a delta from the stale
        // sample.
        inputs.set(DIAL, 200, 1);
        engine.process(true, &inputs, &device, &own, &mut slots);
        assert_eq!(slots.get(X), None);
    }

    #[test]
    fn clear_relative_only_touches_relative_fields() {
        let (_, own) = descriptors();
        let mut slots = OutputSlots::new();
        slots.set(X, 12);
        slots.set(B1, 1);

        slots.clear_relative(&own, 0);
        assert_eq!(slots.get(X), Some(0));
        assert_eq!(slots.get(B1), Some(1));
    }
}
