//! C4 — the counter-threshold state machine.
//!
//! `decide` is the pure decision function: given the current internal
//! health, the freshly-incremented counter, the configured threshold, the
//! masked counter word, and which direction the observation reports,
//! compute the next internal health (if any). It touches neither the
//! store nor the event bus, so the scenarios in spec §8 can be asserted
//! directly against it.

/// The four-state hysteretic health variable, stored as 1..4 in the
/// shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalHealth {
    Healthy = 1,
    Unhealthy = 2,
    MostlyHealthy = 3,
    MostlyUnhealthy = 4,
}

impl InternalHealth {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(InternalHealth::Healthy),
            2 => Some(InternalHealth::Unhealthy),
            3 => Some(InternalHealth::MostlyHealthy),
            4 => Some(InternalHealth::MostlyUnhealthy),
            _ => None,
        }
    }

    /// The public boolean verdict: true iff internal health is healthy or
    /// mostly_healthy.
    pub fn as_bool(self) -> bool {
        matches!(self, InternalHealth::Healthy | InternalHealth::MostlyHealthy)
    }
}

/// Which direction an observation points: a success-shaped report or a
/// failure-shaped one (TCP/HTTP/timeout all report "unhealthy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Healthy,
    Unhealthy,
}

impl ReportKind {
    fn as_internal(self) -> InternalHealth {
        match self {
            ReportKind::Healthy => InternalHealth::Healthy,
            ReportKind::Unhealthy => InternalHealth::Unhealthy,
        }
    }
}

impl InternalHealth {
    /// True when `report` cannot move the needle: we are already fully
    /// saturated in that direction, per §4.4's fast-path shortcut #3.
    pub fn is_saturated_same(self, report: ReportKind) -> bool {
        matches!(
            (self, report),
            (InternalHealth::Healthy, ReportKind::Healthy)
                | (InternalHealth::Unhealthy, ReportKind::Unhealthy)
        )
    }
}

/// The outcome of one slow-path evaluation: the word to persist (if it
/// changed) and the new health (if it changed), per §4.4 steps 3-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub new_word: u32,
    pub new_health: Option<InternalHealth>,
}

/// Evaluate one observation against the counter-threshold state machine.
///
/// `word` is the freshly-incremented 32-bit word (post `incr_counter`);
/// `ctr` is the extracted byte for `selector`; `current` is the health
/// before this observation.
pub fn decide(
    current: InternalHealth,
    ctr: u8,
    threshold: u8,
    word: u32,
    report: ReportKind,
    selector: crate::target::Selector,
) -> Decision {
    let masked = crate::target::CounterWord(word).masked_for(selector);
    let masked_word = crate::target::CounterWord(masked);

    let new_health = if ctr >= threshold {
        Some(report.as_internal())
    } else if current == InternalHealth::Healthy && masked_word.has_any_failure() {
        Some(InternalHealth::MostlyHealthy)
    } else if current == InternalHealth::Unhealthy && masked_word.success_byte() != 0 {
        Some(InternalHealth::MostlyUnhealthy)
    } else {
        None
    };

    Decision {
        new_word: masked,
        new_health: new_health.filter(|h| *h != current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Selector;

    #[test]
    fn rise_from_unhealthy_crosses_on_the_fifth_success() {
        // scenario 1: healthy.successes = 5, four prior successes already
        // counted (ctr=4, below threshold) keep mostly_unhealthy.
        let d = decide(InternalHealth::Unhealthy, 4, 5, 4, ReportKind::Healthy, Selector::Success);
        assert_eq!(d.new_health, Some(InternalHealth::MostlyUnhealthy));

        // the fifth success crosses the threshold: full transition.
        let d = decide(InternalHealth::MostlyUnhealthy, 5, 5, 5, ReportKind::Healthy, Selector::Success);
        assert_eq!(d.new_health, Some(InternalHealth::Healthy));
    }

    #[test]
    fn masked_counter_moves_healthy_to_mostly_healthy() {
        // scenario 2: healthy target, one HTTP failure, threshold 5 not
        // yet crossed; word has http byte=1 after masking success away.
        let word = 0x0000_0100; // http byte = 1, success byte already 0
        let d = decide(InternalHealth::Healthy, 1, 5, word, ReportKind::Unhealthy, Selector::Http);
        assert_eq!(d.new_word, word);
        assert_eq!(d.new_health, Some(InternalHealth::MostlyHealthy));
    }

    #[test]
    fn threshold_saturation_is_a_no_op_past_the_first_call() {
        // scenario 4: already unhealthy, tcp failures keep arriving but
        // the fast-path shortcut in Engine stops calling decide() at all
        // once current == report direction; decide() itself simply
        // reaffirms Unhealthy (no_health change) when called regardless.
        let d = decide(InternalHealth::Unhealthy, 1, 2, 0x0001_0000, ReportKind::Unhealthy, Selector::Tcp);
        assert_eq!(d.new_health, None);
    }

    #[test]
    fn verdict_projects_to_boolean_per_invariant_4() {
        assert!(InternalHealth::Healthy.as_bool());
        assert!(InternalHealth::MostlyHealthy.as_bool());
        assert!(!InternalHealth::Unhealthy.as_bool());
        assert!(!InternalHealth::MostlyUnhealthy.as_bool());
    }
}
