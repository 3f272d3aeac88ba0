//! Parent-based sampling
//!
//! The root of a trace makes a deterministic ratio decision from its trace id.
//! Every descendant, in-process or across a bus hop, inherits the flags of its
//! parent unchanged. Override classes never clear a decision; they set the
//! separate forced bit so downstream can still see the probabilistic outcome.

use crate::context::{CorrelationContext, TraceFlags, TraceId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ratio used when none (or an invalid one) is configured
pub const DEFAULT_SAMPLE_RATIO: f64 = 0.25;

/// Sampling state of an incoming context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    Sampled,
    NotSampled,
    /// Root context, no decision made yet
    Undecided,
}

impl SamplingState {
    pub fn of(cx: &CorrelationContext) -> Self {
        match cx.flags() {
            Some(flags) if flags.should_export() => SamplingState::Sampled,
            Some(_) => SamplingState::NotSampled,
            None => SamplingState::Undecided,
        }
    }
}

/// Local events that force a trace to be exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideClass {
    OrderRejection,
    DeadLetter,
    Error,
}

impl OverrideClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideClass::OrderRejection => "order_rejection",
            OverrideClass::DeadLetter => "dead_letter",
            OverrideClass::Error => "error",
        }
    }
}

/// Parent-based ratio sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    ratio: f64,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            ratio: DEFAULT_SAMPLE_RATIO,
        }
    }
}

impl Sampler {
    /// Ratio sampler for root spans. Values outside `[0, 1]` (or NaN) fall back
    /// to [`DEFAULT_SAMPLE_RATIO`].
    pub fn ratio_based(ratio: f64) -> Self {
        if (0.0..=1.0).contains(&ratio) {
            Self { ratio }
        } else {
            warn!(
                ratio,
                fallback = DEFAULT_SAMPLE_RATIO,
                "Sample ratio out of range, using default"
            );
            Self::default()
        }
    }

    pub fn always_on() -> Self {
        Self { ratio: 1.0 }
    }

    pub fn always_off() -> Self {
        Self { ratio: 0.0 }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Flags for a new span.
    ///
    /// With a parent the parent's flags are inherited as-is. Without one the
    /// ratio decision is derived from `trace_id`. An override sets the forced
    /// bit on top of whichever applies.
    pub fn decide(
        &self,
        parent: Option<TraceFlags>,
        trace_id: TraceId,
        override_class: Option<OverrideClass>,
    ) -> TraceFlags {
        let flags = match parent {
            Some(flags) => flags,
            None => TraceFlags::NONE.with_sampled(self.sample_trace_id(trace_id)),
        };
        match override_class {
            Some(_) => flags.with_forced(true),
            None => flags,
        }
    }

    /// Deterministic ratio test on the low 64 bits of the trace id
    pub fn sample_trace_id(&self, trace_id: TraceId) -> bool {
        if self.ratio >= 1.0 {
            return true;
        }
        if self.ratio <= 0.0 {
            return false;
        }
        let prob_upper_bound = (self.ratio * (1u64 << 63) as f64) as u64;
        let rnd_from_trace_id = trace_id.low_u64() >> 1;
        rnd_from_trace_id < prob_upper_bound
    }
}
