//! Time quantization used for conflict detection.
//!
//! An interval is reduced to the instants `start, start + step, ...` plus
//! `end` itself. Two intervals conflict only if they share such an instant,
//! so sub-step overlaps that fall between samples go unnoticed.

use crate::model::{MINUTE_MS, Ms, Span};

/// Default sample spacing.
pub const GRID_STEP_MS: Ms = 10 * MINUTE_MS;

/// Finite, ordered sample sequence over a closed interval. Cloning restarts it
/// from the clone point.
#[derive(Debug, Clone)]
pub struct Samples {
    next: Option<Ms>,
    end: Ms,
    step: Ms,
}

impl Iterator for Samples {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        let current = self.next?;
        self.next = if current >= self.end {
            None
        } else {
            // The last partial step lands on `end`.
            Some((current + self.step).min(self.end))
        };
        Some(current)
    }
}

/// Samples of `span` at the default step, both endpoints included.
pub fn samples(span: Span) -> Samples {
    samples_with_step(span, GRID_STEP_MS)
}

pub fn samples_with_step(span: Span, step: Ms) -> Samples {
    debug_assert!(step > 0, "grid step must be positive");
    Samples {
        next: Some(span.start),
        end: span.end,
        step: step.max(1),
    }
}
