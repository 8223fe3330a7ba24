// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candidate selection: run every emitted kernel, keep the fastest one that
//! agrees with the default.

use std::time::{Duration, Instant};

use crate::error::{FlexAttnError, Result};

/// Outcome of one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Ran and agreed with the reference candidate.
    Measured(Duration),
    /// Failed to run.
    Failed(String),
    /// Ran but disagreed numerically with the reference candidate.
    Inconsistent,
}

/// Per-candidate record kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTiming {
    /// Candidate name.
    pub name: String,
    /// What happened.
    pub outcome: CandidateOutcome,
}

/// Winning candidate and its result.
#[derive(Debug)]
pub struct Selection<C, O> {
    /// Selected candidate.
    pub choice: C,
    /// Output it produced while being measured.
    pub output: O,
    /// Its measured wall time.
    pub elapsed: Duration,
    /// Every candidate, in the order they ran.
    pub timings: Vec<CandidateTiming>,
}

/// Benchmark `choices` in order and select the fastest consistent one.
///
/// The first candidate that runs successfully becomes the reference; later
/// candidates whose output fails `consistent(reference, output)` are excluded.
/// Failing candidates are excluded as well. A single candidate is run without
/// comparison.
///
/// # Errors
/// Returns [`FlexAttnError::Autotune`] if there are no candidates or every
/// candidate fails.
pub fn select_algorithm<C, O>(
    name: &str,
    choices: Vec<C>,
    describe: impl Fn(&C) -> String,
    run: impl Fn(&C) -> Result<O>,
    consistent: impl Fn(&O, &O) -> bool,
) -> Result<Selection<C, O>> {
    if choices.is_empty() {
        return Err(FlexAttnError::Autotune {
            name: name.to_owned(),
            reason: "no candidates".into(),
        });
    }

    let mut timings = Vec::with_capacity(choices.len());
    let mut reference: Option<(C, O, Duration)> = None;
    let mut fastest: Option<(C, O, Duration)> = None;

    for choice in choices {
        let label = describe(&choice);
        let start = Instant::now();
        let output = match run(&choice) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    kernel = name,
                    candidate = %label,
                    error = %e,
                    "candidate failed, excluded"
                );
                timings.push(CandidateTiming {
                    name: label,
                    outcome: CandidateOutcome::Failed(e.to_string()),
                });
                continue;
            }
        };
        let elapsed = start.elapsed();

        match &reference {
            None => reference = Some((choice, output, elapsed)),
            Some((_, ref_output, ref_elapsed)) => {
                if !consistent(ref_output, &output) {
                    tracing::warn!(
                        kernel = name,
                        candidate = %label,
                        "candidate disagrees with the default, excluded"
                    );
                    timings.push(CandidateTiming {
                        name: label,
                        outcome: CandidateOutcome::Inconsistent,
                    });
                    continue;
                }
                let beats_fastest = fastest.as_ref().map_or(true, |(_, _, t)| elapsed < *t);
                if elapsed < *ref_elapsed && beats_fastest {
                    fastest = Some((choice, output, elapsed));
                }
            }
        }
        tracing::trace!(kernel = name, candidate = %label, ?elapsed, "candidate measured");
        timings.push(CandidateTiming {
            name: label,
            outcome: CandidateOutcome::Measured(elapsed),
        });
    }

    let (choice, output, elapsed) = match (fastest, reference) {
        (Some(winner), _) | (None, Some(winner)) => winner,
        (None, None) => {
            let reasons = timings
                .iter()
                .map(|t| match &t.outcome {
                    CandidateOutcome::Failed(reason) => format!("{}: {reason}", t.name),
                    _ => t.name.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FlexAttnError::Autotune {
                name: name.to_owned(),
                reason: reasons,
            });
        }
    };
    tracing::debug!(
        kernel = name,
        candidates = timings.len(),
        winner = %describe(&choice),
        ?elapsed,
        "autotuning selected a candidate"
    );
    Ok(Selection {
        choice,
        output,
        elapsed,
        timings,
    })
}

/// Elementwise `|a - b| <= atol + rtol * |b|`; matching infinities and NaNs agree.
#[must_use]
pub fn allclose(a: &[f32], b: &[f32], atol: f32, rtol: f32) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(&x, &y)| {
            x == y || (x.is_nan() && y.is_nan()) || (x - y).abs() <= atol + rtol * y.abs()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_candidate() {
        let s = select_algorithm("k", vec![7], |c| c.to_string(), |c| Ok(*c * 2), |_, _| true)
            .unwrap();
        assert_eq!(s.choice, 7);
        assert_eq!(s.output, 14);
        assert_eq!(s.timings.len(), 1);
    }

    #[test]
    fn test_failures_are_excluded() {
        let s = select_algorithm(
            "k",
            vec![1, 2, 3],
            |c| c.to_string(),
            |c| {
                if *c == 1 {
                    Err(FlexAttnError::Kernel("boom".into()))
                } else {
                    Ok(*c)
                }
            },
            |_, _| true,
        )
        .unwrap();
        assert_ne!(s.choice, 1);
        assert!(matches!(s.timings[0].outcome, CandidateOutcome::Failed(_)));
    }

    #[test]
    fn test_total_failure_is_fatal() {
        let err = select_algorithm(
            "k",
            vec![1, 2],
            |c| format!("cand{c}"),
            |_| -> Result<()> { Err(FlexAttnError::Kernel("boom".into())) },
            |_, _| true,
        );
        match err {
            Err(FlexAttnError::Autotune { name, reason }) => {
                assert_eq!(name, "k");
                assert!(reason.contains("cand1: kernel error: boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let empty: Vec<u8> = Vec::new();
        assert!(select_algorithm("k", empty, |c| c.to_string(), |c| Ok(*c), |_, _| true).is_err());
    }

    #[test]
    fn test_inconsistent_candidates_are_excluded() {
        // candidate 2 is much faster but wrong
        let s = select_algorithm(
            "k",
            vec![1, 2],
            |c| c.to_string(),
            |c| {
                if *c == 1 {
                    thread::sleep(Duration::from_millis(20));
                    Ok(1.0f32)
                } else {
                    Ok(5.0)
                }
            },
            |a, b| allclose(&[*a], &[*b], 1e-5, 1e-5),
        )
        .unwrap();
        assert_eq!(s.choice, 1);
        assert_eq!(s.timings[1].outcome, CandidateOutcome::Inconsistent);
    }

    #[test]
    fn test_fastest_consistent_candidate_wins() {
        let s = select_algorithm(
            "k",
            vec![30u64, 1, 15],
            |c| c.to_string(),
            |c| {
                thread::sleep(Duration::from_millis(*c));
                Ok(())
            },
            |_, _| true,
        )
        .unwrap();
        assert_eq!(s.choice, 1);
    }

    #[test]
    fn test_allclose() {
        assert!(allclose(&[1.0, f32::NEG_INFINITY], &[1.0 + 1e-7, f32::NEG_INFINITY], 1e-6, 1e-5));
        assert!(allclose(&[f32::NAN], &[f32::NAN], 0.0, 0.0));
        assert!(!allclose(&[1.0], &[1.1], 1e-3, 1e-3));
        assert!(!allclose(&[1.0], &[1.0, 2.0], 1e-3, 1e-3));
    }
}
