//! Statistical tests evaluated at candidate splits.
//!
//! # Overview
//! Two tests run per candidate split:
//!
//! 1. **Fisher's exact test** on a 2×c contingency table. For c = 2 this is
//!    the classic two-tailed test; for c > 2 it is the Freeman–Halton
//!    extension, computed exactly by enumerating all row-0 assignments under
//!    the fixed margins and summing the probabilities of tables no more
//!    likely than the observed one.
//!
//! 2. **Cochran–Mantel–Haenszel (CMH)** test of common odds ratio = 1 across
//!    2×2 strata. Strata containing a zero cell get 0.5 added to every cell
//!    first; no continuity correction is applied to the statistic.
//!
//! Both tests are pure and synchronous. Probabilities are accumulated in log
//! space via `ln_gamma` to stay finite for large counts.
//!
//! # Inconclusive outcomes
//! A degenerate table (empty, or zero total variance) yields
//! [`TestOutcome::Inconclusive`] rather than an error. At the output boundary
//! an inconclusive test renders as p = 1.0 (not significant), but callers can
//! still tell the two cases apart.

use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::gamma::ln_gamma;

/// Result of a statistical test: a computed p-value, or a tagged failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TestOutcome {
    PValue(f64),
    Inconclusive,
}

impl TestOutcome {
    /// The p-value to report. Inconclusive tests render as the neutral 1.0.
    pub fn p_value(self) -> f64 {
        match self {
            TestOutcome::PValue(p) => p,
            TestOutcome::Inconclusive => 1.0,
        }
    }

    pub fn is_inconclusive(self) -> bool {
        matches!(self, TestOutcome::Inconclusive)
    }
}

/// ln(n choose k)
fn ln_choose(n: u64, k: u64) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Two-tailed Fisher exact test on a 2×c table given as its two rows.
///
/// Rows must have equal length. An all-zero table is inconclusive; a table
/// admitting only one margin-preserving configuration has p = 1.
pub fn fisher_exact(row0: &[u64], row1: &[u64]) -> TestOutcome {
    debug_assert_eq!(row0.len(), row1.len());
    let cols: Vec<u64> = row0.iter().zip(row1).map(|(a, b)| a + b).collect();
    let total: u64 = cols.iter().sum();
    let r0: u64 = row0.iter().sum();
    if total == 0 {
        return TestOutcome::Inconclusive;
    }

    // Suffix column sums for feasibility bounds during enumeration.
    let mut suffix = vec![0u64; cols.len() + 1];
    for j in (0..cols.len()).rev() {
        suffix[j] = suffix[j + 1] + cols[j];
    }

    let ln_denom = ln_choose(total, r0);
    let ln_p_obs: f64 = row0
        .iter()
        .zip(&cols)
        .map(|(&a, &c)| ln_choose(c, a))
        .sum::<f64>()
        - ln_denom;

    // Sum P(table) over all tables with P <= P(observed), walking row-0
    // assignments column by column under the fixed margins.
    let mut p_sum = 0.0;
    let mut stack: Vec<(usize, u64, f64)> = vec![(0, r0, 0.0)];
    while let Some((j, remaining, acc_ln)) = stack.pop() {
        if j == cols.len() {
            let ln_p = acc_ln - ln_denom;
            if ln_p <= ln_p_obs + 1e-7 {
                p_sum += ln_p.exp();
            }
            continue;
        }
        let lo = remaining.saturating_sub(suffix[j + 1]);
        let hi = cols[j].min(remaining);
        for a in lo..=hi {
            stack.push((j + 1, remaining - a, acc_ln + ln_choose(cols[j], a)));
        }
    }

    TestOutcome::PValue(p_sum.min(1.0))
}

/// CMH chi-squared test of common odds ratio = 1 across 2×2 strata.
///
/// Each stratum is `[[in_H, in_D], [out_H, out_D]]`. Strata containing a zero
/// cell have 0.5 added to every cell before the statistic is formed. An empty
/// stratum list or zero total variance is inconclusive.
pub fn cmh_test(strata: &[[[u64; 2]; 2]]) -> TestOutcome {
    if strata.is_empty() {
        return TestOutcome::Inconclusive;
    }

    let mut sum_a = 0.0;
    let mut sum_e = 0.0;
    let mut sum_v = 0.0;
    for stratum in strata {
        let mut t = [
            [stratum[0][0] as f64, stratum[0][1] as f64],
            [stratum[1][0] as f64, stratum[1][1] as f64],
        ];
        if t.iter().flatten().any(|&x| x == 0.0) {
            for cell in t.iter_mut().flatten() {
                *cell += 0.5;
            }
        }
        let r0 = t[0][0] + t[0][1];
        let r1 = t[1][0] + t[1][1];
        let c0 = t[0][0] + t[1][0];
        let c1 = t[0][1] + t[1][1];
        let n = r0 + r1;
        if n <= 1.0 {
            continue;
        }
        sum_a += t[0][0];
        sum_e += r0 * c0 / n;
        sum_v += r0 * r1 * c0 * c1 / (n * n * (n - 1.0));
    }

    if sum_v <= 0.0 {
        return TestOutcome::Inconclusive;
    }

    let stat = (sum_a - sum_e).powi(2) / sum_v;
    match ChiSquared::new(1.0) {
        Ok(chi) => TestOutcome::PValue(1.0 - chi.cdf(stat)),
        Err(_) => TestOutcome::Inconclusive,
    }
}
