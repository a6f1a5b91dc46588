//! Contingency-table statistics via the `statrs` crate.
//!
//! Every function guards against degenerate input and returns `None` (or a
//! neutral value) instead of NaN.

use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Pattern present/absent counts per platform column.
#[derive(Debug, Clone, PartialEq)]
pub struct ContingencyTable {
    pub present: Vec<f64>,
    pub absent: Vec<f64>,
}

impl ContingencyTable {
    /// `present[j]` sites of column `j` have the pattern, out of `totals[j]`.
    pub fn from_counts(present: &[usize], totals: &[usize]) -> Self {
        let present_f: Vec<f64> = present.iter().map(|&c| c as f64).collect();
        let absent = present
            .iter()
            .zip(totals)
            .map(|(&p, &t)| t.saturating_sub(p) as f64)
            .collect();
        ContingencyTable {
            present: present_f,
            absent,
        }
    }

    pub fn columns(&self) -> usize {
        self.present.len()
    }

    pub fn total(&self) -> f64 {
        self.present.iter().sum::<f64>() + self.absent.iter().sum::<f64>()
    }

    fn row_totals(&self) -> (f64, f64) {
        (self.present.iter().sum(), self.absent.iter().sum())
    }

    fn column_totals(&self) -> Vec<f64> {
        self.present
            .iter()
            .zip(&self.absent)
            .map(|(p, a)| p + a)
            .collect()
    }

    /// A table with fewer than two populated columns, or an empty row, has
    /// zero variance and supports no test.
    pub fn is_degenerate(&self) -> bool {
        let (present, absent) = self.row_totals();
        let populated = self.column_totals().iter().filter(|&&t| t > 0.0).count();
        populated < 2 || present <= 0.0 || absent <= 0.0
    }

    /// Expected cell counts under independence, row-major (present, absent).
    pub fn expected(&self) -> Option<Vec<(f64, f64)>> {
        if self.is_degenerate() {
            return None;
        }
        let n = self.total();
        let (present, absent) = self.row_totals();
        Some(
            self.column_totals()
                .into_iter()
                .filter(|&t| t > 0.0)
                .map(|t| (present * t / n, absent * t / n))
                .collect(),
        )
    }

    pub fn min_expected(&self) -> Option<f64> {
        self.expected()?
            .into_iter()
            .flat_map(|(p, a)| [p, a])
            .min_by(|a, b| a.total_cmp(b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    pub significant: bool,
}

/// Pearson chi-square test of independence on a 2×k table.
pub fn chi_square_test(table: &ContingencyTable, alpha: f64) -> Option<ChiSquareTest> {
    if table.is_degenerate() {
        return None;
    }
    let n = table.total();
    let (present_total, absent_total) = table.row_totals();

    let mut statistic = 0.0;
    let mut columns = 0usize;
    for (p, a) in table.present.iter().zip(&table.absent) {
        let column_total = p + a;
        if column_total <= 0.0 {
            continue;
        }
        columns += 1;
        let expected_present = present_total * column_total / n;
        let expected_absent = absent_total * column_total / n;
        statistic += (p - expected_present).powi(2) / expected_present;
        statistic += (a - expected_absent).powi(2) / expected_absent;
    }

    let degrees_of_freedom = columns - 1;
    if !statistic.is_finite() || degrees_of_freedom == 0 {
        return None;
    }

    let p_value = ChiSquared::new(degrees_of_freedom as f64)
        .ok()
        .map(|dist| dist.sf(statistic))
        .filter(|p| p.is_finite())?
        .clamp(0.0, 1.0);

    Some(ChiSquareTest {
        statistic,
        degrees_of_freedom,
        p_value,
        significant: p_value < alpha,
    })
}

/// Cramér's V for a 2×k table: sqrt(chi² / n).
pub fn cramers_v(statistic: f64, n: f64) -> f64 {
    if n <= 0.0 || !statistic.is_finite() || statistic < 0.0 {
        return 0.0;
    }
    (statistic / n).sqrt().clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CorrectionMethod {
    #[default]
    BenjaminiHochberg,
    Bonferroni,
}

/// Adjust p-values for multiple comparisons. Output order matches input.
pub fn adjust_p_values(p_values: &[f64], method: CorrectionMethod) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    match method {
        CorrectionMethod::Bonferroni => p_values
            .iter()
            .map(|p| (p * m as f64).min(1.0))
            .collect(),
        CorrectionMethod::BenjaminiHochberg => {
            let mut order: Vec<usize> = (0..m).collect();
            order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

            let mut adjusted = vec![1.0; m];
            let mut running_min = 1.0_f64;
            for rank in (0..m).rev() {
                let idx = order[rank];
                let candidate = p_values[idx] * m as f64 / (rank + 1) as f64;
                running_min = running_min.min(candidate);
                adjusted[idx] = running_min.clamp(0.0, 1.0);
            }
            adjusted
        }
    }
}

/// Power of a chi-square test with noncentrality `lambda`, using Patnaik's
/// central approximation of the noncentral distribution.
pub fn chi_square_power(lambda: f64, degrees_of_freedom: usize, alpha: f64) -> f64 {
    if degrees_of_freedom == 0 || !lambda.is_finite() || lambda < 0.0 {
        return 0.0;
    }
    let df = degrees_of_freedom as f64;
    let Ok(central) = ChiSquared::new(df) else {
        return 0.0;
    };
    let critical = central.inverse_cdf(1.0 - alpha);
    if !critical.is_finite() {
        return 0.0;
    }
    if lambda == 0.0 {
        return alpha;
    }

    let scale = (df + 2.0 * lambda) / (df + lambda);
    let shape = (df + lambda).powi(2) / (df + 2.0 * lambda);
    match ChiSquared::new(shape) {
        Ok(approx) => {
            let power = approx.sf(critical / scale);
            if power.is_finite() {
                power.clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
        Err(_) => 0.0,
    }
}

/// Smallest effect size w detectable with `target_power` for sample size `n`.
pub fn minimum_detectable_effect(
    n: usize,
    degrees_of_freedom: usize,
    alpha: f64,
    target_power: f64,
) -> Option<f64> {
    if n == 0 || degrees_of_freedom == 0 {
        return None;
    }
    let n = n as f64;
    let power_at = |w: f64| chi_square_power(n * w * w, degrees_of_freedom, alpha);
    let mut high = 1.0;
    if power_at(high) < target_power {
        return None;
    }
    let mut low = 0.0;
    for _ in 0..60 {
        let mid = (low + high) / 2.0;
        if power_at(mid) >= target_power {
            high = mid;
        } else {
            low = mid;
        }
    }
    Some(high)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerEstimate {
    pub effect_size: f64,
    pub achieved_power: f64,
    pub minimum_detectable_effect: Option<f64>,
    pub adequately_powered: bool,
}

pub fn estimate_power(
    test: &ChiSquareTest,
    n: usize,
    alpha: f64,
    target_power: f64,
) -> PowerEstimate {
    let effect_size = cramers_v(test.statistic, n as f64);
    let lambda = n as f64 * effect_size * effect_size;
    let achieved_power = chi_square_power(lambda, test.degrees_of_freedom, alpha);
    PowerEstimate {
        effect_size,
        achieved_power,
        minimum_detectable_effect: minimum_detectable_effect(
            n,
            test.degrees_of_freedom,
            alpha,
            target_power,
        ),
        adequately_powered: achieved_power >= target_power,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_tables_have_no_test() {
        // Present on every site.
        let table = ContingencyTable::from_counts(&[5, 5], &[5, 5]);
        assert!(table.is_degenerate());
        assert!(chi_square_test(&table, 0.05).is_none());

        // Single platform column.
        let table = ContingencyTable::from_counts(&[3], &[10]);
        assert!(table.is_degenerate());
        assert!(table.min_expected().is_none());
    }

    #[test]
    fn perfectly_associated_pattern_is_significant() {
        // 20 sites per platform, pattern only on platform A.
        let table = ContingencyTable::from_counts(&[20, 0], &[20, 20]);
        let test = chi_square_test(&table, 0.05).unwrap();
        assert_eq!(test.degrees_of_freedom, 1);
        assert!((test.statistic - 40.0).abs() < 1e-9);
        assert!(test.p_value < 1e-6);
        assert!(test.significant);
    }

    #[test]
    fn independent_pattern_is_not_significant() {
        let table = ContingencyTable::from_counts(&[10, 10], &[20, 20]);
        let test = chi_square_test(&table, 0.05).unwrap();
        assert!(test.statistic.abs() < 1e-12);
        assert!((test.p_value - 1.0).abs() < 1e-9);
        assert!(!test.significant);
    }

    #[test]
    fn min_expected_uses_row_and_column_totals() {
        let table = ContingencyTable::from_counts(&[1, 0], &[50, 50]);
        let min = table.min_expected().unwrap();
        assert!((min - 0.5).abs() < 1e-12);
    }

    #[test]
    fn benjamini_hochberg_matches_reference() {
        let adjusted =
            adjust_p_values(&[0.01, 0.04, 0.03, 0.20], CorrectionMethod::BenjaminiHochberg);
        // 0.03 at rank 2 would be 0.06 but is pulled down by rank 3.
        let expected = [0.04, 0.04 * 4.0 / 3.0, 0.04 * 4.0 / 3.0, 0.20];
        for (got, want) in adjusted.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
    }

    #[test]
    fn bonferroni_caps_at_one() {
        let adjusted = adjust_p_values(&[0.01, 0.5], CorrectionMethod::Bonferroni);
        assert_eq!(adjusted, vec![0.02, 1.0]);
        assert!(adjust_p_values(&[], CorrectionMethod::Bonferroni).is_empty());
    }

    #[test]
    fn power_grows_with_noncentrality() {
        let low = chi_square_power(1.0, 1, 0.05);
        let high = chi_square_power(20.0, 1, 0.05);
        assert!(low < high);
        assert!(high > 0.9);
        assert!((chi_square_power(0.0, 1, 0.05) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn power_near_textbook_value() {
        // Noncentrality 7.85 gives roughly 80% power at df = 1.
        let power = chi_square_power(7.85, 1, 0.05);
        assert!((power - 0.8).abs() < 0.05, "power was {power}");
    }

    #[test]
    fn minimum_detectable_effect_shrinks_with_sample_size() {
        let small = minimum_detectable_effect(50, 1, 0.05, 0.8).unwrap();
        let large = minimum_detectable_effect(500, 1, 0.05, 0.8).unwrap();
        assert!(large < small);
        assert!(minimum_detectable_effect(0, 1, 0.05, 0.8).is_none());
    }

    #[test]
    fn cramers_v_guards_bad_input() {
        assert_eq!(cramers_v(10.0, 0.0), 0.0);
        assert_eq!(cramers_v(f64::NAN, 10.0), 0.0);
        assert!((cramers_v(40.0, 40.0) - 1.0).abs() < 1e-12);
    }
}
