//! Small numeric helpers shared by the relational analyzer.

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by n).
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

const FLAT_SERIES_EPSILON: f64 = 1e-18;

/// Least-squares fit of `values` against their indices 0..n.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation; `None` when either series is constant.
    pub r: Option<f64>,
}

impl Regression {
    /// Value of the fitted line at index `x`.
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

pub fn linear_regression(values: &[f64]) -> Option<Regression> {
    let n = values.len();
    if n < 2 {
        return None;
    }

    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        let dy = y - y_mean;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    let slope = sxy / sxx;
    // Rounding leaves a constant series with a vanishing but nonzero spread.
    let r = (syy > FLAT_SERIES_EPSILON).then(|| (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0));
    Some(Regression {
        slope,
        intercept: y_mean - slope * x_mean,
        r,
    })
}

/// Regression slope scaled by series length over value range, clipped to [-1, 1].
///
/// 0.0 for fewer than 2 values or a flat series.
pub fn normalized_trend(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if range <= 0.0 {
        return 0.0;
    }
    match linear_regression(values) {
        Some(fit) => (fit.slope * values.len() as f64 / range).clamp(-1.0, 1.0),
        None => 0.0,
    }
}

/// Indices of local maxima, in ascending order.
///
/// A flat-topped peak counts once, at the middle of its plateau; the first and
/// last samples are never peaks. Peaks below `min_height` are dropped, then
/// peaks closer than `min_distance` to a taller one are removed, tallest first.
pub fn find_peaks(values: &[f64], min_height: f64, min_distance: usize) -> Vec<usize> {
    let mut peaks = Vec::new();
    let n = values.len();
    let mut i = 1;
    while i + 1 < n {
        if values[i - 1] < values[i] {
            let mut ahead = i + 1;
            while ahead + 1 < n && values[ahead] == values[i] {
                ahead += 1;
            }
            if values[ahead] < values[i] {
                let left = i;
                let right = ahead - 1;
                peaks.push((left + right) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }

    peaks.retain(|&p| values[p] >= min_height);

    let min_distance = min_distance.max(1);
    if min_distance == 1 || peaks.len() < 2 {
        return peaks;
    }

    let mut keep = vec![true; peaks.len()];
    let mut by_height: Vec<usize> = (0..peaks.len()).collect();
    by_height.sort_by(|&a, &b| values[peaks[a]].total_cmp(&values[peaks[b]]));

    for &current in by_height.iter().rev() {
        if !keep[current] {
            continue;
        }
        let mut k = current;
        while k > 0 && peaks[current] - peaks[k - 1] < min_distance {
            keep[k - 1] = false;
            k -= 1;
        }
        let mut k = current + 1;
        while k < peaks.len() && peaks[k] - peaks[current] < min_distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .into_iter()
        .zip(keep)
        .filter_map(|(peak, kept)| kept.then_some(peak))
        .collect()
}
