//! Histogramming and Gaussian peak fitting.
//!
//! Batch statistics are reported as `(mean, FWHM)` pairs obtained by fitting
//! a Gaussian to the histogrammed feature rather than taking a raw mean and
//! standard deviation. Amplitude and gain distributions are frequently
//! truncated near the trigger threshold, which biases a direct mean; fitting
//! a symmetric peak to the histogram recovers the peak location and width
//! robustly against that truncation.
//!
//! The fit seeds with a weighted log-parabola (Caruana's method: a parabola
//! in log-counts is exact for a noiseless Gaussian) and refines with damped
//! Gauss-Newton iterations on the nonlinear model. All failure modes are
//! typed so callers can treat a failed fit as a per-feature soft failure.

use thiserror::Error;

/// Full width at half maximum of a unit-sigma Gaussian.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_4; // 2*sqrt(2*ln 2)

const MAX_ITERATIONS: usize = 50;
const RELATIVE_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("histogram is empty")]
    EmptyHistogram,

    #[error("too few populated bins for a fit ({0} < 3)")]
    TooFewBins(usize),

    #[error("log-counts have non-negative curvature (no peak)")]
    NoPeak,

    #[error("fit did not converge after {0} iterations")]
    NonConvergent(usize),
}

/// Fixed-width histogram over a value range.
#[derive(Debug, Clone)]
pub struct Histogram {
    low: f64,
    bin_width: f64,
    counts: Vec<f64>,
}

impl Histogram {
    /// Bin `values` into `nbins` equal bins spanning the sample range.
    ///
    /// Degenerate inputs (no values, zero spread, zero bins) produce an
    /// empty histogram, which the fit then rejects with a typed error.
    pub fn from_values(values: &[f64], nbins: usize) -> Self {
        if values.is_empty() || nbins == 0 {
            return Self {
                low: 0.0,
                bin_width: 1.0,
                counts: Vec::new(),
            };
        }
        let low = values.iter().copied().fold(f64::INFINITY, f64::min);
        let high = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(high > low) {
            return Self {
                low,
                bin_width: 1.0,
                counts: Vec::new(),
            };
        }
        let bin_width = (high - low) / nbins as f64;
        let mut counts = vec![0.0; nbins];
        for &v in values {
            let idx = (((v - low) / bin_width) as usize).min(nbins - 1);
            counts[idx] += 1.0;
        }
        Self {
            low,
            bin_width,
            counts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Center of bin `i`.
    pub fn center(&self, i: usize) -> f64 {
        self.low + (i as f64 + 0.5) * self.bin_width
    }

    /// Rebin by merging pairs of adjacent bins (used for the fit retry).
    pub fn rebinned(&self) -> Self {
        let merged: Vec<f64> = self
            .counts
            .chunks(2)
            .map(|pair| pair.iter().sum())
            .collect();
        Self {
            low: self.low,
            bin_width: self.bin_width * 2.0,
            counts: merged,
        }
    }
}

/// Result of a Gaussian fit to a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl GaussianFit {
    pub fn fwhm(&self) -> f64 {
        FWHM_PER_SIGMA * self.sigma
    }
}

/// Histogram a feature and fit its peak, retrying once on a rebinned
/// (coarser) histogram before reporting failure.
pub fn fit_feature(values: &[f64], nbins: usize) -> Result<GaussianFit, FitError> {
    let hist = Histogram::from_values(values, nbins);
    match fit_gaussian(&hist) {
        Ok(fit) => Ok(fit),
        Err(first) => {
            let coarse = hist.rebinned();
            fit_gaussian(&coarse).map_err(|_| first)
        }
    }
}

/// Fit a Gaussian `A * exp(-(x-mu)^2 / (2 sigma^2))` to the histogram.
pub fn fit_gaussian(hist: &Histogram) -> Result<GaussianFit, FitError> {
    if hist.is_empty() {
        return Err(FitError::EmptyHistogram);
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = hist
        .counts
        .iter()
        .enumerate()
        .filter(|(_, &c)| c > 0.0)
        .map(|(i, &c)| (hist.center(i), c))
        .unzip();
    if xs.len() < 3 {
        return Err(FitError::TooFewBins(xs.len()));
    }

    let seed = caruana_seed(&xs, &ys)?;
    refine_gauss_newton(&xs, &ys, seed)
}

/// Weighted least-squares parabola on log-counts (Caruana/Guo weighting:
/// each bin weighted by its squared count, suppressing low-count tails).
fn caruana_seed(xs: &[f64], ys: &[f64]) -> Result<GaussianFit, FitError> {
    // Normal equations for ln(y) = a + b x + c x^2 with weights w = y^2.
    let mut m = [[0.0f64; 3]; 3];
    let mut rhs = [0.0f64; 3];
    for (&x, &y) in xs.iter().zip(ys) {
        let w = y * y;
        let ln_y = y.ln();
        let basis = [1.0, x, x * x];
        for r in 0..3 {
            for c in 0..3 {
                m[r][c] += w * basis[r] * basis[c];
            }
            rhs[r] += w * basis[r] * ln_y;
        }
    }
    let [a, b, c] = solve3(m, rhs).ok_or(FitError::NoPeak)?;
    if c >= 0.0 {
        return Err(FitError::NoPeak);
    }
    let sigma = (-1.0 / (2.0 * c)).sqrt();
    let mean = -b / (2.0 * c);
    let amplitude = (a - b * b / (4.0 * c)).exp();
    Ok(GaussianFit {
        amplitude,
        mean,
        sigma,
    })
}

/// Damped Gauss-Newton refinement of the nonlinear model.
fn refine_gauss_newton(
    xs: &[f64],
    ys: &[f64],
    seed: GaussianFit,
) -> Result<GaussianFit, FitError> {
    let mut p = seed;
    let mut ssr = residual_sum(xs, ys, &p);

    for _ in 0..MAX_ITERATIONS {
        // Assemble J^T J and J^T r for the three parameters.
        let mut m = [[0.0f64; 3]; 3];
        let mut rhs = [0.0f64; 3];
        for (&x, &y) in xs.iter().zip(ys) {
            let dx = x - p.mean;
            let g = (-0.5 * dx * dx / (p.sigma * p.sigma)).exp();
            let f = p.amplitude * g;
            let jac = [
                g,
                f * dx / (p.sigma * p.sigma),
                f * dx * dx / (p.sigma * p.sigma * p.sigma),
            ];
            let r = f - y;
            for row in 0..3 {
                for col in 0..3 {
                    m[row][col] += jac[row] * jac[col];
                }
                rhs[row] -= jac[row] * r;
            }
        }
        let Some(delta) = solve3(m, rhs) else {
            // Singular normal equations: accept the current estimate if the
            // seed was sane, the histogram carries no more information.
            return Ok(p);
        };

        // Backtracking line search: halve the step until the residual drops.
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..8 {
            let candidate = GaussianFit {
                amplitude: p.amplitude + scale * delta[0],
                mean: p.mean + scale * delta[1],
                sigma: p.sigma + scale * delta[2],
            };
            if candidate.sigma > 0.0 && candidate.amplitude > 0.0 {
                let candidate_ssr = residual_sum(xs, ys, &candidate);
                if candidate_ssr <= ssr {
                    accepted = Some((candidate, candidate_ssr));
                    break;
                }
            }
            scale *= 0.5;
        }
        let Some((next, next_ssr)) = accepted else {
            // No downhill step exists: current point is the minimum.
            return Ok(p);
        };

        let step = (next.amplitude - p.amplitude).abs() / p.amplitude.abs().max(1e-300)
            + (next.mean - p.mean).abs() / p.sigma
            + (next.sigma - p.sigma).abs() / p.sigma;
        p = next;
        ssr = next_ssr;
        if step < RELATIVE_TOLERANCE {
            return Ok(p);
        }
    }
    Err(FitError::NonConvergent(MAX_ITERATIONS))
}

fn residual_sum(xs: &[f64], ys: &[f64], p: &GaussianFit) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let dx = x - p.mean;
            let f = p.amplitude * (-0.5 * dx * dx / (p.sigma * p.sigma)).exp();
            (f - y) * (f - y)
        })
        .sum()
}

/// Solve a 3x3 linear system by Gaussian elimination with partial pivoting.
fn solve3(mut m: [[f64; 3]; 3], mut rhs: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| {
            m[a][col]
                .abs()
                .partial_cmp(&m[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = [0.0f64; 3];
    for row in (0..3).rev() {
        let mut acc = rhs[row];
        for k in row + 1..3 {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    Some(x)
}
