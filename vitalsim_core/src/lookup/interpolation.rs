//! Step and linear interpolation over one or two parameters.
//!
//! Order 0 is a step function holding the value of the nearest grid point at
//! or below the query. Order 1 is linear (bilinear for two parameters).
//! Queries outside the fitted range are clamped to the edge values.

use nalgebra::DMatrix;

use super::LookupError;

/// Highest supported interpolation order.
pub const MAX_ORDER: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Interpolant {
    Univariate {
        x: Vec<f64>,
        values: Vec<f64>,
        order: usize,
    },
    Bivariate {
        x: Vec<f64>,
        y: Vec<f64>,
        values: DMatrix<f64>,
        order: usize,
    },
}

fn check_order(order: usize) -> Result<(), LookupError> {
    if order > MAX_ORDER {
        Err(LookupError::UnsupportedOrder(order))
    } else {
        Ok(())
    }
}

fn unique_sorted(values: &[f64]) -> Vec<f64> {
    let mut grid = values.to_vec();
    grid.sort_by(|a, b| a.total_cmp(b));
    grid.dedup();
    grid
}

fn grid_position(grid: &[f64], value: f64) -> usize {
    grid.partition_point(|&g| g < value)
}

/// Returns the bracketing grid indices and the weight of the upper one.
fn locate(grid: &[f64], q: f64) -> (usize, usize, f64) {
    let n = grid.len();
    if n == 1 || q <= grid[0] {
        return (0, 0, 0.0);
    }
    if q >= grid[n - 1] {
        return (n - 1, n - 1, 0.0);
    }
    let hi = grid.partition_point(|&g| g <= q);
    let lo = hi - 1;
    (lo, hi, (q - grid[lo]) / (grid[hi] - grid[lo]))
}

/// Fits `values` over the single parameter `x`.
pub fn fit_univariate(x: &[f64], values: &[f64], order: usize) -> Result<Interpolant, LookupError> {
    check_order(order)?;
    if x.is_empty() {
        return Err(LookupError::EmptyTable);
    }
    let mut points: Vec<(f64, f64)> = x.iter().copied().zip(values.iter().copied()).collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    if let Some(pair) = points.windows(2).find(|w| w[0].0 == w[1].0) {
        return Err(LookupError::DuplicateParameter(pair[0].0));
    }
    let (x, values) = points.into_iter().unzip();
    Ok(Interpolant::Univariate { x, values, order })
}

/// Fits `values` over a complete rectilinear grid of `(x, y)` points.
pub fn fit_bivariate(x: &[f64], y: &[f64], values: &[f64], order: usize) -> Result<Interpolant, LookupError> {
    check_order(order)?;
    if x.is_empty() {
        return Err(LookupError::EmptyTable);
    }
    let xs = unique_sorted(x);
    let ys = unique_sorted(y);
    let expected = xs.len() * ys.len();
    if values.len() != expected {
        return Err(LookupError::IncompleteGrid {
            expected,
            actual: values.len(),
        });
    }

    let mut grid = DMatrix::from_element(xs.len(), ys.len(), f64::NAN);
    let mut filled = DMatrix::from_element(xs.len(), ys.len(), false);
    for ((&a, &b), &v) in x.iter().zip(y).zip(values) {
        let (i, j) = (grid_position(&xs, a), grid_position(&ys, b));
        if filled[(i, j)] {
            return Err(LookupError::DuplicateParameter(a));
        }
        filled[(i, j)] = true;
        grid[(i, j)] = v;
    }
    Ok(Interpolant::Bivariate {
        x: xs,
        y: ys,
        values: grid,
        order,
    })
}

impl Interpolant {
    pub fn order(&self) -> usize {
        match self {
            Interpolant::Univariate { order, .. } | Interpolant::Bivariate { order, .. } => *order,
        }
    }

    /// Evaluates at `a` (and `b` for two-parameter fits). Non-finite
    /// queries produce NaN.
    pub fn evaluate(&self, a: f64, b: f64) -> f64 {
        if !a.is_finite() || (matches!(self, Interpolant::Bivariate { .. }) && !b.is_finite()) {
            return f64::NAN;
        }
        match self {
            Interpolant::Univariate { x, values, order } => {
                let (lo, hi, t) = locate(x, a);
                if *order == 0 {
                    values[lo]
                } else {
                    values[lo] * (1.0 - t) + values[hi] * t
                }
            }
            Interpolant::Bivariate { x, y, values, order } => {
                let (i0, i1, tx) = locate(x, a);
                let (j0, j1, ty) = locate(y, b);
                if *order == 0 {
                    values[(i0, j0)]
                } else {
                    values[(i0, j0)] * (1.0 - tx) * (1.0 - ty)
                        + values[(i1, j0)] * tx * (1.0 - ty)
                        + values[(i0, j1)] * (1.0 - tx) * ty
                        + values[(i1, j1)] * tx * ty
                }
            }
        }
    }
}
