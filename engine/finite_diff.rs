//! Central finite-difference checks of analytic derivatives.

use ndarray::Array2;
use std::fmt;

/// One derivative entry that disagrees with its finite-difference estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivativeMismatch {
    pub row: usize,
    /// `None` for gradient entries.
    pub col: Option<usize>,
    pub analytic: f64,
    pub numeric: f64,
    pub relative_error: f64,
}

impl fmt::Display for DerivativeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.col {
            Some(col) => write!(f, "hessian[{}, {}]", self.row, col)?,
            None => write!(f, "gradient[{}]", self.row)?,
        }
        write!(
            f,
            ": analytic {:.6e}, finite difference {:.6e}, relative error {:.2e}",
            self.analytic, self.numeric, self.relative_error
        )
    }
}

fn step(x: f64) -> f64 {
    f64::EPSILON.cbrt() * x.abs().max(1.0)
}

fn relative_error(analytic: f64, numeric: f64) -> f64 {
    (analytic - numeric).abs() / analytic.abs().max(numeric.abs()).max(1.0)
}

/// Compares `gradient` with central differences of `f` at `x`.
pub fn check_gradient<E, F>(f: F, gradient: &[f64], x: &[f64], tolerance: f64) -> Result<Vec<DerivativeMismatch>, E>
where
    F: Fn(&[f64]) -> Result<f64, E>,
{
    let mut mismatches = Vec::new();
    let mut point = x.to_vec();
    for (i, &analytic) in gradient.iter().enumerate() {
        let h = step(x[i]);
        point[i] = x[i] + h;
        let plus = f(&point)?;
        point[i] = x[i] - h;
        let minus = f(&point)?;
        point[i] = x[i];
        let numeric = (plus - minus) / (2.0 * h);
        let error = relative_error(analytic, numeric);
        if !(error <= tolerance) {
            mismatches.push(DerivativeMismatch {
                row: i,
                col: None,
                analytic,
                numeric,
                relative_error: error,
            });
        }
    }
    Ok(mismatches)
}

/// Compares the lower triangle of the symmetric `hessian` with central
/// differences of `gradient` at `x`.
pub fn check_hessian<E, G>(
    gradient: G,
    hessian: &Array2<f64>,
    x: &[f64],
    tolerance: f64,
) -> Result<Vec<DerivativeMismatch>, E>
where
    G: Fn(&[f64]) -> Result<Vec<f64>, E>,
{
    let mut mismatches = Vec::new();
    let mut point = x.to_vec();
    for j in 0..x.len() {
        let h = step(x[j]);
        point[j] = x[j] + h;
        let plus = gradient(&point)?;
        point[j] = x[j] - h;
        let minus = gradient(&point)?;
        point[j] = x[j];
        for i in j..x.len() {
            let numeric = (plus[i] - minus[i]) / (2.0 * h);
            let analytic = hessian[(i, j)];
            let error = relative_error(analytic, numeric);
            if !(error <= tolerance) {
                mismatches.push(DerivativeMismatch {
                    row: i,
                    col: Some(j),
                    analytic,
                    numeric,
                    relative_error: error,
                });
            }
        }
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::convert::Infallible;

    fn f(x: &[f64]) -> Result<f64, Infallible> {
        Ok(x[0].exp() * x[1] + x[1] * x[1])
    }

    fn grad(x: &[f64]) -> Result<Vec<f64>, Infallible> {
        Ok(vec![x[0].exp() * x[1], x[0].exp() + 2.0 * x[1]])
    }

    #[test]
    fn correct_derivatives_pass() {
        let x = [0.3, -1.2];
        let g = grad(&x).unwrap();
        assert!(check_gradient(f, &g, &x, 1e-6).unwrap().is_empty());
        let e = x[0].exp();
        let h = array![[e * x[1], e], [e, 2.0]];
        assert!(check_hessian(grad, &h, &x, 1e-6).unwrap().is_empty());
    }

    #[test]
    fn wrong_entries_are_reported() {
        let x = [0.3, -1.2];
        let mut g = grad(&x).unwrap();
        g[1] += 0.5;
        let mismatches = check_gradient(f, &g, &x, 1e-6).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].row, 1);
        assert!(mismatches[0].to_string().starts_with("gradient[1]"));

        // The upper triangle is never consulted.
        let e = x[0].exp();
        let h = array![[e * x[1], 100.0], [e + 1.0, 2.0]];
        let mismatches = check_hessian(grad, &h, &x, 1e-6).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!((mismatches[0].row, mismatches[0].col), (1, Some(0)));
    }

    #[test]
    fn evaluation_errors_propagate() {
        let failing = |_: &[f64]| -> Result<f64, &'static str> { Err("no value") };
        assert_eq!(check_gradient(failing, &[1.0], &[0.0], 1e-6), Err("no value"));
    }
}
