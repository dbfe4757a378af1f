//! Sparse Cholesky factorization of the random-effects Hessian.
//!
//! The symbolic phase runs once per sparsity pattern on faer's simplicial
//! Cholesky: AMD ordering, elimination tree and the explicit pattern of `L`.
//! Every numeric factorization of `f64` values reuses that plan through faer's
//! LLT, and the solves, the log-determinant and the Takahashi selected inverse
//! all read the same explicit factor.
//!
//! [`RecordedFactor`] repeats the numeric phase over any [`Scalar`] on the
//! same factor pattern. It exists so the fixed-effects Hessian recording can
//! put a factorization onto an active tape; `f64` work never goes through it.

use crate::ad::Scalar;
use crate::sparsity::SparsityPattern;
use faer::dyn_stack::{MemBuffer, MemStack};
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::linalg::cholesky::{
    CholeskySymbolicParams, LltRef, SymbolicCholesky as FaerSymbolic, SymbolicCholeskyRaw, SymmetricOrdering,
    factorize_symbolic_cholesky,
};
use faer::sparse::{SparseColMat, SparseColMatRef, Triplet};
use faer::{Conj, MatMut, Par, Side};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CholeskyError {
    #[error("Matrix is not positive definite.")]
    NotPositiveDefinite,

    #[error("Factor pivot {pivot:.3e} at column {column} is not a positive finite number.")]
    NonPositivePivot { column: usize, pivot: f64 },

    #[error("Expected {expected} values for the sparsity pattern, found {found}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Pattern entry ({row}, {col}) is outside the lower triangle of a {n}x{n} matrix.")]
    InvalidPattern { row: usize, col: usize, n: usize },

    #[error("Symbolic analysis failed: {0}")]
    Analysis(String),
}

/// Fill-reducing ordering applied before factorization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillOrdering {
    /// Approximate minimum degree.
    #[default]
    Amd,
    Natural,
}

/// Ordering and factor pattern of one sparsity pattern.
pub struct SymbolicCholesky {
    n: usize,
    n_values: usize,
    plan: FaerSymbolic<usize>,
    // Lower triangle of A in faer's column-compressed layout, and where each
    // pattern entry lands in it.
    lower: SparseColMat<usize, f64>,
    csc_position: Vec<usize>,
    perm: Vec<usize>,
    pinv: Vec<usize>,
    // Explicit pattern of L, columns sorted with the diagonal first.
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    // For each row k: the columns i < k of its nonzeros, ascending, and their slots.
    row_pattern: Vec<Vec<usize>>,
    row_slots: Vec<Vec<usize>>,
    // For each permuted column k: (row i <= k, position in the value vector).
    scatter: Vec<Vec<(usize, usize)>>,
}

impl fmt::Debug for SymbolicCholesky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolicCholesky")
            .field("n", &self.n)
            .field("n_values", &self.n_values)
            .field("factor_nnz", &self.row_idx.len())
            .finish_non_exhaustive()
    }
}

impl SymbolicCholesky {
    /// Analyzes an `n × n` symmetric pattern given by its lower triangle.
    pub fn analyze(
        n: usize,
        pattern: &SparsityPattern,
        ordering: FillOrdering,
    ) -> Result<Self, CholeskyError> {
        for (row, col) in pattern.entries() {
            if row >= n || col > row {
                return Err(CholeskyError::InvalidPattern { row, col, n });
            }
        }

        let triplets: Vec<Triplet<usize, usize, f64>> = pattern
            .entries()
            .map(|(row, col)| Triplet::new(row, col, 1.0))
            .collect();
        let lower = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
            .map_err(|err| CholeskyError::Analysis(format!("{err:?}")))?;
        let csc_position = {
            let structure = lower.symbolic();
            let (csc_ptr, csc_rows) = (structure.col_ptr(), structure.row_idx());
            pattern
                .entries()
                .map(|(row, col)| (csc_ptr[col]..csc_ptr[col + 1]).find(|&p| csc_rows[p] == row))
                .collect::<Option<Vec<usize>>>()
                .ok_or_else(|| CholeskyError::Analysis("pattern entry missing from the compressed matrix".into()))?
        };

        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
            ..Default::default()
        };
        let faer_ordering = match ordering {
            FillOrdering::Amd => SymmetricOrdering::Amd,
            FillOrdering::Natural => SymmetricOrdering::Identity,
        };
        let plan = factorize_symbolic_cholesky(lower.symbolic(), Side::Lower, faer_ordering, params)
            .map_err(|err| CholeskyError::Analysis(format!("{err:?}")))?;

        let (col_ptr, row_idx) = match plan.raw() {
            SymbolicCholeskyRaw::Simplicial(simplicial) => {
                (simplicial.col_ptr().to_vec(), simplicial.row_idx().to_vec())
            }
            SymbolicCholeskyRaw::Supernodal(_) => {
                return Err(CholeskyError::Analysis("expected a simplicial factor".into()));
            }
        };
        for j in 0..n {
            let column = &row_idx[col_ptr[j]..col_ptr[j + 1]];
            if column.first() != Some(&j) || column.windows(2).any(|w| w[0] >= w[1]) {
                return Err(CholeskyError::Analysis(format!("unexpected layout of factor column {j}")));
            }
        }

        let perm: Vec<usize> = match plan.perm() {
            Some(perm) => perm.arrays().0.to_vec(),
            None => (0..n).collect(),
        };
        let mut pinv = vec![0; n];
        for (k, &original) in perm.iter().enumerate() {
            pinv[original] = k;
        }

        let mut scatter: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
        for (position, (row, col)) in pattern.entries().enumerate() {
            let (i, j) = (pinv[row], pinv[col]);
            let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
            scatter[hi].push((lo, position));
        }

        let mut row_pattern: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut row_slots: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for slot in col_ptr[i] + 1..col_ptr[i + 1] {
                let k = row_idx[slot];
                row_pattern[k].push(i);
                row_slots[k].push(slot);
            }
        }

        Ok(Self {
            n,
            n_values: pattern.len(),
            plan,
            lower,
            csc_position,
            perm,
            pinv,
            col_ptr,
            row_idx,
            row_pattern,
            row_slots,
            scatter,
        })
    }

    /// Number of nonzeros in the factor, diagonal included.
    pub fn factor_nnz(&self) -> usize {
        self.row_idx.len()
    }

    fn slot(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.col_ptr[col];
        let end = self.col_ptr[col + 1];
        self.row_idx[start..end]
            .binary_search(&row)
            .ok()
            .map(|offset| start + offset)
    }

    fn check_len(&self, found: usize) -> Result<(), CholeskyError> {
        if found != self.n_values {
            return Err(CholeskyError::DimensionMismatch {
                expected: self.n_values,
                found,
            });
        }
        Ok(())
    }
}

/// Numeric factor `P A Pᵀ = L Lᵀ` of `f64` values.
#[derive(Debug)]
pub struct CholeskyFactor {
    symbolic: Arc<SymbolicCholesky>,
    values: Vec<f64>,
}

impl CholeskyFactor {
    /// Factors the matrix whose lower-triangle values are given in pattern order.
    pub fn factorize(symbolic: Arc<SymbolicCholesky>, values: &[f64]) -> Result<Self, CholeskyError> {
        symbolic.check_len(values.len())?;
        let s = &*symbolic;

        let mut csc = vec![0.0; s.lower.symbolic().col_ptr()[s.n]];
        for (&p, &v) in s.csc_position.iter().zip(values) {
            csc[p] += v;
        }
        let matrix = SparseColMatRef::new(s.lower.symbolic(), &csc);

        let mut l = vec![0.0; s.row_idx.len()];
        let mut mem = MemBuffer::new(s.plan.factorize_numeric_llt_scratch::<f64>(Par::Seq, Default::default()));
        s.plan
            .factorize_numeric_llt(
                &mut l,
                matrix,
                Side::Lower,
                Default::default(),
                Par::Seq,
                MemStack::new(&mut mem),
                Default::default(),
            )
            .map(|_| ())
            .map_err(|_| CholeskyError::NotPositiveDefinite)?;

        for j in 0..s.n {
            let pivot = l[s.col_ptr[j]];
            if !(pivot > 0.0) || !pivot.is_finite() {
                return Err(CholeskyError::NonPositivePivot {
                    column: s.perm[j],
                    pivot,
                });
            }
        }
        if l.iter().any(|v| !v.is_finite()) {
            return Err(CholeskyError::NotPositiveDefinite);
        }
        Ok(Self { symbolic, values: l })
    }

    /// Solves `A x = rhs`.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        let s = &*self.symbolic;
        assert_eq!(rhs.len(), s.n, "right-hand side has the wrong length");
        let mut x = rhs.to_vec();
        let llt = LltRef::<'_, usize, f64>::new(&s.plan, &self.values);
        let mut mem = MemBuffer::new(s.plan.solve_in_place_scratch::<f64>(1, Par::Seq));
        llt.solve_in_place_with_conj(
            Conj::No,
            MatMut::from_column_major_slice_mut(&mut x, s.n, 1),
            Par::Seq,
            MemStack::new(&mut mem),
        );
        x
    }

    /// `log det A = 2 Σ log L_kk`.
    pub fn log_determinant(&self) -> f64 {
        let s = &*self.symbolic;
        2.0 * (0..s.n).map(|j| self.values[s.col_ptr[j]].ln()).sum::<f64>()
    }

    /// Entries of `A⁻¹` on the pattern of `L + Lᵀ`.
    ///
    /// Uses the Takahashi recurrences, processing columns from last to first so
    /// every entry a column needs has already been computed.
    pub fn selected_inverse(&self) -> SelectedInverse {
        let s = &*self.symbolic;
        let l = &self.values;
        let mut z = vec![0.0; l.len()];

        for j in (0..s.n).rev() {
            let start = s.col_ptr[j];
            let end = s.col_ptr[j + 1];
            let ljj = l[start];
            for p in start + 1..end {
                let i = s.row_idx[p];
                let mut sum = 0.0;
                for q in start + 1..end {
                    let k = s.row_idx[q];
                    let zik = if i == k {
                        z[s.col_ptr[i]]
                    } else {
                        let (lo, hi) = if i < k { (i, k) } else { (k, i) };
                        s.slot(hi, lo).map_or(0.0, |slot| z[slot])
                    };
                    sum += l[q] * zik;
                }
                z[p] = -sum / ljj;
            }
            let mut sum = 0.0;
            for q in start + 1..end {
                sum += l[q] * z[q];
            }
            z[start] = (1.0 / ljj - sum) / ljj;
        }

        SelectedInverse {
            symbolic: Arc::clone(&self.symbolic),
            values: z,
        }
    }
}

/// Up-looking factorization over any [`Scalar`], on the plan's factor pattern.
#[derive(Debug)]
pub struct RecordedFactor<T> {
    symbolic: Arc<SymbolicCholesky>,
    values: Vec<T>,
}

impl<T: Scalar> RecordedFactor<T> {
    pub fn factorize(symbolic: Arc<SymbolicCholesky>, values: &[T]) -> Result<Self, CholeskyError> {
        symbolic.check_len(values.len())?;
        let s = &*symbolic;
        let zero = T::from_f64(0.0);
        let mut l = vec![zero; s.row_idx.len()];
        let mut x = vec![zero; s.n];

        for k in 0..s.n {
            for &(i, position) in &s.scatter[k] {
                x[i] += values[position];
            }
            let mut d = x[k];
            x[k] = zero;
            for (&i, &slot) in s.row_pattern[k].iter().zip(&s.row_slots[k]) {
                let lki = x[i] / l[s.col_ptr[i]];
                x[i] = zero;
                // Column i entries above row k were all computed in earlier rows.
                for p in s.col_ptr[i] + 1..slot {
                    let r = s.row_idx[p];
                    x[r] -= l[p] * lki;
                }
                d -= lki * lki;
                l[slot] = lki;
            }
            let pivot = d.value();
            if !(pivot > 0.0) || !pivot.is_finite() {
                return Err(CholeskyError::NonPositivePivot {
                    column: s.perm[k],
                    pivot,
                });
            }
            l[s.col_ptr[k]] = d.sqrt();
        }

        Ok(Self { symbolic, values: l })
    }

    /// Solves `A x = rhs`.
    pub fn solve(&self, rhs: &[T]) -> Vec<T> {
        let s = &*self.symbolic;
        assert_eq!(rhs.len(), s.n, "right-hand side has the wrong length");
        let l = &self.values;
        let mut y: Vec<T> = s.perm.iter().map(|&original| rhs[original]).collect();

        for j in 0..s.n {
            let start = s.col_ptr[j];
            y[j] /= l[start];
            let yj = y[j];
            if yj.is_identically_zero() {
                continue;
            }
            for p in start + 1..s.col_ptr[j + 1] {
                let r = s.row_idx[p];
                y[r] -= l[p] * yj;
            }
        }
        for j in (0..s.n).rev() {
            let start = s.col_ptr[j];
            let mut yj = y[j];
            for p in start + 1..s.col_ptr[j + 1] {
                yj -= l[p] * y[s.row_idx[p]];
            }
            y[j] = yj / l[start];
        }

        let mut solution = vec![T::from_f64(0.0); s.n];
        for (k, &original) in s.perm.iter().enumerate() {
            solution[original] = y[k];
        }
        solution
    }

    pub fn log_determinant(&self) -> T {
        let s = &*self.symbolic;
        let mut total = T::from_f64(0.0);
        for j in 0..s.n {
            total += self.values[s.col_ptr[j]].ln();
        }
        total * 2.0
    }
}

/// Entries of the inverse restricted to the factor pattern.
#[derive(Clone, Debug)]
pub struct SelectedInverse {
    symbolic: Arc<SymbolicCholesky>,
    values: Vec<f64>,
}

impl SelectedInverse {
    /// `(A⁻¹)_{row,col}` in the original numbering, when it lies on the pattern.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let s = &*self.symbolic;
        let (i, j) = (s.pinv[row], s.pinv[col]);
        let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
        s.slot(hi, lo).map(|slot| self.values[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::record;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random sparse SPD matrix with a diagonally dominant diagonal.
    fn random_spd(n: usize, density: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..i {
                if rng.r#gen::<f64>() < density {
                    let v = rng.r#gen::<f64>() - 0.5;
                    a[[i, j]] = v;
                    a[[j, i]] = v;
                }
            }
        }
        for i in 0..n {
            let off: f64 = (0..n).filter(|&j| j != i).map(|j| a[[i, j]].abs()).sum();
            a[[i, i]] = off + 1.0 + rng.r#gen::<f64>();
        }
        a
    }

    fn lower_pattern(a: &Array2<f64>) -> (SparsityPattern, Vec<f64>) {
        let n = a.nrows();
        let mut pattern = SparsityPattern::default();
        let mut values = Vec::new();
        for col in 0..n {
            for row in col..n {
                if a[[row, col]] != 0.0 || row == col {
                    pattern.rows.push(row);
                    pattern.cols.push(col);
                    values.push(a[[row, col]]);
                }
            }
        }
        (pattern, values)
    }

    fn dense_inverse(a: &Array2<f64>) -> Array2<f64> {
        let n = a.nrows();
        let (pattern, values) = lower_pattern(a);
        let symbolic = Arc::new(SymbolicCholesky::analyze(n, &pattern, FillOrdering::Natural).unwrap());
        let factor = CholeskyFactor::factorize(symbolic, &values).unwrap();
        let mut inverse = Array2::zeros((n, n));
        for j in 0..n {
            let mut unit = vec![0.0; n];
            unit[j] = 1.0;
            for (i, v) in factor.solve(&unit).into_iter().enumerate() {
                inverse[[i, j]] = v;
            }
        }
        inverse
    }

    #[test]
    fn solve_and_log_determinant_match_dense_results() {
        let a = random_spd(12, 0.25, 7);
        let (pattern, values) = lower_pattern(&a);
        for ordering in [FillOrdering::Natural, FillOrdering::Amd] {
            let symbolic = Arc::new(SymbolicCholesky::analyze(12, &pattern, ordering).unwrap());
            let factor = CholeskyFactor::factorize(symbolic, &values).unwrap();
            let rhs: Vec<f64> = (0..12).map(|i| (i as f64 * 0.37).sin()).collect();
            let x = factor.solve(&rhs);
            for i in 0..12 {
                let ax: f64 = (0..12).map(|j| a[[i, j]] * x[j]).sum();
                assert_relative_eq!(ax, rhs[i], epsilon = 1e-10);
            }

            let a_faer = faer::Mat::<f64>::from_fn(12, 12, |i, j| a[[i, j]]);
            let llt = a_faer.as_ref().llt(faer::Side::Lower).unwrap();
            let dense_log_det: f64 = (0..12).map(|i| 2.0 * llt.L().get(i, i).ln()).sum();
            assert_relative_eq!(factor.log_determinant(), dense_log_det, epsilon = 1e-10);
        }
    }

    #[test]
    fn amd_keeps_arrow_matrix_fill_free() {
        // Row/column 0 couples to everything; eliminated first it would fill the matrix.
        let n = 8;
        let mut pattern = SparsityPattern::default();
        for col in 0..n {
            pattern.rows.push(col);
            pattern.cols.push(col);
            if col == 0 {
                for row in 1..n {
                    pattern.rows.push(row);
                    pattern.cols.push(0);
                }
            }
        }
        let natural = SymbolicCholesky::analyze(n, &pattern, FillOrdering::Natural).unwrap();
        let ordered = SymbolicCholesky::analyze(n, &pattern, FillOrdering::Amd).unwrap();
        assert_eq!(natural.factor_nnz(), n * (n + 1) / 2);
        assert_eq!(ordered.factor_nnz(), 2 * n - 1);
        assert!(ordered.pinv[0] >= n - 2, "hub eliminated at step {}", ordered.pinv[0]);
    }

    #[test]
    fn selected_inverse_matches_dense_inverse_on_pattern() {
        let a = random_spd(15, 0.2, 11);
        let (pattern, values) = lower_pattern(&a);
        let symbolic = Arc::new(SymbolicCholesky::analyze(15, &pattern, FillOrdering::Amd).unwrap());
        let factor = CholeskyFactor::factorize(symbolic, &values).unwrap();
        let selected = factor.selected_inverse();
        let inverse = dense_inverse(&a);
        for (row, col) in pattern.entries() {
            let value = selected.get(row, col).expect("pattern entries lie on the factor pattern");
            assert_relative_eq!(value, inverse[[row, col]], epsilon = 1e-10);
            assert_relative_eq!(selected.get(col, row).unwrap(), value);
        }
    }

    #[test]
    fn recorded_factor_agrees_with_the_numeric_factor() {
        let a = random_spd(10, 0.3, 5);
        let (pattern, values) = lower_pattern(&a);
        let symbolic = Arc::new(SymbolicCholesky::analyze(10, &pattern, FillOrdering::Amd).unwrap());
        let numeric = CholeskyFactor::factorize(Arc::clone(&symbolic), &values).unwrap();
        let generic = RecordedFactor::factorize(symbolic, &values).unwrap();
        for (x, y) in numeric.values.iter().zip(&generic.values) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
        let rhs: Vec<f64> = (0..10).map(|i| 1.0 - 0.2 * i as f64).collect();
        for (x, y) in numeric.solve(&rhs).iter().zip(generic.solve(&rhs)) {
            assert_relative_eq!(*x, y, epsilon = 1e-12);
        }
        assert_relative_eq!(numeric.log_determinant(), generic.log_determinant(), epsilon = 1e-12);
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let pattern = SparsityPattern {
            rows: vec![0, 1, 1],
            cols: vec![0, 0, 1],
        };
        let symbolic = Arc::new(SymbolicCholesky::analyze(2, &pattern, FillOrdering::Natural).unwrap());
        let numeric = CholeskyFactor::factorize(Arc::clone(&symbolic), &[1.0, 2.0, 1.0]);
        assert!(matches!(
            numeric,
            Err(CholeskyError::NotPositiveDefinite | CholeskyError::NonPositivePivot { .. })
        ));
        match RecordedFactor::factorize(Arc::clone(&symbolic), &[1.0, 2.0, 1.0]) {
            Err(CholeskyError::NonPositivePivot { column, pivot }) => {
                assert_eq!(column, 1);
                assert_relative_eq!(pivot, -3.0);
            }
            other => panic!("expected an indefinite-matrix error, got {other:?}"),
        }
        let nan = CholeskyFactor::factorize(Arc::clone(&symbolic), &[f64::NAN, 0.0, 1.0]);
        assert!(nan.is_err());
        let short = CholeskyFactor::factorize(symbolic, &[1.0]);
        assert!(matches!(short, Err(CholeskyError::DimensionMismatch { expected: 3, found: 1 })));
    }

    #[test]
    fn upper_triangle_entries_are_rejected() {
        let pattern = SparsityPattern {
            rows: vec![0],
            cols: vec![1],
        };
        let err = SymbolicCholesky::analyze(2, &pattern, FillOrdering::Natural).unwrap_err();
        assert_eq!(err, CholeskyError::InvalidPattern { row: 0, col: 1, n: 2 });
    }

    #[test]
    fn recorded_log_determinant_differentiates_like_the_trace_formula() {
        // d/dt log det(A + t E) = trace(A⁻¹ E); E has a 1 at (2,1) and (1,2).
        let mut a = random_spd(4, 0.6, 3);
        a[[2, 1]] = 0.3;
        a[[1, 2]] = 0.3;
        let (pattern, values) = lower_pattern(&a);
        let symbolic = Arc::new(SymbolicCholesky::analyze(4, &pattern, FillOrdering::Amd).unwrap());
        let tape = record(&values, |v| {
            let factor = RecordedFactor::factorize(Arc::clone(&symbolic), v).unwrap();
            vec![factor.log_determinant()]
        })
        .unwrap();
        let (logdet, gradient) = tape.gradient(&values, &[1.0]);
        let plain = CholeskyFactor::factorize(Arc::clone(&symbolic), &values).unwrap();
        assert_relative_eq!(logdet[0], plain.log_determinant(), epsilon = 1e-12);

        let inverse = dense_inverse(&a);
        let position = pattern.position(2, 1).unwrap();
        assert_relative_eq!(gradient[position], 2.0 * inverse[[2, 1]], epsilon = 1e-10);
        let diagonal = pattern.position(3, 3).unwrap();
        assert_relative_eq!(gradient[diagonal], inverse[[3, 3]], epsilon = 1e-10);
    }
}
