//! Small dense linear algebra for contextual algorithms.
//!
//! Matrices are flat row-major `&[f64]` of length `n * n`. Dimensions are in
//! the tens at most, so plain Gaussian elimination is fast enough and avoids
//! an external BLAS dependency.

/// Pivots smaller than this are treated as singular.
pub const PIVOT_EPSILON: f64 = 1e-10;

/// Plain inner product. Extra elements of the longer slice are ignored.
#[inline]
#[must_use]
pub fn dot_product(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// Solve `A x = b` by Gaussian elimination with partial pivoting.
///
/// Works on private copies; the caller's `a` and `b` are never modified.
/// When a column has no pivot above [`PIVOT_EPSILON`] its unknown is
/// unconstrained and is set to zero instead of failing. Near-singular
/// accumulators at cold start therefore yield a usable (if biased) estimate.
#[must_use]
pub fn solve_linear(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    debug_assert_eq!(a.len(), n * n);
    debug_assert_eq!(b.len(), n);

    let mut m = a.to_vec();
    let mut rhs = b.to_vec();
    let mut singular = vec![false; n];

    // Forward elimination. `row` tracks the next pivot row, which lags `col`
    // once singular columns have been skipped.
    let mut row = 0;
    let mut pivot_rows = vec![usize::MAX; n];
    for col in 0..n {
        if row >= n {
            singular[col] = true;
            continue;
        }

        let mut best = row;
        let mut best_abs = m[row * n + col].abs();
        for r in row + 1..n {
            let v = m[r * n + col].abs();
            if v > best_abs {
                best = r;
                best_abs = v;
            }
        }

        if best_abs < PIVOT_EPSILON {
            singular[col] = true;
            continue;
        }

        if best != row {
            for c in 0..n {
                m.swap(row * n + c, best * n + c);
            }
            rhs.swap(row, best);
        }

        let pivot = m[row * n + col];
        for r in row + 1..n {
            let factor = m[r * n + col] / pivot;
            if factor == 0.0 {
                continue;
            }
            for c in col..n {
                m[r * n + c] -= factor * m[row * n + c];
            }
            rhs[r] -= factor * rhs[row];
        }

        pivot_rows[col] = row;
        row += 1;
    }

    // Back substitution; singular unknowns stay at zero.
    let mut x = vec![0.0; n];
    for col in (0..n).rev() {
        if singular[col] {
            continue;
        }
        let r = pivot_rows[col];
        let mut acc = rhs[r];
        for c in col + 1..n {
            acc -= m[r * n + c] * x[c];
        }
        x[col] = acc / m[r * n + col];
    }
    x
}

/// Row-major identity matrix of size `n x n`.
#[must_use]
pub fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}
