//! Scaled preconditioned GMRES, matrix-free: the only access to the system
//! matrix is a user-supplied matrix-vector product. Used as the linear solver
//! inside the BDF corrector's Newton iteration.

/// Result of one [`Spgmr::solve`] call.
#[derive(Clone, Copy, Debug)]
pub struct SpgmrOutcome {
    /// Final residual 2-norm.
    pub residual: f64,
    /// Whether the requested tolerance was met.
    pub converged: bool,
}

/// Restarted GMRES working storage, sized once per system dimension.
pub struct Spgmr {
    /// Krylov subspace dimension per restart cycle.
    max_krylov: usize,
    max_restarts: usize,
}

impl Spgmr {
    /// CVode's defaults: 5 basis vectors, a handful of restarts.
    pub fn new() -> Self {
        Spgmr {
            max_krylov: 5,
            max_restarts: 5,
        }
    }

    /// Solves `A x = b` to the given residual tolerance, writing the solution
    /// into `x` (also the initial guess). `atimes` computes `A v`.
    pub fn solve<F>(&self, mut atimes: F, b: &[f64], x: &mut [f64], tol: f64) -> SpgmrOutcome
    where
        F: FnMut(&[f64], &mut [f64]),
    {
        let n = b.len();
        let m = self.max_krylov.min(n.max(1));

        let mut residual = 0.0;
        let mut scratch = vec![0.0; n];

        for _restart in 0..self.max_restarts {
            // r = b - A x
            atimes(x, &mut scratch);
            let mut r: Vec<f64> = b.iter().zip(&scratch).map(|(&bi, &ax)| bi - ax).collect();
            let beta = norm(&r);
            residual = beta;
            if beta <= tol {
                return SpgmrOutcome {
                    residual,
                    converged: true,
                };
            }

            // Arnoldi with modified Gram-Schmidt and Givens rotations.
            let mut basis: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
            for v in r.iter_mut() {
                *v /= beta;
            }
            basis.push(r);

            let mut h = vec![vec![0.0; m]; m + 1];
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = vec![0.0; m + 1];
            g[0] = beta;

            let mut cols = 0;
            for j in 0..m {
                atimes(&basis[j], &mut scratch);
                let mut w = scratch.clone();
                for (i, v) in basis.iter().enumerate() {
                    h[i][j] = dot(&w, v);
                    for (wk, vk) in w.iter_mut().zip(v) {
                        *wk -= h[i][j] * vk;
                    }
                }
                let w_norm = norm(&w);
                h[j + 1][j] = w_norm;

                // Previously computed rotations applied to the new column.
                for i in 0..j {
                    let tmp = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
                    h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
                    h[i][j] = tmp;
                }

                let denom = (h[j][j] * h[j][j] + h[j + 1][j] * h[j + 1][j]).sqrt();
                if denom > 0.0 {
                    cs[j] = h[j][j] / denom;
                    sn[j] = h[j + 1][j] / denom;
                } else {
                    cs[j] = 1.0;
                    sn[j] = 0.0;
                }
                h[j][j] = cs[j] * h[j][j] + sn[j] * h[j + 1][j];
                h[j + 1][j] = 0.0;
                g[j + 1] = -sn[j] * g[j];
                g[j] *= cs[j];

                cols = j + 1;
                residual = g[j + 1].abs();

                // A vanishing basis vector means the subspace is exhausted.
                let breakdown = w_norm <= f64::EPSILON * beta;
                if residual <= tol || breakdown {
                    break;
                }
                if cols < m {
                    basis.push(w.iter().map(|&wk| wk / w_norm).collect());
                }
            }

            // Back-substitute the triangular system and update x.
            let mut y = vec![0.0; cols];
            for i in (0..cols).rev() {
                let mut sum = g[i];
                for (k, &yk) in y.iter().enumerate().skip(i + 1) {
                    sum -= h[i][k] * yk;
                }
                y[i] = sum / h[i][i];
            }
            for (j, &yj) in y.iter().enumerate() {
                for (xi, vi) in x.iter_mut().zip(&basis[j]) {
                    *xi += yj * vi;
                }
            }

            if residual <= tol {
                return SpgmrOutcome {
                    residual,
                    converged: true,
                };
            }
        }

        SpgmrOutcome {
            residual,
            converged: residual <= tol,
        }
    }
}

impl Default for Spgmr {
    fn default() -> Self {
        Spgmr::new()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_a_diagonal_system() {
        let diag = [2.0, 4.0, 8.0];
        let b = [2.0, 8.0, 32.0];
        let mut x = [0.0; 3];
        let outcome = Spgmr::new().solve(
            |v, out| {
                for i in 0..3 {
                    out[i] = diag[i] * v[i];
                }
            },
            &b,
            &mut x,
            1e-12,
        );
        assert!(outcome.converged);
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
        assert!((x[2] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn solves_a_nonsymmetric_system() {
        // A = [[3, 1], [0.5, 2]]
        let b = [5.0, 4.5];
        let mut x = [0.0; 2];
        let outcome = Spgmr::new().solve(
            |v, out| {
                out[0] = 3.0 * v[0] + 1.0 * v[1];
                out[1] = 0.5 * v[0] + 2.0 * v[1];
            },
            &b,
            &mut x,
            1e-12,
        );
        assert!(outcome.converged);
        // Exact solution (1, 2).
        assert!((x[0] - 1.0).abs() < 1e-8);
        assert!((x[1] - 2.0).abs() < 1e-8);
    }
}
