//! Symbolic dense linear solves for the diagonal blocks of a BLT ordering.
//!
//! Small blocks are inverted explicitly through the adjugate; larger ones go
//! through a Gram-Schmidt QR factorization and back substitution, which keeps
//! the expression size polynomial in the block size.

use nalgebra::DMatrix;

use crate::error::{OcpError, Result};
use crate::sx::Sx;

/// Blocks with at most this many unknowns are solved by explicit inverse.
pub const SMALL_BLOCK_LIMIT: usize = 3;

/// Solves `a * x = b` symbolically.
///
/// A structurally singular system (zero determinant or zero pivot after
/// constant folding) fails with `UnsolvableBlock`; callers fill in the names.
pub fn solve(a: &DMatrix<Sx>, b: &[Sx]) -> Result<Vec<Sx>> {
    check_system(a, b)?;
    if a.nrows() <= SMALL_BLOCK_LIMIT {
        let inv = inverse(a)?;
        Ok((0..a.nrows())
            .map(|i| dot((0..a.ncols()).map(|j| &inv[(i, j)]), b.iter()))
            .collect())
    } else {
        qr_solve(a, b)
    }
}

/// Laplace expansion along the first row.
pub fn determinant(a: &DMatrix<Sx>) -> Sx {
    match a.nrows() {
        0 => Sx::one(),
        1 => a[(0, 0)].clone(),
        2 => &a[(0, 0)] * &a[(1, 1)] - &a[(0, 1)] * &a[(1, 0)],
        n => {
            let mut det = Sx::zero();
            for j in 0..n {
                if a[(0, j)].is_zero() {
                    continue;
                }
                let term = &a[(0, j)] * determinant(&minor(a, 0, j));
                det = if j % 2 == 0 { det + term } else { det - term };
            }
            det
        }
    }
}

/// Adjugate divided by the determinant.
pub fn inverse(a: &DMatrix<Sx>) -> Result<DMatrix<Sx>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(OcpError::NonSquareJacobian { rows: n, cols: a.ncols() });
    }
    let det = determinant(a);
    if det.is_zero() {
        return Err(OcpError::UnsolvableBlock(Vec::new()));
    }
    if n == 1 {
        return Ok(DMatrix::from_element(1, 1, Sx::one() / det));
    }
    Ok(DMatrix::from_fn(n, n, |i, j| {
        // inv[i][j] = cofactor(j, i) / det
        let cofactor = determinant(&minor(a, j, i));
        let signed = if (i + j) % 2 == 0 { cofactor } else { -cofactor };
        signed / &det
    }))
}

/// Modified Gram-Schmidt QR followed by back substitution on `R x = Qᵀ b`.
pub fn qr_solve(a: &DMatrix<Sx>, b: &[Sx]) -> Result<Vec<Sx>> {
    check_system(a, b)?;
    let n = a.nrows();
    let mut q: Vec<Vec<Sx>> = Vec::with_capacity(n);
    let mut r = DMatrix::from_element(n, n, Sx::zero());
    for k in 0..n {
        let mut v: Vec<Sx> = a.column(k).iter().cloned().collect();
        for (j, qj) in q.iter().enumerate() {
            let rjk = dot(qj.iter(), v.iter());
            if rjk.is_zero() {
                continue;
            }
            v = v.iter().zip(qj).map(|(vi, qi)| vi - &rjk * qi).collect();
            r[(j, k)] = rjk;
        }
        let norm = dot(v.iter(), v.iter()).sqrt();
        if norm.is_zero() {
            return Err(OcpError::UnsolvableBlock(Vec::new()));
        }
        q.push(v.iter().map(|vi| vi / &norm).collect());
        r[(k, k)] = norm;
    }

    let qtb: Vec<Sx> = q.iter().map(|qk| dot(qk.iter(), b.iter())).collect();
    let mut x = vec![Sx::zero(); n];
    for k in (0..n).rev() {
        let mut acc = qtb[k].clone();
        for j in k + 1..n {
            if !r[(k, j)].is_zero() {
                acc = acc - &r[(k, j)] * &x[j];
            }
        }
        x[k] = acc / &r[(k, k)];
    }
    Ok(x)
}

fn check_system(a: &DMatrix<Sx>, b: &[Sx]) -> Result<()> {
    if a.nrows() != a.ncols() {
        return Err(OcpError::NonSquareJacobian {
            rows: a.nrows(),
            cols: a.ncols(),
        });
    }
    if b.len() != a.nrows() {
        return Err(OcpError::DimensionMismatch(format!(
            "right-hand side has {} entries, system has {} rows",
            b.len(),
            a.nrows()
        )));
    }
    Ok(())
}

fn minor(a: &DMatrix<Sx>, row: usize, col: usize) -> DMatrix<Sx> {
    let n = a.nrows() - 1;
    DMatrix::from_fn(n, n, |i, j| {
        let si = if i >= row { i + 1 } else { i };
        let sj = if j >= col { j + 1 } else { j };
        a[(si, sj)].clone()
    })
}

fn dot<'a, 'b>(a: impl Iterator<Item = &'a Sx>, b: impl Iterator<Item = &'b Sx>) -> Sx {
    a.zip(b).fold(Sx::zero(), |acc, (x, y)| acc + x * y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::SxFunction;

    fn tridiagonal(n: usize, diag: &Sx) -> DMatrix<Sx> {
        DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                diag.clone()
            } else if i.abs_diff(j) == 1 {
                Sx::one()
            } else {
                Sx::zero()
            }
        })
    }

    /// Evaluates `a * x - b` with `a` bound to `a_value` and `b_k = k + 1`.
    fn residual_norm(n: usize, a_value: f64) -> f64 {
        let a = Sx::sym("a");
        let b: Vec<Sx> = (0..n).map(|k| Sx::sym(format!("b{k}"))).collect();
        let m = tridiagonal(n, &a);
        let x = solve(&m, &b).expect("system should solve");
        let residual: Vec<Sx> = (0..n)
            .map(|i| dot((0..n).map(|j| &m[(i, j)]), x.iter()) - &b[i])
            .collect();
        let mut inputs = vec![a];
        inputs.extend(b);
        let f = SxFunction::new(&inputs, &residual).expect("function should build");
        let mut values = vec![a_value];
        values.extend((0..n).map(|k| k as f64 + 1.0));
        let out = f.compile::<f64>().unwrap().eval(&values).unwrap();
        out.iter().map(|v| v.abs()).fold(0.0, f64::max)
    }

    #[test]
    fn determinant_of_symbolic_two_by_two() {
        let a = Sx::sym("a");
        let b = Sx::sym("b");
        let m = DMatrix::from_row_slice(2, 2, &[a.clone(), Sx::one(), Sx::zero(), b.clone()]);
        let det = determinant(&m);
        let f = SxFunction::new(&[a, b], &[det]).unwrap();
        let value = f.compile::<f64>().unwrap().eval(&[2.0, 5.0]).unwrap()[0];
        assert!((value - 10.0).abs() < 1e-12);
    }

    #[test]
    fn small_blocks_use_the_inverse() {
        assert!(residual_norm(1, 4.0) < 1e-12);
        assert!(residual_norm(3, 4.0) < 1e-12);
    }

    #[test]
    fn large_blocks_use_qr() {
        assert!(residual_norm(4, 4.0) < 1e-10);
        assert!(residual_norm(6, 3.0) < 1e-10);
    }

    #[test]
    fn structurally_singular_block_is_rejected() {
        let m = DMatrix::from_element(2, 2, Sx::zero());
        let b = vec![Sx::sym("b0"), Sx::sym("b1")];
        assert!(matches!(solve(&m, &b), Err(OcpError::UnsolvableBlock(_))));
        let m = DMatrix::from_element(4, 4, Sx::zero());
        let b: Vec<Sx> = (0..4).map(|k| Sx::sym(format!("b{k}"))).collect();
        assert!(matches!(qr_solve(&m, &b), Err(OcpError::UnsolvableBlock(_))));
    }

    #[test]
    fn rejects_mismatched_right_hand_side() {
        let m = tridiagonal(2, &Sx::sym("a"));
        assert!(matches!(
            solve(&m, &[Sx::sym("b")]),
            Err(OcpError::DimensionMismatch(_))
        ));
    }
}
