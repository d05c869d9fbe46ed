//! Dense kernels on `ndarray`: inner products, Gram-Schmidt QR, bilinear
//! forms, Kronecker products and mode matricization of 3-index core tensors.

use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};

use crate::error::{Result, TtnError};

/// Kronecker product with row index `p * b.nrows() + q`.
pub use ndarray::linalg::kron;

/// Relative residual below which a column counts as linearly dependent.
const DEGENERACY_TOL: f64 = 1e-12;

/// Inner product on the row space of a basis matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InnerProduct {
    /// `sum_i u_i v_i`
    Flat,
    /// `w * sum_i u_i v_i` (quadrature with constant weight `w`)
    ConstWeight(f64),
}

impl InnerProduct {
    pub fn eval(&self, u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
        let dot = u.dot(&v);
        match self {
            InnerProduct::Flat => dot,
            InnerProduct::ConstWeight(w) => w * dot,
        }
    }

    pub fn norm(&self, u: ArrayView1<f64>) -> f64 {
        self.eval(u, u).sqrt()
    }
}

/// Triangular factor of a Gram-Schmidt QR.
#[derive(Clone, Debug)]
pub struct Orthogonalized {
    /// Upper triangular `R` with `input = Q * R`.
    pub r: Array2<f64>,
    /// Number of columns that were linearly dependent and replaced by a
    /// completion vector (their diagonal entry in `R` is zero).
    pub completed: usize,
}

/// Orthonormalize the columns of `basis` in place under `ip`.
///
/// On return `basis` holds `Q` with `Q^T W Q = I` and the result holds `R`
/// such that the input equals `Q * R`. Dependent columns are replaced by the
/// coordinate direction with the largest component orthogonal to the
/// previous columns, so `Q` always has full column rank.
///
/// # Errors
/// `RankExceedsDimension` if there are more columns than rows, `NonFinite`
/// if the input contains NaN or infinite values.
pub fn gram_schmidt(basis: &mut Array2<f64>, ip: InnerProduct) -> Result<Orthogonalized> {
    let (rows, cols) = basis.dim();
    if cols > rows {
        return Err(TtnError::RankExceedsDimension {
            columns: cols,
            dimension: rows,
        });
    }

    let mut r = Array2::<f64>::zeros((cols, cols));
    let mut completed = 0;

    for j in 0..cols {
        let mut v = basis.column(j).to_owned();
        if v.iter().any(|x| !x.is_finite()) {
            return Err(TtnError::NonFinite);
        }
        let norm_in = ip.norm(v.view());

        // Two passes of modified Gram-Schmidt keep orthogonality at machine precision
        for _ in 0..2 {
            for i in 0..j {
                let qi = basis.column(i);
                let c = ip.eval(qi, v.view());
                r[[i, j]] += c;
                v.scaled_add(-c, &qi);
            }
        }

        let nrm = ip.norm(v.view());
        if nrm > DEGENERACY_TOL * norm_in && nrm > 0.0 {
            r[[j, j]] = nrm;
            basis.column_mut(j).assign(&(v / nrm));
        } else {
            let q = completion_vector(basis, j, ip);
            basis.column_mut(j).assign(&q);
            completed += 1;
        }
    }

    Ok(Orthogonalized { r, completed })
}

/// Unit vector orthogonal to the first `j` columns of `basis`.
fn completion_vector(basis: &Array2<f64>, j: usize, ip: InnerProduct) -> Array1<f64> {
    let rows = basis.nrows();
    let mut best = Array1::<f64>::zeros(rows);
    let mut best_norm = -1.0;

    for m in 0..rows {
        let mut v = Array1::<f64>::zeros(rows);
        v[m] = 1.0;
        for _ in 0..2 {
            for i in 0..j {
                let qi = basis.column(i);
                let c = ip.eval(qi, v.view());
                v.scaled_add(-c, &qi);
            }
        }
        let nrm = ip.norm(v.view());
        if nrm > best_norm {
            best_norm = nrm;
            best = v;
        }
    }
    best / best_norm
}

/// `u^T diag(weight) v`, i.e. `c[i, j] = sum_x w(x) u(x, i) v(x, j)`.
pub fn bilinear_form(u: &Array2<f64>, v: &Array2<f64>, weight: &Array1<f64>) -> Array2<f64> {
    let weighted = v * &weight.view().insert_axis(Axis(1));
    u.t().dot(&weighted)
}

/// Axis order that moves `mode` of a 3-index tensor last.
fn mode_order(mode: usize) -> [usize; 3] {
    match mode {
        0 => [1, 2, 0],
        1 => [0, 2, 1],
        2 => [0, 1, 2],
        _ => panic!("mode must be 0, 1 or 2, got {}", mode),
    }
}

/// Flatten a core tensor into a matrix whose columns run over `mode`.
///
/// For `q` of shape `r0 x r1 x r2` the rows enumerate the two remaining
/// modes in increasing order, the lower one varying slowest: mode 0 gives rows
/// `j1 * r2 + i`, mode 1 gives `j0 * r2 + i`, mode 2 gives `j0 * r1 + j1`.
pub fn matricize(q: &Array3<f64>, mode: usize) -> Array2<f64> {
    let order = mode_order(mode);
    let permuted = q.view().permuted_axes(order);
    let shape = permuted.shape().to_vec();
    let data: Vec<f64> = permuted.iter().copied().collect();
    Array2::from_shape_vec((shape[0] * shape[1], shape[2]), data)
        .expect("matricize: element count is preserved")
}

/// Inverse of [`matricize`] for a tensor of shape `dim`.
pub fn tensorize(mat: &Array2<f64>, mode: usize, dim: (usize, usize, usize)) -> Array3<f64> {
    let order = mode_order(mode);
    let full = [dim.0, dim.1, dim.2];
    let permuted_dim = (full[order[0]], full[order[1]], full[order[2]]);
    assert_eq!(
        mat.dim(),
        (permuted_dim.0 * permuted_dim.1, permuted_dim.2),
        "tensorize: matrix shape does not match tensor dimensions"
    );

    let data: Vec<f64> = mat.iter().copied().collect();
    let permuted = Array3::from_shape_vec(permuted_dim, data)
        .expect("tensorize: element count is preserved");

    // Undo the permutation: axis k of the result is axis inverse[k] of `permuted`
    let mut inverse = [0usize; 3];
    for (pos, &axis) in order.iter().enumerate() {
        inverse[axis] = pos;
    }
    permuted
        .permuted_axes(inverse)
        .as_standard_layout()
        .into_owned()
}
