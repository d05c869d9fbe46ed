//! Propensity weights and bilinear reaction coefficients.
//!
//! For a reaction with local stoichiometric change `nu` and a basis `X` of one
//! partition, the jump coefficient is
//!
//! ```text
//! C[i, j] = sum_x w(x) X(x + nu, i) X(x, j)
//! ```
//!
//! and the depletion coefficient is `D[i, j] = sum_x w(x) X(x, i) X(x, j)`,
//! where `w` is the propensity times the quadrature weight of the grid.

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::grid::GridParms;
use crate::linalg::bilinear_form;
use crate::reaction::Reaction;

/// Evaluate `f` at the population state of every grid point, in parallel.
fn evaluate_on_grid<F>(grid: &GridParms, f: F) -> Array1<f64>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    let values: Vec<f64> = (0..grid.dx())
        .into_par_iter()
        .map(|alpha| f(&grid.index_to_state(alpha)))
        .collect();
    Array1::from(values)
}

/// Quadrature weight of `reaction` over `partition` with the complement fixed.
///
/// The full population state is the concatenation of the complement state
/// (decoded from `complement_index` on `complement`) and the partition state
/// decoded from each combinatorial index of `partition`. Species are placed by
/// their global ids, so `partition` and `complement` together must cover
/// species `0..d` exactly once. Works for non-separable propensities.
///
/// # Arguments
/// * `partition` - Grid whose state space the result is indexed by
/// * `complement` - Grid of the remaining species
/// * `complement_index` - Multi-index of the fixed complement state
/// * `reaction` - Reaction whose propensity is evaluated
///
/// # Returns
/// Vector of length `partition.dx()` holding `a(x) * h_mult`
pub fn reaction_weight(
    partition: &GridParms,
    complement: &GridParms,
    complement_index: &[usize],
    reaction: &Reaction,
) -> Array1<f64> {
    let d = partition.d() + complement.d();
    let mut base = vec![0.0; d];
    let complement_state = complement.vec_index_to_state(complement_index);
    for (k, &s) in complement.species.iter().enumerate() {
        base[s] = complement_state[k];
    }

    let h_mult = partition.h_mult();
    evaluate_on_grid(partition, |local| {
        let mut state = base.clone();
        for (k, &s) in partition.species.iter().enumerate() {
            state[s] = local[k];
        }
        reaction.propensity(&state) * h_mult
    })
}

/// Quadrature weight of the factors of a separable `reaction` that act on
/// species of `partition`.
///
/// Returns `None` if the propensity does not factor over species.
pub fn partition_weight(partition: &GridParms, reaction: &Reaction) -> Option<Array1<f64>> {
    if !reaction.is_separable() {
        return None;
    }
    let h_mult = partition.h_mult();
    Some(evaluate_on_grid(partition, |local| {
        reaction
            .local_propensity(&partition.species, local)
            .unwrap_or(0.0)
            * h_mult
    }))
}

/// Jump (`C`) and depletion (`D`) coefficients of `basis` under `weight`.
///
/// # Arguments
/// * `partition` - Grid of the basis rows
/// * `weight` - Propensity weight over the partition (see [`reaction_weight`])
/// * `basis` - Basis matrix of shape `dx x r`
/// * `nu` - Stoichiometric change restricted to the partition
///
/// # Returns
/// `(C, D)`, both `r x r`
pub fn assemble_coefficients(
    partition: &GridParms,
    weight: &Array1<f64>,
    basis: &Array2<f64>,
    nu: &[i64],
) -> (Array2<f64>, Array2<f64>) {
    let shifted = shift_basis(partition, basis, nu);
    (
        bilinear_form(&shifted, basis, weight),
        bilinear_form(basis, basis, weight),
    )
}

/// `X(x + nu)`, zero where `x + nu` leaves the grid.
pub(crate) fn shift_basis(partition: &GridParms, basis: &Array2<f64>, nu: &[i64]) -> Array2<f64> {
    let backward: Vec<i64> = nu.iter().map(|v| -v).collect();
    partition.shift_rows(&basis.view(), &backward)
}
