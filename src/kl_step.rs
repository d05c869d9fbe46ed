//! K- and L-steps of a two-factor low-rank state `P = X S V^T`.
//!
//! Unlike the tree integrator, this step evaluates the propensity on the full
//! state for every combination of the complement species it depends on, so it
//! handles non-separable propensities.

use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug_span, trace};

use crate::coefficients::{reaction_weight, shift_basis};
use crate::error::{Result, TtnError};
use crate::grid::GridParms;
use crate::linalg::bilinear_form;
use crate::reaction::{Reaction, ReactionSystem};

/// Which factor is updated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlDirection {
    /// Update `x`, which holds `K = X S`; coefficients come from `v`.
    K,
    /// Update `v`, which holds `L = V S^T`; coefficients come from `x`.
    L,
}

/// Split of the species into the row space of `x` and that of `v`.
#[derive(Clone, Debug)]
pub struct Bipartition {
    pub first: GridParms,
    pub second: GridParms,
}

impl Bipartition {
    /// Split `grid` by global species ids.
    pub fn new(grid: &GridParms, first: &[usize], second: &[usize]) -> Result<Self> {
        let mut all: Vec<usize> = first.iter().chain(second).copied().collect();
        all.sort_unstable();
        let mut expected = grid.species.clone();
        expected.sort_unstable();
        if all != expected {
            return Err(TtnError::SpeciesMismatch(format!(
                "bipartition {:?} | {:?} does not cover the grid species {:?}",
                first, second, grid.species
            )));
        }
        Ok(Self {
            first: grid.select_species(first)?,
            second: grid.select_species(second)?,
        })
    }
}

/// Low-rank state `P = X S V^T` over a [`Bipartition`].
#[derive(Clone, Debug)]
pub struct LowRank2 {
    pub x: Array2<f64>,
    pub s: Array2<f64>,
    pub v: Array2<f64>,
}

impl LowRank2 {
    pub fn new(x: Array2<f64>, s: Array2<f64>, v: Array2<f64>) -> Self {
        Self { x, s, v }
    }

    /// `X S V^T`, rows indexed by the first partition.
    pub fn full_matrix(&self) -> Array2<f64> {
        self.x.dot(&self.s).dot(&self.v.t())
    }
}

/// Jump and depletion coefficients for every combination of the complement
/// species `reaction` depends on.
fn dependent_coefficients(
    partition: &GridParms,
    complement: &GridParms,
    dep_positions: &[usize],
    basis: &Array2<f64>,
    shifted: &Array2<f64>,
    reaction: &Reaction,
) -> Vec<(Array2<f64>, Array2<f64>)> {
    let dep_grid = complement.partition(dep_positions);
    (0..dep_grid.dx())
        .into_par_iter()
        .map(|beta| {
            let dep_index = dep_grid.comb_to_vec(beta);
            // Species the propensity ignores stay at index 0
            let mut vec_index = vec![0usize; complement.d()];
            for (k, &pos) in dep_positions.iter().enumerate() {
                vec_index[pos] = dep_index[k];
            }
            let weight = reaction_weight(partition, complement, &vec_index, reaction);
            (
                bilinear_form(shifted, basis, &weight),
                bilinear_form(basis, basis, &weight),
            )
        })
        .collect()
}

/// Advance the K (or L) factor of `lr` by one explicit Euler step of size `tau`.
///
/// The basis factor must be orthonormal under the weighted inner product of
/// its partition. The updated factor receives
///
/// ```text
/// sum_mu shift_{nu_c}(U C_mu^T) - U D_mu^T
/// ```
///
/// where every row of `U` uses the coefficient pair of its own dependent
/// complement state.
///
/// # Arguments
/// * `direction` - Factor to update
/// * `lr` - Low-rank state, updated in place
/// * `bipartition` - Grids of the row spaces of `x` and `v`
/// * `reactions` - Reaction system over the union of both grids
/// * `tau` - Step size
///
/// # Errors
/// `SpeciesMismatch` if the bipartition does not cover the species of the
/// reaction system, `DimensionMismatch` if a factor does not match its grid.
pub fn perform_kl_step(
    direction: KlDirection,
    lr: &mut LowRank2,
    bipartition: &Bipartition,
    reactions: &ReactionSystem,
    tau: f64,
) -> Result<()> {
    let _span = debug_span!("kl_step", ?direction).entered();

    let mut species: Vec<usize> = bipartition
        .first
        .species
        .iter()
        .chain(&bipartition.second.species)
        .copied()
        .collect();
    species.sort_unstable();
    if species != (0..reactions.d()).collect::<Vec<_>>() {
        return Err(TtnError::SpeciesMismatch(format!(
            "bipartition covers {:?}, reaction system has {} species",
            species,
            reactions.d()
        )));
    }

    let LowRank2 { x, v, .. } = lr;
    let (partition, complement, basis, updated) = match direction {
        KlDirection::K => (&bipartition.second, &bipartition.first, &*v, x),
        KlDirection::L => (&bipartition.first, &bipartition.second, &*x, v),
    };
    check_rows("basis", basis, partition)?;
    check_rows("updated", updated, complement)?;

    let mut kl_dot = Array2::<f64>::zeros(updated.raw_dim());
    for reaction in &reactions.reactions {
        let nu_p = partition.local_shift(reaction.nu());
        let nu_c = complement.local_shift(reaction.nu());
        let shifted = shift_basis(partition, basis, &nu_p);

        let dep_positions: Vec<usize> = reaction
            .depends_on()
            .iter()
            .filter_map(|&s| complement.position(s))
            .collect();
        let dep_grid = complement.partition(&dep_positions);
        let pairs =
            dependent_coefficients(partition, complement, &dep_positions, basis, &shifted, reaction);
        trace!(reaction = %reaction.name, combinations = pairs.len(), "kl coefficients");

        let mut prod_c = Array2::<f64>::zeros(updated.raw_dim());
        let mut prod_d = Array2::<f64>::zeros(updated.raw_dim());
        for alpha in 0..complement.dx() {
            let vec_index = complement.comb_to_vec(alpha);
            let dep_index: Vec<usize> = dep_positions.iter().map(|&p| vec_index[p]).collect();
            let (c, d) = &pairs[dep_grid.vec_to_comb(&dep_index)];
            let row = updated.row(alpha);
            prod_c.row_mut(alpha).assign(&c.dot(&row));
            prod_d.row_mut(alpha).assign(&d.dot(&row));
        }

        kl_dot += &complement.shift_rows(&prod_c.view(), &nu_c);
        kl_dot -= &prod_d;
    }

    updated.scaled_add(tau, &kl_dot);
    Ok(())
}

fn check_rows(name: &str, factor: &Array2<f64>, grid: &GridParms) -> Result<()> {
    if factor.nrows() != grid.dx() {
        return Err(TtnError::DimensionMismatch {
            node: name.to_string(),
            expected: grid.dx(),
            found: factor.nrows(),
        });
    }
    Ok(())
}
