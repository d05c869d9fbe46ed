//! Reactions and initial conditions given as tables over the grid.
//!
//! Callers that cannot hand over closures (the Python bindings, input files)
//! describe every propensity factor and every initial marginal by its values
//! at the grid points of one species.

use ndarray::Array1;

use crate::error::{Result, TtnError};
use crate::grid::GridParms;
use crate::reaction::Reaction;

fn invalid(name: &str, reason: String) -> TtnError {
    TtnError::InvalidReaction {
        reaction: name.to_string(),
        reason,
    }
}

/// Reaction whose propensity is a product of tabulated species factors.
///
/// `factors` pairs a global species id with the factor value at each of its
/// `grid.n[species]` grid points. Populations off the grid evaluate to zero.
///
/// # Errors
/// `InvalidReaction` if `nu` does not cover every species, a species id is out
/// of range, or a table length does not match the grid.
pub fn tabulated_reaction(
    grid: &GridParms,
    name: &str,
    nu: Vec<i64>,
    factors: &[(usize, Vec<f64>)],
) -> Result<Reaction> {
    if nu.len() != grid.d() {
        return Err(invalid(
            name,
            format!("nu has {} entries for {} species", nu.len(), grid.d()),
        ));
    }
    let mut reaction = Reaction::new(name, nu);
    for (species, table) in factors {
        let species = *species;
        let axis = grid
            .position(species)
            .ok_or_else(|| invalid(name, format!("unknown species {}", species)))?;
        if table.len() != grid.n[axis] {
            return Err(invalid(
                name,
                format!(
                    "factor of species {} has {} values for {} grid points",
                    species,
                    table.len(),
                    grid.n[axis]
                ),
            ));
        }
        let (liml, binsize) = (grid.liml[axis], grid.binsize[axis]);
        let table = table.clone();
        reaction = reaction.factor(species, move |x| {
            let idx = ((x - liml) / binsize).round();
            if idx < 0.0 || idx >= table.len() as f64 {
                0.0
            } else {
                table[idx as usize]
            }
        });
    }
    Ok(reaction)
}

/// Initial condition that is a product of per-species marginals.
///
/// `marginals[s]` holds the values of species `s` on its grid points. The
/// returned closure evaluates the product over the species of a leaf grid.
///
/// # Errors
/// `SpeciesMismatch` if there is not one marginal per species or a marginal
/// does not match its grid size.
pub fn product_marginals(
    grid: &GridParms,
    marginals: Vec<Vec<f64>>,
) -> Result<impl Fn(&GridParms) -> Array1<f64>> {
    if marginals.len() != grid.d() {
        return Err(TtnError::SpeciesMismatch(format!(
            "{} marginals for {} species",
            marginals.len(),
            grid.d()
        )));
    }
    for (axis, &species) in grid.species.iter().enumerate() {
        if marginals[species].len() != grid.n[axis] {
            return Err(TtnError::SpeciesMismatch(format!(
                "marginal of species {} has {} values for {} grid points",
                species,
                marginals[species].len(),
                grid.n[axis]
            )));
        }
    }
    Ok(move |leaf: &GridParms| {
        Array1::from_shape_fn(leaf.dx(), |alpha| {
            leaf.comb_to_vec(alpha)
                .iter()
                .zip(&leaf.species)
                .map(|(&idx, &species)| marginals[species][idx])
                .product()
        })
    })
}
