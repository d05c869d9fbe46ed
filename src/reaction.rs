//! Reaction model: propensities and stoichiometric shifts.
//!
//! A reaction `mu` moves the population from `x` to `x + nu` at rate
//! `a_mu(x)`. Propensities are either a product of per-species factors
//! (mass-action style, required by the tree integrator) or a general function
//! of the full state with an explicit dependency set.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TtnError};

/// Propensity factor of a single species, evaluated at its population.
pub type SpeciesFactor = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Propensity evaluated on the full population state.
pub type StateFunction = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

#[derive(Clone)]
pub enum Propensity {
    /// `a(x) = prod_s f_s(x_s)`; an empty product is the constant 1.
    Factorized(Vec<(usize, SpeciesFactor)>),
    /// Arbitrary `a(x)` depending only on the listed species.
    General {
        depends_on: Vec<usize>,
        function: StateFunction,
    },
}

#[derive(Clone)]
pub struct Reaction {
    pub name: String,
    nu: Vec<i64>,
    propensity: Propensity,
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("name", &self.name)
            .field("nu", &self.nu)
            .field("depends_on", &self.depends_on())
            .field("separable", &self.is_separable())
            .finish()
    }
}

impl Reaction {
    /// Reaction with a factorized propensity and no factors yet (rate 1).
    pub fn new(name: &str, nu: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            nu,
            propensity: Propensity::Factorized(Vec::new()),
        }
    }

    /// Reaction with a non-separable propensity.
    pub fn general<F>(name: &str, nu: Vec<i64>, depends_on: Vec<usize>, function: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            nu,
            propensity: Propensity::General {
                depends_on,
                function: Arc::new(function),
            },
        }
    }

    /// Multiply the propensity by `factor(x_species)`.
    pub fn factor<F>(mut self, species: usize, factor: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        let factor: SpeciesFactor = Arc::new(factor);
        self.propensity = match self.propensity {
            Propensity::Factorized(mut factors) => {
                factors.push((species, factor));
                Propensity::Factorized(factors)
            }
            Propensity::General {
                mut depends_on,
                function,
            } => {
                if !depends_on.contains(&species) {
                    depends_on.push(species);
                }
                Propensity::General {
                    depends_on,
                    function: Arc::new(move |x: &[f64]| function(x) * factor(x[species])),
                }
            }
        };
        self
    }

    /// Stoichiometric change over all species.
    pub fn nu(&self) -> &[i64] {
        &self.nu
    }

    /// Sorted species the propensity depends on.
    pub fn depends_on(&self) -> Vec<usize> {
        let mut dep: Vec<usize> = match &self.propensity {
            Propensity::Factorized(factors) => factors.iter().map(|(s, _)| *s).collect(),
            Propensity::General { depends_on, .. } => depends_on.clone(),
        };
        dep.sort_unstable();
        dep.dedup();
        dep
    }

    pub fn is_separable(&self) -> bool {
        matches!(self.propensity, Propensity::Factorized(_))
    }

    /// Propensity at a full population state (indexed by global species id).
    pub fn propensity(&self, state: &[f64]) -> f64 {
        match &self.propensity {
            Propensity::Factorized(factors) => {
                factors.iter().map(|(s, f)| f(state[*s])).product()
            }
            Propensity::General { function, .. } => function(state),
        }
    }

    /// Product of the factors belonging to `species`, evaluated at `local`.
    ///
    /// `local[k]` is the population of `species[k]`. Returns `None` for a
    /// non-separable propensity.
    pub fn local_propensity(&self, species: &[usize], local: &[f64]) -> Option<f64> {
        match &self.propensity {
            Propensity::Factorized(factors) => Some(
                factors
                    .iter()
                    .filter_map(|(s, f)| {
                        species.iter().position(|x| x == s).map(|pos| f(local[pos]))
                    })
                    .product(),
            ),
            Propensity::General { .. } => None,
        }
    }
}

/// Set of reactions acting on `n_species` species.
#[derive(Clone, Debug)]
pub struct ReactionSystem {
    pub species_names: Vec<String>,
    pub reactions: Vec<Reaction>,
}

impl ReactionSystem {
    /// Build a system and check every reaction against the species count.
    pub fn new(species_names: Vec<String>, reactions: Vec<Reaction>) -> Result<Self> {
        let d = species_names.len();
        for reaction in &reactions {
            if reaction.nu.len() != d {
                return Err(TtnError::InvalidReaction {
                    reaction: reaction.name.clone(),
                    reason: format!("nu has length {}, expected {}", reaction.nu.len(), d),
                });
            }
            if let Some(&s) = reaction.depends_on().iter().find(|&&s| s >= d) {
                return Err(TtnError::InvalidReaction {
                    reaction: reaction.name.clone(),
                    reason: format!("depends on unknown species {}", s),
                });
            }
        }
        Ok(Self {
            species_names,
            reactions,
        })
    }

    /// Number of reactions.
    pub fn mu(&self) -> usize {
        self.reactions.len()
    }

    pub fn d(&self) -> usize {
        self.species_names.len()
    }
}
