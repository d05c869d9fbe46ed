//! Tree tensor network integrator for the chemical master equation.
//!
//! The probability distribution over the populations of `d` species is kept
//! as a tree tensor network over a binary partition of the species. One time
//! step runs the projector-splitting sub-flows recursively over the tree,
//! which keeps every basis orthonormal and every rank fixed.
//!
//! ```no_run
//! use ttn_cme::{GridParms, IntegratorConfig, Reaction, ReactionSystem, TreeBuilder};
//! use ndarray::Array1;
//!
//! # fn main() -> ttn_cme::Result<()> {
//! let grid = GridParms::new(vec![16, 16], vec![1.0, 1.0], vec![0.0, 0.0])?;
//! let reactions = ReactionSystem::new(
//!     vec!["A".into(), "B".into()],
//!     vec![
//!         Reaction::new("make_a", vec![1, 0]).factor(0, |a| if a < 15.0 { 1.0 } else { 0.0 }),
//!         Reaction::new("a_to_b", vec![-1, 1]).factor(0, |a| 0.1 * a).factor(1, |b| if b < 15.0 { 1.0 } else { 0.0 }),
//!     ],
//! )?;
//! let mut tree = TreeBuilder::new("(0)(1)", grid, vec![4])?.build(&reactions, |g| {
//!     let mut p = Array1::zeros(g.dx());
//!     p[0] = 1.0;
//!     p
//! })?;
//! let config = IntegratorConfig::default();
//! for _ in 0..100 {
//!     tree.integrate(0.01, &config)?;
//! }
//! println!("mass after 1.0: {}", tree.mass());
//! # Ok(())
//! # }
//! ```

pub mod coefficients;
pub mod error;
pub mod grid;
pub mod kl_step;
pub mod linalg;
pub mod ode;
pub mod partition;
#[cfg(feature = "python")]
pub mod python;
pub mod reaction;
pub mod subflow;
pub mod tables;
pub mod tree;

pub use coefficients::{assemble_coefficients, partition_weight, reaction_weight};
pub use error::{Result, TtnError};
pub use grid::GridParms;
pub use kl_step::{perform_kl_step, Bipartition, KlDirection, LowRank2};
pub use linalg::{bilinear_form, gram_schmidt, kron, matricize, tensorize, InnerProduct, Orthogonalized};
pub use ode::{IntegrationMethod, IntegratorConfig};
pub use partition::{PartitionTree, TreeBuilder};
pub use reaction::{Propensity, Reaction, ReactionSystem};
pub use subflow::integrate;
pub use tables::{product_marginals, tabulated_reaction};
pub use tree::{ExternalNode, InternalNode, Node, Tree};
