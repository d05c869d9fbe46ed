//! Projector-splitting time step on a tree tensor network.
//!
//! Every internal node runs the sub-flows `Phi(0)`, `Phi(1)` and `Psi` in that
//! order. `Phi(id)` moves the coefficients of the node into child `id`,
//! integrates the child (a K-step for a leaf, a recursive step for an internal
//! node), then integrates the coupling matrix backward in time (S-step) and
//! folds it back into the core tensor. `Psi` integrates the core tensor with
//! both children fixed.

use ndarray::{Array2, Axis};
use tracing::{debug, debug_span, trace};

use crate::error::Result;
use crate::linalg::{gram_schmidt, kron, matricize, tensorize, InnerProduct};
use crate::ode::IntegratorConfig;
use crate::tree::{ExternalNode, InternalNode, Node, Tree};

/// Index of the sibling of child `id`.
pub const COMPLEMENT: [usize; 2] = [1, 0];

/// Advance the whole tree by one time step `tau`.
///
/// The complement coefficients of the root are the scalar `1` for every
/// reaction. On success the tree is again in canonical form. If an error is
/// returned the tree is left in an unspecified state.
///
/// # Errors
/// Orthogonalization failures (`NonFinite`, `RankExceedsDimension`).
pub fn integrate(tree: &mut Tree, tau: f64, config: &IntegratorConfig) -> Result<()> {
    let _span = debug_span!("integrate", tau, method = ?config.method).entered();
    let n_reactions = tree.n_reactions();
    let root = &mut tree.root;
    root.a = vec![Array2::ones((1, 1)); n_reactions];
    root.b = vec![Array2::ones((1, 1)); n_reactions];
    ttn_integrator(root, tau, config)
}

/// One step on the subtree rooted at `node`.
///
/// The complement coefficients `A, B` of `node` must be set.
pub fn ttn_integrator(node: &mut InternalNode, tau: f64, config: &IntegratorConfig) -> Result<()> {
    let _span = debug_span!("node", id = %node.id).entered();
    subflow_phi(node, 0, tau, config)?;
    subflow_phi(node, 1, tau, config)?;
    subflow_psi(node, tau, config);
    Ok(())
}

/// Sub-flow `Phi(id)`: update child `id` and the coupling to it.
pub fn subflow_phi(
    node: &mut InternalNode,
    id: usize,
    tau: f64,
    config: &IntegratorConfig,
) -> Result<()> {
    let dim = node.q.dim();

    // qmat = G R; G is the orthonormal basis of everything except child `id`
    let mut g = matricize(&node.q, id);
    let qr = gram_schmidt(&mut g, InnerProduct::Flat)?;
    log_completion(&node.id, "mode", qr.completed);
    node.child[id].set_s(qr.r.t().to_owned());

    calculate_ab(node, id, &g);

    let child = &mut node.child[id];
    match &mut *child {
        Node::External(leaf) => k_step(leaf, tau, config)?,
        Node::Internal(inner) => {
            let child_dim = inner.q.dim();
            let qm = matricize(&inner.q, 2).dot(&inner.s);
            inner.q = tensorize(&qm, 2, child_dim);

            ttn_integrator(inner, tau, config)?;

            let mut qm = matricize(&inner.q, 2);
            let qr = gram_schmidt(&mut qm, InnerProduct::Flat)?;
            log_completion(&inner.id, "core", qr.completed);
            inner.q = tensorize(&qm, 2, child_dim);
            inner.s = qr.r;
        }
    }

    child.calculate_ef();
    s_step(child, tau, config);

    let qmat = g.dot(&child.s().t());
    node.q = tensorize(&qmat, id, dim);
    Ok(())
}

/// Sub-flow `Psi`: integrate the core tensor with both children fixed.
pub fn subflow_psi(node: &mut InternalNode, tau: f64, config: &IntegratorConfig) {
    calculate_gh(node);
    calculate_q(node, tau, config);
}

/// Complement coefficients of child `id` from the mode-`id` basis `g`.
///
/// `A_child = G^T kron(E_sibling, A) G`, and likewise for `B` with `F`.
pub fn calculate_ab(node: &mut InternalNode, id: usize, g: &Array2<f64>) {
    let [first, second] = &mut node.child;
    let (child, sibling) = if id < COMPLEMENT[id] {
        (first, second)
    } else {
        (second, first)
    };
    sibling.refresh_ef();
    let (e_sib, f_sib) = sibling.ef();
    let contract = |sib: &Array2<f64>, own: &Array2<f64>| g.t().dot(&kron(sib, own)).dot(g);
    let jump: Vec<Array2<f64>> = e_sib
        .iter()
        .zip(&node.a)
        .map(|(sib, own)| contract(sib, own))
        .collect();
    let depletion: Vec<Array2<f64>> = f_sib
        .iter()
        .zip(&node.b)
        .map(|(sib, own)| contract(sib, own))
        .collect();

    for (mu, (c, d)) in jump.iter().zip(&depletion).enumerate() {
        trace!(node = %child.id(), mu, jump = ?c, depletion = ?d, "complement coefficients");
    }
    child.set_complement(jump, depletion);
}

/// Right-hand side of the K-step of `leaf` at `k`.
fn k_rhs(leaf: &ExternalNode, k: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros(k.raw_dim());
    for mu in 0..leaf.propensity.len() {
        let a = leaf.propensity[mu].view().insert_axis(Axis(1));

        let mut jump = k.dot(&leaf.c[mu].t());
        jump *= &a;
        out += &leaf.grid.shift_rows(&jump.view(), &leaf.shift[mu]);

        let mut depletion = k.dot(&leaf.d[mu].t());
        depletion *= &a;
        out -= &depletion;
    }
    out
}

/// Integrate `K = X S` of a leaf forward and split it into `(X, S)` again.
fn k_step(leaf: &mut ExternalNode, tau: f64, config: &IntegratorConfig) -> Result<()> {
    let mut k = leaf.x.dot(&leaf.s);
    config.advance(&mut k, |k| k_rhs(leaf, k), tau);

    let qr = gram_schmidt(&mut k, InnerProduct::ConstWeight(leaf.grid.h_mult()))?;
    log_completion(&leaf.id, "leaf", qr.completed);
    leaf.x = k;
    leaf.s = qr.r;
    Ok(())
}

/// Integrate the coupling matrix of `child` backward in time.
fn s_step(child: &mut Node, tau: f64, config: &IntegratorConfig) {
    let mut s = child.s().clone();
    {
        let (e, f) = child.ef();
        let (a, b) = child.complement();
        config.advance(
            &mut s,
            |s| {
                let mut out = Array2::<f64>::zeros(s.raw_dim());
                for mu in 0..e.len() {
                    out -= &e[mu].dot(s).dot(&a[mu].t());
                    out += &f[mu].dot(s).dot(&b[mu].t());
                }
                out
            },
            tau,
        );
    }
    child.set_s(s);
}

/// Node-level coefficients `G = kron(E0, E1)` and `H = kron(F0, F1)`.
pub fn calculate_gh(node: &mut InternalNode) {
    let (e0, f0) = node.child[0].ef();
    let (e1, f1) = node.child[1].ef();
    let g = e0.iter().zip(e1).map(|(m0, m1)| kron(m0, m1)).collect();
    let h = f0.iter().zip(f1).map(|(m0, m1)| kron(m0, m1)).collect();
    node.g = g;
    node.h = h;
}

/// Integrate `Qm = matricize(q, 2)` with `Qm' = sum_mu G Qm A^T - H Qm B^T`.
pub fn calculate_q(node: &mut InternalNode, tau: f64, config: &IntegratorConfig) {
    let dim = node.q.dim();
    let mut qm = matricize(&node.q, 2);
    {
        let (g, h, a, b) = (&node.g, &node.h, &node.a, &node.b);
        config.advance(
            &mut qm,
            |qm| {
                let mut out = Array2::<f64>::zeros(qm.raw_dim());
                for mu in 0..g.len() {
                    out += &g[mu].dot(qm).dot(&a[mu].t());
                    out -= &h[mu].dot(qm).dot(&b[mu].t());
                }
                out
            },
            tau,
        );
    }
    node.q = tensorize(&qm, 2, dim);
}

fn log_completion(id: &str, basis: &str, completed: usize) {
    if completed > 0 {
        debug!(node = %id, basis, columns = completed, "completed rank-deficient basis");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParms;
    use crate::ode::IntegrationMethod;
    use crate::partition::TreeBuilder;
    use crate::reaction::{Reaction, ReactionSystem};
    use ndarray::Array1;

    fn names(d: usize) -> Vec<String> {
        (0..d).map(|i| format!("S{}", i)).collect()
    }

    fn below(limit: f64) -> impl Fn(f64) -> f64 + Send + Sync + 'static {
        move |x| if x < limit { 1.0 } else { 0.0 }
    }

    /// Reversible conversion `S0 <-> S1` that never leaves an `n x n` grid.
    fn conversion(n: usize, rate: f64) -> ReactionSystem {
        let top = (n - 1) as f64;
        ReactionSystem::new(
            names(2),
            vec![
                Reaction::new("forward", vec![-1, 1])
                    .factor(0, move |x| rate * x)
                    .factor(1, below(top)),
                Reaction::new("backward", vec![1, -1])
                    .factor(1, move |y| 0.5 * rate * y)
                    .factor(0, below(top)),
            ],
        )
        .unwrap()
    }

    fn marginal(values: &[f64]) -> impl Fn(&GridParms) -> Array1<f64> + '_ {
        move |grid| Array1::from(values[..grid.dx()].to_vec())
    }

    #[test]
    fn test_birth_step_matches_euler() {
        let grid = GridParms::new(vec![2, 2], vec![1.0; 2], vec![0.0; 2]).unwrap();
        let reactions = ReactionSystem::new(
            names(2),
            vec![Reaction::new("birth", vec![1, 0]).factor(0, |_| 1.0)],
        )
        .unwrap();
        let mut tree = TreeBuilder::new("(0)(1)", grid.clone(), vec![1])
            .unwrap()
            .build(&reactions, marginal(&[1.0, 0.0]))
            .unwrap();

        let tau = 0.01;
        tree.integrate(tau, &IntegratorConfig::default()).unwrap();

        let p = tree.full_distribution();
        let at = |x0: f64, x1: f64| p[grid.state_to_index(&[x0, x1]).unwrap()];
        assert!((at(0.0, 0.0) - (1.0 - tau)).abs() < 10.0 * tau * tau);
        assert!((at(1.0, 0.0) - tau).abs() < 10.0 * tau * tau);
        assert!(at(0.0, 1.0).abs() < 1e-14);
        assert!(at(1.0, 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_full_rank_conserves_mass() {
        let grid = GridParms::new(vec![3, 3], vec![1.0; 2], vec![0.0; 2]).unwrap();
        let reactions = conversion(3, 1.0);
        let mut tree = TreeBuilder::new("(0)(1)", grid, vec![3])
            .unwrap()
            .build(&reactions, marginal(&[0.2, 0.5, 0.3]))
            .unwrap();
        assert!((tree.mass() - 1.0).abs() < 1e-12);

        for method in [IntegrationMethod::ExplicitEuler, IntegrationMethod::Rk4] {
            let config = IntegratorConfig::new(method, 2);
            for _ in 0..5 {
                tree.integrate(0.05, &config).unwrap();
            }
            assert!((tree.mass() - 1.0).abs() < 1e-10, "mass {}", tree.mass());
        }
        let p = tree.full_distribution();
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_orthogonality_and_ranks_are_kept() {
        let grid = GridParms::new(vec![3, 3, 4], vec![1.0; 3], vec![0.0; 3]).unwrap();
        let reactions = ReactionSystem::new(
            names(3),
            vec![
                Reaction::new("make0", vec![1, 0, 0]).factor(2, |z| 0.5 + 0.1 * z).factor(0, below(2.0)),
                Reaction::new("decay0", vec![-1, 0, 0]).factor(0, |x| 0.3 * x),
                Reaction::new("convert", vec![0, 1, -1])
                    .factor(2, |z| 0.2 * z)
                    .factor(1, below(2.0)),
                Reaction::new("make2", vec![0, 0, 1]).factor(0, |x| 0.4 * (1.0 + x)).factor(2, below(3.0)),
            ],
        )
        .unwrap();
        let mut tree = TreeBuilder::new("((0)(1))(2)", grid, vec![2, 2])
            .unwrap()
            .build(&reactions, marginal(&[0.4, 0.3, 0.2, 0.1]))
            .unwrap();

        let config = IntegratorConfig::new(IntegrationMethod::Rk2, 1);
        for _ in 0..3 {
            tree.integrate(0.02, &config).unwrap();
            assert!(tree.orthogonality_defect() < 1e-10);
            tree.validate().unwrap();
        }

        assert_eq!(tree.root.rank_in(), 1);
        assert_eq!(tree.root.rank_out(), [2, 2]);
        let Node::Internal(inner) = &tree.root.child[0] else {
            panic!("child 0 must be internal");
        };
        assert_eq!(inner.rank_in(), 2);
        assert_eq!(inner.rank_out(), [2, 2]);
        assert_eq!(inner.child[0].rank_in(), 2);
    }

    #[test]
    fn test_zero_step_is_identity() {
        let grid = GridParms::new(vec![3, 3], vec![1.0; 2], vec![0.0; 2]).unwrap();
        let mut tree = TreeBuilder::new("(0)(1)", grid, vec![2])
            .unwrap()
            .build(&conversion(3, 1.0), marginal(&[0.2, 0.5, 0.3]))
            .unwrap();
        let config = IntegratorConfig::default();
        tree.integrate(0.05, &config).unwrap();

        let before = tree.full_distribution();
        tree.integrate(0.0, &config).unwrap();
        let after = tree.full_distribution();
        for (a, b) in after.iter().zip(before.iter()) {
            assert!((a - b).abs() <= 1e-12);
        }
    }

    #[test]
    fn test_splitting_order_matters() {
        let grid = GridParms::new(vec![4, 4], vec![1.0; 2], vec![0.0; 2]).unwrap();
        let mut system = conversion(4, 0.3);
        system
            .reactions
            .push(Reaction::new("birth", vec![1, 0]).factor(0, below(3.0)).factor(1, |y| 0.2 * (1.0 + y)));

        let initial = |grid: &GridParms| match grid.species[0] {
            0 => Array1::from(vec![0.1, 0.4, 0.3, 0.2]),
            _ => Array1::from(vec![0.6, 0.2, 0.1, 0.1]),
        };
        let build = |partition: &str| {
            TreeBuilder::new(partition, grid.clone(), vec![1])
                .unwrap()
                .build(&system, initial)
                .unwrap()
        };
        let split_diff = |tau: f64| {
            let mut forward = build("(0)(1)");
            let mut mirrored = build("(1)(0)");
            let config = IntegratorConfig::default();
            forward.integrate(tau, &config).unwrap();
            mirrored.integrate(tau, &config).unwrap();

            let p = forward.full_distribution();
            let q = mirrored.full_distribution();
            let mut max_diff: f64 = 0.0;
            for alpha in 0..grid.dx() {
                let state = grid.index_to_state(alpha);
                let mirrored_state = [state[1], state[0]];
                let i = forward.root.grid.state_to_index(&state).unwrap();
                let j = mirrored.root.grid.state_to_index(&mirrored_state).unwrap();
                max_diff = max_diff.max((p[i] - q[j]).abs());
            }
            max_diff
        };

        // Both orders agree to first order, so their difference is O(tau^2)
        let tau = 0.01;
        let coarse = split_diff(tau);
        let fine = split_diff(0.5 * tau);
        assert!(coarse > 1e-12, "orders agree to {}", coarse);
        assert!(coarse < 0.1 * tau * tau, "orders differ by {}", coarse);
        let ratio = coarse / fine;
        assert!((3.5..4.5).contains(&ratio), "ratio {}", ratio);
    }

    /// One explicit Euler step of the CME on the full grid of `tree`.
    fn euler_reference(tree: &Tree, reactions: &ReactionSystem, tau: f64) -> Array1<f64> {
        let grid = &tree.root.grid;
        let p = tree.full_distribution();
        let mut out = p.clone();
        let global = |local: &[f64]| {
            let mut state = vec![0.0; grid.d()];
            for (k, &s) in grid.species.iter().enumerate() {
                state[s] = local[k];
            }
            state
        };
        for alpha in 0..grid.dx() {
            let state = global(&grid.index_to_state(alpha));
            for reaction in &reactions.reactions {
                out[alpha] -= tau * reaction.propensity(&state) * p[alpha];
                let source: Vec<f64> = state
                    .iter()
                    .zip(reaction.nu())
                    .map(|(x, &n)| x - n as f64)
                    .collect();
                let local: Vec<f64> = grid.species.iter().map(|&s| source[s]).collect();
                if let Some(beta) = grid.state_to_index(&local) {
                    out[alpha] += tau * reaction.propensity(&source) * p[beta];
                }
            }
        }
        out
    }

    /// Coupled reactions on a `2^4` grid that never leave it.
    fn four_species() -> ReactionSystem {
        ReactionSystem::new(
            names(4),
            vec![
                Reaction::new("convert01", vec![-1, 1, 0, 0])
                    .factor(0, |x| x)
                    .factor(1, below(1.0)),
                Reaction::new("convert12", vec![0, -1, 1, 0])
                    .factor(1, |x| 0.8 * x)
                    .factor(2, below(1.0)),
                Reaction::new("convert20", vec![1, 0, -1, 0])
                    .factor(2, |x| 0.6 * x)
                    .factor(0, below(1.0)),
                Reaction::new("make3", vec![0, 0, 0, 1])
                    .factor(3, below(1.0))
                    .factor(0, |x| 0.5 * (1.0 + x)),
                Reaction::new("decay3", vec![0, 0, 0, -1]).factor(3, |x| 0.7 * x),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_nested_full_rank_step_matches_cme() {
        let grid = GridParms::new(vec![2; 4], vec![1.0; 4], vec![0.0; 4]).unwrap();
        let reactions = four_species();
        let initial = |grid: &GridParms| {
            let shift = 0.1 * grid.species[0] as f64;
            Array1::from(vec![0.3 + shift, 0.7 - shift])
        };
        let tree = TreeBuilder::new("((0)(1))((2)(3))", grid, vec![4, 2])
            .unwrap()
            .build(&reactions, initial)
            .unwrap();
        let config = IntegratorConfig::default();

        let step_error = |tau: f64| {
            let mut stepped = tree.clone();
            let expected = euler_reference(&tree, &reactions, tau);
            stepped.integrate(tau, &config).unwrap();
            assert!((stepped.mass() - 1.0).abs() < 1e-12, "mass {}", stepped.mass());
            assert!(stepped.orthogonality_defect() < 1e-10);
            stepped
                .full_distribution()
                .iter()
                .zip(expected.iter())
                .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs()))
        };

        let tau = 0.01;
        let coarse = step_error(tau);
        let fine = step_error(0.5 * tau);
        assert!(coarse < 20.0 * tau * tau, "error {}", coarse);
        let ratio = coarse / fine;
        assert!((3.5..4.5).contains(&ratio), "ratio {}", ratio);
    }

    #[test]
    fn test_nested_full_rank_conserves_mass() {
        let grid = GridParms::new(vec![2; 4], vec![1.0; 4], vec![0.0; 4]).unwrap();
        let mut tree = TreeBuilder::new("((0)(1))((2)(3))", grid, vec![4, 2])
            .unwrap()
            .build(&four_species(), marginal(&[0.4, 0.6]))
            .unwrap();

        let config = IntegratorConfig::new(IntegrationMethod::Rk2, 2);
        for _ in 0..10 {
            tree.integrate(0.05, &config).unwrap();
        }
        assert!((tree.mass() - 1.0).abs() < 1e-10, "mass {}", tree.mass());
        assert!(tree.full_distribution().iter().all(|v| v.is_finite()));
    }
}
