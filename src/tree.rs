//! Tree tensor network over a binary partition of the species.
//!
//! Leaves hold a basis matrix `X` for one species subset. Internal nodes hold
//! a core tensor `Q` that combines the bases of their two children into the
//! basis of the union. The root has a single outgoing basis function, so its
//! core tensor holds the coefficients of the whole distribution.

use ndarray::{Array1, Array2, Array3, Axis};
use tracing::debug;

use crate::coefficients::{assemble_coefficients, partition_weight};
use crate::error::{Result, TtnError};
use crate::grid::GridParms;
use crate::linalg::{gram_schmidt, kron, matricize, tensorize, InnerProduct};
use crate::ode::IntegratorConfig;
use crate::reaction::ReactionSystem;
use crate::subflow;

/// Leaf of the tree: low-rank basis for one species partition.
#[derive(Clone, Debug)]
pub struct ExternalNode {
    pub id: String,
    pub grid: GridParms,
    /// Basis matrix of shape `dx x rank_in`.
    pub x: Array2<f64>,
    /// Coupling to the parent, `rank_in x rank_in`.
    pub s: Array2<f64>,
    /// Local propensity of every reaction on this partition.
    pub(crate) propensity: Vec<Array1<f64>>,
    /// Local stoichiometric change of every reaction.
    pub(crate) shift: Vec<Vec<i64>>,
    /// Complement coefficients (jump, depletion), written by the parent.
    pub(crate) c: Vec<Array2<f64>>,
    pub(crate) d: Vec<Array2<f64>>,
    /// Own-basis coefficients (jump, depletion).
    pub(crate) e: Vec<Array2<f64>>,
    pub(crate) f: Vec<Array2<f64>>,
}

#[derive(Clone, Debug)]
pub struct InternalNode {
    pub id: String,
    pub grid: GridParms,
    /// Core tensor of shape `rank_out[0] x rank_out[1] x rank_in`.
    pub q: Array3<f64>,
    /// Coupling to the parent, `rank_in x rank_in`.
    pub s: Array2<f64>,
    pub child: [Node; 2],
    /// Complement coefficients (jump, depletion), written by the parent.
    pub(crate) a: Vec<Array2<f64>>,
    pub(crate) b: Vec<Array2<f64>>,
    /// Own-basis coefficients (jump, depletion).
    pub(crate) e: Vec<Array2<f64>>,
    pub(crate) f: Vec<Array2<f64>>,
    /// Node-level coefficients of the `Psi` flow.
    pub(crate) g: Vec<Array2<f64>>,
    pub(crate) h: Vec<Array2<f64>>,
}

#[derive(Clone, Debug)]
pub enum Node {
    Internal(Box<InternalNode>),
    External(Box<ExternalNode>),
}

impl ExternalNode {
    pub fn new(id: &str, grid: GridParms, x: Array2<f64>) -> Self {
        let rank = x.ncols();
        Self {
            id: id.to_string(),
            grid,
            x,
            s: Array2::eye(rank),
            propensity: Vec::new(),
            shift: Vec::new(),
            c: Vec::new(),
            d: Vec::new(),
            e: Vec::new(),
            f: Vec::new(),
        }
    }

    pub fn rank_in(&self) -> usize {
        self.x.ncols()
    }
}

impl InternalNode {
    /// Internal node over two children; its grid is the concatenation of theirs.
    pub fn new(id: &str, q: Array3<f64>, child: [Node; 2]) -> Self {
        let grid = child[0].grid().concat(child[1].grid());
        let rank = q.dim().2;
        Self {
            id: id.to_string(),
            grid,
            q,
            s: Array2::eye(rank),
            child,
            a: Vec::new(),
            b: Vec::new(),
            e: Vec::new(),
            f: Vec::new(),
            g: Vec::new(),
            h: Vec::new(),
        }
    }

    pub fn rank_in(&self) -> usize {
        self.q.dim().2
    }

    pub fn rank_out(&self) -> [usize; 2] {
        let (r0, r1, _) = self.q.dim();
        [r0, r1]
    }

    /// Basis of this subtree, `dx x rank_in`, rows in the order of `self.grid`.
    pub fn basis(&self) -> Array2<f64> {
        let x0 = self.child[0].basis();
        let x1 = self.child[1].basis();
        let (dx0, dx1) = (x0.nrows(), x1.nrows());
        let mut out = Array2::<f64>::zeros((dx0 * dx1, self.rank_in()));
        for i in 0..self.rank_in() {
            let core = self.q.index_axis(Axis(2), i);
            let block = x0.dot(&core).dot(&x1.t());
            // Combinatorial index alpha0 + dx0 * alpha1: first child fastest
            let column: Vec<f64> = block.t().iter().copied().collect();
            out.column_mut(i).assign(&Array1::from(column));
        }
        out
    }
}

impl Node {
    pub fn is_external(&self) -> bool {
        matches!(self, Node::External(_))
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Internal(node) => &node.id,
            Node::External(node) => &node.id,
        }
    }

    pub fn grid(&self) -> &GridParms {
        match self {
            Node::Internal(node) => &node.grid,
            Node::External(node) => &node.grid,
        }
    }

    pub fn rank_in(&self) -> usize {
        match self {
            Node::Internal(node) => node.rank_in(),
            Node::External(node) => node.rank_in(),
        }
    }

    pub fn s(&self) -> &Array2<f64> {
        match self {
            Node::Internal(node) => &node.s,
            Node::External(node) => &node.s,
        }
    }

    pub fn set_s(&mut self, s: Array2<f64>) {
        match self {
            Node::Internal(node) => node.s = s,
            Node::External(node) => node.s = s,
        }
    }

    pub fn basis(&self) -> Array2<f64> {
        match self {
            Node::Internal(node) => node.basis(),
            Node::External(node) => node.x.clone(),
        }
    }

    /// Own-basis coefficients `(E, F)`.
    pub(crate) fn ef(&self) -> (&[Array2<f64>], &[Array2<f64>]) {
        match self {
            Node::Internal(node) => (&node.e, &node.f),
            Node::External(node) => (&node.e, &node.f),
        }
    }

    /// Complement coefficients: `(A, B)` of an internal node, `(C, D)` of a leaf.
    pub(crate) fn complement(&self) -> (&[Array2<f64>], &[Array2<f64>]) {
        match self {
            Node::Internal(node) => (&node.a, &node.b),
            Node::External(node) => (&node.c, &node.d),
        }
    }

    pub(crate) fn set_complement(&mut self, jump: Vec<Array2<f64>>, depletion: Vec<Array2<f64>>) {
        match self {
            Node::Internal(node) => {
                node.a = jump;
                node.b = depletion;
            }
            Node::External(node) => {
                node.c = jump;
                node.d = depletion;
            }
        }
    }

    /// Recompute the own-basis coefficients `(E, F)` from the current basis.
    ///
    /// Leaves assemble them from their local propensities. Internal nodes
    /// contract the cached coefficients of their children through `Q`:
    /// `E = Qm^T kron(E0, E1) Qm` with `Qm = matricize(q, 2)`.
    pub(crate) fn calculate_ef(&mut self) {
        match self {
            Node::External(leaf) => {
                let h_mult = leaf.grid.h_mult();
                let (e, f): (Vec<_>, Vec<_>) = leaf
                    .propensity
                    .iter()
                    .zip(&leaf.shift)
                    .map(|(a, nu)| {
                        let weight = a * h_mult;
                        assemble_coefficients(&leaf.grid, &weight, &leaf.x, nu)
                    })
                    .unzip();
                leaf.e = e;
                leaf.f = f;
            }
            Node::Internal(node) => {
                let qm = matricize(&node.q, 2);
                let (e0, f0) = node.child[0].ef();
                let (e1, f1) = node.child[1].ef();
                let contract = |m0: &Array2<f64>, m1: &Array2<f64>| qm.t().dot(&kron(m0, m1)).dot(&qm);
                let e = e0.iter().zip(e1).map(|(m0, m1)| contract(m0, m1)).collect();
                let f = f0.iter().zip(f1).map(|(m0, m1)| contract(m0, m1)).collect();
                node.e = e;
                node.f = f;
            }
        }
    }

    /// [`Node::calculate_ef`] for the whole subtree, children first.
    pub(crate) fn refresh_ef(&mut self) {
        if let Node::Internal(node) = self {
            node.child[0].refresh_ef();
            node.child[1].refresh_ef();
        }
        self.calculate_ef();
    }

    /// Visit every node below and including `self`, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        visit(self);
        if let Node::Internal(node) = self {
            node.child[0].walk(visit);
            node.child[1].walk(visit);
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Node::External(leaf) => {
                if leaf.x.nrows() != leaf.grid.dx() {
                    return Err(TtnError::DimensionMismatch {
                        node: leaf.id.clone(),
                        expected: leaf.grid.dx(),
                        found: leaf.x.nrows(),
                    });
                }
                check_square(&leaf.id, &leaf.s, leaf.rank_in())
            }
            Node::Internal(node) => node.validate(),
        }
    }

    /// Attach the local reaction data to every leaf.
    fn attach_reactions(&mut self, reactions: &ReactionSystem) -> Result<()> {
        match self {
            Node::External(leaf) => {
                let mut propensity = Vec::with_capacity(reactions.mu());
                let mut shift = Vec::with_capacity(reactions.mu());
                let h_mult = leaf.grid.h_mult();
                for reaction in &reactions.reactions {
                    let weight = partition_weight(&leaf.grid, reaction)
                        .ok_or_else(|| TtnError::NonSeparablePropensity(reaction.name.clone()))?;
                    propensity.push(weight / h_mult);
                    shift.push(leaf.grid.local_shift(reaction.nu()));
                }
                leaf.propensity = propensity;
                leaf.shift = shift;
                Ok(())
            }
            Node::Internal(node) => {
                node.child[0].attach_reactions(reactions)?;
                node.child[1].attach_reactions(reactions)
            }
        }
    }

    /// Bring the subtree into canonical form.
    ///
    /// Afterwards the basis of this node is orthonormal and the returned `R`
    /// satisfies `old_basis = new_basis * R`.
    fn orthonormalize(&mut self) -> Result<Array2<f64>> {
        match self {
            Node::External(leaf) => {
                let qr = gram_schmidt(&mut leaf.x, InnerProduct::ConstWeight(leaf.grid.h_mult()))?;
                if qr.completed > 0 {
                    debug!(node = %leaf.id, columns = qr.completed, "completed leaf basis");
                }
                leaf.s = Array2::eye(leaf.rank_in());
                Ok(qr.r)
            }
            Node::Internal(node) => {
                node.absorb_children()?;
                let dim = node.q.dim();
                let mut qmat = matricize(&node.q, 2);
                let qr = gram_schmidt(&mut qmat, InnerProduct::Flat)?;
                if qr.completed > 0 {
                    debug!(node = %node.id, columns = qr.completed, "completed core basis");
                }
                node.q = tensorize(&qmat, 2, dim);
                node.s = Array2::eye(node.rank_in());
                Ok(qr.r)
            }
        }
    }
}

impl InternalNode {
    fn validate(&self) -> Result<()> {
        let rank_out = self.rank_out();
        for (slot, child) in self.child.iter().enumerate() {
            if child.rank_in() != rank_out[slot] {
                return Err(TtnError::RankMismatch {
                    node: child.id().to_string(),
                    expected: rank_out[slot],
                    found: child.rank_in(),
                });
            }
            child.validate()?;
        }
        let expected = self.child[0].grid().concat(self.child[1].grid());
        if self.grid != expected {
            return Err(TtnError::SpeciesMismatch(format!(
                "grid of node {} is not the union of its children",
                self.id
            )));
        }
        check_square(&self.id, &self.s, self.rank_in())
    }

    /// Orthonormalize both children and fold their `R` factors into `Q`.
    fn absorb_children(&mut self) -> Result<()> {
        for id in 0..2 {
            let r = self.child[id].orthonormalize()?;
            let dim = self.q.dim();
            let qmat = matricize(&self.q, id).dot(&r.t());
            self.q = tensorize(&qmat, id, dim);
        }
        Ok(())
    }
}

fn check_square(id: &str, s: &Array2<f64>, rank: usize) -> Result<()> {
    if s.nrows() != rank || s.ncols() != rank {
        return Err(TtnError::RankMismatch {
            node: id.to_string(),
            expected: rank,
            found: if s.nrows() != rank { s.nrows() } else { s.ncols() },
        });
    }
    Ok(())
}

/// A validated tree tensor network attached to a reaction system.
#[derive(Clone, Debug)]
pub struct Tree {
    pub root: InternalNode,
    n_reactions: usize,
}

impl Tree {
    /// Validate `root`, attach the reaction data and orthonormalize.
    ///
    /// # Errors
    /// Rank or dimension mismatches between parents and children, leaves that
    /// do not partition the species of `reactions`, non-separable propensities
    /// and orthogonalization failures.
    pub fn new(mut root: InternalNode, reactions: &ReactionSystem) -> Result<Self> {
        if root.rank_in() != 1 {
            return Err(TtnError::RankMismatch {
                node: root.id.clone(),
                expected: 1,
                found: root.rank_in(),
            });
        }
        let mut species = root.grid.species.clone();
        species.sort_unstable();
        if species != (0..reactions.d()).collect::<Vec<_>>() {
            return Err(TtnError::SpeciesMismatch(format!(
                "leaves cover species {:?}, reaction system has {}",
                root.grid.species,
                reactions.d()
            )));
        }

        root.validate()?;
        for child in root.child.iter_mut() {
            child.attach_reactions(reactions)?;
        }

        let mut tree = Tree {
            root,
            n_reactions: reactions.mu(),
        };
        tree.orthonormalize()?;
        Ok(tree)
    }

    pub fn n_reactions(&self) -> usize {
        self.n_reactions
    }

    /// Advance the distribution by `tau`; see [`subflow::integrate`].
    pub fn integrate(&mut self, tau: f64, config: &IntegratorConfig) -> Result<()> {
        subflow::integrate(self, tau, config)
    }

    /// Check rank and dimension consistency of every parent/child pair.
    pub fn validate(&self) -> Result<()> {
        self.root.validate()
    }

    /// Canonical form: orthonormal leaves and non-root cores, coefficients in the root.
    pub fn orthonormalize(&mut self) -> Result<()> {
        self.root.absorb_children()?;
        self.root.s = Array2::eye(1);
        Ok(())
    }

    /// Full distribution over the root grid (species in `species_order`).
    pub fn full_distribution(&self) -> Array1<f64> {
        self.root.basis().column(0).to_owned()
    }

    /// Global species id of every axis of the full distribution.
    pub fn species_order(&self) -> &[usize] {
        &self.root.grid.species
    }

    /// Total probability `sum_x P(x) * h_mult`.
    pub fn mass(&self) -> f64 {
        self.full_distribution().sum() * self.root.grid.h_mult()
    }

    /// Largest deviation from orthonormality over all non-root bases.
    ///
    /// Leaves are measured under their weighted inner product, internal nodes
    /// through the flat inner product of their mode-2 matricization.
    pub fn orthogonality_defect(&self) -> f64 {
        let mut defect: f64 = 0.0;
        for child in &self.root.child {
            child.walk(&mut |node| {
                let (gram, rank) = match node {
                    Node::External(leaf) => {
                        (leaf.x.t().dot(&leaf.x) * leaf.grid.h_mult(), leaf.rank_in())
                    }
                    Node::Internal(inner) => {
                        let qmat = matricize(&inner.q, 2);
                        (qmat.t().dot(&qmat), inner.rank_in())
                    }
                };
                let deviation = (gram - Array2::<f64>::eye(rank))
                    .iter()
                    .fold(0.0f64, |acc, v| acc.max(v.abs()));
                defect = defect.max(deviation);
            });
        }
        defect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::Reaction;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn system(d: usize) -> ReactionSystem {
        let names = (0..d).map(|i| format!("S{}", i)).collect();
        let mut nu = vec![0; d];
        nu[0] = 1;
        ReactionSystem::new(names, vec![Reaction::new("birth", nu).factor(0, |_| 1.0)]).unwrap()
    }

    fn leaf(id: &str, grid: &GridParms, species: usize, x: Array2<f64>) -> Node {
        Node::External(Box::new(ExternalNode::new(
            id,
            grid.select_species(&[species]).unwrap(),
            x,
        )))
    }

    fn two_leaf_root(q: Array3<f64>) -> InternalNode {
        let grid = GridParms::new(vec![2, 3], vec![1.0, 1.0], vec![0.0, 0.0]).unwrap();
        let x0 = array![[1.0, 1.0], [1.0, -1.0]];
        let x1 = array![[1.0, 0.0], [2.0, 1.0], [0.0, 1.0]];
        InternalNode::new(
            "",
            q,
            [leaf("0", &grid, 0, x0), leaf("1", &grid, 1, x1)],
        )
    }

    #[test]
    fn test_tree_creation_orthonormalizes() {
        let q = Array3::from_shape_vec((2, 2, 1), vec![1.0, 0.5, -0.25, 2.0]).unwrap();
        let root = two_leaf_root(q);
        let before = root.basis().column(0).to_owned();

        let tree = Tree::new(root, &system(2)).unwrap();

        assert!(tree.orthogonality_defect() < 1e-12);
        let after = tree.full_distribution();
        for (a, b) in after.iter().zip(before.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_eq!(tree.species_order(), &[0, 1]);
    }

    #[test]
    fn test_full_distribution_ordering() {
        // rank-1 product: P(x0, x1) = p0(x0) * p1(x1)
        let grid = GridParms::new(vec![2, 3], vec![1.0, 1.0], vec![0.0, 0.0]).unwrap();
        let root = InternalNode::new(
            "",
            Array3::ones((1, 1, 1)),
            [
                leaf("0", &grid, 0, array![[1.0], [2.0]]),
                leaf("1", &grid, 1, array![[3.0], [5.0], [7.0]]),
            ],
        );
        let p = root.basis().column(0).to_owned();
        for alpha in 0..grid.dx() {
            let v = grid.comb_to_vec(alpha);
            let expected = [1.0, 2.0][v[0]] * [3.0, 5.0, 7.0][v[1]];
            assert_eq!(p[alpha], expected);
        }
    }

    #[test]
    fn test_rank_mismatch_is_rejected() {
        // Q expects rank 3 towards child 0, leaf has rank 2
        let root = two_leaf_root(Array3::zeros((3, 2, 1)));
        assert!(matches!(
            Tree::new(root, &system(2)),
            Err(TtnError::RankMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn test_root_must_have_rank_one() {
        let root = two_leaf_root(Array3::zeros((2, 2, 2)));
        assert!(Tree::new(root, &system(2)).is_err());
    }

    #[test]
    fn test_non_separable_reaction_is_rejected() {
        let root = two_leaf_root(Array3::ones((2, 2, 1)));
        let reactions = ReactionSystem::new(
            vec!["A".into(), "B".into()],
            vec![Reaction::general("g", vec![1, 0], vec![0, 1], |x| x[0] * x[1])],
        )
        .unwrap();
        assert!(matches!(
            Tree::new(root, &reactions),
            Err(TtnError::NonSeparablePropensity(_))
        ));
    }

    #[test]
    fn test_leaf_propensity_on_binned_grid() {
        let grid = GridParms::new(vec![2, 3], vec![2.0, 1.0], vec![0.0, 0.0]).unwrap();
        let root = InternalNode::new(
            "",
            Array3::ones((1, 1, 1)),
            [
                leaf("0", &grid, 0, array![[1.0], [1.0]]),
                leaf("1", &grid, 1, array![[1.0], [1.0], [1.0]]),
            ],
        );
        let reactions = ReactionSystem::new(
            vec!["A".into(), "B".into()],
            vec![Reaction::new("swap", vec![2, -1])
                .factor(0, |x| x + 1.0)
                .factor(1, |y| 2.0 * y)],
        )
        .unwrap();

        let tree = Tree::new(root, &reactions).unwrap();

        // Propensities are stored without the quadrature weight
        let Node::External(first) = &tree.root.child[0] else {
            panic!("child 0 must be a leaf");
        };
        let Node::External(second) = &tree.root.child[1] else {
            panic!("child 1 must be a leaf");
        };
        assert_eq!(first.propensity[0].to_vec(), vec![1.0, 3.0]);
        assert_eq!(second.propensity[0].to_vec(), vec![0.0, 2.0, 4.0]);
        assert_eq!(first.shift[0], vec![2]);
        assert_eq!(second.shift[0], vec![-1]);
    }

    #[test]
    fn test_species_must_match_system() {
        let root = two_leaf_root(Array3::ones((2, 2, 1)));
        assert!(matches!(
            Tree::new(root, &system(3)),
            Err(TtnError::SpeciesMismatch(_))
        ));
    }
}
