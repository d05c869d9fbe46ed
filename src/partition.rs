//! Construction of a tree tensor network from a partition string.
//!
//! A partition string lists the two subtrees of every internal node as
//! parenthesised groups. A group holding species ids is a leaf, a group
//! holding two groups is an internal node:
//!
//! ```text
//! (0 1 2)((3 4)(5))
//! ```
//!
//! has the leaves `{0, 1, 2}`, `{3, 4}` and `{5}`. The rank of every edge
//! leaving an internal node at depth `l` is `r_out[l]`.

use std::iter::Peekable;
use std::str::{Chars, FromStr};

use ndarray::{Array1, Array2, Array3};

use crate::error::{Result, TtnError};
use crate::grid::GridParms;
use crate::reaction::ReactionSystem;
use crate::tree::{ExternalNode, InternalNode, Node, Tree};

/// Shape of a binary species partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionTree {
    Leaf(Vec<usize>),
    Split(Box<PartitionTree>, Box<PartitionTree>),
}

impl PartitionTree {
    /// Species ids in depth-first order.
    pub fn species(&self) -> Vec<usize> {
        match self {
            PartitionTree::Leaf(species) => species.clone(),
            PartitionTree::Split(left, right) => {
                let mut out = left.species();
                out.extend(right.species());
                out
            }
        }
    }

    /// Number of depth levels that contain internal nodes.
    pub fn levels(&self) -> usize {
        match self {
            PartitionTree::Leaf(_) => 0,
            PartitionTree::Split(left, right) => 1 + left.levels().max(right.levels()),
        }
    }
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    input: &'a str,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            input,
        }
    }

    fn error(&self, reason: &str) -> TtnError {
        TtnError::InvalidPartition(format!("{} in \"{}\"", reason, self.input))
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().map_or(false, |c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn consume(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(&format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(&format!("expected '{}', found end of input", expected))),
        }
    }

    /// Two consecutive groups.
    fn pair(&mut self) -> Result<PartitionTree> {
        let left = self.group()?;
        let right = self.group()?;
        Ok(PartitionTree::Split(Box::new(left), Box::new(right)))
    }

    fn group(&mut self) -> Result<PartitionTree> {
        self.consume('(')?;
        self.skip_whitespace();
        let node = if self.chars.peek() == Some(&'(') {
            self.pair()?
        } else {
            PartitionTree::Leaf(self.species_list()?)
        };
        self.consume(')')?;
        Ok(node)
    }

    fn species_list(&mut self) -> Result<Vec<usize>> {
        let mut species = Vec::new();
        loop {
            self.skip_whitespace();
            let mut digits = String::new();
            while let Some(c) = self.chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(c);
                self.chars.next();
            }
            if digits.is_empty() {
                break;
            }
            let id = digits
                .parse::<usize>()
                .map_err(|_| self.error(&format!("invalid species id {}", digits)))?;
            species.push(id);
        }
        if species.is_empty() {
            return Err(self.error("empty leaf"));
        }
        Ok(species)
    }
}

impl FromStr for PartitionTree {
    type Err = TtnError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parser = Parser::new(s);
        let tree = parser.pair()?;
        parser.skip_whitespace();
        if let Some(c) = parser.chars.next() {
            return Err(parser.error(&format!("unexpected '{}' after the root", c)));
        }
        Ok(tree)
    }
}

/// Validated partition, grid and ranks, ready to be turned into a [`Tree`].
#[derive(Clone, Debug)]
pub struct TreeBuilder {
    partition: PartitionTree,
    grid: GridParms,
    r_out: Vec<usize>,
}

impl TreeBuilder {
    /// Parse `partition_str` and check it against `grid` and `r_out`.
    ///
    /// # Arguments
    /// * `partition_str` - Partition such as `"(0 1)((2)(3))"`
    /// * `grid` - Grid over all species, indexed by species id
    /// * `r_out` - Rank of the edges leaving each internal depth level
    ///
    /// # Errors
    /// `InvalidPartition` for malformed strings and for species that are
    /// missing, duplicated or unknown to the grid, `RankLevels` if `r_out`
    /// does not have one entry per level, `ZeroRank` if an entry is zero.
    pub fn new(partition_str: &str, grid: GridParms, r_out: Vec<usize>) -> Result<Self> {
        let partition: PartitionTree = partition_str.parse()?;

        let mut species = partition.species();
        species.sort_unstable();
        let mut expected = grid.species.clone();
        expected.sort_unstable();
        if species != expected {
            return Err(TtnError::InvalidPartition(format!(
                "\"{}\" must list every species of the grid {:?} exactly once",
                partition_str, grid.species
            )));
        }

        let levels = partition.levels();
        if r_out.len() != levels {
            return Err(TtnError::RankLevels {
                expected: levels,
                found: r_out.len(),
            });
        }
        if let Some(level) = r_out.iter().position(|&r| r == 0) {
            return Err(TtnError::ZeroRank(level));
        }

        Ok(Self {
            partition,
            grid,
            r_out,
        })
    }

    pub fn partition(&self) -> &PartitionTree {
        &self.partition
    }

    /// Build the tree with the product initial condition `initial`.
    ///
    /// `initial` maps the grid of each leaf to its marginal distribution,
    /// which becomes the first basis column of the leaf. All other basis
    /// vectors are completed during orthonormalization, so the starting
    /// distribution is the product of the leaf marginals.
    pub fn build<F>(&self, reactions: &ReactionSystem, initial: F) -> Result<Tree>
    where
        F: Fn(&GridParms) -> Array1<f64>,
    {
        let (left, right) = match &self.partition {
            PartitionTree::Split(left, right) => (left, right),
            PartitionTree::Leaf(_) => {
                return Err(TtnError::InvalidPartition("root must be split".to_string()))
            }
        };
        let child = [
            self.node(left, "0", 0, &initial)?,
            self.node(right, "1", 0, &initial)?,
        ];
        let root = InternalNode::new("", seed_core(self.r_out[0], 1), child);
        Tree::new(root, reactions)
    }

    /// Node for `part`, a child of an internal node at `depth`.
    fn node<F>(&self, part: &PartitionTree, id: &str, depth: usize, initial: &F) -> Result<Node>
    where
        F: Fn(&GridParms) -> Array1<f64>,
    {
        let rank_in = self.r_out[depth];
        match part {
            PartitionTree::Leaf(species) => {
                let grid = self.grid.select_species(species)?;
                let p0 = initial(&grid);
                if p0.len() != grid.dx() {
                    return Err(TtnError::DimensionMismatch {
                        node: id.to_string(),
                        expected: grid.dx(),
                        found: p0.len(),
                    });
                }
                let mut x = Array2::<f64>::zeros((grid.dx(), rank_in));
                x.column_mut(0).assign(&p0);
                Ok(Node::External(Box::new(ExternalNode::new(id, grid, x))))
            }
            PartitionTree::Split(left, right) => {
                let child = [
                    self.node(left, &format!("{}0", id), depth + 1, initial)?,
                    self.node(right, &format!("{}1", id), depth + 1, initial)?,
                ];
                let q = seed_core(self.r_out[depth + 1], rank_in);
                Ok(Node::Internal(Box::new(InternalNode::new(id, q, child))))
            }
        }
    }
}

/// Core tensor that couples the first basis vectors of both children.
fn seed_core(rank_out: usize, rank_in: usize) -> Array3<f64> {
    let mut q = Array3::<f64>::zeros((rank_out, rank_out, rank_in));
    q[[0, 0, 0]] = 1.0;
    q
}
