//! Discretized state space of one species partition.
//!
//! A grid stores, per species, the number of grid points `n`, the bin width
//! `binsize` and the lower population limit `liml`. Population multi-indices
//! are encoded into a single combinatorial index with the first species
//! varying fastest.

use ndarray::{Array2, ArrayView2};

use crate::error::{Result, TtnError};

#[derive(Clone, Debug, PartialEq)]
pub struct GridParms {
    /// Number of grid points per species.
    pub n: Vec<usize>,
    /// Bin width per species (population step between grid points).
    pub binsize: Vec<f64>,
    /// Lowest population represented per species.
    pub liml: Vec<f64>,
    /// Global species id of every local axis.
    pub species: Vec<usize>,
}

impl GridParms {
    /// Create a grid over species `0..n.len()`.
    ///
    /// # Errors
    /// Fails if the three arrays differ in length or if any `n` is zero.
    pub fn new(n: Vec<usize>, binsize: Vec<f64>, liml: Vec<f64>) -> Result<Self> {
        let species = (0..n.len()).collect();
        Self::with_species(n, binsize, liml, species)
    }

    /// Create a grid whose local axes carry the given global species ids.
    pub fn with_species(
        n: Vec<usize>,
        binsize: Vec<f64>,
        liml: Vec<f64>,
        species: Vec<usize>,
    ) -> Result<Self> {
        if n.len() != binsize.len() || n.len() != liml.len() || n.len() != species.len() {
            return Err(TtnError::GridLength {
                n: n.len(),
                binsize: binsize.len(),
                liml: liml.len(),
            });
        }
        if let Some(pos) = n.iter().position(|&ni| ni == 0) {
            return Err(TtnError::EmptyGrid(species[pos]));
        }
        Ok(Self {
            n,
            binsize,
            liml,
            species,
        })
    }

    /// Number of species in this partition.
    pub fn d(&self) -> usize {
        self.n.len()
    }

    /// Size of the local state space.
    pub fn dx(&self) -> usize {
        self.n.iter().product()
    }

    /// Product of the bin widths (quadrature weight of one grid point).
    pub fn h_mult(&self) -> f64 {
        self.binsize.iter().product()
    }

    /// Local axis of a global species id, if this grid holds it.
    pub fn position(&self, species: usize) -> Option<usize> {
        self.species.iter().position(|&s| s == species)
    }

    pub fn comb_to_vec(&self, alpha: usize) -> Vec<usize> {
        let mut rest = alpha;
        self.n
            .iter()
            .map(|&ni| {
                let idx = rest % ni;
                rest /= ni;
                idx
            })
            .collect()
    }

    pub fn vec_to_comb(&self, vec_index: &[usize]) -> usize {
        let mut alpha = 0;
        let mut stride = 1;
        for (&idx, &ni) in vec_index.iter().zip(&self.n) {
            alpha += idx * stride;
            stride *= ni;
        }
        alpha
    }

    /// Population counts of a multi-index.
    pub fn vec_index_to_state(&self, vec_index: &[usize]) -> Vec<f64> {
        vec_index
            .iter()
            .enumerate()
            .map(|(i, &idx)| self.liml[i] + idx as f64 * self.binsize[i])
            .collect()
    }

    pub fn index_to_state(&self, alpha: usize) -> Vec<f64> {
        self.vec_index_to_state(&self.comb_to_vec(alpha))
    }

    /// Combinatorial index of a population state, `None` if it lies off the grid.
    pub fn state_to_index(&self, state: &[f64]) -> Option<usize> {
        if state.len() != self.d() {
            return None;
        }
        let mut vec_index = Vec::with_capacity(self.d());
        for i in 0..self.d() {
            let idx = ((state[i] - self.liml[i]) / self.binsize[i]).round();
            if idx < 0.0 || idx >= self.n[i] as f64 {
                return None;
            }
            vec_index.push(idx as usize);
        }
        Some(self.vec_to_comb(&vec_index))
    }

    /// Sub-grid over the given global species ids, in the given order.
    pub fn select_species(&self, species: &[usize]) -> Result<GridParms> {
        let mut positions = Vec::with_capacity(species.len());
        for &s in species {
            let pos = self.position(s).ok_or_else(|| {
                TtnError::SpeciesMismatch(format!("species {} is not part of the grid", s))
            })?;
            positions.push(pos);
        }
        Ok(self.partition(&positions))
    }

    /// Sub-grid over local axes `positions`.
    pub fn partition(&self, positions: &[usize]) -> GridParms {
        GridParms {
            n: positions.iter().map(|&p| self.n[p]).collect(),
            binsize: positions.iter().map(|&p| self.binsize[p]).collect(),
            liml: positions.iter().map(|&p| self.liml[p]).collect(),
            species: positions.iter().map(|&p| self.species[p]).collect(),
        }
    }

    /// Grid whose axes are those of `self` followed by those of `other`.
    pub fn concat(&self, other: &GridParms) -> GridParms {
        let join = |a: &[f64], b: &[f64]| a.iter().chain(b).copied().collect::<Vec<_>>();
        GridParms {
            n: self.n.iter().chain(&other.n).copied().collect(),
            binsize: join(&self.binsize, &other.binsize),
            liml: join(&self.liml, &other.liml),
            species: self.species.iter().chain(&other.species).copied().collect(),
        }
    }

    /// Stoichiometric change of a full-length vector restricted to this grid.
    pub fn local_shift(&self, nu: &[i64]) -> Vec<i64> {
        self.species.iter().map(|&s| nu[s]).collect()
    }

    /// Population change converted to grid steps.
    fn index_shift(&self, nu: &[i64]) -> Vec<i64> {
        nu.iter()
            .zip(&self.binsize)
            .map(|(&v, &h)| (v as f64 / h).round() as i64)
            .collect()
    }

    /// Shift the rows of `input` by the local population change `nu`.
    ///
    /// Row `alpha` of the result holds row `alpha - nu` of the input. Rows
    /// whose source lies outside the grid are zero; there is no wrap-around
    /// between axes.
    pub fn shift_rows(&self, input: &ArrayView2<f64>, nu: &[i64]) -> Array2<f64> {
        assert_eq!(input.nrows(), self.dx(), "shift_rows: row count must equal dx");
        let shift = self.index_shift(nu);
        if shift.iter().all(|&s| s == 0) {
            return input.to_owned();
        }

        let mut out = Array2::zeros(input.raw_dim());
        let mut source = vec![0usize; self.d()];
        for alpha in 0..self.dx() {
            let target = self.comb_to_vec(alpha);
            let inside = (0..self.d()).all(|i| {
                let src = target[i] as i64 - shift[i];
                if src < 0 || src >= self.n[i] as i64 {
                    return false;
                }
                source[i] = src as usize;
                true
            });
            if inside {
                out.row_mut(alpha)
                    .assign(&input.row(self.vec_to_comb(&source)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grid_2x3() -> GridParms {
        GridParms::new(vec![2, 3], vec![1.0, 1.0], vec![0.0, 0.0]).unwrap()
    }

    #[test]
    fn test_rejects_bad_grids() {
        assert!(GridParms::new(vec![2, 3], vec![1.0], vec![0.0, 0.0]).is_err());
        assert!(matches!(
            GridParms::new(vec![2, 0], vec![1.0, 1.0], vec![0.0, 0.0]),
            Err(TtnError::EmptyGrid(1))
        ));
    }

    #[test]
    fn test_index_encoding() {
        let grid = grid_2x3();
        assert_eq!(grid.dx(), 6);
        // First species varies fastest
        assert_eq!(grid.comb_to_vec(1), vec![1, 0]);
        assert_eq!(grid.comb_to_vec(2), vec![0, 1]);
        assert_eq!(grid.vec_to_comb(&[1, 2]), 5);
        for alpha in 0..grid.dx() {
            assert_eq!(grid.vec_to_comb(&grid.comb_to_vec(alpha)), alpha);
        }
    }

    #[test]
    fn test_state_conversion_with_bins() {
        let grid = GridParms::new(vec![3, 2], vec![2.0, 1.0], vec![10.0, 0.0]).unwrap();
        assert_eq!(grid.index_to_state(4), vec![12.0, 1.0]);
        assert_eq!(grid.state_to_index(&[12.0, 1.0]), Some(4));
        assert_eq!(grid.state_to_index(&[16.0, 1.0]), None);
        assert_eq!(grid.h_mult(), 2.0);
    }

    #[test]
    fn test_partition_and_concat() {
        let grid = GridParms::new(vec![2, 3, 4], vec![1.0; 3], vec![0.0; 3]).unwrap();
        let sub = grid.select_species(&[2, 0]).unwrap();
        assert_eq!(sub.n, vec![4, 2]);
        assert_eq!(sub.species, vec![2, 0]);

        let rest = grid.select_species(&[1]).unwrap();
        let joined = sub.concat(&rest);
        assert_eq!(joined.species, vec![2, 0, 1]);
        assert_eq!(joined.dx(), grid.dx());
        assert!(grid.select_species(&[5]).is_err());
    }

    #[test]
    fn test_shift_rows_truncates_per_axis() {
        let grid = grid_2x3();
        let input = array![[1.0], [2.0], [3.0], [4.0], [5.0], [6.0]];

        // Shift species 0 up by one: (0, j) has no source, (1, j) <- (0, j)
        let shifted = grid.shift_rows(&input.view(), &[1, 0]);
        assert_eq!(shifted.column(0).to_vec(), vec![0.0, 1.0, 0.0, 3.0, 0.0, 5.0]);

        // Shift species 1 down by one: (i, j) <- (i, j + 1)
        let shifted = grid.shift_rows(&input.view(), &[0, -1]);
        assert_eq!(shifted.column(0).to_vec(), vec![3.0, 4.0, 5.0, 6.0, 0.0, 0.0]);
    }
}
