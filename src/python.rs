//! Python bindings over tree construction and integration.

use numpy::{IntoPyArray, PyArray1};
use pyo3::prelude::*;

use crate::error::TtnError;
use crate::grid::GridParms;
use crate::ode::{IntegrationMethod, IntegratorConfig};
use crate::partition::TreeBuilder;
use crate::reaction::ReactionSystem;
use crate::tables::{product_marginals, tabulated_reaction};
use crate::tree::Tree;

fn to_py_err(e: TtnError) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string())
}

/// Tree tensor network over a grid, with tabulated reactions.
///
/// # Arguments
/// * `partition` - Partition string such as `"((0)(1))(2)"`
/// * `n`, `binsize`, `liml` - Grid per species
/// * `r_out` - Rank per depth level
/// * `nu` - Stoichiometric vector per reaction
/// * `factors` - Per reaction, `(species, values on the grid)` pairs
/// * `marginals` - Initial marginal per species
#[pyclass(name = "Tree")]
pub struct PyTree {
    tree: Tree,
    config: IntegratorConfig,
}

#[pymethods]
impl PyTree {
    #[new]
    #[pyo3(signature = (partition, n, binsize, liml, r_out, nu, factors, marginals, method="explicit_euler", substeps=1))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        partition: &str,
        n: Vec<usize>,
        binsize: Vec<f64>,
        liml: Vec<f64>,
        r_out: Vec<usize>,
        nu: Vec<Vec<i64>>,
        factors: Vec<Vec<(usize, Vec<f64>)>>,
        marginals: Vec<Vec<f64>>,
        method: &str,
        substeps: usize,
    ) -> PyResult<Self> {
        if nu.len() != factors.len() {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "{} stoichiometric vectors for {} factor lists",
                nu.len(),
                factors.len()
            )));
        }
        let method: IntegrationMethod = method.parse().map_err(to_py_err)?;
        let grid = GridParms::new(n, binsize, liml).map_err(to_py_err)?;

        let reactions = nu
            .into_iter()
            .zip(&factors)
            .enumerate()
            .map(|(mu, (nu, f))| tabulated_reaction(&grid, &format!("R{}", mu), nu, f))
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_py_err)?;
        let names = (0..grid.d()).map(|s| format!("S{}", s)).collect();
        let system = ReactionSystem::new(names, reactions).map_err(to_py_err)?;

        let initial = product_marginals(&grid, marginals).map_err(to_py_err)?;
        let tree = TreeBuilder::new(partition, grid, r_out)
            .and_then(|builder| builder.build(&system, initial))
            .map_err(to_py_err)?;

        Ok(Self {
            tree,
            config: IntegratorConfig::new(method, substeps),
        })
    }

    /// Advance by one time step `tau`.
    fn integrate(&mut self, py: Python<'_>, tau: f64) -> PyResult<()> {
        let Self { tree, config } = self;
        py.allow_threads(|| tree.integrate(tau, &*config)).map_err(to_py_err)
    }

    /// Full distribution, ordered as `species_order`.
    fn full_distribution<'py>(&self, py: Python<'py>) -> &'py PyArray1<f64> {
        self.tree.full_distribution().into_pyarray(py)
    }

    fn species_order(&self) -> Vec<usize> {
        self.tree.species_order().to_vec()
    }

    fn mass(&self) -> f64 {
        self.tree.mass()
    }

    fn orthogonality_defect(&self) -> f64 {
        self.tree.orthogonality_defect()
    }
}

#[pymodule]
fn ttn_cme(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyTree>()?;
    Ok(())
}
