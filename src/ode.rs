//! Explicit one-step methods for matrix-valued ODEs `y' = f(y)`.

use std::str::FromStr;

use ndarray::Array2;

use crate::error::TtnError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IntegrationMethod {
    #[default]
    ExplicitEuler,
    /// Explicit midpoint rule.
    Rk2,
    /// Classical fourth-order Runge-Kutta.
    Rk4,
}

impl IntegrationMethod {
    /// Advance `y` in place by one step of size `tau`.
    pub fn integrate<F>(&self, y: &mut Array2<f64>, rhs: F, tau: f64)
    where
        F: Fn(&Array2<f64>) -> Array2<f64>,
    {
        match self {
            IntegrationMethod::ExplicitEuler => {
                let k1 = rhs(y);
                y.scaled_add(tau, &k1);
            }
            IntegrationMethod::Rk2 => {
                let k1 = rhs(y);
                let mid = &*y + &(k1 * (0.5 * tau));
                let k2 = rhs(&mid);
                y.scaled_add(tau, &k2);
            }
            IntegrationMethod::Rk4 => {
                let k1 = rhs(y);
                let k2 = rhs(&(&*y + &(&k1 * (0.5 * tau))));
                let k3 = rhs(&(&*y + &(&k2 * (0.5 * tau))));
                let k4 = rhs(&(&*y + &(&k3 * tau)));
                y.scaled_add(tau / 6.0, &k1);
                y.scaled_add(tau / 3.0, &k2);
                y.scaled_add(tau / 3.0, &k3);
                y.scaled_add(tau / 6.0, &k4);
            }
        }
    }
}

impl FromStr for IntegrationMethod {
    type Err = TtnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit_euler" | "euler" => Ok(IntegrationMethod::ExplicitEuler),
            "rk2" | "midpoint" => Ok(IntegrationMethod::Rk2),
            "rk4" => Ok(IntegrationMethod::Rk4),
            other => Err(TtnError::UnknownMethod(other.to_string())),
        }
    }
}

/// Settings for one integrator call.
#[derive(Clone, Debug)]
pub struct IntegratorConfig {
    /// ODE method used by every K-, S- and Q-step.
    pub method: IntegrationMethod,
    /// Number of equal ODE steps each sub-flow takes to cover `tau`.
    pub substeps: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::ExplicitEuler,
            substeps: 1,
        }
    }
}

impl IntegratorConfig {
    pub fn new(method: IntegrationMethod, substeps: usize) -> Self {
        Self {
            method,
            substeps: substeps.max(1),
        }
    }

    /// Integrate `y` over a time span `tau` with `substeps` steps.
    pub fn advance<F>(&self, y: &mut Array2<f64>, rhs: F, tau: f64)
    where
        F: Fn(&Array2<f64>) -> Array2<f64>,
    {
        let steps = self.substeps.max(1);
        let h = tau / steps as f64;
        for _ in 0..steps {
            self.method.integrate(y, &rhs, h);
        }
    }
}
