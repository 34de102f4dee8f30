//! Mean-variance allocation solver
//!
//! Maximizes `mu·w - lambda * w'Σw` over the probability simplex subject to
//! `mu·w >= min_return`. The return floor is handled through its Lagrange
//! multiplier: for a fixed multiplier `nu` the problem is a simplex-constrained
//! concave QP solved by accelerated projected gradient ascent (FISTA with
//! adaptive restart), and `nu` is found by bisection on the achieved return.
//! Each inner solve stops once the projected-gradient residual, a KKT
//! measure for the simplex, is within tolerance.

use crate::config::DEFAULT_SOLVER_MAX_ITERATIONS;
use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weight components below this magnitude are treated as zero
pub const WEIGHT_EPSILON: f64 = 1e-6;
/// Tolerance for the sum-to-one and return-floor checks
pub const FEASIBILITY_TOLERANCE: f64 = 1e-6;

/// Projected-gradient residual at which an inner solve is optimal, relative
/// to the scale of the gradient
const KKT_TOLERANCE: f64 = 1e-9;
const SYMMETRY_TOLERANCE: f64 = 1e-9;
const MAX_MULTIPLIER: f64 = 1e12;
const BISECTION_ROUNDS: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationProblem {
    pub expected_returns: Vec<f64>,
    pub covariances: Vec<Vec<f64>>,
    pub risk_aversion: f64,
    #[serde(default)]
    pub min_return: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationResult {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub variance: f64,
    pub objective: f64,
    pub iterations: usize,
}

impl AllocationProblem {
    pub fn new(expected_returns: Vec<f64>, covariances: Vec<Vec<f64>>, risk_aversion: f64) -> Self {
        Self {
            expected_returns,
            covariances,
            risk_aversion,
            min_return: 0.0,
        }
    }

    pub fn with_min_return(mut self, min_return: f64) -> Self {
        self.min_return = min_return;
        self
    }

    fn validate(&self) -> Result<()> {
        let n = self.expected_returns.len();
        if n == 0 {
            return Err(OrchestrationError::InvalidInput(
                "allocation needs at least one asset".to_string(),
            ));
        }
        if self.covariances.len() != n || self.covariances.iter().any(|row| row.len() != n) {
            return Err(OrchestrationError::InvalidInput(format!(
                "covariance matrix must be {}x{}",
                n, n
            )));
        }
        if self.expected_returns.iter().any(|r| !r.is_finite())
            || self.covariances.iter().flatten().any(|c| !c.is_finite())
        {
            return Err(OrchestrationError::InvalidInput(
                "allocation inputs must be finite".to_string(),
            ));
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (self.covariances[i][j], self.covariances[j][i]);
                if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
                    return Err(OrchestrationError::InvalidInput(format!(
                        "covariance matrix is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        if !self.risk_aversion.is_finite() || self.risk_aversion < 0.0 {
            return Err(OrchestrationError::InvalidInput(format!(
                "risk aversion must be non-negative, got {}",
                self.risk_aversion
            )));
        }
        if !self.min_return.is_finite() {
            return Err(OrchestrationError::InvalidInput(
                "minimum return must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        dot(&self.expected_returns, weights)
    }

    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        dot(weights, &mat_vec(&self.covariances, weights))
    }

    pub fn objective(&self, weights: &[f64]) -> f64 {
        self.portfolio_return(weights) - self.risk_aversion * self.portfolio_variance(weights)
    }
}

/// Accelerated projected-gradient solver with a bounded iteration budget
#[derive(Debug, Clone)]
pub struct AllocationSolver {
    max_iterations: usize,
}

impl Default for AllocationSolver {
    fn default() -> Self {
        Self::new(DEFAULT_SOLVER_MAX_ITERATIONS)
    }
}

impl AllocationSolver {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn solve(&self, problem: &AllocationProblem) -> Result<AllocationResult> {
        problem.validate()?;

        let best_return = problem
            .expected_returns
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        if problem.min_return > best_return + FEASIBILITY_TOLERANCE {
            return Err(OrchestrationError::Infeasible(format!(
                "minimum return {} exceeds the best single-asset return {}",
                problem.min_return, best_return
            )));
        }

        let mut iterations = 0;
        let (mut weights, used) = self.solve_with_multiplier(problem, 0.0)?;
        iterations += used;

        if problem.portfolio_return(&weights) < problem.min_return - FEASIBILITY_TOLERANCE {
            // Grow the multiplier until the floor is met, then tighten it.
            let mut low = 0.0;
            let mut high = 1.0;
            let (mut high_weights, used) = self.solve_with_multiplier(problem, high)?;
            iterations += used;

            while problem.portfolio_return(&high_weights) < problem.min_return - FEASIBILITY_TOLERANCE {
                low = high;
                high *= 2.0;
                if high > MAX_MULTIPLIER {
                    return Err(OrchestrationError::Infeasible(format!(
                        "minimum return {} is not reachable within tolerance",
                        problem.min_return
                    )));
                }
                let (candidate, used) = self.solve_with_multiplier(problem, high)?;
                iterations += used;
                high_weights = candidate;
            }

            for _ in 0..BISECTION_ROUNDS {
                if high - low <= 1e-9 * high.max(1.0) {
                    break;
                }
                let mid = 0.5 * (low + high);
                let (candidate, used) = self.solve_with_multiplier(problem, mid)?;
                iterations += used;
                if problem.portfolio_return(&candidate) >= problem.min_return {
                    high = mid;
                    high_weights = candidate;
                } else {
                    low = mid;
                }
            }

            debug!(multiplier = high, "Return floor active");
            weights = high_weights;
        }

        let weights = clean_weights(weights)?;
        let expected_return = problem.portfolio_return(&weights);
        if expected_return < problem.min_return - FEASIBILITY_TOLERANCE {
            return Err(OrchestrationError::Infeasible(format!(
                "achieved return {:.8} is below the floor {}",
                expected_return, problem.min_return
            )));
        }

        let variance = problem.portfolio_variance(&weights);
        debug!(iterations, expected_return, variance, "Allocation solved");

        Ok(AllocationResult {
            objective: expected_return - problem.risk_aversion * variance,
            weights,
            expected_return,
            variance,
            iterations,
        })
    }

    /// Maximize `(1 + nu) mu·w - lambda w'Σw` over the simplex
    fn solve_with_multiplier(&self, problem: &AllocationProblem, nu: f64) -> Result<(Vec<f64>, usize)> {
        let n = problem.expected_returns.len();
        let lambda = problem.risk_aversion;
        let scaled_returns: Vec<f64> = problem
            .expected_returns
            .iter()
            .map(|r| (1.0 + nu) * r)
            .collect();

        // Gershgorin bound on the spectral radius gives a safe Lipschitz constant.
        let spectral_bound = problem
            .covariances
            .iter()
            .map(|row| row.iter().map(|c| c.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        let lipschitz = 2.0 * lambda * spectral_bound;
        let step = if lipschitz > 1e-12 {
            1.0 / lipschitz
        } else {
            // Linear objective: any step reaches the optimal face; scale to the returns.
            let spread = scaled_returns.iter().map(|r| r.abs()).fold(0.0, f64::max);
            1.0 / spread.max(1e-12)
        };

        let tolerance = KKT_TOLERANCE
            * lipschitz
                .max(scaled_returns.iter().map(|r| r.abs()).fold(0.0, f64::max))
                .max(1.0);

        let mut weights = vec![1.0 / n as f64; n];
        let mut lookahead = weights.clone();
        let mut momentum = 1.0_f64;

        for iteration in 1..=self.max_iterations {
            let sigma_y = mat_vec(&problem.covariances, &lookahead);
            let candidate: Vec<f64> = lookahead
                .iter()
                .zip(scaled_returns.iter().zip(sigma_y.iter()))
                .map(|(y, (r, s))| y + step * (r - 2.0 * lambda * s))
                .collect();
            let next = project_onto_simplex(&candidate);

            let residual = next
                .iter()
                .zip(lookahead.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max)
                / step;
            if residual <= tolerance {
                return Ok((next, iteration));
            }

            // Restart when the step runs against the momentum direction.
            let against_momentum = next
                .iter()
                .zip(lookahead.iter().zip(weights.iter()))
                .map(|(x, (y, prev))| (x - y) * (x - prev))
                .sum::<f64>()
                < 0.0;

            if against_momentum {
                momentum = 1.0;
                lookahead = next.clone();
            } else {
                let following = 0.5 * (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt());
                let beta = (momentum - 1.0) / following;
                lookahead = next
                    .iter()
                    .zip(weights.iter())
                    .map(|(x, prev)| x + beta * (x - prev))
                    .collect();
                momentum = following;
            }
            weights = next;
        }

        Err(OrchestrationError::SolverDivergence {
            iterations: self.max_iterations,
        })
    }
}

/// Convenience wrapper using the default iteration budget
pub fn solve(
    expected_returns: &[f64],
    covariances: &[Vec<f64>],
    risk_aversion: f64,
    min_return: f64,
) -> Result<AllocationResult> {
    let problem = AllocationProblem::new(expected_returns.to_vec(), covariances.to_vec(), risk_aversion)
        .with_min_return(min_return);
    AllocationSolver::default().solve(&problem)
}

/// Euclidean projection onto `{w >= 0, sum(w) = 1}`
pub fn project_onto_simplex(v: &[f64]) -> Vec<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (i, value) in sorted.iter().enumerate() {
        cumulative += value;
        let candidate = (cumulative - 1.0) / (i + 1) as f64;
        if value - candidate > 0.0 {
            theta = candidate;
        }
    }

    v.iter().map(|x| (x - theta).max(0.0)).collect()
}

fn clean_weights(weights: Vec<f64>) -> Result<Vec<f64>> {
    let trimmed: Vec<f64> = weights
        .into_iter()
        .map(|w| if w.abs() < WEIGHT_EPSILON { 0.0 } else { w.max(0.0) })
        .collect();
    let total: f64 = trimmed.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(OrchestrationError::Execution(
            "solver produced a degenerate weight vector".to_string(),
        ));
    }

    let normalized: Vec<f64> = trimmed.iter().map(|w| w / total).collect();
    let sum: f64 = normalized.iter().sum();
    if (sum - 1.0).abs() > FEASIBILITY_TOLERANCE {
        return Err(OrchestrationError::Execution(format!(
            "weights sum to {} after normalization",
            sum
        )));
    }
    Ok(normalized)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(matrix: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    matrix.iter().map(|row| dot(row, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(values: &[f64]) -> Vec<Vec<f64>> {
        let n = values.len();
        (0..n)
            .map(|i| (0..n).map(|j| if i == j { values[i] } else { 0.0 }).collect())
            .collect()
    }

    fn assert_valid(weights: &[f64]) {
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() <= 1e-6, "weights sum to {}", sum);
        assert!(weights.iter().all(|w| *w >= -1e-6), "negative weight in {:?}", weights);
    }

    #[test]
    fn test_three_asset_example() {
        let problem = AllocationProblem::new(vec![0.08, 0.05, 0.12], diag(&[0.04, 0.01, 0.09]), 2.0);
        let result = AllocationSolver::default().solve(&problem).unwrap();

        assert_valid(&result.weights);
        assert!(result.weights[1] > 0.05, "low-variance asset weight {:?}", result.weights);

        let uniform = vec![1.0 / 3.0; 3];
        assert!(problem.objective(&result.weights) >= problem.objective(&uniform));
        assert!((result.objective - problem.objective(&result.weights)).abs() < 1e-12);
    }

    #[test]
    fn test_identical_returns_give_minimum_variance() {
        // Minimum-variance weights for a diagonal matrix are proportional to 1/σ².
        let problem = AllocationProblem::new(vec![0.07; 3], diag(&[0.04, 0.01, 0.02]), 1.0);
        let result = AllocationSolver::default().solve(&problem).unwrap();

        let inverse: Vec<f64> = [0.04, 0.01, 0.02].iter().map(|v| 1.0 / v).collect();
        let total: f64 = inverse.iter().sum();
        for (w, inv) in result.weights.iter().zip(inverse.iter()) {
            assert!((w - inv / total).abs() < 1e-6, "{:?}", result.weights);
        }
    }

    #[test]
    fn test_equal_covariances_give_equal_weights() {
        let problem = AllocationProblem::new(vec![0.05; 4], diag(&[0.02; 4]), 3.0);
        let result = AllocationSolver::default().solve(&problem).unwrap();

        for w in &result.weights {
            assert!((w - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_high_risk_aversion_approaches_minimum_variance() {
        let problem = AllocationProblem::new(vec![0.30, 0.01, 0.02], diag(&[0.09, 0.01, 0.04]), 1e6);
        let result = AllocationSolver::default().solve(&problem).unwrap();

        // 1/σ² normalized: [1/0.09, 100, 25] / total
        let inverse = [1.0 / 0.09, 100.0, 25.0];
        let total: f64 = inverse.iter().sum();
        for (w, inv) in result.weights.iter().zip(inverse.iter()) {
            assert!((w - inv / total).abs() < 1e-4, "{:?}", result.weights);
        }
    }

    #[test]
    fn test_zero_risk_aversion_picks_best_asset() {
        let result = solve(&[0.03, 0.11, 0.07], &diag(&[0.01, 0.2, 0.05]), 0.0, 0.0).unwrap();
        assert_valid(&result.weights);
        assert!((result.weights[1] - 1.0).abs() < 1e-6, "{:?}", result.weights);
    }

    #[test]
    fn test_return_floor_binds() {
        let problem = AllocationProblem::new(vec![0.08, 0.05, 0.12], diag(&[0.04, 0.01, 0.09]), 2.0)
            .with_min_return(0.10);
        let result = AllocationSolver::default().solve(&problem).unwrap();

        assert_valid(&result.weights);
        assert!(result.expected_return >= 0.10 - 1e-6);
    }

    #[test]
    fn test_unreachable_floor_is_infeasible() {
        let problem = AllocationProblem::new(vec![0.08, 0.05], diag(&[0.04, 0.01]), 2.0)
            .with_min_return(0.2);
        let result = AllocationSolver::default().solve(&problem);
        assert!(matches!(result, Err(OrchestrationError::Infeasible(_))));
    }

    #[test]
    fn test_iteration_budget_exhaustion_diverges() {
        let problem = AllocationProblem::new(vec![0.08, 0.05, 0.12], diag(&[0.04, 0.01, 0.09]), 2.0);
        let result = AllocationSolver::new(2).solve(&problem);
        assert!(matches!(
            result,
            Err(OrchestrationError::SolverDivergence { iterations: 2 })
        ));
    }

    #[test]
    fn test_highly_correlated_assets_converge() {
        // Near-singular covariance: the simplex direction has curvature 8e-6,
        // which puts the optimum at w = [0.4875, 0.5125].
        let problem = AllocationProblem::new(
            vec![0.10, 0.1000001],
            vec![vec![0.04, 0.039999], vec![0.039999, 0.04]],
            2.0,
        );
        let result = AllocationSolver::default().solve(&problem).unwrap();

        assert_valid(&result.weights);
        assert!((result.weights[0] - 0.4875).abs() < 1e-3, "{:?}", result.weights);
        assert!(problem.objective(&result.weights) >= problem.objective(&[0.5, 0.5]) - 1e-12);
        assert!(result.iterations < DEFAULT_SOLVER_MAX_ITERATIONS);
    }

    #[test]
    fn test_rejects_malformed_problems() {
        let asymmetric = AllocationProblem::new(vec![0.1, 0.2], vec![vec![0.1, 0.02], vec![0.05, 0.1]], 1.0);
        let mismatched = AllocationProblem::new(vec![0.1, 0.2], diag(&[0.1]), 1.0);
        let negative = AllocationProblem::new(vec![0.1], diag(&[0.1]), -1.0);

        for problem in [asymmetric, mismatched, negative] {
            assert!(matches!(
                AllocationSolver::default().solve(&problem),
                Err(OrchestrationError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_simplex_projection() {
        let projected = project_onto_simplex(&[0.5, 0.5, 0.5]);
        for w in &projected {
            assert!((w - 1.0 / 3.0).abs() < 1e-12);
        }

        let corner = project_onto_simplex(&[3.0, 0.0, -1.0]);
        assert_eq!(corner, vec![1.0, 0.0, 0.0]);
    }
}
