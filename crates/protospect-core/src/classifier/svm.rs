//! Support-vector solver.
//!
//! C-SVC with an RBF kernel and probability estimates: one-vs-one binary
//! machines optimized by SMO with maximal-violating-pair working-set
//! selection, a Platt sigmoid fitted per machine, and pairwise coupling to
//! turn the pairwise estimates into one distribution over the trained
//! classes. The solver is deterministic; training the same sample sequence
//! twice yields the same model.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};

use crate::{ClassProbs, LABEL_COUNT, Label};

/// Solver parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SvmParams {
    /// RBF kernel width.
    pub gamma: f64,
    /// Soft-margin cost `C`.
    pub cost: f64,
    /// SMO stopping tolerance.
    pub epsilon: f64,
}

impl Default for SvmParams {
    fn default() -> Self {
        SvmParams {
            gamma: 0.5,
            cost: 2.0,
            epsilon: 0.1,
        }
    }
}

impl SvmParams {
    /// Parameter sanity check, run before training.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.gamma > 0.0) {
            return Err(format!("gamma must be positive, got {}", self.gamma));
        }
        if !(self.cost > 0.0) {
            return Err(format!("cost must be positive, got {}", self.cost));
        }
        if !(self.epsilon > 0.0) {
            return Err(format!("epsilon must be positive, got {}", self.epsilon));
        }
        Ok(())
    }
}

/// One trained one-vs-one machine: `first` is the +1 side.
struct PairMachine {
    first: usize,
    second: usize,
    support: Vec<Array1<f64>>,
    /// `alpha_i * y_i` per support vector.
    coef: Vec<f64>,
    rho: f64,
    platt_a: f64,
    platt_b: f64,
}

/// Trained multi-class model.
pub struct SvmModel {
    dim: usize,
    gamma: f64,
    classes: Vec<Label>,
    machines: Vec<PairMachine>,
}

impl SvmModel {
    /// Labels seen at training time, ascending.
    pub fn classes(&self) -> &[Label] {
        &self.classes
    }

    /// Full per-label probability distribution for one feature vector.
    /// Labels absent from training keep probability zero.
    pub fn predict(&self, features: &[f64]) -> (Label, Box<ClassProbs>) {
        let mut probs = Box::new([0.0f64; LABEL_COUNT]);
        let k = self.classes.len();
        if k == 0 {
            return (0, probs);
        }
        if k == 1 {
            probs[self.classes[0] as usize] = 1.0;
            return (self.classes[0], probs);
        }

        let x = self.normalize_input(features);
        let mut pairwise = vec![vec![0.0f64; k]; k];
        for machine in &self.machines {
            let mut dec = -machine.rho;
            for (sv, coef) in machine.support.iter().zip(&machine.coef) {
                dec += coef * rbf(sv, &x, self.gamma);
            }
            let p = sigmoid_predict(dec, machine.platt_a, machine.platt_b)
                .clamp(1e-7, 1.0 - 1e-7);
            pairwise[machine.first][machine.second] = p;
            pairwise[machine.second][machine.first] = 1.0 - p;
        }

        let coupled = couple_probabilities(&pairwise);
        let mut top = 0;
        for t in 1..k {
            if coupled[t] > coupled[top] {
                top = t;
            }
        }
        for t in 0..k {
            probs[self.classes[t] as usize] = coupled[t];
        }
        (self.classes[top], probs)
    }

    fn normalize_input(&self, features: &[f64]) -> Array1<f64> {
        let mut x = vec![0.0; self.dim];
        let take = features.len().min(self.dim);
        x[..take].copy_from_slice(&features[..take]);
        Array1::from(x)
    }
}

/// Trains a model from labeled dense vectors of width `dim`.
pub(crate) fn train(samples: &[(Label, Vec<f64>)], dim: usize, params: SvmParams) -> SvmModel {
    let mut by_class: BTreeMap<Label, Vec<Array1<f64>>> = BTreeMap::new();
    for (label, features) in samples {
        let mut x = vec![0.0; dim];
        let take = features.len().min(dim);
        x[..take].copy_from_slice(&features[..take]);
        by_class.entry(*label).or_default().push(Array1::from(x));
    }

    let classes: Vec<Label> = by_class.keys().copied().collect();
    let groups: Vec<Vec<Array1<f64>>> = by_class.into_values().collect();

    let mut machines = Vec::new();
    for first in 0..classes.len() {
        for second in first + 1..classes.len() {
            machines.push(train_pair(
                first,
                second,
                &groups[first],
                &groups[second],
                params,
            ));
        }
    }

    SvmModel {
        dim,
        gamma: params.gamma,
        classes,
        machines,
    }
}

fn train_pair(
    first: usize,
    second: usize,
    pos: &[Array1<f64>],
    neg: &[Array1<f64>],
    params: SvmParams,
) -> PairMachine {
    let xs: Vec<&Array1<f64>> = pos.iter().chain(neg.iter()).collect();
    let mut y = vec![1.0f64; pos.len()];
    y.extend(std::iter::repeat(-1.0).take(neg.len()));
    let l = xs.len();

    let mut kernel = Array2::<f64>::zeros((l, l));
    for i in 0..l {
        for j in i..l {
            let value = rbf(xs[i], xs[j], params.gamma);
            kernel[[i, j]] = value;
            kernel[[j, i]] = value;
        }
    }

    let (alpha, rho, grad) = smo(&kernel, &y, params.cost, params.epsilon);

    // decision value of each training point, recovered from the final
    // gradient: sum_j alpha_j y_j K_ij = y_i * (G_i + 1)
    let dec: Vec<f64> = (0..l).map(|i| y[i] * (grad[i] + 1.0) - rho).collect();
    let (platt_a, platt_b) = sigmoid_train(&dec, &y);

    let mut support = Vec::new();
    let mut coef = Vec::new();
    for i in 0..l {
        if alpha[i] > 1e-12 {
            support.push(xs[i].clone());
            coef.push(alpha[i] * y[i]);
        }
    }

    PairMachine {
        first,
        second,
        support,
        coef,
        rho,
        platt_a,
        platt_b,
    }
}

/// SMO over the dual problem `min 1/2 a'Qa - e'a, 0 <= a <= C, y'a = 0`,
/// selecting the maximal violating pair each iteration.
fn smo(kernel: &Array2<f64>, y: &[f64], cost: f64, eps: f64) -> (Vec<f64>, f64, Vec<f64>) {
    let l = y.len();
    let q = |i: usize, j: usize| y[i] * y[j] * kernel[[i, j]];
    let tau = 1e-12;

    let mut alpha = vec![0.0f64; l];
    let mut grad = vec![-1.0f64; l];

    let max_iter = (100 * l).max(10_000);
    for _ in 0..max_iter {
        let mut gmax = f64::NEG_INFINITY;
        let mut gmin = f64::INFINITY;
        let mut i_sel = usize::MAX;
        let mut j_sel = usize::MAX;
        for t in 0..l {
            let v = -y[t] * grad[t];
            let at_upper = alpha[t] >= cost - 1e-12;
            let at_lower = alpha[t] <= 1e-12;
            if (y[t] > 0.0 && !at_upper) || (y[t] < 0.0 && !at_lower) {
                if v > gmax {
                    gmax = v;
                    i_sel = t;
                }
            }
            if (y[t] > 0.0 && !at_lower) || (y[t] < 0.0 && !at_upper) {
                if v < gmin {
                    gmin = v;
                    j_sel = t;
                }
            }
        }
        if i_sel == usize::MAX || j_sel == usize::MAX || gmax - gmin < eps {
            break;
        }
        let (i, j) = (i_sel, j_sel);
        let old_ai = alpha[i];
        let old_aj = alpha[j];

        if y[i] != y[j] {
            let mut quad = q(i, i) + q(j, j) + 2.0 * q(i, j);
            if quad <= 0.0 {
                quad = tau;
            }
            let delta = (-grad[i] - grad[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > cost {
                    alpha[i] = cost;
                    alpha[j] = cost - diff;
                }
            } else if alpha[j] > cost {
                alpha[j] = cost;
                alpha[i] = cost + diff;
            }
        } else {
            let mut quad = q(i, i) + q(j, j) - 2.0 * q(i, j);
            if quad <= 0.0 {
                quad = tau;
            }
            let delta = (grad[i] - grad[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > cost {
                if alpha[i] > cost {
                    alpha[i] = cost;
                    alpha[j] = sum - cost;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > cost {
                if alpha[j] > cost {
                    alpha[j] = cost;
                    alpha[i] = sum - cost;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let delta_i = alpha[i] - old_ai;
        let delta_j = alpha[j] - old_aj;
        if delta_i.abs() < 1e-16 && delta_j.abs() < 1e-16 {
            break;
        }
        for t in 0..l {
            grad[t] += q(t, i) * delta_i + q(t, j) * delta_j;
        }
    }

    // bias from the KKT conditions on the final gradient
    let mut nr_free = 0usize;
    let mut sum_free = 0.0f64;
    let mut ub = f64::INFINITY;
    let mut lb = f64::NEG_INFINITY;
    for t in 0..l {
        let yg = y[t] * grad[t];
        if alpha[t] >= cost - 1e-12 {
            if y[t] < 0.0 {
                ub = ub.min(yg);
            } else {
                lb = lb.max(yg);
            }
        } else if alpha[t] <= 1e-12 {
            if y[t] > 0.0 {
                ub = ub.min(yg);
            } else {
                lb = lb.max(yg);
            }
        } else {
            nr_free += 1;
            sum_free += yg;
        }
    }
    let rho = if nr_free > 0 {
        sum_free / nr_free as f64
    } else {
        (ub + lb) / 2.0
    };

    (alpha, rho, grad)
}

fn rbf(a: &Array1<f64>, b: &Array1<f64>, gamma: f64) -> f64 {
    let diff = a - b;
    (-gamma * diff.dot(&diff)).exp()
}

fn sigmoid_predict(dec: f64, a: f64, b: f64) -> f64 {
    let fapb = dec * a + b;
    if fapb >= 0.0 {
        (-fapb).exp() / (1.0 + (-fapb).exp())
    } else {
        1.0 / (1.0 + fapb.exp())
    }
}

/// Fits `P(y=+1 | f) = 1 / (1 + exp(A f + B))` on the training decision
/// values with prior-regularized targets (Newton with backtracking).
fn sigmoid_train(dec: &[f64], y: &[f64]) -> (f64, f64) {
    let l = dec.len();
    let mut prior1 = 0.0;
    let mut prior0 = 0.0;
    for &label in y {
        if label > 0.0 {
            prior1 += 1.0;
        } else {
            prior0 += 1.0;
        }
    }

    let max_iter = 100;
    let min_step = 1e-10;
    let sigma = 1e-12;
    let eps = 1e-5;
    let hi_target = (prior1 + 1.0) / (prior1 + 2.0);
    let lo_target = 1.0 / (prior0 + 2.0);
    let targets: Vec<f64> = y
        .iter()
        .map(|&label| if label > 0.0 { hi_target } else { lo_target })
        .collect();

    let objective = |a: f64, b: f64| {
        let mut fval = 0.0;
        for i in 0..l {
            let fapb = dec[i] * a + b;
            fval += if fapb >= 0.0 {
                targets[i] * fapb + (1.0 + (-fapb).exp()).ln()
            } else {
                (targets[i] - 1.0) * fapb + (1.0 + fapb.exp()).ln()
            };
        }
        fval
    };

    let mut a = 0.0;
    let mut b = ((prior0 + 1.0) / (prior1 + 1.0)).ln();
    let mut fval = objective(a, b);

    for _ in 0..max_iter {
        let mut h11 = sigma;
        let mut h22 = sigma;
        let mut h21 = 0.0;
        let mut g1 = 0.0;
        let mut g2 = 0.0;
        for i in 0..l {
            let fapb = dec[i] * a + b;
            let (p, q) = if fapb >= 0.0 {
                let e = (-fapb).exp();
                (e / (1.0 + e), 1.0 / (1.0 + e))
            } else {
                let e = fapb.exp();
                (1.0 / (1.0 + e), e / (1.0 + e))
            };
            let d2 = p * q;
            h11 += dec[i] * dec[i] * d2;
            h22 += d2;
            h21 += dec[i] * d2;
            let d1 = targets[i] - p;
            g1 += dec[i] * d1;
            g2 += d1;
        }
        if g1.abs() < eps && g2.abs() < eps {
            break;
        }

        let det = h11 * h22 - h21 * h21;
        let da = -(h22 * g1 - h21 * g2) / det;
        let db = -(-h21 * g1 + h11 * g2) / det;
        let gd = g1 * da + g2 * db;

        let mut step = 1.0;
        let mut improved = false;
        while step >= min_step {
            let new_a = a + step * da;
            let new_b = b + step * db;
            let new_f = objective(new_a, new_b);
            if new_f < fval + 1e-4 * step * gd {
                a = new_a;
                b = new_b;
                fval = new_f;
                improved = true;
                break;
            }
            step /= 2.0;
        }
        if !improved {
            break;
        }
    }

    (a, b)
}

/// Pairwise coupling: turns the `r[i][j] = P(i | i or j)` matrix into one
/// distribution by iterative refinement.
fn couple_probabilities(r: &[Vec<f64>]) -> Vec<f64> {
    let k = r.len();
    let mut q = vec![vec![0.0f64; k]; k];
    let mut qp = vec![0.0f64; k];
    let mut p = vec![1.0 / k as f64; k];
    let eps = 0.005 / k as f64;

    for t in 0..k {
        for j in 0..k {
            if j != t {
                q[t][t] += r[j][t] * r[j][t];
                q[t][j] = -r[j][t] * r[t][j];
            }
        }
    }

    let max_iter = 100.max(k);
    for _ in 0..=max_iter {
        let mut pqp = 0.0;
        for t in 0..k {
            qp[t] = 0.0;
            for j in 0..k {
                qp[t] += q[t][j] * p[j];
            }
            pqp += p[t] * qp[t];
        }
        let mut max_error = 0.0f64;
        for t in 0..k {
            max_error = max_error.max((qp[t] - pqp).abs());
        }
        if max_error < eps {
            break;
        }

        for t in 0..k {
            let diff = (-qp[t] + pqp) / q[t][t];
            p[t] += diff;
            pqp = (pqp + diff * (diff * q[t][t] + 2.0 * qp[t])) / (1.0 + diff) / (1.0 + diff);
            for j in 0..k {
                qp[j] = (qp[j] + diff * q[t][j]) / (1.0 + diff);
                p[j] /= 1.0 + diff;
            }
        }
    }
    p
}
