//! Gated recurrent units with analytic backpropagation through time.
//!
//! Gate layout follows the usual convention: reset, update, candidate
//! stacked row-wise in the `(3h, ·)` weight matrices. The bidirectional
//! layer runs one cell forward in time and an independent cell backward,
//! concatenating per-step outputs.

use ndarray::{s, Array1, Array2, ArrayView1};

use neuroauth_core::utils::{sigmoid, Xorshift64};

/// One GRU cell.
#[derive(Debug, Clone)]
pub struct GruCell {
    input_size: usize,
    hidden_size: usize,
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,
    grad_w_ih: Array2<f32>,
    grad_w_hh: Array2<f32>,
    grad_b_ih: Array1<f32>,
    grad_b_hh: Array1<f32>,
}

/// Per-step forward cache needed by the backward pass.
#[derive(Debug, Clone)]
pub struct StepCache {
    x: Array1<f32>,
    h_prev: Array1<f32>,
    r: Array1<f32>,
    z: Array1<f32>,
    n: Array1<f32>,
    /// `W_hn h_prev + b_hn`, the recurrent half of the candidate preact.
    u: Array1<f32>,
}

impl GruCell {
    /// Xavier-initialised cell.
    #[must_use]
    pub fn with_seed(input_size: usize, hidden_size: usize, seed: u64) -> Self {
        let mut rng = Xorshift64::new(seed);
        let limit_ih = (6.0 / (input_size + hidden_size) as f32).sqrt();
        let limit_hh = (6.0 / (2 * hidden_size) as f32).sqrt();
        Self {
            input_size,
            hidden_size,
            w_ih: Array2::from_shape_fn((3 * hidden_size, input_size), |_| {
                rng.next_range(-limit_ih, limit_ih)
            }),
            w_hh: Array2::from_shape_fn((3 * hidden_size, hidden_size), |_| {
                rng.next_range(-limit_hh, limit_hh)
            }),
            b_ih: Array1::zeros(3 * hidden_size),
            b_hh: Array1::zeros(3 * hidden_size),
            grad_w_ih: Array2::zeros((3 * hidden_size, input_size)),
            grad_w_hh: Array2::zeros((3 * hidden_size, hidden_size)),
            grad_b_ih: Array1::zeros(3 * hidden_size),
            grad_b_hh: Array1::zeros(3 * hidden_size),
        }
    }

    /// Hidden width.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// One step: `h_new = (1 − z) ⊙ n + z ⊙ h_prev`.
    #[must_use]
    pub fn forward_step(
        &self,
        x: ArrayView1<'_, f32>,
        h_prev: ArrayView1<'_, f32>,
    ) -> (Array1<f32>, StepCache) {
        let h = self.hidden_size;
        let gi = self.w_ih.dot(&x) + &self.b_ih;
        let gh = self.w_hh.dot(&h_prev) + &self.b_hh;

        let r = Array1::from_shape_fn(h, |i| sigmoid(gi[i] + gh[i]));
        let z = Array1::from_shape_fn(h, |i| sigmoid(gi[h + i] + gh[h + i]));
        let u = Array1::from_shape_fn(h, |i| gh[2 * h + i]);
        let n = Array1::from_shape_fn(h, |i| (gi[2 * h + i] + r[i] * u[i]).tanh());
        let h_new = Array1::from_shape_fn(h, |i| (1.0 - z[i]) * n[i] + z[i] * h_prev[i]);

        let cache = StepCache {
            x: x.to_owned(),
            h_prev: h_prev.to_owned(),
            r,
            z,
            n,
            u,
        };
        (h_new, cache)
    }

    /// One step of backpropagation; accumulates parameter gradients and
    /// returns `(dx, dh_prev)`.
    #[must_use]
    pub fn backward_step(&mut self, cache: &StepCache, dh: ArrayView1<'_, f32>) -> (Array1<f32>, Array1<f32>) {
        let h = self.hidden_size;
        let StepCache {
            x,
            h_prev,
            r,
            z,
            n,
            u,
        } = cache;

        let dn = Array1::from_shape_fn(h, |i| dh[i] * (1.0 - z[i]));
        let dz = Array1::from_shape_fn(h, |i| dh[i] * (h_prev[i] - n[i]));
        let mut dh_prev = Array1::from_shape_fn(h, |i| dh[i] * z[i]);

        // Candidate preact: a_n = gi_n + r ⊙ u.
        let da_n = Array1::from_shape_fn(h, |i| dn[i] * (1.0 - n[i] * n[i]));
        let dr = Array1::from_shape_fn(h, |i| da_n[i] * u[i]);
        let du = Array1::from_shape_fn(h, |i| da_n[i] * r[i]);
        let da_z = Array1::from_shape_fn(h, |i| dz[i] * z[i] * (1.0 - z[i]));
        let da_r = Array1::from_shape_fn(h, |i| dr[i] * r[i] * (1.0 - r[i]));

        // Input-side gradients; gate rows are [r | z | n].
        accumulate_outer(&mut self.grad_w_ih.slice_mut(s![0..h, ..]), &da_r, x);
        accumulate_outer(&mut self.grad_w_ih.slice_mut(s![h..2 * h, ..]), &da_z, x);
        accumulate_outer(&mut self.grad_w_ih.slice_mut(s![2 * h..3 * h, ..]), &da_n, x);
        for i in 0..h {
            self.grad_b_ih[i] += da_r[i];
            self.grad_b_ih[h + i] += da_z[i];
            self.grad_b_ih[2 * h + i] += da_n[i];
        }

        // Recurrent-side gradients; candidate row uses du.
        accumulate_outer(&mut self.grad_w_hh.slice_mut(s![0..h, ..]), &da_r, h_prev);
        accumulate_outer(&mut self.grad_w_hh.slice_mut(s![h..2 * h, ..]), &da_z, h_prev);
        accumulate_outer(&mut self.grad_w_hh.slice_mut(s![2 * h..3 * h, ..]), &du, h_prev);
        for i in 0..h {
            self.grad_b_hh[i] += da_r[i];
            self.grad_b_hh[h + i] += da_z[i];
            self.grad_b_hh[2 * h + i] += du[i];
        }

        // Input gradient.
        let mut dx = self.w_ih.slice(s![0..h, ..]).t().dot(&da_r);
        dx += &self.w_ih.slice(s![h..2 * h, ..]).t().dot(&da_z);
        dx += &self.w_ih.slice(s![2 * h..3 * h, ..]).t().dot(&da_n);

        // Hidden-state gradient through the gates.
        dh_prev += &self.w_hh.slice(s![0..h, ..]).t().dot(&da_r);
        dh_prev += &self.w_hh.slice(s![h..2 * h, ..]).t().dot(&da_z);
        dh_prev += &self.w_hh.slice(s![2 * h..3 * h, ..]).t().dot(&du);

        (dx, dh_prev)
    }

    /// Zero the gradient buffers.
    pub fn zero_grad(&mut self) {
        self.grad_w_ih.fill(0.0);
        self.grad_w_hh.fill(0.0);
        self.grad_b_ih.fill(0.0);
        self.grad_b_hh.fill(0.0);
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        3 * self.hidden_size * (self.input_size + self.hidden_size + 2)
    }

    /// Push parameters into a flat vec.
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        out.extend(self.w_ih.iter());
        out.extend(self.w_hh.iter());
        out.extend(self.b_ih.iter());
        out.extend(self.b_hh.iter());
    }

    /// Push gradients in the same layout.
    pub fn flatten_grads_into(&self, out: &mut Vec<f32>) {
        out.extend(self.grad_w_ih.iter());
        out.extend(self.grad_w_hh.iter());
        out.extend(self.grad_b_ih.iter());
        out.extend(self.grad_b_hh.iter());
    }

    /// Restore parameters from a flat slice; returns floats consumed.
    pub fn unflatten_from(&mut self, data: &[f32]) -> usize {
        let mut offset = 0;
        for target in self.w_ih.iter_mut() {
            *target = data[offset];
            offset += 1;
        }
        for target in self.w_hh.iter_mut() {
            *target = data[offset];
            offset += 1;
        }
        for target in self.b_ih.iter_mut() {
            *target = data[offset];
            offset += 1;
        }
        for target in self.b_hh.iter_mut() {
            *target = data[offset];
            offset += 1;
        }
        offset
    }
}

fn accumulate_outer(
    target: &mut ndarray::ArrayViewMut2<'_, f32>,
    rows: &Array1<f32>,
    columns: &Array1<f32>,
) {
    for (i, &r) in rows.iter().enumerate() {
        if r == 0.0 {
            continue;
        }
        let mut row = target.row_mut(i);
        for (j, &c) in columns.iter().enumerate() {
            row[j] += r * c;
        }
    }
}

/// Caches for one direction over a full sequence.
#[derive(Debug, Clone)]
pub struct DirectionCache {
    steps: Vec<StepCache>,
}

/// One bidirectional GRU layer.
#[derive(Debug, Clone)]
pub struct BiGruLayer {
    forward_cell: GruCell,
    backward_cell: GruCell,
    hidden_size: usize,
}

/// Sequence cache for one bidirectional layer.
#[derive(Debug, Clone)]
pub struct BiGruCache {
    forward: DirectionCache,
    backward: DirectionCache,
}

impl BiGruLayer {
    /// Creates a layer with independent forward and backward cells.
    #[must_use]
    pub fn with_seed(input_size: usize, hidden_size: usize, seed: u64) -> Self {
        Self {
            forward_cell: GruCell::with_seed(input_size, hidden_size, seed),
            backward_cell: GruCell::with_seed(input_size, hidden_size, seed.wrapping_add(1)),
            hidden_size,
        }
    }

    /// Output width (`2h`).
    #[must_use]
    pub fn output_size(&self) -> usize {
        2 * self.hidden_size
    }

    /// Run the layer over a `(T, in)` sequence, producing `(T, 2h)`.
    #[must_use]
    pub fn forward(&self, sequence: &Array2<f32>) -> (Array2<f32>, BiGruCache) {
        let steps = sequence.nrows();
        let h = self.hidden_size;
        let mut output = Array2::<f32>::zeros((steps, 2 * h));

        let mut forward_steps = Vec::with_capacity(steps);
        let mut hidden = Array1::<f32>::zeros(h);
        for t in 0..steps {
            let (next, cache) = self.forward_cell.forward_step(sequence.row(t), hidden.view());
            output.slice_mut(s![t, 0..h]).assign(&next);
            forward_steps.push(cache);
            hidden = next;
        }

        let mut backward_steps = Vec::with_capacity(steps);
        let mut hidden = Array1::<f32>::zeros(h);
        for t in (0..steps).rev() {
            let (next, cache) = self
                .backward_cell
                .forward_step(sequence.row(t), hidden.view());
            output.slice_mut(s![t, h..2 * h]).assign(&next);
            backward_steps.push(cache);
            hidden = next;
        }
        // `backward_steps[k]` corresponds to time `steps - 1 - k`.

        (
            output,
            BiGruCache {
                forward: DirectionCache {
                    steps: forward_steps,
                },
                backward: DirectionCache {
                    steps: backward_steps,
                },
            },
        )
    }

    /// Backpropagate `(T, 2h)` output gradients; returns `(T, in)` input
    /// gradients. The initial hidden states are constants, so their
    /// gradients are dropped.
    #[must_use]
    pub fn backward(&mut self, cache: &BiGruCache, grad_output: &Array2<f32>) -> Array2<f32> {
        let steps = grad_output.nrows();
        let h = self.hidden_size;
        let input_size = cache.forward.steps[0].x.len();
        let mut grad_input = Array2::<f32>::zeros((steps, input_size));

        // Forward direction: walk time backwards.
        let mut carry = Array1::<f32>::zeros(h);
        for t in (0..steps).rev() {
            let dh = &grad_output.slice(s![t, 0..h]).to_owned() + &carry;
            let (dx, dh_prev) = self
                .forward_cell
                .backward_step(&cache.forward.steps[t], dh.view());
            grad_input.row_mut(t).assign(&dx);
            carry = dh_prev;
        }

        // Backward direction: its "previous" step is the next time index.
        let mut carry = Array1::<f32>::zeros(h);
        for (k, step_cache) in cache.backward.steps.iter().enumerate().rev() {
            let t = steps - 1 - k;
            let dh = &grad_output.slice(s![t, h..2 * h]).to_owned() + &carry;
            let (dx, dh_prev) = self.backward_cell.backward_step(step_cache, dh.view());
            {
                let mut row = grad_input.row_mut(t);
                row += &dx;
            }
            carry = dh_prev;
        }

        grad_input
    }

    /// Zero gradient buffers in both cells.
    pub fn zero_grad(&mut self) {
        self.forward_cell.zero_grad();
        self.backward_cell.zero_grad();
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.forward_cell.param_count() + self.backward_cell.param_count()
    }

    /// Push parameters (forward cell, then backward cell).
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        self.forward_cell.flatten_into(out);
        self.backward_cell.flatten_into(out);
    }

    /// Push gradients in the same layout.
    pub fn flatten_grads_into(&self, out: &mut Vec<f32>) {
        self.forward_cell.flatten_grads_into(out);
        self.backward_cell.flatten_grads_into(out);
    }

    /// Restore parameters; returns floats consumed.
    pub fn unflatten_from(&mut self, data: &[f32]) -> usize {
        let mut offset = self.forward_cell.unflatten_from(data);
        offset += self.backward_cell.unflatten_from(&data[offset..]);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_sequence(steps: usize, width: usize, seed: u64) -> Array2<f32> {
        let mut rng = Xorshift64::new(seed);
        Array2::from_shape_fn((steps, width), |_| rng.next_gaussian() * 0.5)
    }

    #[test]
    fn forward_step_shapes_and_bounds() {
        let cell = GruCell::with_seed(4, 3, 1);
        let x = Array1::from_vec(vec![0.1, -0.2, 0.3, 0.4]);
        let h0 = Array1::zeros(3);
        let (h1, _) = cell.forward_step(x.view(), h0.view());
        assert_eq!(h1.len(), 3);
        // With zero initial state, |h| is bounded by |n| ≤ 1.
        assert!(h1.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn cell_gradients_match_central_differences() {
        let mut cell = GruCell::with_seed(3, 2, 9);
        let x = Array1::from_vec(vec![0.4, -0.6, 0.2]);
        let h_prev = Array1::from_vec(vec![0.1, -0.3]);

        // Loss = sum(h_new).
        let (_, cache) = cell.forward_step(x.view(), h_prev.view());
        cell.zero_grad();
        let dh = Array1::ones(2);
        let (dx, dh_prev) = cell.backward_step(&cache, dh.view());

        let loss = |cell: &GruCell, x: &Array1<f32>, h: &Array1<f32>| {
            cell.forward_step(x.view(), h.view()).0.sum()
        };

        let eps = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus[i] += eps;
            let mut minus = x.clone();
            minus[i] -= eps;
            let numeric = (loss(&cell, &plus, &h_prev) - loss(&cell, &minus, &h_prev)) / (2.0 * eps);
            assert!(
                (dx[i] - numeric).abs() < 1e-3,
                "dx[{i}]: {} vs {numeric}",
                dx[i]
            );
        }
        for i in 0..2 {
            let mut plus = h_prev.clone();
            plus[i] += eps;
            let mut minus = h_prev.clone();
            minus[i] -= eps;
            let numeric = (loss(&cell, &x, &plus) - loss(&cell, &x, &minus)) / (2.0 * eps);
            assert!(
                (dh_prev[i] - numeric).abs() < 1e-3,
                "dh_prev[{i}]: {} vs {numeric}",
                dh_prev[i]
            );
        }

        // Parameter gradients against central differences.
        let mut flat = Vec::new();
        cell.flatten_into(&mut flat);
        let mut grads = Vec::new();
        cell.flatten_grads_into(&mut grads);
        let mut probe = cell.clone();
        for &index in &[0usize, 7, flat.len() - 1] {
            let mut plus = flat.clone();
            plus[index] += eps;
            probe.unflatten_from(&plus);
            let loss_plus = loss(&probe, &x, &h_prev);
            let mut minus = flat.clone();
            minus[index] -= eps;
            probe.unflatten_from(&minus);
            let loss_minus = loss(&probe, &x, &h_prev);
            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            assert!(
                (grads[index] - numeric).abs() < 1e-3,
                "param {index}: {} vs {numeric}",
                grads[index]
            );
        }
    }

    #[test]
    fn bilayer_output_shape() {
        let layer = BiGruLayer::with_seed(4, 3, 11);
        let sequence = small_sequence(10, 4, 2);
        let (output, _) = layer.forward(&sequence);
        assert_eq!(output.dim(), (10, 6));
    }

    #[test]
    fn bilayer_sequence_gradient_matches_central_difference() {
        let mut layer = BiGruLayer::with_seed(3, 2, 21);
        let sequence = small_sequence(5, 3, 4);

        let (output, cache) = layer.forward(&sequence);
        layer.zero_grad();
        let grad_output = Array2::ones(output.dim());
        let grad_input = layer.backward(&cache, &grad_output);

        let loss = |layer: &BiGruLayer, seq: &Array2<f32>| layer.forward(seq).0.sum();
        let eps = 1e-3;
        for &(t, i) in &[(0usize, 0usize), (2, 1), (4, 2)] {
            let mut plus = sequence.clone();
            plus[[t, i]] += eps;
            let mut minus = sequence.clone();
            minus[[t, i]] -= eps;
            let numeric = (loss(&layer, &plus) - loss(&layer, &minus)) / (2.0 * eps);
            assert!(
                (grad_input[[t, i]] - numeric).abs() < 2e-3,
                "dseq[{t},{i}]: {} vs {numeric}",
                grad_input[[t, i]]
            );
        }
    }

    #[test]
    fn bilayer_param_gradients_match_central_difference() {
        let mut layer = BiGruLayer::with_seed(2, 2, 31);
        let sequence = small_sequence(4, 2, 6);
        let (output, cache) = layer.forward(&sequence);
        layer.zero_grad();
        let _ = layer.backward(&cache, &Array2::ones(output.dim()));

        let mut flat = Vec::new();
        layer.flatten_into(&mut flat);
        let mut grads = Vec::new();
        layer.flatten_grads_into(&mut grads);

        let loss = |layer: &BiGruLayer, seq: &Array2<f32>| layer.forward(seq).0.sum();
        let eps = 1e-3;
        let mut probe = layer.clone();
        // A few parameters across both cells.
        for &index in &[0usize, 13, flat.len() / 2 + 3, flat.len() - 1] {
            let mut plus = flat.clone();
            plus[index] += eps;
            probe.unflatten_from(&plus);
            let loss_plus = loss(&probe, &sequence);
            let mut minus = flat.clone();
            minus[index] -= eps;
            probe.unflatten_from(&minus);
            let loss_minus = loss(&probe, &sequence);
            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            assert!(
                (grads[index] - numeric).abs() < 2e-3,
                "param {index}: {} vs {numeric}",
                grads[index]
            );
        }
    }

    #[test]
    fn flatten_round_trip_preserves_forward() {
        let layer = BiGruLayer::with_seed(3, 4, 5);
        let mut flat = Vec::new();
        layer.flatten_into(&mut flat);
        assert_eq!(flat.len(), layer.param_count());

        let mut restored = BiGruLayer::with_seed(3, 4, 999);
        let consumed = restored.unflatten_from(&flat);
        assert_eq!(consumed, flat.len());

        let sequence = small_sequence(6, 3, 8);
        let (a, _) = layer.forward(&sequence);
        let (b, _) = restored.forward(&sequence);
        assert_eq!(a, b);
    }
}
