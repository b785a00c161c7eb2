//! A module for differentiable models whose weights are given as a [`ParamTree`].
//!
//! The Laplace machinery only needs two differentiation primitives from a model,
//! evaluated at a single input point:
//! * a Jacobian-vector product (forward mode): `v ↦ J(x) v` with `J(x) = ∂f(x, θ)/∂θ`,
//! * a vector-Jacobian product (reverse mode): `u ↦ J(x)ᵀ u`.
//!
//! A fully connected [`Mlp`] with hand-written products is provided.

use crate::errors::{LaplaceError, Result};
use crate::param_tree::{ParamLayout, ParamTree};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2, IxDyn};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use std::fmt;
use std::marker::PhantomData;

/// A trait for models `f(x, θ)` differentiable with respect to their parameters `θ`
pub trait DifferentiableModel<F: Float>: Sync {
    /// Dimension of one input point
    fn input_dim(&self) -> usize;

    /// Dimension of the output at one input point
    fn output_dim(&self) -> usize;

    /// Layout of the parameters the model expects
    fn param_layout(&self) -> ParamLayout;

    /// Compute `f(x, θ)` at a single point `x` of shape (input_dim,)
    fn forward(&self, params: &ParamTree<F>, x: &ArrayView1<F>) -> Result<Array1<F>>;

    /// Compute both `f(x, θ)` and the Jacobian-vector product `J(x) v`
    /// where the `tangent` v has the parameters layout.
    fn jvp(
        &self,
        params: &ParamTree<F>,
        x: &ArrayView1<F>,
        tangent: &ParamTree<F>,
    ) -> Result<(Array1<F>, Array1<F>)>;

    /// Compute the vector-Jacobian product `J(x)ᵀ u` for an output `cotangent` u
    /// of shape (output_dim,). The result has the parameters layout.
    fn vjp(
        &self,
        params: &ParamTree<F>,
        x: &ArrayView1<F>,
        cotangent: &ArrayView1<F>,
    ) -> Result<ParamTree<F>>;

    /// Predict outputs at n points given as a (n, input_dim) matrix.
    /// Returns a (n, output_dim) matrix.
    fn predict(
        &self,
        params: &ParamTree<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>>
    where
        Self: Sized,
    {
        let mut y = Array2::zeros((x.nrows(), self.output_dim()));
        for (mut yi, xi) in y.rows_mut().into_iter().zip(x.rows()) {
            yi.assign(&self.forward(params, &xi)?);
        }
        Ok(y)
    }
}

/// Multi-layer perceptron with tanh hidden activations and a linear output layer.
///
/// Parameters of the i-th layer are stored under `layer_i` as a `weight`
/// array of shape (out, in) and a `bias` array of shape (out,).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mlp<F: Float> {
    sizes: Vec<usize>,
    phantom: PhantomData<F>,
}

impl<F: Float> fmt::Display for Mlp<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sizes: Vec<String> = self.sizes.iter().map(|s| s.to_string()).collect();
        write!(f, "Mlp({})", sizes.join("→"))
    }
}

impl<F: Float> Mlp<F> {
    /// Build an MLP from layer sizes `[in, hidden_1, ..., out]`
    pub fn new(sizes: &[usize]) -> Result<Self> {
        if sizes.len() < 2 || sizes.iter().any(|&s| s == 0) {
            return Err(LaplaceError::InvalidValueError(format!(
                "MLP sizes should hold at least input and output non zero dimensions, got {sizes:?}"
            )));
        }
        Ok(Mlp {
            sizes: sizes.to_vec(),
            phantom: PhantomData,
        })
    }

    /// Number of affine layers
    pub fn n_layers(&self) -> usize {
        self.sizes.len() - 1
    }

    fn layer_name(i: usize) -> String {
        format!("layer_{i}")
    }

    /// Randomly initialized parameters: weights drawn from `N(0, 1/fan_in)`, zero biases
    pub fn init_params<R: Rng>(&self, rng: &mut R) -> ParamTree<F> {
        let mut tree = ParamTree::new();
        for (i, w) in self.sizes.windows(2).enumerate() {
            let (fan_in, fan_out) = (w[0], w[1]);
            let scale = (1. / fan_in as f64).sqrt();
            let weight = Array2::<f64>::random_using((fan_out, fan_in), StandardNormal, rng)
                .mapv(|v| F::cast(v * scale));
            let layer = ParamTree::new()
                .with_leaf("weight", weight.into_dyn())
                .with_leaf("bias", Array1::<F>::zeros(fan_out).into_dyn());
            tree = tree.with_subtree(&Self::layer_name(i), layer);
        }
        tree
    }

    fn layer<'a>(
        &self,
        params: &'a ParamTree<F>,
        i: usize,
    ) -> Result<(ArrayView2<'a, F>, ArrayView1<'a, F>)> {
        let name = Self::layer_name(i);
        let weight = params
            .leaf(&format!("{name}.weight"))?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| LaplaceError::LayoutMismatch(format!("{name}.weight: {e}")))?;
        let bias = params
            .leaf(&format!("{name}.bias"))?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| LaplaceError::LayoutMismatch(format!("{name}.bias: {e}")))?;
        if weight.dim() != (self.sizes[i + 1], self.sizes[i]) || bias.len() != self.sizes[i + 1] {
            return Err(LaplaceError::LayoutMismatch(format!(
                "{name} expected weight {:?} and bias ({},), got {:?} and ({},)",
                (self.sizes[i + 1], self.sizes[i]),
                self.sizes[i + 1],
                weight.dim(),
                bias.len()
            )));
        }
        Ok((weight, bias))
    }

    fn check_input(&self, x: &ArrayView1<F>) -> Result<()> {
        if x.len() != self.sizes[0] {
            return Err(LaplaceError::ShapeMismatch(format!(
                "MLP input should have {} components, got {}",
                self.sizes[0],
                x.len()
            )));
        }
        Ok(())
    }

    fn is_hidden(&self, i: usize) -> bool {
        i + 1 < self.n_layers()
    }
}

fn tanh_prime<F: Float>(a: F) -> F {
    F::one() - a * a
}

impl<F: Float> DifferentiableModel<F> for Mlp<F> {
    fn input_dim(&self) -> usize {
        self.sizes[0]
    }

    fn output_dim(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    fn param_layout(&self) -> ParamLayout {
        let mut tree = ParamTree::<F>::new();
        for (i, w) in self.sizes.windows(2).enumerate() {
            let layer = ParamTree::new()
                .with_leaf("weight", ndarray::ArrayD::zeros(IxDyn(&[w[1], w[0]])))
                .with_leaf("bias", ndarray::ArrayD::zeros(IxDyn(&[w[1]])));
            tree = tree.with_subtree(&Self::layer_name(i), layer);
        }
        tree.layout()
    }

    fn forward(&self, params: &ParamTree<F>, x: &ArrayView1<F>) -> Result<Array1<F>> {
        self.check_input(x)?;
        let mut a = x.to_owned();
        for i in 0..self.n_layers() {
            let (w, b) = self.layer(params, i)?;
            let z = w.dot(&a) + b;
            a = if self.is_hidden(i) { z.mapv(|v| v.tanh()) } else { z };
        }
        Ok(a)
    }

    fn jvp(
        &self,
        params: &ParamTree<F>,
        x: &ArrayView1<F>,
        tangent: &ParamTree<F>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        self.check_input(x)?;
        let mut a = x.to_owned();
        let mut da = Array1::zeros(a.len());
        for i in 0..self.n_layers() {
            let (w, b) = self.layer(params, i)?;
            let (dw, db) = self.layer(tangent, i)?;
            let z = w.dot(&a) + b;
            let dz = dw.dot(&a) + w.dot(&da) + db;
            if self.is_hidden(i) {
                a = z.mapv(|v| v.tanh());
                da = dz * a.mapv(tanh_prime);
            } else {
                a = z;
                da = dz;
            }
        }
        Ok((a, da))
    }

    fn vjp(
        &self,
        params: &ParamTree<F>,
        x: &ArrayView1<F>,
        cotangent: &ArrayView1<F>,
    ) -> Result<ParamTree<F>> {
        self.check_input(x)?;
        if cotangent.len() != self.output_dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "cotangent should have {} components, got {}",
                self.output_dim(),
                cotangent.len()
            )));
        }
        // Forward pass keeping every layer input
        let mut activations = vec![x.to_owned()];
        for i in 0..self.n_layers() {
            let (w, b) = self.layer(params, i)?;
            let z = w.dot(&activations[i]) + b;
            activations.push(if self.is_hidden(i) { z.mapv(|v| v.tanh()) } else { z });
        }

        let mut grads = Vec::with_capacity(self.n_layers());
        let mut g = cotangent.to_owned();
        for i in (0..self.n_layers()).rev() {
            let (w, _) = self.layer(params, i)?;
            let a_in = &activations[i];
            let gw = g
                .view()
                .insert_axis(Axis(1))
                .dot(&a_in.view().insert_axis(Axis(0)));
            grads.push((gw, g.to_owned()));
            if i > 0 {
                g = w.t().dot(&g) * a_in.mapv(tanh_prime);
            }
        }

        let mut tree = ParamTree::new();
        for (i, (gw, gb)) in grads.into_iter().rev().enumerate() {
            let layer = ParamTree::new()
                .with_leaf("weight", gw.into_dyn())
                .with_leaf("bias", gb.into_dyn());
            tree = tree.with_subtree(&Self::layer_name(i), layer);
        }
        Ok(tree)
    }
}
