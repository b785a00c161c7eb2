//! Implicit linear operators `v ↦ Av` over flat parameter vectors.
//!
//! Curvature and covariance matrices over weights are `P x P` where `P` is the
//! number of parameters, they are represented by their action on vectors instead
//! of being stored. Only explicit operations like [`LinearOperator::to_dense`]
//! materialize them, when `P` is small enough.
use crate::errors::{LaplaceError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix2};
use rayon::prelude::*;

/// A trait for square linear operators acting on vectors of size [`LinearOperator::dim`]
pub trait LinearOperator<F: Float>: Sync {
    /// Size of the vectors the operator acts on
    fn dim(&self) -> usize;

    /// Compute `A v`
    fn apply(&self, v: &ArrayView1<F>) -> Result<Array1<F>>;

    /// Compute `A V` column by column. When `parallel` is set, columns are
    /// processed concurrently with rayon, results are identical.
    fn apply_columns(
        &self,
        vs: &ArrayBase<impl Data<Elem = F>, Ix2>,
        parallel: bool,
    ) -> Result<Array2<F>>
    where
        Self: Sized,
    {
        if vs.nrows() != self.dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "operator of dim {} cannot be applied to vectors of size {}",
                self.dim(),
                vs.nrows()
            )));
        }
        let vs = vs.view();
        let columns: Vec<Array1<F>> = if parallel {
            (0..vs.ncols())
                .into_par_iter()
                .map(|j| self.apply(&vs.column(j)))
                .collect::<Result<_>>()?
        } else {
            (0..vs.ncols())
                .map(|j| self.apply(&vs.column(j)))
                .collect::<Result<_>>()?
        };
        let mut res = Array2::zeros((self.dim(), vs.ncols()));
        for (mut col, c) in res.columns_mut().into_iter().zip(columns.iter()) {
            col.assign(c);
        }
        Ok(res)
    }

    /// Materialize the operator as a dense `(dim, dim)` matrix by applying it
    /// to every standard basis vector.
    fn to_dense(&self, parallel: bool) -> Result<Array2<F>>
    where
        Self: Sized,
    {
        self.apply_columns(&Array2::eye(self.dim()), parallel)
    }

    /// Diagonal of the operator from its action on standard basis vectors
    fn diagonal(&self, parallel: bool) -> Result<Array1<F>>
    where
        Self: Sized,
    {
        let n = self.dim();
        let entry = |j: usize| -> Result<F> {
            let mut e = Array1::zeros(n);
            e[j] = F::one();
            Ok(self.apply(&e.view())?[j])
        };
        let diag: Vec<F> = if parallel {
            (0..n).into_par_iter().map(entry).collect::<Result<_>>()?
        } else {
            (0..n).map(entry).collect::<Result<_>>()?
        };
        Ok(Array1::from_vec(diag))
    }
}

fn check_dim<F: Float>(dim: usize, v: &ArrayView1<F>) -> Result<()> {
    if v.len() != dim {
        return Err(LaplaceError::ShapeMismatch(format!(
            "operator of dim {dim} cannot be applied to a vector of size {}",
            v.len()
        )));
    }
    Ok(())
}

/// A linear operator backed by a stored dense square matrix
#[derive(Clone, Debug, PartialEq)]
pub struct DenseOperator<F: Float> {
    matrix: Array2<F>,
}

impl<F: Float> DenseOperator<F> {
    /// Constructor from a square matrix
    pub fn new(matrix: Array2<F>) -> Result<Self> {
        if !matrix.is_square() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "dense operator should be square, got {:?}",
                matrix.dim()
            )));
        }
        Ok(DenseOperator { matrix })
    }

    /// Underlying matrix
    pub fn matrix(&self) -> &Array2<F> {
        &self.matrix
    }
}

impl<F: Float> LinearOperator<F> for DenseOperator<F> {
    fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&self, v: &ArrayView1<F>) -> Result<Array1<F>> {
        check_dim(self.dim(), v)?;
        Ok(self.matrix.dot(v))
    }
}

/// A linear operator given as a pure function `v ↦ Av`
pub struct FnOperator<F, Op>
where
    F: Float,
    Op: Fn(&ArrayView1<F>) -> Array1<F> + Sync,
{
    dim: usize,
    op: Op,
    phantom: std::marker::PhantomData<F>,
}

impl<F, Op> FnOperator<F, Op>
where
    F: Float,
    Op: Fn(&ArrayView1<F>) -> Array1<F> + Sync,
{
    /// Wrap the matrix-vector function `op` acting on vectors of size `dim`
    pub fn new(dim: usize, op: Op) -> Self {
        FnOperator {
            dim,
            op,
            phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Op> LinearOperator<F> for FnOperator<F, Op>
where
    F: Float,
    Op: Fn(&ArrayView1<F>) -> Array1<F> + Sync,
{
    fn dim(&self) -> usize {
        self.dim
    }

    fn apply(&self, v: &ArrayView1<F>) -> Result<Array1<F>> {
        check_dim(self.dim, v)?;
        let res = (self.op)(v);
        if res.len() != self.dim {
            return Err(LaplaceError::ShapeMismatch(format!(
                "operator returned a vector of size {}, expected {}",
                res.len(),
                self.dim
            )));
        }
        Ok(res)
    }
}
