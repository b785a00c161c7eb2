//! Structured parameter trees and their flat layout.
//!
//! A [`ParamTree`] is an ordered, possibly nested record of named arrays holding
//! all trainable weights of a model. Its [`ParamLayout`] is derived from the tree
//! itself and gives the fixed, invertible mapping between the tree and a single
//! flat vector of length `P`, the total number of parameters.
//!
//! Leaves are addressed by dotted paths such as `"layer_0.weight"`, names must
//! therefore not contain any dot. Empty subtrees carry no parameter and are not kept.
use crate::errors::{LaplaceError, Result};
use linfa::Float;
use ndarray::{s, Array1, ArrayBase, ArrayD, Data, Ix1, IxDyn};
use std::ops::Range;

/// A node of a parameter tree: either an array leaf or a nested tree
#[derive(Clone, Debug, PartialEq)]
pub enum ParamNode<F: Float> {
    /// Array of parameters
    Leaf(ArrayD<F>),
    /// Named sub-collection of parameters
    Tree(ParamTree<F>),
}

/// An ordered tree of named parameter arrays
#[derive(Clone, Debug, PartialEq)]
pub struct ParamTree<F: Float> {
    children: Vec<(String, ParamNode<F>)>,
}

impl<F: Float> Default for ParamTree<F> {
    fn default() -> Self {
        ParamTree {
            children: Vec::new(),
        }
    }
}

impl<F: Float> ParamTree<F> {
    /// Empty tree constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a leaf array under the given `name`
    pub fn with_leaf(mut self, name: &str, value: ArrayD<F>) -> Self {
        self.insert(name, ParamNode::Leaf(value));
        self
    }

    /// Add (or replace) a subtree under the given `name`
    pub fn with_subtree(mut self, name: &str, tree: ParamTree<F>) -> Self {
        self.insert(name, ParamNode::Tree(tree));
        self
    }

    /// Insert a node, replacing an existing node with the same name in place
    pub fn insert(&mut self, name: &str, node: ParamNode<F>) {
        debug_assert!(!name.contains('.'), "parameter names cannot contain '.'");
        if let ParamNode::Tree(ref t) = node {
            if t.is_empty() {
                return;
            }
        }
        match self.children.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = node,
            None => self.children.push((name.to_string(), node)),
        }
    }

    /// Whether the tree has no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Direct children of the tree in insertion order
    pub fn children(&self) -> impl Iterator<Item = (&str, &ParamNode<F>)> {
        self.children.iter().map(|(n, node)| (n.as_str(), node))
    }

    /// Get the leaf array at the given dotted `path` if any
    pub fn get(&self, path: &str) -> Option<&ArrayD<F>> {
        let mut current = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let (_, node) = current.children.iter().find(|(n, _)| n == part)?;
            match (node, parts.peek()) {
                (ParamNode::Leaf(arr), None) => return Some(arr),
                (ParamNode::Tree(sub), Some(_)) => current = sub,
                _ => return None,
            }
        }
        None
    }

    /// Get the leaf array at the given dotted `path` or fail with a layout mismatch
    pub fn leaf(&self, path: &str) -> Result<&ArrayD<F>> {
        self.get(path)
            .ok_or_else(|| LaplaceError::LayoutMismatch(format!("no parameter found at `{path}`")))
    }

    /// Leaves with their dotted paths in depth-first order (i.e. flattening order)
    pub fn leaves(&self) -> Vec<(String, &ArrayD<F>)> {
        let mut acc = Vec::new();
        self.collect_leaves("", &mut acc);
        acc
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, acc: &mut Vec<(String, &'a ArrayD<F>)>) {
        for (name, node) in self.children.iter() {
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            };
            match node {
                ParamNode::Leaf(arr) => acc.push((path, arr)),
                ParamNode::Tree(sub) => sub.collect_leaves(&path, acc),
            }
        }
    }

    /// Total number of scalar parameters
    pub fn size(&self) -> usize {
        self.leaves().iter().map(|(_, arr)| arr.len()).sum()
    }

    /// Flat layout of the tree
    pub fn layout(&self) -> ParamLayout {
        let mut offset = 0;
        let leaves = self
            .leaves()
            .into_iter()
            .map(|(path, arr)| {
                let spec = LeafSpec {
                    path,
                    shape: arr.shape().to_vec(),
                    offset,
                };
                offset += arr.len();
                spec
            })
            .collect();
        ParamLayout {
            leaves,
            size: offset,
        }
    }

    /// Concatenate all leaves (row-major) into a single vector of length `P`
    pub fn flatten(&self) -> Array1<F> {
        let mut flat = Vec::with_capacity(self.size());
        for (_, arr) in self.leaves() {
            flat.extend(arr.iter().cloned());
        }
        Array1::from_vec(flat)
    }

    /// Apply `f` to every scalar parameter
    pub fn map(&self, f: impl Fn(F) -> F + Copy) -> ParamTree<F> {
        ParamTree {
            children: self
                .children
                .iter()
                .map(|(n, node)| {
                    let mapped = match node {
                        ParamNode::Leaf(arr) => ParamNode::Leaf(arr.mapv(f)),
                        ParamNode::Tree(sub) => ParamNode::Tree(sub.map(f)),
                    };
                    (n.to_string(), mapped)
                })
                .collect(),
        }
    }

    /// A tree with the same structure filled with zeros
    pub fn zeros_like(&self) -> ParamTree<F> {
        self.map(|_| F::zero())
    }

    /// Multiply every parameter by `alpha`
    pub fn scaled(&self, alpha: F) -> ParamTree<F> {
        self.map(|v| v * alpha)
    }

    /// Elementwise sum of two trees sharing the same layout
    pub fn add(&self, other: &ParamTree<F>) -> Result<ParamTree<F>> {
        let layout = self.layout();
        layout.check(other)?;
        layout.unflatten(&(self.flatten() + other.flatten()))
    }

    /// Sum of the tree with a flat vector expressed in the tree layout
    pub fn add_flat(&self, delta: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<ParamTree<F>> {
        let layout = self.layout();
        if delta.len() != layout.size() {
            return Err(LaplaceError::LayoutMismatch(format!(
                "flat vector of length {} cannot be added to {} parameters",
                delta.len(),
                layout.size()
            )));
        }
        layout.unflatten(&(self.flatten() + delta))
    }

    fn insert_path(&mut self, path: &[&str], value: ArrayD<F>) {
        match path {
            [] => (),
            [name] => self.insert(name, ParamNode::Leaf(value)),
            [name, rest @ ..] => {
                let idx = match self
                    .children
                    .iter()
                    .position(|(n, node)| n == name && matches!(node, ParamNode::Tree(_)))
                {
                    Some(idx) => idx,
                    None => {
                        self.children
                            .push((name.to_string(), ParamNode::Tree(ParamTree::new())));
                        self.children.len() - 1
                    }
                };
                if let ParamNode::Tree(sub) = &mut self.children[idx].1 {
                    sub.insert_path(rest, value);
                }
            }
        }
    }
}

/// Location of one leaf inside the flat parameter vector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafSpec {
    /// Dotted path of the leaf
    pub path: String,
    /// Shape of the leaf array
    pub shape: Vec<usize>,
    /// Offset of the first leaf element in the flat vector
    pub offset: usize,
}

impl LeafSpec {
    /// Number of scalar parameters of the leaf
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the leaf holds no parameter
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index range of the leaf in the flat vector
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }

    /// Name of the top-level layer the leaf belongs to
    pub fn layer(&self) -> &str {
        self.path.split('.').next().unwrap_or(&self.path)
    }
}

/// Fixed flat layout of a parameter tree: ordered leaves with shapes and offsets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamLayout {
    leaves: Vec<LeafSpec>,
    size: usize,
}

impl ParamLayout {
    /// Total number of parameters `P`
    pub fn size(&self) -> usize {
        self.size
    }

    /// Leaf specifications in flattening order
    pub fn leaves(&self) -> &[LeafSpec] {
        &self.leaves
    }

    /// Leaf specification at the given dotted path
    pub fn leaf(&self, path: &str) -> Option<&LeafSpec> {
        self.leaves.iter().find(|l| l.path == path)
    }

    /// Names of top-level layers in flattening order
    pub fn layers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for leaf in self.leaves.iter() {
            let layer = leaf.layer();
            if names.last() != Some(&layer) {
                names.push(layer);
            }
        }
        names
    }

    /// Index range covered by the given top-level layer in the flat vector
    pub fn layer_range(&self, layer: &str) -> Option<Range<usize>> {
        let mut matching = self.leaves.iter().filter(|l| l.layer() == layer);
        let first = matching.next()?;
        let last = matching.last().unwrap_or(first);
        Some(first.offset..last.offset + last.len())
    }

    /// Check that the given tree has exactly this layout
    pub fn check<F: Float>(&self, tree: &ParamTree<F>) -> Result<()> {
        let other = tree.layout();
        if &other != self {
            return Err(LaplaceError::LayoutMismatch(format!(
                "expected {} parameters in {} arrays, got {} parameters in {} arrays",
                self.size,
                self.leaves.len(),
                other.size,
                other.leaves.len()
            )));
        }
        Ok(())
    }

    /// Rebuild a parameter tree from a flat vector of length `P`
    pub fn unflatten<F: Float>(
        &self,
        flat: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<ParamTree<F>> {
        if flat.len() != self.size {
            return Err(LaplaceError::LayoutMismatch(format!(
                "flat vector of length {} does not match layout size {}",
                flat.len(),
                self.size
            )));
        }
        let mut tree = ParamTree::new();
        for leaf in self.leaves.iter() {
            let values = flat
                .slice(s![leaf.range()])
                .to_owned()
                .into_shape_with_order(IxDyn(&leaf.shape))
                .map_err(|e| LaplaceError::LayoutMismatch(format!("leaf `{}`: {e}", leaf.path)))?;
            let path: Vec<&str> = leaf.path.split('.').collect();
            tree.insert_path(&path, values);
        }
        Ok(tree)
    }

    /// A zero-filled tree with this layout
    pub fn zeros<F: Float>(&self) -> ParamTree<F> {
        let mut tree = ParamTree::new();
        for leaf in self.leaves.iter() {
            let path: Vec<&str> = leaf.path.split('.').collect();
            tree.insert_path(&path, ArrayD::zeros(IxDyn(&leaf.shape)));
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn nested_tree() -> ParamTree<f64> {
        let encoder = ParamTree::new()
            .with_leaf("weight", array![[1., 2., 3.], [4., 5., 6.]].into_dyn())
            .with_leaf("bias", array![0.5, -0.5].into_dyn());
        let head = ParamTree::new()
            .with_subtree(
                "inner",
                ParamTree::new().with_leaf("scale", Array::from_elem(IxDyn(&[2, 2, 1]), 7.)),
            )
            .with_leaf("offset", array![9.].into_dyn());
        ParamTree::new()
            .with_subtree("encoder", encoder)
            .with_subtree("head", head)
            .with_leaf("temperature", Array::from_elem(IxDyn(&[]), 0.1))
    }

    #[test]
    fn test_flatten_unflatten_roundtrip() {
        let tree = nested_tree();
        let layout = tree.layout();
        assert_eq!(layout.size(), 6 + 2 + 4 + 1 + 1);
        let flat = tree.flatten();
        assert_eq!(flat.len(), layout.size());
        assert_abs_diff_eq!(flat.slice(s![0..8]), array![1., 2., 3., 4., 5., 6., 0.5, -0.5]);

        let rebuilt = layout.unflatten(&flat).expect("unflatten");
        assert_eq!(rebuilt, tree);
        assert_eq!(rebuilt.layout(), layout);
    }

    #[test]
    fn test_unflatten_wrong_length() {
        let layout = nested_tree().layout();
        let res = layout.unflatten(&Array1::<f64>::zeros(layout.size() + 1));
        assert!(matches!(res, Err(LaplaceError::LayoutMismatch(_))));
    }

    #[test]
    fn test_get_by_path() {
        let tree = nested_tree();
        assert_eq!(tree.get("encoder.bias"), Some(&array![0.5, -0.5].into_dyn()));
        assert_eq!(tree.get("head.inner.scale").map(|a| a.shape()), Some(&[2, 2, 1][..]));
        assert!(tree.get("encoder").is_none());
        assert!(tree.get("encoder.bias.more").is_none());
        assert!(matches!(tree.leaf("decoder.weight"), Err(LaplaceError::LayoutMismatch(_))));
    }

    #[test]
    fn test_vector_space_operations() {
        let tree = nested_tree();
        let doubled = tree.add(&tree).expect("same layout");
        assert_abs_diff_eq!(doubled.flatten(), tree.scaled(2.).flatten());

        let delta = Array1::from_elem(tree.size(), 1.);
        let shifted = tree.add_flat(&delta).expect("same size");
        assert_abs_diff_eq!(shifted.flatten(), tree.flatten() + 1.);
        assert_abs_diff_eq!(tree.zeros_like().flatten(), Array1::<f64>::zeros(tree.size()));

        let other = ParamTree::new().with_leaf("w", array![1.].into_dyn());
        assert!(matches!(tree.add(&other), Err(LaplaceError::LayoutMismatch(_))));
    }

    #[test]
    fn test_layers() {
        let layout = nested_tree().layout();
        assert_eq!(layout.layers(), vec!["encoder", "head", "temperature"]);
        assert_eq!(layout.layer_range("encoder"), Some(0..8));
        assert_eq!(layout.layer_range("head"), Some(8..13));
        assert_eq!(layout.layer_range("temperature"), Some(13..14));
        assert_eq!(layout.layer_range("decoder"), None);
        assert_eq!(layout.zeros::<f64>().layout(), layout);
    }

    #[test]
    fn test_empty_subtree_is_ignored() {
        let tree = ParamTree::<f64>::new().with_subtree("nothing", ParamTree::new());
        assert!(tree.is_empty());
        assert_eq!(tree.size(), 0);
    }
}
