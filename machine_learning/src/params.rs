use std::collections::{BTreeMap, btree_map};

use ndarray::{ArrayD, IxDyn};

use crate::{MlErr, Result};

/// A named set of tensors, ordered by name.
///
/// Used for the live parameters of a model, its EMA shadow, its gradients and the optimizer
/// moments. Every set derived from another one through `zeros_like` shares its key set, which is
/// what lets two sets be walked side by side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParamSet {
    /// Creates a new empty `ParamSet`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor, replacing any previous one under `name`.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    /// Returns the tensor under `name` or an error naming the missing key.
    pub fn require(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.get(name).ok_or_else(|| MlErr::ParamKeyMismatch {
            name: name.to_string(),
        })
    }

    /// Returns the mutable tensor under `name` or an error naming the missing key.
    pub fn require_mut(&mut self, name: &str) -> Result<&mut ArrayD<f32>> {
        self.get_mut(name).ok_or_else(|| MlErr::ParamKeyMismatch {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, ArrayD<f32>> {
        self.tensors.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total amount of scalars across every tensor.
    pub fn numel(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// Returns a set with the same keys and shapes filled with zeros.
    pub fn zeros_like(&self) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, t)| (name.clone(), ArrayD::zeros(t.raw_dim())))
            .collect();

        Self { tensors }
    }

    /// Finds the first key present in only one of both sets.
    ///
    /// # Returns
    /// `Ok(())` if both sets have the same key set.
    pub fn check_same_keys(&self, other: &ParamSet) -> Result<()> {
        let missing = self
            .names()
            .find(|name| other.get(name).is_none())
            .or_else(|| other.names().find(|name| self.get(name).is_none()));

        match missing {
            Some(name) => Err(MlErr::ParamKeyMismatch {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn fill(&mut self, value: f32) {
        for t in self.tensors.values_mut() {
            t.fill(value);
        }
    }

    /// Multiplies every scalar by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for t in self.tensors.values_mut() {
            t.mapv_inplace(|x| x * factor);
        }
    }

    /// Returns whether every scalar is neither inf nor NaN.
    pub fn all_finite(&self) -> bool {
        self.tensors
            .values()
            .all(|t| t.iter().all(|x| x.is_finite()))
    }

    /// Writes every scalar into `buf` in key order, replacing its previous contents.
    pub fn flatten_into(&self, buf: &mut Vec<f32>) {
        buf.clear();
        buf.reserve(self.numel());

        for t in self.tensors.values() {
            buf.extend(t.iter().copied());
        }
    }

    /// Overwrites every scalar from a flat buffer laid out as in `flatten_into`.
    ///
    /// # Errors
    /// Returns a `SizeMismatch` if `flat` doesn't hold exactly `numel` values.
    pub fn assign_flat(&mut self, flat: &[f32]) -> Result<()> {
        let expected = self.numel();
        if flat.len() != expected {
            return Err(MlErr::SizeMismatch {
                a: "flat buffer",
                b: "parameter set",
                got: flat.len(),
                expected,
            });
        }

        let mut offset = 0;
        for t in self.tensors.values_mut() {
            let n = t.len();
            t.iter_mut()
                .zip(&flat[offset..offset + n])
                .for_each(|(dst, &src)| *dst = src);
            offset += n;
        }

        Ok(())
    }

    /// Builds a tensor from a shape and its row-major values.
    pub fn tensor(shape: &[usize], values: Vec<f32>) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ParamSet {
    type Item = (&'a String, &'a ArrayD<f32>);
    type IntoIter = btree_map::Iter<'a, String, ArrayD<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
