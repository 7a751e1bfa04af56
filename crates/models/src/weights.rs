//! Flat per-variable weight storage shared by every tower of a step.

use crate::variable::{Init, VariableId, VariableSpec, VariableValues};
use crate::ModelError;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Variable id -> flattened tensor. Shapes live alongside and are applied by the model.
#[derive(Debug, Clone)]
pub struct WeightSet<B: Backend> {
    tensors: BTreeMap<VariableId, (Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> Default for WeightSet<B> {
    fn default() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }
}

impl<B: Backend> WeightSet<B> {
    /// Fresh initialization of every variable in `specs`.
    pub fn initialize(specs: &[VariableSpec], seed: u64, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self::default();
        for spec in specs {
            let values = match spec.init {
                Init::Zeros => vec![0.0; spec.numel()],
                Init::Xavier => {
                    let fan_in = spec.shape.first().copied().unwrap_or(1);
                    let fan_out = spec.shape.get(1).copied().unwrap_or(1);
                    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                    (0..spec.numel())
                        .map(|_| rng.random_range(-limit..limit))
                        .collect()
                }
            };
            set.insert_values(spec.id.clone(), spec.shape.clone(), values, device);
        }
        set
    }

    pub(crate) fn insert(&mut self, id: VariableId, shape: Vec<usize>, tensor: Tensor<B, 1>) {
        self.tensors.insert(id, (shape, tensor));
    }

    pub fn insert_values(
        &mut self,
        id: VariableId,
        shape: Vec<usize>,
        values: Vec<f32>,
        device: &B::Device,
    ) {
        let len = values.len();
        let tensor = Tensor::<B, 1>::from_data(TensorData::new(values, [len]), device);
        self.insert(id, shape, tensor);
    }

    pub fn get(&self, id: &VariableId) -> Result<&Tensor<B, 1>, ModelError> {
        self.tensors
            .get(id)
            .map(|(_, t)| t)
            .ok_or_else(|| ModelError::MissingVariable(id.clone()))
    }

    pub fn shape(&self, id: &VariableId) -> Option<&[usize]> {
        self.tensors.get(id).map(|(shape, _)| shape.as_slice())
    }

    /// 2-D view of a stored variable; fails if the stored shape is not `[rows, cols]`.
    pub fn matrix(&self, id: &VariableId, rows: usize, cols: usize) -> Result<Tensor<B, 2>, ModelError> {
        self.expect_shape(id, &[rows, cols])?;
        Ok(self.get(id)?.clone().reshape([rows, cols]))
    }

    /// Row vector `[1, len]` ready to broadcast over a batch of rows.
    pub fn bias(&self, id: &VariableId, len: usize) -> Result<Tensor<B, 2>, ModelError> {
        self.expect_shape(id, &[len])?;
        Ok(self.get(id)?.clone().reshape([1, len]))
    }

    fn expect_shape(&self, id: &VariableId, expected: &[usize]) -> Result<(), ModelError> {
        let stored = self
            .shape(id)
            .ok_or_else(|| ModelError::MissingVariable(id.clone()))?;
        if stored != expected {
            return Err(ModelError::ShapeMismatch {
                id: id.clone(),
                expected: expected.to_vec(),
                found: stored.to_vec(),
            });
        }
        Ok(())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&VariableId, &[usize], &Tensor<B, 1>)> {
        self.tensors
            .iter()
            .map(|(id, (shape, t))| (id, shape.as_slice(), t))
    }

    /// Replace the tensor of an existing variable, keeping its shape.
    pub fn replace(&mut self, id: &VariableId, tensor: Tensor<B, 1>) -> Result<(), ModelError> {
        let slot = self
            .tensors
            .get_mut(id)
            .ok_or_else(|| ModelError::MissingVariable(id.clone()))?;
        slot.1 = tensor;
        Ok(())
    }

    /// Copy every variable to host memory.
    pub fn to_host(&self) -> Result<Vec<VariableValues>, ModelError> {
        self.tensors
            .iter()
            .map(|(id, (shape, t))| {
                let values = t
                    .clone()
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| ModelError::Tensor(format!("{id}: {e:?}")))?;
                Ok(VariableValues {
                    id: id.clone(),
                    shape: shape.clone(),
                    values,
                })
            })
            .collect()
    }
}

impl<B: AutodiffBackend> WeightSet<B> {
    /// Lift inner-backend weights onto the autodiff graph. Variables for which
    /// `track` returns true become gradient-tracked leaves, others stay constant.
    pub fn lift(
        inner: &WeightSet<B::InnerBackend>,
        mut track: impl FnMut(&VariableId) -> bool,
    ) -> Self {
        let mut set = Self::default();
        for (id, shape, tensor) in inner.iter() {
            let lifted = Tensor::<B, 1>::from_inner(tensor.clone());
            let lifted = if track(id) {
                lifted.require_grad()
            } else {
                lifted
            };
            set.insert(id.clone(), shape.to_vec(), lifted);
        }
        set
    }

    /// Gradient of every variable in `order`; `None` where the variable is
    /// absent, untracked, or not reached by the loss.
    pub fn gradients(
        &self,
        grads: &B::Gradients,
        order: &[VariableId],
    ) -> Vec<(Option<Tensor<B::InnerBackend, 1>>, VariableId)> {
        order
            .iter()
            .map(|id| {
                let grad = self.tensors.get(id).and_then(|(_, t)| t.grad(grads));
                (grad, id.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    fn specs() -> Vec<VariableSpec> {
        vec![
            VariableSpec {
                id: "enc/w".parse().unwrap(),
                shape: vec![3, 4],
                init: Init::Xavier,
            },
            VariableSpec {
                id: "enc/b".parse().unwrap(),
                shape: vec![4],
                init: Init::Zeros,
            },
        ]
    }

    #[test]
    fn initialization_is_seeded_and_bounded() {
        let device = Default::default();
        let a = WeightSet::<B>::initialize(&specs(), 5, &device).to_host().unwrap();
        let b = WeightSet::<B>::initialize(&specs(), 5, &device).to_host().unwrap();
        assert_eq!(a, b);
        let limit = (6.0f32 / 7.0).sqrt();
        let w = a.iter().find(|v| v.id.to_string() == "enc/w").unwrap();
        assert!(w.values.iter().all(|v| v.abs() <= limit));
        let bias = a.iter().find(|v| v.id.to_string() == "enc/b").unwrap();
        assert!(bias.values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn matrix_checks_stored_shape() {
        let device = Default::default();
        let set = WeightSet::<B>::initialize(&specs(), 1, &device);
        let id: VariableId = "enc/w".parse().unwrap();
        assert_eq!(set.matrix(&id, 3, 4).unwrap().dims(), [3, 4]);
        assert!(matches!(
            set.matrix(&id, 4, 3),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
