//! burn's Adam applied once per step to the averaged gradients of a `WeightSet`.

use crate::gradients::GradientSet;
use burn::module::{Module, Param, ParamId};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::{ModelError, VariableId, WeightSet};
use std::collections::BTreeMap;
use std::marker::PhantomData;

pub const ADAM_EPSILON: f32 = 1e-8;

/// Every variable of a weight set as a burn parameter, in id order.
#[derive(Module, Debug)]
pub struct WeightParams<B: Backend> {
    params: Vec<Param<Tensor<B, 1>>>,
}

/// Parameter ids are fixed per variable for the lifetime of the optimizer so
/// burn keeps one Adam state per variable across steps. Variables without a
/// gradient in a step are left untouched, state included.
pub struct Adam<B: AutodiffBackend, O> {
    optim: O,
    ids: BTreeMap<VariableId, ParamId>,
    steps: usize,
    _backend: PhantomData<B>,
}

pub fn adam<B: AutodiffBackend>() -> Adam<B, impl Optimizer<WeightParams<B>, B>> {
    let optim = AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(ADAM_EPSILON)
        .init::<B, WeightParams<B>>();
    Adam {
        optim,
        ids: BTreeMap::new(),
        steps: 0,
        _backend: PhantomData,
    }
}

impl<B: AutodiffBackend, O: Optimizer<WeightParams<B>, B>> Adam<B, O> {
    pub fn steps_taken(&self) -> usize {
        self.steps
    }

    fn param_id(&mut self, id: &VariableId) -> ParamId {
        self.ids.entry(id.clone()).or_insert_with(ParamId::new).clone()
    }

    pub fn step(
        &mut self,
        weights: &mut WeightSet<B::InnerBackend>,
        grads: &GradientSet<B::InnerBackend>,
        learning_rate: f64,
    ) -> Result<(), ModelError> {
        let mut order = Vec::new();
        let mut params = Vec::new();
        let mut registered = GradientsParams::new();
        for (id, grad) in grads.iter() {
            let param_id = self.param_id(id);
            let value = Tensor::<B, 1>::from_inner(weights.get(id)?.clone()).require_grad();
            registered.register::<B::InnerBackend, 1>(param_id.clone(), grad.clone());
            params.push(Param::initialized(param_id, value));
            order.push(id.clone());
        }

        let module = self
            .optim
            .step(learning_rate, WeightParams { params }, registered);
        for (id, param) in order.iter().zip(module.params) {
            weights.replace(id, param.val().inner())?;
        }
        self.steps += 1;
        Ok(())
    }
}
