//! Per-pixel reference network.
//!
//! A stack of 1×1 layers over the (optionally stereo-concatenated) input.
//! It is not a competitive architecture; it exists so the training stack can
//! run end to end with the real loss wiring: photometric reconstruction of
//! both views, edge-aware smoothness, left-right consistency, and masked
//! semantic cross-entropy.

use crate::ops::{image_loss, shift_x, smoothness};
use crate::params::{Encoder, ModelParams, Task};
use crate::variable::{Init, VariableId, VariableSpec};
use crate::weights::WeightSet;
use crate::{ModelError, ModelInputs, ModelOutputs, StereoModel};
use burn::tensor::activation::{log_softmax, relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use stereo_dataset::Mode;
use tracing::trace;

/// Cityscapes label ids 0..=33.
pub const NUM_CLASSES: usize = 34;
pub const MAX_DISPARITY: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct PointwiseStereoModel {
    params: ModelParams,
    mode: Mode,
    task: Task,
    hidden: usize,
    variables: Vec<VariableSpec>,
}

fn layer(specs: &mut Vec<VariableSpec>, scope: &[&str], fan_in: usize, fan_out: usize) {
    let base = VariableId::new(scope.iter().copied());
    specs.push(VariableSpec {
        id: base.child("weights"),
        shape: vec![fan_in, fan_out],
        init: Init::Xavier,
    });
    specs.push(VariableSpec {
        id: base.child("biases"),
        shape: vec![fan_out],
        init: Init::Zeros,
    });
}

impl PointwiseStereoModel {
    pub fn new(params: ModelParams, mode: Mode, task: Task) -> Self {
        let hidden = match params.encoder {
            Encoder::Vgg => 16,
            Encoder::Resnet50 => 32,
        };
        let input_channels = if params.do_stereo { 6 } else { 3 };

        let mut variables = Vec::new();
        layer(&mut variables, &["encoder", "conv1"], input_channels, hidden);
        if params.encoder == Encoder::Resnet50 {
            layer(&mut variables, &["encoder", "res1"], hidden, hidden);
        }
        if task.has_depth() {
            if params.use_deconv {
                layer(&mut variables, &["decoder", "upconv1"], hidden, hidden);
            }
            layer(&mut variables, &["decoder", "disp"], hidden, 2);
        }
        if task.has_semantic() {
            layer(&mut variables, &["semantic", "logits"], hidden, NUM_CLASSES);
        }

        Self {
            params,
            mode,
            task,
            hidden,
            variables,
        }
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    fn dense<B: Backend>(
        &self,
        weights: &WeightSet<B>,
        scope: &[&str],
        x: Tensor<B, 2>,
        fan_out: usize,
    ) -> Result<Tensor<B, 2>, ModelError> {
        let base = VariableId::new(scope.iter().copied());
        let fan_in = x.dims()[1];
        let w = weights.matrix(&base.child("weights"), fan_in, fan_out)?;
        let b = weights.bias(&base.child("biases"), fan_out)?;
        Ok(x.matmul(w) + b)
    }

    fn depth_loss<B: Backend>(
        &self,
        left: Tensor<B, 4>,
        right: Tensor<B, 4>,
        disp_left: Tensor<B, 4>,
        disp_right: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let p = &self.params;
        let width = left.dims()[2] as f32;
        let left_est = shift_x(right.clone(), disp_left.clone().mul_scalar(width), p.wrap_mode);
        let right_est = shift_x(left.clone(), disp_right.clone().mul_scalar(-width), p.wrap_mode);

        let reconstruction = image_loss(left_est, left.clone(), p.alpha_image_loss, p.wrap_mode)
            + image_loss(right_est, right.clone(), p.alpha_image_loss, p.wrap_mode);
        let smooth = smoothness(disp_left.clone(), left, p.wrap_mode)
            + smoothness(disp_right.clone(), right, p.wrap_mode);
        let lr_consistency = (disp_left - disp_right).abs().mean();

        reconstruction
            + smooth.mul_scalar(p.disp_gradient_loss_weight)
            + lr_consistency.mul_scalar(p.lr_loss_weight)
    }

    /// Cross-entropy over pixels with `valid == 1`, averaged over those pixels.
    fn semantic_loss<B: Backend>(
        logits: Tensor<B, 2>,
        labels: Tensor<B, 4>,
        valid: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let [pixels, classes] = logits.dims();
        let device = logits.device();
        let class_ids = Tensor::<B, 1, Int>::arange(0..classes as i64, &device)
            .float()
            .reshape([1, classes])
            .expand([pixels, classes]);
        let one_hot = labels
            .reshape([pixels, 1])
            .expand([pixels, classes])
            .equal(class_ids)
            .float();
        let valid = valid.reshape([pixels, 1]);
        let nll = (one_hot * log_softmax(logits, 1)).sum_dim(1).neg() * valid.clone();
        nll.sum().div(valid.sum().clamp_min(1.0))
    }
}

impl StereoModel for PointwiseStereoModel {
    fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn task(&self) -> Task {
        self.task
    }

    fn forward<B: Backend>(
        &self,
        weights: &WeightSet<B>,
        inputs: &ModelInputs<B>,
        tower: usize,
    ) -> Result<ModelOutputs<B>, ModelError> {
        let [n, h, w, _] = inputs.left.dims();
        let pixels = n * h * w;
        trace!(tower, n, h, w, "pointwise forward");

        let x = if self.params.do_stereo {
            let right = inputs.right.clone().ok_or(ModelError::MissingInput("right"))?;
            Tensor::cat(vec![inputs.left.clone(), right], 3)
        } else {
            inputs.left.clone()
        };
        let channels = x.dims()[3];
        let x = x.reshape([pixels, channels]);

        let mut features = relu(self.dense(weights, &["encoder", "conv1"], x, self.hidden)?);
        if self.params.encoder == Encoder::Resnet50 {
            let residual = relu(self.dense(weights, &["encoder", "res1"], features.clone(), self.hidden)?);
            features = features + residual;
        }

        let train = self.mode == Mode::Train;
        let mut total_loss: Option<Tensor<B, 1>> = None;
        let mut disp_left_est = None;
        let mut sem_est = None;

        if self.task.has_depth() {
            let mut decoded = features.clone();
            if self.params.use_deconv {
                decoded = relu(self.dense(weights, &["decoder", "upconv1"], decoded, self.hidden)?);
            }
            let disp = sigmoid(self.dense(weights, &["decoder", "disp"], decoded, 2)?)
                .mul_scalar(MAX_DISPARITY)
                .reshape([n, h, w, 2]);
            let disp_left = disp.clone().slice([0..n, 0..h, 0..w, 0..1]);
            let disp_right = disp.slice([0..n, 0..h, 0..w, 1..2]);
            disp_left_est = Some(disp_left.clone().reshape([n, h, w]));

            if train {
                let right = inputs.right.clone().ok_or(ModelError::MissingInput("right"))?;
                let loss = self.depth_loss(inputs.left.clone(), right, disp_left, disp_right);
                total_loss = Some(loss);
            }
        }

        if self.task.has_semantic() {
            let logits = self.dense(weights, &["semantic", "logits"], features, NUM_CLASSES)?;
            sem_est = Some(logits.clone().reshape([n, h, w, NUM_CLASSES]));

            if train {
                let labels = inputs.semantic.clone().ok_or(ModelError::MissingInput("semantic"))?;
                let valid = inputs.valid.clone().ok_or(ModelError::MissingInput("valid"))?;
                let loss = Self::semantic_loss(logits, labels, valid);
                total_loss = Some(match total_loss {
                    Some(depth) => depth + loss,
                    None => loss,
                });
            }
        }

        Ok(ModelOutputs {
            total_loss,
            disp_left_est,
            sem_est,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type B = burn_ndarray::NdArray<f32>;

    fn params(task: Task) -> ModelParams {
        ModelParams {
            height: 2,
            width: 4,
            batch_size: 2,
            task,
            ..ModelParams::default()
        }
    }

    fn image(n: usize, value: f32) -> Tensor<B, 4> {
        let data: Vec<f32> = (0..n * 2 * 4 * 3)
            .map(|i| (value + i as f32 * 0.01) % 1.0)
            .collect();
        Tensor::from_data(TensorData::new(data, [n, 2, 4, 3]), &Default::default())
    }

    fn mask(n: usize, value: f32) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(vec![value; n * 8], [n, 2, 4, 1]), &Default::default())
    }

    #[test]
    fn inventory_follows_task_and_encoder() {
        let depth = PointwiseStereoModel::new(params(Task::Depth), Mode::Train, Task::Depth);
        let names: Vec<String> = depth.variable_ids().iter().map(|v| v.to_string()).collect();
        assert_eq!(
            names,
            [
                "encoder/conv1/weights",
                "encoder/conv1/biases",
                "decoder/disp/weights",
                "decoder/disp/biases"
            ]
        );

        let mut p = params(Task::SemanticDepth);
        p.encoder = Encoder::Resnet50;
        p.do_stereo = true;
        let full = PointwiseStereoModel::new(p, Mode::Train, Task::SemanticDepth);
        assert_eq!(full.variables().len(), 8);
        assert_eq!(full.variables()[0].shape, vec![6, 32]);
    }

    #[test]
    fn train_forward_produces_finite_loss() {
        let model = PointwiseStereoModel::new(
            params(Task::SemanticDepth),
            Mode::Train,
            Task::SemanticDepth,
        );
        let device = Default::default();
        let weights = WeightSet::<B>::initialize(model.variables(), 3, &device);
        let inputs = ModelInputs {
            left: image(2, 0.1),
            right: Some(image(2, 0.4)),
            semantic: Some(mask(2, 7.0)),
            valid: Some(mask(2, 1.0)),
        };
        let out = model.forward(&weights, &inputs, 0).unwrap();
        let loss = out.total_loss.unwrap().into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(out.disp_left_est.unwrap().dims(), [2, 2, 4]);
        assert_eq!(out.sem_est.unwrap().dims(), [2, 2, 4, NUM_CLASSES]);
    }

    #[test]
    fn disparity_is_bounded() {
        let model = PointwiseStereoModel::new(params(Task::Depth), Mode::Test, Task::Depth);
        let weights = WeightSet::<B>::initialize(model.variables(), 9, &Default::default());
        let inputs = ModelInputs {
            left: image(1, 0.3),
            right: None,
            semantic: None,
            valid: None,
        };
        let out = model.forward(&weights, &inputs, 0).unwrap();
        assert!(out.total_loss.is_none());
        let disp = out.disp_left_est.unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(disp.iter().all(|d| (0.0..=MAX_DISPARITY).contains(d)));
    }

    #[test]
    fn train_without_right_view_is_rejected() {
        let model = PointwiseStereoModel::new(params(Task::Depth), Mode::Train, Task::Depth);
        let weights = WeightSet::<B>::initialize(model.variables(), 1, &Default::default());
        let inputs = ModelInputs {
            left: image(1, 0.3),
            right: None,
            semantic: None,
            valid: None,
        };
        assert!(matches!(
            model.forward(&weights, &inputs, 0),
            Err(ModelError::MissingInput("right"))
        ));
    }

    #[test]
    fn masked_pixels_do_not_contribute_to_semantic_loss() {
        let model = PointwiseStereoModel::new(params(Task::Semantic), Mode::Train, Task::Semantic);
        let weights = WeightSet::<B>::initialize(model.variables(), 4, &Default::default());
        let inputs = |label: f32| ModelInputs {
            left: image(1, 0.2),
            right: Some(image(1, 0.6)),
            semantic: Some(mask(1, label)),
            valid: Some(mask(1, 0.0)),
        };
        let a = model.forward(&weights, &inputs(3.0), 0).unwrap();
        let b = model.forward(&weights, &inputs(20.0), 0).unwrap();
        assert_eq!(a.total_loss.unwrap().into_scalar(), 0.0);
        assert_eq!(b.total_loss.unwrap().into_scalar(), 0.0);
    }
}
