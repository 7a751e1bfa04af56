use burn::backend::Autodiff;
use burn::tensor::{Tensor, TensorData};
use models::{ModelInputs, ModelParams, PointwiseStereoModel, StereoModel, Task, VariableId, WeightSet};
use stereo_dataset::Mode;

type Inner = burn_ndarray::NdArray<f32>;
type AD = Autodiff<Inner>;

fn inputs(device: &<AD as burn::tensor::backend::Backend>::Device) -> ModelInputs<AD> {
    let image = |offset: f32| {
        let data: Vec<f32> = (0..2 * 3 * 5 * 3)
            .map(|i| (i as f32 * 0.037 + offset) % 1.0)
            .collect();
        Tensor::<AD, 4>::from_data(TensorData::new(data, [2, 3, 5, 3]), device)
    };
    let ones = Tensor::<AD, 4>::from_data(TensorData::new(vec![1.0f32; 30], [2, 3, 5, 1]), device);
    ModelInputs {
        left: image(0.1),
        right: Some(image(0.5)),
        semantic: Some(ones.clone().mul_scalar(8.0)),
        valid: Some(ones),
    }
}

#[test]
fn tracked_variables_receive_gradients_and_frozen_ones_do_not() -> anyhow::Result<()> {
    let params = ModelParams {
        height: 3,
        width: 5,
        batch_size: 2,
        task: Task::SemanticDepth,
        ..ModelParams::default()
    };
    let model = PointwiseStereoModel::new(params, Mode::Train, Task::SemanticDepth);
    let device = Default::default();
    let master = WeightSet::<Inner>::initialize(model.variables(), 17, &device);

    let frozen: VariableId = "semantic/logits/biases".parse()?;
    let towers = WeightSet::<AD>::lift(&master, |id| *id != frozen);
    let out = model.forward(&towers, &inputs(&device), 0)?;
    let loss = out.total_loss.expect("train mode yields a loss");
    let grads = loss.backward();

    let order = model.variable_ids();
    let reported = towers.gradients(&grads, &order);
    assert_eq!(reported.len(), order.len());
    for (grad, id) in &reported {
        if *id == frozen {
            assert!(grad.is_none());
        } else {
            let grad = grad.as_ref().unwrap_or_else(|| panic!("no gradient for {id}"));
            let expected: usize = master.shape(id).unwrap().iter().product();
            assert_eq!(grad.dims(), [expected]);
        }
    }
    Ok(())
}
