//! Averaging tower gradients into the single update of a step.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::VariableId;
use thiserror::Error;

/// One tower's report: a gradient (or none) per variable, in inventory order.
pub type TowerGradients<B> = Vec<(Option<Tensor<B, 1>>, VariableId)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GradientError {
    #[error("no tower reported gradients")]
    Empty,
    #[error("tower {tower} reports {found:?} at position {position}, expected {expected:?}")]
    Misaligned {
        tower: usize,
        position: usize,
        expected: Option<VariableId>,
        found: Option<VariableId>,
    },
    #[error("no tower produced a gradient for trainable variable {0}")]
    DeviceGradientAbsence(VariableId),
}

/// Averaged gradients in inventory order.
#[derive(Debug, Clone)]
pub struct GradientSet<B: Backend> {
    entries: Vec<(VariableId, Tensor<B, 1>)>,
}

impl<B: Backend> GradientSet<B> {
    pub fn get(&self, id: &VariableId) -> Option<&Tensor<B, 1>> {
        self.entries.iter().find(|(v, _)| v == id).map(|(_, g)| g)
    }

    pub fn contains(&self, id: &VariableId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VariableId, &Tensor<B, 1>)> {
        self.entries.iter().map(|(id, g)| (id, g))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per variable, the sum of the defined tower gradients divided by the number
/// of towers that defined one. Variables no tower reached are left out.
pub fn average_gradients<B: Backend>(
    towers: Vec<TowerGradients<B>>,
) -> Result<GradientSet<B>, GradientError> {
    let Some(first) = towers.first() else {
        return Err(GradientError::Empty);
    };
    let order: Vec<VariableId> = first.iter().map(|(_, id)| id.clone()).collect();
    for (tower, grads) in towers.iter().enumerate().skip(1) {
        let len = grads.len().max(order.len());
        for position in 0..len {
            let expected = order.get(position);
            let found = grads.get(position).map(|(_, id)| id);
            if expected != found {
                return Err(GradientError::Misaligned {
                    tower,
                    position,
                    expected: expected.cloned(),
                    found: found.cloned(),
                });
            }
        }
    }

    let mut columns: Vec<Vec<Tensor<B, 1>>> = vec![Vec::new(); order.len()];
    for grads in towers {
        for (position, (grad, _)) in grads.into_iter().enumerate() {
            if let Some(grad) = grad {
                columns[position].push(grad);
            }
        }
    }

    let entries = order
        .into_iter()
        .zip(columns)
        .filter_map(|(id, defined)| {
            let count = defined.len();
            let sum = defined.into_iter().reduce(|acc, g| acc + g)?;
            Some((id, sum.div_scalar(count as f32)))
        })
        .collect();
    Ok(GradientSet { entries })
}

/// Every variable being optimized must have received a gradient.
pub fn ensure_complete<B: Backend>(
    set: &GradientSet<B>,
    optimize: &[VariableId],
) -> Result<(), GradientError> {
    match optimize.iter().find(|id| !set.contains(id)) {
        Some(id) => Err(GradientError::DeviceGradientAbsence(id.clone())),
        None => Ok(()),
    }
}
