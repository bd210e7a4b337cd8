use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};
use pets_core::{PetsError, rng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    Swish,
    Tanh,
}

impl FromStr for ActivationKind {
    type Err = PetsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "tanh" => Ok(Self::Tanh),
            other => Err(PetsError::UnknownActivation(other.to_string())),
        }
    }
}

impl Module for ActivationKind {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Swish => xs.silu(),
            Self::Tanh => xs.tanh(),
        }
    }
}

/// `ensemble_size` independent affine maps applied with one batched matmul.
#[derive(Debug, Clone)]
pub struct EnsembleLinear {
    weight: Tensor,
    bias: Tensor,
}

impl EnsembleLinear {
    pub fn new(
        ensemble_size: usize,
        in_dim: usize,
        out_dim: usize,
        vb: &VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = vb.get_with_hints((ensemble_size, in_dim, out_dim), "weight", Init::Const(0.))?;
        let bias = vb.get_with_hints((ensemble_size, 1, out_dim), "bias", Init::Const(0.))?;
        // Drawn from our own rng so that model initialization replays under a seed.
        let stdev = 1. / (2. * (in_dim as f64).sqrt());
        let init = (rng::randn(rng, (ensemble_size, in_dim, out_dim), weight.device())? * stdev)?;
        weight.slice_set(&init, 0, 0)?;
        Ok(Self { weight, bias })
    }

    /// Squared L2 norm of each member's weight matrix, `(ensemble_size,)`.
    pub fn weight_sq_norm(&self) -> Result<Tensor> {
        self.weight.sqr()?.sum((1, 2))
    }
}

impl Module for EnsembleLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.contiguous()?
            .matmul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
pub enum EnsembleLayer {
    Linear(EnsembleLinear),
    Activation(ActivationKind),
    Dropout(f32),
}

impl EnsembleLayer {
    fn forward_t(&self, xs: &Tensor, dropout_rng: Option<&mut StdRng>) -> Result<Tensor> {
        match (self, dropout_rng) {
            (Self::Linear(linear), _) => linear.forward(xs),
            (Self::Activation(activation), _) => activation.forward(xs),
            (Self::Dropout(p), Some(rng)) if *p > 0. => dropout(xs, *p, rng),
            (Self::Dropout(_), _) => Ok(xs.clone()),
        }
    }
}

/// Inverted dropout with the mask drawn from `rng`.
fn dropout(xs: &Tensor, p: f32, rng: &mut StdRng) -> Result<Tensor> {
    let keep = rng::uniform(rng, xs.shape(), xs.device())?
        .ge(p)?
        .to_dtype(xs.dtype())?;
    xs.mul(&(keep / (1. - p) as f64)?)
}

/// Stack of ensemble layers whose last linear layer outputs a mean and a
/// log variance for every target feature.
#[derive(Debug, Clone)]
pub struct EnsembleMlp {
    layers: Vec<EnsembleLayer>,
    out_features: usize,
    max_logvar: Tensor,
    min_logvar: Tensor,
}

impl EnsembleMlp {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        ensemble_size: usize,
        in_features: usize,
        hid_features: &[usize],
        out_features: usize,
        activation: ActivationKind,
        dropout: f32,
        vb: &VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = vec![];
        let mut last_dim = in_features;
        for (layer_idx, hidden) in hid_features.iter().enumerate() {
            let linear = EnsembleLinear::new(
                ensemble_size,
                last_dim,
                *hidden,
                &vb.pp(format!("layer{layer_idx}")),
                rng,
            )?;
            layers.push(EnsembleLayer::Linear(linear));
            layers.push(EnsembleLayer::Activation(activation));
            layers.push(EnsembleLayer::Dropout(dropout));
            last_dim = *hidden;
        }
        let head = EnsembleLinear::new(
            ensemble_size,
            last_dim,
            2 * out_features,
            &vb.pp(format!("layer{}", hid_features.len())),
            rng,
        )?;
        layers.push(EnsembleLayer::Linear(head));
        let max_logvar =
            vb.get_with_hints((ensemble_size, 1, out_features), "max_logvar", Init::Const(0.5))?;
        let min_logvar =
            vb.get_with_hints((ensemble_size, 1, out_features), "min_logvar", Init::Const(-10.))?;
        Ok(Self {
            layers,
            out_features,
            max_logvar,
            min_logvar,
        })
    }

    /// Returns `(mean, logvar)`, both `(ensemble_size, rows, out_features)`.
    /// Dropout is active only when `dropout_rng` is given.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, Tensor)> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, dropout_rng.as_deref_mut())?;
        }
        let mean = xs.narrow(2, 0, self.out_features)?;
        let logvar = xs.narrow(2, self.out_features, self.out_features)?;
        let logvar = self
            .max_logvar
            .broadcast_sub(&softplus(&self.max_logvar.broadcast_sub(&logvar)?)?)?;
        let logvar = self
            .min_logvar
            .broadcast_add(&softplus(&logvar.broadcast_sub(&self.min_logvar)?)?)?;
        Ok((mean, logvar))
    }

    /// Sum of squared weights per member over all linear layers.
    pub fn weight_sq_norm(&self) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for layer in self.layers.iter() {
            if let EnsembleLayer::Linear(linear) = layer {
                let norm = linear.weight_sq_norm()?;
                total = Some(match total {
                    Some(total) => (total + norm)?,
                    None => norm,
                });
            }
        }
        total.ok_or_else(|| candle_core::Error::Msg("network has no linear layers".into()))
    }

    /// Penalty keeping the learned log variance bounds tight, per member.
    pub fn logvar_bound_penalty(&self) -> Result<Tensor> {
        self.max_logvar.sum((1, 2))? - self.min_logvar.sum((1, 2))?
    }
}

/// Numerically stable `ln(1 + e^x)`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.)?.log()?
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn activation_from_str() {
        assert_eq!("swish".parse::<ActivationKind>().unwrap(), ActivationKind::Swish);
        assert_eq!("ReLU".parse::<ActivationKind>().unwrap(), ActivationKind::Relu);
        assert!(matches!(
            "gelu".parse::<ActivationKind>(),
            Err(PetsError::UnknownActivation(_))
        ));
    }

    #[test]
    fn softplus_matches_reference() -> Result<()> {
        let xs = Tensor::new(&[-50f32, -1., 0., 1., 50.], &Device::Cpu)?;
        let ys: Vec<f32> = softplus(&xs)?.to_vec1()?;
        let reference = [0f32, 0.3132617, 0.6931472, 1.3132616, 50.];
        for (y, r) in ys.iter().zip(reference.iter()) {
            assert!((y - r).abs() < 1e-5, "{y} vs {r}");
        }
        Ok(())
    }

    #[test]
    fn members_are_independent() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut rng = rng::seeded(0);
        let linear = EnsembleLinear::new(3, 2, 4, &vb, &mut rng)?;
        let xs = Tensor::ones((3, 5, 2), DType::F32, &device)?;
        let ys = linear.forward(&xs)?;
        assert_eq!(ys.dims(), &[3, 5, 4]);
        let ys = ys.to_vec3::<f32>()?;
        assert_ne!(ys[0][0], ys[1][0]);
        assert_eq!(ys[0][0], ys[0][4]);
        Ok(())
    }

    #[test]
    fn logvar_stays_within_bounds() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut rng = rng::seeded(0);
        let mlp =
            EnsembleMlp::build(2, 3, &[8], 2, ActivationKind::Tanh, 0., &vb, &mut rng)?;
        let xs = (rng::randn(&mut rng, (2, 16, 3), &device)? * 100.)?;
        let (mean, logvar) = mlp.forward_t(&xs, None)?;
        assert_eq!(mean.dims(), &[2, 16, 2]);
        let logvar: Vec<f32> = logvar.flatten_all()?.to_vec1()?;
        assert!(logvar.iter().all(|lv| *lv <= 0.5 + 1e-3 && *lv >= -10. - 1e-3));
        Ok(())
    }

    #[test]
    fn dropout_replays_under_the_same_seed() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut rng = rng::seeded(0);
        let mlp =
            EnsembleMlp::build(2, 3, &[64], 1, ActivationKind::Relu, 0.5, &vb, &mut rng)?;
        let xs = rng::randn(&mut rng, (2, 8, 3), &device)?;
        let (a, _) = mlp.forward_t(&xs, Some(&mut rng::seeded(4)))?;
        let (b, _) = mlp.forward_t(&xs, Some(&mut rng::seeded(4)))?;
        let (c, _) = mlp.forward_t(&xs, Some(&mut rng::seeded(5)))?;
        let (eval_a, _) = mlp.forward_t(&xs, None)?;
        let (eval_b, _) = mlp.forward_t(&xs, None)?;
        assert_eq!(a.to_vec3::<f32>()?, b.to_vec3::<f32>()?);
        assert_ne!(a.to_vec3::<f32>()?, c.to_vec3::<f32>()?);
        assert_eq!(eval_a.to_vec3::<f32>()?, eval_b.to_vec3::<f32>()?);
        assert_ne!(a.to_vec3::<f32>()?, eval_a.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn dropout_zeroes_and_rescales() -> Result<()> {
        let xs = Tensor::ones((1, 1000), DType::F32, &Device::Cpu)?;
        let ys: Vec<f32> = dropout(&xs, 0.25, &mut rng::seeded(1))?.flatten_all()?.to_vec1()?;
        assert!(ys.iter().all(|y| *y == 0. || (y - 1. / 0.75).abs() < 1e-6));
        let dropped = ys.iter().filter(|y| **y == 0.).count();
        assert!((180..320).contains(&dropped), "{dropped} dropped");
        Ok(())
    }
}
