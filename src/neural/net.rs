//! Single value/variance estimator.
//!
//! Two conv+batch-norm stages, a dense projection, a scalar value head and
//! a softplus-floored variance head. The policy head is a capability flag:
//! disabled (the default) it emits a constant uniform distribution over
//! the action set; enabled it is a plain linear+softmax head.

use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

/// Network shape and head configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Board spatial dimensions (height, width)
    pub input_shape: (i64, i64),
    pub n_actions: i64,
    pub filters: i64,
    pub hidden: i64,
    /// Strictly positive floor added after the softplus, keeping the
    /// variance output bounded away from zero for any input
    pub eps_variance_floor: f64,
    /// When false the policy output is a pure constant uniform
    /// distribution with no learned path
    pub policy_enabled: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            input_shape: (22, 10),
            n_actions: 7,
            filters: 32,
            hidden: 128,
            eps_variance_floor: 1.0,
            policy_enabled: false,
        }
    }
}

/// One forward pass worth of predictions.
pub struct NetOutput {
    /// `(N, 1)` predicted mean value
    pub value: Tensor,
    /// `(N, 1)` predicted variance, always > 0
    pub variance: Tensor,
    /// `(N, A)` policy distribution
    pub policy: Tensor,
}

/// Spatial output shape of a valid (unpadded) convolution.
fn conv_out_shape(shape: (i64, i64), kernel: i64, stride: i64) -> (i64, i64) {
    (
        (shape.0 - kernel) / stride + 1,
        (shape.1 - kernel) / stride + 1,
    )
}

pub struct Net {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    fc1: nn::Linear,
    fc_v: nn::Linear,
    fc_var: nn::Linear,
    fc_p: Option<nn::Linear>,
    n_actions: i64,
    eps_variance_floor: f64,
}

impl Net {
    pub fn new(p: &nn::Path, cfg: &NetConfig) -> Self {
        debug_assert!(cfg.eps_variance_floor > 0.0);

        let kernel = 3;
        let stride = 1;
        let conv_cfg = nn::ConvConfig {
            stride,
            bias: false,
            ..Default::default()
        };

        let conv1 = nn::conv2d(p / "conv1", 1, cfg.filters, kernel, conv_cfg);
        let bn1 = nn::batch_norm2d(p / "bn1", cfg.filters, Default::default());
        let shape = conv_out_shape(cfg.input_shape, kernel, stride);

        let conv2 = nn::conv2d(p / "conv2", cfg.filters, cfg.filters, kernel, conv_cfg);
        let bn2 = nn::batch_norm2d(p / "bn2", cfg.filters, Default::default());
        let shape = conv_out_shape(shape, kernel, stride);

        let flat_in = shape.0 * shape.1 * cfg.filters;
        let fc1 = nn::linear(p / "fc1", flat_in, cfg.hidden, Default::default());

        // Targets are remaining-score magnitudes, so the value bias starts
        // at a large positive mean with small noise
        let fc_v = nn::linear(
            p / "fc_v",
            cfg.hidden,
            1,
            nn::LinearConfig {
                bs_init: Some(nn::Init::Randn {
                    mean: 1e2,
                    stdev: 0.1,
                }),
                ..Default::default()
            },
        );
        let fc_var = nn::linear(p / "fc_var", cfg.hidden, 1, Default::default());
        let fc_p = cfg
            .policy_enabled
            .then(|| nn::linear(p / "fc_p", cfg.hidden, cfg.n_actions, Default::default()));

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            fc1,
            fc_v,
            fc_var,
            fc_p,
            n_actions: cfg.n_actions,
            eps_variance_floor: cfg.eps_variance_floor,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> NetOutput {
        let h = x.apply(&self.conv1).apply_t(&self.bn1, train).relu();
        let h = h.apply(&self.conv2).apply_t(&self.bn2, train).relu();
        let h = h.view([h.size()[0], -1]);
        let h = h.apply(&self.fc1).relu();

        let value = h.apply(&self.fc_v);
        let variance = h.apply(&self.fc_var).softplus() + self.eps_variance_floor;
        let policy = match &self.fc_p {
            Some(fc_p) => h.apply(fc_p).softmax(-1, Kind::Float),
            None => {
                let batch = h.size()[0];
                Tensor::ones([batch, self.n_actions], (Kind::Float, x.device()))
                    / self.n_actions as f64
            }
        };

        NetOutput {
            value,
            variance,
            policy,
        }
    }
}
