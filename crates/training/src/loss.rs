use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Soft Dice loss over `[B, C, X, Y, Z]` logits and 0/1 targets.
///
/// Per (batch, channel): `1 - (2 * sum(p * g) + smooth_nr) / (sum(p^2) + sum(g^2) + smooth_dr)`,
/// averaged over batch and channels.
#[derive(Debug, Clone)]
pub struct DiceLoss {
    pub sigmoid: bool,
    pub squared_pred: bool,
    pub smooth_nr: f32,
    pub smooth_dr: f32,
}

impl Default for DiceLoss {
    fn default() -> Self {
        Self {
            sigmoid: true,
            squared_pred: true,
            smooth_nr: 0.0,
            smooth_dr: 1e-5,
        }
    }
}

impl DiceLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 1> {
        let [b, c, x, y, z] = logits.dims();
        let n = x * y * z;
        let pred = if self.sigmoid { sigmoid(logits) } else { logits };
        let pred = pred.reshape([b, c, n]);
        let target = target.reshape([b, c, n]);

        let intersection = (pred.clone() * target.clone()).sum_dim(2);
        let (pred_o, ground_o) = if self.squared_pred {
            (pred.powf_scalar(2.0).sum_dim(2), target.powf_scalar(2.0).sum_dim(2))
        } else {
            (pred.sum_dim(2), target.sum_dim(2))
        };
        let numerator = intersection.mul_scalar(2.0).add_scalar(self.smooth_nr);
        let denominator = (pred_o + ground_o).add_scalar(self.smooth_dr);
        let per_channel = (numerator / denominator).neg().add_scalar(1.0);
        per_channel.mean()
    }
}
