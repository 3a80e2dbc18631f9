use burn::module::Module;
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{Dropout, DropoutConfig, GroupNorm, GroupNormConfig, PaddingConfig3d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegResNetConfig {
    pub init_filters: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub dropout_prob: Option<f64>,
    /// Residual blocks per encoder level; level `i` has `init_filters * 2^i` channels.
    pub blocks_down: Vec<usize>,
    /// Residual blocks per decoder level, deepest first.
    pub blocks_up: Vec<usize>,
    pub norm_groups: usize,
}

impl Default for SegResNetConfig {
    fn default() -> Self {
        Self {
            init_filters: 16,
            in_channels: 4,
            out_channels: 3,
            dropout_prob: Some(0.2),
            blocks_down: vec![1, 2, 2, 4],
            blocks_up: vec![1, 1, 1],
            norm_groups: 8,
        }
    }
}

impl SegResNetConfig {
    /// Every spatial input size must be a multiple of this.
    pub fn required_divisor(&self) -> usize {
        1 << self.blocks_down.len().saturating_sub(1)
    }
}

fn conv3x3<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Conv3d<B> {
    Conv3dConfig::new([in_ch, out_ch], [3, 3, 3])
        .with_stride([stride, stride, stride])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1x1<B: Backend>(in_ch: usize, out_ch: usize, bias: bool, device: &B::Device) -> Conv3d<B> {
    Conv3dConfig::new([in_ch, out_ch], [1, 1, 1])
        .with_bias(bias)
        .init(device)
}

/// Pre-activation residual block: (GroupNorm, ReLU, conv) twice plus identity.
#[derive(Debug, Module)]
pub struct ResBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv3d<B>,
    norm2: GroupNorm<B>,
    conv2: Conv3d<B>,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(channels: usize, norm_groups: usize, device: &B::Device) -> Self {
        Self {
            norm1: GroupNormConfig::new(norm_groups, channels).init(device),
            conv1: conv3x3(channels, channels, 1, device),
            norm2: GroupNormConfig::new(norm_groups, channels).init(device),
            conv2: conv3x3(channels, channels, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv1.forward(relu(self.norm1.forward(input.clone())));
        let x = self.conv2.forward(relu(self.norm2.forward(x)));
        x + input
    }
}

#[derive(Debug, Module)]
pub struct DownLevel<B: Backend> {
    downsample: Option<Conv3d<B>>,
    blocks: Vec<ResBlock<B>>,
}

#[derive(Debug, Module)]
pub struct UpLevel<B: Backend> {
    reduce: Conv3d<B>,
    blocks: Vec<ResBlock<B>>,
}

#[derive(Debug, Module)]
pub struct SegResNet<B: Backend> {
    conv_init: Conv3d<B>,
    dropout: Option<Dropout>,
    down: Vec<DownLevel<B>>,
    up: Vec<UpLevel<B>>,
    final_norm: GroupNorm<B>,
    final_conv: Conv3d<B>,
}

impl<B: Backend> SegResNet<B> {
    pub fn new(cfg: &SegResNetConfig, device: &B::Device) -> Self {
        let f = cfg.init_filters;
        let groups = cfg.norm_groups;
        let conv_init = conv3x3(cfg.in_channels, f, 1, device);
        let dropout = cfg.dropout_prob.map(|p| DropoutConfig::new(p).init());

        let down = cfg
            .blocks_down
            .iter()
            .enumerate()
            .map(|(level, &n_blocks)| {
                let channels = f << level;
                let downsample = (level > 0).then(|| conv3x3(channels / 2, channels, 2, device));
                let blocks = (0..n_blocks)
                    .map(|_| ResBlock::new(channels, groups, device))
                    .collect();
                DownLevel { downsample, blocks }
            })
            .collect();

        let n_up = cfg.blocks_up.len();
        let up = cfg
            .blocks_up
            .iter()
            .enumerate()
            .map(|(i, &n_blocks)| {
                let channels = f << (n_up - i);
                let reduce = conv1x1(channels, channels / 2, false, device);
                let blocks = (0..n_blocks)
                    .map(|_| ResBlock::new(channels / 2, groups, device))
                    .collect();
                UpLevel { reduce, blocks }
            })
            .collect();

        Self {
            conv_init,
            dropout,
            down,
            up,
            final_norm: GroupNormConfig::new(groups, f).init(device),
            final_conv: conv1x1(f, cfg.out_channels, true, device),
        }
    }

    /// `[B, in_channels, X, Y, Z]` to logits `[B, out_channels, X, Y, Z]`.
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = self.conv_init.forward(input);
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(x);
        }

        let mut skips = Vec::with_capacity(self.down.len());
        for level in &self.down {
            if let Some(conv) = &level.downsample {
                x = conv.forward(x);
            }
            for block in &level.blocks {
                x = block.forward(x);
            }
            skips.push(x.clone());
        }

        // The deepest skip is the encoder output itself.
        skips.pop();
        for level in &self.up {
            x = upsample_trilinear_x2(level.reduce.forward(x));
            if let Some(skip) = skips.pop() {
                x = x + skip;
            }
            for block in &level.blocks {
                x = block.forward(x);
            }
        }

        self.final_conv.forward(relu(self.final_norm.forward(x)))
    }
}

/// Double every spatial axis with linear interpolation (half-pixel centers,
/// edges clamped), applied one axis at a time.
pub fn upsample_trilinear_x2<B: Backend>(input: Tensor<B, 5>) -> Tensor<B, 5> {
    let mut x = input;
    for dim in 2..5 {
        x = upsample_axis(x, dim);
    }
    x
}

fn slice_axis<B: Backend>(x: Tensor<B, 5>, dim: usize, start: usize, end: usize) -> Tensor<B, 5> {
    let mut ranges = x.dims().map(|d| 0..d);
    ranges[dim] = start..end;
    x.slice(ranges)
}

fn upsample_axis<B: Backend>(x: Tensor<B, 5>, dim: usize) -> Tensor<B, 5> {
    let dims = x.dims();
    let n = dims[dim];
    let (prev, next) = if n > 1 {
        let prev = Tensor::cat(
            vec![
                slice_axis(x.clone(), dim, 0, 1),
                slice_axis(x.clone(), dim, 0, n - 1),
            ],
            dim,
        );
        let next = Tensor::cat(
            vec![
                slice_axis(x.clone(), dim, 1, n),
                slice_axis(x.clone(), dim, n - 1, n),
            ],
            dim,
        );
        (prev, next)
    } else {
        (x.clone(), x.clone())
    };
    let even = x.clone() * 0.75 + prev * 0.25;
    let odd = x * 0.75 + next * 0.25;
    let mut out_dims = dims;
    out_dims[dim] = n * 2;
    Tensor::stack::<6>(vec![even, odd], dim + 1).reshape(out_dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> SegResNetConfig {
        SegResNetConfig {
            init_filters: 8,
            in_channels: 4,
            out_channels: 3,
            dropout_prob: Some(0.2),
            blocks_down: vec![1, 2, 1],
            blocks_up: vec![1, 1],
            norm_groups: 4,
        }
    }

    #[test]
    fn output_matches_input_spatial_shape() {
        let device = Default::default();
        let cfg = tiny_config();
        assert_eq!(cfg.required_divisor(), 4);
        let model = SegResNet::<TestBackend>::new(&cfg, &device);
        let input = Tensor::<TestBackend, 5>::ones([1, 4, 8, 4, 12], &device);
        let out = model.forward(input);
        assert_eq!(out.dims(), [1, 3, 8, 4, 12]);
    }

    #[test]
    fn default_config_is_the_brats_network() {
        let cfg = SegResNetConfig::default();
        assert_eq!(cfg.blocks_down, vec![1, 2, 2, 4]);
        assert_eq!(cfg.blocks_up, vec![1, 1, 1]);
        assert_eq!(cfg.required_divisor(), 8);
    }

    #[test]
    fn upsample_interpolates_between_neighbours() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1>::from_floats([0.0, 4.0], &device).reshape([1, 1, 2, 1, 1]);
        let out = upsample_trilinear_x2(input);
        assert_eq!(out.dims(), [1, 1, 4, 2, 2]);
        let values = out.into_data().to_vec::<f32>().unwrap();
        // x-major layout: each x value repeated over the 2x2 (y, z) block.
        let along_x: Vec<f32> = values.chunks(4).map(|c| c[0]).collect();
        assert_eq!(along_x, vec![0.0, 1.0, 3.0, 4.0]);
        assert!(values.chunks(4).all(|c| c.iter().all(|v| *v == c[0])));
    }

    #[test]
    fn gradients_reach_the_first_convolution() {
        type AD = Autodiff<TestBackend>;
        let device = Default::default();
        let model = SegResNet::<AD>::new(&tiny_config(), &device);
        let input = Tensor::<AD, 5>::ones([1, 4, 4, 4, 4], &device);
        let loss = model.forward(input).powf_scalar(2.0).mean();
        let grads = loss.backward();
        let weight_grad = model.conv_init.weight.val().grad(&grads);
        assert!(weight_grad.is_some());
    }
}
