use std::fmt;

use tch::{nn, Tensor};

use crate::config::DiscriminatorConfig;
use crate::error::ArchitectureError;

pub const KERNEL_SIZE: i64 = 4;
pub const PADDING: i64 = 1;
pub const LEAKY_SLOPE: f64 = 0.2;
const INSTANCE_NORM_EPS: f64 = 1e-5;

fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LEAKY_SLOPE))
}

/// Per-sample, per-channel normalization without affine parameters or running statistics.
fn instance_norm(xs: &Tensor) -> Tensor {
    xs.instance_norm(
        None::<Tensor>,
        None::<Tensor>,
        None::<Tensor>,
        None::<Tensor>,
        true,
        0.1,
        INSTANCE_NORM_EPS,
        false,
    )
}

fn reflect_conv(path: nn::Path, c_in: i64, c_out: i64, stride: i64) -> nn::Conv2D {
    nn::conv2d(
        path,
        c_in,
        c_out,
        KERNEL_SIZE,
        nn::ConvConfig {
            stride,
            padding: PADDING,
            padding_mode: nn::PaddingMode::Reflect,
            ..Default::default()
        },
    )
}

/// Normalized discriminator hyperparameters. Both construction entry points go through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscriminatorSpec {
    channels: i64,
    num_features: i64,
    depth: i64,
}

impl DiscriminatorSpec {
    pub fn new(channels: i64, num_features: i64, depth: i64) -> Result<Self, ArchitectureError> {
        if depth < 1 {
            return Err(ArchitectureError::Depth(depth));
        }
        if num_features < 1 {
            return Err(ArchitectureError::Features(num_features));
        }
        if channels < 1 {
            return Err(ArchitectureError::Channels(channels));
        }
        // The widest stage must fit in an i64.
        let widest = u32::try_from(depth - 1)
            .ok()
            .and_then(|shift| 1i64.checked_shl(shift))
            .filter(|m| *m > 0)
            .and_then(|m| m.checked_mul(num_features));
        if widest.is_none() {
            return Err(ArchitectureError::Depth(depth));
        }
        Ok(Self {
            channels,
            num_features,
            depth,
        })
    }

    pub fn channels(&self) -> i64 {
        self.channels
    }

    /// `num_features * 2^i` for every stage.
    pub fn features(&self) -> Vec<i64> {
        (0..self.depth).map(|i| self.num_features << i).collect()
    }

    /// Layout of every convolution, terminal projection included.
    pub fn layers(&self) -> Vec<LayerSpec> {
        let features = self.features();
        let last = features.len() - 1;
        let mut layers = vec![LayerSpec {
            in_channels: self.channels,
            out_channels: features[0],
            kernel: KERNEL_SIZE,
            stride: 2,
            instance_norm: false,
            leaky_relu: true,
        }];
        for (i, pair) in features.windows(2).enumerate() {
            layers.push(LayerSpec {
                in_channels: pair[0],
                out_channels: pair[1],
                kernel: KERNEL_SIZE,
                stride: if i + 1 == last { 1 } else { 2 },
                instance_norm: true,
                leaky_relu: true,
            });
        }
        layers.push(LayerSpec {
            in_channels: features[last],
            out_channels: 1,
            kernel: KERNEL_SIZE,
            stride: 1,
            instance_norm: false,
            leaky_relu: false,
        });
        layers
    }

    /// Side length of the realism map for a square input of side `input`.
    pub fn output_size(&self, input: i64) -> i64 {
        self.layers()
            .iter()
            .fold(input, |n, l| (n + 2 * PADDING - l.kernel) / l.stride + 1)
    }

    /// Realism map side for `input`, or an error when some layer would see a feature map too
    /// small to reflect-pad or convolve.
    pub fn check_input(&self, input: i64) -> Result<i64, ArchitectureError> {
        let too_small = ArchitectureError::InputTooSmall {
            input,
            depth: self.depth,
        };
        let mut n = input;
        for l in self.layers() {
            if n <= PADDING {
                return Err(too_small);
            }
            n = (n + 2 * PADDING - l.kernel) / l.stride + 1;
            if n < 1 {
                return Err(too_small);
            }
        }
        Ok(n)
    }
}

impl TryFrom<&DiscriminatorConfig> for DiscriminatorSpec {
    type Error = ArchitectureError;

    fn try_from(cfg: &DiscriminatorConfig) -> Result<Self, Self::Error> {
        Self::new(cfg.channels, cfg.num_features, cfg.depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub in_channels: i64,
    pub out_channels: i64,
    pub kernel: i64,
    pub stride: i64,
    pub instance_norm: bool,
    pub leaky_relu: bool,
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conv {:>4} -> {:<4} k{} s{} reflect",
            self.in_channels, self.out_channels, self.kernel, self.stride
        )?;
        if self.instance_norm {
            write!(f, " + instance_norm")?;
        }
        if self.leaky_relu {
            write!(f, " + leaky_relu({LEAKY_SLOPE})")?;
        }
        Ok(())
    }
}

/// Reflect-padded convolution, instance norm, leaky ReLU.
#[derive(Debug)]
pub struct ConvBlock {
    conv: nn::Conv2D,
}

impl ConvBlock {
    pub fn new(path: nn::Path, c_in: i64, c_out: i64, stride: i64) -> ConvBlock {
        ConvBlock {
            conv: reflect_conv(&path / "conv", c_in, c_out, stride),
        }
    }
}

impl nn::Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Tensor {
        leaky_relu(&instance_norm(&xs.apply(&self.conv)))
    }
}

/// PatchGAN discriminator: maps [B, C, H, W] images to [B, 1, H', W'] realism probabilities.
#[derive(Debug)]
pub struct Discriminator {
    net: nn::SequentialT,
    spec: DiscriminatorSpec,
}

impl Discriminator {
    pub fn new(
        path: nn::Path,
        channels: i64,
        num_features: i64,
        depth: i64,
    ) -> Result<Discriminator, ArchitectureError> {
        let spec = DiscriminatorSpec::new(channels, num_features, depth)?;
        Ok(Discriminator::build(path, spec))
    }

    pub fn from_config(
        path: nn::Path,
        cfg: &DiscriminatorConfig,
    ) -> Result<Discriminator, ArchitectureError> {
        let spec = DiscriminatorSpec::try_from(cfg)?;
        Ok(Discriminator::build(path, spec))
    }

    pub fn build(path: nn::Path, spec: DiscriminatorSpec) -> Discriminator {
        let layers = spec.layers();
        let last = layers.len() - 1;
        let mut net = nn::seq_t();
        for (i, l) in layers.iter().enumerate() {
            net = if i == 0 {
                // No normalization on raw pixels.
                net.add(reflect_conv(&path / "initial", l.in_channels, l.out_channels, l.stride))
                    .add_fn(leaky_relu)
            } else if i == last {
                net.add(reflect_conv(&path / "head", l.in_channels, l.out_channels, l.stride))
            } else {
                net.add(ConvBlock::new(
                    &path / format!("block_{i}"),
                    l.in_channels,
                    l.out_channels,
                    l.stride,
                ))
            };
        }
        Discriminator { net, spec }
    }

    pub fn spec(&self) -> &DiscriminatorSpec {
        &self.spec
    }

    pub fn layers(&self) -> Vec<LayerSpec> {
        self.spec.layers()
    }
}

impl nn::ModuleT for Discriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply_t(&self.net, train).sigmoid()
    }
}
