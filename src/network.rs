use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{
    Array, Array1, Array2, Array3, Array4, ArrayD, Axis, Dimension, Ix1, Ix3, IxDyn, Zip,
};
use ndarray_rand::{RandomExt, rand::Rng, rand_distr::Uniform};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mnist::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    LeakyRelu(f32),
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    pub fn apply<D: Dimension>(&self, z: &Array<f32, D>) -> Array<f32, D> {
        match *self {
            Activation::Linear => z.clone(),
            Activation::Relu => z.mapv(|v| v.max(0.0)),
            Activation::LeakyRelu(alpha) => z.mapv(|v| if v > 0.0 { v } else { alpha * v }),
            Activation::Sigmoid => z.mapv(sigmoid),
            Activation::Tanh => z.mapv(f32::tanh),
            Activation::Softmax => {
                // Shift by the maximum so large logits do not overflow exp.
                let max = z.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let exps = z.mapv(|v| (v - max).exp());
                let sum = exps.sum();
                exps / sum
            }
        }
    }

    // Elementwise da/dz, given both the pre-activation z and the activation a. Softmax is only
    // ever the output activation, where its derivative is folded into the loss delta.
    fn derivative<D: Dimension>(&self, z: &Array<f32, D>, a: &Array<f32, D>) -> Array<f32, D> {
        Zip::from(z).and(a).map_collect(|&z, &a| match *self {
            Activation::Linear | Activation::Softmax => 1.0,
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu(alpha) => {
                if z > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => a * (1.0 - a),
            Activation::Tanh => 1.0 - a * a,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// Architecture description of one layer, as written in configuration. Weights are not part of
/// it; they are allocated when the network is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_strides")]
        strides: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
    },
    MaxPool2d {
        pool_size: usize,
        #[serde(default)]
        strides: Option<usize>,
    },
    Flatten,
    Dense {
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
}

fn default_strides() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    pub name: String,
    pub filters: usize,
    pub kernel_size: usize,
    pub strides: usize,
    pub padding: Padding,
    pub activation: Activation,
    // Shaped (kernel_size, kernel_size, input channels, filters).
    kernel: Option<Array4<f32>>,
    bias: Option<Array1<f32>>,
}

impl Conv2d {
    /// The kernel and bias, or `NotReady` if the layer has not been built yet.
    pub fn weights(&self) -> Result<(&Array4<f32>, &Array1<f32>)> {
        match (&self.kernel, &self.bias) {
            (Some(kernel), Some(bias)) => Ok((kernel, bias)),
            _ => Err(Error::NotReady {
                layer: self.name.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxPool2d {
    pub name: String,
    pub pool_size: usize,
    pub strides: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flatten {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub name: String,
    pub units: usize,
    pub activation: Activation,
    // Shaped (units, inputs), so the forward pass is weights.dot(input).
    weights: Option<Array2<f32>>,
    bias: Option<Array1<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Conv2d,
    MaxPool2d,
    Flatten,
    Dense,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    Conv2d(Conv2d),
    MaxPool2d(MaxPool2d),
    Flatten(Flatten),
    Dense(Dense),
}

// What a layer needs to remember from its forward pass in order to backpropagate.
enum Trace {
    Conv {
        cols: Array2<f32>,
        input_dim: (usize, usize, usize),
        geometry: ConvGeometry,
        z: Array3<f32>,
        a: Array3<f32>,
    },
    Pool {
        input_dim: (usize, usize, usize),
        argmax: Array3<usize>,
    },
    Flatten {
        input_shape: Vec<usize>,
    },
    Dense {
        input: Array1<f32>,
        z: Array1<f32>,
        a: Array1<f32>,
    },
}

enum Gradient {
    Conv {
        kernel: Array4<f32>,
        bias: Array1<f32>,
    },
    Dense {
        weights: Array2<f32>,
        bias: Array1<f32>,
    },
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Conv2d(layer) => &layer.name,
            Layer::MaxPool2d(layer) => &layer.name,
            Layer::Flatten(layer) => &layer.name,
            Layer::Dense(layer) => &layer.name,
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Conv2d(_) => LayerKind::Conv2d,
            Layer::MaxPool2d(_) => LayerKind::MaxPool2d,
            Layer::Flatten(_) => LayerKind::Flatten,
            Layer::Dense(_) => LayerKind::Dense,
        }
    }

    pub fn is_convolutional(&self) -> bool {
        self.kind() == LayerKind::Conv2d
    }

    fn activation(&self) -> Option<Activation> {
        match self {
            Layer::Conv2d(layer) => Some(layer.activation),
            Layer::Dense(layer) => Some(layer.activation),
            Layer::MaxPool2d(_) | Layer::Flatten(_) => None,
        }
    }

    fn is_built(&self) -> bool {
        match self {
            Layer::Conv2d(layer) => layer.kernel.is_some() && layer.bias.is_some(),
            Layer::Dense(layer) => layer.weights.is_some() && layer.bias.is_some(),
            Layer::MaxPool2d(_) | Layer::Flatten(_) => true,
        }
    }

    fn not_ready(&self) -> Error {
        Error::NotReady {
            layer: self.name().to_string(),
        }
    }

    // Shape of this layer's output for a given input shape, or None if the input does not fit.
    fn output_shape(&self, input: &[usize]) -> Option<Vec<usize>> {
        match self {
            Layer::Conv2d(layer) => {
                let &[h, w, _] = input else { return None };
                let geometry =
                    ConvGeometry::new(h, w, layer.kernel_size, layer.strides, layer.padding)?;
                Some(vec![geometry.out_h, geometry.out_w, layer.filters])
            }
            Layer::MaxPool2d(layer) => {
                let &[h, w, c] = input else { return None };
                if layer.pool_size == 0 || layer.strides == 0 || h < layer.pool_size {
                    return None;
                }
                if w < layer.pool_size {
                    return None;
                }
                Some(vec![
                    (h - layer.pool_size) / layer.strides + 1,
                    (w - layer.pool_size) / layer.strides + 1,
                    c,
                ])
            }
            Layer::Flatten(_) => Some(vec![input.iter().product()]),
            Layer::Dense(layer) => {
                let &[_] = input else { return None };
                Some(vec![layer.units])
            }
        }
    }

    // Whatever weights a layer already holds must match what `build` would allocate for `input`.
    fn check_weights(&self, input: &[usize]) -> Result<()> {
        let mismatch = |expected: Vec<usize>, found: &[usize]| {
            if expected.as_slice() == found {
                Ok(())
            } else {
                Err(Error::ShapeMismatch {
                    layer: self.name().to_string(),
                    expected,
                    found: found.to_vec(),
                })
            }
        };
        match self {
            Layer::Conv2d(layer) => {
                let channels = input.last().copied().unwrap_or(1);
                let k = layer.kernel_size;
                if let Some(kernel) = &layer.kernel {
                    mismatch(vec![k, k, channels, layer.filters], kernel.shape())?;
                }
                if let Some(bias) = &layer.bias {
                    mismatch(vec![layer.filters], bias.shape())?;
                }
            }
            Layer::Dense(layer) => {
                if let Some(weights) = &layer.weights {
                    mismatch(vec![layer.units, input.iter().product()], weights.shape())?;
                }
                if let Some(bias) = &layer.bias {
                    mismatch(vec![layer.units], bias.shape())?;
                }
            }
            Layer::MaxPool2d(_) | Layer::Flatten(_) => {}
        }
        Ok(())
    }

    fn build<R: Rng + ?Sized>(&mut self, input: &[usize], rng: &mut R) {
        match self {
            Layer::Conv2d(layer) => {
                let channels = input.last().copied().unwrap_or(1);
                let k = layer.kernel_size;
                let limit = variance_scaling_limit(k * k * channels);
                layer.kernel = Some(Array::random_using(
                    (k, k, channels, layer.filters),
                    Uniform::new(-limit, limit),
                    rng,
                ));
                layer.bias = Some(Array1::zeros(layer.filters));
            }
            Layer::Dense(layer) => {
                let inputs = input.iter().product();
                let limit = variance_scaling_limit(inputs);
                layer.weights = Some(Array::random_using(
                    (layer.units, inputs),
                    Uniform::new(-limit, limit),
                    rng,
                ));
                layer.bias = Some(Array1::zeros(layer.units));
            }
            Layer::MaxPool2d(_) | Layer::Flatten(_) => {}
        }
    }

    fn forward(&self, input: ArrayD<f32>) -> Result<(ArrayD<f32>, Trace)> {
        match self {
            Layer::Conv2d(layer) => {
                let (kernel, bias) = layer.weights()?;
                let x = input.into_dimensionality::<Ix3>()?;
                let (h, w, c) = x.dim();
                let (kh, kw, kc, filters) = kernel.dim();
                if kc != c {
                    return Err(Error::ShapeMismatch {
                        layer: layer.name.clone(),
                        expected: vec![kh, kw, c, filters],
                        found: kernel.shape().to_vec(),
                    });
                }
                let geometry =
                    ConvGeometry::new(h, w, layer.kernel_size, layer.strides, layer.padding)
                        .ok_or_else(|| {
                            Error::InvalidArchitecture(format!(
                                "{} cannot convolve an input of {h}x{w}",
                                layer.name
                            ))
                        })?;

                // Lower the convolution to one matrix product: each row of `cols` is the receptive
                // field of one output position, laid out in the kernel's (ky, kx, channel) order.
                let cols = im2col(&x, &geometry);
                let flat_kernel = kernel.to_shape((kh * kw * kc, filters))?;
                let z = (cols.dot(&flat_kernel) + bias)
                    .to_shape((geometry.out_h, geometry.out_w, filters))?
                    .into_owned();
                let a = layer.activation.apply(&z);

                Ok((
                    a.clone().into_dyn(),
                    Trace::Conv {
                        cols,
                        input_dim: (h, w, c),
                        geometry,
                        z,
                        a,
                    },
                ))
            }
            Layer::MaxPool2d(layer) => {
                let x = input.into_dimensionality::<Ix3>()?;
                let (h, w, c) = x.dim();
                let shape = self.output_shape(&[h, w, c]).ok_or_else(|| {
                    Error::InvalidArchitecture(format!("{} cannot pool {h}x{w}", layer.name))
                })?;
                let (p, s) = (layer.pool_size, layer.strides);

                let mut output = Array3::zeros((shape[0], shape[1], c));
                let mut argmax = Array3::zeros((shape[0], shape[1], c));
                for ((oy, ox, ch), value) in output.indexed_iter_mut() {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_index = 0;
                    for py in 0..p {
                        for px in 0..p {
                            let (iy, ix) = (oy * s + py, ox * s + px);
                            if x[[iy, ix, ch]] > best {
                                best = x[[iy, ix, ch]];
                                best_index = (iy * w + ix) * c + ch;
                            }
                        }
                    }
                    *value = best;
                    argmax[[oy, ox, ch]] = best_index;
                }

                Ok((
                    output.into_dyn(),
                    Trace::Pool {
                        input_dim: (h, w, c),
                        argmax,
                    },
                ))
            }
            Layer::Flatten(_) => {
                let input_shape = input.shape().to_vec();
                let flat: Array1<f32> = input.iter().copied().collect();
                Ok((flat.into_dyn(), Trace::Flatten { input_shape }))
            }
            Layer::Dense(layer) => {
                let (Some(weights), Some(bias)) = (&layer.weights, &layer.bias) else {
                    return Err(self.not_ready());
                };
                let x = input.into_dimensionality::<Ix1>()?;
                if weights.ncols() != x.len() {
                    return Err(Error::ShapeMismatch {
                        layer: layer.name.clone(),
                        expected: vec![layer.units, x.len()],
                        found: weights.shape().to_vec(),
                    });
                }
                let z = weights.dot(&x) + bias;
                let a = layer.activation.apply(&z);
                Ok((a.clone().into_dyn(), Trace::Dense { input: x, z, a }))
            }
        }
    }

    // Given dL/d(output), or dL/dz directly when `pre_activation` is set, return dL/d(input) and
    // this layer's parameter gradient.
    fn backward(
        &self,
        trace: &Trace,
        grad: ArrayD<f32>,
        pre_activation: bool,
    ) -> Result<(ArrayD<f32>, Option<Gradient>)> {
        match (self, trace) {
            (
                Layer::Conv2d(layer),
                Trace::Conv {
                    cols,
                    input_dim,
                    geometry,
                    z,
                    a,
                },
            ) => {
                let (kernel, _) = layer.weights()?;
                let (kh, kw, kc, filters) = kernel.dim();
                let grad = grad.into_dimensionality::<Ix3>()?;
                let dz = if pre_activation {
                    grad
                } else {
                    grad * layer.activation.derivative(z, a)
                };

                let dz = dz
                    .to_shape((geometry.out_h * geometry.out_w, filters))?
                    .into_owned();
                let flat_kernel = kernel.to_shape((kh * kw * kc, filters))?;
                let d_kernel = cols
                    .t()
                    .dot(&dz)
                    .to_shape((kh, kw, kc, filters))?
                    .into_owned();
                let d_bias = dz.sum_axis(Axis(0));
                let d_cols = dz.dot(&flat_kernel.t());
                let d_input = col2im(&d_cols, *input_dim, geometry);

                Ok((
                    d_input.into_dyn(),
                    Some(Gradient::Conv {
                        kernel: d_kernel,
                        bias: d_bias,
                    }),
                ))
            }
            (Layer::MaxPool2d(_), Trace::Pool { input_dim, argmax }) => {
                let (h, w, c) = *input_dim;
                let mut d_input = vec![0.0; h * w * c];
                for (g, &index) in grad.iter().zip(argmax.iter()) {
                    d_input[index] += g;
                }
                Ok((Array3::from_shape_vec((h, w, c), d_input)?.into_dyn(), None))
            }
            (Layer::Flatten(_), Trace::Flatten { input_shape }) => {
                Ok((grad.to_shape(IxDyn(input_shape))?.into_owned(), None))
            }
            (Layer::Dense(layer), Trace::Dense { input, z, a }) => {
                let Some(weights) = &layer.weights else {
                    return Err(self.not_ready());
                };
                let grad = grad.into_dimensionality::<Ix1>()?;
                let dz = if pre_activation {
                    grad
                } else {
                    grad * layer.activation.derivative(z, a)
                };

                let d_weights = dz
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&input.view().insert_axis(Axis(0)));
                let d_input = weights.t().dot(&dz);

                Ok((
                    d_input.into_dyn(),
                    Some(Gradient::Dense {
                        weights: d_weights,
                        bias: dz,
                    }),
                ))
            }
            _ => Err(Error::InvalidArchitecture(format!(
                "{} received a trace from a different kind of layer",
                self.name()
            ))),
        }
    }

    fn apply_gradient(&mut self, gradient: &Gradient, scale: f32) {
        match (self, gradient) {
            (Layer::Conv2d(layer), Gradient::Conv { kernel, bias }) => {
                if let (Some(k), Some(b)) = (&mut layer.kernel, &mut layer.bias) {
                    k.scaled_add(-scale, kernel);
                    b.scaled_add(-scale, bias);
                }
            }
            (Layer::Dense(layer), Gradient::Dense { weights, bias }) => {
                if let (Some(w), Some(b)) = (&mut layer.weights, &mut layer.bias) {
                    w.scaled_add(-scale, weights);
                    b.scaled_add(-scale, bias);
                }
            }
            _ => {}
        }
    }
}

impl Gradient {
    fn accumulate(&mut self, other: Gradient) {
        match (self, other) {
            (
                Gradient::Conv { kernel, bias },
                Gradient::Conv {
                    kernel: k,
                    bias: b,
                },
            ) => {
                *kernel += &k;
                *bias += &b;
            }
            (
                Gradient::Dense { weights, bias },
                Gradient::Dense {
                    weights: w,
                    bias: b,
                },
            ) => {
                *weights += &w;
                *bias += &b;
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    kernel: usize,
    stride: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

impl ConvGeometry {
    fn new(
        in_h: usize,
        in_w: usize,
        kernel: usize,
        stride: usize,
        padding: Padding,
    ) -> Option<ConvGeometry> {
        let (out_h, pad_top) = output_extent(in_h, kernel, stride, padding)?;
        let (out_w, pad_left) = output_extent(in_w, kernel, stride, padding)?;
        Some(ConvGeometry {
            kernel,
            stride,
            out_h,
            out_w,
            pad_top,
            pad_left,
        })
    }

    // Input coordinate that kernel offset `k` of output position `o` reads from, if it falls
    // inside the input rather than in the zero padding.
    fn source(&self, o: usize, k: usize, pad: usize, extent: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(pad)
            .filter(|&i| i < extent)
    }
}

// Output length and leading padding along one axis. `Same` pads so that the output is
// ceil(input / stride) long, with any odd padding pixel going after the input.
fn output_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Option<(usize, usize)> {
    if input == 0 || kernel == 0 || stride == 0 {
        return None;
    }
    match padding {
        Padding::Valid => {
            if input < kernel {
                return None;
            }
            Some(((input - kernel) / stride + 1, 0))
        }
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Some((out, total / 2))
        }
    }
}

fn im2col(input: &Array3<f32>, g: &ConvGeometry) -> Array2<f32> {
    let (h, w, c) = input.dim();
    let k = g.kernel;
    let mut cols = Array2::zeros((g.out_h * g.out_w, k * k * c));
    for oy in 0..g.out_h {
        for ox in 0..g.out_w {
            let mut row = cols.row_mut(oy * g.out_w + ox);
            for ky in 0..k {
                let Some(iy) = g.source(oy, ky, g.pad_top, h) else {
                    continue;
                };
                for kx in 0..k {
                    let Some(ix) = g.source(ox, kx, g.pad_left, w) else {
                        continue;
                    };
                    for ch in 0..c {
                        row[(ky * k + kx) * c + ch] = input[[iy, ix, ch]];
                    }
                }
            }
        }
    }
    cols
}

// Adjoint of im2col: scatter-add every receptive-field gradient back onto the input positions it
// was read from.
fn col2im(cols: &Array2<f32>, input_dim: (usize, usize, usize), g: &ConvGeometry) -> Array3<f32> {
    let (h, w, c) = input_dim;
    let k = g.kernel;
    let mut input = Array3::zeros((h, w, c));
    for oy in 0..g.out_h {
        for ox in 0..g.out_w {
            let row = cols.row(oy * g.out_w + ox);
            for ky in 0..k {
                let Some(iy) = g.source(oy, ky, g.pad_top, h) else {
                    continue;
                };
                for kx in 0..k {
                    let Some(ix) = g.source(ox, kx, g.pad_left, w) else {
                        continue;
                    };
                    for ch in 0..c {
                        input[[iy, ix, ch]] += row[(ky * k + kx) * c + ch];
                    }
                }
            }
        }
    }
    input
}

// Uniform bound giving a variance of 1 / fan_in.
fn variance_scaling_limit(fan_in: usize) -> f32 {
    (3.0 / fan_in.max(1) as f32).sqrt()
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// A sequential network whose layers are built lazily: nothing is allocated until `warm` runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    input_shape: [usize; 3],
    layers: Vec<Layer>,
    // Bumped whenever any weight changes, so stale extractions can be detected.
    #[serde(skip)]
    version: u64,
}

impl Network {
    pub fn new(input_shape: [usize; 3], specs: &[LayerSpec]) -> Result<Network> {
        let mut counters = [0usize; 4];
        let mut next_name = |slot: usize, prefix: &str| {
            counters[slot] += 1;
            format!("{prefix}_{}", counters[slot])
        };

        let layers = specs
            .iter()
            .map(|spec| match *spec {
                LayerSpec::Conv2d {
                    filters,
                    kernel_size,
                    strides,
                    padding,
                    activation,
                } => Layer::Conv2d(Conv2d {
                    name: next_name(0, "conv2d"),
                    filters,
                    kernel_size,
                    strides,
                    padding,
                    activation,
                    kernel: None,
                    bias: None,
                }),
                LayerSpec::MaxPool2d { pool_size, strides } => Layer::MaxPool2d(MaxPool2d {
                    name: next_name(1, "max_pooling2d"),
                    pool_size,
                    strides: strides.unwrap_or(pool_size),
                }),
                LayerSpec::Flatten => Layer::Flatten(Flatten {
                    name: next_name(2, "flatten"),
                }),
                LayerSpec::Dense { units, activation } => Layer::Dense(Dense {
                    name: next_name(3, "dense"),
                    units,
                    activation,
                    weights: None,
                    bias: None,
                }),
            })
            .collect();

        let network = Network {
            input_shape,
            layers,
            version: 0,
        };
        network.validate()?;
        Ok(network)
    }

    /// 28x28 greyscale digits to 10 classes: two 5x5 convolutions each followed by 2x2 pooling.
    pub fn digit_classifier() -> Result<Network> {
        Network::new([28, 28, 1], &Network::digit_classifier_specs())
    }

    pub fn digit_classifier_specs() -> Vec<LayerSpec> {
        vec![
            LayerSpec::Conv2d {
                filters: 8,
                kernel_size: 5,
                strides: 1,
                padding: Padding::Valid,
                activation: Activation::Relu,
            },
            LayerSpec::MaxPool2d {
                pool_size: 2,
                strides: Some(2),
            },
            LayerSpec::Conv2d {
                filters: 16,
                kernel_size: 5,
                strides: 1,
                padding: Padding::Valid,
                activation: Activation::Relu,
            },
            LayerSpec::MaxPool2d {
                pool_size: 2,
                strides: Some(2),
            },
            LayerSpec::Flatten,
            LayerSpec::Dense {
                units: 10,
                activation: Activation::Softmax,
            },
        ]
    }

    /// 32x32 colour images to a single realness score.
    pub fn discriminator() -> Result<Network> {
        let conv = |filters, strides| LayerSpec::Conv2d {
            filters,
            kernel_size: 3,
            strides,
            padding: Padding::Same,
            activation: Activation::LeakyRelu(0.2),
        };
        let specs = [
            conv(8, 2),
            conv(16, 1),
            conv(16, 2),
            conv(16, 1),
            LayerSpec::Flatten,
            LayerSpec::Dense {
                units: 1,
                activation: Activation::Sigmoid,
            },
        ];
        Network::new([32, 32, 3], &specs)
    }

    fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::InvalidArchitecture("network has no layers".into()));
        }
        let last = self.layers.len() - 1;
        let mut shape = self.input_shape.to_vec();
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.activation() == Some(Activation::Softmax) && index != last {
                return Err(Error::InvalidArchitecture(format!(
                    "{} uses softmax but is not the output layer",
                    layer.name()
                )));
            }
            layer.check_weights(&shape)?;
            shape = layer.output_shape(&shape).ok_or_else(|| {
                Error::InvalidArchitecture(format!(
                    "{} cannot take an input of shape {shape:?}",
                    layer.name()
                ))
            })?;
            if shape.contains(&0) {
                return Err(Error::InvalidArchitecture(format!(
                    "{} produces an empty output",
                    layer.name()
                )));
            }
        }
        if shape.len() != 1 {
            return Err(Error::InvalidArchitecture(format!(
                "network output must be flat, got shape {shape:?}"
            )));
        }
        Ok(())
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Convolutional layers in network order, with their position in `layers()`.
    pub fn conv_layers(&self) -> impl Iterator<Item = (usize, &Conv2d)> {
        self.layers
            .iter()
            .enumerate()
            .filter_map(|(index, layer)| match layer {
                Layer::Conv2d(conv) => Some((index, conv)),
                _ => None,
            })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_built(&self) -> bool {
        self.layers.iter().all(Layer::is_built)
    }

    /// Allocate any missing weights and run a dummy forward pass of zeros, returning its output.
    pub fn warm<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Array1<f32>> {
        if !self.is_built() {
            let mut shape = self.input_shape.to_vec();
            for layer in &mut self.layers {
                if !layer.is_built() {
                    layer.build(&shape, rng);
                }
                shape = layer.output_shape(&shape).ok_or_else(|| {
                    Error::InvalidArchitecture(format!("{} cannot be built", layer.name()))
                })?;
            }
            self.version += 1;
            debug!(version = self.version, "network built");
        }
        let [h, w, c] = self.input_shape;
        self.predict(&Array3::zeros((h, w, c)))
    }

    pub fn predict(&self, input: &Array3<f32>) -> Result<Array1<f32>> {
        let (output, _) = self.forward(input)?;
        Ok(output)
    }

    fn forward(&self, input: &Array3<f32>) -> Result<(Array1<f32>, Vec<Trace>)> {
        let mut activation = input.clone().into_dyn();
        let mut traces = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (output, trace) = layer.forward(activation)?;
            traces.push(trace);
            activation = output;
        }
        Ok((activation.into_dimensionality::<Ix1>()?, traces))
    }

    /// One step of mini-batch gradient descent. Returns the mean loss over the batch.
    pub fn train_batch(&mut self, mini_batch: &[Sample], learning_rate: f32) -> Result<f32> {
        if mini_batch.is_empty() {
            return Ok(0.0);
        }
        if let Some(layer) = self.layers.iter().find(|layer| !layer.is_built()) {
            return Err(layer.not_ready());
        }

        let mut total: Vec<Option<Gradient>> = self.layers.iter().map(|_| None).collect();
        let mut loss = 0.0;
        for sample in mini_batch {
            let (gradients, sample_loss) = self.backpropagate(sample)?;
            loss += sample_loss;
            for (slot, gradient) in total.iter_mut().zip(gradients) {
                match (slot.as_mut(), gradient) {
                    (Some(sum), Some(gradient)) => sum.accumulate(gradient),
                    (None, gradient) => *slot = gradient,
                    (Some(_), None) => {}
                }
            }
        }

        let scale = learning_rate / mini_batch.len() as f32;
        for (layer, gradient) in self.layers.iter_mut().zip(&total) {
            if let Some(gradient) = gradient {
                layer.apply_gradient(gradient, scale);
            }
        }
        self.version += 1;

        Ok(loss / mini_batch.len() as f32)
    }

    // Gradients of every layer's parameters for one sample, along with that sample's loss.
    fn backpropagate(&self, sample: &Sample) -> Result<(Vec<Option<Gradient>>, f32)> {
        let (output, traces) = self.forward(&sample.input)?;
        if output.len() != sample.target.len() {
            return Err(Error::ShapeMismatch {
                layer: "output".into(),
                expected: vec![output.len()],
                found: vec![sample.target.len()],
            });
        }

        let last = self.layers.len() - 1;
        let output_activation = self.layers[last].activation();
        let (delta, loss) = output_delta(output_activation, &output, &sample.target);

        let mut gradients: Vec<Option<Gradient>> = self.layers.iter().map(|_| None).collect();
        let mut grad = delta.into_dyn();
        for (index, (layer, trace)) in self.layers.iter().zip(&traces).enumerate().rev() {
            // Softmax and sigmoid outputs pair with cross-entropy, whose gradient with respect to
            // the pre-activation is simply a - y.
            let pre_activation = index == last && output_activation.is_some();
            let (d_input, gradient) = layer.backward(trace, grad, pre_activation)?;
            gradients[index] = gradient;
            grad = d_input;
        }

        Ok((gradients, loss))
    }

    /// How many samples the network classifies correctly.
    pub fn evaluate(&self, samples: &[Sample]) -> Result<usize> {
        let mut correct = 0;
        for sample in samples {
            let output = self.predict(&sample.input)?;
            let predicted = if output.len() == 1 {
                usize::from(output[0] > 0.5)
            } else {
                output
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(index, _)| index)
                    .unwrap_or_default()
            };
            if predicted == sample.label as usize {
                correct += 1;
            }
        }
        Ok(correct)
    }

    /// Kernel and bias of the layer at `index` in `layers()`.
    pub fn conv_weights(&self, index: usize) -> Result<(&Array4<f32>, &Array1<f32>)> {
        self.conv_layer(index)?.weights()
    }

    /// Replace the kernel and bias of the convolutional layer at `index` in `layers()`. The new
    /// tensors must have exactly the shapes of the ones they replace.
    pub fn set_conv_weights(
        &mut self,
        index: usize,
        kernel: Array4<f32>,
        bias: Array1<f32>,
    ) -> Result<()> {
        let (current_kernel, current_bias) = self.conv_layer(index)?.weights()?;
        let layer = self.conv_layer(index)?.name.clone();
        if current_kernel.shape() != kernel.shape() {
            return Err(Error::ShapeMismatch {
                layer,
                expected: current_kernel.shape().to_vec(),
                found: kernel.shape().to_vec(),
            });
        }
        if current_bias.shape() != bias.shape() {
            return Err(Error::ShapeMismatch {
                layer,
                expected: current_bias.shape().to_vec(),
                found: bias.shape().to_vec(),
            });
        }

        if let Some(Layer::Conv2d(conv)) = self.layers.get_mut(index) {
            conv.kernel = Some(kernel);
            conv.bias = Some(bias);
        }
        self.version += 1;
        Ok(())
    }

    fn conv_layer(&self, index: usize) -> Result<&Conv2d> {
        match self.layers.get(index) {
            Some(Layer::Conv2d(conv)) => Ok(conv),
            Some(other) => Err(Error::InvalidArchitecture(format!(
                "{} is not a convolutional layer",
                other.name()
            ))),
            None => Err(Error::InvalidArchitecture(format!(
                "network has no layer {index}"
            ))),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Network> {
        let reader = BufReader::new(File::open(path)?);
        let network: Network = serde_json::from_reader(reader)?;
        network.validate()?;
        Ok(network)
    }
}

// dL/dz at the output and the loss itself. Softmax pairs with categorical cross-entropy, sigmoid
// with binary cross-entropy; anything else falls back to a quadratic cost.
fn output_delta(
    activation: Option<Activation>,
    output: &Array1<f32>,
    target: &Array1<f32>,
) -> (Array1<f32>, f32) {
    const EPSILON: f32 = 1e-7;
    let error = output - target;
    match activation {
        Some(Activation::Softmax) => {
            let loss = -Zip::from(output)
                .and(target)
                .fold(0.0, |acc, &a, &y| acc + y * a.max(EPSILON).ln());
            (error, loss)
        }
        Some(Activation::Sigmoid) => {
            let loss = -Zip::from(output).and(target).fold(0.0, |acc, &a, &y| {
                let a = a.clamp(EPSILON, 1.0 - EPSILON);
                acc + y * a.ln() + (1.0 - y) * (1.0 - a).ln()
            });
            (error, loss)
        }
        Some(other) => {
            // Quadratic cost: the delta still needs the activation's slope, which the layer
            // applies itself when `pre_activation` is off. Fold it in here instead so every output
            // path hands back dL/dz.
            let slope = other.derivative(output, output);
            let loss = 0.5 * error.mapv(|e| e * e).sum();
            (error * slope, loss)
        }
        None => {
            let loss = 0.5 * error.mapv(|e| e * e).sum();
            (error, loss)
        }
    }
}
