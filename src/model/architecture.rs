use crate::model::ModelConfig;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu};
use burn::prelude::*;

/// Pooled-feature classifier over OCT volumes
#[derive(Module, Debug)]
pub struct VolumeClassifier<B: Backend> {
    /// Hidden layer, present for MLP heads
    pub(crate) hidden: Option<Linear<B>>,
    /// Output layer
    pub(crate) head: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> VolumeClassifier<B> {
    /// Per-channel mean and max over frames and pixels: `[b, f, c, h, w] -> [b, 2c]`
    fn pool(x: Tensor<B, 5>) -> Tensor<B, 2> {
        let [b, f, c, h, w] = x.dims();
        let flat = x.swap_dims(1, 2).reshape([b, c, f * h * w]);
        let mean = flat.clone().mean_dim(2).reshape([b, c]);
        let max = flat.max_dim(2).reshape([b, c]);
        Tensor::cat(vec![mean, max], 1)
    }

    /// Logits for a batch; a high-resolution stream is averaged in when given
    pub fn forward(&self, volumes: Tensor<B, 5>, high_res: Option<Tensor<B, 5>>) -> Tensor<B, 2> {
        let mut features = Self::pool(volumes);
        if let Some(hr) = high_res {
            features = (features + Self::pool(hr)).div_scalar(2.0);
        }

        let x = match &self.hidden {
            Some(hidden) => self.activation.forward(hidden.forward(features)),
            None => features,
        };
        let x = self.dropout.forward(x);
        self.head.forward(x)
    }
}

/// Initialize a classifier from configuration
pub fn init_model<B: Backend>(config: &ModelConfig, device: &B::Device) -> VolumeClassifier<B> {
    let features = config.feature_size();
    let (hidden, head_in) = if config.variant.has_hidden_layer() {
        let hidden = LinearConfig::new(features, config.hidden_size)
            .with_bias(true)
            .init(device);
        (Some(hidden), config.hidden_size)
    } else {
        (None, features)
    };

    VolumeClassifier {
        hidden,
        head: LinearConfig::new(head_in, config.num_outputs)
            .with_bias(true)
            .init(device),
        dropout: DropoutConfig::new(config.dropout).init(),
        activation: Relu::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelVariant;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shapes() {
        let device = <TestBackend as Backend>::Device::default();
        for variant in ModelVariant::ALL {
            let config = ModelConfig::for_variant(variant, 3, 2);
            let model = init_model::<TestBackend>(&config, &device);

            let frames = if variant == ModelVariant::LinearProbe2d { 1 } else { 4 };
            let input = Tensor::<TestBackend, 5>::zeros([2, frames, 3, 8, 8], &device);
            assert_eq!(model.forward(input, None).dims(), [2, 2]);
        }
    }

    #[test]
    fn test_forward_with_high_res() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::for_variant(ModelVariant::PooledMlp3d, 1, 3);
        let model = init_model::<TestBackend>(&config, &device);

        let low = Tensor::<TestBackend, 5>::ones([2, 4, 1, 8, 8], &device);
        let high = Tensor::<TestBackend, 5>::ones([2, 6, 1, 16, 16], &device);
        assert_eq!(model.forward(low, Some(high)).dims(), [2, 3]);
    }
}
