use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::history;
use crate::network::{LayerSpec, Network};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub render: RenderConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Extract and draw the kernels after every this many epochs. Zero disables ticks.
    pub render_every: u32,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 1000,
            batch_size: 32,
            learning_rate: 0.05,
            render_every: 10,
            shuffle: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    pub dir: PathBuf,
    pub train_limit: Option<usize>,
    pub test_limit: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            dir: PathBuf::from("data"),
            train_limit: None,
            test_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub diff: bool,
    pub history_depth: usize,
    /// Zoom factor for exported PNGs.
    pub scale: u32,
    pub out_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            diff: true,
            history_depth: history::DEFAULT_DEPTH,
            scale: 8,
            out_dir: PathBuf::from("kernels"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub input_shape: [usize; 3],
    pub layers: Vec<LayerSpec>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            input_shape: [28, 28, 1],
            layers: Network::digit_classifier_specs(),
        }
    }
}

impl NetworkConfig {
    pub fn build(&self) -> Result<Network> {
        Network::new(self.input_shape, &self.layers)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let raw = fs::read_to_string(path)?;
        Config::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config> {
        Ok(toml::from_str(raw)?)
    }

    /// Read `path` if one is given, otherwise fall back to the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        path.map_or_else(|| Ok(Config::default()), Config::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::{Activation, Padding};

    #[test]
    fn empty_file_gives_the_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.training.render_every, 10);
        assert_eq!(config.render.history_depth, 3);
        assert_eq!(config.network.layers.len(), 6);
    }

    #[test]
    fn partial_sections_keep_the_other_defaults() {
        let config = Config::parse(
            r#"
            [training]
            epochs = 20
            seed = 9

            [render]
            diff = false
            "#,
        )
        .unwrap();
        assert_eq!(config.training.epochs, 20);
        assert_eq!(config.training.seed, Some(9));
        assert_eq!(config.training.batch_size, 32);
        assert!(!config.render.diff);
        assert_eq!(config.render.scale, 8);
    }

    #[test]
    fn layers_can_be_described_inline() {
        let config = Config::parse(
            r#"
            [network]
            input_shape = [32, 32, 3]

            [[network.layers]]
            type = "conv2d"
            filters = 8
            kernel_size = 3
            strides = 2
            padding = "same"
            activation = { leaky_relu = 0.2 }

            [[network.layers]]
            type = "flatten"

            [[network.layers]]
            type = "dense"
            units = 1
            activation = "sigmoid"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.network.layers[0],
            LayerSpec::Conv2d {
                filters: 8,
                kernel_size: 3,
                strides: 2,
                padding: Padding::Same,
                activation: Activation::LeakyRelu(0.2),
            }
        );
        let network = config.network.build().unwrap();
        assert_eq!(network.conv_layers().count(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::parse("[training]\nepoch = 3\n"),
            Err(Error::Config(_))
        ));
    }
}
