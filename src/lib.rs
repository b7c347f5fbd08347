//! Watch the convolution kernels of a small network evolve while it trains, and paint over them.
//!
//! Kernels are pulled out of a [`Network`] as a [`KernelGrid`] of single-channel tiles, drawn as
//! grey pixel buffers (or as a red/blue diff against two ticks ago), edited as pixels, and pushed
//! back into the live network. [`Workbench`] owns the network while it trains so that edits and
//! gradient steps never interleave.

pub mod codec;
pub mod config;
pub mod error;
pub mod grid;
pub mod history;
pub mod kernel_id;
pub mod mnist;
pub mod network;
pub mod render;
pub mod telemetry;
pub mod training;

pub use config::Config;
pub use error::{Error, Result};
pub use grid::{EditRequest, KernelGrid, LayerTiles, Tile};
pub use history::{TileHistory, TileHistoryStore};
pub use kernel_id::KernelId;
pub use network::Network;
pub use render::{RenderedLayer, Renderer, SheetLayout, Snapshot};
pub use training::{TrainingControl, TrainingState, Workbench};
