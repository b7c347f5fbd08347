use crate::kernel_id::KernelId;

/// Everything that can go wrong while moving weights between a network and its pixel view.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // The layer exists but has never seen an input, so its kernel has not been allocated yet.
    #[error("layer `{layer}` has no weights yet; warm the network before extracting kernels")]
    NotReady { layer: String },

    #[error("layer `{layer}` expects weights of shape {expected:?} but got {found:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("grid was extracted at weight version {grid} but the network is at version {network}")]
    StaleGrid { grid: u64, network: u64 },

    #[error("`{0}` is not a kernel id of the form l<layer>-f<filter>-k<channel>")]
    InvalidKernelId(String),

    #[error("kernel {0} does not exist in the current grid")]
    UnknownKernel(KernelId),

    #[error(
        "edit buffer of {buffer_width}x{buffer_height} has no {tile_width}x{tile_height} window at ({x}, {y})"
    )]
    PixelWindow {
        buffer_width: usize,
        buffer_height: usize,
        tile_width: usize,
        tile_height: usize,
        x: usize,
        y: usize,
    },

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("training is already running")]
    AlreadyTraining,

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("network lock was poisoned by a panicking writer")]
    Poisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
