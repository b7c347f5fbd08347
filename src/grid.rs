// Pixel-sized view of every convolution kernel in a network.
//
// A layer's kernel is one (kh, kw, in_channels, filters) tensor. The grid cuts it into
// filters x in_channels single-channel (kh, kw) tiles so each one can be drawn and edited on its
// own, then stacks them back into the original tensor for write-back. The network always stays
// the authoritative copy: a grid is a snapshot taken at one weight version and is consumed by the
// write-back.

use ndarray::{Array2, Array4, ArrayView2, Axis, s, stack};
use tracing::{debug, info};

use crate::codec;
use crate::error::{Error, Result};
use crate::kernel_id::KernelId;
use crate::network::Network;
use crate::render::Snapshot;

/// One (kh, kw) slice of a kernel, holding raw weights.
pub type Tile = Array2<f32>;

/// Every tile of one convolutional layer, indexed `[filter][channel]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTiles {
    pub name: String,
    /// Position of the layer in `Network::layers()`.
    pub layer_index: usize,
    /// (kh, kw, in_channels, filters), as the layer stores it.
    pub kernel_shape: [usize; 4],
    pub filters: Vec<Vec<Tile>>,
}

impl LayerTiles {
    pub fn tile_height(&self) -> usize {
        self.kernel_shape[0]
    }

    pub fn tile_width(&self) -> usize {
        self.kernel_shape[1]
    }

    pub fn channels(&self) -> usize {
        self.kernel_shape[2]
    }

    pub fn filter_count(&self) -> usize {
        self.kernel_shape[3]
    }

    // Stack channels along axis 2 for each filter, then the filters along axis 3.
    fn reassemble(&self) -> Result<Array4<f32>> {
        let mismatch = |found: Vec<usize>| Error::ShapeMismatch {
            layer: self.name.clone(),
            expected: self.kernel_shape.to_vec(),
            found,
        };
        if self.filters.is_empty() || self.filters.iter().any(|channels| channels.is_empty()) {
            return Err(mismatch(vec![self.filters.len(), 0]));
        }

        let blocks = self
            .filters
            .iter()
            .map(|channels| {
                let views: Vec<ArrayView2<f32>> = channels.iter().map(Tile::view).collect();
                stack(Axis(2), &views)
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| mismatch(self.ragged_shape()))?;
        let block_views: Vec<_> = blocks.iter().map(|block| block.view()).collect();
        let kernel = stack(Axis(3), &block_views).map_err(|_| mismatch(self.ragged_shape()))?;

        if kernel.shape() != self.kernel_shape {
            return Err(mismatch(kernel.shape().to_vec()));
        }
        Ok(kernel)
    }

    // Best-effort description of a grid whose tiles no longer line up, for error reporting.
    fn ragged_shape(&self) -> Vec<usize> {
        let first = self.filters.first().and_then(|channels| channels.first());
        vec![
            first.map_or(0, |tile| tile.nrows()),
            first.map_or(0, |tile| tile.ncols()),
            self.filters.first().map_or(0, Vec::len),
            self.filters.len(),
        ]
    }
}

/// A pixel buffer produced by the editor for one tile. The tile is read from the `tile_width` x
/// `tile_height` window whose top-left corner sits at `origin`, which lets a whole layer sheet be
/// submitted with the offset of the edited tile.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub id: KernelId,
    pub pixels: Snapshot,
    pub origin: (usize, usize),
}

impl EditRequest {
    pub fn new(id: KernelId, pixels: Snapshot) -> EditRequest {
        EditRequest {
            id,
            pixels,
            origin: (0, 0),
        }
    }

    pub fn at(mut self, x: usize, y: usize) -> EditRequest {
        self.origin = (x, y);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelGrid {
    layers: Vec<LayerTiles>,
    version: u64,
}

impl KernelGrid {
    /// Copy every convolutional kernel out of `network`, in layer order, then filter order, then
    /// channel order. Fails with `NotReady` if any convolutional layer has not been built.
    pub fn extract(network: &Network) -> Result<KernelGrid> {
        let mut layers = Vec::new();
        for (layer_index, conv) in network.conv_layers() {
            let (kernel, _) = conv.weights()?;
            let (kh, kw, channels, filters) = kernel.dim();

            let tiles = (0..filters)
                .map(|f| {
                    (0..channels)
                        .map(|c| kernel.slice(s![.., .., c, f]).to_owned())
                        .collect()
                })
                .collect();

            layers.push(LayerTiles {
                name: conv.name.clone(),
                layer_index,
                kernel_shape: [kh, kw, channels, filters],
                filters: tiles,
            });
        }

        debug!(
            layers = layers.len(),
            version = network.version(),
            "extracted kernel grid"
        );
        Ok(KernelGrid {
            layers,
            version: network.version(),
        })
    }

    pub fn layers(&self) -> &[LayerTiles] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&LayerTiles> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    /// Weight version of the network at the moment of extraction.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tile(&self, id: KernelId) -> Option<&Tile> {
        self.layers
            .get(id.layer)?
            .filters
            .get(id.filter)?
            .get(id.channel)
    }

    /// All tiles with their ids, in extraction order.
    pub fn iter(&self) -> impl Iterator<Item = (KernelId, &Tile)> {
        self.layers.iter().enumerate().flat_map(|(l, layer)| {
            layer.filters.iter().enumerate().flat_map(move |(f, channels)| {
                channels
                    .iter()
                    .enumerate()
                    .map(move |(c, tile)| (KernelId::new(l, f, c), tile))
            })
        })
    }

    /// Total number of tiles across all layers.
    pub fn len(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.filters.iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace one tile with new weights of the same shape.
    pub fn replace_tile(&mut self, id: KernelId, tile: Tile) -> Result<()> {
        let layer = self
            .layers
            .get_mut(id.layer)
            .ok_or(Error::UnknownKernel(id))?;
        let name = layer.name.clone();
        let slot = layer
            .filters
            .get_mut(id.filter)
            .and_then(|channels| channels.get_mut(id.channel))
            .ok_or(Error::UnknownKernel(id))?;
        if slot.dim() != tile.dim() {
            return Err(Error::ShapeMismatch {
                layer: name,
                expected: slot.shape().to_vec(),
                found: tile.shape().to_vec(),
            });
        }
        *slot = tile;
        Ok(())
    }

    /// Decode an edited pixel buffer back into weights and put it in place of the addressed tile.
    /// Only the red channel is read; tiles are drawn in grey so all three colour channels agree.
    pub fn ingest_edit(&mut self, request: &EditRequest) -> Result<()> {
        let (height, width) = self
            .tile(request.id)
            .ok_or(Error::UnknownKernel(request.id))?
            .dim();
        let (x, y) = request.origin;
        let pixels = &request.pixels;
        let fits = |start: usize, len: usize, limit: usize| {
            start.checked_add(len).is_some_and(|end| end <= limit)
        };
        if !fits(x, width, pixels.width()) || !fits(y, height, pixels.height()) {
            return Err(Error::PixelWindow {
                buffer_width: pixels.width(),
                buffer_height: pixels.height(),
                tile_width: width,
                tile_height: height,
                x,
                y,
            });
        }

        let tile = Tile::from_shape_fn((height, width), |(row, col)| {
            codec::decode(pixels.pixel(x + col, y + row)[0])
        });
        self.replace_tile(request.id, tile)?;
        info!(kernel = %request.id, "ingested kernel edit");
        Ok(())
    }

    /// Rebuild each layer's (kh, kw, in_channels, filters) kernel from its tiles, paired with the
    /// layer's position in the network.
    pub fn reassemble(&self) -> Result<Vec<(usize, Array4<f32>)>> {
        self.layers
            .iter()
            .map(|layer| Ok((layer.layer_index, layer.reassemble()?)))
            .collect()
    }

    /// Write every reassembled kernel into `network`, keeping each layer's current bias. The grid
    /// must have been extracted from the network's current weights; it is consumed because it no
    /// longer describes the network once the write has happened.
    pub fn write_back(self, network: &mut Network) -> Result<()> {
        if self.version != network.version() {
            return Err(Error::StaleGrid {
                grid: self.version,
                network: network.version(),
            });
        }

        // Reassemble everything before touching the network so a bad layer leaves it unchanged.
        let kernels = self.reassemble()?;
        for (layer_index, kernel) in kernels {
            let (current, bias) = network.conv_weights(layer_index)?;
            if current.shape() != kernel.shape() {
                return Err(Error::ShapeMismatch {
                    layer: network.layers()[layer_index].name().to_string(),
                    expected: current.shape().to_vec(),
                    found: kernel.shape().to_vec(),
                });
            }
            let bias = bias.clone();
            network.set_conv_weights(layer_index, kernel, bias)?;
        }
        info!(
            layers = self.layers.len(),
            version = network.version(),
            "wrote kernel grid back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

    fn warmed_classifier() -> Network {
        let mut network = Network::digit_classifier().unwrap();
        network.warm(&mut StdRng::seed_from_u64(42)).unwrap();
        network
    }

    fn white(width: usize, height: usize) -> Snapshot {
        Snapshot::from_fn(width, height, |_, _| [255, 255, 255, 255])
    }

    #[test]
    fn extraction_before_warming_is_not_ready() {
        let network = Network::digit_classifier().unwrap();
        assert!(matches!(
            KernelGrid::extract(&network),
            Err(Error::NotReady { layer }) if layer == "conv2d_1"
        ));
    }

    #[test]
    fn extraction_covers_every_filter_and_channel() {
        let network = warmed_classifier();
        let grid = KernelGrid::extract(&network).unwrap();

        let layers = grid.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].filters.len(), 8);
        assert!(layers[0].filters.iter().all(|channels| channels.len() == 1));
        assert_eq!(layers[1].filters.len(), 16);
        assert!(layers[1].filters.iter().all(|channels| channels.len() == 8));
        assert!(grid.iter().all(|(_, tile)| tile.dim() == (5, 5)));
        assert_eq!(grid.len(), 8 + 16 * 8);
        assert_eq!(layers[1].layer_index, 2);
        assert!(grid.layer("conv2d_2").is_some());
    }

    #[test]
    fn tiles_are_slices_of_the_kernel() {
        let network = warmed_classifier();
        let grid = KernelGrid::extract(&network).unwrap();
        let (kernel, _) = network.conv_weights(2).unwrap();

        let tile = grid.tile(KernelId::new(1, 11, 6)).unwrap();
        for row in 0..5 {
            for col in 0..5 {
                assert_eq!(tile[[row, col]], kernel[[row, col, 6, 11]]);
            }
        }
    }

    #[test]
    fn iteration_order_is_layer_then_filter_then_channel() {
        let network = warmed_classifier();
        let grid = KernelGrid::extract(&network).unwrap();
        let ids: Vec<KernelId> = grid.iter().map(|(id, _)| id).collect();

        assert_eq!(ids[0], KernelId::new(0, 0, 0));
        assert_eq!(ids[7], KernelId::new(0, 7, 0));
        assert_eq!(ids[8], KernelId::new(1, 0, 0));
        assert_eq!(ids[9], KernelId::new(1, 0, 1));
        assert_eq!(ids[16], KernelId::new(1, 1, 0));
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn reassembling_without_edits_is_the_identity() {
        let mut network = warmed_classifier();
        let before: Vec<_> = network
            .conv_layers()
            .map(|(index, _)| {
                let (kernel, bias) = network.conv_weights(index).unwrap();
                (kernel.clone(), bias.clone())
            })
            .collect();

        KernelGrid::extract(&network)
            .unwrap()
            .write_back(&mut network)
            .unwrap();

        let after: Vec<_> = network
            .conv_layers()
            .map(|(index, _)| {
                let (kernel, bias) = network.conv_weights(index).unwrap();
                (kernel.clone(), bias.clone())
            })
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn an_edit_changes_exactly_one_tile() {
        let mut network = warmed_classifier();
        let original = KernelGrid::extract(&network).unwrap();
        let mut grid = original.clone();
        let target = KernelId::new(0, 2, 0);

        grid.ingest_edit(&EditRequest::new(target, white(5, 5)))
            .unwrap();
        grid.write_back(&mut network).unwrap();

        let edited = KernelGrid::extract(&network).unwrap();
        let expected = codec::decode(255);
        for ((id, before), (_, after)) in original.iter().zip(edited.iter()) {
            if id == target {
                assert!(after.iter().all(|&w| (w - expected).abs() < 1e-6));
            } else {
                assert_eq!(before, after, "tile {id} changed");
            }
        }
    }

    #[test]
    fn write_back_keeps_the_bias() {
        let mut network = warmed_classifier();
        let (kernel, _) = network.conv_weights(0).unwrap();
        let kernel = kernel.clone();
        let bias = Array1::from_iter((0..8).map(|i| i as f32 * 0.1));
        network.set_conv_weights(0, kernel, bias.clone()).unwrap();

        let mut grid = KernelGrid::extract(&network).unwrap();
        grid.ingest_edit(&EditRequest::new(KernelId::new(0, 0, 0), white(5, 5)))
            .unwrap();
        grid.write_back(&mut network).unwrap();

        assert_eq!(network.conv_weights(0).unwrap().1, &bias);
    }

    #[test]
    fn edits_read_the_window_at_the_origin() {
        let network = warmed_classifier();
        let mut grid = KernelGrid::extract(&network).unwrap();
        // Black everywhere except a white 5x5 block at (6, 12).
        let sheet = Snapshot::from_fn(20, 20, |x, y| {
            let inside = (6..11).contains(&x) && (12..17).contains(&y);
            let v = if inside { 255 } else { 0 };
            [v, v, v, 255]
        });
        let id = KernelId::new(1, 3, 4);
        grid.ingest_edit(&EditRequest::new(id, sheet.clone()).at(6, 12))
            .unwrap();
        assert!(grid.tile(id).unwrap().iter().all(|&w| w > 1.0));

        let result = grid.ingest_edit(&EditRequest::new(id, sheet).at(16, 0));
        assert!(matches!(result, Err(Error::PixelWindow { x: 16, .. })));
    }

    #[test]
    fn origins_near_the_top_of_the_address_space_are_rejected() {
        let network = warmed_classifier();
        let mut grid = KernelGrid::extract(&network).unwrap();
        let id = KernelId::new(0, 0, 0);
        for (x, y) in [(usize::MAX, 0), (0, usize::MAX), (usize::MAX - 2, usize::MAX - 2)] {
            let result = grid.ingest_edit(&EditRequest::new(id, white(5, 5)).at(x, y));
            assert!(
                matches!(result, Err(Error::PixelWindow { x: ex, y: ey, .. }) if ex == x && ey == y),
                "origin ({x}, {y})"
            );
        }
        assert_eq!(grid.version(), network.version());
        assert_eq!(grid.tile(id), KernelGrid::extract(&network).unwrap().tile(id));
    }

    #[test]
    fn unknown_kernels_are_rejected() {
        let network = warmed_classifier();
        let mut grid = KernelGrid::extract(&network).unwrap();
        for id in [
            KernelId::new(2, 0, 0),
            KernelId::new(0, 8, 0),
            KernelId::new(0, 0, 1),
        ] {
            assert!(matches!(
                grid.ingest_edit(&EditRequest::new(id, white(5, 5))),
                Err(Error::UnknownKernel(bad)) if bad == id
            ));
        }
    }

    #[test]
    fn replacing_with_a_wrong_sized_tile_fails() {
        let network = warmed_classifier();
        let mut grid = KernelGrid::extract(&network).unwrap();
        let result = grid.replace_tile(KernelId::new(0, 0, 0), Tile::zeros((3, 5)));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn stale_grids_are_refused() {
        let mut network = warmed_classifier();
        let stale = KernelGrid::extract(&network).unwrap();
        KernelGrid::extract(&network)
            .unwrap()
            .write_back(&mut network)
            .unwrap();

        assert!(matches!(
            stale.write_back(&mut network),
            Err(Error::StaleGrid { .. })
        ));
    }

    #[test]
    fn ragged_layers_fail_with_a_shape_mismatch() {
        let network = warmed_classifier();
        let mut grid = KernelGrid::extract(&network).unwrap();
        grid.layers[1].filters[3].pop();
        assert!(matches!(
            grid.reassemble(),
            Err(Error::ShapeMismatch { layer, .. }) if layer == "conv2d_2"
        ));
    }
}
