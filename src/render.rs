use std::fs;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::codec;
use crate::error::{Error, Result};
use crate::grid::{KernelGrid, LayerTiles, Tile};
use crate::history::{TileHistory, TileHistoryStore};
use crate::kernel_id::KernelId;

/// An RGBA pixel buffer, row-major, four bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Snapshot {
    pub fn from_fn(
        width: usize,
        height: usize,
        mut pixel: impl FnMut(usize, usize) -> [u8; 4],
    ) -> Snapshot {
        let mut data = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                data.extend(pixel(x, y));
            }
        }
        Snapshot {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let i = (y * self.width + x) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            image::Rgba(self.pixel(x as usize, y as usize))
        })
    }

    /// Write as a PNG, blown up `scale` times with square pixels so small kernels are visible.
    pub fn save_png(&self, path: impl AsRef<Path>, scale: u32) -> Result<()> {
        let scale = scale.max(1);
        let image = self.to_image();
        let image = imageops::resize(
            &image,
            image.width() * scale,
            image.height() * scale,
            FilterType::Nearest,
        );
        image.save(path)?;
        Ok(())
    }

    /// Read a PNG written by `save_png` (or edited since), undoing the `scale` blow-up by sampling
    /// one pixel per block.
    pub fn load_png(path: impl AsRef<Path>, scale: u32) -> Result<Snapshot> {
        let scale = scale.max(1);
        let image = image::open(path)?.to_rgba8();
        if image.width() % scale != 0 || image.height() % scale != 0 {
            return Err(Error::PixelWindow {
                buffer_width: image.width() as usize,
                buffer_height: image.height() as usize,
                tile_width: scale as usize,
                tile_height: scale as usize,
                x: 0,
                y: 0,
            });
        }
        let (width, height) = (image.width() / scale, image.height() / scale);
        Ok(Snapshot::from_fn(width as usize, height as usize, |x, y| {
            image
                .get_pixel(x as u32 * scale + scale / 2, y as u32 * scale + scale / 2)
                .0
        }))
    }
}

/// Grey rendering of a tile: every weight goes through the codec into R, G and B alike.
pub fn render(tile: &Tile) -> Snapshot {
    let (height, width) = tile.dim();
    Snapshot::from_fn(width, height, |x, y| {
        let v = codec::encode(tile[[y, x]]);
        [v, v, v, 255]
    })
}

/// Change of each pixel relative to the snapshot from two ticks ago, coloured blue where the grey
/// level rose and red where it fell. `None` until the tile has at least two snapshots.
pub fn diff(tile: &Tile, history: &TileHistory) -> Option<Snapshot> {
    let previous = history.previous()?;
    let (height, width) = tile.dim();
    if previous.width() != width || previous.height() != height {
        return None;
    }
    Some(Snapshot::from_fn(width, height, |x, y| {
        let delta = previous.pixel(x, y)[0] as i32 - codec::encode(tile[[y, x]]) as i32;
        codec::diff_ramp(delta)
    }))
}

/// Draws tiles and remembers what it drew, so later ticks can show what changed.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    history: TileHistoryStore,
}

impl Renderer {
    pub fn new(history_depth: usize) -> Renderer {
        Renderer {
            history: TileHistoryStore::new(history_depth),
        }
    }

    pub fn history(&self) -> &TileHistoryStore {
        &self.history
    }

    /// Render one tile, and its diff view too if requested and enough history exists. The plain
    /// rendering is what gets recorded, whichever view is displayed.
    pub fn render_tile(&mut self, id: KernelId, tile: &Tile, diff_enabled: bool) -> TileRender {
        let plain = render(tile);
        let diff = if diff_enabled {
            self.history.get(&id).and_then(|history| diff(tile, history))
        } else {
            None
        };
        self.history.append(id, plain.clone());
        TileRender { plain, diff }
    }

    /// Render every tile of the grid and lay each layer out as a sheet.
    pub fn render_grid(&mut self, grid: &KernelGrid, diff_enabled: bool) -> Vec<RenderedLayer> {
        grid.layers()
            .iter()
            .enumerate()
            .map(|(l, layer)| {
                let layout = SheetLayout::for_layer(layer);
                let capacity = layer.filter_count() * layer.channels();
                let mut tiles = Vec::with_capacity(capacity);
                let mut shown = Vec::with_capacity(capacity);
                let mut any_diff = false;
                for (f, channels) in layer.filters.iter().enumerate() {
                    for (c, tile) in channels.iter().enumerate() {
                        let id = KernelId::new(l, f, c);
                        let TileRender { plain, diff } = self.render_tile(id, tile, diff_enabled);
                        any_diff |= diff.is_some();
                        shown.push((id, diff.unwrap_or_else(|| plain.clone())));
                        tiles.push((id, plain));
                    }
                }

                let diff = any_diff.then(|| DiffView {
                    sheet: layout.compose(&shown),
                    tiles: shown,
                });
                RenderedLayer {
                    name: layer.name.clone(),
                    layout,
                    sheet: layout.compose(&tiles),
                    tiles,
                    diff,
                }
            })
            .collect()
    }
}

/// Both views of one rendered tile. Only `plain` can be decoded back into weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRender {
    pub plain: Snapshot,
    pub diff: Option<Snapshot>,
}

impl TileRender {
    /// What to display: the diff when there is one, otherwise the plain rendering.
    pub fn shown(&self) -> &Snapshot {
        self.diff.as_ref().unwrap_or(&self.plain)
    }
}

/// One layer after a render tick. `sheet` and `tiles` are always the grey rendering and are the
/// files an edit should start from; `diff` is present only when at least one tile had enough
/// history to be diffed.
#[derive(Debug, Clone)]
pub struct RenderedLayer {
    pub name: String,
    pub layout: SheetLayout,
    pub sheet: Snapshot,
    pub tiles: Vec<(KernelId, Snapshot)>,
    pub diff: Option<DiffView>,
}

/// Display-only colour view of a layer. Tiles without enough history fall back to grey.
#[derive(Debug, Clone)]
pub struct DiffView {
    pub sheet: Snapshot,
    pub tiles: Vec<(KernelId, Snapshot)>,
}

impl RenderedLayer {
    /// Write `<dir>/<layer>.png` and `<dir>/tiles/<kernel>.png`, plus `.diff.png` siblings when a
    /// diff view exists. The plain files keep their names every tick so they can be edited and fed
    /// back.
    pub fn save(&self, dir: &Path, scale: u32) -> Result<()> {
        let tiles_dir = dir.join("tiles");
        fs::create_dir_all(&tiles_dir)?;

        self.sheet
            .save_png(dir.join(format!("{}.png", self.name)), scale)?;
        for (id, snapshot) in &self.tiles {
            snapshot.save_png(tiles_dir.join(format!("{id}.png")), scale)?;
        }
        if let Some(diff) = &self.diff {
            diff.sheet
                .save_png(dir.join(format!("{}.diff.png", self.name)), scale)?;
            for (id, snapshot) in &diff.tiles {
                snapshot.save_png(tiles_dir.join(format!("{id}.diff.png")), scale)?;
            }
        }
        Ok(())
    }
}

/// Arrangement of one layer's tiles on a single image: one row per filter, one column per input
/// channel, separated by a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    pub tile_width: usize,
    pub tile_height: usize,
    pub filters: usize,
    pub channels: usize,
    pub gap: usize,
}

const GAP_COLOUR: [u8; 4] = [32, 32, 32, 255];

impl SheetLayout {
    pub fn for_layer(layer: &LayerTiles) -> SheetLayout {
        SheetLayout {
            tile_width: layer.tile_width(),
            tile_height: layer.tile_height(),
            filters: layer.filter_count(),
            channels: layer.channels(),
            gap: 1,
        }
    }

    pub fn width(&self) -> usize {
        self.channels * (self.tile_width + self.gap) - self.gap.min(self.channels)
    }

    pub fn height(&self) -> usize {
        self.filters * (self.tile_height + self.gap) - self.gap.min(self.filters)
    }

    /// Top-left pixel of the tile for `(filter, channel)`.
    pub fn origin(&self, filter: usize, channel: usize) -> (usize, usize) {
        (
            channel * (self.tile_width + self.gap),
            filter * (self.tile_height + self.gap),
        )
    }

    /// Which `(filter, channel)` tile covers a sheet pixel, if any.
    pub fn locate(&self, x: usize, y: usize) -> Option<(usize, usize)> {
        let (column, dx) = (x / (self.tile_width + self.gap), x % (self.tile_width + self.gap));
        let (row, dy) = (y / (self.tile_height + self.gap), y % (self.tile_height + self.gap));
        (column < self.channels && row < self.filters && dx < self.tile_width && dy < self.tile_height)
            .then_some((row, column))
    }

    pub fn compose(&self, tiles: &[(KernelId, Snapshot)]) -> Snapshot {
        let mut data = vec![0u8; self.width() * self.height() * 4];
        for pixel in data.chunks_exact_mut(4) {
            pixel.copy_from_slice(&GAP_COLOUR);
        }
        for (id, snapshot) in tiles {
            let (ox, oy) = self.origin(id.filter, id.channel);
            for y in 0..snapshot.height().min(self.tile_height) {
                for x in 0..snapshot.width().min(self.tile_width) {
                    let i = ((oy + y) * self.width() + ox + x) * 4;
                    if i + 4 <= data.len() {
                        data[i..i + 4].copy_from_slice(&snapshot.pixel(x, y));
                    }
                }
            }
        }
        Snapshot {
            width: self.width(),
            height: self.height(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn render_is_opaque_grey() {
        let tile = array![[-1.0, 0.0, 1.0], [0.5, -0.5, 0.25]];
        let snapshot = render(&tile);
        assert_eq!((snapshot.width(), snapshot.height()), (3, 2));
        assert_eq!(snapshot.pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(snapshot.pixel(1, 0), [127, 127, 127, 255]);
        assert_eq!(snapshot.pixel(2, 0), [254, 254, 254, 255]);
        assert_eq!(snapshot.pixel(0, 1), [190, 190, 190, 255]);
        for pixel in snapshot.as_bytes().chunks_exact(4) {
            assert_eq!(pixel[3], 255);
            assert!(pixel[0] == pixel[1] && pixel[1] == pixel[2]);
        }
    }

    #[test]
    fn diff_compares_against_the_snapshot_two_ticks_back() {
        let id = KernelId::new(0, 0, 0);
        let mut store = TileHistoryStore::new(3);
        let a = render(&array![[0.0, 0.0], [0.0, 0.0]]);
        let b = render(&array![[1.0, 1.0], [1.0, 1.0]]);
        store.append(id, a.clone());
        store.append(id, b);

        let current = array![[0.0, 0.02], [-0.02, 0.1]];
        let shown = diff(&current, store.get(&id).unwrap()).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                let d = a.pixel(x, y)[0] as i32 - codec::encode(current[[y, x]]) as i32;
                let expected = if d < 0 {
                    [(255 + 8 * d) as u8, (255 + 8 * d) as u8, 255, 255]
                } else {
                    [255, (255 - 8 * d) as u8, (255 - 8 * d) as u8, 255]
                };
                assert_eq!(shown.pixel(x, y), expected, "pixel ({x}, {y})");
            }
        }
        // 0.1 encodes to 139, twelve steps above 127.
        assert_eq!(shown.pixel(1, 1), [159, 159, 255, 255]);
        assert_eq!(shown.pixel(0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn diff_needs_two_snapshots() {
        let id = KernelId::new(0, 0, 0);
        let mut store = TileHistoryStore::new(3);
        let tile = array![[0.0]];
        store.append(id, render(&tile));
        assert!(diff(&tile, store.get(&id).unwrap()).is_none());
    }

    #[test]
    fn renderer_falls_back_to_plain_until_history_is_deep_enough() {
        let mut renderer = Renderer::new(3);
        let id = KernelId::new(0, 1, 0);
        let tile = array![[0.5, -0.5]];

        let first = renderer.render_tile(id, &tile, true);
        let second = renderer.render_tile(id, &tile, true);
        assert_eq!(first.diff, None);
        assert_eq!(first.shown(), &render(&tile));
        assert_eq!(second.shown(), &render(&tile));

        let third = renderer.render_tile(id, &tile, true);
        assert_eq!(third.plain, render(&tile));
        assert_eq!(third.shown().pixel(0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn every_render_appends_one_plain_snapshot() {
        let mut renderer = Renderer::new(3);
        let id = KernelId::new(1, 0, 2);
        let tile = array![[0.25, 0.75]];
        for n in 1..=7 {
            renderer.render_tile(id, &tile, n % 2 == 0);
            let history = renderer.history().get(&id).unwrap();
            assert_eq!(history.appended(), n);
            assert_eq!(history.latest(), Some(&render(&tile)));
        }
        assert_eq!(renderer.history().get(&id).unwrap().len(), 3);
    }

    #[test]
    fn sheet_layout_places_filters_in_rows_and_channels_in_columns() {
        let layout = SheetLayout {
            tile_width: 5,
            tile_height: 5,
            filters: 16,
            channels: 8,
            gap: 1,
        };
        assert_eq!(layout.width(), 8 * 6 - 1);
        assert_eq!(layout.height(), 16 * 6 - 1);
        assert_eq!(layout.origin(2, 3), (18, 12));
        assert_eq!(layout.locate(18, 12), Some((2, 3)));
        assert_eq!(layout.locate(22, 16), Some((2, 3)));
        assert_eq!(layout.locate(23, 12), None);
        assert_eq!(layout.locate(47, 0), None);
    }

    #[test]
    fn compose_copies_each_tile_to_its_origin() {
        let layout = SheetLayout {
            tile_width: 2,
            tile_height: 1,
            filters: 2,
            channels: 2,
            gap: 1,
        };
        let tile = |v: u8| Snapshot::from_fn(2, 1, |_, _| [v, v, v, 255]);
        let sheet = layout.compose(&[
            (KernelId::new(0, 0, 0), tile(10)),
            (KernelId::new(0, 1, 1), tile(20)),
        ]);
        assert_eq!((sheet.width(), sheet.height()), (5, 3));
        assert_eq!(sheet.pixel(1, 0), [10, 10, 10, 255]);
        assert_eq!(sheet.pixel(2, 0), GAP_COLOUR);
        assert_eq!(sheet.pixel(3, 2), [20, 20, 20, 255]);
        assert_eq!(sheet.pixel(0, 2), GAP_COLOUR);
    }

    #[test]
    fn png_round_trip_undoes_the_zoom() {
        let snapshot = render(&array![[-1.0, -0.3, 0.2], [0.4, 0.9, 0.0]]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        snapshot.save_png(&path, 8).unwrap();

        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (24, 16));
        assert_eq!(Snapshot::load_png(&path, 8).unwrap(), snapshot);
        assert!(Snapshot::load_png(&path, 5).is_err());
    }
}
