use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use itertools::Itertools;
use ndarray::{Array1, Array3};
use tracing::info;

use crate::error::{Error, Result};

pub const IMAGE_MAGIC: u32 = 2051;
pub const LABEL_MAGIC: u32 = 2049;
pub const NUM_CLASSES: usize = 10;

// A single image paired with its label. The input is shaped [rows x columns x 1] with pixel values
// scaled into [0, 1]; the target is the one-hot activation the output layer should produce.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Array3<f32>,
    pub target: Array1<f32>,
    pub label: u8,
}

impl Sample {
    pub fn new(input: Array3<f32>, label: u8, classes: usize) -> Sample {
        let target = Array1::from_shape_fn(classes, |i| if i == label as usize { 1.0 } else { 0.0 });
        Sample {
            input,
            target,
            label,
        }
    }
}

pub struct MnistData {
    pub training_data: Vec<Sample>,
    pub test_data: Vec<Sample>,
}

impl MnistData {
    /// Load the four gzipped IDX files from `dir`, optionally keeping only the first few samples
    /// of each split.
    pub fn load(
        dir: impl AsRef<Path>,
        train_limit: Option<usize>,
        test_limit: Option<usize>,
    ) -> Result<MnistData> {
        let dir = dir.as_ref();

        let mut training_data = images_and_labels_to_data(
            read_bytes(&dir.join("train-images-idx3-ubyte.gz"))?,
            read_bytes(&dir.join("train-labels-idx1-ubyte.gz"))?,
        )?;
        let mut test_data = images_and_labels_to_data(
            read_bytes(&dir.join("t10k-images-idx3-ubyte.gz"))?,
            read_bytes(&dir.join("t10k-labels-idx1-ubyte.gz"))?,
        )?;

        if let Some(limit) = train_limit {
            training_data.truncate(limit);
        }
        if let Some(limit) = test_limit {
            test_data.truncate(limit);
        }
        info!(
            train = training_data.len(),
            test = test_data.len(),
            dir = %dir.display(),
            "loaded MNIST"
        );

        Ok(MnistData {
            training_data,
            test_data,
        })
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)
        .map_err(|err| Error::Dataset(format!("cannot open {}: {err}", path.display())))?;
    let mut unzipped_file = GzDecoder::new(file);
    let mut bytes = Vec::new();
    unzipped_file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

// Read `count` big-endian u32 header fields off the front of an IDX payload.
fn read_header(bytes: &mut impl Iterator<Item = u8>, count: usize) -> Result<Vec<u32>> {
    let header = bytes.take(count * 4).collect::<Vec<_>>();
    if header.len() != count * 4 {
        return Err(Error::Dataset("IDX file is shorter than its header".into()));
    }
    Ok(header
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// Turn the raw bytes of an IDX image file and its label file into samples.
pub(crate) fn images_and_labels_to_data(
    image_bytes: Vec<u8>,
    label_bytes: Vec<u8>,
) -> Result<Vec<Sample>> {
    let mut image_bytes_iter = image_bytes.into_iter();
    let mut label_bytes_iter = label_bytes.into_iter();

    // Image header: magic number, number of images, rows per image, columns per image.
    let image_header = read_header(&mut image_bytes_iter, 4)?;
    if image_header[0] != IMAGE_MAGIC {
        return Err(Error::Dataset(format!(
            "image file magic is {} rather than {IMAGE_MAGIC}",
            image_header[0]
        )));
    }
    let (images, rows, columns) = (
        image_header[1] as usize,
        image_header[2] as usize,
        image_header[3] as usize,
    );

    // Label header: magic number, number of labels.
    let label_header = read_header(&mut label_bytes_iter, 2)?;
    if label_header[0] != LABEL_MAGIC {
        return Err(Error::Dataset(format!(
            "label file magic is {} rather than {LABEL_MAGIC}",
            label_header[0]
        )));
    }
    if label_header[1] as usize != images {
        return Err(Error::Dataset(format!(
            "{images} images but {} labels",
            label_header[1]
        )));
    }
    if rows * columns == 0 {
        return Err(Error::Dataset("images have no pixels".into()));
    }

    let mut data = Vec::with_capacity(images);

    // Both iterators have had their headers consumed. Chunk the image bytes into one image each and
    // zip them with the labels.
    for (image_chunk, label) in image_bytes_iter
        .chunks(rows * columns)
        .into_iter()
        .zip(label_bytes_iter)
    {
        let pixels = image_chunk
            .map(|value| value as f32 / 255.0)
            .collect::<Vec<_>>();
        if pixels.len() != rows * columns {
            return Err(Error::Dataset("image file ends mid-image".into()));
        }
        if label as usize >= NUM_CLASSES {
            return Err(Error::Dataset(format!("label {label} is not a digit")));
        }
        let input = Array3::from_shape_vec((rows, columns, 1), pixels)?;
        data.push(Sample::new(input, label, NUM_CLASSES));
    }

    if data.len() != images {
        return Err(Error::Dataset(format!(
            "header promises {images} samples but only {} are present",
            data.len()
        )));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn idx_images(images: &[[u8; 4]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for field in [IMAGE_MAGIC, images.len() as u32, 2, 2] {
            bytes.extend(field.to_be_bytes());
        }
        for image in images {
            bytes.extend(image);
        }
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for field in [LABEL_MAGIC, labels.len() as u32] {
            bytes.extend(field.to_be_bytes());
        }
        bytes.extend(labels);
        bytes
    }

    #[test]
    fn parses_images_and_one_hot_labels() {
        let data = images_and_labels_to_data(
            idx_images(&[[0, 255, 51, 0], [255, 255, 255, 255]]),
            idx_labels(&[3, 9]),
        )
        .unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data[0].input.dim(), (2, 2, 1));
        assert_eq!(data[0].input[[0, 1, 0]], 1.0);
        assert!((data[0].input[[1, 0, 0]] - 0.2).abs() < 1e-6);
        assert_eq!(data[0].label, 3);
        assert_eq!(data[0].target.sum(), 1.0);
        assert_eq!(data[0].target[3], 1.0);
        assert_eq!(data[1].target[9], 1.0);
    }

    #[test]
    fn rejects_wrong_magic_and_mismatched_counts() {
        let mut bad_magic = idx_images(&[[0; 4]]);
        bad_magic[3] = 0;
        assert!(matches!(
            images_and_labels_to_data(bad_magic, idx_labels(&[1])),
            Err(Error::Dataset(_))
        ));
        assert!(matches!(
            images_and_labels_to_data(idx_images(&[[0; 4]]), idx_labels(&[1, 2])),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn rejects_truncated_files() {
        let mut truncated = idx_images(&[[0; 4], [0; 4]]);
        truncated.truncate(truncated.len() - 2);
        assert!(images_and_labels_to_data(truncated, idx_labels(&[1, 2])).is_err());
        assert!(images_and_labels_to_data(vec![0, 0], idx_labels(&[])).is_err());
    }

    #[test]
    fn loads_gzipped_files_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, bytes: Vec<u8>| {
            let mut encoder = GzEncoder::new(
                File::create(dir.path().join(name)).unwrap(),
                Compression::default(),
            );
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        };
        write("train-images-idx3-ubyte.gz", idx_images(&[[1; 4], [2; 4], [3; 4]]));
        write("train-labels-idx1-ubyte.gz", idx_labels(&[0, 1, 2]));
        write("t10k-images-idx3-ubyte.gz", idx_images(&[[4; 4]]));
        write("t10k-labels-idx1-ubyte.gz", idx_labels(&[7]));

        let data = MnistData::load(dir.path(), Some(2), None).unwrap();
        assert_eq!(data.training_data.len(), 2);
        assert_eq!(data.test_data.len(), 1);
        assert_eq!(data.test_data[0].label, 7);
    }
}
