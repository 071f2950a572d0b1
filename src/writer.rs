//! Post-processing and storage of synthetic samples.
use image::RgbImage;
use log::debug;
use rand::Rng;

use std::path::{Path, PathBuf};

use crate::compositor::SyntheticSample;
use crate::config::*;
use crate::labels::LabelBatch;
use crate::Error;

/// Encoding of the label files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelFormat {
    Text,
    Binary,
}

impl LabelFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            LabelFormat::Text => "lbl",
            LabelFormat::Binary => "blbl",
        }
    }
}

/// Directory layout of a run: `<save root>/<num keypoints>/<keypoint type>/{images,annots}`, so
/// runs with different keypoint configurations never overwrite each other.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(save_root: &Path, num_keypoints: usize, keypoint_type: KeypointType) -> Self {
        OutputLayout {
            root: save_root
                .join(num_keypoints.to_string())
                .join(keypoint_type.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn annots_dir(&self) -> PathBuf {
        self.root.join("annots")
    }

    pub fn create(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(self.images_dir())?;
        std::fs::create_dir_all(self.annots_dir())
    }

    /// Are there images from an earlier run?
    pub fn is_populated(&self) -> Result<bool, std::io::Error> {
        match std::fs::read_dir(self.images_dir()) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn image_path(&self, index: usize) -> PathBuf {
        self.images_dir().join(format!("{:05}.png", index))
    }

    pub fn label_path(&self, index: usize, format: LabelFormat) -> PathBuf {
        self.annots_dir()
            .join(format!("{:05}.{}", index, format.extension()))
    }
}

/// Blurs finished images at random and writes them with their labels.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    layout: OutputLayout,
    label_format: LabelFormat,
    blur_probability: f64,
    blur_sigma: (f32, f32),
}

impl SampleWriter {
    pub fn new(layout: OutputLayout, config: &SynthConfig, label_format: LabelFormat) -> Self {
        SampleWriter {
            layout,
            label_format,
            blur_probability: config.blur_probability,
            blur_sigma: config.blur_sigma,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Gaussian blur the canvas with probability `blur_probability`.
    pub fn post_process<R: Rng + ?Sized>(&self, canvas: RgbImage, rng: &mut R) -> RgbImage {
        if !rng.gen_bool(self.blur_probability) {
            return canvas;
        }
        let (lo, hi) = self.blur_sigma;
        let sigma = if lo < hi { rng.gen_range(lo, hi) } else { lo };
        debug!("blurring with sigma {:.2}", sigma);
        image::imageops::blur(&canvas, sigma)
    }

    /// Post-process and store a sample under `index`. Returns the labels that were written.
    pub fn write<R: Rng + ?Sized>(
        &self,
        index: usize,
        sample: SyntheticSample,
        rng: &mut R,
    ) -> Result<LabelBatch, Error> {
        let batch = LabelBatch::from_placements(&sample.placements);
        batch.validate()?;
        let image = self.post_process(sample.canvas, rng);
        // an image is only ever on disk next to its labels
        let label_path = self.layout.label_path(index, self.label_format);
        batch.write(&label_path)?;
        if let Err(e) = image.save(self.layout.image_path(index)) {
            let _ = std::fs::remove_file(&label_path);
            return Err(e.into());
        }
        Ok(batch)
    }
}

#[test]
fn test_layout() {
    let layout = OutputLayout::new(Path::new("/out"), 17, KeypointType::Sift);
    assert_eq!(layout.root(), Path::new("/out/17/sift"));
    assert_eq!(layout.image_path(42), Path::new("/out/17/sift/images/00042.png"));
    assert_eq!(
        layout.label_path(7, LabelFormat::Binary),
        Path::new("/out/17/sift/annots/00007.blbl")
    );
    assert_eq!(
        layout.label_path(123456, LabelFormat::Text),
        Path::new("/out/17/sift/annots/123456.lbl")
    );
}

#[test]
fn test_write_sample() {
    use crate::geometry::*;
    use crate::labels::Placement;

    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), 2, KeypointType::Corner);
    assert!(!layout.is_populated().unwrap());
    layout.create().unwrap();

    let mut config = SynthConfig::default();
    config.blur_probability = 0.0;
    let writer = SampleWriter::new(layout.clone(), &config, LabelFormat::Text);

    let canvas = RgbImage::from_fn(64, 48, |x, y| image::Rgb([x as u8, y as u8, 3]));
    let placement = Placement {
        bbox: BBox::new(1, 2, 11, 12),
        pose: Pose::identity(),
        keypoints: vec![cgmath::Point2::new(4., 5.), cgmath::Point2::new(6.5, 7.)],
        object_id: 12,
    };
    let sample = SyntheticSample {
        canvas: canvas.clone(),
        placements: vec![placement],
    };
    let batch = writer.write(3, sample, &mut rand::thread_rng()).unwrap();
    assert_eq!(batch.len(), 1);
    assert!(layout.is_populated().unwrap());

    let written = image::open(layout.image_path(3)).unwrap().to_rgb8();
    assert_eq!(written, canvas);
    let labels = LabelBatch::from_file(&layout.label_path(3, LabelFormat::Text)).unwrap();
    assert_eq!(labels, batch);
}

#[test]
fn test_blur_always() {
    let mut config = SynthConfig::default();
    config.blur_probability = 1.0;
    let layout = OutputLayout::new(Path::new("unused"), 1, KeypointType::Random);
    let writer = SampleWriter::new(layout, &config, LabelFormat::Binary);
    let canvas = RgbImage::from_fn(16, 16, |x, y| {
        if (x + y) % 2 == 0 {
            image::Rgb([255, 255, 255])
        } else {
            image::Rgb([0, 0, 0])
        }
    });
    let blurred = writer.post_process(canvas.clone(), &mut rand::thread_rng());
    assert_eq!(blurred.dimensions(), canvas.dimensions());
    assert_ne!(blurred, canvas);
}

#[cfg(test)]
fn test_sample() -> SyntheticSample {
    use crate::geometry::*;
    use crate::labels::Placement;

    SyntheticSample {
        canvas: RgbImage::from_pixel(32, 24, image::Rgb([5, 6, 7])),
        placements: vec![Placement {
            bbox: BBox::new(0, 0, 4, 4),
            pose: Pose::identity(),
            keypoints: vec![cgmath::Point2::new(1., 1.)],
            object_id: 1,
        }],
    }
}

#[test]
fn test_failed_write_leaves_gap() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), 1, KeypointType::Cluster);
    let mut config = SynthConfig::default();
    config.blur_probability = 0.0;
    let writer = SampleWriter::new(layout.clone(), &config, LabelFormat::Text);

    // labels cannot be written
    std::fs::create_dir_all(layout.images_dir()).unwrap();
    assert!(writer.write(0, test_sample(), &mut rand::thread_rng()).is_err());
    assert!(!layout.image_path(0).exists());

    // image cannot be written
    std::fs::remove_dir(layout.images_dir()).unwrap();
    std::fs::create_dir_all(layout.annots_dir()).unwrap();
    assert!(writer.write(1, test_sample(), &mut rand::thread_rng()).is_err());
    assert!(!layout.label_path(1, LabelFormat::Text).exists());

    layout.create().unwrap();
    writer.write(2, test_sample(), &mut rand::thread_rng()).unwrap();
    assert!(layout.image_path(2).exists());
    assert!(layout.label_path(2, LabelFormat::Text).exists());
}
