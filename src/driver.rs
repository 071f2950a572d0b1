//! Runs the synthesis pipeline over a batch of background images.
extern crate indicatif;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::compositor::Compositor;
use crate::config::SynthConfig;
use crate::dataset::FrameProvider;
use crate::labels::LabelBatch;
use crate::sampler::sample_frames;
use crate::writer::SampleWriter;
use crate::Error;

pub fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}% ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}

/// List the files in `root`, keep the first `num` in sorted order and shuffle them.
pub fn background_paths<R: Rng + ?Sized>(
    root: &Path,
    num: usize,
    rng: &mut R,
) -> Result<Vec<PathBuf>, Error> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        return Err(Error::EmptyDataset(format!(
            "no background images in {}",
            root.display()
        )));
    }
    paths.sort();
    paths.truncate(num);
    paths.shuffle(rng);
    Ok(paths)
}

/// Outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Number of samples written.
    pub generated: usize,
    /// Index and message of every sample that failed.
    pub failures: Vec<(usize, String)>,
    /// How often each object id was placed over all written samples.
    pub object_counts: BTreeMap<u32, usize>,
}

impl BatchReport {
    fn record(&mut self, batch: &LabelBatch) {
        self.generated += 1;
        for id in &batch.object_ids {
            *self.object_counts.entry(*id).or_insert(0) += 1;
        }
    }
}

/// Generate one sample per background. Sample `i` is written under index `i`.
///
/// A sample that fails to compose or write is reported with its index and skipped, leaving a gap
/// in the output. Failing to sample frames from `provider` aborts the batch.
pub fn run_batch<P, R>(
    provider: &P,
    backgrounds: &[PathBuf],
    config: &SynthConfig,
    writer: &SampleWriter,
    rng: &mut R,
    verbose: bool,
) -> Result<BatchReport, Error>
where
    P: FrameProvider + ?Sized,
    R: Rng + ?Sized,
{
    config.validate()?;
    let compositor = Compositor::new(config);
    info!(
        "generating {} samples into {}",
        backgrounds.len(),
        writer.layout().root().display()
    );

    let mut report = BatchReport::default();
    let pb = progress_bar(backgrounds.len() as u64, "Sticking images", verbose);
    for (idx, background) in backgrounds.iter().enumerate() {
        let frames = sample_frames(provider, config.frame_count, rng)?;
        let result = compositor
            .compose(background, &frames, provider.camera(), rng)
            .and_then(|sample| writer.write(idx, sample, rng));
        match result {
            Ok(batch) => report.record(&batch),
            Err(e) => {
                println!("\n[ERROR] {} in No.{}", e, idx);
                report.failures.push((idx, e.to_string()));
            }
        }
        pb.inc(1);
    }
    pb.finish();
    Ok(report)
}

#[cfg(test)]
fn write_fixture(
    dir: &Path,
    num_backgrounds: usize,
    gray_every: usize,
) -> (crate::FrameManifest, PathBuf) {
    use image::RgbImage;

    let obj = dir.join("obj.png");
    RgbImage::from_fn(100, 100, |x, y| {
        if x >= 20 && x < 60 && y >= 20 && y < 60 {
            image::Rgb([220, 30, 90])
        } else {
            image::Rgb([0, 0, 0])
        }
    })
    .save(&obj)
    .unwrap();

    let manifest = "camera 500 0 160 0 500 120 0 0 1\n\
         frame 1 obj.png\n\
         annot 4 20 20 60 60 1 0 0 0 0 1 0 0 0 0 1 0.5 2 30 30 40 50\n\
         frame 2 obj.png\n\
         annot 7 20 20 60 60 1 0 0 0 0 1 0 0 0 0 1 0.6 2 25 25 55 55\n";
    let manifest = crate::FrameManifest::parse(manifest, dir, Some(2)).unwrap();

    let bgroot = dir.join("backgrounds");
    std::fs::create_dir_all(&bgroot).unwrap();
    for i in 0..num_backgrounds {
        let path = bgroot.join(format!("bg{:03}.png", i));
        if gray_every > 0 && i % gray_every == gray_every - 1 {
            image::GrayImage::from_pixel(40, 30, image::Luma([90]))
                .save(&path)
                .unwrap();
        } else {
            RgbImage::from_pixel(40, 30, image::Rgb([10, 200, 10]))
                .save(&path)
                .unwrap();
        }
    }
    (manifest, bgroot)
}

#[cfg(test)]
fn test_config() -> SynthConfig {
    let mut config = SynthConfig::default();
    config.canvas_size = (160, 120);
    config.frame_count = (1, 3);
    config.scale_range = (0.5, 0.5);
    config
}

#[test]
fn test_background_paths() {
    use rand::SeedableRng;

    let dir = tempfile::tempdir().unwrap();
    let (_, bgroot) = write_fixture(dir.path(), 6, 0);
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let mut paths = background_paths(&bgroot, 4, &mut rng).unwrap();
    assert_eq!(paths.len(), 4);
    paths.sort();
    let names = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["bg000.png", "bg001.png", "bg002.png", "bg003.png"]);

    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    match background_paths(&empty, 4, &mut rng) {
        Err(Error::EmptyDataset(_)) => (),
        x => panic!("expected an empty dataset error, got {:?}", x),
    }
}

#[test]
fn test_batch_survives_bad_backgrounds() {
    use crate::config::KeypointType;
    use crate::writer::*;
    use rand::SeedableRng;

    let dir = tempfile::tempdir().unwrap();
    let (manifest, bgroot) = write_fixture(dir.path(), 12, 3);
    let config = test_config();
    let layout = OutputLayout::new(&dir.path().join("out"), 2, KeypointType::Sift);
    layout.create().unwrap();
    let writer = SampleWriter::new(layout.clone(), &config, LabelFormat::Binary);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let backgrounds = background_paths(&bgroot, 100, &mut rng).unwrap();
    let report = run_batch(&manifest, &backgrounds, &config, &writer, &mut rng, false).unwrap();

    assert_eq!(report.generated, 8);
    assert_eq!(report.failures.len(), 4);
    for (idx, msg) in &report.failures {
        assert!(msg.contains("Gray scale"));
        assert!(!layout.image_path(*idx).exists());
        assert!(!layout.label_path(*idx, LabelFormat::Binary).exists());
    }

    let mut placed = 0;
    for idx in 0..backgrounds.len() {
        if report.failures.iter().any(|(i, _)| *i == idx) {
            continue;
        }
        assert!(layout.image_path(idx).exists());
        let labels = LabelBatch::from_file(&layout.label_path(idx, LabelFormat::Binary)).unwrap();
        labels.validate().unwrap();
        for id in &labels.object_ids {
            assert!(*id == 4 || *id == 7);
        }
        placed += labels.len();
    }
    assert_eq!(report.object_counts.values().sum::<usize>(), placed);
}

#[test]
fn test_batch_empty_provider_is_fatal() {
    use crate::config::KeypointType;
    use crate::geometry::CameraIntrinsics;
    use crate::writer::*;

    let dir = tempfile::tempdir().unwrap();
    let (_, bgroot) = write_fixture(dir.path(), 2, 0);
    let manifest =
        crate::FrameManifest::new(CameraIntrinsics::from_pinhole(1., 1., 0., 0.).unwrap());
    let config = test_config();
    let layout = OutputLayout::new(dir.path(), 2, KeypointType::Corner);
    let writer = SampleWriter::new(layout, &config, LabelFormat::Text);
    let mut rng = rand::thread_rng();
    let backgrounds = background_paths(&bgroot, 2, &mut rng).unwrap();
    match run_batch(&manifest, &backgrounds, &config, &writer, &mut rng, false) {
        Err(Error::EmptyDataset(_)) => (),
        x => panic!("expected an empty dataset error, got {:?}", x),
    }
}
