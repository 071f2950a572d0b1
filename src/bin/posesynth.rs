extern crate env_logger;
extern crate image;
extern crate log;
extern crate posesynth;
extern crate rand;
extern crate structopt;

use log::{info, warn};
use posesynth::driver::*;
use posesynth::preview::*;
use posesynth::writer::*;
use posesynth::*;
use rand::{RngCore, SeedableRng};
use std::io::prelude::*;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct GenerateOpt {
    /// Frame manifest of the source dataset.
    #[structopt(name = "DATASET", parse(from_os_str))]
    dataset: std::path::PathBuf,

    /// Directory containing the background images.
    #[structopt(long = "bgroot", parse(from_os_str))]
    bgroot: std::path::PathBuf,

    /// Root directory of the output. Samples are written to <saveroot>/<kpnum>/<kptype>/.
    #[structopt(long = "saveroot", parse(from_os_str))]
    saveroot: std::path::PathBuf,

    /// Number of images to generate. Fewer are generated if there are fewer backgrounds.
    #[structopt(long = "num", default_value = "50000")]
    num: usize,

    /// Number of keypoints per object. Every annotation in the manifest must have this many.
    #[structopt(long = "kpnum")]
    kpnum: usize,

    /// Keypoint selection strategy the annotations were made with.
    #[structopt(long = "kptype", possible_values = KeypointType::VARIANTS)]
    kptype: KeypointType,

    /// Width of the generated images.
    #[structopt(long = "width", default_value = "640")]
    width: u32,

    /// Height of the generated images.
    #[structopt(long = "height", default_value = "480")]
    height: u32,

    /// Minimum number of objects pasted into each image.
    #[structopt(long = "min-frames", default_value = "8")]
    min_frames: usize,

    /// Number of objects pasted into each image is in [<min-frames>, <max-frames>).
    #[structopt(long = "max-frames", default_value = "15")]
    max_frames: usize,

    /// Start of the range objects are scaled by.
    #[structopt(long = "min-scale", default_value = "0.3")]
    min_scale: f64,

    /// End of the range objects are scaled by.
    #[structopt(long = "max-scale", default_value = "0.7")]
    max_scale: f64,

    /// Probability of blurring a generated image.
    #[structopt(long = "blur-prob", default_value = "0.4")]
    blur_prob: f64,

    /// Write labels in the binary .blbl format instead of .lbl text.
    #[structopt(long = "binary-labels")]
    binary_labels: bool,

    /// Seed for the random number generator. Seeded from the OS if not given.
    #[structopt(long = "seed")]
    seed: Option<u64>,

    /// Do not ask before writing into an output directory that already contains images.
    #[structopt(long = "yes", short = "y")]
    yes: bool,

    /// Hide the progress bar.
    #[structopt(long = "quiet", short = "q")]
    quiet: bool,
}

#[derive(StructOpt, Debug)]
struct CheckOpt {
    /// Label file in .lbl or .blbl format.
    #[structopt(name = "LABELS", parse(from_os_str))]
    labels: std::path::PathBuf,

    /// Image the labels belong to. Bounding boxes are checked against its size.
    #[structopt(long = "image", parse(from_os_str))]
    image: Option<std::path::PathBuf>,
}

#[derive(StructOpt, Debug)]
struct PreviewOpt {
    /// Frame manifest the sample was generated from.
    #[structopt(name = "DATASET", parse(from_os_str))]
    dataset: std::path::PathBuf,

    /// Generated image.
    #[structopt(name = "IMAGE", parse(from_os_str))]
    image: std::path::PathBuf,

    /// Labels of the generated image in .lbl or .blbl format.
    #[structopt(name = "LABELS", parse(from_os_str))]
    labels: std::path::PathBuf,

    /// Output image.
    #[structopt(name = "OUT", parse(from_os_str))]
    out: std::path::PathBuf,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "posesynth",
    about = "Tools for synthesizing labeled training images for object pose estimation."
)]
enum Opt {
    /// Paste annotated objects onto backgrounds and write images with their labels.
    Generate(GenerateOpt),
    /// Check a label file for consistency.
    Check(CheckOpt),
    /// Draw the labels of a generated image on top of it.
    Preview(PreviewOpt),
}

fn confirm_overwrite(layout: &OutputLayout) -> Result<bool, std::io::Error> {
    warn!("{} already contains images", layout.images_dir().display());
    print!(
        "{} already contains images, proceed (y/[n])? ",
        layout.root().display()
    );
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "y")
}

fn run_generate(opt: GenerateOpt) -> Result<(), Error> {
    println!("[LOG] Number of keypoints: {}", opt.kpnum);
    println!("[LOG] Type of keypoints: {}", opt.kptype);

    let config = SynthConfig {
        canvas_size: (opt.width, opt.height),
        frame_count: (opt.min_frames, opt.max_frames),
        scale_range: (opt.min_scale, opt.max_scale),
        blur_probability: opt.blur_prob,
        ..SynthConfig::default()
    };
    config.validate()?;

    let manifest = FrameManifest::from_file(&opt.dataset, Some(opt.kpnum))?;
    info!(
        "{} frames in {} sequences",
        manifest.num_frames(),
        manifest.num_sequences()
    );

    let layout = OutputLayout::new(&opt.saveroot, opt.kpnum, opt.kptype);
    if layout.is_populated()? && !opt.yes && !confirm_overwrite(&layout)? {
        println!("Aborted");
        return Ok(());
    }
    layout.create()?;

    let mut rng: Box<dyn RngCore> = match opt.seed {
        Some(seed) => Box::new(rand::rngs::StdRng::seed_from_u64(seed)),
        None => Box::new(rand::thread_rng()),
    };

    let backgrounds = background_paths(&opt.bgroot, opt.num, &mut rng)?;
    println!("[LOG] Number of images to generate: {}", backgrounds.len());

    let format = if opt.binary_labels {
        LabelFormat::Binary
    } else {
        LabelFormat::Text
    };
    let writer = SampleWriter::new(layout, &config, format);

    println!("[LOG] Sticking images");
    let report = run_batch(
        &manifest,
        &backgrounds,
        &config,
        &writer,
        &mut rng,
        !opt.quiet,
    )?;

    println!(
        "Generated {} images, {} failed",
        report.generated,
        report.failures.len()
    );
    for (object_id, count) in report.object_counts.iter() {
        println!("Object {}: {}", object_id, count);
    }
    println!("Done!");
    Ok(())
}

fn run_check(opt: CheckOpt) -> Result<(), Error> {
    let labels = LabelBatch::from_file(&opt.labels)?;
    labels.validate()?;
    if let Some(path) = opt.image {
        let (width, height) = image::image_dimensions(&path)?;
        for (bbox, object_id) in labels.bboxes.iter().zip(labels.object_ids.iter()) {
            if bbox.is_empty() || !bbox.fits_within(width, height) {
                return Err(Error::Precondition(format!(
                    "Bounding box {:?} of object {} is outside of the {}x{} image",
                    bbox.to_array(),
                    object_id,
                    width,
                    height
                )));
            }
        }
    }
    println!("{}", labels);
    Ok(())
}

fn run_preview(opt: PreviewOpt) -> Result<(), Error> {
    let manifest = FrameManifest::from_file(&opt.dataset, None)?;
    let labels = preview_sample(&opt.image, &opt.labels, &manifest, &opt.out)?;
    println!("{}", labels);
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let opt = Opt::from_args();
    match opt {
        Opt::Generate(opt) => run_generate(opt),
        Opt::Check(opt) => run_check(opt),
        Opt::Preview(opt) => run_preview(opt),
    }
}
