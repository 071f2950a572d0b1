//! Synthesize labeled training images for 6-DoF object pose estimation.
//!
//! Annotated object crops are pasted onto background images at random locations and scales. The
//! bounding box, pose and keypoint labels of every pasted object are re-derived so that they stay
//! consistent with the new pixels.
//!
//! Example usage:
//! ```no_run
//! use posesynth::*;
//! use rand::SeedableRng;
//! use std::path::Path;
//!
//! let manifest = FrameManifest::from_file(Path::new("hinterstoisser.frames"), Some(17))?;
//! let config = SynthConfig::default();
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let frames = sample_frames(&manifest, config.frame_count, &mut rng)?;
//! let sample = Compositor::new(&config).compose(
//!     Path::new("background.jpg"),
//!     &frames,
//!     manifest.camera(),
//!     &mut rng,
//! )?;
//! println!("placed {} objects", sample.placements.len());
//! # Ok::<(), posesynth::Error>(())
//! ```

extern crate byteorder;
extern crate cgmath;
extern crate image;
extern crate indicatif;
extern crate itertools;
extern crate log;
extern crate nom;
extern crate rand;

pub mod compositor;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod geometry;
pub mod labels;
pub mod preview;
pub mod sampler;
pub mod writer;

pub use compositor::*;
pub use config::*;
pub use dataset::*;
pub use geometry::*;
pub use labels::*;
pub use sampler::*;

#[derive(Debug)]
pub enum Error {
    ParseError(String),
    EmptyDataset(String),
    Precondition(String),
    SingularCamera,
    Config(String),
    ImageError(image::ImageError),
    IOError(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::ImageError(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ParseError(msg) => write!(f, "Parse error: {}", msg),
            Error::EmptyDataset(msg) => write!(f, "Empty dataset: {}", msg),
            Error::Precondition(msg) => write!(f, "{}", msg),
            Error::SingularCamera => write!(f, "Camera intrinsic matrix is not invertible"),
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::ImageError(e) => write!(f, "{}", e),
            Error::IOError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}
