//! Tunables of the synthesis pipeline.
use std::str::FromStr;

use crate::Error;

/// Strategy used to select keypoints on the object models. Only used to keep the outputs of
/// different keypoint configurations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeypointType {
    Sift,
    Corner,
    Random,
    Cluster,
}

impl KeypointType {
    pub const VARIANTS: &'static [&'static str] = &["sift", "corner", "random", "cluster"];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeypointType::Sift => "sift",
            KeypointType::Corner => "corner",
            KeypointType::Random => "random",
            KeypointType::Cluster => "cluster",
        }
    }
}

impl FromStr for KeypointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sift" => Ok(KeypointType::Sift),
            "corner" => Ok(KeypointType::Corner),
            "random" => Ok(KeypointType::Random),
            "cluster" => Ok(KeypointType::Cluster),
            x => Err(Error::Config(format!(
                "unknown keypoint type {}, expected one of {}",
                x,
                KeypointType::VARIANTS.join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for KeypointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of a synthesis run.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    /// Width and height of every synthetic image.
    pub canvas_size: (u32, u32),
    /// Number of frames pasted per image is drawn from `[frame_count.0, frame_count.1)`.
    pub frame_count: (usize, usize),
    /// Isotropic scale applied to each object is drawn from `[scale_range.0, scale_range.1)`.
    pub scale_range: (f64, f64),
    /// Sharpen object crops with an edge enhancement filter before pasting.
    pub edge_enhance: bool,
    /// Probability of blurring a finished image.
    pub blur_probability: f64,
    /// Gaussian sigma of the blur is drawn from `[blur_sigma.0, blur_sigma.1)`.
    pub blur_sigma: (f32, f32),
}

impl Default for SynthConfig {
    fn default() -> Self {
        SynthConfig {
            canvas_size: (640, 480),
            frame_count: (8, 15),
            scale_range: (0.3, 0.7),
            edge_enhance: true,
            blur_probability: 0.4,
            blur_sigma: (0.5, 1.5),
        }
    }
}

impl SynthConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.canvas_size.0 == 0 || self.canvas_size.1 == 0 {
            return Err(Error::Config(format!(
                "canvas size must be positive (got {}x{})",
                self.canvas_size.0, self.canvas_size.1
            )));
        }
        if self.frame_count.0 == 0 || self.frame_count.0 >= self.frame_count.1 {
            return Err(Error::Config(format!(
                "frame count range [{}, {}) must be non-empty and start at 1 or more",
                self.frame_count.0, self.frame_count.1
            )));
        }
        if !(self.scale_range.0 > 0. && self.scale_range.0 <= self.scale_range.1) {
            return Err(Error::Config(format!(
                "scale range [{}, {}) must be positive and ordered",
                self.scale_range.0, self.scale_range.1
            )));
        }
        if !(0.0..=1.0).contains(&self.blur_probability) {
            return Err(Error::Config(format!(
                "blur probability must be in [0, 1] (got {})",
                self.blur_probability
            )));
        }
        if !(self.blur_sigma.0 > 0. && self.blur_sigma.0 <= self.blur_sigma.1) {
            return Err(Error::Config(format!(
                "blur sigma range [{}, {}) must be positive and ordered",
                self.blur_sigma.0, self.blur_sigma.1
            )));
        }
        Ok(())
    }
}

#[test]
fn test_default_config_is_valid() {
    assert!(SynthConfig::default().validate().is_ok());
}

#[test]
fn test_invalid_ranges() {
    let mut config = SynthConfig::default();
    config.frame_count = (5, 5);
    assert!(config.validate().is_err());

    let mut config = SynthConfig::default();
    config.scale_range = (0.7, 0.3);
    assert!(config.validate().is_err());

    let mut config = SynthConfig::default();
    config.blur_probability = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_keypoint_type() {
    for name in KeypointType::VARIANTS {
        let kp: KeypointType = name.parse().unwrap();
        assert_eq!(kp.to_string(), *name);
    }
    assert!("harris".parse::<KeypointType>().is_err());
}
