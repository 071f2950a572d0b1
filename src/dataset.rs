//! Annotated object frames and the providers that supply them.
//!
//! The pipeline only needs a [FrameProvider]: sequences of frames addressed by id, the camera
//! intrinsics of the dataset and the 3D extent of each object model. [FrameManifest] is a
//! provider read from a line-oriented text file:
//!
//! ```txt
//! # comment
//! camera <K as 9 row-major values>
//! model <object id> <min x> <min y> <min z> <max x> <max y> <max z>
//! frame <sequence id> <image path>
//! annot <object id> <x1> <y1> <x2> <y2> <pose as 12 row-major values> <K> <x_1> <y_1> ... <x_K> <y_K>
//! ```
//! `annot` lines belong to the `frame` line above them. Relative image paths are relative to the
//! manifest.
extern crate nom;

use cgmath::{Point2, Point3};
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{digit1, space0, space1};
use nom::combinator::{all_consuming, map_res};
use nom::error::VerboseError;
use nom::multi::count;
use nom::number::complete::double;
use nom::sequence::{preceded, terminated};
use nom::IResult;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::geometry::*;
use crate::labels::{keypoint_values, too_large};
use crate::Error;

pub type SequenceId = u32;

/// One annotated object instance inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub object_id: u32,
    /// Tight box around the object in image coordinates.
    pub bbox: BBox,
    /// Object space to camera space transform.
    pub pose: Pose,
    /// 2D keypoints in image coordinates.
    pub keypoints: Vec<Point2<f64>>,
}

/// An image of an object together with its annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image_path: PathBuf,
    pub annotations: Vec<Annotation>,
}

impl Frame {
    pub fn new(image_path: PathBuf, annotation: Annotation) -> Self {
        Frame {
            image_path,
            annotations: vec![annotation],
        }
    }

    /// The annotation of this frame. Only frames with exactly one annotated instance can be pasted.
    pub fn single_annotation(&self) -> Result<&Annotation, Error> {
        match self.annotations.as_slice() {
            [a] => Ok(a),
            x => Err(Error::Precondition(format!(
                "Annotations error! {} has {} annotations, expected 1",
                self.image_path.display(),
                x.len()
            ))),
        }
    }
}

/// Source of annotated frames for the pipeline.
pub trait FrameProvider {
    /// Ids of all sequences, in a stable order.
    fn sequence_ids(&self) -> Vec<SequenceId>;

    /// Number of frames in a sequence. Zero for unknown sequences.
    fn sequence_len(&self, seq: SequenceId) -> usize;

    /// Random access to the frames of a sequence.
    fn frame(&self, seq: SequenceId, index: usize) -> Option<&Frame>;

    /// Intrinsics of the camera all frames were captured with.
    fn camera(&self) -> &CameraIntrinsics;

    /// The 8 corners of the 3D bounding box of an object model.
    fn model_corners(&self, object_id: u32) -> Option<[Point3<f64>; 8]>;
}

/// Corners of the box spanned by `min` and `max`. Corner `i` takes the max coordinate in x if bit
/// 2 of `i` is set, in y for bit 1 and in z for bit 0.
pub fn box_corners(min: Point3<f64>, max: Point3<f64>) -> [Point3<f64>; 8] {
    let mut corners = [min; 8];
    for (i, c) in corners.iter_mut().enumerate() {
        *c = Point3::new(
            if i & 4 != 0 { max.x } else { min.x },
            if i & 2 != 0 { max.y } else { min.y },
            if i & 1 != 0 { max.z } else { min.z },
        );
    }
    corners
}

/// In-memory dataset of frames grouped by sequence.
#[derive(Debug, Clone)]
pub struct FrameManifest {
    camera: CameraIntrinsics,
    sequences: BTreeMap<SequenceId, Vec<Frame>>,
    models: HashMap<u32, (Point3<f64>, Point3<f64>)>,
}

impl FrameProvider for FrameManifest {
    fn sequence_ids(&self) -> Vec<SequenceId> {
        self.sequences.keys().cloned().collect()
    }

    fn sequence_len(&self, seq: SequenceId) -> usize {
        self.sequences.get(&seq).map(|x| x.len()).unwrap_or(0)
    }

    fn frame(&self, seq: SequenceId, index: usize) -> Option<&Frame> {
        self.sequences.get(&seq).and_then(|x| x.get(index))
    }

    fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    fn model_corners(&self, object_id: u32) -> Option<[Point3<f64>; 8]> {
        self.models
            .get(&object_id)
            .map(|(min, max)| box_corners(*min, *max))
    }
}

enum Record {
    Camera(Vec<f64>),
    Model(u32, Vec<f64>),
    Frame(SequenceId, String),
    Annot(Annotation),
}

type ParseResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

fn unsigned<T: FromStr>(input: &str) -> ParseResult<T> {
    map_res(digit1, T::from_str)(input)
}

fn floats(input: &str, n: usize) -> ParseResult<Vec<f64>> {
    count(preceded(space1, double), n)(input)
}

fn camera_record(input: &str) -> ParseResult<Record> {
    let (input, _) = tag("camera")(input)?;
    let (input, k) = floats(input, 9)?;
    Ok((input, Record::Camera(k)))
}

fn model_record(input: &str) -> ParseResult<Record> {
    let (input, _) = tag("model")(input)?;
    let (input, object_id) = preceded(space1, unsigned)(input)?;
    let (input, extent) = floats(input, 6)?;
    Ok((input, Record::Model(object_id, extent)))
}

fn frame_record(input: &str) -> ParseResult<Record> {
    let (input, _) = tag("frame")(input)?;
    let (input, seq) = preceded(space1, unsigned)(input)?;
    let (input, path) = preceded(space1, is_not(" \t\r\n"))(input)?;
    Ok((input, Record::Frame(seq, path.to_string())))
}

fn annot_record(input: &str) -> ParseResult<Record> {
    let (input, _) = tag("annot")(input)?;
    let (input, object_id) = preceded(space1, unsigned)(input)?;
    let (input, b) = count(preceded(space1, unsigned::<u32>), 4)(input)?;
    let (input, p) = floats(input, 12)?;
    let (input, num_kps) = preceded(space1, unsigned::<u64>)(input)?;
    let num_values =
        keypoint_values(num_kps, 2, input.len()).ok_or_else(|| too_large(input))?;
    let (input, kps) = floats(input, num_values)?;

    let mut pose = [0.0; 12];
    pose.copy_from_slice(&p);
    Ok((
        input,
        Record::Annot(Annotation {
            object_id,
            bbox: BBox::new(b[0], b[1], b[2], b[3]),
            pose: Pose::from_row_major(&pose),
            keypoints: kps.chunks(2).map(|x| Point2::new(x[0], x[1])).collect(),
        }),
    ))
}

/// `#` starts a comment at the start of a line or after whitespace. Elsewhere it is part of a
/// path.
fn strip_comment(line: &str) -> &str {
    let mut after_space = true;
    for (i, c) in line.char_indices() {
        if c == '#' && after_space {
            return &line[..i];
        }
        after_space = c.is_whitespace();
    }
    line
}

fn parse_record(line: &str) -> ParseResult<Record> {
    all_consuming(terminated(
        alt((camera_record, model_record, frame_record, annot_record)),
        space0,
    ))(line)
}

impl FrameManifest {
    pub fn new(camera: CameraIntrinsics) -> Self {
        FrameManifest {
            camera,
            sequences: BTreeMap::new(),
            models: HashMap::new(),
        }
    }

    pub fn add_frame(&mut self, seq: SequenceId, frame: Frame) {
        self.sequences.entry(seq).or_insert_with(Vec::new).push(frame);
    }

    /// Register the 3D extent of an object model.
    pub fn add_model(&mut self, object_id: u32, min: Point3<f64>, max: Point3<f64>) {
        self.models.insert(object_id, (min, max));
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn num_frames(&self) -> usize {
        self.sequences.values().map(|x| x.len()).sum()
    }

    /// Parse a manifest from a string. Relative image paths are joined onto `base`. If
    /// `num_keypoints` is given, every annotation must have exactly that many keypoints.
    pub fn parse(contents: &str, base: &Path, num_keypoints: Option<usize>) -> Result<Self, Error> {
        let mut camera = None;
        let mut models = HashMap::new();
        let mut frames: Vec<(SequenceId, Frame)> = Vec::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }
            let record = match parse_record(line) {
                Ok((_, r)) => r,
                Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                    return Err(Error::ParseError(format!(
                        "line {}: {}",
                        lineno + 1,
                        nom::error::convert_error(line, e)
                    )))
                }
                Err(nom::Err::Incomplete(x)) => {
                    return Err(Error::ParseError(format!("line {}: {:?}", lineno + 1, x)))
                }
            };

            match record {
                Record::Camera(k) => {
                    if camera.is_some() {
                        return Err(Error::ParseError(format!(
                            "line {}: duplicate camera record",
                            lineno + 1
                        )));
                    }
                    let mut m = [0.0; 9];
                    m.copy_from_slice(&k);
                    camera = Some(CameraIntrinsics::from_row_major(&m)?);
                }
                Record::Model(object_id, e) => {
                    models.insert(
                        object_id,
                        (Point3::new(e[0], e[1], e[2]), Point3::new(e[3], e[4], e[5])),
                    );
                }
                Record::Frame(seq, path) => {
                    let path = PathBuf::from(path);
                    let image_path = if path.is_relative() {
                        base.join(path)
                    } else {
                        path
                    };
                    frames.push((
                        seq,
                        Frame {
                            image_path,
                            annotations: Vec::new(),
                        },
                    ));
                }
                Record::Annot(annot) => {
                    if annot.bbox.x1 > annot.bbox.x2 || annot.bbox.y1 > annot.bbox.y2 {
                        return Err(Error::ParseError(format!(
                            "line {}: malformed bounding box {:?}",
                            lineno + 1,
                            annot.bbox.to_array()
                        )));
                    }
                    if let Some(k) = num_keypoints {
                        if annot.keypoints.len() != k {
                            return Err(Error::Precondition(format!(
                                "line {}: annotation has {} keypoints, expected {}",
                                lineno + 1,
                                annot.keypoints.len(),
                                k
                            )));
                        }
                    }
                    match frames.last_mut() {
                        Some((_, frame)) => frame.annotations.push(annot),
                        None => {
                            return Err(Error::ParseError(format!(
                                "line {}: annotation before any frame",
                                lineno + 1
                            )))
                        }
                    }
                }
            }
        }

        let camera = camera
            .ok_or_else(|| Error::ParseError("manifest has no camera record".to_string()))?;
        let mut manifest = FrameManifest::new(camera);
        manifest.models = models;
        for (seq, frame) in frames {
            manifest.add_frame(seq, frame);
        }
        Ok(manifest)
    }

    /// Read a manifest from disk.
    pub fn from_file(path: &Path, num_keypoints: Option<usize>) -> Result<Self, Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&contents, base, num_keypoints)
    }
}

#[cfg(test)]
const TEST_MANIFEST: &str = "
# hinterstoisser subset
camera 572.4114 0 325.2611 0 573.57043 242.04899 0 0 1
model 1 -0.04 -0.04 -0.03 0.04 0.04 0.03

frame 1 rgb/0001.png
annot 1 100 100 180 180 1 0 0 0.01 0 1 0 -0.02 0 0 1 0.8 2 120 120 150.5 170
frame 1 rgb/0002.png
annot 1 10 20 30 40 1 0 0 0 0 1 0 0 0 0 1 1 2 11 21 29 39
frame 2 /abs/0001.png
annot 2 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 2 1 1 2 2
annot 3 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 2 1 1 2 2
";

#[test]
fn test_parse_manifest() {
    let m = FrameManifest::parse(TEST_MANIFEST, Path::new("/data/lm"), Some(2)).unwrap();
    assert_eq!(m.sequence_ids(), vec![1, 2]);
    assert_eq!(m.sequence_len(1), 2);
    assert_eq!(m.sequence_len(2), 1);
    assert_eq!(m.sequence_len(7), 0);
    assert_eq!(m.num_frames(), 3);

    let f = m.frame(1, 0).unwrap();
    assert_eq!(f.image_path, Path::new("/data/lm/rgb/0001.png"));
    let a = f.single_annotation().unwrap();
    assert_eq!(a.object_id, 1);
    assert_eq!(a.bbox, BBox::new(100, 100, 180, 180));
    assert_eq!(a.pose.translation.z, 0.8);
    assert_eq!(a.keypoints, vec![Point2::new(120., 120.), Point2::new(150.5, 170.)]);

    assert_eq!(m.frame(2, 0).unwrap().image_path, Path::new("/abs/0001.png"));
    assert!(m.frame(2, 0).unwrap().single_annotation().is_err());
    assert!(m.frame(2, 1).is_none());

    assert_eq!(m.camera().to_row_major()[2], 325.2611);
    let corners = m.model_corners(1).unwrap();
    assert_eq!(corners[0], Point3::new(-0.04, -0.04, -0.03));
    assert_eq!(corners[7], Point3::new(0.04, 0.04, 0.03));
    assert_eq!(corners[4], Point3::new(0.04, -0.04, -0.03));
    assert!(m.model_corners(2).is_none());
}

#[test]
fn test_keypoint_count_mismatch() {
    match FrameManifest::parse(TEST_MANIFEST, Path::new(""), Some(17)) {
        Err(Error::Precondition(_)) => (),
        x => panic!("expected a keypoint count error, got {:?}", x),
    }
}

#[test]
fn test_malformed_manifests() {
    let no_camera = "frame 1 a.png\nannot 1 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 0";
    assert!(FrameManifest::parse(no_camera, Path::new(""), None).is_err());

    let orphan = "camera 1 0 0 0 1 0 0 0 1\nannot 1 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 0";
    assert!(FrameManifest::parse(orphan, Path::new(""), None).is_err());

    let truncated = "camera 1 0 0 0 1 0 0 0 1\nframe 1 a.png\nannot 1 0 0 5 5 1 0 0";
    match FrameManifest::parse(truncated, Path::new(""), None) {
        Err(Error::ParseError(msg)) => assert!(msg.starts_with("line 3")),
        x => panic!("expected a parse error, got {:?}", x),
    }

    let singular = "camera 1 0 0 0 0 0 0 0 1";
    match FrameManifest::parse(singular, Path::new(""), None) {
        Err(Error::SingularCamera) => (),
        x => panic!("expected a singular camera, got {:?}", x),
    }
}

#[test]
fn test_hash_in_path() {
    let manifest = "camera 1 0 0 0 1 0 0 0 1 # unit camera\n\
                    #frame 9 skipped.png\n\
                    frame 1 take#2/0001.png\t# second take\n\
                    annot 1 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 0";
    let m = FrameManifest::parse(manifest, Path::new("/data"), None).unwrap();
    assert_eq!(m.sequence_ids(), vec![1]);
    assert_eq!(
        m.frame(1, 0).unwrap().image_path,
        Path::new("/data/take#2/0001.png")
    );
    assert_eq!(strip_comment("a#b # c"), "a#b ");
}

#[test]
fn test_huge_keypoint_count() {
    let huge = "camera 1 0 0 0 1 0 0 0 1\n\
                frame 1 a.png\n\
                annot 1 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 18446744073709551615 1 2";
    match FrameManifest::parse(huge, Path::new(""), None) {
        Err(Error::ParseError(msg)) => assert!(msg.starts_with("line 3")),
        x => panic!("expected a parse error, got {:?}", x),
    }

    let large = "camera 1 0 0 0 1 0 0 0 1\n\
                 frame 1 a.png\n\
                 annot 1 0 0 5 5 1 0 0 0 0 1 0 0 0 0 1 1 4000000000 1 2";
    assert!(FrameManifest::parse(large, Path::new(""), None).is_err());
}
