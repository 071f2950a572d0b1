//! Label transformation for pasted objects and the label files written for each synthetic image.
extern crate byteorder;
extern crate itertools;

use byteorder::*;
use cgmath::{Matrix3, Point2};
use itertools::Itertools;
use nom::character::complete::{digit1, multispace0};
use nom::combinator::map_res;
use nom::error::{ErrorKind, VerboseError};
use nom::multi::count;
use nom::number::complete::{be_f64, be_u64, double};
use nom::sequence::preceded;
use nom::IResult;

use std::convert::TryFrom;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;
use std::str::FromStr;

use crate::dataset::Annotation;
use crate::geometry::*;
use crate::Error;

/// An object pasted into a synthetic image, with labels in canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub bbox: BBox,
    pub pose: Pose,
    pub keypoints: Vec<Point2<f64>>,
    pub object_id: u32,
}

/// Image plane transform of a paste: scale by `sf`, then move the top left corner of
/// `source_bbox` onto `anchor`.
///
/// ```txt
/// [ sf  0  anchor.x - bbox.x1 ]
/// [ 0  sf  anchor.y - bbox.y1 ]
/// [ 0   0  1                  ]
/// ```
pub fn placement_transform(sf: f64, source_bbox: &BBox, anchor: (u32, u32)) -> Matrix3<f64> {
    let dx = anchor.0 as f64 - source_bbox.x1 as f64;
    let dy = anchor.1 as f64 - source_bbox.y1 as f64;
    Matrix3::new(sf, 0., 0., 0., sf, 0., dx, dy, 1.)
}

/// Move keypoints from the frame of `source_bbox` to the canvas at `anchor`. The keypoints must
/// already be scaled along with `source_bbox`.
pub fn transform_keypoints(
    keypoints: &[Point2<f64>],
    source_bbox: &BBox,
    anchor: (u32, u32),
) -> Vec<Point2<f64>> {
    keypoints
        .iter()
        .map(|kp| {
            Point2::new(
                kp.x - source_bbox.x1 as f64 + anchor.0 as f64,
                kp.y - source_bbox.y1 as f64 + anchor.1 as f64,
            )
        })
        .collect()
}

/// Re-derive a pose for a pasted object as `K⁻¹ · T · K · [R|t]` where `T` is the
/// [placement_transform]. Projecting the new pose through `K` gives the original projection with
/// `T` applied, which is exactly what happened to the pixels.
pub fn transform_pose(
    pose: &Pose,
    sf: f64,
    source_bbox: &BBox,
    anchor: (u32, u32),
    camera: &CameraIntrinsics,
) -> Pose {
    let t = placement_transform(sf, source_bbox, anchor);
    pose.premultiply(camera.inverse() * t * camera.matrix())
}

/// Labels of an object pasted at `anchor`. `scaled` is the annotation after scaling the source
/// image by `sf`.
pub fn place_labels(
    scaled: &Annotation,
    sf: f64,
    anchor: (u32, u32),
    camera: &CameraIntrinsics,
) -> Placement {
    Placement {
        bbox: BBox::from_anchor(
            anchor.0,
            anchor.1,
            scaled.bbox.width(),
            scaled.bbox.height(),
        ),
        pose: transform_pose(&scaled.pose, sf, &scaled.bbox, anchor, camera),
        keypoints: transform_keypoints(&scaled.keypoints, &scaled.bbox, anchor),
        object_id: scaled.object_id,
    }
}

/// Labels of one synthetic image, stored as parallel sequences indexed by placement order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelBatch {
    pub bboxes: Vec<BBox>,
    pub keypoints: Vec<Vec<Point2<f64>>>,
    pub poses: Vec<Pose>,
    pub object_ids: Vec<u32>,
}

impl LabelBatch {
    pub fn from_placements(placements: &[Placement]) -> Self {
        let mut batch = LabelBatch::default();
        for p in placements {
            batch.push(p.clone());
        }
        batch
    }

    pub fn push(&mut self, placement: Placement) {
        self.bboxes.push(placement.bbox);
        self.keypoints.push(placement.keypoints);
        self.poses.push(placement.pose);
        self.object_ids.push(placement.object_id);
    }

    /// Number of placed objects.
    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    /// Keypoints per object. Zero for an empty batch.
    pub fn num_keypoints(&self) -> usize {
        self.keypoints.first().map(|x| x.len()).unwrap_or(0)
    }

    /// Check that all sequences have the same length and all objects the same number of
    /// keypoints.
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.len();
        if self.bboxes.len() != n || self.keypoints.len() != n || self.poses.len() != n {
            return Err(Error::Precondition(format!(
                "label sequences differ in length: {} bboxes, {} keypoints, {} poses, {} object ids",
                self.bboxes.len(),
                self.keypoints.len(),
                self.poses.len(),
                n
            )));
        }
        let k = self.num_keypoints();
        if let Some(kps) = self.keypoints.iter().find(|x| x.len() != k) {
            return Err(Error::Precondition(format!(
                "objects have differing keypoint counts ({} and {})",
                k,
                kps.len()
            )));
        }
        Ok(())
    }

    /// Parse labels in the text format.
    ///
    /// ```txt
    /// <num_objects> <num_keypoints>
    /// <object_id> <x1> <y1> <x2> <y2>
    /// <pose as 12 row-major values>
    /// <x_1> <y_1> ... <x_K> <y_K>
    /// ...
    /// ```
    pub fn from_file_text(path: &Path) -> Result<Self, Error> {
        fn parse_internal(input: &str) -> IResult<&str, LabelBatch, VerboseError<&str>> {
            fn unsigned<T: FromStr>(input: &str) -> IResult<&str, T, VerboseError<&str>> {
                preceded(multispace0, map_res(digit1, T::from_str))(input)
            }

            let (input, n) = unsigned::<usize>(input)?;
            let (input, k) = unsigned::<usize>(input)?;
            // every value takes a separator and at least one digit
            let num_values =
                keypoint_values(k as u64, 2, input.len()).ok_or_else(|| too_large(input))?;
            let mut batch = LabelBatch::default();
            let mut input = input;
            for _ in 0..n {
                let (i, object_id) = unsigned(input)?;
                let (i, b) = count(unsigned::<u32>, 4)(i)?;
                let (i, p) = count(preceded(multispace0, double), 12)(i)?;
                let (i, kps) = count(preceded(multispace0, double), num_values)(i)?;
                input = i;
                batch.push(placement_from_parts(object_id, &b, &p, &kps));
            }
            let (input, _) = multispace0(input)?;
            Ok((input, batch))
        }

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        match parse_internal(contents.as_ref()) {
            Ok(("", batch)) => Ok(batch),
            Ok((rest, _)) => Err(Error::ParseError(format!(
                "{} trailing bytes in {}",
                rest.len(),
                path.display()
            ))),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::ParseError(
                nom::error::convert_error(contents.as_ref(), e),
            )),
            Err(nom::Err::Incomplete(x)) => Err(Error::ParseError(format!("{:?}", x))),
        }
    }

    /// Parse labels in the big-endian binary format. See [LabelBatch::write_binary].
    pub fn from_file_binary(path: &Path) -> Result<Self, Error> {
        fn parse_internal(input: &[u8]) -> IResult<&[u8], LabelBatch, VerboseError<&[u8]>> {
            let (input, n) = be_u64(input)?;
            let (input, k) = be_u64(input)?;
            let num_values = keypoint_values(k, 8, input.len()).ok_or_else(|| too_large(input))?;
            let mut batch = LabelBatch::default();
            let mut input = input;
            for _ in 0..n {
                let (i, object_id) = map_res(be_u64, u32::try_from)(input)?;
                let (i, b) = count(map_res(be_u64, u32::try_from), 4)(i)?;
                let (i, p) = count(be_f64, 12)(i)?;
                let (i, kps) = count(be_f64, num_values)(i)?;
                input = i;
                batch.push(placement_from_parts(object_id, &b, &p, &kps));
            }
            Ok((input, batch))
        }

        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        parse_internal(contents.as_slice())
            .map(|x| x.1)
            .map_err(|x| match x {
                nom::Err::Error(_) | nom::Err::Failure(_) => {
                    Error::ParseError("Binary parse error".to_string())
                }
                nom::Err::Incomplete(x) => Error::ParseError(format!("{:?}", x)),
            })
    }

    /// Read labels from a file. `.lbl` is parsed as text, `.blbl` as binary.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        match path.extension().and_then(|x| x.to_str()) {
            Some("lbl") => Self::from_file_text(path),
            Some("blbl") => Self::from_file_binary(path),
            ext => Err(Error::IOError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown label file extension {:?}", ext),
            ))),
        }
    }

    /// Write labels in the text format. See [LabelBatch::from_file_text].
    pub fn write_text(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(&mut file, "{} {}", self.len(), self.num_keypoints())?;
        for i in 0..self.len() {
            let b = self.bboxes[i];
            writeln!(
                &mut file,
                "{} {} {} {} {}",
                self.object_ids[i], b.x1, b.y1, b.x2, b.y2
            )?;
            writeln!(&mut file, "{}", self.poses[i].to_row_major().iter().join(" "))?;
            writeln!(
                &mut file,
                "{}",
                self.keypoints[i]
                    .iter()
                    .map(|p| format!("{} {}", p.x, p.y))
                    .join(" ")
            )?;
        }
        file.flush()
    }

    /// Write labels in binary: `u64` object count and keypoint count, then per object the `u64`
    /// object id, 4 `u64` bbox coordinates, 12 `f64` pose values and the `f64` keypoint
    /// coordinates. Everything is big-endian.
    pub fn write_binary(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u64::<BigEndian>(self.len() as u64)?;
        file.write_u64::<BigEndian>(self.num_keypoints() as u64)?;
        for i in 0..self.len() {
            file.write_u64::<BigEndian>(self.object_ids[i] as u64)?;
            for x in self.bboxes[i].to_array().iter() {
                file.write_u64::<BigEndian>(*x as u64)?;
            }
            for x in self.poses[i].to_row_major().iter() {
                file.write_f64::<BigEndian>(*x)?;
            }
            for p in &self.keypoints[i] {
                file.write_f64::<BigEndian>(p.x)?;
                file.write_f64::<BigEndian>(p.y)?;
            }
        }
        file.flush()
    }

    /// Write labels to a file, choosing the format from the extension. `.lbl` -> text, `.blbl` ->
    /// binary.
    pub fn write(&self, path: &Path) -> Result<(), std::io::Error> {
        match path.extension().and_then(|x| x.to_str()) {
            Some("lbl") => self.write_text(path),
            Some("blbl") => self.write_binary(path),
            ext => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown label file extension {:?}", ext),
            )),
        }
    }
}

/// Number of coordinates of `k` keypoints, or `None` if they cannot fit in `available` bytes at
/// `width` bytes or more per value.
pub(crate) fn keypoint_values(k: u64, width: usize, available: usize) -> Option<usize> {
    let values = usize::try_from(k).ok()?.checked_mul(2)?;
    if values.checked_mul(width)? <= available {
        Some(values)
    } else {
        None
    }
}

pub(crate) fn too_large<I>(input: I) -> nom::Err<VerboseError<I>> {
    nom::Err::Failure(nom::error::ParseError::from_error_kind(
        input,
        ErrorKind::Count,
    ))
}

fn placement_from_parts(object_id: u32, b: &[u32], p: &[f64], kps: &[f64]) -> Placement {
    let mut pose = [0.0; 12];
    pose.copy_from_slice(p);
    Placement {
        bbox: BBox::new(b[0], b[1], b[2], b[3]),
        pose: Pose::from_row_major(&pose),
        keypoints: kps.chunks(2).map(|x| Point2::new(x[0], x[1])).collect(),
        object_id,
    }
}

impl std::fmt::Display for LabelBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Label batch with {} placements and {} keypoints",
            self.len(),
            self.num_keypoints()
        )
    }
}

#[cfg(test)]
fn test_annotation() -> Annotation {
    use cgmath::{InnerSpace, Rad, Vector3};
    Annotation {
        object_id: 4,
        bbox: BBox::new(100, 100, 180, 180),
        pose: Pose::new(
            Matrix3::from_axis_angle(Vector3::new(1., 2., 3.).normalize(), Rad(0.7)),
            Vector3::new(0.05, -0.03, 0.9),
        ),
        keypoints: vec![Point2::new(120., 120.), Point2::new(171.25, 103.5)],
    }
}

#[test]
fn test_place_scaled_example() {
    // 80x80 box scaled by 0.5 and pasted at (50, 50)
    let cam = CameraIntrinsics::from_pinhole(572.4, 573.6, 325.3, 242.0).unwrap();
    let mut scaled = test_annotation();
    scaled.bbox = scaled.bbox.scale(0.5);
    scaled.keypoints = scaled.keypoints.iter().map(|p| *p * 0.5).collect();
    let placement = place_labels(&scaled, 0.5, (50, 50), &cam);
    assert_eq!(placement.bbox, BBox::new(50, 50, 90, 90));
    assert_eq!(placement.keypoints[0], Point2::new(60., 60.));
    assert_eq!(placement.object_id, 4);
}

#[test]
fn test_keypoints_follow_anchor() {
    let annot = test_annotation();
    let moved = transform_keypoints(&annot.keypoints, &annot.bbox, (7, 311));
    for (a, b) in annot.keypoints.iter().zip(moved.iter()) {
        assert_eq!(b.x, a.x - 100. + 7.);
        assert_eq!(b.y, a.y - 100. + 311.);
    }
}

#[test]
fn test_pose_reprojects_like_pixels() {
    use cgmath::Point3;
    let cam = CameraIntrinsics::from_pinhole(572.4, 573.6, 325.3, 242.0).unwrap();
    let annot = test_annotation();
    let sf = 0.45;
    let scaled_bbox = annot.bbox.scale(sf);
    let anchor = (200, 150);
    let pose_out = transform_pose(&annot.pose, sf, &scaled_bbox, anchor, &cam);

    let corners = crate::dataset::box_corners(
        Point3::new(-0.04, -0.05, -0.03),
        Point3::new(0.04, 0.05, 0.03),
    );
    for c in corners.iter() {
        let before = cam.project_object(&annot.pose, *c);
        let after = cam.project_object(&pose_out, *c);
        let expected_x = sf * before.x + anchor.0 as f64 - scaled_bbox.x1 as f64;
        let expected_y = sf * before.y + anchor.1 as f64 - scaled_bbox.y1 as f64;
        assert!((after.x - expected_x).abs() < 1e-6, "{} != {}", after.x, expected_x);
        assert!((after.y - expected_y).abs() < 1e-6, "{} != {}", after.y, expected_y);
    }
}

#[test]
fn test_identity_placement_keeps_pose() {
    use cgmath::AbsDiffEq;
    let cam = CameraIntrinsics::from_pinhole(500., 500., 320., 240.).unwrap();
    let annot = test_annotation();
    let pose_out = transform_pose(&annot.pose, 1.0, &annot.bbox, (100, 100), &cam);
    assert!(pose_out.linear.abs_diff_eq(&annot.pose.linear, 1e-12));
    assert!(pose_out.translation.abs_diff_eq(&annot.pose.translation, 1e-12));
}

#[test]
fn test_label_files() {
    let cam = CameraIntrinsics::from_pinhole(572.4, 573.6, 325.3, 242.0).unwrap();
    let annot = test_annotation();
    let placements = vec![
        place_labels(&annot, 1.0, (3, 4), &cam),
        place_labels(&annot, 0.3, (400, 12), &cam),
    ];
    let batch = LabelBatch::from_placements(&placements);
    assert!(batch.validate().is_ok());
    assert_eq!(batch.to_string(), "Label batch with 2 placements and 2 keypoints");

    let dir = tempfile::tempdir().unwrap();
    for name in &["00000.lbl", "00000.blbl"] {
        let path = dir.path().join(name);
        batch.write(&path).unwrap();
        assert_eq!(LabelBatch::from_file(&path).unwrap(), batch);
    }

    let empty = LabelBatch::default();
    let path = dir.path().join("00001.lbl");
    empty.write(&path).unwrap();
    assert!(LabelBatch::from_file(&path).unwrap().is_empty());

    assert!(batch.write(&dir.path().join("00000.npy")).is_err());
}

#[test]
fn test_validate_count_invariant() {
    let mut batch = LabelBatch::default();
    batch.object_ids.push(1);
    assert!(batch.validate().is_err());
}

#[test]
fn test_huge_keypoint_count() {
    let dir = tempfile::tempdir().unwrap();

    // one object with a full record prefix but an absurd keypoint count
    let path = dir.path().join("huge.blbl");
    let mut file = File::create(&path).unwrap();
    file.write_u64::<BigEndian>(1).unwrap();
    file.write_u64::<BigEndian>(std::u64::MAX).unwrap();
    for x in &[3u64, 0, 0, 10, 10] {
        file.write_u64::<BigEndian>(*x).unwrap();
    }
    for x in Pose::identity().to_row_major().iter() {
        file.write_f64::<BigEndian>(*x).unwrap();
    }
    drop(file);
    match LabelBatch::from_file(&path) {
        Err(Error::ParseError(_)) => (),
        x => panic!("expected a parse error, got {:?}", x),
    }

    let path = dir.path().join("large.blbl");
    let mut file = File::create(&path).unwrap();
    file.write_u64::<BigEndian>(1).unwrap();
    file.write_u64::<BigEndian>(1 << 40).unwrap();
    drop(file);
    assert!(LabelBatch::from_file(&path).is_err());

    for (name, contents) in &[
        ("huge.lbl", "1 18446744073709551615\n3 0 0 10 10\n"),
        ("large.lbl", "1 1000000000\n3 0 0 10 10\n1 0 0 0 0 1 0 0 0 0 1 1\n"),
    ] {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        match LabelBatch::from_file(&path) {
            Err(Error::ParseError(_)) => (),
            x => panic!("expected a parse error for {}, got {:?}", name, x),
        }
    }
}

#[test]
fn test_keypoint_values() {
    assert_eq!(keypoint_values(3, 8, 48), Some(6));
    assert_eq!(keypoint_values(3, 8, 47), None);
    assert_eq!(keypoint_values(0, 8, 0), Some(0));
    assert_eq!(keypoint_values(std::u64::MAX, 1, std::usize::MAX), None);
}
