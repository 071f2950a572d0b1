//! Pixel boxes, rigid poses and pinhole intrinsics.
extern crate cgmath;

use cgmath::prelude::*;
use cgmath::{AbsDiffEq, Matrix3, Point2, Point3, Vector3};

use crate::Error;

/// Axis-aligned box `(x1, y1, x2, y2)` in pixel coordinates. `x2` and `y2` are exclusive, so the
/// box covers `x1..x2` by `y1..y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        BBox { x1, y1, x2, y2 }
    }

    /// Box of `width` by `height` with its top left corner at `(x, y)`.
    pub fn from_anchor(x: u32, y: u32, width: u32, height: u32) -> Self {
        BBox {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Scale all coordinates by `sf`, rounding to the nearest pixel. Rounding is monotonic so a
    /// box inside a `w` by `h` image stays inside the same image scaled by `sf`.
    pub fn scale(&self, sf: f64) -> Self {
        let s = |v: u32| (v as f64 * sf).round() as u32;
        BBox {
            x1: s(self.x1),
            y1: s(self.y1),
            x2: s(self.x2),
            y2: s(self.y2),
        }
    }

    /// Does the box lie inside an image of `width` by `height` pixels?
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x1 <= self.x2 && self.y1 <= self.y2 && self.x2 <= width && self.y2 <= height
    }

    pub fn contains(&self, p: Point2<f64>) -> bool {
        p.x >= self.x1 as f64 && p.x < self.x2 as f64 && p.y >= self.y1 as f64 && p.y < self.y2 as f64
    }

    pub fn to_array(&self) -> [u32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Transform `[R|t]` from object space to camera space.
///
/// After compositing the linear block is no longer a pure rotation: it absorbs the image plane
/// scale of the placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(linear: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            linear,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose::new(Matrix3::identity(), Vector3::new(0., 0., 0.))
    }

    /// Build a pose from the 12 entries of a 3x4 matrix in row-major order.
    pub fn from_row_major(v: &[f64; 12]) -> Self {
        // cgmath constructors are column-major
        Pose {
            linear: Matrix3::new(v[0], v[4], v[8], v[1], v[5], v[9], v[2], v[6], v[10]),
            translation: Vector3::new(v[3], v[7], v[11]),
        }
    }

    /// The 3x4 matrix in row-major order.
    pub fn to_row_major(&self) -> [f64; 12] {
        let mut out = [0.0; 12];
        for i in 0..3 {
            for j in 0..3 {
                out[i * 4 + j] = self.linear[j][i];
            }
            out[i * 4 + 3] = self.translation[i];
        }
        out
    }

    /// Map a point from object space into camera space.
    pub fn transform_point(&self, p: Point3<f64>) -> Point3<f64> {
        Point3::from_vec(self.linear * p.to_vec() + self.translation)
    }

    /// Left multiply the 3x4 matrix by `m`, i.e. `m · [R|t] = [m·R | m·t]`.
    pub fn premultiply(&self, m: Matrix3<f64>) -> Self {
        Pose {
            linear: m * self.linear,
            translation: m * self.translation,
        }
    }
}

/// Pinhole camera intrinsics `K`. The inverse is computed once at construction, so a camera that
/// exists is always invertible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl CameraIntrinsics {
    pub fn new(matrix: Matrix3<f64>) -> Result<Self, Error> {
        let inverse = matrix.invert().ok_or(Error::SingularCamera)?;
        Ok(CameraIntrinsics { matrix, inverse })
    }

    /// Intrinsics from the 9 entries of `K` in row-major order.
    pub fn from_row_major(v: &[f64; 9]) -> Result<Self, Error> {
        Self::new(Matrix3::new(
            v[0], v[3], v[6], v[1], v[4], v[7], v[2], v[5], v[8],
        ))
    }

    pub fn from_pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, Error> {
        Self::from_row_major(&[fx, 0., cx, 0., fy, cy, 0., 0., 1.])
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        self.matrix
    }

    pub fn inverse(&self) -> Matrix3<f64> {
        self.inverse
    }

    pub fn to_row_major(&self) -> [f64; 9] {
        let mut out = [0.0; 9];
        for i in 0..3 {
            for j in 0..3 {
                out[i * 3 + j] = self.matrix[j][i];
            }
        }
        out
    }

    /// Project a point in camera space to pixel coordinates.
    pub fn project(&self, p: Point3<f64>) -> Point2<f64> {
        let h = self.matrix * p.to_vec();
        Point2::new(h.x / h.z, h.y / h.z)
    }

    /// Project a point in object space through `pose` to pixel coordinates.
    pub fn project_object(&self, pose: &Pose, p: Point3<f64>) -> Point2<f64> {
        self.project(pose.transform_point(p))
    }
}

#[test]
fn test_pose_row_major() {
    let v = [
        1., 2., 3., 4., //
        5., 6., 7., 8., //
        9., 10., 11., 12.,
    ];
    let pose = Pose::from_row_major(&v);
    assert_eq!(pose.to_row_major(), v);
    let p = pose.transform_point(Point3::new(1., 0., 0.));
    assert_eq!(p, Point3::new(1. + 4., 5. + 8., 9. + 12.));
}

#[test]
fn test_singular_camera() {
    let cam = CameraIntrinsics::from_row_major(&[1., 2., 3., 2., 4., 6., 0., 0., 1.]);
    match cam {
        Err(Error::SingularCamera) => (),
        x => panic!("expected a singular camera, got {:?}", x),
    }
}

#[test]
fn test_camera_inverse() {
    let cam = CameraIntrinsics::from_pinhole(572.4, 573.6, 325.3, 242.0).unwrap();
    let id = cam.matrix() * cam.inverse();
    assert!(id.abs_diff_eq(&Matrix3::identity(), 1e-12));
}

#[test]
fn test_project() {
    let cam = CameraIntrinsics::from_pinhole(100., 100., 320., 240.).unwrap();
    let uv = cam.project(Point3::new(0.5, -0.25, 2.0));
    assert!(uv.abs_diff_eq(&Point2::new(345., 227.5), 1e-12));
}

#[test]
fn test_bbox_scale() {
    let bbox = BBox::new(100, 100, 180, 180).scale(0.5);
    assert_eq!(bbox, BBox::new(50, 50, 90, 90));
    assert_eq!((bbox.width(), bbox.height()), (40, 40));
    assert!(bbox.fits_within(90, 90));
    assert!(!bbox.fits_within(89, 90));
    assert!(BBox::new(3, 3, 3, 9).is_empty());
}
