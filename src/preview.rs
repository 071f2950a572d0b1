//! Visual inspection of generated samples.
use cgmath::Point2;
use image::{Rgb, RgbImage};
use log::debug;

use std::path::Path;

use crate::dataset::FrameProvider;
use crate::geometry::*;
use crate::labels::LabelBatch;
use crate::Error;

pub const BBOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const WIREFRAME_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 255, 255]);

/// Edges of the box spanned by the 8 model corners, see `box_corners`.
pub const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (0, 2),
    (0, 4),
    (1, 3),
    (1, 5),
    (2, 3),
    (2, 6),
    (3, 7),
    (4, 5),
    (4, 6),
    (5, 7),
    (6, 7),
];

fn put_clipped(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i64 && y < img.height() as i64 {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham line. Parts outside of the image are clipped.
pub fn draw_line(img: &mut RgbImage, from: Point2<f64>, to: Point2<f64>, color: Rgb<u8>) {
    if !(from.x.is_finite() && from.y.is_finite() && to.x.is_finite() && to.y.is_finite()) {
        return;
    }
    let (mut x0, mut y0) = (from.x.round() as i64, from.y.round() as i64);
    let (x1, y1) = (to.x.round() as i64, to.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put_clipped(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Outline of a bbox. The right and bottom edges lie on the last pixel inside the box.
pub fn draw_bbox(img: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    if bbox.is_empty() {
        return;
    }
    let x1 = bbox.x1 as f64;
    let y1 = bbox.y1 as f64;
    let x2 = (bbox.x2 - 1) as f64;
    let y2 = (bbox.y2 - 1) as f64;
    let corners = [
        Point2::new(x1, y1),
        Point2::new(x2, y1),
        Point2::new(x2, y2),
        Point2::new(x1, y2),
    ];
    for i in 0..4 {
        draw_line(img, corners[i], corners[(i + 1) % 4], color);
    }
}

/// Small cross centered on `p`.
pub fn draw_keypoint(img: &mut RgbImage, p: Point2<f64>, color: Rgb<u8>) {
    if !(p.x.is_finite() && p.y.is_finite()) {
        return;
    }
    let (x, y) = (p.x.round() as i64, p.y.round() as i64);
    for d in -2..=2 {
        put_clipped(img, x + d, y, color);
        put_clipped(img, x, y + d, color);
    }
}

/// Draw every placement of `labels`: bbox, projected model box (when the provider knows the
/// model) and keypoints.
pub fn draw_labels<P: FrameProvider + ?Sized>(
    img: &mut RgbImage,
    labels: &LabelBatch,
    provider: &P,
) -> Result<(), Error> {
    labels.validate()?;
    let camera = provider.camera();
    for i in 0..labels.len() {
        draw_bbox(img, &labels.bboxes[i], BBOX_COLOR);

        match provider.model_corners(labels.object_ids[i]) {
            Some(corners) => {
                let projected = corners
                    .iter()
                    .map(|c| camera.project_object(&labels.poses[i], *c))
                    .collect::<Vec<_>>();
                for (a, b) in BOX_EDGES.iter() {
                    draw_line(img, projected[*a], projected[*b], WIREFRAME_COLOR);
                }
            }
            None => debug!("no model extent for object {}", labels.object_ids[i]),
        }

        for kp in &labels.keypoints[i] {
            draw_keypoint(img, *kp, KEYPOINT_COLOR);
        }
    }
    Ok(())
}

/// Render the labels of a written sample on top of its image and save the result.
pub fn preview_sample<P: FrameProvider + ?Sized>(
    image_path: &Path,
    label_path: &Path,
    provider: &P,
    output: &Path,
) -> Result<LabelBatch, Error> {
    let mut img = image::open(image_path)?.to_rgb8();
    let labels = LabelBatch::from_file(label_path)?;
    draw_labels(&mut img, &labels, provider)?;
    img.save(output)?;
    Ok(labels)
}

#[test]
fn test_draw_line() {
    let mut img = RgbImage::new(10, 10);
    let c = Rgb([1, 2, 3]);
    draw_line(&mut img, Point2::new(1., 1.), Point2::new(8., 1.), c);
    for x in 1..=8 {
        assert_eq!(*img.get_pixel(x, 1), c);
    }
    assert_eq!(*img.get_pixel(0, 1), Rgb([0, 0, 0]));
    assert_eq!(*img.get_pixel(9, 1), Rgb([0, 0, 0]));

    draw_line(&mut img, Point2::new(0., 0.), Point2::new(9., 9.), c);
    for i in 0..10 {
        assert_eq!(*img.get_pixel(i, i), c);
    }

    // clipped, must not panic
    draw_line(&mut img, Point2::new(-20., 5.), Point2::new(30., 5.), c);
    assert_eq!(*img.get_pixel(0, 5), c);
    assert_eq!(*img.get_pixel(9, 5), c);
    draw_line(&mut img, Point2::new(std::f64::NAN, 5.), Point2::new(3., 5.), c);
}

#[test]
fn test_draw_bbox() {
    let mut img = RgbImage::new(20, 20);
    draw_bbox(&mut img, &BBox::new(2, 3, 12, 9), BBOX_COLOR);
    assert_eq!(*img.get_pixel(2, 3), BBOX_COLOR);
    assert_eq!(*img.get_pixel(11, 8), BBOX_COLOR);
    assert_eq!(*img.get_pixel(7, 3), BBOX_COLOR);
    assert_eq!(*img.get_pixel(2, 6), BBOX_COLOR);
    assert_eq!(*img.get_pixel(6, 6), Rgb([0, 0, 0]));
    assert_eq!(*img.get_pixel(12, 9), Rgb([0, 0, 0]));
}

#[test]
fn test_draw_labels() {
    use crate::dataset::FrameManifest;
    use crate::labels::Placement;

    let camera = CameraIntrinsics::from_pinhole(100., 100., 50., 50.).unwrap();
    let mut manifest = FrameManifest::new(camera);
    manifest.add_model(
        3,
        cgmath::Point3::new(-0.1, -0.1, -0.1),
        cgmath::Point3::new(0.1, 0.1, 0.1),
    );
    let pose = Pose::new(
        cgmath::Matrix3::new(1., 0., 0., 0., 1., 0., 0., 0., 1.),
        cgmath::Vector3::new(0., 0., 1.),
    );
    let mut labels = LabelBatch::default();
    labels.push(Placement {
        bbox: BBox::new(30, 30, 70, 70),
        pose,
        keypoints: vec![Point2::new(50., 50.)],
        object_id: 3,
    });
    labels.push(Placement {
        bbox: BBox::new(0, 0, 5, 5),
        pose,
        keypoints: vec![Point2::new(2., 2.)],
        object_id: 99,
    });

    let mut img = RgbImage::new(100, 100);
    draw_labels(&mut img, &labels, &manifest).unwrap();
    assert_eq!(*img.get_pixel(30, 30), BBOX_COLOR);
    assert_eq!(*img.get_pixel(50, 50), KEYPOINT_COLOR);
    assert_eq!(*img.get_pixel(2, 2), KEYPOINT_COLOR);
    // the far face (z = 1.1) projects to a square of half width 100 * 0.1 / 1.1
    let far = (50. - 100. * 0.1 / 1.1f64).round() as u32;
    assert_eq!(*img.get_pixel(far, 50), WIREFRAME_COLOR);
}
