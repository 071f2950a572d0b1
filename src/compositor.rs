//! Pasting object crops onto background images.
extern crate image;

use image::imageops::FilterType;
use image::{GenericImageView, RgbImage};
use log::debug;
use rand::Rng;

use std::path::Path;

use crate::config::SynthConfig;
use crate::dataset::*;
use crate::geometry::*;
use crate::labels::*;
use crate::Error;

/// Edge enhancement kernel. `filter3x3` normalizes by the kernel sum.
const EDGE_ENHANCE: [f32; 9] = [-1., -1., -1., -1., 10., -1., -1., -1., -1.];

/// A finished synthetic image and the labels of every object pasted into it.
#[derive(Debug, Clone)]
pub struct SyntheticSample {
    pub canvas: RgbImage,
    pub placements: Vec<Placement>,
}

/// Scale an annotation along with its image: the bbox is rounded to whole pixels, keypoints are
/// scaled exactly. The pose is left untouched.
pub fn scale_annotation(annotation: &Annotation, sf: f64) -> Annotation {
    Annotation {
        object_id: annotation.object_id,
        bbox: annotation.bbox.scale(sf),
        pose: annotation.pose,
        keypoints: annotation.keypoints.iter().map(|p| *p * sf).collect(),
    }
}

/// Copy `bbox` of `source` into `canvas` with its top left corner at `anchor`.
///
/// Zero channel values in the source are transparent: the canvas keeps its own value for that
/// channel. A truly black object pixel is indistinguishable from background and is dropped too.
pub fn paste_masked(
    canvas: &mut RgbImage,
    source: &RgbImage,
    bbox: &BBox,
    anchor: (u32, u32),
) -> Result<(), Error> {
    let (sw, sh) = source.dimensions();
    if !bbox.fits_within(sw, sh) {
        return Err(Error::Precondition(format!(
            "Bounding box {:?} exceeds the {}x{} source image",
            bbox.to_array(),
            sw,
            sh
        )));
    }
    let target = BBox::from_anchor(anchor.0, anchor.1, bbox.width(), bbox.height());
    let (cw, ch) = canvas.dimensions();
    if !target.fits_within(cw, ch) {
        return Err(Error::Precondition(format!(
            "Placement {:?} exceeds the {}x{} canvas",
            target.to_array(),
            cw,
            ch
        )));
    }

    for dy in 0..bbox.height() {
        for dx in 0..bbox.width() {
            let src = source.get_pixel(bbox.x1 + dx, bbox.y1 + dy);
            let dst = canvas.get_pixel_mut(anchor.0 + dx, anchor.1 + dy);
            for (d, s) in dst.0.iter_mut().zip(src.0.iter()) {
                if *s != 0 {
                    *d = *s;
                }
            }
        }
    }
    Ok(())
}

/// Places frames onto backgrounds and re-derives their labels.
#[derive(Debug, Clone)]
pub struct Compositor {
    canvas_size: (u32, u32),
    scale_range: (f64, f64),
    edge_enhance: bool,
}

impl Compositor {
    pub fn new(config: &SynthConfig) -> Self {
        Compositor {
            canvas_size: config.canvas_size,
            scale_range: config.scale_range,
            edge_enhance: config.edge_enhance,
        }
    }

    /// Load a background and resize it to the canvas size. Grayscale images are rejected.
    pub fn load_background(&self, path: &Path) -> Result<RgbImage, Error> {
        let bg = image::open(path)?;
        if !bg.color().has_color() {
            return Err(Error::Precondition(format!(
                "Gray scale images are not supported! ({})",
                path.display()
            )));
        }
        Ok(bg
            .resize_exact(self.canvas_size.0, self.canvas_size.1, FilterType::Triangle)
            .to_rgb8())
    }

    /// Load the image of a frame scaled by `sf`, sharpened if edge enhancement is on.
    fn load_object(&self, frame: &Frame, bbox: &BBox, sf: f64) -> Result<RgbImage, Error> {
        let img = image::open(&frame.image_path)?;
        if !img.color().has_color() {
            return Err(Error::Precondition(format!(
                "Gray scale images are not supported! ({})",
                frame.image_path.display()
            )));
        }
        let (w, h) = img.dimensions();
        if !bbox.fits_within(w, h) {
            return Err(Error::Precondition(format!(
                "Bounding box {:?} exceeds the {}x{} image {}",
                bbox.to_array(),
                w,
                h,
                frame.image_path.display()
            )));
        }
        let sw = ((w as f64 * sf).round() as u32).max(1);
        let sh = ((h as f64 * sf).round() as u32).max(1);
        let mut scaled = img.resize_exact(sw, sh, FilterType::Triangle);
        if self.edge_enhance {
            scaled = scaled.filter3x3(&EDGE_ENHANCE);
        }
        Ok(scaled.to_rgb8())
    }

    fn draw_scale<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let (lo, hi) = self.scale_range;
        if lo < hi {
            rng.gen_range(lo, hi)
        } else {
            lo
        }
    }

    /// Paste `frames` in order onto `canvas`. Frames that would extend past the canvas, or that
    /// shrink to nothing, are skipped. Later frames overwrite earlier ones where they overlap
    /// but all of them keep their labels.
    pub fn paste_frames<R: Rng + ?Sized>(
        &self,
        canvas: &mut RgbImage,
        frames: &[&Frame],
        camera: &CameraIntrinsics,
        rng: &mut R,
    ) -> Result<Vec<Placement>, Error> {
        let (width, height) = canvas.dimensions();
        let mut placements = Vec::with_capacity(frames.len());
        for frame in frames {
            let anchor = (rng.gen_range(0, width), rng.gen_range(0, height));
            let annotation = frame.single_annotation()?;
            let sf = self.draw_scale(rng);
            let scaled = scale_annotation(annotation, sf);

            if scaled.bbox.is_empty() {
                debug!(
                    "dropping {}: empty at scale {:.3}",
                    frame.image_path.display(),
                    sf
                );
                continue;
            }
            let target = BBox::from_anchor(
                anchor.0,
                anchor.1,
                scaled.bbox.width(),
                scaled.bbox.height(),
            );
            if !target.fits_within(width, height) {
                debug!(
                    "dropping {}: {:?} does not fit in {}x{}",
                    frame.image_path.display(),
                    target.to_array(),
                    width,
                    height
                );
                continue;
            }

            let source = self.load_object(frame, &annotation.bbox, sf)?;
            paste_masked(canvas, &source, &scaled.bbox, anchor)?;
            placements.push(place_labels(&scaled, sf, anchor, camera));
        }
        Ok(placements)
    }

    /// Build one synthetic image from a background and a set of frames.
    pub fn compose<R: Rng + ?Sized>(
        &self,
        background: &Path,
        frames: &[&Frame],
        camera: &CameraIntrinsics,
        rng: &mut R,
    ) -> Result<SyntheticSample, Error> {
        let mut canvas = self.load_background(background)?;
        let placements = self.paste_frames(&mut canvas, frames, camera, rng)?;
        Ok(SyntheticSample { canvas, placements })
    }
}

#[cfg(test)]
fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 251) as u8 + 1, (y % 251) as u8 + 1, 77])
    })
}

#[cfg(test)]
fn test_camera() -> CameraIntrinsics {
    CameraIntrinsics::from_pinhole(572.4, 573.6, 325.3, 242.0).unwrap()
}

#[cfg(test)]
fn test_frame(path: std::path::PathBuf, bbox: BBox) -> Frame {
    Frame::new(
        path,
        Annotation {
            object_id: 9,
            bbox,
            pose: Pose::new(
                cgmath::Matrix3::new(1., 0., 0., 0., 1., 0., 0., 0., 1.),
                cgmath::Vector3::new(0.01, 0.02, 0.7),
            ),
            keypoints: vec![cgmath::Point2::new(90., 90.), cgmath::Point2::new(60., 110.)],
        },
    )
}

#[test]
fn test_zero_pixels_are_transparent() {
    let background = gradient(32, 32);
    let mut canvas = background.clone();
    let mut source = RgbImage::new(8, 8);
    source.put_pixel(2, 2, image::Rgb([200, 0, 5]));
    source.put_pixel(3, 2, image::Rgb([0, 0, 0]));

    paste_masked(&mut canvas, &source, &BBox::new(2, 2, 6, 6), (10, 20)).unwrap();

    let bg = background.get_pixel(10, 20);
    assert_eq!(canvas.get_pixel(10, 20).0, [200, bg[1], 5]);
    assert_eq!(canvas.get_pixel(11, 20), background.get_pixel(11, 20));
    for y in 0..32 {
        for x in 0..32 {
            if (x, y) != (10, 20) {
                assert_eq!(canvas.get_pixel(x, y), background.get_pixel(x, y));
            }
        }
    }
}

#[test]
fn test_all_zero_crop_keeps_background() {
    let background = gradient(20, 20);
    let mut canvas = background.clone();
    let source = RgbImage::new(20, 20);
    paste_masked(&mut canvas, &source, &BBox::new(0, 0, 20, 20), (0, 0)).unwrap();
    assert_eq!(canvas, background);
}

#[test]
fn test_paste_out_of_bounds() {
    let mut canvas = gradient(20, 20);
    let source = gradient(20, 20);
    assert!(paste_masked(&mut canvas, &source, &BBox::new(0, 0, 10, 10), (15, 0)).is_err());
    assert!(paste_masked(&mut canvas, &source, &BBox::new(0, 0, 30, 10), (0, 0)).is_err());
}

#[test]
fn test_oversized_frames_are_dropped() {
    use rand::SeedableRng;

    let mut config = SynthConfig::default();
    config.scale_range = (1.0, 1.0);
    let compositor = Compositor::new(&config);
    let background = gradient(64, 48);
    let mut canvas = background.clone();
    // never read from disk, the box cannot fit anywhere on the canvas
    let frame = test_frame("missing.png".into(), BBox::new(0, 0, 100, 100));
    let frames = vec![&frame, &frame, &frame];
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let placements = compositor
        .paste_frames(&mut canvas, &frames, &test_camera(), &mut rng)
        .unwrap();
    assert!(placements.is_empty());
    assert_eq!(canvas, background);
}

#[test]
fn test_multiple_annotations_rejected() {
    let config = SynthConfig::default();
    let compositor = Compositor::new(&config);
    let mut canvas = gradient(64, 48);
    let mut frame = test_frame("missing.png".into(), BBox::new(0, 0, 10, 10));
    frame.annotations.push(frame.annotations[0].clone());
    let mut rng = rand::thread_rng();
    match compositor.paste_frames(&mut canvas, &[&frame], &test_camera(), &mut rng) {
        Err(Error::Precondition(msg)) => assert!(msg.starts_with("Annotations error!")),
        x => panic!("expected a precondition error, got {:?}", x),
    }
}

#[test]
fn test_grayscale_background_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.png");
    image::GrayImage::from_pixel(40, 30, image::Luma([128])).save(&path).unwrap();
    let compositor = Compositor::new(&SynthConfig::default());
    match compositor.compose(&path, &[], &test_camera(), &mut rand::thread_rng()) {
        Err(Error::Precondition(msg)) => assert!(msg.contains("Gray scale")),
        x => panic!("expected a precondition error, got {:?}", x),
    }
}

#[test]
fn test_compose_from_files() {
    use rand::SeedableRng;

    let dir = tempfile::tempdir().unwrap();
    let bg_path = dir.path().join("bg.png");
    RgbImage::from_pixel(320, 240, image::Rgb([10, 20, 30]))
        .save(&bg_path)
        .unwrap();
    // a black image with a solid 80x80 object
    let obj_path = dir.path().join("obj.png");
    RgbImage::from_fn(200, 200, |x, y| {
        if x >= 50 && x < 130 && y >= 50 && y < 130 {
            image::Rgb([200, 150, 100])
        } else {
            image::Rgb([0, 0, 0])
        }
    })
    .save(&obj_path)
    .unwrap();

    let mut config = SynthConfig::default();
    config.scale_range = (0.5, 0.5);
    let compositor = Compositor::new(&config);
    let frame = test_frame(obj_path, BBox::new(50, 50, 130, 130));
    let cam = test_camera();
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);

    let mut placed = 0;
    for _ in 0..20 {
        let sample = compositor.compose(&bg_path, &[&frame], &cam, &mut rng).unwrap();
        assert_eq!(sample.canvas.dimensions(), (640, 480));
        assert!(sample.placements.len() <= 1);
        for p in &sample.placements {
            placed += 1;
            assert_eq!((p.bbox.width(), p.bbox.height()), (40, 40));
            assert!(p.bbox.x2 <= 640 && p.bbox.y2 <= 480);
            assert_eq!(p.object_id, 9);
            // keypoint (90, 90) is (20, 20) from the scaled box corner (25, 25)
            assert_eq!(p.keypoints[0].x, p.bbox.x1 as f64 + 20.);
            assert_eq!(p.keypoints[0].y, p.bbox.y1 as f64 + 20.);

            let center = sample.canvas.get_pixel(p.bbox.x1 + 20, p.bbox.y1 + 20);
            for (c, e) in center.0.iter().zip([200u8, 150, 100].iter()) {
                assert!((*c as i32 - *e as i32).abs() <= 1);
            }
            // outside of the object the background is untouched
            if p.bbox.x1 > 0 {
                assert_eq!(
                    sample.canvas.get_pixel(p.bbox.x1 - 1, p.bbox.y1).0,
                    [10, 20, 30]
                );
            }
        }
    }
    assert!(placed > 0);
}

#[test]
fn test_grayscale_frame_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray_obj.png");
    image::GrayImage::from_pixel(20, 20, image::Luma([200]))
        .save(&path)
        .unwrap();
    let compositor = Compositor::new(&SynthConfig::default());
    let bbox = BBox::new(2, 2, 12, 12);
    match compositor.load_object(&test_frame(path, bbox), &bbox, 0.5) {
        Err(Error::Precondition(msg)) => assert!(msg.contains("Gray scale")),
        x => panic!("expected a precondition error, got {:?}", x),
    }
}

#[test]
fn test_placement_flush_with_edge() {
    use rand::SeedableRng;

    let dir = tempfile::tempdir().unwrap();
    let obj = dir.path().join("obj.png");
    RgbImage::from_pixel(4, 2, image::Rgb([50, 60, 70]))
        .save(&obj)
        .unwrap();
    let mut config = SynthConfig::default();
    config.scale_range = (1.0, 1.0);
    let compositor = Compositor::new(&config);
    let cam = test_camera();
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);

    // as wide as the canvas: kept at x = 0 (x2 == W), dropped at x = 1 (x2 == W + 1)
    let wide = test_frame(obj.clone(), BBox::new(0, 0, 2, 1));
    let (mut kept, mut dropped) = (0, 0);
    for _ in 0..100 {
        let mut canvas = RgbImage::new(2, 1);
        let placements = compositor
            .paste_frames(&mut canvas, &[&wide], &cam, &mut rng)
            .unwrap();
        match placements.first() {
            Some(p) => {
                assert_eq!(p.bbox, BBox::new(0, 0, 2, 1));
                kept += 1;
            }
            None => dropped += 1,
        }
    }
    assert!(kept > 0 && dropped > 0);

    // one pixel wide fits at every anchor, including flush with the right edge
    let narrow = test_frame(obj, BBox::new(0, 0, 1, 1));
    let mut flush = 0;
    for _ in 0..50 {
        let mut canvas = RgbImage::new(2, 1);
        let placements = compositor
            .paste_frames(&mut canvas, &[&narrow], &cam, &mut rng)
            .unwrap();
        assert_eq!(placements.len(), 1);
        if placements[0].bbox.x2 == 2 {
            flush += 1;
        }
    }
    assert!(flush > 0);
}
