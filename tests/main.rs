use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::path::*;
use std::process::{Command, Stdio};
use tempfile::tempdir;

/// Write an object image, a manifest with two sequences and `num_backgrounds` backgrounds. The
/// backgrounds listed in `gray` are grayscale.
fn write_dataset(dir: &Path, num_backgrounds: usize, gray: &[usize]) -> PathBuf {
    let obj = dir.join("obj.png");
    image::RgbImage::from_fn(120, 90, |x, y| {
        if x >= 30 && x < 90 && y >= 20 && y < 70 {
            image::Rgb([180, 90, 40])
        } else {
            image::Rgb([0, 0, 0])
        }
    })
    .save(&obj)
    .unwrap();

    let manifest = dir.join("dataset.frames");
    std::fs::write(
        &manifest,
        "# tiny test dataset\n\
         camera 300 0 80 0 300 60 0 0 1\n\
         model 1 -0.05 -0.05 -0.05 0.05 0.05 0.05\n\
         model 2 -0.05 -0.05 -0.05 0.05 0.05 0.05\n\
         frame 1 obj.png\n\
         annot 1 30 20 90 70 1 0 0 0 0 1 0 0 0 0 1 0.8 2 40 30 80 60\n\
         frame 2 obj.png\n\
         annot 2 30 20 90 70 1 0 0 0.01 0 1 0 0 0 0 1 0.9 2 50 40 60 50\n",
    )
    .unwrap();

    let bgroot = dir.join("backgrounds");
    std::fs::create_dir_all(&bgroot).unwrap();
    for i in 0..num_backgrounds {
        let path = bgroot.join(format!("{:03}.png", i));
        if gray.contains(&i) {
            image::GrayImage::from_pixel(64, 48, image::Luma([100]))
                .save(&path)
                .unwrap();
        } else {
            image::RgbImage::from_pixel(64, 48, image::Rgb([20, 120, 220]))
                .save(&path)
                .unwrap();
        }
    }
    manifest
}

fn generate(dir: &Path, manifest: &Path) -> Command {
    let mut cmd = Command::cargo_bin("posesynth").unwrap();
    cmd.arg("generate")
        .arg(manifest)
        .arg("--bgroot")
        .arg(dir.join("backgrounds"))
        .arg("--saveroot")
        .arg(dir.join("out"))
        .arg("--kpnum")
        .arg("2")
        .arg("--kptype")
        .arg("corner")
        .arg("--width")
        .arg("160")
        .arg("--height")
        .arg("120")
        .arg("--min-frames")
        .arg("1")
        .arg("--max-frames")
        .arg("3")
        .arg("--seed")
        .arg("3")
        .arg("--quiet");
    cmd
}

#[test]
fn generate_samples() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 4, &[]);

    let mut cmd = generate(dir.path(), &manifest);
    cmd.arg("--num").arg("3");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("[LOG] Number of keypoints: 2"))
        .stdout(predicate::str::contains("[LOG] Type of keypoints: corner"))
        .stdout(predicate::str::contains(
            "[LOG] Number of images to generate: 3",
        ))
        .stdout(predicate::str::contains("[LOG] Sticking images"))
        .stdout(predicate::str::contains("[ERROR]").not())
        .stdout(predicate::str::contains("Done!"));

    let root = dir.path().join("out/2/corner");
    for i in 0..3 {
        assert!(root.join(format!("images/{:05}.png", i)).exists());
        assert!(root.join(format!("annots/{:05}.lbl", i)).exists());
    }
    assert!(!root.join("images/00003.png").exists());

    Ok(())
}

#[test]
fn grayscale_backgrounds_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 6, &[1, 4]);

    let output = generate(dir.path(), &manifest).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert_eq!(stdout.matches("[ERROR] Gray scale").count(), 2);
    assert_eq!(stdout.matches(" in No.").count(), 2);
    assert!(stdout.contains("Generated 4 images, 2 failed"));
    assert!(stdout.contains("Done!"));

    let images = std::fs::read_dir(dir.path().join("out/2/corner/images"))?.count();
    assert_eq!(images, 4);

    Ok(())
}

#[test]
fn wrong_keypoint_count() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 2, &[]);

    let mut cmd = Command::cargo_bin("posesynth")?;
    cmd.arg("generate")
        .arg(&manifest)
        .arg("--bgroot")
        .arg(dir.path().join("backgrounds"))
        .arg("--saveroot")
        .arg(dir.path().join("out"))
        .arg("--kpnum")
        .arg("3")
        .arg("--kptype")
        .arg("sift");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("expected 3"));

    Ok(())
}

#[test]
fn overwrite_prompt() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 2, &[]);
    generate(dir.path(), &manifest).assert().success();

    let mut child = generate(dir.path(), &manifest)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .ok_or("no stdin")?
        .write_all(b"n\n")?;
    let output = child.wait_with_output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("proceed (y/[n])?"));
    assert!(stdout.contains("Aborted"));
    assert!(!stdout.contains("Done!"));

    let mut cmd = generate(dir.path(), &manifest);
    cmd.arg("--yes");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("proceed").not())
        .stdout(predicate::str::contains("Done!"));

    Ok(())
}

#[test]
fn check_binary_labels() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 2, &[]);
    let mut cmd = generate(dir.path(), &manifest);
    cmd.arg("--binary-labels");
    cmd.assert().success();

    let root = dir.path().join("out/2/corner");
    let mut cmd = Command::cargo_bin("posesynth")?;
    cmd.arg("check")
        .arg(root.join("annots/00000.blbl"))
        .arg("--image")
        .arg(root.join("images/00000.png"));
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Label batch with"));

    Ok(())
}

#[test]
fn check_rejects_garbage() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let labels = dir.path().join("bad.lbl");
    std::fs::write(&labels, "1 2\n3 0 0 10\n")?;

    let mut cmd = Command::cargo_bin("posesynth")?;
    cmd.arg("check").arg(&labels);
    cmd.assert().failure();

    Ok(())
}

#[test]
fn preview_sample() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let manifest = write_dataset(dir.path(), 2, &[]);
    generate(dir.path(), &manifest).assert().success();

    let root = dir.path().join("out/2/corner");
    let out = dir.path().join("preview.png");
    let mut cmd = Command::cargo_bin("posesynth")?;
    cmd.arg("preview")
        .arg(&manifest)
        .arg(root.join("images/00001.png"))
        .arg(root.join("annots/00001.lbl"))
        .arg(&out);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Label batch with"));
    assert_eq!(image::image_dimensions(&out)?, (160, 120));

    Ok(())
}
