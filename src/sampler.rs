//! Random selection of the frames pasted into one synthetic image.
extern crate rand;

use rand::Rng;

use crate::dataset::*;
use crate::Error;

/// Randomly choose frames to paste.
///
/// A count `n` is drawn uniformly from `[count.0, count.1)`, `n` distinct sequences are chosen
/// without replacement, and one frame is drawn uniformly from each of them. `n` is capped at the
/// number of sequences in the provider.
pub fn sample_frames<'a, P, R>(
    provider: &'a P,
    count: (usize, usize),
    rng: &mut R,
) -> Result<Vec<&'a Frame>, Error>
where
    P: FrameProvider + ?Sized,
    R: Rng + ?Sized,
{
    if count.0 >= count.1 {
        return Err(Error::Config(format!(
            "frame count range [{}, {}) is empty",
            count.0, count.1
        )));
    }
    let seqs = provider.sequence_ids();
    if seqs.is_empty() {
        return Err(Error::EmptyDataset("no sequences to sample from".to_string()));
    }

    let n = rng.gen_range(count.0, count.1).min(seqs.len());
    let chosen = rand::seq::index::sample(rng, seqs.len(), n);

    let mut frames = Vec::with_capacity(n);
    for i in chosen.into_iter() {
        let seq = seqs[i];
        let len = provider.sequence_len(seq);
        if len == 0 {
            return Err(Error::EmptyDataset(format!("sequence {} has no frames", seq)));
        }
        let index = rng.gen_range(0, len);
        let frame = provider.frame(seq, index).ok_or_else(|| {
            Error::EmptyDataset(format!("sequence {} has no frame {}", seq, index))
        })?;
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
fn test_provider(num_sequences: u32, frames_per_sequence: u32) -> FrameManifest {
    let camera = crate::geometry::CameraIntrinsics::from_pinhole(500., 500., 320., 240.).unwrap();
    let mut manifest = FrameManifest::new(camera);
    for seq in 1..=num_sequences {
        for i in 0..frames_per_sequence {
            let annot = Annotation {
                object_id: seq,
                bbox: crate::geometry::BBox::new(0, 0, 10, 10),
                pose: crate::geometry::Pose::identity(),
                keypoints: Vec::new(),
            };
            manifest.add_frame(
                seq,
                Frame::new(format!("{:02}/{:04}.png", seq, i).into(), annot),
            );
        }
    }
    manifest
}

#[test]
fn test_sample_distinct_sequences() {
    use rand::SeedableRng;

    let provider = test_provider(15, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let frames = sample_frames(&provider, (8, 15), &mut rng).unwrap();
        assert!(frames.len() >= 8 && frames.len() < 15);
        let mut ids = frames
            .iter()
            .map(|f| f.annotations[0].object_id)
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), frames.len());
    }
}

#[test]
fn test_sample_capped_by_sequences() {
    use rand::SeedableRng;

    let provider = test_provider(3, 2);
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    let frames = sample_frames(&provider, (8, 15), &mut rng).unwrap();
    assert_eq!(frames.len(), 3);
}

#[test]
fn test_sample_empty_provider() {
    let provider = test_provider(0, 0);
    let mut rng = rand::thread_rng();
    match sample_frames(&provider, (8, 15), &mut rng) {
        Err(Error::EmptyDataset(_)) => (),
        x => panic!("expected an empty dataset error, got {:?}", x),
    }
}
