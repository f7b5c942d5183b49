use image::{GrayImage, Luma};

use kptrack::{
    config::{MatcherFamily, PipelineConfig, SelectionStrategy},
    features::{
        descriptor::{DescriptorExtractor, DescriptorKind},
        detector::{DetectorKind, FeatureDetector},
        filter::Region,
    },
    io::{ImageSequence, InMemorySource},
    viz::NullSink,
    ConfigError, PipelineError, System,
};

/// Patchwork of 12x12 rectangles with pseudo random brightness, translated
/// by `(dx, dy)`.
fn blocks(width: u32, height: u32, dx: i64, dy: i64) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let bx = (x as i64 - dx).div_euclid(12);
        let by = (y as i64 - dy).div_euclid(12);
        let value = (bx * 73_856_093 ^ by * 19_349_663).rem_euclid(251);
        Luma([value as u8])
    })
}

fn whole_image(detector: DetectorKind, descriptor: DescriptorKind) -> PipelineConfig {
    PipelineConfig {
        detector,
        descriptor,
        region: None,
        ..Default::default()
    }
}

#[test]
fn shifted_scene_matches_follow_the_shift() {
    let source = InMemorySource::new(vec![blocks(160, 120, 0, 0), blocks(160, 120, 3, 2)]);
    let mut system = System::new(whole_image(DetectorKind::Fast, DescriptorKind::Brief)).unwrap();
    let summary = system.run(&source, &mut NullSink).unwrap();

    let mut frames = system.frames().iter();
    let older = frames.next().unwrap();
    let newer = frames.next().unwrap();
    assert!(!newer.matches.is_empty());
    assert_eq!(summary.total_matched_keypoints, newer.matches.len());

    let consistent = newer
        .matches
        .iter()
        .filter(|m| {
            let query = newer.keypoints[m.query_index];
            let train = older.keypoints[m.train_index];
            query.x - train.x == 3.0 && query.y - train.y == 2.0
        })
        .count();
    assert!(
        consistent * 2 >= newer.matches.len(),
        "{consistent} of {} matches follow the shift",
        newer.matches.len()
    );
}

#[test]
fn every_valid_pairing_runs() {
    let source = InMemorySource::new(vec![blocks(96, 96, 0, 0), blocks(96, 96, 2, 1)]);

    for detector in DetectorKind::ALL {
        for descriptor in DescriptorKind::ALL {
            let config = whole_image(detector, descriptor);
            let Ok(mut system) = System::new(config) else {
                assert!(descriptor.check_pairing(detector).is_err());
                continue;
            };

            let summary = system
                .run(&source, &mut NullSink)
                .unwrap_or_else(|e| panic!("{detector}/{descriptor}: {e}"));
            assert_eq!(summary.frames, 2);
            assert!(system.frames().iter().all(|frame| frame.is_consistent()));
            assert!(summary.to_string().contains(detector.name()));
        }
    }
}

#[test]
fn sift_descriptors_match_through_the_kd_forest() {
    let source = InMemorySource::new(vec![blocks(128, 128, 0, 0), blocks(128, 128, 2, 2)]);
    let config = PipelineConfig {
        matcher: MatcherFamily::Indexed,
        ..whole_image(DetectorKind::Sift, DescriptorKind::Sift)
    };
    let mut system = System::new(config).unwrap();
    let summary = system.run(&source, &mut NullSink).unwrap();

    assert!(summary.total_keypoints_in_region > 0);
    assert!(summary.total_matched_keypoints > 0);
}

#[test]
fn ring_buffer_keeps_the_newest_frames() {
    let images = (0..5).map(|i| blocks(64, 64, i, 0)).collect();
    let config = PipelineConfig {
        buffer_capacity: 3,
        selector: SelectionStrategy::NearestNeighbor,
        ..whole_image(DetectorKind::Fast, DescriptorKind::Orb)
    };
    let mut system = System::new(config).unwrap();
    system.run(&InMemorySource::new(images), &mut NullSink).unwrap();

    assert_eq!(system.frames().len(), 3);
    assert_eq!(system.frames().iter().last().unwrap().image(), &blocks(64, 64, 4, 0));
    assert_eq!(system.stats().matched_counts().len(), 4);
}

#[test]
fn region_limits_what_is_counted() {
    let source = InMemorySource::new(vec![blocks(160, 120, 0, 0)]);
    let config = PipelineConfig {
        region: Some(Region::new(0, 0, 100, 100)),
        ..whole_image(DetectorKind::Fast, DescriptorKind::Brisk)
    };
    let mut system = System::new(config).unwrap();
    system.run(&source, &mut NullSink).unwrap();

    let frame = system.frames().newest().unwrap();
    assert!(!frame.keypoints.is_empty());
    assert!(frame.keypoints.iter().all(|kp| kp.x < 100.0 && kp.y < 100.0));
}

#[test]
fn yaml_configuration_uses_original_names() {
    let config: PipelineConfig = serde_yaml::from_str(
        "detector: shitomasi\n\
         descriptor: FREAK\n\
         matcher: MAT_FLANN\n\
         selector: SEL_NN\n\
         keypoint_cap: 2\n\
         region: { x: 0, y: 0, width: 100, height: 100 }\n",
    )
    .unwrap();

    assert_eq!(config.detector, DetectorKind::ShiTomasi);
    assert_eq!(config.matcher, MatcherFamily::Indexed);
    assert_eq!(config.keypoint_cap, Some(2));
    assert_eq!(config.buffer_capacity, 2);
    assert_eq!(config.validate(), Ok(()));

    assert!(serde_yaml::from_str::<PipelineConfig>("detector: SURF\n").is_err());
}

#[test]
fn incompatible_pairings_fail_before_any_frame() {
    let config = whole_image(DetectorKind::Sift, DescriptorKind::Orb);
    assert_eq!(
        System::new(config).unwrap_err(),
        ConfigError::IncompatiblePairing {
            detector: DetectorKind::Sift,
            descriptor: DescriptorKind::Orb
        }
    );
}

#[test]
fn foreign_keypoints_are_caught_per_frame() {
    let config = whole_image(DetectorKind::Akaze, DescriptorKind::Akaze);
    let mut system = System::new(config).unwrap().with_providers(
        FeatureDetector::new(DetectorKind::Fast),
        DescriptorExtractor::new(DescriptorKind::Akaze),
    );

    let result = system.process_image(blocks(96, 96, 0, 0));
    assert!(matches!(
        result,
        Err(PipelineError::IncompatibleDetectorDescriptor {
            descriptor: DescriptorKind::Akaze,
            index: 0
        })
    ));
}

#[test]
fn missing_images_abort_with_their_index() {
    let sequence = ImageSequence::new("/nonexistent/kptrack", "", ".png", 0, 3);
    let mut system = System::new(PipelineConfig::default()).unwrap();

    let result = system.run(&sequence, &mut NullSink);
    assert!(matches!(result, Err(PipelineError::ImageLoad { index: 0, .. })));
    assert!(system.frames().is_empty());
}
