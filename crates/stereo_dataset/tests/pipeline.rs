//! End-to-end loading: file list -> decode -> assemble.

use image::{GrayImage, Luma, Rgb, RgbImage};
use std::fs;
use std::path::Path;
use stereo_dataset::{
    read_file_list, read_image, read_semantic, AssemblerConfig, AugmentConfig, BatchAssembler, DataLayout, Dataset,
    DatasetError, Mode, SampleLoader, SemanticMask, ShutdownSignal, StereoBatch, TargetSize,
    TestLoader,
};

const LEVELS: [u8; 5] = [0, 60, 120, 180, 240];

fn solid(path: &Path, value: u8) -> anyhow::Result<()> {
    let img = RgbImage::from_pixel(4, 4, Rgb([value, value, value]));
    img.save(path)?;
    Ok(())
}

/// Five stereo pairs mixing jpg and png; left pixel value encodes the line index.
fn write_dataset(root: &Path) -> anyhow::Result<std::path::PathBuf> {
    let mut lines = String::new();
    for (i, level) in LEVELS.iter().enumerate() {
        let ext = if i % 2 == 0 { "png" } else { "jpg" };
        let left = format!("l{i}.{ext}");
        let right = format!("r{i}.{ext}");
        solid(&root.join(&left), *level)?;
        solid(&root.join(&right), 255 - *level)?;
        lines.push_str(&format!("{left} {right}\n"));
    }
    let list = root.join("files.txt");
    fs::write(&list, lines)?;
    Ok(list)
}

fn loader(root: &Path, mode: Mode) -> SampleLoader {
    SampleLoader {
        layout: DataLayout::new(root, Dataset::Kitti),
        target: TargetSize::new(4, 4),
        sem_mask: SemanticMask::None,
        mode,
        do_stereo: true,
        augment: AugmentConfig {
            flip: false,
            photometric: false,
        },
    }
}

fn line_index(batch: &StereoBatch, item: usize) -> usize {
    let v = batch.left_image(item).data[0] * 255.0;
    LEVELS
        .iter()
        .position(|l| (*l as f32 - v).abs() < 6.0)
        .unwrap_or(usize::MAX)
}

fn drain(assembler: &mut BatchAssembler) -> Vec<StereoBatch> {
    let mut out = Vec::new();
    while let Some(batch) = assembler.next_batch().unwrap() {
        out.push(batch);
    }
    out
}

#[test]
fn ordered_single_epoch_keeps_file_order_and_drops_remainder() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    let entries = read_file_list(&list, 2)?;

    for workers in [1, 2, 3] {
        let mut cfg = AssemblerConfig::new(2, workers, false);
        cfg.epochs = Some(1);
        let mut assembler =
            BatchAssembler::spawn(entries.clone(), loader(dir.path(), Mode::Train), cfg)?;
        let batches = drain(&mut assembler);
        assert_eq!(batches.len(), 2, "workers={workers}");
        let order: Vec<usize> = batches
            .iter()
            .flat_map(|b| (0..b.size).map(move |i| line_index(b, i)))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3], "workers={workers}");
        assert_eq!(batches[0].left.len(), 2 * 4 * 4 * 3);
        assert!(batches[0].right.is_some());
        assert!(assembler.next_batch()?.is_none());
    }
    Ok(())
}

#[test]
fn ordered_stream_wraps_across_epochs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    let entries = read_file_list(&list, 2)?;
    let mut cfg = AssemblerConfig::new(3, 2, false);
    cfg.epochs = Some(3);
    let mut assembler = BatchAssembler::spawn(entries, loader(dir.path(), Mode::Train), cfg)?;
    let batches = drain(&mut assembler);
    assert_eq!(batches.len(), 5);
    let order: Vec<usize> = batches
        .iter()
        .flat_map(|b| (0..b.size).map(move |i| line_index(b, i)))
        .collect();
    let expected: Vec<usize> = (0..15).map(|i| i % 5).collect();
    assert_eq!(order, expected);
    Ok(())
}

#[test]
fn randomized_draws_wait_for_min_after_dequeue() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    let entries = read_file_list(&list, 2)?;
    let mut cfg = AssemblerConfig::new(2, 2, true);
    cfg.min_after_dequeue = 6;
    cfg.seed = Some(11);
    let mut assembler = BatchAssembler::spawn(entries, loader(dir.path(), Mode::Train), cfg)?;
    for _ in 0..4 {
        let batch = assembler.next_batch()?.expect("endless stream");
        assert_eq!(batch.size, 2);
        assert!(assembler.stats().last_draw_depth >= 8);
        assert!(assembler.stats().last_draw_depth <= assembler.config().capacity());
    }
    Ok(())
}

#[test]
fn randomized_stream_drains_after_producers_finish() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    let entries = read_file_list(&list, 2)?;
    let mut cfg = AssemblerConfig::new(2, 2, true);
    cfg.epochs = Some(1);
    let mut assembler = BatchAssembler::spawn(entries, loader(dir.path(), Mode::Train), cfg)?;
    let batches = drain(&mut assembler);
    assert_eq!(batches.len(), 2);
    let mut seen: Vec<usize> = batches
        .iter()
        .flat_map(|b| (0..b.size).map(move |i| line_index(b, i)))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 4);
    Ok(())
}

#[test]
fn missing_image_surfaces_as_io_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    fs::remove_file(dir.path().join("r0.png"))?;
    let entries = read_file_list(&list, 2)?;
    let mut cfg = AssemblerConfig::new(2, 2, false);
    cfg.epochs = Some(1);
    let mut assembler = BatchAssembler::spawn(entries, loader(dir.path(), Mode::Train), cfg)?;
    match assembler.next_batch() {
        Err(DatasetError::Io { path, .. }) => assert!(path.ends_with("r0.png")),
        other => panic!("expected io error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn shutdown_cancels_consumer() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_dataset(dir.path())?;
    let entries = read_file_list(&list, 2)?;
    let signal = ShutdownSignal::new();
    let cfg = AssemblerConfig::new(2, 2, false);
    let mut assembler = BatchAssembler::spawn_with_shutdown(
        entries,
        loader(dir.path(), Mode::Train),
        cfg,
        signal.clone(),
    )?;
    assert!(assembler.next_batch()?.is_some());
    signal.trigger();
    assert!(matches!(assembler.next_batch(), Err(DatasetError::Cancelled)));
    Ok(())
}

#[test]
fn test_loader_pairs_each_sample_with_its_mirror() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut img = RgbImage::new(4, 2);
    for (x, _, px) in img.enumerate_pixels_mut() {
        let v = (x * 60) as u8;
        *px = Rgb([v, v, v]);
    }
    img.save(dir.path().join("left.png"))?;
    fs::write(dir.path().join("list.txt"), "left.png\n")?;
    let entries = read_file_list(&dir.path().join("list.txt"), 1)?;

    let mut sample_loader = loader(dir.path(), Mode::Test);
    sample_loader.do_stereo = false;
    sample_loader.target = TargetSize::new(2, 4);
    let mut test_loader = TestLoader::new(entries, sample_loader);
    assert_eq!(test_loader.len(), 1);

    let batch = test_loader.next_batch()?.expect("one entry");
    assert_eq!(batch.size, 2);
    assert!(batch.right.is_none());
    assert_eq!(batch.left_image(1), batch.left_image(0).mirrored());
    assert!(test_loader.next_batch()?.is_none());
    Ok(())
}

/// 2 columns, 5 rows; only the bottom row differs.
fn write_hood_frames(root: &Path) -> anyhow::Result<(std::path::PathBuf, std::path::PathBuf)> {
    let image_path = root.join("frame.png");
    RgbImage::from_fn(2, 5, |_, y| if y == 4 { Rgb([250; 3]) } else { Rgb([100; 3]) })
        .save(&image_path)?;
    let label_path = root.join("labels.png");
    GrayImage::from_fn(2, 5, |_, y| if y == 4 { Luma([26]) } else { Luma([7]) })
        .save(&label_path)?;
    Ok((image_path, label_path))
}

#[test]
fn cityscapes_drops_the_bottom_fifth_before_resizing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (image_path, label_path) = write_hood_frames(dir.path())?;
    let body = 100.0 / 255.0;

    let cropped = read_image(&image_path, TargetSize::new(2, 2), Dataset::Cityscapes)?;
    assert!(cropped.data.iter().all(|v| (v - body).abs() < 1e-6), "{:?}", cropped.data);
    let full = read_image(&image_path, TargetSize::new(2, 2), Dataset::Kitti)?;
    assert!(full.data.iter().any(|v| *v > body + 0.01));

    let (labels, valid) = read_semantic(
        Some(&label_path),
        TargetSize::new(5, 2),
        Dataset::Cityscapes,
        SemanticMask::OnlyVehicle,
    )?;
    assert!(labels.ids.iter().all(|id| *id == 7), "{:?}", labels.ids);
    assert!(valid.data.iter().all(|v| *v == 0.0));
    let (labels, _) = read_semantic(
        Some(&label_path),
        TargetSize::new(5, 2),
        Dataset::Kitti,
        SemanticMask::OnlyVehicle,
    )?;
    assert!(labels.ids.contains(&26));
    Ok(())
}

#[test]
fn single_row_cityscapes_frames_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image_path = dir.path().join("thin.png");
    RgbImage::from_pixel(3, 1, Rgb([10, 20, 30])).save(&image_path)?;
    let label_path = dir.path().join("thin_labels.png");
    GrayImage::from_pixel(3, 1, Luma([7])).save(&label_path)?;
    let target = TargetSize::new(2, 2);

    assert!(matches!(
        read_image(&image_path, target, Dataset::Cityscapes),
        Err(DatasetError::Config(_))
    ));
    assert!(matches!(
        read_semantic(Some(&label_path), target, Dataset::Cityscapes, SemanticMask::None),
        Err(DatasetError::Config(_))
    ));
    assert!(read_image(&image_path, target, Dataset::Kitti)?.data.iter().all(|v| v.is_finite()));
    Ok(())
}
