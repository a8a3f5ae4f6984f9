//! Build a train / val / test dataset tree from a raw image + label pool.
//!
//! Layout written under the output directory:
//!
//! ```text
//! <output>/train/images/*.jpg   <output>/train/labels/*.txt
//! <output>/val/images/...       <output>/val/labels/...
//! <output>/test/images/...      <output>/test/labels/...
//! ```
//!
//! The run is clear-then-populate. Assignment finishes before any file is
//! copied; copying then runs on a bounded rayon pool.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use leafguard_core::config::{expand_path, AugmentationConfig, DatasetConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::augment::augment_sample;
use crate::error::{DatasetError, DatasetResult};
use crate::labels::{read_boxes, read_classes_lenient, write_labels};
use crate::partition::{class_index, partition, Split, SplitAssignment, SplitRatios};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationReport {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    /// Images dropped because they could not be read or written.
    pub skipped: usize,
    pub augmented: usize,
    /// Images with no matching label file.
    pub unpaired: usize,
    /// Images excluded because another image shares their label file.
    pub ambiguous: usize,
    /// Distinct class ids seen across all labels.
    pub classes: usize,
}

impl GenerationReport {
    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }
}

#[derive(Debug, Serialize)]
struct DataYaml<'a> {
    path: String,
    train: &'static str,
    val: &'static str,
    test: &'static str,
    nc: usize,
    names: &'a [String],
}

enum CopyOutcome {
    Copied(Split),
    Augmented(Split),
    Skipped,
}

/// Raw images split by whether they have exactly one usable label file.
#[derive(Debug, Default)]
pub struct ImageListing {
    /// Image file names with their own label file, sorted.
    pub paired: Vec<String>,
    pub unpaired: usize,
    /// Images whose stem collides with another image, e.g. `leaf.jpg` and
    /// `leaf.png` both claiming `leaf.txt`.
    pub ambiguous: usize,
}

struct CopyTask<'a> {
    index: u64,
    split: Split,
    image: &'a str,
}

pub struct DatasetGenerator<'a> {
    config: &'a DatasetConfig,
    images_dir: PathBuf,
    labels_dir: PathBuf,
    output_dir: PathBuf,
}

impl<'a> DatasetGenerator<'a> {
    pub fn new(config: &'a DatasetConfig) -> Self {
        Self {
            config,
            images_dir: expand_path(&config.raw_images_dir),
            labels_dir: expand_path(&config.raw_labels_dir),
            output_dir: expand_path(&config.output_dir),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run the whole pipeline. `class_names` feeds the optional data.yaml.
    pub fn run(&self, class_names: &[String]) -> DatasetResult<GenerationReport> {
        let ratios = SplitRatios::new(
            self.config.train_ratio,
            self.config.val_ratio,
            self.config.test_ratio,
        )?;

        tracing::info!(output = %self.output_dir.display(), "Preparing split directories");
        prepare_output(&self.output_dir)?;

        let ImageListing {
            paired: images,
            unpaired,
            ambiguous,
        } = list_paired_images(&self.images_dir, &self.labels_dir)?;
        tracing::info!(paired = images.len(), unpaired, ambiguous, "Listed raw images");

        let image_classes: BTreeMap<String, BTreeSet<u32>> = images
            .par_iter()
            .map(|image| {
                let classes = read_classes_lenient(&self.label_path(image));
                (image.clone(), classes)
            })
            .collect();
        let classes = class_index(&image_classes).len();
        tracing::info!(classes, "Read label classes");

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let assignment = partition(&image_classes, &ratios, self.config.strategy, &mut rng);

        let mut report = self.copy_all(&assignment)?;
        report.unpaired = unpaired;
        report.ambiguous = ambiguous;
        report.classes = classes;

        if let Some(yaml_path) = &self.config.data_yaml {
            write_data_yaml(&expand_path(yaml_path), &self.output_dir, class_names)?;
        }

        tracing::info!(
            train = report.train,
            val = report.val,
            test = report.test,
            skipped = report.skipped,
            augmented = report.augmented,
            "Dataset generated"
        );
        Ok(report)
    }

    fn label_path(&self, image: &str) -> PathBuf {
        self.labels_dir.join(label_file_name(image))
    }

    fn copy_all(&self, assignment: &SplitAssignment) -> DatasetResult<GenerationReport> {
        let tasks: Vec<CopyTask<'_>> = assignment
            .iter()
            .enumerate()
            .map(|(index, (split, image))| CopyTask {
                index: index as u64,
                split,
                image,
            })
            .collect();

        let workers = self.config.effective_workers();
        tracing::info!(files = tasks.len(), workers, "Copying files to splits");
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        let outcomes: Vec<CopyOutcome> =
            pool.install(|| tasks.par_iter().map(|task| self.copy_one(task)).collect());

        let mut report = GenerationReport::default();
        for outcome in outcomes {
            let split = match outcome {
                CopyOutcome::Copied(split) => split,
                CopyOutcome::Augmented(split) => {
                    report.augmented += 1;
                    split
                }
                CopyOutcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
            };
            match split {
                Split::Train => report.train += 1,
                Split::Val => report.val += 1,
                Split::Test => report.test += 1,
            }
        }
        Ok(report)
    }

    fn copy_one(&self, task: &CopyTask<'_>) -> CopyOutcome {
        let label_name = label_file_name(task.image);
        let src_image = self.images_dir.join(task.image);
        let src_label = self.labels_dir.join(&label_name);
        let split_dir = self.output_dir.join(task.split.as_str());
        let dst_image = split_dir.join("images").join(task.image);
        let dst_label = split_dir.join("labels").join(&label_name);

        if let Some(aug) = &self.config.augmentation {
            match self.try_augment(task, aug, &src_image, &src_label, &dst_image, &dst_label) {
                Ok(true) => return CopyOutcome::Augmented(task.split),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(image = task.image, "Skipping image: {}", e);
                    remove_partial(&dst_image, &dst_label);
                    return CopyOutcome::Skipped;
                }
            }
        }

        let copied = fs::copy(&src_image, &dst_image)
            .map_err(|e| DatasetError::io(&src_image, e))
            .and_then(|_| {
                fs::copy(&src_label, &dst_label).map_err(|e| DatasetError::io(&src_label, e))
            });
        match copied {
            Ok(_) => CopyOutcome::Copied(task.split),
            Err(e) => {
                tracing::warn!(image = task.image, "Skipping image: {}", e);
                remove_partial(&dst_image, &dst_label);
                CopyOutcome::Skipped
            }
        }
    }

    /// `Ok(false)` means the sample was not selected and should be copied as is.
    fn try_augment(
        &self,
        task: &CopyTask<'_>,
        aug: &AugmentationConfig,
        src_image: &Path,
        src_label: &Path,
        dst_image: &Path,
        dst_label: &Path,
    ) -> DatasetResult<bool> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ task.index),
            None => StdRng::from_os_rng(),
        };
        // Draw before decoding so unselected images are never opened.
        if !rng.random_bool(aug.probability.clamp(0.0, 1.0)) {
            return Ok(false);
        }

        let boxes = match read_boxes(src_label) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::error!("Error reading labels: {}", e);
                return Ok(false);
            }
        };
        let img = image::open(src_image)?.to_rgb8();

        let always = AugmentationConfig {
            probability: 1.0,
            ..aug.clone()
        };
        let Some((out, out_boxes)) = augment_sample(&img, &boxes, &always, &mut rng) else {
            return Ok(false);
        };
        out.save(dst_image)?;
        write_labels(dst_label, &out_boxes).map_err(|e| DatasetError::io(dst_label, e))?;
        Ok(true)
    }
}

/// Create every split directory and empty it of files from a previous run.
pub fn prepare_output(output_dir: &Path) -> DatasetResult<()> {
    for split in Split::ALL {
        for sub in ["images", "labels"] {
            let dir = output_dir.join(split.as_str()).join(sub);
            fs::create_dir_all(&dir).map_err(|e| DatasetError::io(&dir, e))?;
            for entry in fs::read_dir(&dir).map_err(|e| DatasetError::io(&dir, e))? {
                let path = entry.map_err(|e| DatasetError::io(&dir, e))?.path();
                if path.is_file() {
                    fs::remove_file(&path).map_err(|e| DatasetError::io(&path, e))?;
                }
            }
        }
    }
    Ok(())
}

/// A skipped image must leave neither half of its pair behind.
fn remove_partial(dst_image: &Path, dst_label: &Path) {
    for path in [dst_image, dst_label] {
        if path.is_file() {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), "Could not remove partial output: {}", e);
            }
        }
    }
}

/// List the raw images that have a matching label file.
///
/// Images sharing a stem are all excluded: one label file cannot belong to
/// two images that may land in different splits.
pub fn list_paired_images(images_dir: &Path, labels_dir: &Path) -> DatasetResult<ImageListing> {
    let mut by_label: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut listing = ImageListing::default();

    for entry in fs::read_dir(images_dir).map_err(|e| DatasetError::io(images_dir, e))? {
        let path = entry.map_err(|e| DatasetError::io(images_dir, e))?.path();
        if !path.is_file() || !is_image(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let label = label_file_name(name);
        if labels_dir.join(&label).is_file() {
            by_label.entry(label).or_default().push(name.to_string());
        } else {
            tracing::debug!(image = name, "No label file, excluding");
            listing.unpaired += 1;
        }
    }

    for (label, mut images) in by_label {
        if images.len() == 1 {
            listing.paired.append(&mut images);
        } else {
            images.sort();
            tracing::warn!(label = %label, images = ?images, "Several images share one label file, excluding them");
            listing.ambiguous += images.len();
        }
    }

    listing.paired.sort();
    Ok(listing)
}

pub fn write_data_yaml(path: &Path, dataset_dir: &Path, class_names: &[String]) -> DatasetResult<()> {
    let doc = DataYaml {
        path: dataset_dir.display().to_string(),
        train: "train/images",
        val: "val/images",
        test: "test/images",
        nc: class_names.len(),
        names: class_names,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
    }
    let yaml = serde_yaml::to_string(&doc)?;
    fs::write(path, yaml).map_err(|e| DatasetError::io(path, e))?;
    tracing::info!(path = %path.display(), "Wrote data config");
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn label_file_name(image: &str) -> String {
    let stem = Path::new(image)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(image);
    format!("{}.txt", stem)
}
