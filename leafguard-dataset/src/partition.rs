//! Train / val / test assignment.
//!
//! Assignment is a pure, sequential step over `image -> classes`; nothing is
//! copied until it has finished. Two strategies are available:
//!
//! - [`PartitionStrategy::GreedyPerClass`]: classes are visited in ascending id
//!   order. Each class splits the images not already claimed by an earlier
//!   class, so a multi-class image is locked in by its lowest class id. Global
//!   ratios are approximate; every class gets represented in every split it
//!   has enough images for.
//! - [`PartitionStrategy::Global`]: one shuffle of all images split by the
//!   exact ratios, ignoring classes.
//!
//! Images whose label file holds no boxes form a background bucket that is
//! split last with the same rule, so no paired image is left out.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use leafguard_core::config::PartitionStrategy;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{DatasetError, DatasetResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.70,
            val: 0.20,
            test: 0.10,
        }
    }
}

impl SplitRatios {
    pub fn new(train: f64, val: f64, test: f64) -> DatasetResult<Self> {
        for (name, r) in [("train", train), ("val", val), ("test", test)] {
            if !(0.0..=1.0).contains(&r) {
                return Err(DatasetError::InvalidRatios(format!(
                    "{} ratio {} outside [0, 1]",
                    name, r
                )));
            }
        }
        let sum = train + val + test;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(DatasetError::InvalidRatios(format!(
                "ratios sum to {}, expected 1",
                sum
            )));
        }
        Ok(Self { train, val, test })
    }

    /// Split `total` items: train and val are truncated, test takes the rest.
    pub fn counts(&self, total: usize) -> (usize, usize, usize) {
        let n_train = (total as f64 * self.train) as usize;
        let n_val = ((total as f64 * self.val) as usize).min(total - n_train);
        (n_train, n_val, total - n_train - n_val)
    }
}

/// Which split every image landed in. Image keys are file names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitAssignment {
    pub train: BTreeSet<String>,
    pub val: BTreeSet<String>,
    pub test: BTreeSet<String>,
}

impl SplitAssignment {
    pub fn get(&self, split: Split) -> &BTreeSet<String> {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    fn get_mut(&mut self, split: Split) -> &mut BTreeSet<String> {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn split_of(&self, image: &str) -> Option<Split> {
        Split::ALL
            .into_iter()
            .find(|s| self.get(*s).contains(image))
    }

    /// `(split, image)` pairs in split then name order.
    pub fn iter(&self) -> impl Iterator<Item = (Split, &String)> {
        Split::ALL
            .into_iter()
            .flat_map(move |s| self.get(s).iter().map(move |img| (s, img)))
    }

    /// Shuffle `pool` and deal it out by `ratios`.
    fn deal<R: Rng + ?Sized>(&mut self, mut pool: Vec<String>, ratios: &SplitRatios, rng: &mut R) {
        if pool.is_empty() {
            return;
        }
        pool.shuffle(rng);
        let (n_train, n_val, _) = ratios.counts(pool.len());
        let mut rest = pool.into_iter();
        self.train.extend(rest.by_ref().take(n_train));
        self.val.extend(rest.by_ref().take(n_val));
        self.get_mut(Split::Test).extend(rest);
    }
}

/// Inverse index: class id -> images containing at least one box of it.
pub fn class_index(image_classes: &BTreeMap<String, BTreeSet<u32>>) -> BTreeMap<u32, BTreeSet<String>> {
    let mut index: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
    for (image, classes) in image_classes {
        for class in classes {
            index.entry(*class).or_default().insert(image.clone());
        }
    }
    index
}

pub fn partition<R: Rng + ?Sized>(
    image_classes: &BTreeMap<String, BTreeSet<u32>>,
    ratios: &SplitRatios,
    strategy: PartitionStrategy,
    rng: &mut R,
) -> SplitAssignment {
    match strategy {
        PartitionStrategy::GreedyPerClass => partition_greedy(image_classes, ratios, rng),
        PartitionStrategy::Global => partition_global(image_classes, ratios, rng),
    }
}

fn partition_greedy<R: Rng + ?Sized>(
    image_classes: &BTreeMap<String, BTreeSet<u32>>,
    ratios: &SplitRatios,
    rng: &mut R,
) -> SplitAssignment {
    let mut assignment = SplitAssignment::default();
    let mut used: BTreeSet<String> = BTreeSet::new();

    for (class, images) in class_index(image_classes) {
        let available: Vec<String> = images.difference(&used).cloned().collect();
        tracing::debug!(class, available = available.len(), "Allocating class");
        used.extend(available.iter().cloned());
        assignment.deal(available, ratios, rng);
    }

    let background: Vec<String> = image_classes
        .iter()
        .filter(|(_, classes)| classes.is_empty())
        .map(|(image, _)| image.clone())
        .filter(|image| !used.contains(image))
        .collect();
    if !background.is_empty() {
        tracing::debug!(count = background.len(), "Allocating background images");
        assignment.deal(background, ratios, rng);
    }

    assignment
}

fn partition_global<R: Rng + ?Sized>(
    image_classes: &BTreeMap<String, BTreeSet<u32>>,
    ratios: &SplitRatios,
    rng: &mut R,
) -> SplitAssignment {
    let mut assignment = SplitAssignment::default();
    assignment.deal(image_classes.keys().cloned().collect(), ratios, rng);
    assignment
}
