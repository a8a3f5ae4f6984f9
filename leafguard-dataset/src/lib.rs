//! Training dataset preparation: label parsing, split assignment, copy-time
//! augmentation and the generator that ties them together.

pub mod augment;
pub mod error;
pub mod generator;
pub mod labels;
pub mod partition;

pub use error::{DatasetError, DatasetResult};
pub use generator::{DatasetGenerator, GenerationReport, ImageListing};
pub use labels::{LabelError, YoloBox};
pub use partition::{Split, SplitAssignment, SplitRatios};
