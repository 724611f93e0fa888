pub mod indicators;
pub mod labels;
pub mod matrix;
pub mod schema;

#[cfg(test)]
mod indicators_tests;

pub use labels::direction_labels;
pub use matrix::{FeatureEngine, FeatureMatrix, FeatureRow};
pub use schema::{FeatureSchema, FeatureSpec};
