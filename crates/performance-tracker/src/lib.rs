pub mod journal;
pub mod tracker;
pub mod weights;

pub use journal::PredictionJournal;
pub use tracker::PerformanceTracker;
pub use weights::derive_weights;
