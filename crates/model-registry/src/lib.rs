pub mod gbdt;
pub mod logistic;
pub mod math;
pub mod predictor;
pub mod registry;
pub mod sequence;
pub mod store;

pub use gbdt::GbdtPredictor;
pub use logistic::LogisticPredictor;
pub use predictor::{deserialize_predictor, Predictor, TrainOptions};
pub use registry::ModelRegistry;
pub use sequence::SequencePredictor;
pub use store::RegistryStore;
