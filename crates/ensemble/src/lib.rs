pub mod consensus;
pub mod fusion;
pub mod labels;
pub mod levels;
pub mod stacking;

pub use consensus::{consensus, TimeframeSignal};
pub use fusion::{fuse, FusedSignal, ModelOutput};
pub use labels::map_label;
pub use levels::compute_levels;
pub use stacking::StackingMeta;
