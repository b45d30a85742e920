/// Pattern clustering with fixed centroids
pub mod clusterer;
pub mod pattern;
pub mod similarity;

pub use clusterer::{
    AssignmentKind, ClusterAssignment, PatternClusterer, PatternFilter,
    MAX_CANDIDATES_PER_COMPONENT,
};
pub use pattern::{ErrorPattern, ImpactScope, PatternImpact};
