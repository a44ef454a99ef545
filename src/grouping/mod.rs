// src/grouping/mod.rs
pub mod analyzer;
pub mod assembly;
pub mod clusters;
pub mod results;

pub use analyzer::{AnalyzeAllOutcome, GroupingAnalyzer, analyze_all_concurrent};
pub use assembly::{GroupDecision, GroupIndex, add_to_group, build_group};
pub use clusters::{DetectionOutcome, detect_groups, groups_from_analyses};
pub use results::{GroupingAnalysis, PairAnalysis, PairSignals, Recommendation};
