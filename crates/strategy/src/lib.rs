pub mod enhanced;
pub mod exit;
pub mod indicators;
pub mod ma_crossover;
pub mod momentum;

pub use enhanced::EnhancedStrategy;
pub use exit::StopDistanceAdvisor;
pub use ma_crossover::MaCrossoverStrategy;
pub use momentum::MomentumPredictor;
