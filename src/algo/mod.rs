pub mod ewma;

pub use ewma::{DeviationEstimator, DeviationTracker, Ewma};
