// Detector state machines fed by the per-symbol pipeline

pub mod absorption;
pub mod confluence;
pub mod cvd;
pub mod imbalance;
pub mod outcome;
pub mod profile;

pub use absorption::AbsorptionDetector;
pub use confluence::ConfluenceEngine;
pub use cvd::CvdTracker;
pub use imbalance::StackedImbalanceDetector;
pub use outcome::{OutcomeRequest, OutcomeTracker, OutcomeUpdate};
pub use profile::VolumeProfile;
