pub mod attribution;
pub mod batch;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod features;
pub mod fingerprint;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod saliency;
pub mod scorer;
pub mod signals;

pub use attribution::AttributionIndex;
pub use batch::BatchOrchestrator;
pub use config::Config;
pub use features::FeatureVector;
pub use pipeline::Pipeline;
