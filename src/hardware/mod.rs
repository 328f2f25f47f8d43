//! Hardware and model collaborators.
//!
//! - [`capabilities`]: the blocking traits every stage drives
//! - [`mock`]: simulated implementations for running without hardware

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AcquisitionDevice, AcquisitionSettings, InferenceEngine, InferenceOutput, OutputDevice,
    TriggerState,
};
pub use mock::{MockAcquisition, MockInference, MockOutput, OutputLog};
