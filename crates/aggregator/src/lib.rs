//! Facilitator Aggregator
//!
//! Turns a window's signed ingestion batches into one signed sum batch:
//! authenticates and decodes each batch, runs the share validation protocol
//! with the peer processor through validation batches, and folds the shares
//! of verified packets into the window's partial sum.

pub mod accumulator;
pub mod config;
pub mod emitter;
mod error;
pub mod intake;
pub mod outcome;
pub mod retry;
pub mod sample;
pub mod service;
pub mod validation;

pub use accumulator::WindowState;
pub use config::{FacilitatorConfig, ManifestConfig, PeerPollConfig, RetryConfig, StorageConfig};
pub use emitter::{BatchEmitter, EmitStatus};
pub use error::PipelineError;
pub use intake::{authenticate_and_decode, check_header, AuthenticatedBatch, ExpectedHeader};
pub use outcome::{RunReport, SkipReason, SkippedBatch, WindowFailure, WindowOutcome, WindowStatus};
pub use sample::{ProcessorTarget, SampleGenerator};
pub use service::{align_to_window, Facilitator, FacilitatorKeys, PipelineStores};
pub use validation::{
    LinearSketchVerifier, PacketKeyring, PacketLedger, PacketState, ProofVerifier, RejectReason,
    SharePlaintext,
};
