//! Controller-side deploy flow.
//!
//! This crate implements the **host half** of the deploy link. It has no
//! knowledge of serial ports or sockets: links come from a
//! [`LinkOpener`](linkdeploy_transport::LinkOpener), one per attempt.
//!
//! # Pipeline
//!
//! 1. **Load**: read `config.json` from the project folder
//! 2. **Pack**: build the filtered archive once
//! 3. **Attempt**: `CONFIG`, `UPLOAD` and payload, wait for `DONE`
//! 4. **Run**: send `RUN` and relay output for an observation window
//! 5. **Retry**: on any attempt failure, back off and resend everything

pub mod controller;
pub mod deploy;
pub mod error;
pub mod project;
pub mod retry;
pub mod types;

pub use controller::{AttemptState, ControllerSession};
pub use deploy::DeployOrchestrator;
pub use error::{DeployError, Stage};
pub use project::Project;
pub use retry::RetryPolicy;
pub use types::{DeployEvent, DeployOptions, DeployReport, RunReport};
