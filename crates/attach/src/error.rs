use std::io;

use sattach_common::{LayoutError, StepId};
use sattach_transport::TransportError;
use thiserror::Error;

/// Errors that end an attach attempt.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("job step {0} not found")]
    StepNotFound(StepId),
    #[error("step layout lookup failed: {0:#}")]
    Lookup(anyhow::Error),
    #[error(transparent)]
    InvalidLayout(#[from] LayoutError),
    #[error("unable to bind response port: {0}")]
    Bind(#[source] io::Error),
    #[error("unable to start listener thread: {0}")]
    Thread(#[source] io::Error),
    #[error("no response ports available")]
    NoPorts,
    #[error("re-attach request failed: {0}")]
    Transport(#[from] TransportError),
}
