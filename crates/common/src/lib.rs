// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod hostlist;
pub mod layout;

pub use config::{AttachConfig, PortRange};
pub use hostlist::{Hostlist, HostlistError};
pub use layout::{
    LayoutError, StepId, StepLayout, StepLayoutFile, StepLayoutSpec, MAX_TASKS,
};
