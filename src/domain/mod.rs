//! Data model (spec.md §3 / SPEC_FULL.md §3).

pub mod channel;
pub mod job;
pub mod permission;
pub mod principal;

pub use channel::{Channel, ChannelContext};
pub use job::{
    ActionKind, Container, ContainerKind, Job, JobPayload, JobStatus, LogEntry, Severity,
    ShellKind, SystemUser, TranscriptionSegment,
};
pub use permission::{Clearance, Grant, GlobalFlag, PermissionSet, ResourceCategory, Role, ALL_RESOURCES};
pub use principal::{Agent, CallerRef, User};
