//! Presence: live connections per identity and the shared connection quota.

pub mod quota;
pub mod registry;

pub use quota::{AdmissionGate, AdmissionPermit, QuotaCheck, QuotaCounter};
pub use registry::{ConnState, ConnectionHandle, ConnectionRegistry, Outbound, Removal, OUTBOUND_CAPACITY};
