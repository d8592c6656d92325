//! cosign-gate: signature enforcement for ECS tasks.
//!
//! Reacts to task state-change events: every container image of the task is
//! checked for a cosign signature made by one trusted key. A task running an
//! image without a valid signature is stopped and operators are notified.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aws;
pub mod config;
pub mod event;
pub mod logging;

pub mod keys;
pub mod registry;
pub mod verify;

pub mod enforce;
pub mod handler;
