//! Alert intake: everything that puts alerts on the supervisor's queue.

pub mod opsgenie;
pub mod webhook;

pub use opsgenie::{OpsGenieClient, OpsGenieSource};
pub use webhook::{AlertManagerAlert, AlertManagerWebhook};
