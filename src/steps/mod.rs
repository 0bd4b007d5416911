//! Built-in step definitions
//!
//! Command payloads and device replies are `key=value` pairs separated by
//! `;`. A reply starting with `error` means the device refused the command.

mod deploy;
mod reboot;
mod verify;

pub use deploy::DeployBundle;
pub use reboot::Reboot;
pub use verify::{device_version_key, VerifyBundle};

use crate::command::Response;
use crate::error::{FleetError, Result};
use crate::job::StepRegistryBuilder;
use indexmap::IndexMap;

pub const DEPLOY_BUNDLE: &str = "deploy-bundle";
pub const VERIFY_BUNDLE: &str = "verify-bundle";
pub const REBOOT: &str = "reboot";

/// Register every built-in step definition
pub fn register_builtin(builder: StepRegistryBuilder) -> Result<StepRegistryBuilder> {
    builder
        .register(DeployBundle::definition())?
        .register(VerifyBundle::definition())?
        .register(Reboot::definition())
}

pub fn encode_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    fields
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse `key=value;...`; entries without `=` are skipped
pub fn parse_fields(text: &str) -> IndexMap<String, String> {
    text.split(';')
        .filter_map(|field| field.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Turn a device acknowledgement into a step result
fn check_ack(command: &str, reply: &Response) -> Result<()> {
    let text = reply.text();
    if text.starts_with("error") {
        return Err(FleetError::StepFailure(format!(
            "{} refused {}: {}",
            reply.sender, command, text
        )));
    }
    Ok(())
}
