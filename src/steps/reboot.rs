//! reboot: ask the target to restart, optionally after a delay

use super::{check_ack, encode_fields, REBOOT};
use crate::error::{FleetError, Result};
use crate::job::{StepBehavior, StepContext, StepDefinition};
use async_trait::async_trait;

pub struct Reboot;

impl Reboot {
    pub fn definition() -> StepDefinition {
        StepDefinition::new(REBOOT, &["delay_ms"], Reboot)
    }
}

#[async_trait]
impl StepBehavior for Reboot {
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let payload = match ctx.property("delay_ms") {
            Some(raw) => {
                let delay: u64 = raw.parse().map_err(|e| FleetError::InvalidProperty {
                    step: REBOOT.to_string(),
                    property: "delay_ms".to_string(),
                    reason: format!("{:?}: {}", raw, e),
                })?;
                let delay = delay.to_string();
                encode_fields([("delay_ms", delay.as_str())])
            }
            None => String::new(),
        };

        let reply = ctx.request("reboot", payload).await?;
        check_ack("reboot", &reply)
    }
}
