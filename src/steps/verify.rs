//! verify-bundle: confirm the target reports the expected version

use super::{parse_fields, VERIFY_BUNDLE};
use crate::error::{FleetError, Result};
use crate::job::{StepBehavior, StepContext, StepDefinition};
use async_trait::async_trait;
use tracing::info;

pub struct VerifyBundle;

impl VerifyBundle {
    pub fn definition() -> StepDefinition {
        StepDefinition::new(VERIFY_BUNDLE, &["version"], VerifyBundle)
    }
}

/// Store key holding the last verified version of a device
pub fn device_version_key(target: &str) -> String {
    format!("device/{}/version", target)
}

#[async_trait]
impl StepBehavior for VerifyBundle {
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let expected = ctx.require("version")?;

        let reply = ctx.request("status", "").await?;
        let fields = parse_fields(&reply.text());
        let reported = fields.get("version").map(String::as_str).unwrap_or("");
        if reported != expected {
            return Err(FleetError::StepFailure(format!(
                "{} reports version {:?}, expected {}",
                ctx.target(),
                reported,
                expected
            )));
        }

        let key = device_version_key(ctx.target());
        let version = expected.to_string();
        ctx.transactions()
            .execute(
                move |tx| {
                    Box::pin(async move {
                        tx.put(key, version);
                        Ok(())
                    })
                },
                vec![],
            )
            .await?;

        info!("[JOB] {} verified at version {}", ctx.target(), expected);
        Ok(())
    }
}
