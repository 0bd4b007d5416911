//! deploy-bundle: push a bundle to the target and await its acknowledgement

use super::{check_ack, encode_fields, DEPLOY_BUNDLE};
use crate::error::Result;
use crate::job::{StepBehavior, StepContext, StepDefinition};
use async_trait::async_trait;
use tracing::info;

pub struct DeployBundle;

impl DeployBundle {
    pub fn definition() -> StepDefinition {
        StepDefinition::new(DEPLOY_BUNDLE, &["bundle", "version"], DeployBundle)
    }
}

#[async_trait]
impl StepBehavior for DeployBundle {
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let bundle = ctx.require("bundle")?;
        let version = ctx.require("version")?;

        info!(
            "[JOB] Deploying {} ({}) to {} (attempt {})",
            bundle,
            version,
            ctx.target(),
            ctx.attempt()
        );
        let payload = encode_fields([("bundle", bundle), ("version", version)]);
        let reply = ctx.request("deploy", payload).await?;
        check_ack("deploy", &reply)
    }
}
