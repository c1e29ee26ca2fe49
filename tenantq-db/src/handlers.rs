//! Handlers that only need a tenant's pool.

use async_trait::async_trait;
use serde_json::Value;
use tenantq_job_queue::{HandlerError, JobContext, JobHandler};
use tracing::info;

use crate::DbPool;

pub const PING_JOB_TYPE: &str = "tenant.ping";

/// Checks that a tenant database answers. Useful as a smoke test after
/// onboarding a tenant or rotating its credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

#[async_trait]
impl JobHandler<DbPool> for PingHandler {
    fn job_type(&self) -> &str {
        PING_JOB_TYPE
    }

    async fn execute(&self, ctx: JobContext<DbPool>, _args: Value) -> Result<(), HandlerError> {
        let one: i64 = sqlx::query_scalar("SELECT CAST(1 AS BIGINT)")
            .fetch_one(&ctx.connection)
            .await
            .map_err(|err| HandlerError::new(format!("ping failed: {err}")))?;
        if one != 1 {
            return Err(HandlerError::fatal(format!("ping returned {one}")));
        }
        info!(
            job_id = ctx.job_id,
            tenant = ctx.tenant.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            "tenant database reachable"
        );
        Ok(())
    }
}
