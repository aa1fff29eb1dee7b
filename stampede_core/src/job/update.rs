use crate::config::{ConfigError, SUT_PREFIX};
use crate::issue::Issue;
use crate::job::{JobContext, JobError};
use tracing::info;

/// Runs the `update` plug-in of a SUT.
pub struct UpdateJob {
    sut: String,
}

impl UpdateJob {
    pub fn new(sut: &str) -> Self {
        Self { sut: sut.to_string() }
    }

    pub fn run(&self, ctx: &JobContext) -> Result<Vec<Issue>, JobError> {
        let section = format!("{SUT_PREFIX}{}", self.sut);
        let mut update = ctx
            .registry
            .build_update(&ctx.config, &section, "update", &ctx.build_context())?
            .ok_or_else(|| ConfigError::MissingOption {
                section,
                option: "update".to_string(),
            })?;
        ctx.cancel.check()?;
        info!(job_id = ctx.job_id, sut = %self.sut, "updating SUT");
        update.update()?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::fixture;

    #[test]
    fn test_update_runs_the_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("built");
        let fx = fixture(&format!(
            "[sut.x]\ncall = \"SubprocessCall\"\nupdate = \"SubprocessUpdate\"\n\n[\"sut.x.update\"]\ncommand = \"touch '{}'\"\n",
            marker.display()
        ));
        assert!(UpdateJob::new("x").run(&fx.ctx).unwrap().is_empty());
        assert!(marker.exists());
    }

    #[test]
    fn test_missing_update_is_a_config_error() {
        let fx = fixture("[sut.x]\ncall = \"SubprocessCall\"\n");
        assert!(matches!(
            UpdateJob::new("x").run(&fx.ctx),
            Err(JobError::Config(ConfigError::MissingOption { .. }))
        ));
    }
}
