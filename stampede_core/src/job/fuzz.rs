use crate::call::{Call, CallInput};
use crate::config::{Config, ConfigError, FUZZ_PREFIX, Limit, SUT_PREFIX};
use crate::fuzzer::Fuzzer;
use crate::issue::{self, Issue, Outcome};
use crate::job::{JobContext, JobError, with_call};
use crate::listener::Event;
use std::time::Instant;
use tracing::{debug, info};

/// Feeds the tests of one fuzzer to its SUT.
///
/// The SUT call is rebuilt after every issue, so that state a crash may have
/// left behind does not leak into the rest of the batch.
pub struct FuzzJob {
    fuzzer: String,
    sut: String,
    subconfig: String,
    batch: Limit,
    refresh: Limit,
}

/// Counters between two statistics flushes.
struct Progress {
    index: u64,
    flushed_index: u64,
    issues: u64,
    last_flush: Instant,
    flushed: bool,
}

impl FuzzJob {
    pub fn new(config: &Config, fuzzer: &str, subconfig: &str) -> Result<Self, ConfigError> {
        let section = format!("{FUZZ_PREFIX}{fuzzer}");
        let sut = config.require_str(&section, "sut")?;
        let batch = config.get_limit(&section, "batch")?.unwrap_or(Limit::Finite(1));
        let refresh = config.get_limit(&section, "refresh")?.unwrap_or(batch);
        Ok(Self {
            fuzzer: fuzzer.to_string(),
            sut,
            subconfig: subconfig.to_string(),
            batch,
            refresh,
        })
    }

    pub fn sut(&self) -> &str {
        &self.sut
    }

    pub fn run(&self, ctx: &JobContext) -> Result<Vec<Issue>, JobError> {
        let build = ctx.build_context();
        let mut fuzzer =
            ctx.registry
                .build_fuzzer(&ctx.config, &format!("{FUZZ_PREFIX}{}", self.fuzzer), "fuzzer", &build)?;
        let mut progress = Progress {
            index: 0,
            flushed_index: 0,
            issues: 0,
            last_flush: Instant::now(),
            flushed: false,
        };
        let mut new_issues = Vec::new();

        fuzzer.enter()?;
        let result = self.fuzz(ctx, fuzzer.as_mut(), &mut progress, &mut new_issues);
        let exit = fuzzer.exit();
        let flushed = self.flush(ctx, &mut progress, true);
        result?;
        exit?;
        flushed?;

        info!(
            job_id = ctx.job_id,
            sut = %self.sut,
            fuzzer = %self.fuzzer,
            tests = progress.index,
            new_issues = new_issues.len(),
            "fuzz job finished"
        );
        Ok(new_issues)
    }

    fn fuzz(
        &self,
        ctx: &JobContext,
        fuzzer: &mut dyn Fuzzer,
        progress: &mut Progress,
        new_issues: &mut Vec<Issue>,
    ) -> Result<(), JobError> {
        let build = ctx.build_context();
        let sut_section = format!("{SUT_PREFIX}{}", self.sut);
        let mut batch = self.batch;
        while batch.allows(progress.index) {
            ctx.cancel.check()?;
            let mut call = ctx.registry.build_call(&ctx.config, &sut_section, &["call"], &build)?;
            batch = with_call(call.as_mut(), |call| {
                self.fuzz_with(ctx, call, fuzzer, batch, progress, new_issues)
            })?;
        }
        Ok(())
    }

    /// Runs tests against one entered SUT call until the batch is done or an
    /// issue is found. Returns the batch, shortened if the fuzzer ran dry.
    fn fuzz_with(
        &self,
        ctx: &JobContext,
        call: &mut dyn Call,
        fuzzer: &mut dyn Fuzzer,
        batch: Limit,
        progress: &mut Progress,
        new_issues: &mut Vec<Issue>,
    ) -> Result<Limit, JobError> {
        while batch.allows(progress.index) {
            ctx.cancel.check()?;
            let Some(generated) = fuzzer.generate(progress.index)? else {
                debug!(job_id = ctx.job_id, index = progress.index, "fuzzer exhausted");
                return Ok(Limit::Finite(progress.index));
            };
            let mut outcome = call.call(CallInput::new(generated.clone()))?;

            let index = progress.index;
            progress.index = match fuzzer.index() {
                Some(reported) if reported > index => reported,
                _ => index + 1,
            };
            let test = if fuzzer.provides_test() {
                fuzzer.test()
            } else {
                Some(generated)
            };

            if let Outcome::Issue(found) = &mut outcome {
                let Some(test) = test else {
                    ctx.warning(format!("{} crashed before the first test.", self.sut));
                    return Ok(Limit::Finite(progress.index));
                };
                if !found.has(issue::TEST) {
                    found.insert(issue::TEST, test);
                }
                progress.issues += 1;
            }

            if fuzzer.wants_feedback() {
                fuzzer.feedback(&outcome);
            }
            ctx.emit(Event::JobProgressed {
                job_id: ctx.job_id,
                progress: progress.index,
            });
            if let Limit::Finite(refresh) = self.refresh
                && progress.index - progress.flushed_index >= refresh
            {
                self.flush(ctx, progress, false)?;
            }

            if let Outcome::Issue(found) = outcome {
                ctx.add_issue(&self.sut, &self.fuzzer, Some(&self.subconfig), found, new_issues)?;
                return Ok(batch);
            }
        }
        Ok(batch)
    }

    /// Adds the counters gathered since the previous flush to the stored
    /// statistics. The closing flush is skipped if nothing happened since a
    /// periodic one, but a job always flushes at least once.
    fn flush(&self, ctx: &JobContext, progress: &mut Progress, closing: bool) -> Result<(), JobError> {
        if closing && progress.flushed && progress.index == progress.flushed_index {
            return Ok(());
        }
        ctx.repository.update_stat(
            &self.sut,
            &self.fuzzer,
            &self.subconfig,
            progress.index - progress.flushed_index,
            progress.issues,
            progress.last_flush.elapsed().as_secs_f64(),
        )?;
        progress.flushed_index = progress.index;
        progress.issues = 0;
        progress.last_flush = Instant::now();
        progress.flushed = true;
        ctx.emit(Event::StatsUpdated);
        Ok(())
    }
}
