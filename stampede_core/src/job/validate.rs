use crate::call::CallInput;
use crate::config::SUT_PREFIX;
use crate::issue::{self, Issue};
use crate::job::{JobContext, JobError, with_call};
use crate::listener::Event;
use tracing::info;

/// Fields a replay never overwrites on the stored issue.
const STORED_FIELDS: &[&str] = &[
    issue::ID,
    issue::OID,
    issue::SUT,
    issue::FUZZER,
    issue::SUBCONFIG,
    issue::TEST,
    issue::REDUCED,
    issue::REPORTED,
    issue::INVALID,
    issue::FIRST_SEEN,
    issue::LAST_SEEN,
    issue::COUNT,
];

/// Replays the test of a stored issue to check that it still reproduces.
pub struct ValidateJob {
    issue: Issue,
}

impl ValidateJob {
    pub fn new(issue: Issue) -> Self {
        Self { issue }
    }

    pub fn run(&self, ctx: &JobContext) -> Result<Vec<Issue>, JobError> {
        Ok(self.validate(ctx, false)?.1)
    }

    /// Replays the issue's test against the SUT's `validate_call` (falling
    /// back to `reduce_call`, then `call`).
    ///
    /// If the same issue comes back, its stored record gets the fresh fields
    /// of the replay, unless `check_only` is set. Otherwise the stored issue
    /// is invalidated and whatever different issue the replay produced is
    /// stored instead.
    ///
    /// # Returns
    ///
    /// Whether the issue reproduced, and the issues new to the repository.
    pub fn validate(&self, ctx: &JobContext, check_only: bool) -> Result<(bool, Vec<Issue>), JobError> {
        let id = self
            .issue
            .id()
            .ok_or_else(|| JobError::InvalidIssue("issue has no id".to_string()))?
            .into_owned();
        let sut = self
            .issue
            .sut()
            .ok_or_else(|| JobError::InvalidIssue(format!("{id} has no SUT")))?
            .into_owned();
        let test = self
            .issue
            .test()
            .ok_or_else(|| JobError::InvalidIssue(format!("{id} has no test")))?
            .into_owned();

        let mut call = ctx.registry.build_call(
            &ctx.config,
            &format!("{SUT_PREFIX}{sut}"),
            &["validate_call", "reduce_call", "call"],
            &ctx.build_context(),
        )?;
        let input = CallInput::with_hints(test.clone(), self.issue.clone());
        let outcome = with_call(call.as_mut(), |call| Ok(call.call(input)?))?;
        let oid = ctx.resolve_oid(&self.issue)?;
        let mut new_issues = Vec::new();

        if let Some(mut replayed) = outcome.into_issue() {
            if !replayed.has(issue::TEST) {
                replayed.insert(issue::TEST, test);
            }
            replayed.ensure_id();
            if replayed.id().as_deref() == Some(id.as_str()) {
                if !check_only && let Some(oid) = &oid {
                    let fresh: Issue = replayed
                        .iter()
                        .filter(|(key, _)| !STORED_FIELDS.contains(key))
                        .map(|(key, value)| (key.to_string(), value.clone()))
                        .collect();
                    ctx.repository.update_issue_by_oid(oid, &fresh)?;
                }
                info!(job_id = ctx.job_id, %sut, issue = %id, "issue reproduced");
                return Ok((true, new_issues));
            }
            let fuzzer = self.issue.fuzzer().unwrap_or_default().into_owned();
            let subconfig = self.issue.text(issue::SUBCONFIG).map(|s| s.into_owned());
            ctx.add_issue(&sut, &fuzzer, subconfig.as_deref(), replayed, &mut new_issues)?;
        }

        info!(job_id = ctx.job_id, %sut, issue = %id, "issue did not reproduce");
        if let Some(oid) = oid
            && ctx.repository.invalidate_issue_by_oid(&oid)?
        {
            let invalidated = ctx
                .repository
                .find_issue_by_oid(&oid)?
                .unwrap_or_else(|| self.issue.clone());
            ctx.emit(Event::IssueInvalidated {
                job_id: ctx.job_id,
                issue: invalidated,
            });
        }
        Ok((false, new_issues))
    }
}
