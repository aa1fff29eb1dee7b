use crate::config::{Config, ConfigError, SUT_PREFIX};
use crate::issue::{self, Issue, Value};
use crate::job::{JobContext, JobError, ValidateJob, issue_sut, with_call};
use crate::listener::Event;
use crate::reduce::{ReduceContext, ReduceError};
use tracing::{debug, info};

/// Shrinks the test of a stored issue with the reducer of its SUT.
///
/// Issues the reducer stumbles upon are stored under the fuzzer name
/// `<original fuzzer>/<reducer>`.
pub struct ReduceJob {
    issue: Issue,
    sut: String,
    fuzzer: String,
}

impl ReduceJob {
    pub fn new(config: &Config, issue: Issue) -> Result<Self, ConfigError> {
        let sut = issue_sut(&issue)?;
        let reducer = config.require_str(&format!("{SUT_PREFIX}{sut}"), "reduce")?;
        let reducer = reducer.rsplit(['.', ':']).next().unwrap_or(&reducer).to_string();
        let origin = issue.fuzzer().unwrap_or_default().into_owned();
        let origin = origin.split('/').next().unwrap_or_default();
        Ok(Self {
            fuzzer: format!("{origin}/{reducer}"),
            sut,
            issue,
        })
    }

    pub fn run(&self, ctx: &JobContext) -> Result<Vec<Issue>, JobError> {
        let (valid, mut new_issues) = ValidateJob::new(self.issue.clone()).validate(ctx, true)?;
        if !valid {
            return Ok(new_issues);
        }

        let section = format!("{SUT_PREFIX}{}", self.sut);
        let build = ctx.build_context();
        let mut reducer = ctx
            .registry
            .build_reducer(&ctx.config, &section, "reduce", &build)?
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.clone(),
                option: "reduce".to_string(),
            })?;
        let mut call =
            ctx.registry
                .build_call(&ctx.config, &section, &["reduce_call", "validate_call", "call"], &build)?;
        let work_dir = ctx.work_dir.join("reduce");
        std::fs::create_dir_all(&work_dir)?;

        let (reduced, found) = with_call(call.as_mut(), |call| {
            let mut on_progress = |size: u64| {
                ctx.emit(Event::JobProgressed {
                    job_id: ctx.job_id,
                    progress: size,
                })
            };
            reducer
                .reduce(ReduceContext {
                    sut_call: call,
                    issue: &self.issue,
                    on_progress: &mut on_progress,
                    work_dir: &work_dir,
                    cancel: &ctx.cancel,
                })
                .map_err(|e| match e {
                    ReduceError::Cancelled => JobError::Cancelled,
                    other => other.into(),
                })
        })?;

        let id = self.issue.id().unwrap_or_default().into_owned();
        match reduced {
            Some(reduced) => self.store_reduced(ctx, reduced)?,
            None => ctx.warning(format!("Reduce of {id} failed.")),
        }

        let subconfig = self.issue.text(issue::SUBCONFIG).map(|s| s.into_owned());
        for other in found {
            ctx.add_issue(&self.sut, &self.fuzzer, subconfig.as_deref(), other, &mut new_issues)?;
        }
        Ok(new_issues)
    }

    /// Records `reduced` unless the stored issue already has a test at least
    /// as small.
    fn store_reduced(&self, ctx: &JobContext, reduced: Vec<u8>) -> Result<(), JobError> {
        let Some(oid) = ctx.resolve_oid(&self.issue)? else {
            debug!(job_id = ctx.job_id, "reduced issue is not stored");
            return Ok(());
        };
        let Some(stored) = ctx.repository.find_issue_by_oid(&oid)? else {
            return Ok(());
        };
        let previous = stored.get(issue::REDUCED).and_then(Value::as_bytes);
        if previous.is_some_and(|previous| previous.len() <= reduced.len()) {
            debug!(job_id = ctx.job_id, "stored reduction is already smaller");
            return Ok(());
        }

        info!(
            job_id = ctx.job_id,
            sut = %self.sut,
            from = self.issue.test().map_or(0, |t| t.len()),
            to = reduced.len(),
            "issue reduced"
        );
        ctx.repository
            .update_issue_by_oid(&oid, &Issue::new().with(issue::REDUCED, reduced))?;
        if let Some(updated) = ctx.repository.find_issue_by_oid(&oid)? {
            ctx.emit(Event::IssueReduced {
                job_id: ctx.job_id,
                issue: updated,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallError, CallInput, FnCall};
    use crate::issue::Outcome;
    use crate::job::testing::{Fixture, fixture, names};
    use crate::registry::Registry;
    use crate::repository::Repository;
    use std::sync::Arc;

    const CONFIG: &str = r#"
[sut.x]
call = "KeyWord"
reduce = "ChunkReducer"
"#;

    /// Fails with id `kw` while the test holds both `k` and `w`, and with
    /// id `other` on a `z` alone.
    fn key_word(input: CallInput) -> Result<Outcome, CallError> {
        let has = |c: u8| input.test.contains(&c);
        Ok(if has(b'k') && has(b'w') {
            Outcome::Issue(Issue::new().with(issue::ID, "kw"))
        } else if has(b'z') {
            Outcome::Issue(Issue::new().with(issue::ID, "other"))
        } else {
            Outcome::NonIssue(Issue::new())
        })
    }

    fn setup(test: &[u8]) -> (Fixture, Issue) {
        let mut fx = fixture(CONFIG);
        let mut registry = Registry::with_builtins();
        registry.register_call("KeyWord", |_, _| Ok(Box::new(FnCall(key_word)) as Box<dyn Call>));
        fx.ctx.registry = Arc::new(registry);

        let mut stored = Vec::new();
        let found = Issue::new().with(issue::ID, "kw").with(issue::TEST, test.to_vec());
        fx.ctx
            .add_issue("x", "x-seq", Some("abcdef012"), found, &mut stored)
            .unwrap();
        (fx, stored.remove(0))
    }

    fn reload(fx: &Fixture, issue: &Issue) -> Issue {
        fx.repository
            .find_issue_by_oid(&issue.oid().unwrap())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_reduction_is_stored_with_side_findings() {
        let (fx, stored) = setup(b"abc\nkxy\nz\nw12\n");
        let found = ReduceJob::new(&fx.ctx.config, stored.clone())
            .unwrap()
            .run(&fx.ctx)
            .unwrap();

        let updated = reload(&fx, &stored);
        assert_eq!(updated.get(issue::REDUCED), Some(&Value::Bytes(b"kw".to_vec())));
        assert_eq!(updated.test(), stored.test(), "Original test is kept");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id().as_deref(), Some("other"));
        assert_eq!(found[0].fuzzer().as_deref(), Some("x-seq/ChunkReducer"));

        let events = names(&fx.events.events());
        assert!(events.contains(&"issue_reduced".to_string()), "{events:?}");
    }

    #[test]
    fn test_irreducible_issue_is_left_untouched() {
        let (fx, stored) = setup(b"kw");
        let before = reload(&fx, &stored);
        let found = ReduceJob::new(&fx.ctx.config, stored.clone())
            .unwrap()
            .run(&fx.ctx)
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(reload(&fx, &stored), before);
        assert!(fx.events.events().contains(&Event::Warning {
            job_id: Some(fx.ctx.job_id),
            message: "Reduce of kw failed.".to_string(),
        }));
    }

    #[test]
    fn test_invalid_issue_is_not_reduced() {
        let (fx, stored) = setup(b"kw");
        let stale = stored.clone().with(issue::TEST, b"abc".to_vec());
        let found = ReduceJob::new(&fx.ctx.config, stale).unwrap().run(&fx.ctx).unwrap();
        assert!(found.is_empty());
        let updated = reload(&fx, &stored);
        assert!(updated.has(issue::INVALID));
        assert!(!updated.has(issue::REDUCED));
        assert!(!names(&fx.events.events()).contains(&"issue_reduced".to_string()));
    }

    #[test]
    fn test_sut_without_reducer() {
        let config = Config::from_toml_str("[sut.x]\ncall = \"KeyWord\"").unwrap();
        let issue = Issue::new().with(issue::SUT, "x");
        assert!(ReduceJob::new(&config, issue).is_err());
    }
}
