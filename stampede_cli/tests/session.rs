use stampede_core::issue::{self, Issue, Value, test_digest};
use stampede_core::repository::{IssueQuery, JsonFileRepository, Repository};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Exits 1 with an assertion message on stderr when its argument is
/// `trigger`, succeeds otherwise.
const SUT_SCRIPT: &str = r#"if [ "$1" = trigger ]; then
  echo "ASSERT foo" >&2
  exit 1
fi
"#;

struct Session {
    dir: tempfile::TempDir,
}

impl Session {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sut.sh"), SUT_SCRIPT).unwrap();
        let tests = dir.path().join("tests");
        fs::create_dir(&tests).unwrap();
        for (name, content) in [("a.txt", "ok"), ("b.txt", "trigger"), ("c.txt", "ok")] {
            fs::write(tests.join(name), content).unwrap();
        }
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self, fuzz_jobs: bool) -> PathBuf {
        let mut config = format!(
            r#"[fuzzinator]
work_dir = "{work}"
db_uri = "file:{db}"
cost_budget = 1

[sut.foo]
call = "SubprocessCall"
"call.decorate(0)" = "RegexFilter"

["sut.foo.call"]
command = "/bin/sh {script} {{test}}"

["sut.foo.call.decorate(0)"]
stderr = ['(?P<msg>ASSERT \w+)']
"#,
            work = self.path("work-{uid}").display(),
            db = self.path("db.json").display(),
            script = self.path("sut.sh").display(),
        );
        if fuzz_jobs {
            config.push_str(&format!(
                r#"
[fuzz.foo-files]
sut = "foo"
fuzzer = "ListDirectory"
batch = inf

["fuzz.foo-files.fuzzer"]
pattern = "{tests}"
"#,
                tests = self.path("tests").display(),
            ));
        }
        let path = self.path("session.toml");
        fs::write(&path, config).unwrap();
        path
    }

    fn repository(&self) -> JsonFileRepository {
        JsonFileRepository::new(self.path("db.json"), Duration::from_secs(5))
    }

    fn issues(&self) -> Vec<Issue> {
        self.repository().get_issues(&IssueQuery::detailed()).unwrap()
    }
}

fn stampede(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stampede"))
        .args(args)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run stampede")
}

fn work_dirs(session: &Session) -> usize {
    fs::read_dir(session.dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("work-"))
        .count()
}

fn occurrences(output: &Output, needle: &str) -> usize {
    String::from_utf8_lossy(&output.stderr).matches(needle).count()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "stampede failed with {}:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_fuzz_session_records_one_issue() {
    let session = Session::new();
    let config = session.config(true);
    let output = stampede(&[config.to_str().unwrap(), "--max-cycles", "1"]);
    assert_success(&output);

    let issues = session.issues();
    assert_eq!(issues.len(), 1, "Only the trigger file fails");
    let found = &issues[0];
    assert_eq!(found.text("msg").as_deref(), Some("ASSERT foo"));
    assert_eq!(found.id().as_deref(), Some(test_digest(b"trigger").as_str()));
    assert_eq!(found.get(issue::EXIT_CODE).and_then(Value::as_i64), Some(1));
    assert_eq!(found.sut().as_deref(), Some("foo"));
    assert_eq!(found.fuzzer().as_deref(), Some("foo-files"));
    assert_eq!(found.text(issue::SUBCONFIG).map(|s| s.len()), Some(9));
    assert!(!found.has(issue::INVALID), "Follow-up validation reproduced the issue");

    assert_eq!(occurrences(&output, "new issue:"), 1);
    assert!(occurrences(&output, "validate job added") >= 1);
    assert_eq!(work_dirs(&session), 0, "Work directory is removed at the end");
}

#[test]
fn test_same_issue_twice_is_deduplicated() {
    let session = Session::new();
    let config = session.config(true);
    let output = stampede(&[config.to_str().unwrap(), "--max-cycles", "2"]);
    assert_success(&output);

    let issues = session.issues();
    assert_eq!(issues.len(), 1);
    let found = &issues[0];
    assert_eq!(found.get(issue::COUNT).and_then(Value::as_i64), Some(2));
    let first_seen = found.text(issue::FIRST_SEEN).unwrap().into_owned();
    let last_seen = found.text(issue::LAST_SEEN).unwrap().into_owned();
    assert!(first_seen < last_seen, "{first_seen} < {last_seen}");

    assert_eq!(occurrences(&output, "new issue:"), 1);
    assert_eq!(occurrences(&output, "issue seen again:"), 1);
}

#[test]
fn test_validate_invalidates_vanished_issue() {
    let session = Session::new();
    let config = session.config(false);
    let mut old = Issue::new()
        .with(issue::ID, "old")
        .with(issue::SUT, "foo")
        .with(issue::TEST, "t");
    session.repository().add_issue(&mut old).unwrap();
    let oid = old.oid().unwrap().into_owned();

    let output = stampede(&[config.to_str().unwrap(), "--validate", "foo", "--max-cycles", "0"]);
    assert_success(&output);

    let stored = session.repository().find_issue_by_oid(&oid).unwrap().unwrap();
    assert!(stored.has(issue::INVALID), "Issue no longer reproduces");
    assert_eq!(occurrences(&output, "issue invalidated:"), 1);
}

#[test]
fn test_show_config_applies_overrides() {
    let session = Session::new();
    let config = session.config(true);
    let output = stampede(&[
        config.to_str().unwrap(),
        "-D",
        "sut.foo:cost=3",
        "-U",
        "fuzz.foo-files",
        "--show-config",
    ]);
    assert_success(&output);
    let shown = String::from_utf8_lossy(&output.stdout);
    assert!(shown.contains("cost = 3"), "{shown}");
    assert!(!shown.contains("ListDirectory"), "{shown}");
    assert!(!Path::new(&session.path("db.json")).exists(), "Nothing ran");
}

#[test]
fn test_malformed_definition_fails() {
    let session = Session::new();
    let config = session.config(true);
    let output = stampede(&[config.to_str().unwrap(), "-D", "no-colon"]);
    assert!(!output.status.success());
    assert!(!session.path("db.json").exists());
}

#[test]
fn test_unknown_plugin_fails_before_session_start() {
    let session = Session::new();
    let config = session.config(true);
    let output = stampede(&[config.to_str().unwrap(), "-D", "sut.foo:call=NoSuchCall"]);
    assert!(!output.status.success());
    assert_eq!(occurrences(&output, "fuzz job added"), 0);
}

#[test]
fn test_sigint_ends_session_cleanly() {
    let session = Session::new();
    let config = session.config(true);
    let mut child = Command::new(env!("CARGO_BIN_EXE_stampede"))
        .arg(&config)
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut pipe = child.stderr.take().unwrap();
    let reader = std::thread::spawn(move || {
        let mut stderr = String::new();
        pipe.read_to_string(&mut stderr).unwrap();
        stderr
    });

    // The work directory appears once the session loop runs, after the
    // interrupt handler is in place.
    let deadline = Instant::now() + Duration::from_secs(30);
    while work_dirs(&session) == 0 {
        assert!(Instant::now() < deadline, "Session never started");
        std::thread::sleep(Duration::from_millis(50));
    }
    std::thread::sleep(Duration::from_millis(500));
    let signalled = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(signalled.success());

    let deadline = Instant::now() + Duration::from_secs(30);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("Session ignored SIGINT");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    let stderr = reader.join().unwrap();
    assert!(status.success(), "{status}:\n{stderr}");
    assert!(stderr.contains("interrupted, shutting down"), "{stderr}");
    assert_eq!(work_dirs(&session), 0, "Work directory is removed after an interrupt");
}
