//! Maps plug-in type names found in the configuration to their constructors.

use crate::call::debugger::BacktraceDecorator;
use crate::call::decorators::{
    AnonymizeDecorator, FileReaderDecorator, FileWriterDecorator, PlatformInfoDecorator, SubprocessPropertyDecorator,
    UniqueIdDecorator,
};
use crate::call::filters::{ExitCodeFilter, RegexAutomatonFilter, RegexFilter, SanitizerAutomatonFilter};
use crate::call::sanitizer::SanitizerAnalyzerDecorator;
use crate::call::stream::StreamMonitoredSubprocessCall;
use crate::call::subprocess::{StdinSubprocessCall, SubprocessCall};
use crate::call::test_runner::TestRunnerSubprocessCall;
use crate::call::timeout::AdaptiveTimeoutDecorator;
use crate::call::{Call, CallDecorator, decorate};
use crate::config::{Config, ConfigError, Options};
use crate::fuzzer::byte_flip::ByteFlipDecorator;
use crate::fuzzer::directory::ListDirectory;
use crate::fuzzer::file_writer::FuzzerFileWriterDecorator;
use crate::fuzzer::http::HttpServeDecorator;
use crate::fuzzer::random::{RandomContent, RandomInteger};
use crate::fuzzer::runner::{AflRunner, SubprocessRunner};
use crate::fuzzer::{Fuzzer, FuzzerDecorator, decorate_fuzzer};
use crate::listener::{Listener, LogListener};
use crate::reduce::{ChunkReducer, Reducer};
use crate::update::{SubprocessUpdate, TimestampUpdateCondition, Update, UpdateCondition};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// What a factory may need beyond the plug-in's own options.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Scratch directory of the job the plug-in is built for.
    pub work_dir: PathBuf,
}

impl BuildContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

type Factory<T> = Box<dyn Fn(&Options, &BuildContext) -> Result<T, ConfigError> + Send + Sync>;

struct Kind<T> {
    name: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T> Kind<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            factories: BTreeMap::new(),
        }
    }

    fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<T, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Exact name first, then the last `.` or `::` separated segment, so that
    /// qualified names like `fuzzinator.call.SubprocessCall` resolve too.
    fn lookup(&self, name: &str) -> Result<&Factory<T>, ConfigError> {
        let name = name.trim();
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory);
        }
        let short = name.rsplit(['.', ':']).next().unwrap_or(name);
        self.factories.get(short).ok_or_else(|| ConfigError::UnknownPlugin {
            kind: self.name,
            name: name.to_string(),
        })
    }

    fn build(&self, name: &str, options: &Options, ctx: &BuildContext) -> Result<T, ConfigError> {
        debug!(kind = self.name, plugin = name, "building plug-in");
        (self.lookup(name)?)(options, ctx)
    }

    fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }
}

/// Constructors of every plug-in kind, keyed by type name.
pub struct Registry {
    calls: Kind<Box<dyn Call>>,
    call_decorators: Kind<Box<dyn CallDecorator>>,
    fuzzers: Kind<Box<dyn Fuzzer>>,
    fuzzer_decorators: Kind<Box<dyn FuzzerDecorator>>,
    reducers: Kind<Box<dyn Reducer>>,
    updates: Kind<Box<dyn Update>>,
    update_conditions: Kind<Box<dyn UpdateCondition>>,
    listeners: Kind<Box<dyn Listener>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            calls: Kind::new("call"),
            call_decorators: Kind::new("call decorator"),
            fuzzers: Kind::new("fuzzer"),
            fuzzer_decorators: Kind::new("fuzzer decorator"),
            reducers: Kind::new("reducer"),
            updates: Kind::new("update"),
            update_conditions: Kind::new("update condition"),
            listeners: Kind::new("listener"),
        }
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in plug-in.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();

        r.register_call("SubprocessCall", |o, _| Ok(Box::new(SubprocessCall::from_options(o)?)));
        r.register_call("StdinSubprocessCall", |o, _| {
            Ok(Box::new(StdinSubprocessCall::from_options(o)?))
        });
        r.register_call("StreamMonitoredSubprocessCall", |o, _| {
            Ok(Box::new(StreamMonitoredSubprocessCall::from_options(o)?))
        });
        r.register_call("TestRunnerSubprocessCall", |o, _| {
            Ok(Box::new(TestRunnerSubprocessCall::from_options(o)?))
        });

        r.register_call_decorator("ExitCodeFilter", |o, _| Ok(Box::new(ExitCodeFilter::from_options(o)?)));
        r.register_call_decorator("RegexFilter", |o, _| Ok(Box::new(RegexFilter::from_options(o)?)));
        r.register_call_decorator("RegexAutomatonFilter", |o, _| {
            Ok(Box::new(RegexAutomatonFilter::from_options(o)?))
        });
        r.register_call_decorator("SanitizerAutomatonFilter", |o, _| {
            Ok(Box::new(SanitizerAutomatonFilter::from_options(o)?))
        });
        r.register_call_decorator("SanitizerAnalyzerDecorator", |_, _| Ok(Box::new(SanitizerAnalyzerDecorator)));
        r.register_call_decorator("AdaptiveTimeoutDecorator", |_, _| {
            Ok(Box::new(AdaptiveTimeoutDecorator::new()))
        });
        r.register_call_decorator("FileWriterDecorator", |o, ctx| {
            Ok(Box::new(FileWriterDecorator::from_options(o, &ctx.work_dir)?))
        });
        r.register_call_decorator("FileReaderDecorator", |o, _| {
            Ok(Box::new(FileReaderDecorator::from_options(o)?))
        });
        r.register_call_decorator("AnonymizeDecorator", |o, _| Ok(Box::new(AnonymizeDecorator::from_options(o)?)));
        r.register_call_decorator("UniqueIdDecorator", |o, _| Ok(Box::new(UniqueIdDecorator::from_options(o)?)));
        r.register_call_decorator("PlatformInfoDecorator", |_, _| Ok(Box::new(PlatformInfoDecorator)));
        r.register_call_decorator("SubprocessPropertyDecorator", |o, _| {
            Ok(Box::new(SubprocessPropertyDecorator::from_options(o)?))
        });
        r.register_call_decorator("GdbBacktraceDecorator", |o, _| Ok(Box::new(BacktraceDecorator::gdb(o)?)));
        r.register_call_decorator("LldbBacktraceDecorator", |o, _| Ok(Box::new(BacktraceDecorator::lldb(o)?)));

        r.register_fuzzer("RandomContent", |o, _| Ok(Box::new(RandomContent::from_options(o)?)));
        r.register_fuzzer("RandomInteger", |o, _| Ok(Box::new(RandomInteger::from_options(o)?)));
        r.register_fuzzer("ListDirectory", |o, _| Ok(Box::new(ListDirectory::from_options(o)?)));
        r.register_fuzzer("SubprocessRunner", |o, ctx| {
            Ok(Box::new(SubprocessRunner::from_options(o, &ctx.work_dir)?))
        });
        r.register_fuzzer("AFLRunner", |o, _| Ok(Box::new(AflRunner::from_options(o)?)));

        r.register_fuzzer_decorator("ByteFlipDecorator", |o, _| Ok(Box::new(ByteFlipDecorator::from_options(o)?)));
        r.register_fuzzer_decorator("FileWriterDecorator", |o, ctx| {
            Ok(Box::new(FuzzerFileWriterDecorator::from_options(o, &ctx.work_dir)?))
        });
        r.register_fuzzer_decorator("HttpServeDecorator", |o, _| {
            Ok(Box::new(HttpServeDecorator::from_options(o)?))
        });
        r.register_fuzzer_decorator("TornadoDecorator", |o, _| Ok(Box::new(HttpServeDecorator::from_options(o)?)));

        r.register_reducer("ChunkReducer", |o, _| Ok(Box::new(ChunkReducer::from_options(o)?)));
        r.register_update("SubprocessUpdate", |o, _| Ok(Box::new(SubprocessUpdate::from_options(o)?)));
        r.register_update_condition("TimestampUpdateCondition", |o, _| {
            Ok(Box::new(TimestampUpdateCondition::from_options(o)?))
        });
        r.register_listener("LogListener", |_, _| Ok(Box::new(LogListener)));
        r
    }

    pub fn register_call<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn Call>, ConfigError> + Send + Sync + 'static,
    {
        self.calls.register(name, factory);
    }

    pub fn register_call_decorator<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn CallDecorator>, ConfigError> + Send + Sync + 'static,
    {
        self.call_decorators.register(name, factory);
    }

    pub fn register_fuzzer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn Fuzzer>, ConfigError> + Send + Sync + 'static,
    {
        self.fuzzers.register(name, factory);
    }

    pub fn register_fuzzer_decorator<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn FuzzerDecorator>, ConfigError> + Send + Sync + 'static,
    {
        self.fuzzer_decorators.register(name, factory);
    }

    pub fn register_reducer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn Reducer>, ConfigError> + Send + Sync + 'static,
    {
        self.reducers.register(name, factory);
    }

    pub fn register_update<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn Update>, ConfigError> + Send + Sync + 'static,
    {
        self.updates.register(name, factory);
    }

    pub fn register_update_condition<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn UpdateCondition>, ConfigError> + Send + Sync + 'static,
    {
        self.update_conditions.register(name, factory);
    }

    pub fn register_listener<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Options, &BuildContext) -> Result<Box<dyn Listener>, ConfigError> + Send + Sync + 'static,
    {
        self.listeners.register(name, factory);
    }

    /// Builds the call named by the first of `candidates` present in
    /// `section`, wrapped in its configured decorators.
    ///
    /// # Arguments
    /// * `candidates`: option names in order of preference, e.g.
    ///   `["reduce_call", "validate_call", "call"]`.
    pub fn build_call(
        &self,
        config: &Config,
        section: &str,
        candidates: &[&str],
        ctx: &BuildContext,
    ) -> Result<Box<dyn Call>, ConfigError> {
        let option = first_present(config, section, candidates)?;
        let name = config.require_str(section, option)?;
        let mut base_options = config.plugin_options(section, option);
        let mut decorators = Vec::new();
        for (index, decorator_name) in config.decorators(section, option)? {
            let decorator_options = config.plugin_options(section, &format!("{option}.decorate({index})"));
            let mut decorator = self.call_decorators.build(&decorator_name, &decorator_options, ctx)?;
            decorator.init(&mut base_options)?;
            decorators.push(decorator);
        }
        let base = self.calls.build(&name, &base_options, ctx)?;
        Ok(decorate(base, decorators))
    }

    /// Builds the fuzzer of `section:option` with its decorators.
    pub fn build_fuzzer(
        &self,
        config: &Config,
        section: &str,
        option: &str,
        ctx: &BuildContext,
    ) -> Result<Box<dyn Fuzzer>, ConfigError> {
        let name = config.require_str(section, option)?;
        let mut base_options = config.plugin_options(section, option);
        let mut decorators = Vec::new();
        for (index, decorator_name) in config.decorators(section, option)? {
            let decorator_options = config.plugin_options(section, &format!("{option}.decorate({index})"));
            let mut decorator = self.fuzzer_decorators.build(&decorator_name, &decorator_options, ctx)?;
            decorator.init(&mut base_options)?;
            decorators.push(decorator);
        }
        let base = self.fuzzers.build(&name, &base_options, ctx)?;
        Ok(decorate_fuzzer(base, decorators))
    }

    /// The reducer of `section:option`, if one is configured.
    pub fn build_reducer(
        &self,
        config: &Config,
        section: &str,
        option: &str,
        ctx: &BuildContext,
    ) -> Result<Option<Box<dyn Reducer>>, ConfigError> {
        build_optional(&self.reducers, config, section, option, ctx)
    }

    pub fn build_update(
        &self,
        config: &Config,
        section: &str,
        option: &str,
        ctx: &BuildContext,
    ) -> Result<Option<Box<dyn Update>>, ConfigError> {
        build_optional(&self.updates, config, section, option, ctx)
    }

    pub fn build_update_condition(
        &self,
        config: &Config,
        section: &str,
        option: &str,
        ctx: &BuildContext,
    ) -> Result<Option<Box<dyn UpdateCondition>>, ConfigError> {
        build_optional(&self.update_conditions, config, section, option, ctx)
    }

    pub fn build_listener(
        &self,
        config: &Config,
        section: &str,
        option: &str,
        ctx: &BuildContext,
    ) -> Result<Box<dyn Listener>, ConfigError> {
        let name = config.require_str(section, option)?;
        self.listeners
            .build(&name, &config.plugin_options(section, option), ctx)
    }

    /// Checks that every plug-in a SUT or fuzz section names is known,
    /// without constructing anything.
    pub fn check(&self, config: &Config) -> Result<(), ConfigError> {
        for sut in config.suts() {
            let section = format!("{}{sut}", crate::config::SUT_PREFIX);
            for option in ["call", "validate_call", "reduce_call"] {
                if let Some(name) = config.get_str(&section, option) {
                    require(&self.calls, &name)?;
                    for (_, decorator) in config.decorators(&section, option)? {
                        require(&self.call_decorators, &decorator)?;
                    }
                }
            }
            for (option, kind) in [("reduce", self.reducers.name), ("update", self.updates.name)] {
                if let Some(name) = config.get_str(&section, option) {
                    let known = match option {
                        "reduce" => self.reducers.contains(&name),
                        _ => self.updates.contains(&name),
                    };
                    if !known {
                        return Err(ConfigError::UnknownPlugin { kind, name });
                    }
                }
            }
            if let Some(name) = config.get_str(&section, "update_condition") {
                require(&self.update_conditions, &name)?;
            }
        }
        for fuzz in config.fuzz_jobs() {
            let section = format!("{}{fuzz}", crate::config::FUZZ_PREFIX);
            require(&self.fuzzers, &config.require_str(&section, "fuzzer")?)?;
            for (_, decorator) in config.decorators(&section, "fuzzer")? {
                require(&self.fuzzer_decorators, &decorator)?;
            }
        }
        Ok(())
    }
}

fn require<T>(kind: &Kind<T>, name: &str) -> Result<(), ConfigError> {
    kind.lookup(name).map(|_| ())
}

fn first_present<'a>(config: &Config, section: &str, candidates: &[&'a str]) -> Result<&'a str, ConfigError> {
    candidates
        .iter()
        .copied()
        .find(|option| config.has_option(section, option))
        .ok_or_else(|| ConfigError::MissingOption {
            section: section.to_string(),
            option: candidates.last().copied().unwrap_or_default().to_string(),
        })
}

fn build_optional<T>(
    kind: &Kind<T>,
    config: &Config,
    section: &str,
    option: &str,
    ctx: &BuildContext,
) -> Result<Option<T>, ConfigError> {
    match config.get_str(section, option) {
        Some(name) => kind
            .build(&name, &config.plugin_options(section, option), ctx)
            .map(Some),
        None => Ok(None),
    }
}
