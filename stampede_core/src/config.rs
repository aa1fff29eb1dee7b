use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Options of one configuration section, also used as plug-in keyword arguments.
pub type Options = toml::Table;

pub const GLOBAL_SECTION: &str = "fuzzinator";
pub const SUT_PREFIX: &str = "sut.";
pub const FUZZ_PREFIX: &str = "fuzz.";
pub const LISTENERS_SECTION: &str = "listeners";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Option '{0}' is outside of any section")]
    TopLevelOption(String),
    #[error("Malformed definition '{0}', expected SECT:OPT=VAL")]
    Define(String),
    #[error("Malformed undefinition '{0}', expected SECT[:OPT]")]
    Undefine(String),
    #[error("Missing section [{0}]")]
    MissingSection(String),
    #[error("Missing option '{option}' in section [{section}]")]
    MissingOption { section: String, option: String },
    #[error("Invalid value for {section}:{option}: {message}")]
    InvalidValue {
        section: String,
        option: String,
        message: String,
    },
    #[error("Invalid options for {plugin}: {message}")]
    Options { plugin: String, message: String },
    #[error("Unknown {kind} plug-in '{name}'")]
    UnknownPlugin { kind: &'static str, name: String },
}

/// Deserializes plug-in keyword arguments into a typed options struct.
pub fn parse_options<T: DeserializeOwned>(plugin: &str, options: &Options) -> Result<T, ConfigError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Options {
            plugin: plugin.to_string(),
            message: e.message().to_string(),
        })
}

/// A count that may be unbounded (`inf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Finite(u64),
    Infinite,
}

impl Limit {
    pub fn from_value(value: &toml::Value) -> Option<Limit> {
        match value {
            toml::Value::Integer(i) if *i >= 0 => Some(Limit::Finite(*i as u64)),
            toml::Value::Float(f) if f.is_infinite() && f.is_sign_positive() => Some(Limit::Infinite),
            toml::Value::Float(f) if *f >= 0.0 => Some(Limit::Finite(*f as u64)),
            toml::Value::String(s) => match s.trim() {
                "inf" | "infinity" => Some(Limit::Infinite),
                other => other.parse().ok().map(Limit::Finite),
            },
            _ => None,
        }
    }

    /// True while `count` is still below the limit.
    pub fn allows(self, count: u64) -> bool {
        match self {
            Limit::Finite(max) => count < max,
            Limit::Infinite => true,
        }
    }

    pub fn is_finite(self) -> bool {
        matches!(self, Limit::Finite(_))
    }
}

fn default_work_dir() -> String {
    ".stampede/{uid}".to_string()
}

fn default_db_uri() -> String {
    "file:.stampede/db.json".to_string()
}

fn default_selection_timeout() -> u64 {
    30_000
}

/// Settings of the global `[fuzzinator]` section.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_db_uri")]
    pub db_uri: String,
    /// Milliseconds to wait for the issue store to become available.
    #[serde(default = "default_selection_timeout")]
    pub db_server_selection_timeout: u64,
    #[serde(default)]
    pub cost_budget: Option<usize>,
    #[serde(default)]
    pub validate_after_update: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            db_uri: default_db_uri(),
            db_server_selection_timeout: default_selection_timeout(),
            cost_budget: None,
            validate_after_update: false,
        }
    }
}

impl SessionSettings {
    /// Cost budget, defaulting to the number of available CPUs.
    pub fn cost_budget(&self) -> usize {
        self.cost_budget.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// The merged, sectioned configuration of a session.
///
/// Sections are flattened from TOML: a table that holds at least one
/// non-table value is a section named by its dotted path, a table of tables is
/// only a namespace. Quoted headers (`["sut.foo.call"]`) address sections
/// whose name collides with an option.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    sections: BTreeMap<String, Options>,
}

impl Config {
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for path in paths {
            config.merge_file(path)?;
        }
        Ok(config)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn merge_str(&mut self, content: &str) -> Result<(), ConfigError> {
        let table: toml::Table = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.message().to_string(),
        })?;
        flatten("", table, &mut self.sections)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.merge_str(content)?;
        Ok(config)
    }

    pub fn section(&self, name: &str) -> Option<&Options> {
        self.sections.get(name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn get(&self, section: &str, option: &str) -> Option<&toml::Value> {
        self.sections.get(section).and_then(|s| s.get(option))
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.get(section, option).is_some()
    }

    /// Scalar option rendered as a string.
    pub fn get_str(&self, section: &str, option: &str) -> Option<String> {
        self.get(section, option).map(value_to_string)
    }

    pub fn require_str(&self, section: &str, option: &str) -> Result<String, ConfigError> {
        self.get_str(section, option)
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })
    }

    pub fn get_int(&self, section: &str, option: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(section, option) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i)),
            Some(toml::Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                invalid(section, option, format!("expected an integer, got '{s}'"))
            }),
            Some(other) => Err(invalid(section, option, format!("expected an integer, got {other}"))),
        }
    }

    pub fn get_bool(&self, section: &str, option: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(section, option) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(toml::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                _ => Err(invalid(section, option, format!("expected a boolean, got '{s}'"))),
            },
            Some(other) => Err(invalid(section, option, format!("expected a boolean, got {other}"))),
        }
    }

    pub fn get_limit(&self, section: &str, option: &str) -> Result<Option<Limit>, ConfigError> {
        match self.get(section, option) {
            None => Ok(None),
            Some(v) => Limit::from_value(v)
                .map(Some)
                .ok_or_else(|| invalid(section, option, format!("expected a count or inf, got {v}"))),
        }
    }

    pub fn set(&mut self, section: &str, option: &str, value: toml::Value) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value);
    }

    pub fn remove_section(&mut self, section: &str) -> bool {
        self.sections.remove(section).is_some()
    }

    pub fn remove_option(&mut self, section: &str, option: &str) -> bool {
        self.sections
            .get_mut(section)
            .is_some_and(|s| s.remove(option).is_some())
    }

    /// Applies a `SECT:OPT=VAL` command line definition.
    pub fn define(&mut self, definition: &str) -> Result<(), ConfigError> {
        let malformed = || ConfigError::Define(definition.to_string());
        let (section, rest) = definition.split_once(':').ok_or_else(malformed)?;
        let (option, value) = rest.split_once('=').ok_or_else(malformed)?;
        if section.is_empty() || option.is_empty() {
            return Err(malformed());
        }
        self.set(section, option, parse_value(value));
        Ok(())
    }

    /// Applies a `SECT` or `SECT:OPT` command line undefinition.
    pub fn undefine(&mut self, undefinition: &str) -> Result<(), ConfigError> {
        match undefinition.split_once(':') {
            Some((section, option)) if !section.is_empty() && !option.is_empty() => {
                self.remove_option(section, option);
            }
            None if !undefinition.is_empty() => {
                self.remove_section(undefinition);
            }
            _ => return Err(ConfigError::Undefine(undefinition.to_string())),
        }
        Ok(())
    }

    pub fn session(&self) -> Result<SessionSettings, ConfigError> {
        match self.section(GLOBAL_SECTION) {
            Some(options) => parse_options(GLOBAL_SECTION, options),
            None => Ok(SessionSettings::default()),
        }
    }

    /// Names of the configured SUTs (`[sut.<name>]`).
    pub fn suts(&self) -> Vec<String> {
        self.top_level_names(SUT_PREFIX)
    }

    /// Names of the configured fuzz jobs (`[fuzz.<name>]`).
    pub fn fuzz_jobs(&self) -> Vec<String> {
        self.top_level_names(FUZZ_PREFIX)
    }

    fn top_level_names(&self, prefix: &str) -> Vec<String> {
        self.sections
            .keys()
            .filter_map(|name| name.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('.'))
            .map(str::to_string)
            .collect()
    }

    /// Keyword arguments of `section:option`, read from `[section.option]`.
    pub fn plugin_options(&self, section: &str, option: &str) -> Options {
        self.section(&format!("{section}.{option}"))
            .cloned()
            .unwrap_or_default()
    }

    /// Decorators of `section:option` as `(index, type name)`, innermost first.
    pub fn decorators(&self, section: &str, option: &str) -> Result<Vec<(u32, String)>, ConfigError> {
        let Some(options) = self.section(section) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{option}.decorate(");
        let mut decorators = Vec::new();
        for (key, value) in options {
            let Some(index) = key.strip_prefix(&prefix).and_then(|r| r.strip_suffix(')')) else {
                continue;
            };
            let index: u32 = index
                .parse()
                .map_err(|_| invalid(section, key, "decorator index must be a non-negative integer"))?;
            decorators.push((index, value_to_string(value)));
        }
        decorators.sort_by_key(|(index, _)| *index);
        Ok(decorators)
    }

    /// The projection of the configuration relevant to one fuzz job: the
    /// fuzz section, its SUT section, and all their sub-sections.
    pub fn projection(&self, fuzz_job: &str) -> Result<BTreeMap<String, Options>, ConfigError> {
        let fuzz_section = format!("{FUZZ_PREFIX}{fuzz_job}");
        if !self.has_section(&fuzz_section) {
            return Err(ConfigError::MissingSection(fuzz_section));
        }
        let sut_section = format!("{SUT_PREFIX}{}", self.require_str(&fuzz_section, "sut")?);
        let reachable = |name: &str| {
            [&fuzz_section, &sut_section].iter().any(|root| {
                name == root.as_str()
                    || name
                        .strip_prefix(root.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
        };
        Ok(self
            .sections
            .iter()
            .filter(|(name, _)| reachable(name))
            .map(|(name, options)| (name.clone(), options.clone()))
            .collect())
    }

    /// Stable 9 hex digit fingerprint of a fuzz job's configuration, plus the
    /// canonical projection it was computed from.
    ///
    /// Occurrences of `work_dir` are removed before hashing so that sessions
    /// with different working directories share fingerprints.
    pub fn fingerprint(
        &self,
        fuzz_job: &str,
        work_dir: &str,
    ) -> Result<(String, serde_json::Value), ConfigError> {
        let projection = self.projection(fuzz_job)?;
        let serialized = serde_json::to_string(&projection).map_err(|e| ConfigError::InvalidValue {
            section: format!("{FUZZ_PREFIX}{fuzz_job}"),
            option: String::new(),
            message: e.to_string(),
        })?;
        let stripped = if work_dir.is_empty() {
            serialized
        } else {
            serialized.replace(work_dir, "")
        };
        let digest = format!("{:x}", md5::compute(stripped.as_bytes()));
        let value = serde_json::from_str(&stripped).unwrap_or(serde_json::Value::String(stripped));
        Ok((digest[..9].to_string(), value))
    }

    /// The effective configuration as TOML, one quoted header per section.
    pub fn to_toml_string(&self) -> String {
        let mut root = toml::Table::new();
        for (name, options) in &self.sections {
            root.insert(name.clone(), toml::Value::Table(options.clone()));
        }
        toml::to_string(&root).unwrap_or_default()
    }
}

fn flatten(prefix: &str, table: toml::Table, out: &mut BTreeMap<String, Options>) -> Result<(), ConfigError> {
    let is_namespace = prefix.is_empty() || (!table.is_empty() && table.values().all(toml::Value::is_table));
    if !is_namespace {
        out.entry(prefix.to_string()).or_default().extend(table);
        return Ok(());
    }
    if table.is_empty() {
        out.entry(prefix.to_string()).or_default();
        return Ok(());
    }
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(sub) => flatten(&name, sub, out)?,
            _ => return Err(ConfigError::TopLevelOption(name)),
        }
    }
    Ok(())
}

fn invalid(section: &str, option: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        option: option.to_string(),
        message: message.into(),
    }
}

/// Parses a command line value as TOML, falling back to a plain string.
pub fn parse_value(raw: &str) -> toml::Value {
    let wrapped = format!("value = {raw}");
    toml::from_str::<toml::Table>(&wrapped)
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

pub fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[fuzzinator]
work_dir = "/tmp/work/{uid}"
cost_budget = 2

[sut.foo]
call = "SubprocessCall"
cost = 1
"call.decorate(1)" = "UniqueIdDecorator"
"call.decorate(0)" = "RegexFilter"

["sut.foo.call"]
command = "/tmp/work/bin/foo {test}"

["sut.foo.call.decorate(0)"]
stderr = ['(?P<msg>ASSERT \w+)']

[sut.bar]
call = "StdinSubprocessCall"

[fuzz.foo-random]
sut = "foo"
fuzzer = "RandomContent"
batch = inf

["fuzz.foo-random.fuzzer"]
max_length = 10
"#;

    #[test]
    fn test_flattening_produces_dotted_sections() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.suts(), vec!["bar", "foo"]);
        assert_eq!(config.fuzz_jobs(), vec!["foo-random"]);
        assert_eq!(
            config.get_str("sut.foo.call", "command").as_deref(),
            Some("/tmp/work/bin/foo {test}")
        );
        assert_eq!(config.get_int("sut.foo", "cost").unwrap(), Some(1));
        assert_eq!(
            config.get_limit("fuzz.foo-random", "batch").unwrap(),
            Some(Limit::Infinite)
        );
    }

    #[test]
    fn test_decorators_are_ordered_by_index() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.decorators("sut.foo", "call").unwrap(),
            vec![
                (0, "RegexFilter".to_string()),
                (1, "UniqueIdDecorator".to_string())
            ]
        );
        let kwargs = config.plugin_options("sut.foo.call", "decorate(0)");
        assert!(kwargs.contains_key("stderr"));
    }

    #[test]
    fn test_define_and_undefine() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.define("fuzz.foo-random:batch=5").unwrap();
        assert_eq!(
            config.get_limit("fuzz.foo-random", "batch").unwrap(),
            Some(Limit::Finite(5))
        );
        config.define("sut.foo:label=hello world").unwrap();
        assert_eq!(config.get_str("sut.foo", "label").as_deref(), Some("hello world"));

        config.undefine("sut.foo:label").unwrap();
        assert!(!config.has_option("sut.foo", "label"));
        config.undefine("sut.bar").unwrap();
        assert!(!config.has_section("sut.bar"));

        assert!(matches!(config.define("nocolon"), Err(ConfigError::Define(_))));
        assert!(matches!(config.define("sect:noequals"), Err(ConfigError::Define(_))));
        assert!(matches!(config.undefine(":opt"), Err(ConfigError::Undefine(_))));
    }

    #[test]
    fn test_session_settings() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let session = config.session().unwrap();
        assert_eq!(session.cost_budget(), 2);
        assert_eq!(session.work_dir, "/tmp/work/{uid}");
        assert!(!session.validate_after_update);

        let bad = Config::from_toml_str("[fuzzinator]\nbogus = 1\n").unwrap();
        assert!(bad.session().is_err(), "Unknown global options should be rejected");
    }

    #[test]
    fn test_fingerprint_is_stable_and_ignores_work_dir() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let (fp, projection) = config.fingerprint("foo-random", "/tmp/work").unwrap();
        assert_eq!(fp.len(), 9);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(projection.get("sut.bar").is_none(), "Unrelated SUT must not be projected");
        assert!(projection.get("sut.foo.call").is_some());

        let moved = SAMPLE.replace("/tmp/work/", "/srv/other/");
        let config2 = Config::from_toml_str(&moved).unwrap();
        let (fp2, _) = config2.fingerprint("foo-random", "/srv/other").unwrap();
        assert_eq!(fp, fp2, "Fingerprint must not depend on the work dir");

        let mut changed = config.clone();
        changed.define("sut.foo.call:command=other").unwrap();
        let (fp3, _) = changed.fingerprint("foo-random", "/tmp/work").unwrap();
        assert_ne!(fp, fp3);
    }

    #[test]
    fn test_top_level_option_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("stray = 1"),
            Err(ConfigError::TopLevelOption(_))
        ));
    }

    #[test]
    fn test_show_config_reparses_to_same_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string();
        assert_eq!(Config::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value("3"), toml::Value::Integer(3));
        assert_eq!(parse_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_value("plain text"), toml::Value::String("plain text".into()));
    }
}
