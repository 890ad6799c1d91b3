//! Configuration parsing: a TOML file in, validated channels out.
//!
//! The file names sources, sinks and the channels that tie them
//! together:
//!
//! ```text
//! state-directory = "/var/lib/scow"
//! watch-paths = ["/var/log/nginx"]
//!
//! [sources.access]
//! globs = ["/var/log/nginx/*access.log"]
//! pattern = '(?P<ip>\S+) \S+ \S+ \[(?P<timestamp>[^\]]+)\]'
//!
//! [sinks.stdout]
//! type = "console"
//!
//! [channels.accesses]
//! sources = ["access"]
//! sink = "stdout"
//! track = true
//! backfill = true
//! ```
//!
//! Name resolution happens here, outside the core: channels get their
//! sinks and sources injected at construction.

use channel::{Channel, ChannelConfig};
use error::{Error, Result};
use sink::{Console, Null, Sink, Tally};
use source::{Source, SourceConfig};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use toml;

/// The configuration struct for a sink table. Resolution of `kind` to a
/// constructor happens in `build`.
#[derive(Clone, Debug, Deserialize)]
pub struct SinkConfig {
    /// Which sink to construct: `console`, `null` or `tally`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Everything the config file said.
#[derive(Debug, Default)]
pub struct Args {
    /// Where trackers and lock files live.
    pub state_dir: Option<PathBuf>,
    /// Paths the watch sub-command monitors.
    pub watch_paths: Vec<PathBuf>,
    /// Source tables by name.
    pub sources: HashMap<String, SourceConfig>,
    /// Channel tables by name.
    pub channels: HashMap<String, ChannelConfig>,
    /// Sink tables by name.
    pub sinks: HashMap<String, SinkConfig>,
}

/// Read and parse the config file at `path`.
pub fn load(path: &Path) -> Result<Args> {
    let mut buffer = String::new();
    File::open(path)?.read_to_string(&mut buffer)?;
    parse_config_file(&buffer)
}

/// Parse config file content.
pub fn parse_config_file(buffer: &str) -> Result<Args> {
    let value: toml::Value = toml::from_str(buffer)
        .map_err(|e| Error::Config(format!("could not parse config: {}", e)))?;
    let mut args = Args::default();

    if let Some(dir) = value.get("state-directory") {
        let dir = dir.as_str().ok_or_else(|| {
            Error::Config("state-directory must be a string".to_string())
        })?;
        args.state_dir = Some(Path::new(dir).to_path_buf());
    }

    if let Some(paths) = value.get("watch-paths") {
        let paths = paths.as_array().ok_or_else(|| {
            Error::Config("watch-paths must be an array".to_string())
        })?;
        for path in paths {
            let path = path.as_str().ok_or_else(|| {
                Error::Config("watch-paths entries must be strings".to_string())
            })?;
            args.watch_paths.push(Path::new(path).to_path_buf());
        }
    }

    if let Some(sources) = value.get("sources") {
        let sources = sources.as_table().ok_or_else(|| {
            Error::Config("sources must be a table".to_string())
        })?;
        for (name, table) in sources.iter() {
            let config: SourceConfig =
                table.clone().try_into().map_err(|e| {
                    Error::Config(format!("source {}: {}", name, e))
                })?;
            args.sources.insert(name.clone(), config);
        }
    }

    if let Some(sinks) = value.get("sinks") {
        let sinks = sinks
            .as_table()
            .ok_or_else(|| Error::Config("sinks must be a table".to_string()))?;
        for (name, table) in sinks.iter() {
            let config: SinkConfig = table.clone().try_into().map_err(|e| {
                Error::Config(format!("sink {}: {}", name, e))
            })?;
            args.sinks.insert(name.clone(), config);
        }
    }

    if let Some(channels) = value.get("channels") {
        let channels = channels.as_table().ok_or_else(|| {
            Error::Config("channels must be a table".to_string())
        })?;
        for (name, table) in channels.iter() {
            let config: ChannelConfig =
                table.clone().try_into().map_err(|e| {
                    Error::Config(format!("channel {}: {}", name, e))
                })?;
            args.channels.insert(name.clone(), config);
        }
    }

    Ok(args)
}

/// Construct a named sink.
fn sink_for(name: &str, config: &SinkConfig) -> Result<Box<dyn Sink>> {
    match config.kind.as_str() {
        "console" => Ok(Box::new(Console::new())),
        "null" => Ok(Box::new(Null::new())),
        "tally" => Ok(Box::new(Tally::new())),
        other => Err(Error::Config(format!(
            "sink {} has unknown type {:?}",
            name, other
        ))),
    }
}

/// Resolve names and construct every configured channel.
pub fn build(args: &Args) -> Result<Vec<Channel>> {
    let mut channels = Vec::new();
    let mut names: Vec<&String> = args.channels.keys().collect();
    names.sort();
    for name in names {
        let config = &args.channels[name];
        let mut sources = Vec::new();
        for source_name in &config.sources {
            let source_config =
                args.sources.get(source_name).ok_or_else(|| {
                    Error::Config(format!(
                        "channel {}: {:?} is not a source",
                        name, source_name
                    ))
                })?;
            sources.push(Source::new(source_name, source_config.clone())?);
        }
        let sink_config = args.sinks.get(&config.sink).ok_or_else(|| {
            Error::Config(format!(
                "channel {}: {:?} is not a sink",
                name, config.sink
            ))
        })?;
        let sink = sink_for(&config.sink, sink_config)?;
        channels.push(Channel::new(
            name,
            args.state_dir.as_ref().map(|dir| dir.as_path()),
            config,
            sources,
            sink,
        )?);
    }
    Ok(channels)
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &'static str = r#"
state-directory = "/tmp/scow-state"
watch-paths = ["/var/log/nginx", "/var/log/app"]

[sources.access]
globs = ["/var/log/nginx/*access.log"]
exclude_globs = ["/var/log/nginx/old/*"]
pattern = '(?P<ip>\S+) \S+ \S+ \[(?P<timestamp>[^\]]+)\]'

[sources.errors]
globs = ["/var/log/app/error.log"]
prefix = '\d{4}-\d{2}-\d{2} '
pattern = '(?s)(?P<body>.+)'
strict = true
read_size = 2048
buffer_size = 1048576

[sinks.stdout]
type = "console"

[sinks.drop]
type = "null"

[channels.accesses]
sources = ["access"]
sink = "stdout"
track = true
backfill = true
batch_size = 500
flush_frequency = 5.0

[channels.errors]
sources = ["errors"]
sink = "drop"
throttle_duration = 10
throttle_cap = 120
"#;

    #[test]
    fn full_config_parses() {
        let args = parse_config_file(CONFIG).unwrap();
        assert_eq!(
            args.state_dir,
            Some(Path::new("/tmp/scow-state").to_path_buf())
        );
        assert_eq!(args.watch_paths.len(), 2);

        let access = &args.sources["access"];
        assert_eq!(access.globs, vec!["/var/log/nginx/*access.log"]);
        assert_eq!(access.terminal, "\n");
        assert_eq!(access.read_size, 4096);

        let errors = &args.sources["errors"];
        assert!(errors.strict);
        assert_eq!(errors.read_size, 2048);
        assert!(errors.prefix.is_some());

        let accesses = &args.channels["accesses"];
        assert_eq!(accesses.sources, vec!["access"]);
        assert_eq!(accesses.batch_size, 500);
        assert!(accesses.track);
        assert!(accesses.backfill);
        assert_eq!(accesses.flush_frequency, Some(5.0));

        let errors = &args.channels["errors"];
        assert_eq!(errors.throttle_duration, 10);
        assert_eq!(errors.throttle_cap, 120);
        assert_eq!(errors.batch_size, 100);

        assert_eq!(args.sinks["stdout"].kind, "console");
    }

    #[test]
    fn unknown_source_names_fail_build() {
        let config = r#"
[sources.access]
globs = ["*.log"]
pattern = "(?P<line>.*)"

[sinks.drop]
type = "null"

[channels.broken]
sources = ["nope"]
sink = "drop"
"#;
        let args = parse_config_file(config).unwrap();
        match build(&args) {
            Err(Error::Config(ref msg)) => {
                assert!(msg.contains("is not a source"))
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_sink_types_fail_build() {
        let config = r#"
[sources.access]
globs = ["*.log"]
pattern = "(?P<line>.*)"

[sinks.search]
type = "warehouse"

[channels.broken]
sources = ["access"]
sink = "search"
"#;
        let args = parse_config_file(config).unwrap();
        match build(&args) {
            Err(Error::Config(ref msg)) => {
                assert!(msg.contains("unknown type"))
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn malformed_tables_are_refused() {
        let config = r#"
[sources.access]
globs = "not-an-array"
pattern = "(?P<line>.*)"
"#;
        match parse_config_file(config) {
            Err(Error::Config(ref msg)) => assert!(msg.contains("access")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn buildable_channels_build() {
        let config = r#"
[sources.lines]
globs = ["/tmp/scow-config-test/*.log"]
pattern = "(?P<line>.*)"

[sinks.drop]
type = "null"

[channels.lines]
sources = ["lines"]
sink = "drop"
"#;
        let args = parse_config_file(config).unwrap();
        let channels = build(&args).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "lines");
        assert!(channels[0]
            .match_path(Path::new("/tmp/scow-config-test/a.log"))
            .is_some());
    }
}
