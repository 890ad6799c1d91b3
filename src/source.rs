//! A source defines a category of block files and how to structure the
//! blocks within them. To do that you say how to:
//!
//!   - classify a path as belonging to the source (globs)
//!   - delimit a block (a terminal, or a prefix regex and a terminal)
//!   - extract named text fields from a block using a regex
//!   - optionally map the extracted fields to something more type-ful
//!
//! Here is a source for single-line HTTP access logs:
//!
//! ```text
//! [sources.access]
//! globs = ["/var/log/nginx/*access.log"]
//! terminal = "\n"
//! pattern = '(?P<ip>\S+) - (?:(?P<user>\w+)|-) \[(?P<timestamp>[^\]]+)\]'
//! ```

use block::{Blocks, Delimit};
use error::{Error, Result};
use form::{Fields, FilterFn, Form, Record};
use glob::Pattern;
use regex::bytes::Regex;
use serde_json::Value;
use std::io::{Read, Seek};
use std::path::Path;

use block::Block;

/// Smallest read the block iterator will be configured with.
pub const MIN_READ_SIZE: usize = 1024;

fn default_terminal() -> String {
    "\n".to_string()
}

fn default_read_size() -> usize {
    4096
}

fn default_buffer_size() -> usize {
    1_048_576
}

/// The configuration struct for a `Source`.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    /// Glob patterns a path must match to belong to the source.
    pub globs: Vec<String>,
    /// Glob patterns that override `globs` and exclude a path.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Regex with named groups, applied to each block's bytes.
    pub pattern: String,
    /// Regex marking the beginning of a block. Only needed when blocks
    /// cannot be unambiguously delimited by `terminal` alone.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Literal string that ends a block.
    #[serde(default = "default_terminal")]
    pub terminal: String,
    /// Whether malformed blocks fail (true) or are skipped (false).
    #[serde(default)]
    pub strict: bool,
    /// Size of block reads in bytes.
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// Size of the unparsed block buffer in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// A category of block files and how to map blocks within those files
/// into structured records.
pub struct Source {
    /// Name given to this class of files, e.g. `access-log`.
    pub name: String,
    /// Whether malformed blocks fail or are skipped.
    pub strict: bool,
    globs: Vec<Pattern>,
    exclude_globs: Vec<Pattern>,
    pattern: Regex,
    prefix: Option<Regex>,
    terminal: Vec<u8>,
    read_size: usize,
    buffer_size: usize,
    form: Option<Box<dyn Form>>,
    filter: Option<FilterFn>,
}

impl ::std::fmt::Debug for Source {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("strict", &self.strict)
            .field("globs", &self.globs)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

impl Source {
    /// Make a `Source` from its configuration.
    pub fn new(name: &str, config: SourceConfig) -> Result<Source> {
        if config.read_size < MIN_READ_SIZE {
            return Err(Error::Config(format!(
                "source {} read_size {} must be >= {}",
                name, config.read_size, MIN_READ_SIZE
            )));
        }
        if config.buffer_size < config.read_size {
            return Err(Error::Config(format!(
                "source {} buffer_size {} must be >= read_size {}",
                name, config.buffer_size, config.read_size
            )));
        }
        if config.terminal.is_empty() {
            return Err(Error::Config(format!(
                "source {} terminal must not be empty",
                name
            )));
        }
        if config.globs.is_empty() {
            return Err(Error::Config(format!(
                "source {} must have at least one glob",
                name
            )));
        }
        let mut globs = Vec::new();
        for glob in &config.globs {
            globs.push(Pattern::new(glob)?);
        }
        let mut exclude_globs = Vec::new();
        for glob in &config.exclude_globs {
            exclude_globs.push(Pattern::new(glob)?);
        }
        let prefix = match config.prefix {
            Some(ref prefix) => Some(Regex::new(prefix)?),
            None => None,
        };
        Ok(Source {
            name: name.to_string(),
            globs: globs,
            exclude_globs: exclude_globs,
            pattern: Regex::new(&config.pattern)?,
            prefix: prefix,
            terminal: config.terminal.clone().into_bytes(),
            strict: config.strict,
            read_size: config.read_size,
            buffer_size: config.buffer_size,
            form: None,
            filter: None,
        })
    }

    /// Attach a form, mapping extracted fields to typed records.
    pub fn with_form(mut self, form: Box<dyn Form>) -> Source {
        self.form = Some(form);
        self
    }

    /// Attach a filter, dropping records it rejects.
    pub fn with_filter(mut self, filter: FilterFn) -> Source {
        self.filter = Some(filter);
        self
    }

    /// Determine whether a path is associated with this source.
    pub fn match_path(&self, path: &Path) -> bool {
        self.globs.iter().any(|g| g.matches_path(path))
            && !self.exclude_globs.iter().any(|g| g.matches_path(path))
    }

    /// Snapshot of the source's compiled globs, used by watch routing
    /// once the source itself has moved into its worker.
    pub fn matcher(&self) -> Matcher {
        Matcher {
            globs: self.globs.clone(),
            exclude_globs: self.exclude_globs.clone(),
        }
    }

    /// Make a block iterator over `fo`, starting at its current position.
    pub fn blocks<R>(&self, fo: R, path: &Path) -> Result<Blocks<R>>
    where
        R: Read + Seek,
    {
        let delimit = match self.prefix {
            Some(ref prefix) => Delimit::Multi {
                prefix: prefix.clone(),
                terminal: self.terminal.clone(),
            },
            None => Delimit::Line {
                terminal: self.terminal.clone(),
            },
        };
        Blocks::new(
            fo,
            path,
            delimit,
            self.strict,
            self.read_size,
            self.buffer_size,
        )
    }

    /// Make an iterator of `(record, block)` pairs over `fo`.
    pub fn forms<R>(&self, fo: R, path: &Path) -> Result<Forms<R>>
    where
        R: Read + Seek,
    {
        Ok(Forms {
            source: self,
            blocks: self.blocks(fo, path)?,
        })
    }

    /// Apply the source's pattern and optional form to one block.
    /// `Ok(None)` means the block was skipped, which in a non-strict
    /// source is not an error.
    fn structure(&self, block: &Block) -> Result<Option<Record>> {
        let caps = match self.pattern.captures(&block.raw) {
            Some(caps) => caps,
            None => {
                if self.strict {
                    return Err(Error::NoMatch {
                        source_name: self.name.clone(),
                        path: block.path.clone(),
                        begin: block.begin,
                        end: block.end,
                    });
                }
                info!(
                    "{} {:?}[{}:{}] does not match pattern {:?}",
                    self.name,
                    block.path,
                    block.begin,
                    block.end,
                    self.pattern.as_str()
                );
                return Ok(None);
            }
        };
        let mut fields = Fields::new();
        for name in self.pattern.capture_names() {
            let name = match name {
                Some(name) => name,
                None => continue,
            };
            if let Some(mat) = caps.name(name) {
                fields.insert(
                    name.to_string(),
                    Value::String(
                        String::from_utf8_lossy(mat.as_bytes()).into_owned(),
                    ),
                );
            }
        }
        let record = match self.form {
            Some(ref form) => match form.apply(&fields, block) {
                Ok(record) => record,
                Err(errors) => {
                    if self.strict {
                        return Err(Error::Form {
                            path: block.path.clone(),
                            begin: block.begin,
                            end: block.end,
                            errors: errors,
                        });
                    }
                    info!(
                        "{} {:?}[{}:{}] form mapping failed - {}",
                        self.name, block.path, block.begin, block.end, errors[0]
                    );
                    return Ok(None);
                }
            },
            None => Value::Object(fields),
        };
        if let Some(ref filter) = self.filter {
            if !filter(&record, block) {
                return Ok(None);
            }
        }
        Ok(Some(record))
    }
}

/// Glob-only snapshot of a source's path classification.
#[derive(Clone, Debug)]
pub struct Matcher {
    globs: Vec<Pattern>,
    exclude_globs: Vec<Pattern>,
}

impl Matcher {
    /// Determine whether a path is associated with the source the
    /// matcher was taken from.
    pub fn match_path(&self, path: &Path) -> bool {
        self.globs.iter().any(|g| g.matches_path(path))
            && !self.exclude_globs.iter().any(|g| g.matches_path(path))
    }
}

/// Iterator of structured records and the blocks they came from.
pub struct Forms<'a, R> {
    source: &'a Source,
    blocks: Blocks<R>,
}

impl<'a, R> Iterator for Forms<'a, R>
where
    R: Read + Seek,
{
    type Item = Result<(Record, Block)>;

    fn next(&mut self) -> Option<Result<(Record, Block)>> {
        loop {
            let block = match self.blocks.next() {
                None => return None,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(block)) => block,
            };
            match self.source.structure(&block) {
                Err(e) => return Some(Err(e)),
                Ok(Some(record)) => return Some(Ok((record, block))),
                Ok(None) => continue,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use form::{Field, Schema};
    use std::io::Cursor;

    const ACCESS_PATTERN: &'static str = r#"(?x)
(?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\s+
-\s+
(?:(?P<user>\w+)|-)\s+
\[(?P<timestamp>[^\]]+)\]\s+
"(?:(?P<method>\w+)\s+(?P<uri>\S+)\s+HTTP/(?P<version>[\d.]+)|-)"\s+
(?:(?P<status>\d+)|-)\s+
(?:(?P<bytes>\d+)|-)
"#;

    fn config() -> SourceConfig {
        SourceConfig {
            globs: vec!["*/some-access".to_string(), "some-access".to_string()],
            exclude_globs: vec!["*/skip/*".to_string()],
            pattern: ACCESS_PATTERN.to_string(),
            prefix: None,
            terminal: "\n".to_string(),
            strict: false,
            read_size: 1024,
            buffer_size: 65536,
        }
    }

    const INPUT: &'static [u8] = b"\
1.2.3.1 - - [20/Feb/2014:16:57:20] \"POST /customers HTTP/1.1\" 201 1571\n\
1.2.3.2 - kim [20/Feb/2014:16:57:21] \"GET /customers HTTP/1.1\" 200 310\n\
1.2.3.3 - - [20/Feb/2014:16:57:22] \"POST /customers HTTP/1.1\" 201 1571\n";

    #[test]
    fn match_path_honors_globs_and_excludes() {
        let source = Source::new("access", config()).unwrap();
        assert!(source.match_path(Path::new("/var/log/some-access")));
        assert!(source.match_path(Path::new("some-access")));
        assert!(!source.match_path(Path::new("/var/log/other")));
        assert!(!source.match_path(Path::new("/var/log/skip/some-access")));
    }

    #[test]
    fn forms_extract_named_groups() {
        let source = Source::new("access", config()).unwrap();
        let path = Path::new("/var/log/some-access");
        let pairs: Vec<(Record, Block)> = source
            .forms(Cursor::new(INPUT.to_vec()), path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0["ip"], "1.2.3.1");
        assert_eq!(pairs[1].0["user"], "kim");
        assert_eq!(pairs[0].0["status"], "201");
        // unset groups are skipped entirely
        assert!(pairs[0].0.get("user").is_none());
        assert_eq!(pairs[2].1.begin, pairs[1].1.end);
    }

    #[test]
    fn forms_skip_unmatched_blocks() {
        let mut input = INPUT.to_vec();
        input.extend_from_slice(b"utter garbage\n");
        input.extend_from_slice(
            b"1.2.3.4 - - [20/Feb/2014:16:57:23] \"GET / HTTP/1.1\" 200 12\n",
        );
        let source = Source::new("access", config()).unwrap();
        let path = Path::new("some-access");
        let pairs: Vec<(Record, Block)> = source
            .forms(Cursor::new(input), path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[3].0["ip"], "1.2.3.4");
    }

    #[test]
    fn forms_fail_unmatched_blocks_when_strict() {
        let mut cfg = config();
        cfg.strict = true;
        let source = Source::new("access", cfg).unwrap();
        let path = Path::new("some-access");
        let input = b"utter garbage\n".to_vec();
        let result: Result<Vec<(Record, Block)>> = source
            .forms(Cursor::new(input), path)
            .unwrap()
            .collect();
        match result {
            Err(Error::NoMatch { begin, end, .. }) => {
                assert_eq!((begin, end), (0, 14));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn forms_apply_schema_and_filter() {
        let schema = Schema::new()
            .field(
                "status",
                Field::Int { default: None, min: Some(100), max: Some(599) },
            )
            .field("bytes", Field::Int { default: Some(0), min: None, max: None });
        let source = Source::new("access", config())
            .unwrap()
            .with_form(Box::new(schema))
            .with_filter(Box::new(|record, _block| record["status"] == 201));
        let path = Path::new("some-access");
        let pairs: Vec<(Record, Block)> = source
            .forms(Cursor::new(INPUT.to_vec()), path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0["status"], 201);
        assert_eq!(pairs[1].0["ip"], "1.2.3.3");
    }

    #[test]
    fn config_validates_sizes() {
        let mut cfg = config();
        cfg.read_size = 512;
        assert!(Source::new("access", cfg).is_err());
        let mut cfg = config();
        cfg.buffer_size = 2048;
        cfg.read_size = 4096;
        assert!(Source::new("access", cfg).is_err());
    }
}
