#![deny(unsafe_code)]

//! Configuration file parsing.
//!
//! The format is one `key=value` pair per line. `#` starts a comment,
//! double quotes protect whitespace (and `=`/`#`) verbatim, and a backslash
//! escapes the next character, including a newline for line continuation.
//! Outside quotes, whitespace around the key and around the value is
//! trimmed; whitespace in the middle survives. Later assignments override
//! earlier ones, and reading a second file merges over the first, which is
//! how defaults-then-overrides layering works.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A line violated the `key=value` grammar.
    #[error("invalid config line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A required key was absent.
    #[error("missing config key '{0}'")]
    Missing(String),

    /// A value did not parse as the requested type.
    #[error("config key '{key}' is not a valid {wanted}")]
    BadValue {
        /// The key whose value failed to convert.
        key: String,
        /// The type the caller asked for.
        wanted: &'static str,
    },
}

/// A parsed key/value configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `path` into a fresh configuration.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut conf = Self::new();
        conf.read(path)?;
        Ok(conf)
    }

    /// Parses `path` and merges its assignments over the current contents.
    pub fn read(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.parse(&text)
    }

    /// Parses configuration text and merges it in.
    pub fn parse(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut parser = Parser::default();
        for ch in text.chars() {
            parser.step(ch, &mut self.values)?;
        }
        parser.finish(&mut self.values)
    }

    /// True when `key` has a value.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the raw string value of `key`.
    pub fn get_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))
    }

    /// Returns `key` parsed as an integer.
    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        self.get_str(key)?
            .parse()
            .map_err(|_| ConfigError::BadValue {
                key: key.to_owned(),
                wanted: "integer",
            })
    }

    /// Returns `key` parsed as a float.
    pub fn get_double(&self, key: &str) -> Result<f64, ConfigError> {
        self.get_str(key)?
            .parse()
            .map_err(|_| ConfigError::BadValue {
                key: key.to_owned(),
                wanted: "number",
            })
    }
}

/// Character-at-a-time parser state.
///
/// `key_keep`/`value_keep` track the length up to the last character that
/// must survive trimming, so unquoted trailing whitespace disappears when
/// the line ends.
#[derive(Default)]
struct Parser {
    line: usize,
    key: String,
    value: String,
    key_keep: usize,
    value_keep: usize,
    in_value: bool,
    started: bool,
    escaped: bool,
    quoted: bool,
    commented: bool,
}

impl Parser {
    fn step(&mut self, ch: char, out: &mut HashMap<String, String>) -> Result<(), ConfigError> {
        if ch == '\n' && !self.escaped {
            return self.end_line(out);
        }
        if self.commented {
            return Ok(());
        }
        match ch {
            '\\' if !self.escaped => {
                self.escaped = true;
                Ok(())
            }
            '"' if !self.escaped => {
                self.quoted = !self.quoted;
                self.started = true;
                Ok(())
            }
            '#' if !self.quoted && !self.escaped => {
                self.commented = true;
                Ok(())
            }
            '=' if !self.quoted && !self.escaped && !self.in_value => {
                self.in_value = true;
                self.started = false;
                Ok(())
            }
            _ => {
                self.push(ch);
                Ok(())
            }
        }
    }

    fn push(&mut self, ch: char) {
        let escaped = self.escaped;
        self.escaped = false;
        if !self.started && !self.quoted && !escaped && ch.is_whitespace() {
            return;
        }
        self.started = true;
        let (buf, keep) = if self.in_value {
            (&mut self.value, &mut self.value_keep)
        } else {
            (&mut self.key, &mut self.key_keep)
        };
        buf.push(ch);
        if escaped || self.quoted || !ch.is_whitespace() {
            *keep = buf.len();
        }
    }

    fn end_line(&mut self, out: &mut HashMap<String, String>) -> Result<(), ConfigError> {
        self.line += 1;
        if self.quoted {
            return Err(ConfigError::Parse {
                line: self.line,
                reason: "unterminated quote",
            });
        }
        if !self.in_value {
            if self.started {
                return Err(ConfigError::Parse {
                    line: self.line,
                    reason: "line has no '='",
                });
            }
            // Blank or comment-only line.
            self.reset_line();
            return Ok(());
        }
        self.key.truncate(self.key_keep);
        self.value.truncate(self.value_keep);
        out.insert(std::mem::take(&mut self.key), std::mem::take(&mut self.value));
        self.reset_line();
        Ok(())
    }

    fn finish(&mut self, out: &mut HashMap<String, String>) -> Result<(), ConfigError> {
        if self.started || self.in_value {
            self.end_line(out)?;
        }
        Ok(())
    }

    fn reset_line(&mut self) {
        self.key.clear();
        self.value.clear();
        self.key_keep = 0;
        self.value_keep = 0;
        self.in_value = false;
        self.started = false;
        self.escaped = false;
        self.commented = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(text: &str) -> Config {
        let mut c = Config::new();
        c.parse(text).unwrap();
        c
    }

    #[test]
    fn basic_assignment() {
        let c = parse("basic=awesome\n");
        assert_eq!(c.get_str("basic").unwrap(), "awesome");
    }

    #[test]
    fn many_assignments() {
        let c = parse("first=win1\nsecond=win2\nthird=win3\n");
        assert_eq!(c.get_str("first").unwrap(), "win1");
        assert_eq!(c.get_str("second").unwrap(), "win2");
        assert_eq!(c.get_str("third").unwrap(), "win3");
    }

    #[test]
    fn comments_are_ignored() {
        let c = parse("# a full comment line\nbasic=awesome # trailing\nbasic2=3awesome\n");
        assert_eq!(c.get_str("basic").unwrap(), "awesome");
        assert_eq!(c.get_str("basic2").unwrap(), "3awesome");
    }

    #[test]
    fn duplicate_keys_last_one_wins() {
        let c = parse("basic=win1\nbasic=win2\n");
        assert_eq!(c.get_str("basic").unwrap(), "win2");
    }

    #[test]
    fn quotes_protect_content() {
        let c = parse("str=1\nstr2=\"ten\"\nstr3=g\"\\\"\"g\n");
        assert_eq!(c.get_int("str").unwrap(), 1);
        assert_eq!(c.get_str("str2").unwrap(), "ten");
        assert_eq!(c.get_str("str3").unwrap(), "g\"g");
    }

    #[test]
    fn whitespace_trim_rules() {
        let c = parse("str=\" hi \"\nstr2 =  hi  \nstr3=sent\t ance\n");
        assert_eq!(c.get_str("str").unwrap(), " hi ");
        assert_eq!(c.get_str("str2").unwrap(), "hi");
        assert_eq!(c.get_str("str3").unwrap(), "sent\t ance");
    }

    #[test]
    fn escaped_newline_continues_the_line() {
        let c = parse("key=one\\\ntwo\n");
        assert_eq!(c.get_str("key").unwrap(), "one\ntwo");
    }

    #[test]
    fn merge_overrides_and_adds() {
        let mut c = parse("str=basic\nstr2=old\n");
        c.parse("str2=basic2\nstr3=basic3\n").unwrap();
        assert_eq!(c.get_str("str").unwrap(), "basic");
        assert_eq!(c.get_str("str2").unwrap(), "basic2");
        assert_eq!(c.get_str("str3").unwrap(), "basic3");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let mut c = Config::new();
        assert!(matches!(
            c.parse("str=\"open\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn key_without_equals_is_an_error() {
        let mut c = Config::new();
        assert!(matches!(
            c.parse("just a key\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_final_newline_still_parses() {
        let c = parse("key=value");
        assert_eq!(c.get_str("key").unwrap(), "value");
    }

    #[test]
    fn typed_getters() {
        let c = parse("port=4096\nrate=2.5\nword=abc\n");
        assert_eq!(c.get_int("port").unwrap(), 4096);
        assert!((c.get_double("rate").unwrap() - 2.5).abs() < f64::EPSILON);
        assert!(matches!(
            c.get_int("word"),
            Err(ConfigError::BadValue { .. })
        ));
        assert!(matches!(c.get_str("nope"), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn reads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "sync_dir=/tmp/sync\nconn_port=4222").unwrap();
        let c = Config::from_file(f.path()).unwrap();
        assert_eq!(c.get_str("sync_dir").unwrap(), "/tmp/sync");
        assert_eq!(c.get_int("conn_port").unwrap(), 4222);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/libsync.conf")),
            Err(ConfigError::Read { .. })
        ));
    }
}
