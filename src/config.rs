// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Discovery and parsing of per-worker configuration files

use std::collections::btree_map::{BTreeMap, Entry};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::Error;

pub const DEFAULT_PATTERN: &str = "*.env";

/// One configuration file, and therefore one worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigUnit {
    path: PathBuf,
    label: String,
}

impl ConfigUnit {
    /// Returns None if the path has no file name to label it with
    pub fn new(path: PathBuf) -> Option<Self> {
        let label = path.file_name()?.to_string_lossy().into_owned();
        Some(Self { path, label })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file's base name, prefixed to every line the worker emits
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Read and parse the `key=value` pairs of this unit
    pub fn load(&self) -> Result<WorkerConfig, Error> {
        let contents = fs::read_to_string(&self.path)?;
        WorkerConfig::parse(&self.path, &contents)
    }

    /// Load, then verify that every `required` key has a value
    pub fn load_checked<S: AsRef<str>>(&self, required: &[S]) -> Result<WorkerConfig, Error> {
        let config = self.load()?;
        config.require(&self.path, required)?;
        Ok(config)
    }
}

/// Parsed `key=value` pairs of one configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    vars: BTreeMap<String, String>,
}

impl WorkerConfig {
    /// Parses newline delimited `key=value` pairs.
    ///
    /// Blank lines and `#` comments are skipped, a leading `export ` is allowed and
    /// values wrapped in matching quotes are unwrapped. Later keys replace earlier ones.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, Error> {
        let mut vars = BTreeMap::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            let parse_err = |reason: &str| {
                Error::from(ErrorKind::ConfigParse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: reason.to_string(),
                })
            };

            let eq = line.find('=').ok_or_else(|| parse_err("expected key=value"))?;
            let key = line[..eq].trim();
            if key.is_empty() {
                return Err(parse_err("empty key"));
            }
            if key.chars().any(char::is_whitespace) {
                return Err(parse_err("key contains whitespace"));
            }

            vars.insert(key.to_string(), unquote(line[eq + 1..].trim()).to_string());
        }

        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Checks that every key in `required` is present with a non-empty value
    pub fn require<S: AsRef<str>>(&self, path: &Path, required: &[S]) -> Result<(), Error> {
        for key in required {
            let key = key.as_ref();
            match self.get(key) {
                Some(value) if !value.is_empty() => (),
                _ => {
                    return Err(ErrorKind::MissingKey {
                        path: path.to_path_buf(),
                        key: key.to_string(),
                    }
                    .into())
                }
            }
        }

        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }

    value
}

/// Enumerates configuration files in a set of directories
#[derive(Clone, Debug)]
pub struct Discovery {
    dirs: Vec<PathBuf>,
    matcher: GlobMatcher,
}

impl Discovery {
    pub fn new<I, P>(dirs: I, pattern: &str) -> Result<Self, Error>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Ok(Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            matcher: Glob::new(pattern)?.compile_matcher(),
        })
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Lists the matching files, ordered by label.
    ///
    /// Any directory that does not exist fails the whole discovery. When the same file
    /// name appears in more than one directory, the later directory wins.
    pub fn discover(&self) -> Result<Vec<ConfigUnit>, Error> {
        let mut units = BTreeMap::<String, ConfigUnit>::new();

        for dir in &self.dirs {
            for unit in self.discover_dir(dir)? {
                match units.entry(unit.label().to_string()) {
                    Entry::Vacant(entry) => {
                        entry.insert(unit);
                    }
                    Entry::Occupied(mut entry) => {
                        warn!(
                            "{} overrides {}",
                            unit.path().display(),
                            entry.get().path().display()
                        );
                        entry.insert(unit);
                    }
                }
            }
        }

        Ok(units.into_iter().map(|(_, unit)| unit).collect())
    }

    fn discover_dir(&self, dir: &Path) -> Result<Vec<ConfigUnit>, Error> {
        let missing = || {
            Error::from(ErrorKind::MissingDirectory {
                path: dir.to_path_buf(),
            })
        };

        match fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => (),
            Ok(_) => return Err(missing()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(missing()),
            Err(e) => return Err(e.into()),
        }

        let mut units = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            // follows symlinks, a dangling link is just skipped
            let is_file = fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            match path.file_name() {
                Some(name) if self.matcher.is_match(name) => (),
                _ => continue,
            }

            debug!("discovered config: {}", path.display());
            units.extend(ConfigUnit::new(path));
        }

        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Result<WorkerConfig, Error> {
        WorkerConfig::parse(Path::new("test.env"), contents)
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "KEY=value\n").expect("write failed");
    }

    #[test]
    fn test_parse_pairs() {
        let config = parse(
            "# bot identity\n\
             DISCORD_BOT_TOKEN=abc.def\n\
             \n\
             export GUILD_ID = 710875600637788170\n\
             BOT_PREFIX=\"! \"\n\
             RAIDEYE_SERVER='http://127.0.0.1:8000'\n\
             EMPTY=\n\
             URL=http://host/?a=b\n",
        )
        .expect("parse failed");

        assert_eq!(config.len(), 6);
        assert_eq!(config.get("DISCORD_BOT_TOKEN"), Some("abc.def"));
        assert_eq!(config.get("GUILD_ID"), Some("710875600637788170"));
        assert_eq!(config.get("BOT_PREFIX"), Some("! "));
        assert_eq!(config.get("RAIDEYE_SERVER"), Some("http://127.0.0.1:8000"));
        assert_eq!(config.get("EMPTY"), Some(""));
        assert_eq!(config.get("URL"), Some("http://host/?a=b"));
    }

    #[test]
    fn test_parse_last_key_wins() {
        let config = parse("A=1\nA=2\n").expect("parse failed");
        assert_eq!(config.get("A"), Some("2"));
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let err = parse("A=1\nnot a pair\n").unwrap_err();
        match err.kind() {
            ErrorKind::ConfigParse { line, .. } => assert_eq!(*line, 2),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(parse("=value").is_err());
        assert!(parse("TWO WORDS=value").is_err());
    }

    #[test]
    fn test_unquote_mismatched() {
        assert_eq!(unquote("\"abc'"), "\"abc'");
        assert_eq!(unquote("\""), "\"");
        assert_eq!(unquote("''"), "");
    }

    #[test]
    fn test_require() {
        let config = parse("TOKEN=abc\nBLANK=\n").expect("parse failed");
        let path = Path::new("bot.env");

        assert!(config.require(path, &["TOKEN"]).is_ok());
        let err = config.require(path, &["TOKEN", "BLANK"]).unwrap_err();
        match err.kind() {
            ErrorKind::MissingKey { key, .. } => assert_eq!(key, "BLANK"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(config.require(path, &["NOPE"]).is_err());
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "b.cfg");
        touch(dir.path(), "a.cfg");
        touch(dir.path(), "notes.txt");
        fs::create_dir(dir.path().join("c.cfg")).expect("mkdir");

        let discovery = Discovery::new(vec![dir.path()], "*.cfg").expect("pattern");
        let units = discovery.discover().expect("discover failed");

        let labels: Vec<&str> = units.iter().map(ConfigUnit::label).collect();
        assert_eq!(labels, vec!["a.cfg", "b.cfg"]);
        assert_eq!(units[0].path(), dir.path().join("a.cfg"));
    }

    #[test]
    fn test_discover_empty_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let discovery = Discovery::new(vec![dir.path()], DEFAULT_PATTERN).expect("pattern");

        assert!(discovery.discover().expect("discover failed").is_empty());
    }

    #[test]
    fn test_discover_missing_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let discovery =
            Discovery::new(vec![dir.path().join("nope")], DEFAULT_PATTERN).expect("pattern");

        assert!(discovery.discover().unwrap_err().is_missing_directory());
    }

    #[test]
    fn test_discover_file_is_not_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "a.env");
        let discovery =
            Discovery::new(vec![dir.path().join("a.env")], DEFAULT_PATTERN).expect("pattern");

        assert!(discovery.discover().unwrap_err().is_missing_directory());
    }

    #[test]
    fn test_discover_duplicate_label_last_wins() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        touch(first.path(), "a.env");
        touch(first.path(), "b.env");
        touch(second.path(), "a.env");

        let discovery =
            Discovery::new(vec![first.path(), second.path()], DEFAULT_PATTERN).expect("pattern");
        let units = discovery.discover().expect("discover failed");

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].label(), "a.env");
        assert_eq!(units[0].path(), second.path().join("a.env"));
        assert_eq!(units[1].path(), first.path().join("b.env"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Discovery::new(vec!["."], "[").is_err());
    }
}
