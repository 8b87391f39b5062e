//! Log filters, the daily log file, and masking of credentials on their way
//! to disk.
//!
//! The proxy holds the compute API key and the real-time API secret, and
//! signed upload URLs grant write access to storage. None of those may end up
//! in a log file, so everything written to the file sink passes through
//! [`mask_secrets`] one line at a time.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;
use url::Url;

use crate::http::redacted_url_for_display;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const NOISE_FILTER: &str = "hyper=warn,reqwest=warn,h2=warn,tower_http=info";
/// The file keeps dispatch and poll history even when the console is quieter.
const FILE_DEBUG_FILTER: &str = "toolbench_core=debug,toolbench=debug";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_RETENTION_FILES: usize = 14;
pub const MASK: &str = "***REDACTED***";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    /// Only the last two get the dependency noise filter in front.
    pub fn resolve(options: &LogOptions) -> Self {
        let explicit = options.cli_filter.clone().or(match options.verbose {
            0 => None,
            1 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        });
        if let Some(filter) = explicit {
            return Self {
                console: filter.clone(),
                file: filter,
            };
        }

        let base = options
            .rust_log
            .as_deref()
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);
        Self {
            console: format!("{NOISE_FILTER},{base}"),
            file: format!("{NOISE_FILTER},{FILE_DEBUG_FILTER},{base}"),
        }
    }
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, FileSink::Ready { .. })
    }
}

/// Daily rolling `toolbench.*.log` files under `<data_dir>/logs`.
pub fn open_file_sink(data_dir: Option<&Path>) -> FileSink {
    let Some(data_dir) = data_dir else {
        return FileSink::ConsoleOnly {
            attempted_log_dir: None,
            reason: "no data directory to hold log files".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("toolbench")
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir);
    match built {
        Ok(appender) => FileSink::Ready { log_dir, appender },
        Err(error) => FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

/// Mask credentials in one log line: bearer tokens, values of credential
/// fields (`authorization`, `*token*`, `*secret*`, `*_key`), URL userinfo and
/// URL query strings, which carry the upload signatures.
pub fn mask_secrets(line: &str) -> String {
    let mut masked = String::with_capacity(line.len());
    let mut mask_next = false;

    for piece in line.split_inclusive(char::is_whitespace) {
        let word = piece.trim_end();
        let gap = &piece[word.len()..];
        if !word.is_empty() {
            if mask_next && !word.eq_ignore_ascii_case("bearer") {
                masked.push_str(MASK);
                mask_next = false;
            } else {
                let (text, next) = mask_word(word);
                masked.push_str(&text);
                mask_next = next;
            }
        }
        masked.push_str(gap);
    }
    masked
}

/// Returns the masked word and whether the following word is a credential.
fn mask_word(word: &str) -> (String, bool) {
    if word.eq_ignore_ascii_case("bearer") {
        return (word.to_string(), true);
    }

    if let Some(split) = word.find(['=', ':']) {
        let key = word[..split]
            .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        if is_credential_field(key) {
            let value = &word[split + 1..];
            if value.is_empty() || value.eq_ignore_ascii_case("bearer") {
                return (word.to_string(), true);
            }
            return (format!("{}{MASK}", &word[..=split]), false);
        }
    }

    (mask_url_in(word), false)
}

fn is_credential_field(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "authorization"
        || key == "apikey"
        || key.contains("token")
        || key.contains("secret")
        || key.ends_with("_key")
        || key.ends_with("-key")
}

fn mask_url_in(word: &str) -> String {
    let Some(scheme_end) = word.find("://") else {
        return word.to_string();
    };
    let start = word[..scheme_end]
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')))
        .map_or(0, |(index, c)| index + c.len_utf8());
    let end = word
        .char_indices()
        .rev()
        .find(|(_, c)| !matches!(c, '"' | '\'' | ',' | ';' | ')' | ']' | '}' | '>'))
        .map_or(word.len(), |(index, c)| index + c.len_utf8())
        .max(scheme_end + 3);

    let raw = &word[start..end];
    let Ok(mut url) = Url::parse(raw) else {
        return word.to_string();
    };
    let has_userinfo = !url.username().is_empty() || url.password().is_some();
    if !has_userinfo && url.query().is_none() {
        return word.to_string();
    }
    if has_userinfo {
        // Only fails for URLs that cannot carry userinfo in the first place.
        let _ = url.set_password(None);
        let _ = url.set_username("");
    }
    let shown = match url.query() {
        Some(_) => redacted_url_for_display(url.as_str()),
        None => url.to_string(),
    };
    format!("{}{shown}{}", &word[..start], &word[end..])
}

/// Wraps a [`MakeWriter`] so every line it receives is masked first.
#[derive(Debug)]
pub struct MaskingMakeWriter<M> {
    inner: M,
}

pub fn masking_writer<M>(inner: M) -> MaskingMakeWriter<M> {
    MaskingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for MaskingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = MaskingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        MaskingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until a newline so a credential split across writes is still
/// seen whole.
#[derive(Debug)]
pub struct MaskingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> MaskingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..upto).collect();
        let masked = mask_secrets(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(masked.as_bytes())
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|byte| *byte == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for MaskingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
