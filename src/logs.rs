//! Log file extraction for `service_logs`.
use regex::Regex;
use std::{
    collections::{BTreeMap, VecDeque},
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::Path,
    sync::OnceLock,
};

use crate::runner::decode_line;

/// Default number of trailing lines returned per log file.
pub const DEFAULT_LOG_LINES: usize = 500;

/// Log source identity mapped to its most recent lines.
pub type LogBundle = BTreeMap<String, String>;

fn nontext_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\n\t\x20-\x7e]").expect("valid nontext pattern"))
}

/// Reads the last `lines` lines of `path`, normalising line endings and
/// dropping non-printable characters.
fn tail_file(path: &Path, lines: usize) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut window = VecDeque::with_capacity(lines.min(4096));
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        if lines == 0 {
            continue;
        }
        if window.len() == lines {
            window.pop_front();
        }
        let line = decode_line(&raw);
        window.push_back(nontext_regex().replace_all(&line, "").into_owned());
    }

    Ok(window.into_iter().collect())
}

/// Extracts `path` and its rotated siblings (`path.1`, `path.2`, ...).
///
/// Rotated files are found by probing numeric suffixes until the first
/// missing one. A missing `path` yields an empty bundle.
pub fn extract_loglines(path: impl AsRef<Path>, lines: usize) -> io::Result<LogBundle> {
    let path = path.as_ref();
    let mut bundle = LogBundle::new();
    if !path.exists() {
        return Ok(bundle);
    }

    let base = fs::canonicalize(path)?.to_string_lossy().into_owned();
    bundle.insert(base.clone(), tail_file(Path::new(&base), lines)?);

    for index in 1.. {
        let rotated = format!("{base}.{index}");
        if !Path::new(&rotated).exists() {
            break;
        }
        let content = tail_file(Path::new(&rotated), lines)?;
        bundle.insert(rotated, content);
    }

    Ok(bundle)
}
