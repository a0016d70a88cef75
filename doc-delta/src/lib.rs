//! DOC_DELTA changelog library.
//!
//! A DOC_DELTA file is a Markdown changelog shared by many independent agent
//! processes. Each entry starts with a `## YYYY-MM-DD HH:MM:SSZ - Title`
//! heading and entries are kept in chronological order.
//!
//! Parsing and rendering stay pure; every read-modify-write of the document
//! runs under the cross-process lock in [`lock`].

pub mod error {
    use std::{io, path::Path, path::PathBuf, time::Duration};
    use thiserror::Error;

    pub type Result<T, E = DeltaError> = std::result::Result<T, E>;

    /// Structural problems in a DOC_DELTA document. Never auto-corrected.
    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum FormatError {
        #[error(
            "Invalid level-2 heading format. Expected `## YYYY-MM-DD HH:MM:SSZ - Title`, found at line {line}: {text}"
        )]
        InvalidHeading { line: usize, text: String },

        #[error("Invalid timestamp value at line {line} for entry '{title}': {timestamp}")]
        InvalidTimestamp {
            line: usize,
            title: String,
            timestamp: String,
        },

        #[error("No DOC_DELTA entries found.")]
        NoEntries,
    }

    #[derive(Debug, Error)]
    pub enum DeltaError {
        #[error(transparent)]
        Format(#[from] FormatError),

        #[error("{0}")]
        Validation(String),

        #[error(
            "Timed out waiting for DOC_DELTA lock after {:.3}s for command '{operation}'. Lock file: {}.{}",
            .timeout.as_secs_f64(),
            .lock_path.display(),
            holder_suffix(.holder)
        )]
        LockTimeout {
            operation: String,
            timeout: Duration,
            lock_path: PathBuf,
            /// Last non-empty metadata observed in the lock file, verbatim.
            holder: Option<String>,
        },

        #[error("{0}")]
        Usage(String),

        #[error("{what} not found: {}", .path.display())]
        NotFound { what: &'static str, path: PathBuf },

        #[error("failed {action} {}", .path.display())]
        Io {
            action: &'static str,
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }

    fn holder_suffix(holder: &Option<String>) -> String {
        match holder {
            Some(raw) => format!(" Current holder metadata: {raw}"),
            None => String::new(),
        }
    }

    impl DeltaError {
        pub fn validation(message: impl Into<String>) -> Self {
            Self::Validation(message.into())
        }

        pub fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
            Self::Io {
                action,
                path: path.to_path_buf(),
                source,
            }
        }

        /// Usage mistakes exit with 2, operational failures with 1.
        pub fn exit_code(&self) -> u8 {
            match self {
                Self::Usage(_) => 2,
                _ => 1,
            }
        }
    }

}

pub mod core {
    //! Domain values: canonical timestamps, entries, parsed documents.

    use chrono::{DateTime, NaiveDateTime, SubsecRound, Timelike, Utc};
    use std::fmt;

    pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";
    pub const HEADING_MARKER: &str = "## ";
    pub const TITLE_SEPARATOR: &str = " - ";

    /* ------------------------------ Timestamp ------------------------------ */

    /// Instant in the fixed-width `YYYY-MM-DD HH:MM:SSZ` form (UTC, whole seconds).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Timestamp(DateTime<Utc>);

    impl Timestamp {
        pub fn now() -> Self {
            Self(Utc::now().trunc_subsecs(0))
        }

        /// Strict parse: the text must have the canonical shape *and* name a real instant.
        pub fn parse(text: &str) -> Option<Self> {
            if !crate::parser::is_canonical_timestamp(text) {
                return None;
            }
            Self::from_shaped(text)
        }

        /// Calendar check for text already known to have the canonical shape.
        pub(crate) fn from_shaped(text: &str) -> Option<Self> {
            NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
                .ok()
                // chrono reads `:60` as a leap second; seconds run 00-59 here.
                .filter(|naive| naive.nanosecond() < 1_000_000_000)
                .map(|naive| Self(naive.and_utc()))
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
        }
    }

    /* -------------------------------- Entry -------------------------------- */

    /// One timestamped section of the document, from its heading through its body.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Entry {
        /// Position in the document as read; only used to keep ties stable.
        pub index: usize,
        pub timestamp_text: String,
        pub timestamp: Timestamp,
        pub title: String,
        /// Heading plus body, with surrounding newlines trimmed.
        pub block: String,
    }

    impl Entry {
        /// Build a fresh entry whose block is `## <ts> - <title>` followed by `body`.
        pub fn new(index: usize, timestamp: Timestamp, title: &str, body: &str) -> Self {
            let timestamp_text = timestamp.to_string();
            let header = heading_line(&timestamp_text, title);
            let body = body.trim_matches('\n');
            let block = if body.is_empty() {
                header
            } else {
                format!("{header}\n\n{body}")
            };
            Self {
                index,
                timestamp_text,
                timestamp,
                title: title.to_string(),
                block,
            }
        }

        pub fn sort_key(&self) -> (Timestamp, usize) {
            (self.timestamp, self.index)
        }

        /// `<timestamp> - <title>`, as shown in reports.
        pub fn label(&self) -> String {
            format!("{}{}{}", self.timestamp_text, TITLE_SEPARATOR, self.title)
        }
    }

    pub fn heading_line(timestamp_text: &str, title: &str) -> String {
        format!("{HEADING_MARKER}{timestamp_text}{TITLE_SEPARATOR}{title}")
    }

    /* ------------------------------- Document ------------------------------- */

    /// Free text before the first heading plus the entries in file order.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ParsedDocument {
        pub preamble: String,
        pub entries: Vec<Entry>,
    }

}

pub mod parser {
    //! Line-oriented DOC_DELTA scanner.
    //!
    //! Every line that starts with the heading marker must be a complete entry
    //! heading; the heading grammar itself is matched with `nom`. Entry blocks
    //! run from one heading to the next, the preamble is everything before the
    //! first heading.

    use crate::core::*;
    use crate::error::FormatError;
    use std::borrow::Cow;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while_m_n},
        character::complete::char,
        combinator::{all_consuming, recognize, rest, verify},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a whole document. CRLF and lone CR line endings are read as LF.
    pub fn parse_document(text: &str) -> Result<ParsedDocument, FormatError> {
        let normalized = normalize_line_endings(text);
        let text = normalized.as_ref();
        let mut headings: Vec<HeadingAt<'_>> = Vec::new();
        let mut bad_timestamp: Option<FormatError> = None;
        let mut offset = 0;

        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\n');
            if line.starts_with(HEADING_MARKER) {
                let Ok((_, heading)) = all_consuming(heading)(line) else {
                    return Err(FormatError::InvalidHeading {
                        line: line_no,
                        text: line.to_string(),
                    });
                };
                match Timestamp::from_shaped(heading.timestamp) {
                    Some(value) => headings.push(HeadingAt {
                        offset,
                        timestamp_text: heading.timestamp,
                        timestamp: value,
                        title: heading.title,
                    }),
                    None => {
                        // Malformed headings anywhere in the file take precedence.
                        bad_timestamp.get_or_insert(FormatError::InvalidTimestamp {
                            line: line_no,
                            title: heading.title.to_string(),
                            timestamp: heading.timestamp.to_string(),
                        });
                    }
                }
            }
            offset += raw.len();
        }

        if let Some(err) = bad_timestamp {
            return Err(err);
        }
        let Some(first) = headings.first() else {
            return Err(FormatError::NoEntries);
        };

        let preamble = text[..first.offset].trim_end_matches('\n').to_string();
        let entries = headings
            .iter()
            .enumerate()
            .map(|(index, heading)| {
                let end = headings
                    .get(index + 1)
                    .map_or(text.len(), |next| next.offset);
                Entry {
                    index,
                    timestamp_text: heading.timestamp_text.to_string(),
                    timestamp: heading.timestamp,
                    title: heading.title.to_string(),
                    block: text[heading.offset..end].trim_matches('\n').to_string(),
                }
            })
            .collect();

        Ok(ParsedDocument { preamble, entries })
    }

    fn normalize_line_endings(text: &str) -> Cow<'_, str> {
        if text.contains('\r') {
            Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
        } else {
            Cow::Borrowed(text)
        }
    }

    /// True when `text` is exactly `YYYY-MM-DD HH:MM:SSZ` (digits not range-checked).
    pub fn is_canonical_timestamp(text: &str) -> bool {
        all_consuming(timestamp_text)(text).is_ok()
    }

    /* ------------------------------ Grammar ------------------------------ */

    struct HeadingAt<'a> {
        offset: usize,
        timestamp_text: &'a str,
        timestamp: Timestamp,
        title: &'a str,
    }

    struct Heading<'a> {
        timestamp: &'a str,
        title: &'a str,
    }

    fn heading(i: &str) -> PResult<'_, Heading<'_>> {
        let (i, (_, timestamp, _, title)) = tuple((
            tag(HEADING_MARKER),
            timestamp_text,
            tag(TITLE_SEPARATOR),
            verify(rest, |t: &str| !t.is_empty()),
        ))(i)?;
        Ok((i, Heading { timestamp, title }))
    }

    fn timestamp_text(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            digits(4),
            char('-'),
            digits(2),
            char('-'),
            digits(2),
            char(' '),
            digits(2),
            char(':'),
            digits(2),
            char(':'),
            digits(2),
            char('Z'),
        )))(i)
    }

    fn digits<'a>(n: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(n, n, |c: char| c.is_ascii_digit())
    }

}

pub mod format {
    //! Canonical ordering and the single rendering path shared by `add` and `fix`.

    use crate::core::Entry;

    /// Stable sort by `(timestamp, original index)`.
    pub fn sort_entries(mut entries: Vec<Entry>) -> Vec<Entry> {
        entries.sort_by_key(Entry::sort_key);
        entries
    }

    /// Sections joined by exactly one blank line, ending in exactly one newline.
    pub fn render_document(preamble: &str, entries: &[Entry]) -> String {
        let mut sections: Vec<&str> = Vec::with_capacity(entries.len() + 1);
        let preamble = preamble.trim_end();
        if !preamble.is_empty() {
            sections.push(preamble);
        }
        sections.extend(entries.iter().map(|entry| entry.block.trim_end()));

        let mut out = sections.join("\n\n").trim_end().to_string();
        out.push('\n');
        out
    }

}

pub mod storage {
    //! Document persistence. Writes replace the file atomically.

    use crate::error::{DeltaError, Result};
    use std::{fs, io::Write, path::Path};
    use tempfile::NamedTempFile;

    /// Separates where the document lives from what the commands do with it.
    pub trait DocumentStore {
        /// Raw document text, byte for byte. The document must already exist.
        fn read(&self, path: &Path) -> Result<String>;
        fn write(&self, path: &Path, text: &str) -> Result<()>;
    }

    /// Filesystem-backed store.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct FsDocumentStore;

    impl DocumentStore for FsDocumentStore {
        fn read(&self, path: &Path) -> Result<String> {
            if !path.exists() {
                return Err(DeltaError::NotFound {
                    what: "DOC_DELTA file",
                    path: path.to_path_buf(),
                });
            }
            fs::read_to_string(path).map_err(|e| DeltaError::io("reading", path, e))
        }

        fn write(&self, path: &Path, text: &str) -> Result<()> {
            write_file_atomic(path, text)
        }
    }

    /// Temp file in the target directory, fsync, then rename over the target.
    pub fn write_file_atomic(path: &Path, content: &str) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| DeltaError::io("creating temporary file in", dir, e))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| DeltaError::io("writing temporary file for", path, e))?;
        if let Ok(meta) = fs::metadata(path) {
            // NamedTempFile is created owner-only; keep the document's mode.
            temp.as_file()
                .set_permissions(meta.permissions())
                .map_err(|e| DeltaError::io("copying permissions to temporary file for", path, e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| DeltaError::io("syncing temporary file for", path, e))?;
        temp.persist(path)
            .map_err(|e| DeltaError::io("replacing", path, e.error))?;

        tracing::debug!(path = %path.display(), bytes = content.len(), "document replaced");
        Ok(())
    }

}

pub mod lock {
    //! Cross-process exclusive lock on a `<document>.lock` sidecar.
    //!
    //! The kernel lock is advisory and belongs to the open handle, so a holder
    //! that crashes releases it implicitly. The sidecar's bytes carry only
    //! holder metadata for diagnostics; they are empty whenever the lock is free.

    use crate::core::Timestamp;
    use crate::error::{DeltaError, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        ffi::OsString,
        fs::{self, File, OpenOptions},
        io::{self, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
        thread,
        time::{Duration, Instant},
    };

    pub const DEFAULT_LOCK_TIMEOUT_SECONDS: f64 = 30.0;
    pub const DEFAULT_LOCK_POLL_INTERVAL_MS: i64 = 200;

    /* ------------------------------ Provider ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LockAttempt {
        Acquired,
        /// Another handle holds the lock; the caller decides whether to wait.
        Busy,
    }

    /// Non-blocking, exclusive, non-reentrant advisory lock on an open file.
    pub trait LockProvider {
        fn try_acquire(&self, file: &File) -> io::Result<LockAttempt>;
        fn release(&self, file: &File) -> io::Result<()>;
    }

    #[cfg(unix)]
    mod unix {
        use super::{LockAttempt, LockProvider};
        use std::{fs::File, io, os::fd::AsRawFd};

        /// BSD `flock(2)`; the lock belongs to the open file description.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct FlockProvider;

        impl LockProvider for FlockProvider {
            fn try_acquire(&self, file: &File) -> io::Result<LockAttempt> {
                // SAFETY: the descriptor is owned by `file` and stays open for the call.
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
                if rc == 0 {
                    return Ok(LockAttempt::Acquired);
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(LockAttempt::Busy)
                } else {
                    Err(err)
                }
            }

            fn release(&self, file: &File) -> io::Result<()> {
                // SAFETY: as above.
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
                if rc == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            }
        }
    }

    #[cfg(windows)]
    mod windows {
        use super::{LockAttempt, LockProvider};
        use std::{fs::File, io, mem, os::windows::io::AsRawHandle};
        use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
        use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
        use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};
        use winapi::um::winnt::HANDLE;

        // Windows region locks also block plain reads of the region, so lock a
        // byte far past the metadata to keep it readable by waiters.
        const REGION_OFFSET_LOW: u32 = 0xFFFF_FFFE;
        const REGION_OFFSET_HIGH: u32 = 0x7FFF_FFFF;

        /// `LockFileEx` over a one-byte region of the lock file.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct RegionLockProvider;

        fn region() -> OVERLAPPED {
            // SAFETY: OVERLAPPED is plain data; all-zero is its documented initial state.
            let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
            // SAFETY: writing the offset arm of the union.
            unsafe {
                let offsets = overlapped.u.s_mut();
                offsets.Offset = REGION_OFFSET_LOW;
                offsets.OffsetHigh = REGION_OFFSET_HIGH;
            }
            overlapped
        }

        impl LockProvider for RegionLockProvider {
            fn try_acquire(&self, file: &File) -> io::Result<LockAttempt> {
                let mut overlapped = region();
                // SAFETY: the handle is owned by `file`; `overlapped` outlives the synchronous call.
                let ok = unsafe {
                    LockFileEx(
                        file.as_raw_handle() as HANDLE,
                        LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                        0,
                        1,
                        0,
                        &mut overlapped,
                    )
                };
                if ok != 0 {
                    return Ok(LockAttempt::Acquired);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
                    Ok(LockAttempt::Busy)
                } else {
                    Err(err)
                }
            }

            fn release(&self, file: &File) -> io::Result<()> {
                let mut overlapped = region();
                // SAFETY: as above.
                let ok = unsafe {
                    UnlockFileEx(file.as_raw_handle() as HANDLE, 0, 1, 0, &mut overlapped)
                };
                if ok != 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    compile_error!("doc-delta needs flock(2) or LockFileEx");

    #[cfg(unix)]
    pub use unix::FlockProvider;
    #[cfg(windows)]
    pub use windows::RegionLockProvider;

    /// The provider for this platform. Nothing else in the crate branches on the OS.
    #[cfg(unix)]
    pub fn platform_provider() -> Box<dyn LockProvider> {
        Box::new(FlockProvider)
    }

    #[cfg(windows)]
    pub fn platform_provider() -> Box<dyn LockProvider> {
        Box::new(RegionLockProvider)
    }

    /* ------------------------------ Metadata ------------------------------ */

    /// Who holds the lock and why. Serialized as one JSON line with sorted keys.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LockHolder {
        pub held_by_host: String,
        pub held_by_pid: u32,
        pub held_by_user: String,
        pub held_for_operation: String,
        pub held_since_utc: String,
    }

    impl LockHolder {
        /// Identity of the calling process, read fresh on every call.
        pub fn current(operation: &str) -> Self {
            Self {
                held_by_host: current_host(),
                held_by_pid: std::process::id(),
                held_by_user: current_user(),
                held_for_operation: operation.to_string(),
                held_since_utc: Timestamp::now().to_string(),
            }
        }
    }

    fn current_user() -> String {
        ["LOGNAME", "USER", "USERNAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn current_host() -> String {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// `<document>.lock`, next to the document.
    pub fn lock_path_for(document: &Path) -> PathBuf {
        let mut name = document
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("DOC_DELTA"));
        name.push(".lock");
        document.with_file_name(name)
    }

    // Best effort: the holder may be mid-truncate, or the file unreadable.
    fn read_holder_raw(lock_path: &Path) -> Option<String> {
        let raw = fs::read_to_string(lock_path).ok()?;
        let raw = raw.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }

    /* ------------------------------ Settings ------------------------------ */

    /// Bounded-wait parameters. Only constructed through validating constructors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockSettings {
        timeout: Duration,
        poll_interval: Duration,
    }

    impl LockSettings {
        /// Values as given on the command line.
        pub fn new(timeout_seconds: f64, poll_interval_ms: i64) -> Result<Self> {
            if timeout_seconds.is_nan() || timeout_seconds < 0.0 {
                return Err(DeltaError::Usage(
                    "--lock-timeout-seconds must be >= 0.".to_string(),
                ));
            }
            let timeout = Duration::try_from_secs_f64(timeout_seconds).map_err(|_| {
                DeltaError::Usage(format!(
                    "--lock-timeout-seconds is out of range: {timeout_seconds}"
                ))
            })?;
            if poll_interval_ms <= 0 {
                return Err(DeltaError::Usage(
                    "--lock-poll-interval-ms must be > 0.".to_string(),
                ));
            }
            Self::from_durations(timeout, Duration::from_millis(poll_interval_ms as u64))
        }

        pub fn from_durations(timeout: Duration, poll_interval: Duration) -> Result<Self> {
            if poll_interval.is_zero() {
                return Err(DeltaError::Usage(
                    "lock poll interval must be > 0.".to_string(),
                ));
            }
            Ok(Self {
                timeout,
                poll_interval,
            })
        }

        pub fn timeout(&self) -> Duration {
            self.timeout
        }

        pub fn poll_interval(&self) -> Duration {
            self.poll_interval
        }
    }

    impl Default for LockSettings {
        fn default() -> Self {
            Self {
                timeout: Duration::from_secs_f64(DEFAULT_LOCK_TIMEOUT_SECONDS),
                poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS as u64),
            }
        }
    }

    /* ----------------------------- Coordinator ----------------------------- */

    /// Held lock. Dropping it clears the metadata and releases the kernel lock.
    pub struct LockGuard {
        file: File,
        provider: Box<dyn LockProvider>,
        lock_path: PathBuf,
        released: bool,
    }

    impl std::fmt::Debug for LockGuard {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LockGuard")
                .field("lock_path", &self.lock_path)
                .field("released", &self.released)
                .finish()
        }
    }

    impl LockGuard {
        pub fn lock_path(&self) -> &Path {
            &self.lock_path
        }

        /// Release explicitly so failures surface as errors instead of log lines.
        pub fn release(mut self) -> Result<()> {
            self.released = true;
            self.clear_and_unlock()
        }

        fn write_holder(&mut self, holder: &LockHolder) -> Result<()> {
            let line = serde_json::to_string(holder).map_err(io::Error::other);
            let written = line.and_then(|line| {
                self.file.set_len(0)?;
                self.file.seek(SeekFrom::Start(0))?;
                self.file.write_all(line.as_bytes())?;
                self.file.write_all(b"\n")?;
                self.file.flush()
            });
            written.map_err(|e| DeltaError::io("writing holder metadata to", &self.lock_path, e))
        }

        fn clear_and_unlock(&mut self) -> Result<()> {
            let cleared = self
                .file
                .set_len(0)
                .and_then(|()| self.file.seek(SeekFrom::Start(0)).map(|_| ()))
                .and_then(|()| self.file.flush());
            let unlocked = self.provider.release(&self.file);
            tracing::debug!(lock = %self.lock_path.display(), "lock released");
            cleared.map_err(|e| DeltaError::io("clearing holder metadata in", &self.lock_path, e))?;
            unlocked.map_err(|e| DeltaError::io("unlocking", &self.lock_path, e))
        }
    }

    impl Drop for LockGuard {
        fn drop(&mut self) {
            if self.released {
                return;
            }
            self.released = true;
            if let Err(err) = self.clear_and_unlock() {
                tracing::warn!(error = %err, "releasing DOC_DELTA lock failed");
            }
        }
    }

    /// Acquire the document's lock with the platform provider.
    pub fn acquire(document: &Path, settings: &LockSettings, operation: &str) -> Result<LockGuard> {
        acquire_with(platform_provider(), document, settings, operation)
    }

    /// Poll `provider` until the lock is ours or `settings.timeout()` has elapsed.
    pub fn acquire_with(
        provider: Box<dyn LockProvider>,
        document: &Path,
        settings: &LockSettings,
        operation: &str,
    ) -> Result<LockGuard> {
        let lock_path = lock_path_for(document);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DeltaError::io("creating directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DeltaError::io("opening lock file", &lock_path, e))?;

        let started = Instant::now();
        let mut last_holder: Option<String> = None;
        loop {
            let attempt = provider
                .try_acquire(&file)
                .map_err(|e| DeltaError::io("locking", &lock_path, e))?;
            if attempt == LockAttempt::Acquired {
                break;
            }

            if let Some(raw) = read_holder_raw(&lock_path) {
                last_holder = Some(raw);
            }
            let waited = started.elapsed();
            if waited >= settings.timeout {
                return Err(DeltaError::LockTimeout {
                    operation: operation.to_string(),
                    timeout: settings.timeout,
                    lock_path,
                    holder: last_holder,
                });
            }
            tracing::debug!(
                lock = %lock_path.display(),
                waited_ms = waited.as_millis() as u64,
                holder = last_holder.as_deref().unwrap_or("-"),
                "lock busy, waiting"
            );
            thread::sleep(settings.poll_interval.min(settings.timeout - waited));
        }

        let mut guard = LockGuard {
            file,
            provider,
            lock_path,
            released: false,
        };
        guard.write_holder(&LockHolder::current(operation))?;
        tracing::debug!(lock = %guard.lock_path.display(), operation, "lock acquired");
        Ok(guard)
    }

    /// Run `body` while holding the document's lock.
    ///
    /// The lock is released on every exit path; if both `body` and the release
    /// fail, the body's error wins.
    pub fn with_lock<T>(
        document: &Path,
        settings: &LockSettings,
        operation: &str,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let guard = acquire(document, settings, operation)?;
        let outcome = body();
        let released = guard.release();
        match (outcome, released) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

}

pub mod commands {
    //! `add`, `check`, and `fix`.
    //!
    //! The `*_document` functions are pure transformations over document text;
    //! the `run_*` functions wrap them in the lock and the document store.

    use crate::core::{Entry, HEADING_MARKER, Timestamp};
    use crate::error::{DeltaError, Result};
    use crate::format::{render_document, sort_entries};
    use crate::lock::{self, LockSettings};
    use crate::parser::parse_document;
    use crate::storage::DocumentStore;
    use std::{
        fmt, fs,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Command {
        Add,
        Check,
        Fix,
    }

    impl Command {
        /// Operation name recorded in lock holder metadata.
        pub fn name(self) -> &'static str {
            match self {
                Command::Add => "add",
                Command::Check => "check",
                Command::Fix => "fix",
            }
        }
    }

    /* --------------------------------- add --------------------------------- */

    /// Raw `add` arguments as supplied by the caller.
    #[derive(Debug, Clone, Default)]
    pub struct AddRequest {
        pub title: String,
        pub timestamp: Option<String>,
        pub changes: Vec<String>,
        pub verifications: Vec<String>,
        pub body_file: Option<PathBuf>,
    }

    /// An `add` whose arguments passed validation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NewEntry {
        title: String,
        /// `None` means "now", resolved once the lock is held.
        timestamp: Option<Timestamp>,
        body: String,
    }

    impl AddRequest {
        pub fn validate(&self) -> Result<NewEntry> {
            let title = self.title.trim();
            if title.is_empty() {
                return Err(DeltaError::validation("Title must not be empty."));
            }
            if title.contains(['\n', '\r']) {
                return Err(DeltaError::validation("Title must be a single line."));
            }

            let timestamp = match &self.timestamp {
                Some(raw) => {
                    let raw = raw.trim();
                    let parsed = Timestamp::parse(raw).ok_or_else(|| {
                        DeltaError::validation(format!(
                            "Invalid --timestamp '{raw}'. Expected format: YYYY-MM-DD HH:MM:SSZ."
                        ))
                    })?;
                    Some(parsed)
                }
                None => None,
            };

            let body = self.resolve_body()?;
            if let Some(line) = body.lines().find(|l| l.starts_with(HEADING_MARKER)) {
                return Err(DeltaError::validation(format!(
                    "Entry body must not contain level-2 headings: {line}"
                )));
            }

            Ok(NewEntry {
                title: title.to_string(),
                timestamp,
                body,
            })
        }

        fn resolve_body(&self) -> Result<String> {
            if let Some(path) = &self.body_file {
                if !self.changes.is_empty() || !self.verifications.is_empty() {
                    return Err(DeltaError::validation(
                        "Use either --body-file or --change/--verification values, not both.",
                    ));
                }
                if !path.exists() {
                    return Err(DeltaError::NotFound {
                        what: "Body file",
                        path: path.clone(),
                    });
                }
                let text =
                    fs::read_to_string(path).map_err(|e| DeltaError::io("reading", path, e))?;
                if text.trim().is_empty() {
                    return Err(DeltaError::validation(
                        "Body file must contain non-empty content.",
                    ));
                }
                return Ok(text);
            }

            if self
                .changes
                .iter()
                .chain(&self.verifications)
                .any(|value| value.trim().is_empty())
            {
                return Err(DeltaError::validation(
                    "--change and --verification values must not be empty.",
                ));
            }

            let mut lines: Vec<String> = self.changes.iter().map(|v| format!("- {v}")).collect();
            if !self.verifications.is_empty() {
                if !lines.is_empty() {
                    lines.push(String::new());
                }
                lines.push("- Verification:".to_string());
                lines.extend(self.verifications.iter().map(|v| format!("- {v}")));
            }

            if lines.is_empty() {
                return Err(DeltaError::validation(
                    "Add mode requires --body-file or at least one --change/--verification value.",
                ));
            }
            Ok(lines.join("\n"))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AddReport {
        pub timestamp: String,
        pub title: String,
    }

    impl fmt::Display for AddReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Added DOC_DELTA entry: {} - {}", self.timestamp, self.title)
        }
    }

    /// Insert `entry` into `text`, returning the canonical rendering and the new entry.
    pub fn add_to_document(text: &str, entry: &NewEntry, now: Timestamp) -> Result<(String, Entry)> {
        let parsed = parse_document(text)?;
        let timestamp = entry.timestamp.unwrap_or(now);
        let new_entry = Entry::new(parsed.entries.len(), timestamp, &entry.title, &entry.body);

        let mut entries = parsed.entries;
        entries.push(new_entry.clone());
        let sorted = sort_entries(entries);
        Ok((render_document(&parsed.preamble, &sorted), new_entry))
    }

    pub fn run_add(
        store: &impl DocumentStore,
        document: &Path,
        settings: &LockSettings,
        request: &AddRequest,
    ) -> Result<AddReport> {
        let entry = request.validate()?;
        lock::with_lock(document, settings, Command::Add.name(), || {
            let text = store.read(document)?;
            let (rendered, added) = add_to_document(&text, &entry, Timestamp::now())?;
            store.write(document, &rendered)?;
            tracing::info!(entry = %added.label(), "entry added");
            Ok(AddReport {
                timestamp: added.timestamp_text,
                title: added.title,
            })
        })
    }

    /* -------------------------------- check -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CheckReport {
        Passed {
            entries: usize,
        },
        /// First position (1-based) where file order differs from canonical order.
        OutOfOrder {
            position: usize,
            found: String,
            expected: String,
        },
        /// Order is canonical but spacing/trailing text is not.
        NotCanonical {
            line: usize,
            found: Option<String>,
            expected: Option<String>,
        },
    }

    impl CheckReport {
        pub fn passed(&self) -> bool {
            matches!(self, CheckReport::Passed { .. })
        }
    }

    impl fmt::Display for CheckReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                CheckReport::Passed { entries } => {
                    write!(f, "DOC_DELTA check passed ({entries} entries).")
                }
                CheckReport::OutOfOrder {
                    position,
                    found,
                    expected,
                } => write!(
                    f,
                    "DOC_DELTA order check failed.\nFirst mismatch at position {position}: found '{found}', expected '{expected}'."
                ),
                CheckReport::NotCanonical {
                    line,
                    found,
                    expected,
                } => write!(
                    f,
                    "DOC_DELTA layout is not canonical.\nFirst difference at line {line}: found {}, expected {}.",
                    describe_line(found.as_deref()),
                    describe_line(expected.as_deref())
                ),
            }
        }
    }

    fn describe_line(line: Option<&str>) -> String {
        match line {
            Some(text) => format!("'{text}'"),
            None => "end of file".to_string(),
        }
    }

    /// Compare file order to canonical order, stopping at the first mismatch.
    pub fn check_document(text: &str) -> Result<CheckReport> {
        let parsed = parse_document(text)?;
        let sorted = sort_entries(parsed.entries.clone());

        if let Some((position, (found, expected))) = parsed
            .entries
            .iter()
            .zip(&sorted)
            .enumerate()
            .find(|(_, (found, expected))| found.index != expected.index)
        {
            return Ok(CheckReport::OutOfOrder {
                position: position + 1,
                found: found.label(),
                expected: expected.label(),
            });
        }

        let rendered = render_document(&parsed.preamble, &sorted);
        if rendered != text {
            return Ok(first_difference(text, &rendered));
        }
        Ok(CheckReport::Passed {
            entries: parsed.entries.len(),
        })
    }

    fn first_difference(actual: &str, expected: &str) -> CheckReport {
        let mut actual_lines = actual.split('\n');
        let mut expected_lines = expected.split('\n');
        let mut line = 1;
        loop {
            match (actual_lines.next(), expected_lines.next()) {
                (Some(a), Some(e)) if a == e => line += 1,
                (found, expected) => {
                    return CheckReport::NotCanonical {
                        line,
                        found: found.map(str::to_string),
                        expected: expected.map(str::to_string),
                    };
                }
            }
        }
    }

    pub fn run_check(
        store: &impl DocumentStore,
        document: &Path,
        settings: &LockSettings,
    ) -> Result<CheckReport> {
        // Readers take the lock too, so they never see a half-applied write.
        lock::with_lock(document, settings, Command::Check.name(), || {
            let text = store.read(document)?;
            check_document(&text)
        })
    }

    /* --------------------------------- fix --------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FixReport {
        AlreadyNormalized,
        Rewritten,
    }

    impl fmt::Display for FixReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                FixReport::AlreadyNormalized => write!(f, "DOC_DELTA is already normalized."),
                FixReport::Rewritten => write!(f, "DOC_DELTA normalized and written."),
            }
        }
    }

    /// Canonical rendering of `text`, or `None` when it is already canonical.
    pub fn fix_document(text: &str) -> Result<Option<String>> {
        let parsed = parse_document(text)?;
        let sorted = sort_entries(parsed.entries);
        let rendered = render_document(&parsed.preamble, &sorted);
        Ok((rendered != text).then_some(rendered))
    }

    pub fn run_fix(
        store: &impl DocumentStore,
        document: &Path,
        settings: &LockSettings,
    ) -> Result<FixReport> {
        lock::with_lock(document, settings, Command::Fix.name(), || {
            let text = store.read(document)?;
            match fix_document(&text)? {
                None => Ok(FixReport::AlreadyNormalized),
                Some(rendered) => {
                    store.write(document, &rendered)?;
                    tracing::info!(document = %document.display(), "document normalized");
                    Ok(FixReport::Rewritten)
                }
            }
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::FsDocumentStore;
        use std::time::Duration;

        fn build_doc(entries: &[&str]) -> String {
            let preamble = "# DOC_DELTA Update Contract\n\nUse this file as a strict chronological log of substantive repository changes.\n";
            let mut sections = vec![preamble.trim().to_string()];
            sections.extend(entries.iter().map(|e| e.trim().to_string()));
            format!("{}\n", sections.join("\n\n").trim_end())
        }

        fn settings() -> LockSettings {
            LockSettings::from_durations(Duration::from_secs(2), Duration::from_millis(10))
                .expect("settings")
        }

        fn request(title: &str, ts: &str) -> AddRequest {
            AddRequest {
                title: title.into(),
                timestamp: Some(ts.into()),
                changes: vec!["Added helper.".into()],
                ..AddRequest::default()
            }
        }

        #[test]
        fn check_passes_for_sorted_entries() {
            let text = build_doc(&[
                "## 2026-02-14 20:40:00Z - First\n\n- A.",
                "## 2026-02-14 20:50:00Z - Second\n\n- B.",
            ]);
            let report = check_document(&text).expect("check");
            assert_eq!(report, CheckReport::Passed { entries: 2 });
            assert_eq!(report.to_string(), "DOC_DELTA check passed (2 entries).");
        }

        #[test]
        fn check_reports_first_mismatch() {
            let text = build_doc(&[
                "## 2026-02-14 20:40:00Z - First\n\n- A.",
                "## 2026-02-14 20:55:00Z - Third\n\n- C.",
                "## 2026-02-14 20:50:00Z - Second\n\n- B.",
            ]);
            let report = check_document(&text).expect("check");
            assert_eq!(
                report,
                CheckReport::OutOfOrder {
                    position: 2,
                    found: "2026-02-14 20:55:00Z - Third".into(),
                    expected: "2026-02-14 20:50:00Z - Second".into(),
                }
            );
            assert!(report.to_string().contains("order check failed"));
        }

        #[test]
        fn check_flags_non_canonical_spacing() {
            let text = "## 2026-02-14 20:40:00Z - First\n\n\n## 2026-02-14 20:50:00Z - Second\n";
            let report = check_document(text).expect("check");
            assert_eq!(
                report,
                CheckReport::NotCanonical {
                    line: 3,
                    found: Some(String::new()),
                    expected: Some("## 2026-02-14 20:50:00Z - Second".into()),
                }
            );
        }

        #[test]
        fn check_flags_missing_trailing_newline() {
            let report = check_document("## 2026-02-14 20:40:00Z - First").expect("check");
            assert_eq!(
                report,
                CheckReport::NotCanonical {
                    line: 2,
                    found: None,
                    expected: Some(String::new()),
                }
            );
            assert!(report.to_string().contains("found end of file"));
        }

        #[test]
        fn check_agrees_with_fix() {
            let samples = [
                build_doc(&["## 2026-02-14 20:40:00Z - A\n\n- a."]),
                build_doc(&[
                    "## 2026-02-14 20:50:00Z - B\n\n- b.",
                    "## 2026-02-14 20:40:00Z - A\n\n- a.",
                ]),
                "Intro\n\n\n## 2026-02-14 20:40:00Z - A\n".to_string(),
                "## 2026-02-14 20:40:00Z - A\n\n".to_string(),
            ];
            for text in samples {
                let passes = check_document(&text).expect("check").passed();
                let canonical = fix_document(&text).expect("fix").is_none();
                assert_eq!(passes, canonical, "disagreement on {text:?}");
            }
        }

        #[test]
        fn fix_is_idempotent() {
            let text = build_doc(&[
                "## 2026-02-14 20:50:00Z - Second\n\n- B.",
                "## 2026-02-14 20:40:00Z - First\n\n- A.",
            ]);
            let once = fix_document(&text).expect("fix").expect("changed");
            assert!(
                once.find("- First").expect("first") < once.find("- Second").expect("second")
            );
            assert_eq!(fix_document(&once).expect("fix"), None);
        }

        #[test]
        fn fix_rewrites_crlf_documents_as_lf() {
            let text = "Intro\r\n\r\n## 2026-02-14 20:50:00Z - B\r\n\r\n- b.\r\n\r\n## 2026-02-14 20:40:00Z - A\r\n\r\n- a.\r\n";
            let fixed = fix_document(text).expect("fix").expect("changed");
            assert!(!fixed.contains('\r'));
            assert_eq!(
                fixed,
                "Intro\n\n## 2026-02-14 20:40:00Z - A\n\n- a.\n\n## 2026-02-14 20:50:00Z - B\n\n- b.\n"
            );
            assert!(check_document(&fixed).expect("check").passed());
        }

        #[test]
        fn check_rejects_sorted_crlf_document() {
            let text = "## 2026-02-14 20:40:00Z - A\r\n\r\n- a.\r\n";
            let report = check_document(text).expect("check");
            assert!(matches!(report, CheckReport::NotCanonical { line: 1, .. }));
            assert!(fix_document(text).expect("fix").is_some());
        }

        #[test]
        fn fix_keeps_ties_in_file_order() {
            let text = "## 2026-02-14 20:40:00Z - B\n\n## 2026-02-14 20:40:00Z - A\n\n## 2026-02-14 20:30:00Z - Z\n";
            let fixed = fix_document(text).expect("fix").expect("changed");
            assert_eq!(
                fixed,
                "## 2026-02-14 20:30:00Z - Z\n\n## 2026-02-14 20:40:00Z - B\n\n## 2026-02-14 20:40:00Z - A\n"
            );
        }

        #[test]
        fn add_builds_change_and_verification_bullets() {
            let req = AddRequest {
                title: "  New Entry ".into(),
                timestamp: Some(" 2026-02-14 20:45:00Z ".into()),
                changes: vec!["Added helper.".into(), "Wired CLI.".into()],
                verifications: vec!["`doc-delta check` passed.".into()],
                body_file: None,
            };
            let entry = req.validate().expect("valid");
            let text = build_doc(&[
                "## 2026-02-14 20:40:00Z - First\n\n- A.",
                "## 2026-02-14 20:50:00Z - Later\n\n- L.",
            ]);
            let (rendered, added) =
                add_to_document(&text, &entry, Timestamp::now()).expect("add");

            assert_eq!(added.index, 2);
            assert_eq!(
                added.block,
                "## 2026-02-14 20:45:00Z - New Entry\n\n- Added helper.\n- Wired CLI.\n\n- Verification:\n- `doc-delta check` passed."
            );
            let first = rendered.find("- First").expect("first");
            let new = rendered.find("- New Entry").expect("new");
            let later = rendered.find("- Later").expect("later");
            assert!(first < new && new < later);
            assert!(check_document(&rendered).expect("check").passed());
        }

        #[test]
        fn add_uses_now_when_no_timestamp_given() {
            let req = AddRequest {
                title: "Now".into(),
                verifications: vec!["ok".into()],
                ..AddRequest::default()
            };
            let entry = req.validate().expect("valid");
            let now = Timestamp::parse("2030-01-01 00:00:00Z").unwrap();
            let text = build_doc(&["## 2026-02-14 20:40:00Z - First\n\n- A."]);
            let (rendered, added) = add_to_document(&text, &entry, now).expect("add");
            assert_eq!(added.timestamp_text, "2030-01-01 00:00:00Z");
            assert!(rendered.ends_with("## 2030-01-01 00:00:00Z - Now\n\n- Verification:\n- ok\n"));
        }

        #[test]
        fn add_validation_errors() {
            let mut req = request("  ", "2026-02-14 20:45:00Z");
            assert_eq!(req.validate().unwrap_err().to_string(), "Title must not be empty.");

            req = request("T", "2026-02-14T20:45:00Z");
            assert!(req.validate().unwrap_err().to_string().starts_with("Invalid --timestamp"));

            req = request("T", "2026-02-30 10:00:00Z");
            assert!(matches!(req.validate(), Err(DeltaError::Validation(_))));

            req = request("T", "2026-02-14 12:34:60Z");
            assert!(req.validate().unwrap_err().to_string().starts_with("Invalid --timestamp"));

            req = request("T", "2026-02-14 20:45:00Z");
            req.body_file = Some(PathBuf::from("body.md"));
            assert_eq!(
                req.validate().unwrap_err().to_string(),
                "Use either --body-file or --change/--verification values, not both."
            );

            req = AddRequest {
                title: "T".into(),
                ..AddRequest::default()
            };
            assert_eq!(
                req.validate().unwrap_err().to_string(),
                "Add mode requires --body-file or at least one --change/--verification value."
            );

            req = request("T", "2026-02-14 20:45:00Z");
            req.changes.push("   ".into());
            assert!(matches!(req.validate(), Err(DeltaError::Validation(_))));

            req = request("T", "2026-02-14 20:45:00Z");
            req.changes = vec!["x\n## 2026-01-01 00:00:00Z - Smuggled".into()];
            assert!(req.validate().unwrap_err().to_string().contains("level-2 headings"));
        }

        #[test]
        fn add_reads_body_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let body = tmp.path().join("body.md");
            fs::write(&body, "\n- line one\n- line two\n\n").expect("write body");
            let req = AddRequest {
                title: "Body File Entry".into(),
                timestamp: Some("2026-02-14 20:41:00Z".into()),
                body_file: Some(body.clone()),
                ..AddRequest::default()
            };
            let entry = req.validate().expect("valid");
            let (rendered, _) = add_to_document(
                &build_doc(&["## 2026-02-14 20:40:00Z - First\n\n- A."]),
                &entry,
                Timestamp::now(),
            )
            .expect("add");
            assert!(rendered.contains(
                "## 2026-02-14 20:41:00Z - Body File Entry\n\n- line one\n- line two\n"
            ));

            fs::write(&body, " \n\n").expect("blank body");
            assert_eq!(
                req.validate().unwrap_err().to_string(),
                "Body file must contain non-empty content."
            );

            fs::remove_file(&body).expect("remove");
            assert!(matches!(req.validate(), Err(DeltaError::NotFound { .. })));
        }

        #[test]
        fn run_commands_against_the_filesystem() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let doc = tmp.path().join("DOC_DELTA.md");
            fs::write(
                &doc,
                build_doc(&[
                    "## 2026-02-14 20:50:00Z - Second\n\n- B.",
                    "## 2026-02-14 20:40:00Z - First\n\n- A.",
                ]),
            )
            .expect("seed");

            let store = FsDocumentStore;
            assert!(!run_check(&store, &doc, &settings()).expect("check").passed());
            assert_eq!(run_fix(&store, &doc, &settings()).expect("fix"), FixReport::Rewritten);
            assert_eq!(
                run_fix(&store, &doc, &settings()).expect("fix"),
                FixReport::AlreadyNormalized
            );

            let report =
                run_add(&store, &doc, &settings(), &request("Third", "2026-02-14 20:45:00Z"))
                    .expect("add");
            assert_eq!(report.to_string(), "Added DOC_DELTA entry: 2026-02-14 20:45:00Z - Third");
            assert_eq!(
                run_check(&store, &doc, &settings()).expect("check"),
                CheckReport::Passed { entries: 3 }
            );
            assert_eq!(fs::read_to_string(lock::lock_path_for(&doc)).expect("lock"), "");
        }

        #[test]
        fn failed_add_leaves_document_untouched() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let doc = tmp.path().join("DOC_DELTA.md");
            let original = "Intro\n\n## broken heading\n";
            fs::write(&doc, original).expect("seed");

            let err = run_add(
                &FsDocumentStore,
                &doc,
                &settings(),
                &request("T", "2026-02-14 20:45:00Z"),
            )
            .unwrap_err();
            assert!(matches!(err, DeltaError::Format(_)));
            assert_eq!(fs::read_to_string(&doc).expect("read"), original);
        }

        #[test]
        fn invalid_request_never_creates_lock_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let doc = tmp.path().join("DOC_DELTA.md");
            let req = AddRequest {
                title: String::new(),
                ..AddRequest::default()
            };
            assert!(run_add(&FsDocumentStore, &doc, &settings(), &req).is_err());
            assert!(!lock::lock_path_for(&doc).exists());
        }

        #[test]
        fn missing_document_is_reported() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let doc = tmp.path().join("DOC_DELTA.md");
            let err = run_fix(&FsDocumentStore, &doc, &settings()).unwrap_err();
            assert!(matches!(err, DeltaError::NotFound { .. }));
        }
    }
}

pub use commands::{AddRequest, CheckReport, FixReport, run_add, run_check, run_fix};
pub use format::{render_document, sort_entries};
pub use parser::parse_document;
