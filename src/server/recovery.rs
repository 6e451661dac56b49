//! Kiku server recovery log module implementation.
//!
//! The log is a text file holding one line per committed instance the server
//! has applied, in apply order:
//!
//! ```text
//! PUT<TAB>key<TAB>value<TAB>req_id<TAB>requester<TAB>instance
//! ```
//!
//! Fields are escaped so that they never contain raw tabs or newlines. Lines
//! starting with `#` are comments. A trailing line without newline is a torn
//! write and gets discarded on open.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::utils::KikuError;
use crate::paxos::{InstanceId, ReplicaId};
use crate::server::{Command, Request};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Header line written into a freshly created log file.
const LOG_HEADER: &str = "# kiku recovery log v1";

/// One persisted record: the request committed at given instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub inst: InstanceId,
    pub req: Request,
}

/// Append-only recovery log backed by a text file.
pub struct RecoveryLog {
    /// My replica ID.
    me: ReplicaId,

    /// Path of the backing file.
    path: PathBuf,

    /// Backing file, cursor always at EOF.
    backer: File,

    /// Whether to fsync after every append.
    sync: bool,
}

impl RecoveryLog {
    /// Opens the log at given path, creating it if it does not exist yet.
    /// Returns the log handle together with all complete records found.
    pub async fn open(
        me: ReplicaId,
        path: &Path,
        sync: bool,
    ) -> Result<(Self, Vec<LogRecord>), KikuError> {
        if !fs::try_exists(path).await? {
            let mut file = File::create(path).await?;
            file.write_all(format!("{}\n", LOG_HEADER).as_bytes()).await?;
            file.sync_all().await?;
            pf_info!(me; "created recovery log '{}'", path.display());
        } else {
            pf_info!(me; "recovery log '{}' already exists", path.display());
        }

        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let mut content = Vec::new();
        backer.read_to_end(&mut content).await?;

        let mut records = Vec::new();
        let mut valid_len = 0;
        for (lineno, raw) in content.split_inclusive(|&b| b == b'\n').enumerate()
        {
            if raw.last() != Some(&b'\n') {
                pf_warn!(me; "discarding torn tail of {} bytes at line {}",
                             raw.len(), lineno + 1);
                break;
            }
            valid_len += raw.len();

            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::decode_line(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    pf_warn!(me; "skipping malformed line {}: {}", lineno + 1, e);
                }
            }
        }

        if valid_len < content.len() {
            backer.set_len(valid_len as u64).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?; // seek to EOF

        pf_info!(me; "replayed {} records from '{}'", records.len(), path.display());
        Ok((
            RecoveryLog {
                me,
                path: path.to_path_buf(),
                backer,
                sync,
            },
            records,
        ))
    }

    /// Appends one record as a full line.
    pub async fn append(&mut self, record: &LogRecord) -> Result<(), KikuError> {
        let line = Self::encode_line(record);
        self.backer.write_all(line.as_bytes()).await?;
        if self.sync {
            self.backer.sync_data().await?;
        } else {
            self.backer.flush().await?;
        }
        pf_trace!(self.me; "logged inst {} to '{}'", record.inst, self.path.display());
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encodes a record into one newline-terminated line.
    fn encode_line(record: &LogRecord) -> String {
        let (kind, key, value) = match &record.req.cmd {
            Command::Put { key, value } => ("PUT", key.as_str(), value.as_str()),
            Command::Get { key } => ("GET", key.as_str(), ""),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            kind,
            escape(key),
            escape(value),
            record.req.req_id,
            record.req.requester,
            record.inst
        )
    }

    /// Decodes one line (without its newline) into a record.
    fn decode_line(line: &str) -> Result<LogRecord, KikuError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(KikuError::msg(format!(
                "expected 6 fields, got {}",
                fields.len()
            )));
        }

        let key = unescape(fields[1])?;
        let cmd = match fields[0] {
            "PUT" => Command::Put {
                key,
                value: unescape(fields[2])?,
            },
            "GET" => Command::Get { key },
            kind => {
                return Err(KikuError::msg(format!("unknown kind '{}'", kind)))
            }
        };

        Ok(LogRecord {
            inst: fields[5].parse()?,
            req: Request {
                requester: fields[4].parse()?,
                req_id: fields[3].parse()?,
                cmd,
            },
        })
    }
}

/// Escapes backslashes, tabs and line breaks.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses `escape()`.
fn unescape(s: &str) -> Result<String, KikuError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(KikuError::msg(format!(
                    "invalid escape sequence '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
