//! One method per daemon command.
//!
//! Every method builds the [`Command`], hands it to
//! [`Clamd::do_command`], and wraps the raw response in a [`Reply`].
//! Scan-style replies can be parsed with [`Reply::scan_report`].
//!
//! # Example
//!
//! ```ignore
//! let reply = clamd.instream(b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR").await?;
//! let report = reply.scan_report()?;
//! if !report.is_clean() {
//!     for (path, signature) in report.infected() {
//!         println!("{path}: {signature}");
//!     }
//! }
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::client::Clamd;
use crate::error::{ClamdError, Result};
use crate::protocol::{Command, CommandKind};
use crate::retry::Response;
use crate::transport::Connector;

/// Raw text reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Response text, invalid UTF-8 replaced.
    pub raw: String,
    /// Exchange attempts used.
    pub attempts: u32,
}

impl From<Response> for Reply {
    fn from(resp: Response) -> Self {
        Self {
            raw: resp.text(),
            attempts: resp.attempts,
        }
    }
}

impl Reply {
    /// Parse a scan-style reply.
    pub fn scan_report(&self) -> Result<ScanReport> {
        ScanReport::parse(&self.raw)
    }
}

/// Result for one scanned object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing found.
    Clean,
    /// Matched the named signature.
    Infected(String),
    /// The daemon could not scan the object.
    Error(String),
}

/// One line of a scan reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Scanned path (`stream` for `INSTREAM`).
    pub path: String,
    /// What the daemon concluded.
    pub verdict: Verdict,
}

/// Parsed scan reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// One entry per reported object, in reply order.
    pub results: Vec<ScanResult>,
}

impl ScanReport {
    /// Parse NUL- or newline-separated `<path>: <status>` lines.
    ///
    /// # Errors
    ///
    /// `Protocol` if a line matches none of the `OK`, `FOUND` and `ERROR`
    /// forms.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut results = Vec::new();

        for line in raw.split(['\0', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
            results.push(parse_line(line)?);
        }

        Ok(Self { results })
    }

    /// Whether every object came back clean.
    pub fn is_clean(&self) -> bool {
        self.results.iter().all(|r| r.verdict == Verdict::Clean)
    }

    /// `(path, signature)` for every infected object.
    pub fn infected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.verdict {
            Verdict::Infected(sig) => Some((r.path.as_str(), sig.as_str())),
            _ => None,
        })
    }

    /// `(path, message)` for every object the daemon failed to scan.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.verdict {
            Verdict::Error(msg) => Some((r.path.as_str(), msg.as_str())),
            _ => None,
        })
    }
}

fn parse_line(line: &str) -> Result<ScanResult> {
    let malformed = || ClamdError::Protocol(format!("Unknown scan response: {:?}", line));

    // Error messages may contain ": " themselves, so split at the first one.
    if let Some(rest) = line.strip_suffix(" ERROR") {
        let (path, msg) = rest.split_once(": ").ok_or_else(malformed)?;
        return Ok(ScanResult {
            path: path.to_string(),
            verdict: Verdict::Error(msg.to_string()),
        });
    }

    let (path, status) = line.rsplit_once(": ").ok_or_else(malformed)?;
    let verdict = if status == "OK" {
        Verdict::Clean
    } else if let Some(sig) = status.strip_suffix(" FOUND") {
        Verdict::Infected(sig.to_string())
    } else {
        return Err(malformed());
    };

    Ok(ScanResult {
        path: path.to_string(),
        verdict,
    })
}

/// Scan paths become part of a line-terminated header.
fn check_path(kind: CommandKind, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ClamdError::InvalidArgument(format!(
            "{} requires a non-empty path",
            kind
        )));
    }
    if path.contains(['\n', '\0']) {
        return Err(ClamdError::InvalidArgument(format!(
            "{} path must not contain newline or NUL",
            kind
        )));
    }
    Ok(())
}

impl<C: Connector> Clamd<C> {
    async fn simple(&self, kind: CommandKind) -> Result<Reply> {
        self.do_command(Command::simple(kind)).await.map(Reply::from)
    }

    async fn path_command(&self, kind: CommandKind, path: &str) -> Result<Reply> {
        check_path(kind, path)?;
        self.do_command(Command::with_argument(kind, path))
            .await
            .map(Reply::from)
    }

    /// `PING`; fails with `Protocol` unless the daemon answers `PONG`.
    pub async fn ping(&self) -> Result<Reply> {
        let reply = self.simple(CommandKind::Ping).await?;
        if reply.raw.starts_with("PONG") {
            Ok(reply)
        } else {
            Err(ClamdError::Protocol(format!(
                "Unknown response: {:?}",
                reply.raw
            )))
        }
    }

    /// `VERSION`: engine and signature database version.
    pub async fn version(&self) -> Result<Reply> {
        self.simple(CommandKind::Version).await
    }

    /// `RELOAD`: reload the signature databases.
    pub async fn reload(&self) -> Result<Reply> {
        self.simple(CommandKind::Reload).await
    }

    /// `STATS`: thread pool and queue statistics.
    pub async fn stats(&self) -> Result<Reply> {
        self.simple(CommandKind::Stats).await
    }

    /// `VERSIONCOMMANDS`: version plus the commands the daemon supports.
    pub async fn version_commands(&self) -> Result<Reply> {
        self.simple(CommandKind::VersionCommands).await
    }

    /// `SCAN <path>`: stop at the first infected file.
    pub async fn scan(&self, path: &str) -> Result<Reply> {
        self.path_command(CommandKind::Scan, path).await
    }

    /// `CONTSCAN <path>`: keep going after a match.
    pub async fn contscan(&self, path: &str) -> Result<Reply> {
        self.path_command(CommandKind::Contscan, path).await
    }

    /// `MULTISCAN <path>`: scan in parallel on the daemon side.
    pub async fn multiscan(&self, path: &str) -> Result<Reply> {
        self.path_command(CommandKind::Multiscan, path).await
    }

    /// `ALLMATCHSCAN <path>`: report every matching signature.
    pub async fn allmatchscan(&self, path: &str) -> Result<Reply> {
        self.path_command(CommandKind::Allmatchscan, path).await
    }

    /// `INSTREAM`: scan `data` sent over the connection.
    pub async fn instream(&self, data: impl AsRef<[u8]>) -> Result<Reply> {
        let cmd = Command::instream(data.as_ref(), self.options().chunk_size)?;
        self.do_command(cmd).await.map(Reply::from)
    }

    /// `INSTREAM` over everything `reader` yields.
    ///
    /// The reader is drained before anything is sent; read failures are
    /// `Io` errors.
    pub async fn instream_reader<R>(&self, mut reader: R) -> Result<Reply>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.instream(data).await
    }

    /// `IDSESSION`: only issues the command; session multiplexing is not
    /// supported.
    pub async fn id_session(&self) -> Result<Reply> {
        self.simple(CommandKind::IdSession).await
    }

    /// `END`: close an ID session.
    pub async fn end(&self) -> Result<Reply> {
        self.simple(CommandKind::End).await
    }

    /// `SHUTDOWN`: stop the daemon.
    pub async fn shutdown(&self) -> Result<Reply> {
        self.simple(CommandKind::Shutdown).await
    }
}
