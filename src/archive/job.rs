use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use axum::body::Bytes;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time,
};
use uuid::Uuid;

use super::Identifier;
use crate::error::{archive as ArchiveError, Error};

pub const RECURSIVE_FLAG: &str = "-r";
pub const QUIET_FLAG: &str = "-q";
pub const STDOUT_MARKER: &str = "-";

/// How long a bundler may take to exit once its output is closed.
pub const EXIT_GRACE: Duration = Duration::from_secs(5);
const DIAGNOSTICS_GRACE: Duration = Duration::from_secs(1);
const STDERR_CAPTURE_LIMIT: u64 = 64 * 1024;

/// External program producing a zip archive of a directory on its standard output.
#[derive(Clone, Debug)]
pub struct Bundler {
    program: PathBuf,
    leading: Vec<OsString>,
}

impl Bundler {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
        }
    }

    /// Runs `script` with `/bin/sh`, receiving the usual bundler arguments as `$1..$4`.
    #[cfg(test)]
    pub fn shell(script: &str) -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            leading: vec!["-c".into(), script.into(), "bundler".into()],
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self, identifier: &Identifier) -> Vec<OsString> {
        self.leading
            .iter()
            .cloned()
            .chain(
                [RECURSIVE_FLAG, QUIET_FLAG, STDOUT_MARKER, identifier.as_ref()]
                    .iter()
                    .map(OsString::from),
            )
            .collect()
    }
}

/// A running bundler, owned by exactly one request.
pub struct CompressionJob {
    id: Uuid,
    child: Child,
    pgid: Option<i32>,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    status: Option<ExitStatus>,
    swept: bool,
}

impl CompressionJob {
    pub fn start(bundler: &Bundler, root: &Path, identifier: &Identifier) -> Result<Self, Error> {
        let id = Uuid::new_v4();
        let mut command = Command::new(bundler.program());
        command
            .args(bundler.args(identifier))
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            // The bundler leads its own group so that helpers it spawns can be killed with it.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|err| {
            log::error!(
                "[{}] Cannot start {} for {}: {}",
                id,
                bundler.program().display(),
                identifier,
                err
            );
            ArchiveError::ProcessStart
        })?;
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                log::error!("[{}] Bundler pipes are missing", id);
                let _ = child.start_kill();
                return Err(ArchiveError::ProcessStart);
            }
        };
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        log::debug!(
            "[{}] Started bundler for {} in {} (pid {:?})",
            id,
            identifier,
            root.display(),
            pgid
        );

        Ok(Self {
            id,
            child,
            pgid,
            stdout,
            stderr: Some(capture(stderr)),
            status: None,
            swept: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pgid.map(|pid| pid as u32)
    }

    /// Reads at most `size` bytes of archive. Returns `None` once the output is exhausted.
    pub async fn read_chunk(&mut self, size: usize) -> io::Result<Option<Bytes>> {
        let mut buf = Vec::with_capacity(size);
        let read = (&mut self.stdout)
            .take(size as u64)
            .read_buf(&mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::from(buf)))
    }

    /// Reads the first chunk and makes sure the bundler did not fail before producing it.
    ///
    /// This is the last point where a failure can still be reported with a status code.
    pub async fn probe(&mut self, size: usize) -> Result<Bytes, Error> {
        let head = match self.read_chunk(size).await {
            Ok(head) => head.unwrap_or_default(),
            Err(err) => {
                log::error!("[{}] Cannot read bundler output: {}", self.id, err);
                self.abandon().await;
                return Err(ArchiveError::ProcessExecution);
            }
        };

        let status = if head.is_empty() {
            self.finish(EXIT_GRACE).await.map(Some)
        } else {
            self.try_status()
        };
        match status {
            Ok(Some(status)) if !status.success() => {
                self.abandon().await;
                let diagnostics = self.diagnostics().await;
                log::error!("[{}] Bundler failed with {}: {}", self.id, status, diagnostics);
                Err(ArchiveError::ProcessExecution)
            }
            Ok(_) => Ok(head),
            Err(err) => {
                log::error!("[{}] Cannot check bundler status: {}", self.id, err);
                self.abandon().await;
                Err(ArchiveError::ProcessExecution)
            }
        }
    }

    /// Waits for a bundler whose output is exhausted, killing it if it lingers past `grace`.
    ///
    /// Helpers still running in its process group are killed once it exited.
    pub async fn finish(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        let status = match self.status {
            Some(status) => status,
            None => match time::timeout(grace, self.child.wait()).await {
                Ok(status) => self.record(status?),
                Err(_) => {
                    log::warn!("[{}] Bundler still running after end of output", self.id);
                    return self.terminate().await;
                }
            },
        };
        self.sweep()?;
        Ok(status)
    }

    /// Kills the whole process group, then reaps the bundler.
    ///
    /// An exited but unreaped bundler still holds its group id, so helpers it left behind
    /// are killed too.
    pub async fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            self.sweep()?;
            return Ok(status);
        }
        self.kill()?;
        self.swept = true;
        let status = self.child.wait().await?;
        log::warn!("[{}] Stopped bundler", self.id);
        Ok(self.record(status))
    }

    /// Captured standard error of the bundler, for logs.
    pub async fn diagnostics(&mut self) -> String {
        let handle = match self.stderr.take() {
            Some(handle) => handle,
            None => return String::new(),
        };
        match time::timeout(DIAGNOSTICS_GRACE, handle).await {
            Ok(Ok(captured)) => String::from_utf8_lossy(&captured).trim().to_owned(),
            _ => String::new(),
        }
    }

    async fn abandon(&mut self) {
        if let Err(err) = self.terminate().await {
            log::error!("[{}] Cannot stop bundler: {}", self.id, err);
        }
    }

    fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(|status| self.record(status)))
    }

    fn record(&mut self, status: ExitStatus) -> ExitStatus {
        log::debug!("[{}] Bundler exited with {}", self.id, status);
        self.status = Some(status);
        status
    }

    #[cfg(unix)]
    fn kill(&mut self) -> io::Result<()> {
        match self.pgid {
            Some(pgid) => kill_group(pgid),
            None => self.child.start_kill(),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Kills what is left of the group of an exited bundler. Only done once: the group id
    /// may be reused after that.
    #[cfg(unix)]
    fn sweep(&mut self) -> io::Result<()> {
        if self.swept {
            return Ok(());
        }
        self.swept = true;
        self.pgid.map_or(Ok(()), kill_group)
    }

    #[cfg(not(unix))]
    fn sweep(&mut self) -> io::Result<()> {
        self.swept = true;
        Ok(())
    }
}

// The group id stays allocated while any member is alive.
#[cfg(unix)]
fn kill_group(pgid: i32) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

impl Drop for CompressionJob {
    fn drop(&mut self) {
        if self.status.is_none() {
            match self.kill() {
                Ok(()) => log::warn!("[{}] Killed bundler left running", self.id),
                Err(err) => log::error!("[{}] Cannot kill bundler: {}", self.id, err),
            }
        } else if let Err(err) = self.sweep() {
            log::error!("[{}] Cannot kill bundler helpers: {}", self.id, err);
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}

fn capture(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Err(err) = (&mut stderr)
            .take(STDERR_CAPTURE_LIMIT)
            .read_to_end(&mut captured)
            .await
        {
            log::debug!("Cannot read bundler error output: {}", err);
            return captured;
        }
        // Keep draining so a verbose bundler never blocks on a full pipe.
        let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        captured
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::{ffi::OsString, os::unix::process::ExitStatusExt, time::Duration};

    use super::{Bundler, CompressionJob};
    use crate::archive::testing::{is_alive, read_pid, wait_gone, Sandbox, ZIP_SCRIPT};
    use crate::archive::Identifier;
    use crate::error::Error;

    fn identifier(s: &str) -> Identifier {
        s.parse().unwrap()
    }

    async fn read_all(job: &mut CompressionJob) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = job.read_chunk(1024).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn argument_vector() {
        assert_eq!(
            Bundler::new("zip").args(&identifier("album; rm -rf ~")),
            ["-r", "-q", "-", "album; rm -rf ~"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn arguments_and_working_directory() {
        let sandbox = Sandbox::new();
        sandbox.album("album $(touch pwned)");
        let bundler = Bundler::shell(r#"pwd; printf '%s\n' "$@""#);

        let mut job = CompressionJob::start(
            &bundler,
            &sandbox.root(),
            &identifier("album $(touch pwned)"),
        )
        .unwrap();
        let output = String::from_utf8(read_all(&mut job).await).unwrap();
        let mut lines = output.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            std::fs::canonicalize(sandbox.root()).unwrap()
        );
        assert_eq!(
            lines.collect::<Vec<_>>(),
            ["-r", "-q", "-", "album $(touch pwned)"]
        );
        assert!(job.finish(Duration::from_secs(5)).await.unwrap().success());
        assert!(!sandbox.root().join("pwned").exists());
    }

    #[tokio::test]
    async fn missing_program() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        assert!(matches!(
            CompressionJob::start(
                &Bundler::new("/nonexistent/bin/zip"),
                &sandbox.root(),
                &identifier("album"),
            ),
            Err(Error::ProcessStart)
        ));
    }

    #[tokio::test]
    async fn probe_output() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let mut job =
            CompressionJob::start(&Bundler::shell(ZIP_SCRIPT), &sandbox.root(), &identifier("album"))
                .unwrap();
        let head = job.probe(1024).await.unwrap();
        assert!(head.starts_with(b"PK\x03\x04"));
        assert!(head.len() <= 1024);
        job.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler = Bundler::shell("echo 'zip error: Nothing to do!' >&2; exit 12");
        let mut job =
            CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        assert!(matches!(job.probe(1024).await, Err(Error::ProcessExecution)));
        assert_eq!(job.status.and_then(|s| s.code()), Some(12));
    }

    #[tokio::test]
    async fn probe_empty_success() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let mut job =
            CompressionJob::start(&Bundler::shell("exit 0"), &sandbox.root(), &identifier("album"))
                .unwrap();
        assert!(job.probe(1024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn diagnostics() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler = Bundler::shell("echo 'zip warning: name not matched' >&2; exit 12");
        let mut job =
            CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        let status = job.finish(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code(), Some(12));
        assert_eq!(job.diagnostics().await, "zip warning: name not matched");
        assert_eq!(job.diagnostics().await, "");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_process_group() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler = Bundler::shell("sleep 300 & echo $! > helper.pid; exec sleep 300");
        let mut job =
            CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        let pid = job.pid().unwrap() as i32;
        let helper = read_pid(&sandbox.root().join("helper.pid")).await;
        assert!(is_alive(pid));
        assert!(is_alive(helper));

        let status = job.terminate().await.unwrap();
        assert_eq!(status.signal(), Some(9));
        assert!(wait_gone(pid).await);
        assert!(wait_gone(helper).await);

        // Idempotent.
        assert_eq!(job.terminate().await.unwrap(), status);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn finish_lingering() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler = Bundler::shell("printf 'PK'; exec >&-; exec sleep 300");
        let mut job =
            CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        let pid = job.pid().unwrap() as i32;
        assert_eq!(read_all(&mut job).await, b"PK");

        let status = job.finish(Duration::from_millis(200)).await.unwrap();
        assert!(!status.success());
        assert!(wait_gone(pid).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn finish_kills_helpers() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler =
            Bundler::shell(r"sleep 300 >/dev/null 2>&1 & echo $! > helper.pid; printf 'PK\003\004'");
        let mut job =
            CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        let helper = read_pid(&sandbox.root().join("helper.pid")).await;
        assert_eq!(read_all(&mut job).await, b"PK\x03\x04");

        assert!(job.finish(Duration::from_secs(5)).await.unwrap().success());
        assert!(wait_gone(helper).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn drop_kills_group() {
        let sandbox = Sandbox::new();
        sandbox.album("album");
        let bundler = Bundler::shell("sleep 300 & echo $! > helper.pid; exec sleep 300");
        let job = CompressionJob::start(&bundler, &sandbox.root(), &identifier("album")).unwrap();
        let helper = read_pid(&sandbox.root().join("helper.pid")).await;

        drop(job);
        assert!(wait_gone(helper).await);
    }
}
