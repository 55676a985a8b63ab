use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::io::{BufRead, BufReader, PipeReader, PipeWriter};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

/// How many trailing stderr bytes of a child are kept for error messages
const STDERR_TAIL: usize = 8 * 1024;

pub type FailureMapper = Box<dyn Fn(StageFailure) -> Error + Send>;

/// Everything known about a subprocess stage that did not exit successfully.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Arc<str>,
    pub status: Option<ExitStatus>,
    pub stderr: String,
    pub io: Option<std::io::Error>,
    pub killed: bool,
}

impl Display for StageFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stage)?;
        match (&self.status, &self.io) {
            (_, Some(e)) => write!(f, " could not run: {e}")?,
            (Some(status), None) => write!(f, " exited with {status}")?,
            (None, None) => write!(f, " did not finish")?,
        }
        if self.killed {
            write!(f, " (terminated after pipeline failure)")?;
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, "\n{}", indent::indent_all_with("  ", stderr))?;
        }
        Ok(())
    }
}

/// A pipeline stage backed by a subprocess.
///
/// Stdin and stdout are wired to pipe ends by the pipeline, stderr is captured.
/// `guard` is dropped only after the child has been reaped.
pub struct ProcessStage {
    name: Arc<str>,
    command: Command,
    on_failure: FailureMapper,
    guard: Option<Box<dyn Send>>,
}

impl Debug for ProcessStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStage")
            .field("name", &self.name)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl ProcessStage {
    pub fn new<N, F>(name: N, command: Command, on_failure: F) -> Self
    where
        N: Into<Arc<str>>,
        F: Fn(StageFailure) -> Error + Send + 'static,
    {
        Self {
            name: name.into(),
            command,
            on_failure: Box::new(on_failure),
            guard: None,
        }
    }

    /// Keeps `guard` alive until the child exits.
    pub fn holding<G: Send + 'static>(mut self, guard: G) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub(super) fn spawn(
        self,
        input: Option<PipeReader>,
        output: PipeWriter,
    ) -> Result<RunningProcess> {
        let ProcessStage {
            name,
            mut command,
            on_failure,
            guard,
        } = self;

        command
            .stdin(input.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped());

        tracing::debug!("Spawning stage {}: {:?}", name, command);
        let spawned = command.spawn();
        // the command owns our copies of the pipe ends; close them now
        drop(command);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(on_failure(StageFailure {
                    stage: name,
                    status: None,
                    stderr: String::new(),
                    io: Some(e),
                    killed: false,
                }))
            }
        };

        let stderr = child
            .stderr
            .take()
            .map(|stderr| capture_stderr(name.clone(), stderr))
            .transpose()?;

        Ok(RunningProcess {
            name,
            child,
            stderr,
            on_failure,
            guard,
            killed: false,
        })
    }
}

pub(super) struct RunningProcess {
    name: Arc<str>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    on_failure: FailureMapper,
    guard: Option<Box<dyn Send>>,
    killed: bool,
}

impl RunningProcess {
    /// Sends a kill signal unless the child already exited.
    pub(super) fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        match self.child.kill() {
            Ok(_) => {
                tracing::info!("Terminated stage {} (pid {})", self.name, self.child.id());
                self.killed = true;
            }
            Err(e) => tracing::warn!("Failed to terminate stage {}: {e}", self.name),
        }
    }

    /// Reaps the child and maps a non-success exit through the stage's mapper.
    pub(super) fn wait(mut self) -> Result<()> {
        let status = self.child.wait();
        let stderr = self
            .stderr
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default();
        drop(self.guard.take());

        let (status, io) = match status {
            Ok(status) if status.success() => {
                tracing::debug!("Stage {} finished", self.name);
                return Ok(());
            }
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e)),
        };

        Err((self.on_failure)(StageFailure {
            stage: self.name,
            status,
            stderr,
            io,
            killed: self.killed,
        }))
    }
}

fn capture_stderr(name: Arc<str>, stderr: ChildStderr) -> Result<JoinHandle<String>> {
    std::thread::Builder::new()
        .name(format!("{name}-stderr"))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        tracing::debug!("[{}] {}", name, String::from_utf8_lossy(&line).trim_end());
                        tail.extend(line.iter());
                        let overflow = tail.len().saturating_sub(STDERR_TAIL);
                        tail.drain(..overflow);
                    }
                    Err(e) => {
                        tracing::warn!("Reading stderr of stage {} failed: {e}", name);
                        break;
                    }
                }
            }
            String::from_utf8_lossy(tail.make_contiguous()).into_owned()
        })
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(status: Option<ExitStatus>, stderr: &str, killed: bool) -> StageFailure {
        StageFailure {
            stage: "tar".into(),
            status,
            stderr: stderr.to_string(),
            io: None,
            killed,
        }
    }

    #[test]
    fn test_stage_failure_display_includes_stderr() {
        let status = Command::new("false").status().ok();
        let text = failure(status, "tar: vm1: Cannot stat\n", false).to_string();
        assert!(text.starts_with("tar"));
        assert!(text.contains("Cannot stat"));
        assert!(!text.contains("terminated"));
    }

    #[test]
    fn test_stage_failure_display_marks_killed() {
        let text = failure(None, "", true).to_string();
        assert!(text.contains("did not finish"));
        assert!(text.contains("terminated after pipeline failure"));
    }

    #[test]
    fn test_spawn_missing_executable_goes_through_mapper() {
        let stage = ProcessStage::new(
            "ghost",
            Command::new("/nonexistent/definitely-not-here"),
            |f| Error::ArchiveRead(f.to_string()),
        );
        let (_reader, writer) = std::io::pipe().unwrap();
        let err = stage.spawn(None, writer).err().unwrap();
        match err {
            Error::ArchiveRead(msg) => assert!(msg.contains("could not run")),
            e => panic!("Expected ArchiveRead, got {e}"),
        }
    }
}
