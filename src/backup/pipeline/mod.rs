//! Streaming pipeline of concurrently running stages.
//!
//! A pipeline is one producer followed by zero or more transforms, all
//! connected by OS pipes, and drained by a [`Sink`] on the calling thread.
//! Pipe buffers are bounded, so a slow sink blocks the producer instead of
//! letting the whole stream pile up in memory.
//!
//! The sink is two-phase: [`Sink::consume`] reads the stream to its end, and
//! only once every stage has exited successfully is [`Sink::commit`] called.
//! Otherwise [`Sink::abandon`] is called and the failure is returned.

pub mod process;
pub mod progress;

use crate::backup::pipeline::process::{ProcessStage, RunningProcess};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use derive_more::From;
use std::fmt::{Debug, Formatter};
use std::io::{PipeReader, PipeWriter, Read};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type Task = Box<dyn FnOnce(Option<PipeReader>, PipeWriter) -> Result<()> + Send>;

/// A pipeline stage running as a named thread in this process.
pub struct TaskStage {
    name: Arc<str>,
    task: Task,
}

impl TaskStage {
    pub fn new<N, F>(name: N, task: F) -> Self
    where
        N: Into<Arc<str>>,
        F: FnOnce(Option<PipeReader>, PipeWriter) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            task: Box::new(task),
        }
    }

    fn spawn(self, input: Option<PipeReader>, output: PipeWriter) -> Result<RunningTask> {
        let TaskStage { name, task } = self;
        tracing::debug!("Starting stage {}", name);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || task(input, output))?;
        Ok(RunningTask { name, handle })
    }
}

impl Debug for TaskStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct RunningTask {
    name: Arc<str>,
    handle: JoinHandle<Result<()>>,
}

impl RunningTask {
    fn wait(self) -> Result<()> {
        let name = self.name;
        self.handle
            .join()
            .map_err(|_| Error::StagePanicked(name.clone()))?
            .with_msg(format!("Stage {name} failed"))
    }
}

#[derive(Debug, From)]
pub enum Stage {
    Process(ProcessStage),
    Task(TaskStage),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::Process(p) => p.name(),
            Stage::Task(t) => &t.name,
        }
    }

    fn start(self, input: Option<PipeReader>, output: PipeWriter) -> Result<Running> {
        match self {
            Stage::Process(p) => p.spawn(input, output).map(Running::Process),
            Stage::Task(t) => t.spawn(input, output).map(Running::Task),
        }
    }
}

enum Running {
    Process(RunningProcess),
    Task(RunningTask),
}

impl Running {
    /// Subprocesses get a kill signal; threads stop on their own once their pipes close.
    fn terminate(&mut self) {
        if let Running::Process(p) = self {
            p.terminate()
        }
    }

    fn wait(self) -> Result<()> {
        match self {
            Running::Process(p) => p.wait(),
            Running::Task(t) => t.wait(),
        }
    }
}

/// Forward-only view of a pipeline's output.
///
/// Implements [`Read`] and never `Seek`, so a sink cannot depend on rewinding.
#[derive(Debug)]
pub struct StreamReader {
    inner: PipeReader,
    bytes_read: u64,
}

impl StreamReader {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Final consumer of a pipeline.
pub trait Sink {
    type Output;

    /// Reads the stream to its end. Must not make the result durable yet.
    fn consume(&mut self, input: &mut StreamReader) -> Result<()>;

    /// Called once every stage has exited successfully.
    fn commit(self) -> Result<Self::Output>;

    /// Called instead of `commit` when anything failed. Releases all resources.
    fn abandon(self);
}

#[derive(Debug)]
pub struct Pipeline {
    producer: Stage,
    transforms: Vec<Stage>,
}

impl Pipeline {
    pub fn new<S: Into<Stage>>(producer: S) -> Self {
        Self {
            producer: producer.into(),
            transforms: Vec::new(),
        }
    }

    pub fn then<S: Into<Stage>>(mut self, stage: S) -> Self {
        self.transforms.push(stage.into());
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        std::iter::once(&self.producer)
            .chain(self.transforms.iter())
            .map(Stage::name)
            .collect()
    }

    /// Starts every stage, drains the output into `sink` and waits for all stages.
    ///
    /// A sink failure is the primary error. Otherwise the most downstream failing
    /// stage is, because upstream stages only see a downstream failure as a broken
    /// pipe. Remaining failures are chained behind it.
    pub fn run<S: Sink>(self, mut sink: S) -> Result<S::Output> {
        tracing::info!("Starting pipeline: {}", self.stage_names().join(" | "));
        let mut running = Vec::with_capacity(1 + self.transforms.len());

        let mut output = match start_stage(self.producer, None, &mut running) {
            Ok(reader) => reader,
            Err(e) => {
                sink.abandon();
                return Err(teardown(running, e));
            }
        };
        for stage in self.transforms {
            output = match start_stage(stage, Some(output), &mut running) {
                Ok(reader) => reader,
                Err(e) => {
                    sink.abandon();
                    return Err(teardown(running, e));
                }
            };
        }

        let mut stream = StreamReader {
            inner: output,
            bytes_read: 0,
        };
        let consumed = sink.consume(&mut stream);
        let total = stream.bytes_read();
        if consumed.is_err() {
            running.iter_mut().for_each(Running::terminate);
        }
        drop(stream);

        let stage_errors: Vec<Error> = running
            .into_iter()
            .rev()
            .filter_map(|r| r.wait().err())
            .collect();

        match consumed {
            Ok(()) if stage_errors.is_empty() => {
                tracing::info!("Pipeline produced {} bytes", total);
                sink.commit()
            }
            Ok(()) => {
                sink.abandon();
                Err(Error::from(stage_errors))
            }
            Err(e) => {
                sink.abandon();
                Err(stage_errors.into_iter().fold(e, Error::chain))
            }
        }
    }
}

fn start_stage(
    stage: Stage,
    input: Option<PipeReader>,
    running: &mut Vec<Running>,
) -> Result<PipeReader> {
    let (reader, writer) = std::io::pipe()?;
    running.push(stage.start(input, writer)?);
    Ok(reader)
}

/// Stops and reaps everything already started, keeping `cause` as the primary error.
fn teardown(mut running: Vec<Running>, cause: Error) -> Error {
    running.iter_mut().for_each(Running::terminate);
    running
        .into_iter()
        .rev()
        .filter_map(|r| r.wait().err())
        .fold(cause, Error::chain)
}
