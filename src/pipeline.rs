//! # Process Pipeline Engine
//!
//! Runs an ordered chain of external filter processes connected by OS
//! pipes, so a multi-gigabyte stream passes through every stage in a
//! single pass, and recovers the individual exit status of *every*
//! stage, not just the last one, which is all a naive process pipe
//! exposes.
//!
//! ## Mechanism
//!
//! Each command stage is spawned directly with its stdin wired to the
//! previous stage's stdout. No shell is involved, so there is no quoting
//! and no per-stage status capture file: every child's real exit status
//! comes back from `wait()`. A stage is successful iff its observed exit
//! code equals its expected code (default 0); the first failing stage in
//! declared order is reported as the offender.
//!
//! ## Stream duplication
//!
//! A digest tee stage duplicates the byte stream at one point: a thread
//! forwards every buffer to a SHA-1 hasher *and* to the next stage's
//! stdin. This is how the plaintext digest of an image is computed while
//! the same bytes continue on to compression, without reading the input
//! twice or staging it through a filesystem FIFO. The tee reports a
//! status like any other stage (0 on success, 1 if the copy failed) and
//! holds no resources that need cleaning up afterwards.
//!
//! ```text
//!  tar ──┬──> gzip -9 ──> openssl enc ──> blob
//!        └──> SHA-1
//! ```

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::constants::{BUFFER_SIZE, DIGEST_LEN};
use crate::error::{Error, Result};

/// Exit code recorded for a stage terminated by a signal.
const SIGNALED: i32 = -1;

type DigestSlot = Arc<Mutex<Option<[u8; DIGEST_LEN]>>>;

/// One stage of a pipeline: a name for reporting, what to run, and the
/// exit code that counts as success. Stages are immutable once added.
struct Stage {
    name: String,
    kind: StageKind,
    expected: i32,
}

enum StageKind {
    Command { program: String, args: Vec<String> },
    DigestTee { slot: DigestSlot },
}

/// Observed outcome of one stage after a pipeline run.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name as declared.
    pub name: String,
    /// Observed exit code ([`SIGNALED`] when killed by a signal).
    pub code: i32,
    /// Whether the observed code equals the expected code.
    pub successful: bool,
}

/// Handle onto a digest tee's result, valid after the pipeline ran.
#[derive(Clone)]
pub struct DigestHandle {
    slot: DigestSlot,
}

impl DigestHandle {
    /// Returns the binary digest, if the tee has run.
    pub fn digest(&self) -> Option<[u8; DIGEST_LEN]> {
        self.slot.lock().ok().and_then(|slot| *slot)
    }

    /// Returns the digest hex encoded, if the tee has run.
    pub fn hex_digest(&self) -> Option<String> {
        self.digest().map(hex::encode)
    }
}

/// Where the first stage reads from.
pub enum PipelineInput {
    /// No input; the first stage generates the stream itself.
    Null,
    /// Stream the named file into the first stage.
    File(PathBuf),
}

/// Where the last stage's stdout goes.
pub enum PipelineOutput {
    /// Capture it and return it from [`Pipeline::execute`] as text.
    Capture,
    /// Redirect it into the named file.
    File(PathBuf),
}

/// An ordered chain of external processes connected by pipes.
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    results: Vec<StageResult>,
}

impl Pipeline {
    /// Creates an empty pipeline with a name used in error reports.
    pub fn new(name: &str) -> Self {
        Pipeline {
            name: name.to_string(),
            stages: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Returns the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a command stage expected to exit 0.
    pub fn add(&mut self, name: &str, program: &str, args: Vec<String>) -> &mut Self {
        self.add_expecting(name, program, args, 0)
    }

    /// Appends a command stage with an explicit expected exit code.
    pub fn add_expecting(
        &mut self,
        name: &str,
        program: &str,
        args: Vec<String>,
        expected: i32,
    ) -> &mut Self {
        self.stages.push(Stage {
            name: name.to_string(),
            kind: StageKind::Command {
                program: program.to_string(),
                args,
            },
            expected,
        });
        self
    }

    /// Appends a digest tee stage and returns the handle that will hold
    /// the SHA-1 of everything that flowed through it.
    pub fn add_digest_tee(&mut self, name: &str) -> DigestHandle {
        let slot: DigestSlot = Arc::new(Mutex::new(None));
        self.stages.push(Stage {
            name: name.to_string(),
            kind: StageKind::DigestTee { slot: slot.clone() },
            expected: 0,
        });
        DigestHandle { slot }
    }

    /// Results of the most recent run, in stage order.
    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    /// The failing subset of [`Pipeline::results`].
    pub fn errors(&self) -> Vec<&StageResult> {
        self.results.iter().filter(|r| !r.successful).collect()
    }

    fn invocation_error(&self, source: io::Error) -> Error {
        Error::PipelineInvocation {
            pipeline: self.name.clone(),
            source,
        }
    }

    /// Runs every stage as one connected pipeline and blocks until all
    /// of them have exited.
    ///
    /// Returns the captured textual output of the last stage (empty when
    /// the output was redirected to a file). Fails if the pipeline could
    /// not be started, or if any stage's exit code differs from its
    /// expected code, naming the first such stage in declared order.
    pub fn execute(&mut self, input: PipelineInput, output: PipelineOutput) -> Result<String> {
        self.results.clear();
        if self.stages.is_empty() {
            return Err(self.invocation_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pipeline has no stages",
            )));
        }
        debug!("Pipeline '{}': {} stages", self.name, self.stages.len());

        enum Link {
            Null,
            InputFile(File),
            ChildOut(ChildStdout),
            PendingTee {
                index: usize,
                reader: Box<dyn Read + Send>,
                slot: DigestSlot,
            },
        }

        let mut link = match input {
            PipelineInput::Null => Link::Null,
            PipelineInput::File(path) => {
                Link::InputFile(File::open(&path).map_err(|e| self.invocation_error(e))?)
            }
        };

        let mut children: Vec<(usize, Child)> = Vec::new();
        let mut tee_threads: Vec<(usize, thread::JoinHandle<io::Result<()>>)> = Vec::new();
        let mut capture_source: Option<ChildStdout> = None;
        let mut capture_shared: Option<Arc<Mutex<Vec<u8>>>> = None;
        let last = self.stages.len() - 1;

        for (index, stage) in self.stages.iter().enumerate() {
            match &stage.kind {
                StageKind::Command { program, args } => {
                    let mut command = Command::new(program);
                    command.args(args);

                    let pending = match link {
                        Link::Null => {
                            command.stdin(Stdio::null());
                            None
                        }
                        Link::InputFile(file) => {
                            command.stdin(Stdio::from(file));
                            None
                        }
                        Link::ChildOut(out) => {
                            command.stdin(Stdio::from(out));
                            None
                        }
                        Link::PendingTee {
                            index: tee_index,
                            reader,
                            slot,
                        } => {
                            command.stdin(Stdio::piped());
                            Some((tee_index, reader, slot))
                        }
                    };

                    if index == last {
                        match &output {
                            PipelineOutput::Capture => {
                                command.stdout(Stdio::piped());
                            }
                            PipelineOutput::File(path) => {
                                let file = match File::create(path) {
                                    Ok(file) => file,
                                    Err(e) => {
                                        abort_children(&mut children);
                                        return Err(self.invocation_error(e));
                                    }
                                };
                                command.stdout(Stdio::from(file));
                            }
                        }
                    } else {
                        command.stdout(Stdio::piped());
                    }

                    let mut child = match command.spawn() {
                        Ok(child) => child,
                        Err(e) => {
                            abort_children(&mut children);
                            return Err(self.invocation_error(io::Error::new(
                                e.kind(),
                                format!("stage '{}': {e}", stage.name),
                            )));
                        }
                    };

                    if let Some((tee_index, reader, slot)) = pending {
                        let Some(stdin) = child.stdin.take() else {
                            abort_children(&mut children);
                            return Err(self.invocation_error(io::Error::other(
                                "piped stdin missing after spawn",
                            )));
                        };
                        tee_threads.push((tee_index, spawn_tee(reader, Box::new(stdin), slot)));
                    }

                    if index == last {
                        capture_source = child.stdout.take();
                        link = Link::Null;
                    } else {
                        let Some(stdout) = child.stdout.take() else {
                            abort_children(&mut children);
                            return Err(self.invocation_error(io::Error::other(
                                "piped stdout missing after spawn",
                            )));
                        };
                        link = Link::ChildOut(stdout);
                    }
                    children.push((index, child));
                }
                StageKind::DigestTee { slot } => {
                    let reader: Box<dyn Read + Send> = match link {
                        Link::Null => Box::new(io::empty()),
                        Link::InputFile(file) => Box::new(file),
                        Link::ChildOut(out) => Box::new(out),
                        Link::PendingTee { .. } => {
                            abort_children(&mut children);
                            return Err(self.invocation_error(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "adjacent digest tee stages are not supported",
                            )));
                        }
                    };
                    link = Link::PendingTee {
                        index,
                        reader,
                        slot: slot.clone(),
                    };
                }
            }
        }

        // A trailing tee has no next stage; wire it to the pipeline output.
        if let Link::PendingTee {
            index,
            reader,
            slot,
        } = link
        {
            let sink: Box<dyn Write + Send> = match &output {
                PipelineOutput::File(path) => match File::create(path) {
                    Ok(file) => Box::new(file),
                    Err(e) => {
                        abort_children(&mut children);
                        return Err(self.invocation_error(e));
                    }
                },
                PipelineOutput::Capture => {
                    let shared = Arc::new(Mutex::new(Vec::new()));
                    capture_shared = Some(shared.clone());
                    Box::new(SharedBuf(shared))
                }
            };
            tee_threads.push((index, spawn_tee(reader, sink, slot)));
        }

        // Drain the captured output first; reading to EOF drives the
        // whole chain to completion without deadlocking on full pipes.
        let mut captured = String::new();
        if let Some(mut out) = capture_source {
            let mut bytes = Vec::new();
            if let Err(e) = out.read_to_end(&mut bytes) {
                warn!("Pipeline '{}': could not read output: {e}", self.name);
            }
            captured = String::from_utf8_lossy(&bytes).into_owned();
        }

        // Collect the PIPESTATUS-equivalent: one status per stage.
        let mut codes: Vec<(usize, i32)> = Vec::with_capacity(self.stages.len());
        for (index, handle) in tee_threads {
            let code = match handle.join() {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    warn!("Pipeline '{}': digest tee failed: {e}", self.name);
                    1
                }
                Err(_) => {
                    warn!("Pipeline '{}': digest tee panicked", self.name);
                    1
                }
            };
            codes.push((index, code));
        }
        for (index, mut child) in children {
            let status = child.wait().map_err(|e| self.invocation_error(e))?;
            codes.push((index, status.code().unwrap_or(SIGNALED)));
        }
        codes.sort_by_key(|(index, _)| *index);

        self.results = codes
            .into_iter()
            .map(|(index, code)| {
                let stage = &self.stages[index];
                StageResult {
                    name: stage.name.clone(),
                    code,
                    successful: code == stage.expected,
                }
            })
            .collect();

        if let Some(position) = self.results.iter().position(|r| !r.successful) {
            let offender = &self.results[position];
            return Err(Error::PipelineStageFailed {
                pipeline: self.name.clone(),
                stage: offender.name.clone(),
                code: offender.code,
                expected: self.stages[position].expected,
            });
        }

        if let Some(shared) = capture_shared {
            if let Ok(bytes) = shared.lock() {
                captured = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        Ok(captured)
    }
}

/// Kills and reaps every already-spawned child after a setup failure.
fn abort_children(children: &mut Vec<(usize, Child)>) {
    for (_, child) in children.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Forwards every buffer from `reader` to both the hasher and `sink`.
///
/// The digest slot is filled even when the copy fails partway, so a
/// caller can still compare whatever was hashed against an expectation.
fn spawn_tee(
    mut reader: Box<dyn Read + Send>,
    mut sink: Box<dyn Write + Send>,
    slot: DigestSlot,
) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let copied = loop {
            match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    hasher.update(&buf[..n]);
                    if let Err(e) = sink.write_all(&buf[..n]) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let flushed = sink.flush();
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(hasher.finalize().into());
        }
        // Dropping the sink closes the downstream stdin so the next
        // stage sees EOF.
        drop(sink);
        copied.and(flushed)
    })
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut bytes) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            Err(_) => Err(io::Error::other("capture buffer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
