//! Local process backend — compile and run with host toolchains.
//!
//! DESIGN
//! ======
//! Each run gets a fresh scratch directory under `EXEC_WORK_DIR`. Compiled
//! languages run their compiler first; a failed compile streams the
//! compiler's stderr and exits with its status. The program then runs with
//! piped stdio: two reader tasks forward stdout/stderr in arrival order and a
//! writer task feeds interactive stdin lines. The run is killed on cancel or
//! when the wall-clock limit elapses. `Exited` is sent only after both
//! readers drain, so it is always the last event.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{ExecError, ExecEvent, ExecRequest, ExecutionBackend, ExecutionHandle, OutputStream};
use crate::config::ExecConfig;

const OUTPUT_CHUNK_BYTES: usize = 1024;
const EVENT_QUEUE_CAPACITY: usize = 256;
const STDIN_QUEUE_CAPACITY: usize = 16;
const READER_DRAIN_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// TOOLCHAINS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Toolchain {
    source: &'static str,
    compile: Option<Invocation>,
    run: Invocation,
}

/// Program plus arguments, run inside the scratch directory.
type Invocation = (&'static str, &'static [&'static str]);

fn toolchain(language: &str) -> Option<Toolchain> {
    match language.trim().to_ascii_lowercase().as_str() {
        "cpp" | "c++" => Some(Toolchain {
            source: "main.cpp",
            compile: Some(("g++", &["main.cpp", "-o", "main"])),
            run: ("./main", &[]),
        }),
        "c" => Some(Toolchain {
            source: "main.c",
            compile: Some(("gcc", &["main.c", "-o", "main"])),
            run: ("./main", &[]),
        }),
        "python" | "python3" | "py" => Some(Toolchain {
            source: "main.py",
            compile: None,
            run: ("python3", &["-u", "main.py"]),
        }),
        "javascript" | "js" | "node" => Some(Toolchain {
            source: "main.js",
            compile: None,
            run: ("node", &["main.js"]),
        }),
        _ => None,
    }
}

// =============================================================================
// BACKEND
// =============================================================================

pub struct ProcessBackend {
    config: ExecConfig,
}

impl ProcessBackend {
    #[must_use]
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn execute(&self, request: ExecRequest) -> Result<ExecutionHandle, ExecError> {
        let Some(toolchain) = toolchain(&request.language) else {
            return Err(ExecError::UnsupportedLanguage(request.language));
        };

        let workdir = self.config.work_dir.join(format!("codecollab-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&workdir).await?;
        if let Err(e) = tokio::fs::write(workdir.join(toolchain.source), &request.code).await {
            remove_workdir(&workdir).await;
            return Err(e.into());
        }

        let (event_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (stdin, stdin_rx) = mpsc::channel(STDIN_QUEUE_CAPACITY);
        let (cancel, cancel_rx) = oneshot::channel();

        let run = Run {
            toolchain,
            workdir,
            initial_stdin: request.stdin,
            deadline: Instant::now() + self.config.timeout,
        };
        info!(language = %request.language, workdir = %run.workdir.display(), "exec: run started");
        tokio::spawn(run.drive(event_tx, stdin_rx, cancel_rx));

        Ok(ExecutionHandle { events, stdin, cancel })
    }
}

// =============================================================================
// RUN
// =============================================================================

enum Stop {
    Exited(Option<i32>),
    Cancelled,
    TimedOut,
}

struct Run {
    toolchain: Toolchain,
    workdir: PathBuf,
    initial_stdin: Option<String>,
    deadline: Instant,
}

impl Run {
    async fn drive(
        self,
        events: mpsc::Sender<ExecEvent>,
        stdin_rx: mpsc::Receiver<String>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let code = self.compile_and_run(&events, stdin_rx, &mut cancel_rx).await;
        let _ = events.send(ExecEvent::Exited { code }).await;
        remove_workdir(&self.workdir).await;
        info!(?code, workdir = %self.workdir.display(), "exec: run finished");
    }

    async fn compile_and_run(
        &self,
        events: &mpsc::Sender<ExecEvent>,
        stdin_rx: mpsc::Receiver<String>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> Option<i32> {
        if let Some(compile) = self.toolchain.compile {
            let mut compiler = command(compile, &self.workdir);
            let output = tokio::select! {
                out = compiler.output() => out,
                _ = &mut *cancel_rx => return None,
                () = tokio::time::sleep_until(self.deadline) => {
                    let _ = events.send(ExecEvent::stderr("Compilation timed out.\n")).await;
                    return None;
                }
            };
            match output {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    let _ = events.send(ExecEvent::stderr(stderr)).await;
                    return output.status.code();
                }
                Err(e) => {
                    let _ = events
                        .send(ExecEvent::stderr(format!("Failed to start compiler: {e}\n")))
                        .await;
                    return None;
                }
            }
        }

        let spawned = command(self.toolchain.run, &self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = events
                    .send(ExecEvent::stderr(format!("Failed to start program: {e}\n")))
                    .await;
                return None;
            }
        };

        let readers = [
            spawn_reader(child.stdout.take(), OutputStream::Stdout, events.clone()),
            spawn_reader(child.stderr.take(), OutputStream::Stderr, events.clone()),
        ];
        let writer = tokio::spawn(pump_stdin(child.stdin.take(), self.initial_stdin.clone(), stdin_rx));

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status.ok().and_then(|s| s.code())),
            _ = &mut *cancel_rx => Stop::Cancelled,
            () = tokio::time::sleep_until(self.deadline) => Stop::TimedOut,
        };
        let code = match stop {
            Stop::Exited(code) => code,
            Stop::Cancelled => {
                let _ = child.kill().await;
                None
            }
            Stop::TimedOut => {
                let _ = child.kill().await;
                let _ = events.send(ExecEvent::stderr("\nTime limit exceeded.\n")).await;
                None
            }
        };

        writer.abort();
        for reader in readers {
            if tokio::time::timeout(READER_DRAIN_GRACE, reader).await.is_err() {
                warn!(workdir = %self.workdir.display(), "exec: output reader did not drain");
            }
        }
        code
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn command((program, args): Invocation, workdir: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir).kill_on_drop(true);
    cmd
}

fn spawn_reader<R>(pipe: Option<R>, stream: OutputStream, events: mpsc::Sender<ExecEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = vec![0_u8; OUTPUT_CHUNK_BYTES];
        let mut pending = Vec::with_capacity(OUTPUT_CHUNK_BYTES + 4);
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let chunk = take_utf8(&mut pending);
                    if chunk.is_empty() {
                        continue;
                    }
                    if events.send(ExecEvent::output(stream, chunk)).await.is_err() {
                        return;
                    }
                }
            }
        }
        // A truncated sequence at EOF can never complete.
        if !pending.is_empty() {
            let chunk = String::from_utf8_lossy(&pending).into_owned();
            let _ = events.send(ExecEvent::output(stream, chunk)).await;
        }
    })
}

/// Decode the longest complete UTF-8 prefix of `pending`, leaving an
/// unfinished trailing sequence in place for the next read. Invalid bytes
/// become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

async fn pump_stdin(stdin: Option<ChildStdin>, initial: Option<String>, mut lines: mpsc::Receiver<String>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if let Some(initial) = initial {
        if stdin.write_all(initial.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            return;
        }
    }
    while let Some(line) = lines.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn remove_workdir(workdir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
        warn!(error = %e, workdir = %workdir.display(), "exec: failed to remove scratch dir");
    }
}
