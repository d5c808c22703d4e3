//! Process-backed kernel client.
//!
//! Each session owns one kernel child process speaking the JSON-lines
//! protocol over stdin/stdout. A background thread reads stdout and forwards
//! messages over a channel, which gives the blocking `execute_cell` call a
//! deadline without any cooperation from the kernel.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{CellException, KernelError};
use crate::notebook::Output;

use super::protocol::{KernelCommand, KernelMessage, ReplyStatus, read_message, write_message};
use super::spec::{InstalledKernel, KernelRegistry};
use super::{KernelLaunch, KernelProvider, KernelSession};

/// How long a freshly spawned kernel has to answer `kernel_info`.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an interrupted kernel has to return to idle before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// How long a kernel has to exit after `shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type MessageResult = Result<Option<KernelMessage>, KernelError>;

/// Starts kernels installed as kernelspecs.
#[derive(Debug, Clone)]
pub struct ProcessKernelProvider {
    registry: KernelRegistry,
}

impl ProcessKernelProvider {
    /// Create a provider over the given registry.
    pub fn new(registry: KernelRegistry) -> Self {
        Self { registry }
    }

    /// The registry kernels are looked up in.
    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }
}

impl KernelProvider for ProcessKernelProvider {
    fn start(&self, launch: &KernelLaunch<'_>) -> Result<Box<dyn KernelSession>, KernelError> {
        let installed = self.registry.find(launch.kernel_name)?;
        let kernel = ProcessKernel::spawn(installed, launch.cwd)?;
        Ok(Box::new(kernel))
    }
}

/// A live kernel child process.
struct RunningKernel {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    messages: Receiver<MessageResult>,
}

impl RunningKernel {
    fn send(&mut self, command: &KernelCommand) -> Result<(), KernelError> {
        write_message(&mut self.stdin, command)
    }

    /// Wait for the next message until `deadline` (forever if `None`).
    fn recv(&self, deadline: Option<Instant>) -> Result<Option<KernelMessage>, RecvTimeoutError> {
        let result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.messages.recv_timeout(remaining)?
            }
            None => self
                .messages
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)?,
        };
        // Transport errors surface as a closed stream.
        result.map_err(|e| {
            tracing::debug!("Kernel reader failed: {}", e);
            RecvTimeoutError::Disconnected
        })
    }

    /// Ask the kernel to abandon the running request.
    fn interrupt(&self) {
        #[cfg(unix)]
        unsafe {
            // The kernel leads its own process group; signal all of it.
            libc::kill(-(self.child.id() as i32), libc::SIGINT);
        }
    }

    /// Kill the kernel and everything it spawned.
    fn kill(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(-(self.child.id() as i32), libc::SIGKILL);
        }

        if let Err(e) = self.child.kill() {
            // Already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill kernel: {}", e);
            }
        }

        // Reap the zombie
        let _ = self.child.wait();
    }
}

/// Kernel session backed by a child process.
pub struct ProcessKernel {
    kernel: InstalledKernel,
    cwd: PathBuf,
    running: Option<RunningKernel>,
    language_info: Option<Value>,
}

impl ProcessKernel {
    /// Spawn a kernel and wait for it to report its language info.
    pub fn spawn(kernel: InstalledKernel, cwd: &Path) -> Result<Self, KernelError> {
        let mut session = Self {
            kernel,
            cwd: cwd.to_path_buf(),
            running: None,
            language_info: None,
        };
        session.launch()?;
        Ok(session)
    }

    /// Name of the kernel this session runs.
    pub fn kernel_name(&self) -> &str {
        &self.kernel.name
    }

    /// Process ID of the kernel, if it is running.
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.child.id())
    }

    fn launch(&mut self) -> Result<(), KernelError> {
        let start_error = |reason: String| KernelError::Start {
            kernel: self.kernel.name.clone(),
            reason,
        };

        let argv: Vec<String> = self
            .kernel
            .spec
            .argv
            .iter()
            .map(|arg| arg.replace("{resource_dir}", &self.kernel.resource_dir.to_string_lossy()))
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(start_error("kernel.json has an empty argv".to_string()));
        };
        let program = resolve_program(program).map_err(start_error)?;

        let mut command = Command::new(&program);
        command
            .args(args)
            .current_dir(&self.cwd)
            .envs(&self.kernel.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Let kernel stderr pass through for debugging

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            start_error(format!(
                "failed to spawn '{}': {}",
                program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| start_error("failed to get kernel stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_error("failed to get kernel stdout".to_string()))?;

        let (tx, rx) = mpsc::channel::<MessageResult>();
        thread::Builder::new()
            .name(format!("kernel-{}", self.kernel.name))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    let message = read_message::<_, KernelMessage>(&mut reader);
                    let done = !matches!(message, Ok(Some(_)));
                    if tx.send(message).is_err() || done {
                        break;
                    }
                }
            })
            .map_err(|e| start_error(format!("failed to spawn reader thread: {}", e)))?;

        let mut running = RunningKernel {
            child,
            stdin: BufWriter::new(stdin),
            messages: rx,
        };

        // Verify the kernel is alive and learn its language
        let handshake = running.send(&KernelCommand::KernelInfo).and_then(|()| {
            let deadline = Some(Instant::now() + STARTUP_TIMEOUT);
            loop {
                match running.recv(deadline) {
                    Ok(Some(KernelMessage::KernelInfo { language_info })) => {
                        return Ok(language_info);
                    }
                    Ok(Some(other)) => {
                        tracing::debug!("Ignoring kernel message during startup: {:?}", other);
                    }
                    Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(start_error("kernel exited during startup".to_string()));
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(start_error(format!(
                            "no kernel_info reply within {}s",
                            STARTUP_TIMEOUT.as_secs()
                        )));
                    }
                }
            }
        });

        match handshake {
            Ok(language_info) => {
                tracing::debug!(
                    "Started kernel '{}' (pid {})",
                    self.kernel.name,
                    running.child.id()
                );
                self.language_info = (!language_info.is_null()).then_some(language_info);
                self.running = Some(running);
                Ok(())
            }
            Err(e) => {
                running.kill();
                Err(match e {
                    KernelError::Communication(reason) => start_error(reason),
                    other => other,
                })
            }
        }
    }

    fn run(
        &mut self,
        source: &str,
        silent: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<Output>, KernelError> {
        if self.running.is_none() {
            tracing::warn!(
                "Restarting kernel '{}'; state from earlier cells is lost",
                self.kernel.name
            );
            self.launch()?;
        }
        let Some(running) = self.running.as_mut() else {
            return Err(KernelError::Communication("kernel is not running".to_string()));
        };

        running.send(&KernelCommand::Execute {
            source: source.to_string(),
            silent,
        })?;

        // A deadline past what `Instant` can represent is no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut outputs = Vec::new();

        loop {
            match running.recv(deadline) {
                Ok(Some(KernelMessage::Idle { status, .. })) => {
                    return match status {
                        ReplyStatus::Ok => Ok(outputs),
                        ReplyStatus::Error => Err(exception_from(outputs)),
                    };
                }
                Ok(Some(message)) => {
                    if let Some(output) = message.into_output() {
                        outputs.push(output);
                    }
                }
                Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                    if let Some(mut running) = self.running.take() {
                        running.kill();
                    }
                    return Err(KernelError::Communication(format!(
                        "kernel '{}' exited unexpectedly",
                        self.kernel.name
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {
                    let timeout = timeout.unwrap_or_default();
                    self.recover_from_timeout();
                    return Err(KernelError::CellTimeout { timeout, outputs });
                }
            }
        }
    }

    /// Interrupt a stuck request; kill the kernel if it does not come back.
    fn recover_from_timeout(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        running.interrupt();

        let grace = Some(Instant::now() + INTERRUPT_GRACE);
        loop {
            match running.recv(grace) {
                Ok(Some(KernelMessage::Idle { .. })) => {
                    tracing::debug!("Kernel '{}' recovered from interrupt", self.kernel.name);
                    return;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }

        if let Some(mut running) = self.running.take() {
            running.kill();
        }
    }
}

impl KernelSession for ProcessKernel {
    fn language_info(&self) -> Option<&Value> {
        self.language_info.as_ref()
    }

    fn execute_cell(&mut self, source: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        self.run(source, false, timeout)
    }

    fn evaluate(&mut self, expression: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        self.run(expression, true, timeout)
    }

    fn shutdown(&mut self) -> Result<(), KernelError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        if running.send(&KernelCommand::Shutdown).is_ok() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while Instant::now() < deadline {
                match running.child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!("Kernel '{}' exited: {}", self.kernel.name, status);
                        // Clean up anything left in the process group
                        running.kill();
                        return Ok(());
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(10)),
                    Err(_) => break,
                }
            }
        }

        running.kill();
        Ok(())
    }
}

impl Drop for ProcessKernel {
    fn drop(&mut self) {
        // Ensure the kernel is killed when the session is dropped
        if let Some(mut running) = self.running.take() {
            running.kill();
        }
    }
}

/// Build the exception for a request that finished with an error status.
fn exception_from(outputs: Vec<Output>) -> KernelError {
    let reported = outputs.iter().rev().find_map(|o| match o {
        Output::Error {
            ename,
            evalue,
            traceback,
        } => Some((ename.clone(), evalue.clone(), traceback.clone())),
        _ => None,
    });

    let (ename, evalue, traceback, outputs) = match reported {
        Some((ename, evalue, traceback)) => (ename, evalue, traceback, outputs),
        None => {
            let mut outputs = outputs;
            let ename = "KernelError".to_string();
            let evalue = "kernel reported an error without details".to_string();
            outputs.push(Output::error(ename.clone(), evalue.clone(), Vec::new()));
            (ename, evalue, Vec::new(), outputs)
        }
    };

    KernelError::CellExecution(Box::new(CellException {
        ename,
        evalue,
        traceback,
        outputs,
    }))
}

/// Resolve a kernel program through PATH unless it is already a path.
fn resolve_program(program: &str) -> Result<PathBuf, String> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    which::which(program).map_err(|e| format!("'{}' not found: {}", program, e))
}
