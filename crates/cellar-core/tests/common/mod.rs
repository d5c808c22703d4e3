//! Shared helpers for cellar-core integration tests.
//!
//! `ToyProvider` starts in-process kernels for a tiny line-based language:
//!
//! ```text
//! a = 1                  assign
//! print(a) / print('x')  write a variable or literal to stdout
//! warn('x')              write a literal to stderr
//! a                      display a variable (NameError if undefined)
//! raise ValueError('x')  raise
//! sleep                  never finishes (times out)
//! write('f.png', 'xyz')  create a file in the working directory
//! crash                  kill the connection
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cellar_core::kernel::{KernelLaunch, KernelProvider, KernelSession};
use cellar_core::notebook::{Notebook, Output};
use cellar_core::{CellException, KernelError};
use serde_json::{Value, json};

pub const TOY_KERNEL: &str = "toy";

/// Starts [`ToyKernel`]s and counts what they do.
#[derive(Debug, Default)]
pub struct ToyProvider {
    starts: AtomicUsize,
    executions: Arc<AtomicUsize>,
    evaluations: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl ToyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cells executed across all kernels.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl KernelProvider for ToyProvider {
    fn start(&self, launch: &KernelLaunch<'_>) -> Result<Box<dyn KernelSession>, KernelError> {
        if launch.kernel_name != TOY_KERNEL {
            return Err(KernelError::Start {
                kernel: launch.kernel_name.to_string(),
                reason: "no such kernel installed".to_string(),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ToyKernel {
            cwd: launch.cwd.to_path_buf(),
            vars: HashMap::new(),
            language_info: json!({"name": "toy", "file_extension": ".toy"}),
            executions: self.executions.clone(),
            evaluations: self.evaluations.clone(),
            shutdowns: self.shutdowns.clone(),
            closed: false,
        }))
    }
}

pub struct ToyKernel {
    cwd: PathBuf,
    vars: HashMap<String, String>,
    language_info: Value,
    executions: Arc<AtomicUsize>,
    evaluations: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    closed: bool,
}

impl ToyKernel {
    fn run(&mut self, source: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        let mut outputs = Vec::new();
        for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.run_line(line, timeout, &mut outputs)?;
        }
        Ok(outputs)
    }

    fn run_line(&mut self, line: &str, timeout: Option<Duration>, outputs: &mut Vec<Output>) -> Result<(), KernelError> {
        if line == "crash" {
            return Err(KernelError::Communication("kernel exited unexpectedly".to_string()));
        }
        if line == "sleep" {
            return Err(KernelError::CellTimeout {
                timeout: timeout.unwrap_or(Duration::from_secs(3600)),
                outputs: outputs.clone(),
            });
        }
        if let Some(rest) = call(line, "raise ") {
            let (ename, evalue) = rest.split_once('(').unwrap_or((rest, ""));
            return Err(self.exception(ename, &literal(evalue.trim_end_matches(')')), outputs));
        }
        if let Some(arg) = call(line, "print(").and_then(|a| a.strip_suffix(')')) {
            let text = self.value_of(arg, outputs)?;
            outputs.push(Output::stdout(format!("{}\n", text)));
            return Ok(());
        }
        if let Some(arg) = call(line, "warn(").and_then(|a| a.strip_suffix(')')) {
            outputs.push(Output::stderr(format!("{}\n", literal(arg))));
            return Ok(());
        }
        if let Some(args) = call(line, "write(").and_then(|a| a.strip_suffix(')')) {
            let (path, content) = args.split_once(',').unwrap_or((args, ""));
            let target = self.cwd.join(literal(path));
            if let Some(parent) = target.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(&target, literal(content))
                .map_err(|e| self.exception("OSError", &e.to_string(), outputs))?;
            return Ok(());
        }
        if let Some((name, value)) = line.split_once('=') {
            let value = self.value_of(value.trim(), outputs)?;
            self.vars.insert(name.trim().to_string(), value);
            return Ok(());
        }

        let value = self.value_of(line, outputs)?;
        outputs.push(Output::ExecuteResult {
            execution_count: None,
            data: [("text/plain".to_string(), json!(value))].into(),
            metadata: Default::default(),
        });
        Ok(())
    }

    fn value_of(&self, expr: &str, outputs: &[Output]) -> Result<String, KernelError> {
        let expr = expr.trim();
        if expr.starts_with('\'') || expr.starts_with('"') || expr.parse::<f64>().is_ok() {
            return Ok(literal(expr));
        }
        self.vars.get(expr).cloned().ok_or_else(|| {
            self.exception("NameError", &format!("name '{}' is not defined", expr), outputs)
        })
    }

    fn exception(&self, ename: &str, evalue: &str, outputs: &[Output]) -> KernelError {
        let traceback = vec![format!("Traceback: {}: {}", ename, evalue)];
        let mut outputs = outputs.to_vec();
        outputs.push(Output::error(ename, evalue, traceback.clone()));
        KernelError::CellExecution(Box::new(CellException {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback,
            outputs,
        }))
    }
}

impl KernelSession for ToyKernel {
    fn language_info(&self) -> Option<&Value> {
        Some(&self.language_info)
    }

    fn execute_cell(&mut self, source: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.run(source, timeout)
    }

    fn evaluate(&mut self, expression: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.run(expression, timeout)
    }

    fn shutdown(&mut self) -> Result<(), KernelError> {
        if !self.closed {
            self.closed = true;
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn call<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)
}

fn literal(text: &str) -> String {
    text.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}

/// A notebook for the toy kernel.
pub fn toy_notebook(sources: &[&str]) -> Notebook {
    Notebook::with_code_cells(TOY_KERNEL, sources.iter().copied())
}

/// Outputs of the code cell at `index` (counting code cells only).
pub fn code_outputs(notebook: &Notebook, index: usize) -> (Option<u32>, Vec<Output>) {
    let (_, cell) = notebook
        .code_cells()
        .nth(index)
        .expect("code cell index out of range");
    (cell.execution_count, cell.outputs.clone())
}

/// A scratch project: a source dir holding notebooks, plus a cache dir.
pub struct Project {
    pub root: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        let root = tempfile::TempDir::new().expect("create temp dir");
        fs::create_dir_all(root.path().join("docs")).expect("create docs dir");
        Self { root }
    }

    pub fn docs(&self) -> PathBuf {
        self.root.path().join("docs")
    }

    pub fn cache(&self) -> PathBuf {
        self.root.path().join("cache")
    }

    pub fn notebook_path(&self, name: &str) -> PathBuf {
        self.docs().join(format!("{}.ipynb", name))
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }
}
