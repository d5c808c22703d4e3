//! Tests for the process-backed kernel, using a small `/bin/sh` kernel.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use cellar_core::kernel::{InstalledKernel, KernelSpecFile};
use cellar_core::{
    KernelError, KernelLaunch, KernelProvider, KernelRegistry, KernelSession, Output,
    ProcessKernel, ProcessKernelProvider,
};
use serde_json::json;
use tempfile::TempDir;

/// Answers the JSON-lines protocol by matching on the raw request line.
const SH_KERNEL: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"kernel_info"'*)
      printf '%s\n' '{"type":"kernel_info","language_info":{"name":"sh","file_extension":".sh"}}' ;;
    *'"type":"shutdown"'*)
      printf '%s\n' '{"type":"shutting_down"}'
      exit 0 ;;
    *'"source":"hang'*)
      sleep 30 ;;
    *'"source":"die'*)
      exit 3 ;;
    *'"source":"fail'*)
      printf '%s\n' '{"type":"stream","name":"stdout","text":"partial\n"}'
      printf '%s\n' '{"type":"error","ename":"RuntimeError","evalue":"bad","traceback":["tb"]}'
      printf '%s\n' '{"type":"idle","status":"error"}' ;;
    *'"source":"pwd'*)
      printf '{"type":"stream","name":"stdout","text":"%s"}\n' "$(pwd)" ;
      printf '%s\n' '{"type":"idle","status":"ok"}' ;;
    *)
      printf '%s\n' '{"type":"stream","name":"stdout","text":"hello\n"}'
      printf '%s\n' '{"type":"execute_result","data":{"text/plain":"42"},"execution_count":1}'
      printf '%s\n' '{"type":"idle","status":"ok","execution_count":1}' ;;
  esac
done
"#;

fn install_sh_kernel(dir: &Path, name: &str) {
    let resource_dir = dir.join(name);
    fs::create_dir_all(&resource_dir).unwrap();
    fs::write(resource_dir.join("kernel.sh"), SH_KERNEL).unwrap();
    let spec = KernelSpecFile {
        argv: vec!["/bin/sh".to_string(), "{resource_dir}/kernel.sh".to_string()],
        display_name: "Shell".to_string(),
        language: "sh".to_string(),
        env: Default::default(),
    };
    fs::write(
        resource_dir.join("kernel.json"),
        serde_json::to_string_pretty(&spec).unwrap(),
    )
    .unwrap();
}

fn provider(kernels: &TempDir) -> ProcessKernelProvider {
    install_sh_kernel(kernels.path(), "sh");
    ProcessKernelProvider::new(KernelRegistry::new(vec![kernels.path().to_path_buf()]))
}

#[test]
fn test_handshake_and_execute() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();
    assert_eq!(
        session.language_info(),
        Some(&json!({"name": "sh", "file_extension": ".sh"}))
    );

    let outputs = session.execute_cell("anything", Some(Duration::from_secs(10))).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0], Output::stdout("hello\n"));
    assert!(matches!(outputs[1], Output::ExecuteResult { .. }));

    session.shutdown().unwrap();
    session.shutdown().unwrap();
}

#[test]
fn test_runs_in_requested_directory() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();
    let outputs = session.execute_cell("pwd", None).unwrap();
    let Output::Stream { text, .. } = &outputs[0] else {
        panic!("expected stream output, got {:?}", outputs);
    };
    assert_eq!(
        fs::canonicalize(text).unwrap(),
        fs::canonicalize(cwd.path()).unwrap()
    );
    session.shutdown().unwrap();
}

#[test]
fn test_error_status_is_cell_execution() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();
    let exc = match session.execute_cell("fail", None) {
        Err(KernelError::CellExecution(exc)) => exc,
        other => panic!("expected cell execution error, got {:?}", other),
    };
    assert_eq!(exc.ename, "RuntimeError");
    assert_eq!(exc.traceback, vec!["tb".to_string()]);
    assert_eq!(exc.outputs.len(), 2);
    assert_eq!(exc.outputs[0], Output::stdout("partial\n"));

    // The kernel is still usable.
    assert!(session.execute_cell("again", None).is_ok());
    session.shutdown().unwrap();
}

#[test]
fn test_timeout_then_restart() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();

    let started = Instant::now();
    let err = session
        .execute_cell("hang", Some(Duration::from_millis(300)))
        .unwrap_err();
    assert!(matches!(err, KernelError::CellTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));

    let outputs = session.execute_cell("after", Some(Duration::from_secs(10))).unwrap();
    assert_eq!(outputs[0], Output::stdout("hello\n"));
    session.shutdown().unwrap();
}

#[test]
fn test_oversized_timeout_means_no_deadline() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();
    let outputs = session
        .execute_cell("echo", Some(Duration::from_secs(i64::MAX as u64)))
        .unwrap();
    assert_eq!(outputs[0], Output::stdout("hello\n"));
    session.shutdown().unwrap();
}

#[test]
fn test_kernel_exit_is_communication_error() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let mut session = provider
        .start(&KernelLaunch {
            kernel_name: "sh",
            cwd: cwd.path(),
        })
        .unwrap();
    let err = session.execute_cell("die", Some(Duration::from_secs(10))).unwrap_err();
    assert!(matches!(err, KernelError::Communication(_)));
    session.shutdown().unwrap();
}

#[test]
fn test_unknown_kernel_is_start_error() {
    let kernels = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let provider = provider(&kernels);

    let err = provider
        .start(&KernelLaunch {
            kernel_name: "julia-1.10",
            cwd: cwd.path(),
        })
        .err()
        .unwrap();
    assert!(matches!(err, KernelError::Start { ref kernel, .. } if kernel == "julia-1.10"));
}

#[test]
fn test_empty_argv_is_start_error() {
    let cwd = TempDir::new().unwrap();
    let kernel = InstalledKernel {
        name: "hollow".to_string(),
        resource_dir: cwd.path().to_path_buf(),
        spec: KernelSpecFile {
            argv: Vec::new(),
            display_name: "Hollow".to_string(),
            language: "none".to_string(),
            env: Default::default(),
        },
    };

    match ProcessKernel::spawn(kernel, cwd.path()) {
        Err(KernelError::Start { kernel, reason }) => {
            assert_eq!(kernel, "hollow");
            assert!(reason.contains("empty argv"));
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("a kernel without argv must not start"),
    }
}

#[test]
fn test_registry_lists_installed_kernels() {
    let kernels = TempDir::new().unwrap();
    install_sh_kernel(kernels.path(), "sh");
    install_sh_kernel(kernels.path(), "bash-like");
    fs::create_dir_all(kernels.path().join("broken")).unwrap();

    let registry = KernelRegistry::new(vec![kernels.path().to_path_buf()]);
    let names: Vec<_> = registry.list().into_iter().map(|k| k.name).collect();
    assert_eq!(names, vec!["bash-like".to_string(), "sh".to_string()]);
}
