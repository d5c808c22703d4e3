//! List installed kernels.

use std::path::PathBuf;

use cellar_core::KernelRegistry;

use crate::colors;

pub fn execute(extra_paths: &[PathBuf]) {
    let registry = KernelRegistry::with_default_paths(extra_paths);
    let kernels = registry.list();

    if kernels.is_empty() {
        println!("{}No kernels installed.{}", colors::YELLOW, colors::RESET);
        println!("Searched:");
        for path in registry.search_paths() {
            println!("  {}", path.display());
        }
        return;
    }

    for kernel in &kernels {
        let display_name = if kernel.spec.display_name.is_empty() {
            &kernel.name
        } else {
            &kernel.spec.display_name
        };
        println!(
            "  {}{:<16}{} {} {}[{}] {}{}",
            colors::BOLD,
            kernel.name,
            colors::RESET,
            display_name,
            colors::DIM,
            kernel.spec.language,
            kernel.resource_dir.display(),
            colors::RESET
        );
    }
}
