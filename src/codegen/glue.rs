//! Host compiler glue: turn generated source into a runnable artifact.
//!
//! The generated unit is a standalone Rust program linked against this
//! crate's rlib.  Building writes the source into a temporary directory
//! (removed when the build finishes, success or not) and drives `rustc`.

use crate::error::{LispError, LispResult};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Minimum rustc minor version (1.x) the generated source targets.
const MIN_RUSTC_MINOR: u32 = 80;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build with optimizations (`-O`).
    pub optimize: bool,
    /// Path to the compiled `liblilt.rlib` the unit links against.  When
    /// absent, `LILT_RUNTIME` is consulted.
    pub runtime_rlib: Option<PathBuf>,
}

/// Check that rustc is available and recent enough; yields the minor
/// version.
pub fn rustc_version() -> LispResult<u32> {
    let output = Command::new("rustc").arg("--version").output().map_err(|e| {
        LispError::Io(format!(
            "failed to run rustc: {}. Install a Rust toolchain 1.{} or later.",
            e, MIN_RUSTC_MINOR
        ))
    })?;
    if !output.status.success() {
        return Err(LispError::Io(format!(
            "rustc --version failed with exit code {:?}",
            output.status.code()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let minor = parse_rustc_minor(&text).ok_or_else(|| {
        LispError::Io(format!("could not parse rustc version from: {}", text.trim()))
    })?;
    if minor < MIN_RUSTC_MINOR {
        return Err(LispError::Io(format!(
            "rustc 1.{} detected, but generated units need 1.{} or later",
            minor, MIN_RUSTC_MINOR
        )));
    }
    Ok(minor)
}

/// Parse the minor version out of `rustc 1.82.0 (...)`.
fn parse_rustc_minor(text: &str) -> Option<u32> {
    let rest = text.trim().strip_prefix("rustc 1.")?;
    let minor: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    minor.parse().ok()
}

fn runtime_rlib(opts: &BuildOptions) -> LispResult<PathBuf> {
    if let Some(path) = &opts.runtime_rlib {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("LILT_RUNTIME") {
        return Ok(PathBuf::from(path));
    }
    Err(LispError::Io(
        "cannot locate the runtime library: pass --runtime or set LILT_RUNTIME \
         to the compiled liblilt.rlib"
            .to_string(),
    ))
}

/// Compile generated source to an executable at `output`.
pub fn build_executable(source: &str, output: &Path, opts: &BuildOptions) -> LispResult<PathBuf> {
    rustc_version()?;
    let rlib = runtime_rlib(opts)?;

    let dir = tempfile::TempDir::new()
        .map_err(|e| LispError::Io(format!("cannot create build directory: {}", e)))?;
    let src_path = dir.path().join("unit.rs");
    std::fs::write(&src_path, source)
        .map_err(|e| LispError::Io(format!("cannot write {}: {}", src_path.display(), e)))?;
    tracing::debug!(src = %src_path.display(), out = %output.display(), "invoking rustc");

    let mut cmd = Command::new("rustc");
    cmd.arg("--edition").arg("2021");
    if opts.optimize {
        cmd.arg("-O");
    }
    cmd.arg("--extern")
        .arg(format!("lilt={}", rlib.display()));
    if let Some(deps) = rlib.parent() {
        cmd.arg("-L").arg(deps);
        cmd.arg("-L").arg(deps.join("deps"));
    }
    cmd.arg("-o").arg(output).arg(&src_path);

    let result = cmd
        .output()
        .map_err(|e| LispError::Io(format!("failed to run rustc: {}", e)))?;
    if !result.status.success() {
        return Err(LispError::Io(format!(
            "rustc failed (exit code {:?}):\n{}",
            result.status.code(),
            String::from_utf8_lossy(&result.stderr)
        )));
    }
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::parse_rustc_minor;

    #[test]
    fn test_parse_rustc_minor() {
        assert_eq!(parse_rustc_minor("rustc 1.82.0 (f6e511eec 2024-10-15)"), Some(82));
        assert_eq!(parse_rustc_minor("rustc 1.100.1"), Some(100));
        assert_eq!(parse_rustc_minor("clang version 15"), None);
    }
}
