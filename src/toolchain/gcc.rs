//! GCC-compatible toolchain driver.
//!
//! Invokes `gcc`/`g++` for compilation and linking and `ar` for static
//! archives. Dependency information is requested with `-MMD` and read back
//! from the make-style depfile after each compile.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::core::manifest::Language;
use crate::plan::{CompileStep, LinkKind, LinkStep};
use crate::toolchain::diagnostics::{self, parse_diagnostics};
use crate::toolchain::{CompileResult, CompilerInfo, LinkResult, ToolchainDriver, ToolchainError};

pub struct GccDriver {
    cc: String,
    cxx: String,
    ar: String,
    probed: OnceCell<CompilerInfo>,
}

impl Default for GccDriver {
    fn default() -> Self {
        Self::new("gcc", "g++", "ar")
    }
}

impl GccDriver {
    pub fn new(cc: &str, cxx: &str, ar: &str) -> Self {
        Self {
            cc: cc.to_string(),
            cxx: cxx.to_string(),
            ar: ar.to_string(),
            probed: OnceCell::new(),
        }
    }

    fn compiler_for(&self, language: Language) -> &str {
        match language {
            Language::C => &self.cc,
            Language::Cpp => &self.cxx,
        }
    }

    /// Run a child to completion, capturing stderr on a side thread so a full
    /// pipe can never wedge the child, enforcing `timeout` by polling.
    fn run(
        &self,
        tool: &str,
        mut command: Command,
        timeout: Option<Duration>,
    ) -> Result<(ExitStatus, String), ToolchainError> {
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolchainError::Missing {
                    tool: tool.to_string(),
                }
            } else {
                ToolchainError::Spawn {
                    tool: tool.to_string(),
                    source: e,
                }
            }
        })?;

        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let reader = std::thread::spawn(move || {
            let mut buffer = String::new();
            let _ = stderr_pipe.read_to_string(&mut buffer);
            buffer
        });

        let status = self.wait_with_timeout(tool, &mut child, timeout)?;
        let stderr = reader.join().unwrap_or_default();

        if status.code().is_none() && !status.success() {
            return Err(ToolchainError::SignalTerminated {
                tool: tool.to_string(),
            });
        }
        Ok((status, stderr))
    }

    fn wait_with_timeout(
        &self,
        tool: &str,
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus, ToolchainError> {
        let Some(limit) = timeout else {
            return child.wait().map_err(|source| ToolchainError::Spawn {
                tool: tool.to_string(),
                source,
            });
        };

        let deadline = Instant::now() + limit;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(tool, ?limit, "step timed out, killing child");
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ToolchainError::StepTimeout { limit });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(source) => {
                    return Err(ToolchainError::Spawn {
                        tool: tool.to_string(),
                        source,
                    })
                }
            }
        }
    }

    fn probe_uncached(&self) -> Result<CompilerInfo, ToolchainError> {
        let version_out = Command::new(&self.cxx)
            .arg("--version")
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolchainError::Missing {
                        tool: self.cxx.clone(),
                    }
                } else {
                    ToolchainError::ProbeFailed(e.to_string())
                }
            })?;
        if !version_out.status.success() {
            return Err(ToolchainError::ProbeFailed(format!(
                "{} --version exited with {}",
                self.cxx, version_out.status
            )));
        }
        let stdout = String::from_utf8_lossy(&version_out.stdout);
        let version = stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().last())
            .unwrap_or("unknown")
            .to_string();

        let target_out = Command::new(&self.cxx)
            .arg("-dumpmachine")
            .output()
            .map_err(|e| ToolchainError::ProbeFailed(e.to_string()))?;
        if !target_out.status.success() {
            return Err(ToolchainError::ProbeFailed(format!(
                "{} -dumpmachine exited with {}",
                self.cxx, target_out.status
            )));
        }
        let target = String::from_utf8_lossy(&target_out.stdout).trim().to_string();

        Ok(CompilerInfo {
            name: self.cxx.clone(),
            version,
            target,
        })
    }
}

impl ToolchainDriver for GccDriver {
    fn probe(&self) -> Result<CompilerInfo, ToolchainError> {
        self.probed
            .get_or_try_init(|| self.probe_uncached())
            .map(Clone::clone)
    }

    fn compile(
        &self,
        step: &CompileStep,
        timeout: Option<Duration>,
    ) -> Result<CompileResult, ToolchainError> {
        if let Some(parent) = step.object.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ToolchainError::Spawn {
                tool: self.compiler_for(step.language).to_string(),
                source,
            })?;
        }

        let tool = self.compiler_for(step.language).to_string();
        let mut command = Command::new(&tool);
        command
            .arg("-c")
            .arg("-o")
            .arg(&step.object)
            .arg(&step.source)
            .arg("-MMD")
            .arg("-MF")
            .arg(&step.depfile);
        command.args(&step.flags);
        for include in &step.include_dirs {
            command.arg("-I").arg(include);
        }

        debug!(source = %step.source.display(), "compiling");
        let started = Instant::now();
        let (status, stderr) = self.run(&tool, command, timeout)?;
        let duration = started.elapsed();

        let diagnostics = parse_diagnostics(&stderr);
        let success = status.success() && !diagnostics::has_errors(&diagnostics);
        let discovered_headers = if success {
            read_depfile(&step.depfile, &step.source)
        } else {
            None
        };

        Ok(CompileResult {
            object_path: step.object.clone(),
            success,
            diagnostics,
            stderr,
            discovered_headers,
            duration,
        })
    }

    fn link(
        &self,
        step: &LinkStep,
        timeout: Option<Duration>,
    ) -> Result<LinkResult, ToolchainError> {
        if let Some(parent) = step.output.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ToolchainError::Spawn {
                tool: self.ar.clone(),
                source,
            })?;
        }

        let (tool, command) = match step.kind {
            LinkKind::StaticArchive => {
                let mut command = Command::new(&self.ar);
                command.arg("rcs").arg(&step.output);
                command.args(&step.objects);
                (self.ar.clone(), command)
            }
            LinkKind::Executable => {
                let mut command = Command::new(&self.cxx);
                command.arg("-o").arg(&step.output);
                command.args(&step.objects);
                command.args(&step.archives);
                command.args(&step.flags);
                (self.cxx.clone(), command)
            }
        };

        debug!(output = %step.output.display(), "linking");
        let started = Instant::now();
        let (status, stderr) = self.run(&tool, command, timeout)?;

        Ok(LinkResult {
            output_path: step.output.clone(),
            success: status.success(),
            stderr,
            duration: started.elapsed(),
        })
    }
}

/// Parse a make-style depfile (`obj: src hdr...` with backslash
/// continuations and `\ `-escaped spaces) into the list of included headers,
/// the source file itself excluded. An unreadable or malformed depfile is
/// `None`; the caller falls back to the conservative key.
fn read_depfile(depfile: &Path, source: &Path) -> Option<Vec<PathBuf>> {
    let text = std::fs::read_to_string(depfile).ok()?;
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");
    let (_target, deps) = joined.split_once(':')?;

    let mut headers = Vec::new();
    let mut current = String::new();
    let mut chars = deps.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                current.push(' ');
                chars.next();
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    headers.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        headers.push(current);
    }

    let source_normalized = source.to_string_lossy();
    let mut paths: Vec<PathBuf> = headers
        .into_iter()
        .filter(|h| h.as_str() != source_normalized)
        .map(PathBuf::from)
        .collect();
    paths.sort();
    paths.dedup();
    Some(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depfile_parses_continuations() {
        let dir = tempfile::tempdir().unwrap();
        let depfile = dir.path().join("main.d");
        std::fs::write(
            &depfile,
            "obj/main.o: src/main.c \\\n /dep/include/dep/api.h \\\n /dep/include/dep/util.h\n",
        )
        .unwrap();

        let headers = read_depfile(&depfile, Path::new("src/main.c")).unwrap();
        assert_eq!(
            headers,
            vec![
                PathBuf::from("/dep/include/dep/api.h"),
                PathBuf::from("/dep/include/dep/util.h"),
            ]
        );
    }

    #[test]
    fn depfile_unescapes_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let depfile = dir.path().join("x.d");
        std::fs::write(&depfile, "x.o: a.c /inc/my\\ lib/api.h\n").unwrap();
        let headers = read_depfile(&depfile, Path::new("a.c")).unwrap();
        assert_eq!(headers, vec![PathBuf::from("/inc/my lib/api.h")]);
    }

    #[test]
    fn header_free_unit_is_accurate_empty() {
        let dir = tempfile::tempdir().unwrap();
        let depfile = dir.path().join("x.d");
        std::fs::write(&depfile, "x.o: a.c\n").unwrap();
        assert_eq!(read_depfile(&depfile, Path::new("a.c")), Some(vec![]));
    }

    #[test]
    fn missing_depfile_is_no_information() {
        assert!(read_depfile(Path::new("/nonexistent.d"), Path::new("a.c")).is_none());
    }
}
