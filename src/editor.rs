//! Open a mock's source file in the developer's editor.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// A position in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Launches an editor; failures are only logged.
pub trait EditorLauncher: Send + Sync {
    fn open(&self, location: &SourceLocation);
}

/// Runs `<program> -g <file>:<line>:<column>` (VS Code's goto syntax).
pub struct CommandEditor {
    program: String,
    cwd: PathBuf,
}

impl CommandEditor {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.to_path_buf(),
        }
    }

    fn goto_arg(&self, location: &SourceLocation) -> String {
        let file = self.cwd.join(&location.file);
        format!("{}:{}:{}", file.display(), location.line, location.column)
    }
}

impl EditorLauncher for CommandEditor {
    fn open(&self, location: &SourceLocation) {
        let target = self.goto_arg(location);
        debug!(editor = %self.program, target = %target, "Opening source in editor");
        let spawned = Command::new(&self.program)
            .arg("-g")
            .arg(&target)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Reap the child so it does not linger as a zombie
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => warn!(editor = %self.program, error = %e, "Failed to launch editor"),
        }
    }
}
