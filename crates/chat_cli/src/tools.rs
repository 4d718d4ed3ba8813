//! Built-in example tools, all rooted in one workspace directory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tool_chat::gateway::{optional_str, optional_u64, required_str};
use tool_chat::{Tool, ToolError, ToolRegistry};
use wait_timeout::ChildExt;

pub const CURRENT_DATETIME: &str = "current_datetime";
pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_DIRECTORY: &str = "list_directory";
pub const RUN_COMMAND: &str = "run_command";

pub const BUILTIN_TOOL_NAMES: [&str; 5] = [
    CURRENT_DATETIME,
    READ_FILE,
    WRITE_FILE,
    LIST_DIRECTORY,
    RUN_COMMAND,
];

const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 30;
const DEFAULT_COMMAND_MAX_OUTPUT_BYTES: usize = 100 * 1024;
const DEFAULT_READ_MAX_BYTES: usize = 200 * 1024;
const EMPTY_DIRECTORY: &str = "(empty directory)";

/// Canonical directory every path argument must stay inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, String> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .map_err(|err| format!("Failed to resolve workspace root: {err}"))?;

        if !canonical_root.is_dir() {
            return Err("Workspace root must be a directory".to_string());
        }

        Ok(Self {
            root: canonical_root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_existing_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let canonical = candidate
            .canonicalize()
            .map_err(|error| format!("Failed to resolve path {path}: {error}"))?;

        self.ensure_inside(&canonical)?;
        Ok(canonical)
    }

    fn resolve_write_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let parent = candidate
            .parent()
            .ok_or_else(|| format!("Path {path} has no parent directory"))?;

        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside(&anchor)?;

        Ok(candidate)
    }

    fn absolute_candidate(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn ensure_inside(&self, canonical_path: &Path) -> Result<(), String> {
        if canonical_path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(format!(
                "Path escapes workspace root: {}",
                canonical_path.display()
            ))
        }
    }

    fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
            Ok(relative) => relative.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Registry with every built-in tool bound to `workspace_root`.
pub fn builtin_registry(workspace_root: impl Into<PathBuf>) -> Result<ToolRegistry, String> {
    let workspace = Arc::new(Workspace::new(workspace_root)?);
    let mut registry = ToolRegistry::new();
    registry.register(CurrentDatetimeTool);
    registry.register(ReadFileTool::new(Arc::clone(&workspace)));
    registry.register(WriteFileTool::new(Arc::clone(&workspace)));
    registry.register(ListDirectoryTool::new(Arc::clone(&workspace)));
    registry.register(RunCommandTool::new(workspace));
    Ok(registry)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentDatetimeTool;

impl Tool for CurrentDatetimeTool {
    fn name(&self) -> &str {
        CURRENT_DATETIME
    }

    fn description(&self) -> &str {
        "Returns the current date and time in UTC as an RFC 3339 timestamp."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn call(&self, _arguments: &Map<String, Value>) -> Result<String, ToolError> {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|error| ToolError::failed(format!("Failed to format time: {error}")))
    }
}

#[derive(Debug, Clone)]
pub struct ReadFileTool {
    workspace: Arc<Workspace>,
    max_bytes: usize,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            max_bytes: DEFAULT_READ_MAX_BYTES,
        }
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        READ_FILE
    }

    fn description(&self) -> &str {
        "Reads a UTF-8 text file inside the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" }
            },
            "required": ["path"]
        })
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        let path = required_str(arguments, "path")?;
        let resolved = self
            .workspace
            .resolve_existing_path(path)
            .map_err(ToolError::Failed)?;

        if resolved.is_dir() {
            return Err(ToolError::failed(format!(
                "{} is a directory; use {LIST_DIRECTORY}",
                self.workspace.display(&resolved)
            )));
        }

        let bytes = fs::read(&resolved).map_err(|error| {
            ToolError::failed(format!(
                "Failed to read file {}: {error}",
                self.workspace.display(&resolved)
            ))
        })?;

        if bytes.len() > self.max_bytes {
            return Err(ToolError::failed(format!(
                "File exceeds max read size ({} bytes > {} bytes)",
                bytes.len(),
                self.max_bytes
            )));
        }

        String::from_utf8(bytes)
            .map_err(|_| ToolError::failed("File is not valid UTF-8 text"))
    }
}

#[derive(Debug, Clone)]
pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        WRITE_FILE
    }

    fn description(&self) -> &str {
        "Creates or overwrites a text file inside the workspace, creating parent directories."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" },
                "content": { "type": "string", "description": "Full file contents" }
            },
            "required": ["path", "content"]
        })
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        let path = required_str(arguments, "path")?;
        let content = required_str(arguments, "content")?;
        let resolved = self
            .workspace
            .resolve_write_path(path)
            .map_err(ToolError::Failed)?;

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                ToolError::failed(format!(
                    "Failed to create parent directories for {path}: {error}"
                ))
            })?;

            // Re-check after creation; a symlinked component may point elsewhere.
            let canonical_parent = parent.canonicalize().map_err(|error| {
                ToolError::failed(format!("Failed to resolve write parent for {path}: {error}"))
            })?;
            self.workspace
                .ensure_inside(&canonical_parent)
                .map_err(ToolError::Failed)?;
        }

        fs::write(&resolved, content)
            .map_err(|error| ToolError::failed(format!("Failed to write file {path}: {error}")))?;

        Ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            self.workspace.display(&resolved)
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ListDirectoryTool {
    workspace: Arc<Workspace>,
}

impl ListDirectoryTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        LIST_DIRECTORY
    }

    fn description(&self) -> &str {
        "Lists the entries of a workspace directory, one per line; directories end with '/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace (default '.')" }
            }
        })
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        let path = optional_str(arguments, "path")?.unwrap_or(".");
        let resolved = self
            .workspace
            .resolve_existing_path(path)
            .map_err(ToolError::Failed)?;

        if !resolved.is_dir() {
            return Err(ToolError::failed(format!("{path} is not a directory")));
        }

        let entries = fs::read_dir(&resolved).map_err(|error| {
            ToolError::failed(format!("Failed to list directory {path}: {error}"))
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| {
                ToolError::failed(format!("Failed to list directory {path}: {error}"))
            })?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }

        if names.is_empty() {
            return Ok(EMPTY_DIRECTORY.to_string());
        }

        names.sort();
        Ok(names.join("\n"))
    }
}

#[derive(Debug, Clone)]
pub struct RunCommandTool {
    workspace: Arc<Workspace>,
    default_timeout_sec: u64,
    max_output_bytes: usize,
}

impl RunCommandTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            default_timeout_sec: DEFAULT_COMMAND_TIMEOUT_SEC,
            max_output_bytes: DEFAULT_COMMAND_MAX_OUTPUT_BYTES,
        }
    }
}

impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        RUN_COMMAND
    }

    fn description(&self) -> &str {
        "Runs a bash command in the workspace and returns its exit status, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "timeout_sec": { "type": "integer", "minimum": 1 },
                "cwd": { "type": "string", "description": "Working directory relative to the workspace" }
            },
            "required": ["command"]
        })
    }

    /// A command that runs but exits non-zero still yields `Ok`: the status
    /// line is part of the output the model reasons about.
    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        let command = required_str(arguments, "command")?;
        let timeout = match optional_u64(arguments, "timeout_sec")? {
            Some(0) => return Err(ToolError::invalid_arguments("timeout_sec must be > 0")),
            Some(secs) => secs,
            None => self.default_timeout_sec,
        };

        let mut builder = Command::new("bash");
        builder
            .arg("-lc")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let cwd = match optional_str(arguments, "cwd")? {
            Some(cwd) => self
                .workspace
                .resolve_existing_path(cwd)
                .map_err(|error| ToolError::failed(format!("Invalid cwd: {error}")))?,
            None => self.workspace.root().to_path_buf(),
        };
        if !cwd.is_dir() {
            return Err(ToolError::failed("Invalid cwd: expected a directory"));
        }
        builder.current_dir(cwd);

        let mut child = builder
            .spawn()
            .map_err(|error| ToolError::failed(format!("Failed to launch command: {error}")))?;

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let (timed_out, status) = match child.wait_timeout(Duration::from_secs(timeout)) {
            Ok(Some(status)) => (false, status),
            Ok(None) => {
                let _ = child.kill();
                let status = child.wait().map_err(|error| {
                    ToolError::failed(format!(
                        "Command timed out after {timeout}s and wait failed: {error}"
                    ))
                })?;
                (true, status)
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::failed(format!(
                    "Failed waiting for command: {error}"
                )));
            }
        };

        let status_label = if timed_out {
            format!("timeout after {timeout}s")
        } else {
            format_exit_status(status)
        };

        let content = format!(
            "status: {status_label}\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&join_pipe(stdout)),
            String::from_utf8_lossy(&join_pipe(stderr))
        );

        Ok(truncate_to_byte_limit(content, self.max_output_bytes))
    }
}

type PipeReader = Option<thread::JoinHandle<Vec<u8>>>;

/// Reads a child pipe on its own thread so a chatty command cannot fill the
/// pipe buffer and stall until the timeout.
fn drain_pipe(pipe: Option<impl Read + Send + 'static>) -> PipeReader {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("tool-chat-pipe".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
        .ok()
}

fn join_pipe(reader: PipeReader) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, String> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return ancestor.canonicalize().map_err(|error| {
                format!("Failed to resolve path {}: {error}", ancestor.display())
            });
        }
    }

    Err(format!(
        "No existing ancestor found for path {}",
        path.display()
    ))
}

fn format_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let content = "é".repeat(10);

        let truncated = truncate_to_byte_limit(content, 5);

        assert_eq!(truncated, "éé\n[truncated]");
    }

    #[test]
    fn short_content_is_not_truncated() {
        assert_eq!(truncate_to_byte_limit("abc".to_string(), 3), "abc");
    }

    #[test]
    fn workspace_display_is_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(dir.path()).expect("workspace");

        assert_eq!(workspace.display(workspace.root()), ".");
        assert_eq!(workspace.display(&workspace.root().join("a/b.txt")), "a/b.txt");
    }
}
