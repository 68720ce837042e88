//! Shared test utilities for runner integration tests.
//!
//! Agent CLIs are replaced by small executable shell scripts that print
//! canned JSON lines, so tests exercise the real spawn / pipe / parse path
//! without any vendor binary installed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// Write `contents` to `dir/name` and mark it executable.
pub fn write_executable(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write fake CLI script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make fake CLI executable");
    }
    path
}

/// A fake agent CLI living in its own temp directory.
///
/// The directory doubles as a scratch area: scripts may drop files (pid
/// files, captured arguments) next to themselves.
pub struct FakeCli {
    dir: TempDir,
    path: PathBuf,
}

impl FakeCli {
    /// A CLI that runs `body` under `/bin/sh`. `$FAKE_DIR` points at the
    /// script's directory.
    pub fn script(name: &str, body: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let script = format!(
            "#!/bin/sh\nFAKE_DIR='{}'\n{body}\n",
            dir.path().display()
        );
        let path = write_executable(dir.path(), name, &script);
        Self { dir, path }
    }

    /// A CLI that drains stdin, records its arguments and stdin, then
    /// prints `lines` and exits 0.
    pub fn jsonl(name: &str, lines: &[&str]) -> Self {
        Self::jsonl_with_exit(name, lines, 0)
    }

    /// Like [`FakeCli::jsonl`] but exits with `code`.
    pub fn jsonl_with_exit(name: &str, lines: &[&str], code: i32) -> Self {
        let fake = Self::script(
            name,
            &format!(
                "printf '%s\\n' \"$@\" > \"$FAKE_DIR/args\"\n\
                 cat > \"$FAKE_DIR/stdin\"\n\
                 cat \"$FAKE_DIR/{name}.jsonl\"\n\
                 exit {code}"
            ),
        );
        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(fake.dir.path().join(format!("{name}.jsonl")), body)
            .expect("failed to write canned output");
        fake
    }

    /// Canned output built from JSON values.
    pub fn from_values(name: &str, values: &[serde_json::Value]) -> Self {
        let lines: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        Self::jsonl(name, &refs)
    }

    /// A CLI that records its pid, prints `first_line`, then sleeps. With
    /// `ignore_term` it traps SIGTERM so only SIGKILL ends it.
    pub fn long_running(name: &str, first_line: &str, ignore_term: bool) -> Self {
        let trap = if ignore_term { "trap '' TERM\n" } else { "" };
        Self::script(
            name,
            &format!(
                "{trap}echo $$ > \"$FAKE_DIR/pid\"\n\
                 echo '{first_line}'\n\
                 sleep 30 &\n\
                 echo $! > \"$FAKE_DIR/grandchild\"\n\
                 wait"
            ),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The script path as a string, ready for a runner's binary setting.
    pub fn binary(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Arguments the last invocation received, one per line.
    pub fn recorded_args(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("args"))
    }

    /// Everything the last invocation read from stdin.
    pub fn recorded_stdin(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("stdin")).unwrap_or_default()
    }

    /// A pid written by the script into `file` (`pid`, `grandchild`).
    pub fn recorded_pid(&self, file: &str) -> Option<u32> {
        std::fs::read_to_string(self.dir.path().join(file))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Poll until `path` exists or `timeout` elapses.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    path.exists()
}

/// Whether a process with `pid` still exists and is not a zombie.
#[cfg(target_os = "linux")]
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Field 3 is the state; `Z` and `X` are dead.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_running(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .is_ok_and(|s| s.success())
}

// ---------------------------------------------------------------------------
// Canned vendor streams
// ---------------------------------------------------------------------------

/// OpenCode run that writes `/tmp/x.txt` and stops.
pub const OPENCODE_WRITE_RUN: &[&str] = &[
    r#"{"type":"step_start","timestamp":1,"sessionID":"s","part":{"type":"step-start"}}"#,
    r#"{"type":"tool_use","timestamp":2,"part":{"type":"tool","callID":"c1","tool":"write","state":{"status":"completed","input":{"content":"hello","filePath":"/tmp/x.txt"},"output":""}}}"#,
    r#"{"type":"step_finish","timestamp":3,"part":{"type":"step-finish","reason":"tool-calls","cost":0.00197528,"tokens":{"input":3562,"output":401,"cache":{"read":6144,"write":0}}}}"#,
    r#"{"type":"text","timestamp":4,"part":{"type":"text","text":"File created successfully."}}"#,
    r#"{"type":"step_finish","timestamp":5,"part":{"type":"step-finish","reason":"stop","cost":0.0,"tokens":{"input":0,"output":0,"cache":{"read":0,"write":0}}}}"#,
];

/// Codex `exec --json` run creating `foo.txt`.
pub const CODEX_FILE_WRITE_RUN: &[&str] = &[
    r#"{"id":"0","msg":{"type":"task_started"}}"#,
    r#"{"id":"1","msg":{"type":"agent_message_delta","delta":"Creating"}}"#,
    r#"{"id":"1","msg":{"type":"file_change","path":"foo.txt","content":"hi"}}"#,
    r#"{"id":"1","msg":{"type":"patch_apply_end","call_id":"p1","success":true,"stdout":"A foo.txt"}}"#,
    r#"{"id":"1","msg":{"type":"agent_message","message":"Created foo.txt with content 'hi'."}}"#,
    r#"{"id":"1","msg":{"type":"token_count","info":{"total_token_usage":{"input_tokens":1200,"cached_input_tokens":0,"output_tokens":85}}}}"#,
    r#"{"id":"1","msg":{"type":"task_complete","last_agent_message":"Created foo.txt with content 'hi'."}}"#,
];

/// Claude Code run with one `Write` tool round trip.
pub const CLAUDE_TOOL_ROUND_TRIP: &[&str] = &[
    r#"{"type":"system","subtype":"init","session_id":"sess-1","tools":["Write"],"mcp_servers":[]}"#,
    r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"tool_use","id":"toolu_1","name":"Write","input":{"file_path":"foo.txt","content":"hi"}}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
    r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"File written"}]}}"#,
    r#"{"type":"assistant","message":{"id":"msg_2","content":[{"type":"text","text":"Done."}],"usage":{"input_tokens":20,"output_tokens":3}}}"#,
    r#"{"type":"result","subtype":"success","is_error":false,"num_turns":2,"session_id":"sess-1","total_cost_usd":0.0123,"usage":{"input_tokens":30,"output_tokens":8}}"#,
];
