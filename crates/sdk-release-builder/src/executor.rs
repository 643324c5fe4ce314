use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::manifest::Manifest;
use crate::planner::{Plan, Task};
use crate::workspace::Workspace;

/// Read-only inputs shared by every task of one release run.
pub struct BuildContext {
    pub manifest: Manifest,
    pub ws: Workspace,
}

pub type TaskExecFn = fn(&BuildContext, &Task, &ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    // Set by the framework fetch task; read by later per-target tasks that
    // embed the framework version in package metadata.
    framework_version: Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Collects events in memory; used by tests and by callers that want to
/// inspect a run afterwards.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
    error_logged_tasks: BTreeSet<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started += 1;
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines += 1;
                    buffer_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let mut written = None;
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok += 1;
                        s.task_logs.remove(&id);
                    } else {
                        s.tasks_failed += 1;
                        s.failed_tasks.push(id.clone());
                        match write_task_error_log(&mut s, &id, error.as_deref(), elapsed_ms) {
                            Ok(path) => written = Some(path),
                            Err(e) => {
                                println!("WARN: failed to write error log for {id}: {e}")
                            }
                        }
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
                if let Some(path) = written {
                    println!("ERROR_LOG: {id} => {}", path.display());
                }
            }
            ExecEvent::RunDone { ok, error } => {
                let mut summary = String::new();
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if ok { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  tasks: started={} ok={} failed={}\n",
                        s.tasks_started, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!("  logs: {}\n", s.log_lines));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    if !s.failed_tasks.is_empty() {
                        summary.push_str(&format!(
                            "  failed_tasks: {}\n",
                            s.failed_tasks.join(", ")
                        ));
                    }
                    for p in &s.error_log_paths {
                        summary.push_str(&format!("  error_log: {}\n", p.display()));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if let Some(e) = error {
                    println!("  error: {e}");
                }
            }
        }
    }
}

/// Per-task execution context: the event sink, the dry-run flag, and the
/// environment overrides merged into every spawned command (the package
/// manager sandbox). The host process environment is never mutated.
#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    env: BTreeMap<String, String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            env: BTreeMap::new(),
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    pub fn set_framework_version(&self, version: String) {
        if let Ok(mut g) = self.shared.framework_version.lock() {
            *g = Some(version);
        }
    }

    pub fn framework_version(&self) -> Option<String> {
        self.shared
            .framework_version
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    /// Run an external command to completion; nonzero exit is fatal. Output
    /// is streamed line by line through the sanitizer to the sink.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        let status = self.spawn_and_stream(cmd)?;
        if !status.success() {
            return Err(Error::command(format!("command failed: {status}")));
        }
        Ok(())
    }

    /// Non-fatal variant for idempotent cleanup commands where failure means
    /// "nothing to clean up". Returns whether the command succeeded.
    pub fn run_cmd_unchecked(&self, cmd: Command) -> Result<bool> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(true);
        }
        Ok(self.spawn_and_stream(cmd)?.success())
    }

    fn spawn_and_stream(&self, mut cmd: Command) -> Result<ExitStatus> {
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        let mut child = cmd
            // The build tools must never block on an interactive prompt.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command(format!("failed to spawn {:?}: {e}", cmd)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || stream_lines(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || stream_lines(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        child
            .wait()
            .map_err(|e| Error::command(format!("wait failed: {e}")))
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, kind: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(kind) {
            return Err(Error::config(format!(
                "duplicate task executor for kind '{kind}'"
            )));
        }
        self.exec.insert(kind, f);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<TaskExecFn> {
        self.exec.get(kind).copied()
    }
}

/// Run the plan strictly sequentially in topological order. The first task
/// failure aborts the run; completed checkpoints on disk make a later
/// re-invocation resume near the failure point.
pub fn execute_plan(
    bctx: &BuildContext,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(task.kind) else {
            return Err(Error::config(format!(
                "no executor registered for task kind '{}'",
                task.kind
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());

        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {} ({}/{})", task.id, task.stage, task.phase));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = exec(bctx, task, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                ctx.sink.emit(ExecEvent::RunDone {
                    ok: false,
                    error: Some(format!("task '{}' failed: {e}", task.id)),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::RunDone {
        ok: true,
        error: None,
    });
    Ok(())
}

fn stream_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            // Progress-style output uses bare carriage returns; treat them as
            // line breaks too.
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

fn buffer_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(line.to_string());
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: Option<&str>,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    if !state.error_logged_tasks.insert(task_id.to_string()) {
        if let Some(existing) = state.error_log_paths.last() {
            return Ok(existing.clone());
        }
    }

    let dir = match state.error_logs_dir.as_ref() {
        Some(d) => d.clone(),
        None => {
            let root = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs");
            let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::command(format!("failed to create {}: {e}", dir.display()))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };

    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));
    let mut body = String::new();
    body.push_str(&format!("task: {task_id}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
        body.push_str(&format!("error: {e}\n"));
    }
    body.push_str("\nlogs:\n");
    if let Some(lines) = state.task_logs.get(task_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body)
        .map_err(|e| Error::command(format!("failed to write {}: {e}", path.display())))?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
