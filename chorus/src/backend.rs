//! Child language-server processes.
//!
//! The supervisor spawns one subprocess per configured server command with
//! piped stdio, wraps stdout/stdin into a [`StreamWire`] for the router, and
//! forwards stderr line by line to our own stderr.

use crate::wire::{StreamWire, Wire};
use anyhow::{Context as _, Result};
use futures::{io::BufReader, AsyncBufReadExt};
use parking_lot::Mutex;
use smol::process::{Child, ChildStderr, Command, Stdio};
use std::{fmt, path::Path, sync::Arc};

/// Index of a backend in spawn order. Index 0 is the primary.
pub type BackendId = usize;

/// A backend's display name, shared with its stderr forwarder.
///
/// The name starts as the command basename (suffixed `#N` for duplicates)
/// and is replaced by `serverInfo.name` once the backend answers
/// `initialize`.
#[derive(Clone)]
pub struct BackendName(Arc<Mutex<String>>);

impl BackendName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(name.into())))
    }

    pub fn get(&self) -> String {
        self.0.lock().clone()
    }

    pub fn set(&self, name: impl Into<String>) {
        *self.0.lock() = name.into();
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.lock())
    }
}

/// A spawned backend and the streams the router talks through.
pub struct BackendProcess {
    pub id: BackendId,
    pub name: BackendName,
    pub wire: Arc<dyn Wire>,
    pub stderr: Option<ChildStderr>,
    pub child: Child,
}

/// Display name for a server command: basename of the executable, with a
/// `#N` suffix when several servers share it.
pub fn display_name(argv: &[String], index: usize) -> String {
    let basename = argv
        .first()
        .map(|command| {
            Path::new(command)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| command.clone())
        })
        .unwrap_or_default();

    if index > 0 {
        format!("{basename}#{index}")
    } else {
        basename
    }
}

/// Launch one language-server subprocess with piped stdio.
pub fn spawn(argv: &[String], index: usize) -> Result<BackendProcess> {
    let name = display_name(argv, index);
    tracing::info!("Launching {}: {}", name, argv.join(" "));

    let (program, args) = argv.split_first().context("empty server command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch {name}"))?;

    let stdin = child
        .stdin
        .take()
        .with_context(|| format!("failed to capture stdin of {name}"))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("failed to capture stdout of {name}"))?;
    let stderr = child.stderr.take();

    Ok(BackendProcess {
        id: index,
        name: BackendName::new(name),
        wire: Arc::new(StreamWire::new(stdout, stdin)),
        stderr,
        child,
    })
}

/// Forward a backend's stderr to ours, one line at a time, prefixed with the
/// backend's name. Runs until the pipe closes.
pub async fn forward_stderr(name: BackendName, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buffer);
                let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
                tracing::info!("[{name}] {line}");
            }
            Err(error) => {
                tracing::info!("[{name}] error reading stderr: {error}");
                break;
            }
        }
    }
}
