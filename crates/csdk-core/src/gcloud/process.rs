use std::{collections::VecDeque, process::Stdio, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};

use crate::error::SdkError;
use crate::progress::ConsoleListener;

const ERROR_TAIL_LINES: usize = 20;

/// Runs `cmd` to completion and returns its stdout.
pub(crate) async fn run_captured(mut cmd: Command, label: &str) -> Result<String, SdkError> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    let output = cmd
        .output()
        .await
        .map_err(|e| SdkError::command(label, e.to_string()))?;
    if !output.status.success() {
        return Err(SdkError::command(
            label,
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs `cmd`, forwarding every output line to `console`.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    label: &str,
    console: &Arc<dyn ConsoleListener>,
) -> Result<(), SdkError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| SdkError::command(label, e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, _, stderr_tail) = tokio::join!(
        child.wait(),
        forward_lines(stdout, console),
        forward_lines(stderr, console),
    );
    let status = status.map_err(|e| SdkError::command(label, e.to_string()))?;

    if !status.success() {
        let tail = Vec::from(stderr_tail).join("\n");
        return Err(SdkError::command(label, format!("{status}: {tail}")));
    }
    Ok(())
}

async fn forward_lines<R>(reader: Option<R>, console: &Arc<dyn ConsoleListener>) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(ERROR_TAIL_LINES);
    let Some(reader) = reader else {
        return tail;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        console.console(&line);
        if tail.len() == ERROR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}
