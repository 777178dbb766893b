use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(program: &str, args: &[String]) -> Result<RunOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to start {program}"))?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[derive(Debug)]
pub struct StreamedRun {
    /// Exit code; `None` when the command was killed by the timeout.
    pub code: Option<i32>,
    pub timed_out: bool,
    /// Interleaved stdout + stderr as observed by the tee threads.
    pub transcript: String,
}

/// Execute a program, duplicating its stdout and stderr to the console and an
/// in-memory transcript, and kill it once `timeout` elapses.
///
/// Two tee threads drain the pipes; the caller's thread watches the deadline
/// and reaps the child. On a clean exit both tees are joined, so the
/// transcript is complete; on a timeout the transcript holds whatever was
/// observed up to the kill.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or its pipes cannot be
/// taken; a non-zero exit or a timeout is reported in the result, not as an
/// error.
pub fn run_streaming_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<StreamedRun> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("missing stdout pipe for {program}"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("missing stderr pipe for {program}"))?;

    let transcript = Arc::new(Mutex::new(Vec::new()));
    let out_tee = spawn_tee(stdout, std::io::stdout(), Arc::clone(&transcript));
    let err_tee = spawn_tee(stderr, std::io::stderr(), Arc::clone(&transcript));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for {program}"))?
        {
            break status;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            let _ = child.kill();
            break child
                .wait()
                .with_context(|| format!("failed to reap {program} after timeout"))?;
        }
        thread::sleep(Duration::from_millis(50));
    };

    // After a kill the pipes can still be held open by grandchildren; the
    // tees finish on their own once those exit, so only join on a clean exit.
    if !timed_out {
        let _ = out_tee.join();
        let _ = err_tee.join();
    }

    let transcript_bytes = {
        let buffer = transcript
            .lock()
            .map_err(|_| anyhow!("transcript buffer poisoned for {program}"))?;
        buffer.clone()
    };
    let mut transcript = String::from_utf8_lossy(&transcript_bytes).to_string();
    if timed_out {
        transcript.push_str(&format!("\nTimeout after {} seconds\n", timeout.as_secs()));
    }

    Ok(StreamedRun {
        code: if timed_out { None } else { status.code() },
        timed_out,
        transcript,
    })
}

fn spawn_tee<R, W>(
    mut reader: R,
    mut console: W,
    transcript: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            // Console writes are best effort; the transcript is the record.
            let _ = console.write_all(&chunk[..read]);
            let _ = console.flush();
            if let Ok(mut buffer) = transcript.lock() {
                buffer.extend_from_slice(&chunk[..read]);
            }
        }
    })
}
