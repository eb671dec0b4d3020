//! Clipboard bridging via `xsel`, polled every 500ms when outbound clipboard
//! is enabled. All subprocess calls are bounded to 3s and failures are
//! logged and non-fatal.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Maximum base64 clipboard payload accepted from the data channel; oversize
/// payloads are dropped, never truncated.
pub const MAX_CLIPBOARD_PAYLOAD_BYTES: usize = 65_400;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn read_clipboard() -> Option<String> {
    run_bounded("xsel", &["--clipboard", "--output"]).await.and_then(|out| {
        let text = String::from_utf8(out).ok()?;
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    })
}

pub async fn write_clipboard(text: &str) -> bool {
    let spawn = Command::new("xsel")
        .args(["--clipboard", "--input"])
        .stdin(std::process::Stdio::piped())
        .spawn();
    let mut child = match spawn {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "xsel not available for clipboard write");
            return false;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(text.as_bytes()).await {
            warn!(error = %e, "failed to write clipboard content to xsel stdin");
            return false;
        }
        drop(stdin);
    }
    match tokio::time::timeout(SUBPROCESS_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            warn!(error = %e, "xsel clipboard write failed");
            false
        }
        Err(_) => {
            warn!("xsel clipboard write timed out after 3s");
            let _ = child.start_kill();
            false
        }
    }
}

async fn run_bounded(cmd: &str, args: &[&str]) -> Option<Vec<u8>> {
    let child = Command::new(cmd).args(args).output();
    match tokio::time::timeout(SUBPROCESS_TIMEOUT, child).await {
        Ok(Ok(out)) if out.status.success() => Some(out.stdout),
        Ok(Ok(out)) => {
            warn!(cmd, code = ?out.status.code(), "subprocess exited non-zero");
            None
        }
        Ok(Err(e)) => {
            warn!(cmd, error = %e, "failed to invoke subprocess");
            None
        }
        Err(_) => {
            warn!(cmd, "subprocess timed out after 3s");
            None
        }
    }
}

/// Polls the clipboard every 500ms, forwarding changed text on `tx` until
/// `cancel` fires.
pub async fn poll_loop(tx: tokio::sync::mpsc::UnboundedSender<String>, cancel: CancellationToken) {
    let mut last: Option<String> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        let current = read_clipboard().await;
        if let Some(text) = current {
            if last.as_ref() != Some(&text) {
                if tx.send(text.clone()).is_err() {
                    return;
                }
                last = Some(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_payload_constant_matches_spec() {
        assert_eq!(MAX_CLIPBOARD_PAYLOAD_BYTES, 65_400);
    }

    #[test]
    fn subprocess_timeout_is_three_seconds() {
        assert_eq!(SUBPROCESS_TIMEOUT, Duration::from_secs(3));
    }
}
