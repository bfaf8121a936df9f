//! Wrap orchestration: decide parent vs. child, run the child under
//! supervision, and reconcile its exit status with the scanner's verdict.

use crate::config::{DetectorConfig, RelayConfig, WrapSettings};
use crate::error::WrapError;
use crate::guard::IdentityGuard;
use crate::scanner::{contains, Verdict};
use crate::signals::SignalRelay;
use crate::stream::{self, write_through};
use crate::supervisor;
use std::ffi::OsString;
use std::path::Path;
use tokio::io::AsyncWrite;

/// Called with the captured panic report, byte for byte as the child wrote
/// it. Runs at most once per supervised run.
pub type Handler = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Raw status returned by [`WrapStatus::code`] inside the child.
pub const CHILD_STATUS: i32 = -1;

/// Which side of the re-exec boundary this invocation is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapStatus {
    /// Already supervised: carry on running the real program.
    Child,
    /// The child has run to completion; exit with this status.
    Parent(i32),
}

impl WrapStatus {
    /// Integer form: [`CHILD_STATUS`] for the child, the exit status otherwise.
    pub fn code(self) -> i32 {
        match self {
            WrapStatus::Child => CHILD_STATUS,
            WrapStatus::Parent(status) => status,
        }
    }

    pub fn is_child(self) -> bool {
        matches!(self, WrapStatus::Child)
    }
}

/// Supervision settings plus the handler. Consumed by [`wrap`].
pub struct WrapConfig {
    handler: Option<Handler>,
    guard: IdentityGuard,
    detector: DetectorConfig,
    relay: RelayConfig,
}

impl std::fmt::Debug for WrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapConfig")
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .field("guard", &self.guard)
            .field("detector", &self.detector)
            .field("relay", &self.relay)
            .finish()
    }
}

impl Default for WrapConfig {
    fn default() -> Self {
        Self::from_settings(WrapSettings::default())
    }
}

impl WrapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: WrapSettings) -> Self {
        Self {
            handler: None,
            guard: settings.guard.into(),
            detector: settings.detector,
            relay: settings.relay,
        }
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn guard(mut self, guard: IdentityGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Check everything that must hold before a process is spawned.
    fn validated(self) -> Result<Validated, WrapError> {
        let handler = self
            .handler
            .ok_or_else(|| WrapError::config("handler must be set"))?;
        self.guard.validate()?;
        self.detector.validate()?;
        Ok(Validated {
            handler,
            guard: self.guard,
            detector: self.detector,
            relay: self.relay,
        })
    }
}

struct Validated {
    handler: Handler,
    guard: IdentityGuard,
    detector: DetectorConfig,
    relay: RelayConfig,
}

/// What to do with the scanner's candidate block once the exit status is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing was held back.
    Nothing,
    /// Not a real fault: write the bytes to the real stderr.
    Release(Vec<u8>),
    /// A genuine fault report for the handler.
    Report(Vec<u8>),
}

/// Gate the scanner verdict on the child's exit status.
///
/// A zero exit means no unrecovered fault happened, whatever the stream
/// looked like. A candidate that never filled the window only counts when
/// the token shows up somewhere in the complete block.
pub fn gate(verdict: Verdict, exit_status: i32, token: &[u8]) -> Resolution {
    match verdict {
        Verdict::Clean => Resolution::Nothing,
        Verdict::Verified(block) if exit_status != 0 => Resolution::Report(block),
        Verdict::Unconfirmed(block) if exit_status != 0 && contains(&block, token) => {
            Resolution::Report(block)
        }
        Verdict::Verified(block) | Verdict::Unconfirmed(block) => Resolution::Release(block),
    }
}

/// Re-execute the current program under supervision.
///
/// Call this first thing in `main`. Inside the child it returns
/// [`WrapStatus::Child`] immediately; in the parent it returns once the child
/// has exited, after invoking the handler if the child died of a panic.
pub async fn wrap(config: WrapConfig) -> Result<WrapStatus, WrapError> {
    let validated = config.validated()?;

    if validated.guard.is_child() {
        tracing::debug!(key = validated.guard.key(), "running as supervised child");
        return Ok(WrapStatus::Child);
    }

    let program =
        std::env::current_exe().map_err(|e| WrapError::ExecutableResolution { source: e })?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    let status = run_supervised(validated, &program, &args, tokio::io::stderr()).await?;
    Ok(WrapStatus::Parent(status))
}

/// [`wrap`] on a private current-thread runtime, for synchronous `main`s.
///
/// Must not be called from inside a tokio runtime.
pub fn wrap_blocking(config: WrapConfig) -> Result<WrapStatus, WrapError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| WrapError::Runtime { source: e })?;
    runtime.block_on(wrap(config))
}

/// [`wrap`] with default settings and the given handler.
pub async fn basic_wrap<F>(handler: F) -> Result<WrapStatus, WrapError>
where
    F: FnOnce(Vec<u8>) + Send + 'static,
{
    wrap(WrapConfig::new().handler(handler)).await
}

/// Run `program` with `args` as a supervised child, forwarding its ordinary
/// stderr to `sink`. Returns the child's exit status.
///
/// The identity guard is not consulted here; the caller decides whether this
/// process should supervise at all.
pub async fn supervise<W>(
    config: WrapConfig,
    program: &Path,
    args: &[OsString],
    sink: W,
) -> Result<i32, WrapError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let validated = config.validated()?;
    run_supervised(validated, program, args, sink).await
}

async fn run_supervised<W>(
    config: Validated,
    program: &Path,
    args: &[OsString],
    sink: W,
) -> Result<i32, WrapError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Validated {
        handler,
        guard,
        detector,
        relay,
    } = config;

    let mut relay = SignalRelay::install(&relay)?;
    let (mut child, stderr) = supervisor::spawn(program, args, &guard)?;
    let pid = child.pid();

    let scan_detector = detector.clone();
    let scan = tokio::spawn(async move { stream::pump(stderr, sink, &scan_detector).await });

    // Signals are only forwarded while the child is unreaped, so the pid
    // cannot have been reused by the time kill(2) runs.
    let waited = loop {
        tokio::select! {
            biased;
            waited = child.wait() => break waited,
            _ = relay.forward_next(pid) => {}
        }
    };
    let relayed = relay.shutdown();
    let exit_status = match waited {
        Ok(status) => status,
        Err(e) => {
            scan.abort();
            return Err(e);
        }
    };

    // The pipe's write end closes with the child, so this join observes end
    // of stream. The verdict is only read after it.
    let outcome = scan.await.map_err(|e| WrapError::Supervise {
        source: std::io::Error::other(format!("stderr scanner failed: {e}")),
    })?;

    tracing::debug!(
        exit_status,
        relayed,
        bytes_read = outcome.bytes_read,
        bytes_forwarded = outcome.bytes_forwarded,
        "supervision finished"
    );

    let mut sink = outcome.sink;
    match gate(
        outcome.verdict,
        exit_status,
        detector.verification_token.as_bytes(),
    ) {
        Resolution::Nothing => {}
        Resolution::Release(bytes) => {
            tracing::debug!(bytes = bytes.len(), "releasing candidate block as ordinary output");
            if let Err(e) = write_through(&mut sink, &bytes).await {
                tracing::warn!(error = %e, "failed to release held child stderr");
            }
        }
        Resolution::Report(bytes) => {
            tracing::info!(exit_status, bytes = bytes.len(), "child panicked, invoking handler");
            handler(bytes);
        }
    }

    Ok(exit_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// AsyncWrite into a shared buffer the test can inspect afterwards.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl AsyncWrite for SharedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Handler that records every invocation.
    fn recording_config() -> (WrapConfig, Arc<Mutex<Vec<Vec<u8>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let config = WrapConfig::new().handler(move |text| recorded.lock().unwrap().push(text));
        (config, calls)
    }

    async fn run_sh(config: WrapConfig, script: &str) -> (Result<i32, WrapError>, SharedSink) {
        let sink = SharedSink::default();
        let args = vec![OsString::from("-c"), OsString::from(script)];
        let result = supervise(config, Path::new("sh"), &args, sink.clone()).await;
        (result, sink)
    }

    #[test]
    fn test_wrap_status_codes() {
        assert_eq!(WrapStatus::Child.code(), -1);
        assert!(WrapStatus::Child.is_child());
        assert_eq!(WrapStatus::Parent(0).code(), 0);
        assert_eq!(WrapStatus::Parent(101).code(), 101);
        assert!(!WrapStatus::Parent(3).is_child());
    }

    #[test]
    fn test_gate_rules() {
        let token = b"panicked at";
        let report = b"thread 'main' panicked at x".to_vec();
        let noise = b"thread 'main' started".to_vec();

        assert_eq!(gate(Verdict::Clean, 1, token), Resolution::Nothing);
        assert_eq!(
            gate(Verdict::Verified(report.clone()), 101, token),
            Resolution::Report(report.clone())
        );
        assert_eq!(
            gate(Verdict::Verified(report.clone()), 0, token),
            Resolution::Release(report.clone())
        );
        assert_eq!(
            gate(Verdict::Unconfirmed(report.clone()), 2, token),
            Resolution::Report(report.clone())
        );
        assert_eq!(
            gate(Verdict::Unconfirmed(report.clone()), 0, token),
            Resolution::Release(report)
        );
        assert_eq!(
            gate(Verdict::Unconfirmed(noise.clone()), 1, token),
            Resolution::Release(noise)
        );
    }

    #[tokio::test]
    async fn test_missing_handler_is_config_error_before_spawn() {
        let err = supervise(
            WrapConfig::new(),
            Path::new("/nonexistent/never-spawned"),
            &[],
            SharedSink::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WrapError::Config { .. }));
    }

    #[tokio::test]
    async fn test_invalid_detector_is_config_error() {
        let (config, _) = recording_config();
        let config = config.detector(DetectorConfig {
            marker: String::new(),
            ..Default::default()
        });
        let (result, _) = run_sh(config, "exit 0").await;
        assert!(matches!(result, Err(WrapError::Config { .. })));
    }

    #[tokio::test]
    async fn test_wrap_without_handler_fails_even_in_child() {
        let err = wrap(WrapConfig::new()).await.unwrap_err();
        assert!(err.to_string().contains("handler must be set"));
    }

    #[tokio::test]
    async fn test_wrap_inside_child_returns_sentinel() {
        // Guard on a variable every test run already has, so the environment
        // is only read here.
        let path = std::env::var("PATH").unwrap();
        let (config, calls) = recording_config();
        let status = wrap(config.guard(IdentityGuard::new("PATH", path)))
            .await
            .unwrap();

        assert_eq!(status, WrapStatus::Child);
        assert_eq!(status.code(), CHILD_STATUS);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_status_without_marker() {
        let (config, calls) = recording_config();
        let (result, sink) = run_sh(config, "echo 'plain error' >&2; exit 3").await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(sink.contents(), "plain error\n");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_and_token_with_failure_invokes_handler_once() {
        let (config, calls) = recording_config();
        let (result, sink) = run_sh(
            config,
            "printf 'before\\n' >&2; printf \"thread 'main' panicked at src/main.rs:1:1:\\nboom\\n\" >&2; exit 2",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(sink.contents(), "before\n");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            b"thread 'main' panicked at src/main.rs:1:1:\nboom\n"
        );
    }

    #[tokio::test]
    async fn test_report_bytes_are_passed_through_unchanged() {
        let (config, calls) = recording_config();
        let (result, _) = run_sh(
            config,
            "printf \"thread 'main' panicked at x\\n\\377\\376\\n\" >&2; exit 2",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], b"thread 'main' panicked at x\n\xff\xfe\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_supervise_restores_signal_disposition() {
        fn caught(signo: i32) -> bool {
            let status = std::fs::read_to_string("/proc/self/status").unwrap();
            let mask = status
                .lines()
                .find_map(|line| line.strip_prefix("SigCgt:"))
                .unwrap()
                .trim();
            u64::from_str_radix(mask, 16).unwrap() & (1 << (signo - 1)) != 0
        }
        let winch = nix::sys::signal::Signal::SIGWINCH as i32;

        let (config, _) = recording_config();
        let config = config.relay(RelayConfig {
            enabled: true,
            signals: vec!["SIGWINCH".to_string()],
        });
        assert!(!caught(winch));
        let (result, _) = run_sh(config, "exit 0").await;
        assert_eq!(result.unwrap(), 0);
        assert!(!caught(winch));
    }

    #[tokio::test]
    async fn test_verified_report_with_zero_exit_is_released() {
        let (config, calls) = recording_config();
        let config = config.detector(DetectorConfig {
            window: 24,
            verification_token: "panicked".to_string(),
            ..Default::default()
        });
        let (result, sink) = run_sh(
            config,
            "printf \"thread 'm' panicked at a long enough line\\n\" >&2; exit 0",
        )
        .await;

        assert_eq!(result.unwrap(), 0);
        assert_eq!(sink.contents(), "thread 'm' panicked at a long enough line\n");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_without_token_is_forwarded_on_failure() {
        let (config, calls) = recording_config();
        let (result, sink) =
            run_sh(config, "printf \"thread 'db' lost connection\\n\" >&2; exit 1").await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(sink.contents(), "thread 'db' lost connection\n");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heavy_stderr_does_not_block_child() {
        let (config, calls) = recording_config();
        let (result, sink) = run_sh(
            config,
            "i=0; while [ $i -lt 2000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx' >&2; i=$((i+1)); done; exit 0",
        )
        .await;

        assert_eq!(result.unwrap(), 0);
        assert_eq!(sink.contents().len(), 2000 * 85);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_invoke_handler() {
        let (config, calls) = recording_config();
        let err = supervise(
            config,
            Path::new("/nonexistent/faultwrap-child"),
            &[],
            SharedSink::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WrapError::Spawn { .. }));
        assert!(calls.lock().unwrap().is_empty());
    }
}
