//! Signal relay from the supervising process to its child.
//!
//! Handlers are installed before the child is spawned, so an early Ctrl-C
//! cannot take the supervisor down with the default disposition. Each
//! delivery is forwarded to the child unchanged; the supervisor itself takes
//! no other action. Shutting the relay down (or dropping it) puts back the
//! dispositions that were in place before [`SignalRelay::install`].
//!
//! On Unix the handler writes the signal number into a socket pair owned by
//! the relay, and [`SignalRelay::forward_next`] reads it on the async side.
//! Several relays may be live at once; the process-wide handler is installed
//! by the first and restored by the last.
use crate::config::RelayConfig;
use crate::error::WrapError;

#[cfg(unix)]
pub use unix::parse_signal;

/// Installed listeners for the configured signals.
pub struct SignalRelay {
    #[cfg(unix)]
    inner: Option<unix::Listening>,
    relayed: u64,
}

impl SignalRelay {
    /// Register listeners for every configured signal.
    pub fn install(config: &RelayConfig) -> Result<Self, WrapError> {
        #[cfg(unix)]
        {
            let inner = if config.enabled {
                unix::Listening::install(&config.signals)?
            } else {
                None
            };
            tracing::debug!(
                count = inner.as_ref().map_or(0, |l| l.signals.len()),
                "signal relay installed"
            );
            Ok(Self { inner, relayed: 0 })
        }
        #[cfg(not(unix))]
        {
            if config.enabled && !config.signals.is_empty() {
                tracing::debug!("signal relay is not supported on this platform");
            }
            Ok(Self { relayed: 0 })
        }
    }

    /// Signals this relay listens for.
    #[cfg(unix)]
    pub fn signals(&self) -> &[nix::sys::signal::Signal] {
        match &self.inner {
            Some(listening) => &listening.signals,
            None => &[],
        }
    }

    /// Wait for the next batch of deliveries and forward them to `pid`.
    ///
    /// Never completes when nothing is being listened for. Cancel safe: a
    /// delivery is either fully forwarded or left queued.
    pub async fn forward_next(&mut self, pid: u32) {
        #[cfg(unix)]
        {
            let Some(listening) = self.inner.as_mut() else {
                return std::future::pending().await;
            };
            self.relayed += listening.forward_next(pid).await;
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            std::future::pending::<()>().await
        }
    }

    /// Number of signals forwarded so far.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Stop listening and restore the previous dispositions.
    pub fn shutdown(self) -> u64 {
        let relayed = self.relayed;
        drop(self);
        tracing::debug!(relayed, "signal relay stopped");
        relayed
    }
}

#[cfg(unix)]
mod unix {
    use crate::error::WrapError;
    use nix::errno::Errno;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::os::fd::{AsRawFd, BorrowedFd};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Mutex, MutexGuard};
    use tokio::io::AsyncReadExt;

    const SLOTS: usize = 32;

    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY_SLOT: AtomicI32 = AtomicI32::new(-1);

    /// Write ends of every live relay's socket pair; `-1` marks a free slot.
    static WAKERS: [AtomicI32; SLOTS] = [EMPTY_SLOT; SLOTS];

    /// Signals with the relay handler installed.
    static INSTALLED: Mutex<Vec<Installed>> = Mutex::new(Vec::new());

    struct Installed {
        signal: Signal,
        users: usize,
        previous: SigAction,
    }

    /// Parse names like `SIGINT`, `INT` or `sigterm`.
    pub fn parse_signal(name: &str) -> Result<Signal, WrapError> {
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        let signal: Signal = full
            .parse()
            .map_err(|_| WrapError::config(format!("unknown signal {name:?}")))?;
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            return Err(WrapError::config(format!("{full} cannot be relayed")));
        }
        Ok(signal)
    }

    extern "C" fn on_signal(signo: nix::libc::c_int) {
        let saved = Errno::last_raw();
        let byte = [signo as u8];
        for slot in &WAKERS {
            let fd = slot.load(Ordering::Acquire);
            if fd >= 0 {
                // SAFETY: the fd stays open while its slot holds it.
                let _ = nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &byte);
            }
        }
        Errno::set_raw(saved);
    }

    fn installed() -> MutexGuard<'static, Vec<Installed>> {
        INSTALLED.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(signal: Signal) -> Result<(), WrapError> {
        let mut installed = installed();
        if let Some(entry) = installed.iter_mut().find(|e| e.signal == signal) {
            entry.users += 1;
            return Ok(());
        }
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: on_signal only touches atomics and calls write(2).
        let previous = unsafe { sigaction(signal, &action) }
            .map_err(|e| WrapError::config(format!("cannot listen for {signal}: {e}")))?;
        installed.push(Installed {
            signal,
            users: 1,
            previous,
        });
        Ok(())
    }

    fn release(signal: Signal) {
        let mut installed = installed();
        let Some(index) = installed.iter().position(|e| e.signal == signal) else {
            return;
        };
        installed[index].users -= 1;
        if installed[index].users > 0 {
            return;
        }
        let entry = installed.swap_remove(index);
        // SAFETY: puts back the action that was in place before acquire.
        if let Err(e) = unsafe { sigaction(signal, &entry.previous) } {
            tracing::warn!(%signal, error = %e, "failed to restore signal disposition");
        }
    }

    /// One relay's share of the process-wide handler.
    pub(super) struct Listening {
        pub(super) signals: Vec<Signal>,
        acquired: Vec<Signal>,
        slot: usize,
        reader: tokio::net::UnixStream,
        _writer: std::os::unix::net::UnixStream,
    }

    impl Listening {
        pub(super) fn install(names: &[String]) -> Result<Option<Self>, WrapError> {
            let mut signals = Vec::new();
            for name in names {
                let signal = parse_signal(name)?;
                if !signals.contains(&signal) {
                    signals.push(signal);
                }
            }
            if signals.is_empty() {
                return Ok(None);
            }

            let io_err = |e: std::io::Error| WrapError::Supervise { source: e };
            let (reader, writer) = std::os::unix::net::UnixStream::pair().map_err(io_err)?;
            reader.set_nonblocking(true).map_err(io_err)?;
            writer.set_nonblocking(true).map_err(io_err)?;
            let reader = tokio::net::UnixStream::from_std(reader).map_err(io_err)?;

            let fd = writer.as_raw_fd();
            let slot = WAKERS
                .iter()
                .position(|s| {
                    s.compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                })
                .ok_or_else(|| WrapError::config("too many signal relays running at once"))?;

            let mut listening = Self {
                signals,
                acquired: Vec::new(),
                slot,
                reader,
                _writer: writer,
            };
            for signal in listening.signals.clone() {
                acquire(signal)?;
                listening.acquired.push(signal);
            }
            Ok(Some(listening))
        }

        /// Read queued deliveries and forward the ones this relay wants.
        pub(super) async fn forward_next(&mut self, pid: u32) -> u64 {
            let mut buf = [0u8; 64];
            let n = match self.reader.read(&mut buf).await {
                Ok(0) | Err(_) => return std::future::pending().await,
                Ok(n) => n,
            };
            let target = nix::unistd::Pid::from_raw(pid as i32);
            let mut relayed = 0;
            for &byte in &buf[..n] {
                let Ok(signal) = Signal::try_from(i32::from(byte)) else {
                    continue;
                };
                if !self.signals.contains(&signal) {
                    continue;
                }
                match nix::sys::signal::kill(target, signal) {
                    Ok(()) => {
                        relayed += 1;
                        tracing::debug!(%signal, pid, "relayed signal to child");
                    }
                    Err(e) => {
                        tracing::debug!(%signal, pid, error = %e, "could not relay signal");
                    }
                }
            }
            relayed
        }
    }

    impl Drop for Listening {
        fn drop(&mut self) {
            for signal in self.acquired.drain(..) {
                release(signal);
            }
            WAKERS[self.slot].store(-1, Ordering::Release);
        }
    }
}
