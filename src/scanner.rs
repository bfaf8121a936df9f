//! Diagnostic stream scanner.
//!
//! A pure state machine over the child's stderr bytes. Ordinary bytes are
//! handed back for immediate forwarding; once the marker shows up, bytes are
//! held in a candidate block until the verification window decides whether
//! they are a panic report or just output that happened to contain the marker.
//!
//! Transition table (per step):
//!
//! | state     | input                              | next                      |
//! |-----------|------------------------------------|---------------------------|
//! | Idle      | no marker                          | Idle (forward, keep tail) |
//! | Idle      | marker at offset `i`               | Capturing (forward `..i`) |
//! | Capturing | block shorter than window          | Capturing                 |
//! | Capturing | token inside first `window` bytes  | Verified                  |
//! | Capturing | token not inside window            | Rejected                  |
//! | Rejected  | -                                  | Idle (replay block)       |
//! | Verified  | anything                           | Verified (append)         |
//!
//! `Rejected` never survives a call to [`Scanner::feed`].

use crate::config::DetectorConfig;

/// Observable phase of the scanner, without the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Capturing,
    Verified,
    Rejected,
}

#[derive(Debug)]
enum State {
    /// `carry` holds a trailing partial marker withheld from forwarding.
    Idle { carry: Vec<u8> },
    Capturing { block: Vec<u8> },
    Verified { block: Vec<u8> },
    Rejected { block: Vec<u8> },
}

impl State {
    fn phase(&self) -> ScanState {
        match self {
            State::Idle { .. } => ScanState::Idle,
            State::Capturing { .. } => ScanState::Capturing,
            State::Verified { .. } => ScanState::Verified,
            State::Rejected { .. } => ScanState::Rejected,
        }
    }
}

/// Final outcome of a scan, available once the stream has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No candidate block was open at end of stream.
    Clean,
    /// The candidate passed the window check; holds marker through end of stream.
    Verified(Vec<u8>),
    /// The stream ended before the window filled; holds the partial candidate.
    Unconfirmed(Vec<u8>),
}

/// Streaming marker/token detector.
#[derive(Debug)]
pub struct Scanner {
    marker: Vec<u8>,
    token: Vec<u8>,
    window: usize,
    state: State,
}

/// Result of a single transition: the next state, plus input left to process.
struct Step {
    next: State,
    pending: Option<Vec<u8>>,
}

impl Scanner {
    pub fn new(detector: &DetectorConfig) -> Self {
        Self {
            marker: detector.marker.as_bytes().to_vec(),
            token: detector.verification_token.as_bytes().to_vec(),
            window: detector.window,
            state: State::Idle { carry: Vec::new() },
        }
    }

    pub fn state(&self) -> ScanState {
        self.state.phase()
    }

    /// Consume one chunk. Bytes that are safe to forward are appended to `out`
    /// in their original order.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut input = chunk.to_vec();
        loop {
            let current = std::mem::replace(&mut self.state, State::Idle { carry: Vec::new() });
            let from = current.phase();
            let Step { next, pending } = self.step(current, input, out);
            if next.phase() != from {
                tracing::trace!(?from, to = ?next.phase(), "scanner transition");
            }
            self.state = next;
            match pending {
                Some(rest) => input = rest,
                None => return,
            }
        }
    }

    /// Signal end of stream. Any withheld partial marker is appended to `out`.
    pub fn finish(self, out: &mut Vec<u8>) -> Verdict {
        match self.state {
            State::Idle { carry } => {
                out.extend_from_slice(&carry);
                Verdict::Clean
            }
            State::Capturing { block } => Verdict::Unconfirmed(block),
            State::Verified { block } => Verdict::Verified(block),
            // Not reachable through `feed`, which always resolves a rejection
            // before returning; treat the block as ordinary output.
            State::Rejected { block } => {
                out.extend_from_slice(&block);
                Verdict::Clean
            }
        }
    }

    fn step(&self, state: State, input: Vec<u8>, out: &mut Vec<u8>) -> Step {
        match state {
            State::Idle { mut carry } => {
                carry.extend_from_slice(&input);
                let data = carry;
                match find(&data, &self.marker) {
                    Some(start) => {
                        out.extend_from_slice(&data[..start]);
                        Step {
                            next: State::Capturing {
                                block: data[start..].to_vec(),
                            },
                            // Run the window check right away; the chunk may
                            // already hold enough bytes to decide.
                            pending: Some(Vec::new()),
                        }
                    }
                    None => {
                        let keep = partial_suffix_len(&data, &self.marker);
                        let split = data.len() - keep;
                        out.extend_from_slice(&data[..split]);
                        Step {
                            next: State::Idle {
                                carry: data[split..].to_vec(),
                            },
                            pending: None,
                        }
                    }
                }
            }
            State::Capturing { mut block } => {
                block.extend_from_slice(&input);
                if block.len() < self.window {
                    return Step {
                        next: State::Capturing { block },
                        pending: None,
                    };
                }
                if contains(&block[..self.window], &self.token) {
                    tracing::debug!(bytes = block.len(), "diagnostic verified");
                    Step {
                        next: State::Verified { block },
                        pending: None,
                    }
                } else {
                    Step {
                        next: State::Rejected { block },
                        pending: Some(Vec::new()),
                    }
                }
            }
            State::Rejected { block } => {
                tracing::debug!(bytes = block.len(), "marker without verification token, releasing");
                // Release the first byte of the false marker and replay the
                // rest, since it may hold another marker.
                let (first, rest) = block.split_at(1);
                out.extend_from_slice(first);
                let mut replay = rest.to_vec();
                replay.extend_from_slice(&input);
                Step {
                    next: State::Idle { carry: Vec::new() },
                    pending: Some(replay),
                }
            }
            State::Verified { mut block } => {
                block.extend_from_slice(&input);
                Step {
                    next: State::Verified { block },
                    pending: None,
                }
            }
        }
    }
}

/// Offset of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Length of the longest proper prefix of `marker` that `data` ends with.
fn partial_suffix_len(data: &[u8], marker: &[u8]) -> usize {
    let longest = marker.len().saturating_sub(1).min(data.len());
    (1..=longest)
        .rev()
        .find(|&k| data.ends_with(&marker[..k]))
        .unwrap_or(0)
}
