use std::time::{Duration, Instant};

use crate::core::{Model, TokenId};
use crate::error::Result;
use crate::protocol::{FULL_STOP, HALF_STOP};
use crate::sample::{Sampler, SamplingSettings};

const FULL: &[u8] = FULL_STOP.as_bytes();
const HALF: &[u8] = HALF_STOP.as_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Generating,
    Completed,
    ForcedStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    TokenBudget,
    TimeBudget,
    EndOfSequence,
    /// The model opened the closing fence and then wrote something else.
    Diverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Completed,
    Forced(ForceReason),
}

impl Stop {
    pub fn phase(&self) -> Phase {
        match self {
            Stop::Completed => Phase::Completed,
            Stop::Forced(_) => Phase::ForcedStop,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub max_tokens: usize,
    pub max_time: Duration,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            max_time: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Completed,
    /// Token must not be kept; the caller forces the rest of the marker.
    Rejected,
}

/// Watches the output of one turn for the end-of-turn marker.
///
/// Until the opener `HALF_STOP` shows up the model writes freely. Once it
/// does, only bytes that continue `FULL_STOP` are accepted. A prompt that
/// already ends with the opener starts in that constrained state, so such
/// a turn can only ever produce the close suffix.
#[derive(Debug, Clone)]
pub struct TurnStopDetector {
    stream: Vec<u8>,
    output_start: usize,
    closing_at: Option<usize>,
}

impl TurnStopDetector {
    pub fn new(prompt: &str) -> Self {
        if prompt.as_bytes().ends_with(HALF) {
            Self {
                stream: HALF.to_vec(),
                output_start: HALF.len(),
                closing_at: Some(0),
            }
        } else {
            Self {
                stream: Vec::new(),
                output_start: 0,
                closing_at: None,
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing_at.is_some()
    }

    pub fn output(&self) -> &[u8] {
        &self.stream[self.output_start..]
    }

    pub fn into_output(mut self) -> Vec<u8> {
        self.stream.split_off(self.output_start)
    }

    pub fn offer(&mut self, bytes: &[u8]) -> Offer {
        match self.closing_at {
            Some(start) => {
                let have = self.stream.len() - start;
                if have + bytes.len() > FULL.len() || FULL[have..have + bytes.len()] != *bytes {
                    return Offer::Rejected;
                }
                self.stream.extend_from_slice(bytes);
                if self.stream.len() - start == FULL.len() {
                    Offer::Completed
                } else {
                    Offer::Accepted
                }
            }
            None => {
                let scan_from = self
                    .stream
                    .len()
                    .saturating_sub(HALF.len() - 1)
                    .max(self.output_start);
                self.stream.extend_from_slice(bytes);

                let Some(pos) = find(&self.stream[scan_from..], HALF) else {
                    return Offer::Accepted;
                };
                let start = scan_from + pos;
                let have = self.stream.len() - start;

                if have <= FULL.len() && FULL.starts_with(&self.stream[start..]) {
                    self.closing_at = Some(start);
                    if have == FULL.len() {
                        Offer::Completed
                    } else {
                        Offer::Accepted
                    }
                } else {
                    let keep = self.stream.len() - bytes.len();
                    self.stream.truncate(keep);
                    Offer::Rejected
                }
            }
        }
    }

    /// Appends whatever is missing to end the output with `FULL_STOP` and
    /// returns those bytes so the caller can feed them to the model.
    pub fn force(&mut self) -> Vec<u8> {
        let done = match self.closing_at {
            Some(start) => self.stream.len() - start,
            None => {
                let out = self.output();
                (0..FULL.len().min(out.len() + 1))
                    .rev()
                    .find(|&k| out.ends_with(&FULL[..k]))
                    .unwrap_or(0)
            }
        };
        let missing = FULL[done..].to_vec();
        self.stream.extend_from_slice(&missing);
        self.closing_at.get_or_insert(self.stream.len() - FULL.len());
        missing
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Generated text, marker included.
    pub text: Vec<u8>,
    pub stop: Stop,
    pub generated_tokens: usize,
    pub elapsed: Duration,
    /// Every phase this request passed through, `Idle` to `Idle`.
    pub phases: Vec<Phase>,
}

/// Feeds `prompt` and samples until the turn closes or a budget runs out.
pub fn generate<M: Model>(
    model: &mut M,
    state: &mut M::State,
    sampler: &mut Sampler,
    settings: &SamplingSettings,
    prompt: &str,
    limits: &TurnLimits,
) -> Result<(Vec<u8>, Stop, usize)> {
    let started = Instant::now();
    let mut history: Vec<TokenId> = model.tokenizer().encode(prompt);
    let mut logits = model.step(state, &history)?;
    let mut detector = TurnStopDetector::new(prompt);
    let eos = model.eos_token();
    let mut generated = 0usize;

    let stop = loop {
        if generated >= limits.max_tokens {
            break Stop::Forced(ForceReason::TokenBudget);
        }
        if started.elapsed() >= limits.max_time {
            break Stop::Forced(ForceReason::TimeBudget);
        }

        let token = sampler.sample(&logits, &history, settings);
        if Some(token) == eos {
            break Stop::Forced(ForceReason::EndOfSequence);
        }

        let bytes = model.tokenizer().decode(&[token])?;
        match detector.offer(&bytes) {
            Offer::Rejected => break Stop::Forced(ForceReason::Diverged),
            offer => {
                logits = model.step(state, &[token])?;
                history.push(token);
                generated += 1;
                if offer == Offer::Completed {
                    break Stop::Completed;
                }
            }
        }
    };

    if let Stop::Forced(reason) = stop {
        let missing = detector.force();
        tracing::warn!(
            "forcing turn close ({:?}) after {} tokens, appended {:?}",
            reason,
            generated,
            String::from_utf8_lossy(&missing)
        );
        let tokens = model.tokenizer().encode(&String::from_utf8_lossy(&missing));
        model.step(state, &tokens)?;
    }

    Ok((detector.into_output(), stop, generated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &mut TurnStopDetector, text: &str) -> Vec<Offer> {
        text.bytes().map(|b| detector.offer(&[b])).collect()
    }

    #[test]
    fn test_completes_on_full_marker() {
        let mut detector = TurnStopDetector::new("USER: hi\n\n~~~(end)~~~\n\nBOT: ");
        let offers = feed(&mut detector, "Hello.\n\n~~~(end)~~~\n\n");

        assert_eq!(offers.last(), Some(&Offer::Completed));
        assert!(offers[..offers.len() - 1].iter().all(|o| *o == Offer::Accepted));
        assert_eq!(detector.output(), b"Hello.\n\n~~~(end)~~~\n\n");
    }

    #[test]
    fn test_divergence_after_opener_is_rejected() {
        let mut detector = TurnStopDetector::new("prompt");
        feed(&mut detector, "text\n\n~~~(");
        assert!(detector.is_closing());

        assert_eq!(detector.offer(b"x"), Offer::Rejected);
        assert_eq!(detector.force(), b"end)~~~\n\n");
        assert_eq!(detector.output(), b"text\n\n~~~(end)~~~\n\n");
    }

    #[test]
    fn test_force_reuses_partial_marker() {
        let mut detector = TurnStopDetector::new("prompt");
        feed(&mut detector, "abc\n\n~");
        assert_eq!(detector.force(), b"~~(end)~~~\n\n");
        assert!(detector.output().ends_with(FULL));

        let mut detector = TurnStopDetector::new("prompt");
        feed(&mut detector, "no marker");
        assert_eq!(detector.force(), FULL);
    }

    #[test]
    fn test_force_on_empty_output() {
        let mut detector = TurnStopDetector::new("prompt");
        assert_eq!(detector.force(), FULL);
        assert_eq!(detector.output(), FULL);
    }

    #[test]
    fn test_half_stop_prompt_only_accepts_close() {
        let mut detector = TurnStopDetector::new("USER: hi\n\n~~~(");
        assert!(detector.is_closing());

        let offers = feed(&mut detector, "end)~~~\n\n");
        assert_eq!(offers.last(), Some(&Offer::Completed));
        assert_eq!(detector.output(), b"end)~~~\n\n");

        let mut detector = TurnStopDetector::new("USER: hi\n\n~~~(");
        assert_eq!(detector.offer(b"BOT"), Offer::Rejected);
        assert_eq!(detector.force(), b"end)~~~\n\n");
        assert_eq!(detector.into_output(), b"end)~~~\n\n");
    }

    #[test]
    fn test_multibyte_token_spanning_marker() {
        let mut detector = TurnStopDetector::new("prompt");
        assert_eq!(detector.offer(b"done.\n\n~~~(end)"), Offer::Accepted);
        assert_eq!(detector.offer(b"~~~\n\n"), Offer::Completed);

        let mut detector = TurnStopDetector::new("prompt");
        assert_eq!(detector.offer(b"ok\n\n~~~(oops"), Offer::Rejected);
        assert_eq!(detector.output(), b"");
    }
}
