//! Normalizes backend output to incremental deltas

use super::backend::OutputMode;

/// Turns a backend's chunk sequence into non-empty text deltas
#[derive(Debug)]
pub struct DeltaNormalizer {
    mode: OutputMode,
    seen: String,
}

impl DeltaNormalizer {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            seen: String::new(),
        }
    }

    /// Feed one chunk; returns the new text, or None when nothing changed
    pub fn push(&mut self, chunk: String) -> Option<String> {
        let delta = match self.mode {
            OutputMode::Incremental => chunk,
            OutputMode::Cumulative => {
                let delta = text_delta(&self.seen, &chunk);
                self.seen = chunk;
                delta
            }
        };
        (!delta.is_empty()).then_some(delta)
    }
}

fn text_delta(previous: &str, current: &str) -> String {
    if let Some(delta) = current.strip_prefix(previous) {
        return delta.to_string();
    }
    // The runtime revised earlier text (detokenizer merge); emit from the
    // first point of divergence.
    let common = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();
    current.chars().skip(common).collect()
}
