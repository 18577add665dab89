//! Phrase segmenter
//!
//! Packs timed phrases into text blocks of bounded size for per-segment processing.
//! A block that reaches `max_words` is cut at its largest inter-phrase pause of at
//! least `pause_threshold` seconds; the phrases after the cut start the next block.
//! Without such a pause the whole block is emitted. Inside a block, phrases separated
//! by more than `separator_pause` seconds are joined with `" | "`.

use serde::{Deserialize, Serialize};

/// One recognized utterance with its time span in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phrase {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl Phrase {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }

    #[must_use]
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// Untimed phrases, one per non-blank line
    ///
    /// Every gap is zero, so blocks are only ever cut on word count.
    #[must_use]
    pub fn from_lines(text: &str) -> Vec<Self> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Self::new(line, 0.0, 0.0))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segmenter {
    pub max_words: usize,
    pub pause_threshold: f64,
    pub separator_pause: f64,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            max_words: 50,
            pause_threshold: 1.0,
            separator_pause: 1.0,
        }
    }
}

impl Segmenter {
    #[must_use]
    pub fn with_max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    /// Split phrases into blocks; blank blocks are dropped
    #[must_use]
    pub fn segment(&self, phrases: &[Phrase]) -> Vec<String> {
        let mut sorted = phrases.to_vec();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut blocks: Vec<Vec<Phrase>> = Vec::new();
        let mut current: Vec<Phrase> = Vec::new();
        let mut words = 0;

        for phrase in sorted {
            words += phrase.word_count();
            current.push(phrase);
            if words < self.max_words {
                continue;
            }

            match self.split_index(&current) {
                Some(index) => {
                    let rest = current.split_off(index);
                    blocks.push(std::mem::replace(&mut current, rest));
                    words = current.iter().map(Phrase::word_count).sum();
                }
                None => {
                    blocks.push(std::mem::take(&mut current));
                    words = 0;
                }
            }
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        blocks
            .iter()
            .map(|block| self.merge(block))
            .filter(|text| !text.trim().is_empty())
            .collect()
    }

    /// Index of the phrase after the largest qualifying pause
    fn split_index(&self, block: &[Phrase]) -> Option<usize> {
        let mut best = None;
        let mut longest = 0.0;
        for (i, pair) in block.windows(2).enumerate() {
            let pause = pair[1].start - pair[0].end;
            if pause >= self.pause_threshold && pause > longest {
                longest = pause;
                best = Some(i + 1);
            }
        }
        best
    }

    fn merge(&self, block: &[Phrase]) -> String {
        let mut merged = String::new();
        for (i, phrase) in block.iter().enumerate() {
            if i > 0 {
                let pause = phrase.start - block[i - 1].end;
                merged.push_str(if pause > self.separator_pause { " | " } else { " " });
            }
            merged.push_str(&phrase.text);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrase(text: &str, start: f64, end: f64) -> Phrase {
        Phrase::new(text, start, end)
    }

    #[test]
    fn test_short_input_is_one_block() {
        let phrases = vec![
            phrase("hello there", 0.0, 1.0),
            phrase("general kenobi", 1.2, 2.0),
        ];
        assert_eq!(
            Segmenter::default().segment(&phrases),
            vec!["hello there general kenobi"]
        );
    }

    #[test]
    fn test_long_pause_inserts_separator() {
        let phrases = vec![phrase("first", 0.0, 1.0), phrase("second", 3.5, 4.0)];
        assert_eq!(Segmenter::default().segment(&phrases), vec!["first | second"]);
    }

    #[test]
    fn test_overflow_splits_at_largest_pause() {
        let segmenter = Segmenter::default().with_max_words(6);
        let phrases = vec![
            phrase("one two", 0.0, 1.0),
            phrase("three four", 2.5, 3.0),
            phrase("five six", 3.1, 4.0),
        ];
        // Largest gap is 1.5s between the first and second phrase
        assert_eq!(
            segmenter.segment(&phrases),
            vec!["one two", "three four five six"]
        );
    }

    #[test]
    fn test_overflow_without_pause_flushes_block() {
        let segmenter = Segmenter::default().with_max_words(4);
        let phrases = vec![
            phrase("a b", 0.0, 1.0),
            phrase("c d", 1.1, 2.0),
            phrase("e", 2.1, 3.0),
        ];
        assert_eq!(segmenter.segment(&phrases), vec!["a b c d", "e"]);
    }

    #[test]
    fn test_phrases_are_ordered_by_start() {
        let phrases = vec![phrase("later", 5.0, 6.0), phrase("earlier", 0.0, 1.0)];
        assert_eq!(
            Segmenter::default().segment(&phrases),
            vec!["earlier | later"]
        );
    }

    #[test]
    fn test_blank_blocks_are_dropped() {
        let phrases = vec![phrase("   ", 0.0, 1.0)];
        assert!(Segmenter::default().segment(&phrases).is_empty());
        assert!(Segmenter::default().segment(&[]).is_empty());
    }

    #[test]
    fn test_untimed_lines_cut_on_word_count() {
        let phrases = Phrase::from_lines("alpha beta\n\n gamma delta \nepsilon");
        assert_eq!(phrases.len(), 3);
        assert_eq!(
            Segmenter::default().with_max_words(4).segment(&phrases),
            vec!["alpha beta gamma delta", "epsilon"]
        );
    }
}
