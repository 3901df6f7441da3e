//! SegmentSupervisor (§4.5): owns one card's (Segment's) lifecycle —
//! accumulates text, decides when to split on the soft/hard word-count
//! thresholds, and authors the Segment ID sequence.

use crate::error::{CoreError, Result};
use crate::id::SegmentId;

const SENTENCE_END: [char; 6] = ['.', '!', '?', '。', '！', '？'];

#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub segment_id: SegmentId,
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub word_count: usize,
}

#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Created { segment_id: SegmentId },
    Updated {
        segment_id: SegmentId,
        text: String,
        start: f64,
        end: f64,
    },
    Closed(ClosedSegment),
}

pub struct SegmentSupervisor {
    soft_threshold: usize,
    hard_threshold: usize,
    buffer: String,
    start_time: f64,
    end_time: f64,
    has_start_time: bool,
    current_segment_id: SegmentId,
}

impl SegmentSupervisor {
    pub fn new(soft_threshold: usize, hard_threshold: usize) -> Result<Self> {
        if soft_threshold >= hard_threshold {
            return Err(CoreError::Validation(
                "soft_threshold must be less than hard_threshold".into(),
            ));
        }
        Ok(Self {
            soft_threshold,
            hard_threshold,
            buffer: String::new(),
            start_time: 0.0,
            end_time: 0.0,
            has_start_time: false,
            current_segment_id: SegmentId::new(),
        })
    }

    pub fn current_segment_id(&self) -> SegmentId {
        self.current_segment_id
    }

    pub fn word_count(&self) -> usize {
        let trimmed = self.buffer.trim();
        if trimmed.is_empty() {
            0
        } else {
            trimmed.split_whitespace().count()
        }
    }

    fn ends_with_sentence_punctuation(&self) -> bool {
        self.buffer
            .trim_end()
            .chars()
            .last()
            .is_some_and(|c| SENTENCE_END.contains(&c))
    }

    /// Accumulate one transcript fragment. Returns the lifecycle events it
    /// produces: always an `Updated`, and a `Closed`+`Created` pair if the
    /// fragment pushed the card past a split threshold.
    pub fn add_transcript(&mut self, text: &str, start: f64, end: f64) -> Vec<SegmentEvent> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() {
            self.buffer = text.to_string();
            if !self.has_start_time {
                self.start_time = start;
                self.has_start_time = true;
            }
        } else {
            self.buffer.push(' ');
            self.buffer.push_str(text);
        }
        self.end_time = end;

        let mut events = vec![SegmentEvent::Updated {
            segment_id: self.current_segment_id,
            text: self.buffer.clone(),
            start: self.start_time,
            end: self.end_time,
        }];

        if let Some(closed) = self.check_split_criteria() {
            events.push(SegmentEvent::Closed(closed));
            self.reset_for_new_segment();
            events.push(SegmentEvent::Created {
                segment_id: self.current_segment_id,
            });
        }

        events
    }

    /// A card splits once it's both long enough and ends on a sentence
    /// boundary (soft threshold), or unconditionally once it's far too
    /// long (hard threshold) — §4.5's "don't cut a sentence in half unless
    /// it's run away".
    fn check_split_criteria(&self) -> Option<ClosedSegment> {
        if self.buffer.trim().is_empty() {
            return None;
        }

        let word_count = self.word_count();
        let should_split = (word_count >= self.soft_threshold && self.ends_with_sentence_punctuation())
            || word_count >= self.hard_threshold;

        if should_split {
            Some(ClosedSegment {
                segment_id: self.current_segment_id,
                text: self.buffer.clone(),
                start: self.start_time,
                end: self.end_time,
                word_count,
            })
        } else {
            None
        }
    }

    fn reset_for_new_segment(&mut self) {
        self.buffer.clear();
        self.start_time = 0.0;
        self.end_time = 0.0;
        self.has_start_time = false;
        self.current_segment_id = SegmentId::new();
    }

    /// Force the current card closed regardless of thresholds — recording
    /// stop or client disconnect.
    pub fn force_close(&mut self) -> Vec<SegmentEvent> {
        if self.buffer.trim().is_empty() {
            return Vec::new();
        }
        let closed = ClosedSegment {
            segment_id: self.current_segment_id,
            text: self.buffer.clone(),
            start: self.start_time,
            end: self.end_time,
            word_count: self.word_count(),
        };
        self.reset_for_new_segment();
        vec![SegmentEvent::Closed(closed)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_thresholds() {
        assert!(SegmentSupervisor::new(60, 30).is_err());
        assert!(SegmentSupervisor::new(30, 30).is_err());
    }

    #[test]
    fn short_fragment_only_produces_updated() {
        let mut sup = SegmentSupervisor::new(30, 60).unwrap();
        let events = sup.add_transcript("hello world", 0.0, 1.0);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SegmentEvent::Updated { .. }));
    }

    #[test]
    fn soft_threshold_only_splits_on_sentence_boundary() {
        let mut sup = SegmentSupervisor::new(3, 10).unwrap();
        // 3 words, no terminal punctuation: must not split yet.
        let events = sup.add_transcript("one two three", 0.0, 1.0);
        assert_eq!(events.len(), 1);

        // Now it ends with punctuation and is at/above the soft threshold.
        let events = sup.add_transcript("four.", 1.0, 2.0);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SegmentEvent::Updated { .. }));
        assert!(matches!(events[1], SegmentEvent::Closed(_)));
        assert!(matches!(events[2], SegmentEvent::Created { .. }));
    }

    #[test]
    fn hard_threshold_splits_without_punctuation() {
        let mut sup = SegmentSupervisor::new(3, 5).unwrap();
        let events = sup.add_transcript("one two three four five", 0.0, 1.0);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], SegmentEvent::Closed(_)));
    }

    #[test]
    fn force_close_on_empty_buffer_is_a_no_op() {
        let mut sup = SegmentSupervisor::new(30, 60).unwrap();
        assert!(sup.force_close().is_empty());
    }

    #[test]
    fn force_close_flushes_and_rotates_segment_id() {
        let mut sup = SegmentSupervisor::new(30, 60).unwrap();
        let first_id = sup.current_segment_id();
        sup.add_transcript("partial card", 0.0, 1.0);

        let events = sup.force_close();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SegmentEvent::Closed(closed) => {
                assert_eq!(closed.segment_id, first_id);
                assert_eq!(closed.word_count, 2);
            }
            _ => panic!("expected Closed event"),
        }
        assert_ne!(sup.current_segment_id(), first_id);
    }
}
