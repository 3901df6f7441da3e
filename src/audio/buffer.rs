//! AudioBuffer (§4.1): append-only frame log with a distinguished header.

use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
pub struct AudioBuffer {
    frames: Vec<Vec<u8>>,
    header: Option<Vec<u8>>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, frame: Vec<u8>) {
        if self.header.is_none() {
            self.header = Some(frame.clone());
        }
        self.frames.push(frame);
    }

    pub fn count(&self) -> usize {
        self.frames.len()
    }

    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// Concatenation of all frames with index >= `offset`, prepending the
    /// header when `offset > 0` and the first included chunk doesn't
    /// already start with it.
    pub fn snapshot_from(&self, offset: usize) -> Result<Vec<u8>> {
        if offset > self.count() {
            return Err(CoreError::Internal(format!(
                "AudioBuffer::snapshot_from: offset {offset} exceeds frame count {}",
                self.count()
            )));
        }

        let tail = &self.frames[offset..];
        let mut out = Vec::new();

        if offset > 0 {
            if let Some(header) = &self.header {
                let starts_with_header = tail.first().is_some_and(|f| f.starts_with(header));
                if !starts_with_header {
                    out.extend_from_slice(header);
                }
            }
        }

        for frame in tail {
            out.extend_from_slice(frame);
        }
        Ok(out)
    }

    pub fn full_payload(&self) -> Vec<u8> {
        self.snapshot_from(0).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_becomes_header() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![1, 2, 3]);
        buf.append(vec![4, 5]);
        assert_eq!(buf.header(), Some(&[1u8, 2, 3][..]));
        assert_eq!(buf.count(), 2);
    }

    #[test]
    fn full_payload_concatenates_everything() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![1, 2]);
        buf.append(vec![3, 4]);
        assert_eq!(buf.full_payload(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn snapshot_from_prepends_header_when_missing() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![0xAA]); // header
        buf.append(vec![1, 2]);
        buf.append(vec![3, 4]);

        let snap = buf.snapshot_from(1).unwrap();
        assert_eq!(snap, vec![0xAA, 1, 2, 3, 4]);
    }

    #[test]
    fn snapshot_from_zero_has_no_duplicate_header() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![0xAA, 1]);
        buf.append(vec![2, 3]);

        let snap = buf.snapshot_from(0).unwrap();
        assert_eq!(snap, vec![0xAA, 1, 2, 3]);
    }

    #[test]
    fn snapshot_from_out_of_range_is_invariant_violation() {
        let mut buf = AudioBuffer::new();
        buf.append(vec![1]);
        assert!(buf.snapshot_from(5).is_err());
    }
}
