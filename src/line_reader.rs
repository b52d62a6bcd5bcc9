//! Growable newline-delimited line reader
//!
//! Starts at a small initial capacity and grows as bytes accumulate, capping
//! at `LINE_BUFFER_MAX`. A line that would exceed the cap is discarded (not
//! the read loop) — bytes up to the next `\n` are dropped and the caller is
//! told how long the rejected line was, so it can bump its error counter.

use crate::constants::{LINE_BUFFER_INITIAL, LINE_BUFFER_MAX};

#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Line(Vec<u8>),
    TooLong(usize),
}

pub struct LineReader {
    buf: Vec<u8>,
    max: usize,
    overflowing: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::with_limits(LINE_BUFFER_INITIAL, LINE_BUFFER_MAX)
    }

    pub fn with_limits(initial: usize, max: usize) -> Self {
        Self {
            buf: Vec::with_capacity(initial.min(max)),
            max,
            overflowing: false,
        }
    }

    /// Feed newly read bytes, returning every complete line (or rejection)
    /// found within them. Bytes with no terminating `\n` yet stay buffered.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LineOutcome> {
        let mut out = Vec::new();
        for &b in data {
            if self.overflowing {
                if b == b'\n' {
                    out.push(LineOutcome::TooLong(self.buf.len()));
                    self.buf.clear();
                    self.overflowing = false;
                }
                continue;
            }

            if b == b'\n' {
                let mut line = std::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                out.push(LineOutcome::Line(line));
            } else {
                self.buf.push(b);
                if self.buf.len() > self.max {
                    self.overflowing = true;
                }
            }
        }
        out
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Reassembly must not depend on how the source bytes happen to be
    /// chunked across `read()` calls — a serial port can hand back any
    /// split of the same stream depending on timing.
    fn lines_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
        proptest::collection::vec(
            proptest::collection::vec(prop_oneof![Just(b'A'), Just(b'b'), Just(b'9'), Just(b' ')], 0..40),
            0..8,
        )
    }

    fn split_into_chunks(data: &[u8], cut_points: &[usize]) -> Vec<Vec<u8>> {
        let mut points: Vec<usize> = cut_points.iter().map(|&p| p % (data.len() + 1)).collect();
        points.sort_unstable();
        points.push(data.len());
        let mut chunks = Vec::new();
        let mut start = 0;
        for end in points {
            if end >= start {
                chunks.push(data[start..end].to_vec());
                start = end;
            }
        }
        chunks
    }

    proptest! {
        #[test]
        fn recovers_same_lines_regardless_of_chunk_boundaries(
            lines in lines_strategy(),
            cut_points in proptest::collection::vec(0usize..500, 0..20),
        ) {
            let mut joined = Vec::new();
            for line in &lines {
                joined.extend_from_slice(line);
                joined.push(b'\n');
            }

            let chunks = split_into_chunks(&joined, &cut_points);
            let mut reader = LineReader::new();
            let mut recovered = Vec::new();
            for chunk in &chunks {
                for outcome in reader.feed(chunk) {
                    if let LineOutcome::Line(l) = outcome {
                        recovered.push(l);
                    }
                }
            }

            prop_assert_eq!(recovered, lines);
        }
    }
}
