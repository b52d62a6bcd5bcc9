//! Autobaud Detector (C2)
//!
//! Tries candidate baud rates in the order supplied, settling between
//! trials so USB-serial adapters stabilize, and accepts the first rate whose
//! sampled bytes look like text.

use super::adapter::{ReadOutcome, SerialAdapter};
use crate::constants::AUTOBAUD_SETTLE_DELAY;
use std::time::{Duration, Instant};

pub struct AutobaudResult {
    pub baud: u32,
    pub ascii_ratio: f64,
    pub bytes_sampled: usize,
}

const SAMPLE_BUF_SIZE: usize = 4096;

fn is_ascii_text_byte(b: u8) -> bool {
    matches!(b, 0x09 | 0x0A | 0x0D) || (0x20..=0x7E).contains(&b)
}

fn ascii_ratio(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let good = data.iter().filter(|&&b| is_ascii_text_byte(b)).count();
    good as f64 / data.len() as f64
}

/// Sample one candidate rate; returns the bytes it collected and their ratio.
fn sample_rate(
    adapter: &SerialAdapter,
    rate: u32,
    per_rate_timeout: Duration,
    min_bytes: usize,
) -> Option<(f64, usize)> {
    adapter.set_baud(rate).ok()?;
    std::thread::sleep(AUTOBAUD_SETTLE_DELAY);
    let _ = adapter.reset_input_buffer();

    let mut sampled = Vec::with_capacity(SAMPLE_BUF_SIZE.max(min_bytes));
    let deadline = Instant::now() + per_rate_timeout;
    let mut buf = [0u8; SAMPLE_BUF_SIZE];

    while sampled.len() < min_bytes && Instant::now() < deadline {
        match adapter.read_into(&mut buf) {
            ReadOutcome::Bytes(n) => sampled.extend_from_slice(&buf[..n]),
            ReadOutcome::Timeout | ReadOutcome::Eof => continue,
            ReadOutcome::Error(_) => break,
        }
    }

    Some((ascii_ratio(&sampled), sampled.len()))
}

/// Try each candidate rate in order; return the first that is accepted
/// (ratio >= 0.80 AND bytes >= min_bytes), or `None` if none qualify.
pub fn detect(
    adapter: &SerialAdapter,
    candidate_rates: &[u32],
    per_rate_timeout: Duration,
    min_bytes: usize,
) -> Option<AutobaudResult> {
    for &rate in candidate_rates {
        let Some((ratio, bytes_sampled)) = sample_rate(adapter, rate, per_rate_timeout, min_bytes)
        else {
            continue;
        };
        if ratio >= 0.80 && bytes_sampled >= min_bytes {
            return Some(AutobaudResult {
                baud: rate,
                ascii_ratio: ratio,
                bytes_sampled,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_ascii_yields_high_ratio() {
        let ratio = ascii_ratio(b"Clean ASCII\n");
        assert!(ratio >= 0.95, "got {ratio}");
    }

    #[test]
    fn random_bytes_yield_low_ratio() {
        let data: Vec<u8> = (0u8..=255).collect();
        let ratio = ascii_ratio(&data);
        assert!((0.30..=0.50).contains(&ratio), "got {ratio}");
    }

    #[test]
    fn empty_sample_has_zero_ratio() {
        assert_eq!(ascii_ratio(&[]), 0.0);
    }

    #[test]
    fn boundary_ratio_exactly_point_eight_accepts() {
        // 8 printable bytes, 2 non-printable -> ratio exactly 0.80.
        let mut data = vec![b'A'; 8];
        data.extend_from_slice(&[0x00, 0x01]);
        assert_eq!(ascii_ratio(&data), 0.80);
    }
}
