//! Per-node random streams with exact state capture.
//!
//! Every [`ScheduleNode`](crate::ScheduleNode) owns one [`RngStream`]. The
//! stream is a `ChaCha8Rng`, whose full state is its 32-byte seed, the
//! stream number, and the word position. Capturing those three values and
//! rebuilding from them continues the exact same sequence, which is what
//! makes restore-then-continue identical to an uninterrupted run.

use std::collections::BTreeMap;

use cadence_types::{FieldError, FieldValue};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Number of bytes in a `ChaCha8Rng` seed.
const SEED_LEN: usize = 32;

/// Exact, serializable state of an [`RngStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngState {
    /// The 32-byte key the generator was seeded with.
    pub seed: [u8; SEED_LEN],
    /// Stream number.
    pub stream: u64,
    /// Position in the stream, in 32-bit words.
    pub word_pos: u128,
}

/// Seeded pseudo-random stream owned by a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngStream {
    rng: ChaCha8Rng,
}

impl RngStream {
    /// Create a stream from `seed`, or from thread entropy when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    /// Deterministic stream for `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Stream seeded from the thread-local generator.
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    /// Rebuild a stream that continues exactly where `state` left off.
    pub fn from_state(state: &RngState) -> Self {
        let mut rng = ChaCha8Rng::from_seed(state.seed);
        rng.set_stream(state.stream);
        rng.set_word_pos(state.word_pos);
        Self { rng }
    }

    /// Capture the exact generator state.
    pub fn state(&self) -> RngState {
        RngState {
            seed: self.rng.get_seed(),
            stream: self.rng.get_stream(),
            word_pos: self.rng.get_word_pos(),
        }
    }

    /// Mutable access to the generator for domain draws.
    pub const fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Draw `size` integers with at most `max_digits` decimal digits each,
    /// suitable as seeds for nodes created during a run.
    pub fn random_seeds(&mut self, size: usize, max_digits: u32) -> Vec<u64> {
        let upper = 10_u64.checked_pow(max_digits.min(19)).unwrap_or(u64::MAX);
        (0..size)
            .map(|_| self.rng.random_range(0..upper.max(1)))
            .collect()
    }

    /// Encode the state as a `dict` field value.
    ///
    /// The seed is a list of byte-valued ints; stream and word position are
    /// decimal strings because `word_pos` does not fit in an `i64`.
    pub fn to_field_value(&self) -> FieldValue {
        let state = self.state();
        let mut dict = BTreeMap::new();
        dict.insert(
            "seed".to_owned(),
            FieldValue::List(
                state
                    .seed
                    .iter()
                    .map(|b| FieldValue::Int(i64::from(*b)))
                    .collect(),
            ),
        );
        dict.insert(
            "stream".to_owned(),
            FieldValue::Str(state.stream.to_string()),
        );
        dict.insert(
            "word_pos".to_owned(),
            FieldValue::Str(state.word_pos.to_string()),
        );
        FieldValue::Dict(dict)
    }

    /// Decode a stream from the value produced by [`RngStream::to_field_value`].
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::Mistyped`] or [`FieldError::Malformed`] if the
    /// value does not describe a valid generator state.
    pub fn from_field_value(name: &str, value: &FieldValue) -> Result<Self, FieldError> {
        let malformed = |reason: &str| FieldError::Malformed {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        let FieldValue::Dict(dict) = value else {
            return Err(FieldError::Mistyped {
                name: name.to_owned(),
                expected: "dict".to_owned(),
                found: value.tag(),
            });
        };

        let Some(FieldValue::List(bytes)) = dict.get("seed") else {
            return Err(malformed("seed must be a list of bytes"));
        };
        if bytes.len() != SEED_LEN {
            return Err(malformed("seed must hold exactly 32 bytes"));
        }
        let mut seed = [0_u8; SEED_LEN];
        for (slot, byte) in seed.iter_mut().zip(bytes) {
            let FieldValue::Int(v) = byte else {
                return Err(malformed("seed bytes must be ints"));
            };
            *slot = u8::try_from(*v)
                .map_err(|err| malformed(&format!("seed byte {v} out of range: {err}")))?;
        }

        let stream = match dict.get("stream") {
            Some(FieldValue::Str(text)) => text
                .parse::<u64>()
                .map_err(|err| malformed(&format!("stream is not a u64: {err}")))?,
            _ => return Err(malformed("stream must be a decimal string")),
        };
        let word_pos = match dict.get("word_pos") {
            Some(FieldValue::Str(text)) => text
                .parse::<u128>()
                .map_err(|err| malformed(&format!("word_pos is not a u128: {err}")))?,
            _ => return Err(malformed("word_pos must be a decimal string")),
        };

        Ok(Self::from_state(&RngState {
            seed,
            stream,
            word_pos,
        }))
    }
}
