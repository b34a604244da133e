//! incremental UTF-8 validation across message fragments.
//!
//! a TEXT message's payload must be valid UTF-8 taken as a whole, but this
//! core surfaces each fragment as soon as it is parsed (see [`crate::connection`]),
//! so validation has to run incrementally: each fragment may end mid
//! multi-byte sequence, with the remainder completed by the next one.

/// carries at most 3 bytes of an incomplete trailing multi-byte sequence
/// between calls to [`Utf8Validator::push`]
#[derive(Debug, Default)]
pub struct Utf8Validator {
    carry: [u8; 3],
    carry_len: u8,
}

impl Utf8Validator {
    /// a validator with no carried state, ready for a new message
    pub fn new() -> Self {
        Self::default()
    }

    /// validate the next chunk of a message, carrying over any trailing
    /// incomplete sequence for the next call
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), ()> {
        let mut scratch;
        let data: &[u8] = if self.carry_len > 0 {
            scratch = Vec::with_capacity(self.carry_len as usize + chunk.len());
            scratch.extend_from_slice(&self.carry[..self.carry_len as usize]);
            scratch.extend_from_slice(chunk);
            &scratch
        } else {
            chunk
        };

        match std::str::from_utf8(data) {
            Ok(_) => {
                self.carry_len = 0;
                Ok(())
            }
            Err(e) => match e.error_len() {
                // a definite bad byte, not just a truncated sequence
                Some(_) => Err(()),
                None => {
                    let tail = &data[e.valid_up_to()..];
                    if tail.len() > self.carry.len() {
                        // more unconsumed bytes than any valid UTF-8 lead
                        // sequence could need: the lead byte itself is bad
                        return Err(());
                    }
                    self.carry[..tail.len()].copy_from_slice(tail);
                    self.carry_len = tail.len() as u8;
                    Ok(())
                }
            },
        }
    }

    /// call once the final fragment (FIN=1) has been pushed: a dangling
    /// incomplete sequence at message end is itself invalid UTF-8
    pub fn finish(&self) -> Result<(), ()> {
        if self.carry_len == 0 {
            Ok(())
        } else {
            Err(())
        }
    }
}

/// validate a single, complete (non-fragmented) message in one call
pub fn validate_complete(data: &[u8]) -> Result<(), ()> {
    std::str::from_utf8(data).map(|_| ()).map_err(|_| ())
}
