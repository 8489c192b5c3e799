use crate::ddk::{OUTPUT_TOKEN_WORDS, ResultDescriptor};
use crate::error::{Error, Result};

/// Output token of a result descriptor.
///
/// Layout:
/// ```text
/// Word 0: bits 31..17 error code (15 bits), bits 16..0 processed length
/// Word 1: reserved
/// Word 2: application id, low 32 bits
/// Word 3: application id, high 32 bits
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputToken {
    pub packet_len: u32,
    pub error_code: u32,
    pub app_id: u64,
}

impl OutputToken {
    const LEN_MASK: u32 = 0x0001_FFFF;
    /// Largest packet the processed-length field can report.
    pub const MAX_PACKET_LEN: usize = Self::LEN_MASK as usize;
    const ERR_SHIFT: u32 = 17;
    const ERR_MASK: u32 = 0x7FFF;

    /// Encode into descriptor words.
    pub fn encode(self) -> [u32; OUTPUT_TOKEN_WORDS] {
        debug_assert!(self.packet_len <= Self::LEN_MASK, "packet_len exceeds 17 bits");
        debug_assert!(self.error_code <= Self::ERR_MASK, "error_code exceeds 15 bits");
        [
            (self.packet_len & Self::LEN_MASK) | ((self.error_code & Self::ERR_MASK) << Self::ERR_SHIFT),
            0,
            self.app_id as u32,
            (self.app_id >> 32) as u32,
        ]
    }

    pub fn parse(words: &[u32; OUTPUT_TOKEN_WORDS]) -> Self {
        OutputToken {
            packet_len: words[0] & Self::LEN_MASK,
            error_code: (words[0] >> Self::ERR_SHIFT) & Self::ERR_MASK,
            app_id: (words[2] as u64) | ((words[3] as u64) << 32),
        }
    }

    pub fn from_descriptor(rd: &ResultDescriptor) -> Self {
        Self::parse(&rd.output_token)
    }
}

/// Error-code bit reporting an authentication (ICV) mismatch.
pub const ERR_AUTH: u32 = 0x200;

/// Code reported by the ring handler for a result that completed with a
/// processing warning only.
pub const ERR_WARNING_ONLY: u32 = 0x4003;

/// Classified completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    IntegrityFailure,
    HardwareFault(u32),
}

impl Outcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::IntegrityFailure => Err(Error::IntegrityFailure),
            Outcome::HardwareFault(code) => Err(Error::HardwareFault(code)),
        }
    }
}

/// Classifier for completions harvested through ring notification.
pub fn classify_ring_status(code: u32) -> Outcome {
    if code == 0 {
        Outcome::Success
    } else if code & ERR_AUTH != 0 {
        Outcome::IntegrityFailure
    } else if code == ERR_WARNING_ONLY {
        Outcome::Success
    } else {
        Outcome::HardwareFault(code)
    }
}

/// Classifier for polled lookaside commands.
pub fn classify_lookaside_status(code: u32) -> Outcome {
    if code == 0 {
        Outcome::Success
    } else if code & ERR_AUTH != 0 {
        Outcome::IntegrityFailure
    } else {
        Outcome::HardwareFault(code)
    }
}

/// Which classifier a harvested entry is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classify {
    Ring,
    Lookaside,
}

impl Classify {
    pub(crate) fn apply(self, code: u32) -> Outcome {
        match self {
            Classify::Ring => classify_ring_status(code),
            Classify::Lookaside => classify_lookaside_status(code),
        }
    }
}
