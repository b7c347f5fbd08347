use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Position of one kernel tile: which convolutional layer (counted among convolutional layers
/// only), which output filter of that layer and which input channel of that filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId {
    pub layer: usize,
    pub filter: usize,
    pub channel: usize,
}

impl KernelId {
    pub fn new(layer: usize, filter: usize, channel: usize) -> KernelId {
        KernelId {
            layer,
            filter,
            channel,
        }
    }
}

// Formats as `l{layer}-f{filter}-k{channel}`, the key the history store and the CLI use.
impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}-f{}-k{}", self.layer, self.filter, self.channel)
    }
}

impl FromStr for KernelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidKernelId(s.to_string());

        // Each part must carry its own prefix followed by nothing but decimal digits, so that
        // strings like "l+1-f0-k0" or "l1-f0-k0-x" are refused instead of half-parsed.
        fn part(field: Option<&str>, prefix: char) -> Option<usize> {
            let digits = field?.strip_prefix(prefix)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        }

        let mut fields = s.split('-');
        let layer = part(fields.next(), 'l').ok_or_else(invalid)?;
        let filter = part(fields.next(), 'f').ok_or_else(invalid)?;
        let channel = part(fields.next(), 'k').ok_or_else(invalid)?;
        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(KernelId::new(layer, filter, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_layer_filter_and_channel_prefixes() {
        assert_eq!(KernelId::new(0, 2, 0).to_string(), "l0-f2-k0");
        assert_eq!(KernelId::new(12, 7, 345).to_string(), "l12-f7-k345");
    }

    #[test]
    fn parsing_inverts_formatting() {
        for layer in (0..1000).step_by(97) {
            for filter in (0..1000).step_by(89) {
                for channel in (0..1000).step_by(83) {
                    let id = KernelId::new(layer, filter, channel);
                    assert_eq!(id.to_string().parse::<KernelId>().unwrap(), id);
                }
            }
        }
        let edge = KernelId::new(999, 999, 999);
        assert_eq!(edge.to_string().parse::<KernelId>().unwrap(), edge);
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in [
            "",
            "l0-f0",
            "l0-f0-k",
            "f0-l0-k0",
            "l0-f0-k0-",
            "l0-f0-k0-x1",
            "l-1-f0-k0",
            "l+1-f0-k0",
            "l0_f0_k0",
            "L0-F0-K0",
        ] {
            assert!(
                matches!(bad.parse::<KernelId>(), Err(Error::InvalidKernelId(_))),
                "{bad:?} should not parse"
            );
        }
    }
}
