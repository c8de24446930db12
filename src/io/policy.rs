//! Output policies: how the root turns tree-wide inputs into outputs.
//!
//! This is the customization point of the distributed I/O engine. Policies
//! see only the input bitmaps and must be pure.
use super::shared::CHANNELS;

pub trait OutputPolicy: Send + Sync {
    fn compute_outputs(&self, inputs: &[u32; CHANNELS]) -> [u32; CHANNELS];

    fn name(&self) -> &'static str;
}

/// Worked example: output channel 0 of device 0 is on while devices 0 and 1
/// both hold input channel 0 active. Everything else stays off.
#[derive(Debug, Default, Clone, Copy)]
pub struct AndPolicy;

impl OutputPolicy for AndPolicy {
    fn compute_outputs(&self, inputs: &[u32; CHANNELS]) -> [u32; CHANNELS] {
        let mut outputs = [0u32; CHANNELS];
        if inputs[0] & 0b01 != 0 && inputs[0] & 0b10 != 0 {
            outputs[0] |= 1;
        }
        outputs
    }

    fn name(&self) -> &'static str {
        "and"
    }
}

/// Outputs mirror inputs bit for bit.
#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorPolicy;

impl OutputPolicy for MirrorPolicy {
    fn compute_outputs(&self, inputs: &[u32; CHANNELS]) -> [u32; CHANNELS] {
        *inputs
    }

    fn name(&self) -> &'static str {
        "mirror"
    }
}

/// Look up a built-in policy by name.
pub fn by_name(name: &str) -> Option<Box<dyn OutputPolicy>> {
    match name {
        "and" => Some(Box::new(AndPolicy)),
        "mirror" => Some(Box::new(MirrorPolicy)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_policy_needs_both_bits() {
        let p = AndPolicy;
        assert_eq!(p.compute_outputs(&[0b01, 0, 0]), [0, 0, 0]);
        assert_eq!(p.compute_outputs(&[0b10, 0, 0]), [0, 0, 0]);
        assert_eq!(p.compute_outputs(&[0b11, 0, 0]), [1, 0, 0]);
        assert_eq!(p.compute_outputs(&[0xFFFF_FFFF, 3, 3]), [1, 0, 0]);
        assert_eq!(p.compute_outputs(&[0, 0b11, 0]), [0, 0, 0]);
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(by_name("mirror").unwrap().compute_outputs(&[1, 2, 3]), [1, 2, 3]);
        assert_eq!(by_name("and").unwrap().name(), "and");
        assert!(by_name("xor").is_none());
    }
}
