//! Audio device bitmask and device-wide mode/orientation values.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Bitmask of routed audio devices. Output bits live in the low 16 bits,
/// input bits in the upper half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMask(pub u32);

impl DeviceMask {
    pub const NONE: DeviceMask = DeviceMask(0);

    pub const OUT_EARPIECE: DeviceMask = DeviceMask(0x1);
    pub const OUT_SPEAKER: DeviceMask = DeviceMask(0x2);
    pub const OUT_WIRED_HEADSET: DeviceMask = DeviceMask(0x4);
    pub const OUT_WIRED_HEADPHONE: DeviceMask = DeviceMask(0x8);
    pub const OUT_BLUETOOTH_SCO: DeviceMask = DeviceMask(0x10);
    pub const OUT_BLUETOOTH_SCO_HEADSET: DeviceMask = DeviceMask(0x20);
    pub const OUT_BLUETOOTH_SCO_CARKIT: DeviceMask = DeviceMask(0x40);
    pub const OUT_AUX_DIGITAL: DeviceMask = DeviceMask(0x400);
    pub const OUT_DEFAULT: DeviceMask = DeviceMask(0x4000_0000);
    pub const OUT_ALL_SCO: DeviceMask = DeviceMask(0x10 | 0x20 | 0x40);
    pub const OUT_ALL: DeviceMask = DeviceMask(0x4000_FFFF);

    pub const IN_COMMUNICATION: DeviceMask = DeviceMask(0x1_0000);
    pub const IN_AMBIENT: DeviceMask = DeviceMask(0x2_0000);
    pub const IN_BUILTIN_MIC: DeviceMask = DeviceMask(0x4_0000);
    pub const IN_BLUETOOTH_SCO_HEADSET: DeviceMask = DeviceMask(0x8_0000);
    pub const IN_WIRED_HEADSET: DeviceMask = DeviceMask(0x10_0000);
    pub const IN_AUX_DIGITAL: DeviceMask = DeviceMask(0x20_0000);
    pub const IN_VOICE_CALL: DeviceMask = DeviceMask(0x40_0000);
    pub const IN_BACK_MIC: DeviceMask = DeviceMask(0x80_0000);
    pub const IN_DEFAULT: DeviceMask = DeviceMask(0x8000_0000);
    pub const IN_ALL_SCO: DeviceMask = DeviceMask(0x8_0000);
    pub const IN_ALL: DeviceMask = DeviceMask(0x80FF_0000);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any bit of `other` is set in `self`.
    pub fn intersects(self, other: DeviceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, other: DeviceMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Outputs and inputs this device can route to.
    pub fn supported() -> DeviceMask {
        Self::OUT_SPEAKER
            | Self::OUT_WIRED_HEADPHONE
            | Self::OUT_AUX_DIGITAL
            | Self::OUT_ALL_SCO
            | Self::OUT_DEFAULT
            | Self::IN_BUILTIN_MIC
            | Self::IN_ALL_SCO
            | Self::IN_DEFAULT
    }
}

impl BitOr for DeviceMask {
    type Output = DeviceMask;

    fn bitor(self, rhs: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 | rhs.0)
    }
}

impl BitAnd for DeviceMask {
    type Output = DeviceMask;

    fn bitand(self, rhs: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 & rhs.0)
    }
}

impl Not for DeviceMask {
    type Output = DeviceMask;

    fn not(self) -> DeviceMask {
        DeviceMask(!self.0)
    }
}

impl fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    Normal,
    Ringtone,
    InCall,
    InCommunication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
    #[default]
    Undefined,
}

impl Orientation {
    pub fn from_param(value: &str) -> Self {
        match value {
            "landscape" => Orientation::Landscape,
            "portrait" => Orientation::Portrait,
            "square" => Orientation::Square,
            _ => Orientation::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sco_bits_are_outputs() {
        assert!(DeviceMask::OUT_ALL.contains(DeviceMask::OUT_ALL_SCO));
        assert!(!DeviceMask::OUT_ALL.intersects(DeviceMask::IN_BUILTIN_MIC));
        assert!(DeviceMask::IN_ALL.contains(DeviceMask::IN_ALL_SCO));
    }

    #[test]
    fn replacing_output_bits_keeps_inputs() {
        let devices = DeviceMask::OUT_SPEAKER | DeviceMask::IN_BUILTIN_MIC;
        let updated = (devices & !DeviceMask::OUT_ALL) | DeviceMask::OUT_WIRED_HEADPHONE;
        assert_eq!(updated, DeviceMask::OUT_WIRED_HEADPHONE | DeviceMask::IN_BUILTIN_MIC);
    }

    #[test]
    fn unknown_orientation_is_undefined() {
        assert_eq!(Orientation::from_param("portrait"), Orientation::Portrait);
        assert_eq!(Orientation::from_param("upside-down"), Orientation::Undefined);
    }
}
