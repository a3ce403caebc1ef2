//! Device masks, HAL capability bits, resource ids and priorities.

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Bit mask of microphone-side devices.
///
/// The low nibble selects the local microphone array, the next nibble the echo canceller
/// reference and the high byte external (remote) sources.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InputDevices(pub u32);

impl InputDevices {
    /// No input device.
    pub const NONE: Self = Self(0x0000);
    /// Single local microphone.
    pub const SINGLE: Self = Self(0x0001);
    /// Three-microphone beamformed array.
    pub const TRI: Self = Self(0x0002);
    /// Four-microphone beamformed array.
    pub const QUAD: Self = Self(0x0004);
    /// Bluetooth hands-free profile input.
    pub const HFP: Self = Self(0x0008);
    /// Mono echo canceller reference.
    pub const EC_REF_MONO: Self = Self(0x0010);
    /// Stereo echo canceller reference.
    pub const EC_REF_STEREO: Self = Self(0x0020);
    /// 5.1 echo canceller reference.
    pub const EC_REF_5_1: Self = Self(0x0040);
    /// Push-to-talk remote.
    pub const PTT: Self = Self(0x0100);
    /// Far-field remote.
    pub const FF: Self = Self(0x0200);
    /// Tap of the local microphone for a secondary consumer.
    pub const MIC_TAP: Self = Self(0x0400);
    /// Invalid device mask.
    pub const INVALID: Self = Self(0xFFFF);

    const KNOWN: u32 = 0x000F | 0x0070 | 0x0700;

    /// Local microphone bits.
    #[must_use]
    pub fn local(self) -> Self {
        Self(self.0 & 0x000F)
    }

    /// Echo canceller reference bits.
    #[must_use]
    pub fn ec_ref(self) -> Self {
        Self(self.0 & 0x00F0)
    }

    /// External source bits.
    #[must_use]
    pub fn external(self) -> Self {
        Self(self.0 & 0xFF00)
    }

    /// True when no bit is set.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True when any bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True when only known device bits are set.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID && self.0 & !Self::KNOWN == 0
    }

    /// Channel quantity delivered by the local microphone selection.
    #[must_use]
    pub fn local_channel_qty(self) -> u8 {
        if self.contains(Self::QUAD) {
            4
        } else if self.contains(Self::TRI) {
            3
        } else {
            1
        }
    }
}

impl BitOr for InputDevices {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for InputDevices {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for InputDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(InputDevices, &str); 10] = [
            (InputDevices::SINGLE, "SINGLE"),
            (InputDevices::TRI, "TRI"),
            (InputDevices::QUAD, "QUAD"),
            (InputDevices::HFP, "HFP"),
            (InputDevices::EC_REF_MONO, "EC_REF_MONO"),
            (InputDevices::EC_REF_STEREO, "EC_REF_STEREO"),
            (InputDevices::EC_REF_5_1, "EC_REF_5_1"),
            (InputDevices::PTT, "PTT"),
            (InputDevices::FF, "FF"),
            (InputDevices::MIC_TAP, "MIC_TAP"),
        ];
        if self.is_none() {
            return f.write_str("NONE");
        }
        if *self == Self::INVALID {
            return f.write_str("INVALID");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// Bit mask of speaker-side devices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutputDevices(pub u32);

impl OutputDevices {
    /// No output device.
    pub const NONE: Self = Self(0x0000);
    /// Regular PCM speaker path.
    pub const NORMAL: Self = Self(0x0001);
    /// Echo canceller reference output.
    pub const EC_REF: Self = Self(0x0002);
    /// Offloaded stream processing.
    pub const OFFLOAD: Self = Self(0x0004);
    /// Bluetooth hands-free profile output.
    pub const HFP: Self = Self(0x0008);
    /// Invalid device mask.
    pub const INVALID: Self = Self(0xFFFF);

    /// True when no bit is set.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True when only known device bits are set.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID && self.0 & !0x000F == 0
    }
}

impl fmt::Debug for OutputDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "NONE",
            Self::NORMAL => "NORMAL",
            Self::EC_REF => "EC_REF",
            Self::OFFLOAD => "OFFLOAD",
            Self::HFP => "HFP",
            _ => return write!(f, "0x{:04x}", self.0),
        };
        f.write_str(name)
    }
}

/// Capability bits the HAL reports for one input resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputCaps(pub u16);

impl InputCaps {
    /// No capabilities.
    pub const NONE: Self = Self(0x0000);
    /// Local microphone delivering 16-bit PCM.
    pub const LOCAL: Self = Self(0x0001);
    /// Push-to-talk remote source.
    pub const PTT: Self = Self(0x0002);
    /// Far-field remote source.
    pub const FF: Self = Self(0x0004);
    /// The input supports readiness polling.
    pub const SELECT: Self = Self(0x0008);
    /// Local microphone delivering 32-bit PCM.
    pub const LOCAL_32_BIT: Self = Self(0x0010);
    /// End-of-speech detection is performed by the source.
    pub const EOS_DETECTION: Self = Self(0x0020);

    /// True when any bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Capability bits the HAL reports for one output resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputCaps(pub u16);

impl OutputCaps {
    /// Default PCM processing.
    pub const NONE: Self = Self(0x0000);
    /// Volume is applied inside the HAL.
    pub const HAL_VOLUME_CONTROL: Self = Self(0x0001);
    /// Stream processing is offloaded to the HAL.
    pub const OFFLOAD: Self = Self(0x0002);
    /// PCM is processed by the engine and written directly.
    pub const DIRECT_PCM: Self = Self(0x0004);

    /// True when any bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Quantity of input and output resource ids.
pub const RESOURCE_ID_QTY: usize = 3;

/// A hardware resource id (0..=2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u8);

impl ResourceId {
    /// Sentinel stored in the shared region for "no id".
    pub(crate) const INVALID_RAW: u8 = RESOURCE_ID_QTY as u8;

    /// Wraps a raw id, rejecting values outside the pool.
    #[must_use]
    pub fn new(raw: u8) -> Option<Self> {
        (usize::from(raw) < RESOURCE_ID_QTY).then_some(Self(raw))
    }

    /// Raw id value.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// HAL capability table: how many resources exist and what each can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct HalCapabilities {
    /// Number of usable input resources.
    pub input_qty: u8,
    /// Number of usable output resources.
    pub output_qty: u8,
    /// Per-input capability bits.
    pub input_caps: [u16; RESOURCE_ID_QTY],
    /// Per-output capability bits.
    pub output_caps: [u16; RESOURCE_ID_QTY],
}

impl HalCapabilities {
    /// Capability bits of an input resource, or NONE when out of range.
    #[must_use]
    pub fn input(&self, id: ResourceId) -> InputCaps {
        if id.get() >= self.input_qty {
            InputCaps::NONE
        } else {
            InputCaps(self.input_caps[id.index()])
        }
    }

    /// Capability bits of an output resource, or NONE when out of range.
    #[must_use]
    pub fn output(&self, id: ResourceId) -> OutputCaps {
        if id.get() >= self.output_qty {
            OutputCaps::NONE
        } else {
            OutputCaps(self.output_caps[id.index()])
        }
    }
}

/// Priority of a resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourcePriority {
    /// Low priority.
    Low = 0,
    /// Medium priority.
    Medium = 1,
    /// High priority.
    High = 2,
}

impl ResourcePriority {
    /// Sentinel marking a free entry in the shared region.
    pub(crate) const FREE_RAW: u8 = 3;

    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

/// Power mode of the audio subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    /// Full power.
    #[default]
    Full,
    /// Low power (keyword detection may continue in the DSP).
    Low,
    /// Sleep.
    Sleep,
}
