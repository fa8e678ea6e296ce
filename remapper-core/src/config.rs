//! Mapping configuration: in-RAM model, flash image codec, and the
//! feature-report command surface.
//!
//! The persisted image is exactly [`PERSISTED_CONFIG_SIZE`] bytes, sized
//! to one flash erase sector:
//!
//! ```text
//! [magic u32][version u32][rule_count u32][monitor u8 | pad u8*3]
//! [rule records, RULE_RECORD_LEN bytes each]
//! [zero fill ... ][crc32 u32]   (CRC_32_ISO_HDLC over everything before it)
//! ```
//!
//! Loading never fails: a bad magic, version, CRC, or rule record falls
//! back to [`Config::default`], because a corrupt config must degrade the
//! device to "no mappings", not brick it.

use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec;
use hid_proto::Usage;

use crate::mapping::{MappingRule, RuleKind, MAX_COMBO_EXTRA, MAX_RULES};

/// Size of the persisted flash image, one RP2040 erase sector.
pub const PERSISTED_CONFIG_SIZE: usize = 4096;

/// Fixed size of one serialized rule.
pub const RULE_RECORD_LEN: usize = 28;

/// Current image format version.
pub const CONFIG_VERSION: u32 = 1;

const MAGIC: u32 = 0x5041_4D52; // "RMAP"
const HEADER_LEN: usize = 16;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const _RULES_FIT: () = assert!(
    HEADER_LEN + MAX_RULES * RULE_RECORD_LEN + 4 <= PERSISTED_CONFIG_SIZE,
    "rule table must fit the flash image"
);

/// Config decode / command errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Wrong magic number.
    BadMagic,
    /// Unknown format version.
    BadVersion,
    /// Image checksum mismatch.
    BadCrc,
    /// A rule record names an unknown kind or inconsistent fields.
    BadRule,
    /// More rules than the table holds.
    TooManyRules,
    /// A command frame is shorter than its opcode requires.
    ShortCommand,
    /// Unknown command opcode.
    UnknownCommand,
    /// A descriptor upload overflowed its staging buffer or failed to
    /// parse.
    BadDescriptor,
}

/// Side effect a successfully applied command asks the main loop for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandEffect {
    /// Config changed in RAM; mark dirty.
    Updated,
    /// Flush the current config to flash.
    Persist,
    /// Reboot into the ROM bootloader.
    Bootloader,
}

/// Command frame opcodes (first byte of a feature report payload).
pub mod opcode {
    pub const RESET: u8 = 0x01;
    pub const CLEAR_RULES: u8 = 0x02;
    pub const ADD_RULE: u8 = 0x03;
    pub const PERSIST: u8 = 0x04;
    pub const SET_MONITOR: u8 = 0x05;
    pub const BOOTLOADER: u8 = 0x06;
    /// Chunked downstream-descriptor upload. Driver state, not config
    /// state: the driver routes it before `apply_command` sees the frame.
    pub const SET_DESCRIPTOR: u8 = 0x07;
}

mod rule_kind {
    pub const PASSTHROUGH: u8 = 0;
    pub const KEY_REMAP: u8 = 1;
    pub const GPIO_KEY: u8 = 2;
    pub const ABS_TO_REL: u8 = 3;
    pub const COMBO: u8 = 4;
}

/// The active mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    /// Whether the monitor interface report is emitted.
    pub monitor_enabled: bool,
    /// Ordered rule list; order is evaluation order.
    pub rules: Vec<MappingRule, MAX_RULES>,
}

impl Default for Config {
    /// Empty rule set: the device stays enumerable and the monitor still
    /// shows raw input, there is just nothing mapped.
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            monitor_enabled: true,
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Decode a flash image, falling back to the default config on any
    /// structural problem.
    #[must_use]
    pub fn load(image: &[u8]) -> Self {
        match Self::decode(image) {
            Ok(config) => config,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("config image rejected ({}), using defaults", _e);
                Self::default()
            }
        }
    }

    /// Strict decode, used by [`Config::load`] and tests.
    pub fn decode(image: &[u8]) -> Result<Self, ConfigError> {
        if image.len() < PERSISTED_CONFIG_SIZE {
            return Err(ConfigError::BadCrc);
        }
        let image = &image[..PERSISTED_CONFIG_SIZE];
        let stored_crc = read_u32(image, PERSISTED_CONFIG_SIZE - 4);
        if CRC32.checksum(&image[..PERSISTED_CONFIG_SIZE - 4]) != stored_crc {
            return Err(ConfigError::BadCrc);
        }
        if read_u32(image, 0) != MAGIC {
            return Err(ConfigError::BadMagic);
        }
        let version = read_u32(image, 4);
        if version != CONFIG_VERSION {
            return Err(ConfigError::BadVersion);
        }
        let rule_count = read_u32(image, 8) as usize;
        if rule_count > MAX_RULES {
            return Err(ConfigError::TooManyRules);
        }
        let monitor_enabled = image[12] != 0;

        let mut rules = Vec::new();
        for i in 0..rule_count {
            let at = HEADER_LEN + i * RULE_RECORD_LEN;
            let record = image
                .get(at..at + RULE_RECORD_LEN)
                .ok_or(ConfigError::BadRule)?;
            rules
                .push(decode_rule(record)?)
                .map_err(|_| ConfigError::TooManyRules)?;
        }
        Ok(Self {
            version,
            monitor_enabled,
            rules,
        })
    }

    /// Serialize into a full flash image, CRC included.
    pub fn serialize(&self, out: &mut [u8; PERSISTED_CONFIG_SIZE]) {
        out.fill(0);
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&(self.rules.len() as u32).to_le_bytes());
        out[12] = self.monitor_enabled as u8;
        for (i, rule) in self.rules.iter().enumerate() {
            let at = HEADER_LEN + i * RULE_RECORD_LEN;
            encode_rule(rule, &mut out[at..at + RULE_RECORD_LEN]);
        }
        let crc = CRC32.checksum(&out[..PERSISTED_CONFIG_SIZE - 4]);
        out[PERSISTED_CONFIG_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Apply one host command frame (feature report payload).
    ///
    /// Mutating commands only change the in-RAM config; the caller owns
    /// the dirty flag and the deferred flash write.
    pub fn apply_command(&mut self, frame: &[u8]) -> Result<CommandEffect, ConfigError> {
        let (&op, rest) = frame.split_first().ok_or(ConfigError::ShortCommand)?;
        match op {
            opcode::RESET => {
                *self = Self::default();
                Ok(CommandEffect::Updated)
            }
            opcode::CLEAR_RULES => {
                self.rules.clear();
                Ok(CommandEffect::Updated)
            }
            opcode::ADD_RULE => {
                let record = rest
                    .get(..RULE_RECORD_LEN)
                    .ok_or(ConfigError::ShortCommand)?;
                let rule = decode_rule(record)?;
                self.rules.push(rule).map_err(|_| ConfigError::TooManyRules)?;
                Ok(CommandEffect::Updated)
            }
            opcode::SET_MONITOR => {
                let &enabled = rest.first().ok_or(ConfigError::ShortCommand)?;
                self.monitor_enabled = enabled != 0;
                Ok(CommandEffect::Updated)
            }
            opcode::PERSIST => Ok(CommandEffect::Persist),
            opcode::BOOTLOADER => Ok(CommandEffect::Bootloader),
            _ => Err(ConfigError::UnknownCommand),
        }
    }
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Rule record layout:
/// `[kind u8][param u8][pad u16][source u32][target u32][extra u32 * 3]`.
/// `param` is the divisor for abs-to-rel and the extra-source count for
/// combos; unused extras are zero.
fn encode_rule(rule: &MappingRule, out: &mut [u8]) {
    let (kind, param, extras) = match &rule.kind {
        RuleKind::Passthrough => (rule_kind::PASSTHROUGH, 0, &[][..]),
        RuleKind::KeyRemap => (rule_kind::KEY_REMAP, 0, &[][..]),
        RuleKind::GpioKey => (rule_kind::GPIO_KEY, 0, &[][..]),
        RuleKind::AbsToRel { divisor } => (rule_kind::ABS_TO_REL, *divisor, &[][..]),
        RuleKind::Combo { extra } => (rule_kind::COMBO, extra.len() as u8, extra.as_slice()),
    };
    out.fill(0);
    out[0] = kind;
    out[1] = param;
    out[4..8].copy_from_slice(&rule.source.raw().to_le_bytes());
    out[8..12].copy_from_slice(&rule.target.raw().to_le_bytes());
    for (i, usage) in extras.iter().enumerate() {
        let at = 12 + i * 4;
        out[at..at + 4].copy_from_slice(&usage.raw().to_le_bytes());
    }
}

fn decode_rule(record: &[u8]) -> Result<MappingRule, ConfigError> {
    if record.len() < RULE_RECORD_LEN {
        return Err(ConfigError::BadRule);
    }
    let param = record[1];
    let source = Usage::from_raw(read_u32(record, 4));
    let target = Usage::from_raw(read_u32(record, 8));
    let kind = match record[0] {
        rule_kind::PASSTHROUGH => RuleKind::Passthrough,
        rule_kind::KEY_REMAP => RuleKind::KeyRemap,
        rule_kind::GPIO_KEY => RuleKind::GpioKey,
        rule_kind::ABS_TO_REL => RuleKind::AbsToRel { divisor: param },
        rule_kind::COMBO => {
            if param as usize > MAX_COMBO_EXTRA {
                return Err(ConfigError::BadRule);
            }
            let mut extra = Vec::new();
            for i in 0..param as usize {
                let usage = Usage::from_raw(read_u32(record, 12 + i * 4));
                extra.push(usage).map_err(|_| ConfigError::BadRule)?;
            }
            RuleKind::Combo { extra }
        }
        _ => return Err(ConfigError::BadRule),
    };
    Ok(MappingRule {
        kind,
        source,
        target,
    })
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use hid_proto::usage::pages;
    use std::boxed::Box;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.monitor_enabled = false;
        config
            .rules
            .push(MappingRule {
                kind: RuleKind::Passthrough,
                source: Usage::new(pages::BUTTON, 1),
                target: Usage::new(pages::BUTTON, 1),
            })
            .unwrap();
        let mut extra = Vec::new();
        extra.push(Usage::gpio(3)).unwrap();
        extra.push(Usage::gpio(4)).unwrap();
        config
            .rules
            .push(MappingRule {
                kind: RuleKind::Combo { extra },
                source: Usage::gpio(2),
                target: Usage::new(pages::KEYBOARD, 0x29),
            })
            .unwrap();
        config
            .rules
            .push(MappingRule {
                kind: RuleKind::AbsToRel { divisor: 4 },
                source: Usage::new(pages::GENERIC_DESKTOP, 0x37),
                target: Usage::new(pages::GENERIC_DESKTOP, 0x30),
            })
            .unwrap();
        config
    }

    fn image_of(config: &Config) -> Box<[u8; PERSISTED_CONFIG_SIZE]> {
        let mut image = Box::new([0u8; PERSISTED_CONFIG_SIZE]);
        config.serialize(&mut image);
        image
    }

    #[test]
    fn serialize_load_roundtrip() {
        let config = sample_config();
        let image = image_of(&config);
        assert_eq!(Config::load(&image[..]), config);
    }

    #[test]
    fn corrupt_checksum_falls_back_to_default() {
        let config = sample_config();
        let mut image = image_of(&config);
        image[PERSISTED_CONFIG_SIZE - 1] ^= 0x01;
        let loaded = Config::load(&image[..]);
        assert_eq!(loaded, Config::default());
        assert!(loaded.monitor_enabled);
    }

    #[test]
    fn corrupt_body_falls_back_to_default() {
        let config = sample_config();
        let mut image = image_of(&config);
        image[HEADER_LEN] ^= 0xFF; // first rule's kind byte
        assert_eq!(Config::load(&image[..]), Config::default());
    }

    #[test]
    fn erased_flash_falls_back_to_default() {
        let image = [0xFFu8; PERSISTED_CONFIG_SIZE];
        assert_eq!(Config::load(&image), Config::default());
        assert_eq!(Config::decode(&image), Err(ConfigError::BadCrc));
    }

    #[test]
    fn short_image_falls_back_to_default() {
        assert_eq!(Config::load(&[0x52, 0x4D]), Config::default());
    }

    #[test]
    fn unknown_rule_kind_is_rejected() {
        let mut record = [0u8; RULE_RECORD_LEN];
        record[0] = 0x7F;
        assert_eq!(decode_rule(&record), Err(ConfigError::BadRule));
    }

    #[test]
    fn add_rule_command() {
        let mut config = Config::default();
        let mut frame = [0u8; 1 + RULE_RECORD_LEN];
        frame[0] = opcode::ADD_RULE;
        encode_rule(
            &MappingRule {
                kind: RuleKind::GpioKey,
                source: Usage::gpio(3),
                target: Usage::new(pages::KEYBOARD, 0x04),
            },
            &mut frame[1..],
        );
        assert_eq!(config.apply_command(&frame), Ok(CommandEffect::Updated));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].source, Usage::gpio(3));
    }

    #[test]
    fn command_surface() {
        let mut config = sample_config();
        assert_eq!(
            config.apply_command(&[opcode::SET_MONITOR, 1]),
            Ok(CommandEffect::Updated)
        );
        assert!(config.monitor_enabled);

        assert_eq!(
            config.apply_command(&[opcode::PERSIST]),
            Ok(CommandEffect::Persist)
        );
        assert_eq!(
            config.apply_command(&[opcode::BOOTLOADER]),
            Ok(CommandEffect::Bootloader)
        );

        assert_eq!(
            config.apply_command(&[opcode::CLEAR_RULES]),
            Ok(CommandEffect::Updated)
        );
        assert!(config.rules.is_empty());

        assert_eq!(config.apply_command(&[]), Err(ConfigError::ShortCommand));
        assert_eq!(
            config.apply_command(&[0xEE]),
            Err(ConfigError::UnknownCommand)
        );
        assert_eq!(
            config.apply_command(&[opcode::ADD_RULE, 1, 2]),
            Err(ConfigError::ShortCommand)
        );
    }

    #[test]
    fn rule_table_capacity_is_enforced() {
        let mut config = Config::default();
        let mut frame = [0u8; 1 + RULE_RECORD_LEN];
        frame[0] = opcode::ADD_RULE;
        for _ in 0..MAX_RULES {
            assert_eq!(config.apply_command(&frame), Ok(CommandEffect::Updated));
        }
        assert_eq!(
            config.apply_command(&frame),
            Err(ConfigError::TooManyRules)
        );
    }
}
