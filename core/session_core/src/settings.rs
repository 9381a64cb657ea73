//! Session-wide render/audio settings shared by the host
//!
//! Wire layout (64 bytes, integers big-endian):
//!
//! ```text
//! 0        4      6       8     9      10      11               43    44    45         61    64
//! ┌────────┬──────┬───────┬─────┬──────┬───────┬────────────────┬─────┬─────┬──────────┬─────┐
//! │version │width │height │color│render│palette│ palette_custom │audio│encr │ reserved │ pad │
//! └────────┴──────┴───────┴─────┴──────┴───────┴────────────────┴─────┴─────┴──────────┴─────┘
//! ```

use crate::error::{Error, Result};

/// Encoded size of `SessionSettings`
pub const SETTINGS_WIRE_SIZE: usize = 64;

/// Palette field size; the last byte is always NUL
pub const PALETTE_CUSTOM_LEN: usize = 32;

const OFF_VERSION: usize = 0;
const OFF_WIDTH: usize = 4;
const OFF_HEIGHT: usize = 6;
const OFF_COLOR: usize = 8;
const OFF_RENDER: usize = 9;
const OFF_PALETTE_TYPE: usize = 10;
const OFF_PALETTE_CUSTOM: usize = 11;
const OFF_AUDIO: usize = 43;
const OFF_ENCRYPTION: usize = 44;
const OFF_RESERVED: usize = 45;
const RESERVED_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Eq)]
pub struct SessionSettings {
    pub version: u32,
    pub width: i16,
    pub height: i16,
    pub color_mode: u8,
    pub render_mode: u8,
    pub palette_type: u8,
    pub palette_custom: [u8; PALETTE_CUSTOM_LEN],
    pub audio_enabled: bool,
    pub encryption_required: bool,
    pub reserved: [u8; RESERVED_LEN],
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            version: 0,
            width: 80,
            height: 24,
            color_mode: 0,
            render_mode: 0,
            palette_type: 0,
            palette_custom: [0; PALETTE_CUSTOM_LEN],
            audio_enabled: true,
            encryption_required: false,
            reserved: [0; RESERVED_LEN],
        }
    }
}

/// Field equality; the version is not part of the value
impl PartialEq for SessionSettings {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.color_mode == other.color_mode
            && self.render_mode == other.render_mode
            && self.palette_type == other.palette_type
            && self.palette_custom == other.palette_custom
            && self.audio_enabled == other.audio_enabled
            && self.encryption_required == other.encryption_required
            && self.reserved == other.reserved
    }
}

impl SessionSettings {
    /// Set the custom palette, keeping at most 31 bytes
    pub fn set_palette_custom(&mut self, palette: &str) {
        self.palette_custom = [0; PALETTE_CUSTOM_LEN];
        let bytes = palette.as_bytes();
        let len = bytes.len().min(PALETTE_CUSTOM_LEN - 1);
        self.palette_custom[..len].copy_from_slice(&bytes[..len]);
    }

    /// Custom palette up to the first NUL
    pub fn palette_custom_str(&self) -> String {
        let end = self
            .palette_custom
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PALETTE_CUSTOM_LEN);
        String::from_utf8_lossy(&self.palette_custom[..end]).into_owned()
    }

    pub fn to_bytes(&self) -> [u8; SETTINGS_WIRE_SIZE] {
        let mut buf = [0u8; SETTINGS_WIRE_SIZE];
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_be_bytes());
        buf[OFF_WIDTH..OFF_WIDTH + 2].copy_from_slice(&self.width.to_be_bytes());
        buf[OFF_HEIGHT..OFF_HEIGHT + 2].copy_from_slice(&self.height.to_be_bytes());
        buf[OFF_COLOR] = self.color_mode;
        buf[OFF_RENDER] = self.render_mode;
        buf[OFF_PALETTE_TYPE] = self.palette_type;
        buf[OFF_PALETTE_CUSTOM..OFF_PALETTE_CUSTOM + PALETTE_CUSTOM_LEN]
            .copy_from_slice(&self.palette_custom);
        // Always terminated, whatever the caller wrote into the array
        buf[OFF_PALETTE_CUSTOM + PALETTE_CUSTOM_LEN - 1] = 0;
        buf[OFF_AUDIO] = self.audio_enabled as u8;
        buf[OFF_ENCRYPTION] = self.encryption_required as u8;
        buf[OFF_RESERVED..OFF_RESERVED + RESERVED_LEN].copy_from_slice(&self.reserved);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != SETTINGS_WIRE_SIZE {
            return Err(Error::InvalidParam(format!(
                "settings must be {} bytes, got {}",
                SETTINGS_WIRE_SIZE,
                buf.len()
            )));
        }

        let mut palette_custom = [0u8; PALETTE_CUSTOM_LEN];
        palette_custom
            .copy_from_slice(&buf[OFF_PALETTE_CUSTOM..OFF_PALETTE_CUSTOM + PALETTE_CUSTOM_LEN]);
        palette_custom[PALETTE_CUSTOM_LEN - 1] = 0;

        let mut reserved = [0u8; RESERVED_LEN];
        reserved.copy_from_slice(&buf[OFF_RESERVED..OFF_RESERVED + RESERVED_LEN]);

        Ok(Self {
            version: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            width: i16::from_be_bytes([buf[OFF_WIDTH], buf[OFF_WIDTH + 1]]),
            height: i16::from_be_bytes([buf[OFF_HEIGHT], buf[OFF_HEIGHT + 1]]),
            color_mode: buf[OFF_COLOR],
            render_mode: buf[OFF_RENDER],
            palette_type: buf[OFF_PALETTE_TYPE],
            palette_custom,
            audio_enabled: buf[OFF_AUDIO] != 0,
            encryption_required: buf[OFF_ENCRYPTION] != 0,
            reserved,
        })
    }
}

/// Higher version wins
pub fn needs_update(local_version: u32, remote_version: u32) -> bool {
    remote_version > local_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout_offsets() {
        let mut s = SessionSettings {
            version: 0x0102_0304,
            width: 160,
            height: -2,
            color_mode: 7,
            render_mode: 8,
            palette_type: 9,
            audio_enabled: true,
            encryption_required: true,
            ..Default::default()
        };
        s.set_palette_custom("@#*");
        s.reserved[0] = 0xEE;

        let b = s.to_bytes();
        assert_eq!(b.len(), 64);
        assert_eq!(&b[0..4], &[1, 2, 3, 4]);
        assert_eq!(&b[4..6], &160i16.to_be_bytes());
        assert_eq!(&b[6..8], &(-2i16).to_be_bytes());
        assert_eq!(b[8], 7);
        assert_eq!(b[9], 8);
        assert_eq!(b[10], 9);
        assert_eq!(&b[11..14], b"@#*");
        assert_eq!(b[14], 0);
        assert_eq!(b[43], 1);
        assert_eq!(b[44], 1);
        assert_eq!(b[45], 0xEE);
        assert_eq!(&b[61..64], &[0, 0, 0]);

        let back = SessionSettings::from_bytes(&b).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.version, s.version);
    }

    #[test]
    fn test_palette_truncated_to_31() {
        let mut s = SessionSettings::default();
        s.set_palette_custom(&"x".repeat(40));
        assert_eq!(s.palette_custom_str().len(), 31);
        assert_eq!(s.palette_custom[31], 0);

        let b = s.to_bytes();
        assert_eq!(b[42], 0);
        assert_eq!(SessionSettings::from_bytes(&b).unwrap().palette_custom_str().len(), 31);
    }

    #[test]
    fn test_unterminated_palette_forced_nul() {
        let mut s = SessionSettings::default();
        s.palette_custom = [b'z'; PALETTE_CUSTOM_LEN];
        let b = s.to_bytes();
        assert_eq!(b[42], 0);
    }

    #[test]
    fn test_equality_ignores_version() {
        let a = SessionSettings {
            version: 1,
            ..Default::default()
        };
        let b = SessionSettings {
            version: 99,
            ..Default::default()
        };
        assert_eq!(a, b);

        let c = SessionSettings {
            width: 1,
            ..a
        };
        assert_ne!(a, c);
    }

    #[test]
    fn test_needs_update() {
        assert!(needs_update(1, 2));
        assert!(!needs_update(2, 2));
        assert!(!needs_update(3, 2));
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert!(SessionSettings::from_bytes(&[0u8; 63]).is_err());
        assert!(SessionSettings::from_bytes(&[0u8; 65]).is_err());
    }
}
