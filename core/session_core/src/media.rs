//! Media buffers, mixing and the renderer/codec seams
//!
//! The host keeps one RGB24 image and one audio ring per participant. The
//! render loop turns images into text tiles laid out in a grid, and sums
//! audio rings into a clipped mix.

use std::collections::VecDeque;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

pub const SAMPLE_RATE: u32 = 48_000;

/// Per-client audio ring (200 ms at 48 kHz)
pub const AUDIO_RING_CAPACITY: usize = 9_600;

/// Samples mixed per 10 ms render tick
pub const MIX_FRAME_SAMPLES: usize = 480;

/// Samples captured per 20 ms participant chunk
pub const CAPTURE_FRAME_SAMPLES: usize = 960;

/// Luminance ramp used by the default renderer, dark to bright
pub const DEFAULT_PALETTE: &[u8] = b" .:-=+*#%@";

// ============================================================================
// Image
// ============================================================================

/// RGB24 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width as usize) * (height as usize) * 3],
        }
    }

    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != (width as usize) * (height as usize) * 3 {
            return Err(Error::InvalidParam(format!(
                "{}x{} frame needs {} bytes, got {}",
                width,
                height,
                width as usize * height as usize * 3,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Copy an incoming frame only if it matches this buffer exactly
    pub fn copy_from_frame(&mut self, width: u32, height: u32, pixels: &[u8]) -> bool {
        if width != self.width || height != self.height || pixels.len() != self.pixels.len() {
            return false;
        }
        self.pixels.copy_from_slice(pixels);
        true
    }

    /// Nearest-neighbour resize
    pub fn resize(&self, width: u32, height: u32) -> Image {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = Image::new(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        for y in 0..height as usize {
            let sy = y * self.height as usize / height.max(1) as usize;
            for x in 0..width as usize {
                let sx = x * self.width as usize / width.max(1) as usize;
                let src = (sy * self.width as usize + sx) * 3;
                let dst = (y * width as usize + x) * 3;
                out.pixels[dst..dst + 3].copy_from_slice(&self.pixels[src..src + 3]);
            }
        }
        out
    }

    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let i = ((y as usize) * (self.width as usize) + x as usize) * 3;
        let (r, g, b) = (
            self.pixels[i] as u32,
            self.pixels[i + 1] as u32,
            self.pixels[i + 2] as u32,
        );
        ((299 * r + 587 * g + 114 * b) / 1000) as u8
    }
}

// ============================================================================
// Audio ring
// ============================================================================

#[derive(Debug, Clone)]
pub struct AudioRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl AudioRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push one sample; false when the ring is full and it was dropped
    pub fn push(&mut self, sample: f32) -> bool {
        if self.samples.len() >= self.capacity {
            return false;
        }
        self.samples.push_back(sample);
        true
    }

    /// Push samples one by one; returns how many were dropped
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        samples.iter().filter(|&&s| !self.push(s)).count()
    }

    /// Drain up to `out.len()` samples; returns how many were read
    pub fn read_into(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.samples.len());
        for (slot, sample) in out.iter_mut().zip(self.samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sum equal-length frames and hard-clip to [-1, 1]
pub fn mix_frames(frames: &[Vec<f32>], frame_len: usize) -> Vec<f32> {
    let mut mix = vec![0.0f32; frame_len];
    for frame in frames {
        for (acc, s) in mix.iter_mut().zip(frame.iter()) {
            *acc += *s;
        }
    }
    for s in mix.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
    mix
}

// ============================================================================
// Renderer
// ============================================================================

pub trait FrameRenderer: Send {
    /// One participant's frame as text
    fn render(&mut self, image: &Image) -> String;

    /// Arrange rendered tiles into one screen
    fn grid(&mut self, tiles: &[String]) -> String {
        grid_layout(tiles)
    }
}

/// Maps luminance onto a character ramp
#[derive(Debug, Clone)]
pub struct LumaRenderer {
    pub columns: u32,
    pub rows: u32,
    palette: Vec<u8>,
}

impl LumaRenderer {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self {
            columns,
            rows,
            palette: DEFAULT_PALETTE.to_vec(),
        }
    }

    /// Use a custom dark-to-bright ramp; an empty ramp keeps the default
    pub fn with_palette(mut self, palette: &str) -> Self {
        if !palette.is_empty() {
            self.palette = palette.as_bytes().to_vec();
        }
        self
    }
}

impl Default for LumaRenderer {
    fn default() -> Self {
        Self::new(40, 12)
    }
}

impl FrameRenderer for LumaRenderer {
    fn render(&mut self, image: &Image) -> String {
        if image.width == 0 || image.height == 0 || self.columns == 0 || self.rows == 0 {
            return String::new();
        }
        let scaled = image.resize(self.columns, self.rows);
        let last = self.palette.len() - 1;
        let mut text = String::with_capacity(((self.columns + 1) * self.rows) as usize);
        for y in 0..self.rows {
            for x in 0..self.columns {
                let idx = scaled.luma_at(x, y) as usize * last / 255;
                text.push(self.palette[idx] as char);
            }
            if y + 1 < self.rows {
                text.push('\n');
            }
        }
        text
    }
}

/// Lay tiles out in ceil(sqrt(n)) columns, padding each line to the widest tile
pub fn grid_layout(tiles: &[String]) -> String {
    if tiles.is_empty() {
        return String::new();
    }
    if tiles.len() == 1 {
        return tiles[0].clone();
    }

    let columns = (tiles.len() as f64).sqrt().ceil() as usize;
    let tile_width = tiles
        .iter()
        .flat_map(|t| t.lines())
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0);

    let mut rows_out = Vec::new();
    for row in tiles.chunks(columns) {
        let tile_lines: Vec<Vec<&str>> = row.iter().map(|t| t.lines().collect()).collect();
        let height = tile_lines.iter().map(|l| l.len()).max().unwrap_or(0);
        for line in 0..height {
            let mut out = String::new();
            for (i, lines) in tile_lines.iter().enumerate() {
                let text = lines.get(line).copied().unwrap_or("");
                out.push_str(text);
                if i + 1 < tile_lines.len() {
                    let pad = tile_width - text.chars().count();
                    out.extend(std::iter::repeat(' ').take(pad + 1));
                }
            }
            rows_out.push(out);
        }
    }
    rows_out.join("\n")
}

// ============================================================================
// Audio codec
// ============================================================================

pub trait AudioCodec: Send {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>>;
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>>;
}

/// Little-endian signed 16-bit PCM passthrough
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Codec;

impl AudioCodec for Pcm16Codec {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>> {
        if data.len() % 2 != 0 {
            return Err(Error::NetworkProtocol(format!(
                "odd PCM16 payload length {}",
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_requires_exact_match() {
        let mut img = Image::new(4, 2);
        assert!(!img.copy_from_frame(4, 3, &[0; 36]));
        assert!(!img.copy_from_frame(4, 2, &[0; 23]));
        assert!(img.copy_from_frame(4, 2, &[7; 24]));
        assert!(img.pixels.iter().all(|&p| p == 7));
    }

    #[test]
    fn test_resize_nearest() {
        let mut img = Image::new(2, 1);
        img.pixels = vec![255, 255, 255, 0, 0, 0];
        let big = img.resize(4, 2);
        assert_eq!(big.width, 4);
        assert_eq!(&big.pixels[0..3], &[255, 255, 255]);
        assert_eq!(&big.pixels[9..12], &[0, 0, 0]);
        assert!(Image::from_pixels(2, 2, vec![0; 5]).is_err());
    }

    #[test]
    fn test_audio_ring_overflow() {
        let mut ring = AudioRing::new(4);
        assert_eq!(ring.push_slice(&[0.1, 0.2, 0.3]), 0);
        assert_eq!(ring.push_slice(&[0.4, 0.5, 0.6]), 2);
        assert_eq!(ring.len(), 4);

        let mut out = [0.0f32; 8];
        assert_eq!(ring.read_into(&mut out), 4);
        assert_eq!(&out[..4], &[0.1, 0.2, 0.3, 0.4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_mix_sums_and_clips() {
        let a = vec![0.6, -0.6, 0.1];
        let b = vec![0.6, -0.6, 0.1];
        let mix = mix_frames(&[a, b], 3);
        assert_eq!(mix[0], 1.0);
        assert_eq!(mix[1], -1.0);
        assert!((mix[2] - 0.2).abs() < 1e-6);

        // Short frames contribute silence past their end
        let mix = mix_frames(&[vec![0.5]], 3);
        assert_eq!(mix, vec![0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_luma_renderer_extremes() {
        let mut r = LumaRenderer::new(3, 2);
        let black = Image::new(6, 4);
        assert_eq!(r.render(&black), "   \n   ");

        let mut white = Image::new(6, 4);
        white.pixels.iter_mut().for_each(|p| *p = 255);
        assert_eq!(r.render(&white), "@@@\n@@@");
    }

    #[test]
    fn test_grid_layout_columns() {
        assert_eq!(grid_layout(&[]), "");
        assert_eq!(grid_layout(&["ab".to_string()]), "ab");

        let tiles = vec!["aa\naa".to_string(), "bb\nbb".to_string(), "cc\ncc".to_string()];
        // 3 tiles -> 2 columns, 2 rows of tiles
        let grid = grid_layout(&tiles);
        let lines: Vec<&str> = grid.lines().collect();
        assert_eq!(lines, vec!["aa bb", "aa bb", "cc", "cc"]);
    }

    #[test]
    fn test_pcm16_codec() {
        let mut codec = Pcm16Codec;
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let encoded = codec.encode(&samples).unwrap();
        assert_eq!(encoded.len(), 10);
        let decoded = codec.decode(&encoded).unwrap();
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
        assert!(codec.decode(&[0, 1, 2]).is_err());
    }
}
