//! Helpers shared across the subrectangle-based encodings (RRE, CoRRE,
//! Hextile): background-colour detection, solid-rectangle search, and
//! per-tile colour analysis.
//!
//! Generalizes the teacher's RGBA32-hardcoded `rgba_to_rgb24_pixels`
//! helpers into functions over native pixel values in the connection's
//! negotiated [`PixelFormat`], via [`PixelFormat::read_pixel`]/
//! [`PixelFormat::write_pixel`].

use std::collections::HashMap;

use bytes::BytesMut;

use crate::pixel::PixelFormat;

/// A uniformly-coloured subrectangle found within a tile (RRE/CoRRE/Hextile).
#[derive(Debug)]
pub struct Subrect {
    /// Native pixel value in the tile's format.
    pub color: u32,
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

/// Unpacks a tightly-packed pixel buffer into native pixel values.
pub fn unpack_pixels(data: &[u8], format: &PixelFormat) -> Vec<u32> {
    let bpp = format.bytes_per_pixel();
    data.chunks_exact(bpp).map(|chunk| format.read_pixel(chunk)).collect()
}

/// Appends one native pixel value to `buf` in `format`'s wire encoding.
pub fn put_pixel(buf: &mut BytesMut, value: u32, format: &PixelFormat) {
    let bpp = format.bytes_per_pixel();
    let start = buf.len();
    buf.resize(start + bpp, 0);
    format.write_pixel(&mut buf[start..], value);
}

/// Finds the most common pixel value (spec §4.C "background colour").
pub fn get_background_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(color, _)| color)
        .unwrap_or(pixels[0])
}

/// Greedily covers the non-background pixels with solid-colour
/// subrectangles (used by RRE/CoRRE).
pub fn find_subrects(pixels: &[u32], width: usize, height: usize, bg_color: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg_color {
                continue;
            }

            let color = pixels[idx];

            let mut max_w = 0;
            for test_x in x..width {
                let test_idx = y * width + test_x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_w = test_x - x + 1;
            }

            let mut h = 1;
            'outer: for test_y in (y + 1)..height {
                for test_x in x..(x + max_w) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'outer;
                    }
                }
                h = test_y - y + 1;
            }

            let mut best_w = max_w;
            let mut best_h = h;

            let mut max_h = 0;
            for test_y in y..height {
                let test_idx = test_y * width + x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_h = test_y - y + 1;
            }

            let mut w2 = 1;
            'outer2: for test_x in (x + 1)..width {
                for test_y in y..(y + max_h) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'outer2;
                    }
                }
                w2 = test_x - x + 1;
            }

            if w2 * max_h > best_w * best_h {
                best_w = w2;
                best_h = max_h;
            }

            for dy in 0..best_h {
                for dx in 0..best_w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }

            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: best_w as u16,
                h: best_h as u16,
            });
        }
    }

    subrects
}

/// Extracts a `tw`x`th` tile starting at `(x, y)` from a `width`-wide
/// pixel array (used to slice Hextile's 16x16 cells and CoRRE's 48x48
/// tiles out of a rectangle).
pub fn extract_tile(pixels: &[u32], width: usize, x: usize, y: usize, tw: usize, th: usize) -> Vec<u32> {
    let mut tile = Vec::with_capacity(tw * th);
    for dy in 0..th {
        for dx in 0..tw {
            tile.push(pixels[(y + dy) * width + (x + dx)]);
        }
    }
    tile
}

/// Classifies a tile as solid, two-colour (monochrome), or multicolour.
/// Returns `(is_solid, is_mono, bg_color, fg_color)`.
pub fn analyze_tile_colors(pixels: &[u32]) -> (bool, bool, u32, u32) {
    if pixels.is_empty() {
        return (true, true, 0, 0);
    }

    let mut colors: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *colors.entry(pixel).or_insert(0) += 1;
    }

    if colors.len() == 1 {
        return (true, true, pixels[0], 0);
    }

    if colors.len() == 2 {
        let mut sorted: Vec<_> = colors.into_iter().collect();
        sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
        return (false, true, sorted[0].0, sorted[1].0);
    }

    let bg = get_background_color(pixels);
    (false, false, bg, 0)
}

/// Returns `Some(color)` if every pixel is identical.
pub fn check_solid_color(pixels: &[u32]) -> Option<u32> {
    let first = *pixels.first()?;
    pixels.iter().all(|&p| p == first).then_some(first)
}

/// Builds a colour palette ordered by descending frequency (Tight/ZRLE
/// palette subencodings).
pub fn build_palette(pixels: &[u32]) -> Vec<u32> {
    let mut colors: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *colors.entry(pixel).or_insert(0) += 1;
    }
    let mut palette: Vec<_> = colors.into_iter().collect();
    palette.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
    palette.into_iter().map(|(color, _)| color).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_color_is_most_frequent() {
        let pixels = vec![1, 1, 1, 2, 2, 3];
        assert_eq!(get_background_color(&pixels), 1);
    }

    #[test]
    fn find_subrects_covers_all_non_background_pixels() {
        // 4x2 grid, background 0, one 2x2 block of color 7.
        let pixels = vec![0, 0, 0, 0, 0, 7, 7, 0];
        let subrects = find_subrects(&pixels, 4, 2, 0);
        let covered: usize = subrects.iter().map(|r| usize::from(r.w) * usize::from(r.h)).sum();
        assert_eq!(covered, 2);
    }

    #[test]
    fn solid_tile_detected() {
        assert_eq!(check_solid_color(&[5, 5, 5]), Some(5));
        assert_eq!(check_solid_color(&[5, 5, 6]), None);
    }

    #[test]
    fn mono_tile_analysis_picks_majority_as_background() {
        let (solid, mono, bg, fg) = analyze_tile_colors(&[1, 1, 1, 2]);
        assert!(!solid);
        assert!(mono);
        assert_eq!(bg, 1);
        assert_eq!(fg, 2);
    }
}
