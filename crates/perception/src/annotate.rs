//! Overlay rendering for fused artifacts.
//!
//! Draws bounding boxes, class/confidence/distance labels, and the HUD line
//! onto the source frame, then JPEG-encodes the result. Box color encodes
//! proximity so the nearest obstacles pop out without reading the text.

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageBuffer, Rgba};

use frame_ingest::Frame;

use crate::data::{MetricsSnapshot, ObstacleReport};

const LABEL_BG: Rgba<u8> = Rgba([0, 0, 0, 180]);
const HUD_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
/// Obstacles closer than this are drawn in the alert color.
const NEAR_METERS: f32 = 2.0;
/// Obstacles closer than this (but not near) get the caution color.
const CAUTION_METERS: f32 = 5.0;

/// Render boxes, labels, and the HUD over `frame`, returning JPEG bytes.
///
/// Works for empty `reports` too: the output is then the bare frame plus
/// HUD, which is exactly what replaces stale overlays after an empty
/// detection result.
pub fn render_overlay(
    frame: &Frame,
    reports: &[ObstacleReport],
    metrics: &MetricsSnapshot,
    frame_number: u64,
    jpeg_quality: u8,
) -> Result<Vec<u8>> {
    let width = frame.width.max(1) as u32;
    let height = frame.height.max(1) as u32;
    let rgba = bgr_to_rgba(&frame.data);
    let mut image = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_vec(width, height, rgba)
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;

    for report in reports {
        let color = proximity_color(report.distance_m);
        let left = report.bbox[0].clamp(0.0, (width - 1) as f32).round() as i32;
        let top = report.bbox[1].clamp(0.0, (height - 1) as f32).round() as i32;
        let right = report.bbox[2].clamp(0.0, (width - 1) as f32).round() as i32;
        let bottom = report.bbox[3].clamp(0.0, (height - 1) as f32).round() as i32;
        draw_rectangle(&mut image, left, top, right, bottom, color);

        let label = report_label(report);
        let label_y = (top - 10).max(0);
        let label_w = label.chars().count() as i32 * 6 + 2;
        fill_rect(&mut image, left, label_y, left + label_w, label_y + 8, LABEL_BG);
        draw_text(&mut image, left + 1, label_y, &label, color);
    }

    let hud = format!(
        "FRAME {:06}  FPS {:3}  INF {:3}MS",
        frame_number, metrics.fps, metrics.inference_latency_ms
    );
    let hud_w = (hud.chars().count() as i32 * 6).min(width as i32);
    let hud_x = (width as i32 - hud_w - 4).max(0);
    let hud_y = (height as i32 - 12).max(0);
    fill_rect(&mut image, hud_x, hud_y, hud_x + hud_w + 4, hud_y + 8, LABEL_BG);
    draw_text(&mut image, hud_x + 2, hud_y, &hud, HUD_TEXT);

    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// `PERSON 87% 2.3M`, or without the distance when none was fused.
pub(crate) fn report_label(report: &ObstacleReport) -> String {
    match report.distance_m {
        Some(d) => format!(
            "{} {:.0}% {}",
            report.class.to_uppercase(),
            report.score * 100.0,
            format_distance(d)
        ),
        None => format!("{} {:.0}%", report.class.to_uppercase(), report.score * 100.0),
    }
}

pub(crate) fn format_distance(meters: f32) -> String {
    if meters >= 10.0 {
        format!("{meters:.0}M")
    } else {
        format!("{meters:.1}M")
    }
}

fn proximity_color(distance_m: Option<f32>) -> Rgba<u8> {
    match distance_m {
        Some(d) if d < NEAR_METERS => Rgba([255, 64, 64, 255]),
        Some(d) if d < CAUTION_METERS => Rgba([255, 200, 0, 255]),
        Some(_) => Rgba([0, 255, 0, 255]),
        None => Rgba([200, 200, 200, 255]),
    }
}

fn bgr_to_rgba(input: &[u8]) -> Vec<u8> {
    let pixels = input.len() / 3;
    let mut output = Vec::with_capacity(pixels * 4);
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
        output.push(255);
    }
    output
}

fn draw_rectangle(
    image: &mut ImageBuffer<Rgba<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(
    image: &mut ImageBuffer<Rgba<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_text(image: &mut ImageBuffer<Rgba<u8>, Vec<u8>>, mut x: i32, y: i32, text: &str, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

/// 5×7 bitmap font covering the label and HUD character set.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    #[rustfmt::skip]
    let glyph = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b01010, 0b10001],
        'Y' => [0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00110],
        '-' => [0b00000, 0b00000, 0b00000, 0b01110, 0b00000, 0b00000, 0b00000],
        ' ' => [0, 0, 0, 0, 0, 0, 0],
        _ => return None,
    };
    Some(glyph)
}

#[cfg(test)]
mod tests {
    use frame_ingest::FrameFormat;

    use super::*;

    fn test_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![128; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn renders_jpeg_for_empty_reports() {
        let frame = test_frame(64, 48);
        let jpeg = render_overlay(&frame, &[], &MetricsSnapshot::default(), 1, 80).unwrap();
        // JPEG magic bytes.
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn renders_boxes_that_exceed_frame_bounds() {
        let frame = test_frame(64, 48);
        let report = ObstacleReport {
            class: "person".into(),
            score: 0.9,
            bbox: [-10.0, -10.0, 100.0, 100.0],
            distance_m: Some(1.2),
        };
        let jpeg =
            render_overlay(&frame, &[report], &MetricsSnapshot::default(), 7, 80).unwrap();
        assert!(!jpeg.is_empty());
    }

    #[test]
    fn label_includes_distance_only_when_fused() {
        let with = ObstacleReport {
            class: "car".into(),
            score: 0.87,
            bbox: [0.0, 0.0, 1.0, 1.0],
            distance_m: Some(2.34),
        };
        let without = ObstacleReport {
            distance_m: None,
            ..with.clone()
        };
        assert_eq!(report_label(&with), "CAR 87% 2.3M");
        assert_eq!(report_label(&without), "CAR 87%");
    }

    #[test]
    fn far_distances_drop_the_decimal() {
        assert_eq!(format_distance(12.6), "13M");
        assert_eq!(format_distance(9.96), "10.0M");
        assert_eq!(format_distance(0.4), "0.4M");
    }
}
