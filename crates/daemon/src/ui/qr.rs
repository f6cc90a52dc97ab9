//! QR code rendering of the published status URL.
//!
//! This module renders the URL either for the terminal, using Unicode half
//! block characters, or as a PNG image for hosts that display pictures.

use std::io::Cursor;
use std::path::Path;

use image::{ImageBuffer, ImageFormat, Luma};
use qrcode::{Color, QrCode};

/// QR code module size in pixels for PNG output.
const PNG_MODULE_SIZE: u32 = 8;

/// Quiet zone (border) size in modules.
const QUIET_ZONE: usize = 4;

const FULL_BLOCK: char = '\u{2588}';
const UPPER_HALF: char = '\u{2580}';
const LOWER_HALF: char = '\u{2584}';

type GrayImage = ImageBuffer<Luma<u8>, Vec<u8>>;

/// Dark/light grid of an encoded QR code.
struct Modules {
    colors: Vec<Color>,
    width: usize,
}

impl Modules {
    fn encode(url: &str) -> anyhow::Result<Self> {
        let code = QrCode::new(url.as_bytes())?;
        Ok(Self {
            width: code.width(),
            colors: code.to_colors(),
        })
    }

    fn height(&self) -> usize {
        self.colors.len() / self.width
    }

    /// Rows past the bottom edge count as light.
    fn is_dark(&self, row: usize, col: usize) -> bool {
        row < self.height() && self.colors[row * self.width + col] == Color::Dark
    }
}

/// Generates a terminal-displayable QR code for `url`.
///
/// Two module rows share one text row:
/// - Upper half block (U+2580): dark on top, light below
/// - Lower half block (U+2584): light on top, dark below
/// - Full block (U+2588): both dark
/// - Space: both light
///
/// # Errors
/// Returns an error if the URL does not fit in a QR code.
pub fn generate_terminal_qr(url: &str) -> anyhow::Result<String> {
    render_terminal(&Modules::encode(url)?, false)
}

/// Generates a terminal QR code with inverted colors.
///
/// Scans better on terminals with a dark background.
pub fn generate_terminal_qr_inverted(url: &str) -> anyhow::Result<String> {
    render_terminal(&Modules::encode(url)?, true)
}

fn render_terminal(modules: &Modules, inverted: bool) -> anyhow::Result<String> {
    let border = if inverted { FULL_BLOCK } else { ' ' };
    let full_width = modules.width + 2 * QUIET_ZONE;
    let border_line: String = std::iter::repeat(border).take(full_width).collect();
    let side: String = std::iter::repeat(border).take(QUIET_ZONE).collect();

    let mut output = String::new();
    for _ in 0..QUIET_ZONE / 2 {
        output.push_str(&border_line);
        output.push('\n');
    }

    for row in (0..modules.height()).step_by(2) {
        output.push_str(&side);
        for col in 0..modules.width {
            let top = modules.is_dark(row, col) != inverted;
            let bottom = if row + 1 < modules.height() {
                modules.is_dark(row + 1, col) != inverted
            } else {
                inverted
            };
            output.push(match (top, bottom) {
                (true, true) => FULL_BLOCK,
                (true, false) => UPPER_HALF,
                (false, true) => LOWER_HALF,
                (false, false) => ' ',
            });
        }
        output.push_str(&side);
        output.push('\n');
    }

    for _ in 0..QUIET_ZONE / 2 {
        output.push_str(&border_line);
        output.push('\n');
    }

    Ok(output)
}

fn render_image(url: &str) -> anyhow::Result<GrayImage> {
    let modules = Modules::encode(url)?;
    let quiet_zone_pixels = QUIET_ZONE as u32 * PNG_MODULE_SIZE;
    let image_size = modules.width as u32 * PNG_MODULE_SIZE + 2 * quiet_zone_pixels;

    // White background
    let mut img = GrayImage::from_pixel(image_size, image_size, Luma([255u8]));

    for row in 0..modules.height() {
        for col in 0..modules.width {
            if !modules.is_dark(row, col) {
                continue;
            }
            let x_start = quiet_zone_pixels + col as u32 * PNG_MODULE_SIZE;
            let y_start = quiet_zone_pixels + row as u32 * PNG_MODULE_SIZE;
            for dy in 0..PNG_MODULE_SIZE {
                for dx in 0..PNG_MODULE_SIZE {
                    img.put_pixel(x_start + dx, y_start + dy, Luma([0u8]));
                }
            }
        }
    }

    Ok(img)
}

/// Generates a PNG QR code for `url` and saves it to `path`.
///
/// # Errors
/// Returns an error if the QR code cannot be generated or saved.
pub fn generate_png_qr(url: &str, path: &Path) -> anyhow::Result<()> {
    render_image(url)?.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

/// Generates a PNG QR code for `url` and returns the encoded bytes.
pub fn generate_png_qr_bytes(url: &str) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    render_image(url)?.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://[2001:db8::7]:8080/?key=AbCdEfGh12345678";
    const PNG_MAGIC: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

    #[test]
    fn test_terminal_qr_generation() {
        let qr = generate_terminal_qr(URL).expect("Failed to generate terminal QR");

        let lines: Vec<&str> = qr.lines().collect();
        assert!(lines.len() > 10, "QR code should have multiple rows");
        assert!(
            qr.contains(FULL_BLOCK) || qr.contains(UPPER_HALF) || qr.contains(LOWER_HALF),
            "QR code should contain Unicode block characters"
        );

        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
        assert!(lines[0].chars().all(|c| c == ' '));
    }

    #[test]
    fn test_terminal_qr_inverted_generation() {
        let qr = generate_terminal_qr_inverted(URL).expect("Failed to generate inverted QR");
        let lines: Vec<&str> = qr.lines().collect();
        assert!(
            lines[0].chars().all(|c| c == FULL_BLOCK),
            "Top border should be full blocks in inverted mode"
        );
        assert!(lines.last().unwrap().chars().all(|c| c == FULL_BLOCK));
    }

    #[test]
    fn test_png_qr_generation() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("status_qr.png");

        generate_png_qr(URL, &path).expect("Failed to generate PNG QR");

        let file_bytes = std::fs::read(&path).expect("Failed to read file");
        assert!(file_bytes.starts_with(&PNG_MAGIC), "File should have PNG header");
    }

    #[test]
    fn test_png_qr_bytes_generation() {
        let bytes = generate_png_qr_bytes(URL).expect("Failed to generate PNG bytes");
        assert!(bytes.starts_with(&PNG_MAGIC), "Bytes should have PNG header");
    }

    #[test]
    fn test_png_dimensions_include_quiet_zone() {
        let modules = Modules::encode(URL).unwrap();
        let img = render_image(URL).unwrap();
        let expected = (modules.width + 2 * QUIET_ZONE) as u32 * PNG_MODULE_SIZE;
        assert_eq!(img.dimensions(), (expected, expected));
        assert_eq!(img.get_pixel(0, 0), &Luma([255u8]));
    }

    #[test]
    fn test_oversized_content_errors() {
        let huge = "x".repeat(8000);
        assert!(generate_terminal_qr(&huge).is_err());
        assert!(generate_png_qr_bytes(&huge).is_err());
    }
}
