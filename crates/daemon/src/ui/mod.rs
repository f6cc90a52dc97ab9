//! User-facing output for the status server.
//!
//! Currently this is QR rendering of the published URL, so a viewer can
//! open the status page by scanning it from the terminal or an image.

pub mod qr;

// Re-export QR functions for convenience
pub use qr::{
    generate_png_qr, generate_png_qr_bytes, generate_terminal_qr, generate_terminal_qr_inverted,
};
