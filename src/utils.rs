use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::{imageops, DynamicImage, RgbImage};
use log::debug;
use rand::Rng;

/// Draws a fresh seed. The low end is 1; the backend treats some sentinel
/// values specially.
pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// Builds a contact sheet of a batch: a near-square grid with every picture
/// in its own cell, encoded as PNG.
pub fn overview_of_pictures(blobs: &[Vec<u8>]) -> Result<Vec<u8>> {
    if blobs.is_empty() {
        bail!("no pictures to build an overview of");
    }
    let images = blobs
        .iter()
        .map(|blob| image::load_from_memory(blob))
        .collect::<image::ImageResult<Vec<_>>>()
        .context("failed to decode picture")?;

    let columns = (images.len() as f64).sqrt().ceil() as u32;
    let rows = (images.len() as u32 + columns - 1) / columns;
    let cell_width = images.iter().map(|i| i.width()).max().unwrap_or(1);
    let cell_height = images.iter().map(|i| i.height()).max().unwrap_or(1);
    debug!(
        "Overview: {} pictures in a {}x{} grid of {}x{} cells",
        images.len(),
        columns,
        rows,
        cell_width,
        cell_height
    );

    let mut canvas = RgbImage::new(columns * cell_width, rows * cell_height);
    for (i, picture) in images.iter().enumerate() {
        let x = (i as u32 % columns) * cell_width;
        let y = (i as u32 / columns) * cell_height;
        imageops::replace(&mut canvas, &picture.to_rgb8(), x as i64, y as i64);
    }

    let mut encoded = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut encoded), image::ImageOutputFormat::Png)
        .context("failed to encode overview")?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_of_size(width: u32, height: u32) -> Vec<u8> {
        let canvas = RgbImage::new(width, height);
        let mut encoded = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut encoded), image::ImageOutputFormat::Png)
            .unwrap();
        encoded
    }

    #[test]
    fn test_random_seed_is_nonzero() {
        for _ in 0..1000 {
            assert_ne!(random_seed(), 0);
        }
    }

    #[test]
    fn test_overview_of_one() {
        let overview = overview_of_pictures(&[png_of_size(32, 32)]).unwrap();
        let decoded = image::load_from_memory(&overview).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_overview_grid_shape() {
        // Three pictures fit a 2x2 grid with one empty cell.
        let blobs = vec![png_of_size(16, 16), png_of_size(16, 16), png_of_size(16, 16)];
        let overview = overview_of_pictures(&blobs).unwrap();
        let decoded = image::load_from_memory(&overview).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_overview_of_nothing_is_an_error() {
        assert!(overview_of_pictures(&[]).is_err());
    }

    #[test]
    fn test_overview_rejects_garbage() {
        assert!(overview_of_pictures(&[vec![1, 2, 3]]).is_err());
    }
}
