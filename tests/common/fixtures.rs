// Test fixtures and image generators for integration tests

use flowerloop::types::Label;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::path::Path;

/// Base colour used to draw each class.
pub fn class_color(label: Label) -> [u8; 3] {
    match label {
        Label::Dandelion => [250, 220, 20],
        Label::Daisy => [245, 245, 245],
        Label::Tulips => [230, 40, 120],
        Label::Sunflowers => [200, 120, 10],
        Label::Roses => [180, 0, 20],
    }
}

/// Deterministic JPEG generator for reproducible tests
pub struct ImageGenerator {
    rng: StdRng,
}

impl ImageGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A JPEG of the given size filled with `rgb` plus a little noise.
    pub fn jpeg(&mut self, rgb: [u8; 3], size: u32) -> Vec<u8> {
        let image = image::RgbImage::from_fn(size, size, |_, _| {
            let mut pixel = rgb;
            for channel in pixel.iter_mut() {
                let noise: i16 = self.rng.gen_range(-12..=12);
                *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
            }
            image::Rgb(pixel)
        });
        encode(image, image::ImageFormat::Jpeg)
    }

    /// A JPEG that looks like the given class.
    pub fn flower(&mut self, label: Label) -> Vec<u8> {
        self.jpeg(class_color(label), 32)
    }

    /// A PNG, which the services must reject.
    pub fn png(&mut self, rgb: [u8; 3]) -> Vec<u8> {
        encode(image::RgbImage::from_pixel(16, 16, image::Rgb(rgb)), image::ImageFormat::Png)
    }

    /// Write `per_class` images for every class into `{index}_{name}/` directories.
    pub fn write_validation_dir(&mut self, dir: &Path, per_class: usize) {
        for label in Label::ALL {
            let class_dir = dir.join(format!("{}_{}", label.index(), label.name()));
            std::fs::create_dir_all(&class_dir).expect("Failed to create class dir");
            for i in 0..per_class {
                let bytes = self.flower(label);
                std::fs::write(class_dir.join(format!("{:03}.jpg", i)), bytes).expect("Failed to write image");
            }
        }
    }
}

impl Default for ImageGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

fn encode(image: image::RgbImage, format: image::ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).expect("Failed to encode image");
    buf.into_inner()
}
