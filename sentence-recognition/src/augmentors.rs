//! Randomized augmentations applied to training samples when a batch is read.

use image::{GrayImage, Luma, RgbImage};
use imageproc::morphology::{self, Mask};
use imageproc::filter;
use rand::{Rng, RngCore};

pub trait Augmentor: Send + Sync + std::fmt::Debug {
    fn augment(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage;
}

fn fires(random_chance: f64, rng: &mut dyn RngCore) -> bool {
    rng.gen_bool(random_chance.clamp(0.0, 1.0))
}

/// Scales every channel by `1 + U(-delta, delta) / 255`.
#[derive(Debug, Clone)]
pub struct RandomBrightness {
    pub random_chance: f64,
    pub delta: f32,
}

impl Default for RandomBrightness {
    fn default() -> Self {
        Self {
            random_chance: 0.5,
            delta: 100.0,
        }
    }
}

impl Augmentor for RandomBrightness {
    fn augment(&self, mut image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        if !fires(self.random_chance, rng) {
            return image;
        }

        let value = 1.0 + rng.gen_range(-self.delta..=self.delta) / 255.0;
        for pixel in image.pixels_mut() {
            for channel in pixel.0.iter_mut() {
                *channel = (*channel as f32 * value).clamp(0.0, 255.0) as u8;
            }
        }
        image
    }
}

/// Grayscale erosion or dilation of each channel over a square of radius `kernel_size`.
/// `kernel_size` is a radius, not a width: the default of 1 covers a 3x3
/// neighbourhood, where a width-1 kernel would leave the image unchanged.
#[derive(Debug, Clone)]
pub struct RandomErodeDilate {
    pub random_chance: f64,
    pub kernel_size: u8,
}

impl Default for RandomErodeDilate {
    fn default() -> Self {
        Self {
            random_chance: 0.5,
            kernel_size: 1,
        }
    }
}

impl Augmentor for RandomErodeDilate {
    fn augment(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        if !fires(self.random_chance, rng) {
            return image;
        }

        let erode = rng.gen_bool(0.5);
        let mask = Mask::square(self.kernel_size);
        let (width, height) = image.dimensions();
        let channels: Vec<GrayImage> = (0..3)
            .map(|c| {
                let plane = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[c]]));
                if erode {
                    morphology::grayscale_erode(&plane, &mask)
                } else {
                    morphology::grayscale_dilate(&plane, &mask)
                }
            })
            .collect();

        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([
                channels[0].get_pixel(x, y)[0],
                channels[1].get_pixel(x, y)[0],
                channels[2].get_pixel(x, y)[0],
            ])
        })
    }
}

/// Blends the identity kernel with a lightness-weighted Laplacian sharpener.
/// The kernel sums to `1 + alpha * (lightness - 1)`, so flat regions keep
/// their brightness up to that factor.
#[derive(Debug, Clone)]
pub struct RandomSharpen {
    pub random_chance: f64,
    pub alpha: f32,
    pub lightness_range: (f32, f32),
}

impl Default for RandomSharpen {
    fn default() -> Self {
        Self {
            random_chance: 0.5,
            alpha: 0.25,
            lightness_range: (0.75, 2.0),
        }
    }
}

impl RandomSharpen {
    pub fn kernel(alpha: f32, lightness: f32) -> [f32; 9] {
        let mut kernel = [-alpha; 9];
        kernel[4] = (1.0 - alpha) + alpha * (8.0 + lightness);
        kernel
    }
}

impl Augmentor for RandomSharpen {
    fn augment(&self, image: RgbImage, rng: &mut dyn RngCore) -> RgbImage {
        if !fires(self.random_chance, rng) {
            return image;
        }

        let (low, high) = self.lightness_range;
        let lightness = rng.gen_range(low..=high);
        let alpha = rng.gen_range(self.alpha..=1.0);
        let kernel = Self::kernel(alpha, lightness);

        filter::filter3x3::<_, f32, u8>(&image, &kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn stroke_image() -> RgbImage {
        let mut image = RgbImage::from_pixel(9, 9, Rgb([255, 255, 255]));
        image.put_pixel(4, 4, Rgb([0, 0, 0]));
        image
    }

    #[test]
    fn test_zero_chance_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let augmentors: Vec<Box<dyn Augmentor>> = vec![
            Box::new(RandomBrightness { random_chance: 0.0, ..Default::default() }),
            Box::new(RandomErodeDilate { random_chance: 0.0, ..Default::default() }),
            Box::new(RandomSharpen { random_chance: 0.0, ..Default::default() }),
        ];

        for augmentor in &augmentors {
            assert_eq!(augmentor.augment(stroke_image(), &mut rng), stroke_image());
        }
    }

    #[test]
    fn test_brightness_scales_uniformly() {
        let mut rng = StdRng::seed_from_u64(1);
        let brightness = RandomBrightness { random_chance: 1.0, delta: 100.0 };
        let image = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));

        let out = brightness.augment(image, &mut rng);
        let first = *out.get_pixel(0, 0);
        assert!(out.pixels().all(|p| *p == first));
        assert!((60..=140).contains(&first[0]));
    }

    #[test]
    fn test_erode_dilate_changes_dark_stroke() {
        let mut rng = StdRng::seed_from_u64(3);
        let morph = RandomErodeDilate { random_chance: 1.0, kernel_size: 1 };

        let out = morph.augment(stroke_image(), &mut rng);
        let dark = out.pixels().filter(|p| p[0] == 0).count();
        // erosion grows the dark dot to 3x3, dilation removes it
        assert!(dark == 9 || dark == 0);
    }

    #[test]
    fn test_sharpen_kernel_shape() {
        let kernel = RandomSharpen::kernel(0.0, 1.0);
        assert_eq!(kernel[4], 1.0);
        assert!(kernel.iter().enumerate().all(|(i, &k)| i == 4 || k == 0.0));

        let kernel = RandomSharpen::kernel(1.0, 2.0);
        assert_eq!(kernel[4], 10.0);
        assert_eq!(kernel[0], -1.0);
    }

    #[test]
    fn test_sharpen_kernel_sum_stays_positive() {
        for alpha in [0.25f32, 0.5, 0.75, 1.0] {
            for lightness in [0.75f32, 1.0, 1.5, 2.0] {
                let sum: f32 = RandomSharpen::kernel(alpha, lightness).iter().sum();
                assert!((sum - (1.0 + alpha * (lightness - 1.0))).abs() < 1e-5);
                assert!(sum > 0.0);
            }
        }
    }

    #[test]
    fn test_sharpen_keeps_white_page_bright() {
        let sharpen = RandomSharpen { random_chance: 1.0, ..Default::default() };
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let white = RgbImage::from_pixel(9, 9, Rgb([255, 255, 255]));
            let out = sharpen.augment(white, &mut rng);
            // worst case is alpha 1, lightness 0.75: 255 * 0.75
            assert!(out.pixels().all(|p| p[0] >= 190), "seed {seed} darkened the page");
        }
    }

    #[test]
    fn test_sharpen_darkens_stroke_centre() {
        let mut rng = StdRng::seed_from_u64(5);
        let sharpen = RandomSharpen { random_chance: 1.0, ..Default::default() };
        let out = sharpen.augment(stroke_image(), &mut rng);
        assert_eq!(out.get_pixel(4, 4)[0], 0);
        assert!(out.get_pixel(0, 0)[0] >= 190);
    }

    #[test]
    fn test_sharpen_keeps_dimensions() {
        let mut rng = StdRng::seed_from_u64(11);
        let sharpen = RandomSharpen { random_chance: 1.0, ..Default::default() };
        assert_eq!(sharpen.augment(stroke_image(), &mut rng).dimensions(), (9, 9));
    }
}
