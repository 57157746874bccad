use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context as _;
use image::{DynamicImage, ImageFormat, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use yolo_rs::{image_to_yolo_input_tensor, inference, model::YoloModelSession};

/// The confidence threshold every prediction request runs with.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

const BOX_LINE_WIDTH: i32 = 3;

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 99, 132]),
    Rgb([54, 162, 235]),
    Rgb([255, 206, 86]),
    Rgb([75, 192, 192]),
    Rgb([153, 102, 255]),
    Rgb([255, 159, 64]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One localized object instance reported by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// The seam between the request pipeline and the pretrained model.
///
/// The production implementation is [`YoloDetector`]; tests substitute
/// a fake through [`crate::routes::AppContext`].
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<Detection>>;
}

pub struct YoloDetector {
    yolo_model: Arc<YoloModelSession>,
    confidence_threshold: f32,
}

impl YoloDetector {
    pub fn new(yolo_model: Arc<YoloModelSession>, confidence_threshold: f32) -> Self {
        Self {
            yolo_model,
            confidence_threshold,
        }
    }

    pub fn from_model_file(path: &str) -> anyhow::Result<Self> {
        let yolo_model = YoloModelSession::from_filename_v8(path)
            .map_err(|e| anyhow::anyhow!("failed to load the YOLO model from {path}: {e:?}"))?;

        Ok(Self::new(Arc::new(yolo_model), CONFIDENCE_THRESHOLD))
    }
}

impl Detector for YoloDetector {
    #[tracing::instrument(skip(self, image))]
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<Detection>> {
        let yolo_input = image_to_yolo_input_tensor(image);
        let yolo_output = inference(&self.yolo_model, yolo_input.view())
            .map_err(|e| anyhow::anyhow!("failed to run inference: {e:?}"))?;

        let detections = yolo_output
            .into_iter()
            .filter(|entity| entity.confidence >= self.confidence_threshold)
            .map(|entity| {
                let yolo_rs::BoundingBox { x1, x2, y1, y2 } = entity.bounding_box;

                Detection {
                    label: entity.label.to_string(),
                    confidence: entity.confidence,
                    bounding_box: BoundingBox { x1, y1, x2, y2 },
                }
            })
            .collect::<Vec<_>>();

        tracing::info!("Found {} entities", detections.len());

        Ok(detections)
    }
}

fn label_color(label: &str) -> Rgb<u8> {
    let sum = label.bytes().map(usize::from).sum::<usize>();
    PALETTE[sum % PALETTE.len()]
}

/// Draw the detection boxes on a copy of the input and encode it as JPEG.
pub fn encode_annotated(image: &DynamicImage, detections: &[Detection]) -> anyhow::Result<Vec<u8>> {
    let mut annotated = image.to_rgb8();
    let (width, height) = (annotated.width() as i32, annotated.height() as i32);

    for detection in detections {
        let BoundingBox { x1, y1, x2, y2 } = detection.bounding_box;

        let x_min = (x1.round() as i32).clamp(0, width - 1);
        let y_min = (y1.round() as i32).clamp(0, height - 1);
        let x_max = (x2.round() as i32).clamp(0, width);
        let y_max = (y2.round() as i32).clamp(0, height);
        let box_width = (x_max - x_min).max(1) as u32;
        let box_height = (y_max - y_min).max(1) as u32;

        let color = label_color(&detection.label);

        for inset in 0..BOX_LINE_WIDTH
            .min(box_width as i32 / 2)
            .min(box_height as i32 / 2)
            .max(1)
        {
            let rect = Rect::at(x_min + inset, y_min + inset).of_size(
                box_width.saturating_sub(2 * inset as u32).max(1),
                box_height.saturating_sub(2 * inset as u32).max(1),
            );
            draw_hollow_rect_mut(&mut annotated, rect, color);
        }
    }

    let mut buf = Vec::new();
    annotated
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .context("Failed to encode the annotated image as JPEG")?;

    Ok(buf)
}

/// A detector that replays a canned result, for exercising the request
/// pipeline without a model session.
#[cfg(test)]
pub struct FakeDetector {
    pub detections: Vec<Detection>,
}

#[cfg(test)]
impl Detector for FakeDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
pub fn detection(label: &str, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
    Detection {
        label: label.to_string(),
        confidence,
        bounding_box: BoundingBox { x1, y1, x2, y2 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn blank_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
    }

    #[test]
    fn annotated_output_is_a_jpeg_with_the_input_dimensions() {
        let image = blank_image(64, 48);
        let detections = vec![detection("stop", 0.9, 8.0, 8.0, 32.0, 32.0)];

        let encoded = encode_annotated(&image, &detections).unwrap();

        let decoded = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn boxes_outside_the_image_are_clamped() {
        let image = blank_image(32, 32);
        let detections = vec![
            detection("stop", 0.8, -10.0, -10.0, 100.0, 100.0),
            detection("yield", 0.7, 30.0, 30.0, 31.0, 31.0),
        ];

        // must not panic on out-of-bounds or degenerate boxes
        encode_annotated(&image, &detections).unwrap();
    }

    #[test]
    fn annotation_changes_pixels_inside_the_image() {
        let image = blank_image(64, 64);
        let detections = vec![detection("stop", 0.9, 8.0, 8.0, 56.0, 56.0)];

        let encoded = encode_annotated(&image, &detections).unwrap();
        let plain = encode_annotated(&image, &[]).unwrap();

        assert_ne!(encoded, plain);
    }

    #[test]
    fn label_colors_come_from_the_palette() {
        assert!(PALETTE.contains(&label_color("stop")));
        assert!(PALETTE.contains(&label_color("yield")));
    }
}
