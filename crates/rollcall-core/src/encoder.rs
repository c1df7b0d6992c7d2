//! Face location and signature extraction.
//!
//! [`FaceEncoder`] is the seam the matcher works against. The bundled
//! implementation runs two ONNX models through ONNX Runtime: SCRFD for
//! locating faces and ArcFace for turning a face crop into a signature.

use crate::types::{FaceRegion, FaceSignature};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DET_NMS_THRESHOLD: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;
/// Extra context kept around a detected box before the embedder crop.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("face region lies outside the frame")]
    RegionOutOfBounds,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a grayscale frame and turns each into a signature.
pub trait FaceEncoder {
    /// All faces in the frame, highest confidence first.
    fn locate(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<FaceRegion>, EncoderError>;

    /// Signature for one located face.
    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceRegion,
    ) -> Result<FaceSignature, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn locate(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<FaceRegion>, EncoderError> {
        (**self).locate(frame, width, height)
    }

    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceRegion,
    ) -> Result<FaceSignature, EncoderError> {
        (**self).encode(frame, width, height, face)
    }
}

/// SCRFD + ArcFace encoder.
pub struct OnnxFaceEncoder {
    detector: Session,
    embedder: Session,
}

impl OnnxFaceEncoder {
    /// Load both models. Fails fast if either file is missing.
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, EncoderError> {
        let detector = load_session(detector_path)?;
        let outputs = detector.outputs().len();
        if outputs < 2 * DET_STRIDES.len() {
            return Err(EncoderError::InferenceFailed(format!(
                "detector needs score and box outputs for {} strides, got {outputs} outputs",
                DET_STRIDES.len()
            )));
        }
        let embedder = load_session(embedder_path)?;

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            "face models loaded"
        );

        Ok(Self { detector, embedder })
    }
}

fn load_session(path: &Path) -> Result<Session, EncoderError> {
    if !path.exists() {
        return Err(EncoderError::ModelNotFound(path.display().to_string()));
    }
    Ok(Session::builder()?.with_intra_threads(2)?.commit_from_file(path)?)
}

impl FaceEncoder for OnnxFaceEncoder {
    fn locate(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<FaceRegion>, EncoderError> {
        let gray = to_image(frame, width, height)?;
        let (input, letterbox) = letterbox_tensor(&gray);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in DET_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[pos]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[pos + DET_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            decode_stride(scores, boxes, stride, &letterbox, DET_CONFIDENCE_THRESHOLD, &mut candidates);
        }

        let faces = nms(candidates, DET_NMS_THRESHOLD);
        tracing::trace!(count = faces.len(), "faces located");
        Ok(faces)
    }

    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceRegion,
    ) -> Result<FaceSignature, EncoderError> {
        let gray = to_image(frame, width, height)?;
        let (x, y, w, h) = crop_bounds(face, width, height).ok_or(EncoderError::RegionOutOfBounds)?;
        let crop = imageops::crop_imm(&gray, x, y, w, h).to_image();
        let aligned = imageops::resize(&crop, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE, FilterType::Triangle);
        let input = embed_tensor(&aligned);

        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBED_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FaceSignature::new(l2_normalize(raw)))
    }
}

fn to_image(frame: &[u8], width: u32, height: u32) -> Result<GrayImage, EncoderError> {
    GrayImage::from_raw(width, height, frame.to_vec()).ok_or(EncoderError::InvalidFrame { width, height })
}

/// Scale and offset applied when fitting a frame into the square detector input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let side = DET_INPUT_SIZE as f32;
        let scale = (side / width.max(1) as f32).min(side / height.max(1) as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, DET_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, DET_INPUT_SIZE as u32);
        let letterbox = Self {
            scale,
            pad_x: ((DET_INPUT_SIZE as u32 - new_w) / 2) as f32,
            pad_y: ((DET_INPUT_SIZE as u32 - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// Detector-input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

fn letterbox_tensor(gray: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(gray.width(), gray.height());
    let resized = imageops::resize(gray, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, i.e. mid-grey after normalisation.
    let mut tensor = Array4::<f32>::zeros((1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE));
    let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - DET_MEAN) / DET_STD;
        let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = value;
        }
    }

    (tensor, letterbox)
}

fn embed_tensor(aligned: &GrayImage) -> Array4<f32> {
    let size = EMBED_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - EMBED_MEAN) / EMBED_STD;
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = value;
        }
    }
    tensor
}

/// Anchor-free SCRFD decoding for one stride: box outputs are distances
/// (left, top, right, bottom) from the anchor centre, in stride units.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
    out: &mut Vec<FaceRegion>,
) {
    let cells = DET_INPUT_SIZE / stride;
    let anchors = (cells * cells * DET_ANCHORS_PER_CELL).min(scores.len());
    let step = stride as f32;

    for (i, &score) in scores.iter().enumerate().take(anchors) {
        if score < threshold {
            continue;
        }
        let Some(dist) = boxes.get(i * 4..i * 4 + 4) else {
            break;
        };
        let cell = i / DET_ANCHORS_PER_CELL;
        let cx = ((cell % cells) * stride) as f32;
        let cy = ((cell / cells) * stride) as f32;

        let (x1, y1) = letterbox.unmap(cx - dist[0] * step, cy - dist[1] * step);
        let (x2, y2) = letterbox.unmap(cx + dist[2] * step, cy + dist[3] * step);
        out.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
}

fn nms(mut candidates: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<FaceRegion> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let left = a.x.max(b.x);
    let top = a.y.max(b.y);
    let right = (a.x + a.width).min(b.x + b.width);
    let bottom = (a.y + a.height).min(b.y + b.height);
    let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Integer crop rectangle for a face, widened by [`CROP_MARGIN`] and
/// clamped to the frame. `None` if nothing of the face is inside.
fn crop_bounds(face: &FaceRegion, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let left = (face.x - mx).max(0.0);
    let top = (face.y - my).max(0.0);
    let right = (face.x + face.width + mx).min(width as f32);
    let bottom = (face.y + face.height + my).min(height as f32);
    if right - left < 1.0 || bottom - top < 1.0 {
        return None;
    }
    Some((
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = region(0.0, 0.0, 10.0, 10.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        let b = region(20.0, 20.0, 10.0, 10.0, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_keeps_highest_of_overlapping_pair() {
        let faces = nms(
            vec![
                region(1.0, 1.0, 10.0, 10.0, 0.6),
                region(0.0, 0.0, 10.0, 10.0, 0.9),
                region(100.0, 100.0, 10.0, 10.0, 0.7),
            ],
            DET_NMS_THRESHOLD,
        );
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].confidence, 0.9);
        assert_eq!(faces[1].confidence, 0.7);
    }

    #[test]
    fn test_letterbox_unmap_inverts_fit() {
        let (lb, new_w, new_h) = Letterbox::fit(1280, 720);
        assert_eq!(new_w, 640);
        assert_eq!(new_h, 360);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);

        // Frame point (640, 360) lands at (320, 320) in detector space.
        let (x, y) = lb.unmap(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // Square 640x640 frame: identity letterbox.
        let (lb, _, _) = Letterbox::fit(640, 640);
        let stride = 32;
        let cells = DET_INPUT_SIZE / stride;
        let anchors = cells * cells * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];

        // Anchor 0 of cell (row 1, col 2) -> centre (64, 32).
        let idx = (cells + 2) * DET_ANCHORS_PER_CELL;
        scores[idx] = 0.8;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 0.5, 1.0, 0.5]);

        let mut out = Vec::new();
        decode_stride(&scores, &boxes, stride, &lb, 0.5, &mut out);
        assert_eq!(out.len(), 1);
        let face = &out[0];
        assert!((face.x - 32.0).abs() < 1e-3);
        assert!((face.y - 16.0).abs() < 1e-3);
        assert!((face.width - 64.0).abs() < 1e-3);
        assert!((face.height - 32.0).abs() < 1e-3);
        assert_eq!(face.confidence, 0.8);
    }

    #[test]
    fn test_crop_bounds_clamps_to_frame() {
        let face = region(-5.0, 10.0, 50.0, 50.0, 0.9);
        let (x, y, w, h) = crop_bounds(&face, 40, 100).unwrap();
        assert_eq!((x, y), (0, 5));
        assert_eq!(w, 40);
        assert_eq!(h, 60);

        let outside = region(500.0, 500.0, 10.0, 10.0, 0.9);
        assert!(crop_bounds(&outside, 100, 100).is_none());
    }

    #[test]
    fn test_embed_tensor_shape_and_channels() {
        let aligned = GrayImage::from_pixel(EMBED_INPUT_SIZE, EMBED_INPUT_SIZE, image::Luma([255]));
        let tensor = embed_tensor(&aligned);
        let size = EMBED_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 5]], tensor[[0, 2, 5, 5]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_to_image_rejects_wrong_size() {
        assert!(matches!(
            to_image(&[0u8; 10], 4, 4),
            Err(EncoderError::InvalidFrame { width: 4, height: 4 })
        ));
    }
}
