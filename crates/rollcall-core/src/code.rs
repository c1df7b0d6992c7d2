//! Printed ID code reading.
//!
//! A frame may carry a matrix code (QR) and a linear barcode at the same
//! time. [`CodeScanner`] tries matrix decoders before linear ones so matrix
//! data wins whenever both decode.

use rxing::BarcodeFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeError {
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Family of printed code, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CodeFamily {
    Matrix,
    Linear,
}

/// One decoder for one family of codes.
pub trait CodeDecoder {
    fn family(&self) -> CodeFamily;

    /// Decoded payload, or `None` when no code of this family is readable.
    fn decode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Option<String>, CodeError>;
}

/// What the session loop polls while waiting for an ID card.
pub trait CodeReader {
    /// Text of a code readable in this frame, if any.
    fn scan(&mut self, frame: &[u8], width: u32, height: u32) -> Option<String>;
}

/// Runs every configured decoder in family precedence order.
pub struct CodeScanner {
    decoders: Vec<Box<dyn CodeDecoder>>,
}

impl CodeScanner {
    pub fn new(mut decoders: Vec<Box<dyn CodeDecoder>>) -> Self {
        decoders.sort_by_key(|d| d.family());
        Self { decoders }
    }

    /// Scanner with the built-in QR and linear barcode decoders.
    pub fn with_default_decoders() -> Self {
        Self::new(vec![Box::new(QrDecoder), Box::new(LinearDecoder)])
    }
}

impl CodeReader for CodeScanner {
    fn scan(&mut self, frame: &[u8], width: u32, height: u32) -> Option<String> {
        for decoder in &mut self.decoders {
            match decoder.decode(frame, width, height) {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        tracing::debug!(family = ?decoder.family(), "code decoded");
                        return Some(text.to_string());
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(family = ?decoder.family(), error = %e, "code decoder failed"),
            }
        }
        None
    }
}

/// QR decoder backed by `rqrr`.
pub struct QrDecoder;

impl CodeDecoder for QrDecoder {
    fn family(&self) -> CodeFamily {
        CodeFamily::Matrix
    }

    fn decode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Option<String>, CodeError> {
        let (w, h) = (width as usize, height as usize);
        if frame.len() < w * h {
            return Err(CodeError::InvalidFrame { width, height });
        }

        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| frame[y * w + x]);
        let mut last_err = None;
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((_, content)) => return Ok(Some(content)),
                Err(e) => last_err = Some(e.to_string()),
            }
        }

        match last_err {
            Some(e) => Err(CodeError::Decode(e)),
            None => Ok(None),
        }
    }
}

/// 1D barcode decoder backed by `rxing`. Matrix symbologies are ignored.
pub struct LinearDecoder;

impl CodeDecoder for LinearDecoder {
    fn family(&self) -> CodeFamily {
        CodeFamily::Linear
    }

    fn decode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Option<String>, CodeError> {
        let pixels = (width as usize) * (height as usize);
        let Some(luma) = frame.get(..pixels) else {
            return Err(CodeError::InvalidFrame { width, height });
        };

        match rxing::helpers::detect_in_luma(luma.to_vec(), width, height, None) {
            Ok(found) if is_linear(found.getBarcodeFormat()) => Ok(Some(found.getText().to_string())),
            Ok(found) => {
                tracing::trace!(format = ?found.getBarcodeFormat(), "matrix symbol left to matrix decoders");
                Ok(None)
            }
            Err(e) => {
                tracing::trace!(error = ?e, "no linear barcode");
                Ok(None)
            }
        }
    }
}

fn is_linear(format: &BarcodeFormat) -> bool {
    matches!(
        format,
        BarcodeFormat::CODABAR
            | BarcodeFormat::CODE_39
            | BarcodeFormat::CODE_93
            | BarcodeFormat::CODE_128
            | BarcodeFormat::EAN_8
            | BarcodeFormat::EAN_13
            | BarcodeFormat::ITF
            | BarcodeFormat::RSS_14
            | BarcodeFormat::RSS_EXPANDED
            | BarcodeFormat::UPC_A
            | BarcodeFormat::UPC_E
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        family: CodeFamily,
        result: Option<&'static str>,
        fail: bool,
    }

    impl CodeDecoder for Fixed {
        fn family(&self) -> CodeFamily {
            self.family
        }

        fn decode(&mut self, _: &[u8], _: u32, _: u32) -> Result<Option<String>, CodeError> {
            if self.fail {
                return Err(CodeError::Decode("damaged".into()));
            }
            Ok(self.result.map(str::to_string))
        }
    }

    fn fixed(family: CodeFamily, result: Option<&'static str>) -> Box<dyn CodeDecoder> {
        Box::new(Fixed { family, result, fail: false })
    }

    #[test]
    fn test_matrix_wins_when_both_decode() {
        // Linear registered first; precedence must still pick matrix.
        let mut scanner = CodeScanner::new(vec![
            fixed(CodeFamily::Linear, Some("LINEAR-1")),
            fixed(CodeFamily::Matrix, Some("MATRIX-1")),
        ]);
        assert_eq!(scanner.scan(&[0; 4], 2, 2).as_deref(), Some("MATRIX-1"));
    }

    #[test]
    fn test_falls_back_to_linear() {
        let mut scanner = CodeScanner::new(vec![
            fixed(CodeFamily::Matrix, None),
            fixed(CodeFamily::Linear, Some(" 21CS042 ")),
        ]);
        assert_eq!(scanner.scan(&[0; 4], 2, 2).as_deref(), Some("21CS042"));
    }

    #[test]
    fn test_decoder_error_is_not_fatal() {
        let mut scanner = CodeScanner::new(vec![
            Box::new(Fixed { family: CodeFamily::Matrix, result: None, fail: true }),
            fixed(CodeFamily::Linear, Some("B-7")),
        ]);
        assert_eq!(scanner.scan(&[0; 4], 2, 2).as_deref(), Some("B-7"));
    }

    #[test]
    fn test_nothing_readable() {
        let mut scanner = CodeScanner::new(vec![
            fixed(CodeFamily::Matrix, None),
            fixed(CodeFamily::Linear, Some("   ")),
        ]);
        assert_eq!(scanner.scan(&[0; 4], 2, 2), None);
    }

    #[test]
    fn test_default_scanner_reads_both_families_matrix_first() {
        let scanner = CodeScanner::with_default_decoders();
        let families: Vec<CodeFamily> = scanner.decoders.iter().map(|d| d.family()).collect();
        assert_eq!(families, vec![CodeFamily::Matrix, CodeFamily::Linear]);
    }

    #[test]
    fn test_linear_blank_frame() {
        let frame = vec![255u8; 64 * 64];
        assert_eq!(LinearDecoder.decode(&frame, 64, 64).unwrap(), None);
        assert!(matches!(
            LinearDecoder.decode(&frame, 128, 128),
            Err(CodeError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_symbology_families() {
        assert!(is_linear(&BarcodeFormat::CODE_128));
        assert!(is_linear(&BarcodeFormat::EAN_13));
        assert!(!is_linear(&BarcodeFormat::QR_CODE));
        assert!(!is_linear(&BarcodeFormat::DATA_MATRIX));
    }

    #[test]
    fn test_qr_blank_frame() {
        let frame = vec![255u8; 64 * 64];
        assert_eq!(QrDecoder.decode(&frame, 64, 64).unwrap(), None);
        assert!(matches!(
            QrDecoder.decode(&frame, 128, 128),
            Err(CodeError::InvalidFrame { .. })
        ));
    }
}
