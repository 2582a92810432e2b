//! TorchScript-backed obstacle model.

use std::{convert::TryFrom, path::PathBuf};

use anyhow::{anyhow, Context};
use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use frame_ingest::{Frame, FrameFormat};

use crate::{Detection, DetectionBatch, InferenceError, ObstacleModel};

/// Load-time options for the TorchScript adapter.
#[derive(Clone, Debug)]
pub struct TorchModelOptions {
    pub model_path: PathBuf,
    /// Detections below this score are discarded before decode.
    pub confidence_threshold: f32,
    /// Intra-op thread count for CPU execution.
    pub num_threads: usize,
    /// Run on CUDA when available.
    pub use_accel: bool,
    /// Expected model input size (width, height).
    pub input_size: (i64, i64),
}

/// TorchScript module plus the preprocessing it expects.
///
/// Construction performs the (slow) module load and device placement; it is
/// intended to run on the detector worker thread, not the caller's.
pub struct TorchModel {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
}

impl TorchModel {
    pub fn load(opts: &TorchModelOptions) -> anyhow::Result<Self> {
        let device = if opts.use_accel {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        };
        if device == Device::Cpu {
            tch::set_num_threads(opts.num_threads.max(1) as i32);
        }

        let module = tch::CModule::load_on_device(&opts.model_path, device)
            .with_context(|| format!("loading TorchScript model {:?}", opts.model_path))?;
        debug!(device = ?device, model = %opts.model_path.display(), "detector model loaded");

        Ok(Self {
            module,
            device,
            input_size: opts.input_size,
            confidence_threshold: opts.confidence_threshold,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Converts a BGR8 frame into a normalized NCHW float tensor, resizing to
    /// the model input when the capture size differs.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, InferenceError> {
        if frame.format != FrameFormat::Bgr8 {
            return Err(InferenceError::MalformedInput(
                "expected BGR8 frame".into(),
            ));
        }
        let expected = (frame.width as usize) * (frame.height as usize) * 3;
        if frame.data.len() != expected {
            return Err(InferenceError::MalformedInput(format!(
                "frame buffer holds {} bytes, expected {expected}",
                frame.data.len()
            )));
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, frame.height as i64, frame.width as i64, 3])
            // BGR -> RGB
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;

        let tensor = if (frame.width as i64, frame.height as i64) != (in_w, in_h) {
            tensor.upsample_bilinear2d([in_h, in_w], false, None, None)
        } else {
            tensor
        };
        Ok(tensor)
    }

    /// Decode a `[1, channels, preds]` output into frame-space detections.
    fn decode_output(&self, output: &Tensor, frame: &Frame) -> anyhow::Result<DetectionBatch> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected detector output shape: {shape:?}"));
        }
        if shape[1] < 5 {
            return Err(anyhow!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            ));
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 {
                continue;
            }
            let score = row[4];
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(Detection {
                bbox: [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
                score,
                class_id,
            });
        }

        Ok(DetectionBatch { detections })
    }
}

impl ObstacleModel for TorchModel {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionBatch, InferenceError> {
        let input = self.frame_to_tensor(frame)?;
        let output = self
            .module
            .forward_ts(&[input])
            .map_err(|err| InferenceError::Execution(err.into()))?;
        self.decode_output(&output, frame)
            .map_err(InferenceError::Execution)
    }
}
