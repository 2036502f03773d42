use super::types::{InferenceEngine, MaskTensor, NormalizedTensor, MODEL_INPUT_SIZE};
use crate::error::SegmentationError;
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::str::FromStr;

/// Threads used when running on the CPU provider
const CPU_THREADS: usize = 6;

/// Where the inference session should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceHint {
    #[default]
    Cpu,
    Cuda,
    TensorRt,
}

impl FromStr for DeviceHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::TensorRt),
            other => Err(format!("unknown device '{other}' (expected cpu, cuda or tensorrt)")),
        }
    }
}

/// Mobile U-Net person segmentation model
///
/// Single-input, single-output network: a [1, 3, 512, 512] normalized frame
/// in, 512x512 foreground probabilities out.
pub struct MobileUnet {
    session: Session,
    width: u32,
    height: u32,
}

impl MobileUnet {
    /// Load the model from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `device` - Execution provider to prefer; ONNX Runtime falls back to
    ///   the CPU when the provider is unavailable
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        device: DeviceHint,
    ) -> Result<Self, SegmentationError> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {} ({:?})", path.display(), device);

        let session = build_session(path, device).map_err(|source| SegmentationError::ModelLoad {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Segmentation model loaded successfully");

        Ok(Self {
            session,
            width: MODEL_INPUT_SIZE,
            height: MODEL_INPUT_SIZE,
        })
    }
}

fn build_session(path: &Path, device: DeviceHint) -> ort::Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let builder = match device {
        DeviceHint::Cpu => builder.with_intra_threads(CPU_THREADS)?,
        DeviceHint::Cuda => {
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])?
        }
        DeviceHint::TensorRt => builder.with_execution_providers([
            TensorRTExecutionProvider::default().build(),
            CUDAExecutionProvider::default().build(),
        ])?,
    };

    builder.commit_from_file(path)
}

impl InferenceEngine for MobileUnet {
    fn run(&mut self, input: &NormalizedTensor) -> Result<MaskTensor, SegmentationError> {
        let _span = tracing::debug_span!("inference").entered();

        let expected = [1, 3, self.height as usize, self.width as usize];
        if input.shape() != expected {
            return Err(SegmentationError::Run(format!(
                "input shape {:?}, expected {:?}",
                input.shape(),
                expected
            )));
        }

        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_array((expected, data))
            .map_err(|err| SegmentationError::Run(format!("failed to build input tensor: {err}")))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|err| SegmentationError::Run(err.to_string()))?;

        let (shape, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|err| SegmentationError::Run(format!("failed to read output: {err}")))?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        if spatial_dims(&dims) != Some((i64::from(self.height), i64::from(self.width))) {
            return Err(SegmentationError::Run(format!(
                "unexpected output shape {dims:?}"
            )));
        }

        Ok(MaskTensor::new(scores.to_vec(), self.width, self.height)?)
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Height and width of a single-mask output shaped [H, W], [1, H, W] or
/// [1, 1, H, W]
fn spatial_dims(dims: &[i64]) -> Option<(i64, i64)> {
    match dims {
        [h, w] | [1, h, w] | [1, 1, h, w] => Some((*h, *w)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_hint_parses() {
        assert_eq!("CPU".parse::<DeviceHint>(), Ok(DeviceHint::Cpu));
        assert_eq!("cuda".parse::<DeviceHint>(), Ok(DeviceHint::Cuda));
        assert_eq!("trt".parse::<DeviceHint>(), Ok(DeviceHint::TensorRt));
        assert!("tpu".parse::<DeviceHint>().is_err());
    }

    #[test]
    fn accepts_single_mask_output_shapes() {
        assert_eq!(spatial_dims(&[512, 512]), Some((512, 512)));
        assert_eq!(spatial_dims(&[1, 512, 256]), Some((512, 256)));
        assert_eq!(spatial_dims(&[1, 1, 512, 512]), Some((512, 512)));
    }

    #[test]
    fn rejects_other_output_shapes() {
        assert_eq!(spatial_dims(&[512]), None);
        assert_eq!(spatial_dims(&[2, 512, 512]), None);
        assert_eq!(spatial_dims(&[1, 2, 512, 512]), None);
        assert_eq!(spatial_dims(&[1, 1, 1, 512, 512]), None);
    }

    #[test]
    fn missing_model_is_a_load_error() {
        let result = MobileUnet::load("/nonexistent/model.onnx", DeviceHint::Cpu);
        assert!(matches!(result, Err(SegmentationError::ModelLoad { .. })));
    }
}
