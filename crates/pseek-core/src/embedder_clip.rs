//! CLIP embedding model for cross-modal photo search
//!
//! OpenAI's CLIP (Contrastive Language-Image Pre-training) maps text and
//! images into one 512-dimensional space, so a text query can rank photos
//! directly by cosine similarity.
//!
//! Architecture: Vision Transformer (ViT-B/32) + text transformer, loaded
//! with Candle from the HuggingFace hub. Both towers' outputs are
//! L2-normalized here; the index relies on unit-norm rows.
//!
//! Model: openai/clip-vit-base-patch32

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::api::sync::ApiBuilder;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::embedder::{
    decode_rgb_batch, decode_workers, EmbedPhase, EmbedProgress, Embedder, ImageEmbeddings,
    ProgressSink,
};
use crate::error::CoreError;

/// CLIP embedding dimension (ViT-B/32).
pub const CLIP_DIM: usize = 512;

/// CLIP image input size (224x224 pixels).
pub const CLIP_IMAGE_SIZE: usize = 224;

/// Maximum sequence length for the text encoder.
const MAX_SEQ_LEN: usize = 77;

const DEFAULT_MODEL_ID: &str = "openai/clip-vit-base-patch32";

/// CLIP normalization constants (the values CLIP was trained with).
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Create the compute device for the current platform.
pub fn make_device() -> Device {
    #[cfg(target_os = "macos")]
    {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Device::Cpu
    }
}

/// CLIP embedder backed by Candle.
pub struct ClipEmbedder {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl ClipEmbedder {
    /// Load the default CLIP model from the HuggingFace hub.
    pub fn new(device: &Device) -> Result<Self> {
        Self::from_pretrained(DEFAULT_MODEL_ID, device)
    }

    /// Load a specific CLIP checkpoint by model id.
    pub fn from_pretrained(model_id: &str, device: &Device) -> Result<Self> {
        let (config_path, tokenizer_path, weights_path) =
            download_model(model_id).map_err(|e| {
                anyhow::Error::new(CoreError::EmbedderUnavailable(format!(
                    "failed to fetch {model_id}: {e}"
                )))
            })?;
        Self::from_files(model_id, &config_path, &tokenizer_path, &weights_path, device)
    }

    /// Load from already-downloaded files.
    pub fn from_files(
        model_id: &str,
        _config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
        device: &Device,
    ) -> Result<Self> {
        let config = ClipConfig::vit_base_patch32();

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::Error::new(CoreError::EmbedderUnavailable(format!(
                "failed to load tokenizer: {e}"
            )))
        })?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)
        }
        .map_err(|e| {
            anyhow::Error::new(CoreError::EmbedderUnavailable(format!(
                "failed to load weights: {e}"
            )))
        })?;
        let model = ClipModel::new(vb, &config).map_err(|e| {
            anyhow::Error::new(CoreError::EmbedderUnavailable(format!(
                "failed to build model: {e}"
            )))
        })?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            model_id: model_id.to_string(),
        })
    }

    /// Preprocess one decoded image into a `(3, 224, 224)` tensor.
    fn preprocess(&self, image: &image::RgbImage) -> Result<Tensor> {
        let resized = image::imageops::resize(
            image,
            CLIP_IMAGE_SIZE as u32,
            CLIP_IMAGE_SIZE as u32,
            image::imageops::FilterType::Triangle,
        );

        // HWC u8 -> CHW normalized f32.
        let mut data = Vec::with_capacity(3 * CLIP_IMAGE_SIZE * CLIP_IMAGE_SIZE);
        for c in 0..3 {
            for y in 0..CLIP_IMAGE_SIZE {
                for x in 0..CLIP_IMAGE_SIZE {
                    let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                    data.push((value - MEAN[c]) / STD[c]);
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (3, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE),
            &self.device,
        )?)
    }

    /// Encode a batch of preprocessed images into unit-norm rows.
    fn encode_images(&self, batch: &[Tensor]) -> Result<Vec<Vec<f32>>> {
        let stacked = Tensor::stack(batch, 0)?;
        let features = self
            .model
            .get_image_features(&stacked)
            .map_err(model_failure)?;
        let normalized = l2_normalize(&features)?;
        Ok(normalized.to_vec2::<f32>()?)
    }
}

fn model_failure(e: candle_core::Error) -> anyhow::Error {
    anyhow::Error::new(CoreError::EmbedderUnavailable(e.to_string()))
}

impl Embedder for ClipEmbedder {
    fn index_id(&self) -> String {
        self.model_id.clone()
    }

    fn dim(&self) -> usize {
        CLIP_DIM
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&x| x as i64).collect();
        input_ids.truncate(MAX_SEQ_LEN);
        while input_ids.len() < MAX_SEQ_LEN {
            input_ids.push(0);
        }

        let input = Tensor::new(&input_ids[..], &self.device)?.unsqueeze(0)?;
        let features = self.model.get_text_features(&input).map_err(model_failure)?;
        let normalized = l2_normalize(&features)?;
        Ok(normalized.squeeze(0)?.to_vec1::<f32>()?)
    }

    fn embed_images(
        &mut self,
        paths: &[PathBuf],
        batch_size: usize,
        progress: Option<ProgressSink>,
    ) -> Result<ImageEmbeddings> {
        let batch_size = batch_size.max(1);
        let workers = decode_workers(self.is_accelerated());

        let mut data: Vec<f32> = Vec::with_capacity(paths.len() * CLIP_DIM);
        let mut valid = 0usize;
        let mut done = 0usize;

        for chunk in paths.chunks(batch_size) {
            let decoded = decode_rgb_batch(chunk, workers);
            emit(
                progress,
                EmbedPhase::Load,
                done + chunk.len(),
                paths.len(),
                valid,
            );

            // Encode only the decodable images; reinsert zero rows after.
            let mut tensors = Vec::new();
            let mut positions = Vec::new();
            for (i, image) in decoded.iter().enumerate() {
                if let Some(image) = image {
                    tensors.push(self.preprocess(image)?);
                    positions.push(i);
                }
            }

            emit(progress, EmbedPhase::EncodeStart, done, paths.len(), valid);
            let encoded = if tensors.is_empty() {
                Vec::new()
            } else {
                self.encode_images(&tensors)?
            };

            let mut rows: Vec<Option<&Vec<f32>>> = vec![None; chunk.len()];
            for (slot, row) in positions.iter().zip(encoded.iter()) {
                rows[*slot] = Some(row);
            }
            for row in rows {
                match row {
                    Some(values) => {
                        data.extend(values.iter().copied());
                        valid += 1;
                    }
                    None => data.extend(std::iter::repeat(0.0).take(CLIP_DIM)),
                }
            }

            done += chunk.len();
            emit(progress, EmbedPhase::EncodeDone, done, paths.len(), valid);
        }

        let matrix = Array2::from_shape_vec((paths.len(), CLIP_DIM), data)?;
        Ok(ImageEmbeddings::new(matrix))
    }

    fn is_accelerated(&self) -> bool {
        !self.device.is_cpu()
    }
}

fn emit(progress: Option<ProgressSink>, phase: EmbedPhase, done: usize, total: usize, valid: usize) {
    if let Some(sink) = progress {
        sink(&EmbedProgress {
            phase,
            done,
            total,
            valid,
        });
    }
}

fn download_model(model_id: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let api = ApiBuilder::new()
        .with_progress(true)
        .build()
        .context("failed to create HuggingFace API")?;
    let repo = api.model(model_id.to_string());

    tracing::info!("fetching CLIP model files for {model_id}");
    let config = repo.get("config.json").context("missing config.json")?;
    let tokenizer = repo
        .get("tokenizer.json")
        .context("missing tokenizer.json")?;
    let weights = repo
        .get("model.safetensors")
        .context("missing model.safetensors")?;
    Ok((config, tokenizer, weights))
}

/// L2 normalize a `(B, D)` tensor along the last dimension.
fn l2_normalize(tensor: &Tensor) -> Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(tensor.broadcast_div(&norm.clamp(1e-12, f64::MAX)?)?)
}
