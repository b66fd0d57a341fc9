// The generation pipeline: a fixed, linear node graph.
//
//   checkpoint -> lora -> clip encode (pos/neg) -> sampling patch -> ksampler
//                                          empty latent ----^         |
//                                                    vae decode <-----'
//                                                    save image
//
// The model-loading prefix is built once and shared across renders; only the
// prompt encodes and everything downstream change per image.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::client::ComfyClient;
use crate::config::GenConfig;
use crate::flow::{Flow, Input, NodeRef};
use crate::paths::{ModelKind, ModelPaths};
use crate::registry::NodeRegistry;
use crate::utils;

/// Output slot conventions for the loader nodes.
mod slots {
    pub const CHECKPOINT_MODEL: u32 = 0;
    pub const CHECKPOINT_CLIP: u32 = 1;
    pub const CHECKPOINT_VAE: u32 = 2;
    pub const LORA_MODEL: u32 = 0;
    pub const LORA_CLIP: u32 = 1;
    pub const LATENT: u32 = 0;
    pub const PATCHED_MODEL: u32 = 0;
    pub const CONDITIONING: u32 = 0;
    pub const SAMPLED_LATENT: u32 = 0;
    pub const DECODED_IMAGE: u32 = 0;
}

/// The reusable portion of the pipeline: checkpoint, LoRA and the empty
/// latent. Building this once per run lets the backend's node cache skip the
/// (slow) model loads on every render after the first.
pub struct ModelBundle {
    flow: Flow,
    checkpoint: NodeRef,
    lora: NodeRef,
    latent: NodeRef,
}

impl ModelBundle {
    pub fn build(config: &GenConfig, registry: &NodeRegistry) -> Result<Self> {
        registry.require_all().context("backend is missing required nodes")?;

        let mut flow = Flow::new();
        let checkpoint = flow.add(
            "CheckpointLoaderSimple",
            vec![("ckpt_name", Input::text(&config.model.checkpoint))],
        );
        let latent = flow.add(
            "EmptyLatentImage",
            vec![
                ("width", Input::Int(config.model.width as i64)),
                ("height", Input::Int(config.model.height as i64)),
                ("batch_size", Input::Int(config.model.batch_size as i64)),
            ],
        );
        let lora = flow.add(
            "LoraLoader",
            vec![
                ("lora_name", Input::text(&config.model.lora)),
                ("strength_model", Input::Float(config.model.strength_model)),
                ("strength_clip", Input::Float(config.model.strength_clip)),
                ("model", checkpoint.output(slots::CHECKPOINT_MODEL)),
                ("clip", checkpoint.output(slots::CHECKPOINT_CLIP)),
            ],
        );
        flow.validate(registry)?;

        Ok(Self {
            flow,
            checkpoint,
            lora,
            latent,
        })
    }

    fn model(&self) -> Input {
        self.lora.output(slots::LORA_MODEL)
    }

    fn clip(&self) -> Input {
        self.lora.output(slots::LORA_CLIP)
    }

    fn vae(&self) -> Input {
        self.checkpoint.output(slots::CHECKPOINT_VAE)
    }

    /// Extends a clone of the bundle with the per-prompt stages, yielding a
    /// complete flow for one render.
    pub fn render_flow(&self, config: &GenConfig, positive_prompt: &str, seed: u64) -> Flow {
        let mut flow = self.flow.clone();
        let positive = flow.add(
            "CLIPTextEncode",
            vec![("text", Input::text(positive_prompt)), ("clip", self.clip())],
        );
        let negative = flow.add(
            "CLIPTextEncode",
            vec![
                ("text", Input::text(&config.output.negative_prompt)),
                ("clip", self.clip()),
            ],
        );
        let patched = flow.add(
            "ModelSamplingDiscrete",
            vec![
                ("sampling", Input::text(&config.sampler.sampling)),
                ("zsnr", Input::Bool(config.sampler.zsnr)),
                ("model", self.model()),
            ],
        );
        let sampler = flow.add(
            "KSampler",
            vec![
                ("seed", Input::Uint(seed)),
                ("steps", Input::Int(config.sampler.steps as i64)),
                ("cfg", Input::Float(config.sampler.cfg)),
                ("sampler_name", Input::text(&config.sampler.sampler_name)),
                ("scheduler", Input::text(&config.sampler.scheduler)),
                ("denoise", Input::Float(config.sampler.denoise)),
                ("model", patched.output(slots::PATCHED_MODEL)),
                ("positive", positive.output(slots::CONDITIONING)),
                ("negative", negative.output(slots::CONDITIONING)),
                ("latent_image", self.latent.output(slots::LATENT)),
            ],
        );
        let decoded = flow.add(
            "VAEDecode",
            vec![
                ("samples", sampler.output(slots::SAMPLED_LATENT)),
                ("vae", self.vae()),
            ],
        );
        flow.add(
            "SaveImage",
            vec![
                ("filename_prefix", Input::text(&config.output.filename_prefix)),
                ("images", decoded.output(slots::DECODED_IMAGE)),
            ],
        );
        flow
    }
}

pub struct Pipeline {
    config: GenConfig,
    client: ComfyClient,
    bundle: ModelBundle,
}

impl Pipeline {
    /// Connects to the backend, acquires its node registry, checks the model
    /// files, and builds the reusable bundle.
    pub async fn new(config: GenConfig) -> Result<Self> {
        let client = ComfyClient::new(&config.backend);
        let registry = NodeRegistry::fetch(&client)
            .await
            .context("failed to acquire node registry")?;
        info!("Backend registry holds {} node classes", registry.len());

        // A miss here isn't fatal; the server may have search paths we can't
        // see from this machine.
        let cwd = std::env::current_dir().context("failed to get working directory")?;
        let model_paths = ModelPaths::discover(&cwd);
        for (kind, filename) in [
            (ModelKind::Checkpoint, &config.model.checkpoint),
            (ModelKind::Lora, &config.model.lora),
        ] {
            match model_paths.locate(kind, filename) {
                Some(path) => info!("{} resolves to {}", filename, path.display()),
                None => warn!(
                    "{} not found in any local model directory; relying on the server's own search paths",
                    filename
                ),
            }
        }

        let bundle = ModelBundle::build(&config, &registry)?;
        Ok(Self {
            config,
            client,
            bundle,
        })
    }

    /// Renders one image (well, one batch) and writes the results to the
    /// output directory. Returns the paths written.
    pub async fn render(&self, positive_prompt: &str, seed: u64) -> Result<Vec<PathBuf>> {
        info!("Rendering with seed {}: {}", seed, positive_prompt);
        let flow = self.bundle.render_flow(&self.config, positive_prompt, seed);
        let prompt_id = self.client.queue(&flow).await?;
        let outputs = self.client.wait_for_outputs(&prompt_id).await?;
        if outputs.is_empty() {
            anyhow::bail!("backend reported success but saved no images");
        }

        std::fs::create_dir_all(&self.config.output.dir).with_context(|| {
            format!("failed to create {}", self.config.output.dir.display())
        })?;
        let mut paths = Vec::new();
        let mut blobs = Vec::new();
        for output in &outputs {
            let blob = self.client.fetch_image(output).await?;
            let path = self.config.output.dir.join(&output.filename);
            std::fs::write(&path, &blob)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Saved {}", path.display());
            paths.push(path);
            blobs.push(blob);
        }

        // Multi-image batches also get a contact sheet.
        if blobs.len() > 1 {
            let overview = utils::overview_of_pictures(&blobs)?;
            let path = self
                .config
                .output
                .dir
                .join(format!("{}_overview_{}.png", self.config.output.filename_prefix, seed));
            std::fs::write(&path, overview)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Saved {}", path.display());
            paths.push(path);
        }
        Ok(paths)
    }
}
