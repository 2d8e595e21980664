//! Image files in and out of the pipeline: seed images for `encode_image`
//! and PNG frames from `decode`.

use candle_core::{DType, Device, Result, Tensor};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load an image file as `[1, height, width, 3]` f32 in `[0, 1]`, resized to
/// the sampling resolution.
pub fn load_image(path: impl AsRef<Path>, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let img = image::open(path)
        .map_err(|e| candle_core::Error::Msg(format!("Failed to open image {}: {e}", path.display())))?;
    let img = img
        .resize_exact(width as u32, height as u32, image::imageops::FilterType::Lanczos3)
        .to_rgb8();
    let data: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    Tensor::from_vec(data, (1, height, width, 3), device)
}

/// Quantize `[N, H, W, 3]` frames in `[0, 1]` to RGB8 bytes, one buffer per frame.
pub fn frames_to_rgb8(frames: &Tensor) -> Result<Vec<Vec<u8>>> {
    let (n, _, _, c) = frames.dims4()?;
    if c != 3 {
        candle_core::bail!("expected RGB frames, got {c} channels");
    }
    let bytes = frames
        .to_dtype(DType::F32)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?;
    (0..n)
        .map(|i| bytes.get(i)?.flatten_all()?.to_vec1::<u8>())
        .collect()
}

/// Write `frame_0000.png`, `frame_0001.png`, ... into `dir`.
pub fn save_frames(frames: &Tensor, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let (_, h, w, _) = frames.dims4()?;
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for (t, data) in frames_to_rgb8(frames)?.into_iter().enumerate() {
        let Some(img) = image::RgbImage::from_raw(w as u32, h as u32, data) else {
            candle_core::bail!("frame {t} does not fit {w}x{h}");
        };
        let path = dir.join(format!("frame_{t:04}.png"));
        img.save(&path)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to save {}: {e}", path.display())))?;
        written.push(path);
    }
    info!(frames = written.len(), dir = %dir.display(), "frames saved");
    Ok(written)
}
