//! Spatial pyramid operations on `[b, c, t, h, w]` latents.

use candle_core::{Result, Tensor};

/// Apply a per-frame 2D op to a 5D latent.
fn per_frame(x: &Tensor, f: impl FnOnce(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
    let (b, c, t, h, w) = x.dims5()?;
    let frames = x.permute((0, 2, 1, 3, 4))?.contiguous()?.reshape((b * t, c, h, w))?;
    let out = f(&frames)?;
    let (_, _, h2, w2) = out.dims4()?;
    out.reshape((b, t, c, h2, w2))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()
}

/// Half-resolution bilinear resize.
///
/// For even sizes, half-pixel bilinear sampling at scale 1/2 averages each
/// 2x2 block, so this is a 2x2 average pool.
pub fn downsample(x: &Tensor) -> Result<Tensor> {
    let (_, _, _, h, w) = x.dims5()?;
    if !h.is_multiple_of(2) || !w.is_multiple_of(2) {
        candle_core::bail!("cannot halve latent of spatial size {h}x{w}");
    }
    per_frame(x, |frames| frames.avg_pool2d(2))
}

/// Nearest-neighbour 2x upsample.
pub fn upsample_nearest(x: &Tensor) -> Result<Tensor> {
    let (_, _, _, h, w) = x.dims5()?;
    per_frame(x, |frames| frames.upsample_nearest2d(h * 2, w * 2))
}

/// Bring full-resolution noise down to the coarsest stage, keeping unit
/// variance by doubling the amplitude at every halving.
pub fn coarsen_noise(noise: &Tensor, stages: usize) -> Result<Tensor> {
    let mut x = noise.clone();
    for _ in 1..stages {
        x = downsample(&x)?.affine(2.0, 0.0)?;
    }
    Ok(x)
}

/// Resolution pyramid of clean latents, coarsest first.
pub fn latent_pyramid(x: &Tensor, stages: usize) -> Result<Vec<Tensor>> {
    let mut levels = Vec::with_capacity(stages);
    levels.push(x.clone());
    for _ in 1..stages {
        let next = downsample(levels.last().unwrap_or(x))?;
        levels.push(next);
    }
    levels.reverse();
    Ok(levels)
}

/// History latents fed to `stage` while generating time unit `unit` (> 0).
///
/// `pyramid` is [`latent_pyramid`] of every frame generated so far. The most
/// recent unit is taken at the stage's own resolution, each older unit one
/// level coarser, and whatever remains at the coarsest level. Returned
/// oldest first.
pub fn history_for_stage(
    pyramid: &[Tensor],
    stage: usize,
    unit: usize,
    frames_per_unit: usize,
) -> Result<Vec<Tensor>> {
    let Some(level) = pyramid.get(stage) else {
        candle_core::bail!("stage {stage} outside pyramid of {} levels", pyramid.len())
    };
    let total = level.dim(2)?;
    if total < frames_per_unit {
        candle_core::bail!("history has {total} frames, need at least {frames_per_unit}");
    }
    let mut inputs = vec![level.narrow(2, total - frames_per_unit, frames_per_unit)?];

    let mut cur_stage = stage;
    let mut ptx = 1;
    while ptx < unit {
        cur_stage = cur_stage.saturating_sub(1);
        if cur_stage == 0 {
            break;
        }
        ptx += 1;
        let start = total
            .checked_sub(ptx * frames_per_unit)
            .ok_or_else(|| candle_core::Error::Msg(format!("history too short for unit {unit}")))?;
        inputs.push(pyramid[cur_stage].narrow(2, start, frames_per_unit)?);
    }
    if cur_stage == 0 && ptx < unit {
        let len = total.saturating_sub(ptx * frames_per_unit);
        if len > 0 {
            inputs.push(pyramid[0].narrow(2, 0, len)?);
        }
    }
    inputs.reverse();
    Ok(inputs)
}
