//! Tests for the pyramidal flow-matching scheduler
//!
//! Tests cover:
//! - Stage windows under shifted schedules
//! - Euler integration over a whole stage
//! - Renoise coefficients at stage transitions
//! - Configuration errors

use candle_core::{DType, Device, Result, Tensor};
use pyramid_flow::SamplerConfig;
use pyramid_flow::scheduler::{PyramidFlowScheduler, apply_cfg, linspace};

// ============================================================================
// Stage windows
// ============================================================================

#[test]
fn test_shifted_windows_stay_ordered() -> Result<()> {
    let config = SamplerConfig {
        shift: 3.0,
        ..Default::default()
    };
    let scheduler = PyramidFlowScheduler::new(config)?;
    assert_eq!(scheduler.num_stages(), 3);

    let mut previous_min = f64::INFINITY;
    for stage in 0..3 {
        let w = scheduler.window(stage).unwrap();
        assert!(w.timestep_max > w.timestep_min, "stage {stage}: {w:?}");
        assert!(w.timestep_max <= previous_min + 1e-9);
        assert!(w.start_sigma >= w.end_sigma);
        previous_min = w.timestep_min;
    }
    assert!(scheduler.window(3).is_none());
    Ok(())
}

#[test]
fn test_corrected_sigma_exceeds_original_after_first_stage() -> Result<()> {
    let scheduler = PyramidFlowScheduler::new(SamplerConfig::default())?;
    let first = scheduler.window(0).unwrap();
    assert_eq!(first.start_sigma, first.ori_start_sigma);
    for stage in 1..3 {
        let w = scheduler.window(stage).unwrap();
        assert!(
            w.start_sigma > w.ori_start_sigma,
            "renoising must raise the start sigma of stage {stage}"
        );
    }
    Ok(())
}

#[test]
fn test_ratios_cover_unit_interval() -> Result<()> {
    let scheduler = PyramidFlowScheduler::new(SamplerConfig::default())?;
    assert_eq!(scheduler.window(0).unwrap().ratio.0, 0.0);
    let last = scheduler.window(2).unwrap().ratio.1;
    assert!(last < 1.0 && last > 0.999_999);
    Ok(())
}

// ============================================================================
// Euler integration
// ============================================================================

#[test]
fn test_constant_velocity_integrates_to_unit_distance() -> Result<()> {
    let device = Device::Cpu;
    let scheduler = PyramidFlowScheduler::new(SamplerConfig::default())?;
    let schedule = scheduler.set_timesteps(7, 1)?;

    let start = Tensor::full(2.0f32, (1, 4, 1, 3, 3), &device)?;
    let v = Tensor::full(0.5f32, (1, 4, 1, 3, 3), &device)?;
    let mut x = start.clone();
    for idx in 0..schedule.len() {
        x = scheduler.step(&v, &x, &schedule, idx)?;
    }
    // sigmas run from 1 to 0, so x_end = x_start - v
    let got = x.flatten_all()?.to_vec1::<f32>()?;
    assert!(got.iter().all(|x| (x - 1.5).abs() < 1e-5), "{got:?}");
    Ok(())
}

#[test]
fn test_step_keeps_model_output_dtype() -> Result<()> {
    let device = Device::Cpu;
    let scheduler = PyramidFlowScheduler::new(SamplerConfig::default())?;
    let schedule = scheduler.set_timesteps(3, 0)?;
    let sample = Tensor::ones((1, 2, 1, 2, 2), DType::F32, &device)?;
    let v = Tensor::ones((1, 2, 1, 2, 2), DType::BF16, &device)?;
    let out = scheduler.step(&v, &sample, &schedule, 0)?;
    assert_eq!(out.dtype(), DType::BF16);
    Ok(())
}

#[test]
fn test_sigmas_follow_linspace() -> Result<()> {
    let scheduler = PyramidFlowScheduler::new(SamplerConfig::default())?;
    let schedule = scheduler.set_timesteps(5, 2)?;
    let mut expected = linspace(1.0, 0.001, 5);
    expected.push(0.0);
    assert_eq!(schedule.sigmas, expected);
    assert_eq!(schedule.stage, 2);
    assert!(!schedule.is_empty());
    Ok(())
}

// ============================================================================
// Renoising
// ============================================================================

#[test]
fn test_renoise_preserves_variance_budget() -> Result<()> {
    let config = SamplerConfig::default();
    let gamma = config.gamma;
    let scheduler = PyramidFlowScheduler::new(config)?;
    for stage in 1..3 {
        let (alpha, beta) = scheduler.renoise_coefficients(stage)?;
        assert!(alpha > 0.0 && alpha < 1.0);
        assert!(beta > 0.0);
        // beta / alpha = (1 - ori_sigma) / sqrt(gamma)
        let ori_sigma = 1.0 - scheduler.window(stage).unwrap().ori_start_sigma;
        assert!((beta / alpha - (1.0 - ori_sigma) / gamma.sqrt()).abs() < 1e-12);
    }
    assert!(scheduler.renoise_coefficients(3).is_err());
    Ok(())
}

// ============================================================================
// Guidance
// ============================================================================

#[test]
fn test_cfg_scale_one_returns_conditional() -> Result<()> {
    let device = Device::Cpu;
    let uncond = Tensor::new(&[0.25f32, -1.0, 4.0], &device)?;
    let cond = Tensor::new(&[1.0f32, 2.0, -3.0], &device)?;
    let guided = apply_cfg(&uncond, &cond, 1.0)?.to_vec1::<f32>()?;
    assert_eq!(guided, vec![1.0, 2.0, -3.0]);

    let unguided = apply_cfg(&uncond, &cond, 0.0)?.to_vec1::<f32>()?;
    assert_eq!(unguided, vec![0.25, -1.0, 4.0]);
    Ok(())
}

// ============================================================================
// Configuration errors
// ============================================================================

#[test]
fn test_invalid_configs_rejected() {
    let no_stages = SamplerConfig {
        stage_range: vec![0.0],
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(no_stages).is_err());

    let unordered = SamplerConfig {
        stage_range: vec![0.0, 0.5, 0.4, 1.0],
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(unordered).is_err());

    let bad_gamma = SamplerConfig {
        gamma: 0.0,
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(bad_gamma).is_err());

    let no_timesteps = SamplerConfig {
        num_train_timesteps: 0,
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(no_timesteps).is_err());

    let empty_units = SamplerConfig {
        frames_per_unit: 0,
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(empty_units).is_err());

    let no_channels = SamplerConfig {
        latent_channels: 0,
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(no_channels).is_err());

    let no_downsampling = SamplerConfig {
        vae_spatial_ratio: 0,
        ..Default::default()
    };
    assert!(PyramidFlowScheduler::new(no_downsampling).is_err());
}
