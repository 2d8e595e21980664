//! Stage schedule: per-stage step counts and guidance weights for the
//! first-frame and video phases.

use crate::config::{ConfigError, MAX_GUIDANCE_SCALE, check_range};

/// Number of pyramid stages a step string must describe.
pub const NUM_STAGES: usize = 3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("{field}: expected {expected} comma-separated step counts, got {found} in {input:?}")]
    WrongLength {
        field: &'static str,
        input: String,
        expected: usize,
        found: usize,
    },
    #[error("{field}: {token:?} is not a positive integer")]
    InvalidStep { field: &'static str, token: String },
    #[error("{0}")]
    Range(#[from] ConfigError),
}

/// Parse `"a, b, c"` into per-stage step counts.
pub fn parse_steps(field: &'static str, input: &str) -> Result<[usize; NUM_STAGES], ScheduleError> {
    let tokens: Vec<&str> = input.split(',').map(str::trim).collect();
    if tokens.len() != NUM_STAGES {
        return Err(ScheduleError::WrongLength {
            field,
            input: input.to_string(),
            expected: NUM_STAGES,
            found: tokens.len(),
        });
    }
    let mut steps = [0usize; NUM_STAGES];
    for (slot, token) in steps.iter_mut().zip(tokens) {
        *slot = match token.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ScheduleError::InvalidStep {
                    field,
                    token: token.to_string(),
                });
            }
        };
    }
    Ok(steps)
}

/// Guidance decreasing linearly with the time unit, clamped at a floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearGuidance {
    pub alpha: f64,
    pub min_guidance_scale: f64,
}

impl Default for LinearGuidance {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            min_guidance_scale: 2.0,
        }
    }
}

impl LinearGuidance {
    pub fn at_unit(&self, guidance_scale: f64, unit: usize) -> f64 {
        (guidance_scale - self.alpha * unit as f64).max(self.min_guidance_scale)
    }
}

/// Immutable plan for one sampling call.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    pub first_frame_steps: [usize; NUM_STAGES],
    pub video_steps: [usize; NUM_STAGES],
    pub guidance_scale: f64,
    pub video_guidance_scale: f64,
    pub linear_guidance: Option<LinearGuidance>,
}

impl StageSchedule {
    pub fn new(
        first_frame_steps: [usize; NUM_STAGES],
        video_steps: [usize; NUM_STAGES],
        guidance_scale: f64,
        video_guidance_scale: f64,
    ) -> Result<Self, ScheduleError> {
        for (field, steps) in [("first_frame_steps", &first_frame_steps), ("video_steps", &video_steps)] {
            if let Some(bad) = steps.iter().find(|n| **n == 0) {
                return Err(ScheduleError::InvalidStep {
                    field,
                    token: bad.to_string(),
                });
            }
        }
        check_range("guidance_scale", guidance_scale, 0.0, MAX_GUIDANCE_SCALE)?;
        check_range("video_guidance_scale", video_guidance_scale, 0.0, MAX_GUIDANCE_SCALE)?;
        Ok(Self {
            first_frame_steps,
            video_steps,
            guidance_scale,
            video_guidance_scale,
            linear_guidance: None,
        })
    }

    /// Build from the host's comma-separated step strings.
    pub fn parse(
        first_frame_steps: &str,
        video_steps: &str,
        guidance_scale: f64,
        video_guidance_scale: f64,
    ) -> Result<Self, ScheduleError> {
        Self::new(
            parse_steps("first_frame_steps", first_frame_steps)?,
            parse_steps("video_steps", video_steps)?,
            guidance_scale,
            video_guidance_scale,
        )
    }

    pub fn with_linear_guidance(mut self, linear: LinearGuidance) -> Self {
        self.linear_guidance = Some(linear);
        self
    }

    /// Step counts for a time unit: unit 0 is the first frame unless the
    /// first frame was supplied by an image.
    pub fn steps_for(&self, first_frame: bool) -> &[usize; NUM_STAGES] {
        if first_frame {
            &self.first_frame_steps
        } else {
            &self.video_steps
        }
    }

    /// Guidance weight for a time unit.
    pub fn guidance_for(&self, first_frame: bool, unit: usize) -> f64 {
        let base = if first_frame {
            self.guidance_scale
        } else {
            self.video_guidance_scale
        };
        match &self.linear_guidance {
            Some(linear) => linear.at_unit(base, unit),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tolerates_whitespace() {
        for input in ["10,20,30", " 10 , 20,30 ", "10,\t20,  30", "\n10,20,30\n"] {
            assert_eq!(parse_steps("steps", input).unwrap(), [10, 20, 30]);
        }
        assert_eq!(parse_steps("steps", "10, 10, 10").unwrap(), [10, 10, 10]);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = parse_steps("first_frame_steps", "10,10").unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::WrongLength {
                found: 2,
                expected: 3,
                ..
            }
        ));
        assert!(parse_steps("steps", "1,2,3,4").is_err());
        assert!(parse_steps("steps", "").is_err());
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        assert!(parse_steps("steps", "10,0,10").is_err());
        assert!(parse_steps("steps", "10,-1,10").is_err());
        assert!(parse_steps("steps", "10,x,10").is_err());
        assert!(parse_steps("steps", "10,,10").is_err());
    }

    #[test]
    fn test_guidance_selection() {
        let schedule = StageSchedule::parse("20, 20, 20", "10, 10, 10", 9.0, 5.0).unwrap();
        assert_eq!(schedule.steps_for(true), &[20, 20, 20]);
        assert_eq!(schedule.steps_for(false), &[10, 10, 10]);
        assert_eq!(schedule.guidance_for(true, 0), 9.0);
        assert_eq!(schedule.guidance_for(false, 3), 5.0);

        let linear = schedule.with_linear_guidance(LinearGuidance::default());
        assert_eq!(linear.guidance_for(false, 2), 4.0);
        assert_eq!(linear.guidance_for(false, 7), 2.0);
    }

    #[test]
    fn test_guidance_out_of_range() {
        assert!(StageSchedule::parse("1,1,1", "1,1,1", 31.0, 5.0).is_err());
        assert!(StageSchedule::parse("1,1,1", "1,1,1", 9.0, -1.0).is_err());
    }
}
