//! Encoded prompt conditioning and its concatenative extension.

use crate::error::{PyramidError, Result};
use candle_core::{Device, Tensor};

/// Encoder output for one side (positive or negative) of the guidance pair.
///
/// Shapes: `embeds [n, tokens, dim]`, `attention_mask [n, tokens]`,
/// `pooled [n, pooled_dim]`, where `n` is the sequence count.
#[derive(Debug, Clone)]
pub struct PromptEmbeds {
    pub embeds: Tensor,
    pub attention_mask: Tensor,
    pub pooled: Tensor,
}

impl PromptEmbeds {
    pub fn new(embeds: Tensor, attention_mask: Tensor, pooled: Tensor) -> Result<Self> {
        let n = embeds.dims3()?.0;
        let (mask_n, mask_len) = attention_mask.dims2()?;
        let (pooled_n, _) = pooled.dims2()?;
        if mask_n != n || mask_len != embeds.dim(1)? {
            return Err(PyramidError::ShapeMismatch {
                field: "attention_mask",
                existing: embeds.dims()[..2].to_vec(),
                incoming: attention_mask.dims().to_vec(),
            });
        }
        if pooled_n != n {
            return Err(PyramidError::ShapeMismatch {
                field: "pooled_embeds",
                existing: vec![n],
                incoming: pooled.dims().to_vec(),
            });
        }
        Ok(Self {
            embeds,
            attention_mask,
            pooled,
        })
    }

    pub fn sequence_count(&self) -> usize {
        self.embeds.dims()[0]
    }

    /// Rows `index..index + 1` of every field.
    pub fn segment(&self, index: usize) -> candle_core::Result<Self> {
        Ok(Self {
            embeds: self.embeds.narrow(0, index, 1)?,
            attention_mask: self.attention_mask.narrow(0, index, 1)?,
            pooled: self.pooled.narrow(0, index, 1)?,
        })
    }

    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            embeds: self.embeds.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            pooled: self.pooled.to_device(device)?,
        })
    }

    /// Append `other` after `self` along the sequence axis.
    pub fn concat(&self, other: &Self) -> Result<Self> {
        check_trailing("prompt_embeds", &self.embeds, &other.embeds)?;
        check_trailing("attention_mask", &self.attention_mask, &other.attention_mask)?;
        check_trailing("pooled_embeds", &self.pooled, &other.pooled)?;
        Ok(Self {
            embeds: Tensor::cat(&[&self.embeds, &other.embeds], 0)?,
            attention_mask: Tensor::cat(&[&self.attention_mask, &other.attention_mask], 0)?,
            pooled: Tensor::cat(&[&self.pooled, &other.pooled], 0)?,
        })
    }
}

/// Every axis after the sequence axis must agree for concatenation.
fn check_trailing(field: &'static str, existing: &Tensor, incoming: &Tensor) -> Result<()> {
    if existing.dims()[1..] != incoming.dims()[1..] || existing.rank() != incoming.rank() {
        return Err(PyramidError::ShapeMismatch {
            field,
            existing: existing.dims().to_vec(),
            incoming: incoming.dims().to_vec(),
        });
    }
    Ok(())
}

/// Positive and negative prompt encodings, always with equal sequence counts.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    positive: PromptEmbeds,
    negative: PromptEmbeds,
}

impl ConditioningBundle {
    pub fn new(positive: PromptEmbeds, negative: PromptEmbeds) -> Result<Self> {
        if positive.sequence_count() != negative.sequence_count() {
            return Err(PyramidError::ShapeMismatch {
                field: "sequence_count",
                existing: vec![positive.sequence_count()],
                incoming: vec![negative.sequence_count()],
            });
        }
        Ok(Self { positive, negative })
    }

    pub fn positive(&self) -> &PromptEmbeds {
        &self.positive
    }

    pub fn negative(&self) -> &PromptEmbeds {
        &self.negative
    }

    pub fn sequence_count(&self) -> usize {
        self.positive.sequence_count()
    }

    /// Concatenate `new` after `existing`, positive and negative together.
    pub fn extend(existing: &Self, new: &Self) -> Result<Self> {
        let positive = existing.positive.concat(&new.positive)?;
        let negative = existing.negative.concat(&new.negative)?;
        Self::new(positive, negative)
    }

    /// Prompt segment used for time unit `unit` out of `units`.
    ///
    /// With `n` segments, unit `u` gets segment `floor(u * n / units)`.
    pub fn segment_for_unit(&self, unit: usize, units: usize) -> usize {
        let n = self.sequence_count();
        if n <= 1 || units == 0 {
            return 0;
        }
        (unit * n / units).min(n - 1)
    }

    /// Guidance batch for one segment: row 0 negative, row 1 positive.
    pub fn text_batch(&self, segment: usize, device: &Device) -> candle_core::Result<TextBatch> {
        let neg = self.negative.segment(segment)?.to_device(device)?;
        let pos = self.positive.segment(segment)?.to_device(device)?;
        Ok(TextBatch {
            embeds: Tensor::cat(&[&neg.embeds, &pos.embeds], 0)?,
            attention_mask: Tensor::cat(&[&neg.attention_mask, &pos.attention_mask], 0)?,
            pooled: Tensor::cat(&[&neg.pooled, &pos.pooled], 0)?,
        })
    }
}

/// Prompt rows fed to the network. Built for guidance as `[negative, positive]`.
#[derive(Debug, Clone)]
pub struct TextBatch {
    pub embeds: Tensor,
    pub attention_mask: Tensor,
    pub pooled: Tensor,
}

impl TextBatch {
    /// Single row: negative (0) or positive (1).
    pub fn row(&self, index: usize) -> candle_core::Result<TextBatch> {
        Ok(TextBatch {
            embeds: self.embeds.narrow(0, index, 1)?,
            attention_mask: self.attention_mask.narrow(0, index, 1)?,
            pooled: self.pooled.narrow(0, index, 1)?,
        })
    }
}
