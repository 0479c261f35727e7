//! Pricing arithmetic for the batch cost discount.
//!
//! Batching only pays off when the backend discounts grouped calls; these
//! helpers quantify that for status commands and capacity planning.

use serde::Serialize;

use crate::error::{Result, VolleyError};

/// Pricing model for image generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchPricing {
    /// Standard per-image cost in USD
    pub cost_per_image: f64,
    /// Fractional discount applied to batched images, in `0.0..=1.0`
    pub batch_discount: f64,
}

impl Default for BatchPricing {
    fn default() -> Self {
        // Gemini image pricing at time of writing: $0.039/image, 50% off in
        // batch mode.
        Self {
            cost_per_image: 0.039,
            batch_discount: 0.5,
        }
    }
}

/// Cost comparison between immediate and batched dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SavingsEstimate {
    /// Cost of generating every image via immediate dispatch
    pub standard_cost: f64,
    /// Cost of generating every image via batched dispatch
    pub batch_cost: f64,
    /// Absolute savings from batching
    pub savings: f64,
    /// Savings as a percentage of the standard cost
    pub savings_pct: f64,
}

impl BatchPricing {
    /// Create a pricing model, validating the ranges.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for a negative cost or a discount
    /// outside `0.0..=1.0`.
    pub fn new(cost_per_image: f64, batch_discount: f64) -> Result<Self> {
        if !cost_per_image.is_finite() || cost_per_image < 0.0 {
            return Err(VolleyError::InvalidConfiguration(
                "cost_per_image must be a non-negative number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&batch_discount) {
            return Err(VolleyError::InvalidConfiguration(
                "batch_discount must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(Self {
            cost_per_image,
            batch_discount,
        })
    }

    /// Estimate the savings of batching `num_images` generations.
    pub fn estimate_savings(&self, num_images: u64) -> SavingsEstimate {
        let standard_cost = num_images as f64 * self.cost_per_image;
        let batch_cost = standard_cost * (1.0 - self.batch_discount);
        let savings = standard_cost - batch_cost;
        let savings_pct = if standard_cost > 0.0 {
            savings / standard_cost * 100.0
        } else {
            0.0
        };

        SavingsEstimate {
            standard_cost,
            batch_cost,
            savings,
            savings_pct,
        }
    }
}
