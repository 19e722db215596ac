use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Med,
    Low,
    Thin,
}

/// Verdict threshold and confidence cut-offs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Minimum margin (percent) for a PASS.
    pub pass_margin_pct: f64,
    pub high_min_samples: usize,
    pub med_min_samples: usize,
    pub low_min_samples: usize,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            pass_margin_pct: 10.0,
            high_min_samples: 20,
            med_min_samples: 10,
            low_min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pricing {
    pub market_price: f64,
    pub margin_pct: f64,
    pub verdict: Verdict,
    pub confidence: Confidence,
    pub sample_count: usize,
}

/// Median of `samples`; zero when empty.
pub fn median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl PricingPolicy {
    pub fn confidence(&self, sample_count: usize) -> Confidence {
        if sample_count >= self.high_min_samples {
            Confidence::High
        } else if sample_count >= self.med_min_samples {
            Confidence::Med
        } else if sample_count >= self.low_min_samples {
            Confidence::Low
        } else {
            Confidence::Thin
        }
    }

    /// Prices `buy_price` against the comparable `samples`.
    ///
    /// With no samples the market price is zero and not authoritative: the
    /// margin is reported as zero and the verdict is always `Fail`. Callers
    /// should branch on `sample_count` before trusting the verdict.
    pub fn price(&self, samples: &[f64], buy_price: f64) -> Pricing {
        let sample_count = samples.len();
        let confidence = self.confidence(sample_count);
        if sample_count == 0 {
            return Pricing {
                market_price: 0.0,
                margin_pct: 0.0,
                verdict: Verdict::Fail,
                confidence,
                sample_count,
            };
        }

        let market_price = median(samples);
        let margin_pct = (market_price - buy_price) / buy_price * 100.0;
        let verdict = if margin_pct >= self.pass_margin_pct {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        Pricing {
            market_price: round_to(market_price, 2),
            margin_pct: round_to(margin_pct, 1),
            verdict,
            confidence,
            sample_count,
        }
    }
}
