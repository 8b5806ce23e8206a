// src/events/importance.rs
//! Importance score: how much an event deserves downstream attention.
//! Blend of novelty, burst, source credibility, entity breadth and observed
//! price impact. Pure arithmetic; the service supplies the counts.

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceInputs {
    /// Same-type events seen inside the lookback window.
    pub similar_recent: usize,
    /// Same-type events inside the trailing 24 hours.
    pub same_type_last_24h: usize,
    pub source_trust: u8,
    pub distinct_companies: usize,
    pub distinct_markets: usize,
    /// Market-confidence from the event study, when one ran.
    pub price_impact: Option<f64>,
}

pub const W_NOVELTY: f64 = 0.3;
pub const W_BURST: f64 = 0.2;
pub const W_CREDIBILITY: f64 = 0.2;
pub const W_BREADTH: f64 = 0.15;
pub const W_PRICE: f64 = 0.15;

pub fn importance_score(inp: &ImportanceInputs) -> f64 {
    let novelty = 1.0 / (1.0 + inp.similar_recent as f64);
    let burst = (inp.same_type_last_24h as f64 / 5.0).min(1.0);
    let credibility = (inp.source_trust.min(10) as f64) / 10.0;
    let breadth = ((inp.distinct_companies + inp.distinct_markets) as f64 / 5.0).min(1.0);
    let price = inp.price_impact.unwrap_or(0.0).clamp(0.0, 1.0);

    W_NOVELTY * novelty
        + W_BURST * burst
        + W_CREDIBILITY * credibility
        + W_BREADTH * breadth
        + W_PRICE * price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_trusted_broad_event_scores_high() {
        let score = importance_score(&ImportanceInputs {
            similar_recent: 0,
            same_type_last_24h: 5,
            source_trust: 9,
            distinct_companies: 4,
            distinct_markets: 1,
            price_impact: Some(0.9),
        });
        assert!(score > 0.8, "score = {score}");
        assert!(score <= 1.0);
    }

    #[test]
    fn stale_repeated_event_scores_low() {
        let score = importance_score(&ImportanceInputs {
            similar_recent: 9,
            same_type_last_24h: 0,
            source_trust: 3,
            distinct_companies: 0,
            distinct_markets: 0,
            price_impact: None,
        });
        assert!(score < 0.2, "score = {score}");
    }

    #[test]
    fn weights_sum_to_one() {
        assert!((W_NOVELTY + W_BURST + W_CREDIBILITY + W_BREADTH + W_PRICE - 1.0).abs() < 1e-12);
    }
}
