//! Token usage → cost computation (spec §4.8 step 11).

/// `cost = total_tokens · rate`. Called only on a successful, non-error LLM
/// response; callers must not invoke this for an errored turn.
pub fn compute_cost(total_tokens: u64, rate_per_token: f64) -> f64 {
    total_tokens as f64 * rate_per_token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_linearly_with_tokens() {
        assert_eq!(compute_cost(1000, 0.000_002), 0.002);
        assert_eq!(compute_cost(0, 0.000_002), 0.0);
    }
}
