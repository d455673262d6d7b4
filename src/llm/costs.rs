//! Per-token pricing for known models.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token. Unknown models return `None`.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let model = model.rsplit('/').next().unwrap_or(model);
    let cost = match model {
        // Groq
        "llama3-8b-8192" => (dec!(0.00000005), dec!(0.0000001)),
        "llama-3.1-8b-instant" => (dec!(0.00000005), dec!(0.00000008)),
        "llama3-70b-8192" | "llama-3.3-70b-versatile" => (dec!(0.00000059), dec!(0.00000079)),
        "mixtral-8x7b-32768" => (dec!(0.00000024), dec!(0.00000024)),
        "gemma2-9b-it" => (dec!(0.0000002), dec!(0.0000002)),
        // OpenAI
        "gpt-4o-mini" => (dec!(0.00000015), dec!(0.0000006)),
        "gpt-4o" => (dec!(0.0000025), dec!(0.00001)),
        "gpt-3.5-turbo" => (dec!(0.0000005), dec!(0.0000015)),
        _ => return None,
    };
    Some(cost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let (input, output) = model_cost("llama3-8b-8192").unwrap();
        let million = Decimal::from(1_000_000);
        assert_eq!(input * million + output * million, dec!(0.15));
    }

    #[test]
    fn test_provider_prefix_is_ignored() {
        assert_eq!(model_cost("openai/gpt-4o"), model_cost("gpt-4o"));
    }

    #[test]
    fn test_unknown_model() {
        assert!(model_cost("my-local-model").is_none());
        assert!(model_cost("meta/my-local-model").is_none());
    }
}
