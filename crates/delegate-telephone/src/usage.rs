//! Token and cost accounting for Telephone conversations.

use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::sdk::SdkMessage;

/// Token/cost accumulator. Used both as a per-message snapshot and as
/// a cumulative total; the arithmetic lets callers fold per-turn deltas
/// into lifetime sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
}

impl Usage {
    /// Extract usage from an SDK message. Only the terminal result
    /// message carries usage; anything else yields zeros. The cost in
    /// the returned value is still the SDK's cumulative figure — the
    /// Telephone converts it to a delta against its last known value.
    pub fn from_sdk_message(msg: &SdkMessage) -> Self {
        match msg {
            SdkMessage::Result {
                total_cost_usd,
                usage,
            } => Self {
                input_tokens: usage.input_tokens as i64,
                output_tokens: usage.output_tokens as i64,
                cache_read_tokens: usage.cache_read_input_tokens as i64,
                cache_write_tokens: usage.cache_creation_input_tokens as i64,
                cost_usd: *total_cost_usd,
            },
            _ => Self::default(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_read_tokens: self.cache_read_tokens + other.cache_read_tokens,
            cache_write_tokens: self.cache_write_tokens + other.cache_write_tokens,
            cost_usd: self.cost_usd + other.cost_usd,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self = *self + other;
    }
}

impl Sub for Usage {
    type Output = Usage;

    fn sub(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens - other.input_tokens,
            output_tokens: self.output_tokens - other.output_tokens,
            cache_read_tokens: self.cache_read_tokens - other.cache_read_tokens,
            cache_write_tokens: self.cache_write_tokens - other.cache_write_tokens,
            cost_usd: self.cost_usd - other.cost_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{ContentBlock, SdkUsage};

    #[test]
    fn test_arithmetic() {
        let a = Usage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 10,
            cache_write_tokens: 5,
            cost_usd: 0.10,
        };
        let b = Usage {
            input_tokens: 40,
            output_tokens: 20,
            cache_read_tokens: 4,
            cache_write_tokens: 2,
            cost_usd: 0.04,
        };

        let sum = a + b;
        assert_eq!(sum.input_tokens, 140);
        assert!((sum.cost_usd - 0.14).abs() < 1e-9);

        let diff = sum - b;
        assert_eq!(diff.input_tokens, a.input_tokens);
        assert_eq!(diff.output_tokens, a.output_tokens);

        let mut acc = Usage::default();
        acc += a;
        acc += b;
        assert_eq!(acc.input_tokens, 140);
    }

    #[test]
    fn test_from_result_message() {
        let msg = SdkMessage::Result {
            total_cost_usd: 0.25,
            usage: SdkUsage {
                input_tokens: 1000,
                output_tokens: 200,
                cache_read_input_tokens: 300,
                cache_creation_input_tokens: 50,
            },
        };
        let usage = Usage::from_sdk_message(&msg);
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.cache_read_tokens, 300);
        assert_eq!(usage.cache_write_tokens, 50);
        assert!((usage.cost_usd - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_non_result_messages_are_zero() {
        let msg = SdkMessage::Assistant {
            content: vec![ContentBlock::Text {
                text: "hi".into(),
            }],
            model: None,
        };
        assert!(Usage::from_sdk_message(&msg).is_zero());
    }
}
