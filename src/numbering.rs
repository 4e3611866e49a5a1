//! Recipient number resolution across a numbering-plan migration
//!
//! A national plan that grew from 8 to 10 digits (by prepending an operator
//! prefix) leaves two valid encodings for one subscriber. The resolver turns a
//! free-form number into the ordered list of addresses worth trying.

use serde::Serialize;

/// Regional numbering rules used to expand a number into candidates
#[derive(Debug, Clone, Serialize)]
pub struct NumberingPlan {
    pub calling_code: String,
    /// Subscriber digits after the calling code, post-migration
    pub new_length: usize,
    /// Subscriber digits after the calling code, pre-migration
    pub old_length: usize,
    /// Operator prefixes in priority order (most common first)
    pub prefixes: Vec<String>,
    /// Appended to each candidate to form a chat address
    pub address_suffix: String,
}

impl Default for NumberingPlan {
    fn default() -> Self {
        Self {
            calling_code: "225".to_string(),
            new_length: 10,
            old_length: 8,
            prefixes: vec!["07".to_string(), "05".to_string(), "01".to_string()],
            address_suffix: "@c.us".to_string(),
        }
    }
}

impl NumberingPlan {
    /// Ordered candidate numbers (digits only), most likely first
    pub fn resolve(&self, raw: &str) -> Vec<String> {
        let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        let Some(local) = cleaned.strip_prefix(self.calling_code.as_str()) else {
            return vec![cleaned];
        };

        let mut candidates = vec![cleaned.clone()];

        if local.len() == self.new_length {
            if let Some(prefix) = self.prefixes.iter().find(|p| local.starts_with(p.as_str())) {
                candidates.push(format!("{}{}", self.calling_code, &local[prefix.len()..]));
            }
        } else if local.len() == self.old_length {
            for prefix in &self.prefixes {
                candidates.push(format!("{}{}{}", self.calling_code, prefix, local));
            }
        }

        candidates
    }

    /// Candidate chat addresses for a raw number
    pub fn addresses(&self, raw: &str) -> Vec<String> {
        self.resolve(raw)
            .into_iter()
            .map(|n| format!("{}{}", n, self.address_suffix))
            .collect()
    }
}

/// Resolve with the default plan
pub fn resolve_candidates(raw: &str) -> Vec<String> {
    NumberingPlan::default().resolve(raw)
}
