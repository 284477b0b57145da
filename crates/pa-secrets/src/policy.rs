//! Complexity policy for generated one-time passwords

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

/// Give up after this many candidates fail the policy
pub const MAX_GENERATION_ATTEMPTS: usize = 100;

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Password complexity policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPolicy {
    pub min_length: usize,
    pub excluded_chars: BTreeSet<char>,
    /// Require at least one upper, lower, digit and symbol character
    pub require_each_class: bool,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            min_length: 16,
            excluded_chars: "\"'@/\\`".chars().collect(),
            require_each_class: true,
        }
    }
}

impl SecretPolicy {
    pub fn new(min_length: usize, excluded_chars: &str, require_each_class: bool) -> Self {
        Self {
            min_length,
            excluded_chars: excluded_chars.chars().collect(),
            require_each_class,
        }
    }

    fn class_pools(&self) -> [Vec<char>; 4] {
        [UPPER, LOWER, DIGITS, SYMBOLS]
            .map(|class| class.chars().filter(|c| !self.excluded_chars.contains(c)).collect())
    }

    /// Reasons the policy can never be satisfied, checked before generating
    pub fn check_satisfiable(&self) -> Result<(), String> {
        if self.min_length == 0 {
            return Err("minimum length must be positive".to_string());
        }
        let pools = self.class_pools();
        if pools.iter().all(|p| p.is_empty()) {
            return Err("every candidate character is excluded".to_string());
        }
        if self.require_each_class {
            let names = ["uppercase", "lowercase", "digit", "symbol"];
            if let Some((name, _)) = names.iter().zip(pools.iter()).find(|(_, p)| p.is_empty()) {
                return Err(format!("every {} character is excluded", name));
            }
        }
        Ok(())
    }

    /// Check a value against the policy
    pub fn validate(&self, value: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if value.chars().count() < self.min_length {
            errors.push(format!("must be at least {} characters", self.min_length));
        }

        if let Some(c) = value.chars().find(|c| self.excluded_chars.contains(c)) {
            errors.push(format!("contains excluded character {:?}", c));
        }

        if self.require_each_class {
            if !value.chars().any(|c| c.is_ascii_uppercase()) {
                errors.push("must contain an uppercase letter".to_string());
            }
            if !value.chars().any(|c| c.is_ascii_lowercase()) {
                errors.push("must contain a lowercase letter".to_string());
            }
            if !value.chars().any(|c| c.is_ascii_digit()) {
                errors.push("must contain a digit".to_string());
            }
            if !value.chars().any(|c| SYMBOLS.contains(c)) {
                errors.push("must contain a symbol".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Draw candidates until one satisfies the policy.
    ///
    /// Returns None once `MAX_GENERATION_ATTEMPTS` candidates have been rejected.
    pub fn generate(&self) -> Option<String> {
        self.check_satisfiable().ok()?;

        let pools = self.class_pools();
        let alphabet: Vec<char> = pools.concat();
        let length = if self.require_each_class {
            self.min_length.max(pools.len())
        } else {
            self.min_length
        };

        let mut rng = OsRng;
        (0..MAX_GENERATION_ATTEMPTS).find_map(|_| {
            // Seed one character per class so coverage does not depend on luck
            let mut chars: Vec<char> = if self.require_each_class {
                pools.iter().filter_map(|p| p.choose(&mut rng).copied()).collect()
            } else {
                Vec::new()
            };
            while chars.len() < length {
                chars.extend(alphabet.choose(&mut rng).copied());
            }
            chars.shuffle(&mut rng);

            let candidate: String = chars.into_iter().collect();
            self.validate(&candidate).ok().map(|_| candidate)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_values_satisfy_policy() {
        let policy = SecretPolicy::default();
        for _ in 0..200 {
            let value = policy.generate().unwrap();
            assert!(value.chars().count() >= policy.min_length);
            assert!(!value.chars().any(|c| policy.excluded_chars.contains(&c)));
            assert!(value.chars().any(|c| c.is_ascii_uppercase()));
            assert!(value.chars().any(|c| c.is_ascii_lowercase()));
            assert!(value.chars().any(|c| c.is_ascii_digit()));
            assert!(value.chars().any(|c| !c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_short_minimum_is_raised_to_cover_classes() {
        let policy = SecretPolicy::new(2, "", true);
        let value = policy.generate().unwrap();
        assert_eq!(value.chars().count(), 4);
        assert!(policy.validate(&value).is_ok());
    }

    #[test]
    fn test_class_requirement_optional() {
        let policy = SecretPolicy::new(8, SYMBOLS, false);
        let value = policy.generate().unwrap();
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_unsatisfiable_policies() {
        assert!(SecretPolicy::new(12, SYMBOLS, true).generate().is_none());
        assert!(SecretPolicy::new(12, SYMBOLS, true).check_satisfiable().unwrap_err().contains("symbol"));
        assert!(SecretPolicy::new(0, "", false).generate().is_none());

        let everything = format!("{}{}{}{}", UPPER, LOWER, DIGITS, SYMBOLS);
        assert!(SecretPolicy::new(8, &everything, false).generate().is_none());
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let policy = SecretPolicy::new(10, "@", true);
        let errors = policy.validate("abc@").unwrap_err();
        assert!(errors.iter().any(|e| e.contains("at least 10")));
        assert!(errors.iter().any(|e| e.contains("excluded")));
        assert!(errors.iter().any(|e| e.contains("uppercase")));
        assert!(errors.iter().any(|e| e.contains("digit")));
    }
}
