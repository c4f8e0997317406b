//! Built-in masking strategies.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use super::{ConfigurationDescription, MaskingStrategy, MaskingStrategyDescription};
use crate::error::MaskingError;

fn parse_config<T: for<'de> Deserialize<'de> + Default>(strategy: &str, config: &Value) -> Result<T, MaskingError> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| MaskingError::InvalidConfiguration {
        strategy: strategy.to_string(),
        reason: e.to_string(),
    })
}

fn as_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct NullRewriteStrategy;

impl NullRewriteStrategy {
    pub const NAME: &'static str = "null_rewrite";

    pub fn from_config(_config: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingError> {
        Ok(Box::new(Self))
    }

    pub fn describe() -> MaskingStrategyDescription {
        MaskingStrategyDescription {
            name: Self::NAME.to_string(),
            description: "Masks the input value with a null value".to_string(),
            configurations: Vec::new(),
        }
    }
}

impl MaskingStrategy for NullRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _request_id: Option<&str>) -> Vec<Value> {
        vec![Value::Null; values.len()]
    }
}

#[derive(Debug, Default, Deserialize)]
struct StringRewriteConfig {
    #[serde(default)]
    rewrite_value: String,
}

pub struct StringRewriteStrategy {
    rewrite_value: String,
}

impl StringRewriteStrategy {
    pub const NAME: &'static str = "string_rewrite";

    pub fn from_config(config: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingError> {
        let config: StringRewriteConfig = parse_config(Self::NAME, config)?;
        Ok(Box::new(Self {
            rewrite_value: config.rewrite_value,
        }))
    }

    pub fn describe() -> MaskingStrategyDescription {
        MaskingStrategyDescription {
            name: Self::NAME.to_string(),
            description: "Masks the input value with a default string value".to_string(),
            configurations: vec![ConfigurationDescription {
                key: "rewrite_value".to_string(),
                optional: false,
                description: "The string that will replace existing values".to_string(),
            }],
        }
    }
}

impl MaskingStrategy for StringRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _request_id: Option<&str>) -> Vec<Value> {
        values
            .iter()
            .map(|_| Value::String(self.rewrite_value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
enum HashAlgorithm {
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

#[derive(Debug, Default, Deserialize)]
struct HashConfig {
    #[serde(default)]
    algorithm: HashAlgorithm,
    #[serde(default)]
    salt: String,
    #[serde(default)]
    per_request_salt: bool,
}

pub struct HashStrategy {
    algorithm: HashAlgorithm,
    salt: String,
    per_request_salt: bool,
}

impl HashStrategy {
    pub const NAME: &'static str = "hash";

    pub fn from_config(config: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingError> {
        let config: HashConfig = parse_config(Self::NAME, config)?;
        Ok(Box::new(Self {
            algorithm: config.algorithm,
            salt: config.salt,
            per_request_salt: config.per_request_salt,
        }))
    }

    pub fn describe() -> MaskingStrategyDescription {
        MaskingStrategyDescription {
            name: Self::NAME.to_string(),
            description: "Masks the input value by hashing it with a salt".to_string(),
            configurations: vec![
                ConfigurationDescription {
                    key: "algorithm".to_string(),
                    optional: true,
                    description: "SHA-256 (default) or SHA-512".to_string(),
                },
                ConfigurationDescription {
                    key: "salt".to_string(),
                    optional: true,
                    description: "Appended to each value before hashing".to_string(),
                },
                ConfigurationDescription {
                    key: "per_request_salt".to_string(),
                    optional: true,
                    description: "Also salt with the privacy request id, so hashes differ between requests"
                        .to_string(),
                },
            ],
        }
    }

    fn digest(&self, input: &str, request_id: Option<&str>) -> String {
        let mut salted = format!("{}{}", input, self.salt);
        if self.per_request_salt {
            salted.push_str(request_id.unwrap_or_default());
        }
        match self.algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(salted.as_bytes())),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(salted.as_bytes())),
        }
    }
}

impl MaskingStrategy for HashStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], request_id: Option<&str>) -> Vec<Value> {
        values
            .iter()
            .map(|value| match value {
                Value::Null => Value::Null,
                other => Value::String(self.digest(&as_plain_string(other), request_id)),
            })
            .collect()
    }
}

const DEFAULT_RANDOM_LENGTH: usize = 30;

#[derive(Debug, Deserialize)]
struct RandomStringConfig {
    #[serde(default = "default_random_length")]
    length: usize,
}

fn default_random_length() -> usize {
    DEFAULT_RANDOM_LENGTH
}

impl Default for RandomStringConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_RANDOM_LENGTH,
        }
    }
}

pub struct RandomStringRewriteStrategy {
    length: usize,
}

impl RandomStringRewriteStrategy {
    pub const NAME: &'static str = "random_string_rewrite";

    pub fn from_config(config: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingError> {
        let config: RandomStringConfig = parse_config(Self::NAME, config)?;
        if config.length == 0 {
            return Err(MaskingError::InvalidConfiguration {
                strategy: Self::NAME.to_string(),
                reason: "length must be positive".to_string(),
            });
        }
        Ok(Box::new(Self { length: config.length }))
    }

    pub fn describe() -> MaskingStrategyDescription {
        MaskingStrategyDescription {
            name: Self::NAME.to_string(),
            description: "Masks the input value with a random alphanumeric string".to_string(),
            configurations: vec![ConfigurationDescription {
                key: "length".to_string(),
                optional: true,
                description: "Length of the generated string, 30 by default".to_string(),
            }],
        }
    }
}

impl MaskingStrategy for RandomStringRewriteStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mask(&self, values: &[Value], _request_id: Option<&str>) -> Vec<Value> {
        let mut rng = rand::thread_rng();
        values
            .iter()
            .map(|value| match value {
                Value::Null => Value::Null,
                _ => Value::String((&mut rng).sample_iter(&Alphanumeric).take(self.length).map(char::from).collect()),
            })
            .collect()
    }
}
