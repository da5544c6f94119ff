use std::collections::HashMap;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::FetchError;
use crate::http::fetch_text;

/// Region/category code to candidate `host<sep>port` strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvRegistry(HashMap<String, Vec<String>>);

impl KvRegistry {
    pub fn parse(json: &str) -> Result<Self, FetchError> {
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(json)?;
        Ok(Self(
            raw.into_iter()
                .map(|(key, targets)| (key.trim().to_ascii_uppercase(), targets))
                .collect(),
        ))
    }

    pub async fn fetch(url: &str) -> Result<Self, FetchError> {
        Self::parse(&fetch_text(url).await?)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Pick one endpoint for `key` uniformly at random.
    pub fn pick<R: Rng + ?Sized>(&self, key: &str, rng: &mut R) -> Option<&str> {
        self.get(key)?.choose(rng).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
