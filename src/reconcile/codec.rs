//! Type-tag registry for job configuration payloads.
//!
//! Producers encode a typed configuration into a [`JobConfigPayload`]
//! carrying the type's tag; consumers look the tag up again when decoding.
//! A tag nobody registered is always an `UnknownJobType` error.

use std::any::TypeId;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{JobError, Result};
use crate::scheduler::job::JobConfigPayload;

/// A configuration type that can travel inside a job.
pub trait JobConfiguration: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: &'static str;

    /// Units of work in this configuration. Zero means the job has nothing
    /// to run.
    fn unit_count(&self) -> usize;
}

struct Codec {
    type_id: TypeId,
    unit_count: fn(&[u8]) -> Result<usize>,
}

fn count_units<T: JobConfiguration>(data: &[u8]) -> Result<usize> {
    Ok(serde_json::from_slice::<T>(data)?.unit_count())
}

#[derive(Default)]
pub struct TypeTagRegistry {
    codecs: HashMap<String, Codec>,
}

impl std::fmt::Debug for TypeTagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.codecs.keys().collect();
        tags.sort();
        f.debug_struct("TypeTagRegistry").field("tags", &tags).finish()
    }
}

impl TypeTagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every configuration type this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<crate::reconcile::publisher::PublisherJobConfig>();
        registry
    }

    pub fn register<T: JobConfiguration>(&mut self) -> &mut Self {
        self.codecs.insert(
            T::TYPE_TAG.to_string(),
            Codec {
                type_id: TypeId::of::<T>(),
                unit_count: count_units::<T>,
            },
        );
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    fn codec(&self, tag: &str) -> Result<&Codec> {
        self.codecs
            .get(tag)
            .ok_or_else(|| JobError::UnknownJobType(tag.to_string()))
    }

    pub fn encode<T: JobConfiguration>(&self, config: &T) -> Result<JobConfigPayload> {
        self.codec(T::TYPE_TAG)?;
        Ok(JobConfigPayload::new(T::TYPE_TAG, serde_json::to_vec(config)?))
    }

    pub fn decode<T: JobConfiguration>(&self, payload: &JobConfigPayload) -> Result<T> {
        let codec = self.codec(&payload.type_tag)?;
        if codec.type_id != TypeId::of::<T>() {
            return Err(JobError::UnknownJobType(format!(
                "{} (expected {})",
                payload.type_tag,
                T::TYPE_TAG
            )));
        }
        Ok(serde_json::from_slice(&payload.data)?)
    }

    /// Decode, treating the placeholder payload of a new job as the default
    /// configuration.
    pub fn decode_or_default<T: JobConfiguration + Default>(
        &self,
        payload: &JobConfigPayload,
    ) -> Result<T> {
        if payload.is_empty() {
            return Ok(T::default());
        }
        self.decode(payload)
    }

    /// Units of work in an arbitrary tagged payload.
    pub fn unit_count(&self, payload: &JobConfigPayload) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        (self.codec(&payload.type_tag)?.unit_count)(&payload.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Survey {
        targets: Vec<String>,
    }

    impl JobConfiguration for Survey {
        const TYPE_TAG: &'static str = "Survey";

        fn unit_count(&self) -> usize {
            self.targets.len()
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Other;

    impl JobConfiguration for Other {
        const TYPE_TAG: &'static str = "Other";

        fn unit_count(&self) -> usize {
            1
        }
    }

    #[test]
    fn encode_decode_registered_type() {
        let mut registry = TypeTagRegistry::new();
        registry.register::<Survey>();
        let survey = Survey {
            targets: vec!["a".into(), "b".into()],
        };
        let payload = registry.encode(&survey).unwrap();
        assert_eq!(payload.type_tag, "Survey");
        assert_eq!(registry.decode::<Survey>(&payload).unwrap(), survey);
        assert_eq!(registry.unit_count(&payload).unwrap(), 2);
    }

    #[test]
    fn unregistered_tag_is_unknown_job_type() {
        let registry = TypeTagRegistry::new();
        let payload = JobConfigPayload::new("Survey", b"{\"targets\":[]}".to_vec());
        assert!(matches!(
            registry.decode::<Survey>(&payload),
            Err(JobError::UnknownJobType(_))
        ));
        assert!(matches!(
            registry.unit_count(&payload),
            Err(JobError::UnknownJobType(_))
        ));
        assert!(matches!(
            registry.encode(&Survey::default()),
            Err(JobError::UnknownJobType(_))
        ));
    }

    #[test]
    fn decoding_as_wrong_type_fails() {
        let mut registry = TypeTagRegistry::new();
        registry.register::<Survey>().register::<Other>();
        let payload = registry.encode(&Other).unwrap();
        assert!(matches!(
            registry.decode::<Survey>(&payload),
            Err(JobError::UnknownJobType(_))
        ));
    }

    #[test]
    fn empty_payload_decodes_to_default() {
        let mut registry = TypeTagRegistry::new();
        registry.register::<Survey>();
        let decoded: Survey = registry
            .decode_or_default(&JobConfigPayload::default())
            .unwrap();
        assert!(decoded.targets.is_empty());
        assert_eq!(registry.unit_count(&JobConfigPayload::default()).unwrap(), 0);
    }
}
