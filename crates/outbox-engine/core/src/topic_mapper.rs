//! # Topic Mapping
//!
//! Resolves the destination topic for an aggregate type. Mappers are pure
//! and called on every publish; an empty result means "no topic" and fails
//! the publish.

use std::collections::HashMap;
use std::sync::Arc;

/// Maps an aggregate type to a topic name.
pub trait TopicMapper: Send + Sync {
    fn topic_for(&self, aggregate_type: &str) -> String;
}

impl<T: TopicMapper + ?Sized> TopicMapper for Arc<T> {
    fn topic_for(&self, aggregate_type: &str) -> String {
        (**self).topic_for(aggregate_type)
    }
}

/// `{aggregate_type}-events`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTopicMapper;

impl TopicMapper for DefaultTopicMapper {
    fn topic_for(&self, aggregate_type: &str) -> String {
        format!("{aggregate_type}-events")
    }
}

/// Table lookup with a fallback topic.
///
/// Unmapped types resolve to `default_topic`, or to the
/// [`DefaultTopicMapper`] naming rule when no default is configured.
#[derive(Debug, Clone, Default)]
pub struct MapTopicMapper {
    mapping: HashMap<String, String>,
    default_topic: Option<String>,
}

impl MapTopicMapper {
    pub fn new(mapping: HashMap<String, String>, default_topic: Option<String>) -> Self {
        Self {
            mapping,
            default_topic: default_topic.filter(|t| !t.is_empty()),
        }
    }

    pub fn with_mapping(
        mut self,
        aggregate_type: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        self.mapping.insert(aggregate_type.into(), topic.into());
        self
    }
}

impl TopicMapper for MapTopicMapper {
    fn topic_for(&self, aggregate_type: &str) -> String {
        if let Some(topic) = self.mapping.get(aggregate_type) {
            return topic.clone();
        }
        match &self.default_topic {
            Some(topic) => topic.clone(),
            None => DefaultTopicMapper.topic_for(aggregate_type),
        }
    }
}

/// Joins `prefix`, the aggregate type and `suffix` with `separator`,
/// skipping empty parts.
#[derive(Debug, Clone, Default)]
pub struct PrefixTopicMapper {
    prefix: String,
    suffix: String,
    separator: String,
}

impl PrefixTopicMapper {
    pub fn new(
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            separator: separator.into(),
        }
    }
}

impl TopicMapper for PrefixTopicMapper {
    fn topic_for(&self, aggregate_type: &str) -> String {
        [self.prefix.as_str(), aggregate_type, self.suffix.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}

/// Routes every aggregate type to a single topic.
#[derive(Debug, Clone)]
pub struct StaticTopicMapper {
    topic: String,
}

impl StaticTopicMapper {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl TopicMapper for StaticTopicMapper {
    fn topic_for(&self, _aggregate_type: &str) -> String {
        self.topic.clone()
    }
}

/// Wraps a closure as a [`TopicMapper`].
pub struct FnTopicMapper<F>(F);

impl<F> FnTopicMapper<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TopicMapper for FnTopicMapper<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn topic_for(&self, aggregate_type: &str) -> String {
        (self.0)(aggregate_type)
    }
}

/// Tries each mapper in order and returns the first non-empty topic.
///
/// Returns an empty string when every mapper declines; put a
/// [`DefaultTopicMapper`] last to guarantee a result.
#[derive(Clone, Default)]
pub struct ChainTopicMapper {
    mappers: Vec<Arc<dyn TopicMapper>>,
}

impl ChainTopicMapper {
    pub fn new(mappers: Vec<Arc<dyn TopicMapper>>) -> Self {
        Self { mappers }
    }

    pub fn then(mut self, mapper: impl TopicMapper + 'static) -> Self {
        self.mappers.push(Arc::new(mapper));
        self
    }
}

impl TopicMapper for ChainTopicMapper {
    fn topic_for(&self, aggregate_type: &str) -> String {
        self.mappers
            .iter()
            .map(|mapper| mapper.topic_for(aggregate_type))
            .find(|topic| !topic.is_empty())
            .unwrap_or_default()
    }
}
