//! # outbox-engine-testing
//!
//! Testing utilities for outbox-engine with in-memory implementations.
//! Provides [`InMemoryOutboxRepository`] and [`ChannelEventPublisher`].

pub mod channel_publisher;
pub mod memory_repository;

pub use channel_publisher::{AckMode, ChannelEventPublisher, Submission};
pub use memory_repository::{InMemoryOutboxRepository, InMemoryTransaction};
